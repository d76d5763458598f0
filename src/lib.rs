//! TradeWatch Backend Library
//!
//! Replays a historical exchange dataset as if it were arriving live. The
//! `simulation` module owns the simulated clock and the full/live table
//! pairs; `analytics` and `api` only ever read through the live view.

pub mod analytics;
pub mod api;
pub mod config;
pub mod simulation;

pub use config::SimConfig;
