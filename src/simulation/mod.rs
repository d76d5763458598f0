//! Temporal Simulation Store
//!
//! Replays a static historical dataset as if it were arriving live.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   load() once    ┌──────────────────────────┐
//! │  SourceDataset   │ ───────────────▶ │      WindowManager       │
//! │ csv / json / mem │                  │ seed · advance · reset   │
//! └──────────────────┘                  └────────────┬─────────────┘
//!                                                    │ replace / copy_rows
//!                                                    ▼
//!                      ┌───────────────────────────────────────────────┐
//!                      │             PersistentStore (SQLite)          │
//!                      │  full_<T>   complete history                  │
//!                      │  <T>        live: epoch <= ts < current_time  │
//!                      │  sim_clock  current_time, epoch               │
//!                      │  sim_tables seeded tables + mode              │
//!                      └───────────────────────┬───────────────────────┘
//!                                              │ read only
//!                                              ▼
//!                                    ┌──────────────────┐
//!                                    │     LiveView     │ ◀── analytics / api
//!                                    └──────────────────┘
//! ```
//!
//! # Invariants
//! - For every windowed table, live equals the full rows with
//!   `epoch <= ts < current_time`, as a multiset.
//! - Tables without a timestamp column are always exposed in full.
//! - `current_time` never decreases except through an explicit reset.

pub mod clock;
pub mod live_view;
pub mod registry;
pub mod source;
pub mod sqlite_store;
pub mod store;
pub mod table;
pub mod timestamp;
pub mod window_manager;

#[cfg(test)]
mod window_manager_tests;

pub use clock::{ClockState, ManifestEntry, SimState, SimulationStatus, TableMode};
pub use live_view::LiveView;
pub use registry::{Ident, TimestampRegistry};
pub use source::{
    CsvDirectoryLoader, InMemoryLoader, JsonFileLoader, SourceDataset, SourceError, SourceLoad,
    SourceLoader,
};
pub use sqlite_store::{SqliteStore, StoreSettings};
pub use store::{CopyMode, PersistentStore, Query, StoreError, StoreResult};
pub use table::{Column, ColumnType, Table, Value};
pub use timestamp::{format_ts, parse_span, parse_ts, SimTime, TimeRange, WindowSpan};
pub use window_manager::{
    AdvanceReport, SeedReport, SimulationError, StartupOutcome, TableWarning, WarningKind,
    WindowManager,
};
