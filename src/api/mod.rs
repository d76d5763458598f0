pub mod simulation;

pub use simulation::{simulation_router, spawn_auto_advance, SimulationState};
