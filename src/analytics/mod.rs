//! Dashboard Analytics
//!
//! Read-only aggregations over the live tables for the dashboard. Everything
//! here goes through `LiveView`, so results always reflect the simulated
//! clock and never leak unrevealed rows.

pub mod summaries;
pub mod timeseries;

pub use summaries::{table_summaries, TableSummary};
pub use timeseries::{hourly_timeseries, Series, SkippedSeries, Timeseries, TimeseriesPoint};

use serde::{Deserialize, Serialize};

/// Tunables for the hourly activity series.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    /// A trade this many hours after a reward to the same account counts
    /// toward wash-trading activity.
    pub wash_window_hours: f64,
    /// Distinct positions per hour are divided by this to approximate
    /// concurrent cooperative trades (minimum 1 per active hour).
    pub cooperative_divisor: u64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            wash_window_hours: 72.0,
            cooperative_divisor: 10,
        }
    }
}
