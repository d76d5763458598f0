//! Simulation Clock
//!
//! The single authoritative "now" of the simulation, persisted in the store
//! next to the tables it governs so every process and every reader agrees on
//! it. Also holds the manifest of seeded tables, which lets `advance` run
//! in a fresh process without reloading the source dataset.
//!
//! Both records are written with `replace_table`, so an update is atomic.

use super::registry::{Ident, META_PREFIX};
use super::store::{PersistentStore, Query, StoreError, StoreResult};
use super::table::{Table, Value};
use super::timestamp::{format_ts, parse_ts, SimTime};
use serde::{Deserialize, Serialize};
use std::fmt;

fn meta_table(suffix: &str) -> StoreResult<Ident> {
    Ok(Ident::new(format!("{}{}", META_PREFIX, suffix))?)
}

pub fn clock_table() -> StoreResult<Ident> {
    meta_table("clock")
}

pub fn manifest_table() -> StoreResult<Ident> {
    meta_table("tables")
}

fn corrupt(table: &Ident, detail: impl fmt::Display) -> StoreError {
    StoreError::InvalidTable(format!("{}: {}", table, detail))
}

// =============================================================================
// CLOCK STATE
// =============================================================================

/// Persisted simulated time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockState {
    /// Exclusive upper bound of every live window.
    pub current_time: SimTime,
    /// Inclusive lower bound, fixed by the last seed/reset.
    pub epoch: SimTime,
}

/// Attempted to move the clock backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockRegression {
    pub current: SimTime,
    pub requested: SimTime,
}

impl fmt::Display for ClockRegression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "clock cannot move backward from {} to {}",
            format_ts(&self.current),
            format_ts(&self.requested)
        )
    }
}

impl std::error::Error for ClockRegression {}

impl ClockState {
    pub fn new(epoch: SimTime, current_time: SimTime) -> Self {
        Self {
            current_time,
            epoch,
        }
    }

    /// Same epoch, later time. Never moves backward.
    pub fn advanced_to(&self, new_time: SimTime) -> Result<ClockState, ClockRegression> {
        if new_time < self.current_time {
            return Err(ClockRegression {
                current: self.current_time,
                requested: new_time,
            });
        }
        Ok(ClockState {
            current_time: new_time,
            epoch: self.epoch,
        })
    }

    /// Read the clock row. `None` when the simulation was never seeded.
    pub fn load(store: &dyn PersistentStore) -> StoreResult<Option<ClockState>> {
        let name = clock_table()?;
        let table = match store.query(&Query::all(&name)) {
            Ok(table) => table,
            Err(StoreError::UnknownTable(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let Some(row) = table.rows().first() else {
            return Ok(None);
        };

        let read = |column: &str| -> StoreResult<SimTime> {
            let idx = table
                .column_index(column)
                .ok_or_else(|| corrupt(&name, format!("missing column {}", column)))?;
            row[idx]
                .as_text()
                .and_then(parse_ts)
                .ok_or_else(|| corrupt(&name, format!("bad {} value {}", column, row[idx])))
        };
        Ok(Some(ClockState {
            current_time: read("current_time")?,
            epoch: read("epoch")?,
        }))
    }

    pub fn persist(&self, store: &dyn PersistentStore) -> StoreResult<()> {
        let updated_at = chrono::Utc::now().naive_utc();
        let table = Table::from_rows(
            vec!["current_time".into(), "epoch".into(), "updated_at".into()],
            vec![vec![
                Value::Text(format_ts(&self.current_time)),
                Value::Text(format_ts(&self.epoch)),
                Value::Text(format_ts(&updated_at)),
            ]],
        )
        .map_err(|e| StoreError::InvalidTable(e.to_string()))?;
        store.replace_table(&clock_table()?, &table)
    }
}

// =============================================================================
// STATUS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimState {
    Uninitialized,
    Running,
    Error,
}

impl SimState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SimState::Uninitialized => "uninitialized",
            SimState::Running => "running",
            SimState::Error => "error",
        }
    }
}

/// What `status()` reports. Never an error: store trouble becomes `Error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationStatus {
    pub state: SimState,
    pub current_time: Option<String>,
    pub epoch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SimulationStatus {
    pub fn read(store: &dyn PersistentStore) -> Self {
        match ClockState::load(store) {
            Ok(Some(clock)) => Self {
                state: SimState::Running,
                current_time: Some(format_ts(&clock.current_time)),
                epoch: Some(format_ts(&clock.epoch)),
                error: None,
            },
            Ok(None) => Self {
                state: SimState::Uninitialized,
                current_time: None,
                epoch: None,
                error: None,
            },
            Err(e) => Self {
                state: SimState::Error,
                current_time: None,
                epoch: None,
                error: Some(e.to_string()),
            },
        }
    }
}

// =============================================================================
// TABLE MANIFEST
// =============================================================================

/// How a seeded table's live copy relates to its full copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableMode {
    /// Live holds the rows inside the clock window; advanced by `advance`.
    Windowed,
    /// No timestamp column: live is a full copy.
    Complete,
    /// Timestamp column present but unusable: full copy, never advanced.
    Degraded,
}

impl TableMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableMode::Windowed => "windowed",
            TableMode::Complete => "complete",
            TableMode::Degraded => "degraded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "windowed" => Some(TableMode::Windowed),
            "complete" => Some(TableMode::Complete),
            "degraded" => Some(TableMode::Degraded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    pub name: Ident,
    pub ts_column: Option<Ident>,
    pub mode: TableMode,
}

impl ManifestEntry {
    /// Timestamp column, only for tables that advance.
    pub fn window_column(&self) -> Option<&Ident> {
        match self.mode {
            TableMode::Windowed => self.ts_column.as_ref(),
            _ => None,
        }
    }
}

/// Seeded tables, in name order. Empty when never seeded.
pub fn load_manifest(store: &dyn PersistentStore) -> StoreResult<Vec<ManifestEntry>> {
    let name = manifest_table()?;
    let table = match store.query(&Query::all(&name)) {
        Ok(table) => table,
        Err(StoreError::UnknownTable(_)) => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let (Some(n), Some(c), Some(m)) = (
        table.column_index("name"),
        table.column_index("ts_column"),
        table.column_index("mode"),
    ) else {
        return Err(corrupt(&name, "unexpected schema"));
    };

    let mut entries = Vec::with_capacity(table.len());
    for row in table.rows() {
        let entry_name = row[n]
            .as_text()
            .ok_or_else(|| corrupt(&name, "null table name"))
            .and_then(|s| Ok(Ident::new(s)?))?;
        let ts_column = match row[c].as_text() {
            Some(s) => Some(Ident::new(s)?),
            None => None,
        };
        let mode = row[m]
            .as_text()
            .and_then(TableMode::parse)
            .ok_or_else(|| corrupt(&name, format!("bad mode {}", row[m])))?;
        entries.push(ManifestEntry {
            name: entry_name,
            ts_column,
            mode,
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

pub fn persist_manifest(store: &dyn PersistentStore, entries: &[ManifestEntry]) -> StoreResult<()> {
    let rows = entries
        .iter()
        .map(|e| {
            vec![
                Value::Text(e.name.to_string()),
                e.ts_column
                    .as_ref()
                    .map_or(Value::Null, |c| Value::Text(c.to_string())),
                Value::Text(e.mode.as_str().to_string()),
            ]
        })
        .collect();
    let table = Table::from_rows(
        vec!["name".into(), "ts_column".into(), "mode".into()],
        rows,
    )
    .map_err(|e| StoreError::InvalidTable(e.to_string()))?;
    store.replace_table(&manifest_table()?, &table)
}
