//! Temporal Window Manager
//!
//! Presents the immutable historical dataset as if it were arriving in real
//! time. For every table it keeps two copies in the store:
//!
//! ```text
//!   full_<name>   complete history, written once per seed
//!   <name>        live view: rows with epoch <= ts < current_time
//! ```
//!
//! State machine:
//!
//! ```text
//!   UNSEEDED --seed(epoch)--> SEEDED [epoch, end) --advance(d)--> ADVANCED [epoch, end + d)
//!                                ^                                    |
//!                                +-------------- reset(epoch) --------+
//! ```
//!
//! # Contract
//! - One writer: callers serialize `seed`/`advance`/`reset` (the server holds
//!   the manager behind a mutex).
//! - Failures local to one table become `TableWarning`s and never abort the
//!   other tables. Source and store unavailability and clock writes are fatal.
//! - `advance` appends the full rows after each table's live max and before
//!   `current_time + d`. While a table keeps up that is exactly
//!   `[current_time, current_time + d)`, so consecutive advances are disjoint
//!   and contiguous; a table that was skipped catches up on its next advance.

use super::clock::{
    load_manifest, persist_manifest, ClockState, ManifestEntry, SimulationStatus, TableMode,
};
use super::live_view::LiveView;
use super::registry::{Ident, TimestampRegistry};
use super::source::{SourceDataset, SourceError};
use super::store::{CopyMode, PersistentStore, RangeFilter, StoreError};
use super::table::Table;
use super::timestamp::{
    canonical, format_span, format_ts, next_instant, normalize_timestamp_column, value_to_ts,
    SimTime, TimeRange, WindowSpan,
};
use chrono::Duration;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// ERRORS AND WARNINGS
// =============================================================================

/// Fatal failures of a whole operation.
#[derive(Debug)]
pub enum SimulationError {
    SourceUnavailable(SourceError),
    StoreUnavailable(StoreError),
    UnknownTable(String),
    InvalidDuration(String),
    /// `advance` before any seed.
    NotSeeded,
}

impl fmt::Display for SimulationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SourceUnavailable(e) => write!(f, "{}", e),
            Self::StoreUnavailable(e) => write!(f, "store failure: {}", e),
            Self::UnknownTable(name) => write!(f, "unknown table: {}", name),
            Self::InvalidDuration(detail) => write!(f, "invalid duration: {}", detail),
            Self::NotSeeded => write!(f, "simulation not initialized; seed or reset first"),
        }
    }
}

impl std::error::Error for SimulationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SourceUnavailable(e) => Some(e),
            Self::StoreUnavailable(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SourceError> for SimulationError {
    fn from(e: SourceError) -> Self {
        Self::SourceUnavailable(e)
    }
}

impl From<StoreError> for SimulationError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::UnknownTable(name) => Self::UnknownTable(name),
            other => Self::StoreUnavailable(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// Table missing from the source or not materializable.
    PartialLoad,
    /// Timestamp column absent or unparseable; exposed in full.
    UnknownTimestampFormat,
    /// Live data is inconsistent with the clock; table skipped.
    ClockRegressionDetected,
    /// Store rejected the append for this table; table skipped.
    AppendFailed,
}

/// Non-fatal, per-table degradation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableWarning {
    pub table: String,
    pub kind: WarningKind,
    pub detail: String,
}

impl TableWarning {
    fn new(table: impl fmt::Display, kind: WarningKind, detail: impl Into<String>) -> Self {
        let warning = Self {
            table: table.to_string(),
            kind,
            detail: detail.into(),
        };
        warn!(
            table = %warning.table,
            kind = ?warning.kind,
            detail = %warning.detail,
            "Table degraded"
        );
        warning
    }
}

impl fmt::Display for TableWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{:?}]: {}", self.table, self.kind, self.detail)
    }
}

/// Only `Unavailable` is fatal inside the per-table loops.
fn fatal_or<T>(
    result: Result<T, StoreError>,
    on_local: impl FnOnce(StoreError) -> TableWarning,
    warnings: &mut Vec<TableWarning>,
) -> Result<Option<T>, SimulationError> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_unavailable() => Err(SimulationError::StoreUnavailable(e)),
        Err(e) => {
            warnings.push(on_local(e));
            Ok(None)
        }
    }
}

// =============================================================================
// REPORTS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSeedReport {
    pub table: String,
    pub mode: TableMode,
    pub full_rows: usize,
    pub live_rows: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeedReport {
    #[serde(with = "canonical")]
    pub epoch: SimTime,
    #[serde(with = "canonical")]
    pub current_time: SimTime,
    pub tables: Vec<TableSeedReport>,
    /// Tables from an earlier seed that no longer exist in the source.
    pub dropped: Vec<String>,
    pub warnings: Vec<TableWarning>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdvanceReport {
    #[serde(with = "canonical")]
    pub previous_time: SimTime,
    #[serde(with = "canonical")]
    pub current_time: SimTime,
    pub span: String,
    /// Rows appended per windowed table.
    pub appended: BTreeMap<String, usize>,
    pub warnings: Vec<TableWarning>,
}

impl AdvanceReport {
    pub fn total_appended(&self) -> usize {
        self.appended.values().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupOutcome {
    /// Persisted state found and kept as is.
    Resumed(ClockState),
    Seeded(SeedReport),
}

// =============================================================================
// MANAGER
// =============================================================================

pub struct WindowManager {
    store: Arc<dyn PersistentStore>,
    source: Arc<SourceDataset>,
    registry: TimestampRegistry,
    window: WindowSpan,
    /// Live max timestamp per windowed table (`None` = live is empty).
    cursors: HashMap<Ident, Option<SimTime>>,
    /// Clock the cursors were observed under; any other clock invalidates them.
    cursor_clock: Option<ClockState>,
}

impl WindowManager {
    pub fn new(
        store: Arc<dyn PersistentStore>,
        source: Arc<SourceDataset>,
        registry: TimestampRegistry,
        window: WindowSpan,
    ) -> Self {
        Self {
            store,
            source,
            registry,
            window,
            cursors: HashMap::new(),
            cursor_clock: None,
        }
    }

    pub fn store(&self) -> Arc<dyn PersistentStore> {
        Arc::clone(&self.store)
    }

    /// Read-only access to the live tables.
    pub fn live_view(&self) -> LiveView {
        LiveView::new(self.store())
    }

    pub fn set_window(&mut self, window: WindowSpan) {
        self.window = window;
    }

    pub fn status(&self) -> SimulationStatus {
        SimulationStatus::read(self.store.as_ref())
    }

    pub fn current_time(&self) -> Result<Option<SimTime>, SimulationError> {
        Ok(ClockState::load(self.store.as_ref())?.map(|c| c.current_time))
    }

    pub fn list_live_tables(&self) -> Result<Vec<Ident>, SimulationError> {
        Ok(load_manifest(self.store.as_ref())?
            .into_iter()
            .map(|e| e.name)
            .collect())
    }

    /// Cached live max timestamp, if one has been observed.
    pub fn cursor(&self, table: &Ident) -> Option<Option<SimTime>> {
        self.cursors.get(table).copied()
    }

    /// Resume persisted state, or seed at `default_epoch` on a fresh store.
    pub fn ensure_seeded(
        &mut self,
        default_epoch: SimTime,
    ) -> Result<StartupOutcome, SimulationError> {
        if let Some(clock) = ClockState::load(self.store.as_ref())? {
            info!(
                current_time = %format_ts(&clock.current_time),
                epoch = %format_ts(&clock.epoch),
                "Resuming persisted simulation"
            );
            return Ok(StartupOutcome::Resumed(clock));
        }
        Ok(StartupOutcome::Seeded(self.seed(default_epoch)?))
    }

    /// Discard every live window and seed again at `epoch`.
    pub fn reset(&mut self, epoch: SimTime) -> Result<SeedReport, SimulationError> {
        info!(epoch = %format_ts(&epoch), "Resetting simulation");
        self.seed(epoch)
    }

    // =========================================================================
    // SEED
    // =========================================================================

    /// Materialize full copies and the initial window `[epoch, epoch + window)`.
    ///
    /// Idempotent: the same epoch over the same source yields the same store.
    pub fn seed(&mut self, epoch: SimTime) -> Result<SeedReport, SimulationError> {
        let window_end = self.window.end_from(epoch).ok_or_else(|| {
            SimulationError::InvalidDuration(format!(
                "window {} from {} is out of range",
                self.window,
                format_ts(&epoch)
            ))
        })?;
        let load = self.source.load()?;
        let store = Arc::clone(&self.store);
        let range = TimeRange::between(epoch, window_end);

        let mut warnings: Vec<TableWarning> = load
            .failures
            .iter()
            .map(|f| TableWarning::new(&f.table, WarningKind::PartialLoad, f.reason.clone()))
            .collect();
        let previous = load_manifest(store.as_ref())?;

        self.cursors.clear();
        self.cursor_clock = None;

        let mut manifest = Vec::with_capacity(load.tables.len());
        let mut reports = Vec::with_capacity(load.tables.len());

        for (name, source_table) in &load.tables {
            let full = name.full_table();
            let registered = self.registry.column_for(name).cloned();
            let mut table = source_table.clone();

            let mut mode = match &registered {
                Some(column) if table.column_index(column.as_str()).is_none() => {
                    warnings.push(TableWarning::new(
                        name,
                        WarningKind::UnknownTimestampFormat,
                        format!("timestamp column {} not present", column),
                    ));
                    TableMode::Degraded
                }
                Some(column) => match normalize_timestamp_column(&mut table, column.as_str()) {
                    Ok(()) => TableMode::Windowed,
                    Err(e) => {
                        warnings.push(TableWarning::new(
                            name,
                            WarningKind::UnknownTimestampFormat,
                            e.to_string(),
                        ));
                        TableMode::Degraded
                    }
                },
                None => TableMode::Complete,
            };

            let written = fatal_or(
                store.replace_table(&full, &table),
                |e| TableWarning::new(name, WarningKind::PartialLoad, e.to_string()),
                &mut warnings,
            )?;
            if written.is_none() {
                continue;
            }

            let mut live_rows = None;
            if let (TableMode::Windowed, Some(column)) = (mode, &registered) {
                if let Err(e) = store.create_index(&full, column) {
                    if e.is_unavailable() {
                        return Err(SimulationError::StoreUnavailable(e));
                    }
                    debug!(table = %full, error = %e, "Timestamp index not created");
                }
                let filter = RangeFilter {
                    column: column.clone(),
                    range,
                };
                live_rows = fatal_or(
                    store.copy_rows(&full, name, Some(&filter), CopyMode::Replace),
                    |e| {
                        TableWarning::new(
                            name,
                            WarningKind::UnknownTimestampFormat,
                            format!("window filter failed, exposing full table: {}", e),
                        )
                    },
                    &mut warnings,
                )?;
                match live_rows {
                    Some(_) => {
                        self.cursors
                            .insert(name.clone(), window_max(&table, column.as_str(), &range));
                    }
                    None => mode = TableMode::Degraded,
                }
            }
            if live_rows.is_none() {
                live_rows = fatal_or(
                    store.copy_rows(&full, name, None, CopyMode::Replace),
                    |e| TableWarning::new(name, WarningKind::PartialLoad, e.to_string()),
                    &mut warnings,
                )?;
            }
            let Some(live_rows) = live_rows else {
                continue;
            };

            debug!(
                table = %name,
                mode = mode.as_str(),
                full_rows = table.len(),
                live_rows,
                "Table seeded"
            );
            manifest.push(ManifestEntry {
                name: name.clone(),
                ts_column: registered,
                mode,
            });
            reports.push(TableSeedReport {
                table: name.to_string(),
                mode,
                full_rows: table.len(),
                live_rows,
            });
        }

        // Residue from tables that are no longer in the source. Names compare
        // the way SQLite does, so a rename that only changes case drops nothing.
        let current: BTreeSet<String> = manifest
            .iter()
            .map(|e| e.name.as_str().to_ascii_lowercase())
            .collect();
        let mut dropped = Vec::new();
        for stale in previous
            .iter()
            .filter(|e| !current.contains(&e.name.as_str().to_ascii_lowercase()))
        {
            store.drop_table(&stale.name)?;
            store.drop_table(&stale.name.full_table())?;
            dropped.push(stale.name.to_string());
        }

        persist_manifest(store.as_ref(), &manifest)?;
        let clock = ClockState::new(epoch, window_end);
        clock.persist(store.as_ref())?;
        self.cursor_clock = Some(clock);

        info!(
            epoch = %format_ts(&epoch),
            current_time = %format_ts(&window_end),
            tables = reports.len(),
            dropped = dropped.len(),
            warnings = warnings.len(),
            "Simulation seeded"
        );
        Ok(SeedReport {
            epoch,
            current_time: window_end,
            tables: reports,
            dropped,
            warnings,
        })
    }

    // =========================================================================
    // ADVANCE
    // =========================================================================

    /// Move the clock forward by `span`.
    ///
    /// Each windowed table receives the full rows after its own live max and
    /// before `current_time + span`. For a table that kept up this is exactly
    /// `[current_time, current_time + span)`.
    pub fn advance_by(&mut self, span: Duration) -> Result<AdvanceReport, SimulationError> {
        if span <= Duration::zero() {
            return Err(SimulationError::InvalidDuration(format!(
                "advance span must be positive, got {}",
                format_span(&span)
            )));
        }
        let store = Arc::clone(&self.store);
        let clock = ClockState::load(store.as_ref())?.ok_or(SimulationError::NotSeeded)?;
        let upper = clock.current_time.checked_add_signed(span).ok_or_else(|| {
            SimulationError::InvalidDuration(format!("{} overflows", format_span(&span)))
        })?;

        if self.cursor_clock != Some(clock) {
            self.cursors.clear();
        }

        let manifest = load_manifest(store.as_ref())?;
        let mut warnings = Vec::new();
        let mut appended = BTreeMap::new();

        for entry in &manifest {
            let Some(column) = entry.window_column() else {
                continue;
            };
            let name = &entry.name;
            let full = name.full_table();

            let live_max = match self.cursors.get(name) {
                Some(cached) => *cached,
                None => {
                    let recovered = fatal_or(
                        store.max_timestamp(name, column),
                        |e| TableWarning::new(name, WarningKind::AppendFailed, e.to_string()),
                        &mut warnings,
                    )?;
                    let Some(recovered) = recovered else {
                        continue;
                    };
                    self.cursors.insert(name.clone(), recovered);
                    recovered
                }
            };

            if let Some(max) = live_max.filter(|m| *m >= clock.current_time) {
                warnings.push(TableWarning::new(
                    name,
                    WarningKind::ClockRegressionDetected,
                    format!(
                        "live max {} is not behind the clock {}",
                        format_ts(&max),
                        format_ts(&clock.current_time)
                    ),
                ));
                continue;
            }

            // Everything up to and including the live max must already be
            // visible; everything after it is still owed, however far behind
            // the clock. A table skipped earlier catches up here.
            let lower = match live_max {
                Some(max) => match next_instant(max) {
                    Some(lower) => lower,
                    None => {
                        warnings.push(TableWarning::new(
                            name,
                            WarningKind::AppendFailed,
                            format!("live max {} has no successor", format_ts(&max)),
                        ));
                        continue;
                    }
                },
                None => clock.epoch,
            };

            let behind = RangeFilter {
                column: column.clone(),
                range: TimeRange::between(clock.epoch, lower),
            };
            let counts = fatal_or(
                store
                    .count_rows(&full, Some(&behind))
                    .and_then(|f| Ok((f, store.count_rows(name, None)?))),
                |e| TableWarning::new(name, WarningKind::AppendFailed, e.to_string()),
                &mut warnings,
            )?;
            let Some((full_count, live_count)) = counts else {
                continue;
            };
            if full_count != live_count {
                warnings.push(TableWarning::new(
                    name,
                    WarningKind::ClockRegressionDetected,
                    format!(
                        "full table holds {} rows up to the live max, live holds {}",
                        full_count, live_count
                    ),
                ));
                continue;
            }

            let filter = RangeFilter {
                column: column.clone(),
                range: TimeRange::between(lower, upper),
            };
            let copied = fatal_or(
                store.copy_rows(&full, name, Some(&filter), CopyMode::Append),
                |e| TableWarning::new(name, WarningKind::AppendFailed, e.to_string()),
                &mut warnings,
            )?;
            let Some(copied) = copied else {
                continue;
            };
            if copied > 0 {
                match store.max_timestamp(name, column) {
                    Ok(new_max) => {
                        self.cursors.insert(name.clone(), new_max);
                    }
                    Err(e) if e.is_unavailable() => return Err(SimulationError::StoreUnavailable(e)),
                    // Recovered from the store on the next advance
                    Err(_) => {
                        self.cursors.remove(name);
                    }
                }
            }
            debug!(table = %name, rows = copied, "Live window advanced");
            appended.insert(name.to_string(), copied);
        }

        let next = clock
            .advanced_to(upper)
            .map_err(|e| SimulationError::InvalidDuration(e.to_string()))?;
        next.persist(store.as_ref())?;
        self.cursor_clock = Some(next);

        let report = AdvanceReport {
            previous_time: clock.current_time,
            current_time: upper,
            span: format_span(&span),
            appended,
            warnings,
        };
        info!(
            previous_time = %format_ts(&report.previous_time),
            current_time = %format_ts(&report.current_time),
            rows = report.total_appended(),
            warnings = report.warnings.len(),
            "Simulation advanced"
        );
        Ok(report)
    }
}

/// Largest timestamp of `table[column]` inside `range`.
fn window_max(table: &Table, column: &str, range: &TimeRange) -> Option<SimTime> {
    let idx = table.column_index(column)?;
    table
        .rows()
        .iter()
        .filter_map(|row| value_to_ts(&row[idx]).ok().flatten())
        .filter(|ts| range.contains(ts))
        .max()
}
