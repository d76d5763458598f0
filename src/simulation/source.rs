//! Source Dataset
//!
//! Loads the static historical dataset into memory, once per process.
//! Individual tables that fail to parse are dropped and reported as
//! failures (`PartialLoad`); only an unreadable artifact is fatal.

use super::registry::Ident;
use super::table::{Row, Table, Value};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// ERRORS / RESULTS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The backing artifact cannot be read at all.
    Unavailable { source_name: String, reason: String },
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable {
                source_name,
                reason,
            } => write!(f, "source {} unavailable: {}", source_name, reason),
        }
    }
}

impl std::error::Error for SourceError {}

/// A table that was present in the artifact but could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLoadFailure {
    pub table: String,
    pub reason: String,
}

/// Result of one successful load.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceLoad {
    pub tables: BTreeMap<Ident, Table>,
    pub failures: Vec<TableLoadFailure>,
}

impl SourceLoad {
    /// Collect per-table outcomes, validating names on the way in.
    ///
    /// SQLite table names are case-insensitive, so `Trade` and `trade` collide:
    /// the first one seen wins.
    fn collect(outcomes: Vec<(String, Result<Table, String>)>) -> Self {
        let mut load = SourceLoad::default();
        let mut folded = HashSet::new();
        for (raw_name, outcome) in outcomes {
            let checked = outcome.and_then(|table| {
                let name = Ident::normalize(&raw_name).map_err(|e| e.to_string())?;
                if name.is_reserved() {
                    return Err(format!("table name {} uses a reserved prefix", name));
                }
                if !folded.insert(name.as_str().to_ascii_lowercase()) {
                    return Err(format!("duplicate table name {}", name));
                }
                Ok((name, table))
            });
            match checked {
                Ok((name, table)) => {
                    load.tables.insert(name, table);
                }
                Err(reason) => load.failures.push(TableLoadFailure {
                    table: raw_name,
                    reason,
                }),
            }
        }
        load
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        Ident::new(name).ok().and_then(|n| self.tables.get(&n))
    }
}

/// Normalize and validate header names, rejecting duplicates.
fn normalize_headers<'a>(raw: impl IntoIterator<Item = &'a str>) -> Result<Vec<String>, String> {
    let mut seen = HashSet::new();
    let mut names = Vec::new();
    for header in raw {
        let name = Ident::normalize(header).map_err(|e| format!("column: {}", e))?;
        if !seen.insert(name.as_str().to_ascii_lowercase()) {
            return Err(format!("duplicate column {}", name));
        }
        names.push(String::from(name));
    }
    if names.is_empty() {
        return Err("no columns".to_string());
    }
    Ok(names)
}

// =============================================================================
// LOADERS
// =============================================================================

/// Something that can produce the whole dataset.
pub trait SourceLoader: Send + Sync {
    /// Human-readable origin for logs.
    fn describe(&self) -> String;

    fn load_tables(&self) -> Result<SourceLoad, SourceError>;
}

/// Every `*.csv` file in a directory is one table named after its stem.
#[derive(Debug, Clone)]
pub struct CsvDirectoryLoader {
    dir: PathBuf,
}

impl CsvDirectoryLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn read_csv(path: &Path) -> Result<Table, String> {
        let mut reader = csv::Reader::from_path(path)
            .map_err(|e| format!("failed to open {:?}: {}", path, e))?;
        let headers = reader
            .headers()
            .map_err(|e| format!("bad header: {}", e))?
            .clone();
        let names = normalize_headers(headers.iter())?;

        let mut rows: Vec<Row> = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record.map_err(|e| format!("record {}: {}", line + 1, e))?;
            rows.push(record.iter().map(Value::parse_cell).collect());
        }
        Table::from_rows(names, rows).map_err(|e| e.to_string())
    }
}

impl SourceLoader for CsvDirectoryLoader {
    fn describe(&self) -> String {
        format!("csv_dir:{}", self.dir.display())
    }

    fn load_tables(&self) -> Result<SourceLoad, SourceError> {
        let unavailable = |reason: String| SourceError::Unavailable {
            source_name: self.describe(),
            reason,
        };
        let entries = std::fs::read_dir(&self.dir).map_err(|e| unavailable(e.to_string()))?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && p.extension()
                        .map_or(false, |ext| ext.eq_ignore_ascii_case("csv"))
            })
            .collect();
        if files.is_empty() {
            return Err(unavailable("no .csv files".to_string()));
        }
        files.sort();

        let outcomes: Vec<(String, Result<Table, String>)> = files
            .par_iter()
            .map(|path| {
                let stem = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                debug!(file = %path.display(), "Parsing CSV table");
                (stem, Self::read_csv(path))
            })
            .collect();
        Ok(SourceLoad::collect(outcomes))
    }
}

/// A single JSON document `{ "Table": [ { "column": value, ... }, ... ] }`.
#[derive(Debug, Clone)]
pub struct JsonFileLoader {
    path: PathBuf,
}

impl JsonFileLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn convert(records: &serde_json::Value) -> Result<Table, String> {
        let records = records
            .as_array()
            .ok_or_else(|| "expected an array of records".to_string())?;

        // Column order: first appearance across records.
        let mut raw_names: Vec<&str> = Vec::new();
        for record in records {
            let object = record
                .as_object()
                .ok_or_else(|| "record is not an object".to_string())?;
            for key in object.keys() {
                if !raw_names.contains(&key.as_str()) {
                    raw_names.push(key);
                }
            }
        }
        let names = normalize_headers(raw_names.iter().copied())?;

        let rows = records
            .iter()
            .filter_map(|r| r.as_object())
            .map(|object| {
                raw_names
                    .iter()
                    .map(|k| object.get(*k).map(Value::from_json).unwrap_or(Value::Null))
                    .collect()
            })
            .collect();
        Table::from_rows(names, rows).map_err(|e| e.to_string())
    }
}

impl SourceLoader for JsonFileLoader {
    fn describe(&self) -> String {
        format!("json:{}", self.path.display())
    }

    fn load_tables(&self) -> Result<SourceLoad, SourceError> {
        let unavailable = |reason: String| SourceError::Unavailable {
            source_name: self.describe(),
            reason,
        };
        let file = File::open(&self.path).map_err(|e| unavailable(e.to_string()))?;
        let document: serde_json::Map<String, serde_json::Value> =
            serde_json::from_reader(BufReader::new(file)).map_err(|e| unavailable(e.to_string()))?;

        let outcomes: Vec<(String, Result<Table, String>)> = document
            .iter()
            .collect::<Vec<_>>()
            .par_iter()
            .map(|(name, records)| (name.to_string(), Self::convert(records)))
            .collect();
        Ok(SourceLoad::collect(outcomes))
    }
}

/// Fixed tables held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLoader {
    tables: Vec<(String, Table)>,
}

impl InMemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, name: impl Into<String>, table: Table) -> Self {
        self.tables.push((name.into(), table));
        self
    }
}

impl SourceLoader for InMemoryLoader {
    fn describe(&self) -> String {
        format!("memory:{} tables", self.tables.len())
    }

    fn load_tables(&self) -> Result<SourceLoad, SourceError> {
        let outcomes = self
            .tables
            .iter()
            .map(|(name, table)| {
                let checked = normalize_headers(table.column_names())
                    .and_then(|names| {
                        if table.column_names() == names.iter().map(String::as_str).collect::<Vec<_>>() {
                            Ok(table.clone())
                        } else {
                            Err(format!("column names {:?} are not normalized", table.column_names()))
                        }
                    });
                (name.clone(), checked)
            })
            .collect();
        Ok(SourceLoad::collect(outcomes))
    }
}

// =============================================================================
// MEMOIZED DATASET
// =============================================================================

enum LoadState {
    Unloaded,
    Loaded(Arc<SourceLoad>),
}

/// The dataset, loaded lazily and at most once successfully.
pub struct SourceDataset {
    loader: Box<dyn SourceLoader>,
    state: Mutex<LoadState>,
}

impl SourceDataset {
    pub fn new(loader: impl SourceLoader + 'static) -> Self {
        Self {
            loader: Box::new(loader),
            state: Mutex::new(LoadState::Unloaded),
        }
    }

    /// Load on first call, return the cached result afterwards.
    /// A failed load leaves the dataset unloaded so a later call retries.
    pub fn load(&self) -> Result<Arc<SourceLoad>, SourceError> {
        let mut state = self.state.lock();
        if let LoadState::Loaded(load) = &*state {
            return Ok(Arc::clone(load));
        }

        let load = Arc::new(self.loader.load_tables()?);
        for failure in &load.failures {
            warn!(
                table = %failure.table,
                reason = %failure.reason,
                "Table skipped during source load"
            );
        }
        info!(
            source = %self.loader.describe(),
            tables = load.tables.len(),
            failed = load.failures.len(),
            "Source dataset loaded"
        );
        *state = LoadState::Loaded(Arc::clone(&load));
        Ok(load)
    }

    pub fn is_loaded(&self) -> bool {
        matches!(*self.state.lock(), LoadState::Loaded(_))
    }

    pub fn describe(&self) -> String {
        self.loader.describe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn write_file(dir: &Path, name: &str, body: &str) {
        let mut f = File::create(dir.join(name)).unwrap();
        f.write_all(body.as_bytes()).unwrap();
    }

    #[test]
    fn test_csv_directory_loads_and_infers() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "Trade.csv",
            "account_id,amount,ts\n1,2.5,2025-02-01 00:00:00\n2,,2025-02-02 00:00:00\n",
        );
        write_file(dir.path(), "IP log.csv", "account id,ip\n1,10.0.0.1\n");
        write_file(dir.path(), "notes.txt", "ignored");

        let load = CsvDirectoryLoader::new(dir.path()).load_tables().unwrap();
        assert!(load.failures.is_empty());
        assert_eq!(load.tables.len(), 2);

        let trade = load.table("Trade").unwrap();
        assert_eq!(trade.len(), 2);
        assert_eq!(trade.rows()[1][1], Value::Null);
        assert_eq!(
            trade.columns()[1].kind,
            crate::simulation::table::ColumnType::Real
        );

        let ip = load.table("IP_log").unwrap();
        assert_eq!(ip.column_names(), vec!["account_id", "ip"]);
    }

    #[test]
    fn test_csv_bad_table_is_partial() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "Good.csv", "a\n1\n");
        write_file(dir.path(), "Ragged.csv", "a,b\n1,2\n3\n");
        write_file(dir.path(), "full_Trade.csv", "a\n1\n");

        let load = CsvDirectoryLoader::new(dir.path()).load_tables().unwrap();
        assert_eq!(load.tables.len(), 1);
        let mut failed: Vec<_> = load.failures.iter().map(|f| f.table.as_str()).collect();
        failed.sort();
        assert_eq!(failed, vec!["Ragged", "full_Trade"]);
    }

    #[test]
    fn test_table_names_differing_only_in_case_collide() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "Trade.csv", "id,ts\n1,2025-02-01\n");
        write_file(dir.path(), "trade.csv", "id,ts\n2,2025-02-02\n");
        write_file(dir.path(), "TRADE log.csv", "id\n3\n");

        let load = CsvDirectoryLoader::new(dir.path()).load_tables().unwrap();
        let names: Vec<&str> = load.tables.keys().map(|n| n.as_str()).collect();
        assert_eq!(names, vec!["TRADE_log", "Trade"]);
        assert_eq!(load.failures.len(), 1);
        assert_eq!(load.failures[0].table, "trade");
        assert!(load.failures[0].reason.contains("duplicate"));
    }

    #[test]
    fn test_missing_directory_is_unavailable() {
        let err = CsvDirectoryLoader::new("/definitely/not/here")
            .load_tables()
            .unwrap_err();
        assert!(matches!(err, SourceError::Unavailable { .. }));
    }

    #[test]
    fn test_json_loader() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "data.json",
            r#"{
                "Funding": [
                    {"account_id": 1, "funding_fee": 0.5, "ts": "2025-02-20 00:00:00"},
                    {"account_id": 2, "ts": "2025-02-21 00:00:00"}
                ],
                "Broken": {"not": "an array"}
            }"#,
        );
        let load = JsonFileLoader::new(dir.path().join("data.json"))
            .load_tables()
            .unwrap();
        let funding = load.table("Funding").unwrap();
        assert_eq!(funding.column_names(), vec!["account_id", "funding_fee", "ts"]);
        assert_eq!(funding.rows()[1][1], Value::Null);
        assert_eq!(load.failures.len(), 1);
        assert_eq!(load.failures[0].table, "Broken");
    }

    struct CountingLoader {
        calls: Arc<AtomicUsize>,
        fail_first: bool,
    }

    impl SourceLoader for CountingLoader {
        fn describe(&self) -> String {
            "counting".to_string()
        }

        fn load_tables(&self) -> Result<SourceLoad, SourceError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && n == 0 {
                return Err(SourceError::Unavailable {
                    source_name: "counting".into(),
                    reason: "first call fails".into(),
                });
            }
            Ok(SourceLoad::default())
        }
    }

    #[test]
    fn test_dataset_memoizes_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dataset = SourceDataset::new(CountingLoader {
            calls: Arc::clone(&calls),
            fail_first: false,
        });
        assert!(!dataset.is_loaded());
        let a = dataset.load().unwrap();
        let b = dataset.load().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dataset_retries_after_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dataset = SourceDataset::new(CountingLoader {
            calls: Arc::clone(&calls),
            fail_first: true,
        });
        assert!(dataset.load().is_err());
        assert!(!dataset.is_loaded());
        assert!(dataset.load().is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_in_memory_rejects_unnormalized_columns() {
        let bad = Table::from_rows(vec!["account id".into()], vec![]).unwrap();
        let good = Table::from_rows(vec!["account_id".into()], vec![]).unwrap();
        let load = InMemoryLoader::new()
            .with_table("Bad", bad)
            .with_table("Good", good)
            .load_tables()
            .unwrap();
        assert_eq!(load.tables.len(), 1);
        assert_eq!(load.failures[0].table, "Bad");
    }
}
