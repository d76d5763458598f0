//! SQLite-backed Persistent Store
//!
//! One database file holds every full table, live table and metadata table.
//!
//! - WAL mode: readers never block the single writer.
//! - Every mutation is one `BEGIN IMMEDIATE` transaction, so a replaced table
//!   swaps atomically and an append is never observed half-done.
//! - Busy/locked errors are retried a bounded number of times, then surface
//!   as `StoreError::Unavailable`.
//! - Several `SqliteStore`s may be opened on the same file (one per process
//!   or per test); each sees the others' committed writes.

use super::registry::Ident;
use super::store::{
    range_clause, CopyMode, PersistentStore, Query, RangeFilter, StoreError, StoreResult,
};
use super::table::{ColumnType, Row, Table, Value};
use parking_lot::Mutex;
use rusqlite::{params_from_iter, Connection, ErrorCode, OpenFlags, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const PRAGMAS_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;
PRAGMA cache_size = -32000;  -- 32MB cache
"#;

/// Retry and locking knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Total attempts per operation (first try included).
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    /// SQLite busy handler timeout per attempt.
    pub busy_timeout_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_backoff_ms: 50,
            busy_timeout_ms: 2000,
        }
    }
}

/// Table store over one SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    settings: StoreSettings,
}

impl SqliteStore {
    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>, settings: StoreSettings) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Unavailable {
                    operation: "open".to_string(),
                    attempts: 1,
                    reason: format!("cannot create {}: {}", parent.display(), e),
                })?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = retry_loop(&settings, "open", || {
            let conn = Connection::open_with_flags(&path, flags)?;
            conn.busy_timeout(Duration::from_millis(settings.busy_timeout_ms))?;
            conn.execute_batch(PRAGMAS_SQL)?;
            Ok(conn)
        })?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if !journal_mode.eq_ignore_ascii_case("wal") {
            warn!(journal_mode = %journal_mode, "WAL mode not active");
        }

        info!(path = %path.display(), "Simulation store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            settings,
        })
    }

    /// Private in-memory database (tests, embedding).
    pub fn open_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(PRAGMAS_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            settings: StoreSettings::default(),
        })
    }

    /// Run `f` against the connection, retrying transient failures.
    fn with_conn<T>(
        &self,
        operation: &str,
        mut f: impl FnMut(&mut Connection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        retry_loop(&self.settings, operation, || {
            let mut conn = self.conn.lock();
            f(&mut *conn)
        })
    }
}

// =============================================================================
// RETRY
// =============================================================================

fn is_transient(err: &StoreError) -> bool {
    match err {
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
            e.code,
            ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
        ),
        _ => false,
    }
}

fn retry_loop<T>(
    settings: &StoreSettings,
    operation: &str,
    mut f: impl FnMut() -> StoreResult<T>,
) -> StoreResult<T> {
    let attempts = settings.retry_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f() {
            Err(err) if is_transient(&err) => {
                if attempt >= attempts {
                    return Err(StoreError::Unavailable {
                        operation: operation.to_string(),
                        attempts,
                        reason: err.to_string(),
                    });
                }
                warn!(
                    operation,
                    attempt,
                    error = %err,
                    "Store operation failed, retrying"
                );
                std::thread::sleep(Duration::from_millis(settings.retry_backoff_ms));
            }
            other => return other,
        }
    }
}

// =============================================================================
// SQL HELPERS
// =============================================================================

fn table_exists(conn: &Connection, name: &Ident) -> StoreResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name.as_str()],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Declared schema of an existing table, in column order.
fn table_schema(conn: &Connection, name: &Ident) -> StoreResult<Vec<(Ident, ColumnType)>> {
    let mut stmt = conn.prepare("SELECT name, type FROM pragma_table_info(?1) ORDER BY cid")?;
    let columns = stmt
        .query_map([name.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    columns
        .into_iter()
        .map(|(col, decl)| -> StoreResult<(Ident, ColumnType)> {
            Ok((Ident::new(col)?, ColumnType::from_declared(&decl)))
        })
        .collect()
}

fn create_table_sql(name: &Ident, columns: &[(Ident, ColumnType)]) -> String {
    let defs: Vec<String> = columns
        .iter()
        .map(|(c, kind)| format!("{} {}", c.quoted(), kind.sql_name()))
        .collect();
    format!("CREATE TABLE {} ({})", name.quoted(), defs.join(", "))
}

fn column_list(columns: &[Ident]) -> String {
    columns
        .iter()
        .map(Ident::quoted)
        .collect::<Vec<_>>()
        .join(", ")
}

fn insert_rows(
    conn: &Connection,
    name: &Ident,
    columns: &[Ident],
    rows: &[Row],
) -> StoreResult<usize> {
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        name.quoted(),
        column_list(columns),
        placeholders.join(", ")
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    for row in rows {
        stmt.execute(params_from_iter(row.iter()))?;
    }
    Ok(rows.len())
}

fn validated_columns(table: &Table) -> StoreResult<Vec<Ident>> {
    if table.columns().is_empty() {
        return Err(StoreError::InvalidTable("table has no columns".to_string()));
    }
    let mut seen = BTreeSet::new();
    let mut out = Vec::with_capacity(table.columns().len());
    for column in table.columns() {
        let ident = Ident::new(column.name.clone())?;
        if !seen.insert(ident.as_str().to_ascii_lowercase()) {
            return Err(StoreError::InvalidTable(format!("duplicate column {}", ident)));
        }
        out.push(ident);
    }
    Ok(out)
}

/// Run a read-only statement and collect the result as a `Table`.
fn read_table(conn: &Connection, sql: &str, params: &[Value]) -> StoreResult<Table> {
    let mut stmt = conn.prepare(sql)?;
    if !stmt.readonly() {
        return Err(StoreError::NotReadOnly(sql.to_string()));
    }
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = names.len();

    let mut rows: Vec<Row> = Vec::new();
    let mut cursor = stmt.query(params_from_iter(params.iter()))?;
    while let Some(row) = cursor.next()? {
        let cells = (0..width)
            .map(|i| row.get::<_, Value>(i))
            .collect::<Result<Row, _>>()?;
        rows.push(cells);
    }
    Table::from_rows(names, rows).map_err(|e| StoreError::InvalidTable(e.to_string()))
}

// =============================================================================
// CONTRACT
// =============================================================================

impl PersistentStore for SqliteStore {
    fn replace_table(&self, name: &Ident, table: &Table) -> StoreResult<()> {
        let columns = validated_columns(table)?;
        let schema: Vec<(Ident, ColumnType)> = columns
            .iter()
            .cloned()
            .zip(table.columns().iter().map(|c| c.kind))
            .collect();

        self.with_conn("replace_table", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", name.quoted()))?;
            tx.execute_batch(&create_table_sql(name, &schema))?;
            insert_rows(&tx, name, &columns, table.rows())?;
            tx.commit()?;
            Ok(())
        })?;
        debug!(table = %name, rows = table.len(), "Table replaced");
        Ok(())
    }

    fn append_rows(&self, name: &Ident, rows: &Table) -> StoreResult<usize> {
        let columns = validated_columns(rows)?;
        let written = self.with_conn("append_rows", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if !table_exists(&tx, name)? {
                return Err(StoreError::UnknownTable(name.to_string()));
            }
            let written = insert_rows(&tx, name, &columns, rows.rows())?;
            tx.commit()?;
            Ok(written)
        })?;
        debug!(table = %name, rows = written, "Rows appended");
        Ok(written)
    }

    fn copy_rows(
        &self,
        from: &Ident,
        to: &Ident,
        filter: Option<&RangeFilter>,
        mode: CopyMode,
    ) -> StoreResult<usize> {
        let (clause, params) = match filter {
            Some(f) => range_clause(&f.column, &f.range),
            None => (String::new(), Vec::new()),
        };
        let written = self.with_conn("copy_rows", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if !table_exists(&tx, from)? {
                return Err(StoreError::UnknownTable(from.to_string()));
            }
            let schema = table_schema(&tx, from)?;
            match mode {
                CopyMode::Replace => {
                    tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", to.quoted()))?;
                    tx.execute_batch(&create_table_sql(to, &schema))?;
                }
                CopyMode::Append => {
                    if !table_exists(&tx, to)? {
                        return Err(StoreError::UnknownTable(to.to_string()));
                    }
                }
            }

            let columns: Vec<Ident> = schema.into_iter().map(|(c, _)| c).collect();
            let list = column_list(&columns);
            let mut sql = format!(
                "INSERT INTO {} ({}) SELECT {} FROM {}",
                to.quoted(),
                list,
                list,
                from.quoted()
            );
            if !clause.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&clause);
            }
            sql.push_str(" ORDER BY rowid");
            let written = tx.execute(&sql, params_from_iter(params.iter()))?;
            tx.commit()?;
            Ok(written)
        })?;
        debug!(from = %from, to = %to, rows = written, ?mode, "Rows copied");
        Ok(written)
    }

    fn drop_table(&self, name: &Ident) -> StoreResult<()> {
        self.with_conn("drop_table", |conn| {
            conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", name.quoted()))?;
            Ok(())
        })
    }

    fn create_index(&self, table: &Ident, column: &Ident) -> StoreResult<()> {
        let sql = format!(
            "CREATE INDEX IF NOT EXISTS \"idx_{}_{}\" ON {} ({})",
            table,
            column,
            table.quoted(),
            column.quoted()
        );
        self.with_conn("create_index", |conn| {
            conn.execute_batch(&sql)?;
            Ok(())
        })
    }

    fn query(&self, query: &Query) -> StoreResult<Table> {
        let (sql, params) = query.to_sql();
        self.with_conn("query", |conn| {
            if !table_exists(conn, &query.table)? {
                return Err(StoreError::UnknownTable(query.table.to_string()));
            }
            read_table(conn, &sql, &params)
        })
    }

    fn query_sql(&self, sql: &str, params: &[Value]) -> StoreResult<Table> {
        self.with_conn("query_sql", |conn| read_table(conn, sql, params))
    }

    fn list_tables(&self) -> StoreResult<BTreeSet<String>> {
        self.with_conn("list_tables", |conn| {
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
            )?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<BTreeSet<_>, _>>()?;
            Ok(names)
        })
    }

    fn table_exists(&self, name: &Ident) -> StoreResult<bool> {
        self.with_conn("table_exists", |conn| table_exists(conn, name))
    }
}
