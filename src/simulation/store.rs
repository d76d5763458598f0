//! Persistent Store Contract
//!
//! Table-oriented durable storage the window manager and every reader go
//! through. Implementations must provide:
//!
//! - `replace_table`: atomic create-or-replace. Readers see the old or the
//!   new table, never a mix.
//! - `append_rows` / `copy_rows(.., Append)`: add rows without disturbing
//!   existing ones; `UnknownTable` if the target does not exist.
//! - `query` / `query_sql`: read-only.
//! - Mutations visible to any later connection on the same backing store.
//!
//! Concurrent writers to different tables must not corrupt each other.
//! Writers to the same table race last-writer-wins; the window manager is
//! the sole writer of every table it owns.

use super::registry::{Ident, InvalidIdent};
use super::table::{Table, Value};
use super::timestamp::{format_ts, parse_ts, SimTime, TimeRange};
use std::collections::BTreeSet;
use std::fmt;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug)]
pub enum StoreError {
    /// Backend unreachable after the bounded retries.
    Unavailable {
        operation: String,
        attempts: u32,
        reason: String,
    },
    UnknownTable(String),
    InvalidIdentifier(InvalidIdent),
    /// Table cannot be materialized (e.g. no columns, ragged rows).
    InvalidTable(String),
    /// `query_sql` was handed a statement that could write.
    NotReadOnly(String),
    Sqlite(rusqlite::Error),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. })
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable {
                operation,
                attempts,
                reason,
            } => write!(
                f,
                "store unavailable during {} after {} attempts: {}",
                operation, attempts, reason
            ),
            Self::UnknownTable(name) => write!(f, "unknown table: {}", name),
            Self::InvalidIdentifier(e) => write!(f, "{}", e),
            Self::InvalidTable(reason) => write!(f, "invalid table: {}", reason),
            Self::NotReadOnly(sql) => write!(f, "statement is not read-only: {}", sql),
            Self::Sqlite(e) => write!(f, "SQLite error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Sqlite(e) => Some(e),
            Self::InvalidIdentifier(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

impl From<InvalidIdent> for StoreError {
    fn from(e: InvalidIdent) -> Self {
        Self::InvalidIdentifier(e)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

// =============================================================================
// QUERIES
// =============================================================================

/// What a query returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Select {
    All,
    Count,
    Min(Ident),
    Max(Ident),
}

/// Half-open range filter on one timestamp column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeFilter {
    pub column: Ident,
    pub range: TimeRange,
}

/// Typed single-table query. Built only from validated identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub table: Ident,
    pub select: Select,
    pub filter: Option<RangeFilter>,
    pub order_by: Option<Ident>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn all(table: &Ident) -> Self {
        Self {
            table: table.clone(),
            select: Select::All,
            filter: None,
            order_by: None,
            limit: None,
        }
    }

    pub fn count(table: &Ident) -> Self {
        Self {
            select: Select::Count,
            ..Self::all(table)
        }
    }

    pub fn max(table: &Ident, column: &Ident) -> Self {
        Self {
            select: Select::Max(column.clone()),
            ..Self::all(table)
        }
    }

    pub fn min(table: &Ident, column: &Ident) -> Self {
        Self {
            select: Select::Min(column.clone()),
            ..Self::all(table)
        }
    }

    pub fn within(mut self, column: &Ident, range: TimeRange) -> Self {
        self.filter = Some(RangeFilter {
            column: column.clone(),
            range,
        });
        self
    }

    pub fn order_by(mut self, column: &Ident) -> Self {
        self.order_by = Some(column.clone());
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Render to SQL text plus bound parameters.
    pub fn to_sql(&self) -> (String, Vec<Value>) {
        let projection = match &self.select {
            Select::All => "*".to_string(),
            Select::Count => "COUNT(*)".to_string(),
            Select::Min(c) => format!("MIN({})", c.quoted()),
            Select::Max(c) => format!("MAX({})", c.quoted()),
        };
        let mut sql = format!("SELECT {} FROM {}", projection, self.table.quoted());
        let params = match &self.filter {
            Some(filter) => {
                let (clause, params) = range_clause(&filter.column, &filter.range);
                if !clause.is_empty() {
                    sql.push_str(" WHERE ");
                    sql.push_str(&clause);
                }
                params
            }
            None => Vec::new(),
        };
        if self.select == Select::All {
            match &self.order_by {
                Some(c) => sql.push_str(&format!(" ORDER BY {}, rowid", c.quoted())),
                None => sql.push_str(" ORDER BY rowid"),
            }
            if let Some(n) = self.limit {
                sql.push_str(&format!(" LIMIT {}", n));
            }
        }
        (sql, params)
    }
}

/// `WHERE` fragment for a half-open range, with its parameters.
pub fn range_clause(column: &Ident, range: &TimeRange) -> (String, Vec<Value>) {
    let mut parts = Vec::new();
    let mut params = Vec::new();
    if let Some(start) = range.start {
        params.push(Value::Text(format_ts(&start)));
        parts.push(format!("{} >= ?{}", column.quoted(), params.len()));
    }
    if let Some(end) = range.end {
        params.push(Value::Text(format_ts(&end)));
        parts.push(format!("{} < ?{}", column.quoted(), params.len()));
    }
    (parts.join(" AND "), params)
}

/// How `copy_rows` treats the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    /// Drop and recreate the destination with the source schema.
    Replace,
    /// Destination must already exist.
    Append,
}

// =============================================================================
// CONTRACT
// =============================================================================

/// Durable table storage.
pub trait PersistentStore: Send + Sync {
    /// Atomically create or overwrite `name` with `table`.
    fn replace_table(&self, name: &Ident, table: &Table) -> StoreResult<()>;

    /// Append rows to an existing table. Returns rows written.
    fn append_rows(&self, name: &Ident, rows: &Table) -> StoreResult<usize>;

    /// Copy the rows of `from` inside `filter` into `to`, in source order.
    /// Runs entirely inside the store. Returns rows written.
    fn copy_rows(
        &self,
        from: &Ident,
        to: &Ident,
        filter: Option<&RangeFilter>,
        mode: CopyMode,
    ) -> StoreResult<usize>;

    fn drop_table(&self, name: &Ident) -> StoreResult<()>;

    /// Secondary index on one column (idempotent).
    fn create_index(&self, table: &Ident, column: &Ident) -> StoreResult<()>;

    fn query(&self, query: &Query) -> StoreResult<Table>;

    /// Read-only SQL with bound parameters, for joins and aggregations.
    fn query_sql(&self, sql: &str, params: &[Value]) -> StoreResult<Table>;

    fn list_tables(&self) -> StoreResult<BTreeSet<String>>;

    fn table_exists(&self, name: &Ident) -> StoreResult<bool> {
        Ok(self.list_tables()?.contains(name.as_str()))
    }

    fn count_rows(&self, name: &Ident, filter: Option<&RangeFilter>) -> StoreResult<usize> {
        let mut query = Query::count(name);
        query.filter = filter.cloned();
        let count = self
            .query(&query)?
            .scalar()
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        Ok(count.max(0) as usize)
    }

    /// Largest timestamp in `column`, `None` when the table has no dated rows.
    fn max_timestamp(&self, table: &Ident, column: &Ident) -> StoreResult<Option<SimTime>> {
        Ok(scalar_ts(&self.query(&Query::max(table, column))?))
    }
}

fn scalar_ts(table: &Table) -> Option<SimTime> {
    table.scalar().and_then(|v| v.as_text()).and_then(parse_ts)
}
