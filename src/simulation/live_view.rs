//! Read-only view over the live tables.
//!
//! Detection and presentation code gets a `LiveView`, never the store:
//! full copies and simulation metadata are unreachable through it.

use super::clock::{load_manifest, ClockState, ManifestEntry};
use super::registry::{Ident, FULL_PREFIX, META_PREFIX};
use super::store::{PersistentStore, Query, StoreError, StoreResult};
use super::table::{Table, Value};
use super::timestamp::SimTime;
use std::sync::Arc;

#[derive(Clone)]
pub struct LiveView {
    store: Arc<dyn PersistentStore>,
}

impl LiveView {
    pub fn new(store: Arc<dyn PersistentStore>) -> Self {
        Self { store }
    }

    /// Simulated now. `None` before the first seed.
    pub fn current_time(&self) -> StoreResult<Option<SimTime>> {
        Ok(ClockState::load(self.store.as_ref())?.map(|c| c.current_time))
    }

    /// Live tables with their timestamp column and mode.
    pub fn list_live_tables(&self) -> StoreResult<Vec<ManifestEntry>> {
        load_manifest(self.store.as_ref())
    }

    /// Resolve a user-supplied name to a seeded live table.
    pub fn resolve(&self, name: &str) -> StoreResult<ManifestEntry> {
        let ident = Ident::new(name)?;
        self.list_live_tables()?
            .into_iter()
            .find(|e| e.name == ident)
            .ok_or_else(|| StoreError::UnknownTable(name.to_string()))
    }

    pub fn query(&self, query: &Query) -> StoreResult<Table> {
        if query.table.is_reserved() {
            return Err(StoreError::UnknownTable(query.table.to_string()));
        }
        self.store.query(query)
    }

    /// First `limit` rows of a live table, in time order when it has a
    /// timestamp column.
    pub fn rows(&self, name: &str, limit: usize) -> StoreResult<Table> {
        let entry = self.resolve(name)?;
        let mut query = Query::all(&entry.name).limit(limit);
        if let Some(column) = &entry.ts_column {
            query = query.order_by(column);
        }
        self.store.query(&query)
    }

    pub fn count(&self, name: &str) -> StoreResult<usize> {
        let entry = self.resolve(name)?;
        self.store.count_rows(&entry.name, None)
    }

    /// Read-only SQL for joins and aggregations over live tables.
    ///
    /// Any identifier starting with a reserved prefix is rejected, which
    /// also rules out columns named that way.
    pub fn query_sql(&self, sql: &str, params: &[Value]) -> StoreResult<Table> {
        if let Some(token) = reserved_token(sql) {
            return Err(StoreError::UnknownTable(token));
        }
        self.store.query_sql(sql, params)
    }
}

fn reserved_token(sql: &str) -> Option<String> {
    sql.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .find(|token| {
            let lower = token.to_ascii_lowercase();
            lower.starts_with(FULL_PREFIX) || lower.starts_with(META_PREFIX)
        })
        .map(str::to_string)
}
