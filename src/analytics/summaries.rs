//! Per-table summaries of the live view.

use crate::simulation::{LiveView, Query, StoreResult, TableMode, Value};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableSummary {
    pub table: String,
    pub mode: TableMode,
    pub ts_column: Option<String>,
    pub rows: usize,
    /// Earliest / latest visible timestamp, as stored.
    pub first_ts: Option<String>,
    pub last_ts: Option<String>,
}

fn scalar_text(value: Option<&Value>) -> Option<String> {
    value.filter(|v| !v.is_null()).map(|v| v.to_string())
}

pub fn table_summaries(view: &LiveView) -> StoreResult<Vec<TableSummary>> {
    let mut out = Vec::new();
    for entry in view.list_live_tables()? {
        let rows = view
            .query(&Query::count(&entry.name))?
            .scalar()
            .and_then(Value::as_i64)
            .unwrap_or(0)
            .max(0) as usize;

        let (first_ts, last_ts) = match &entry.ts_column {
            Some(column) => (
                scalar_text(view.query(&Query::min(&entry.name, column))?.scalar()),
                scalar_text(view.query(&Query::max(&entry.name, column))?.scalar()),
            ),
            None => (None, None),
        };

        out.push(TableSummary {
            table: entry.name.to_string(),
            mode: entry.mode,
            ts_column: entry.ts_column.as_ref().map(|c| c.to_string()),
            rows,
            first_ts,
            last_ts,
        });
    }
    Ok(out)
}
