//! In-memory tabular structure
//!
//! `Table` is the unit exchanged between the source loaders, the persistent
//! store and the readers: ordered rows over a fixed, named, typed column
//! schema. Cells are `Value`s, which map 1:1 onto SQLite storage classes.

use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// VALUES
// =============================================================================

/// A single cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Value {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(v) => Some(*v as f64),
            Value::Real(v) => Some(*v),
            _ => None,
        }
    }

    /// Parse a raw text cell (CSV) into the narrowest value.
    /// Empty cells are null.
    pub fn parse_cell(raw: &str) -> Value {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Value::Null;
        }
        if let Ok(v) = trimmed.parse::<i64>() {
            return Value::Integer(v);
        }
        if let Ok(v) = trimmed.parse::<f64>() {
            if v.is_finite() {
                return Value::Real(v);
            }
        }
        Value::Text(trimmed.to_string())
    }

    /// Convert a JSON cell. Nested arrays/objects are kept as their JSON text.
    pub fn from_json(v: &serde_json::Value) -> Value {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Integer(*b as i64),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => n.as_f64().map(Value::Real).unwrap_or(Value::Null),
            },
            serde_json::Value::String(s) => Value::Text(s.clone()),
            other => Value::Text(other.to_string()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Integer(v) => serde_json::Value::from(*v),
            Value::Real(v) => serde_json::Value::from(*v),
            Value::Text(s) => serde_json::Value::from(s.as_str()),
        }
    }

    fn kind(&self) -> Option<ColumnType> {
        match self {
            Value::Null => None,
            Value::Integer(_) => Some(ColumnType::Integer),
            Value::Real(_) => Some(ColumnType::Real),
            Value::Text(_) => Some(ColumnType::Text),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Real(v) => write!(f, "{}", v),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Value::Integer(v) => ToSqlOutput::Borrowed(ValueRef::Integer(*v)),
            Value::Real(v) => ToSqlOutput::Borrowed(ValueRef::Real(*v)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

impl FromSql for Value {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(v) => Value::Integer(v),
            ValueRef::Real(v) => Value::Real(v),
            ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
                Value::Text(String::from_utf8_lossy(bytes).into_owned())
            }
        })
    }
}

// =============================================================================
// SCHEMA
// =============================================================================

/// Declared column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
}

impl ColumnType {
    /// SQL type name used in DDL.
    pub fn sql_name(&self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
        }
    }

    /// Map a declared SQLite type back (affinity rules, simplified).
    pub fn from_declared(decl: &str) -> ColumnType {
        let upper = decl.to_ascii_uppercase();
        if upper.contains("INT") {
            ColumnType::Integer
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            ColumnType::Real
        } else {
            ColumnType::Text
        }
    }

    /// Widest type needed to hold every non-null value.
    pub fn infer<'a>(values: impl IntoIterator<Item = &'a Value>) -> ColumnType {
        let mut widest: Option<ColumnType> = None;
        for v in values {
            widest = match (widest, v.kind()) {
                (w, None) => w,
                (None, k) => k,
                (Some(ColumnType::Text), _) | (_, Some(ColumnType::Text)) => Some(ColumnType::Text),
                (Some(ColumnType::Real), _) | (_, Some(ColumnType::Real)) => Some(ColumnType::Real),
                _ => Some(ColumnType::Integer),
            };
        }
        widest.unwrap_or(ColumnType::Text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub kind: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: ColumnType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

pub type Row = Vec<Value>;

/// Row arity did not match the schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArityMismatch {
    pub expected: usize,
    pub actual: usize,
}

impl fmt::Display for ArityMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "row has {} cells, schema has {} columns",
            self.actual, self.expected
        )
    }
}

impl std::error::Error for ArityMismatch {}

// =============================================================================
// TABLE
// =============================================================================

/// Ordered rows over a fixed schema.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<Column>,
    rows: Vec<Row>,
}

impl Table {
    /// Build from column names and rows, inferring column types from the data.
    pub fn from_rows(names: Vec<String>, rows: Vec<Row>) -> Result<Self, ArityMismatch> {
        if let Some(bad) = rows.iter().find(|r| r.len() != names.len()) {
            return Err(ArityMismatch {
                expected: names.len(),
                actual: bad.len(),
            });
        }
        let columns = names
            .into_iter()
            .enumerate()
            .map(|(i, name)| {
                let kind = ColumnType::infer(rows.iter().map(|r| &r[i]));
                Column::new(name, kind)
            })
            .collect();
        Ok(Self { columns, rows })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Single cell of the first row (for aggregate results).
    pub fn scalar(&self) -> Option<&Value> {
        self.rows.first().and_then(|r| r.first())
    }

    /// Same schema, only the rows matching `keep`.
    pub fn filter_rows(&self, mut keep: impl FnMut(&Row) -> bool) -> Table {
        Table {
            columns: self.columns.clone(),
            rows: self.rows.iter().filter(|r| keep(r)).cloned().collect(),
        }
    }

    /// Rewrite one column in place. The column type is updated to `kind`.
    pub(crate) fn map_column<E>(
        &mut self,
        index: usize,
        kind: ColumnType,
        mut f: impl FnMut(usize, &Value) -> Result<Value, E>,
    ) -> Result<(), E> {
        let mut rewritten = Vec::with_capacity(self.rows.len());
        for (i, row) in self.rows.iter().enumerate() {
            rewritten.push(f(i, &row[index])?);
        }
        for (row, v) in self.rows.iter_mut().zip(rewritten) {
            row[index] = v;
        }
        self.columns[index].kind = kind;
        Ok(())
    }

    /// Rows as JSON objects keyed by column name.
    pub fn to_json_records(&self) -> Vec<serde_json::Map<String, serde_json::Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .zip(row)
                    .map(|(c, v)| (c.name.clone(), v.to_json()))
                    .collect()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cell_narrowest() {
        assert_eq!(Value::parse_cell("42"), Value::Integer(42));
        assert_eq!(Value::parse_cell(" 1.5 "), Value::Real(1.5));
        assert_eq!(Value::parse_cell(""), Value::Null);
        assert_eq!(
            Value::parse_cell("2025-02-01 00:00:00"),
            Value::Text("2025-02-01 00:00:00".into())
        );
        // NaN/inf stay text so they never reach a REAL column
        assert_eq!(Value::parse_cell("inf"), Value::Text("inf".into()));
    }

    #[test]
    fn test_infer_widens() {
        let ints = [Value::Integer(1), Value::Null, Value::Integer(2)];
        assert_eq!(ColumnType::infer(ints.iter()), ColumnType::Integer);

        let mixed = [Value::Integer(1), Value::Real(2.5)];
        assert_eq!(ColumnType::infer(mixed.iter()), ColumnType::Real);

        let text = [Value::Real(2.5), Value::Text("x".into())];
        assert_eq!(ColumnType::infer(text.iter()), ColumnType::Text);

        assert_eq!(
            ColumnType::infer(std::iter::empty::<&Value>()),
            ColumnType::Text
        );
    }

    #[test]
    fn test_from_rows_rejects_ragged() {
        let err = Table::from_rows(
            vec!["a".into(), "b".into()],
            vec![vec![Value::Integer(1)]],
        )
        .unwrap_err();
        assert_eq!(err.expected, 2);
        assert_eq!(err.actual, 1);
    }

    #[test]
    fn test_filter_keeps_schema() {
        let table = Table::from_rows(
            vec!["id".into()],
            (0..5).map(|i| vec![Value::Integer(i)]).collect(),
        )
        .unwrap();
        let even = table.filter_rows(|r| r[0].as_i64().unwrap() % 2 == 0);
        assert_eq!(even.len(), 3);
        assert_eq!(even.columns(), table.columns());
    }

    #[test]
    fn test_json_records() {
        let table = Table::from_rows(
            vec!["id".into(), "name".into()],
            vec![vec![Value::Integer(7), Value::Text("alice".into())]],
        )
        .unwrap();
        let records = table.to_json_records();
        assert_eq!(records[0]["id"], serde_json::json!(7));
        assert_eq!(records[0]["name"], serde_json::json!("alice"));
    }
}
