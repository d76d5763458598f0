//! Simulated Time
//!
//! Simulated time is a naive calendar timestamp, matching the historical
//! dataset which carries no time zone. Every timestamp column is rewritten
//! to one canonical fixed-width text form on seeding:
//!
//! ```text
//! YYYY-MM-DD HH:MM:SS.ffffff
//! ```
//!
//! Fixed width means lexicographic order equals time order, so the store can
//! filter windows with plain bound-parameter comparisons.
//!
//! Windows are half-open: `[start, end)`. A row at exactly `end` belongs to
//! the next window.

use super::table::{ColumnType, Table, Value};
use chrono::{DateTime, Duration, Months, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Simulated wall time.
pub type SimTime = NaiveDateTime;

/// Canonical storage format (fixed width, sortable).
pub const CANONICAL_TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%Y/%m/%d %H:%M:%S",
];

/// Render a timestamp in canonical form.
#[inline]
pub fn format_ts(ts: &SimTime) -> String {
    ts.format(CANONICAL_TS_FORMAT).to_string()
}

/// Parse any supported textual timestamp.
pub fn parse_ts(s: &str) -> Option<SimTime> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(ts);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Interpret a cell as a timestamp. Integers are Unix seconds.
/// `Ok(None)` for null cells, `Err(())` for anything unparseable.
pub fn value_to_ts(value: &Value) -> Result<Option<SimTime>, ()> {
    match value {
        Value::Null => Ok(None),
        Value::Text(s) => parse_ts(s).map(Some).ok_or(()),
        Value::Integer(secs) => DateTime::from_timestamp(*secs, 0)
            .map(|dt| Some(dt.naive_utc()))
            .ok_or(()),
        Value::Real(_) => Err(()),
    }
}

/// A cell in a timestamp column that could not be parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct TimestampFormatError {
    pub column: String,
    pub row: usize,
    pub value: Value,
}

impl fmt::Display for TimestampFormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unparseable timestamp {:?} in column {} at row {}",
            self.value.to_string(),
            self.column,
            self.row
        )
    }
}

impl std::error::Error for TimestampFormatError {}

/// Rewrite `column` of `table` into canonical text form.
///
/// Fails on the first unparseable cell and leaves the table untouched.
pub fn normalize_timestamp_column(
    table: &mut Table,
    column: &str,
) -> Result<(), TimestampFormatError> {
    let Some(index) = table.column_index(column) else {
        return Ok(());
    };
    table.map_column(index, ColumnType::Text, |row, v| match value_to_ts(v) {
        Ok(Some(ts)) => Ok(Value::Text(format_ts(&ts))),
        Ok(None) => Ok(Value::Null),
        Err(()) => Err(TimestampFormatError {
            column: column.to_string(),
            row,
            value: v.clone(),
        }),
    })
}

/// Smallest instant after `ts` at canonical (microsecond) precision.
pub fn next_instant(ts: SimTime) -> Option<SimTime> {
    ts.checked_add_signed(Duration::microseconds(1))
}

/// Serde adapter writing `SimTime` in canonical form.
pub mod canonical {
    use super::{format_ts, parse_ts, SimTime};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &SimTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_ts(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SimTime, D::Error> {
        let raw = String::deserialize(d)?;
        parse_ts(&raw).ok_or_else(|| serde::de::Error::custom(format!("bad timestamp {:?}", raw)))
    }
}

// =============================================================================
// WINDOWS
// =============================================================================

/// Length of the initial (seed) window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowSpan {
    /// Calendar months: `2025-01-31 + 1 month = 2025-02-28`.
    Months(u32),
    Days(i64),
    Hours(i64),
}

impl Default for WindowSpan {
    fn default() -> Self {
        WindowSpan::Months(1)
    }
}

impl WindowSpan {
    /// Exclusive end of the window starting at `start`.
    pub fn end_from(&self, start: SimTime) -> Option<SimTime> {
        match *self {
            WindowSpan::Months(n) => start.checked_add_months(Months::new(n)),
            WindowSpan::Days(n) => start.checked_add_signed(Duration::try_days(n)?),
            WindowSpan::Hours(n) => start.checked_add_signed(Duration::try_hours(n)?),
        }
    }
}

impl fmt::Display for WindowSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowSpan::Months(n) => write!(f, "{}mo", n),
            WindowSpan::Days(n) => write!(f, "{}d", n),
            WindowSpan::Hours(n) => write!(f, "{}h", n),
        }
    }
}

/// Half-open time range `[start, end)`. Either side may be open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeRange {
    pub start: Option<SimTime>,
    pub end: Option<SimTime>,
}

impl TimeRange {
    pub fn between(start: SimTime, end: SimTime) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn before(end: SimTime) -> Self {
        Self {
            start: None,
            end: Some(end),
        }
    }

    #[inline]
    pub fn contains(&self, ts: &SimTime) -> bool {
        self.start.map_or(true, |s| *ts >= s) && self.end.map_or(true, |e| *ts < e)
    }
}

// =============================================================================
// SPANS
// =============================================================================

/// Parse a compact span such as `7d`, `36h`, `1d12h`, `90m`, `2w`.
pub fn parse_span(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty span".to_string());
    }

    let mut total = Duration::zero();
    let mut digits = String::new();
    for ch in s.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let n: i64 = digits
            .parse()
            .map_err(|_| format!("span {:?}: expected a number before '{}'", s, ch))?;
        digits.clear();
        let part = match ch {
            'w' => Duration::try_weeks(n),
            'd' => Duration::try_days(n),
            'h' => Duration::try_hours(n),
            'm' => Duration::try_minutes(n),
            's' => Duration::try_seconds(n),
            other => return Err(format!("span {:?}: unknown unit '{}'", s, other)),
        }
        .ok_or_else(|| format!("span {:?}: {}{} is out of range", s, n, ch))?;
        total = total
            .checked_add(&part)
            .ok_or_else(|| format!("span {:?} overflows", s))?;
    }
    if !digits.is_empty() {
        return Err(format!("span {:?}: missing unit after {}", s, digits));
    }
    Ok(total)
}

/// Render a duration back into compact span form.
pub fn format_span(d: &Duration) -> String {
    let mut secs = d.num_seconds();
    if secs == 0 {
        return "0s".to_string();
    }
    let mut out = String::new();
    if secs < 0 {
        out.push('-');
        secs = -secs;
    }
    for (unit, size) in [('d', 86_400), ('h', 3_600), ('m', 60), ('s', 1)] {
        if secs >= size {
            out.push_str(&format!("{}{}", secs / size, unit));
            secs %= size;
        }
    }
    out
}
