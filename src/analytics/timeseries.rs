//! Hourly detection-activity series
//!
//! Three independent hourly counts over the live tables:
//!
//! | series         | source                                              |
//! |----------------|-----------------------------------------------------|
//! | `WASH_TRADING` | trades within N hours after a reward, same account  |
//! | `FUNDING_FEE`  | funding rows with a non-zero fee                    |
//! | `COOPERATIVE`  | distinct positions in hours with >1 trading account |
//!
//! Hours are bucketed on the canonical timestamp text (`YYYY-MM-DD HH`).
//! A series whose tables or columns are missing is skipped and reported;
//! the others are still returned.

use super::AnalyticsConfig;
use crate::simulation::{parse_ts, LiveView, Table, Value};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Series {
    WashTrading,
    FundingFee,
    Cooperative,
}

impl Series {
    pub fn label(&self) -> &'static str {
        match self {
            Series::WashTrading => "WASH_TRADING",
            Series::FundingFee => "FUNDING_FEE",
            Series::Cooperative => "COOPERATIVE",
        }
    }
}

/// One hour bucket. `time` is the bucket start in Unix milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TimeseriesPoint {
    pub time: i64,
    #[serde(rename = "WASH_TRADING")]
    pub wash_trading: u64,
    #[serde(rename = "FUNDING_FEE")]
    pub funding_fee: u64,
    #[serde(rename = "COOPERATIVE")]
    pub cooperative: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedSeries {
    pub series: Series,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Timeseries {
    pub points: Vec<TimeseriesPoint>,
    pub skipped: Vec<SkippedSeries>,
}

const WASH_SQL: &str = r#"
SELECT substr(t."ts", 1, 13) AS hour, COUNT(*) AS count
FROM "Trade" t
INNER JOIN "Reward" r ON t."account_id" = r."account_id"
WHERE julianday(t."ts") > julianday(r."ts")
  AND julianday(t."ts") <= julianday(r."ts") + ?1 / 24.0
GROUP BY hour
"#;

const FUNDING_SQL: &str = r#"
SELECT substr("ts", 1, 13) AS hour, COUNT(*) AS count
FROM "Funding"
WHERE "funding_fee" != 0
GROUP BY hour
"#;

const COOPERATIVE_SQL: &str = r#"
SELECT substr("ts", 1, 13) AS hour, COUNT(DISTINCT "position_id") AS count
FROM "Trade"
WHERE "position_id" IS NOT NULL
GROUP BY hour
HAVING COUNT(DISTINCT "account_id") > 1
"#;

/// `(hour start ms, count)` pairs from a `hour, count` result.
fn hour_counts(table: &Table) -> Vec<(i64, u64)> {
    table
        .rows()
        .iter()
        .filter_map(|row| {
            let hour = row.first()?.as_text()?;
            let count = row.get(1)?.as_i64()?;
            let start = parse_ts(&format!("{}:00:00", hour))?;
            Some((start.and_utc().timestamp_millis(), count.max(0) as u64))
        })
        .collect()
}

pub fn hourly_timeseries(view: &LiveView, cfg: &AnalyticsConfig) -> Timeseries {
    let divisor = cfg.cooperative_divisor.max(1);
    let queries: [(Series, &str, Vec<Value>); 3] = [
        (
            Series::WashTrading,
            WASH_SQL,
            vec![Value::Real(cfg.wash_window_hours)],
        ),
        (Series::FundingFee, FUNDING_SQL, Vec::new()),
        (Series::Cooperative, COOPERATIVE_SQL, Vec::new()),
    ];

    let mut buckets: BTreeMap<i64, TimeseriesPoint> = BTreeMap::new();
    let mut skipped = Vec::new();

    for (series, sql, params) in queries {
        let table = match view.query_sql(sql, &params) {
            Ok(table) => table,
            Err(e) => {
                warn!(series = series.label(), error = %e, "Timeseries query failed");
                skipped.push(SkippedSeries {
                    series,
                    reason: e.to_string(),
                });
                continue;
            }
        };
        for (time, count) in hour_counts(&table) {
            let point = buckets.entry(time).or_insert_with(|| TimeseriesPoint {
                time,
                ..Default::default()
            });
            match series {
                Series::WashTrading => point.wash_trading += count,
                Series::FundingFee => point.funding_fee += count,
                Series::Cooperative => point.cooperative += (count / divisor).max(1),
            }
        }
    }

    Timeseries {
        points: buckets.into_values().collect(),
        skipped,
    }
}
