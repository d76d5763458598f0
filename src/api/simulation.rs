//! Simulation API Endpoints
//!
//! # Endpoints
//!
//! - `GET  /health`
//! - `GET  /api/simulation/status` - `{current_time, state, error?}`
//! - `POST /api/simulation/advance` - body `{days?, hours?}`
//! - `POST /api/simulation/reset` - body `{year?, month?, epoch?}`
//! - `GET  /api/simulation/tables` - live table summaries
//! - `GET  /api/tables/:name?limit=` - rows of one live table
//! - `GET  /api/timeseries` - hourly detection activity
//!
//! All store access runs on the blocking pool. Mutations go through the one
//! `WindowManager` mutex, so seed/advance/reset never overlap.

use crate::analytics::{hourly_timeseries, table_summaries, AnalyticsConfig};
use crate::simulation::{
    format_ts, parse_ts, LiveView, SimTime, SimulationError, StoreError, WindowManager,
};
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State as AxumState},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{Duration, NaiveDate};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const DEFAULT_ROW_LIMIT: usize = 100;
const MAX_ROW_LIMIT: usize = 10_000;

/// Shared state for the simulation API.
pub struct SimulationState {
    pub manager: Arc<Mutex<WindowManager>>,
    pub view: LiveView,
    pub default_epoch: SimTime,
    pub default_advance: Duration,
    pub analytics: AnalyticsConfig,
}

impl SimulationState {
    pub fn new(
        manager: WindowManager,
        default_epoch: SimTime,
        default_advance: Duration,
        analytics: AnalyticsConfig,
    ) -> Self {
        let view = manager.live_view();
        Self {
            manager: Arc::new(Mutex::new(manager)),
            view,
            default_epoch,
            default_advance,
            analytics,
        }
    }
}

// =============================================================================
// RESPONSE HELPERS
// =============================================================================

fn error_response(status: StatusCode, message: &str) -> Response {
    let body = serde_json::json!({ "error": message });
    (status, Json(body)).into_response()
}

fn simulation_error_response(e: &SimulationError) -> Response {
    let status = match e {
        SimulationError::InvalidDuration(_) => StatusCode::BAD_REQUEST,
        SimulationError::NotSeeded => StatusCode::CONFLICT,
        SimulationError::UnknownTable(_) => StatusCode::NOT_FOUND,
        SimulationError::SourceUnavailable(_) | SimulationError::StoreUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    };
    error_response(status, &e.to_string())
}

fn store_error_response(e: &StoreError) -> Response {
    let status = match e {
        StoreError::UnknownTable(_) | StoreError::InvalidIdentifier(_) => StatusCode::NOT_FOUND,
        StoreError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, &e.to_string())
}

/// A JSON body that may be left out entirely. A body that is present but
/// malformed is a 400, never the defaults.
fn optional_body<T: Default>(body: Result<Json<T>, JsonRejection>) -> Result<T, Response> {
    match body {
        Ok(Json(value)) => Ok(value),
        Err(JsonRejection::MissingJsonContentType(_)) => Ok(T::default()),
        Err(e) => Err(error_response(StatusCode::BAD_REQUEST, &e.body_text())),
    }
}

/// Run blocking store work off the async runtime.
async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> T + Send + 'static,
) -> Result<T, Response> {
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        warn!("Blocking task failed: {}", e);
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal task failure")
    })
}

// =============================================================================
// HEALTH / STATUS
// =============================================================================

/// GET /health
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "service": "tradewatch" }))
}

/// GET /api/simulation/status - never fails; store trouble reports `error`
pub async fn get_status(AxumState(state): AxumState<Arc<SimulationState>>) -> Response {
    let manager = Arc::clone(&state.manager);
    match blocking(move || manager.lock().status()).await {
        Ok(status) => Json(status).into_response(),
        Err(response) => response,
    }
}

// =============================================================================
// ADVANCE / RESET
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct AdvanceRequest {
    pub days: Option<i64>,
    pub hours: Option<i64>,
}

impl AdvanceRequest {
    fn span(&self, default: Duration) -> Result<Duration, SimulationError> {
        if self.days.is_none() && self.hours.is_none() {
            return Ok(default);
        }
        let (days, hours) = (self.days.unwrap_or(0), self.hours.unwrap_or(0));
        Duration::try_days(days)
            .zip(Duration::try_hours(hours))
            .and_then(|(d, h)| d.checked_add(&h))
            .ok_or_else(|| {
                SimulationError::InvalidDuration(format!(
                    "{} days {} hours is out of range",
                    days, hours
                ))
            })
    }
}

/// POST /api/simulation/advance
pub async fn advance(
    AxumState(state): AxumState<Arc<SimulationState>>,
    body: Result<Json<AdvanceRequest>, JsonRejection>,
) -> Response {
    let request = match optional_body(body) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let span = match request.span(state.default_advance) {
        Ok(span) => span,
        Err(e) => return simulation_error_response(&e),
    };
    let manager = Arc::clone(&state.manager);

    match blocking(move || manager.lock().advance_by(span)).await {
        Ok(Ok(report)) => Json(report).into_response(),
        Ok(Err(e)) => {
            warn!("Advance failed: {}", e);
            simulation_error_response(&e)
        }
        Err(response) => response,
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ResetRequest {
    pub year: Option<i32>,
    pub month: Option<u32>,
    /// Any accepted timestamp form; wins over year/month.
    pub epoch: Option<String>,
}

impl ResetRequest {
    fn epoch(&self, default: SimTime) -> Result<SimTime, String> {
        if let Some(raw) = &self.epoch {
            return parse_ts(raw).ok_or_else(|| format!("epoch {:?} is not a timestamp", raw));
        }
        match (self.year, self.month) {
            (None, None) => Ok(default),
            (Some(year), month) => NaiveDate::from_ymd_opt(year, month.unwrap_or(1), 1)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .ok_or_else(|| format!("invalid year/month {}/{}", year, month.unwrap_or(1))),
            (None, Some(_)) => Err("month requires year".to_string()),
        }
    }
}

/// POST /api/simulation/reset
pub async fn reset(
    AxumState(state): AxumState<Arc<SimulationState>>,
    body: Result<Json<ResetRequest>, JsonRejection>,
) -> Response {
    let request = match optional_body(body) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let epoch = match request.epoch(state.default_epoch) {
        Ok(epoch) => epoch,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, &message),
    };
    let manager = Arc::clone(&state.manager);

    match blocking(move || manager.lock().reset(epoch)).await {
        Ok(Ok(report)) => Json(report).into_response(),
        Ok(Err(e)) => {
            warn!("Reset to {} failed: {}", format_ts(&epoch), e);
            simulation_error_response(&e)
        }
        Err(response) => response,
    }
}

// =============================================================================
// LIVE DATA
// =============================================================================

/// GET /api/simulation/tables
pub async fn list_tables(AxumState(state): AxumState<Arc<SimulationState>>) -> Response {
    let view = state.view.clone();
    match blocking(move || table_summaries(&view)).await {
        Ok(Ok(summaries)) => Json(summaries).into_response(),
        Ok(Err(e)) => {
            warn!("Failed to summarize tables: {}", e);
            store_error_response(&e)
        }
        Err(response) => response,
    }
}

#[derive(Debug, Deserialize)]
pub struct RowsQuery {
    pub limit: Option<usize>,
}

/// GET /api/tables/:name?limit=
pub async fn get_table_rows(
    AxumState(state): AxumState<Arc<SimulationState>>,
    Path(name): Path<String>,
    Query(query): Query<RowsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_ROW_LIMIT).min(MAX_ROW_LIMIT);
    let view = state.view.clone();
    let table_name = name.clone();

    match blocking(move || view.rows(&table_name, limit)).await {
        Ok(Ok(table)) => Json(serde_json::json!({
            "table": name,
            "columns": table.column_names(),
            "count": table.len(),
            "rows": table.to_json_records(),
        }))
        .into_response(),
        Ok(Err(e)) => {
            warn!("Failed to read table {}: {}", name, e);
            store_error_response(&e)
        }
        Err(response) => response,
    }
}

/// GET /api/timeseries
pub async fn get_timeseries(AxumState(state): AxumState<Arc<SimulationState>>) -> Response {
    let view = state.view.clone();
    let cfg = state.analytics.clone();
    match blocking(move || hourly_timeseries(&view, &cfg)).await {
        Ok(series) => Json(series).into_response(),
        Err(response) => response,
    }
}

// =============================================================================
// ROUTER / BACKGROUND
// =============================================================================

pub fn simulation_router() -> Router<Arc<SimulationState>> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/simulation/status", get(get_status))
        .route("/api/simulation/advance", post(advance))
        .route("/api/simulation/reset", post(reset))
        .route("/api/simulation/tables", get(list_tables))
        .route("/api/tables/:name", get(get_table_rows))
        .route("/api/timeseries", get(get_timeseries))
}

/// Advance by `span` every `every`. Aborting the handle only stops
/// scheduling: an advance already on the blocking pool runs to completion.
pub fn spawn_auto_advance(
    state: Arc<SimulationState>,
    every: std::time::Duration,
    span: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let manager = Arc::clone(&state.manager);
            match tokio::task::spawn_blocking(move || manager.lock().advance_by(span)).await {
                Ok(Ok(report)) => info!(
                    current_time = %format_ts(&report.current_time),
                    rows = report.total_appended(),
                    "Auto-advance"
                ),
                Ok(Err(e)) => warn!("Auto-advance failed: {}", e),
                Err(e) => warn!("Auto-advance task failed: {}", e),
            }
        }
    })
}
