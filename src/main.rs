//! TradeWatch - simulated live exchange data for the detection dashboard
//!
//! Startup resumes the persisted simulation (or seeds a fresh store at the
//! configured epoch), then serves the REST surface. Time moves only when a
//! client calls advance, or on the optional auto-advance timer.

use anyhow::{Context, Result};
use dotenv::dotenv;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tradewatch_backend::{
    api::{simulation_router, spawn_auto_advance, SimulationState},
    simulation::{format_ts, StartupOutcome},
    SimConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    let config = SimConfig::from_env();
    let epoch = config.epoch()?;
    let default_advance = config.advance_span()?;
    info!(
        db_path = %config.db_path,
        source = %config.source.path,
        "Starting TradeWatch simulation server"
    );

    let mut manager = config.build_manager()?;
    let (manager, outcome) = tokio::task::spawn_blocking(move || {
        let outcome = manager.ensure_seeded(epoch);
        (manager, outcome)
    })
    .await
    .context("Startup task failed")?;

    match outcome.context("Failed to initialize simulation")? {
        StartupOutcome::Resumed(clock) => info!(
            current_time = %format_ts(&clock.current_time),
            "Simulation resumed"
        ),
        StartupOutcome::Seeded(report) => {
            for warning in &report.warnings {
                warn!(table = %warning.table, kind = ?warning.kind, "{}", warning.detail);
            }
            info!(
                current_time = %format_ts(&report.current_time),
                tables = report.tables.len(),
                "Simulation seeded"
            );
        }
    }

    let state = Arc::new(SimulationState::new(
        manager,
        epoch,
        default_advance,
        config.analytics.clone(),
    ));

    if let Some(secs) = config.server.auto_advance_secs.filter(|s| *s > 0) {
        let span = config.auto_advance_span()?;
        info!("Auto-advance every {}s by {}", secs, config.server.auto_advance_span);
        spawn_auto_advance(Arc::clone(&state), Duration::from_secs(secs), span);
    }

    let app = simulation_router()
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    info!("API server listening on {}", config.server.bind);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradewatch_backend=info,tradewatch=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
