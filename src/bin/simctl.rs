//! Simulation operator CLI
//!
//! Drives the same store file the server uses. Every command prints JSON
//! on stdout; logs go to stderr.
//!
//! Usage:
//!   cargo run --bin simctl -- --db-path ./data/simulation.db seed --epoch 2025-02-01
//!   cargo run --bin simctl -- advance --span 36h
//!   cargo run --bin simctl -- query --table Trade --limit 20

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tradewatch_backend::{
    analytics::{hourly_timeseries, table_summaries},
    simulation::{parse_span, parse_ts, SimTime, WindowManager, WindowSpan},
    SimConfig,
};

/// Operate the simulated-time store
#[derive(Parser, Debug)]
#[command(name = "simctl")]
#[command(about = "Seed, advance and inspect the simulated exchange dataset")]
struct Cli {
    /// Config file (TOML)
    #[arg(short, long, env = "SIM_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// SQLite store; overrides `db_path` from the config
    #[arg(short, long, env = "SIM_DB_PATH")]
    db_path: Option<String>,

    /// Source dataset path; overrides `[source] path`
    #[arg(short, long, env = "SIM_SOURCE_PATH")]
    source: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Materialize full tables and the initial live window
    Seed(SeedArgs),

    /// Move the clock forward and reveal the rows it passes
    Advance {
        /// Span such as 7d, 36h, 1d12h (defaults to `default_advance`)
        #[arg(long)]
        span: Option<String>,
    },

    /// Discard live state and seed again
    Reset(SeedArgs),

    /// Current simulated time and state
    Status,

    /// Live table summaries
    Tables,

    /// Rows of one live table
    Query {
        #[arg(short, long)]
        table: String,

        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Hourly detection-activity series
    Timeseries,
}

#[derive(clap::Args, Debug)]
struct SeedArgs {
    /// Window start (defaults to `default_epoch`)
    #[arg(long)]
    epoch: Option<String>,

    /// Window length in calendar months
    #[arg(long, conflicts_with = "days")]
    months: Option<u32>,

    /// Window length in days
    #[arg(long)]
    days: Option<i64>,
}

impl SeedArgs {
    fn epoch(&self, config: &SimConfig) -> Result<SimTime> {
        match &self.epoch {
            Some(raw) => parse_ts(raw).with_context(|| format!("Invalid epoch {:?}", raw)),
            None => config.epoch(),
        }
    }

    fn apply_window(&self, manager: &mut WindowManager) -> Result<()> {
        match (self.months, self.days) {
            (Some(m), _) if m > 0 => manager.set_window(WindowSpan::Months(m)),
            (_, Some(d)) if d > 0 => manager.set_window(WindowSpan::Days(d)),
            (None, None) => {}
            _ => anyhow::bail!("window length must be positive"),
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let mut config = SimConfig::load_or_env(cli.config.as_deref())?;
    if let Some(db_path) = cli.db_path {
        config.db_path = db_path;
    }
    if let Some(source) = cli.source {
        config.source.path = source;
    }

    let mut manager = config.build_manager()?;

    match cli.command {
        Commands::Seed(args) => {
            args.apply_window(&mut manager)?;
            let report = manager.seed(args.epoch(&config)?)?;
            print_json(&report)?;
        }
        Commands::Reset(args) => {
            args.apply_window(&mut manager)?;
            let report = manager.reset(args.epoch(&config)?)?;
            print_json(&report)?;
        }
        Commands::Advance { span } => {
            let span = match span {
                Some(raw) => parse_span(&raw).map_err(|e| anyhow::anyhow!("--span: {}", e))?,
                None => config.advance_span()?,
            };
            let report = manager.advance_by(span)?;
            print_json(&report)?;
        }
        Commands::Status => print_json(&manager.status())?,
        Commands::Tables => print_json(&table_summaries(&manager.live_view())?)?,
        Commands::Query { table, limit } => {
            let rows = manager.live_view().rows(&table, limit)?;
            print_json(&rows.to_json_records())?;
        }
        Commands::Timeseries => {
            print_json(&hourly_timeseries(&manager.live_view(), &config.analytics))?
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradewatch_backend=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
