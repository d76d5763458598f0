//! Simulation configuration
//!
//! One TOML file drives both the server and the operator CLI. Every field
//! has a default, so an absent or partial file is fine.
//!
//! ```toml
//! db_path = "data/simulation.db"
//! default_epoch = "2025-02-01"
//! default_advance = "7d"
//!
//! [source]
//! kind = "csv_dir"        # or "json"
//! path = "data/source"
//!
//! [timestamp_columns]
//! Trade = "ts"
//! Spec = "day"
//!
//! [window]
//! months = 1              # or days = 14
//! ```

use crate::analytics::AnalyticsConfig;
use crate::simulation::{
    parse_span, parse_ts, CsvDirectoryLoader, JsonFileLoader, PersistentStore, SimTime,
    SourceDataset, SqliteStore, StoreSettings, TimestampRegistry, WindowManager, WindowSpan,
};
use crate::simulation::registry::default_timestamp_columns;
use anyhow::{anyhow, bail, Context};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "SIM_CONFIG_PATH";
const DEFAULT_CONFIG_PATH: &str = "simulation.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    /// SQLite file holding full, live and metadata tables
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default)]
    pub source: SourceConfig,

    /// Table -> event-time column. Tables not listed are exposed in full.
    #[serde(default = "default_timestamp_map")]
    pub timestamp_columns: BTreeMap<String, String>,

    #[serde(default)]
    pub window: WindowConfig,

    /// Epoch used on first start and by a bare `reset`
    #[serde(default = "default_epoch")]
    pub default_epoch: String,

    /// Span used by a bare `advance`
    #[serde(default = "default_advance")]
    pub default_advance: String,

    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub analytics: AnalyticsConfig,
}

fn default_db_path() -> String {
    "data/simulation.db".to_string()
}
fn default_timestamp_map() -> BTreeMap<String, String> {
    default_timestamp_columns()
        .into_iter()
        .map(|(t, c)| (t.to_string(), c.to_string()))
        .collect()
}
fn default_epoch() -> String {
    "2025-02-01".to_string()
}
fn default_advance() -> String {
    "7d".to_string()
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            source: SourceConfig::default(),
            timestamp_columns: default_timestamp_map(),
            window: WindowConfig::default(),
            default_epoch: default_epoch(),
            default_advance: default_advance(),
            store: StoreSettings::default(),
            server: ServerConfig::default(),
            analytics: AnalyticsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Directory of `<Table>.csv` files
    CsvDir,
    /// One JSON document `{ "<Table>": [ {..}, .. ] }`
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub path: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::CsvDir,
            path: "data/source".to_string(),
        }
    }
}

/// Initial window length. Set at most one of the two.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub months: Option<u32>,
    pub days: Option<i64>,
}

impl WindowConfig {
    pub fn span(&self) -> anyhow::Result<WindowSpan> {
        match (self.months, self.days) {
            (Some(_), Some(_)) => bail!("[window] sets both months and days"),
            (Some(0), None) | (None, Some(0)) => bail!("[window] span must be positive"),
            (None, Some(d)) if d < 0 => bail!("[window] span must be positive"),
            (Some(m), None) => Ok(WindowSpan::Months(m)),
            (None, Some(d)) => Ok(WindowSpan::Days(d)),
            (None, None) => Ok(WindowSpan::default()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Advance automatically every N seconds (off when unset)
    pub auto_advance_secs: Option<u64>,
    pub auto_advance_span: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
            auto_advance_secs: None,
            auto_advance_span: "1h".to_string(),
        }
    }
}

impl SimConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Load from `SIM_CONFIG_PATH` (or `simulation.toml`), defaults if absent
    pub fn from_env() -> Self {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default simulation config ({}): {:#}", path, e);
            Self::default()
        })
    }

    /// Explicit path must exist; otherwise behave like `from_env`
    pub fn load_or_env(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::from_env()),
        }
    }

    /// Save to TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn registry(&self) -> anyhow::Result<TimestampRegistry> {
        TimestampRegistry::from_map(&self.timestamp_columns)
            .map_err(|e| anyhow!("[timestamp_columns]: {}", e))
    }

    pub fn epoch(&self) -> anyhow::Result<SimTime> {
        parse_ts(&self.default_epoch)
            .ok_or_else(|| anyhow!("default_epoch {:?} is not a timestamp", self.default_epoch))
    }

    pub fn advance_span(&self) -> anyhow::Result<chrono::Duration> {
        parse_span(&self.default_advance).map_err(|e| anyhow!("default_advance: {}", e))
    }

    pub fn auto_advance_span(&self) -> anyhow::Result<chrono::Duration> {
        parse_span(&self.server.auto_advance_span)
            .map_err(|e| anyhow!("server.auto_advance_span: {}", e))
    }

    pub fn source_dataset(&self) -> SourceDataset {
        match self.source.kind {
            SourceKind::CsvDir => SourceDataset::new(CsvDirectoryLoader::new(&self.source.path)),
            SourceKind::Json => SourceDataset::new(JsonFileLoader::new(&self.source.path)),
        }
    }

    pub fn open_store(&self) -> anyhow::Result<SqliteStore> {
        SqliteStore::open(&self.db_path, self.store.clone())
            .with_context(|| format!("Failed to open simulation store at {}", self.db_path))
    }

    /// Wire store, source and registry into a manager.
    pub fn build_manager(&self) -> anyhow::Result<WindowManager> {
        let store: Arc<dyn PersistentStore> = Arc::new(self.open_store()?);
        Ok(WindowManager::new(
            store,
            Arc::new(self.source_dataset()),
            self.registry()?,
            self.window.span()?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SimConfig::default();
        assert_eq!(config.db_path, "data/simulation.db");
        assert_eq!(config.timestamp_columns.get("Spec").map(String::as_str), Some("day"));
        assert_eq!(config.window.span().unwrap(), WindowSpan::Months(1));
        assert_eq!(config.epoch().unwrap(), parse_ts("2025-02-01").unwrap());
        assert_eq!(config.advance_span().unwrap(), chrono::Duration::days(7));
        assert_eq!(config.store.retry_attempts, 3);
        assert_eq!(config.analytics.cooperative_divisor, 10);
        assert!(config.server.auto_advance_secs.is_none());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: SimConfig = toml::from_str(
            r#"
            db_path = "/tmp/sim.db"

            [source]
            kind = "json"
            path = "dataset.json"

            [window]
            days = 14

            [store]
            retry_attempts = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.db_path, "/tmp/sim.db");
        assert_eq!(config.source.kind, SourceKind::Json);
        assert_eq!(config.window.span().unwrap(), WindowSpan::Days(14));
        assert_eq!(config.store.retry_attempts, 5);
        assert_eq!(config.store.busy_timeout_ms, 2000);
        assert_eq!(config.timestamp_columns.len(), 5);
        assert_eq!(config.default_advance, "7d");
    }

    #[test]
    fn test_window_validation() {
        let both = WindowConfig {
            months: Some(1),
            days: Some(3),
        };
        assert!(both.span().is_err());
        let zero = WindowConfig {
            months: None,
            days: Some(0),
        };
        assert!(zero.span().is_err());
    }

    #[test]
    fn test_bad_values_are_reported() {
        let config = SimConfig {
            default_epoch: "someday".into(),
            default_advance: "7 parsecs".into(),
            ..Default::default()
        };
        assert!(config.epoch().is_err());
        assert!(config.advance_span().is_err());

        let mut config = SimConfig::default();
        config.timestamp_columns.insert("Bad Table!".into(), "ts".into());
        assert!(config.registry().is_err());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("simulation.toml");
        let mut config = SimConfig::default();
        config.server.auto_advance_secs = Some(30);
        config.save(&path).unwrap();

        let loaded = SimConfig::load(&path).unwrap();
        assert_eq!(loaded.server.auto_advance_secs, Some(30));
        assert_eq!(loaded.timestamp_columns, config.timestamp_columns);
        assert!(SimConfig::load(dir.path().join("missing.toml")).is_err());
    }
}
