use anyhow::{Context, Result};
use common::telemetry::LoggingConfig;
use config::{Config, Environment, File};
use event_prediction::PredictionConfig;
use market_impact::{AnalyzerConfig, MarketDataConfig};
use outbox_relay::{BrokerConfig, RelayConfig};
use serde::Deserialize;
use std::time::Duration;

pub const ENV_PREFIX: &str = "EVENT_INTEL";

/// Service configuration: optional TOML file, then `EVENT_INTEL__*` variables
/// (`EVENT_INTEL__DATABASE__URL`, `EVENT_INTEL__RELAY__BATCH_SIZE`, ...).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub market_data: MarketDataConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub prediction: PredictionConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

impl Settings {
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        settings.analyzer.validate()?;
        settings.prediction.validate()?;
        Ok(settings)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_database_url() -> String {
    "postgres://localhost/event_intel".to_string()
}

fn default_max_connections() -> u32 {
    10
}

/// Neo4j causal graph; predictions run without graph context when disabled
#[derive(Debug, Clone, Deserialize)]
pub struct GraphConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_graph_uri")]
    pub uri: String,
    #[serde(default = "default_graph_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            uri: default_graph_uri(),
            user: default_graph_user(),
            password: String::new(),
        }
    }
}

fn default_graph_uri() -> String {
    "127.0.0.1:7687".to_string()
}

fn default_graph_user() -> String {
    "neo4j".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_watch_interval_secs")]
    pub watch_interval_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            watch_interval_secs: default_watch_interval_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            health_interval_secs: default_health_interval_secs(),
        }
    }
}

impl ScheduleConfig {
    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.watch_interval_secs.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }
}

fn default_watch_interval_secs() -> u64 {
    30
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_health_interval_secs() -> u64 {
    60
}
