//! Configuration for concord-daemon

use concord_types::{BusConfig, StrategyKind, ValidationConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Bus configuration handed to every component
    #[serde(default = "default_bus")]
    pub bus: BusConfig,

    /// Health monitor configuration
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bus: default_bus(),
            monitor: MonitorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Health monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Interval between health and metrics reports, in seconds
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            health_interval_secs: default_health_interval(),
        }
    }
}

impl MonitorConfig {
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// The daemon ships without a policy backend, so dynamic policy is opt-in.
fn default_bus() -> BusConfig {
    BusConfig {
        validation: ValidationConfig {
            strategies: vec![StrategyKind::StaticHash, StrategyKind::Expiry],
            ..Default::default()
        },
        ..Default::default()
    }
}

fn default_health_interval() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DaemonConfig {
    /// Load configuration: defaults, then the optional file, then
    /// `CONCORD_` environment variables (`CONCORD_BUS__POLICY_COMMITMENT`).
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        Self::build(path.map(|path| config::File::with_name(path).required(true)))
    }

    fn build<S>(file: Option<S>) -> Result<Self, config::ConfigError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&DaemonConfig::default())?);

        if let Some(file) = file {
            builder = builder.add_source(file);
        }

        builder = builder.add_source(
            config::Environment::with_prefix("CONCORD")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}
