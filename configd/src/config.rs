use config_store::config::{StoreConfig, ValidationError};
use serde::Deserialize;
use std::fs::File;

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct LoggingConfig {
    pub sentry_dsn: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
pub struct CommonConfig {
    pub metrics: Option<MetricsConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(flatten)]
    pub common: CommonConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data = serde_yaml::from_reader(file)?;

        Ok(data)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(metrics) = &self.common.metrics {
            if metrics.statsd_host.is_empty() {
                return Err(ConfigError::InvalidMetrics("statsd_host is empty"));
            }
            if metrics.statsd_port == 0 {
                return Err(ConfigError::InvalidMetrics("statsd_port cannot be 0"));
            }
        }
        self.store.validate()?;
        Ok(())
    }

    pub fn sentry_dsn(&self) -> Option<&str> {
        self.common
            .logging
            .as_ref()
            .and_then(|l| l.sentry_dsn.as_deref())
            .filter(|dsn| !dsn.is_empty())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid store config: {0}")]
    InvalidStore(#[from] ValidationError),
    #[error("invalid metrics config: {0}")]
    InvalidMetrics(&'static str),
}
