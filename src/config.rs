use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::RetryPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to parse scheduler config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid scheduler config: {0}")]
    Invalid(String),
}

/// Scheduler settings, loadable from TOML:
///
/// ```toml
/// max_workers = 4
/// default_timeout_secs = 600
///
/// [default_retry]
/// max_retries = 3
/// backoff_secs = 300
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default)]
    pub default_retry: RetryConfig,
}

fn default_max_workers() -> usize {
    8
}

fn default_timeout_secs() -> u64 {
    3600
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            default_timeout_secs: default_timeout_secs(),
            default_retry: RetryConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid("max_workers must be at least 1".into()));
        }
        if self.max_workers > Semaphore::MAX_PERMITS {
            return Err(ConfigError::Invalid(format!(
                "max_workers must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.default_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "default_timeout_secs must be at least 1".into(),
            ));
        }
        let multiplier = self.default_retry.multiplier;
        if multiplier.is_nan() || multiplier <= 0.0 {
            return Err(ConfigError::Invalid(
                "default_retry.multiplier must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_secs() -> u64 {
    300
}

fn default_multiplier() -> f64 {
    1.0
}

fn default_max_backoff_secs() -> u64 {
    3600
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_secs: default_backoff_secs(),
            multiplier: default_multiplier(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        RetryPolicy {
            max_retries: cfg.max_retries,
            backoff: Duration::from_secs(cfg.backoff_secs),
            multiplier: cfg.multiplier,
            max_backoff: Duration::from_secs(cfg.max_backoff_secs),
        }
    }
}
