use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read scheduler config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse scheduler config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid scheduler config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Identifier of the shard this scheduler owns, matched by Launch scopes.
    pub shard: String,
    pub tick_interval_ms: u64,
    /// A Running migration without a heartbeat for this long is abandoned.
    pub liveness_timeout_ms: u64,
    /// Re-read attempts a command handler makes when its update races another
    /// writer. The loop itself defers raced records to the next tick.
    pub max_store_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            shard: "0".to_string(),
            tick_interval_ms: 1_000,
            liveness_timeout_ms: 600_000,
            max_store_retries: 3,
        }
    }
}

impl SchedulerConfig {
    pub fn for_shard(shard: impl Into<String>) -> Self {
        Self {
            shard: shard.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: SchedulerConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shard.trim().is_empty() {
            return Err(ConfigError::Invalid("shard must not be empty".to_string()));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "tick_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn liveness_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.liveness_timeout_ms.min(i64::MAX as u64) as i64)
    }
}
