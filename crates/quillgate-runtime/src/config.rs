//! Runtime configuration.
//!
//! Durations are written the human way (`"20s"`, `"1h 30m"`). Every field
//! has a default, so an empty document is a valid configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::resilience::CircuitBreakerConfig;

/// Errors that can occur when loading the runtime configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read runtime config: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse runtime config: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Invalid runtime config: {0}")]
    Invalid(String),
}

/// Serde adapter for durations written with `humantime`.
pub(crate) mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&humantime::format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Critic verdict cache settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_entries: u64,

    #[serde(with = "duration_str")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 1_000,
            ttl: Duration::from_secs(3600),
        }
    }
}

/// Configuration for the orchestration runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Upper bound on one critic call
    #[serde(with = "duration_str")]
    pub critic_timeout: Duration,

    /// Upper bound on one patch or regeneration request
    #[serde(with = "duration_str")]
    pub generator_timeout: Duration,

    /// Closed runs buffered before the oldest is dropped
    pub recorder_capacity: usize,

    pub circuit_breaker: CircuitBreakerConfig,

    pub cache: CacheConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            critic_timeout: Duration::from_secs(20),
            generator_timeout: Duration::from_secs(60),
            recorder_capacity: 1024,
            circuit_breaker: CircuitBreakerConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Parse a configuration from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = if yaml.trim().is_empty() {
            RuntimeConfig::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.critic_timeout.is_zero() || self.generator_timeout.is_zero() {
            return Err(ConfigError::Invalid("timeouts must be greater than zero".to_string()));
        }
        if self.recorder_capacity == 0 {
            return Err(ConfigError::Invalid("recorder_capacity must be at least 1".to_string()));
        }
        if self.circuit_breaker.failure_threshold == 0 || self.circuit_breaker.success_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit breaker thresholds must be at least 1".to_string(),
            ));
        }
        if self.cache.enabled && self.cache.max_entries == 0 {
            return Err(ConfigError::Invalid("cache.max_entries must be at least 1".to_string()));
        }
        Ok(())
    }
}
