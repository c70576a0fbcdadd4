//! Engine configuration, loaded from an optional file plus environment
//! overrides.

use std::{path::Path, time::Duration};

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Deserializer};

/// Provides the default value for base_interval_secs.
fn default_base_interval() -> Duration {
    Duration::from_secs(10)
}

/// Provides the default value for shutdown_timeout_secs.
fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Provides the default value for result_history_limit.
fn default_result_history_limit() -> usize {
    100
}

/// Provides the default value for memory_history_limit.
fn default_memory_history_limit() -> usize {
    1024
}

/// Provides the default value for database_url.
fn default_database_url() -> String {
    "sqlite::memory:".to_string()
}

/// Deserializes a `Duration` from a plain number of seconds.
fn deserialize_duration_from_seconds<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = u64::deserialize(deserializer)?;
    Ok(Duration::from_secs(secs))
}

/// Configuration for the evaluation engine.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Database URL for the SQLite instance store.
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// The scheduler's base tick interval in seconds. Individual rules
    /// evaluate on multiples of this.
    #[serde(
        deserialize_with = "deserialize_duration_from_seconds",
        rename = "base_interval_secs",
        default = "default_base_interval"
    )]
    pub base_interval: Duration,

    /// The maximum time to wait for the final cache flush during shutdown.
    #[serde(
        deserialize_with = "deserialize_duration_from_seconds",
        rename = "shutdown_timeout_secs",
        default = "default_shutdown_timeout"
    )]
    pub shutdown_timeout: Duration,

    /// How many recent raw evaluation results each instance keeps in memory.
    #[serde(default = "default_result_history_limit")]
    pub result_history_limit: usize,

    /// Capacity of the in-memory history backend's ring buffer.
    #[serde(default = "default_memory_history_limit")]
    pub memory_history_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            base_interval: default_base_interval(),
            shutdown_timeout: default_shutdown_timeout(),
            result_history_limit: default_result_history_limit(),
            memory_history_limit: default_memory_history_limit(),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from an optional file, then applies environment
    /// overrides prefixed with `VIGIL_` (e.g. `VIGIL_BASE_INTERVAL_SECS=30`).
    pub fn new(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path));
        }
        builder
            .add_source(Environment::with_prefix("VIGIL").separator("__"))
            .build()?
            .try_deserialize()
    }
}
