//! Runtime configuration
//!
//! Defaults are usable as-is. With the `config-file` feature, values can be
//! layered from an optional file and `GATTQ_*` environment variables.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::queue::MAX_OPERATION_TIMEOUT;

/// Default per-operation timeout
pub const DEFAULT_QUEUE_TIMEOUT_MS: u64 = 500;

/// Request code used by the host's adapter-enable flow
pub const DEFAULT_ENABLE_BLE_CODE: i32 = 0xab1e;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "GATTQ";

/// Queue and session settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GattConfig {
    /// Timeout applied to operations without an explicit deadline
    pub queue_timeout_ms: u64,
    /// Carried for the (external) adapter-enable flow, unused by the queue
    pub enable_ble_code: i32,
    /// Whether the radio can do indications; notify is used otherwise
    pub supports_indication: bool,
    /// trace/debug/info/warn/error
    pub log_level: Option<String>,
}

impl Default for GattConfig {
    fn default() -> Self {
        Self {
            queue_timeout_ms: DEFAULT_QUEUE_TIMEOUT_MS,
            enable_ble_code: DEFAULT_ENABLE_BLE_CODE,
            supports_indication: true,
            log_level: None,
        }
    }
}

impl GattConfig {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_timeout_ms == 0 {
            return Err(ConfigError::Invalid("queue_timeout_ms must be greater than zero".to_string()));
        }
        if self.queue_timeout() > MAX_OPERATION_TIMEOUT {
            return Err(ConfigError::Invalid(format!(
                "queue_timeout_ms must be at most {}",
                MAX_OPERATION_TIMEOUT.as_millis()
            )));
        }
        Ok(())
    }

    /// Load from an optional file, then `GATTQ_*` environment variables
    #[cfg(feature = "config-file")]
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    #[cfg(feature = "config-file")]
    fn load_with_prefix(path: Option<&std::path::Path>, prefix: &str) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let loaded: GattConfig = builder
            .add_source(config::Environment::with_prefix(prefix).try_parsing(true))
            .build()?
            .try_deserialize()?;

        loaded.validate()?;
        tracing::debug!("Loaded configuration: {:?}", loaded);
        Ok(loaded)
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[cfg(feature = "config-file")]
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GattConfig::default();
        assert_eq!(config.queue_timeout(), Duration::from_millis(500));
        assert_eq!(config.enable_ble_code, 0xab1e);
        assert!(config.supports_indication);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = GattConfig {
            queue_timeout_ms: 0,
            ..GattConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_oversized_timeout_rejected() {
        let config = GattConfig::default().with_queue_timeout(Duration::MAX);
        assert_eq!(config.queue_timeout_ms, u64::MAX);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = GattConfig::default().with_queue_timeout(MAX_OPERATION_TIMEOUT);
        assert!(config.validate().is_ok());
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn test_load_from_file() {
        use std::io::Write;

        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "queue_timeout_ms = 1500").unwrap();
        writeln!(file, "supports_indication = false").unwrap();

        let config = GattConfig::load_with_prefix(Some(file.path()), "GATTQ_TEST_FILE").unwrap();
        assert_eq!(config.queue_timeout_ms, 1500);
        assert!(!config.supports_indication);
        // Untouched keys keep their defaults
        assert_eq!(config.enable_ble_code, DEFAULT_ENABLE_BLE_CODE);
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            GattConfig::load_with_prefix(Some(&dir.path().join("absent.toml")), "GATTQ_TEST_NONE").unwrap();
        assert_eq!(config, GattConfig::default());
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn test_environment_overrides() {
        std::env::set_var("GATTQ_TEST_ENV_QUEUE_TIMEOUT_MS", "750");
        std::env::set_var("GATTQ_TEST_ENV_LOG_LEVEL", "debug");

        let config = GattConfig::load_with_prefix(None, "GATTQ_TEST_ENV").unwrap();
        assert_eq!(config.queue_timeout_ms, 750);
        assert_eq!(config.log_level.as_deref(), Some("debug"));

        std::env::remove_var("GATTQ_TEST_ENV_QUEUE_TIMEOUT_MS");
        std::env::remove_var("GATTQ_TEST_ENV_LOG_LEVEL");
    }
}
