//! Configuration management

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use pairlink_transport::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "PAIRLINK_";

/// Pairing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PairingConfig {
    pub timeouts: TimeoutConfig,
    pub relay: RelayConfig,
    pub validation: ValidationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Whole auth handshake
    pub handshake_secs: u64,
    /// One direct signaling request
    pub direct_ms: u64,
    /// Bound on one relay attempt (subscribe, publish and wait)
    pub relay_secs: u64,
    /// Waiting for the data channel to open after the answer is applied
    pub data_channel_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            handshake_secs: 10,
            direct_ms: 3000,
            relay_secs: 30,
            data_channel_secs: 15,
        }
    }
}

impl TimeoutConfig {
    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_secs)
    }

    pub fn direct(&self) -> Duration {
        Duration::from_millis(self.direct_ms)
    }

    pub fn relay(&self) -> Duration {
        Duration::from_secs(self.relay_secs)
    }

    pub fn data_channel(&self) -> Duration {
        Duration::from_secs(self.data_channel_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub max_retries: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_initial_ms: 250,
            backoff_max_ms: 4000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RelayConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(self.backoff_initial_ms),
            max_backoff: Duration::from_millis(self.backoff_max_ms),
            backoff_multiplier: self.backoff_multiplier,
            jitter: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub timestamp_window_secs: i64,
    pub nonce_cache_capacity: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            timestamp_window_secs: 30,
            nonce_cache_capacity: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `tracing` filter directive; `RUST_LOG` wins when set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl PairingConfig {
    /// Load configuration: defaults, then the TOML file (if any), then
    /// `PAIRLINK_*` environment variables. The result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };

        config.apply_overrides_from(|key| std::env::var(key).ok())?;
        config.validate()?;

        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply overrides using `lookup` to read variables by full name.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(v) = var("HANDSHAKE_TIMEOUT_SECS") {
            self.timeouts.handshake_secs = parse_var("HANDSHAKE_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("DIRECT_TIMEOUT_MS") {
            self.timeouts.direct_ms = parse_var("DIRECT_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = var("RELAY_TIMEOUT_SECS") {
            self.timeouts.relay_secs = parse_var("RELAY_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("DATA_CHANNEL_TIMEOUT_SECS") {
            self.timeouts.data_channel_secs = parse_var("DATA_CHANNEL_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("RELAY_MAX_RETRIES") {
            self.relay.max_retries = parse_var("RELAY_MAX_RETRIES", &v)?;
        }
        if let Some(v) = var("TIMESTAMP_WINDOW_SECS") {
            self.validation.timestamp_window_secs = parse_var("TIMESTAMP_WINDOW_SECS", &v)?;
        }
        if let Some(v) = var("LOG_LEVEL") {
            self.logging.level = v;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeouts.handshake_secs == 0 {
            return Err(ConfigError::Invalid("timeouts.handshake_secs must be > 0".to_string()));
        }
        if self.timeouts.direct_ms == 0 {
            return Err(ConfigError::Invalid("timeouts.direct_ms must be > 0".to_string()));
        }
        if self.timeouts.relay_secs == 0 {
            return Err(ConfigError::Invalid("timeouts.relay_secs must be > 0".to_string()));
        }
        if self.timeouts.data_channel_secs == 0 {
            return Err(ConfigError::Invalid(
                "timeouts.data_channel_secs must be > 0".to_string(),
            ));
        }
        if self.relay.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "relay.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        if self.relay.backoff_initial_ms > self.relay.backoff_max_ms {
            return Err(ConfigError::Invalid(
                "relay.backoff_initial_ms must not exceed relay.backoff_max_ms".to_string(),
            ));
        }
        if self.validation.timestamp_window_secs <= 0 {
            return Err(ConfigError::Invalid(
                "validation.timestamp_window_secs must be > 0".to_string(),
            ));
        }
        if self.validation.nonce_cache_capacity == 0 {
            return Err(ConfigError::Invalid(
                "validation.nonce_cache_capacity must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("Invalid {}{}: {}", ENV_PREFIX, name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = PairingConfig::default();
        assert_eq!(config.timeouts.handshake(), Duration::from_secs(10));
        assert_eq!(config.timeouts.direct(), Duration::from_secs(3));
        assert_eq!(config.timeouts.relay(), Duration::from_secs(30));
        assert_eq!(config.relay.max_retries, 3);
        assert_eq!(config.validation.timestamp_window_secs, 30);
        assert_eq!(config.validation.nonce_cache_capacity, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = PairingConfig::from_toml_str(
            r#"
            [timeouts]
            relay_secs = 5

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.timeouts.relay(), Duration::from_secs(5));
        assert_eq!(config.timeouts.handshake_secs, 10);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[relay]\nmax_retries = 5").unwrap();
        let config = PairingConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.relay.max_retries, 5);
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[relay\nmax_retries = ").unwrap();
        assert!(matches!(
            PairingConfig::load(Some(file.path())),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("PAIRLINK_RELAY_TIMEOUT_SECS", "12"),
            ("PAIRLINK_RELAY_MAX_RETRIES", "1"),
            ("PAIRLINK_LOG_LEVEL", "pairlink_core=trace"),
        ]
        .into_iter()
        .collect();

        let mut config = PairingConfig::default();
        config
            .apply_overrides_from(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.timeouts.relay_secs, 12);
        assert_eq!(config.relay.max_retries, 1);
        assert_eq!(config.logging.level, "pairlink_core=trace");
    }

    #[test]
    fn test_env_override_parse_error() {
        let mut config = PairingConfig::default();
        let err = config
            .apply_overrides_from(|k| (k == "PAIRLINK_DIRECT_TIMEOUT_MS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("PAIRLINK_DIRECT_TIMEOUT_MS"));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = PairingConfig::default();
        config.validation.nonce_cache_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = PairingConfig::default();
        config.timeouts.relay_secs = 0;
        assert!(config.validate().is_err());

        let mut config = PairingConfig::default();
        config.relay.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_policy_from_config() {
        let policy = RelayConfig::default().retry_policy();
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(250));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(500));
    }
}
