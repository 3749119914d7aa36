// src/config.rs

//! Download manager configuration.

use crate::connection::ConnectionType;
use crate::models::FilePersistenceType;
use crate::throttle::ThrottleConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const MAX_CONCURRENT_DOWNLOADS_ENV: &str = "ODM_MAX_CONCURRENT_DOWNLOADS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// HTTP transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    concat!("odm-batch/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadManagerConfig {
    /// File transfers allowed to run at the same time.
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,
    #[serde(default)]
    pub allowed_connection_type: ConnectionType,
    #[serde(default)]
    pub callback_throttle: ThrottleConfig,
    /// How long service-dependent queries wait for `initialise`.
    #[serde(default = "default_service_wait_timeout_ms")]
    pub service_wait_timeout_ms: u64,
    #[serde(default)]
    pub default_persistence_type: FilePersistenceType,
    /// Free space kept untouched by the storage rule. Zero disables the rule.
    #[serde(default)]
    pub reserved_storage_bytes: u64,
    #[serde(default)]
    pub http: HttpConfig,
}

fn default_max_concurrent_downloads() -> usize {
    1
}

fn default_service_wait_timeout_ms() -> u64 {
    5000
}

impl Default for DownloadManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: default_max_concurrent_downloads(),
            allowed_connection_type: ConnectionType::default(),
            callback_throttle: ThrottleConfig::default(),
            service_wait_timeout_ms: default_service_wait_timeout_ms(),
            default_persistence_type: FilePersistenceType::default(),
            reserved_storage_bytes: 0,
            http: HttpConfig::default(),
        }
    }
}

impl DownloadManagerConfig {
    /// Reads a JSON config file; missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `ODM_MAX_CONCURRENT_DOWNLOADS` when it holds a positive number.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var(MAX_CONCURRENT_DOWNLOADS_ENV) {
            match val.trim().parse::<usize>() {
                Ok(n) if n > 0 => self.max_concurrent_downloads = n,
                _ => tracing::warn!(value = %val, "ignoring invalid {MAX_CONCURRENT_DOWNLOADS_ENV}"),
            }
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_downloads == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_downloads must be at least 1".into(),
            ));
        }
        if let ThrottleConfig::ByTime { period_ms: 0 } = self.callback_throttle {
            return Err(ConfigError::Invalid(
                "by_time throttle needs a period above zero".into(),
            ));
        }
        if self.http.timeout_secs == 0 {
            return Err(ConfigError::Invalid("http.timeout_secs must be above zero".into()));
        }
        Ok(())
    }

    pub fn service_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.service_wait_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_json_yields_defaults() {
        let config: DownloadManagerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, DownloadManagerConfig::default());
        assert_eq!(config.max_concurrent_downloads, 1);
        assert_eq!(config.service_wait_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn tagged_throttle_and_connection_type_parse() {
        let config: DownloadManagerConfig = serde_json::from_str(
            r#"{
                "allowed_connection_type": "unmetered",
                "callback_throttle": { "type": "by_time", "period_ms": 250 },
                "default_persistence_type": "external",
                "http": { "timeout_secs": 10 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.allowed_connection_type, ConnectionType::Unmetered);
        assert_eq!(config.callback_throttle, ThrottleConfig::ByTime { period_ms: 250 });
        assert_eq!(config.default_persistence_type, FilePersistenceType::External);
        assert_eq!(config.http.timeout_secs, 10);
        assert_eq!(config.http.user_agent, default_user_agent());
    }

    #[test]
    fn file_loading_rejects_invalid_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "max_concurrent_downloads": 0 }}"#).unwrap();

        let result = DownloadManagerConfig::from_json_file(file.path());

        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_period_time_throttle_is_invalid() {
        let config = DownloadManagerConfig {
            callback_throttle: ThrottleConfig::ByTime { period_ms: 0 },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
