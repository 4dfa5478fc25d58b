//! Client configuration.
//!
//! Every field has a default, so partial JSON documents are accepted.
//! Durations are written as seconds (floats allowed).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::modules::manifest::DEFAULT_MANIFEST_CAPACITY;
use crate::modules::proxy::{DEFAULT_MAX_LAST_TESTED_WEEKS, RotationStrategy};
use crate::modules::retry::{DEFAULT_PROXY_ERROR_WAIT, RetryPolicy};
use crate::remote::DEFAULT_REMOTE_SERVICE_API;
use crate::user_agents::{DEFAULT_ROTATION_INTERVAL, default_user_agent};

pub const DEFAULT_MAX_CONTENT_LENGTH: u64 = 200_000_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CarpetBagConfig {
    /// Extra headers sent on every request.
    pub headers: BTreeMap<String, String>,
    /// Fixed agent. `None` with `random_user_agent` off sends no agent.
    pub user_agent: Option<String>,
    pub random_user_agent: bool,
    pub user_agent_rotation_interval: u64,
    pub ssl_verify: bool,
    pub force_skip_ssl_verify: bool,
    #[serde(with = "seconds")]
    pub minimum_wait_time: Duration,
    pub retries_on_connection_failure: u32,
    #[serde(with = "seconds")]
    pub wait_and_retry_on_connection_error: Duration,
    #[serde(with = "seconds")]
    pub proxy_error_wait: Duration,
    /// Largest response body accepted, in bytes.
    pub max_content_length: u64,
    pub proxy: Option<String>,
    pub random_proxy_bag: bool,
    pub retry_on_proxy_failure: bool,
    pub max_rotation_attempts: Option<u32>,
    pub rotation_strategy: RotationStrategy,
    pub public_proxies_max_last_test_weeks: u32,
    pub remote_service_api: String,
    pub send_usage_stats: bool,
    pub usage_stats_api_key: Option<String>,
    pub manifest_capacity: usize,
    #[serde(with = "optional_seconds")]
    pub request_timeout: Option<Duration>,
}

impl Default for CarpetBagConfig {
    fn default() -> Self {
        Self {
            headers: BTreeMap::new(),
            user_agent: Some(default_user_agent()),
            random_user_agent: false,
            user_agent_rotation_interval: DEFAULT_ROTATION_INTERVAL,
            ssl_verify: true,
            force_skip_ssl_verify: false,
            minimum_wait_time: Duration::ZERO,
            retries_on_connection_failure: 5,
            wait_and_retry_on_connection_error: Duration::ZERO,
            proxy_error_wait: DEFAULT_PROXY_ERROR_WAIT,
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
            proxy: None,
            random_proxy_bag: false,
            retry_on_proxy_failure: true,
            max_rotation_attempts: None,
            rotation_strategy: RotationStrategy::default(),
            public_proxies_max_last_test_weeks: DEFAULT_MAX_LAST_TESTED_WEEKS,
            remote_service_api: DEFAULT_REMOTE_SERVICE_API.to_string(),
            send_usage_stats: false,
            usage_stats_api_key: None,
            manifest_capacity: DEFAULT_MANIFEST_CAPACITY,
            request_timeout: None,
        }
    }
}

impl CarpetBagConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.manifest_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "manifest_capacity",
                reason: "must be at least 1".into(),
            });
        }
        if url::Url::parse(&self.remote_service_api).is_err() {
            return Err(ConfigError::Invalid {
                field: "remote_service_api",
                reason: format!("not a url: {}", self.remote_service_api),
            });
        }
        Ok(())
    }

    /// Retry knobs derived from this config.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            random_proxy_bag: self.random_proxy_bag,
            retry_on_proxy_failure: self.retry_on_proxy_failure,
            ssl_verify: self.ssl_verify,
            retries_on_connection_failure: self.retries_on_connection_failure,
            wait_on_connection_error: self.wait_and_retry_on_connection_error,
            proxy_error_wait: self.proxy_error_wait,
            max_rotation_attempts: self.max_rotation_attempts,
        }
    }
}

mod seconds {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

mod optional_seconds {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(D::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = CarpetBagConfig::default();
        assert_eq!(config.retries_on_connection_failure, 5);
        assert_eq!(config.proxy_error_wait, Duration::from_secs(5));
        assert_eq!(config.max_content_length, 200_000_000);
        assert_eq!(config.manifest_capacity, 1000);
        assert_eq!(config.public_proxies_max_last_test_weeks, 5);
        assert!(config.ssl_verify);
        assert!(config.retry_on_proxy_failure);
        assert_eq!(config.user_agent, Some(default_user_agent()));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = CarpetBagConfig::from_json_str(
            r#"{"minimum_wait_time": 1.5, "random_proxy_bag": true, "rotation_strategy": "ranked",
                "request_timeout": 30}"#,
        )
        .unwrap();
        assert_eq!(config.minimum_wait_time, Duration::from_millis(1500));
        assert!(config.random_proxy_bag);
        assert_eq!(config.rotation_strategy, RotationStrategy::Ranked);
        assert_eq!(config.request_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.retries_on_connection_failure, 5);
    }

    #[test]
    fn rejects_negative_durations_and_zero_capacity() {
        assert!(CarpetBagConfig::from_json_str(r#"{"minimum_wait_time": -1}"#).is_err());
        assert!(matches!(
            CarpetBagConfig::from_json_str(r#"{"manifest_capacity": 0}"#),
            Err(ConfigError::Invalid { field: "manifest_capacity", .. })
        ));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"headers": {{"Accept": "text/html"}}, "ssl_verify": false}}"#).unwrap();
        let config = CarpetBagConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.headers.get("Accept").map(String::as_str), Some("text/html"));
        assert!(!config.retry_policy().ssl_verify);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = CarpetBagConfig::from_json_file("/nonexistent/carpetbag.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
