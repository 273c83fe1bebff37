//! Preview configuration.
//!
//! Read from JSON, falling back to YAML, then adjusted from the environment. Every field has
//! a default so an empty document is a valid configuration.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use content_injection::InjectionPolicy;
use privileged_executor::{ExecutorConfig, StorageBackend};
use rpc_broker::BrokerConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::PreviewError;

pub const RPC_TIMEOUT_ENV: &str = "PREVIEW_RPC_TIMEOUT";
pub const INJECTION_TIMEOUT_ENV: &str = "PREVIEW_INJECTION_TIMEOUT";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Also write logs to daily files in this directory.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            directory: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreviewConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub injection: InjectionPolicy,
    #[serde(default)]
    pub storage: StorageBackend,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default)]
    pub log: LogConfig,
}

fn default_event_capacity() -> usize {
    256
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            injection: InjectionPolicy::default(),
            storage: StorageBackend::default(),
            event_capacity: default_event_capacity(),
            log: LogConfig::default(),
        }
    }
}

impl PreviewConfig {
    /// Parses a JSON document, or YAML when it is not JSON.
    pub fn parse(raw: &str) -> Result<Self, PreviewError> {
        match serde_json::from_str::<Self>(raw) {
            Ok(config) => Ok(config),
            Err(json_err) => serde_yaml::from_str::<Self>(raw).map_err(|yaml_err| {
                PreviewError::config(format!("not JSON ({json_err}) or YAML ({yaml_err})"))
            }),
        }
    }

    /// Loads `path` (or defaults when it does not exist) and applies environment overrides.
    pub async fn load(path: Option<&Path>) -> Result<Self, PreviewError> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let raw = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|err| PreviewError::io(path, err))?;
                let config = Self::parse(&raw)?;
                info!(path = %path.display(), "loaded preview configuration");
                config
            }
            Some(path) => {
                debug!(path = %path.display(), "configuration file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// `PREVIEW_RPC_TIMEOUT` and `PREVIEW_INJECTION_TIMEOUT` take humantime durations
    /// such as `2s` or `750ms`.
    pub fn apply_env_overrides(&mut self) -> Result<(), PreviewError> {
        if let Some(timeout) = duration_from_env(RPC_TIMEOUT_ENV)? {
            let millis = duration_millis(timeout);
            self.broker.call_timeout_ms = millis;
            self.broker.delivery_timeout_ms = millis;
        }
        if let Some(timeout) = duration_from_env(INJECTION_TIMEOUT_ENV)? {
            self.injection.attempt_timeout_ms = duration_millis(timeout);
        }
        Ok(())
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            broker: self.broker.clone(),
            injection: self.injection.clone(),
            storage: self.storage,
        }
    }
}

fn duration_from_env(key: &str) -> Result<Option<Duration>, PreviewError> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => humantime::parse_duration(raw.trim())
            .map(Some)
            .map_err(|err| PreviewError::config(format!("{key}={raw}: {err}"))),
        _ => Ok(None),
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn empty_documents_use_defaults() {
        let config = PreviewConfig::parse("{}").unwrap();
        assert_eq!(config.broker.call_timeout_ms, 10_000);
        assert_eq!(config.injection.attempt_timeout_ms, 5_000);
        assert_eq!(config.injection.steps.len(), 4);
        assert_eq!(config.storage, StorageBackend::Session);
        assert_eq!(config.event_capacity, 256);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn yaml_is_accepted() {
        let config = PreviewConfig::parse(
            "broker:\n  call_timeout_ms: 1500\nstorage: host\nlog:\n  json: true\n",
        )
        .unwrap();
        assert_eq!(config.broker.call_timeout_ms, 1500);
        assert_eq!(config.broker.delivery_timeout_ms, 10_000);
        assert_eq!(config.storage, StorageBackend::Host);
        assert!(config.log.json);
    }

    #[test]
    fn defaults_match_an_empty_document() {
        let built = PreviewConfig::default();
        let parsed = PreviewConfig::parse("{}").unwrap();
        assert_eq!(built.event_capacity, 256);
        assert_eq!(built.event_capacity, parsed.event_capacity);
        assert_eq!(built.broker.call_timeout_ms, parsed.broker.call_timeout_ms);
        assert_eq!(built.broker.delivery_timeout_ms, parsed.broker.delivery_timeout_ms);
        assert_eq!(
            built.injection.attempt_timeout_ms,
            parsed.injection.attempt_timeout_ms
        );
        assert_eq!(built.injection.steps.len(), parsed.injection.steps.len());
        assert_eq!(built.storage, parsed.storage);
        assert_eq!(built.log.level, parsed.log.level);
    }

    #[test]
    fn garbage_is_a_config_error() {
        let err = PreviewConfig::parse("broker: [1, 2").unwrap_err();
        assert!(matches!(err, PreviewError::Config(_)));
    }

    #[test]
    #[serial(preview_env)]
    fn env_overrides_timeouts() {
        env::set_var(RPC_TIMEOUT_ENV, "2s");
        env::set_var(INJECTION_TIMEOUT_ENV, "750ms");
        let mut config = PreviewConfig::default();
        let outcome = config.apply_env_overrides();
        env::remove_var(RPC_TIMEOUT_ENV);
        env::remove_var(INJECTION_TIMEOUT_ENV);
        outcome.unwrap();
        assert_eq!(config.broker.call_timeout_ms, 2_000);
        assert_eq!(config.broker.delivery_timeout_ms, 2_000);
        assert_eq!(config.injection.attempt_timeout_ms, 750);
    }

    #[test]
    #[serial(preview_env)]
    fn bad_env_durations_are_rejected() {
        env::set_var(RPC_TIMEOUT_ENV, "soon");
        let outcome = PreviewConfig::default().apply_env_overrides();
        env::remove_var(RPC_TIMEOUT_ENV);
        assert!(matches!(outcome, Err(PreviewError::Config(_))));
    }

    #[tokio::test]
    #[serial(preview_env)]
    async fn loads_files_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preview.yaml");
        std::fs::write(&path, "injection:\n  attempt_timeout_ms: 300\n").unwrap();
        let config = PreviewConfig::load(Some(&path)).await.unwrap();
        assert_eq!(config.injection.attempt_timeout_ms, 300);

        let missing = PreviewConfig::load(Some(&dir.path().join("absent.json")))
            .await
            .unwrap();
        assert_eq!(missing.injection.attempt_timeout_ms, 5_000);
    }
}
