//! Configuration loading for lifehub services
//!
//! TOML config file resolved in priority order:
//! 1. `LIFEHUB_SYNC_CONFIG` environment variable (explicit path)
//! 2. `<os config dir>/lifehub/lifehub-sync.toml`
//! 3. Compiled defaults (missing file is not an error)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Policy for a second candidate job discovered while one is already
/// tracked for the same entity
///
/// The source behavior with two overlapping generation jobs was never
/// pinned down, so this is a deployment choice rather than a hardcoded
/// rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecondJobPolicy {
    /// Keep tracking the first job; ignore the newcomer (default)
    Ignore,
    /// Drop the first job and track the newcomer
    Replace,
}

impl Default for SecondJobPolicy {
    fn default() -> Self {
        SecondJobPolicy::Ignore
    }
}

/// Bounded exponential backoff settings
///
/// Used for the read-after-write gap between a job completion event and
/// the asset store making the new asset durably readable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Maximum number of attempts before the error is surfaced
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt (doubles each retry)
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Cap on the per-attempt delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Entity observation settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchConfig {
    /// What to do when a second job targets an already-tracked entity
    #[serde(default)]
    pub second_job_policy: SecondJobPolicy,
}

/// Service configuration loaded from TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TomlConfig {
    /// HTTP listen port
    #[serde(default = "default_port")]
    pub port: u16,
    /// SQLite database path
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// EventBus broadcast channel capacity
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
    /// Asset readability retry policy
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Entity observation settings
    #[serde(default)]
    pub watch: WatchConfig,
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            database_path: default_database_path(),
            event_bus_capacity: default_event_bus_capacity(),
            backoff: BackoffConfig::default(),
            watch: WatchConfig::default(),
        }
    }
}

impl TomlConfig {
    /// Load configuration, falling back to defaults when no file exists
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) if path.exists() => {
                tracing::info!(path = %path.display(), "Loading configuration");
                let content = std::fs::read_to_string(&path)?;
                Self::from_toml(&content)
            }
            Some(path) => {
                tracing::info!(
                    path = %path.display(),
                    "No configuration file found, using defaults"
                );
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Invalid TOML config: {}", e)))
    }

    /// Resolve the config file path (env var overrides OS config dir)
    pub fn config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("LIFEHUB_SYNC_CONFIG") {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|dir| dir.join("lifehub").join("lifehub-sync.toml"))
    }
}

fn default_port() -> u16 {
    5810
}

fn default_database_path() -> String {
    "lifehub-sync.db".to_string()
}

fn default_event_bus_capacity() -> usize {
    1000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    2000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TomlConfig::default();
        assert_eq!(config.port, 5810);
        assert_eq!(config.event_bus_capacity, 1000);
        assert_eq!(config.backoff.max_attempts, 5);
        assert_eq!(config.watch.second_job_policy, SecondJobPolicy::Ignore);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = TomlConfig::from_toml("port = 6000\n").unwrap();
        assert_eq!(config.port, 6000);
        assert_eq!(config.database_path, "lifehub-sync.db");
        assert_eq!(config.backoff.max_delay_ms, 2000);
    }

    #[test]
    fn test_full_toml() {
        let content = r#"
port = 6001
database_path = "/tmp/test.db"
event_bus_capacity = 50

[backoff]
max_attempts = 3
initial_delay_ms = 10
max_delay_ms = 100

[watch]
second_job_policy = "replace"
"#;
        let config = TomlConfig::from_toml(content).unwrap();
        assert_eq!(config.port, 6001);
        assert_eq!(config.database_path, "/tmp/test.db");
        assert_eq!(config.event_bus_capacity, 50);
        assert_eq!(config.backoff.max_attempts, 3);
        assert_eq!(config.watch.second_job_policy, SecondJobPolicy::Replace);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = TomlConfig::from_toml("port = \"not a number\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    // the env-var tests mutate LIFEHUB_SYNC_CONFIG, shared process state

    #[test]
    #[serial_test::serial]
    fn test_load_reads_file_named_by_env_var() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lifehub-sync.toml");
        std::fs::write(&path, "port = 6100\n").unwrap();

        std::env::set_var("LIFEHUB_SYNC_CONFIG", &path);
        let config = TomlConfig::load().unwrap();
        std::env::remove_var("LIFEHUB_SYNC_CONFIG");

        assert_eq!(config.port, 6100);
        assert_eq!(config.database_path, "lifehub-sync.db");
    }

    #[test]
    #[serial_test::serial]
    fn test_load_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.toml");

        std::env::set_var("LIFEHUB_SYNC_CONFIG", &path);
        let config = TomlConfig::load().unwrap();
        std::env::remove_var("LIFEHUB_SYNC_CONFIG");

        assert_eq!(config.port, 5810);
    }
}
