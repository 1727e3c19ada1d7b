//! Configuration management for ledgerd.
//!
//! Loads settings from /etc/ledgerd/config.toml or uses defaults.

use anyhow::{bail, Result};
use ledger_common::LevelMapping;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/ledgerd/config.toml";

/// Default config file path for fallback
pub const DEFAULT_CONFIG_PATH: &str = "/var/lib/ledgerd/config.toml";

/// Drain cycle settings, shared by the currency and honor queues
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Interval between drain cycles in milliseconds
    #[serde(default = "default_drain_interval")]
    pub drain_interval_ms: u64,

    /// Maximum transactions dispatched per drain cycle
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,

    /// Warn when a dispatched batch is still running after this long
    #[serde(default = "default_slow_batch_warn")]
    pub slow_batch_warn_secs: u64,
}

fn default_drain_interval() -> u64 {
    1000
}

fn default_batch_limit() -> usize {
    10
}

fn default_slow_batch_warn() -> u64 {
    30
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            drain_interval_ms: default_drain_interval(),
            batch_limit: default_batch_limit(),
            slow_batch_warn_secs: default_slow_batch_warn(),
        }
    }
}

impl QueueConfig {
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    pub fn slow_batch_warning(&self) -> Duration {
        Duration::from_secs(self.slow_batch_warn_secs)
    }
}

/// Backing store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("/var/lib/ledgerd/ledger.db")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_levels() -> Vec<LevelMapping> {
    vec![
        LevelMapping::new(1, 0),
        LevelMapping::new(2, 100),
        LevelMapping::new(3, 300),
        LevelMapping::new(4, 600),
        LevelMapping::new(5, 1000),
    ]
}

/// Full daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub store: StoreConfig,

    /// Level ladder, loaded into the level table on start
    #[serde(default = "default_levels")]
    pub levels: Vec<LevelMapping>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            store: StoreConfig::default(),
            levels: default_levels(),
        }
    }
}

impl Config {
    /// Load config from file, or return defaults
    pub fn load() -> Self {
        Self::load_from_path(CONFIG_PATH)
            .or_else(|_| Self::load_from_path(DEFAULT_CONFIG_PATH))
            .unwrap_or_else(|e| {
                warn!("Config not found, using defaults: {}", e);
                Config::default()
            })
    }

    /// Load config from specific path
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Reject settings the queue cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.queue.batch_limit == 0 {
            bail!("queue.batch_limit must be at least 1");
        }
        if self.queue.drain_interval_ms == 0 {
            bail!("queue.drain_interval_ms must be greater than 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.queue.drain_interval_ms, 1000);
        assert_eq!(config.queue.batch_limit, 10);
        assert_eq!(config.levels.len(), 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
[queue]
batch_limit = 25

[store]
path = "/tmp/ledger.db"

[[levels]]
level = 1
threshold = 0

[[levels]]
level = 2
threshold = 50
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.queue.batch_limit, 25);
        // Defaults for missing fields
        assert_eq!(config.queue.drain_interval_ms, 1000);
        assert_eq!(config.queue.slow_batch_warn_secs, 30);
        assert_eq!(config.store.path, PathBuf::from("/tmp/ledger.db"));
        assert_eq!(config.levels, vec![LevelMapping::new(1, 0), LevelMapping::new(2, 50)]);
    }

    #[test]
    fn test_missing_levels_use_default_ladder() {
        let config: Config = toml::from_str("[queue]\ndrain_interval_ms = 250\n").unwrap();
        assert_eq!(config.queue.drain_interval(), Duration::from_millis(250));
        assert_eq!(config.levels, default_levels());
    }

    #[test]
    fn test_zero_batch_limit_rejected() {
        let mut config = Config::default();
        config.queue.batch_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[queue]\nbatch_limit = 3\n").unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.queue.batch_limit, 3);

        fs::write(&path, "[queue]\nbatch_limit = 0\n").unwrap();
        assert!(Config::load_from_path(&path).is_err());
    }
}
