//! Configuration management for punchclock.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "punchclock";

/// Default database file name.
const DATABASE_FILE_NAME: &str = "attendance.db";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `PUNCHCLOCK_`)
/// 2. TOML config file at `~/.config/punchclock/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Change notifier configuration.
    pub notifier: NotifierConfig,
    /// Reconciliation client configuration.
    pub sync: SyncConfig,
}

/// Storage-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the database file.
    /// Defaults to `~/.local/share/punchclock/attendance.db`
    pub database_path: Option<PathBuf>,
    /// How long a statement waits on a locked database, in milliseconds.
    pub busy_timeout_ms: u64,
}

/// Change notifier configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// How many notifications a subscriber may fall behind before its
    /// subscription is dropped.
    pub channel_capacity: usize,
    /// Buffer size of the check-in announcement channel.
    pub announcement_capacity: usize,
}

/// Reconciliation client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Upper bound on a single backend call, in milliseconds.
    pub call_timeout_ms: u64,
    /// Total attempts for a background read, including the first.
    pub retry_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Cap on the delay between retries, in milliseconds.
    pub max_backoff_ms: u64,
    /// Window in which notifications are coalesced into one refetch.
    pub debounce_ms: u64,
    /// Resubscription attempts before the client reports itself degraded.
    pub reconnect_attempts: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: None, // Will be resolved to default at runtime
            busy_timeout_ms: 5_000,
        }
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            channel_capacity: crate::notifier::DEFAULT_CHANNEL_CAPACITY,
            announcement_capacity: crate::notifier::DEFAULT_ANNOUNCEMENT_CAPACITY,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 5_000,
            retry_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            debounce_ms: 1_000,
            reconnect_attempts: 5,
        }
    }
}

impl SyncConfig {
    /// Get the per-call timeout as a Duration.
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Get the initial retry backoff as a Duration.
    #[must_use]
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Get the maximum retry backoff as a Duration.
    #[must_use]
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Get the debounce window as a Duration.
    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Configuration is loaded in this order (later sources override earlier):
    /// 1. Default values
    /// 2. TOML config file (if exists)
    /// 3. Environment variables (prefixed with `PUNCHCLOCK_`)
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file))
            .merge(Env::prefixed("PUNCHCLOCK_").split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("notifier.channel_capacity", self.notifier.channel_capacity as u64),
            (
                "notifier.announcement_capacity",
                self.notifier.announcement_capacity as u64,
            ),
            ("sync.call_timeout_ms", self.sync.call_timeout_ms),
            ("sync.retry_attempts", u64::from(self.sync.retry_attempts)),
            ("sync.debounce_ms", self.sync.debounce_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::ConfigValidation {
                    message: format!("{name} must be greater than 0"),
                });
            }
        }

        if self.sync.initial_backoff_ms > self.sync.max_backoff_ms {
            return Err(Error::ConfigValidation {
                message: format!(
                    "initial_backoff_ms ({}) cannot be greater than max_backoff_ms ({})",
                    self.sync.initial_backoff_ms, self.sync.max_backoff_ms
                ),
            });
        }

        Ok(())
    }

    /// Get the database path, resolving defaults if not set.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(DATABASE_FILE_NAME))
    }

    /// Get the busy timeout as a Duration.
    #[must_use]
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.storage.busy_timeout_ms)
    }
}
