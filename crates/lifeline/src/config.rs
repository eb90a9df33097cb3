//! Configuration management for lifeline.
//!
//! Configuration is loaded with figment from defaults, a TOML file and
//! `LIFELINE_`-prefixed environment variables, then validated.

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
const DATA_DIR_NAME: &str = "lifeline";

/// Default database file name.
const DATABASE_FILE_NAME: &str = "state.db";

/// Longest position timeout we accept, in milliseconds.
const MAX_POSITION_TIMEOUT_MS: u64 = 60_000;

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (`LIFELINE_SECTION__KEY`, e.g. `LIFELINE_CACHE__TTL_DAYS`)
/// 2. TOML config file at `~/.config/lifeline/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Contact cache configuration.
    pub cache: CacheConfig,
    /// Alert outbox configuration.
    pub outbox: OutboxConfig,
    /// Location tracking configuration.
    pub tracking: TrackingConfig,
    /// Remote write retry configuration.
    pub retry: RetryConfig,
    /// Connectivity monitoring configuration.
    pub connectivity: ConnectivityConfig,
}

/// Storage-related configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the database file.
    /// Defaults to `~/.local/share/lifeline/state.db`
    pub database_path: Option<PathBuf>,
}

/// Contact cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How long a cached contact set stays valid, in days.
    pub ttl_days: u32,
    /// Deadline for a remote contact fetch, in seconds.
    pub fetch_timeout_secs: u64,
}

/// Alert outbox configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Age after which any queued alert is dropped, in hours.
    pub dead_letter_hours: u32,
    /// Interval between dead-letter sweeps, in minutes.
    pub sweep_interval_minutes: u32,
    /// Interval between retries of queued alerts while online, in seconds.
    pub retry_interval_secs: u64,
}

/// Location tracking configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Maximum number of samples kept in the history buffer.
    pub history_capacity: usize,
    /// Request high-accuracy fixes from the position source.
    pub high_accuracy: bool,
    /// Position acquisition timeout in milliseconds.
    pub position_timeout_ms: u64,
    /// Maximum age of a cached fix the source may return, in milliseconds.
    pub maximum_age_ms: u64,
    /// Default auto-share interval, in minutes.
    pub auto_share_interval_minutes: u32,
}

/// Remote write retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts before a best-effort write gives up.
    pub max_attempts: u32,
    /// Base delay for linear backoff, in milliseconds.
    pub base_delay_ms: u64,
    /// Abort deadline for a single remote write, in seconds.
    pub write_timeout_secs: u64,
}

/// Connectivity monitoring configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    /// Interval between platform link-state polls, in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_days: 7,
            fetch_timeout_secs: 10,
        }
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            dead_letter_hours: 24,
            sweep_interval_minutes: 60,
            retry_interval_secs: 60,
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
            high_accuracy: true,
            position_timeout_ms: 10_000,
            maximum_age_ms: 0,
            auto_share_interval_minutes: 5,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            write_timeout_secs: 12,
        }
    }
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
        }
    }
}

impl Config {
    /// Load configuration from all sources.
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
            .merge(Env::prefixed("LIFELINE_").split("__"));

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
        let invalid = |message: String| Err(Error::ConfigValidation { message });

        if self.cache.ttl_days == 0 {
            return invalid("cache.ttl_days must be greater than 0".to_string());
        }
        if self.cache.fetch_timeout_secs == 0 {
            return invalid("cache.fetch_timeout_secs must be greater than 0".to_string());
        }
        if self.outbox.dead_letter_hours == 0 {
            return invalid("outbox.dead_letter_hours must be greater than 0".to_string());
        }
        if self.outbox.sweep_interval_minutes == 0 {
            return invalid("outbox.sweep_interval_minutes must be greater than 0".to_string());
        }
        if self.outbox.retry_interval_secs == 0 {
            return invalid("outbox.retry_interval_secs must be greater than 0".to_string());
        }
        if self.tracking.history_capacity == 0 {
            return invalid("tracking.history_capacity must be greater than 0".to_string());
        }
        if self.tracking.position_timeout_ms == 0
            || self.tracking.position_timeout_ms > MAX_POSITION_TIMEOUT_MS
        {
            return invalid(format!(
                "tracking.position_timeout_ms ({}) must be between 1 and {MAX_POSITION_TIMEOUT_MS}",
                self.tracking.position_timeout_ms
            ));
        }
        if self.tracking.auto_share_interval_minutes == 0 {
            return invalid(
                "tracking.auto_share_interval_minutes must be greater than 0".to_string(),
            );
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be greater than 0".to_string());
        }
        if self.retry.write_timeout_secs == 0 {
            return invalid("retry.write_timeout_secs must be greater than 0".to_string());
        }
        if self.connectivity.poll_interval_ms == 0 {
            return invalid("connectivity.poll_interval_ms must be greater than 0".to_string());
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

    /// Contact cache time-to-live.
    #[must_use]
    pub fn cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.cache.ttl_days))
    }

    /// Deadline for a remote contact fetch.
    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.cache.fetch_timeout_secs)
    }

    /// Age after which queued alerts are dead-lettered.
    #[must_use]
    pub fn dead_letter_age(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.outbox.dead_letter_hours))
    }

    /// Interval between dead-letter sweeps.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.outbox.sweep_interval_minutes) * 60)
    }

    /// Interval between outbox retries while online.
    #[must_use]
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.outbox.retry_interval_secs)
    }

    /// Position acquisition timeout.
    #[must_use]
    pub fn position_timeout(&self) -> Duration {
        Duration::from_millis(self.tracking.position_timeout_ms)
    }

    /// Linear backoff base delay.
    #[must_use]
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry.base_delay_ms)
    }

    /// Abort deadline for a single remote write.
    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.retry.write_timeout_secs)
    }

    /// Interval between link-state polls.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.connectivity.poll_interval_ms)
    }
}
