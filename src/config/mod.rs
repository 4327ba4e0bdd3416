//! Configuration management for the feed watcher
//!
//! This module handles loading and validating configuration from environment variables,
//! files, and command-line arguments.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::crawler::fetcher::{DEFAULT_FEED_URL_TEMPLATE, FEED_ID_PLACEHOLDER};
use crate::crawler::pipeline::DispatcherConfig;
use crate::scheduler::IntervalPolicy;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Worker pool and HTTP settings
    pub watcher: WatcherConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Progress snapshot output
    pub progress: ProgressConfig,

    /// Poll interval policy
    pub schedule: IntervalPolicy,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Worker pool and HTTP settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Number of concurrent workers
    pub concurrency: usize,

    /// Fleet-wide request ceiling (requests per second, floored at 1)
    pub requests_per_second: f64,

    /// Target queue depth in continuous mode
    pub batch_size: usize,

    /// Seconds between queue top-ups in continuous mode
    pub tick_secs: u64,

    /// Channels reserved by a bounded run; 0 means `concurrency * 4`
    pub once_limit: usize,

    /// Request timeout in seconds
    pub request_timeout_secs: u64,

    /// Seconds after which another dispatcher may reclaim a reservation
    pub reservation_lease_secs: u64,

    /// User agent string
    pub user_agent: String,

    /// Feed location with a `{feed_id}` placeholder
    pub feed_url_template: String,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            concurrency: 200,
            requests_per_second: 15.0,
            batch_size: 800,
            tick_secs: 5,
            once_limit: 0,
            request_timeout_secs: 20,
            reservation_lease_secs: 3600,
            user_agent: format!("feedwatch/{}", env!("CARGO_PKG_VERSION")),
            feed_url_template: DEFAULT_FEED_URL_TEMPLATE.to_string(),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database path
    pub sqlite_path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from("data/rss_watch.sqlite"),
        }
    }
}

/// Progress snapshot output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// JSON file rewritten on every tick; `None` disables it
    pub json_path: Option<PathBuf>,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            json_path: Some(PathBuf::from("data/rss_progress.json")),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Unset or unparseable variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();
        Ok(config)
    }

    /// Overlay `FEEDWATCH_*` environment variables onto this configuration
    pub fn apply_env(&mut self) {
        let w = &mut self.watcher;
        if let Some(v) = env_parse("FEEDWATCH_CONCURRENCY") {
            w.concurrency = v;
        }
        if let Some(v) = env_parse("FEEDWATCH_RPS") {
            w.requests_per_second = v;
        }
        if let Some(v) = env_parse("FEEDWATCH_BATCH_SIZE") {
            w.batch_size = v;
        }
        if let Some(v) = env_parse("FEEDWATCH_TICK_SECS") {
            w.tick_secs = v;
        }
        if let Some(v) = env_parse("FEEDWATCH_ONCE_LIMIT") {
            w.once_limit = v;
        }
        if let Some(v) = env_parse("FEEDWATCH_REQUEST_TIMEOUT") {
            w.request_timeout_secs = v;
        }
        if let Some(v) = env_parse("FEEDWATCH_RESERVATION_LEASE") {
            w.reservation_lease_secs = v;
        }
        if let Ok(v) = std::env::var("FEEDWATCH_USER_AGENT") {
            w.user_agent = v;
        }
        if let Ok(v) = std::env::var("FEEDWATCH_FEED_URL_TEMPLATE") {
            w.feed_url_template = v;
        }
        if let Ok(v) = std::env::var("FEEDWATCH_SQLITE_PATH") {
            self.database.sqlite_path = v.into();
        }
        if let Ok(v) = std::env::var("FEEDWATCH_PROGRESS_PATH") {
            self.progress.json_path = (!v.is_empty()).then(|| v.into());
        }
        if let Ok(v) = std::env::var("FEEDWATCH_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Ok(v) = std::env::var("FEEDWATCH_LOG_FORMAT") {
            self.logging.format = v;
        }
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.watcher.concurrency == 0 {
            anyhow::bail!("concurrency must be greater than 0");
        }

        let rps = self.watcher.requests_per_second;
        if rps.is_nan() || rps <= 0.0 {
            anyhow::bail!("requests_per_second must be positive");
        }

        if self.watcher.batch_size == 0 {
            anyhow::bail!("batch_size must be greater than 0");
        }

        if self.watcher.tick_secs == 0 {
            anyhow::bail!("tick_secs must be greater than 0");
        }

        // A live cycle must never outlast its own reservation
        if self.watcher.reservation_lease_secs <= self.watcher.request_timeout_secs {
            anyhow::bail!("reservation_lease_secs must exceed request_timeout_secs");
        }

        if !self.watcher.feed_url_template.contains(FEED_ID_PLACEHOLDER) {
            anyhow::bail!("feed_url_template must contain {FEED_ID_PLACEHOLDER}");
        }

        self.schedule
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid schedule: {e}"))?;

        Ok(())
    }

    /// Get request timeout as Duration
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.watcher.request_timeout_secs)
    }

    /// Channels reserved by a bounded run
    #[must_use]
    pub fn once_limit(&self) -> usize {
        if self.watcher.once_limit == 0 {
            self.watcher.concurrency * 4
        } else {
            self.watcher.once_limit
        }
    }

    /// Dispatcher settings derived from the watcher section
    #[must_use]
    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            concurrency: self.watcher.concurrency,
            batch_size: self.watcher.batch_size,
            tick: Duration::from_secs(self.watcher.tick_secs),
            reservation_lease: Duration::from_secs(self.watcher.reservation_lease_secs),
        }
    }
}
