//! Configuration module for rssagg.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::feed::fetcher::validate_url;
use crate::{Result, RssaggError};

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file (":memory:" for a transient store).
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "data/rssagg.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/rssagg.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// What the scheduler does when the catalog cannot produce a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CatalogErrorPolicy {
    /// Log the failure and try again on the next tick.
    #[default]
    Retry,
    /// Stop the scheduler and return the error to the caller.
    Abort,
}

/// Scheduler configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Batch width and worker-pool width.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Tick period in seconds.
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// Reaction to a failing catalog selection.
    #[serde(default)]
    pub on_catalog_error: CatalogErrorPolicy,
}

fn default_concurrency() -> usize {
    10
}

fn default_interval() -> u64 {
    60
}

impl SchedulerConfig {
    /// Tick period as a duration.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            interval_secs: default_interval(),
            on_catalog_error: CatalogErrorPolicy::default(),
        }
    }
}

/// Fetch client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    /// Total request timeout in seconds.
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,
    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Maximum feed size in bytes.
    #[serde(default = "default_max_feed_size")]
    pub max_feed_size_bytes: u64,
    /// Maximum number of redirects.
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    /// User agent sent with every request.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_fetch_timeout() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_max_feed_size() -> u64 {
    5 * 1024 * 1024 // 5MB
}

fn default_max_redirects() -> usize {
    5
}

fn default_user_agent() -> String {
    concat!("rssagg/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            max_feed_size_bytes: default_max_feed_size(),
            max_redirects: default_max_redirects(),
            user_agent: default_user_agent(),
        }
    }
}

/// A source registered at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedSource {
    /// Feed URL.
    pub url: String,
    /// Display name (defaults to the URL).
    #[serde(default)]
    pub name: Option<String>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Scheduler configuration.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Fetch client configuration.
    #[serde(default)]
    pub fetch: FetchConfig,
    /// Seed sources.
    #[serde(default)]
    pub sources: Vec<SeedSource>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(RssaggError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment variable overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| RssaggError::Config(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `RSSAGG_DB_PATH`: database file path
    /// - `RSSAGG_LOG_LEVEL`: log level
    /// - `RSSAGG_CONCURRENCY`: scheduler width
    /// - `RSSAGG_INTERVAL_SECS`: tick period
    ///
    /// Empty or unparseable values are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(path) = env_non_empty("RSSAGG_DB_PATH") {
            self.database.path = path;
        }
        if let Some(level) = env_non_empty("RSSAGG_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(n) = env_non_empty("RSSAGG_CONCURRENCY").and_then(|v| v.parse().ok()) {
            self.scheduler.concurrency = n;
        }
        if let Some(secs) = env_non_empty("RSSAGG_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            self.scheduler.interval_secs = secs;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.concurrency == 0 {
            return Err(RssaggError::Config(
                "scheduler.concurrency must be at least 1".to_string(),
            ));
        }
        if self.scheduler.interval_secs == 0 {
            return Err(RssaggError::Config(
                "scheduler.interval_secs must be at least 1".to_string(),
            ));
        }
        if self.fetch.timeout_secs == 0 {
            return Err(RssaggError::Config(
                "fetch.timeout_secs must be at least 1".to_string(),
            ));
        }
        for seed in &self.sources {
            validate_url(&seed.url)
                .map_err(|e| RssaggError::Config(format!("seed source {}: {e}", seed.url)))?;
        }
        Ok(())
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}
