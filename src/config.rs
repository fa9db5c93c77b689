//! Application configuration and environment variable parsing.
//!
//! This module handles loading configuration settings from the environment (e.g., .env file).
//! It defines the `AppConfig` struct which governs behavior such as the poll cadence,
//! metric retention, and how aggressively commit history is pulled from GitHub.

use serde::Deserialize;
use std::time::Duration as StdDuration;

/// Application configuration loaded from environment variables.
#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    /// Connection string for the sqlite store (e.g. "sqlite://hackshon.db").
    pub database_url: String,

    /// Upper bound on pooled database connections.
    /// In-memory databases always use a single connection.
    #[serde(default = "default_max_connections")]
    pub database_max_connections: u32,

    /// Optional GitHub Personal Access Token for higher rate limits.
    pub github_token: Option<String>,

    /// Port the HTTP server binds to.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Seconds between two scheduled poll cycles.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,

    /// Whether adding a repository immediately triggers a poll cycle.
    #[serde(default = "default_true")]
    pub poll_on_repository_create: bool,

    /// Metric rows older than this many days are pruned after each cycle.
    /// Zero keeps everything.
    #[serde(default = "default_retention_days")]
    pub metrics_retention_days: u32,

    /// Hard limit on the number of commit list pages requested per history call.
    #[serde(default = "default_max_commit_pages")]
    pub max_commit_pages: u32,

    /// Minimum spacing between two per-commit detail requests, in milliseconds.
    #[serde(default = "default_commit_fetch_delay")]
    pub commit_fetch_delay_ms: u64,

    /// Maximum number of commit stats kept in memory.
    #[serde(default = "default_commit_cache_capacity")]
    pub commit_cache_capacity: u64,

    /// Timeout applied to every outbound GitHub request, in seconds.
    #[serde(default = "default_github_timeout")]
    pub github_timeout_seconds: u64,

    /// Directory holding the built dashboard bundle.
    #[serde(default = "default_static_dir")]
    pub static_dir: String,
}

fn default_max_connections() -> u32 {
    5
}

fn default_port() -> u16 {
    3000
}

fn default_poll_interval() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_retention_days() -> u32 {
    30
}

fn default_max_commit_pages() -> u32 {
    10
}

fn default_commit_fetch_delay() -> u64 {
    100
}

fn default_commit_cache_capacity() -> u64 {
    10_000
}

fn default_github_timeout() -> u64 {
    30
}

fn default_static_dir() -> String {
    "dist".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::from_env()
    }

    /// Builds a configuration with defaults for everything but the database.
    pub fn with_database(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            database_max_connections: default_max_connections(),
            github_token: None,
            port: default_port(),
            poll_interval_seconds: default_poll_interval(),
            poll_on_repository_create: true,
            metrics_retention_days: default_retention_days(),
            max_commit_pages: default_max_commit_pages(),
            commit_fetch_delay_ms: default_commit_fetch_delay(),
            commit_cache_capacity: default_commit_cache_capacity(),
            github_timeout_seconds: default_github_timeout(),
            static_dir: default_static_dir(),
        }
    }

    /// Period of the scheduled poller. Never zero.
    pub fn poll_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.poll_interval_seconds.max(1))
    }

    pub fn commit_fetch_delay(&self) -> StdDuration {
        StdDuration::from_millis(self.commit_fetch_delay_ms)
    }

    pub fn github_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.github_timeout_seconds.max(1))
    }

    /// How long metric rows are kept, `None` when pruning is disabled.
    pub fn metrics_retention(&self) -> Option<chrono::Duration> {
        (self.metrics_retention_days > 0)
            .then(|| chrono::Duration::days(i64::from(self.metrics_retention_days)))
    }
}
