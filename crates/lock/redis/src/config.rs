use std::time::Duration;

use serde::Deserialize;

/// Configuration for the Redis key-value store backend.
///
/// # Example
///
/// ```toml
/// url = "redis://cache:6379/2"
/// prefix = "billing"
/// pool_size = 4
/// connection_timeout_ms = 1000
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL (e.g. `redis://127.0.0.1:6379`).
    #[serde(default = "default_url")]
    pub url: String,

    /// Optional prefix applied to every lock key as `prefix:key`.
    #[serde(default)]
    pub prefix: Option<String>,

    /// Number of connections in the `deadpool-redis` pool.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Timeout for acquiring a pooled connection, in milliseconds.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
}

impl RedisConfig {
    /// Default settings pointed at `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            prefix: None,
            pool_size: default_pool_size(),
            connection_timeout_ms: default_connection_timeout_ms(),
        }
    }
}

fn default_url() -> String {
    String::from("redis://127.0.0.1:6379")
}

fn default_pool_size() -> usize {
    10
}

fn default_connection_timeout_ms() -> u64 {
    5_000
}
