use std::time::Duration;

use serde::Deserialize;

use crate::error::LockError;
use crate::retry::RetryStrategy;
use crate::script::LockScripts;

/// Runtime settings for a [`DistributedLock`](crate::DistributedLock).
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// TTL applied to the store record on acquisition. Truncated to whole
    /// milliseconds.
    pub lease: Duration,
    /// Delay schedule between contended acquisition attempts.
    pub retry: RetryStrategy,
    /// Unlock and extend scripts registered at construction.
    pub scripts: LockScripts,
}

impl LockOptions {
    /// Options with a fixed lease and a constant poll interval.
    #[must_use]
    pub fn new(lease: Duration, poll_interval: Duration) -> Self {
        Self {
            lease,
            retry: RetryStrategy::constant(poll_interval),
            scripts: LockScripts::default(),
        }
    }

    #[must_use]
    pub fn with_retry_strategy(mut self, retry: RetryStrategy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_scripts(mut self, scripts: LockScripts) -> Self {
        self.scripts = scripts;
        self
    }

    /// Reject settings the store cannot honour.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::InvalidConfig`] when the lease is shorter than one
    /// millisecond.
    pub fn validate(&self) -> Result<(), LockError> {
        if self.lease < Duration::from_millis(1) {
            return Err(LockError::InvalidConfig(format!(
                "lease must be at least 1ms, got {:?}",
                self.lease
            )));
        }
        Ok(())
    }
}

impl Default for LockOptions {
    fn default() -> Self {
        LockConfig::default().to_options()
    }
}

/// Serializable lock settings, typically a table in a TOML file.
///
/// # Example
///
/// ```toml
/// lease_ms = 10000
/// poll_interval_ms = 50
///
/// [backoff]
/// kind = "exponential"
/// max_ms = 2000
/// multiplier = 2.0
/// jitter = true
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    /// Lease duration in milliseconds.
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,
    /// Poll interval in milliseconds. Also the base delay for non-constant
    /// backoff kinds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Optional growth of the poll interval under contention.
    #[serde(default)]
    pub backoff: Option<BackoffConfig>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_ms: default_lease_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            backoff: None,
        }
    }
}

fn default_lease_ms() -> u64 {
    30_000
}

fn default_poll_interval_ms() -> u64 {
    100
}

impl LockConfig {
    /// Convert into runtime [`LockOptions`] with the built-in scripts.
    #[must_use]
    pub fn to_options(&self) -> LockOptions {
        let poll = Duration::from_millis(self.poll_interval_ms);
        let retry = match &self.backoff {
            None => RetryStrategy::constant(poll),
            Some(backoff) => backoff.to_strategy(poll),
        };
        LockOptions::new(Duration::from_millis(self.lease_ms), poll).with_retry_strategy(retry)
    }
}

/// Backoff curve applied on top of the poll interval.
#[derive(Debug, Clone, Deserialize)]
pub struct BackoffConfig {
    pub kind: BackoffKind,
    /// Upper bound on any single delay, in milliseconds.
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
    /// Growth factor for `exponential`.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Deterministic jitter for `exponential`.
    #[serde(default)]
    pub jitter: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Constant,
    Linear,
    Exponential,
}

fn default_backoff_max_ms() -> u64 {
    5_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl BackoffConfig {
    fn to_strategy(&self, poll: Duration) -> RetryStrategy {
        let max = Duration::from_millis(self.max_ms);
        match self.kind {
            BackoffKind::Constant => RetryStrategy::constant(poll),
            BackoffKind::Linear => RetryStrategy::Linear { delay: poll, max },
            BackoffKind::Exponential => RetryStrategy::Exponential {
                base: poll,
                max,
                multiplier: self.multiplier,
                jitter: self.jitter,
            },
        }
    }
}
