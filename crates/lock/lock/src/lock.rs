//! The client-side lock handle.
//!
//! A [`DistributedLock`] is bound to one resource key in a shared
//! [`KeyValueStore`]. Ownership is established with a conditional-set of a
//! fresh [`OwnershipToken`] and proven on every later mutation by a
//! compare-and-act script, so a handle can never delete or extend a record
//! written by somebody else.
//!
//! # Guarantees
//!
//! - At most one handle observes a successful conditional-set for a key until
//!   the record is released or its lease expires.
//! - Leases are not renewed in the background. A holder that neither releases
//!   nor extends before the lease elapses silently loses the lock, and no
//!   fencing token protects downstream writes against that case.
//! - Waiters are not queued; whichever poll lands first after the record
//!   disappears wins.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use keylock::{DistributedLock, LockOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! let options = LockOptions::new(Duration::from_secs(30), Duration::from_millis(100));
//! let mut lock = DistributedLock::new(store, "job:1", options).await?;
//!
//! lock.acquire(&CancellationToken::new()).await?;
//! // Critical section...
//! lock.release().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::LockOptions;
use crate::error::LockError;
use crate::script::{LockScript, ScriptHandle, ScriptKind};
use crate::store::KeyValueStore;
use crate::token::{Ownership, OwnershipToken};

/// Mutual-exclusion handle for one resource key.
///
/// Methods that change ownership take `&mut self`: a handle serves one caller
/// at a time. Independent handles, usually in different processes, contend
/// through the store.
pub struct DistributedLock {
    store: Arc<dyn KeyValueStore>,
    key: String,
    options: LockOptions,
    ownership: Ownership,
    unlock_script: ScriptHandle,
    extend_script: ScriptHandle,
}

impl DistributedLock {
    /// Bind a handle to `key` and register the unlock and extend scripts.
    ///
    /// # Errors
    ///
    /// - [`LockError::InvalidConfig`] for an empty key, a lease under one
    ///   millisecond, or scripts whose kinds are swapped.
    /// - [`LockError::Registration`] if the store rejects either script.
    pub async fn new(
        store: Arc<dyn KeyValueStore>,
        key: impl Into<String>,
        options: LockOptions,
    ) -> Result<Self, LockError> {
        let key = key.into();
        if key.is_empty() {
            return Err(LockError::InvalidConfig(
                "resource key must not be empty".into(),
            ));
        }
        options.validate()?;

        let unlock_script =
            register(store.as_ref(), &options.scripts.unlock, ScriptKind::Unlock).await?;
        let extend_script =
            register(store.as_ref(), &options.scripts.extend, ScriptKind::Extend).await?;

        Ok(Self {
            store,
            key,
            options,
            ownership: Ownership::Unheld,
            unlock_script,
            extend_script,
        })
    }

    /// Wait until the lock is acquired or `cancel` fires.
    ///
    /// Polls the store with a conditional-set, sleeping between contended
    /// attempts according to the configured retry strategy. Only "key already
    /// present" is retried; any store error aborts the wait.
    ///
    /// # Errors
    ///
    /// - [`LockError::AlreadyLocked`] if this handle already holds the lock.
    /// - [`LockError::Cancelled`] once `cancel` is observed.
    /// - [`LockError::Store`] for any store failure.
    pub async fn acquire(&mut self, cancel: &CancellationToken) -> Result<(), LockError> {
        self.acquire_until(cancel, None).await
    }

    /// Wait until the lock is acquired or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// As [`acquire`](Self::acquire), with [`LockError::Timeout`] in place of
    /// cancellation.
    pub async fn acquire_timeout(&mut self, timeout: Duration) -> Result<(), LockError> {
        let deadline = Instant::now().checked_add(timeout).map(|at| (at, timeout));
        self.acquire_until(&CancellationToken::new(), deadline).await
    }

    /// Make a single acquisition attempt. Returns `false` if another owner
    /// holds the key.
    ///
    /// # Errors
    ///
    /// [`LockError::AlreadyLocked`] or [`LockError::Store`].
    pub async fn try_acquire(&mut self) -> Result<bool, LockError> {
        self.ensure_unheld()?;
        let token = OwnershipToken::generate();
        let acquired = self.attempt(&token).await?;
        if acquired {
            debug!(key = %self.key, attempts = 1, "lock acquired");
            self.ownership = Ownership::Held(token);
        }
        Ok(acquired)
    }

    async fn acquire_until(
        &mut self,
        cancel: &CancellationToken,
        deadline: Option<(Instant, Duration)>,
    ) -> Result<(), LockError> {
        self.ensure_unheld()?;
        let token = OwnershipToken::generate();
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                debug!(key = %self.key, attempts = attempt, "lock acquisition cancelled");
                return Err(LockError::Cancelled);
            }

            if self.attempt(&token).await? {
                debug!(key = %self.key, attempts = attempt.saturating_add(1), "lock acquired");
                self.ownership = Ownership::Held(token);
                return Ok(());
            }

            let mut delay = self.options.retry.delay_for(attempt);
            if let Some((at, timeout)) = deadline {
                let now = Instant::now();
                if now >= at {
                    debug!(
                        key = %self.key,
                        attempts = attempt.saturating_add(1),
                        ?timeout,
                        "lock acquisition timed out"
                    );
                    return Err(LockError::Timeout(timeout));
                }
                delay = delay.min(at - now);
            }
            trace!(key = %self.key, attempt, ?delay, "lock contended, retrying");

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!(key = %self.key, attempts = attempt.saturating_add(1), "lock acquisition cancelled");
                    return Err(LockError::Cancelled);
                }
                () = tokio::time::sleep(delay) => {}
            }
            attempt = attempt.saturating_add(1);
        }
    }

    /// Release the lock if the store still records this handle's token.
    ///
    /// When the store holds another token (the lease expired and someone else
    /// acquired) the record is left alone, the local token is dropped, and
    /// [`LockError::NotOwner`] is returned.
    ///
    /// # Errors
    ///
    /// - [`LockError::NotOwner`] if not held locally or not held in the store.
    /// - [`LockError::Store`] if the script call fails. Ownership is then
    ///   indeterminate and the local token is kept so the release can be
    ///   retried.
    pub async fn release(&mut self) -> Result<(), LockError> {
        let Ownership::Held(token) = &self.ownership else {
            return Err(self.not_owner());
        };

        let released = self
            .store
            .execute_script(&self.unlock_script, &[self.key.as_str()], &[token.as_str()])
            .await?;

        self.ownership = Ownership::Unheld;
        if released {
            debug!(key = %self.key, "lock released");
            Ok(())
        } else {
            warn!(key = %self.key, "lock was not held by this owner at release time");
            Err(self.not_owner())
        }
    }

    /// Replace the remaining lease with `duration`, measured from now.
    ///
    /// The duration is truncated to whole milliseconds; zero expires the
    /// record immediately.
    ///
    /// # Errors
    ///
    /// - [`LockError::NotOwner`] if not held locally or not held in the store.
    ///   The local token is kept; callers should treat the lock as lost.
    /// - [`LockError::Store`] if the script call fails.
    pub async fn extend(&mut self, duration: Duration) -> Result<(), LockError> {
        let Ownership::Held(token) = &self.ownership else {
            return Err(self.not_owner());
        };

        let ttl_ms = duration.as_millis().to_string();
        let extended = self
            .store
            .execute_script(
                &self.extend_script,
                &[self.key.as_str()],
                &[token.as_str(), ttl_ms.as_str()],
            )
            .await?;

        if extended {
            debug!(key = %self.key, ttl_ms = %ttl_ms, "lock extended");
            Ok(())
        } else {
            warn!(key = %self.key, "lock is no longer held by this owner");
            Err(self.not_owner())
        }
    }

    /// Ask the store whether it still records this handle's token.
    ///
    /// # Errors
    ///
    /// [`LockError::Store`] if the read fails.
    pub async fn is_held(&self) -> Result<bool, LockError> {
        let Some(token) = self.ownership.token() else {
            return Ok(false);
        };
        let current = self.store.get(&self.key).await?;
        Ok(current.as_deref() == Some(token.as_str()))
    }

    /// Whether this handle believes it holds the lock. May be stale.
    #[must_use]
    pub fn is_locally_held(&self) -> bool {
        self.ownership.is_held()
    }

    #[must_use]
    pub fn token(&self) -> Option<&OwnershipToken> {
        self.ownership.token()
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    async fn attempt(&self, token: &OwnershipToken) -> Result<bool, LockError> {
        Ok(self
            .store
            .conditional_set(&self.key, token.as_str(), self.options.lease)
            .await?)
    }

    fn ensure_unheld(&self) -> Result<(), LockError> {
        if self.ownership.is_held() {
            return Err(LockError::AlreadyLocked {
                key: self.key.clone(),
            });
        }
        Ok(())
    }

    fn not_owner(&self) -> LockError {
        LockError::NotOwner {
            key: self.key.clone(),
        }
    }
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("key", &self.key)
            .field("ownership", &self.ownership)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

async fn register(
    store: &dyn KeyValueStore,
    script: &LockScript,
    expected: ScriptKind,
) -> Result<ScriptHandle, LockError> {
    if script.kind() != expected {
        return Err(LockError::InvalidConfig(format!(
            "expected a {expected} script, got a {} script",
            script.kind()
        )));
    }
    store
        .register_script(script)
        .await
        .map_err(LockError::Registration)
}
