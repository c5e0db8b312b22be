use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::script::{LockScript, ScriptHandle};

/// The atomic key-value operations a [`DistributedLock`](crate::DistributedLock)
/// is built on.
///
/// Implementations must be `Send + Sync` and safe for concurrent access from
/// many lock handles. Every method must be atomic with respect to other
/// clients of the same store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Set `key` to `value` with the given TTL only if `key` is absent.
    /// Returns `true` if the key was set, `false` if it already existed.
    async fn conditional_set(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Get the value for a key. Returns `None` if not found or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Upload or compile a script once, returning a handle for reuse.
    async fn register_script(&self, script: &LockScript) -> Result<ScriptHandle, StoreError>;

    /// Run a registered script atomically.
    ///
    /// Returns the script's boolean verdict: `true` when the compare matched
    /// and the mutation happened.
    async fn execute_script(
        &self,
        handle: &ScriptHandle,
        keys: &[&str],
        args: &[&str],
    ) -> Result<bool, StoreError>;
}
