use std::time::Duration;

use thiserror::Error;

/// Errors raised by a [`KeyValueStore`](crate::store::KeyValueStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("script error: {0}")]
    Script(String),

    #[error("unknown script handle: {0}")]
    UnknownScript(String),
}

/// Errors from distributed lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    /// `acquire` was called on a handle that already holds the lock.
    #[error("lock {key} is already held by this handle")]
    AlreadyLocked { key: String },

    /// The handle does not hold the lock, or the store reports that another
    /// owner (or nobody) holds it now.
    #[error("lock {key} is not held by this handle")]
    NotOwner { key: String },

    #[error("script registration failed: {0}")]
    Registration(#[source] StoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("lock acquisition cancelled")]
    Cancelled,

    #[error("lock acquisition timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid lock configuration: {0}")]
    InvalidConfig(String),
}

impl LockError {
    /// Whether the error means ownership is definitively gone.
    #[must_use]
    pub fn is_not_owner(&self) -> bool {
        matches!(self, Self::NotOwner { .. })
    }
}
