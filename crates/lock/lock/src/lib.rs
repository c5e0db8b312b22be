//! Mutual exclusion for independent processes, coordinated through a shared
//! key-value store.
//!
//! The crate defines the [`KeyValueStore`] operations a backend must provide
//! (conditional-set with TTL, script registration, atomic script execution)
//! and the [`DistributedLock`] handle that runs the acquire / release /
//! extend protocol on top of them. Backends live in sibling crates:
//! `keylock-memory` for a single process and tests, `keylock-redis` for Redis.

pub mod config;
pub mod error;
pub mod lock;
pub mod retry;
pub mod script;
pub mod store;
pub mod testing;
pub mod token;

pub use config::{BackoffConfig, BackoffKind, LockConfig, LockOptions};
pub use error::{LockError, StoreError};
pub use lock::DistributedLock;
pub use retry::RetryStrategy;
pub use script::{LockScript, LockScripts, ScriptHandle, ScriptKind};
pub use store::KeyValueStore;
pub use token::{Ownership, OwnershipToken};
