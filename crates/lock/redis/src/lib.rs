//! Redis backend for keylock.
//!
//! Provides [`RedisStore`], a [`KeyValueStore`] that maps conditional-set to
//! `SET NX PX` and runs the unlock and extend scripts with `EVALSHA`.
//!
//! # Lock Consistency
//!
//! | Deployment | Mutual Exclusion | Notes |
//! |------------|------------------|-------|
//! | Single instance | Strong | Full mutual exclusion guaranteed |
//! | Sentinel | Weak | Lock may be lost during failover |
//! | Cluster | Weak | Lock may be lost during failover |
//!
//! See the [`store`] module documentation for details.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use keylock::{DistributedLock, LockOptions};
//! use keylock_redis::{RedisConfig, RedisStore};
//!
//! let store = Arc::new(RedisStore::new(&RedisConfig::new("redis://localhost:6379"))?);
//! let options = LockOptions::new(Duration::from_secs(30), Duration::from_millis(100));
//! let mut lock = DistributedLock::new(store, "job:1", options).await?;
//! ```
//!
//! [`KeyValueStore`]: keylock::KeyValueStore

mod config;
mod key_render;
pub mod store;

pub use config::RedisConfig;
pub use store::RedisStore;
