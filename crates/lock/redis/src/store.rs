//! Redis-backed key-value store for distributed locking.
//!
//! # How It Works
//!
//! - **Conditional-set**: `SET key token NX PX milliseconds`. The key is only
//!   written if absent and expires on its own if the holder crashes.
//! - **Scripts**: `SCRIPT LOAD` once per lock handle; the returned SHA1 digest
//!   is the [`ScriptHandle`]. Execution uses `EVALSHA`, which Redis runs
//!   atomically, so the read-compare-mutate inside the unlock and extend
//!   scripts cannot interleave with another client.
//! - **Script cache loss**: after a restart, failover or `SCRIPT FLUSH`,
//!   `EVALSHA` answers `NOSCRIPT` without running anything. The store then
//!   sends the remembered source with `EVAL`, which also re-caches it.
//!
//! # Guarantees
//!
//! Mutual exclusion holds on a single Redis instance, assuming the lease is
//! longer than the critical section. With replication (Sentinel, Cluster) a
//! lock written to a master that fails before replicating can be acquired
//! again on the promoted replica.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use deadpool_redis::{Config, Pool, Runtime};
use redis::{AsyncCommands, Cmd, ErrorKind};

use keylock::error::StoreError;
use keylock::script::{LockScript, ScriptHandle};
use keylock::store::KeyValueStore;

use crate::config::RedisConfig;
use crate::key_render::render_key;

/// Redis implementation of [`KeyValueStore`].
///
/// Uses a `deadpool-redis` connection pool. One store can back any number of
/// lock handles.
pub struct RedisStore {
    pool: Pool,
    prefix: Option<String>,
    /// Script sources by SHA1, for the `NOSCRIPT` fallback.
    sources: DashMap<String, String>,
}

impl RedisStore {
    /// Create a new `RedisStore` from the provided configuration.
    ///
    /// No connection is opened until the first operation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the pool cannot be created.
    pub fn new(config: &RedisConfig) -> Result<Self, StoreError> {
        let cfg = Config::from_url(&config.url);
        let pool = cfg
            .builder()
            .map(|b| {
                b.max_size(config.pool_size)
                    .wait_timeout(Some(config.connection_timeout()))
                    .create_timeout(Some(config.connection_timeout()))
                    .runtime(Runtime::Tokio1)
                    .build()
            })
            .map_err(|e| StoreError::Connection(e.to_string()))?
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(Self {
            pool,
            prefix: config.prefix.clone(),
            sources: DashMap::new(),
        })
    }

    fn redis_key(&self, key: &str) -> String {
        render_key(self.prefix.as_deref(), key)
    }

    /// Obtain a connection from the pool.
    async fn conn(&self) -> Result<deadpool_redis::Connection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    fn script_cmd(&self, verb: &str, script: &str, keys: &[&str], args: &[&str]) -> Cmd {
        let mut cmd = redis::cmd(verb);
        cmd.arg(script).arg(keys.len());
        for key in keys {
            cmd.arg(self.redis_key(key));
        }
        for arg in args {
            cmd.arg(*arg);
        }
        cmd
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn conditional_set(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let redis_key = self.redis_key(key);
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let mut conn = self.conn().await?;

        // `SET ... NX` replies OK when written and nil when the key exists.
        let reply: Option<String> = redis::cmd("SET")
            .arg(&redis_key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let redis_key = self.redis_key(key);
        let mut conn = self.conn().await?;
        conn.get(&redis_key)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn register_script(&self, script: &LockScript) -> Result<ScriptHandle, StoreError> {
        let mut conn = self.conn().await?;
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(script.source())
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Script(e.to_string()))?;

        tracing::debug!(script = %script.kind(), sha = %sha, "registered lock script");
        self.sources.insert(sha.clone(), script.source().to_owned());
        Ok(ScriptHandle::new(sha, script.kind()))
    }

    async fn execute_script(
        &self,
        handle: &ScriptHandle,
        keys: &[&str],
        args: &[&str],
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;

        let result: Result<i64, redis::RedisError> = self
            .script_cmd("EVALSHA", handle.id(), keys, args)
            .query_async(&mut conn)
            .await;

        let verdict = match result {
            Ok(verdict) => verdict,
            Err(e) if e.kind() == ErrorKind::NoScriptError => {
                let source = self
                    .sources
                    .get(handle.id())
                    .map(|s| s.value().clone())
                    .ok_or_else(|| StoreError::UnknownScript(handle.id().to_owned()))?;
                tracing::debug!(script = %handle.kind(), "script cache miss, sending source");

                self.script_cmd("EVAL", &source, keys, args)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| StoreError::Script(e.to_string()))?
            }
            Err(e) => return Err(StoreError::Backend(e.to_string())),
        };

        Ok(verdict == 1)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use keylock::{DistributedLock, LockError, LockOptions};

    use super::*;

    fn unreachable_config() -> RedisConfig {
        RedisConfig {
            url: "redis://127.0.0.1:1".to_string(),
            connection_timeout_ms: 200,
            ..RedisConfig::default()
        }
    }

    #[tokio::test]
    async fn pool_is_created_lazily() {
        let store = RedisStore::new(&unreachable_config());
        assert!(store.is_ok(), "pool creation should not connect");
    }

    #[tokio::test]
    async fn keys_are_prefixed() {
        let store = RedisStore::new(&RedisConfig::default().with_prefix("svc")).unwrap();
        assert_eq!(store.redis_key("job:1"), "svc:job:1");
    }

    #[tokio::test]
    async fn unreachable_server_fails_registration() {
        let store = RedisStore::new(&unreachable_config()).unwrap();
        let options = LockOptions::new(Duration::from_secs(1), Duration::from_millis(10));
        let err = DistributedLock::new(Arc::new(store), "job:1", options)
            .await
            .unwrap_err();
        assert!(
            matches!(err, LockError::Registration(StoreError::Connection(_))),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn unreachable_server_surfaces_connection_error() {
        let store = RedisStore::new(&unreachable_config()).unwrap();
        let err = store
            .conditional_set("job:1", "token", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Connection(_)));
    }
}

#[cfg(all(test, feature = "integration"))]
mod integration_tests {
    use std::sync::Arc;

    use keylock::script::LockScript;

    use super::*;

    fn test_config() -> RedisConfig {
        RedisConfig {
            url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            prefix: Some(format!("keylock-test-{}", uuid::Uuid::new_v4())),
            ..RedisConfig::default()
        }
    }

    #[tokio::test]
    async fn lock_conformance() {
        let store = RedisStore::new(&test_config()).expect("pool creation should succeed");
        keylock::testing::run_lock_conformance_tests(Arc::new(store))
            .await
            .expect("conformance tests should pass");
    }

    #[tokio::test]
    async fn evalsha_recovers_from_flushed_script_cache() {
        let store = RedisStore::new(&test_config()).expect("pool creation should succeed");
        let unlock = store
            .register_script(&LockScript::unlock())
            .await
            .expect("script should load");

        assert!(
            store
                .conditional_set("flush", "owner", Duration::from_secs(10))
                .await
                .unwrap()
        );

        let mut conn = store.conn().await.unwrap();
        let () = redis::cmd("SCRIPT")
            .arg("FLUSH")
            .query_async(&mut conn)
            .await
            .unwrap();
        drop(conn);

        assert!(
            store
                .execute_script(&unlock, &["flush"], &["owner"])
                .await
                .unwrap()
        );
        assert!(store.get("flush").await.unwrap().is_none());
    }
}
