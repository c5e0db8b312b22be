use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;

use keylock::error::StoreError;
use keylock::script::{LockScript, ScriptHandle, ScriptKind};
use keylock::store::KeyValueStore;

/// A value with its expiry deadline.
#[derive(Debug, Clone)]
struct Record {
    value: String,
    expires_at: Instant,
}

/// Deadline `ttl` from now, or an error if the clock cannot represent it.
fn deadline(ttl: Duration) -> Result<Instant, StoreError> {
    Instant::now()
        .checked_add(ttl)
        .ok_or_else(|| StoreError::Backend(format!("expiry {ttl:?} is out of range")))
}

impl Record {
    fn new(value: &str, ttl: Duration) -> Result<Self, StoreError> {
        Ok(Self {
            value: value.to_owned(),
            expires_at: deadline(ttl)?,
        })
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    fn is_owned_by(&self, token: &str) -> bool {
        !self.is_expired() && self.value == token
    }
}

/// In-memory [`KeyValueStore`] backed by a [`DashMap`].
///
/// Expiry is lazy: an expired record is treated as absent and replaced or
/// evicted on the next access to its key. Keys that are never touched again
/// stay in the map until [`purge_expired`](Self::purge_expired) or
/// [`len`](Self::len) sweeps them.
///
/// Scripts are not interpreted. Registration yields one id per
/// [`ScriptKind`], and executing it runs the native equivalent while holding
/// the key's shard lock, which makes it atomic with respect to every other
/// operation on the map.
///
/// Cloning is cheap and clones share the same data, so several handles in
/// one process contend exactly as separate processes would on a real store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<DashMap<String, Record>>,
    scripts: Arc<DashMap<String, ScriptKind>>,
}

impl MemoryStore {
    /// Create a new, empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current live value under `key`.
    pub fn value(&self, key: &str) -> Option<String> {
        self.records
            .get(key)
            .filter(|r| !r.is_expired())
            .map(|r| r.value.clone())
    }

    /// Time left before `key` expires, or `None` if it is absent.
    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        self.records
            .get(key)
            .filter(|r| !r.is_expired())
            .map(|r| r.expires_at - Instant::now())
    }

    /// Number of live records. Sweeps expired ones first.
    pub fn len(&self) -> usize {
        self.purge_expired();
        self.records.len()
    }

    /// Drop every expired record and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired());
        before.saturating_sub(self.records.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn unlock(&self, key: &str, token: &str) -> bool {
        self.records
            .remove_if(key, |_, record| record.is_owned_by(token))
            .is_some()
    }

    fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StoreError> {
        match self.records.get_mut(key) {
            Some(mut record) if record.is_owned_by(token) => {
                record.expires_at = deadline(ttl)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn conditional_set(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        match self.records.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(Record::new(value, ttl)?);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Record::new(value, ttl)?);
                Ok(true)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.records.remove_if(key, |_, record| record.is_expired());
        Ok(self.value(key))
    }

    async fn register_script(&self, script: &LockScript) -> Result<ScriptHandle, StoreError> {
        let id = format!("memory-{}", script.kind());
        self.scripts.insert(id.clone(), script.kind());
        tracing::trace!(script = %id, "registered script");
        Ok(ScriptHandle::new(id, script.kind()))
    }

    async fn execute_script(
        &self,
        handle: &ScriptHandle,
        keys: &[&str],
        args: &[&str],
    ) -> Result<bool, StoreError> {
        let kind = self
            .scripts
            .get(handle.id())
            .map(|k| *k)
            .ok_or_else(|| StoreError::UnknownScript(handle.id().to_owned()))?;

        let key = keys
            .first()
            .ok_or_else(|| StoreError::Script(format!("{kind} script requires KEYS[1]")))?;
        let token = args
            .first()
            .ok_or_else(|| StoreError::Script(format!("{kind} script requires ARGV[1]")))?;

        match kind {
            ScriptKind::Unlock => Ok(self.unlock(key, token)),
            ScriptKind::Extend => {
                let ttl_ms: u64 = args
                    .get(1)
                    .ok_or_else(|| StoreError::Script("extend script requires ARGV[2]".into()))?
                    .parse()
                    .map_err(|e| StoreError::Script(format!("invalid TTL argument: {e}")))?;
                self.extend(key, token, Duration::from_millis(ttl_ms))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use keylock::testing::run_lock_conformance_tests;
    use keylock::{DistributedLock, LockError, LockOptions};
    use tokio_util::sync::CancellationToken;

    use super::*;

    async fn handle(store: &MemoryStore, key: &str, lease: Duration) -> DistributedLock {
        let options = LockOptions::new(lease, Duration::from_millis(10));
        DistributedLock::new(Arc::new(store.clone()), key, options)
            .await
            .expect("lock construction should succeed")
    }

    #[tokio::test(start_paused = true)]
    async fn conformance() {
        run_lock_conformance_tests(Arc::new(MemoryStore::new()))
            .await
            .expect("lock conformance tests should pass");
    }

    #[tokio::test(start_paused = true)]
    async fn conditional_set_respects_live_records_only() {
        let store = MemoryStore::new();
        assert!(store.conditional_set("k", "a", Duration::from_secs(1)).await.unwrap());
        assert!(!store.conditional_set("k", "b", Duration::from_secs(1)).await.unwrap());
        assert_eq!(store.value("k").as_deref(), Some("a"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(store.value("k").is_none());
        assert!(store.conditional_set("k", "b", Duration::from_secs(1)).await.unwrap());
        assert_eq!(store.value("k").as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_is_taken_over_between_50_and_60ms() {
        let store = MemoryStore::new();
        let mut a = handle(&store, "job:1", Duration::from_millis(50)).await;
        let mut b = handle(&store, "job:1", Duration::from_millis(50)).await;

        a.acquire(&CancellationToken::new()).await.unwrap();
        let start = Instant::now();

        let waiter = tokio::spawn(async move {
            b.acquire(&CancellationToken::new()).await.map(|()| b)
        });
        let b = waiter.await.unwrap().expect("B should acquire once A's lease lapses");
        let waited = start.elapsed();
        assert!(
            waited >= Duration::from_millis(50) && waited <= Duration::from_millis(60),
            "B acquired after {waited:?}"
        );

        let b_token = b.token().unwrap().to_string();
        assert_eq!(store.value("job:1"), Some(b_token));

        assert!(matches!(a.release().await, Err(LockError::NotOwner { .. })));
        assert!(b.is_held().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn second_handle_blocks_until_first_releases() {
        let store = MemoryStore::new();
        let mut a = handle(&store, "job:2", Duration::from_secs(10)).await;
        let mut b = handle(&store, "job:2", Duration::from_secs(10)).await;

        a.acquire(&CancellationToken::new()).await.unwrap();
        let waiter = tokio::spawn(async move {
            b.acquire(&CancellationToken::new()).await.map(|()| b)
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!waiter.is_finished(), "B should still be polling");

        a.release().await.unwrap();
        let b = waiter.await.unwrap().unwrap();
        assert!(b.is_held().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn extend_replaces_remaining_ttl() {
        let store = MemoryStore::new();
        let mut lock = handle(&store, "job:3", Duration::from_secs(10)).await;
        lock.acquire(&CancellationToken::new()).await.unwrap();

        lock.extend(Duration::from_secs(1)).await.unwrap();
        assert_eq!(store.remaining_ttl("job:3"), Some(Duration::from_secs(1)));

        tokio::time::advance(Duration::from_millis(400)).await;
        lock.extend(Duration::from_secs(2)).await.unwrap();
        assert_eq!(store.remaining_ttl("job:3"), Some(Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn extend_to_zero_expires_record() {
        let store = MemoryStore::new();
        let mut lock = handle(&store, "job:4", Duration::from_secs(10)).await;
        lock.acquire(&CancellationToken::new()).await.unwrap();

        lock.extend(Duration::ZERO).await.unwrap();
        assert!(store.value("job:4").is_none());
        assert!(!lock.is_held().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_extend_leaves_ttl_untouched() {
        let store = MemoryStore::new();
        let mut a = handle(&store, "job:5", Duration::from_millis(50)).await;
        let mut b = handle(&store, "job:5", Duration::from_secs(10)).await;

        a.acquire(&CancellationToken::new()).await.unwrap();
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(b.try_acquire().await.unwrap());

        let before = store.remaining_ttl("job:5");
        assert!(matches!(
            a.extend(Duration::from_secs(60)).await,
            Err(LockError::NotOwner { .. })
        ));
        assert_eq!(store.remaining_ttl("job:5"), before);
        assert_eq!(store.value("job:5").as_deref(), b.token().map(|t| t.as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_operations_do_not_touch_the_store() {
        let store = MemoryStore::new();
        let mut lock = handle(&store, "job:6", Duration::from_secs(10)).await;

        assert!(matches!(lock.release().await, Err(LockError::NotOwner { .. })));
        assert!(matches!(
            lock.extend(Duration::from_secs(1)).await,
            Err(LockError::NotOwner { .. })
        ));
        assert!(store.is_empty());

        lock.acquire(&CancellationToken::new()).await.unwrap();
        let value = store.value("job:6");
        let ttl = store.remaining_ttl("job:6");
        assert!(matches!(
            lock.acquire(&CancellationToken::new()).await,
            Err(LockError::AlreadyLocked { .. })
        ));
        assert_eq!(store.value("job:6"), value);
        assert_eq!(store.remaining_ttl("job:6"), ttl);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_lease_is_a_store_error() {
        let store = MemoryStore::new();
        let mut lock = handle(&store, "job:7", Duration::MAX).await;

        let err = lock.acquire(&CancellationToken::new()).await.unwrap_err();
        assert!(
            matches!(err, LockError::Store(StoreError::Backend(_))),
            "got {err:?}"
        );
        assert!(!lock.is_locally_held());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_extend_keeps_current_lease() {
        let store = MemoryStore::new();
        let mut lock = handle(&store, "job:8", Duration::from_secs(10)).await;
        lock.acquire(&CancellationToken::new()).await.unwrap();
        let ttl = store.remaining_ttl("job:8");

        let err = lock
            .extend(Duration::from_secs(u64::MAX / 1000))
            .await
            .unwrap_err();
        assert!(
            matches!(err, LockError::Store(StoreError::Backend(_))),
            "got {err:?}"
        );
        assert_eq!(store.remaining_ttl("job:8"), ttl);
        assert!(lock.is_held().await.unwrap());
    }

    #[tokio::test]
    async fn repeated_construction_reuses_script_ids() {
        let store = MemoryStore::new();
        for i in 0..100 {
            handle(&store, &format!("job:{i}"), Duration::from_secs(1)).await;
        }
        assert_eq!(store.scripts.len(), 2);

        let first = store.register_script(&LockScript::unlock()).await.unwrap();
        let again = store.register_script(&LockScript::unlock()).await.unwrap();
        assert_eq!(first, again);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_sweeps_abandoned_keys() {
        let store = MemoryStore::new();
        for key in ["a", "b", "c"] {
            assert!(store.conditional_set(key, "t", Duration::from_millis(10)).await.unwrap());
        }
        assert!(store.conditional_set("d", "t", Duration::from_secs(10)).await.unwrap());

        tokio::time::advance(Duration::from_millis(20)).await;
        assert_eq!(store.records.len(), 4);
        assert_eq!(store.purge_expired(), 3);
        assert_eq!(store.records.len(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn unknown_script_handle_is_rejected() {
        let store = MemoryStore::new();
        let handle = ScriptHandle::new("not-registered", ScriptKind::Unlock);
        let err = store
            .execute_script(&handle, &["k"], &["t"])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownScript(_)));
    }

    #[tokio::test]
    async fn malformed_script_arguments_are_rejected() {
        let store = MemoryStore::new();
        let extend = store.register_script(&LockScript::extend()).await.unwrap();

        let err = store
            .execute_script(&extend, &["k"], &["t", "soon"])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Script(_)));

        let err = store.execute_script(&extend, &["k"], &["t"]).await.unwrap_err();
        assert!(matches!(err, StoreError::Script(_)));

        let err = store.execute_script(&extend, &[], &["t", "10"]).await.unwrap_err();
        assert!(matches!(err, StoreError::Script(_)));
    }

    #[tokio::test]
    async fn concurrent_handles_never_overlap() {
        let store = MemoryStore::new();
        let inside = Arc::new(AtomicBool::new(false));
        let completed = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let mut lock = handle(&store, "contended", Duration::from_secs(5)).await;
            let inside = Arc::clone(&inside);
            let completed = Arc::clone(&completed);
            tasks.push(tokio::spawn(async move {
                lock.acquire(&CancellationToken::new())
                    .await
                    .expect("should eventually acquire");

                assert!(
                    !inside.swap(true, Ordering::SeqCst),
                    "two holders inside the critical section"
                );
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.store(false, Ordering::SeqCst);
                completed.fetch_add(1, Ordering::SeqCst);

                lock.release().await.expect("release should succeed");
            }));
        }

        for task in tasks {
            task.await.expect("task should not panic");
        }
        assert_eq!(completed.load(Ordering::SeqCst), 10);
        assert!(store.is_empty());
    }
}
