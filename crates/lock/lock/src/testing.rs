use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::LockOptions;
use crate::error::LockError;
use crate::lock::DistributedLock;
use crate::store::KeyValueStore;

const LONG_LEASE: Duration = Duration::from_secs(10);
const SHORT_LEASE: Duration = Duration::from_millis(50);
const POLL: Duration = Duration::from_millis(10);

async fn lock_with(
    store: &Arc<dyn KeyValueStore>,
    key: &str,
    lease: Duration,
) -> Result<DistributedLock, LockError> {
    DistributedLock::new(Arc::clone(store), key, LockOptions::new(lease, POLL)).await
}

/// Run the full distributed lock conformance test suite.
///
/// Call this from your backend's test module with a fresh store. Some cases
/// wait for a 50ms lease to lapse, so the store must expire keys on time.
///
/// # Errors
///
/// Returns an error if a lock operation fails unexpectedly. Contract
/// violations panic.
pub async fn run_lock_conformance_tests(store: Arc<dyn KeyValueStore>) -> Result<(), LockError> {
    test_acquire_and_release(&store).await?;
    test_contention(&store).await?;
    test_double_acquire(&store).await?;
    test_not_owner_without_acquire(&store).await?;
    test_extend(&store).await?;
    test_expired_lease_release(&store).await?;
    test_expired_lease_extend(&store).await?;
    test_round_trip_tokens(&store).await?;
    Ok(())
}

async fn test_acquire_and_release(store: &Arc<dyn KeyValueStore>) -> Result<(), LockError> {
    let mut lock = lock_with(store, "conformance-1", LONG_LEASE).await?;
    lock.acquire(&CancellationToken::new()).await?;

    let token = lock.token().expect("token after acquire").to_string();
    let stored = store.get("conformance-1").await?;
    assert_eq!(stored.as_deref(), Some(token.as_str()), "record should hold the token");

    lock.release().await?;
    assert!(
        store.get("conformance-1").await?.is_none(),
        "release should delete the record"
    );
    Ok(())
}

async fn test_contention(store: &Arc<dyn KeyValueStore>) -> Result<(), LockError> {
    let mut a = lock_with(store, "conformance-2", LONG_LEASE).await?;
    let mut b = lock_with(store, "conformance-2", LONG_LEASE).await?;

    assert!(a.try_acquire().await?, "should acquire uncontested lock");
    assert!(
        !b.try_acquire().await?,
        "second handle should not acquire while lock is held"
    );

    a.release().await?;
    assert!(b.try_acquire().await?, "should acquire after release");
    b.release().await?;
    Ok(())
}

async fn test_double_acquire(store: &Arc<dyn KeyValueStore>) -> Result<(), LockError> {
    let mut lock = lock_with(store, "conformance-3", LONG_LEASE).await?;
    lock.acquire(&CancellationToken::new()).await?;
    let token = lock.token().expect("token after acquire").clone();

    let err = lock.acquire(&CancellationToken::new()).await;
    assert!(
        matches!(err, Err(LockError::AlreadyLocked { .. })),
        "second acquire on one handle should be rejected"
    );
    assert_eq!(lock.token(), Some(&token), "token should be unchanged");
    assert_eq!(
        store.get("conformance-3").await?.as_deref(),
        Some(token.as_str())
    );

    lock.release().await?;
    Ok(())
}

async fn test_not_owner_without_acquire(store: &Arc<dyn KeyValueStore>) -> Result<(), LockError> {
    let mut holder = lock_with(store, "conformance-4", LONG_LEASE).await?;
    let mut idle = lock_with(store, "conformance-4", LONG_LEASE).await?;
    holder.acquire(&CancellationToken::new()).await?;

    assert!(matches!(idle.release().await, Err(LockError::NotOwner { .. })));
    assert!(matches!(
        idle.extend(Duration::from_secs(1)).await,
        Err(LockError::NotOwner { .. })
    ));
    assert!(holder.is_held().await?, "idle handle must not disturb the holder");

    holder.release().await?;
    Ok(())
}

async fn test_extend(store: &Arc<dyn KeyValueStore>) -> Result<(), LockError> {
    let mut lock = lock_with(store, "conformance-5", SHORT_LEASE).await?;
    lock.acquire(&CancellationToken::new()).await?;

    lock.extend(LONG_LEASE).await?;
    tokio::time::sleep(SHORT_LEASE * 3).await;
    assert!(
        lock.is_held().await?,
        "lock should outlive its original lease after extend"
    );

    lock.release().await?;
    Ok(())
}

async fn test_expired_lease_release(store: &Arc<dyn KeyValueStore>) -> Result<(), LockError> {
    let mut a = lock_with(store, "conformance-6", SHORT_LEASE).await?;
    let mut b = lock_with(store, "conformance-6", LONG_LEASE).await?;

    a.acquire(&CancellationToken::new()).await?;
    b.acquire_timeout(Duration::from_secs(2)).await?;

    let b_token = b.token().expect("token after acquire").to_string();
    assert_eq!(
        store.get("conformance-6").await?.as_deref(),
        Some(b_token.as_str())
    );

    assert!(
        matches!(a.release().await, Err(LockError::NotOwner { .. })),
        "stale holder should not release the new owner's record"
    );
    assert!(!a.is_locally_held(), "stale holder should forget its token");
    assert!(b.is_held().await?, "new owner's record should survive");

    b.release().await?;
    Ok(())
}

async fn test_expired_lease_extend(store: &Arc<dyn KeyValueStore>) -> Result<(), LockError> {
    let mut a = lock_with(store, "conformance-7", SHORT_LEASE).await?;
    let mut b = lock_with(store, "conformance-7", LONG_LEASE).await?;

    a.acquire(&CancellationToken::new()).await?;
    b.acquire_timeout(Duration::from_secs(2)).await?;

    assert!(
        matches!(a.extend(LONG_LEASE).await, Err(LockError::NotOwner { .. })),
        "stale holder should not extend the new owner's record"
    );
    assert!(a.is_locally_held(), "failed extend leaves the local token");
    assert!(!a.is_held().await?);
    assert!(b.is_held().await?);

    b.release().await?;
    Ok(())
}

async fn test_round_trip_tokens(store: &Arc<dyn KeyValueStore>) -> Result<(), LockError> {
    let mut lock = lock_with(store, "conformance-8", LONG_LEASE).await?;
    let cancel = CancellationToken::new();

    lock.acquire(&cancel).await?;
    let first = lock.token().expect("token after acquire").clone();
    lock.release().await?;

    lock.acquire(&cancel).await?;
    let second = lock.token().expect("token after acquire").clone();
    lock.release().await?;

    assert_ne!(first, second, "each acquisition should mint a new token");
    Ok(())
}
