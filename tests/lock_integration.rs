//! Integration tests for the distributed lock.
//!
//! Runs against an in-memory lock store with lease expiry, so reentrancy,
//! contention and renewal can be exercised without a live Redis.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use taskforge::lock::{DistributedLock, LockConfig, LockError, LockStore, StoreError};

/// In-memory store with value-compare release/extend and lease expiry.
#[derive(Default)]
struct MemoryLockStore {
    keys: Mutex<HashMap<String, Lease>>,
    extend_calls: AtomicUsize,
    fail_extend: AtomicBool,
}

struct Lease {
    owner: String,
    expires_at: Instant,
}

impl MemoryLockStore {
    fn holder(&self, key: &str) -> Option<String> {
        let keys = self.keys.lock().unwrap();
        keys.get(key).and_then(|lease| {
            (lease.expires_at > Instant::now()).then(|| lease.owner.clone())
        })
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut keys = self.keys.lock().unwrap();
        let now = Instant::now();
        match keys.get(key) {
            Some(lease) if lease.expires_at > now && lease.owner != owner => Ok(false),
            _ => {
                keys.insert(
                    key.to_string(),
                    Lease {
                        owner: owner.to_string(),
                        expires_at: now + ttl,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, owner: &str) -> Result<bool, StoreError> {
        let mut keys = self.keys.lock().unwrap();
        match keys.get(key) {
            Some(lease) if lease.owner == owner => {
                keys.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.extend_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_extend.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("extend refused".to_string()));
        }

        let mut keys = self.keys.lock().unwrap();
        let now = Instant::now();
        match keys.get_mut(key) {
            Some(lease) if lease.owner == owner && lease.expires_at > now => {
                lease.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[tokio::test]
async fn test_reentrant_lock_releases_on_outermost_unlock() {
    init_tracing();
    let store = Arc::new(MemoryLockStore::default());
    let config = LockConfig::new("k", Duration::from_secs(5)).with_auto_renew(true);
    let owner = config.owner_id.clone();
    let lock = DistributedLock::new(Arc::clone(&store) as Arc<dyn LockStore>, config);
    let scope = CancellationToken::new();

    lock.lock(&scope).await.expect("first lock");
    lock.lock(&scope).await.expect("reentrant lock");
    assert_eq!(lock.hold_count().await, 2);

    lock.unlock(&scope).await.expect("inner unlock");
    // Still held remotely after the inner unlock.
    assert_eq!(store.holder("k"), Some(owner));

    lock.unlock(&scope).await.expect("outer unlock");
    assert_eq!(store.holder("k"), None);
    assert_eq!(lock.hold_count().await, 0);

    // One unlock too many is a programmer error.
    let extra = lock.unlock(&scope).await;
    assert!(matches!(extra, Err(LockError::NotHeld(_))));
}

#[tokio::test]
async fn test_distinct_owners_are_mutually_exclusive() {
    init_tracing();
    let store = Arc::new(MemoryLockStore::default());
    let scope = CancellationToken::new();

    let first = DistributedLock::new(
        Arc::clone(&store) as Arc<dyn LockStore>,
        LockConfig::new("shared", Duration::from_secs(5)),
    );
    let second = DistributedLock::new(
        Arc::clone(&store) as Arc<dyn LockStore>,
        LockConfig::new("shared", Duration::from_secs(5)),
    );

    first.lock(&scope).await.expect("first owner acquires");
    let contended = second.lock(&scope).await;
    assert!(matches!(contended, Err(LockError::Contention(_))));

    first.unlock(&scope).await.expect("first owner releases");
    second
        .lock(&scope)
        .await
        .expect("second owner acquires after release");
    second.unlock(&scope).await.expect("second owner releases");
}

#[tokio::test]
async fn test_lock_after_unlock_is_a_fresh_acquisition() {
    init_tracing();
    let store = Arc::new(MemoryLockStore::default());
    let lock = DistributedLock::new(
        Arc::clone(&store) as Arc<dyn LockStore>,
        LockConfig::new("again", Duration::from_secs(5)),
    );
    let scope = CancellationToken::new();

    lock.lock(&scope).await.expect("acquire");
    lock.unlock(&scope).await.expect("release");
    lock.lock(&scope).await.expect("reacquire");
    assert_eq!(lock.hold_count().await, 1);
    lock.unlock(&scope).await.expect("release again");
}

#[tokio::test(start_paused = true)]
async fn test_auto_renew_keeps_lease_alive() {
    init_tracing();
    let store = Arc::new(MemoryLockStore::default());
    let config = LockConfig::new("leased", Duration::from_secs(2)).with_auto_renew(true);
    let owner = config.owner_id.clone();
    let lock = DistributedLock::new(Arc::clone(&store) as Arc<dyn LockStore>, config);
    let scope = CancellationToken::new();

    lock.lock(&scope).await.expect("acquire");

    // Without renewal the 2s lease would have expired long before 5s.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(store.extend_calls.load(Ordering::SeqCst) >= 2);
    assert_eq!(store.holder("leased"), Some(owner));

    lock.unlock(&scope).await.expect("release");
    let calls_at_unlock = store.extend_calls.load(Ordering::SeqCst);

    // The renewal loop must stop with the final unlock.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(store.extend_calls.load(Ordering::SeqCst), calls_at_unlock);
}

#[tokio::test(start_paused = true)]
async fn test_renewal_stops_after_first_failure() {
    init_tracing();
    let store = Arc::new(MemoryLockStore::default());
    let lock = DistributedLock::new(
        Arc::clone(&store) as Arc<dyn LockStore>,
        LockConfig::new("flaky", Duration::from_secs(2)).with_auto_renew(true),
    );
    let scope = CancellationToken::new();

    lock.lock(&scope).await.expect("acquire");
    store.fail_extend.store(true, Ordering::SeqCst);

    tokio::time::sleep(Duration::from_secs(10)).await;
    let calls = store.extend_calls.load(Ordering::SeqCst);
    assert_eq!(calls, 1, "loop must stop silently on the first failure");

    // Local bookkeeping is untouched; the caller notices through its own
    // operations, not through the renewal loop.
    assert!(lock.is_held().await);
    lock.unlock(&scope).await.expect("release");
}

#[tokio::test]
async fn test_cancelled_scope_surfaces_as_store_error() {
    init_tracing();
    let store = Arc::new(MemoryLockStore::default());
    let lock = DistributedLock::new(
        Arc::clone(&store) as Arc<dyn LockStore>,
        LockConfig::new("scoped", Duration::from_secs(5)),
    );

    let scope = CancellationToken::new();
    scope.cancel();

    let result = lock.lock(&scope).await;
    assert!(matches!(
        result,
        Err(LockError::Store(StoreError::Cancelled))
    ));
    assert!(!lock.is_held().await);
}
