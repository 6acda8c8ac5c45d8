//! Reentrant distributed lock with background lease renewal.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::store::{LockStore, StoreError};

/// Errors that can occur during lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    /// The key is currently held by another owner.
    #[error("Lock '{0}' is held by another owner")]
    Contention(String),

    /// Unlock was called without a matching lock.
    #[error("Lock '{0}' is not held by this instance")]
    NotHeld(String),

    /// The underlying store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Configuration for a distributed lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Name of the resource to serialize on.
    pub key: String,
    /// Identity written as the key's value; checked on release and extend.
    pub owner_id: String,
    /// Lease duration requested from the store.
    pub ttl: Duration,
    /// Whether to keep the lease alive in the background while held.
    pub auto_renew: bool,
}

impl LockConfig {
    /// Creates a configuration with a freshly generated owner identity.
    pub fn new(key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            owner_id: generate_owner_id(),
            ttl,
            auto_renew: false,
        }
    }

    /// Overrides the generated owner identity.
    pub fn with_owner_id(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = owner_id.into();
        self
    }

    /// Enables or disables background lease renewal.
    pub fn with_auto_renew(mut self, auto_renew: bool) -> Self {
        self.auto_renew = auto_renew;
        self
    }
}

/// Generates a process-unique owner identity.
///
/// The timestamp plus random component makes it hard for another process to
/// hold the same identity, so an expired-and-reacquired key is never released
/// by the previous holder.
fn generate_owner_id() -> String {
    format!(
        "{:x}-{}",
        Utc::now().timestamp_millis(),
        Uuid::new_v4().simple()
    )
}

/// State guarded by the lock's outer mutex.
struct HoldState {
    /// How many nested `lock` calls this instance has made.
    count: u32,
    /// Stops the renewal loop; taken (and therefore cancelled at most once)
    /// on the final unlock.
    stop_renew: Option<CancellationToken>,
}

/// A named mutual-exclusion token backed by an external store.
///
/// The same instance may lock reentrantly; distinct instances (even in one
/// process) contend through the store. Lock and unlock serialize on an outer
/// mutex, so a concurrent `lock` while the lease is being acquired waits and
/// then takes the fast reentrancy path.
pub struct DistributedLock {
    store: Arc<dyn LockStore>,
    config: LockConfig,
    state: Mutex<HoldState>,
}

impl DistributedLock {
    /// Creates a new lock descriptor. Nothing is acquired until [`lock`].
    ///
    /// [`lock`]: DistributedLock::lock
    pub fn new(store: Arc<dyn LockStore>, config: LockConfig) -> Self {
        Self {
            store,
            config,
            state: Mutex::new(HoldState {
                count: 0,
                stop_renew: None,
            }),
        }
    }

    /// Acquires the lock, or reenters it if already held by this instance.
    ///
    /// # Errors
    ///
    /// - `LockError::Contention` if the store reports the key held elsewhere
    /// - `LockError::Store` for underlying store failures; cancellation of
    ///   `scope` surfaces as `StoreError::Cancelled`
    pub async fn lock(&self, scope: &CancellationToken) -> Result<(), LockError> {
        if scope.is_cancelled() {
            return Err(LockError::Store(StoreError::Cancelled));
        }

        let mut state = self.state.lock().await;

        if state.count > 0 {
            state.count += 1;
            return Ok(());
        }

        let acquired = tokio::select! {
            _ = scope.cancelled() => return Err(LockError::Store(StoreError::Cancelled)),
            result = self.store.acquire(&self.config.key, &self.config.owner_id, self.config.ttl) => result?,
        };
        if !acquired {
            return Err(LockError::Contention(self.config.key.clone()));
        }

        state.count = 1;
        debug!(key = %self.config.key, owner = %self.config.owner_id, "lock acquired");

        if self.config.auto_renew {
            let stop = CancellationToken::new();
            state.stop_renew = Some(stop.clone());
            tokio::spawn(renew_loop(
                Arc::clone(&self.store),
                self.config.clone(),
                stop,
            ));
        }

        Ok(())
    }

    /// Releases one hold on the lock.
    ///
    /// On the outermost release the renewal loop is stopped and the remote
    /// key is removed (owner-checked). If `scope` is cancelled before the
    /// remote release completes, the local hold is already relinquished and
    /// the remote lease is left to expire on its own.
    ///
    /// # Errors
    ///
    /// - `LockError::NotHeld` if this instance does not hold the lock
    /// - `LockError::Store` for underlying store failures
    pub async fn unlock(&self, scope: &CancellationToken) -> Result<(), LockError> {
        if scope.is_cancelled() {
            return Err(LockError::Store(StoreError::Cancelled));
        }

        let mut state = self.state.lock().await;

        if state.count == 0 {
            return Err(LockError::NotHeld(self.config.key.clone()));
        }

        state.count -= 1;
        if state.count > 0 {
            return Ok(());
        }

        if let Some(stop) = state.stop_renew.take() {
            stop.cancel();
        }

        let released = tokio::select! {
            _ = scope.cancelled() => return Err(LockError::Store(StoreError::Cancelled)),
            result = self.store.release(&self.config.key, &self.config.owner_id) => result?,
        };
        if released {
            debug!(key = %self.config.key, "lock released");
        } else {
            // Lease expired and the key moved on; nothing left to release.
            debug!(key = %self.config.key, "release skipped, ownership already lost");
        }

        Ok(())
    }

    /// Returns whether this instance currently holds the lock.
    pub async fn is_held(&self) -> bool {
        self.state.lock().await.count > 0
    }

    /// Returns the current reentrancy depth.
    pub async fn hold_count(&self) -> u32 {
        self.state.lock().await.count
    }

    /// Returns this instance's owner identity.
    pub fn owner_id(&self) -> &str {
        &self.config.owner_id
    }

    /// Returns the lock key.
    pub fn key(&self) -> &str {
        &self.config.key
    }
}

/// Background lease renewal.
///
/// Ticks at half the lease duration and stops on the first failed or lost
/// extension; a stale holder must detect loss through its own operations
/// timing out.
async fn renew_loop(store: Arc<dyn LockStore>, config: LockConfig, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(config.ttl / 2);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; skip it so the first extension
    // lands halfway through the initial lease.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                match store.extend(&config.key, &config.owner_id, config.ttl).await {
                    Ok(true) => {
                        debug!(key = %config.key, "lease extended");
                    }
                    Ok(false) => {
                        warn!(key = %config.key, "lease ownership lost, stopping renewal");
                        break;
                    }
                    Err(e) => {
                        warn!(key = %config.key, error = %e, "lease extension failed, stopping renewal");
                        break;
                    }
                }
            }
        }
    }
}
