//! Lock storage contract and the canonical Redis implementation.
//!
//! A lock store holds one key per lock, whose value is the owner identity of
//! the current holder. Release and extend are owner-checked: they only take
//! effect if the key's current value equals the supplied owner, so a holder
//! whose lease expired cannot disturb the next holder's lock.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use thiserror::Error;

/// Compare-and-delete: remove the key only if held by `owner`.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Compare-and-expire: refresh the lease only if held by `owner`.
const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Allowance added to the requested lease so clock drift between client and
/// store does not expire a lease that the holder still considers live.
const DRIFT_TOLERANCE_MS: u64 = 500;

/// Errors that can occur during lock store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The operation was cancelled by the caller's scope.
    #[error("Store operation cancelled")]
    Cancelled,

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Store backend failure outside of a Redis command.
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Storage contract for distributed locks.
///
/// Implementations must provide value-compare semantics on `release` and
/// `extend`: the key is removed or extended only if its current value equals
/// `owner`.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Attempts to acquire `key` for `owner` with the given lease.
    ///
    /// Returns `Ok(false)` if the key is currently held by another owner.
    async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Releases `key` if its current value equals `owner`.
    ///
    /// Returns `Ok(false)` if ownership was already lost.
    async fn release(&self, key: &str, owner: &str) -> Result<bool, StoreError>;

    /// Extends the lease on `key` if its current value equals `owner`.
    ///
    /// Returns `Ok(false)` if ownership was already lost.
    async fn extend(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError>;
}

/// Redis-backed lock store.
///
/// Acquisition uses `SET key owner NX PX ttl`; release and extend run Lua
/// scripts so the owner comparison and the mutation are atomic.
pub struct RedisLockStore {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    release_script: Script,
    extend_script: Script,
}

impl RedisLockStore {
    /// Connects to Redis and creates a new lock store.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| StoreError::Backend(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(Self::from_connection(redis))
    }

    /// Creates a lock store from an existing ConnectionManager.
    ///
    /// Useful when sharing a connection pool across multiple components.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self {
            redis,
            release_script: Script::new(RELEASE_SCRIPT),
            extend_script: Script::new(EXTEND_SCRIPT),
        }
    }

    fn lease_ms(ttl: Duration) -> u64 {
        (ttl.as_millis() as u64).max(1) + DRIFT_TOLERANCE_MS
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();

        // SET NX returns OK when the key was set, nil when already present.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(Self::lease_ms(ttl))
            .query_async(&mut conn)
            .await?;

        Ok(reply.is_some())
    }

    async fn release(&self, key: &str, owner: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();

        let removed: i64 = self
            .release_script
            .key(key)
            .arg(owner)
            .invoke_async(&mut conn)
            .await?;

        Ok(removed == 1)
    }

    async fn extend(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();

        let extended: i64 = self
            .extend_script
            .key(key)
            .arg(owner)
            .arg(Self::lease_ms(ttl))
            .invoke_async(&mut conn)
            .await?;

        Ok(extended == 1)
    }
}
