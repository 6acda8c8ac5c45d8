//! Rate-limit storage contract and the canonical Redis implementation.
//!
//! The store exposes one token-bucket operation: given a key and a set of
//! limit parameters, decide how many of the requested permits are granted
//! now. The
//! Redis implementation keeps two keys per bucket (token count and last
//! refresh timestamp) and mutates them atomically from a Lua script, so
//! every process sharing the store observes one bucket.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::Script;
use thiserror::Error;

/// Token bucket evaluated atomically in Redis.
///
/// KEYS: [1] token count, [2] last refresh timestamp (ms).
/// ARGV: [1] rate, [2] burst capacity, [3] now (ms), [4] period (ms),
/// [5] requested permits. Returns {granted, retry_after_ms}.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local rate = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local period = tonumber(ARGV[4])
local requested = tonumber(ARGV[5])

local fill_time = period * capacity / rate
local ttl = math.floor(fill_time * 2 / 1000)
if ttl < 1 then
    ttl = 1
end

local last_tokens = tonumber(redis.call("GET", KEYS[1]))
if last_tokens == nil then
    last_tokens = capacity
end

local last_refreshed = tonumber(redis.call("GET", KEYS[2]))
if last_refreshed == nil then
    last_refreshed = 0
end

local delta = math.max(0, now - last_refreshed)
local filled = math.min(capacity, last_tokens + delta * rate / period)

local granted = 0
local wait = 0
if filled >= requested then
    granted = requested
    filled = filled - requested
else
    wait = math.ceil((requested - filled) * period / rate)
end

redis.call("SETEX", KEYS[1], ttl, tostring(filled))
redis.call("SETEX", KEYS[2], ttl, tostring(now))

return {granted, wait}
"#;

/// Errors that can occur during rate store operations.
#[derive(Debug, Error)]
pub enum RateStoreError {
    /// The bucket definition for the key is missing.
    ///
    /// Distinguished from a transport failure: the limiter answers "denied"
    /// without engaging fallback. Raised by stores whose buckets are
    /// provisioned out-of-band rather than created on first touch.
    #[error("Rate limit key not found")]
    NotFound,

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Store backend failure outside of a Redis command.
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Outcome of one token-bucket evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketDecision {
    /// How many of the requested permits were granted (0 when denied).
    pub allowed: u64,
    /// How long the caller should wait before retrying, when denied.
    pub retry_after: Option<Duration>,
}

impl TokenBucketDecision {
    /// Returns whether at least one permit was granted.
    pub fn is_permitted(&self) -> bool {
        self.allowed >= 1
    }
}

/// Storage contract for the rate limiter.
#[async_trait]
pub trait RateStore: Send + Sync {
    /// Evaluates the token bucket for `key` with the given limit parameters
    /// and takes one permit if available.
    async fn allow(
        &self,
        key: &str,
        rate: u64,
        burst: u64,
        period: Duration,
    ) -> Result<TokenBucketDecision, RateStoreError>;

    /// Cheap liveness check used by the fallback's recovery probe.
    async fn ping(&self) -> Result<(), RateStoreError>;
}

/// Redis-backed rate store sharing one token bucket per key across
/// processes.
pub struct RedisRateStore {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    /// Prefix for bucket keys, so independent limiters can share a server.
    prefix: String,
    script: Script,
}

impl RedisRateStore {
    /// Connects to Redis and creates a new rate store.
    ///
    /// # Errors
    ///
    /// Returns `RateStoreError::Backend` if the connection fails.
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self, RateStoreError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| RateStoreError::Backend(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| RateStoreError::Backend(e.to_string()))?;

        Ok(Self::from_connection(redis, prefix))
    }

    /// Creates a rate store from an existing ConnectionManager.
    ///
    /// Useful when sharing a connection pool across multiple components.
    pub fn from_connection(redis: ConnectionManager, prefix: &str) -> Self {
        Self {
            redis,
            prefix: prefix.to_string(),
            script: Script::new(TOKEN_BUCKET_SCRIPT),
        }
    }

}

/// Derives the token-count and timestamp keys for one bucket.
fn bucket_keys(prefix: &str, key: &str) -> (String, String) {
    (
        format!("{prefix}:{key}:tokens"),
        format!("{prefix}:{key}:ts"),
    )
}

#[async_trait]
impl RateStore for RedisRateStore {
    async fn allow(
        &self,
        key: &str,
        rate: u64,
        burst: u64,
        period: Duration,
    ) -> Result<TokenBucketDecision, RateStoreError> {
        let mut conn = self.redis.clone();
        let (tokens_key, timestamp_key) = bucket_keys(&self.prefix, key);

        let (granted, wait_ms): (u64, u64) = self
            .script
            .key(tokens_key)
            .key(timestamp_key)
            .arg(rate)
            .arg(burst)
            .arg(Utc::now().timestamp_millis())
            .arg((period.as_millis() as u64).max(1))
            .arg(1u64)
            .invoke_async(&mut conn)
            .await?;

        Ok(TokenBucketDecision {
            allowed: granted,
            retry_after: (wait_ms > 0).then(|| Duration::from_millis(wait_ms)),
        })
    }

    async fn ping(&self) -> Result<(), RateStoreError> {
        let mut conn = self.redis.clone();
        redis::cmd("PING").query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}
