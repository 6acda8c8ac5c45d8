//! Token-bucket rate limiting with a shared store and local fallback.
//!
//! This module decides, per key, whether the next request may proceed:
//!
//! - **RateStore**: the storage contract, one token-bucket operation plus a
//!   liveness ping
//! - **RedisRateStore**: the canonical store, a Lua token bucket shared by
//!   every process
//! - **FallbackLimiter**: per-process buckets used only while the store is
//!   deemed unavailable, bounded by a periodic GC sweep
//! - **RateLimiter**: the facade routing between primary and fallback, with
//!   a liveness probe that transparently restores the primary
//!
//! # Architecture
//!
//! ```text
//!     allow(key)
//!         │
//!         ▼
//!   redis_alive? ──yes──► RedisRateStore (shared token bucket)
//!         │                      │ store error
//!         no                     ▼
//!         │               flip redis_alive, start probe
//!         ▼                      │
//!   FallbackLimiter ◄────────────┘
//!   (per-process buckets, GC-swept)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use taskforge::limiter::{RateLimiter, RedisRateStore};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! let store = Arc::new(RedisRateStore::connect("redis://localhost:6379", "api").await?);
//! let limiter = RateLimiter::builder()
//!     .with_store(store)
//!     .with_rate(100)
//!     .with_burst(200)
//!     .build()?;
//!
//! let scope = CancellationToken::new();
//! if limiter.allow(&scope, "tenant-42").await? {
//!     // proceed
//! }
//! ```
//!
//! # Degradation Semantics
//!
//! Any store error (other than the distinguished "key missing" sentinel)
//! switches decisions to the in-process fallback; a single background probe
//! pings the store and flips back to the primary on the first success. The
//! fallback never reconciles with the store, so a burst absorbed locally
//! during an outage is not charged to the shared bucket on recovery.

pub mod fallback;
pub mod rate_limiter;
pub mod store;

// Re-export main types for convenience
pub use rate_limiter::{LimiterError, RateLimiter, RateLimiterBuilder};
pub use store::{RateStore, RateStoreError, RedisRateStore, TokenBucketDecision};
