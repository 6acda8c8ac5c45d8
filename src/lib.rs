//! taskforge: task execution and coordination primitives.
//!
//! This library provides three independently usable components:
//!
//! - [`pool`]: a bounded worker pool that runs submitted tasks with bounded
//!   parallelism, collects failure counts and shuts down deterministically
//! - [`lock`]: a reentrant distributed lock backed by an external store,
//!   with background lease renewal
//! - [`limiter`]: a token-bucket rate limiter with a shared Redis primary
//!   and a transparent in-process fallback

// Core modules
pub mod limiter;
pub mod lock;
pub mod pool;

// Re-export commonly used types
pub use limiter::{LimiterError, RateLimiter, RateLimiterBuilder};
pub use lock::{DistributedLock, LockConfig, LockError};
pub use pool::{PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
