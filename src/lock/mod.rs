//! Distributed mutual exclusion with reentrancy and lease renewal.
//!
//! This module serializes access to a named resource across processes:
//!
//! - **LockStore**: the storage contract, acquire/release/extend with
//!   value-compare semantics keyed on an owner identity
//! - **RedisLockStore**: the canonical store, `SET NX PX` plus Lua
//!   compare-and-delete / compare-and-expire scripts
//! - **DistributedLock**: reentrant lock descriptor with an optional
//!   background lease-renewal loop
//!
//! # Example
//!
//! ```rust,ignore
//! use taskforge::lock::{DistributedLock, LockConfig, RedisLockStore};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! let store = Arc::new(RedisLockStore::connect("redis://localhost:6379").await?);
//! let config = LockConfig::new("orders:flush", Duration::from_secs(5)).with_auto_renew(true);
//! let lock = DistributedLock::new(store, config);
//!
//! let scope = CancellationToken::new();
//! lock.lock(&scope).await?;
//! // ... critical section, lease kept alive in the background ...
//! lock.unlock(&scope).await?;
//! ```
//!
//! # Reliability Features
//!
//! - **Owner-checked release**: the remote key is deleted only if its value
//!   still equals this instance's owner id
//! - **Reentrancy**: nested `lock` calls by the same instance reuse the held
//!   lease; the remote key is released on the outermost `unlock`
//! - **Lease renewal**: with `auto_renew`, a background loop extends the
//!   lease every `ttl / 2` and stops on the first failure

pub mod distributed;
pub mod store;

// Re-export main types for convenience
pub use distributed::{DistributedLock, LockConfig, LockError};
pub use store::{LockStore, RedisLockStore, StoreError};
