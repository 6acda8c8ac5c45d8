//! Bounded worker pool for in-process task execution.
//!
//! This module provides a pool of workers that execute submitted tasks with
//! bounded parallelism:
//!
//! - **WorkerPool**: fixed set of workers draining a bounded FIFO admission
//!   queue
//! - **Task**: a user-supplied unit of work accepting a cancellation token
//! - **PoolStats**: aggregate counters for submitted, completed and failed
//!   tasks
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Callers    │
//!                      │  (submit)    │
//!                      └──────┬───────┘
//!                             │  bounded admission
//!                      ┌──────▼───────┐
//!                      │  Task queue  │
//!                      └──────┬───────┘
//!                             │
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └─────────┘         └─────────┘         └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use taskforge::pool::{WorkerPool, WorkerPoolConfig};
//!
//! let pool = WorkerPool::start(WorkerPoolConfig::new(4, 16))?;
//!
//! pool.submit(|_cancel| async move {
//!     // do work
//!     Ok(())
//! })
//! .await;
//!
//! // Close the queue, drain in-flight tasks, collect the failure count.
//! let failed = pool.stop_and_wait().await;
//! assert_eq!(failed, 0);
//! ```
//!
//! # Reliability Features
//!
//! - **Panic isolation**: a panicking task is counted as a failure and does
//!   not kill its worker
//! - **Graceful shutdown**: `stop_and_wait` closes admission first, then
//!   drains every queued task before cancelling the pool scope
//! - **Cooperative cancellation**: every task receives the pool's
//!   cancellation token

pub mod worker_pool;

// Re-export main types for convenience
pub use worker_pool::{ErrorHook, PoolError, PoolStats, Task, TaskFuture, WorkerPool, WorkerPoolConfig};
