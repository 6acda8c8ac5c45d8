//! Worker pool executing user tasks with bounded parallelism.
//!
//! Workers drain a FIFO task queue whose admission is bounded by a semaphore
//! modelled on rendezvous channel semantics: the semaphore starts with
//! `queue_size` permits and each worker adds one permit when it begins
//! waiting for work. A `submit` call consumes one permit before pushing, so
//! at `queue_size = 0` submission completes only when a worker is ready to
//! take the task.
//!
//! # Features
//!
//! - Configurable number of workers and queue capacity
//! - Panic-safe task frames: a panic counts as one failure
//! - Graceful close-then-drain shutdown with an idempotent failure count
//! - Cooperative cancellation propagated into every task

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A boxed task future, as produced by a [`Task`] closure.
pub type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A unit of work submitted to the pool.
///
/// The closure receives the pool's cancellation token so cooperative tasks
/// can abort early during shutdown.
pub type Task = Box<dyn FnOnce(CancellationToken) -> TaskFuture + Send>;

/// Callback invoked with each task's failure reason.
pub type ErrorHook = Arc<dyn Fn(&anyhow::Error) + Send + Sync>;

/// Errors that can occur when constructing the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The configuration is invalid.
    #[error("Invalid pool configuration: {0}")]
    Config(String),
}

/// Configuration for the worker pool.
#[derive(Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn. Must be at least 1.
    pub worker_count: usize,
    /// Capacity of the admission queue. Zero makes submission a rendezvous.
    pub queue_size: usize,
    /// Parent cancellation scope; cancelling it stops all workers.
    pub parent: Option<CancellationToken>,
    /// Optional callback invoked with each task's failure reason.
    pub on_error: Option<ErrorHook>,
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the given worker count and queue size.
    pub fn new(worker_count: usize, queue_size: usize) -> Self {
        Self {
            worker_count,
            queue_size,
            parent: None,
            on_error: None,
        }
    }

    /// Sets the parent cancellation scope.
    pub fn with_parent(mut self, parent: CancellationToken) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Sets the per-failure callback.
    pub fn with_on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&anyhow::Error) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }
}

impl std::fmt::Debug for WorkerPoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPoolConfig")
            .field("worker_count", &self.worker_count)
            .field("queue_size", &self.queue_size)
            .field("parent", &self.parent.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub worker_count: usize,
    /// Number of workers currently alive.
    pub live_workers: u64,
    /// Number of tasks currently executing.
    pub active_tasks: u64,
    /// Total number of tasks admitted to the queue.
    pub submitted: u64,
    /// Total number of tasks completed successfully.
    pub completed: u64,
    /// Total number of tasks that failed or panicked.
    pub failed: u64,
}

impl PoolStats {
    /// Returns the total number of finished tasks (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.completed + self.failed
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    active_tasks: AtomicU64,
    live_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            active_tasks: AtomicU64::new(0),
            live_workers: AtomicU64::new(0),
        }
    }

    fn to_pool_stats(&self, worker_count: usize) -> PoolStats {
        PoolStats {
            worker_count,
            live_workers: self.live_workers.load(Ordering::SeqCst),
            active_tasks: self.active_tasks.load(Ordering::SeqCst),
            submitted: self.submitted.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

/// Worker pool that executes submitted tasks with bounded parallelism.
///
/// The pool spawns `worker_count` workers at construction. Tasks are
/// dequeued in submission order by whichever worker is free first; no
/// cross-worker completion ordering is guaranteed.
pub struct WorkerPool {
    worker_count: usize,
    /// Admission control: one permit per free queue slot or waiting worker.
    slots: Arc<Semaphore>,
    /// Sender half of the task queue. Taken (dropped) on shutdown so the
    /// channel closes once queued tasks are drained.
    tx: std::sync::Mutex<Option<mpsc::UnboundedSender<Task>>>,
    /// Pool-scoped cancellation token, handed to every task. Cancelled after
    /// the drain completes.
    cancel: CancellationToken,
    /// Fired at the start of shutdown to unblock pending submissions.
    closing: CancellationToken,
    closed: AtomicBool,
    stats: Arc<SharedPoolStats>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Final failure count, recorded by the first `stop_and_wait` call.
    shutdown_result: Mutex<Option<u64>>,
}

impl WorkerPool {
    /// Creates the pool and starts its workers.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Config` if `worker_count` is zero.
    pub fn start(config: WorkerPoolConfig) -> Result<Self, PoolError> {
        if config.worker_count == 0 {
            return Err(PoolError::Config(
                "worker_count must be at least 1".to_string(),
            ));
        }

        let cancel = match &config.parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(Mutex::new(rx));
        let slots = Arc::new(Semaphore::new(config.queue_size));
        let stats = Arc::new(SharedPoolStats::new());

        let mut workers = Vec::with_capacity(config.worker_count);
        for id in 0..config.worker_count {
            let worker = WorkerContext {
                id,
                rx: Arc::clone(&rx),
                slots: Arc::clone(&slots),
                cancel: cancel.clone(),
                stats: Arc::clone(&stats),
                on_error: config.on_error.clone(),
            };
            workers.push(tokio::spawn(worker.run()));
        }

        info!(
            worker_count = config.worker_count,
            queue_size = config.queue_size,
            "worker pool started"
        );

        Ok(Self {
            worker_count: config.worker_count,
            slots,
            tx: std::sync::Mutex::new(Some(tx)),
            cancel,
            closing: CancellationToken::new(),
            closed: AtomicBool::new(false),
            stats,
            workers: Mutex::new(workers),
            shutdown_result: Mutex::new(None),
        })
    }

    /// Submits a task for execution.
    ///
    /// If the pool is closed, returns immediately and the task is dropped.
    /// If the queue is full, waits until a slot frees up or the pool closes.
    pub async fn submit<F, Fut>(&self, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.submit_boxed(Box::new(move |cancel| Box::pin(task(cancel)) as TaskFuture))
            .await;
    }

    /// Submits a pre-boxed task. See [`WorkerPool::submit`].
    pub async fn submit_boxed(&self, task: Task) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let permit = tokio::select! {
            _ = self.closing.cancelled() => return,
            permit = self.slots.acquire() => permit,
        };
        let Ok(permit) = permit else {
            return;
        };
        // The permit transfers to the queued task; the receiving worker hands
        // it back by re-adding one permit when it next waits for work.
        permit.forget();

        // The pool may have closed while we waited for a slot.
        if self.closed.load(Ordering::SeqCst) {
            self.slots.add_permits(1);
            return;
        }

        let tx = {
            let guard = self
                .tx
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.clone()
        };
        match tx {
            Some(tx) => {
                if tx.send(task).is_ok() {
                    self.stats.submitted.fetch_add(1, Ordering::SeqCst);
                } else {
                    self.slots.add_permits(1);
                }
            }
            None => self.slots.add_permits(1),
        }
    }

    /// Closes the pool, drains every queued task, and returns the final
    /// failure count.
    ///
    /// Idempotent: repeated calls return the same value without re-running
    /// any shutdown step. The pool's cancellation token is cancelled after
    /// the drain completes.
    pub async fn stop_and_wait(&self) -> u64 {
        let mut result = self.shutdown_result.lock().await;
        if let Some(count) = *result {
            return count;
        }

        self.closed.store(true, Ordering::SeqCst);
        self.closing.cancel();

        // Close the task channel: queued tasks drain, then workers exit.
        {
            let mut guard = self
                .tx
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.take();
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().await;
            workers.drain(..).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task failed during shutdown");
            }
        }

        self.cancel.cancel();

        let count = self.stats.failed.load(Ordering::SeqCst);
        *result = Some(count);
        info!(failed = count, "worker pool stopped");
        count
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.worker_count)
    }

    /// Returns whether the pool has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Returns the pool's cancellation token.
    ///
    /// This is the token handed to every task; it fires once shutdown has
    /// drained the queue, or when the parent scope is cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Per-worker state for the worker loop.
struct WorkerContext {
    id: usize,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Task>>>,
    slots: Arc<Semaphore>,
    cancel: CancellationToken,
    stats: Arc<SharedPoolStats>,
    on_error: Option<ErrorHook>,
}

impl WorkerContext {
    /// Main worker loop.
    ///
    /// Exits when the task channel is drained and closed, or when the pool's
    /// cancellation token fires.
    async fn run(self) {
        self.stats.live_workers.fetch_add(1, Ordering::SeqCst);
        debug!(worker_id = self.id, "worker started");

        loop {
            // Signal readiness before waiting: the permit stands for either a
            // free queue slot or this worker waiting for a hand-off.
            self.slots.add_permits(1);

            let task = {
                let mut rx = self.rx.lock().await;
                tokio::select! {
                    task = rx.recv() => task,
                    _ = self.cancel.cancelled() => None,
                }
            };
            let Some(task) = task else {
                break;
            };

            self.execute(task).await;
        }

        self.stats.live_workers.fetch_sub(1, Ordering::SeqCst);
        debug!(worker_id = self.id, "worker stopped");
    }

    /// Executes one task inside a panic-safe frame.
    async fn execute(&self, task: Task) {
        let cancel = self.cancel.clone();
        self.stats.active_tasks.fetch_add(1, Ordering::SeqCst);

        // The closure is invoked inside the async block so a panic during
        // future construction is caught as well.
        let result = AssertUnwindSafe(async move { task(cancel).await })
            .catch_unwind()
            .await;

        self.stats.active_tasks.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(Ok(())) => {
                self.stats.completed.fetch_add(1, Ordering::SeqCst);
            }
            Ok(Err(e)) => {
                self.stats.failed.fetch_add(1, Ordering::SeqCst);
                warn!(worker_id = self.id, error = %e, "task failed");
                if let Some(hook) = &self.on_error {
                    hook(&e);
                }
            }
            Err(panic) => {
                self.stats.failed.fetch_add(1, Ordering::SeqCst);
                let reason = panic_message(panic);
                error!(worker_id = self.id, reason = %reason, "task panicked");
                if let Some(hook) = &self.on_error {
                    hook(&anyhow::anyhow!("task panicked: {reason}"));
                }
            }
        }
    }
}

/// Extracts a printable message from a panic payload.
fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
