//! Rate limiter facade routing between the shared store and the fallback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fallback::FallbackLimiter;
use super::store::{RateStore, RateStoreError};

/// How often the liveness probe pings the store while degraded.
const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Errors that can occur when building or querying the rate limiter.
#[derive(Debug, Error)]
pub enum LimiterError {
    /// The configuration is invalid.
    #[error("Invalid limiter configuration: {0}")]
    Config(String),

    /// The operation was cancelled by the caller's scope.
    #[error("Rate limit check cancelled")]
    Cancelled,
}

/// Builder for [`RateLimiter`].
///
/// Defaults: `rate = 1`, `burst = 1`, `period = 1s`,
/// `cleanup_interval = 60s`. The store is required.
pub struct RateLimiterBuilder {
    store: Option<Arc<dyn RateStore>>,
    rate: u64,
    burst: u64,
    period: Duration,
    cleanup_interval: Duration,
}

impl Default for RateLimiterBuilder {
    fn default() -> Self {
        Self {
            store: None,
            rate: 1,
            burst: 1,
            period: Duration::from_secs(1),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl RateLimiterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the shared store (required).
    pub fn with_store(mut self, store: Arc<dyn RateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the number of permits granted per period.
    pub fn with_rate(mut self, rate: u64) -> Self {
        self.rate = rate;
        self
    }

    /// Sets the bucket capacity.
    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = burst;
        self
    }

    /// Sets the refill period.
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Sets how often idle fallback buckets are swept.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Builds the limiter and starts its GC sweeper.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `LimiterError::Config` if the store is missing or any numeric
    /// option is zero.
    pub fn build(self) -> Result<RateLimiter, LimiterError> {
        let store = self
            .store
            .ok_or_else(|| LimiterError::Config("store is required".to_string()))?;
        if self.rate == 0 {
            return Err(LimiterError::Config("rate must be at least 1".to_string()));
        }
        if self.burst == 0 {
            return Err(LimiterError::Config("burst must be at least 1".to_string()));
        }
        if self.period.is_zero() {
            return Err(LimiterError::Config("period must be non-zero".to_string()));
        }
        if self.cleanup_interval.is_zero() {
            return Err(LimiterError::Config(
                "cleanup_interval must be non-zero".to_string(),
            ));
        }

        let inner = Arc::new(Inner {
            store,
            rate: self.rate,
            burst: self.burst,
            period: self.period,
            cleanup_interval: self.cleanup_interval,
            redis_alive: AtomicBool::new(true),
            monitor_running: Mutex::new(false),
            fallback: FallbackLimiter::new(self.rate, self.burst, self.period),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(sweep_loop(Arc::clone(&inner)));

        Ok(RateLimiter { inner })
    }
}

/// State shared with the background probe and sweeper tasks.
struct Inner {
    store: Arc<dyn RateStore>,
    rate: u64,
    burst: u64,
    period: Duration,
    cleanup_interval: Duration,
    /// Whether decisions currently flow through the shared store.
    redis_alive: AtomicBool,
    /// Guards probe start so at most one probe runs at a time.
    monitor_running: Mutex<bool>,
    fallback: FallbackLimiter,
    /// Stops the sweeper and any running probe when the limiter is dropped.
    shutdown: CancellationToken,
}

/// Token-bucket rate limiter with a shared primary and a per-process
/// fallback.
///
/// Decisions normally flow through the shared store. Any store error other
/// than the "key missing" sentinel flips the limiter into fallback mode and
/// starts a liveness probe; the first successful ping restores the primary.
pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl RateLimiter {
    /// Returns a builder with default limits.
    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder::new()
    }

    /// Decides whether the next request for `key` is permitted now.
    ///
    /// Returns `Ok(false)` both when the bucket is exhausted and when the
    /// store reports the key missing. Transient store errors are absorbed by
    /// the fallback and never surface here.
    ///
    /// # Errors
    ///
    /// `LimiterError::Cancelled` when `scope` fires before a decision.
    pub async fn allow(&self, scope: &CancellationToken, key: &str) -> Result<bool, LimiterError> {
        if scope.is_cancelled() {
            return Err(LimiterError::Cancelled);
        }

        if self.inner.redis_alive.load(Ordering::Acquire) {
            let result = tokio::select! {
                _ = scope.cancelled() => return Err(LimiterError::Cancelled),
                result = self
                    .inner
                    .store
                    .allow(key, self.inner.rate, self.inner.burst, self.inner.period) => result,
            };

            match result {
                Ok(decision) => return Ok(decision.is_permitted()),
                Err(RateStoreError::NotFound) => return Ok(false),
                Err(e) => {
                    // Only the caller that performs the true->false flip logs
                    // the transition.
                    if self.inner.redis_alive.swap(false, Ordering::AcqRel) {
                        warn!(error = %e, "rate-limit store unavailable, switching to in-process fallback");
                    }
                    self.start_probe();
                }
            }
        }

        Ok(self.inner.fallback.allow(key))
    }

    /// Returns whether decisions currently flow through the shared store.
    pub fn is_primary_healthy(&self) -> bool {
        self.inner.redis_alive.load(Ordering::Acquire)
    }

    /// Number of live in-process fallback buckets.
    pub fn fallback_bucket_count(&self) -> usize {
        self.inner.fallback.len()
    }

    fn start_probe(&self) {
        let mut running = self
            .inner
            .monitor_running
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *running {
            return;
        }
        *running = true;
        drop(running);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(probe_loop(inner));
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

/// Polls the store until it answers, then restores the primary path.
async fn probe_loop(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(PROBE_INTERVAL);

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if inner.store.ping().await.is_ok() {
                    inner.redis_alive.store(true, Ordering::Release);
                    info!("rate-limit store recovered, resuming primary path");
                    break;
                }
            }
        }
    }

    *inner
        .monitor_running
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = false;
}

/// Periodically drops fallback buckets that have gone idle.
async fn sweep_loop(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(inner.cleanup_interval);
    // The first tick completes immediately; nothing can be stale yet.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let removed = inner.fallback.sweep(inner.cleanup_interval);
                if removed > 0 {
                    debug!(removed, "swept idle fallback buckets");
                }
            }
        }
    }
}
