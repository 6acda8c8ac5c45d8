//! In-process token buckets used while the shared store is unavailable.
//!
//! Buckets are created on first touch and swept periodically: an entry not
//! accessed for longer than the sweep interval is removed, so the map stays
//! bounded by the working set of recently seen keys.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// One per-key bucket.
struct FallbackBucket {
    /// Fractional token count, refilled lazily on access.
    tokens: f64,
    last_refill: Instant,
    last_access: Instant,
}

/// Per-process token buckets keyed by request key.
///
/// Decisions here do not synchronize with the shared store; the limiter only
/// consults this while the store is deemed unavailable.
pub struct FallbackLimiter {
    buckets: Mutex<HashMap<String, FallbackBucket>>,
    rate: u64,
    burst: u64,
    period: Duration,
}

impl FallbackLimiter {
    pub fn new(rate: u64, burst: u64, period: Duration) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            rate,
            burst,
            period,
        }
    }

    /// Takes one token for `key` if available.
    ///
    /// First touch creates a full bucket of `burst` tokens, so a fresh key
    /// is always permitted.
    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| FallbackBucket {
                tokens: self.burst as f64,
                last_refill: now,
                last_access: now,
            });

        let elapsed = now.duration_since(bucket.last_refill);
        let refill = elapsed.as_secs_f64() / self.period.as_secs_f64() * self.rate as f64;
        bucket.tokens = (bucket.tokens + refill).min(self.burst as f64);
        bucket.last_refill = now;
        bucket.last_access = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Removes buckets not accessed within `max_idle` and returns how many
    /// were dropped.
    pub fn sweep(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let before = buckets.len();
        buckets.retain(|_, bucket| now.duration_since(bucket.last_access) <= max_idle);
        before - buckets.len()
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_first_touch_is_permitted() {
        let limiter = FallbackLimiter::new(1, 1, Duration::from_secs(1));
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));
        // A different key gets its own bucket.
        assert!(limiter.allow("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_refill_over_time() {
        let limiter = FallbackLimiter::new(1, 1, Duration::from_secs(1));
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));

        tokio::time::advance(Duration::from_millis(300)).await;
        assert!(!limiter.allow("a"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.allow("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_caps_at_burst() {
        let limiter = FallbackLimiter::new(10, 3, Duration::from_secs(1));
        // Idle long enough to refill far beyond capacity.
        assert!(limiter.allow("a"));
        tokio::time::advance(Duration::from_secs(60)).await;

        let mut permitted = 0;
        for _ in 0..10 {
            if limiter.allow("a") {
                permitted += 1;
            }
        }
        assert_eq!(permitted, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_idle_buckets() {
        let limiter = FallbackLimiter::new(1, 1, Duration::from_secs(1));
        limiter.allow("stale");
        tokio::time::advance(Duration::from_secs(90)).await;
        limiter.allow("fresh");

        let removed = limiter.sweep(Duration::from_secs(60));
        assert_eq!(removed, 1);
        assert_eq!(limiter.len(), 1);
    }
}
