//! # Requeue rate limiting
//!
//! Failed work items are re-inserted after a delay computed from two
//! independent limiters:
//!
//! - per-key exponential backoff, reset to the base delay on the next
//!   successful reconcile of that key;
//! - a global token bucket bounding total requeue throughput no matter
//!   how many distinct keys are failing at once.
//!
//! The effective delay is the maximum of the two. Defaults match the
//! classic controller work queue: 5ms base doubling up to 1000s, with
//! a 50/s, burst-300 bucket.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

/// Per-key exponential backoff.
///
/// Each failure of a key doubles its next delay, starting at `base`
/// and capped at `max`. `forget` clears the key's failure history.
#[derive(Debug, Clone)]
pub struct ItemExponentialBackoff<K> {
    base: Duration,
    max: Duration,
    failures: HashMap<K, u32>,
}

impl<K: Clone + Eq + Hash> ItemExponentialBackoff<K> {
    /// Create a backoff with the given base delay and ceiling.
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: HashMap::new(),
        }
    }

    /// Delay before the key's next redelivery, advancing its failure
    /// count.
    pub fn when(&mut self, key: &K) -> Duration {
        let failures = self.failures.entry(key.clone()).or_insert(0);
        let exponent = *failures;
        *failures = failures.saturating_add(1);

        // f64 arithmetic saturates to +inf well past the cap, so the
        // min() below stays correct for any failure count.
        let backoff = self.base.as_secs_f64() * 2f64.powi(exponent.min(1023) as i32);
        if backoff >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(backoff)
        }
    }

    /// Clear the failure history for a key.
    pub fn forget(&mut self, key: &K) {
        self.failures.remove(key);
    }

    /// Consecutive failures recorded for a key.
    #[must_use]
    pub fn failures(&self, key: &K) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }
}

/// Global token bucket.
///
/// Tokens refill at `qps` up to `burst`. `when` reserves a token and
/// returns how long the caller must wait for it, in the style of a
/// reservation limiter: the bucket may go negative, pushing later
/// reservations further out.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    qps: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    /// Create a bucket refilling at `qps` tokens per second, holding
    /// at most `burst` tokens.
    #[must_use]
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            qps,
            burst: f64::from(burst),
            tokens: f64::from(burst),
            last: Instant::now(),
        }
    }

    /// Reserve one token, returning the wait until it is available.
    pub fn when(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;

        self.tokens = (self.tokens + elapsed * self.qps).min(self.burst);
        self.tokens -= 1.0;

        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.qps)
        }
    }
}

/// Combined limiter: effective delay is the worst of both.
#[derive(Debug, Clone)]
pub struct MaxOfRateLimiter<K> {
    item: ItemExponentialBackoff<K>,
    bucket: TokenBucket,
}

impl<K: Clone + Eq + Hash> MaxOfRateLimiter<K> {
    /// Compose a per-key backoff with a global bucket.
    #[must_use]
    pub fn new(item: ItemExponentialBackoff<K>, bucket: TokenBucket) -> Self {
        Self { item, bucket }
    }

    /// Default limits for the reconcile work queue.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(
            ItemExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1000)),
            TokenBucket::new(50.0, 300),
        )
    }

    /// Delay before the key's next redelivery.
    pub fn when(&mut self, key: &K) -> Duration {
        self.item.when(key).max(self.bucket.when())
    }

    /// Reset the key's backoff state. The global bucket keeps pacing.
    pub fn forget(&mut self, key: &K) {
        self.item.forget(key);
    }

    /// Consecutive failures recorded for a key.
    #[must_use]
    pub fn failures(&self, key: &K) -> u32 {
        self.item.failures(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_per_failure() {
        let mut backoff = ItemExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1000));

        assert_eq!(backoff.when(&"k"), Duration::from_millis(5));
        assert_eq!(backoff.when(&"k"), Duration::from_millis(10));
        assert_eq!(backoff.when(&"k"), Duration::from_millis(20));
        assert_eq!(backoff.when(&"k"), Duration::from_millis(40));
        assert_eq!(backoff.failures(&"k"), 4);
    }

    #[test]
    fn exponential_backoff_keys_are_independent() {
        let mut backoff = ItemExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1000));

        assert_eq!(backoff.when(&"a"), Duration::from_millis(5));
        assert_eq!(backoff.when(&"a"), Duration::from_millis(10));
        assert_eq!(backoff.when(&"b"), Duration::from_millis(5));
    }

    #[test]
    fn exponential_backoff_caps_at_max() {
        let mut backoff = ItemExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(8));

        assert_eq!(backoff.when(&"k"), Duration::from_secs(1));
        assert_eq!(backoff.when(&"k"), Duration::from_secs(2));
        assert_eq!(backoff.when(&"k"), Duration::from_secs(4));
        assert_eq!(backoff.when(&"k"), Duration::from_secs(8));
        // Stays at the ceiling no matter how many more failures
        assert_eq!(backoff.when(&"k"), Duration::from_secs(8));
        assert_eq!(backoff.when(&"k"), Duration::from_secs(8));
    }

    #[test]
    fn exponential_backoff_forget_resets_to_base() {
        let mut backoff = ItemExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1000));

        backoff.when(&"k");
        backoff.when(&"k");
        backoff.when(&"k");
        backoff.forget(&"k");

        assert_eq!(backoff.failures(&"k"), 0);
        assert_eq!(backoff.when(&"k"), Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_allows_burst_then_paces() {
        let mut bucket = TokenBucket::new(1.0, 2);

        // Burst of 2 goes through immediately
        assert_eq!(bucket.when(), Duration::ZERO);
        assert_eq!(bucket.when(), Duration::ZERO);
        // Third reservation waits one refill interval, fourth two
        assert_eq!(bucket.when(), Duration::from_secs(1));
        assert_eq!(bucket.when(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_refills_over_time() {
        let mut bucket = TokenBucket::new(1.0, 1);

        assert_eq!(bucket.when(), Duration::ZERO);
        assert_eq!(bucket.when(), Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(5)).await;

        // Refill is capped at burst, so only one free token
        assert_eq!(bucket.when(), Duration::ZERO);
        assert_eq!(bucket.when(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn max_of_takes_the_worse_delay() {
        let mut limiter = MaxOfRateLimiter::new(
            ItemExponentialBackoff::new(Duration::from_secs(10), Duration::from_secs(1000)),
            TokenBucket::new(1.0, 100),
        );

        // Item backoff (10s) dominates the idle bucket
        assert_eq!(limiter.when(&"k"), Duration::from_secs(10));

        let mut limiter = MaxOfRateLimiter::new(
            ItemExponentialBackoff::new(Duration::from_millis(1), Duration::from_secs(1000)),
            TokenBucket::new(1.0, 1),
        );

        // Once the bucket is drained it dominates the tiny item backoff
        assert_eq!(limiter.when(&"k"), Duration::from_millis(1));
        assert_eq!(limiter.when(&"k"), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn forget_does_not_reset_the_bucket() {
        let mut limiter = MaxOfRateLimiter::new(
            ItemExponentialBackoff::new(Duration::from_millis(1), Duration::from_secs(1000)),
            TokenBucket::new(1.0, 1),
        );

        limiter.when(&"k");
        limiter.forget(&"k");

        assert_eq!(limiter.failures(&"k"), 0);
        // Global pacing still applies after a per-key reset
        assert!(limiter.when(&"k") >= Duration::from_secs(1));
    }
}
