//! Rate limiters deciding how long a failed key waits before its retry.
//!
//! - [`ItemExponentialFailureRateLimiter`]: per-key exponential backoff;
//! - [`BucketRateLimiter`]: overall token bucket shared by every key;
//! - [`MaxOfRateLimiter`]: the strictest answer of several limiters.
//!
//! [`default_controller_rate_limiter`] combines the first two the way
//! Kubernetes controllers usually do.

use crate::backoff::ExponentialBackoff;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Decides the delay before a failed key is retried.
///
/// Implementations must be internally synchronized: the queue calls them
/// from every worker.
pub trait RateLimiter<K>: Send + Sync {
    /// Records a failure for `key` and returns how long it has to wait.
    fn when(&self, key: &K) -> Duration;

    /// Clears the failure history of `key`. A no-op for unknown keys.
    fn forget(&self, key: &K);

    /// Number of failures recorded for `key` since it was last forgotten.
    fn num_requeues(&self, key: &K) -> u32;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-key exponential backoff: `base * 2^failures`, capped.
pub struct ItemExponentialFailureRateLimiter<K> {
    failures: Mutex<HashMap<K, u32>>,
    backoff: ExponentialBackoff,
}

impl<K> ItemExponentialFailureRateLimiter<K> {
    /// Creates a limiter with the given base and maximum delay.
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            backoff: ExponentialBackoff::new(base, max),
        }
    }
}

impl<K> Default for ItemExponentialFailureRateLimiter<K> {
    fn default() -> Self {
        let backoff = ExponentialBackoff::default();
        Self::new(backoff.base(), backoff.max())
    }
}

impl<K> fmt::Debug for ItemExponentialFailureRateLimiter<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemExponentialFailureRateLimiter")
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl<K> RateLimiter<K> for ItemExponentialFailureRateLimiter<K>
where
    K: Clone + Eq + Hash + Send + Sync,
{
    fn when(&self, key: &K) -> Duration {
        let mut failures = lock(&self.failures);
        let count = failures.entry(key.clone()).or_insert(0);
        let delay = self.backoff.delay_for_failures(*count);
        *count = count.saturating_add(1);
        delay
    }

    fn forget(&self, key: &K) {
        lock(&self.failures).remove(key);
    }

    fn num_requeues(&self, key: &K) -> u32 {
        lock(&self.failures).get(key).copied().unwrap_or(0)
    }
}

#[derive(Debug)]
struct Bucket {
    /// May go negative: outstanding reservations not yet covered
    tokens: f64,
    last: Instant,
}

/// Token bucket limiting the overall retry rate, independent of the key.
#[derive(Debug)]
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    /// Creates a bucket refilled at `qps` tokens per second holding at most
    /// `burst` tokens. The bucket starts full.
    #[must_use]
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst);
        Self {
            qps,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _key: &K) -> Duration {
        let mut bucket = lock(&self.bucket);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last = now;

        // Reserve one token; a deficit is paid off by waiting
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 || self.qps <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(-bucket.tokens / self.qps).unwrap_or(Duration::MAX)
    }

    fn forget(&self, _key: &K) {}

    fn num_requeues(&self, _key: &K) -> u32 {
        0
    }
}

/// Combines limiters by always taking the most conservative answer.
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    /// Creates a limiter over `limiters`.
    #[must_use]
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> fmt::Debug for MaxOfRateLimiter<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaxOfRateLimiter")
            .field("limiters", &self.limiters.len())
            .finish()
    }
}

impl<K> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&self, key: &K) -> Duration {
        // Every limiter must see the failure, so no short-circuiting
        self.limiters
            .iter()
            .map(|limiter| limiter.when(key))
            .fold(Duration::ZERO, Duration::max)
    }

    fn forget(&self, key: &K) {
        for limiter in &self.limiters {
            limiter.forget(key);
        }
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(key))
            .max()
            .unwrap_or(0)
    }
}

/// Default limiter for controllers: per-key exponential backoff from 5ms up
/// to 1000s, and an overall 10 qps bucket with a burst of 100.
#[must_use]
pub fn default_controller_rate_limiter<K>() -> MaxOfRateLimiter<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::<K>::default()),
        Box::new(BucketRateLimiter::new(10.0, 100)),
    ])
}
