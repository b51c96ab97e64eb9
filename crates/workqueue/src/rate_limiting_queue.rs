//! Work queue with rate-limited re-adds.

use crate::queue::WorkQueue;
use crate::rate_limiter::RateLimiter;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

/// A [`WorkQueue`] whose failed keys are re-added after a delay chosen by a
/// [`RateLimiter`].
///
/// The limiter owns the per-key retry state: [`add_rate_limited`] records a
/// failure, [`forget`] clears it and [`num_requeues`] reports it.
///
/// [`add_rate_limited`]: RateLimitingQueue::add_rate_limited
/// [`forget`]: RateLimitingQueue::forget
/// [`num_requeues`]: RateLimitingQueue::num_requeues
pub struct RateLimitingQueue<K> {
    queue: WorkQueue<K>,
    limiter: Arc<dyn RateLimiter<K>>,
}

impl<K> Clone for RateLimitingQueue<K> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            limiter: Arc::clone(&self.limiter),
        }
    }
}

impl<K> fmt::Debug for RateLimitingQueue<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitingQueue")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl<K> RateLimitingQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + fmt::Debug + 'static,
{
    /// Creates a queue using `limiter` for retries.
    pub fn new(name: impl Into<String>, limiter: impl RateLimiter<K> + 'static) -> Self {
        Self::with_shared_limiter(name, Arc::new(limiter))
    }

    /// Creates a queue with a limiter that is shared with the caller.
    pub fn with_shared_limiter(name: impl Into<String>, limiter: Arc<dyn RateLimiter<K>>) -> Self {
        Self {
            queue: WorkQueue::new(name),
            limiter,
        }
    }

    /// See [`WorkQueue::add`].
    pub fn add(&self, key: K) {
        self.queue.add(key);
    }

    /// See [`WorkQueue::add_after`].
    pub fn add_after(&self, key: K, delay: Duration) {
        self.queue.add_after(key, delay);
    }

    /// Re-adds `key` once the rate limiter says it may be retried.
    ///
    /// Records one more failure for the key.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.limiter.when(&key);
        self.queue.add_after(key, delay);
    }

    /// Clears the retry state of `key`.
    ///
    /// Does not remove the key from the queue; idempotent.
    pub fn forget(&self, key: &K) {
        self.limiter.forget(key);
    }

    /// Failures recorded for `key` since it was last forgotten.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.limiter.num_requeues(key)
    }

    /// See [`WorkQueue::get`].
    pub async fn get(&self) -> Option<K> {
        self.queue.get().await
    }

    /// See [`WorkQueue::done`].
    pub fn done(&self, key: &K) {
        self.queue.done(key);
    }

    /// See [`WorkQueue::len`].
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// See [`WorkQueue::is_empty`].
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// See [`WorkQueue::shut_down`].
    pub fn shut_down(&self) {
        self.queue.shut_down();
    }

    /// See [`WorkQueue::is_shutting_down`].
    pub fn is_shutting_down(&self) -> bool {
        self.queue.is_shutting_down()
    }

    /// Name of the underlying queue.
    pub fn name(&self) -> &str {
        self.queue.name()
    }
}
