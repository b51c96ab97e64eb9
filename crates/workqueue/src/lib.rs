//! Controller Work Queue
//!
//! A deduplicating, delay-capable work queue for controllers that
//! reconcile objects by key.
//!
//! The queue guarantees that:
//! - a key is queued at most once, no matter how often it is added;
//! - a key is never handed to two workers at the same time;
//! - a key added while it is being processed is delivered exactly once
//!   more, after the current attempt calls `done`.
//!
//! Retries are expressed as delay rather than as a bounded capacity:
//! [`RateLimitingQueue::add_rate_limited`] asks a [`RateLimiter`] how long
//! the key has to wait before it becomes eligible again.
//!
//! # Example
//!
//! ```no_run
//! use workqueue::{default_controller_rate_limiter, RateLimitingQueue};
//!
//! # async fn example() {
//! let queue = RateLimitingQueue::new("events", default_controller_rate_limiter());
//! queue.add("default/pod-1".to_string());
//!
//! while let Some(key) = queue.get().await {
//!     // reconcile `key` ...
//!     queue.forget(&key);
//!     queue.done(&key);
//! }
//! # }
//! ```

pub mod backoff;
pub mod queue;
pub mod rate_limiter;
pub mod rate_limiting_queue;

pub use backoff::ExponentialBackoff;
pub use queue::WorkQueue;
pub use rate_limiter::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter,
    MaxOfRateLimiter, RateLimiter,
};
pub use rate_limiting_queue::RateLimitingQueue;
