//! # Exponential Backoff
//!
//! Per-failure backoff curve used by the item rate limiter.
//!
//! The delay doubles with every consecutive failure of a key and is capped:
//! `base`, `base * 2`, `base * 4`, ... up to `max`.
//! With the controller defaults (5ms base, 1000s max) the sequence is
//! 5ms, 10ms, 20ms, 40ms, 80ms, ... and reaches the cap after 18 failures.

use std::time::Duration;

/// Exponential backoff calculator
///
/// Stateless: the caller keeps the failure count per key and asks for the
/// delay that belongs to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    /// Delay for the first failure
    base: Duration,
    /// Upper bound for any delay
    max: Duration,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff with the given base and maximum delay
    ///
    /// # Arguments
    ///
    /// * `base` - Delay returned for a key with no previous failures
    /// * `max` - Cap on the delay, no matter how many failures were recorded
    #[must_use]
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Base delay
    #[must_use]
    pub const fn base(&self) -> Duration {
        self.base
    }

    /// Maximum delay
    #[must_use]
    pub const fn max(&self) -> Duration {
        self.max
    }

    /// Calculate the delay for a given number of previous failures
    ///
    /// Returns `base * 2^failures`, capped at `max`. Overflow of the
    /// multiplication saturates at `max`.
    #[must_use]
    pub fn delay_for_failures(&self, failures: u32) -> Duration {
        let delay = 2u32
            .checked_pow(failures)
            .and_then(|factor| self.base.checked_mul(factor));

        match delay {
            Some(delay) if delay < self.max => delay,
            _ => self.max,
        }
    }
}

impl Default for ExponentialBackoff {
    /// Controller defaults: 5ms base, 1000s max
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000))
    }
}
