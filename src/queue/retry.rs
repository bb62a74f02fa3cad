//! Retry policy: per-item exponential backoff with a give-up threshold.

use std::time::Duration;

const fn default_base_backoff() -> Duration {
    Duration::from_millis(5)
}

const fn default_max_backoff() -> Duration {
    Duration::from_secs(1000)
}

const fn default_retry_threshold() -> u32 {
    5
}

/// What to do with a key that just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the key back after this delay.
    Requeue(Duration),
    /// Threshold reached. Forget the key and report the failure.
    GiveUp,
}

/// Backoff bounds and the consecutive-failure limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry. Doubles with each further failure.
    pub base_backoff: Duration,
    /// Upper bound on any single retry delay.
    pub max_backoff: Duration,
    /// Number of retries allowed before giving up on a key.
    pub retry_threshold: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_backoff: default_base_backoff(),
            max_backoff: default_max_backoff(),
            retry_threshold: default_retry_threshold(),
        }
    }
}

impl RetryPolicy {
    pub fn new(base_backoff: Duration, max_backoff: Duration, retry_threshold: u32) -> Self {
        Self {
            base_backoff,
            max_backoff,
            retry_threshold,
        }
    }

    /// Delay for a key that has already been requeued `attempts` times.
    ///
    /// `base * 2^attempts`, capped at `max_backoff`. Saturates instead of
    /// overflowing for large attempt counts.
    #[must_use]
    pub fn backoff(&self, attempts: u32) -> Duration {
        let factor = 1u32.checked_shl(attempts).unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.max_backoff)
    }

    /// Decide whether `key` gets another attempt after `attempts` requeues.
    #[must_use]
    pub fn decide(&self, _key: &str, attempts: u32) -> RetryDecision {
        if attempts >= self.retry_threshold {
            RetryDecision::GiveUp
        } else {
            RetryDecision::Requeue(self.backoff(attempts))
        }
    }
}
