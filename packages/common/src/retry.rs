use std::time::Duration;

use chrono::{DateTime, Utc};

/// Default window after which a `processing` claim is considered abandoned
/// and the row becomes eligible for re-claim by any replica.
pub const DEFAULT_LOCK_EXPIRATION: Duration = Duration::from_secs(5 * 60);

/// Retry accounting shared by the repository backends and the processor.
///
/// The backoff schedule is deterministic (no jitter) so that every replica
/// computes the same earliest-retry time when evaluating the selection
/// predicate.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_retries: i32,
    retry_backoff: Duration,
    lock_expiration: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: i32, retry_backoff: Duration) -> Self {
        Self {
            max_retries,
            retry_backoff,
            lock_expiration: DEFAULT_LOCK_EXPIRATION,
        }
    }

    pub fn with_lock_expiration(mut self, lock_expiration: Duration) -> Self {
        self.lock_expiration = lock_expiration;
        self
    }

    pub fn max_retries(&self) -> i32 {
        self.max_retries
    }

    pub fn lock_expiration(&self) -> Duration {
        self.lock_expiration
    }

    /// Delay before an event that has failed `retry_count` times may be
    /// retried: `min(lock_expiration, retry_backoff * 2^retry_count)`.
    ///
    /// Never exceeds the reclaim window: an event waiting on backoff is not
    /// parked longer than an abandoned claim would be.
    pub fn backoff_delay(&self, retry_count: i32) -> Duration {
        let exponent = retry_count.clamp(0, 31) as u32;
        let factor = 2u32.saturating_pow(exponent);
        self.retry_backoff
            .saturating_mul(factor)
            .min(self.lock_expiration)
    }

    /// Whether an event's projected earliest retry time has arrived.
    ///
    /// Events that have never been attempted are always due.
    pub fn retry_due(&self, retry_count: i32, updated_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if retry_count <= 0 {
            return true;
        }
        let Ok(delay) = chrono::Duration::from_std(self.backoff_delay(retry_count)) else {
            return false;
        };
        updated_at
            .checked_add_signed(delay)
            .is_some_and(|due| now >= due)
    }
}
