//! Retry policy and backoff arithmetic.

use crate::{RelayError, RelayResult};
use std::time::Duration;

/// Minimum allowed stale-processing threshold.
pub const MIN_STALE_AFTER: Duration = Duration::from_secs(60);

/// Retry limits shared by the claimer and the dispatcher.
///
/// # Backoff Calculation
///
/// A failed attempt `n` is rescheduled after `base * 2^(n - 1)`, capped at
/// `backoff_max`. For the default config:
/// - after attempt 1: 60s
/// - after attempt 2: 120s
/// - after attempt 3: 240s
/// - after attempt 4: 480s
/// - attempt 5 is the last; its failure is terminal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts allowed before a row is failed permanently.
    pub max_attempts: u32,
    /// Base duration for exponential backoff.
    pub backoff_base: Duration,
    /// Cap on a single backoff delay.
    pub backoff_max: Duration,
    /// How long a row may sit in `processing` before it is presumed orphaned.
    pub stale_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_secs(60),
            backoff_max: Duration::from_secs(3600),
            stale_after: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Check the policy's invariants.
    pub fn validate(&self) -> RelayResult<()> {
        if self.max_attempts < 1 {
            return Err(RelayError::InvalidPolicy(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.backoff_base < Duration::from_secs(1) {
            return Err(RelayError::InvalidPolicy(
                "backoff_base must be at least 1s".to_string(),
            ));
        }
        if self.backoff_max < self.backoff_base {
            return Err(RelayError::InvalidPolicy(
                "backoff_max must not be below backoff_base".to_string(),
            ));
        }
        if self.stale_after < MIN_STALE_AFTER {
            return Err(RelayError::InvalidPolicy(format!(
                "stale_after must be at least {}s",
                MIN_STALE_AFTER.as_secs()
            )));
        }
        Ok(())
    }

    /// Delay before a row that just failed attempt `attempt` is due again.
    pub fn backoff(&self, attempt: u32) -> chrono::Duration {
        compute_backoff(attempt, self)
    }

    pub fn stale_after_chrono(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.stale_after.as_millis().min(i64::MAX as u128) as i64)
    }
}

/// `min(base * 2^(attempt - 1), max)` with saturating arithmetic.
pub fn compute_backoff(attempt: u32, policy: &RetryPolicy) -> chrono::Duration {
    if attempt == 0 {
        return chrono::Duration::zero();
    }

    let base_ms = policy.backoff_base.as_millis().min(u64::MAX as u128) as u64;
    let max_ms = policy.backoff_max.as_millis().min(i64::MAX as u128) as u64;
    let shift = attempt.saturating_sub(1);
    let multiplier = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
    let delay_ms = base_ms.saturating_mul(multiplier).min(max_ms);

    chrono::Duration::milliseconds(delay_ms as i64)
}
