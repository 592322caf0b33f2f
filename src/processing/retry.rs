//! Retry budget and exponential backoff for failed jobs.

use std::time::Duration;

use serde::Serialize;

use super::types::FailureKind;

const MAX_BACKOFF_EXPONENT: u32 = 16;
const MAX_RETRY_DELAY_MS: u64 = 5 * 60 * 1_000;

/// How many times a job may be retried and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryPolicy {
    /// Retries granted after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    /// Policy with `max_retries` retries starting at `base_delay_ms`.
    pub const fn new(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
        }
    }

    /// Total attempts a job gets, counting the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Whether a job that has made `attempts_made` attempts may run again.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts()
    }

    /// Delay before the attempt following attempt number `attempt` (1-based):
    /// `base * 2^(attempt - 1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(compute_retry_delay_ms(
            self.base_delay_ms,
            attempt.saturating_sub(1),
        ))
    }
}

/// What the job processor does with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Push the job back without consuming an attempt.
    Requeue(Duration),
    /// Schedule another attempt after the delay.
    Retry(Duration),
    /// Give up and mark the job failed.
    Fail,
}

impl RetryPolicy {
    /// Decide how to treat a failure of kind `kind` on attempt `attempts_made`.
    pub fn disposition(&self, kind: FailureKind, attempts_made: u32) -> Disposition {
        match kind {
            FailureKind::Contention => Disposition::Requeue(self.backoff(1)),
            FailureKind::Transient if self.should_retry(attempts_made) => {
                Disposition::Retry(self.backoff(attempts_made))
            }
            _ => Disposition::Fail,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 1_000)
    }
}

fn compute_retry_delay_ms(base_delay_ms: u64, exponent: u32) -> u64 {
    let shift = exponent.min(MAX_BACKOFF_EXPONENT);
    let factor = 1_u64.checked_shl(shift).unwrap_or(u64::MAX);
    base_delay_ms.saturating_mul(factor).min(MAX_RETRY_DELAY_MS)
}
