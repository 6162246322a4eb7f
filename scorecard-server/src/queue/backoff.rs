//! Exponential backoff for job retries and external-call retries.

use std::time::Duration;

/// Base delay for queue retries.
pub const JOB_RETRY_BASE: Duration = Duration::from_secs(5);

/// Ceiling for any single retry delay.
pub const JOB_RETRY_CAP: Duration = Duration::from_secs(600);

/// Delay before retry number `attempt` (1-indexed: the delay after the
/// first failed attempt is the base). Doubles per attempt, capped.
pub fn exponential_delay(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(32);
    let delay = base.saturating_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX));
    delay.min(cap)
}

/// Queue retry schedule: 5s, 10s, 20s, 40s, ... capped at 10 minutes.
pub fn retry_delay(attempt: u32) -> Duration {
    exponential_delay(JOB_RETRY_BASE, attempt, JOB_RETRY_CAP)
}
