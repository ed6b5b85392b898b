//! Retry delay computation for transient transport failures.
use std::time::Duration;

use rand::{thread_rng, Rng};

/// Policy deciding whether (and how long) to wait before retrying a failed request.
///
/// The policy itself is pure computation. The attempt counter is owned by the caller: one counter
/// per logical request chain, so concurrent requests back off independently.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Never retry; every failure is surfaced immediately.
    #[default]
    NoRetry,
    /// Exponential backoff with jitter: `min(2^attempt + uniform[0, 1) seconds, max_delay)` while
    /// `attempt < max_attempts`. Jitter helps to avoid multiple clients synchronizing and
    /// producing spiky network load.
    ExponentialBackoff {
        /// Upper bound for a single delay.
        max_delay: Duration,
        /// Number of retries before giving up.
        max_attempts: u32,
    },
}

impl RetryPolicy {
    /// Return the delay to wait before retry number `attempt` (zero-based), or `None` when the
    /// request should not be retried.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        match self {
            RetryPolicy::NoRetry => None,
            RetryPolicy::ExponentialBackoff {
                max_delay,
                max_attempts,
            } => {
                if attempt >= *max_attempts {
                    return None;
                }
                let backoff = 2f64.powi(attempt.min(32) as i32);
                let jitter: f64 = thread_rng().gen_range(0.0..1.0);
                Some(Duration::from_secs_f64(backoff + jitter).min(*max_delay))
            }
        }
    }
}
