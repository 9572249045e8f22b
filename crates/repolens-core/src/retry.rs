//! Retry backoff policy.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff with a cap and additive jitter.
///
/// The delay for attempt `n` (1-indexed) is
/// `min(base_delay * 2^(n-1), max_delay)` plus a uniform random draw from
/// `[0, jitter)`. The jitter decorrelates simultaneously-failing jobs so
/// they do not all re-contend for the claim scheduler at the same
/// instant; the cap bounds worst-case backoff so a transient outage does
/// not indefinitely delay recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(600),
            jitter: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before re-running a job whose `attempt`-th try just failed.
    /// `attempt` is 1-indexed; 0 is treated as 1.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;

        // Shift capped at 30 keeps the multiply in range; the min()
        // against the cap makes larger exponents indistinguishable.
        let exp = attempt.saturating_sub(1).min(30);
        let backoff_ms = base_ms.saturating_mul(1u64 << exp).min(max_ms);

        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            rand::rng().random_range(0..jitter_ms)
        } else {
            0
        };

        Duration::from_millis(backoff_ms + jitter)
    }
}
