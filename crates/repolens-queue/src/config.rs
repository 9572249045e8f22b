//! Queue configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use repolens_core::RetryPolicy;

/// Tuning knobs for the queue, reclaimer, and worker loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Lease granted at claim time unless the caller asks otherwise.
    /// Workers must heartbeat well inside this window.
    pub default_lease: Duration,
    /// Retry budget for newly enqueued jobs.
    pub default_max_attempts: u32,
    /// Backoff applied between failed attempts.
    pub retry: RetryPolicy,
    /// How often the reclaimer sweeps for expired leases.
    pub reclaim_interval: Duration,
    /// How long an idle worker sleeps between claim attempts.
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_lease: Duration::from_secs(300),
            default_max_attempts: 5,
            retry: RetryPolicy::default(),
            reclaim_interval: Duration::from_secs(150),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl QueueConfig {
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.default_lease = lease;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}
