//! Periodic lease-expiry sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::QueueResult;
use crate::queue::JobQueue;

/// Sweeps the queue for jobs whose lease lapsed while still active and
/// returns them to the pending pool.
///
/// A lease is a soft timeout: expiry never stops the original worker,
/// it only makes the job claimable again. The ownership checks in
/// heartbeat/complete/retry are what a surviving worker uses to notice
/// it has been fenced out.
pub struct LeaseReclaimer {
    queue: Arc<JobQueue>,
    interval: Duration,
}

impl LeaseReclaimer {
    /// Sweep on the queue's configured reclaim interval (half the
    /// default lease, so an orphaned job waits at most 1.5 leases).
    pub fn new(queue: Arc<JobQueue>) -> Self {
        let interval = queue.config().reclaim_interval;
        Self { queue, interval }
    }

    pub fn with_interval(queue: Arc<JobQueue>, interval: Duration) -> Self {
        Self { queue, interval }
    }

    /// One sweep; returns how many jobs were reclaimed.
    pub async fn sweep_once(&self) -> QueueResult<usize> {
        self.queue.reclaim_expired_leases().await
    }

    /// Run the sweep on its interval until shut down.
    pub fn spawn(self) -> ReclaimerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let join = tokio::spawn(async move {
            info!(interval_ms = self.interval.as_millis() as u64, "lease reclaimer started");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so a fresh
            // deployment does not sweep before anything can be leased.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.queue.reclaim_expired_leases().await {
                            Ok(0) => {}
                            Ok(n) => info!(reclaimed = n, "reclaimed expired leases"),
                            Err(e) => error!(error = %e, "lease sweep failed"),
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            info!("lease reclaimer stopped");
        });

        ReclaimerHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

/// Handle to a running reclaimer task.
pub struct ReclaimerHandle {
    shutdown: mpsc::Sender<()>,
    join: JoinHandle<()>,
}

impl ReclaimerHandle {
    /// Request shutdown and wait for the task to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(()).await;
        let _ = self.join.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::queue::EnqueueRequest;
    use repolens_core::{JobStatus, ResourceId};
    use repolens_db::{InMemoryJobStore, InMemoryLogStore};

    fn test_queue() -> Arc<JobQueue> {
        Arc::new(JobQueue::new(
            Arc::new(InMemoryJobStore::new()),
            Arc::new(InMemoryLogStore::new()),
            QueueConfig::default(),
        ))
    }

    #[tokio::test]
    async fn sweep_once_reclaims_only_expired_leases() {
        let queue = test_queue();

        for _ in 0..2 {
            queue
                .enqueue(EnqueueRequest {
                    owner_id: ResourceId::new(),
                    repo_id: ResourceId::new(),
                    prompt: serde_json::json!({}),
                    dedupe_key: None,
                })
                .await
                .unwrap();
        }

        // One healthy lease, one already expired.
        let healthy = queue
            .claim("w1", Some(Duration::from_secs(300)))
            .await
            .unwrap()
            .unwrap();
        let orphaned = queue
            .claim("w2", Some(Duration::ZERO))
            .await
            .unwrap()
            .unwrap();

        let reclaimer = LeaseReclaimer::new(queue.clone());
        assert_eq!(reclaimer.sweep_once().await.unwrap(), 1);

        let healthy_job = queue.get_job(healthy.job_id).await.unwrap();
        assert_eq!(healthy_job.status, JobStatus::Claimed);

        let orphaned_job = queue.get_job(orphaned.job_id).await.unwrap();
        assert_eq!(orphaned_job.status, JobStatus::Pending);
        assert_eq!(orphaned_job.attempts, 1);
    }

    #[tokio::test]
    async fn spawned_reclaimer_shuts_down_cleanly() {
        let queue = test_queue();
        let handle = LeaseReclaimer::with_interval(queue, Duration::from_millis(10)).spawn();
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.shutdown().await;
    }
}
