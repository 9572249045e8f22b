//! The queue facade: every operation the submission, worker, and
//! observer surfaces expose.
//!
//! Handlers follow a read-verify-write shape: any precondition checked
//! here is re-verified by the store's guarded update, so a race lost
//! between the read and the write surfaces as `LeaseLost` or
//! `InvalidTransition` rather than a partial mutation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use repolens_core::{Job, JobId, JobStage, LogEntry, LogLevel, ResourceId};
use repolens_db::{DbError, JobStore, LogStore, ProgressPatch, StatusCounts};

use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};

/// How many times enqueue retries when its insert races another
/// submission for the same dedupe key.
const ENQUEUE_RETRIES: u32 = 3;

/// A new task submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub owner_id: ResourceId,
    pub repo_id: ResourceId,
    /// Opaque payload handed to the worker at claim time.
    pub prompt: serde_json::Value,
    /// Optional idempotency key; at most one active job per key.
    pub dedupe_key: Option<String>,
}

/// Outcome of a submission.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EnqueueReceipt {
    pub job_id: JobId,
    /// True when an active job already covered this submission and no
    /// new row was written.
    pub duplicate: bool,
}

/// Everything a worker needs to begin the opaque work without a further
/// read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimedJob {
    pub job_id: JobId,
    pub owner_id: ResourceId,
    pub repo_id: ResourceId,
    pub prompt: serde_json::Value,
    pub callback_token: String,
    pub attempts: u32,
}

impl From<Job> for ClaimedJob {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            owner_id: job.owner_id,
            repo_id: job.repo_id,
            prompt: job.prompt,
            callback_token: job.callback_token,
            attempts: job.attempts,
        }
    }
}

/// Optional state carried by a heartbeat.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatUpdate {
    /// Narrow the active state for display ("cloning", "running", ...).
    pub stage: Option<JobStage>,
    pub current_step: Option<u32>,
    pub total_steps: Option<u32>,
    pub progress: Option<String>,
    /// Override the lease extension; defaults to the configured lease.
    pub lease: Option<Duration>,
}

/// Outcome of reporting a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Requeued with backoff; eligible again at `next_run_at`.
    Retrying {
        attempts: u32,
        next_run_at: DateTime<Utc>,
    },
    /// Retry ceiling exceeded; the job is dead and must be resubmitted.
    Dead { attempts: u32 },
}

/// Aggregate queue state for dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub counts: StatusCounts,
    /// Most recently updated jobs, newest first.
    pub recent_activity: Vec<Job>,
}

/// Number of jobs reported in `QueueMetrics::recent_activity`.
const RECENT_ACTIVITY_LIMIT: i64 = 20;

/// The durable job queue.
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    logs: Arc<dyn LogStore>,
    config: QueueConfig,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, logs: Arc<dyn LogStore>, config: QueueConfig) -> Self {
        Self {
            store,
            logs,
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn deadline(&self, lease: Option<Duration>) -> DateTime<Utc> {
        let lease = lease.unwrap_or(self.config.default_lease);
        Utc::now() + chrono::Duration::from_std(lease).unwrap_or_default()
    }

    /// Submit a new analysis task.
    ///
    /// An active job with the same dedupe key, or an active job against
    /// the same repository, absorbs the submission: its id comes back
    /// with `duplicate = true` and no row is written. The dedupe-key
    /// path is race-free (a partial unique index backs it); the
    /// repository check covers the happy path only, so callers needing
    /// airtight per-repository uniqueness should pass the repository id
    /// as the dedupe key. Kicking off a worker is the caller's job, not
    /// a side effect here.
    pub async fn enqueue(&self, req: EnqueueRequest) -> QueueResult<EnqueueReceipt> {
        for _ in 0..ENQUEUE_RETRIES {
            if let Some(key) = req.dedupe_key.as_deref() {
                if let Some(existing) = self.store.find_active_by_dedupe_key(key).await? {
                    debug!(job_id = %existing.id, dedupe_key = key, "submission deduplicated");
                    return Ok(EnqueueReceipt {
                        job_id: existing.id,
                        duplicate: true,
                    });
                }
            }
            if let Some(existing) = self.store.find_active_for_repo(req.repo_id).await? {
                debug!(job_id = %existing.id, repo_id = %req.repo_id, "repository already has an active job");
                return Ok(EnqueueReceipt {
                    job_id: existing.id,
                    duplicate: true,
                });
            }

            let mut job = Job::new(
                req.owner_id,
                req.repo_id,
                req.prompt.clone(),
                self.config.default_max_attempts,
            );
            job.dedupe_key = req.dedupe_key.clone();

            match self.store.insert(&job).await {
                Ok(()) => {
                    info!(job_id = %job.id, repo_id = %job.repo_id, "job enqueued");
                    return Ok(EnqueueReceipt {
                        job_id: job.id,
                        duplicate: false,
                    });
                }
                // Lost an insert race on the dedupe key; loop to pick up
                // the winner (or insert again if it just terminated).
                Err(DbError::Duplicate(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(QueueError::Store(DbError::Duplicate(
            req.dedupe_key.unwrap_or_default(),
        )))
    }

    /// Claim the oldest ready pending job for `worker_id`.
    ///
    /// `None` means empty queue or lost contention, the normal idle
    /// outcome rather than an error.
    pub async fn claim(
        &self,
        worker_id: &str,
        lease: Option<Duration>,
    ) -> QueueResult<Option<ClaimedJob>> {
        let lease_until = self.deadline(lease);
        match self.store.claim_next(worker_id, lease_until).await? {
            Some(job) => {
                info!(job_id = %job.id, worker_id, attempts = job.attempts, "job claimed");
                Ok(Some(job.into()))
            }
            None => Ok(None),
        }
    }

    /// Extend the caller's lease and optionally record progress.
    ///
    /// This is the only mechanism keeping the reclaimer from treating a
    /// slow-but-alive worker as crashed; call it well inside the lease
    /// window. Fails with `LeaseLost` when the lease was reassigned, in
    /// which case the caller must stop working on the job.
    pub async fn heartbeat(
        &self,
        job_id: JobId,
        worker_id: &str,
        update: HeartbeatUpdate,
    ) -> QueueResult<()> {
        let lease_until = self.deadline(update.lease);
        let patch = ProgressPatch {
            current_step: update.current_step,
            total_steps: update.total_steps,
            progress: update.progress,
        };
        self.store
            .extend_lease(job_id, worker_id, lease_until, update.stage, patch)
            .await?;
        Ok(())
    }

    /// Record terminal success and release the lease.
    pub async fn complete(
        &self,
        job_id: JobId,
        worker_id: &str,
        result: Option<serde_json::Value>,
        result_count: Option<i64>,
    ) -> QueueResult<()> {
        self.store
            .complete(job_id, worker_id, result, result_count)
            .await?;
        info!(job_id = %job_id, worker_id, "job completed");
        Ok(())
    }

    /// Report a failed attempt. Owns the retry-vs-deadletter decision:
    /// within budget the job is requeued with exponential backoff, past
    /// the ceiling it is dead-lettered.
    pub async fn retry_or_fail(
        &self,
        job_id: JobId,
        worker_id: &str,
        error_msg: &str,
    ) -> QueueResult<RetryOutcome> {
        let job = self.store.get(job_id).await?;
        if job.locked_by.as_deref() != Some(worker_id) {
            return Err(QueueError::LeaseLost {
                job_id,
                worker_id: worker_id.to_string(),
            });
        }

        let attempts = job.attempts + 1;
        if attempts >= job.max_attempts {
            self.store
                .mark_dead(job_id, worker_id, attempts, error_msg)
                .await?;
            warn!(job_id = %job_id, attempts, error = error_msg, "job dead-lettered");
            return Ok(RetryOutcome::Dead { attempts });
        }

        let delay = self.config.retry.delay_for_attempt(attempts);
        let next_run_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        self.store
            .requeue_attempt(job_id, worker_id, attempts, next_run_at, error_msg)
            .await?;
        info!(
            job_id = %job_id,
            attempts,
            delay_ms = delay.as_millis() as u64,
            error = error_msg,
            "job requeued with backoff"
        );
        Ok(RetryOutcome::Retrying {
            attempts,
            next_run_at,
        })
    }

    /// Return every lease-expired, still-active job to the pending pool,
    /// charging one attempt each. This is the sole crash-recovery path:
    /// a worker that dies without heartbeating forfeits the job here.
    pub async fn reclaim_expired_leases(&self) -> QueueResult<usize> {
        let reclaimed = self.store.reclaim_expired(Utc::now()).await?;
        for job in &reclaimed {
            warn!(
                job_id = %job.id,
                attempts = job.attempts,
                "lease expired; job returned to queue"
            );
        }
        Ok(reclaimed.len())
    }

    /// Cooperative cancellation: terminal `canceled` status plus the
    /// `cancel_requested` flag the opaque worker is expected to poll at
    /// safe points. A worker that misses the flag learns through
    /// `LeaseLost` on its next heartbeat.
    pub async fn request_cancel(&self, job_id: JobId) -> QueueResult<()> {
        let job = self.store.cancel(job_id, "cancellation requested").await?;
        info!(job_id = %job.id, "cancellation requested");
        Ok(())
    }

    /// Owner-initiated cancellation. The job must belong to `owner_id`
    /// and still be pending or active.
    pub async fn cancel(&self, job_id: JobId, owner_id: ResourceId) -> QueueResult<()> {
        let job = self.store.get(job_id).await?;
        if job.owner_id != owner_id {
            // From this owner's viewpoint the job does not exist.
            return Err(QueueError::NotFound(format!("job {}", job_id)));
        }
        self.store.cancel(job_id, "canceled by owner").await?;
        info!(job_id = %job_id, owner_id = %owner_id, "job canceled by owner");
        Ok(())
    }

    pub async fn get_job(&self, job_id: JobId) -> QueueResult<Job> {
        Ok(self.store.get(job_id).await?)
    }

    pub async fn list_jobs_for_owner(&self, owner_id: ResourceId) -> QueueResult<Vec<Job>> {
        Ok(self.store.list_by_owner(owner_id).await?)
    }

    /// Append one entry to the job's diagnostic trail.
    pub async fn append_log(
        &self,
        job_id: JobId,
        level: LogLevel,
        msg: &str,
    ) -> QueueResult<LogEntry> {
        Ok(self.logs.append(job_id, level, msg).await?)
    }

    /// Entries after the watermark, ascending by `seq`, for incremental
    /// polling.
    pub async fn get_logs(
        &self,
        job_id: JobId,
        after_seq: Option<i64>,
    ) -> QueueResult<Vec<LogEntry>> {
        Ok(self.logs.list(job_id, after_seq).await?)
    }

    pub async fn metrics(&self) -> QueueResult<QueueMetrics> {
        let counts = self.store.count_by_status().await?;
        let recent_activity = self.store.list_recent(RECENT_ACTIVITY_LIMIT).await?;
        Ok(QueueMetrics {
            counts,
            recent_activity,
        })
    }
}
