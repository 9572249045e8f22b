//! Worker loop: claims jobs and drives the opaque work while keeping
//! the lease alive.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{info, warn};

use repolens_core::{JobId, JobStage};

use crate::error::{QueueError, QueueResult};
use crate::queue::{ClaimedJob, HeartbeatUpdate, JobQueue};

/// The opaque, externally-supplied operation a worker performs while it
/// holds a job's lease: whatever cloning and analysis the deployment
/// plugs in.
///
/// Implementations should call [`WorkerContext::report`] at stage
/// boundaries and poll [`WorkerContext::cancel_requested`] at safe
/// points; cancellation is a flag, not an interrupt, so the polling
/// granularity bounds how long a canceled job keeps running. Returning
/// `Err` reports the attempt as failed; the queue owns the
/// retry-vs-deadletter decision from there.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(
        &self,
        job: &ClaimedJob,
        ctx: &WorkerContext,
    ) -> Result<serde_json::Value, String>;
}

/// Handle the opaque work uses to talk back to the queue.
#[derive(Clone)]
pub struct WorkerContext {
    queue: Arc<JobQueue>,
    job_id: JobId,
    worker_id: String,
}

impl WorkerContext {
    /// Report a stage transition and optional progress; also extends
    /// the lease.
    pub async fn report(
        &self,
        stage: JobStage,
        current_step: Option<u32>,
        total_steps: Option<u32>,
        progress: Option<String>,
    ) -> QueueResult<()> {
        self.queue
            .heartbeat(
                self.job_id,
                &self.worker_id,
                HeartbeatUpdate {
                    stage: Some(stage),
                    current_step,
                    total_steps,
                    progress,
                    lease: None,
                },
            )
            .await
    }

    /// Whether the submitter has asked this job to stop. Poll between
    /// units of work and abort early when it turns true.
    pub async fn cancel_requested(&self) -> QueueResult<bool> {
        let job = self.queue.get_job(self.job_id).await?;
        Ok(job.cancel_requested || job.status.is_terminal())
    }

    /// Append to the job's diagnostic trail.
    pub async fn log(
        &self,
        level: repolens_core::LogLevel,
        msg: &str,
    ) -> QueueResult<()> {
        self.queue.append_log(self.job_id, level, msg).await?;
        Ok(())
    }
}

/// A worker that claims jobs and executes them through a `JobHandler`.
///
/// While the handler runs, the worker heartbeats at a third of the
/// lease duration. A `LeaseLost` from any queue call aborts the
/// in-flight work immediately: the lease was reassigned and another
/// worker may already own the job.
pub struct Worker {
    id: String,
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
}

impl Worker {
    pub fn new(id: impl Into<String>, queue: Arc<JobQueue>, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            id: id.into(),
            queue,
            handler,
        }
    }

    /// Run the worker loop until the task is aborted.
    pub async fn run(&self) {
        info!(worker_id = %self.id, "starting worker");
        let poll_interval = self.queue.config().poll_interval;

        loop {
            match self.poll_once().await {
                Ok(true) => {}
                Ok(false) => sleep(poll_interval).await,
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "worker iteration failed");
                    sleep(poll_interval).await;
                }
            }
        }
    }

    /// Claim and execute at most one job. Returns whether a job was
    /// processed; `false` means the queue was empty.
    pub async fn poll_once(&self) -> QueueResult<bool> {
        let Some(job) = self.queue.claim(&self.id, None).await? else {
            return Ok(false);
        };
        self.execute(job).await;
        Ok(true)
    }

    async fn execute(&self, job: ClaimedJob) {
        let job_id = job.job_id;
        let ctx = WorkerContext {
            queue: self.queue.clone(),
            job_id,
            worker_id: self.id.clone(),
        };

        let handler = self.handler.clone();
        let handler_ctx = ctx.clone();
        let mut work = tokio::spawn(async move { handler.run(&job, &handler_ctx).await });

        let mut ticker = tokio::time::interval(self.queue.config().default_lease / 3);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick is immediate; the claim just set the lease

        let outcome = loop {
            tokio::select! {
                res = &mut work => break res,
                _ = ticker.tick() => {
                    if let Err(e) = self
                        .queue
                        .heartbeat(job_id, &self.id, HeartbeatUpdate::default())
                        .await
                    {
                        warn!(job_id = %job_id, worker_id = %self.id, error = %e, "lease lost; abandoning job");
                        work.abort();
                        let _ = work.await;
                        return;
                    }
                }
            }
        };

        let report = match outcome {
            Ok(Ok(result)) => self.queue.complete(job_id, &self.id, Some(result), None).await,
            Ok(Err(msg)) => self
                .queue
                .retry_or_fail(job_id, &self.id, &msg)
                .await
                .map(|_| ()),
            Err(join_err) => {
                let msg = format!("worker task failed: {join_err}");
                self.queue
                    .retry_or_fail(job_id, &self.id, &msg)
                    .await
                    .map(|_| ())
            }
        };

        // A lost lease at reporting time means the job moved on without
        // us (reclaimed or canceled). Nothing left to do.
        if let Err(QueueError::LeaseLost { .. }) = report {
            warn!(job_id = %job_id, worker_id = %self.id, "job was reassigned before the result landed");
        } else if let Err(e) = report {
            warn!(job_id = %job_id, worker_id = %self.id, error = %e, "failed to report job outcome");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::queue::EnqueueRequest;
    use repolens_core::{JobStatus, LogLevel, ResourceId, RetryPolicy};
    use repolens_db::{InMemoryJobStore, InMemoryLogStore};

    fn test_queue(config: QueueConfig) -> Arc<JobQueue> {
        Arc::new(JobQueue::new(
            Arc::new(InMemoryJobStore::new()),
            Arc::new(InMemoryLogStore::new()),
            config,
        ))
    }

    async fn enqueue_one(queue: &JobQueue) -> JobId {
        queue
            .enqueue(EnqueueRequest {
                owner_id: ResourceId::new(),
                repo_id: ResourceId::new(),
                prompt: serde_json::json!({}),
                dedupe_key: None,
            })
            .await
            .unwrap()
            .job_id
    }

    struct Succeeding;

    #[async_trait]
    impl JobHandler for Succeeding {
        async fn run(
            &self,
            _job: &ClaimedJob,
            ctx: &WorkerContext,
        ) -> Result<serde_json::Value, String> {
            ctx.report(JobStage::Analyzing, Some(1), Some(2), None)
                .await
                .map_err(|e| e.to_string())?;
            ctx.log(LogLevel::Info, "analysis finished")
                .await
                .map_err(|e| e.to_string())?;
            Ok(serde_json::json!({"chapters": 4}))
        }
    }

    struct Failing;

    #[async_trait]
    impl JobHandler for Failing {
        async fn run(
            &self,
            _job: &ClaimedJob,
            _ctx: &WorkerContext,
        ) -> Result<serde_json::Value, String> {
            Err("clone failed".to_string())
        }
    }

    #[tokio::test]
    async fn idle_worker_reports_empty_queue() {
        let queue = test_queue(QueueConfig::default());
        let worker = Worker::new("w1", queue, Arc::new(Succeeding));
        assert!(!worker.poll_once().await.unwrap());
    }

    #[tokio::test]
    async fn successful_handler_completes_the_job() {
        let queue = test_queue(QueueConfig::default());
        let job_id = enqueue_one(&queue).await;

        let worker = Worker::new("w1", queue.clone(), Arc::new(Succeeding));
        assert!(worker.poll_once().await.unwrap());

        let job = queue.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(serde_json::json!({"chapters": 4})));
        assert_eq!(job.current_step, Some(1));
        assert!(job.lease_fields_consistent());

        let logs = queue.get_logs(job_id, None).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].msg, "analysis finished");
    }

    #[tokio::test]
    async fn failing_handler_burns_the_retry_budget() {
        let queue = test_queue(
            QueueConfig::default()
                .with_max_attempts(2)
                .with_retry(RetryPolicy {
                    base_delay: Duration::ZERO,
                    max_delay: Duration::ZERO,
                    jitter: Duration::ZERO,
                }),
        );
        let job_id = enqueue_one(&queue).await;
        let worker = Worker::new("w1", queue.clone(), Arc::new(Failing));

        assert!(worker.poll_once().await.unwrap());
        let job = queue.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("clone failed"));

        assert!(worker.poll_once().await.unwrap());
        let job = queue.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Dead);
        assert_eq!(job.attempts, 2);
    }

    #[tokio::test]
    async fn handler_observes_cooperative_cancellation() {
        struct PollsCancel;

        #[async_trait]
        impl JobHandler for PollsCancel {
            async fn run(
                &self,
                _job: &ClaimedJob,
                ctx: &WorkerContext,
            ) -> Result<serde_json::Value, String> {
                for _ in 0..50 {
                    if ctx.cancel_requested().await.map_err(|e| e.to_string())? {
                        return Err("canceled at a safe point".to_string());
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Ok(serde_json::json!({}))
            }
        }

        let queue = test_queue(QueueConfig::default());
        let job_id = enqueue_one(&queue).await;

        let worker_queue = queue.clone();
        let work = tokio::spawn(async move {
            let worker = Worker::new("w1", worker_queue, Arc::new(PollsCancel));
            worker.poll_once().await
        });

        // Let the worker claim, then pull the job out from under it.
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.request_cancel(job_id).await.unwrap();
        work.await.unwrap().unwrap();

        // Cancellation, not the handler's error, is the final word.
        let job = queue.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Canceled);
        assert!(job.cancel_requested);
    }
}
