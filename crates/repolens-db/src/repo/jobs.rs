//! Job store: the transactional table of job records.
//!
//! All state transitions are single guarded UPDATE statements that
//! re-verify their precondition (current status, lease ownership) in the
//! WHERE clause. A caller that lost a race gets `LeaseLost` or
//! `InvalidTransition` back instead of silently clobbering the row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use repolens_core::{Job, JobId, JobStage, JobStatus, ResourceId};

use crate::{DbError, DbResult};

/// Statuses under which a job counts as occupying its dedupe key.
const PENDING_OR_ACTIVE_SQL: &str =
    "('pending','claimed','cloning','analyzing','gathering','running')";

/// Statuses under which a worker holds a lease.
const ACTIVE_SQL: &str = "('claimed','cloning','analyzing','gathering','running')";

/// Advisory progress fields attached to a heartbeat. `None` leaves the
/// stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct ProgressPatch {
    pub current_step: Option<u32>,
    pub total_steps: Option<u32>,
    pub progress: Option<String>,
}

/// Job counts by status, for the metrics surface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub claimed: u64,
    pub cloning: u64,
    pub analyzing: u64,
    pub gathering: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub canceled: u64,
    pub dead: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: JobStatus, n: u64) {
        let slot = match status {
            JobStatus::Pending => &mut self.pending,
            JobStatus::Claimed => &mut self.claimed,
            JobStatus::Cloning => &mut self.cloning,
            JobStatus::Analyzing => &mut self.analyzing,
            JobStatus::Gathering => &mut self.gathering,
            JobStatus::Running => &mut self.running,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Canceled => &mut self.canceled,
            JobStatus::Dead => &mut self.dead,
        };
        *slot += n;
    }

    /// Jobs currently holding a lease.
    pub fn active(&self) -> u64 {
        self.claimed + self.cloning + self.analyzing + self.gathering + self.running
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new pending job. Fails with `Duplicate` if an active job
    /// already occupies the dedupe key.
    async fn insert(&self, job: &Job) -> DbResult<()>;

    async fn get(&self, id: JobId) -> DbResult<Job>;

    async fn list_by_owner(&self, owner_id: ResourceId) -> DbResult<Vec<Job>>;

    /// Most recently updated jobs, newest first.
    async fn list_recent(&self, limit: i64) -> DbResult<Vec<Job>>;

    async fn find_active_by_dedupe_key(&self, key: &str) -> DbResult<Option<Job>>;

    async fn find_active_for_repo(&self, repo_id: ResourceId) -> DbResult<Option<Job>>;

    /// Atomically claim the oldest pending job with `run_at <= now`.
    /// Returns `None` on an empty queue or a lost race; neither is an
    /// error.
    async fn claim_next(
        &self,
        worker_id: &str,
        lease_until: DateTime<Utc>,
    ) -> DbResult<Option<Job>>;

    /// Extend the lease and optionally narrow the active sub-state and
    /// progress fields. Guarded on `locked_by = worker_id`.
    async fn extend_lease(
        &self,
        id: JobId,
        worker_id: &str,
        lease_until: DateTime<Utc>,
        stage: Option<JobStage>,
        progress: ProgressPatch,
    ) -> DbResult<()>;

    /// Terminal success. Guarded on `locked_by = worker_id`.
    async fn complete(
        &self,
        id: JobId,
        worker_id: &str,
        result: Option<serde_json::Value>,
        result_count: Option<i64>,
    ) -> DbResult<()>;

    /// Failed attempt with budget left: back to pending at `run_at`.
    /// Guarded on `locked_by = worker_id`.
    async fn requeue_attempt(
        &self,
        id: JobId,
        worker_id: &str,
        attempts: u32,
        run_at: DateTime<Utc>,
        last_error: &str,
    ) -> DbResult<()>;

    /// Retry ceiling exceeded: terminal dead. Guarded on
    /// `locked_by = worker_id`.
    async fn mark_dead(&self, id: JobId, worker_id: &str, attempts: u32, error: &str)
    -> DbResult<()>;

    /// Return every lease-expired, still-active job to pending, charging
    /// one attempt each. Jobs that terminated since their lease lapsed
    /// are left alone.
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> DbResult<Vec<Job>>;

    /// Terminal cancellation. Permitted only from pending/active states;
    /// sets `cancel_requested` so an in-flight worker can observe it.
    async fn cancel(&self, id: JobId, message: &str) -> DbResult<Job>;

    async fn count_by_status(&self) -> DbResult<StatusCounts>;
}

/// A job row as stored in PostgreSQL.
#[derive(Debug, Clone, sqlx::FromRow)]
struct JobRecord {
    id: uuid::Uuid,
    owner_id: uuid::Uuid,
    repo_id: uuid::Uuid,
    status: String,
    prompt: serde_json::Value,
    callback_token: String,
    run_at: DateTime<Utc>,
    attempts: i32,
    max_attempts: i32,
    locked_by: Option<String>,
    lease_until: Option<DateTime<Utc>>,
    dedupe_key: Option<String>,
    last_error: Option<String>,
    current_step: Option<i32>,
    total_steps: Option<i32>,
    progress: Option<String>,
    result: Option<serde_json::Value>,
    result_count: Option<i64>,
    error: Option<String>,
    cancel_requested: bool,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl JobRecord {
    fn into_job(self) -> DbResult<Job> {
        let status: JobStatus = self
            .status
            .parse()
            .map_err(|e: repolens_core::job::ParseStatusError| DbError::Decode(e.to_string()))?;
        Ok(Job {
            id: JobId::from_uuid(self.id),
            owner_id: ResourceId::from_uuid(self.owner_id),
            repo_id: ResourceId::from_uuid(self.repo_id),
            status,
            prompt: self.prompt,
            callback_token: self.callback_token,
            run_at: self.run_at,
            attempts: self.attempts.max(0) as u32,
            max_attempts: self.max_attempts.max(0) as u32,
            locked_by: self.locked_by,
            lease_until: self.lease_until,
            dedupe_key: self.dedupe_key,
            last_error: self.last_error,
            current_step: self.current_step.map(|v| v.max(0) as u32),
            total_steps: self.total_steps.map(|v| v.max(0) as u32),
            progress: self.progress,
            result: self.result,
            result_count: self.result_count,
            error: self.error,
            cancel_requested: self.cancel_requested,
            completed_at: self.completed_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn records_into_jobs(records: Vec<JobRecord>) -> DbResult<Vec<Job>> {
    records.into_iter().map(JobRecord::into_job).collect()
}

/// PostgreSQL implementation of `JobStore`.
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Turn a zero-row guarded update into the error it stands for.
    async fn guard_failure(&self, id: JobId, worker_id: &str) -> DbError {
        match self.get(id).await {
            Ok(_) => DbError::LeaseLost {
                job_id: id,
                worker_id: worker_id.to_string(),
            },
            Err(e) => e,
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: &Job) -> DbResult<()> {
        let res = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, owner_id, repo_id, status, prompt, callback_token,
                run_at, attempts, max_attempts, dedupe_key, cancel_requested,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.owner_id.as_uuid())
        .bind(job.repo_id.as_uuid())
        .bind(job.status.as_str())
        .bind(&job.prompt)
        .bind(&job.callback_token)
        .bind(job.run_at)
        .bind(job.attempts as i32)
        .bind(job.max_attempts as i32)
        .bind(&job.dedupe_key)
        .bind(job.cancel_requested)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await;

        match res {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(ref dbe)) if dbe.is_unique_violation() => {
                Err(DbError::Duplicate(
                    job.dedupe_key.clone().unwrap_or_else(|| job.id.to_string()),
                ))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: JobId) -> DbResult<Job> {
        let record = sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;
        record.into_job()
    }

    async fn list_by_owner(&self, owner_id: ResourceId) -> DbResult<Vec<Job>> {
        let records = sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM jobs WHERE owner_id = $1 ORDER BY created_at DESC",
        )
        .bind(owner_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        records_into_jobs(records)
    }

    async fn list_recent(&self, limit: i64) -> DbResult<Vec<Job>> {
        let records =
            sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs ORDER BY updated_at DESC LIMIT $1")
                .bind(limit)
                .fetch_all(&self.pool)
                .await?;
        records_into_jobs(records)
    }

    async fn find_active_by_dedupe_key(&self, key: &str) -> DbResult<Option<Job>> {
        let record = sqlx::query_as::<_, JobRecord>(&format!(
            "SELECT * FROM jobs WHERE dedupe_key = $1 AND status IN {PENDING_OR_ACTIVE_SQL} LIMIT 1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        record.map(JobRecord::into_job).transpose()
    }

    async fn find_active_for_repo(&self, repo_id: ResourceId) -> DbResult<Option<Job>> {
        let record = sqlx::query_as::<_, JobRecord>(&format!(
            "SELECT * FROM jobs WHERE repo_id = $1 AND status IN {PENDING_OR_ACTIVE_SQL} \
             ORDER BY created_at ASC LIMIT 1"
        ))
        .bind(repo_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        record.map(JobRecord::into_job).transpose()
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        lease_until: DateTime<Utc>,
    ) -> DbResult<Option<Job>> {
        // SKIP LOCKED keeps concurrent claimers from serializing on the
        // same candidate row; the loser sees the next row or none.
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE jobs
            SET status = 'claimed', locked_by = $1, lease_until = $2, updated_at = NOW()
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'pending' AND run_at <= NOW()
                ORDER BY created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(lease_until)
        .fetch_optional(&self.pool)
        .await?;
        record.map(JobRecord::into_job).transpose()
    }

    async fn extend_lease(
        &self,
        id: JobId,
        worker_id: &str,
        lease_until: DateTime<Utc>,
        stage: Option<JobStage>,
        progress: ProgressPatch,
    ) -> DbResult<()> {
        let done = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET lease_until = $3,
                status = COALESCE($4, status),
                current_step = COALESCE($5, current_step),
                total_steps = COALESCE($6, total_steps),
                progress = COALESCE($7, progress),
                updated_at = NOW()
            WHERE id = $1 AND locked_by = $2 AND status IN {ACTIVE_SQL}
            "#
        ))
        .bind(id.as_uuid())
        .bind(worker_id)
        .bind(lease_until)
        .bind(stage.map(|s| s.as_status().as_str()))
        .bind(progress.current_step.map(|v| v as i32))
        .bind(progress.total_steps.map(|v| v as i32))
        .bind(progress.progress)
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Err(self.guard_failure(id, worker_id).await);
        }
        Ok(())
    }

    async fn complete(
        &self,
        id: JobId,
        worker_id: &str,
        result: Option<serde_json::Value>,
        result_count: Option<i64>,
    ) -> DbResult<()> {
        let done = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = 'completed', result = $3, result_count = $4,
                completed_at = NOW(), locked_by = NULL, lease_until = NULL,
                updated_at = NOW()
            WHERE id = $1 AND locked_by = $2 AND status IN {ACTIVE_SQL}
            "#
        ))
        .bind(id.as_uuid())
        .bind(worker_id)
        .bind(result)
        .bind(result_count)
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Err(self.guard_failure(id, worker_id).await);
        }
        Ok(())
    }

    async fn requeue_attempt(
        &self,
        id: JobId,
        worker_id: &str,
        attempts: u32,
        run_at: DateTime<Utc>,
        last_error: &str,
    ) -> DbResult<()> {
        let done = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = 'pending', attempts = $3, run_at = $4, last_error = $5,
                locked_by = NULL, lease_until = NULL, updated_at = NOW()
            WHERE id = $1 AND locked_by = $2 AND status IN {ACTIVE_SQL}
            "#
        ))
        .bind(id.as_uuid())
        .bind(worker_id)
        .bind(attempts as i32)
        .bind(run_at)
        .bind(last_error)
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Err(self.guard_failure(id, worker_id).await);
        }
        Ok(())
    }

    async fn mark_dead(
        &self,
        id: JobId,
        worker_id: &str,
        attempts: u32,
        error: &str,
    ) -> DbResult<()> {
        let done = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = 'dead', attempts = $3, error = $4, last_error = $4,
                completed_at = NOW(), locked_by = NULL, lease_until = NULL,
                updated_at = NOW()
            WHERE id = $1 AND locked_by = $2 AND status IN {ACTIVE_SQL}
            "#
        ))
        .bind(id.as_uuid())
        .bind(worker_id)
        .bind(attempts as i32)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Err(self.guard_failure(id, worker_id).await);
        }
        Ok(())
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> DbResult<Vec<Job>> {
        let records = sqlx::query_as::<_, JobRecord>(&format!(
            r#"
            UPDATE jobs
            SET status = 'pending', attempts = attempts + 1, run_at = $1,
                last_error = 'lease expired', locked_by = NULL,
                lease_until = NULL, updated_at = NOW()
            WHERE lease_until IS NOT NULL AND lease_until <= $1
              AND status IN {ACTIVE_SQL}
            RETURNING *
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        records_into_jobs(records)
    }

    async fn cancel(&self, id: JobId, message: &str) -> DbResult<Job> {
        let record = sqlx::query_as::<_, JobRecord>(&format!(
            r#"
            UPDATE jobs
            SET status = 'canceled', error = $2, cancel_requested = TRUE,
                completed_at = NOW(), locked_by = NULL, lease_until = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status IN {PENDING_OR_ACTIVE_SQL}
            RETURNING *
            "#
        ))
        .bind(id.as_uuid())
        .bind(message)
        .fetch_optional(&self.pool)
        .await?;

        match record {
            Some(record) => record.into_job(),
            None => {
                // Either missing or already terminal; look to tell apart.
                let job = self.get(id).await?;
                Err(DbError::InvalidTransition(format!(
                    "job {} is already {}",
                    id, job.status
                )))
            }
        }
    }

    async fn count_by_status(&self) -> DbResult<StatusCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            let status: JobStatus = status
                .parse()
                .map_err(|e: repolens_core::job::ParseStatusError| DbError::Decode(e.to_string()))?;
            counts.add(status, n.max(0) as u64);
        }
        Ok(counts)
    }
}
