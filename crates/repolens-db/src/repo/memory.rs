//! In-memory store implementations for tests and local development.
//!
//! Every trait method takes the mutex once and performs its whole
//! read-modify-write inside the critical section, mirroring the
//! per-statement atomicity the PostgreSQL store gets from the database.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use repolens_core::{Job, JobId, JobStage, JobStatus, LogEntry, LogLevel, ResourceId};

use crate::repo::jobs::{JobStore, ProgressPatch, StatusCounts};
use crate::repo::logs::LogStore;
use crate::{DbError, DbResult};

/// Mutex-guarded map of job rows.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn occupies_dedupe_key(job: &Job, key: &str) -> bool {
        job.dedupe_key.as_deref() == Some(key)
            && (job.status == JobStatus::Pending || job.status.is_active())
    }

    /// Ownership-guard shared by the worker-side transitions.
    fn check_owned(job: Option<&Job>, id: JobId, worker_id: &str) -> DbResult<()> {
        let job = job.ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;
        if job.status.is_active() && job.locked_by.as_deref() == Some(worker_id) {
            Ok(())
        } else {
            Err(DbError::LeaseLost {
                job_id: id,
                worker_id: worker_id.to_string(),
            })
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &Job) -> DbResult<()> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(key) = job.dedupe_key.as_deref() {
            if jobs.values().any(|j| Self::occupies_dedupe_key(j, key)) {
                return Err(DbError::Duplicate(key.to_string()));
            }
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> DbResult<Job> {
        let jobs = self.jobs.lock().unwrap();
        jobs.get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))
    }

    async fn list_by_owner(&self, owner_id: ResourceId) -> DbResult<Vec<Job>> {
        let jobs = self.jobs.lock().unwrap();
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.owner_id == owner_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(result)
    }

    async fn list_recent(&self, limit: i64) -> DbResult<Vec<Job>> {
        let jobs = self.jobs.lock().unwrap();
        let mut result: Vec<_> = jobs.values().cloned().collect();
        result.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        result.truncate(limit.max(0) as usize);
        Ok(result)
    }

    async fn find_active_by_dedupe_key(&self, key: &str) -> DbResult<Option<Job>> {
        let jobs = self.jobs.lock().unwrap();
        Ok(jobs
            .values()
            .find(|j| Self::occupies_dedupe_key(j, key))
            .cloned())
    }

    async fn find_active_for_repo(&self, repo_id: ResourceId) -> DbResult<Option<Job>> {
        let jobs = self.jobs.lock().unwrap();
        let mut candidates: Vec<_> = jobs
            .values()
            .filter(|j| {
                j.repo_id == repo_id && (j.status == JobStatus::Pending || j.status.is_active())
            })
            .collect();
        candidates.sort_by_key(|j| (j.created_at, j.id));
        Ok(candidates.first().map(|j| (*j).clone()))
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        lease_until: DateTime<Utc>,
    ) -> DbResult<Option<Job>> {
        let mut jobs = self.jobs.lock().unwrap();
        let now = Utc::now();

        let candidate = jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending && j.run_at <= now)
            .min_by_key(|j| (j.created_at, j.id))
            .map(|j| j.id);

        let Some(id) = candidate else {
            return Ok(None);
        };

        let job = jobs.get_mut(&id).unwrap();
        job.status = JobStatus::Claimed;
        job.locked_by = Some(worker_id.to_string());
        job.lease_until = Some(lease_until);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn extend_lease(
        &self,
        id: JobId,
        worker_id: &str,
        lease_until: DateTime<Utc>,
        stage: Option<JobStage>,
        progress: ProgressPatch,
    ) -> DbResult<()> {
        let mut jobs = self.jobs.lock().unwrap();
        Self::check_owned(jobs.get(&id), id, worker_id)?;

        let job = jobs.get_mut(&id).unwrap();
        job.lease_until = Some(lease_until);
        if let Some(stage) = stage {
            job.status = stage.as_status();
        }
        if let Some(step) = progress.current_step {
            job.current_step = Some(step);
        }
        if let Some(total) = progress.total_steps {
            job.total_steps = Some(total);
        }
        if let Some(text) = progress.progress {
            job.progress = Some(text);
        }
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn complete(
        &self,
        id: JobId,
        worker_id: &str,
        result: Option<serde_json::Value>,
        result_count: Option<i64>,
    ) -> DbResult<()> {
        let mut jobs = self.jobs.lock().unwrap();
        Self::check_owned(jobs.get(&id), id, worker_id)?;

        let now = Utc::now();
        let job = jobs.get_mut(&id).unwrap();
        job.status = JobStatus::Completed;
        job.result = result;
        job.result_count = result_count;
        job.completed_at = Some(now);
        job.locked_by = None;
        job.lease_until = None;
        job.updated_at = now;
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
        let mut jobs = self.jobs.lock().unwrap();
        Self::check_owned(jobs.get(&id), id, worker_id)?;

        let job = jobs.get_mut(&id).unwrap();
        job.status = JobStatus::Pending;
        job.attempts = attempts;
        job.run_at = run_at;
        job.last_error = Some(last_error.to_string());
        job.locked_by = None;
        job.lease_until = None;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_dead(
        &self,
        id: JobId,
        worker_id: &str,
        attempts: u32,
        error: &str,
    ) -> DbResult<()> {
        let mut jobs = self.jobs.lock().unwrap();
        Self::check_owned(jobs.get(&id), id, worker_id)?;

        let now = Utc::now();
        let job = jobs.get_mut(&id).unwrap();
        job.status = JobStatus::Dead;
        job.attempts = attempts;
        job.error = Some(error.to_string());
        job.last_error = Some(error.to_string());
        job.completed_at = Some(now);
        job.locked_by = None;
        job.lease_until = None;
        job.updated_at = now;
        Ok(())
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> DbResult<Vec<Job>> {
        let mut jobs = self.jobs.lock().unwrap();
        let expired: Vec<JobId> = jobs
            .values()
            .filter(|j| {
                j.status.is_active() && j.lease_until.is_some_and(|lease| lease <= now)
            })
            .map(|j| j.id)
            .collect();

        let mut reclaimed = Vec::with_capacity(expired.len());
        for id in expired {
            let job = jobs.get_mut(&id).unwrap();
            job.status = JobStatus::Pending;
            job.attempts += 1;
            job.run_at = now;
            job.last_error = Some("lease expired".to_string());
            job.locked_by = None;
            job.lease_until = None;
            job.updated_at = now;
            reclaimed.push(job.clone());
        }
        Ok(reclaimed)
    }

    async fn cancel(&self, id: JobId, message: &str) -> DbResult<Job> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;

        if !(job.status == JobStatus::Pending || job.status.is_active()) {
            return Err(DbError::InvalidTransition(format!(
                "job {} is already {}",
                id, job.status
            )));
        }

        let now = Utc::now();
        job.status = JobStatus::Canceled;
        job.error = Some(message.to_string());
        job.cancel_requested = true;
        job.completed_at = Some(now);
        job.locked_by = None;
        job.lease_until = None;
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn count_by_status(&self) -> DbResult<StatusCounts> {
        let jobs = self.jobs.lock().unwrap();
        let mut counts = StatusCounts::default();
        for job in jobs.values() {
            counts.add(job.status, 1);
        }
        Ok(counts)
    }
}

/// Mutex-guarded per-job log trail with a dedicated sequence counter.
#[derive(Debug, Default)]
pub struct InMemoryLogStore {
    inner: Mutex<LogInner>,
}

#[derive(Debug, Default)]
struct LogInner {
    entries: HashMap<JobId, Vec<LogEntry>>,
    next_seq: HashMap<JobId, i64>,
}

impl InMemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogStore for InMemoryLogStore {
    async fn append(&self, job_id: JobId, level: LogLevel, msg: &str) -> DbResult<LogEntry> {
        let mut inner = self.inner.lock().unwrap();
        let seq = {
            let counter = inner.next_seq.entry(job_id).or_insert(1);
            let seq = *counter;
            *counter += 1;
            seq
        };
        let entry = LogEntry {
            job_id,
            seq,
            level,
            msg: msg.to_string(),
            created_at: Utc::now(),
        };
        inner.entries.entry(job_id).or_default().push(entry.clone());
        Ok(entry)
    }

    async fn list(&self, job_id: JobId, after_seq: Option<i64>) -> DbResult<Vec<LogEntry>> {
        let inner = self.inner.lock().unwrap();
        let watermark = after_seq.unwrap_or(0);
        let mut entries: Vec<_> = inner
            .entries
            .get(&job_id)
            .map(|v| v.iter().filter(|e| e.seq > watermark).cloned().collect())
            .unwrap_or_default();
        entries.sort_by_key(|e| e.seq);
        Ok(entries)
    }
}
