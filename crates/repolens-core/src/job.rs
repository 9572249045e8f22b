//! The job record and its status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{JobId, ResourceId};

/// Status of a queued job.
///
/// `Pending` and the active states (`Claimed` plus the four descriptive
/// sub-states a worker reports through heartbeats) are non-terminal.
/// Terminal states are final: no handler transitions out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Eligible for claiming once `run_at` has passed.
    Pending,
    /// Assigned to a worker, lease running.
    Claimed,
    /// Worker is cloning the target repository.
    Cloning,
    /// Worker is analyzing the codebase.
    Analyzing,
    /// Worker is gathering supporting material.
    Gathering,
    /// Worker is producing output.
    Running,
    /// Terminal: finished successfully.
    Completed,
    /// Terminal: worker-reported failure surfaced to the submitter.
    Failed,
    /// Terminal: cancellation, owner-initiated or cooperative.
    Canceled,
    /// Terminal: retry ceiling exceeded.
    Dead,
}

impl JobStatus {
    /// Claimed or one of the heartbeat sub-states. Lease fields are
    /// present exactly while a job is in one of these.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobStatus::Claimed
                | JobStatus::Cloning
                | JobStatus::Analyzing
                | JobStatus::Gathering
                | JobStatus::Running
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled | JobStatus::Dead
        )
    }

    /// Stable string form used in the status column and indexes.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Claimed => "claimed",
            JobStatus::Cloning => "cloning",
            JobStatus::Analyzing => "analyzing",
            JobStatus::Gathering => "gathering",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
            JobStatus::Dead => "dead",
        }
    }

    /// All states counted as active, in stable order. Used to build the
    /// `status IN (...)` guards in the Postgres store.
    pub fn active_states() -> &'static [JobStatus] {
        &[
            JobStatus::Claimed,
            JobStatus::Cloning,
            JobStatus::Analyzing,
            JobStatus::Gathering,
            JobStatus::Running,
        ]
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing a status string from the store.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown job status: {0}")]
pub struct ParseStatusError(pub String);

impl std::str::FromStr for JobStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "claimed" => Ok(JobStatus::Claimed),
            "cloning" => Ok(JobStatus::Cloning),
            "analyzing" => Ok(JobStatus::Analyzing),
            "gathering" => Ok(JobStatus::Gathering),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "canceled" => Ok(JobStatus::Canceled),
            "dead" => Ok(JobStatus::Dead),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// Descriptive sub-state a worker may report while it holds a lease.
///
/// These narrow `Claimed` for display purposes only; control decisions
/// never depend on which active state a job is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Cloning,
    Analyzing,
    Gathering,
    Running,
}

impl JobStage {
    pub fn as_status(&self) -> JobStatus {
        match self {
            JobStage::Cloning => JobStatus::Cloning,
            JobStage::Analyzing => JobStatus::Analyzing,
            JobStage::Gathering => JobStatus::Gathering,
            JobStage::Running => JobStatus::Running,
        }
    }
}

/// A unit of schedulable work: one analysis run against one repository.
///
/// Rows are never deleted; terminal jobs are retained for history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Submitting user.
    pub owner_id: ResourceId,
    /// Target repository.
    pub repo_id: ResourceId,
    pub status: JobStatus,
    /// Opaque task payload handed to the worker at claim time.
    pub prompt: serde_json::Value,
    /// Capability token authorizing status updates from the worker side
    /// of the external boundary.
    pub callback_token: String,
    /// Earliest eligible execution time.
    pub run_at: DateTime<Utc>,
    /// Attempts consumed so far. Incremented by retry and reclaim, never
    /// by claim or heartbeat.
    pub attempts: u32,
    pub max_attempts: u32,
    /// Worker currently holding the lease. Present iff `status.is_active()`.
    pub locked_by: Option<String>,
    /// Lease expiry. Present iff `status.is_active()`.
    pub lease_until: Option<DateTime<Utc>>,
    /// Optional idempotency key; at most one active job per key.
    pub dedupe_key: Option<String>,
    /// Most recent failure message, retained across retries.
    pub last_error: Option<String>,
    // Progress fields are advisory only.
    pub current_step: Option<u32>,
    pub total_steps: Option<u32>,
    pub progress: Option<String>,
    /// Opaque success payload.
    pub result: Option<serde_json::Value>,
    /// Count metric reported at completion.
    pub result_count: Option<i64>,
    /// Terminal failure message.
    pub error: Option<String>,
    /// Cooperative-cancellation flag the worker is expected to poll.
    pub cancel_requested: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a fresh pending job, eligible immediately.
    pub fn new(
        owner_id: ResourceId,
        repo_id: ResourceId,
        prompt: serde_json::Value,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            owner_id,
            repo_id,
            status: JobStatus::Pending,
            prompt,
            callback_token: uuid::Uuid::new_v4().simple().to_string(),
            run_at: now,
            attempts: 0,
            max_attempts,
            locked_by: None,
            lease_until: None,
            dedupe_key: None,
            last_error: None,
            current_step: None,
            total_steps: None,
            progress: None,
            result: None,
            result_count: None,
            error: None,
            cancel_requested: false,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    /// Whether the lease-field pairing invariant holds: `locked_by` and
    /// `lease_until` both present exactly while the job is active.
    pub fn lease_fields_consistent(&self) -> bool {
        match (&self.locked_by, &self.lease_until) {
            (Some(_), Some(_)) => self.status.is_active(),
            (None, None) => !self.status.is_active(),
            _ => false,
        }
    }
}
