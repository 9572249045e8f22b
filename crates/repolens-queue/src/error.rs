//! Queue error taxonomy.

use repolens_core::JobId;
use repolens_db::DbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    /// The job id does not resolve (or is not visible to the caller).
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller's worker identity no longer matches `locked_by`. The
    /// lease was reassigned; the caller must abandon the work.
    #[error("job {job_id} is no longer leased by {worker_id}")]
    LeaseLost { job_id: JobId, worker_id: String },

    /// The requested transition is not legal from the job's current
    /// state, e.g. cancelling an already-terminal job.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("store error: {0}")]
    Store(DbError),
}

impl From<DbError> for QueueError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(what) => QueueError::NotFound(what),
            DbError::LeaseLost { job_id, worker_id } => {
                QueueError::LeaseLost { job_id, worker_id }
            }
            DbError::InvalidTransition(what) => QueueError::InvalidTransition(what),
            other => QueueError::Store(other),
        }
    }
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;
