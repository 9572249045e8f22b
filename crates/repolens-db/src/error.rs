//! Store error types.

use repolens_core::JobId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    /// A guarded update found the job leased by someone else (or not
    /// leased at all). The caller's lease is gone and it must stop.
    #[error("job {job_id} is no longer leased by {worker_id}")]
    LeaseLost { job_id: JobId, worker_id: String },

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// An insert collided with an existing active row (dedupe index).
    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type DbResult<T> = std::result::Result<T, DbError>;
