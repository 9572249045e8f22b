//! Core domain types for the repolens job queue.
//!
//! This crate contains:
//! - Job and log identifiers
//! - The `Job` record and its status state machine
//! - Retry/backoff policy
//! - Diagnostic log entry types
//!
//! Everything here is pure data and policy; persistence lives in
//! `repolens-db` and the queue handlers in `repolens-queue`.

pub mod id;
pub mod job;
pub mod log;
pub mod retry;

pub use id::{JobId, ResourceId};
pub use job::{Job, JobStage, JobStatus};
pub use log::{LogEntry, LogLevel};
pub use retry::RetryPolicy;
