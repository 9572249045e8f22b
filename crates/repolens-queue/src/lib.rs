//! Queue handlers for repolens.
//!
//! The durable job queue: submission with deduplication, atomic
//! lease-based claiming, heartbeat-driven lease extension,
//! exponential-backoff retry, dead-lettering, crash recovery via
//! lease-expiry reclamation, cooperative cancellation, and the per-job
//! diagnostic log.
//!
//! The store's per-statement atomicity is the only concurrency
//! primitive; every handler is one short guarded transaction.

pub mod config;
pub mod error;
pub mod queue;
pub mod reclaimer;
pub mod worker;

pub use config::QueueConfig;
pub use error::{QueueError, QueueResult};
pub use queue::{
    ClaimedJob, EnqueueReceipt, EnqueueRequest, HeartbeatUpdate, JobQueue, QueueMetrics,
    RetryOutcome,
};
pub use reclaimer::{LeaseReclaimer, ReclaimerHandle};
pub use worker::{JobHandler, Worker, WorkerContext};
