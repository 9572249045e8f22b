//! Store traits and implementations.

pub mod jobs;
pub mod logs;
pub mod memory;

pub use jobs::{JobStore, PgJobStore, ProgressPatch, StatusCounts};
pub use logs::{LogStore, PgLogStore};
pub use memory::{InMemoryJobStore, InMemoryLogStore};
