//! Store layer for the repolens job queue.
//!
//! Provides the `JobStore` and `LogStore` traits, their PostgreSQL
//! implementations, and in-memory implementations for tests and local
//! development. Every mutation is a single guarded statement scoped to
//! one job row; the store's per-statement atomicity is the only
//! concurrency primitive the queue relies on.

pub mod error;
pub mod repo;

pub use error::{DbError, DbResult};
pub use repo::*;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
