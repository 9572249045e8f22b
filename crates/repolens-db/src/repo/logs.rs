//! Log store: the append-only per-job diagnostic trail.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use repolens_core::{JobId, LogEntry, LogLevel};

use crate::{DbError, DbResult};

/// How many times an append retries after losing a `(job_id, seq)` race.
const APPEND_RETRIES: u32 = 8;

#[async_trait]
pub trait LogStore: Send + Sync {
    /// Append one entry, assigning the next sequence number for the job.
    async fn append(&self, job_id: JobId, level: LogLevel, msg: &str) -> DbResult<LogEntry>;

    /// Entries with `seq` greater than the watermark (all entries when
    /// `None`), ascending, for incremental polling.
    async fn list(&self, job_id: JobId, after_seq: Option<i64>) -> DbResult<Vec<LogEntry>>;
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct LogRecord {
    job_id: uuid::Uuid,
    seq: i64,
    level: String,
    msg: String,
    created_at: DateTime<Utc>,
}

impl LogRecord {
    fn into_entry(self) -> DbResult<LogEntry> {
        let level: LogLevel = self
            .level
            .parse()
            .map_err(|e: repolens_core::log::ParseLevelError| DbError::Decode(e.to_string()))?;
        Ok(LogEntry {
            job_id: JobId::from_uuid(self.job_id),
            seq: self.seq,
            level,
            msg: self.msg,
            created_at: self.created_at,
        })
    }
}

/// PostgreSQL implementation of `LogStore`.
///
/// The sequence number comes from `MAX(seq) + 1` under a unique
/// `(job_id, seq)` index; a concurrent append that computes the same
/// number loses the unique check and retries with a fresh read, so
/// ordering never depends on the wall clock.
pub struct PgLogStore {
    pool: PgPool,
}

impl PgLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LogStore for PgLogStore {
    async fn append(&self, job_id: JobId, level: LogLevel, msg: &str) -> DbResult<LogEntry> {
        let mut attempt = 0;
        loop {
            let res = sqlx::query_as::<_, LogRecord>(
                r#"
                INSERT INTO job_logs (job_id, seq, level, msg, created_at)
                VALUES (
                    $1,
                    (SELECT COALESCE(MAX(seq), 0) + 1 FROM job_logs WHERE job_id = $1),
                    $2, $3, NOW()
                )
                RETURNING job_id, seq, level, msg, created_at
                "#,
            )
            .bind(job_id.as_uuid())
            .bind(level.as_str())
            .bind(msg)
            .fetch_one(&self.pool)
            .await;

            match res {
                Ok(record) => return record.into_entry(),
                Err(sqlx::Error::Database(ref dbe))
                    if dbe.is_unique_violation() && attempt < APPEND_RETRIES =>
                {
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn list(&self, job_id: JobId, after_seq: Option<i64>) -> DbResult<Vec<LogEntry>> {
        let records = sqlx::query_as::<_, LogRecord>(
            r#"
            SELECT job_id, seq, level, msg, created_at
            FROM job_logs
            WHERE job_id = $1 AND seq > $2
            ORDER BY seq ASC
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(after_seq.unwrap_or(0))
        .fetch_all(&self.pool)
        .await?;

        records.into_iter().map(LogRecord::into_entry).collect()
    }
}
