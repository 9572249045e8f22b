//! Per-job diagnostic log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::JobId;

/// Severity of a diagnostic entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing a level string from the store.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown log level: {0}")]
pub struct ParseLevelError(pub String);

impl std::str::FromStr for LogLevel {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(LogLevel::Info),
            "error" => Ok(LogLevel::Error),
            other => Err(ParseLevelError(other.to_string())),
        }
    }
}

/// One immutable entry in a job's diagnostic trail.
///
/// `seq` is strictly increasing per job and assigned by the store at
/// append time from a dedicated counter, never from wall-clock time, so
/// reads ordered by `seq` are stable under clock skew and sub-millisecond
/// append rates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub job_id: JobId,
    pub seq: i64,
    pub level: LogLevel,
    pub msg: String,
    pub created_at: DateTime<Utc>,
}
