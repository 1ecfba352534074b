//! SQLite storage layer.
//!
//! Repository implementations backed by SQLite with WAL mode and split
//! read/write connection pools.

pub mod checkpoint;
pub mod job;
pub mod pool;
pub mod workflow;

use chrono::{DateTime, SecondsFormat, Utc};
use fleetflow_types::error::RepositoryError;
use uuid::Uuid;

pub use checkpoint::SqliteCheckpointRepository;
pub use job::SqliteJobRepository;
pub use pool::DatabasePool;
pub use workflow::SqliteWorkflowRepository;

// ---------------------------------------------------------------------------
// Helpers shared by the repositories
// ---------------------------------------------------------------------------

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width RFC 3339 so timestamps sort lexicographically in SQL.
pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn query_err(e: impl std::fmt::Display) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

#[cfg(test)]
pub(crate) async fn test_pool() -> DatabasePool {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("test.db");
    let url = format!("sqlite://{}?mode=rwc", db_path.display());
    std::mem::forget(dir);
    DatabasePool::connect(&url, &fleetflow_types::config::StorageConfig::default())
        .await
        .unwrap()
}
