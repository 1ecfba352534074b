//! SQLite connection pools for the job table and checkpoint log.
//!
//! Every job transition is a compare-and-swap `UPDATE`, and each checkpoint
//! save supersedes the previous row in a transaction. Both rely on writes being
//! serialized, so `DatabasePool` funnels them through one writer connection.
//! Reads (queue listings, checkpoint lookups, the REST API) use a separate
//! read-only pool and do not block on it under WAL.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use fleetflow_types::config::StorageConfig;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

/// File name of the database inside the data directory.
pub const DATABASE_FILE: &str = "fleetflow.db";

/// Split reader/writer pools over one SQLite file.
#[derive(Clone)]
pub struct DatabasePool {
    /// Read-only connections for listings and lookups, sized by `max_readers`.
    pub reader: SqlitePool,
    /// Single connection through which every job transition and checkpoint
    /// write is serialized.
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open `{data_dir}/fleetflow.db`, creating it and applying migrations.
    pub async fn open(data_dir: &Path, storage: &StorageConfig) -> Result<Self, sqlx::Error> {
        Self::connect(&database_url(data_dir), storage).await
    }

    /// Open the pools at an explicit `sqlite://` URL.
    pub async fn connect(url: &str, storage: &StorageConfig) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(storage.busy_timeout_secs))
            .create_if_missing(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await?;

        // Readers open read-only, so the schema must exist first.
        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(storage.max_readers.max(1))
            .connect_with(options.read_only(true))
            .await?;

        tracing::debug!(url, readers = storage.max_readers, "database pool ready");
        Ok(Self { reader, writer })
    }

    /// Round-trip a trivial query through the reader pool.
    pub async fn ping(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.reader).await.map(|_| ())
    }
}

/// `sqlite://{data_dir}/fleetflow.db`
pub fn database_url(data_dir: &Path) -> String {
    format!("sqlite://{}", data_dir.join(DATABASE_FILE).display())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_creates_the_schema_in_the_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::open(dir.path(), &StorageConfig::default())
            .await
            .unwrap();
        assert!(dir.path().join(DATABASE_FILE).exists());

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' AND name != '_sqlx_migrations' ORDER BY name",
        )
        .fetch_all(&pool.reader)
        .await
        .unwrap();
        let names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        assert_eq!(names, vec!["checkpoints", "jobs", "workflows"]);
        pool.ping().await.unwrap();
    }

    #[tokio::test]
    async fn writer_runs_in_wal_mode_with_foreign_keys() {
        let pool = crate::sqlite::test_pool().await;
        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool.writer)
            .await
            .unwrap();
        let (fk,): (i64,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(&pool.writer)
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        assert_eq!(fk, 1);
    }

    #[tokio::test]
    async fn readers_reject_writes() {
        let pool = crate::sqlite::test_pool().await;
        let result = sqlx::query("DELETE FROM jobs").execute(&pool.reader).await;
        assert!(result.is_err());
    }

    #[test]
    fn database_url_points_into_data_dir() {
        let url = database_url(Path::new("/var/lib/fleetflow"));
        assert_eq!(url, "sqlite:///var/lib/fleetflow/fleetflow.db");
    }
}
