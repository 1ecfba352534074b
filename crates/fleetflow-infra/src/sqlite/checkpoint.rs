//! SQLite checkpoint repository implementation.
//!
//! A save inserts the new row and deletes the run's older rows in one
//! transaction on the writer connection, so a reader sees either the old or
//! the new checkpoint and never none.

use fleetflow_core::repository::CheckpointRepository;
use fleetflow_types::error::RepositoryError;
use fleetflow_types::run::Checkpoint;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_uuid, query_err};

/// SQLite-backed implementation of `CheckpointRepository`.
#[derive(Clone)]
pub struct SqliteCheckpointRepository {
    pool: DatabasePool,
}

impl SqliteCheckpointRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

fn checkpoint_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Checkpoint, RepositoryError> {
    let id: String = row.try_get("id").map_err(query_err)?;
    let run_id: String = row.try_get("run_id").map_err(query_err)?;
    let sequence: i64 = row.try_get("sequence").map_err(query_err)?;
    let snapshot: String = row.try_get("snapshot").map_err(query_err)?;
    let created_at: String = row.try_get("created_at").map_err(query_err)?;
    Ok(Checkpoint {
        id: parse_uuid(&id)?,
        run_id: parse_uuid(&run_id)?,
        node_id: row.try_get("node_id").map_err(query_err)?,
        sequence: u64::try_from(sequence)
            .map_err(|_| RepositoryError::Query(format!("invalid checkpoint sequence {sequence}")))?,
        workflow_fingerprint: row.try_get("fingerprint").map_err(query_err)?,
        snapshot: serde_json::from_str(&snapshot)
            .map_err(|e| RepositoryError::Query(format!("invalid snapshot JSON: {e}")))?,
        created_at: parse_datetime(&created_at)?,
    })
}

impl CheckpointRepository for SqliteCheckpointRepository {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        let snapshot = serde_json::to_string(&checkpoint.snapshot)
            .map_err(|e| RepositoryError::Query(format!("serialize snapshot: {e}")))?;
        let sequence = i64::try_from(checkpoint.sequence)
            .map_err(|_| RepositoryError::Query("checkpoint sequence overflow".to_string()))?;

        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;
        sqlx::query(
            r#"INSERT INTO checkpoints (id, run_id, node_id, sequence, fingerprint, snapshot, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(checkpoint.id.to_string())
        .bind(checkpoint.run_id.to_string())
        .bind(&checkpoint.node_id)
        .bind(sequence)
        .bind(&checkpoint.workflow_fingerprint)
        .bind(&snapshot)
        .bind(format_datetime(&checkpoint.created_at))
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        sqlx::query("DELETE FROM checkpoints WHERE run_id = ? AND id != ?")
            .bind(checkpoint.run_id.to_string())
            .bind(checkpoint.id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;
        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn latest_checkpoint(&self, run_id: &Uuid) -> Result<Option<Checkpoint>, RepositoryError> {
        let row = sqlx::query(
            r#"SELECT id, run_id, node_id, sequence, fingerprint, snapshot, created_at
               FROM checkpoints WHERE run_id = ? ORDER BY sequence DESC LIMIT 1"#,
        )
        .bind(run_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;
        row.as_ref().map(checkpoint_from_row).transpose()
    }

    async fn delete_checkpoints(&self, run_id: &Uuid) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM checkpoints WHERE run_id = ?")
            .bind(run_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;
        Ok(result.rows_affected())
    }
}
