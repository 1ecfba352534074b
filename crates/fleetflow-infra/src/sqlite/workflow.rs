//! SQLite workflow repository implementation.
//!
//! Definitions are stored as JSON documents next to the columns used for
//! lookup (name) and listing.

use fleetflow_core::repository::WorkflowRepository;
use fleetflow_types::error::RepositoryError;
use fleetflow_types::workflow::WorkflowRecord;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_uuid, query_err};

/// SQLite-backed implementation of `WorkflowRepository`.
#[derive(Clone)]
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

const COLUMNS: &str = "id, name, version, description, document, fingerprint, created_at, updated_at";

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<WorkflowRecord, RepositoryError> {
    let id: String = row.try_get("id").map_err(query_err)?;
    let document: String = row.try_get("document").map_err(query_err)?;
    let created_at: String = row.try_get("created_at").map_err(query_err)?;
    let updated_at: String = row.try_get("updated_at").map_err(query_err)?;
    Ok(WorkflowRecord {
        id: parse_uuid(&id)?,
        name: row.try_get("name").map_err(query_err)?,
        version: row.try_get("version").map_err(query_err)?,
        description: row.try_get("description").map_err(query_err)?,
        document: serde_json::from_str(&document)
            .map_err(|e| RepositoryError::Query(format!("invalid workflow document JSON: {e}")))?,
        fingerprint: row.try_get("fingerprint").map_err(query_err)?,
        created_at: parse_datetime(&created_at)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn save_workflow(&self, record: &WorkflowRecord) -> Result<(), RepositoryError> {
        let document = serde_json::to_string(&record.document)
            .map_err(|e| RepositoryError::Query(format!("serialize workflow: {e}")))?;

        sqlx::query(
            r#"INSERT INTO workflows (id, name, version, description, document, fingerprint, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 version = excluded.version,
                 description = excluded.description,
                 document = excluded.document,
                 fingerprint = excluded.fingerprint,
                 updated_at = excluded.updated_at"#,
        )
        .bind(record.id.to_string())
        .bind(&record.name)
        .bind(&record.version)
        .bind(&record.description)
        .bind(&document)
        .bind(&record.fingerprint)
        .bind(format_datetime(&record.created_at))
        .bind(format_datetime(&record.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn get_workflow(&self, id: &Uuid) -> Result<Option<WorkflowRecord>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM workflows WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn get_workflow_by_name(&self, name: &str) -> Result<Option<WorkflowRecord>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM workflows WHERE name = ? ORDER BY updated_at DESC LIMIT 1"
        ))
        .bind(name)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowRecord>, RepositoryError> {
        let rows = sqlx::query(&format!("SELECT {COLUMNS} FROM workflows ORDER BY name ASC"))
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;
        rows.iter().map(record_from_row).collect()
    }

    async fn delete_workflow(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleetflow_core::workflow::definition::parse_workflow_json;

    fn record(name: &str) -> WorkflowRecord {
        let document = parse_workflow_json(&format!(
            r#"{{
                "metadata": {{"name": "{name}", "version": "1.0.0"}},
                "nodes": {{
                    "start": {{"node_id": "start", "node_type": "Start"}},
                    "log": {{"node_id": "log", "node_type": "Log", "config": {{"message": "hi"}}}}
                }},
                "connections": [
                    {{"source_node": "start", "source_port": "exec_out", "target_node": "log", "target_port": "exec_in"}}
                ]
            }}"#
        ))
        .unwrap();
        let now = Utc::now();
        WorkflowRecord {
            id: Uuid::now_v7(),
            name: name.to_string(),
            version: "1.0.0".into(),
            description: None,
            document,
            fingerprint: "fp".into(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn save_get_list_delete() {
        let repo = SqliteWorkflowRepository::new(crate::sqlite::test_pool().await);
        let a = record("alpha");
        let b = record("beta");
        repo.save_workflow(&b).await.unwrap();
        repo.save_workflow(&a).await.unwrap();

        let loaded = repo.get_workflow(&a.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "alpha");
        assert_eq!(loaded.document.nodes.len(), 2);

        let by_name = repo.get_workflow_by_name("beta").await.unwrap().unwrap();
        assert_eq!(by_name.id, b.id);

        let names: Vec<String> = repo.list_workflows().await.unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["alpha", "beta"]);

        assert!(repo.delete_workflow(&a.id).await.unwrap());
        assert!(!repo.delete_workflow(&a.id).await.unwrap());
        assert!(repo.get_workflow(&a.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_replaces_document() {
        let repo = SqliteWorkflowRepository::new(crate::sqlite::test_pool().await);
        let mut rec = record("alpha");
        repo.save_workflow(&rec).await.unwrap();
        rec.version = "2.0.0".into();
        rec.fingerprint = "fp2".into();
        repo.save_workflow(&rec).await.unwrap();

        let loaded = repo.get_workflow(&rec.id).await.unwrap().unwrap();
        assert_eq!(loaded.version, "2.0.0");
        assert_eq!(loaded.fingerprint, "fp2");
        assert_eq!(repo.list_workflows().await.unwrap().len(), 1);
    }
}
