//! SQLite job repository implementation.
//!
//! The whole `Job` is stored as JSON in `body`; status, priority, robot and
//! timestamps are mirrored into columns so filtering and the
//! compare-and-swap in `transition_job` happen in SQL.

use chrono::{DateTime, Utc};
use fleetflow_core::repository::JobRepository;
use fleetflow_types::error::RepositoryError;
use fleetflow_types::job::{Job, JobStatus};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, query_err};

/// SQLite-backed implementation of `JobRepository`.
#[derive(Clone)]
pub struct SqliteJobRepository {
    pool: DatabasePool,
}

impl SqliteJobRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

const UNFINISHED: [JobStatus; 3] = [JobStatus::Queued, JobStatus::Assigned, JobStatus::Running];
const TERMINAL: [JobStatus; 4] = [
    JobStatus::Succeeded,
    JobStatus::Failed,
    JobStatus::Cancelled,
    JobStatus::TimedOut,
];

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn job_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Job, RepositoryError> {
    let body: String = row.try_get("body").map_err(query_err)?;
    serde_json::from_str(&body).map_err(|e| RepositoryError::Query(format!("invalid job JSON: {e}")))
}

fn encode(job: &Job) -> Result<String, RepositoryError> {
    serde_json::to_string(job).map_err(|e| RepositoryError::Query(format!("serialize job: {e}")))
}

impl JobRepository for SqliteJobRepository {
    async fn insert_job(&self, job: &Job) -> Result<(), RepositoryError> {
        let body = encode(job)?;
        let result = sqlx::query(
            r#"INSERT INTO jobs
               (id, workflow_id, workflow_name, status, priority, assigned_robot_id,
                submitted_at, completed_at, body)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO NOTHING"#,
        )
        .bind(job.id.to_string())
        .bind(job.workflow_id.to_string())
        .bind(&job.workflow_name)
        .bind(job.status.as_str())
        .bind(job.priority.as_str())
        .bind(&job.assigned_robot_id)
        .bind(format_datetime(&job.submitted_at))
        .bind(job.completed_at.as_ref().map(format_datetime))
        .bind(&body)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(format!("job {} already exists", job.id)));
        }
        Ok(())
    }

    async fn get_job(&self, id: &Uuid) -> Result<Option<Job>, RepositoryError> {
        let row = sqlx::query("SELECT body FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs(&self, status: Option<JobStatus>, limit: u32) -> Result<Vec<Job>, RepositoryError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT body FROM jobs WHERE status = ? ORDER BY submitted_at DESC, id DESC LIMIT ?",
                )
                .bind(status.as_str())
                .bind(i64::from(limit))
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query("SELECT body FROM jobs ORDER BY submitted_at DESC, id DESC LIMIT ?")
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(query_err)?;
        rows.iter().map(job_from_row).collect()
    }

    async fn list_unfinished_jobs(&self) -> Result<Vec<Job>, RepositoryError> {
        let sql = format!(
            "SELECT body FROM jobs WHERE status IN ({}) ORDER BY submitted_at ASC, id ASC",
            placeholders(UNFINISHED.len())
        );
        let mut query = sqlx::query(&sql);
        for status in UNFINISHED {
            query = query.bind(status.as_str());
        }
        let rows = query.fetch_all(&self.pool.reader).await.map_err(query_err)?;
        rows.iter().map(job_from_row).collect()
    }

    async fn transition_job(&self, job: &Job, expected: &[JobStatus]) -> Result<bool, RepositoryError> {
        if expected.is_empty() {
            return Ok(false);
        }
        let body = encode(job)?;
        let sql = format!(
            "UPDATE jobs SET status = ?, priority = ?, assigned_robot_id = ?, completed_at = ?, body = ?
             WHERE id = ? AND status IN ({})",
            placeholders(expected.len())
        );
        let mut query = sqlx::query(&sql)
            .bind(job.status.as_str())
            .bind(job.priority.as_str())
            .bind(&job.assigned_robot_id)
            .bind(job.completed_at.as_ref().map(format_datetime))
            .bind(&body)
            .bind(job.id.to_string());
        for status in expected {
            query = query.bind(status.as_str());
        }
        let result = query.execute(&self.pool.writer).await.map_err(query_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn purge_finished_jobs(&self, before: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let sql = format!(
            "DELETE FROM jobs WHERE status IN ({}) AND completed_at IS NOT NULL AND completed_at < ?",
            placeholders(TERMINAL.len())
        );
        let mut query = sqlx::query(&sql);
        for status in TERMINAL {
            query = query.bind(status.as_str());
        }
        let result = query
            .bind(format_datetime(&before))
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;
        Ok(result.rows_affected())
    }
}
