//! Job repository trait.
//!
//! Jobs are the durable side of the queue: the in-memory ordering index in
//! `fleet::queue` is rebuilt from here on startup, and every status change is
//! written through `transition_job` before the dispatcher acts on it.

use chrono::{DateTime, Utc};
use fleetflow_types::error::RepositoryError;
use fleetflow_types::job::{Job, JobStatus};
use uuid::Uuid;

/// Repository trait for job persistence.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait JobRepository: Send + Sync {
    /// Insert a newly submitted job.
    fn insert_job(
        &self,
        job: &Job,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_job(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Job>, RepositoryError>> + Send;

    /// Newest first, optionally filtered by status.
    fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Job>, RepositoryError>> + Send;

    /// Jobs in `Queued`, `Assigned` or `Running`, oldest first.
    fn list_unfinished_jobs(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Job>, RepositoryError>> + Send;

    /// Compare-and-swap write: persists `job` only if the stored status is one
    /// of `expected`. Returns `false` when another writer got there first.
    fn transition_job(
        &self,
        job: &Job,
        expected: &[JobStatus],
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Delete terminal jobs completed before `before`. Returns the count.
    fn purge_finished_jobs(
        &self,
        before: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}
