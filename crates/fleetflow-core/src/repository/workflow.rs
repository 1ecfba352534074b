//! Workflow definition repository trait.
//!
//! Stores workflow documents registered with the dispatcher so jobs can
//! reference them by id or name.

use fleetflow_types::error::RepositoryError;
use fleetflow_types::workflow::WorkflowRecord;
use uuid::Uuid;

/// Repository trait for registered workflow definitions.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    /// Upsert a definition (insert or replace by ID).
    fn save_workflow(
        &self,
        record: &WorkflowRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_workflow(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRecord>, RepositoryError>> + Send;

    /// Most recently updated definition with this name.
    fn get_workflow_by_name(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRecord>, RepositoryError>> + Send;

    fn list_workflows(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRecord>, RepositoryError>> + Send;

    /// Delete a definition by ID. Returns `true` if it existed.
    fn delete_workflow(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
