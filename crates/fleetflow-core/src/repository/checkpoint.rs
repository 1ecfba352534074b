//! Checkpoint repository trait.
//!
//! Append-then-supersede: `save_checkpoint` stores the new record and drops
//! every older record for the same run in one atomic step, so readers always
//! see exactly one latest checkpoint per run.

use fleetflow_types::error::RepositoryError;
use fleetflow_types::run::Checkpoint;
use uuid::Uuid;

/// Repository trait for run checkpoints.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait CheckpointRepository: Send + Sync {
    /// Durably store `checkpoint`, superseding older ones for its run.
    /// Must not return before the write is durable.
    fn save_checkpoint(
        &self,
        checkpoint: &Checkpoint,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn latest_checkpoint(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Checkpoint>, RepositoryError>> + Send;

    /// Remove all checkpoints of a run. Returns how many were deleted.
    fn delete_checkpoints(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}
