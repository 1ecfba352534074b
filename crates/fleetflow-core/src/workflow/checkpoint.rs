//! Durable checkpoint manager for run state.
//!
//! Wraps a `CheckpointRepository`: the orchestrator records "last completed
//! node + context snapshot" after each node, and recovery rebuilds the
//! context from the latest record, refusing checkpoints whose workflow has
//! changed since they were taken.

use chrono::Utc;
use fleetflow_types::run::{Checkpoint, ControlFrame, RunSnapshot};
use uuid::Uuid;

use super::graph::WorkflowGraph;
use crate::repository::checkpoint::CheckpointRepository;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("no checkpoint for run {0}")]
    NotFound(Uuid),

    /// The workflow changed incompatibly since the checkpoint was taken.
    #[error("stale checkpoint for run {run_id}: {reason}")]
    Stale { run_id: Uuid, reason: String },

    #[error("checkpoint repository error: {0}")]
    Repository(String),
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Generic over `R: CheckpointRepository` so it works with SQLite, the
/// in-memory store, or an agent forwarding checkpoints to its dispatcher.
pub struct CheckpointManager<R: CheckpointRepository> {
    repo: R,
}

impl<R: CheckpointRepository> CheckpointManager<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    pub fn repo(&self) -> &R {
        &self.repo
    }

    /// Persist a checkpoint. Returns once the write is durable.
    pub async fn checkpoint(
        &self,
        run_id: Uuid,
        node_id: &str,
        sequence: u64,
        fingerprint: &str,
        snapshot: RunSnapshot,
    ) -> Result<Checkpoint, CheckpointError> {
        let checkpoint = Checkpoint {
            id: Uuid::now_v7(),
            run_id,
            node_id: node_id.to_string(),
            sequence,
            workflow_fingerprint: fingerprint.to_string(),
            snapshot,
            created_at: Utc::now(),
        };
        self.repo
            .save_checkpoint(&checkpoint)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            run_id = %run_id,
            node_id,
            sequence,
            "checkpoint written"
        );
        Ok(checkpoint)
    }

    /// Latest checkpoint of `run_id`, verified against `graph`.
    pub async fn resume(
        &self,
        run_id: Uuid,
        graph: &WorkflowGraph,
    ) -> Result<Checkpoint, CheckpointError> {
        let checkpoint = self
            .repo
            .latest_checkpoint(&run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
            .ok_or(CheckpointError::NotFound(run_id))?;
        verify(&checkpoint, graph)?;
        tracing::info!(
            run_id = %run_id,
            node_id = %checkpoint.node_id,
            sequence = checkpoint.sequence,
            "resuming from checkpoint"
        );
        Ok(checkpoint)
    }

    /// Drop every checkpoint of a finished run.
    pub async fn complete(&self, run_id: Uuid) -> Result<u64, CheckpointError> {
        let deleted = self
            .repo
            .delete_checkpoints(&run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        tracing::debug!(run_id = %run_id, deleted, "checkpoints cleared");
        Ok(deleted)
    }
}

/// Check that every node a checkpoint refers to still exists in `graph` and
/// that the graph structure is unchanged.
pub fn verify(checkpoint: &Checkpoint, graph: &WorkflowGraph) -> Result<(), CheckpointError> {
    let stale = |reason: String| CheckpointError::Stale {
        run_id: checkpoint.run_id,
        reason,
    };
    if checkpoint.workflow_fingerprint != graph.fingerprint() {
        return Err(stale(format!(
            "workflow '{}' changed since the checkpoint was taken",
            graph.name()
        )));
    }

    let snapshot = &checkpoint.snapshot;
    let frame_nodes = snapshot.control_stack.iter().flat_map(|frame| match frame {
        ControlFrame::ForLoop { start, .. } | ControlFrame::WhileLoop { start, .. } => {
            vec![start.as_str()]
        }
        ControlFrame::Try {
            try_node,
            catch_node,
            finally_node,
            ..
        } => std::iter::once(try_node.as_str())
            .chain(catch_node.as_deref())
            .chain(finally_node.as_deref())
            .collect(),
    });
    let missing = std::iter::once(checkpoint.node_id.as_str())
        .chain(snapshot.next.iter().map(String::as_str))
        .chain(frame_nodes)
        .find(|id| !graph.contains(id));
    if let Some(id) = missing {
        return Err(stale(format!("node '{id}' no longer exists")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionRegistry;
    use crate::repository::memory::InMemoryCheckpointRepository;
    use crate::workflow::graph::tests::DocBuilder;
    use serde_json::json;

    fn graph(extra: bool) -> WorkflowGraph {
        let mut b = DocBuilder::new("cp")
            .node("start", "Start", json!({}))
            .node("a", "Log", json!({}))
            .edge("start", "exec_out", "a");
        if extra {
            b = b.node("b", "Log", json!({})).edge("a", "exec_out", "b");
        }
        WorkflowGraph::load(b.build(), &ActionRegistry::with_builtins()).unwrap()
    }

    #[tokio::test]
    async fn latest_wins_and_complete_clears() {
        let mgr = CheckpointManager::new(InMemoryCheckpointRepository::default());
        let g = graph(false);
        let run_id = Uuid::now_v7();
        mgr.checkpoint(run_id, "start", 1, g.fingerprint(), RunSnapshot::default())
            .await
            .unwrap();
        let snap = RunSnapshot {
            next: vec!["a".into()],
            ..RunSnapshot::default()
        };
        mgr.checkpoint(run_id, "a", 2, g.fingerprint(), snap).await.unwrap();

        let latest = mgr.resume(run_id, &g).await.unwrap();
        assert_eq!(latest.node_id, "a");
        assert_eq!(latest.sequence, 2);

        assert!(mgr.complete(run_id).await.unwrap() >= 1);
        assert!(matches!(
            mgr.resume(run_id, &g).await,
            Err(CheckpointError::NotFound(id)) if id == run_id
        ));
    }

    #[tokio::test]
    async fn changed_graph_is_stale() {
        let mgr = CheckpointManager::new(InMemoryCheckpointRepository::default());
        let old = graph(false);
        let run_id = Uuid::now_v7();
        mgr.checkpoint(run_id, "a", 1, old.fingerprint(), RunSnapshot::default())
            .await
            .unwrap();
        let err = mgr.resume(run_id, &graph(true)).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Stale { .. }));
    }

    #[test]
    fn missing_node_is_stale() {
        let g = graph(false);
        let checkpoint = Checkpoint {
            id: Uuid::now_v7(),
            run_id: Uuid::now_v7(),
            node_id: "a".into(),
            sequence: 1,
            workflow_fingerprint: g.fingerprint().to_string(),
            snapshot: RunSnapshot {
                next: vec!["gone".into()],
                ..RunSnapshot::default()
            },
            created_at: Utc::now(),
        };
        let err = verify(&checkpoint, &g).unwrap_err();
        assert!(err.to_string().contains("gone"));
    }
}
