//! Workflow engine: graph model, execution context and orchestrator.

pub mod checkpoint;
pub mod context;
pub mod definition;
pub mod expression;
pub mod graph;
pub mod node;
pub mod orchestrator;

pub use checkpoint::{CheckpointError, CheckpointManager};
pub use context::ExecutionContext;
pub use definition::WorkflowError;
pub use graph::WorkflowGraph;
pub use orchestrator::{ExecutionError, Orchestrator, RunOutcome};
