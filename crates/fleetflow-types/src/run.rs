//! Run-state types: node/run status, control frames, snapshots and checkpoints.
//!
//! These are the serializable pieces of an in-flight run. The orchestrator in
//! `fleetflow-core` mutates them; checkpoints persist them verbatim so a run can
//! be reconstructed exactly on another machine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Per-node lifecycle within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeStatus::Success | NodeStatus::Failed | NodeStatus::Skipped
        )
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Success => "success",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// Terminal (or in-progress) status of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    Cancelled,
    TimedOut,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::TimedOut => "timed_out",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

/// A node error as recorded in the run and bound into `Catch` variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub node_id: String,
    /// Error class, e.g. `NodeExecutionError`, `TimeoutError`.
    pub error_type: String,
    pub message: String,
    #[serde(default)]
    pub stack_trace: String,
    /// Attempts made before the error was raised (1 = no retries).
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Extra data attached by error hooks (screenshots, response bodies...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

fn default_attempts() -> u32 {
    1
}

impl std::fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at node '{}': {}", self.error_type, self.node_id, self.message)
    }
}

// ---------------------------------------------------------------------------
// Control stack
// ---------------------------------------------------------------------------

/// One active region on a run's control stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlFrame {
    ForLoop {
        start: String,
        items: LoopItems,
        /// Index of the iteration currently executing.
        index: u64,
        item_var: String,
        index_var: String,
    },
    WhileLoop {
        start: String,
        /// Iterations whose body has been entered.
        iteration: u64,
        max_iterations: u64,
    },
    Try {
        try_node: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        catch_node: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finally_node: Option<String>,
        phase: TryPhase,
    },
}

impl ControlFrame {
    /// Loop start node for loop frames.
    pub fn loop_start(&self) -> Option<&str> {
        match self {
            ControlFrame::ForLoop { start, .. } | ControlFrame::WhileLoop { start, .. } => {
                Some(start)
            }
            ControlFrame::Try { .. } => None,
        }
    }
}

/// Collection walked by a for-loop, materialized on first entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopItems {
    List { values: Vec<serde_json::Value> },
    Range { start: i64, end: i64, step: i64 },
}

impl LoopItems {
    /// Number of iterations this collection yields.
    ///
    /// Computed in `i128` so ranges spanning the whole `i64` domain
    /// saturate instead of overflowing; the loop ceiling rejects them.
    pub fn len(&self) -> u64 {
        match self {
            LoopItems::List { values } => values.len() as u64,
            LoopItems::Range { start, end, step } => {
                let (start, end, step) = (*start as i128, *end as i128, *step as i128);
                if step == 0 {
                    return 0;
                }
                let span = if step > 0 { end - start } else { start - end };
                if span <= 0 {
                    return 0;
                }
                let step = step.abs();
                u64::try_from((span + step - 1) / step).unwrap_or(u64::MAX)
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Item at `index`, if the collection has one.
    pub fn get(&self, index: u64) -> Option<serde_json::Value> {
        if index >= self.len() {
            return None;
        }
        match self {
            LoopItems::List { values } => values.get(index as usize).cloned(),
            LoopItems::Range { start, step, .. } => {
                let value = *start as i128 + *step as i128 * index as i128;
                i64::try_from(value).ok().map(serde_json::Value::from)
            }
        }
    }
}

/// Where execution is inside a try region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum TryPhase {
    Body,
    Catch {
        error: NodeFailure,
    },
    Finally {
        had_error: bool,
        /// Error re-raised to the outer frame once `finally_body` ends.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pending: Option<NodeFailure>,
        /// Loop jump that left the region, replayed once `finally_body` ends.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        jump: Option<LoopJump>,
    },
}

/// A `Continue`/`ForLoopEnd` or `Break` aimed at an enclosing loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "jump", rename_all = "snake_case")]
pub enum LoopJump {
    Continue { loop_start: String },
    Break { loop_start: String },
}

// ---------------------------------------------------------------------------
// Snapshots & checkpoints
// ---------------------------------------------------------------------------

/// Everything needed to reconstruct a run's execution context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub variables: serde_json::Map<String, serde_json::Value>,
    pub node_status: BTreeMap<String, NodeStatus>,
    /// Materialized data-port values: node id -> port -> value.
    #[serde(default)]
    pub outputs: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    pub control_stack: Vec<ControlFrame>,
    /// Nodes the walk continues at when resuming.
    #[serde(default)]
    pub next: Vec<String>,
    /// Uncaught errors recorded so far (only when `stop_on_error` is off).
    #[serde(default)]
    pub errors: Vec<NodeFailure>,
}

/// Durable "last completed node + context" record for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub run_id: Uuid,
    /// The node that had just completed.
    pub node_id: String,
    /// Monotonic per run; the highest sequence wins.
    pub sequence: u64,
    pub workflow_fingerprint: String,
    pub snapshot: RunSnapshot,
    pub created_at: DateTime<Utc>,
}
