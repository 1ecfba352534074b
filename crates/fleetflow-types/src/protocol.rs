//! Agent protocol frames exchanged over the persistent dispatcher connection.
//!
//! Frames are JSON text messages tagged by `type`. The agent side sends
//! [`AgentMessage`]; the dispatcher side sends [`DispatcherMessage`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::robot::RobotRegistration;
use crate::run::{Checkpoint, NodeFailure, NodeStatus};
use crate::workflow::WorkflowDocument;

/// Agent -> dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    Register(RobotRegistration),
    Heartbeat {
        robot_id: String,
        timestamp: DateTime<Utc>,
        #[serde(default)]
        running_jobs: Vec<Uuid>,
    },
    /// The agent took the assignment and started the run.
    Accepted { job_id: Uuid },
    /// The agent refused the assignment (no free slot, bad payload).
    Rejected { job_id: Uuid, reason: String },
    Progress {
        job_id: Uuid,
        node_id: String,
        status: NodeStatus,
    },
    /// Must be acknowledged with `checkpoint_ack` before the run proceeds.
    Checkpoint {
        job_id: Uuid,
        checkpoint: Box<Checkpoint>,
    },
    Completed {
        job_id: Uuid,
        result: serde_json::Value,
    },
    Failed { job_id: Uuid, error: JobFailure },
}

/// Dispatcher -> agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatcherMessage {
    Registered {
        robot_id: String,
        heartbeat_interval_secs: u64,
    },
    Assign { job: Box<JobAssignment> },
    Cancel { job_id: Uuid },
    CheckpointAck { job_id: Uuid, sequence: u64 },
    /// The dispatcher no longer knows this robot; the agent must register again.
    Reregister { reason: String },
    Error { message: String },
}

/// Everything a robot needs to run (or resume) a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAssignment {
    pub job_id: Uuid,
    pub workflow: WorkflowDocument,
    #[serde(default)]
    pub variables: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Present when the job resumes after losing its previous robot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<Checkpoint>,
}

/// Terminal failure reported by an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFailure {
    pub error_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeFailure>,
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.node {
            Some(node) => write!(f, "{}: {} ({})", self.error_type, self.message, node.node_id),
            None => write!(f, "{}: {}", self.error_type, self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_frame_shape() {
        let raw = serde_json::json!({
            "type": "register",
            "capabilities": ["browser"],
            "environment": "prod",
            "max_concurrent_jobs": 2
        });
        match serde_json::from_value::<AgentMessage>(raw).unwrap() {
            AgentMessage::Register(reg) => {
                assert!(reg.robot_id.is_none());
                assert!(reg.capabilities.contains("browser"));
                assert_eq!(reg.max_concurrent_jobs, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn cancel_frame_shape() {
        let id = Uuid::now_v7();
        let v = serde_json::to_value(DispatcherMessage::Cancel { job_id: id }).unwrap();
        assert_eq!(v["type"], "cancel");
        assert_eq!(v["job_id"], id.to_string());
    }
}
