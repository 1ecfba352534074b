//! Event types for the Fleetflow event bus.
//!
//! `EngineEvent` is the unified event broadcast by the orchestrator (node and
//! run lifecycle) and the dispatcher (job and robot lifecycle). Dashboards
//! receive them verbatim over the `/ws/events` stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::{JobPriority, JobStatus};
use crate::run::RunStatus;

/// Envelope: timestamp plus a discriminated payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl EngineEvent {
    pub fn now(payload: EventPayload) -> Self {
        Self {
            timestamp: Utc::now(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    // -- run lifecycle ------------------------------------------------------
    RunStarted {
        run_id: Uuid,
        workflow_name: String,
        resumed: bool,
    },
    RunFinished {
        run_id: Uuid,
        status: RunStatus,
        duration_ms: u64,
    },

    // -- node lifecycle -----------------------------------------------------
    NodeStarted {
        run_id: Uuid,
        node_id: String,
        node_type: String,
    },
    NodeCompleted {
        run_id: Uuid,
        node_id: String,
        duration_ms: u64,
    },
    NodeError {
        run_id: Uuid,
        node_id: String,
        error_type: String,
        message: String,
        attempt: u32,
        will_retry: bool,
    },
    NodeSkipped {
        run_id: Uuid,
        node_id: String,
    },

    // -- job lifecycle ------------------------------------------------------
    JobQueued {
        job_id: Uuid,
        priority: JobPriority,
    },
    JobAssigned {
        job_id: Uuid,
        robot_id: String,
    },
    JobRunning {
        job_id: Uuid,
        robot_id: String,
    },
    JobSucceeded {
        job_id: Uuid,
    },
    JobFailed {
        job_id: Uuid,
        error: String,
    },
    JobCancelled {
        job_id: Uuid,
    },
    JobTimedOut {
        job_id: Uuid,
    },
    /// Job went back to `Queued` (ack timeout, rejection, robot loss).
    JobRequeued {
        job_id: Uuid,
        reason: String,
    },
    /// Progress relayed from a robot for a running job.
    JobProgress {
        job_id: Uuid,
        node_id: String,
        status: crate::run::NodeStatus,
    },

    // -- robot lifecycle ----------------------------------------------------
    RobotOnline {
        robot_id: String,
    },
    RobotOffline {
        robot_id: String,
        reason: String,
    },
}

impl EventPayload {
    /// Run id for run/node events, job id for job events.
    pub fn subject_id(&self) -> Option<Uuid> {
        match self {
            EventPayload::RunStarted { run_id, .. }
            | EventPayload::RunFinished { run_id, .. }
            | EventPayload::NodeStarted { run_id, .. }
            | EventPayload::NodeCompleted { run_id, .. }
            | EventPayload::NodeError { run_id, .. }
            | EventPayload::NodeSkipped { run_id, .. } => Some(*run_id),
            EventPayload::JobQueued { job_id, .. }
            | EventPayload::JobAssigned { job_id, .. }
            | EventPayload::JobRunning { job_id, .. }
            | EventPayload::JobSucceeded { job_id }
            | EventPayload::JobFailed { job_id, .. }
            | EventPayload::JobCancelled { job_id }
            | EventPayload::JobTimedOut { job_id }
            | EventPayload::JobRequeued { job_id, .. }
            | EventPayload::JobProgress { job_id, .. } => Some(*job_id),
            EventPayload::RobotOnline { .. } | EventPayload::RobotOffline { .. } => None,
        }
    }

    /// Job event for a terminal job status, if any.
    pub fn for_terminal_job(job_id: Uuid, status: JobStatus, error: Option<&str>) -> Option<Self> {
        match status {
            JobStatus::Succeeded => Some(EventPayload::JobSucceeded { job_id }),
            JobStatus::Failed => Some(EventPayload::JobFailed {
                job_id,
                error: error.unwrap_or("unknown error").to_string(),
            }),
            JobStatus::Cancelled => Some(EventPayload::JobCancelled { job_id }),
            JobStatus::TimedOut => Some(EventPayload::JobTimedOut { job_id }),
            _ => None,
        }
    }
}
