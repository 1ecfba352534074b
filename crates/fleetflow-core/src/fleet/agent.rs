//! Worker agent: the robot side of the dispatch protocol.
//!
//! An agent registers with the dispatcher, heartbeats, and executes assigned
//! jobs locally with its own `Orchestrator`. Checkpoints are streamed to the
//! dispatcher and each one is acknowledged before the run continues, so a
//! job whose robot dies can resume elsewhere from the last acked node.
//!
//! The agent is transport-agnostic: `run_session` speaks to the dispatcher
//! through a pair of channels, which the WebSocket client (or a test) wires
//! to a real connection.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use fleetflow_types::config::{AgentConfig, OrchestratorConfig};
use fleetflow_types::error::RepositoryError;
use fleetflow_types::event::EventPayload;
use fleetflow_types::protocol::{AgentMessage, DispatcherMessage, JobAssignment, JobFailure};
use fleetflow_types::robot::RobotRegistration;
use fleetflow_types::run::{Checkpoint, NodeStatus, RunStatus};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::action::{ActionRegistry, CANCELLED_ERROR, TIMEOUT_ERROR};
use crate::event::{EventBus, Subscription};
use crate::repository::CheckpointRepository;
use crate::workflow::{ExecutionError, Orchestrator, RunOutcome, WorkflowGraph};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("dispatcher connection closed")]
    Disconnected,
}

type Outbound = mpsc::Sender<AgentMessage>;
type PendingAcks = Arc<DashMap<Uuid, oneshot::Sender<u64>>>;

// ---------------------------------------------------------------------------
// RemoteCheckpointStore
// ---------------------------------------------------------------------------

/// Checkpoint store that ships every checkpoint to the dispatcher and waits
/// for its acknowledgement. Reads always miss: a resumed job receives its
/// checkpoint inside the assignment.
#[derive(Clone)]
pub struct RemoteCheckpointStore {
    outbound: Outbound,
    acks: PendingAcks,
    ack_timeout: Duration,
}

impl CheckpointRepository for RemoteCheckpointStore {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        let job_id = checkpoint.run_id;
        let (tx, rx) = oneshot::channel();
        self.acks.insert(job_id, tx);

        let frame = AgentMessage::Checkpoint {
            job_id,
            checkpoint: Box::new(checkpoint.clone()),
        };
        if self.outbound.send(frame).await.is_err() {
            self.acks.remove(&job_id);
            return Err(RepositoryError::Unavailable);
        }
        match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(sequence)) if sequence == checkpoint.sequence => Ok(()),
            Ok(Ok(sequence)) => Err(RepositoryError::Conflict(format!(
                "checkpoint ack for sequence {sequence}, expected {}",
                checkpoint.sequence
            ))),
            Ok(Err(_)) => Err(RepositoryError::Unavailable),
            Err(_) => {
                self.acks.remove(&job_id);
                Err(RepositoryError::Timeout(format!(
                    "checkpoint {} not acknowledged within {}s",
                    checkpoint.sequence,
                    self.ack_timeout.as_secs()
                )))
            }
        }
    }

    async fn latest_checkpoint(&self, _run_id: &Uuid) -> Result<Option<Checkpoint>, RepositoryError> {
        Ok(None)
    }

    async fn delete_checkpoints(&self, _run_id: &Uuid) -> Result<u64, RepositoryError> {
        Ok(0)
    }
}

// ---------------------------------------------------------------------------
// WorkerAgent
// ---------------------------------------------------------------------------

pub struct WorkerAgent {
    config: AgentConfig,
    registry: Arc<ActionRegistry>,
    orchestrator: OrchestratorConfig,
    slots: Arc<Semaphore>,
    /// Cancellation tokens of jobs executing here, keyed by job id.
    runs: Arc<DashMap<Uuid, CancellationToken>>,
    acks: PendingAcks,
    /// Id assigned by the dispatcher; reused on reconnect.
    robot_id: Mutex<Option<String>>,
}

impl WorkerAgent {
    pub fn new(config: AgentConfig, registry: Arc<ActionRegistry>, orchestrator: OrchestratorConfig) -> Self {
        let slots = config.max_concurrent_jobs.max(1) as usize;
        let robot_id = config.robot_id.clone();
        Self {
            config,
            registry,
            orchestrator,
            slots: Arc::new(Semaphore::new(slots)),
            runs: Arc::new(DashMap::new()),
            acks: Arc::new(DashMap::new()),
            robot_id: Mutex::new(robot_id),
        }
    }

    pub fn robot_id(&self) -> Option<String> {
        match self.robot_id.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_robot_id(&self, id: String) {
        match self.robot_id.lock() {
            Ok(mut guard) => *guard = Some(id),
            Err(poisoned) => *poisoned.into_inner() = Some(id),
        }
    }

    /// Jobs currently executing on this agent.
    pub fn running_jobs(&self) -> Vec<Uuid> {
        self.runs.iter().map(|e| *e.key()).collect()
    }

    pub fn registration(&self) -> RobotRegistration {
        RobotRegistration {
            robot_id: self.robot_id(),
            name: self.config.name.clone(),
            capabilities: self.config.capabilities.iter().cloned().collect(),
            environment: self.config.environment.clone(),
            tags: self.config.tags.iter().cloned().collect(),
            max_concurrent_jobs: self.config.max_concurrent_jobs.max(1),
        }
    }

    /// Speak the agent protocol over one dispatcher connection.
    ///
    /// Returns `Ok` when `cancel` fires and `Disconnected` when the
    /// dispatcher side closes. Either way every job still running here is
    /// cancelled: the dispatcher recovers them from their checkpoints.
    pub async fn run_session(
        self: &Arc<Self>,
        mut inbound: mpsc::Receiver<DispatcherMessage>,
        outbound: Outbound,
        cancel: CancellationToken,
    ) -> Result<(), AgentError> {
        let session = cancel.child_token();
        let result = self.session_loop(&mut inbound, &outbound, &session).await;
        session.cancel();
        let abandoned = self.running_jobs();
        if !abandoned.is_empty() {
            tracing::warn!(jobs = abandoned.len(), "session ended, cancelling local runs");
        }
        result
    }

    async fn session_loop(
        self: &Arc<Self>,
        inbound: &mut mpsc::Receiver<DispatcherMessage>,
        outbound: &Outbound,
        session: &CancellationToken,
    ) -> Result<(), AgentError> {
        send(outbound, AgentMessage::Register(self.registration())).await?;
        let mut heartbeat: Option<CancellationToken> = None;

        loop {
            let message = tokio::select! {
                _ = session.cancelled() => return Ok(()),
                message = inbound.recv() => message.ok_or(AgentError::Disconnected)?,
            };
            match message {
                DispatcherMessage::Registered {
                    robot_id,
                    heartbeat_interval_secs,
                } => {
                    tracing::info!(robot_id = %robot_id, "registered with dispatcher");
                    self.set_robot_id(robot_id.clone());
                    if let Some(previous) = heartbeat.take() {
                        previous.cancel();
                    }
                    let token = session.child_token();
                    self.spawn_heartbeat(robot_id, heartbeat_interval_secs, outbound.clone(), token.clone());
                    heartbeat = Some(token);
                }
                DispatcherMessage::Assign { job } => {
                    self.start_job(*job, outbound, session).await?;
                }
                DispatcherMessage::Cancel { job_id } => match self.runs.get(&job_id) {
                    Some(token) => {
                        tracing::info!(job_id = %job_id, "cancel requested by dispatcher");
                        token.cancel();
                    }
                    None => tracing::debug!(job_id = %job_id, "cancel for unknown job"),
                },
                DispatcherMessage::CheckpointAck { job_id, sequence } => {
                    if let Some((_, waiter)) = self.acks.remove(&job_id) {
                        let _ = waiter.send(sequence);
                    }
                }
                DispatcherMessage::Reregister { reason } => {
                    tracing::warn!(reason = %reason, "dispatcher asked to re-register");
                    send(outbound, AgentMessage::Register(self.registration())).await?;
                }
                DispatcherMessage::Error { message } => {
                    tracing::warn!(message = %message, "dispatcher reported an error");
                }
            }
        }
    }

    fn spawn_heartbeat(&self, robot_id: String, interval_secs: u64, outbound: Outbound, token: CancellationToken) {
        let runs = Arc::clone(&self.runs);
        let period = Duration::from_secs(interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let frame = AgentMessage::Heartbeat {
                            robot_id: robot_id.clone(),
                            timestamp: Utc::now(),
                            running_jobs: runs.iter().map(|e| *e.key()).collect(),
                        };
                        if outbound.send(frame).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Accept or reject an assignment. `Accepted` goes out before the run
    /// starts so the dispatcher sees it ahead of any checkpoint frame.
    async fn start_job(
        self: &Arc<Self>,
        assignment: JobAssignment,
        outbound: &Outbound,
        session: &CancellationToken,
    ) -> Result<(), AgentError> {
        let job_id = assignment.job_id;
        let rejection = if self.runs.contains_key(&job_id) {
            Err("job is already running here".to_string())
        } else {
            match Arc::clone(&self.slots).try_acquire_owned() {
                Err(_) => Err("no free job slot".to_string()),
                Ok(permit) => WorkflowGraph::load(assignment.workflow.clone(), &self.registry)
                    .map(|graph| (Arc::new(graph), permit))
                    .map_err(|e| e.to_string()),
            }
        };
        let (graph, permit) = match rejection {
            Ok(ready) => ready,
            Err(reason) => {
                tracing::warn!(job_id = %job_id, reason = %reason, "assignment rejected");
                return send(outbound, AgentMessage::Rejected { job_id, reason }).await;
            }
        };

        let token = session.child_token();
        self.runs.insert(job_id, token.clone());
        if let Err(e) = send(outbound, AgentMessage::Accepted { job_id }).await {
            self.runs.remove(&job_id);
            return Err(e);
        }
        tracing::info!(job_id = %job_id, "assignment accepted");

        let this = Arc::clone(self);
        let outbound = outbound.clone();
        tokio::spawn(async move {
            let report = this.execute_job(assignment, graph, outbound.clone(), token, permit).await;
            this.runs.remove(&job_id);
            if outbound.send(report).await.is_err() {
                tracing::warn!(job_id = %job_id, "dispatcher gone, job result dropped");
            }
        });
        Ok(())
    }

    async fn execute_job(
        &self,
        assignment: JobAssignment,
        graph: Arc<WorkflowGraph>,
        outbound: Outbound,
        token: CancellationToken,
        _permit: OwnedSemaphorePermit,
    ) -> AgentMessage {
        let job_id = assignment.job_id;
        let events = EventBus::new(256);
        let progress = tokio::spawn(forward_progress(job_id, events.subscribe_to(None), outbound.clone()));
        let store = RemoteCheckpointStore {
            outbound,
            acks: Arc::clone(&self.acks),
            ack_timeout: Duration::from_secs(self.config.checkpoint_ack_timeout_secs),
        };
        let orchestrator = Orchestrator::new(store, events, self.orchestrator.clone());

        let timed_out = CancellationToken::new();
        if let Some(secs) = assignment.timeout_secs {
            let (token, timed_out) = (token.clone(), timed_out.clone());
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                        timed_out.cancel();
                        token.cancel();
                    }
                }
            });
        }

        let result = match assignment.checkpoint {
            Some(checkpoint) => {
                tracing::info!(job_id = %job_id, sequence = checkpoint.sequence, "resuming job from checkpoint");
                orchestrator.resume_from(graph, checkpoint, token.clone()).await
            }
            None => {
                tracing::info!(job_id = %job_id, "starting job");
                orchestrator.execute(graph, job_id, assignment.variables, token.clone()).await
            }
        };
        // Stops the timeout watcher; the run is over either way.
        token.cancel();
        drop(orchestrator);
        // The forwarder ends once the run's event bus is dropped.
        if tokio::time::timeout(Duration::from_secs(1), progress).await.is_err() {
            tracing::debug!(job_id = %job_id, "progress forwarder did not drain");
        }

        report(job_id, result, timed_out.is_cancelled(), assignment.timeout_secs)
    }
}

async fn send(outbound: &Outbound, message: AgentMessage) -> Result<(), AgentError> {
    outbound.send(message).await.map_err(|_| AgentError::Disconnected)
}

/// Relay node lifecycle events of one run as `Progress` frames.
async fn forward_progress(job_id: Uuid, mut events: Subscription, outbound: Outbound) {
    while let Some(event) = events.recv().await {
        let (node_id, status) = match event.payload {
            EventPayload::NodeStarted { node_id, .. } => (node_id, NodeStatus::Running),
            EventPayload::NodeCompleted { node_id, .. } => (node_id, NodeStatus::Success),
            EventPayload::NodeError {
                node_id,
                will_retry: false,
                ..
            } => (node_id, NodeStatus::Failed),
            EventPayload::NodeSkipped { node_id, .. } => (node_id, NodeStatus::Skipped),
            _ => continue,
        };
        let frame = AgentMessage::Progress {
            job_id,
            node_id,
            status,
        };
        if outbound.send(frame).await.is_err() {
            break;
        }
    }
}

/// Final frame for a finished run.
fn report(
    job_id: Uuid,
    result: Result<RunOutcome, ExecutionError>,
    timed_out: bool,
    timeout_secs: Option<u64>,
) -> AgentMessage {
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            let error_type = match &e {
                ExecutionError::StaleCheckpoint(_) => "StaleCheckpoint",
                ExecutionError::Validation(_) => "ValidationError",
                _ => "ExecutionError",
            };
            tracing::error!(job_id = %job_id, error = %e, "job could not run");
            return AgentMessage::Failed {
                job_id,
                error: JobFailure {
                    error_type: error_type.to_string(),
                    message: e.to_string(),
                    node: None,
                },
            };
        }
    };

    tracing::info!(
        job_id = %job_id,
        status = %outcome.status,
        duration_ms = outcome.duration_ms,
        "job finished"
    );
    let failure = |error_type: &str, message: String| AgentMessage::Failed {
        job_id,
        error: JobFailure {
            error_type: error_type.to_string(),
            message,
            node: outcome.error().cloned(),
        },
    };
    match outcome.status {
        RunStatus::Success => AgentMessage::Completed {
            job_id,
            result: outcome.to_result_json(),
        },
        RunStatus::Cancelled if timed_out => failure(
            TIMEOUT_ERROR,
            format!("job exceeded its {}s timeout", timeout_secs.unwrap_or_default()),
        ),
        RunStatus::Cancelled => failure(CANCELLED_ERROR, "run cancelled".to_string()),
        RunStatus::TimedOut => failure(TIMEOUT_ERROR, "workflow timeout elapsed".to_string()),
        RunStatus::Failed | RunStatus::Running => {
            let (error_type, message) = outcome
                .error()
                .map(|e| (e.error_type.clone(), e.message.clone()))
                .unwrap_or_else(|| ("NodeExecutionError".to_string(), "run failed".to_string()));
            failure(&error_type, message)
        }
    }
}
