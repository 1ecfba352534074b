//! Fleet dispatcher: matches queued jobs to connected robots.
//!
//! The dispatcher is the single logical owner of the robot table and of every
//! job transition that is not made by the owning agent. All job writes go
//! through `JobRepository::transition_job` (compare-and-swap on status), so
//! concurrent submitters, agents and the health monitor can never
//! double-assign a job or lose an update.
//!
//! Selection per free slot, first match wins:
//! 1. `target_robot_id`, when set, must match exactly;
//! 2. robot capabilities are a superset of the job's requirements;
//! 3. robot environment equals the job's environment;
//! 4. tie-break on most free slots, then least recently assigned.
//!
//! Assignments are pushed over the robot's link and marked `Assigned`
//! optimistically. A watchdog rolls the job back to `Queued` if the robot
//! does not acknowledge within the ack window; robots that keep failing to
//! acknowledge are skipped by a per-robot circuit breaker.

use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fleetflow_types::config::{DispatcherConfig, FleetConfig};
use fleetflow_types::event::EventPayload;
use fleetflow_types::job::{Job, JobStatus, JobSubmission};
use fleetflow_types::protocol::{AgentMessage, DispatcherMessage, JobAssignment};
use fleetflow_types::robot::{Robot, RobotRegistration, RobotStatus};
use fleetflow_types::run::Checkpoint;
use fleetflow_types::workflow::{WorkflowDocument, WorkflowRecord};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::queue::{JobQueue, QueueError};
use crate::action::circuit::CircuitBreaker;
use crate::action::ActionRegistry;
use crate::event::bus::EventBus;
use crate::repository::{CheckpointRepository, JobRepository, WorkflowRepository};
use crate::workflow::{WorkflowError, WorkflowGraph};

/// Error type recorded on jobs whose robot disappeared for good.
pub const AGENT_LOST_ERROR: &str = "AgentLostError";

/// Outbound half of a robot connection.
pub type RobotLink = mpsc::Sender<DispatcherMessage>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("workflow '{0}' not found")]
    WorkflowNotFound(String),

    #[error(transparent)]
    InvalidWorkflow(#[from] WorkflowError),

    #[error("no registered robot can run this job: {0}")]
    NoCapableRobot(String),

    #[error("job queue is full ({0} jobs)")]
    QueueFull(usize),

    #[error("job {0} not found")]
    JobNotFound(Uuid),

    #[error("robot '{0}' not found")]
    RobotNotFound(String),

    #[error("job {job_id} is already {status}")]
    InvalidTransition { job_id: Uuid, status: JobStatus },

    #[error("repository error: {0}")]
    Repository(String),
}

impl From<QueueError> for DispatchError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Full { capacity } => DispatchError::QueueFull(capacity),
            other => DispatchError::Repository(other.to_string()),
        }
    }
}

fn repo_err(e: impl std::fmt::Display) -> DispatchError {
    DispatchError::Repository(e.to_string())
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Whether `robot` could ever run `job` (ignores load and liveness).
pub fn robot_matches(robot: &Robot, job: &Job) -> bool {
    if job
        .target_robot_id
        .as_deref()
        .is_some_and(|target| target != robot.id)
    {
        return false;
    }
    job.required_capabilities.is_subset(&robot.capabilities) && robot.environment == job.environment
}

struct RobotEntry {
    robot: Robot,
    link: Option<RobotLink>,
    breaker: CircuitBreaker,
}

impl RobotEntry {
    /// Connected, online and with a free slot.
    fn can_take_work(&mut self) -> bool {
        self.link.is_some()
            && self.robot.status != RobotStatus::Offline
            && self.robot.available_slots() > 0
            && self.breaker.is_available()
    }
}

// ---------------------------------------------------------------------------
// FleetDispatcher
// ---------------------------------------------------------------------------

/// Generic over the job, workflow and checkpoint repositories so the same
/// logic runs on SQLite in the server and on in-memory stores in tests.
pub struct FleetDispatcher<J, W, C>
where
    J: JobRepository,
    W: WorkflowRepository,
    C: CheckpointRepository,
{
    queue: JobQueue<J>,
    workflows: W,
    checkpoints: C,
    registry: Arc<ActionRegistry>,
    robots: DashMap<String, RobotEntry>,
    /// Pending acknowledgement watchdogs keyed by job id.
    ack_watchdogs: DashMap<Uuid, CancellationToken>,
    /// Serializes dispatch passes.
    dispatch_lock: tokio::sync::Mutex<()>,
    events: EventBus,
    config: DispatcherConfig,
    heartbeat_interval_secs: u64,
}

impl<J, W, C> FleetDispatcher<J, W, C>
where
    J: JobRepository + 'static,
    W: WorkflowRepository + 'static,
    C: CheckpointRepository + 'static,
{
    pub fn new(
        jobs: J,
        workflows: W,
        checkpoints: C,
        registry: Arc<ActionRegistry>,
        events: EventBus,
        config: &FleetConfig,
    ) -> Self {
        Self {
            queue: JobQueue::new(jobs, config.dispatcher.max_queue_size),
            workflows,
            checkpoints,
            registry,
            robots: DashMap::new(),
            ack_watchdogs: DashMap::new(),
            dispatch_lock: tokio::sync::Mutex::new(()),
            events,
            config: config.dispatcher.clone(),
            heartbeat_interval_secs: config.health.heartbeat_interval_secs,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Reload unfinished jobs after a restart. No robot is connected yet, so
    /// `Assigned` and `Running` jobs go back to `Queued`; running jobs keep
    /// their checkpoint reference and resume where they left off.
    pub async fn recover(&self) -> Result<usize, DispatchError> {
        let unfinished = self.queue.repo().list_unfinished_jobs().await.map_err(repo_err)?;
        for mut job in unfinished {
            let previous = job.status;
            if !matches!(previous, JobStatus::Assigned | JobStatus::Running) {
                continue;
            }
            job.status = JobStatus::Queued;
            job.assigned_robot_id = None;
            job.assigned_at = None;
            job.started_at = None;
            if self
                .queue
                .repo()
                .transition_job(&job, &[previous])
                .await
                .map_err(repo_err)?
            {
                tracing::info!(job_id = %job.id, previous = %previous, "job requeued after restart");
            }
        }
        let restored = self.queue.restore().await?;
        tracing::info!(queued = restored, "job queue restored");
        Ok(restored)
    }

    // -----------------------------------------------------------------------
    // Workflow definitions
    // -----------------------------------------------------------------------

    /// Validate and store a definition. Re-registering a name replaces it.
    pub async fn register_workflow(
        &self,
        document: WorkflowDocument,
    ) -> Result<WorkflowRecord, DispatchError> {
        let graph = WorkflowGraph::load(document, &self.registry)?;
        let document = graph.document().clone();
        let requested_id = document.id.as_deref().and_then(|s| Uuid::parse_str(s).ok());

        let existing = match requested_id {
            Some(id) => self.workflows.get_workflow(&id).await.map_err(repo_err)?,
            None => self
                .workflows
                .get_workflow_by_name(&document.metadata.name)
                .await
                .map_err(repo_err)?,
        };

        let now = Utc::now();
        let record = WorkflowRecord {
            id: existing
                .as_ref()
                .map(|r| r.id)
                .or(requested_id)
                .unwrap_or_else(Uuid::now_v7),
            name: document.metadata.name.clone(),
            version: document.metadata.version.clone(),
            description: document.metadata.description.clone(),
            fingerprint: graph.fingerprint().to_string(),
            document,
            created_at: existing.as_ref().map_or(now, |r| r.created_at),
            updated_at: now,
        };
        self.workflows.save_workflow(&record).await.map_err(repo_err)?;
        tracing::info!(
            workflow_id = %record.id,
            name = %record.name,
            version = %record.version,
            "workflow registered"
        );
        Ok(record)
    }

    /// Look a definition up by id, falling back to name.
    pub async fn resolve_workflow(&self, key: &str) -> Result<WorkflowRecord, DispatchError> {
        if let Ok(id) = Uuid::parse_str(key) {
            if let Some(record) = self.workflows.get_workflow(&id).await.map_err(repo_err)? {
                return Ok(record);
            }
        }
        self.workflows
            .get_workflow_by_name(key)
            .await
            .map_err(repo_err)?
            .ok_or_else(|| DispatchError::WorkflowNotFound(key.to_string()))
    }

    pub async fn list_workflows(&self) -> Result<Vec<WorkflowRecord>, DispatchError> {
        self.workflows.list_workflows().await.map_err(repo_err)
    }

    pub async fn delete_workflow(&self, id: &Uuid) -> Result<bool, DispatchError> {
        self.workflows.delete_workflow(id).await.map_err(repo_err)
    }

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    /// Accept a submission, or reject it synchronously.
    pub async fn submit(self: &Arc<Self>, submission: JobSubmission) -> Result<Job, DispatchError> {
        let workflow = self.resolve_workflow(&submission.workflow_id).await?;
        let job = Job {
            id: Uuid::now_v7(),
            workflow_id: workflow.id,
            workflow_name: workflow.name,
            workflow: workflow.document,
            priority: submission.priority,
            required_capabilities: submission.required_capabilities,
            environment: submission.environment,
            target_robot_id: submission.target_robot_id,
            timeout_secs: submission.timeout_secs,
            variables: submission.variables,
            status: JobStatus::Queued,
            assigned_robot_id: None,
            checkpoint_ref: None,
            requeue_count: 0,
            result: None,
            error: None,
            submitted_at: Utc::now(),
            assigned_at: None,
            started_at: None,
            completed_at: None,
        };

        if self.config.require_capable_robot
            && !self.robots.iter().any(|e| robot_matches(&e.robot, &job))
        {
            let mut wanted = format!("environment '{}'", job.environment);
            if !job.required_capabilities.is_empty() {
                let caps: Vec<&str> = job.required_capabilities.iter().map(String::as_str).collect();
                wanted.push_str(&format!(", capabilities [{}]", caps.join(", ")));
            }
            if let Some(target) = &job.target_robot_id {
                wanted.push_str(&format!(", robot '{target}'"));
            }
            return Err(DispatchError::NoCapableRobot(wanted));
        }

        self.queue.submit(job.clone()).await?;
        tracing::info!(
            job_id = %job.id,
            workflow = %job.workflow_name,
            priority = %job.priority,
            "job submitted"
        );
        self.events.emit(EventPayload::JobQueued {
            job_id: job.id,
            priority: job.priority,
        });
        self.redispatch().await;
        Ok(job)
    }

    pub async fn get_job(&self, id: &Uuid) -> Result<Job, DispatchError> {
        self.queue
            .repo()
            .get_job(id)
            .await
            .map_err(repo_err)?
            .ok_or(DispatchError::JobNotFound(*id))
    }

    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: u32,
    ) -> Result<Vec<Job>, DispatchError> {
        self.queue.repo().list_jobs(status, limit).await.map_err(repo_err)
    }

    /// Queued jobs in dispatch order.
    pub fn queued_jobs(&self) -> Vec<Job> {
        self.queue.snapshot()
    }

    /// Cancel a job that has not finished yet.
    pub async fn cancel(self: &Arc<Self>, job_id: Uuid) -> Result<Job, DispatchError> {
        loop {
            let mut job = self.get_job(&job_id).await?;
            let previous = job.status;
            if previous.is_terminal() {
                return Err(DispatchError::InvalidTransition {
                    job_id,
                    status: previous,
                });
            }
            if previous == JobStatus::Queued {
                self.queue.remove(&job_id);
            }
            let robot_id = job.assigned_robot_id.clone();
            job.status = JobStatus::Cancelled;
            job.completed_at = Some(Utc::now());
            if !self
                .queue
                .repo()
                .transition_job(&job, &[previous])
                .await
                .map_err(repo_err)?
            {
                // Claimed or finished in the meantime; look again.
                continue;
            }

            self.stop_watchdog(&job_id);
            if let Some(robot_id) = robot_id {
                self.release_slot(&robot_id, &job_id);
                self.send_to(&robot_id, DispatcherMessage::Cancel { job_id }).await;
            }
            self.clear_checkpoints(&job_id).await;
            tracing::info!(job_id = %job_id, previous = %previous, "job cancelled");
            self.events.emit(EventPayload::JobCancelled { job_id });
            self.redispatch().await;
            return Ok(job);
        }
    }

    /// Time out every unfinished job whose deadline has passed.
    pub async fn expire_jobs(self: &Arc<Self>, now: DateTime<Utc>) -> Result<Vec<Uuid>, DispatchError> {
        let mut expired = Vec::new();

        for mut job in self.queue.take_expired(now) {
            job.status = JobStatus::TimedOut;
            job.error = Some(timeout_message(&job));
            job.completed_at = Some(now);
            if self
                .queue
                .repo()
                .transition_job(&job, &[JobStatus::Queued])
                .await
                .map_err(repo_err)?
            {
                expired.push(job.id);
            }
        }

        let unfinished = self.queue.repo().list_unfinished_jobs().await.map_err(repo_err)?;
        for mut job in unfinished {
            let previous = job.status;
            let overdue = job.deadline().is_some_and(|d| d <= now);
            if !overdue || !matches!(previous, JobStatus::Assigned | JobStatus::Running) {
                continue;
            }
            let robot_id = job.assigned_robot_id.clone();
            job.status = JobStatus::TimedOut;
            job.error = Some(timeout_message(&job));
            job.completed_at = Some(now);
            if !self
                .queue
                .repo()
                .transition_job(&job, &[previous])
                .await
                .map_err(repo_err)?
            {
                continue;
            }
            self.stop_watchdog(&job.id);
            if let Some(robot_id) = robot_id {
                self.release_slot(&robot_id, &job.id);
                self.send_to(&robot_id, DispatcherMessage::Cancel { job_id: job.id })
                    .await;
            }
            expired.push(job.id);
        }

        for job_id in &expired {
            self.clear_checkpoints(job_id).await;
            tracing::warn!(job_id = %job_id, "job timed out");
            self.events.emit(EventPayload::JobTimedOut { job_id: *job_id });
        }
        if !expired.is_empty() {
            self.redispatch().await;
        }
        Ok(expired)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Assign queued jobs to free robot slots until nothing more matches.
    pub async fn dispatch(self: &Arc<Self>) -> Result<usize, DispatchError> {
        let _pass = self.dispatch_lock.lock().await;
        let mut assigned = 0;
        while let Some((job, robot_id)) = self
            .queue
            .claim_next(|job| self.select_robot(job), String::clone)
            .await?
        {
            if self.assign(job, &robot_id).await? {
                assigned += 1;
            }
        }
        Ok(assigned)
    }

    /// Dispatch after a state change that is already committed. A failed pass
    /// leaves the jobs queued for the next trigger instead of failing the caller.
    async fn redispatch(self: &Arc<Self>) {
        if let Err(e) = self.dispatch().await {
            tracing::warn!(error = %e, "dispatch pass failed, jobs stay queued");
        }
    }

    /// Best robot for `job` among those able to take work right now.
    fn select_robot(&self, job: &Job) -> Option<String> {
        let mut best: Option<((u32, Reverse<Option<DateTime<Utc>>>, Reverse<String>), String)> = None;
        for mut entry in self.robots.iter_mut() {
            if !robot_matches(&entry.robot, job) || !entry.can_take_work() {
                continue;
            }
            let robot = &entry.robot;
            let rank = (
                robot.available_slots(),
                Reverse(robot.last_assigned_at),
                Reverse(robot.id.clone()),
            );
            if best.as_ref().is_none_or(|(top, _)| rank > *top) {
                best = Some((rank, robot.id.clone()));
            }
        }
        best.map(|(_, id)| id)
    }

    /// Push a claimed job to its robot. Returns false if it was rolled back.
    async fn assign(self: &Arc<Self>, job: Job, robot_id: &str) -> Result<bool, DispatchError> {
        let now = Utc::now();
        let link = self.robots.get_mut(robot_id).and_then(|mut entry| {
            entry.robot.current_job_ids.insert(job.id);
            entry.robot.last_assigned_at = Some(now);
            entry.robot.refresh_status();
            entry.link.clone()
        });
        let Some(link) = link else {
            self.rollback(job.id, robot_id, "robot disconnected").await?;
            return Ok(false);
        };

        let checkpoint = match job.checkpoint_ref {
            Some(_) => match self.checkpoints.latest_checkpoint(&job.id).await {
                Ok(checkpoint) => checkpoint,
                Err(e) => {
                    // Back to the queue; the pass ends so the job is not reclaimed in a loop.
                    if let Err(undo) = self.rollback(job.id, robot_id, "checkpoint unreadable").await {
                        tracing::error!(job_id = %job.id, error = %undo, "rollback after checkpoint read failed");
                    }
                    return Err(repo_err(e));
                }
            },
            None => None,
        };
        let resumed = checkpoint.is_some();
        let assignment = JobAssignment {
            job_id: job.id,
            workflow: job.workflow.clone(),
            variables: job.variables.clone(),
            timeout_secs: job.timeout_secs,
            checkpoint,
        };

        self.start_watchdog(job.id, robot_id);
        if link
            .send(DispatcherMessage::Assign {
                job: Box::new(assignment),
            })
            .await
            .is_err()
        {
            self.stop_watchdog(&job.id);
            if let Some(mut entry) = self.robots.get_mut(robot_id) {
                entry.link = None;
            }
            self.rollback(job.id, robot_id, "robot link closed").await?;
            return Ok(false);
        }

        tracing::info!(job_id = %job.id, robot_id, resumed, "job assigned");
        self.events.emit(EventPayload::JobAssigned {
            job_id: job.id,
            robot_id: robot_id.to_string(),
        });
        Ok(true)
    }

    fn start_watchdog(self: &Arc<Self>, job_id: Uuid, robot_id: &str) {
        let token = CancellationToken::new();
        if let Some(previous) = self.ack_watchdogs.insert(job_id, token.clone()) {
            previous.cancel();
        }
        let this = Arc::clone(self);
        let robot_id = robot_id.to_string();
        let window = Duration::from_secs(self.config.ack_timeout_secs);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(window) => {
                    this.ack_watchdogs.remove(&job_id);
                    this.ack_timed_out(job_id, &robot_id).await;
                }
            }
        });
    }

    fn stop_watchdog(&self, job_id: &Uuid) {
        if let Some((_, token)) = self.ack_watchdogs.remove(job_id) {
            token.cancel();
        }
    }

    async fn ack_timed_out(self: &Arc<Self>, job_id: Uuid, robot_id: &str) {
        self.record_ack_failure(robot_id);
        let reason = format!(
            "robot '{robot_id}' did not acknowledge within {}s",
            self.config.ack_timeout_secs
        );
        match self.rollback(job_id, robot_id, &reason).await {
            Ok(true) => {
                self.redispatch().await;
            }
            Ok(false) => {}
            Err(e) => tracing::error!(job_id = %job_id, error = %e, "ack rollback failed"),
        }
    }

    /// `Assigned -> Queued` for a job held by `robot_id`.
    async fn rollback(&self, job_id: Uuid, robot_id: &str, reason: &str) -> Result<bool, DispatchError> {
        self.release_slot(robot_id, &job_id);
        let mut job = self.get_job(&job_id).await?;
        if job.status != JobStatus::Assigned || job.assigned_robot_id.as_deref() != Some(robot_id) {
            return Ok(false);
        }
        job.status = JobStatus::Queued;
        job.assigned_robot_id = None;
        job.assigned_at = None;
        if !self
            .queue
            .repo()
            .transition_job(&job, &[JobStatus::Assigned])
            .await
            .map_err(repo_err)?
        {
            return Ok(false);
        }
        self.queue.requeue(job);
        tracing::warn!(job_id = %job_id, robot_id, reason, "assignment rolled back");
        self.events.emit(EventPayload::JobRequeued {
            job_id,
            reason: reason.to_string(),
        });
        Ok(true)
    }

    fn record_ack_failure(&self, robot_id: &str) {
        if let Some(mut entry) = self.robots.get_mut(robot_id) {
            entry.breaker.record_failure();
        }
    }

    fn release_slot(&self, robot_id: &str, job_id: &Uuid) {
        if let Some(mut entry) = self.robots.get_mut(robot_id) {
            entry.robot.current_job_ids.remove(job_id);
            entry.robot.refresh_status();
        }
    }

    async fn send_to(&self, robot_id: &str, message: DispatcherMessage) {
        let link = self.robots.get(robot_id).and_then(|e| e.link.clone());
        match link {
            Some(link) => {
                if link.send(message).await.is_err() {
                    tracing::debug!(robot_id, "robot link closed, message dropped");
                }
            }
            None => tracing::debug!(robot_id, "robot not connected, message dropped"),
        }
    }

    async fn clear_checkpoints(&self, job_id: &Uuid) {
        if let Err(e) = self.checkpoints.delete_checkpoints(job_id).await {
            tracing::warn!(job_id = %job_id, error = %e, "failed to delete job checkpoints");
        }
    }

    // -----------------------------------------------------------------------
    // Robots
    // -----------------------------------------------------------------------

    /// Register (or re-register) a robot reachable through `link`.
    ///
    /// Jobs a re-registering robot still held belong to its previous
    /// session, which ended; they are recovered like those of a lost robot.
    pub async fn register_robot(
        self: &Arc<Self>,
        registration: RobotRegistration,
        link: RobotLink,
    ) -> Result<Robot, DispatchError> {
        let id = registration
            .robot_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("robot-{}", Uuid::now_v7()));
        let now = Utc::now();
        let name = if registration.name.is_empty() {
            id.clone()
        } else {
            registration.name.clone()
        };

        let mut previous_jobs = Vec::new();
        let robot = {
            let mut entry = self.robots.entry(id.clone()).or_insert_with(|| RobotEntry {
                robot: Robot {
                    id: id.clone(),
                    name: name.clone(),
                    capabilities: Default::default(),
                    environment: registration.environment.clone(),
                    tags: Default::default(),
                    max_concurrent_jobs: 1,
                    current_job_ids: Default::default(),
                    status: RobotStatus::Online,
                    last_heartbeat: now,
                    last_assigned_at: None,
                    registered_at: now,
                },
                link: None,
                breaker: CircuitBreaker::new(
                    self.config.breaker_failure_threshold,
                    Duration::from_secs(self.config.breaker_cooldown_secs),
                ),
            });
            previous_jobs.extend(std::mem::take(&mut entry.robot.current_job_ids));
            let robot = &mut entry.robot;
            robot.name = name;
            robot.capabilities = registration.capabilities;
            robot.environment = registration.environment;
            robot.tags = registration.tags;
            robot.max_concurrent_jobs = registration.max_concurrent_jobs.max(1);
            robot.status = RobotStatus::Online;
            robot.last_heartbeat = now;
            robot.refresh_status();
            entry.link = Some(link.clone());
            entry.robot.clone()
        };

        if link
            .send(DispatcherMessage::Registered {
                robot_id: id.clone(),
                heartbeat_interval_secs: self.heartbeat_interval_secs,
            })
            .await
            .is_err()
        {
            tracing::warn!(robot_id = %id, "robot link closed during registration");
        }
        tracing::info!(
            robot_id = %id,
            capabilities = ?robot.capabilities,
            environment = %robot.environment,
            slots = robot.max_concurrent_jobs,
            "robot registered"
        );
        self.events.emit(EventPayload::RobotOnline { robot_id: id.clone() });

        if !previous_jobs.is_empty() {
            self.recover_jobs(&id, previous_jobs, "robot re-registered").await?;
        }
        self.redispatch().await;
        Ok(robot)
    }

    /// Record a heartbeat. Returns false if the robot must register again.
    pub fn heartbeat(&self, robot_id: &str) -> bool {
        match self.robots.get_mut(robot_id) {
            Some(mut entry) if entry.robot.status != RobotStatus::Offline => {
                entry.robot.last_heartbeat = Utc::now();
                true
            }
            _ => false,
        }
    }

    /// The connection to `robot_id` closed. The robot keeps its jobs until
    /// it re-registers or the health monitor declares it lost.
    pub fn detach(&self, robot_id: &str) {
        if let Some(mut entry) = self.robots.get_mut(robot_id) {
            entry.link = None;
            tracing::info!(robot_id, "robot connection closed");
        }
    }

    /// Robots not marked offline whose last heartbeat is older than `cutoff`.
    pub fn stale_robots(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        self.robots
            .iter()
            .filter(|e| e.robot.status != RobotStatus::Offline && e.robot.last_heartbeat < cutoff)
            .map(|e| e.robot.id.clone())
            .collect()
    }

    /// Mark a robot offline and recover the jobs it held.
    pub async fn robot_lost(self: &Arc<Self>, robot_id: &str, reason: &str) -> Result<(), DispatchError> {
        let held: Vec<Uuid> = match self.robots.get_mut(robot_id) {
            Some(mut entry) => {
                entry.robot.status = RobotStatus::Offline;
                entry.link = None;
                std::mem::take(&mut entry.robot.current_job_ids).into_iter().collect()
            }
            None => return Err(DispatchError::RobotNotFound(robot_id.to_string())),
        };
        tracing::warn!(robot_id, reason, jobs = held.len(), "robot offline");
        self.events.emit(EventPayload::RobotOffline {
            robot_id: robot_id.to_string(),
            reason: reason.to_string(),
        });
        self.recover_jobs(robot_id, held, reason).await?;
        self.redispatch().await;
        Ok(())
    }

    /// Requeue or fail jobs whose robot went away.
    ///
    /// `Assigned` jobs simply go back to the queue. `Running` jobs are
    /// requeued when a checkpoint lets them resume elsewhere and the requeue
    /// budget is not spent; otherwise they fail with `AgentLostError`.
    async fn recover_jobs(&self, robot_id: &str, job_ids: Vec<Uuid>, reason: &str) -> Result<(), DispatchError> {
        for job_id in job_ids {
            self.stop_watchdog(&job_id);
            let Some(mut job) = self.queue.repo().get_job(&job_id).await.map_err(repo_err)? else {
                continue;
            };
            if job.assigned_robot_id.as_deref() != Some(robot_id) {
                continue;
            }
            let previous = job.status;
            match previous {
                JobStatus::Assigned => {
                    self.rollback(job_id, robot_id, reason).await?;
                }
                JobStatus::Running => {
                    let checkpointed = self
                        .checkpoints
                        .latest_checkpoint(&job_id)
                        .await
                        .map_err(repo_err)?
                        .is_some();
                    if checkpointed && job.requeue_count < self.config.max_requeues {
                        job.status = JobStatus::Queued;
                        job.assigned_robot_id = None;
                        job.assigned_at = None;
                        job.started_at = None;
                        job.requeue_count += 1;
                        if self
                            .queue
                            .repo()
                            .transition_job(&job, &[previous])
                            .await
                            .map_err(repo_err)?
                        {
                            tracing::warn!(
                                job_id = %job_id,
                                robot_id,
                                requeues = job.requeue_count,
                                "running job requeued from checkpoint"
                            );
                            self.queue.requeue(job);
                            self.events.emit(EventPayload::JobRequeued {
                                job_id,
                                reason: reason.to_string(),
                            });
                        }
                    } else {
                        let error = format!("{AGENT_LOST_ERROR}: robot '{robot_id}' lost ({reason})");
                        job.status = JobStatus::Failed;
                        job.error = Some(error.clone());
                        job.completed_at = Some(Utc::now());
                        if self
                            .queue
                            .repo()
                            .transition_job(&job, &[previous])
                            .await
                            .map_err(repo_err)?
                        {
                            tracing::error!(job_id = %job_id, robot_id, checkpointed, "job failed: agent lost");
                            self.clear_checkpoints(&job_id).await;
                            self.events.emit(EventPayload::JobFailed { job_id, error });
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn robots(&self) -> Vec<Robot> {
        let mut robots: Vec<Robot> = self.robots.iter().map(|e| e.robot.clone()).collect();
        robots.sort_by(|a, b| a.id.cmp(&b.id));
        robots
    }

    pub fn robot(&self, robot_id: &str) -> Option<Robot> {
        self.robots.get(robot_id).map(|e| e.robot.clone())
    }

    // -----------------------------------------------------------------------
    // Agent messages
    // -----------------------------------------------------------------------

    /// Drive one agent connection until the agent hangs up.
    ///
    /// The first frame must be `Register`. Replies and dispatcher pushes
    /// share `outbound`, which also becomes the robot's link. Returns the
    /// robot id the session registered, if any.
    pub async fn serve_agent(
        self: &Arc<Self>,
        mut inbound: mpsc::Receiver<AgentMessage>,
        outbound: RobotLink,
    ) -> Result<Option<String>, DispatchError> {
        let mut robot_id: Option<String> = None;
        while let Some(message) = inbound.recv().await {
            let reply = match (message, robot_id.as_deref()) {
                (AgentMessage::Register(mut registration), current) => {
                    if registration.robot_id.is_none() {
                        registration.robot_id = current.map(str::to_string);
                    }
                    let robot = self.register_robot(registration, outbound.clone()).await?;
                    robot_id = Some(robot.id);
                    None
                }
                (_, None) => Some(DispatcherMessage::Error {
                    message: "register before sending other messages".to_string(),
                }),
                (message, Some(id)) => match self.on_agent_message(id, message).await {
                    Ok(reply) => reply,
                    Err(e) => {
                        tracing::warn!(robot_id = id, error = %e, "agent message failed");
                        Some(DispatcherMessage::Error {
                            message: e.to_string(),
                        })
                    }
                },
            };
            if let Some(reply) = reply {
                if outbound.send(reply).await.is_err() {
                    break;
                }
            }
        }
        if let Some(id) = &robot_id {
            self.detach(id);
        }
        Ok(robot_id)
    }

    /// Handle one frame from a registered robot. Returns the reply to send
    /// back over the same connection, if any.
    pub async fn on_agent_message(
        self: &Arc<Self>,
        robot_id: &str,
        message: AgentMessage,
    ) -> Result<Option<DispatcherMessage>, DispatchError> {
        match message {
            AgentMessage::Register(_) => Ok(Some(DispatcherMessage::Error {
                message: "already registered on this connection".to_string(),
            })),
            AgentMessage::Heartbeat { .. } => {
                if self.heartbeat(robot_id) {
                    Ok(None)
                } else {
                    tracing::info!(robot_id, "heartbeat from unknown or offline robot");
                    Ok(Some(DispatcherMessage::Reregister {
                        reason: format!("robot '{robot_id}' is not registered"),
                    }))
                }
            }
            AgentMessage::Accepted { job_id } => self.accepted(robot_id, job_id).await,
            AgentMessage::Rejected { job_id, reason } => {
                self.stop_watchdog(&job_id);
                self.record_ack_failure(robot_id);
                if self.rollback(job_id, robot_id, &format!("rejected: {reason}")).await? {
                    self.redispatch().await;
                }
                Ok(None)
            }
            AgentMessage::Progress {
                job_id,
                node_id,
                status,
            } => {
                self.events.emit(EventPayload::JobProgress {
                    job_id,
                    node_id,
                    status,
                });
                Ok(None)
            }
            AgentMessage::Checkpoint { job_id, checkpoint } => {
                self.store_checkpoint(robot_id, job_id, *checkpoint).await
            }
            AgentMessage::Completed { job_id, result } => {
                self.finish(robot_id, job_id, JobStatus::Succeeded, Some(result), None)
                    .await?;
                Ok(None)
            }
            AgentMessage::Failed { job_id, error } => {
                let status = if error.error_type == crate::action::TIMEOUT_ERROR {
                    JobStatus::TimedOut
                } else {
                    JobStatus::Failed
                };
                self.finish(robot_id, job_id, status, None, Some(error.to_string()))
                    .await?;
                Ok(None)
            }
        }
    }

    async fn accepted(self: &Arc<Self>, robot_id: &str, job_id: Uuid) -> Result<Option<DispatcherMessage>, DispatchError> {
        self.stop_watchdog(&job_id);
        let mut job = self.get_job(&job_id).await?;
        let ours = job.status == JobStatus::Assigned && job.assigned_robot_id.as_deref() == Some(robot_id);
        if ours {
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
            if self
                .queue
                .repo()
                .transition_job(&job, &[JobStatus::Assigned])
                .await
                .map_err(repo_err)?
            {
                if let Some(mut entry) = self.robots.get_mut(robot_id) {
                    entry.breaker.record_success();
                }
                tracing::info!(job_id = %job_id, robot_id, "job running");
                self.events.emit(EventPayload::JobRunning {
                    job_id,
                    robot_id: robot_id.to_string(),
                });
                return Ok(None);
            }
        }
        // Late ack for a job that was rolled back, reassigned or cancelled.
        tracing::warn!(job_id = %job_id, robot_id, status = %job.status, "stale acknowledgement");
        self.release_slot(robot_id, &job_id);
        Ok(Some(DispatcherMessage::Cancel { job_id }))
    }

    /// Persist a checkpoint streamed by the robot running `job_id`, then ack.
    async fn store_checkpoint(
        &self,
        robot_id: &str,
        job_id: Uuid,
        checkpoint: Checkpoint,
    ) -> Result<Option<DispatcherMessage>, DispatchError> {
        let mut job = self.get_job(&job_id).await?;
        if job.status != JobStatus::Running || job.assigned_robot_id.as_deref() != Some(robot_id) {
            return Ok(Some(DispatcherMessage::Error {
                message: format!("job {job_id} is not running on robot '{robot_id}'"),
            }));
        }
        self.checkpoints
            .save_checkpoint(&checkpoint)
            .await
            .map_err(repo_err)?;
        job.checkpoint_ref = Some(checkpoint.id);
        self.queue
            .repo()
            .transition_job(&job, &[JobStatus::Running])
            .await
            .map_err(repo_err)?;
        tracing::debug!(job_id = %job_id, sequence = checkpoint.sequence, "checkpoint stored");
        Ok(Some(DispatcherMessage::CheckpointAck {
            job_id,
            sequence: checkpoint.sequence,
        }))
    }

    async fn finish(
        self: &Arc<Self>,
        robot_id: &str,
        job_id: Uuid,
        status: JobStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<(), DispatchError> {
        self.stop_watchdog(&job_id);
        self.release_slot(robot_id, &job_id);
        let mut job = self.get_job(&job_id).await?;
        let previous = job.status;
        if job.assigned_robot_id.as_deref() != Some(robot_id)
            || !matches!(previous, JobStatus::Assigned | JobStatus::Running)
        {
            tracing::debug!(job_id = %job_id, robot_id, status = %previous, "ignoring late job report");
            self.redispatch().await;
            return Ok(());
        }
        job.status = status;
        job.result = result;
        job.error = error;
        job.completed_at = Some(Utc::now());
        if self
            .queue
            .repo()
            .transition_job(&job, &[previous])
            .await
            .map_err(repo_err)?
        {
            self.clear_checkpoints(&job_id).await;
            match status {
                JobStatus::Succeeded => tracing::info!(job_id = %job_id, robot_id, "job succeeded"),
                _ => tracing::warn!(
                    job_id = %job_id,
                    robot_id,
                    status = %status,
                    error = job.error.as_deref().unwrap_or_default(),
                    "job did not succeed"
                ),
            }
            if let Some(event) = EventPayload::for_terminal_job(job_id, status, job.error.as_deref()) {
                self.events.emit(event);
            }
        }
        self.redispatch().await;
        Ok(())
    }
}

fn timeout_message(job: &Job) -> String {
    format!(
        "{}: job exceeded its {}s timeout",
        crate::action::TIMEOUT_ERROR,
        job.timeout_secs.unwrap_or_default()
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use fleetflow_types::error::RepositoryError;
    use fleetflow_types::protocol::JobFailure;
    use fleetflow_types::run::RunSnapshot;
    use serde_json::json;

    use crate::repository::memory::{
        InMemoryCheckpointRepository, InMemoryJobRepository, InMemoryWorkflowRepository,
    };
    use crate::workflow::graph::tests::DocBuilder;

    pub(crate) type TestDispatcher =
        FleetDispatcher<InMemoryJobRepository, InMemoryWorkflowRepository, InMemoryCheckpointRepository>;

    pub(crate) fn dispatcher_with(config: FleetConfig) -> Arc<TestDispatcher> {
        Arc::new(FleetDispatcher::new(
            InMemoryJobRepository::new(),
            InMemoryWorkflowRepository::new(),
            InMemoryCheckpointRepository::new(),
            Arc::new(ActionRegistry::with_builtins()),
            EventBus::default(),
            &config,
        ))
    }

    fn dispatcher() -> Arc<TestDispatcher> {
        dispatcher_with(FleetConfig::default())
    }

    pub(crate) fn hello_workflow() -> WorkflowDocument {
        DocBuilder::new("hello")
            .node("start", "Start", json!({}))
            .node("greet", "SetVariable", json!({"name": "greeting", "value": "hello"}))
            .edge("start", "exec_out", "greet")
            .build()
    }

    fn registration(id: &str, caps: &[&str], slots: u32) -> RobotRegistration {
        RobotRegistration {
            robot_id: Some(id.to_string()),
            name: String::new(),
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            environment: "default".into(),
            tags: BTreeSet::new(),
            max_concurrent_jobs: slots,
        }
    }

    async fn connect<C: CheckpointRepository + 'static>(
        d: &Arc<FleetDispatcher<InMemoryJobRepository, InMemoryWorkflowRepository, C>>,
        id: &str,
        caps: &[&str],
        slots: u32,
    ) -> mpsc::Receiver<DispatcherMessage> {
        let (tx, mut rx) = mpsc::channel(64);
        d.register_robot(registration(id, caps, slots), tx).await.unwrap();
        match rx.recv().await {
            Some(DispatcherMessage::Registered { robot_id, .. }) => assert_eq!(robot_id, id),
            other => panic!("expected registered, got {other:?}"),
        }
        rx
    }

    fn submission(caps: &[&str]) -> JobSubmission {
        JobSubmission {
            workflow_id: "hello".into(),
            priority: Default::default(),
            required_capabilities: caps.iter().map(|c| c.to_string()).collect(),
            environment: "default".into(),
            target_robot_id: None,
            timeout_secs: None,
            variables: Default::default(),
        }
    }

    fn assigned_job(msg: Option<DispatcherMessage>) -> Uuid {
        match msg {
            Some(DispatcherMessage::Assign { job }) => job.job_id,
            other => panic!("expected assign, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn assigns_only_to_capable_robot() {
        let d = dispatcher();
        d.register_workflow(hello_workflow()).await.unwrap();
        let mut browser = connect(&d, "browser-bot", &["browser"], 1).await;
        let mut desktop = connect(&d, "desktop-bot", &["desktop"], 1).await;

        let job = d.submit(submission(&["browser"])).await.unwrap();
        assert_eq!(assigned_job(browser.recv().await), job.id);
        assert!(desktop.try_recv().is_err());

        let stored = d.get_job(&job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Assigned);
        assert_eq!(stored.assigned_robot_id.as_deref(), Some("browser-bot"));
    }

    #[tokio::test]
    async fn unsatisfiable_and_unknown_submissions_are_rejected() {
        let d = dispatcher();
        d.register_workflow(hello_workflow()).await.unwrap();
        let _r = connect(&d, "r1", &["desktop"], 1).await;

        assert!(matches!(
            d.submit(submission(&["browser"])).await,
            Err(DispatchError::NoCapableRobot(_))
        ));
        let mut unknown = submission(&[]);
        unknown.workflow_id = "nope".into();
        assert!(matches!(
            d.submit(unknown).await,
            Err(DispatchError::WorkflowNotFound(_))
        ));
    }

    #[tokio::test]
    async fn full_queue_is_reported_at_submit() {
        let mut config = FleetConfig::default();
        config.dispatcher.max_queue_size = 1;
        config.dispatcher.require_capable_robot = false;
        let d = dispatcher_with(config);
        d.register_workflow(hello_workflow()).await.unwrap();
        d.submit(submission(&[])).await.unwrap();
        assert!(matches!(
            d.submit(submission(&[])).await,
            Err(DispatchError::QueueFull(1))
        ));
    }

    #[tokio::test]
    async fn target_robot_job_waits_for_its_robot() {
        let mut config = FleetConfig::default();
        config.dispatcher.require_capable_robot = false;
        let d = dispatcher_with(config);
        d.register_workflow(hello_workflow()).await.unwrap();
        let mut other = connect(&d, "other", &[], 1).await;

        let mut sub = submission(&[]);
        sub.target_robot_id = Some("special".into());
        let job = d.submit(sub).await.unwrap();
        assert!(other.try_recv().is_err());
        assert_eq!(d.queue_len(), 1);

        let mut special = connect(&d, "special", &[], 1).await;
        assert_eq!(assigned_job(special.recv().await), job.id);
    }

    #[tokio::test]
    async fn prefers_free_capacity_then_round_robin() {
        let d = dispatcher();
        d.register_workflow(hello_workflow()).await.unwrap();
        let mut big = connect(&d, "big", &[], 3).await;
        let mut small = connect(&d, "small", &[], 1).await;

        // big has 3 free slots vs 1.
        d.submit(submission(&[])).await.unwrap();
        assigned_job(big.recv().await);
        // 2 vs 1: big again.
        d.submit(submission(&[])).await.unwrap();
        assigned_job(big.recv().await);
        // 1 vs 1: small was never assigned, so it goes first.
        d.submit(submission(&[])).await.unwrap();
        assigned_job(small.recv().await);
        assert_eq!(d.robot("small").unwrap().status, RobotStatus::Busy);
    }

    #[tokio::test]
    async fn accepted_completed_lifecycle_frees_slot() {
        let d = dispatcher();
        let mut rx = d.events().subscribe();
        d.register_workflow(hello_workflow()).await.unwrap();
        let mut robot = connect(&d, "r1", &[], 1).await;

        let first = d.submit(submission(&[])).await.unwrap();
        let second = d.submit(submission(&[])).await.unwrap();
        assert_eq!(assigned_job(robot.recv().await), first.id);
        assert_eq!(d.queue_len(), 1);

        assert!(d.on_agent_message("r1", AgentMessage::Accepted { job_id: first.id }).await.unwrap().is_none());
        assert_eq!(d.get_job(&first.id).await.unwrap().status, JobStatus::Running);

        d.on_agent_message(
            "r1",
            AgentMessage::Completed {
                job_id: first.id,
                result: json!({"ok": true}),
            },
        )
        .await
        .unwrap();
        let done = d.get_job(&first.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.result, Some(json!({"ok": true})));

        // The freed slot picks up the next job.
        assert_eq!(assigned_job(robot.recv().await), second.id);

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(serde_json::to_value(&event).unwrap()["type"].as_str().unwrap().to_string());
        }
        for expected in ["robot_online", "job_queued", "job_assigned", "job_running", "job_succeeded"] {
            assert!(kinds.iter().any(|k| k == expected), "missing {expected} in {kinds:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ack_rolls_back_and_retries() {
        let d = dispatcher();
        d.register_workflow(hello_workflow()).await.unwrap();
        let mut robot = connect(&d, "r1", &[], 1).await;
        let job = d.submit(submission(&[])).await.unwrap();
        assert_eq!(assigned_job(robot.recv().await), job.id);

        // No ack: after the window the job is rolled back and pushed again.
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(assigned_job(robot.recv().await), job.id);
        let stored = d.get_job(&job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Assigned);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_ack_failures_open_the_breaker() {
        let mut config = FleetConfig::default();
        config.dispatcher.breaker_failure_threshold = 2;
        let d = dispatcher_with(config);
        d.register_workflow(hello_workflow()).await.unwrap();
        let mut robot = connect(&d, "r1", &[], 1).await;
        let job = d.submit(submission(&[])).await.unwrap();

        assigned_job(robot.recv().await);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assigned_job(robot.recv().await);
        tokio::time::sleep(Duration::from_secs(11)).await;

        // Breaker open: the job waits in the queue.
        assert!(robot.try_recv().is_err());
        assert_eq!(d.get_job(&job.id).await.unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn rejection_moves_job_to_another_robot() {
        let d = dispatcher();
        d.register_workflow(hello_workflow()).await.unwrap();
        let mut a = connect(&d, "a", &[], 1).await;
        let job = d.submit(submission(&[])).await.unwrap();
        assert_eq!(assigned_job(a.recv().await), job.id);
        let mut b = connect(&d, "b", &[], 1).await;

        d.on_agent_message(
            "a",
            AgentMessage::Rejected {
                job_id: job.id,
                reason: "busy".into(),
            },
        )
        .await
        .unwrap();

        // Equal free slots; `b` has never been assigned so it goes first.
        assert_eq!(assigned_job(b.recv().await), job.id);
        assert!(a.try_recv().is_err());
        let stored = d.get_job(&job.id).await.unwrap();
        assert_eq!(stored.assigned_robot_id.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn cancel_queued_and_running_jobs() {
        let d = dispatcher();
        d.register_workflow(hello_workflow()).await.unwrap();
        let mut robot = connect(&d, "r1", &[], 1).await;
        let running = d.submit(submission(&[])).await.unwrap();
        let queued = d.submit(submission(&[])).await.unwrap();
        assigned_job(robot.recv().await);
        d.on_agent_message("r1", AgentMessage::Accepted { job_id: running.id })
            .await
            .unwrap();

        // Cancelling the running job frees the slot for the queued one, so
        // cancel the queued job first.
        let cancelled = d.cancel(queued.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert_eq!(d.queue_len(), 0);

        d.cancel(running.id).await.unwrap();
        match robot.recv().await {
            Some(DispatcherMessage::Cancel { job_id }) => assert_eq!(job_id, running.id),
            other => panic!("expected cancel, got {other:?}"),
        }
        assert!(matches!(
            d.cancel(running.id).await,
            Err(DispatchError::InvalidTransition { status: JobStatus::Cancelled, .. })
        ));

        // A late failure report for the cancelled job changes nothing.
        d.on_agent_message(
            "r1",
            AgentMessage::Failed {
                job_id: running.id,
                error: JobFailure {
                    error_type: "Cancelled".into(),
                    message: "run cancelled".into(),
                    node: None,
                },
            },
        )
        .await
        .unwrap();
        assert_eq!(d.get_job(&running.id).await.unwrap().status, JobStatus::Cancelled);
    }

    fn checkpoint_for(job_id: Uuid, sequence: u64) -> Checkpoint {
        Checkpoint {
            id: Uuid::now_v7(),
            run_id: job_id,
            node_id: "greet".into(),
            sequence,
            workflow_fingerprint: "fp".into(),
            snapshot: RunSnapshot::default(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn checkpoints_are_stored_and_acknowledged() {
        let d = dispatcher();
        d.register_workflow(hello_workflow()).await.unwrap();
        let mut robot = connect(&d, "r1", &[], 1).await;
        let job = d.submit(submission(&[])).await.unwrap();
        assigned_job(robot.recv().await);
        d.on_agent_message("r1", AgentMessage::Accepted { job_id: job.id }).await.unwrap();

        let checkpoint = checkpoint_for(job.id, 4);
        let reply = d
            .on_agent_message(
                "r1",
                AgentMessage::Checkpoint {
                    job_id: job.id,
                    checkpoint: Box::new(checkpoint.clone()),
                },
            )
            .await
            .unwrap();
        assert!(matches!(reply, Some(DispatcherMessage::CheckpointAck { sequence: 4, .. })));
        assert_eq!(d.get_job(&job.id).await.unwrap().checkpoint_ref, Some(checkpoint.id));

        // Wrong robot: refused, no ack.
        let reply = d
            .on_agent_message(
                "someone-else",
                AgentMessage::Checkpoint {
                    job_id: job.id,
                    checkpoint: Box::new(checkpoint_for(job.id, 5)),
                },
            )
            .await
            .unwrap();
        assert!(matches!(reply, Some(DispatcherMessage::Error { .. })));
    }

    #[tokio::test]
    async fn lost_robot_requeues_checkpointed_and_fails_the_rest() {
        let d = dispatcher();
        d.register_workflow(hello_workflow()).await.unwrap();
        let mut robot = connect(&d, "r1", &[], 2).await;
        let with_cp = d.submit(submission(&[])).await.unwrap();
        let without_cp = d.submit(submission(&[])).await.unwrap();
        assigned_job(robot.recv().await);
        assigned_job(robot.recv().await);
        for id in [with_cp.id, without_cp.id] {
            d.on_agent_message("r1", AgentMessage::Accepted { job_id: id }).await.unwrap();
        }
        d.on_agent_message(
            "r1",
            AgentMessage::Checkpoint {
                job_id: with_cp.id,
                checkpoint: Box::new(checkpoint_for(with_cp.id, 1)),
            },
        )
        .await
        .unwrap();

        d.robot_lost("r1", "missed heartbeats").await.unwrap();
        assert_eq!(d.robot("r1").unwrap().status, RobotStatus::Offline);

        let requeued = d.get_job(&with_cp.id).await.unwrap();
        assert_eq!(requeued.status, JobStatus::Queued);
        assert_eq!(requeued.requeue_count, 1);
        assert!(requeued.checkpoint_ref.is_some());

        let failed = d.get_job(&without_cp.id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.error.unwrap().starts_with(AGENT_LOST_ERROR));

        // A new robot resumes the checkpointed job.
        let mut other = connect(&d, "r2", &[], 1).await;
        match other.recv().await {
            Some(DispatcherMessage::Assign { job }) => {
                assert_eq!(job.job_id, with_cp.id);
                assert_eq!(job.checkpoint.map(|c| c.sequence), Some(1));
            }
            other => panic!("expected assign, got {other:?}"),
        }
    }

    /// In-memory checkpoints whose reads can be switched off.
    #[derive(Clone, Default)]
    struct SwitchableCheckpoints {
        inner: InMemoryCheckpointRepository,
        reads_fail: Arc<std::sync::atomic::AtomicBool>,
    }

    impl CheckpointRepository for SwitchableCheckpoints {
        async fn save_checkpoint(&self, c: &Checkpoint) -> Result<(), RepositoryError> {
            self.inner.save_checkpoint(c).await
        }
        async fn latest_checkpoint(&self, id: &Uuid) -> Result<Option<Checkpoint>, RepositoryError> {
            if self.reads_fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(RepositoryError::Unavailable);
            }
            self.inner.latest_checkpoint(id).await
        }
        async fn delete_checkpoints(&self, id: &Uuid) -> Result<u64, RepositoryError> {
            self.inner.delete_checkpoints(id).await
        }
    }

    #[tokio::test]
    async fn unreadable_checkpoint_returns_job_to_queue() {
        let checkpoints = SwitchableCheckpoints::default();
        let d = Arc::new(FleetDispatcher::new(
            InMemoryJobRepository::new(),
            InMemoryWorkflowRepository::new(),
            checkpoints.clone(),
            Arc::new(ActionRegistry::with_builtins()),
            EventBus::default(),
            &FleetConfig::default(),
        ));
        d.register_workflow(hello_workflow()).await.unwrap();
        let mut first = connect(&d, "r1", &[], 1).await;
        let resumable = d.submit(submission(&[])).await.unwrap();
        assigned_job(first.recv().await);
        d.on_agent_message("r1", AgentMessage::Accepted { job_id: resumable.id }).await.unwrap();
        d.on_agent_message(
            "r1",
            AgentMessage::Checkpoint {
                job_id: resumable.id,
                checkpoint: Box::new(checkpoint_for(resumable.id, 3)),
            },
        )
        .await
        .unwrap();
        d.robot_lost("r1", "missed heartbeats").await.unwrap();

        checkpoints.reads_fail.store(true, std::sync::atomic::Ordering::SeqCst);
        let mut second = connect(&d, "r2", &[], 2).await;
        let job = d.get_job(&resumable.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.assigned_robot_id, None);
        assert!(d.robot("r2").unwrap().current_job_ids.is_empty());
        assert!(second.try_recv().is_err());

        // The failed pass does not fail the submission that triggered it.
        let fresh = d.submit(submission(&[])).await.unwrap();
        assert_eq!(d.get_job(&resumable.id).await.unwrap().status, JobStatus::Queued);
        assert!(d.dispatch().await.is_err());

        checkpoints.reads_fail.store(false, std::sync::atomic::Ordering::SeqCst);
        d.dispatch().await.unwrap();
        let mut resumed = None;
        let mut assigned = Vec::new();
        for _ in 0..2 {
            match second.recv().await {
                Some(DispatcherMessage::Assign { job }) => {
                    if job.job_id == resumable.id {
                        resumed = job.checkpoint.as_ref().map(|c| c.sequence);
                    }
                    assigned.push(job.job_id);
                }
                other => panic!("expected assign, got {other:?}"),
            }
        }
        assigned.sort();
        let mut expected = vec![resumable.id, fresh.id];
        expected.sort();
        assert_eq!(assigned, expected);
        assert_eq!(resumed, Some(3));
    }

    #[tokio::test]
    async fn heartbeat_from_unknown_robot_asks_to_reregister() {
        let d = dispatcher();
        let reply = d
            .on_agent_message(
                "ghost",
                AgentMessage::Heartbeat {
                    robot_id: "ghost".into(),
                    timestamp: Utc::now(),
                    running_jobs: vec![],
                },
            )
            .await
            .unwrap();
        assert!(matches!(reply, Some(DispatcherMessage::Reregister { .. })));
    }

    #[tokio::test]
    async fn overdue_running_job_times_out_and_is_cancelled_on_robot() {
        let d = dispatcher();
        d.register_workflow(hello_workflow()).await.unwrap();
        let mut robot = connect(&d, "r1", &[], 1).await;
        let mut sub = submission(&[]);
        sub.timeout_secs = Some(30);
        let job = d.submit(sub).await.unwrap();
        assigned_job(robot.recv().await);
        d.on_agent_message("r1", AgentMessage::Accepted { job_id: job.id }).await.unwrap();

        assert!(d.expire_jobs(Utc::now()).await.unwrap().is_empty());
        let later = Utc::now() + chrono::Duration::seconds(31);
        assert_eq!(d.expire_jobs(later).await.unwrap(), vec![job.id]);
        assert_eq!(d.get_job(&job.id).await.unwrap().status, JobStatus::TimedOut);
        assert!(matches!(robot.recv().await, Some(DispatcherMessage::Cancel { .. })));
    }

    #[tokio::test]
    async fn recover_requeues_in_flight_jobs() {
        let jobs = InMemoryJobRepository::new();
        let workflows = InMemoryWorkflowRepository::new();
        let build = |jobs: InMemoryJobRepository, workflows: InMemoryWorkflowRepository| {
            Arc::new(FleetDispatcher::new(
                jobs,
                workflows,
                InMemoryCheckpointRepository::new(),
                Arc::new(ActionRegistry::with_builtins()),
                EventBus::default(),
                &FleetConfig::default(),
            ))
        };

        let before = build(jobs.clone(), workflows.clone());
        before.register_workflow(hello_workflow()).await.unwrap();
        let mut robot = connect(&before, "r1", &[], 1).await;
        let job = before.submit(submission(&[])).await.unwrap();
        assigned_job(robot.recv().await);

        // Restart: a fresh dispatcher over the same storage.
        let after = build(jobs, workflows);
        assert_eq!(after.recover().await.unwrap(), 1);
        assert_eq!(after.get_job(&job.id).await.unwrap().status, JobStatus::Queued);
        assert_eq!(after.queued_jobs()[0].id, job.id);
    }

    #[tokio::test]
    async fn reregistering_a_name_keeps_the_workflow_id() {
        let d = dispatcher();
        let first = d.register_workflow(hello_workflow()).await.unwrap();
        let second = d.register_workflow(hello_workflow()).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(d.resolve_workflow(&first.id.to_string()).await.unwrap().name, "hello");
        assert_eq!(d.list_workflows().await.unwrap().len(), 1);
    }
}
