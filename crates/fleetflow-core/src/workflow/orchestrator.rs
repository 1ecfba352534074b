//! Execution orchestrator: the state machine that walks a loaded graph.
//!
//! A run is executed by *strands*. The root strand starts at the graph's entry
//! set; whenever a node fires more than one successor the strand forks, one
//! child strand per successor, and joins them before continuing. Each strand
//! owns a copy of the control stack; frames below its `fork_base` belong to
//! its parent, so loop continues, breaks and uncaught errors that target
//! those frames are handed back to the parent at the join.
//!
//! # Per-node flow
//!
//! 1. Mark `Running`, emit `NodeStarted`.
//! 2. Pull data inputs (waiting for upstream producers, or evaluating pure
//!    data nodes on demand).
//! 3. Resolve config templates against the run variables.
//! 4. Invoke the action through `Retrying(Deadline(OnError(handler)))`, or
//!    evaluate the control construct in place.
//! 5. Record outputs, mark `Success`, checkpoint (root strand only), follow
//!    the fired execution ports. A failure is raised into the control stack
//!    instead.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use fleetflow_types::config::OrchestratorConfig;
use fleetflow_types::event::EventPayload;
use fleetflow_types::run::{
    Checkpoint, ControlFrame, LoopItems, LoopJump, NodeFailure, NodeStatus, RunStatus, TryPhase,
};
use fleetflow_types::workflow::{CheckpointPolicy, WorkflowSettings};
use futures_util::future::BoxFuture;
use serde_json::{json, Map, Value};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::context::ExecutionContext;
use super::definition::WorkflowError;
use super::expression::{truthy, ConditionEvaluator, ExpressionError};
use super::graph::{GraphNode, PortRef, WorkflowGraph};
use super::node::{
    NodeKind, PORT_BODY, PORT_CATCH_BODY, PORT_COMPLETED, PORT_FALSE, PORT_FINALLY_BODY,
    PORT_TRUE, PORT_TRY_BODY,
};
use crate::action::layer::{Deadline, ErrorHook, OnError};
use crate::action::retry::{RetryObserver, RetryPolicy, Retrying};
use crate::action::{
    ActionHandler, ActionInput, SharedAction, CANCELLED_ERROR, CONFIG_ERROR, EXEC_OUT,
    TIMEOUT_ERROR,
};
use crate::event::bus::EventBus;
use crate::repository::checkpoint::CheckpointRepository;

/// Error type raised when a for/while loop exceeds its iteration ceiling.
pub const LOOP_LIMIT_ERROR: &str = "LoopLimitError";
pub const EXPRESSION_ERROR: &str = "ExpressionError";
pub const CHECKPOINT_ERROR: &str = "CheckpointError";

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Failures that prevent a run from executing at all.
///
/// Node failures, timeouts and cancellation are not errors at this level;
/// they end the run with the corresponding [`RunStatus`].
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Validation(#[from] WorkflowError),

    #[error("stale checkpoint: {0}")]
    StaleCheckpoint(String),

    #[error("no checkpoint for run {0}")]
    CheckpointNotFound(Uuid),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("run {0} is already executing")]
    AlreadyRunning(Uuid),
}

impl From<CheckpointError> for ExecutionError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::NotFound(run_id) => ExecutionError::CheckpointNotFound(run_id),
            stale @ CheckpointError::Stale { .. } => ExecutionError::StaleCheckpoint(stale.to_string()),
            CheckpointError::Repository(msg) => ExecutionError::Checkpoint(msg),
        }
    }
}

/// Terminal state of one run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub variables: Map<String, Value>,
    pub node_status: BTreeMap<String, NodeStatus>,
    /// Every uncaught error, in the order it was raised.
    pub errors: Vec<NodeFailure>,
    pub duration_ms: u64,
}

impl RunOutcome {
    /// The error that decided the run, if any.
    pub fn error(&self) -> Option<&NodeFailure> {
        self.errors.last()
    }

    /// Result payload reported upstream for a finished job.
    pub fn to_result_json(&self) -> Value {
        json!({
            "run_id": self.run_id,
            "status": self.status,
            "variables": self.variables,
            "errors": self.errors,
            "duration_ms": self.duration_ms,
        })
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Runs workflow graphs, one independent execution context per run.
///
/// Generic over `R: CheckpointRepository` for storage flexibility.
pub struct Orchestrator<R: CheckpointRepository> {
    checkpoints: Arc<CheckpointManager<R>>,
    events: EventBus,
    config: OrchestratorConfig,
    error_hook: Option<Arc<dyn ErrorHook>>,
    /// Cancellation tokens keyed by run_id.
    runs: Arc<DashMap<Uuid, CancellationToken>>,
}

/// Where a run starts walking.
struct RunStart {
    ctx: ExecutionContext,
    stack: Vec<ControlFrame>,
    next: Vec<String>,
    sequence: u64,
    resumed: bool,
}

impl<R: CheckpointRepository + 'static> Orchestrator<R> {
    pub fn new(checkpoints: R, events: EventBus, config: OrchestratorConfig) -> Self {
        Self {
            checkpoints: Arc::new(CheckpointManager::new(checkpoints)),
            events,
            config,
            error_hook: None,
            runs: Arc::new(DashMap::new()),
        }
    }

    /// Capture hook run whenever an action fails (screenshot-on-error style).
    pub fn with_error_hook(mut self, hook: Arc<dyn ErrorHook>) -> Self {
        self.error_hook = Some(hook);
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn checkpoints(&self) -> &CheckpointManager<R> {
        &self.checkpoints
    }

    /// Cancel an in-flight run. Returns false if the run is not executing here.
    pub fn cancel(&self, run_id: &Uuid) -> bool {
        match self.runs.get(run_id) {
            Some(token) => {
                tracing::info!(run_id = %run_id, "cancelling run");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, run_id: &Uuid) -> bool {
        self.runs.contains_key(run_id)
    }

    /// Execute `graph` from its entry set. `variables` override the
    /// document's initial bindings.
    pub async fn execute(
        &self,
        graph: Arc<WorkflowGraph>,
        run_id: Uuid,
        variables: Map<String, Value>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, ExecutionError> {
        let mut initial = graph.document().variables.clone();
        initial.extend(variables);
        let start = RunStart {
            ctx: ExecutionContext::new(run_id, graph.name(), initial),
            stack: Vec::new(),
            next: graph.entry().to_vec(),
            sequence: 0,
            resumed: false,
        };
        self.run(graph, start, cancel).await
    }

    /// Resume `run_id` from its latest checkpoint in this orchestrator's store.
    pub async fn resume(
        &self,
        graph: Arc<WorkflowGraph>,
        run_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, ExecutionError> {
        let checkpoint = self.checkpoints.resume(run_id, &graph).await?;
        self.resume_from(graph, checkpoint, cancel).await
    }

    /// Resume from a checkpoint obtained elsewhere (e.g. shipped with a job
    /// assignment). The walk continues at the checkpointed node's successors.
    pub async fn resume_from(
        &self,
        graph: Arc<WorkflowGraph>,
        checkpoint: Checkpoint,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, ExecutionError> {
        super::checkpoint::verify(&checkpoint, &graph)?;
        let snapshot = checkpoint.snapshot;
        let start = RunStart {
            ctx: ExecutionContext::restore(checkpoint.run_id, graph.name(), &snapshot),
            stack: snapshot.control_stack,
            next: snapshot.next,
            sequence: checkpoint.sequence,
            resumed: true,
        };
        self.run(graph, start, cancel).await
    }

    async fn run(
        &self,
        graph: Arc<WorkflowGraph>,
        start: RunStart,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, ExecutionError> {
        let run_id = start.ctx.run_id;
        let token = cancel.child_token();
        if self.runs.insert(run_id, token.clone()).is_some() {
            return Err(ExecutionError::AlreadyRunning(run_id));
        }
        let _guard = RunGuard {
            runs: self.runs.clone(),
            run_id,
        };

        let settings = graph.document().settings.clone();
        let policy = settings
            .checkpoint_policy
            .unwrap_or(self.config.checkpoint_policy);
        let shared = Arc::new(RunShared {
            run_id,
            graph: graph.clone(),
            settings,
            policy,
            state: Mutex::new(start.ctx),
            outputs_ready: Notify::new(),
            checkpoints: self.checkpoints.clone(),
            events: self.events.clone(),
            config: self.config.clone(),
            error_hook: self.error_hook.clone(),
            sequence: AtomicU64::new(start.sequence),
        });

        tracing::info!(
            run_id = %run_id,
            workflow = %graph.name(),
            resumed = start.resumed,
            "run started"
        );
        self.events.emit(EventPayload::RunStarted {
            run_id,
            workflow_name: graph.name().to_string(),
            resumed: start.resumed,
        });

        let started = Instant::now();
        let root = Strand {
            stack: start.stack,
            fork_base: 0,
            is_root: true,
            joins: Vec::new(),
            cancel: token.clone(),
        };
        let walk = run_strand(shared.clone(), root, start.next);
        let end = match shared.settings.timeout {
            Some(secs) => {
                tokio::select! {
                    end = walk => end,
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                        token.cancel();
                        StrandEnd::TimedOut
                    }
                }
            }
            None => walk.await,
        };

        let status = match end {
            StrandEnd::Done | StrandEnd::Continue(_) | StrandEnd::Break(_) => RunStatus::Success,
            StrandEnd::Raise(failure) | StrandEnd::Fatal(failure) => {
                shared.with_ctx(|c| c.errors.push(failure));
                RunStatus::Failed
            }
            StrandEnd::Cancelled => RunStatus::Cancelled,
            StrandEnd::TimedOut => {
                let secs = shared.settings.timeout.unwrap_or_default();
                let cursor = shared.with_ctx(|c| c.cursor.clone()).unwrap_or_default();
                let failure = engine_failure(&cursor, TIMEOUT_ERROR, format!("run exceeded {secs}s"));
                shared.with_ctx(|c| c.errors.push(failure));
                RunStatus::TimedOut
            }
        };

        if let Err(e) = self.checkpoints.complete(run_id).await {
            tracing::warn!(run_id = %run_id, error = %e, "failed to clear checkpoints");
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let ctx = shared.with_ctx(|c| c.clone());
        match status {
            RunStatus::Success => {
                tracing::info!(run_id = %run_id, duration_ms, "run succeeded")
            }
            _ => tracing::warn!(
                run_id = %run_id,
                status = %status,
                duration_ms,
                error = ?ctx.errors.last().map(ToString::to_string),
                "run did not succeed"
            ),
        }
        self.events.emit(EventPayload::RunFinished {
            run_id,
            status,
            duration_ms,
        });

        Ok(RunOutcome {
            run_id,
            status,
            variables: ctx.variables,
            node_status: ctx.node_status,
            errors: ctx.errors,
            duration_ms,
        })
    }
}

/// Releases a run's registration on every exit path, including the run
/// future being dropped mid-flight.
struct RunGuard {
    runs: Arc<DashMap<Uuid, CancellationToken>>,
    run_id: Uuid,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.runs.remove(&self.run_id);
    }
}

// ---------------------------------------------------------------------------
// Strands
// ---------------------------------------------------------------------------

struct Strand {
    stack: Vec<ControlFrame>,
    /// Frames below this index belong to the parent strand.
    fork_base: usize,
    /// Only the root strand writes checkpoints.
    is_root: bool,
    /// Join nodes of enclosing forks; the parent runs them after the join.
    joins: Vec<String>,
    cancel: CancellationToken,
}

impl Strand {
    fn innermost_loop(&self) -> Option<String> {
        self.stack
            .iter()
            .rev()
            .find_map(|f| f.loop_start().map(str::to_string))
    }

    fn loop_frame(&self, start: &str) -> Option<usize> {
        self.stack.iter().rposition(|f| f.loop_start() == Some(start))
    }
}

/// How a strand finished.
enum StrandEnd {
    Done,
    Raise(NodeFailure),
    /// Unrecoverable (loop ceiling, checkpoint write failure).
    Fatal(NodeFailure),
    /// Loop continue targeting a frame owned by the parent.
    Continue(String),
    /// Loop break targeting a frame owned by the parent.
    Break(String),
    Cancelled,
    TimedOut,
}

/// What the strand does next.
enum Signal {
    Next(Vec<String>),
    PathEnd,
    Raise(NodeFailure),
    LoopBack(String),
    Break(String),
    End(StrandEnd),
}

fn run_strand<R: CheckpointRepository + 'static>(
    shared: Arc<RunShared<R>>,
    mut strand: Strand,
    start: Vec<String>,
) -> BoxFuture<'static, StrandEnd> {
    Box::pin(async move {
        let mut signal = Signal::Next(start);
        loop {
            if strand.cancel.is_cancelled() {
                return StrandEnd::Cancelled;
            }
            signal = match signal {
                Signal::Next(mut nodes) => {
                    nodes.retain(|n| !strand.joins.contains(n));
                    match nodes.len() {
                    0 => Signal::PathEnd,
                    1 => {
                        let node = nodes.remove(0);
                        shared.step(&mut strand, &node).await
                    }
                    _ => fork(&shared, &mut strand, nodes).await,
                    }
                }
                Signal::PathEnd => shared.path_end(&mut strand).await,
                Signal::Raise(failure) => shared.raise(&mut strand, failure).await,
                Signal::LoopBack(start) => shared.loop_back(&mut strand, &start).await,
                Signal::Break(start) => shared.break_loop(&mut strand, &start).await,
                Signal::End(end) => return end,
            };
        }
    })
}

/// Run each successor as its own strand and join them.
async fn fork<R: CheckpointRepository + 'static>(
    shared: &Arc<RunShared<R>>,
    strand: &mut Strand,
    nodes: Vec<String>,
) -> Signal {
    let group = strand.cancel.child_token();
    let cancel_siblings = shared
        .settings
        .parallel_failure
        .cancels_siblings(shared.settings.stop_on_error);
    let join = shared.graph.join_point(&nodes, &strand.joins);
    tracing::debug!(
        run_id = %shared.run_id,
        branches = ?nodes,
        join = ?join,
        cancel_siblings,
        "forking parallel branches"
    );

    let mut joins = strand.joins.clone();
    joins.extend(join.clone());
    let mut set = JoinSet::new();
    for node in nodes {
        let child = Strand {
            stack: strand.stack.clone(),
            fork_base: strand.stack.len(),
            is_root: false,
            joins: joins.clone(),
            cancel: group.clone(),
        };
        set.spawn(run_strand(shared.clone(), child, vec![node]));
    }

    let mut ends = Vec::new();
    while let Some(joined) = set.join_next().await {
        let end = joined.unwrap_or_else(|e| {
            StrandEnd::Fatal(engine_failure("", "PanicError", format!("branch task failed: {e}")))
        });
        match &end {
            StrandEnd::Fatal(_) => group.cancel(),
            StrandEnd::Raise(_) if cancel_siblings => group.cancel(),
            _ => {}
        }
        ends.push(end);
    }

    if strand.cancel.is_cancelled() {
        return Signal::End(StrandEnd::Cancelled);
    }

    let mut failures = Vec::new();
    let mut brk = None;
    let mut cont = None;
    for end in ends {
        match end {
            StrandEnd::Fatal(f) => return Signal::End(StrandEnd::Fatal(f)),
            StrandEnd::Raise(f) => failures.push(f),
            StrandEnd::Break(start) => brk = Some(start),
            StrandEnd::Continue(start) => cont = Some(start),
            StrandEnd::Done | StrandEnd::Cancelled | StrandEnd::TimedOut => {}
        }
    }
    if let Some(failure) = aggregate(failures) {
        return Signal::Raise(failure);
    }
    match (brk, cont, join) {
        (Some(start), _, _) => Signal::Break(start),
        (None, Some(start), _) => Signal::LoopBack(start),
        (None, None, Some(join)) => Signal::Next(vec![join]),
        (None, None, None) => Signal::PathEnd,
    }
}

/// First branch failure, carrying every branch failure in its details.
fn aggregate(mut failures: Vec<NodeFailure>) -> Option<NodeFailure> {
    if failures.len() <= 1 {
        return failures.pop();
    }
    let all = serde_json::to_value(&failures).unwrap_or(Value::Null);
    let mut first = failures.swap_remove(0);
    first.details = Some(json!({ "branch_errors": all }));
    Some(first)
}

// ---------------------------------------------------------------------------
// Run state shared by all strands of one run
// ---------------------------------------------------------------------------

struct RunShared<R: CheckpointRepository> {
    run_id: Uuid,
    graph: Arc<WorkflowGraph>,
    settings: WorkflowSettings,
    policy: CheckpointPolicy,
    state: Mutex<ExecutionContext>,
    /// Signalled whenever outputs are recorded or a node reaches a terminal status.
    outputs_ready: Notify,
    checkpoints: Arc<CheckpointManager<R>>,
    events: EventBus,
    config: OrchestratorConfig,
    error_hook: Option<Arc<dyn ErrorHook>>,
    sequence: AtomicU64,
}

enum Handler {
    Catch(String),
    Finally(String),
}

impl<R: CheckpointRepository + 'static> RunShared<R> {
    fn with_ctx<T>(&self, f: impl FnOnce(&mut ExecutionContext) -> T) -> T {
        match self.state.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn node_timeout(&self, node: &GraphNode) -> Duration {
        node.options
            .timeout
            .unwrap_or(Duration::from_secs(self.config.default_node_timeout_secs))
    }

    fn set_status(&self, node_id: &str, status: NodeStatus) {
        self.with_ctx(|c| c.set_status(node_id, status));
        if status.is_terminal() {
            self.outputs_ready.notify_waiters();
        }
    }

    /// Successor node ids of the given execution ports, in port order.
    fn fire(&self, node_id: &str, ports: &[&str]) -> Vec<String> {
        ports
            .iter()
            .flat_map(|port| self.graph.successors(node_id, port))
            .map(|edge| edge.node.clone())
            .collect()
    }

    fn start_node(&self, node: &GraphNode) {
        self.with_ctx(|c| {
            c.set_status(&node.id, NodeStatus::Running);
            c.cursor = Some(node.id.clone());
        });
        tracing::debug!(run_id = %self.run_id, node_id = %node.id, node_type = %node.node_type, "node started");
        self.events.emit(EventPayload::NodeStarted {
            run_id: self.run_id,
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
        });
    }

    fn skip_node(&self, node_id: &str) {
        self.set_status(node_id, NodeStatus::Skipped);
        self.events.emit(EventPayload::NodeSkipped {
            run_id: self.run_id,
            node_id: node_id.to_string(),
        });
    }

    /// Mark success without checkpointing (loop ends, break, continue).
    fn finish_node(&self, node: &GraphNode, started: Instant) {
        self.set_status(&node.id, NodeStatus::Success);
        self.events.emit(EventPayload::NodeCompleted {
            run_id: self.run_id,
            node_id: node.id.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
        });
    }

    /// Mark success, checkpoint, then continue at `next`.
    async fn complete(
        &self,
        strand: &Strand,
        node: &GraphNode,
        started: Instant,
        next: Vec<String>,
    ) -> Signal {
        self.finish_node(node, started);
        if let Err(failure) = self.checkpoint(strand, node, &next).await {
            return Signal::End(StrandEnd::Fatal(failure));
        }
        Signal::Next(next)
    }

    async fn checkpoint(
        &self,
        strand: &Strand,
        node: &GraphNode,
        next: &[String],
    ) -> Result<(), NodeFailure> {
        let wanted = match self.policy {
            CheckpointPolicy::EveryNode => true,
            CheckpointPolicy::Boundaries => node.options.checkpoint,
            CheckpointPolicy::None => false,
        };
        if !strand.is_root || !wanted {
            return Ok(());
        }
        let snapshot = self.with_ctx(|c| c.snapshot(&strand.stack, next.to_vec()));
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.checkpoints
            .checkpoint(self.run_id, &node.id, sequence, self.graph.fingerprint(), snapshot)
            .await
            .map(|_| ())
            .map_err(|e| engine_failure(&node.id, CHECKPOINT_ERROR, e.to_string()))
    }

    /// Record a node failure and raise it.
    fn fail(&self, strand: &Strand, node: &GraphNode, failure: NodeFailure) -> Signal {
        if failure.error_type == CANCELLED_ERROR && strand.cancel.is_cancelled() {
            self.skip_node(&node.id);
            return Signal::End(StrandEnd::Cancelled);
        }
        self.set_status(&node.id, NodeStatus::Failed);
        tracing::warn!(
            run_id = %self.run_id,
            node_id = %node.id,
            error_type = %failure.error_type,
            error = %failure.message,
            attempts = failure.attempts,
            "node failed"
        );
        self.events.emit(EventPayload::NodeError {
            run_id: self.run_id,
            node_id: node.id.clone(),
            error_type: failure.error_type.clone(),
            message: failure.message.clone(),
            attempt: failure.attempts,
            will_retry: false,
        });
        Signal::Raise(failure)
    }

    fn fatal(&self, strand: &Strand, node: &GraphNode, error_type: &str, message: String) -> Signal {
        match self.fail(strand, node, engine_failure(&node.id, error_type, message)) {
            Signal::Raise(failure) => Signal::End(StrandEnd::Fatal(failure)),
            other => other,
        }
    }

    // -----------------------------------------------------------------------
    // Node dispatch
    // -----------------------------------------------------------------------

    async fn step(&self, strand: &mut Strand, node_id: &str) -> Signal {
        let graph = self.graph.clone();
        let Some(node) = graph.node(node_id) else {
            return Signal::End(StrandEnd::Fatal(engine_failure(
                node_id,
                CONFIG_ERROR,
                format!("unknown node '{node_id}'"),
            )));
        };

        if node.options.disabled {
            self.skip_node(node_id);
            let next = if node.ports.exec_outputs.iter().any(|p| p == EXEC_OUT) {
                self.fire(node_id, &[EXEC_OUT])
            } else {
                Vec::new()
            };
            return Signal::Next(next);
        }

        // Re-entering a loop start whose frame is active means "next iteration".
        if node.kind.is_loop_start() && strand.loop_frame(node_id).is_some() {
            return Signal::LoopBack(node_id.to_string());
        }

        let started = Instant::now();
        self.start_node(node);

        match &node.kind {
            NodeKind::Start => {
                let next = self.fire(node_id, &[EXEC_OUT]);
                self.complete(strand, node, started, next).await
            }
            NodeKind::End => self.complete(strand, node, started, Vec::new()).await,
            NodeKind::If { condition } => {
                match self.evaluate_condition(strand, node, condition.as_deref()).await {
                    Ok(result) => {
                        let (taken, other) = if result {
                            (PORT_TRUE, PORT_FALSE)
                        } else {
                            (PORT_FALSE, PORT_TRUE)
                        };
                        for edge in self.graph.successors(node_id, other) {
                            if self.with_ctx(|c| c.status(&edge.node)) == NodeStatus::Pending {
                                self.skip_node(&edge.node);
                            }
                        }
                        let next = self.fire(node_id, &[taken]);
                        self.complete(strand, node, started, next).await
                    }
                    Err(failure) => self.fail(strand, node, failure),
                }
            }
            NodeKind::ForLoopStart {
                item_var,
                index_var,
                max_iterations,
            } => {
                let items = match self.loop_items(strand, node).await {
                    Ok(items) => items,
                    Err(failure) => return self.fail(strand, node, failure),
                };
                let ceiling = max_iterations
                    .unwrap_or(self.config.max_for_iterations)
                    .min(self.config.max_for_iterations);
                if items.len() > ceiling {
                    return self.fatal(
                        strand,
                        node,
                        LOOP_LIMIT_ERROR,
                        format!("for-loop over {} items exceeds the ceiling of {ceiling}", items.len()),
                    );
                }
                strand.stack.push(ControlFrame::ForLoop {
                    start: node_id.to_string(),
                    items,
                    index: 0,
                    item_var: item_var.clone(),
                    index_var: index_var.clone(),
                });
                self.iterate(strand, node, started).await
            }
            NodeKind::WhileLoopStart { max_iterations, .. } => {
                let ceiling = max_iterations
                    .unwrap_or(self.config.max_while_iterations)
                    .min(self.config.max_while_iterations);
                strand.stack.push(ControlFrame::WhileLoop {
                    start: node_id.to_string(),
                    iteration: 0,
                    max_iterations: ceiling,
                });
                self.iterate(strand, node, started).await
            }
            NodeKind::ForLoopEnd { loop_start } | NodeKind::WhileLoopEnd { loop_start } => {
                self.finish_node(node, started);
                match loop_start.clone().or_else(|| strand.innermost_loop()) {
                    Some(start) => Signal::LoopBack(start),
                    None => Signal::PathEnd,
                }
            }
            NodeKind::Continue => {
                self.finish_node(node, started);
                strand.innermost_loop().map_or(Signal::PathEnd, Signal::LoopBack)
            }
            NodeKind::Break => {
                self.finish_node(node, started);
                strand.innermost_loop().map_or(Signal::PathEnd, Signal::Break)
            }
            NodeKind::Try => {
                let handlers = self.graph.try_handlers(node_id).cloned().unwrap_or_default();
                strand.stack.push(ControlFrame::Try {
                    try_node: node_id.to_string(),
                    catch_node: handlers.catch,
                    finally_node: handlers.finally,
                    phase: TryPhase::Body,
                });
                let next = self.fire(node_id, &[PORT_TRY_BODY]);
                self.complete(strand, node, started, next).await
            }
            // Only ever entered through their Try's pairing edge.
            NodeKind::Catch | NodeKind::Finally => {
                self.finish_node(node, started);
                Signal::PathEnd
            }
            NodeKind::Action(handler) => self.run_action(strand, node, handler.clone(), started).await,
        }
    }

    async fn run_action(
        &self,
        strand: &Strand,
        node: &GraphNode,
        handler: SharedAction,
        started: Instant,
    ) -> Signal {
        let inputs = match self.collect_inputs(strand, node).await {
            Ok(inputs) => inputs,
            Err(failure) => return self.fail(strand, node, failure),
        };
        let (config, variables) =
            self.with_ctx(|c| (c.resolve_config(&node.config), c.variables.clone()));
        let input = ActionInput {
            run_id: self.run_id,
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
            config,
            inputs,
            variables,
            attempt: 1,
            cancel: strand.cancel.clone(),
        };

        match self.invoke(node, handler, input).await {
            Ok(output) => {
                let ports = output
                    .fire
                    .clone()
                    .unwrap_or_else(|| node.ports.exec_outputs.clone());
                self.with_ctx(|c| {
                    c.variables.extend(output.variables);
                    for (port, value) in output.outputs {
                        c.set_output(&node.id, &port, value);
                    }
                });
                self.outputs_ready.notify_waiters();
                let ports: Vec<&str> = ports.iter().map(String::as_str).collect();
                let next = self.fire(&node.id, &ports);
                self.complete(strand, node, started, next).await
            }
            Err(err) => {
                let failure = err.into_failure(&node.id);
                self.fail(strand, node, failure)
            }
        }
    }

    /// Compose the middleware stack around `handler` and run it.
    async fn invoke(
        &self,
        node: &GraphNode,
        handler: SharedAction,
        input: ActionInput,
    ) -> Result<crate::action::ActionOutput, crate::action::ActionError> {
        let base = node
            .options
            .retry_backoff
            .unwrap_or(Duration::from_millis(self.config.retry_backoff_ms));
        let policy = RetryPolicy::new(
            node.options.retry_count.unwrap_or(self.settings.retry_count),
            base,
            Duration::from_millis(self.config.max_retry_backoff_ms).max(base),
        );
        let inner: SharedAction = match &self.error_hook {
            Some(hook) => Arc::new(OnError::new(handler, hook.clone())),
            None => handler,
        };

        let events = self.events.clone();
        let run_id = self.run_id;
        let node_id = node.id.clone();
        let observer: RetryObserver = Arc::new(move |err, attempt| {
            events.emit(EventPayload::NodeError {
                run_id,
                node_id: node_id.clone(),
                error_type: err.error_type.clone(),
                message: err.message.clone(),
                attempt,
                will_retry: true,
            });
        });

        let layered = Retrying::new(Deadline::new(inner, self.node_timeout(node)), policy).observe(observer);
        layered.execute(input).await
    }

    // -----------------------------------------------------------------------
    // Data inputs
    // -----------------------------------------------------------------------

    async fn collect_inputs(
        &self,
        strand: &Strand,
        node: &GraphNode,
    ) -> Result<Map<String, Value>, NodeFailure> {
        let mut inputs = Map::new();
        for (port, source) in self.graph.data_inputs(&node.id) {
            let value = self.await_input(strand, node, source).await?;
            inputs.insert(port.to_string(), value);
        }
        Ok(inputs)
    }

    /// Value of `source` for `consumer`: evaluated on demand for pure data
    /// nodes, otherwise awaited until the producer has run.
    async fn await_input(
        &self,
        strand: &Strand,
        consumer: &GraphNode,
        source: &PortRef,
    ) -> Result<Value, NodeFailure> {
        if let Some(producer) = self.graph.node(&source.node).filter(|n| n.is_pure()) {
            let outputs = self.evaluate_pure(strand, producer).await?;
            return Ok(outputs.get(&source.port).cloned().unwrap_or(Value::Null));
        }

        let wait = self.node_timeout(consumer);
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.outputs_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let ready = self.with_ctx(|c| match c.output(&source.node, &source.port) {
                Some(value) => Some(value.clone()),
                // Producer finished without emitting this port.
                None if c.status(&source.node).is_terminal() => Some(Value::Null),
                None => None,
            });
            if let Some(value) = ready {
                return Ok(value);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(engine_failure(
                        &consumer.id,
                        TIMEOUT_ERROR,
                        format!(
                            "timed out after {}ms waiting for {}.{}",
                            wait.as_millis(),
                            source.node,
                            source.port
                        ),
                    ));
                }
                _ = strand.cancel.cancelled() => {
                    return Err(engine_failure(&consumer.id, CANCELLED_ERROR, "run cancelled".into()));
                }
            }
        }
    }

    fn evaluate_pure<'a>(
        &'a self,
        strand: &'a Strand,
        node: &'a GraphNode,
    ) -> BoxFuture<'a, Result<Map<String, Value>, NodeFailure>> {
        Box::pin(async move {
            let NodeKind::Action(handler) = &node.kind else {
                return Ok(Map::new());
            };
            let inputs = self.collect_inputs(strand, node).await?;
            let (config, variables) =
                self.with_ctx(|c| (c.resolve_config(&node.config), c.variables.clone()));
            let input = ActionInput {
                run_id: self.run_id,
                node_id: node.id.clone(),
                node_type: node.node_type.clone(),
                config,
                inputs,
                variables,
                attempt: 1,
                cancel: strand.cancel.clone(),
            };
            let output = Deadline::new(handler.clone(), self.node_timeout(node))
                .execute(input)
                .await
                .map_err(|e| e.into_failure(&node.id))?;
            self.with_ctx(|c| {
                c.set_status(&node.id, NodeStatus::Success);
                for (port, value) in &output.outputs {
                    c.set_output(&node.id, port, value.clone());
                }
            });
            Ok(output.outputs)
        })
    }

    async fn evaluate_condition(
        &self,
        strand: &Strand,
        node: &GraphNode,
        expression: Option<&str>,
    ) -> Result<bool, NodeFailure> {
        if let Some(source) = self.graph.data_source(&node.id, "condition") {
            let value = self.await_input(strand, node, source).await?;
            return Ok(truthy(&value));
        }
        let Some(expression) = expression else {
            return Err(engine_failure(
                &node.id,
                CONFIG_ERROR,
                "no 'condition' expression or connected condition input".into(),
            ));
        };
        let variables = self.with_ctx(|c| c.variables.clone());
        evaluate_expression(expression, &variables)
            .map_err(|e| engine_failure(&node.id, EXPRESSION_ERROR, e.to_string()))
    }

    /// Collection a for-loop walks: the `items` input, or config `items`,
    /// `range {start, end, step}` or `count`.
    async fn loop_items(&self, strand: &Strand, node: &GraphNode) -> Result<LoopItems, NodeFailure> {
        let invalid = |msg: String| engine_failure(&node.id, CONFIG_ERROR, msg);
        let items = match self.graph.data_source(&node.id, "items") {
            Some(source) => Some(self.await_input(strand, node, source).await?),
            None => {
                let config = self.with_ctx(|c| c.resolve_config(&node.config));
                if let Some(range) = config.get("range") {
                    let field = |k: &str| range.get(k).and_then(Value::as_i64);
                    let end = field("end").ok_or_else(|| invalid("range needs an integer 'end'".into()))?;
                    let step = field("step").unwrap_or(1);
                    if step == 0 {
                        return Err(invalid("range step must not be 0".into()));
                    }
                    return Ok(LoopItems::Range {
                        start: field("start").unwrap_or(0),
                        end,
                        step,
                    });
                }
                if let Some(count) = config.get("count") {
                    let count = count
                        .as_i64()
                        .ok_or_else(|| invalid(format!("count must be an integer, got {count}")))?;
                    return Ok(LoopItems::Range {
                        start: 0,
                        end: count.max(0),
                        step: 1,
                    });
                }
                config.get("items").cloned()
            }
        };
        match items {
            Some(Value::Array(values)) => Ok(LoopItems::List { values }),
            Some(Value::Object(map)) => Ok(LoopItems::List {
                values: map
                    .into_iter()
                    .map(|(key, value)| json!({ "key": key, "value": value }))
                    .collect(),
            }),
            Some(Value::Null) | None => Err(invalid("for-loop has no items, range or count".into())),
            Some(other) => Err(invalid(format!("cannot iterate over {other}"))),
        }
    }

    // -----------------------------------------------------------------------
    // Loops
    // -----------------------------------------------------------------------

    /// Decide the current iteration of the loop frame on top of the stack.
    async fn iterate(&self, strand: &mut Strand, node: &GraphNode, started: Instant) -> Signal {
        if let NodeKind::WhileLoopStart { condition, .. } = &node.kind {
            let go = match self.evaluate_condition(strand, node, condition.as_deref()).await {
                Ok(go) => go,
                Err(failure) => {
                    strand.stack.pop();
                    return self.fail(strand, node, failure);
                }
            };
            if !go {
                strand.stack.pop();
                let next = self.fire(&node.id, &[PORT_COMPLETED]);
                return self.complete(strand, node, started, next).await;
            }
            let Some(ControlFrame::WhileLoop {
                iteration,
                max_iterations,
                ..
            }) = strand.stack.last_mut()
            else {
                return Signal::PathEnd;
            };
            *iteration += 1;
            let (current, max) = (*iteration, *max_iterations);
            if current > max {
                strand.stack.pop();
                return self.fatal(
                    strand,
                    node,
                    LOOP_LIMIT_ERROR,
                    format!("while-loop '{}' exceeded {max} iterations", node.id),
                );
            }
            self.with_ctx(|c| c.set_output(&node.id, "iteration", json!(current - 1)));
            self.outputs_ready.notify_waiters();
            let next = self.fire(&node.id, &[PORT_BODY]);
            return self.complete(strand, node, started, next).await;
        }

        let Some(ControlFrame::ForLoop {
            items,
            index,
            item_var,
            index_var,
            ..
        }) = strand.stack.last()
        else {
            return Signal::PathEnd;
        };
        match items.get(*index) {
            Some(item) => {
                let (index, item_var, index_var) = (*index, item_var.clone(), index_var.clone());
                self.with_ctx(|c| {
                    c.variables.insert(item_var, item.clone());
                    c.variables.insert(index_var, json!(index));
                    c.set_output(&node.id, super::node::DEFAULT_ITEM_VAR, item);
                    c.set_output(&node.id, super::node::DEFAULT_INDEX_VAR, json!(index));
                });
                self.outputs_ready.notify_waiters();
                let next = self.fire(&node.id, &[PORT_BODY]);
                self.complete(strand, node, started, next).await
            }
            None => {
                strand.stack.pop();
                let next = self.fire(&node.id, &[PORT_COMPLETED]);
                self.complete(strand, node, started, next).await
            }
        }
    }

    /// Jump back to loop `start` for its next iteration.
    async fn loop_back(&self, strand: &mut Strand, start: &str) -> Signal {
        let Some(idx) = strand.loop_frame(start) else {
            return Signal::PathEnd;
        };
        let jump = LoopJump::Continue {
            loop_start: start.to_string(),
        };
        if let Some(signal) = self.unwind_to(strand, idx + 1, jump).await {
            return signal;
        }
        if idx < strand.fork_base {
            return Signal::End(StrandEnd::Continue(start.to_string()));
        }
        strand.stack.truncate(idx + 1);
        if let Some(ControlFrame::ForLoop { index, .. }) = strand.stack.last_mut() {
            *index += 1;
        }
        let graph = self.graph.clone();
        let Some(node) = graph.node(start) else {
            return Signal::PathEnd;
        };
        let started = Instant::now();
        self.start_node(node);
        self.iterate(strand, node, started).await
    }

    /// Leave loop `start` through its `completed` port.
    async fn break_loop(&self, strand: &mut Strand, start: &str) -> Signal {
        let Some(idx) = strand.loop_frame(start) else {
            return Signal::PathEnd;
        };
        let jump = LoopJump::Break {
            loop_start: start.to_string(),
        };
        if let Some(signal) = self.unwind_to(strand, idx + 1, jump).await {
            return signal;
        }
        if idx < strand.fork_base {
            return Signal::End(StrandEnd::Break(start.to_string()));
        }
        strand.stack.truncate(idx);
        tracing::debug!(run_id = %self.run_id, loop_start = start, "loop break");
        Signal::Next(self.fire(start, &[PORT_COMPLETED]))
    }

    /// Run the innermost pending `finally` between the top of the stack and
    /// `floor` before a loop jump leaves it. The jump is replayed when that
    /// `finally` ends, so outer regions unwind one at a time.
    async fn unwind_to(&self, strand: &mut Strand, floor: usize, jump: LoopJump) -> Option<Signal> {
        let floor = floor.max(strand.fork_base);
        let (idx, finally, had_error) = (floor..strand.stack.len()).rev().find_map(|idx| {
            match &strand.stack[idx] {
                ControlFrame::Try {
                    finally_node: Some(finally),
                    phase,
                    ..
                } => match phase {
                    TryPhase::Body => Some((idx, finally.clone(), false)),
                    TryPhase::Catch { .. } => Some((idx, finally.clone(), true)),
                    TryPhase::Finally { .. } => None,
                },
                _ => None,
            }
        })?;

        strand.stack.truncate(idx + 1);
        if let Some(ControlFrame::Try { phase, .. }) = strand.stack.last_mut() {
            *phase = TryPhase::Finally {
                had_error,
                pending: None,
                jump: Some(jump),
            };
        }
        tracing::debug!(run_id = %self.run_id, finally_node = %finally, "running finally before loop jump");
        Some(self.enter_finally(strand, &finally, had_error).await)
    }

    // -----------------------------------------------------------------------
    // Exception regions
    // -----------------------------------------------------------------------

    /// The current path has no more nodes: close the innermost region.
    async fn path_end(&self, strand: &mut Strand) -> Signal {
        if strand.stack.len() <= strand.fork_base {
            return Signal::End(StrandEnd::Done);
        }
        let Some(top) = strand.stack.last_mut() else {
            return Signal::End(StrandEnd::Done);
        };
        let (try_node, finally_node, phase) = match top {
            ControlFrame::ForLoop { start, .. } | ControlFrame::WhileLoop { start, .. } => {
                return Signal::LoopBack(start.clone());
            }
            ControlFrame::Try {
                try_node,
                finally_node,
                phase,
                ..
            } => (try_node.clone(), finally_node.clone(), phase),
        };

        let had_error = match phase {
            TryPhase::Body => false,
            TryPhase::Catch { .. } => true,
            TryPhase::Finally { pending, jump, .. } => {
                let (pending, jump) = (pending.take(), jump.take());
                strand.stack.pop();
                return match (pending, jump) {
                    (Some(failure), _) => Signal::Raise(failure),
                    (None, Some(LoopJump::Continue { loop_start })) => Signal::LoopBack(loop_start),
                    (None, Some(LoopJump::Break { loop_start })) => Signal::Break(loop_start),
                    (None, None) => Signal::Next(self.fire(&try_node, &[EXEC_OUT])),
                };
            }
        };
        if let Some(finally) = finally_node {
            *phase = TryPhase::Finally {
                had_error,
                pending: None,
                jump: None,
            };
            return self.enter_finally(strand, &finally, had_error).await;
        }
        strand.stack.pop();
        Signal::Next(self.fire(&try_node, &[EXEC_OUT]))
    }

    /// Route a raised error to the nearest handler on this strand.
    async fn raise(&self, strand: &mut Strand, failure: NodeFailure) -> Signal {
        let mut found = None;
        for idx in (strand.fork_base..strand.stack.len()).rev() {
            let handler = match &strand.stack[idx] {
                ControlFrame::Try {
                    catch_node: Some(catch),
                    phase: TryPhase::Body,
                    ..
                } => Some(Handler::Catch(catch.clone())),
                ControlFrame::Try {
                    finally_node: Some(finally),
                    phase: TryPhase::Body | TryPhase::Catch { .. },
                    ..
                } => Some(Handler::Finally(finally.clone())),
                _ => None,
            };
            if let Some(handler) = handler {
                found = Some((idx, handler));
                break;
            }
        }

        let Some((idx, handler)) = found else {
            if !strand.is_root || self.settings.stop_on_error {
                return Signal::End(StrandEnd::Raise(failure));
            }
            tracing::warn!(
                run_id = %self.run_id,
                node_id = %failure.node_id,
                error = %failure.message,
                "uncaught error recorded, continuing (stop_on_error = false)"
            );
            self.with_ctx(|c| c.errors.push(failure));
            return Signal::PathEnd;
        };

        strand.stack.truncate(idx + 1);
        let Some(ControlFrame::Try { phase, .. }) = strand.stack.last_mut() else {
            return Signal::End(StrandEnd::Raise(failure));
        };
        match handler {
            Handler::Catch(catch) => {
                *phase = TryPhase::Catch {
                    error: failure.clone(),
                };
                self.enter_catch(strand, &catch, &failure).await
            }
            Handler::Finally(finally) => {
                *phase = TryPhase::Finally {
                    had_error: true,
                    pending: Some(failure),
                    jump: None,
                };
                self.enter_finally(strand, &finally, true).await
            }
        }
    }

    async fn enter_catch(&self, strand: &Strand, catch_id: &str, failure: &NodeFailure) -> Signal {
        let graph = self.graph.clone();
        let Some(node) = graph.node(catch_id) else {
            return Signal::End(StrandEnd::Raise(failure.clone()));
        };
        let started = Instant::now();
        self.start_node(node);
        self.with_ctx(|c| {
            for (key, value) in [
                ("error_message", json!(failure.message)),
                ("error_type", json!(failure.error_type)),
                ("stack_trace", json!(failure.stack_trace)),
            ] {
                c.variables.insert(key.to_string(), value.clone());
                c.set_output(catch_id, key, value);
            }
        });
        self.outputs_ready.notify_waiters();
        let next = self.fire(catch_id, &[PORT_CATCH_BODY]);
        self.complete(strand, node, started, next).await
    }

    async fn enter_finally(&self, strand: &Strand, finally_id: &str, had_error: bool) -> Signal {
        let graph = self.graph.clone();
        let Some(node) = graph.node(finally_id) else {
            return Signal::PathEnd;
        };
        let started = Instant::now();
        self.start_node(node);
        self.with_ctx(|c| {
            c.variables.insert("had_error".to_string(), json!(had_error));
            c.set_output(finally_id, "had_error", json!(had_error));
        });
        self.outputs_ready.notify_waiters();
        let next = self.fire(finally_id, &[PORT_FINALLY_BODY]);
        self.complete(strand, node, started, next).await
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn engine_failure(node_id: &str, error_type: &str, message: String) -> NodeFailure {
    NodeFailure {
        node_id: node_id.to_string(),
        error_type: error_type.to_string(),
        message,
        stack_trace: format!("at node '{node_id}'"),
        attempts: 1,
        details: None,
    }
}

/// Kept synchronous so the evaluator never lives across an await point.
fn evaluate_expression(
    expression: &str,
    variables: &Map<String, Value>,
) -> Result<bool, ExpressionError> {
    ConditionEvaluator::new().evaluate_bool(expression, variables)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
