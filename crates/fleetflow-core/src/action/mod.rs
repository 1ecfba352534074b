//! Action units: the single interface every non-control node executes through.
//!
//! An action is an opaque unit that receives an [`ActionInput`] (resolved
//! config, data-port values, a variable snapshot and a cancellation token)
//! and asynchronously produces an [`ActionOutput`] or a typed [`ActionError`].
//!
//! Shared behavior (retry, timeout/cancellation, error capture, circuit
//! breaking) is layered around the interface in [`layer`], never inherited.
//!
//! [`ActionHandler`] uses RPITIT like all async traits in this project, so it
//! is not object safe. [`ActionHandlerDyn`] is the boxed-future twin with a
//! blanket impl, and [`SharedAction`] is what the registry and graph store.

pub mod builtin;
pub mod circuit;
pub mod layer;
pub mod registry;
pub mod retry;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use fleetflow_types::run::NodeFailure;
use fleetflow_types::workflow::DataType;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use registry::ActionRegistry;

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// Port declaration of an action handler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionPorts {
    /// Whether the node has an `exec_in` port. False for pure data nodes.
    pub exec_in: bool,
    pub exec_outputs: Vec<String>,
    pub data_inputs: Vec<(String, DataType)>,
    pub data_outputs: Vec<(String, DataType)>,
}

impl ActionPorts {
    /// `exec_in` -> `exec_out`, no data ports.
    pub fn flow() -> Self {
        Self {
            exec_in: true,
            exec_outputs: vec![EXEC_OUT.to_string()],
            ..Self::default()
        }
    }

    /// Data-only node, evaluated when a consumer pulls its outputs.
    pub fn pure() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, name: &str, data_type: DataType) -> Self {
        self.data_inputs.push((name.to_string(), data_type));
        self
    }

    pub fn with_output(mut self, name: &str, data_type: DataType) -> Self {
        self.data_outputs.push((name.to_string(), data_type));
        self
    }

    pub fn with_exec_output(mut self, name: &str) -> Self {
        self.exec_outputs.push(name.to_string());
        self
    }

    pub fn is_pure(&self) -> bool {
        !self.exec_in && self.exec_outputs.is_empty()
    }
}

pub const EXEC_IN: &str = "exec_in";
pub const EXEC_OUT: &str = "exec_out";

// ---------------------------------------------------------------------------
// Input / output
// ---------------------------------------------------------------------------

/// Everything an action sees when invoked.
#[derive(Debug, Clone)]
pub struct ActionInput {
    pub run_id: Uuid,
    pub node_id: String,
    pub node_type: String,
    /// Node config with templates already resolved.
    pub config: Map<String, Value>,
    /// Values of connected data inputs.
    pub inputs: Map<String, Value>,
    /// Snapshot of run variables at invocation time.
    pub variables: Map<String, Value>,
    /// 1-based attempt number, set by the retry layer.
    pub attempt: u32,
    pub cancel: CancellationToken,
}

impl ActionInput {
    /// A data input if connected, else the config entry of the same name.
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name).or_else(|| self.config.get(name))
    }

    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.param(name).and_then(Value::as_str)
    }

    /// Required string parameter.
    pub fn require_str(&self, name: &str) -> Result<&str, ActionError> {
        self.param_str(name).ok_or_else(|| {
            ActionError::invalid_config(format!("missing string parameter '{name}'"))
        })
    }
}

/// What an action produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionOutput {
    /// Data-port values, materialized into the execution context.
    pub outputs: Map<String, Value>,
    /// Variable assignments applied to the run after the node completes.
    pub variables: Map<String, Value>,
    /// Execution outputs to fire. `None` fires every declared exec output.
    pub fire: Option<Vec<String>>,
}

impl ActionOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, port: &str, value: Value) -> Self {
        self.outputs.insert(port.to_string(), value);
        self
    }

    pub fn with_variable(mut self, name: &str, value: Value) -> Self {
        self.variables.insert(name.to_string(), value);
        self
    }

    pub fn firing(mut self, port: &str) -> Self {
        self.fire.get_or_insert_with(Vec::new).push(port.to_string());
        self
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

pub const NODE_EXECUTION_ERROR: &str = "NodeExecutionError";
pub const TIMEOUT_ERROR: &str = "TimeoutError";
pub const CANCELLED_ERROR: &str = "Cancelled";
pub const CONFIG_ERROR: &str = "ConfigError";
pub const CIRCUIT_OPEN_ERROR: &str = "CircuitOpenError";

/// Typed failure returned by an action unit.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{error_type}: {message}")]
pub struct ActionError {
    pub error_type: String,
    pub message: String,
    pub retryable: bool,
    pub stack_trace: Option<String>,
    pub details: Option<Value>,
    /// Attempts made, filled in by the retry layer.
    pub attempts: u32,
}

impl ActionError {
    /// A retryable `NodeExecutionError`.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error_type: NODE_EXECUTION_ERROR.to_string(),
            message: message.into(),
            retryable: true,
            stack_trace: None,
            details: None,
            attempts: 1,
        }
    }

    pub fn typed(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            ..Self::new(message)
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::typed(CONFIG_ERROR, message).permanent()
    }

    pub fn timeout(after: std::time::Duration) -> Self {
        Self::typed(TIMEOUT_ERROR, format!("action exceeded {}ms", after.as_millis()))
    }

    pub fn cancelled() -> Self {
        Self::typed(CANCELLED_ERROR, "action cancelled").permanent()
    }

    /// Mark as not worth retrying.
    pub fn permanent(mut self) -> Self {
        self.retryable = false;
        self
    }

    pub fn with_stack_trace(mut self, trace: impl Into<String>) -> Self {
        self.stack_trace = Some(trace.into());
        self
    }

    pub fn is_cancellation(&self) -> bool {
        self.error_type == CANCELLED_ERROR
    }

    /// Convert into the run-level failure record for `node_id`.
    pub fn into_failure(self, node_id: &str) -> NodeFailure {
        let stack_trace = self
            .stack_trace
            .unwrap_or_else(|| format!("at node '{node_id}' (attempt {})", self.attempts));
        NodeFailure {
            node_id: node_id.to_string(),
            error_type: self.error_type,
            message: self.message,
            stack_trace,
            attempts: self.attempts,
            details: self.details,
        }
    }
}

// ---------------------------------------------------------------------------
// Handler traits
// ---------------------------------------------------------------------------

/// The action-unit interface.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait ActionHandler: Send + Sync + 'static {
    /// Ports this action exposes on its node.
    fn ports(&self) -> ActionPorts;

    fn execute(
        &self,
        input: ActionInput,
    ) -> impl Future<Output = Result<ActionOutput, ActionError>> + Send;
}

/// Boxed future returned by [`ActionHandlerDyn::execute_boxed`].
pub type ActionFuture<'a> = Pin<Box<dyn Future<Output = Result<ActionOutput, ActionError>> + Send + 'a>>;

/// Object-safe version of [`ActionHandler`] with boxed futures.
///
/// A blanket implementation is provided for all types implementing `ActionHandler`.
pub trait ActionHandlerDyn: Send + Sync {
    fn ports(&self) -> ActionPorts;

    fn execute_boxed(&self, input: ActionInput) -> ActionFuture<'_>;
}

impl<T: ActionHandler> ActionHandlerDyn for T {
    fn ports(&self) -> ActionPorts {
        ActionHandler::ports(self)
    }

    fn execute_boxed(&self, input: ActionInput) -> ActionFuture<'_> {
        Box::pin(self.execute(input))
    }
}

/// Type-erased action shared between the registry, graphs and middleware.
pub type SharedAction = Arc<dyn ActionHandlerDyn>;

/// Lets middleware wrap an already type-erased handler.
impl ActionHandler for SharedAction {
    fn ports(&self) -> ActionPorts {
        ActionHandlerDyn::ports(self.as_ref())
    }

    fn execute(
        &self,
        input: ActionInput,
    ) -> impl Future<Output = Result<ActionOutput, ActionError>> + Send {
        self.as_ref().execute_boxed(input)
    }
}
