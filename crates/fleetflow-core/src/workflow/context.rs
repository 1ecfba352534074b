//! Per-run execution context with template resolution.
//!
//! `ExecutionContext` is the state one run owns exclusively: variable
//! bindings, node statuses, materialized data-port values and the errors
//! recorded so far. Control stacks live with the orchestrator's strands and
//! are folded in only when a snapshot is taken.

use std::collections::BTreeMap;

use chrono::Utc;
use fleetflow_types::run::{ControlFrame, NodeFailure, NodeStatus, RunSnapshot};
use serde_json::{json, Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum serialized size of a single data-port value (1 MB).
pub const MAX_OUTPUT_SIZE: usize = 1_048_576;

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub variables: Map<String, Value>,
    pub node_status: BTreeMap<String, NodeStatus>,
    /// node id -> output port -> value.
    pub outputs: BTreeMap<String, BTreeMap<String, Value>>,
    /// Uncaught errors recorded while `stop_on_error` is off.
    pub errors: Vec<NodeFailure>,
    /// Node most recently started (the checkpoint cursor).
    pub cursor: Option<String>,
}

impl ExecutionContext {
    pub fn new(run_id: Uuid, workflow_name: &str, variables: Map<String, Value>) -> Self {
        Self {
            run_id,
            workflow_name: workflow_name.to_string(),
            variables,
            node_status: BTreeMap::new(),
            outputs: BTreeMap::new(),
            errors: Vec::new(),
            cursor: None,
        }
    }

    /// Rebuild a context from a checkpoint snapshot.
    pub fn restore(run_id: Uuid, workflow_name: &str, snapshot: &RunSnapshot) -> Self {
        Self {
            run_id,
            workflow_name: workflow_name.to_string(),
            variables: snapshot.variables.clone(),
            node_status: snapshot.node_status.clone(),
            outputs: snapshot.outputs.clone(),
            errors: snapshot.errors.clone(),
            cursor: None,
        }
    }

    /// Capture the context plus the walk position for a checkpoint.
    pub fn snapshot(&self, control_stack: &[ControlFrame], next: Vec<String>) -> RunSnapshot {
        RunSnapshot {
            variables: self.variables.clone(),
            node_status: self.node_status.clone(),
            outputs: self.outputs.clone(),
            control_stack: control_stack.to_vec(),
            next,
            errors: self.errors.clone(),
        }
    }

    pub fn status(&self, node_id: &str) -> NodeStatus {
        self.node_status
            .get(node_id)
            .copied()
            .unwrap_or(NodeStatus::Pending)
    }

    pub fn set_status(&mut self, node_id: &str, status: NodeStatus) {
        self.node_status.insert(node_id.to_string(), status);
    }

    /// Record a data-port value, replacing oversized values with a marker.
    pub fn set_output(&mut self, node_id: &str, port: &str, value: Value) {
        let size = serde_json::to_string(&value).map(|s| s.len()).unwrap_or(0);
        let value = if size > MAX_OUTPUT_SIZE {
            tracing::warn!(
                run_id = %self.run_id,
                node_id,
                port,
                size,
                max = MAX_OUTPUT_SIZE,
                "output exceeds size limit, truncating"
            );
            json!({
                "_truncated": true,
                "_original_size": size,
            })
        } else {
            value
        };
        self.outputs
            .entry(node_id.to_string())
            .or_default()
            .insert(port.to_string(), value);
    }

    pub fn output(&self, node_id: &str, port: &str) -> Option<&Value> {
        self.outputs.get(node_id).and_then(|ports| ports.get(port))
    }

    // -----------------------------------------------------------------------
    // Templates
    // -----------------------------------------------------------------------

    /// Resolve templates in every string inside `value`.
    pub fn resolve_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => self.resolve_template(s),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.resolve_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    pub fn resolve_config(&self, config: &Map<String, Value>) -> Map<String, Value> {
        config
            .iter()
            .map(|(k, v)| (k.clone(), self.resolve_value(v)))
            .collect()
    }

    /// Resolve `{{...}}` references in a string.
    ///
    /// Supports `{{name}}`, `{{name.field}}`, `{{list[0]}}` and chains of
    /// those, `{{node_id.port}}` for materialized outputs, and the system
    /// variables `$now`, `$timestamp`, `$date`, `$time`, `$run_id`,
    /// `$workflow_name`, `$uuid`.
    ///
    /// A string consisting of exactly one reference resolves to the typed
    /// value. Unknown references are left as-is (not an error).
    pub fn resolve_template(&self, template: &str) -> Value {
        if let Some(inner) = single_reference(template) {
            if let Some(value) = self.lookup(inner) {
                return value;
            }
            return Value::String(template.to_string());
        }

        let mut result = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            let Some(len) = rest[start + 2..].find("}}") else {
                break;
            };
            let end = start + 2 + len + 2;
            result.push_str(&rest[..start]);
            let reference = rest[start + 2..end - 2].trim();
            match self.lookup(reference) {
                Some(value) => result.push_str(&value_to_string(&value)),
                None => result.push_str(&rest[start..end]),
            }
            rest = &rest[end..];
        }
        result.push_str(rest);
        Value::String(result)
    }

    /// Look up a reference path (without braces).
    pub fn lookup(&self, path: &str) -> Option<Value> {
        if let Some(name) = path.strip_prefix('$') {
            return self.system_variable(name);
        }
        let split = path.find(['.', '[']).unwrap_or(path.len());
        let (head, mut rest) = path.split_at(split);
        if head.is_empty() {
            return None;
        }

        let mut current = match self.variables.get(head) {
            Some(value) => value.clone(),
            None => {
                let ports = self.outputs.get(head)?;
                Value::Object(ports.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            }
        };

        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix('.') {
                let end = after.find(['.', '[']).unwrap_or(after.len());
                let key = &after[..end];
                current = index_value(&current, key)?;
                rest = &after[end..];
            } else if let Some(after) = rest.strip_prefix('[') {
                let close = after.find(']')?;
                let key = after[..close].trim().trim_matches(|c| c == '"' || c == '\'');
                current = index_value(&current, key)?;
                rest = &after[close + 1..];
            } else {
                return None;
            }
        }
        Some(current)
    }

    fn system_variable(&self, name: &str) -> Option<Value> {
        let now = Utc::now();
        let value = match name {
            "now" => json!(now.to_rfc3339()),
            "timestamp" => json!(now.timestamp()),
            "date" => json!(now.format("%Y-%m-%d").to_string()),
            "time" => json!(now.format("%H:%M:%S").to_string()),
            "run_id" => json!(self.run_id.to_string()),
            "workflow_name" => json!(self.workflow_name),
            "uuid" => json!(Uuid::new_v4().to_string()),
            _ => return None,
        };
        Some(value)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Inner text when `template` is exactly one `{{...}}` reference.
fn single_reference(template: &str) -> Option<&str> {
    let inner = template.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

/// Object key or array index access.
fn index_value(value: &Value, key: &str) -> Option<Value> {
    match value {
        Value::Object(map) => map.get(key).cloned(),
        Value::Array(items) => {
            let idx: i64 = key.parse().ok()?;
            let idx = if idx < 0 { items.len() as i64 + idx } else { idx };
            usize::try_from(idx).ok().and_then(|i| items.get(i)).cloned()
        }
        _ => None,
    }
}

/// Convert a JSON value to its display form inside a larger string.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
