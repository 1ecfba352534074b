//! Workflow document types.
//!
//! `WorkflowDocument` is the raw JSON/YAML shape produced by the graph editor.
//! It is deserialized as-is and then validated into an immutable graph by
//! `fleetflow-core`; nothing here enforces invariants beyond serde's shape.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow document (editor wire format)
// ---------------------------------------------------------------------------

/// A workflow as exported by the graph editor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDocument {
    /// Optional stable identifier carried by the document itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub metadata: WorkflowMetadata,
    /// Nodes keyed by node id. The key must equal `node.node_id`.
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeDocument>,
    #[serde(default)]
    pub connections: Vec<ConnectionDocument>,
    /// Initial variable bindings for every run.
    #[serde(default)]
    pub variables: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub settings: WorkflowSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

/// One node of the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDocument {
    pub node_id: String,
    pub node_type: String,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
    /// Editor canvas position, ignored by the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<[f64; 2]>,
}

/// A directed edge `(source_node, source_port) -> (target_node, target_port)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionDocument {
    pub source_node: String,
    pub source_port: String,
    pub target_node: String,
    pub target_port: String,
}

impl std::fmt::Display for ConnectionDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{} -> {}.{}",
            self.source_node, self.source_port, self.target_node, self.target_port
        )
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Run-level settings embedded in the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Abort the run on the first uncaught error.
    #[serde(default = "default_true")]
    pub stop_on_error: bool,
    /// Run timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Default retry count for action nodes.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub parallel_failure: ParallelFailurePolicy,
    /// Overrides the engine-wide checkpoint policy when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_policy: Option<CheckpointPolicy>,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            stop_on_error: true,
            timeout: None,
            retry_count: 0,
            parallel_failure: ParallelFailurePolicy::default(),
            checkpoint_policy: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// What happens to sibling branches when one parallel branch fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelFailurePolicy {
    /// Cancel siblings when `stop_on_error` is set, isolate otherwise.
    #[default]
    Auto,
    /// Always cancel outstanding siblings.
    CancelSiblings,
    /// Let siblings run to completion.
    Isolate,
}

impl ParallelFailurePolicy {
    /// Whether a failed branch cancels its siblings under `stop_on_error`.
    pub fn cancels_siblings(self, stop_on_error: bool) -> bool {
        match self {
            ParallelFailurePolicy::Auto => stop_on_error,
            ParallelFailurePolicy::CancelSiblings => true,
            ParallelFailurePolicy::Isolate => false,
        }
    }
}

/// When the orchestrator persists a checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointPolicy {
    #[default]
    EveryNode,
    /// Only after nodes whose config sets `checkpoint: true`.
    Boundaries,
    None,
}

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// Value type carried by a data port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    String,
    Int,
    Float,
    Bool,
    List,
    Dict,
    Any,
}

impl DataType {
    /// Exact match, or the `any` wildcard on either end.
    pub fn is_compatible(self, other: DataType) -> bool {
        self == other || self == DataType::Any || other == DataType::Any
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataType::String => "string",
            DataType::Int => "int",
            DataType::Float => "float",
            DataType::Bool => "bool",
            DataType::List => "list",
            DataType::Dict => "dict",
            DataType::Any => "any",
        }
    }
}

impl std::str::FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "string" | "str" => Ok(DataType::String),
            "int" | "integer" => Ok(DataType::Int),
            "float" | "number" => Ok(DataType::Float),
            "bool" | "boolean" => Ok(DataType::Bool),
            "list" | "array" => Ok(DataType::List),
            "dict" | "object" => Ok(DataType::Dict),
            "any" => Ok(DataType::Any),
            other => Err(format!("unknown data type '{other}'")),
        }
    }
}

/// Execution ports carry control flow; data ports carry typed values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data_type", rename_all = "snake_case")]
pub enum PortKind {
    Exec,
    Data(DataType),
}

// ---------------------------------------------------------------------------
// Stored definitions
// ---------------------------------------------------------------------------

/// A workflow document registered with the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: Uuid,
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub document: WorkflowDocument,
    /// Structural fingerprint of the validated graph.
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_parses_editor_json() {
        let raw = serde_json::json!({
            "metadata": {"name": "demo"},
            "nodes": {
                "start": {"node_id": "start", "node_type": "Start", "position": [0.0, 10.0]},
                "log": {"node_id": "log", "node_type": "Log", "config": {"message": "hi"}}
            },
            "connections": [
                {"source_node": "start", "source_port": "exec_out",
                 "target_node": "log", "target_port": "exec_in"}
            ],
            "variables": {"count": 1}
        });
        let doc: WorkflowDocument = serde_json::from_value(raw).unwrap();
        assert_eq!(doc.metadata.version, "1.0.0");
        assert_eq!(doc.nodes.len(), 2);
        assert!(doc.settings.stop_on_error);
        assert_eq!(doc.settings.parallel_failure, ParallelFailurePolicy::Auto);
        assert_eq!(doc.connections[0].to_string(), "start.exec_out -> log.exec_in");
    }

    #[test]
    fn parallel_policy_resolution() {
        assert!(ParallelFailurePolicy::Auto.cancels_siblings(true));
        assert!(!ParallelFailurePolicy::Auto.cancels_siblings(false));
        assert!(ParallelFailurePolicy::CancelSiblings.cancels_siblings(false));
        assert!(!ParallelFailurePolicy::Isolate.cancels_siblings(true));
    }

    #[test]
    fn data_type_compatibility() {
        assert!(DataType::String.is_compatible(DataType::String));
        assert!(DataType::Any.is_compatible(DataType::Int));
        assert!(DataType::List.is_compatible(DataType::Any));
        assert!(!DataType::Int.is_compatible(DataType::Float));
        assert_eq!("object".parse::<DataType>().unwrap(), DataType::Dict);
    }
}
