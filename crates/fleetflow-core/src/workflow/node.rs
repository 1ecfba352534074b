//! Node kinds and port tables.
//!
//! Control constructs are a closed set handled by the orchestrator itself;
//! every other node type resolves to an action handler at load time.

use std::collections::BTreeMap;
use std::time::Duration;

use fleetflow_types::workflow::{DataType, PortKind};
use serde_json::{Map, Value};

use crate::action::{ActionPorts, SharedAction, EXEC_IN, EXEC_OUT};

// Execution port names used by control constructs.
pub const PORT_TRUE: &str = "true";
pub const PORT_FALSE: &str = "false";
pub const PORT_BODY: &str = "body";
pub const PORT_COMPLETED: &str = "completed";
pub const PORT_TRY_BODY: &str = "try_body";
pub const PORT_CATCH: &str = "catch";
pub const PORT_FINALLY: &str = "finally";
pub const PORT_CATCH_BODY: &str = "catch_body";
pub const PORT_FINALLY_BODY: &str = "finally_body";

/// Loop variable defaults.
pub const DEFAULT_ITEM_VAR: &str = "current_item";
pub const DEFAULT_INDEX_VAR: &str = "current_index";

/// What the orchestrator does when it reaches a node.
#[derive(Clone)]
pub enum NodeKind {
    Start,
    End,
    If {
        condition: Option<String>,
    },
    ForLoopStart {
        item_var: String,
        index_var: String,
        /// Per-loop ceiling, capped by the engine-wide one.
        max_iterations: Option<u64>,
    },
    ForLoopEnd {
        loop_start: Option<String>,
    },
    WhileLoopStart {
        condition: Option<String>,
        max_iterations: Option<u64>,
    },
    WhileLoopEnd {
        loop_start: Option<String>,
    },
    Break,
    Continue,
    Try,
    Catch,
    Finally,
    Action(SharedAction),
}

impl NodeKind {
    /// Resolve a control-construct type name. `None` means "ask the registry".
    pub fn control(node_type: &str, config: &Map<String, Value>) -> Option<NodeKind> {
        let str_cfg = |key: &str| config.get(key).and_then(Value::as_str).map(str::to_string);
        let u64_cfg = |key: &str| config.get(key).and_then(Value::as_u64);
        let kind = match node_type {
            "Start" => NodeKind::Start,
            "End" => NodeKind::End,
            "If" => NodeKind::If {
                condition: str_cfg("condition"),
            },
            "ForLoopStart" => NodeKind::ForLoopStart {
                item_var: str_cfg("item_var").unwrap_or_else(|| DEFAULT_ITEM_VAR.to_string()),
                index_var: str_cfg("index_var").unwrap_or_else(|| DEFAULT_INDEX_VAR.to_string()),
                max_iterations: u64_cfg("max_iterations"),
            },
            "ForLoopEnd" => NodeKind::ForLoopEnd {
                loop_start: str_cfg("loop_start"),
            },
            "WhileLoopStart" => NodeKind::WhileLoopStart {
                condition: str_cfg("condition"),
                max_iterations: u64_cfg("max_iterations"),
            },
            "WhileLoopEnd" => NodeKind::WhileLoopEnd {
                loop_start: str_cfg("loop_start"),
            },
            "Break" => NodeKind::Break,
            "Continue" => NodeKind::Continue,
            "Try" => NodeKind::Try,
            "Catch" => NodeKind::Catch,
            "Finally" => NodeKind::Finally,
            _ => return None,
        };
        Some(kind)
    }

    pub fn is_loop_start(&self) -> bool {
        matches!(self, NodeKind::ForLoopStart { .. } | NodeKind::WhileLoopStart { .. })
    }

    /// Built-in port table.
    pub fn ports(&self) -> NodePorts {
        let spec = match self {
            NodeKind::Start => ActionPorts {
                exec_in: false,
                exec_outputs: vec![EXEC_OUT.into()],
                ..ActionPorts::default()
            },
            NodeKind::End
            | NodeKind::ForLoopEnd { .. }
            | NodeKind::WhileLoopEnd { .. }
            | NodeKind::Break
            | NodeKind::Continue => ActionPorts {
                exec_in: true,
                ..ActionPorts::default()
            },
            NodeKind::If { .. } => ActionPorts {
                exec_in: true,
                exec_outputs: vec![PORT_TRUE.into(), PORT_FALSE.into()],
                ..ActionPorts::default()
            }
            .with_input("condition", DataType::Bool),
            NodeKind::ForLoopStart { .. } => ActionPorts {
                exec_in: true,
                exec_outputs: vec![PORT_BODY.into(), PORT_COMPLETED.into()],
                ..ActionPorts::default()
            }
            .with_input("items", DataType::Any)
            .with_output(DEFAULT_ITEM_VAR, DataType::Any)
            .with_output(DEFAULT_INDEX_VAR, DataType::Int),
            NodeKind::WhileLoopStart { .. } => ActionPorts {
                exec_in: true,
                exec_outputs: vec![PORT_BODY.into(), PORT_COMPLETED.into()],
                ..ActionPorts::default()
            }
            .with_input("condition", DataType::Bool)
            .with_output("iteration", DataType::Int),
            NodeKind::Try => ActionPorts {
                exec_in: true,
                exec_outputs: vec![
                    PORT_TRY_BODY.into(),
                    PORT_CATCH.into(),
                    PORT_FINALLY.into(),
                    EXEC_OUT.into(),
                ],
                ..ActionPorts::default()
            },
            NodeKind::Catch => ActionPorts {
                exec_in: true,
                exec_outputs: vec![PORT_CATCH_BODY.into()],
                ..ActionPorts::default()
            }
            .with_output("error_message", DataType::String)
            .with_output("error_type", DataType::String)
            .with_output("stack_trace", DataType::String),
            NodeKind::Finally => ActionPorts {
                exec_in: true,
                exec_outputs: vec![PORT_FINALLY_BODY.into()],
                ..ActionPorts::default()
            }
            .with_output("had_error", DataType::Bool),
            NodeKind::Action(handler) => handler.ports(),
        };
        NodePorts::from(spec)
    }
}

impl std::fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::Action(_) => f.write_str("Action"),
            NodeKind::Start => f.write_str("Start"),
            NodeKind::End => f.write_str("End"),
            NodeKind::If { condition } => f.debug_struct("If").field("condition", condition).finish(),
            NodeKind::ForLoopStart { item_var, index_var, .. } => f
                .debug_struct("ForLoopStart")
                .field("item_var", item_var)
                .field("index_var", index_var)
                .finish(),
            NodeKind::ForLoopEnd { loop_start } => {
                f.debug_struct("ForLoopEnd").field("loop_start", loop_start).finish()
            }
            NodeKind::WhileLoopStart { condition, .. } => f
                .debug_struct("WhileLoopStart")
                .field("condition", condition)
                .finish(),
            NodeKind::WhileLoopEnd { loop_start } => {
                f.debug_struct("WhileLoopEnd").field("loop_start", loop_start).finish()
            }
            NodeKind::Break => f.write_str("Break"),
            NodeKind::Continue => f.write_str("Continue"),
            NodeKind::Try => f.write_str("Try"),
            NodeKind::Catch => f.write_str("Catch"),
            NodeKind::Finally => f.write_str("Finally"),
        }
    }
}

// ---------------------------------------------------------------------------
// NodePorts
// ---------------------------------------------------------------------------

/// Resolved port set of one node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodePorts {
    pub exec_in: bool,
    pub exec_outputs: Vec<String>,
    pub data_inputs: BTreeMap<String, DataType>,
    pub data_outputs: BTreeMap<String, DataType>,
}

impl From<ActionPorts> for NodePorts {
    fn from(spec: ActionPorts) -> Self {
        Self {
            exec_in: spec.exec_in,
            exec_outputs: spec.exec_outputs,
            data_inputs: spec.data_inputs.into_iter().collect(),
            data_outputs: spec.data_outputs.into_iter().collect(),
        }
    }
}

impl NodePorts {
    pub fn input(&self, name: &str) -> Option<PortKind> {
        if self.exec_in && name == EXEC_IN {
            return Some(PortKind::Exec);
        }
        self.data_inputs.get(name).map(|t| PortKind::Data(*t))
    }

    pub fn output(&self, name: &str) -> Option<PortKind> {
        if self.exec_outputs.iter().any(|p| p == name) {
            return Some(PortKind::Exec);
        }
        self.data_outputs.get(name).map(|t| PortKind::Data(*t))
    }

    pub fn is_pure(&self) -> bool {
        !self.exec_in && self.exec_outputs.is_empty()
    }

    /// Add data ports declared in `config.inputs` / `config.outputs`
    /// (`{port_name: "data_type"}`). Built-in ports keep their types.
    pub fn extend_from_config(&mut self, config: &Map<String, Value>) -> Result<(), String> {
        for (key, target) in [("inputs", &mut self.data_inputs), ("outputs", &mut self.data_outputs)] {
            let Some(declared) = config.get(key) else {
                continue;
            };
            let declared = declared
                .as_object()
                .ok_or_else(|| format!("config.{key} must be an object of port -> type"))?;
            for (port, ty) in declared {
                let ty = ty
                    .as_str()
                    .ok_or_else(|| format!("config.{key}.{port} must be a type name"))?
                    .parse::<DataType>()?;
                target.entry(port.clone()).or_insert(ty);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-node options
// ---------------------------------------------------------------------------

/// Engine options read from a node's config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOptions {
    /// Bypassed: marked Skipped, fires its first execution output.
    pub disabled: bool,
    /// Checkpoint boundary under the `boundaries` policy.
    pub checkpoint: bool,
    pub retry_count: Option<u32>,
    pub retry_backoff: Option<Duration>,
    pub timeout: Option<Duration>,
}

impl NodeOptions {
    pub fn from_config(config: &Map<String, Value>) -> Self {
        Self {
            disabled: config.get("disabled").and_then(Value::as_bool).unwrap_or(false),
            checkpoint: config.get("checkpoint").and_then(Value::as_bool).unwrap_or(false),
            retry_count: config
                .get("retry_count")
                .and_then(Value::as_u64)
                .map(|n| n.min(u32::MAX as u64) as u32),
            retry_backoff: config
                .get("retry_backoff_ms")
                .and_then(Value::as_u64)
                .map(Duration::from_millis),
            timeout: config
                .get("timeout")
                .and_then(Value::as_f64)
                .filter(|secs| *secs > 0.0)
                .map(Duration::from_secs_f64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn control_kinds_resolve() {
        let cfg = json!({"condition": "x > 1"}).as_object().cloned().unwrap();
        assert!(matches!(
            NodeKind::control("If", &cfg),
            Some(NodeKind::If { condition: Some(c) }) if c == "x > 1"
        ));
        assert!(NodeKind::control("Click", &cfg).is_none());

        let loop_kind = NodeKind::control("ForLoopStart", &Map::new()).unwrap();
        assert!(loop_kind.is_loop_start());
        match loop_kind {
            NodeKind::ForLoopStart { item_var, index_var, .. } => {
                assert_eq!(item_var, DEFAULT_ITEM_VAR);
                assert_eq!(index_var, DEFAULT_INDEX_VAR);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn try_ports() {
        let ports = NodeKind::Try.ports();
        assert_eq!(ports.output(PORT_TRY_BODY), Some(PortKind::Exec));
        assert_eq!(ports.output(PORT_CATCH), Some(PortKind::Exec));
        assert_eq!(ports.input(EXEC_IN), Some(PortKind::Exec));
        assert_eq!(ports.output("nope"), None);
        assert_eq!(
            NodeKind::Catch.ports().output("error_message"),
            Some(PortKind::Data(DataType::String))
        );
        assert!(NodeKind::Start.ports().input(EXEC_IN).is_none());
    }

    #[test]
    fn extra_ports_from_config() {
        let mut ports = NodeKind::End.ports();
        let cfg = json!({"inputs": {"payload": "dict"}, "outputs": {"status": "int"}})
            .as_object()
            .cloned()
            .unwrap();
        ports.extend_from_config(&cfg).unwrap();
        assert_eq!(ports.input("payload"), Some(PortKind::Data(DataType::Dict)));
        assert_eq!(ports.output("status"), Some(PortKind::Data(DataType::Int)));

        let bad = json!({"inputs": {"x": "complex"}}).as_object().cloned().unwrap();
        assert!(ports.extend_from_config(&bad).is_err());
    }

    #[test]
    fn options_from_config() {
        let cfg = json!({"disabled": true, "retry_count": 2, "timeout": 1.5, "retry_backoff_ms": 10})
            .as_object()
            .cloned()
            .unwrap();
        let opts = NodeOptions::from_config(&cfg);
        assert!(opts.disabled);
        assert_eq!(opts.retry_count, Some(2));
        assert_eq!(opts.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(opts.retry_backoff, Some(Duration::from_millis(10)));
    }
}
