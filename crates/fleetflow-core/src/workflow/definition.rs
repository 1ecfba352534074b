//! Workflow document parsing and document-level validation.
//!
//! Covers everything that can be checked without knowing which node types
//! exist: size limits, id/type/port name patterns, config nesting depth and
//! the code-injection scan. Graph-level checks (ports, connections, cycles,
//! entry set) live in `graph`.

use std::path::Path;

use fleetflow_types::workflow::WorkflowDocument;
use serde_json::Value;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Malformed workflow. Fatal at load, never retried.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// JSON/YAML parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    Validation(String),

    /// A connection references a missing node or port, or joins incompatible ports.
    #[error("invalid connection {connection}: {reason}")]
    InvalidConnection { connection: String, reason: String },

    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// Payload exceeds a size/depth bound.
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("disallowed pattern '{pattern}' in {location}")]
    InjectionDetected { location: String, pattern: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

pub const MAX_NODES: usize = 1000;
pub const MAX_CONNECTIONS: usize = 5000;
pub const MAX_ID_LEN: usize = 256;
pub const MAX_TYPE_LEN: usize = 128;
pub const MAX_PORT_LEN: usize = 64;
pub const MAX_CONFIG_DEPTH: usize = 10;
pub const MAX_STRING_LEN: usize = 65_536;

/// Substrings rejected anywhere in a document's strings.
pub const INJECTION_PATTERNS: &[&str] = &[
    "__import__",
    "eval(",
    "exec(",
    "os.system",
    "subprocess",
    "<script",
    "javascript:",
    "${jndi:",
    "; rm -rf",
];

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a JSON document. Shape only; call [`validate_document`] next.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowDocument, WorkflowError> {
    serde_json::from_str(json).map_err(|e| WorkflowError::Parse(e.to_string()))
}

pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDocument, WorkflowError> {
    serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::Parse(e.to_string()))
}

/// Load a document from disk, choosing the format by extension
/// (`.yaml`/`.yml` for YAML, anything else JSON).
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDocument, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => parse_workflow_yaml(&content),
        _ => parse_workflow_json(&content),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate document-level constraints.
///
/// Checks:
/// - node/connection counts within bounds
/// - node keys equal `node_id`; id, type and port names match their patterns
/// - metadata name non-empty, version is semver
/// - config nesting depth and string lengths within bounds
/// - no string contains a disallowed code-injection pattern
pub fn validate_document(doc: &WorkflowDocument) -> Result<(), WorkflowError> {
    if doc.nodes.len() > MAX_NODES {
        return Err(WorkflowError::LimitExceeded(format!(
            "{} nodes (max {MAX_NODES})",
            doc.nodes.len()
        )));
    }
    if doc.connections.len() > MAX_CONNECTIONS {
        return Err(WorkflowError::LimitExceeded(format!(
            "{} connections (max {MAX_CONNECTIONS})",
            doc.connections.len()
        )));
    }

    if doc.metadata.name.trim().is_empty() {
        return Err(WorkflowError::Validation(
            "metadata.name must not be empty".to_string(),
        ));
    }
    if semver::Version::parse(&doc.metadata.version).is_err() {
        return Err(WorkflowError::Validation(format!(
            "metadata.version '{}' is not a semantic version",
            doc.metadata.version
        )));
    }
    scan_string("metadata.name", &doc.metadata.name)?;
    if let Some(description) = &doc.metadata.description {
        scan_string("metadata.description", description)?;
    }

    for (key, node) in &doc.nodes {
        if key != &node.node_id {
            return Err(WorkflowError::Validation(format!(
                "node key '{key}' does not match node_id '{}'",
                node.node_id
            )));
        }
        if !is_valid_node_id(&node.node_id) {
            return Err(WorkflowError::Validation(format!(
                "invalid node id '{}' (allowed: A-Z a-z 0-9 _ . -, 1..={MAX_ID_LEN} chars)",
                truncate(&node.node_id)
            )));
        }
        if !is_valid_node_type(&node.node_type) {
            return Err(WorkflowError::Validation(format!(
                "node '{}' has invalid type '{}'",
                node.node_id,
                truncate(&node.node_type)
            )));
        }
        for (name, value) in &node.config {
            let location = format!("nodes.{}.config.{name}", node.node_id);
            scan_string(&location, name)?;
            check_value(&location, value, 1)?;
        }
    }

    for (name, value) in &doc.variables {
        let location = format!("variables.{name}");
        scan_string(&location, name)?;
        check_value(&location, value, 1)?;
    }

    for conn in &doc.connections {
        for port in [&conn.source_port, &conn.target_port] {
            if !is_valid_port_name(port) {
                return Err(WorkflowError::InvalidConnection {
                    connection: conn.to_string(),
                    reason: format!("invalid port name '{}'", truncate(port)),
                });
            }
        }
    }

    Ok(())
}

/// `^[A-Za-z0-9_.-]{1,256}$`
pub fn is_valid_node_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// `^[A-Za-z][A-Za-z0-9_]{0,127}$`
pub fn is_valid_node_type(node_type: &str) -> bool {
    let mut chars = node_type.chars();
    node_type.len() <= MAX_TYPE_LEN
        && chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// `^[a-z][a-z0-9_]{0,63}$`
pub fn is_valid_port_name(port: &str) -> bool {
    let mut chars = port.chars();
    port.len() <= MAX_PORT_LEN
        && chars.next().is_some_and(|c| c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn check_value(location: &str, value: &Value, depth: usize) -> Result<(), WorkflowError> {
    if depth > MAX_CONFIG_DEPTH {
        return Err(WorkflowError::LimitExceeded(format!(
            "{location} nests deeper than {MAX_CONFIG_DEPTH} levels"
        )));
    }
    match value {
        Value::String(s) => scan_string(location, s),
        Value::Array(items) => items
            .iter()
            .try_for_each(|item| check_value(location, item, depth + 1)),
        Value::Object(map) => map.iter().try_for_each(|(k, v)| {
            scan_string(location, k)?;
            check_value(location, v, depth + 1)
        }),
        _ => Ok(()),
    }
}

fn scan_string(location: &str, s: &str) -> Result<(), WorkflowError> {
    if s.len() > MAX_STRING_LEN {
        return Err(WorkflowError::LimitExceeded(format!(
            "{location} holds a {} byte string (max {MAX_STRING_LEN})",
            s.len()
        )));
    }
    let lowered = s.to_ascii_lowercase();
    match INJECTION_PATTERNS.iter().find(|p| lowered.contains(*p)) {
        Some(pattern) => Err(WorkflowError::InjectionDetected {
            location: location.to_string(),
            pattern: pattern.to_string(),
        }),
        None => Ok(()),
    }
}

fn truncate(s: &str) -> String {
    s.chars().take(40).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> WorkflowDocument {
        serde_json::from_value(value).unwrap()
    }

    fn minimal() -> Value {
        json!({
            "metadata": {"name": "demo", "version": "1.2.0"},
            "nodes": {
                "start": {"node_id": "start", "node_type": "Start"},
                "log_1": {"node_id": "log_1", "node_type": "Log", "config": {"message": "hello"}}
            },
            "connections": [
                {"source_node": "start", "source_port": "exec_out",
                 "target_node": "log_1", "target_port": "exec_in"}
            ]
        })
    }

    #[test]
    fn valid_document_passes() {
        assert!(validate_document(&doc(minimal())).is_ok());
    }

    #[test]
    fn mismatched_node_key_rejected() {
        let mut raw = minimal();
        raw["nodes"]["log_1"]["node_id"] = json!("other");
        let err = validate_document(&doc(raw)).unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(m) if m.contains("log_1")));
    }

    #[test]
    fn patterns() {
        assert!(is_valid_node_id("node-1.a_b"));
        assert!(!is_valid_node_id(""));
        assert!(!is_valid_node_id("has space"));
        assert!(!is_valid_node_id(&"x".repeat(257)));
        assert!(is_valid_node_type("ForLoopStart"));
        assert!(!is_valid_node_type("1Bad"));
        assert!(!is_valid_node_type("Bad-Type"));
        assert!(is_valid_port_name("exec_out"));
        assert!(!is_valid_port_name("ExecOut"));
        assert!(!is_valid_port_name("_x"));
    }

    #[test]
    fn injection_is_rejected() {
        let mut raw = minimal();
        raw["nodes"]["log_1"]["config"]["message"] = json!("x = __import__('os')");
        let err = validate_document(&doc(raw)).unwrap_err();
        match err {
            WorkflowError::InjectionDetected { location, pattern } => {
                assert_eq!(location, "nodes.log_1.config.message");
                assert_eq!(pattern, "__import__");
            }
            other => panic!("unexpected {other:?}"),
        }

        let mut raw = minimal();
        raw["variables"] = json!({"payload": ["<SCRIPT>alert(1)</script>"]});
        assert!(matches!(
            validate_document(&doc(raw)),
            Err(WorkflowError::InjectionDetected { .. })
        ));
    }

    #[test]
    fn config_depth_is_bounded() {
        let mut nested = json!("leaf");
        for _ in 0..MAX_CONFIG_DEPTH {
            nested = json!({ "k": nested });
        }
        let mut raw = minimal();
        raw["nodes"]["log_1"]["config"]["deep"] = nested;
        assert!(matches!(
            validate_document(&doc(raw)),
            Err(WorkflowError::LimitExceeded(_))
        ));
    }

    #[test]
    fn too_many_nodes_rejected() {
        let mut raw = minimal();
        let nodes = raw["nodes"].as_object_mut().unwrap();
        for i in 0..MAX_NODES {
            let id = format!("n{i}");
            nodes.insert(id.clone(), json!({"node_id": id, "node_type": "Log"}));
        }
        assert!(matches!(
            validate_document(&doc(raw)),
            Err(WorkflowError::LimitExceeded(_))
        ));
    }

    #[test]
    fn bad_version_rejected() {
        let mut raw = minimal();
        raw["metadata"]["version"] = json!("one");
        assert!(matches!(validate_document(&doc(raw)), Err(WorkflowError::Validation(_))));
    }

    #[test]
    fn yaml_documents_parse() {
        let yaml = r#"
metadata:
  name: from-yaml
nodes:
  start:
    node_id: start
    node_type: Start
connections: []
"#;
        let parsed = parse_workflow_yaml(yaml).unwrap();
        assert_eq!(parsed.metadata.name, "from-yaml");
        assert!(validate_document(&parsed).is_ok());
    }
}
