//! Validated, immutable graph model.
//!
//! [`WorkflowGraph::load`] resolves every node's kind and port table, checks
//! connections, exception-region pairing, loop references and cycles, then
//! precomputes the execution adjacency index the orchestrator walks. The
//! only query derived at run time is [`WorkflowGraph::join_point`], a
//! breadth-first walk over that index when a parallel fork starts.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use fleetflow_types::workflow::{PortKind, WorkflowDocument};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::definition::{is_valid_port_name, validate_document, WorkflowError};
use super::node::{NodeKind, NodeOptions, NodePorts, PORT_CATCH, PORT_FINALLY};
use crate::action::ActionRegistry;

// ---------------------------------------------------------------------------
// Graph types
// ---------------------------------------------------------------------------

/// One side of a connection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortRef {
    pub node: String,
    pub port: String,
}

impl PortRef {
    fn new(node: &str, port: &str) -> Self {
        Self {
            node: node.to_string(),
            port: port.to_string(),
        }
    }
}

/// A node with its kind and ports resolved.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub id: String,
    pub node_type: String,
    pub kind: NodeKind,
    pub config: Map<String, Value>,
    pub ports: NodePorts,
    pub options: NodeOptions,
}

impl GraphNode {
    pub fn is_pure(&self) -> bool {
        self.ports.is_pure()
    }
}

/// Handlers paired with a `Try` node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TryHandlers {
    pub catch: Option<String>,
    pub finally: Option<String>,
}

/// A loaded workflow.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    document: WorkflowDocument,
    nodes: BTreeMap<String, GraphNode>,
    /// `(node, exec output) -> successors`, in connection order.
    successors: HashMap<String, HashMap<String, Vec<PortRef>>>,
    /// `(node, data input) -> producing (node, output)`.
    data_sources: HashMap<String, HashMap<String, PortRef>>,
    try_handlers: HashMap<String, TryHandlers>,
    entry: Vec<String>,
    fingerprint: String,
}

impl WorkflowGraph {
    /// Validate `document` and resolve it against `registry`.
    pub fn load(document: WorkflowDocument, registry: &ActionRegistry) -> Result<Self, WorkflowError> {
        validate_document(&document)?;

        let nodes = resolve_nodes(&document, registry)?;
        let (successors, data_sources) = index_connections(&document, &nodes)?;
        let try_handlers = pair_try_regions(&nodes, &successors)?;
        check_loop_references(&nodes)?;
        check_exec_cycles(&nodes, &successors)?;
        check_data_cycles(&nodes, &data_sources)?;
        let entry = entry_set(&nodes, &successors)?;
        let fingerprint = fingerprint(&document);

        tracing::debug!(
            workflow = %document.metadata.name,
            nodes = nodes.len(),
            entry = ?entry,
            "workflow graph loaded"
        );

        Ok(Self {
            document,
            nodes,
            successors,
            data_sources,
            try_handlers,
            entry,
            fingerprint,
        })
    }

    pub fn document(&self) -> &WorkflowDocument {
        &self.document
    }

    pub fn name(&self) -> &str {
        &self.document.metadata.name
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.values()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Successors of one execution output (empty when unconnected).
    pub fn successors(&self, node: &str, port: &str) -> &[PortRef] {
        self.successors
            .get(node)
            .and_then(|ports| ports.get(port))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Producer feeding a data input, if connected.
    pub fn data_source(&self, node: &str, input: &str) -> Option<&PortRef> {
        self.data_sources.get(node).and_then(|inputs| inputs.get(input))
    }

    /// Connected data inputs of a node, sorted by port name.
    pub fn data_inputs(&self, node: &str) -> Vec<(&str, &PortRef)> {
        let mut inputs: Vec<(&str, &PortRef)> = self
            .data_sources
            .get(node)
            .map(|m| m.iter().map(|(k, v)| (k.as_str(), v)).collect())
            .unwrap_or_default();
        inputs.sort_by(|a, b| a.0.cmp(b.0));
        inputs
    }

    pub fn try_handlers(&self, try_node: &str) -> Option<&TryHandlers> {
        self.try_handlers.get(try_node)
    }

    pub fn entry(&self) -> &[String] {
        &self.entry
    }

    /// SHA-256 over the sorted node/type/connection structure.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Where a parallel fork over `branches` joins: the node every branch
    /// reaches along execution edges, nearest by (longest branch distance,
    /// total distance, id). Walks stop at `barriers`, the join points of
    /// enclosing forks, so an inner fork never joins past an outer one.
    pub fn join_point(&self, branches: &[String], barriers: &[String]) -> Option<String> {
        let reach: Vec<HashMap<&str, usize>> = branches
            .iter()
            .map(|branch| self.exec_distances(branch, barriers))
            .collect();
        let (first, rest) = reach.split_first()?;
        first
            .keys()
            .filter(|id| rest.iter().all(|r| r.contains_key(*id)))
            .map(|id| {
                let dists: Vec<usize> = reach.iter().filter_map(|r| r.get(id).copied()).collect();
                let longest = dists.iter().copied().max().unwrap_or(0);
                (longest, dists.iter().sum::<usize>(), *id)
            })
            .min()
            .map(|(_, _, id)| id.to_string())
    }

    /// Execution-edge distance from `from` to every node it reaches.
    fn exec_distances(&self, from: &str, barriers: &[String]) -> HashMap<&str, usize> {
        let blocked = |id: &str| barriers.iter().any(|b| b == id);
        let mut dist = HashMap::new();
        let Some((from, _)) = self.nodes.get_key_value(from) else {
            return dist;
        };
        if blocked(from.as_str()) {
            return dist;
        }
        dist.insert(from.as_str(), 0);
        let mut queue = VecDeque::from([from.as_str()]);
        while let Some(id) = queue.pop_front() {
            let next_dist = dist.get(id).copied().unwrap_or(0) + 1;
            let edges = self.successors.get(id).into_iter().flat_map(|ports| ports.values().flatten());
            for edge in edges {
                let next = edge.node.as_str();
                if blocked(next) || dist.contains_key(next) {
                    continue;
                }
                dist.insert(next, next_dist);
                queue.push_back(next);
            }
        }
        dist
    }
}

// ---------------------------------------------------------------------------
// Load steps
// ---------------------------------------------------------------------------

fn resolve_nodes(
    doc: &WorkflowDocument,
    registry: &ActionRegistry,
) -> Result<BTreeMap<String, GraphNode>, WorkflowError> {
    let mut nodes = BTreeMap::new();
    for (id, node) in &doc.nodes {
        let kind = match NodeKind::control(&node.node_type, &node.config) {
            Some(kind) => kind,
            None => registry
                .get(&node.node_type)
                .map(NodeKind::Action)
                .ok_or_else(|| {
                    WorkflowError::Validation(format!(
                        "node '{id}' has unknown type '{}'",
                        node.node_type
                    ))
                })?,
        };
        let mut ports = kind.ports();
        ports
            .extend_from_config(&node.config)
            .map_err(|e| WorkflowError::Validation(format!("node '{id}': {e}")))?;
        if let Some(bad) = ports
            .data_inputs
            .keys()
            .chain(ports.data_outputs.keys())
            .find(|p| !is_valid_port_name(p))
        {
            return Err(WorkflowError::Validation(format!(
                "node '{id}' declares invalid port name '{bad}'"
            )));
        }
        nodes.insert(
            id.clone(),
            GraphNode {
                id: id.clone(),
                node_type: node.node_type.clone(),
                options: NodeOptions::from_config(&node.config),
                config: node.config.clone(),
                kind,
                ports,
            },
        );
    }
    Ok(nodes)
}

type Successors = HashMap<String, HashMap<String, Vec<PortRef>>>;
type DataSources = HashMap<String, HashMap<String, PortRef>>;

fn index_connections(
    doc: &WorkflowDocument,
    nodes: &BTreeMap<String, GraphNode>,
) -> Result<(Successors, DataSources), WorkflowError> {
    let mut successors: Successors = HashMap::new();
    let mut data_sources: DataSources = HashMap::new();
    let mut seen = HashSet::new();

    for conn in &doc.connections {
        let invalid = |reason: String| WorkflowError::InvalidConnection {
            connection: conn.to_string(),
            reason,
        };
        let source = nodes
            .get(&conn.source_node)
            .ok_or_else(|| invalid(format!("unknown source node '{}'", conn.source_node)))?;
        let target = nodes
            .get(&conn.target_node)
            .ok_or_else(|| invalid(format!("unknown target node '{}'", conn.target_node)))?;
        let out_kind = source.ports.output(&conn.source_port).ok_or_else(|| {
            invalid(format!(
                "node '{}' has no output port '{}'",
                source.id, conn.source_port
            ))
        })?;
        let in_kind = target.ports.input(&conn.target_port).ok_or_else(|| {
            invalid(format!(
                "node '{}' has no input port '{}'",
                target.id, conn.target_port
            ))
        })?;

        if !seen.insert(conn.to_string()) {
            return Err(invalid("duplicate connection".into()));
        }

        match (out_kind, in_kind) {
            (PortKind::Exec, PortKind::Exec) => {
                successors
                    .entry(conn.source_node.clone())
                    .or_default()
                    .entry(conn.source_port.clone())
                    .or_default()
                    .push(PortRef::new(&conn.target_node, &conn.target_port));
            }
            (PortKind::Data(from), PortKind::Data(to)) => {
                if !from.is_compatible(to) {
                    return Err(invalid(format!(
                        "incompatible data types {} -> {}",
                        from.as_str(),
                        to.as_str()
                    )));
                }
                let inputs = data_sources.entry(conn.target_node.clone()).or_default();
                if inputs.contains_key(&conn.target_port) {
                    return Err(invalid(format!(
                        "input '{}' already has a source",
                        conn.target_port
                    )));
                }
                inputs.insert(
                    conn.target_port.clone(),
                    PortRef::new(&conn.source_node, &conn.source_port),
                );
            }
            _ => return Err(invalid("cannot connect execution and data ports".into())),
        }
    }
    Ok((successors, data_sources))
}

fn pair_try_regions(
    nodes: &BTreeMap<String, GraphNode>,
    successors: &Successors,
) -> Result<HashMap<String, TryHandlers>, WorkflowError> {
    let targets = |node: &str, port: &str| -> Vec<PortRef> {
        successors
            .get(node)
            .and_then(|p| p.get(port))
            .cloned()
            .unwrap_or_default()
    };

    // Every exec edge into a Catch/Finally must be the pairing edge of a Try.
    for (source, ports) in successors {
        for (port, edges) in ports {
            for edge in edges {
                let Some(target) = nodes.get(&edge.node) else { continue };
                let expected = match target.kind {
                    NodeKind::Catch => PORT_CATCH,
                    NodeKind::Finally => PORT_FINALLY,
                    _ => continue,
                };
                let from_try = matches!(nodes.get(source).map(|n| &n.kind), Some(NodeKind::Try));
                if !from_try || port != expected {
                    return Err(WorkflowError::Validation(format!(
                        "node '{}' can only be entered from a Try node's '{expected}' port (found {source}.{port})",
                        target.id
                    )));
                }
            }
        }
    }

    let mut handlers = HashMap::new();
    let mut claimed = HashSet::new();
    for node in nodes.values().filter(|n| matches!(n.kind, NodeKind::Try)) {
        let mut pair = TryHandlers::default();
        for (port, slot) in [(PORT_CATCH, &mut pair.catch), (PORT_FINALLY, &mut pair.finally)] {
            let edges = targets(&node.id, port);
            if edges.len() > 1 {
                return Err(WorkflowError::Validation(format!(
                    "Try node '{}' has more than one '{port}' handler",
                    node.id
                )));
            }
            if let Some(edge) = edges.into_iter().next() {
                if !claimed.insert(edge.node.clone()) {
                    return Err(WorkflowError::Validation(format!(
                        "handler '{}' is paired with more than one Try node",
                        edge.node
                    )));
                }
                *slot = Some(edge.node);
            }
        }
        if pair.catch.is_none() && pair.finally.is_none() {
            return Err(WorkflowError::Validation(format!(
                "Try node '{}' has neither a Catch nor a Finally",
                node.id
            )));
        }
        handlers.insert(node.id.clone(), pair);
    }
    Ok(handlers)
}

fn check_loop_references(nodes: &BTreeMap<String, GraphNode>) -> Result<(), WorkflowError> {
    for node in nodes.values() {
        let (start, want_for) = match &node.kind {
            NodeKind::ForLoopEnd { loop_start: Some(s) } => (s, true),
            NodeKind::WhileLoopEnd { loop_start: Some(s) } => (s, false),
            _ => continue,
        };
        let ok = match nodes.get(start).map(|n| &n.kind) {
            Some(NodeKind::ForLoopStart { .. }) => want_for,
            Some(NodeKind::WhileLoopStart { .. }) => !want_for,
            _ => false,
        };
        if !ok {
            return Err(WorkflowError::Validation(format!(
                "node '{}' names '{start}' as its loop start, which is not a matching loop start",
                node.id
            )));
        }
    }
    Ok(())
}

/// Execution edges may only cycle through loop starts: drop every edge
/// entering a loop start and require the rest to be acyclic.
fn check_exec_cycles(
    nodes: &BTreeMap<String, GraphNode>,
    successors: &Successors,
) -> Result<(), WorkflowError> {
    let mut graph = DiGraph::<&str, ()>::new();
    let idx: HashMap<&str, NodeIndex> = nodes
        .keys()
        .map(|id| (id.as_str(), graph.add_node(id.as_str())))
        .collect();
    for (source, ports) in successors {
        for edge in ports.values().flatten() {
            if nodes.get(&edge.node).is_some_and(|n| n.kind.is_loop_start()) {
                continue;
            }
            if let (Some(&a), Some(&b)) = (idx.get(source.as_str()), idx.get(edge.node.as_str())) {
                graph.add_edge(a, b, ());
            }
        }
    }
    toposort(&graph, None).map_err(|cycle| {
        WorkflowError::CycleDetected(format!(
            "execution cycle through node '{}' outside a loop construct",
            graph[cycle.node_id()]
        ))
    })?;
    Ok(())
}

fn check_data_cycles(
    nodes: &BTreeMap<String, GraphNode>,
    data_sources: &DataSources,
) -> Result<(), WorkflowError> {
    let mut graph = DiGraph::<&str, ()>::new();
    let idx: HashMap<&str, NodeIndex> = nodes
        .keys()
        .map(|id| (id.as_str(), graph.add_node(id.as_str())))
        .collect();
    for (target, inputs) in data_sources {
        for source in inputs.values() {
            if let (Some(&a), Some(&b)) = (idx.get(source.node.as_str()), idx.get(target.as_str())) {
                graph.add_edge(a, b, ());
            }
        }
    }
    toposort(&graph, None).map_err(|cycle| {
        WorkflowError::CycleDetected(format!(
            "data dependency cycle involving node '{}'",
            graph[cycle.node_id()]
        ))
    })?;
    Ok(())
}

fn entry_set(
    nodes: &BTreeMap<String, GraphNode>,
    successors: &Successors,
) -> Result<Vec<String>, WorkflowError> {
    let starts: Vec<&String> = nodes
        .values()
        .filter(|n| matches!(n.kind, NodeKind::Start))
        .map(|n| &n.id)
        .collect();
    match starts.as_slice() {
        [single] => return Ok(vec![(*single).clone()]),
        [] => {}
        many => {
            return Err(WorkflowError::Validation(format!(
                "ambiguous entry: {} Start nodes",
                many.len()
            )));
        }
    }

    let targeted: BTreeSet<&str> = successors
        .values()
        .flat_map(|ports| ports.values().flatten())
        .map(|edge| edge.node.as_str())
        .collect();
    let entry: Vec<String> = nodes
        .values()
        .filter(|n| !n.is_pure() && !targeted.contains(n.id.as_str()))
        .map(|n| n.id.clone())
        .collect();
    if entry.is_empty() {
        return Err(WorkflowError::Validation(
            "workflow has no entry node (every execution node has an incoming edge)".into(),
        ));
    }
    Ok(entry)
}

fn fingerprint(doc: &WorkflowDocument) -> String {
    let mut lines: Vec<String> = doc
        .nodes
        .values()
        .map(|n| format!("node {} {}", n.node_id, n.node_type))
        .collect();
    let mut edges: Vec<String> = doc.connections.iter().map(|c| format!("edge {c}")).collect();
    edges.sort();
    lines.extend(edges);
    format!("{:x}", Sha256::digest(lines.join("\n").as_bytes()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use fleetflow_types::workflow::{ConnectionDocument, NodeDocument, WorkflowMetadata};
    use serde_json::json;

    /// Small builder for test documents.
    pub(crate) struct DocBuilder {
        doc: WorkflowDocument,
    }

    impl DocBuilder {
        pub(crate) fn new(name: &str) -> Self {
            Self {
                doc: WorkflowDocument {
                    id: None,
                    metadata: WorkflowMetadata {
                        name: name.into(),
                        version: "1.0.0".into(),
                        description: None,
                    },
                    nodes: BTreeMap::new(),
                    connections: vec![],
                    variables: Map::new(),
                    settings: Default::default(),
                },
            }
        }

        pub(crate) fn node(mut self, id: &str, node_type: &str, config: Value) -> Self {
            self.doc.nodes.insert(
                id.into(),
                NodeDocument {
                    node_id: id.into(),
                    node_type: node_type.into(),
                    config: config.as_object().cloned().unwrap_or_default(),
                    position: None,
                },
            );
            self
        }

        pub(crate) fn edge(mut self, from: &str, port: &str, to: &str) -> Self {
            self.doc.connections.push(ConnectionDocument {
                source_node: from.into(),
                source_port: port.into(),
                target_node: to.into(),
                target_port: "exec_in".into(),
            });
            self
        }

        pub(crate) fn data(mut self, from: &str, out: &str, to: &str, input: &str) -> Self {
            self.doc.connections.push(ConnectionDocument {
                source_node: from.into(),
                source_port: out.into(),
                target_node: to.into(),
                target_port: input.into(),
            });
            self
        }

        pub(crate) fn variable(mut self, name: &str, value: Value) -> Self {
            self.doc.variables.insert(name.into(), value);
            self
        }

        pub(crate) fn settings(mut self, f: impl FnOnce(&mut fleetflow_types::workflow::WorkflowSettings)) -> Self {
            f(&mut self.doc.settings);
            self
        }

        pub(crate) fn build(self) -> WorkflowDocument {
            self.doc
        }
    }

    fn load(doc: WorkflowDocument) -> Result<WorkflowGraph, WorkflowError> {
        WorkflowGraph::load(doc, &ActionRegistry::with_builtins())
    }

    #[test]
    fn linear_graph_builds_adjacency() {
        let graph = load(
            DocBuilder::new("linear")
                .node("start", "Start", json!({}))
                .node("set", "SetVariable", json!({"name": "x", "value": 1}))
                .node("end", "End", json!({}))
                .edge("start", "exec_out", "set")
                .edge("set", "exec_out", "end")
                .build(),
        )
        .unwrap();
        assert_eq!(graph.entry(), ["start".to_string()]);
        assert_eq!(graph.successors("start", "exec_out")[0].node, "set");
        assert!(graph.successors("end", "exec_out").is_empty());
        assert_eq!(graph.fingerprint().len(), 64);
    }

    #[test]
    fn dangling_connection_names_the_connection() {
        let err = load(
            DocBuilder::new("dangling")
                .node("start", "Start", json!({}))
                .edge("start", "exec_out", "ghost")
                .build(),
        )
        .unwrap_err();
        match err {
            WorkflowError::InvalidConnection { connection, reason } => {
                assert_eq!(connection, "start.exec_out -> ghost.exec_in");
                assert!(reason.contains("ghost"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_port_and_type_mismatch_rejected() {
        let err = load(
            DocBuilder::new("ports")
                .node("start", "Start", json!({}))
                .node("end", "End", json!({}))
                .edge("start", "nope", "end")
                .build(),
        )
        .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidConnection { .. }));

        let err = load(
            DocBuilder::new("types")
                .node("start", "Start", json!({}))
                .node("a", "SetVariable", json!({"outputs": {"n": "int"}}))
                .node("b", "SetVariable", json!({"inputs": {"s": "string"}}))
                .edge("start", "exec_out", "a")
                .edge("a", "exec_out", "b")
                .data("a", "n", "b", "s")
                .build(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("incompatible"));
    }

    #[test]
    fn exec_to_data_rejected() {
        let err = load(
            DocBuilder::new("mixed")
                .node("start", "Start", json!({}))
                .node("set", "SetVariable", json!({}))
                .data("start", "exec_out", "set", "value")
                .build(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("execution and data"));
    }

    #[test]
    fn unknown_node_type_rejected() {
        let err = load(DocBuilder::new("x").node("a", "Teleport", json!({})).build()).unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(m) if m.contains("Teleport")));
    }

    #[test]
    fn exec_cycle_outside_loop_rejected() {
        let err = load(
            DocBuilder::new("cycle")
                .node("start", "Start", json!({}))
                .node("a", "Log", json!({}))
                .node("b", "Log", json!({}))
                .edge("start", "exec_out", "a")
                .edge("a", "exec_out", "b")
                .edge("b", "exec_out", "a")
                .build(),
        )
        .unwrap_err();
        assert!(matches!(err, WorkflowError::CycleDetected(_)));
    }

    #[test]
    fn cycle_through_loop_start_allowed() {
        let graph = load(
            DocBuilder::new("loop")
                .node("start", "Start", json!({}))
                .node("loop", "WhileLoopStart", json!({"condition": "n < 3"}))
                .node("inc", "Increment", json!({"name": "n"}))
                .edge("start", "exec_out", "loop")
                .edge("loop", "body", "inc")
                .edge("inc", "exec_out", "loop")
                .build(),
        );
        assert!(graph.is_ok(), "{:?}", graph.err());
    }

    #[test]
    fn data_cycle_rejected() {
        let err = load(
            DocBuilder::new("data-cycle")
                .node("start", "Start", json!({}))
                .node("a", "SetVariable", json!({}))
                .node("b", "SetVariable", json!({}))
                .edge("start", "exec_out", "a")
                .edge("a", "exec_out", "b")
                .data("a", "value", "b", "value")
                .data("b", "value", "a", "value")
                .build(),
        )
        .unwrap_err();
        assert!(matches!(err, WorkflowError::CycleDetected(m) if m.contains("data")));
    }

    #[test]
    fn try_requires_a_handler() {
        let err = load(
            DocBuilder::new("try")
                .node("start", "Start", json!({}))
                .node("try", "Try", json!({}))
                .edge("start", "exec_out", "try")
                .build(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("neither a Catch nor a Finally"));
    }

    #[test]
    fn catch_only_entered_from_try() {
        let err = load(
            DocBuilder::new("catch")
                .node("start", "Start", json!({}))
                .node("catch", "Catch", json!({}))
                .edge("start", "exec_out", "catch")
                .build(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("can only be entered"));
    }

    #[test]
    fn try_pairing_recorded() {
        let graph = load(
            DocBuilder::new("try-ok")
                .node("start", "Start", json!({}))
                .node("try", "Try", json!({}))
                .node("catch", "Catch", json!({}))
                .node("fin", "Finally", json!({}))
                .edge("start", "exec_out", "try")
                .edge("try", "catch", "catch")
                .edge("try", "finally", "fin")
                .build(),
        )
        .unwrap();
        let handlers = graph.try_handlers("try").unwrap();
        assert_eq!(handlers.catch.as_deref(), Some("catch"));
        assert_eq!(handlers.finally.as_deref(), Some("fin"));
    }

    #[test]
    fn loop_end_must_reference_matching_start() {
        let err = load(
            DocBuilder::new("loop-ref")
                .node("start", "Start", json!({}))
                .node("w", "WhileLoopStart", json!({"condition": "false"}))
                .node("end", "ForLoopEnd", json!({"loop_start": "w"}))
                .edge("start", "exec_out", "w")
                .edge("w", "body", "end")
                .build(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("loop start"));
    }

    #[test]
    fn entry_set_rules() {
        let err = load(
            DocBuilder::new("two-starts")
                .node("s1", "Start", json!({}))
                .node("s2", "Start", json!({}))
                .build(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("ambiguous"));

        // Without a Start node, roots are the execution nodes nobody points at;
        // pure data nodes never count.
        let graph = load(
            DocBuilder::new("roots")
                .node("a", "Log", json!({}))
                .node("b", "Log", json!({}))
                .node("get", "GetVariable", json!({"name": "x"}))
                .edge("a", "exec_out", "b")
                .data("get", "value", "b", "message")
                .build(),
        )
        .unwrap();
        assert_eq!(graph.entry(), ["a".to_string()]);
        assert_eq!(graph.data_source("b", "message").unwrap().node, "get");
    }

    #[test]
    fn fingerprint_tracks_structure_not_config() {
        let base = || {
            DocBuilder::new("fp")
                .node("start", "Start", json!({}))
                .node("log", "Log", json!({"message": "a"}))
                .edge("start", "exec_out", "log")
        };
        let a = load(base().build()).unwrap();
        let b = load(
            DocBuilder::new("fp")
                .node("start", "Start", json!({}))
                .node("log", "Log", json!({"message": "changed"}))
                .edge("start", "exec_out", "log")
                .build(),
        )
        .unwrap();
        let c = load(base().node("extra", "Log", json!({})).edge("log", "exec_out", "extra").build()).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn join_point_is_the_nearest_node_all_branches_reach() {
        let graph = load(
            DocBuilder::new("diamond")
                .node("start", "Start", json!({}))
                .node("a", "Log", json!({}))
                .node("a2", "Log", json!({}))
                .node("b", "Log", json!({}))
                .node("merge", "Log", json!({}))
                .node("tail", "Log", json!({}))
                .node("lonely", "Log", json!({}))
                .edge("start", "exec_out", "a")
                .edge("start", "exec_out", "b")
                .edge("start", "exec_out", "lonely")
                .edge("a", "exec_out", "a2")
                .edge("a2", "exec_out", "merge")
                .edge("b", "exec_out", "merge")
                .edge("merge", "exec_out", "tail")
                .build(),
        )
        .unwrap();
        let branches = |ids: &[&str]| ids.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        assert_eq!(graph.join_point(&branches(&["a", "b"]), &[]), Some("merge".into()));
        // A branch that is itself downstream of another is the join.
        assert_eq!(graph.join_point(&branches(&["a2", "merge"]), &[]), Some("merge".into()));
        assert_eq!(graph.join_point(&branches(&["a", "b", "lonely"]), &[]), None);
        // An enclosing join is a wall the inner walk cannot cross.
        assert_eq!(graph.join_point(&branches(&["a", "b"]), &branches(&["merge"])), None);
    }
}
