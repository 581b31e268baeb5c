//! Workflow graph model (spec.md §4.1)
//!
//! A graph is an immutable directed structure of `start` / `end` / `step` /
//! `branch` / `join` nodes connected by plain or branch-labeled edges.
//! Construction goes through [`GraphBuilder`], which validates connectedness
//! and the presence of a `default` edge on every branch before handing back
//! a [`Graph`].

mod selector;

pub use selector::{BranchSelector, SelectorRegistry, SelectorRegistryError};

use std::collections::{HashMap, HashSet, VecDeque};

use serde_json::Value;

/// Opaque node identifier.
pub type NodeId = String;

/// The label on a branch edge: either a concrete comparable value or the
/// `default` sentinel that every branch must carry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EdgeLabel {
    Value(String),
    Default,
}

impl EdgeLabel {
    pub fn value(label: impl Into<String>) -> Self {
        EdgeLabel::Value(label.into())
    }
}

/// A node kind. `step` carries the registry id of the `Step` to invoke;
/// `branch` carries the registry id of a `BranchSelector`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Start,
    End,
    Step { step_ref: String },
    Branch { selector_ref: String },
    Join,
}

#[derive(Debug, Clone)]
struct Node {
    id: NodeId,
    kind: NodeKind,
}

#[derive(Debug, Clone)]
struct Edge {
    dst: NodeId,
    label: Option<EdgeLabel>,
}

/// Errors raised while building or traversing a graph.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("graph must have exactly one start node, found {0}")]
    WrongStartCount(usize),

    #[error("graph must have at least one end node")]
    NoEndNode,

    #[error("edge references unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("node unreachable from start: {0}")]
    Unreachable(NodeId),

    #[error("node does not reach any end node: {0}")]
    DeadEnd(NodeId),

    #[error("branch node {0} has fewer than two outgoing edges")]
    BranchTooFewEdges(NodeId),

    #[error("branch node {0} has no default edge")]
    BranchMissingDefault(NodeId),

    #[error("duplicate node id: {0}")]
    DuplicateNode(NodeId),

    #[error("node {0} is not a branch node")]
    NotABranch(NodeId),
}

/// The result of asking the graph what happens next from a given node,
/// given the workflow's current state. Mirrors spec.md §4.1's
/// `next(graph, current_id, state)` contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Next {
    Step { step_ref: String, next_id: NodeId },
    Branch { evaluated_label: String, next_id: NodeId },
    Join { next_id: NodeId },
    Terminal,
}

/// An immutable, validated directed graph of workflow nodes.
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: HashMap<NodeId, Node>,
    edges: HashMap<NodeId, Vec<Edge>>,
    start: NodeId,
}

impl Graph {
    /// The id of the single start node.
    pub fn start_id(&self) -> &str {
        &self.start
    }

    pub fn node_exists(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Evaluate what happens leaving `current_id`, given a selector
    /// evaluation function used for branch nodes.
    ///
    /// `selector` maps a branch node's `selector_ref` and the workflow
    /// state to the label value the branch selector produced.
    pub fn next(
        &self,
        current_id: &str,
        state: &Value,
        selector: impl Fn(&str, &Value) -> String,
    ) -> Result<Next, GraphError> {
        let node = self
            .node(current_id)
            .ok_or_else(|| GraphError::UnknownNode(current_id.to_string()))?;

        match &node.kind {
            // start and join both have exactly one outgoing plain edge and
            // advance with no event of their own.
            NodeKind::Start | NodeKind::Join => {
                let next_id = self.single_successor(current_id)?;
                Ok(Next::Join { next_id })
            }
            NodeKind::End => Ok(Next::Terminal),
            NodeKind::Step { step_ref } => {
                let next_id = self.single_successor(current_id)?;
                Ok(Next::Step {
                    step_ref: step_ref.clone(),
                    next_id,
                })
            }
            NodeKind::Branch { selector_ref } => {
                let value = selector(selector_ref, state);
                let edges = self.edges.get(current_id).map(Vec::as_slice).unwrap_or(&[]);

                // Ties broken by edge declaration order; unknown labels
                // always resolve to `default`.
                let matched = edges.iter().find(|e| {
                    matches!(&e.label, Some(EdgeLabel::Value(v)) if *v == value)
                });
                let chosen = match matched {
                    Some(e) => (value.clone(), e),
                    None => {
                        let default_edge = edges
                            .iter()
                            .find(|e| matches!(e.label, Some(EdgeLabel::Default)))
                            .expect("validated graphs always carry a default edge");
                        ("default".to_string(), default_edge)
                    }
                };
                Ok(Next::Branch {
                    evaluated_label: chosen.0,
                    next_id: chosen.1.dst.clone(),
                })
            }
        }
    }

    fn single_successor(&self, id: &str) -> Result<NodeId, GraphError> {
        self.edges
            .get(id)
            .and_then(|e| e.first())
            .map(|e| e.dst.clone())
            .ok_or_else(|| GraphError::UnknownNode(id.to_string()))
    }
}

/// Builds and validates a [`Graph`]. Replaces the embedded-DSL construction
/// of the original with an explicit builder + validation pass, per
/// spec.md §9.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: HashMap<NodeId, Node>,
    edges: HashMap<NodeId, Vec<Edge>>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        self.add_node(id, NodeKind::Start);
        self
    }

    pub fn end(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        self.add_node(id, NodeKind::End);
        self
    }

    pub fn step(mut self, id: impl Into<String>, step_ref: impl Into<String>) -> Self {
        let id = id.into();
        self.add_node(
            id,
            NodeKind::Step {
                step_ref: step_ref.into(),
            },
        );
        self
    }

    pub fn branch(mut self, id: impl Into<String>, selector_ref: impl Into<String>) -> Self {
        let id = id.into();
        self.add_node(
            id,
            NodeKind::Branch {
                selector_ref: selector_ref.into(),
            },
        );
        self
    }

    pub fn join(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        self.add_node(id, NodeKind::Join);
        self
    }

    fn add_node(&mut self, id: NodeId, kind: NodeKind) {
        self.nodes.insert(id.clone(), Node { id, kind });
    }

    /// A plain edge, used by start/step/join nodes.
    pub fn edge(mut self, src: impl Into<String>, dst: impl Into<String>) -> Self {
        self.edges
            .entry(src.into())
            .or_default()
            .push(Edge {
                dst: dst.into(),
                label: None,
            });
        self
    }

    /// A labeled branch edge. Use [`EdgeLabel::Default`] for the
    /// mandatory fallback.
    pub fn branch_edge(
        mut self,
        src: impl Into<String>,
        dst: impl Into<String>,
        label: EdgeLabel,
    ) -> Self {
        self.edges.entry(src.into()).or_default().push(Edge {
            dst: dst.into(),
            label: Some(label),
        });
        self
    }

    /// Validate and produce an immutable [`Graph`].
    ///
    /// Enforces (spec.md §4.1):
    /// - exactly one start, at least one end;
    /// - every node reachable from start;
    /// - every node reaches some end;
    /// - every branch has ≥ 2 outgoing edges including a `default`;
    /// - every edge references a node that exists.
    pub fn build(self) -> Result<Graph, GraphError> {
        for edges in self.edges.values() {
            for e in edges {
                if !self.nodes.contains_key(&e.dst) {
                    return Err(GraphError::UnknownNode(e.dst.clone()));
                }
            }
        }

        let starts: Vec<&NodeId> = self
            .nodes
            .values()
            .filter(|n| matches!(n.kind, NodeKind::Start))
            .map(|n| &n.id)
            .collect();
        if starts.len() != 1 {
            return Err(GraphError::WrongStartCount(starts.len()));
        }
        let start = starts[0].clone();

        let ends: Vec<&NodeId> = self
            .nodes
            .values()
            .filter(|n| matches!(n.kind, NodeKind::End))
            .map(|n| &n.id)
            .collect();
        if ends.is_empty() {
            return Err(GraphError::NoEndNode);
        }

        for (id, node) in &self.nodes {
            if let NodeKind::Branch { .. } = node.kind {
                let edges = self.edges.get(id).map(Vec::as_slice).unwrap_or(&[]);
                if edges.len() < 2 {
                    return Err(GraphError::BranchTooFewEdges(id.clone()));
                }
                if !edges.iter().any(|e| matches!(e.label, Some(EdgeLabel::Default))) {
                    return Err(GraphError::BranchMissingDefault(id.clone()));
                }
            }
        }

        let reachable = self.reachable_from(&start);
        for id in self.nodes.keys() {
            if !reachable.contains(id) {
                return Err(GraphError::Unreachable(id.clone()));
            }
        }

        let end_set: HashSet<&NodeId> = ends.into_iter().collect();
        for id in self.nodes.keys() {
            if !self.reaches_any(id, &end_set) {
                return Err(GraphError::DeadEnd(id.clone()));
            }
        }

        Ok(Graph {
            nodes: self.nodes,
            edges: self.edges,
            start,
        })
    }

    fn reachable_from(&self, start: &str) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(start.to_string());
        seen.insert(start.to_string());
        while let Some(id) = queue.pop_front() {
            if let Some(edges) = self.edges.get(&id) {
                for e in edges {
                    if seen.insert(e.dst.clone()) {
                        queue.push_back(e.dst.clone());
                    }
                }
            }
        }
        seen
    }

    fn reaches_any(&self, from: &str, targets: &HashSet<&NodeId>) -> bool {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(from.to_string());
        seen.insert(from.to_string());
        while let Some(id) = queue.pop_front() {
            if targets.iter().any(|t| t.as_str() == id) {
                return true;
            }
            if let Some(edges) = self.edges.get(&id) {
                for e in edges {
                    if seen.insert(e.dst.clone()) {
                        queue.push_back(e.dst.clone());
                    }
                }
            }
        }
        false
    }
}
