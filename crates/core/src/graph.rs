use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A single node of a compiled workflow graph. The `config` is whatever the
/// compiler produced for this node kind; this layer never interprets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDef {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub config: Value,
}

/// A directed edge of a compiled graph. A labelled edge is taken only when a
/// node routes to that label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDef {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// A compiled workflow definition: a directed acyclic graph of typed nodes
/// with a designated entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDef {
    pub entry: String,
    pub nodes: Vec<NodeDef>,
    #[serde(default)]
    pub edges: Vec<EdgeDef>,
}

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("graph has no nodes")]
    Empty,

    #[error("duplicate node id {0}")]
    DuplicateNode(String),

    #[error("entry node {0} is not defined")]
    MissingEntry(String),

    #[error("edge references undefined node {0}")]
    UnknownEdgeNode(String),

    #[error("graph contains a cycle")]
    Cyclic,

    #[error("node {0} is unreachable from the entry")]
    Unreachable(String),
}

impl GraphDef {
    pub fn node(&self, id: &str) -> Option<&NodeDef> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Outgoing edges of a node, in definition order.
    pub fn edges_from(&self, id: &str) -> Vec<&EdgeDef> {
        self.edges.iter().filter(|e| e.from == id).collect()
    }

    /// Clone the graph with a different entry node. Used by webhook dispatch
    /// to start execution at the trigger node.
    pub fn with_entry(&self, entry: &str) -> Self {
        let mut graph = self.clone();
        graph.entry = entry.to_string();
        graph
    }

    /// Structural validation: unique node ids, known edge endpoints, a
    /// defined entry, no cycles, everything reachable from a root. Roots are
    /// the entry plus every `trigger.*` node, since webhook dispatch enters
    /// the graph at the trigger.
    pub fn validate(&self) -> Result<(), GraphError> {
        if self.nodes.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut indices: HashMap<&str, NodeIndex> = HashMap::new();

        for node in &self.nodes {
            if indices.contains_key(node.id.as_str()) {
                return Err(GraphError::DuplicateNode(node.id.clone()));
            }
            let idx = graph.add_node(node.id.as_str());
            indices.insert(node.id.as_str(), idx);
        }

        let entry_idx = *indices
            .get(self.entry.as_str())
            .ok_or_else(|| GraphError::MissingEntry(self.entry.clone()))?;

        for edge in &self.edges {
            let from = *indices
                .get(edge.from.as_str())
                .ok_or_else(|| GraphError::UnknownEdgeNode(edge.from.clone()))?;
            let to = *indices
                .get(edge.to.as_str())
                .ok_or_else(|| GraphError::UnknownEdgeNode(edge.to.clone()))?;
            graph.add_edge(from, to, ());
        }

        if petgraph::algo::is_cyclic_directed(&graph) {
            return Err(GraphError::Cyclic);
        }

        let mut reached = vec![false; graph.node_count()];
        let mut roots = vec![entry_idx];
        for node in &self.nodes {
            if node.kind.starts_with("trigger") {
                roots.push(indices[node.id.as_str()]);
            }
        }
        for root in roots {
            let mut bfs = Bfs::new(&graph, root);
            while let Some(idx) = bfs.next(&graph) {
                reached[idx.index()] = true;
            }
        }
        for node in &self.nodes {
            let idx = indices[node.id.as_str()];
            if !reached[idx.index()] {
                return Err(GraphError::Unreachable(node.id.clone()));
            }
        }

        Ok(())
    }
}
