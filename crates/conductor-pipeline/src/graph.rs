use std::collections::BTreeMap;
use std::path::Path;

use conductor_dot::{AttributeValue, Attributes, DotGraph, EdgeDef, NodeDef};
use conductor_types::{ConductorError, NodeStatus, Result};

/// Ordered attribute map. Every custom attribute survives a save/restore round trip.
pub type AttrMap = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineGraph {
    pub name: String,
    /// Graph-level attributes (`graph [...]` and `key = value` statements).
    pub attrs: AttrMap,
    pub node_defaults: AttrMap,
    pub edge_defaults: AttrMap,
    nodes: BTreeMap<String, PipelineNode>,
    edges: Vec<PipelineEdge>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineNode {
    pub id: String,
    status: NodeStatus,
    /// All attributes except `status`.
    pub attrs: AttrMap,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineEdge {
    pub from: String,
    pub to: String,
    pub attrs: AttrMap,
    pub line: usize,
}

/// What the scheduler does with a ready node, derived from its `handler`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Start,
    Exit,
    Noop,
    Conditional,
    Join,
    Approval,
    /// Anything else: a worker process implements the node.
    Worker,
}

impl NodeKind {
    /// Handler names with a dedicated meaning. Other names fall back to [`NodeKind::Worker`].
    pub const KNOWN_HANDLERS: &'static [&'static str] = &[
        "start",
        "exit",
        "noop",
        "conditional",
        "join",
        "parallel_join",
        "approval",
        "wait_human",
        "worker",
        "codergen",
        "tool",
    ];

    pub fn from_handler(handler: Option<&str>) -> Self {
        match handler {
            Some("start") => NodeKind::Start,
            Some("exit") => NodeKind::Exit,
            Some("noop") => NodeKind::Noop,
            Some("conditional") => NodeKind::Conditional,
            Some("join") | Some("parallel_join") => NodeKind::Join,
            Some("approval") | Some("wait_human") => NodeKind::Approval,
            _ => NodeKind::Worker,
        }
    }

    pub fn is_known_handler(handler: &str) -> bool {
        Self::KNOWN_HANDLERS.contains(&handler)
    }

    /// Nodes the runner completes itself, without a worker or a human.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            NodeKind::Start | NodeKind::Exit | NodeKind::Noop | NodeKind::Conditional | NodeKind::Join
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeCondition {
    Pass,
    Fail,
    Other(String),
}

// --- Attribute conversion ---

fn to_attr_map(attrs: &Attributes) -> AttrMap {
    attrs
        .iter()
        .map(|(k, v)| (k.clone(), v.to_string()))
        .collect()
}

fn to_dot_attrs(attrs: &AttrMap) -> Attributes {
    attrs
        .iter()
        .map(|(k, v)| (k.clone(), AttributeValue::String(v.clone())))
        .collect()
}

impl PipelineNode {
    pub fn new(id: impl Into<String>, status: NodeStatus) -> Self {
        PipelineNode {
            id: id.into(),
            status,
            attrs: AttrMap::new(),
            line: 0,
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        if key == "status" {
            if let Ok(status) = value.parse() {
                self.status = status;
            }
        } else {
            self.attrs.insert(key, value);
        }
        self
    }

    fn from_def(def: &NodeDef) -> Result<Self> {
        let mut attrs = to_attr_map(&def.attrs);
        let status = match attrs.remove("status") {
            Some(raw) => raw
                .parse::<NodeStatus>()
                .map_err(|e| ConductorError::InvalidAttribute {
                    node: def.id.clone(),
                    key: "status".into(),
                    value: raw.clone(),
                    message: e.to_string(),
                })?,
            None => NodeStatus::Pending,
        };
        Ok(PipelineNode {
            id: def.id.clone(),
            status,
            attrs,
            line: def.line,
        })
    }

    pub fn status(&self) -> NodeStatus {
        self.status
    }

    /// Only the state machine changes a node's status.
    pub(crate) fn set_status(&mut self, status: NodeStatus) {
        self.status = status;
        self.attrs
            .insert("fillcolor".into(), status.fill_color().to_string());
        self.attrs.insert("style".into(), "filled".into());
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    pub fn handler(&self) -> Option<&str> {
        self.attr("handler")
    }

    pub fn kind(&self) -> NodeKind {
        NodeKind::from_handler(self.handler())
    }

    pub fn worker_type(&self) -> Option<&str> {
        self.attr("worker_type")
    }

    /// External task id. `bead_id` is the canonical key.
    pub fn bead_id(&self) -> Option<&str> {
        self.attr("bead_id").or_else(|| self.attr("external_id"))
    }

    pub fn acceptance(&self) -> Option<&str> {
        self.attr("acceptance")
    }

    /// Display label, falling back to the node id.
    pub fn label(&self) -> &str {
        self.attr("label").unwrap_or(&self.id)
    }

    pub fn branch(&self) -> Option<&str> {
        self.attr("branch")
    }

    /// All attributes including `status`, as written to disk.
    pub fn full_attrs(&self) -> AttrMap {
        let mut attrs = self.attrs.clone();
        attrs.insert("status".into(), self.status.to_string());
        attrs
    }
}

impl PipelineEdge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        PipelineEdge {
            from: from.into(),
            to: to.into(),
            attrs: AttrMap::new(),
            line: 0,
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    fn from_def(def: &EdgeDef) -> Self {
        PipelineEdge {
            from: def.from.clone(),
            to: def.to.clone(),
            attrs: to_attr_map(&def.attrs),
            line: def.line,
        }
    }

    pub fn label(&self) -> Option<&str> {
        self.attrs.get("label").map(String::as_str)
    }

    pub fn style(&self) -> Option<&str> {
        self.attrs.get("style").map(String::as_str)
    }

    pub fn condition(&self) -> Option<EdgeCondition> {
        self.attrs.get("condition").map(|c| match c.trim() {
            c if c.eq_ignore_ascii_case("pass") => EdgeCondition::Pass,
            c if c.eq_ignore_ascii_case("fail") => EdgeCondition::Fail,
            other => EdgeCondition::Other(other.to_string()),
        })
    }

    /// Retry back-edges (`condition="fail"` or a dashed style) never gate readiness.
    pub fn is_retry_edge(&self) -> bool {
        self.condition() == Some(EdgeCondition::Fail)
            || self.style().is_some_and(|s| s.contains("dashed"))
    }

    pub fn is_forward(&self) -> bool {
        !self.is_retry_edge()
    }
}

impl PipelineGraph {
    /// Build from a parsed DOT graph. Subgraphs are flattened into the top level.
    ///
    /// Every edge endpoint must have its own node statement somewhere in the
    /// document; otherwise [`ConductorError::UnknownNode`] names the edge's line.
    pub fn from_dot(graph: DotGraph) -> Result<Self> {
        // Gather node definitions from every scope. A declared definition wins
        // over an edge-only mention of the same id.
        let mut defs: BTreeMap<String, NodeDef> = BTreeMap::new();
        let scopes = std::iter::once(&graph.nodes).chain(graph.subgraphs.iter().map(|sg| &sg.nodes));
        for scope in scopes {
            for (id, def) in scope {
                match defs.get_mut(id) {
                    Some(existing) if existing.declared && def.declared => {
                        existing.attrs.extend(def.attrs.clone());
                    }
                    Some(existing) if !existing.declared && def.declared => {
                        *existing = def.clone();
                    }
                    Some(_) => {}
                    None => {
                        defs.insert(id.clone(), def.clone());
                    }
                }
            }
        }

        let mut edge_defs: Vec<&EdgeDef> = graph
            .edges
            .iter()
            .chain(graph.subgraphs.iter().flat_map(|sg| sg.edges.iter()))
            .collect();
        edge_defs.sort_by_key(|e| e.line);

        for edge in &edge_defs {
            for endpoint in [&edge.from, &edge.to] {
                let declared = defs.get(endpoint.as_str()).is_some_and(|d| d.declared);
                if !declared {
                    return Err(ConductorError::UnknownNode {
                        node: endpoint.clone(),
                        line: edge.line,
                    });
                }
            }
        }

        let mut nodes = BTreeMap::new();
        for (id, def) in &defs {
            nodes.insert(id.clone(), PipelineNode::from_def(def)?);
        }
        let edges = edge_defs.into_iter().map(PipelineEdge::from_def).collect();

        Ok(PipelineGraph {
            name: graph.name,
            attrs: to_attr_map(&graph.attrs),
            node_defaults: to_attr_map(&graph.node_defaults),
            edge_defaults: to_attr_map(&graph.edge_defaults),
            nodes,
            edges,
        })
    }

    /// Parse DOT text into a pipeline graph. Attribute values keep their source text.
    pub fn parse(text: &str) -> Result<Self> {
        Self::from_dot(conductor_dot::parse_verbatim(text)?)
    }

    /// Read and parse a graph file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = conductor_types::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Assemble a graph from parts, checking that every edge endpoint exists.
    pub fn from_parts(
        name: impl Into<String>,
        attrs: AttrMap,
        nodes: Vec<PipelineNode>,
        edges: Vec<PipelineEdge>,
    ) -> Result<Self> {
        let nodes: BTreeMap<String, PipelineNode> =
            nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
        for edge in &edges {
            for endpoint in [&edge.from, &edge.to] {
                if !nodes.contains_key(endpoint) {
                    return Err(ConductorError::UnknownNode {
                        node: endpoint.clone(),
                        line: edge.line,
                    });
                }
            }
        }
        Ok(PipelineGraph {
            name: name.into(),
            attrs,
            node_defaults: AttrMap::new(),
            edge_defaults: AttrMap::new(),
            nodes,
            edges,
        })
    }

    pub fn node(&self, id: &str) -> Option<&PipelineNode> {
        self.nodes.get(id)
    }

    pub(crate) fn node_mut(&mut self, id: &str) -> Option<&mut PipelineNode> {
        self.nodes.get_mut(id)
    }

    /// Nodes in id order.
    pub fn all_nodes(&self) -> impl Iterator<Item = &PipelineNode> {
        self.nodes.values()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Edges in declaration order.
    pub fn all_edges(&self) -> &[PipelineEdge] {
        &self.edges
    }

    pub fn outgoing_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a PipelineEdge> {
        self.edges.iter().filter(move |e| e.from == node_id)
    }

    pub fn incoming_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a PipelineEdge> {
        self.edges.iter().filter(move |e| e.to == node_id)
    }

    pub fn nodes_with_status(&self, status: NodeStatus) -> impl Iterator<Item = &PipelineNode> {
        self.nodes.values().filter(move |n| n.status == status)
    }

    pub fn is_complete(&self) -> bool {
        !self.nodes.is_empty() && self.nodes.values().all(|n| n.status == NodeStatus::Validated)
    }

    /// Build the DOT AST for this graph, in flattened form.
    pub fn to_dot_graph(&self) -> DotGraph {
        let nodes = self
            .nodes
            .values()
            .map(|n| {
                (
                    n.id.clone(),
                    NodeDef {
                        id: n.id.clone(),
                        attrs: to_dot_attrs(&n.full_attrs()),
                        line: n.line,
                        declared: true,
                    },
                )
            })
            .collect();
        let edges = self
            .edges
            .iter()
            .map(|e| EdgeDef {
                from: e.from.clone(),
                to: e.to.clone(),
                attrs: to_dot_attrs(&e.attrs),
                line: e.line,
            })
            .collect();
        DotGraph {
            name: self.name.clone(),
            attrs: to_dot_attrs(&self.attrs),
            nodes,
            edges,
            subgraphs: Vec::new(),
            node_defaults: to_dot_attrs(&self.node_defaults),
            edge_defaults: to_dot_attrs(&self.edge_defaults),
        }
    }

    /// Serialize to DOT text.
    pub fn to_dot(&self) -> String {
        conductor_dot::to_dot(&self.to_dot_graph())
    }

    /// Atomically write the graph back to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        conductor_types::fs::atomic_write(path, self.to_dot().as_bytes())?;
        tracing::debug!(graph = %self.name, path = %path.display(), "Wrote pipeline graph");
        Ok(())
    }
}
