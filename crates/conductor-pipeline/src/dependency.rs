//! Forward-edge dependency resolution.
//!
//! Only forward edges create dependencies. Retry back-edges
//! (`condition="fail"` or a dashed style) are left out of the predecessor map;
//! otherwise every retry loop would make its own upstream node look unready
//! forever.

use std::collections::{BTreeMap, BTreeSet};

use conductor_types::{ConductorError, NodeStatus, Result};

use crate::graph::PipelineGraph;

/// Forward predecessor sets for every node of a graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyResolver {
    predecessors: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyResolver {
    pub fn new(graph: &PipelineGraph) -> Self {
        let mut predecessors: BTreeMap<String, BTreeSet<String>> = graph
            .node_ids()
            .map(|id| (id.to_string(), BTreeSet::new()))
            .collect();
        for edge in graph.all_edges().iter().filter(|e| e.is_forward()) {
            predecessors
                .entry(edge.to.clone())
                .or_default()
                .insert(edge.from.clone());
        }
        DependencyResolver { predecessors }
    }

    /// Forward predecessors of `node_id`, or `None` for an unknown node.
    pub fn predecessors(&self, node_id: &str) -> Option<&BTreeSet<String>> {
        self.predecessors.get(node_id)
    }

    pub fn predecessor_map(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.predecessors
    }

    /// A node is ready when it is not validated and every forward predecessor is.
    pub fn is_ready(&self, graph: &PipelineGraph, node_id: &str) -> bool {
        let Some(node) = graph.node(node_id) else {
            return false;
        };
        if node.status() == NodeStatus::Validated {
            return false;
        }
        self.missing_dependencies(graph, node_id).is_empty()
    }

    /// Ready nodes in id order.
    pub fn ready_nodes(&self, graph: &PipelineGraph) -> Vec<String> {
        graph
            .node_ids()
            .filter(|id| self.is_ready(graph, id))
            .map(str::to_string)
            .collect()
    }

    /// Forward predecessors of `node_id` that are not validated yet.
    pub fn missing_dependencies(&self, graph: &PipelineGraph, node_id: &str) -> Vec<String> {
        self.predecessors
            .get(node_id)
            .into_iter()
            .flatten()
            .filter(|p| {
                graph
                    .node(p)
                    .map(|n| n.status() != NodeStatus::Validated)
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    /// Satisfied forward predecessors of `node_id`.
    pub fn satisfied_dependencies(&self, graph: &PipelineGraph, node_id: &str) -> Vec<String> {
        self.predecessors
            .get(node_id)
            .into_iter()
            .flatten()
            .filter(|p| {
                graph
                    .node(p)
                    .is_some_and(|n| n.status() == NodeStatus::Validated)
            })
            .cloned()
            .collect()
    }

    /// Kahn's algorithm over forward edges, ties broken by node id.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .predecessors
            .iter()
            .map(|(id, preds)| (id.as_str(), preds.len()))
            .collect();
        let mut successors: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (id, preds) in &self.predecessors {
            for p in preds {
                successors.entry(p.as_str()).or_default().push(id.as_str());
            }
        }

        let mut frontier: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.predecessors.len());

        while let Some(id) = frontier.pop_first() {
            order.push(id.to_string());
            for succ in successors.get(id).into_iter().flatten() {
                if let Some(d) = in_degree.get_mut(succ) {
                    *d -= 1;
                    if *d == 0 {
                        frontier.insert(succ);
                    }
                }
            }
        }

        if order.len() != self.predecessors.len() {
            let stuck: Vec<&str> = in_degree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(id, _)| *id)
                .collect();
            return Err(ConductorError::ValidationError(format!(
                "forward edges form a cycle through: {}",
                stuck.join(", ")
            )));
        }
        Ok(order)
    }

    /// One forward cycle, if any, as a closed path (`[a, b, a]`).
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        let mut successors: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (id, preds) in &self.predecessors {
            for p in preds {
                successors.entry(p.as_str()).or_default().push(id.as_str());
            }
        }

        let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
        for start in self.predecessors.keys() {
            if marks.contains_key(start.as_str()) {
                continue;
            }
            // Iterative DFS: (node, next successor index)
            let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
            marks.insert(start.as_str(), Mark::Visiting);
            while let Some((node, idx)) = stack.last_mut() {
                let succs = successors.get(*node).map(Vec::as_slice).unwrap_or(&[]);
                if *idx < succs.len() {
                    let next = succs[*idx];
                    *idx += 1;
                    match marks.get(next) {
                        Some(Mark::Visiting) => {
                            let pos = stack.iter().position(|(n, _)| *n == next).unwrap_or(0);
                            let mut cycle: Vec<String> =
                                stack[pos..].iter().map(|(n, _)| n.to_string()).collect();
                            cycle.push(next.to_string());
                            return Some(cycle);
                        }
                        Some(Mark::Done) => {}
                        None => {
                            marks.insert(next, Mark::Visiting);
                            stack.push((next, 0));
                        }
                    }
                } else {
                    marks.insert(*node, Mark::Done);
                    stack.pop();
                }
            }
        }
        None
    }
}

/// Ready nodes of `graph` in id order.
pub fn ready_nodes(graph: &PipelineGraph) -> Vec<String> {
    DependencyResolver::new(graph).ready_nodes(graph)
}
