//! Node lifecycle transitions.
//!
//! ```text
//! pending -> active -> impl_complete -> validated
//!              ^             |
//!              +-- failed <--+
//! ```
//!
//! The state machine validates and applies a single status change. It never
//! persists anything: callers record every applied [`Transition`] in the audit
//! log and write the graph back themselves.

use conductor_types::{ConductorError, NodeStatus, Result};

use crate::graph::PipelineGraph;

/// A validated status change for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub node: String,
    pub from: NodeStatus,
    pub to: NodeStatus,
}

/// Every legal `(from, to)` pair.
pub fn transition_table() -> Vec<(NodeStatus, NodeStatus)> {
    NodeStatus::ALL
        .iter()
        .flat_map(|from| from.legal_targets().iter().map(move |to| (*from, *to)))
        .collect()
}

/// Shortest chain of legal statuses leading from `from` to `to`, excluding `from`.
///
/// Used to drive structural nodes (start, join, exit) straight to
/// `validated` one audited step at a time. `None` when `to` is unreachable.
pub fn path_to(from: NodeStatus, to: NodeStatus) -> Option<Vec<NodeStatus>> {
    if from == to {
        return Some(Vec::new());
    }
    let mut previous: std::collections::BTreeMap<NodeStatus, NodeStatus> = Default::default();
    let mut queue = std::collections::VecDeque::from([from]);
    while let Some(current) = queue.pop_front() {
        for next in current.legal_targets() {
            if *next == from || previous.contains_key(next) {
                continue;
            }
            previous.insert(*next, current);
            if *next == to {
                let mut path = vec![to];
                let mut cursor = to;
                while let Some(prev) = previous.get(&cursor) {
                    if *prev == from {
                        break;
                    }
                    path.push(*prev);
                    cursor = *prev;
                }
                path.reverse();
                return Some(path);
            }
            queue.push_back(*next);
        }
    }
    None
}

/// Check that `node_id` may move to `to` without mutating anything.
pub fn check_transition(graph: &PipelineGraph, node_id: &str, to: NodeStatus) -> Result<Transition> {
    let node = graph.node(node_id).ok_or_else(|| ConductorError::UnknownNode {
        node: node_id.to_string(),
        line: 0,
    })?;
    let from = node.status();
    if !from.can_transition_to(to) {
        return Err(ConductorError::IllegalTransition {
            node: node_id.to_string(),
            from,
            to,
            legal: from.legal_targets().to_vec(),
        });
    }
    Ok(Transition {
        node: node_id.to_string(),
        from,
        to,
    })
}

/// Validate and apply a transition. The graph is untouched when the transition is rejected.
pub fn apply_transition(
    graph: &mut PipelineGraph,
    node_id: &str,
    to: NodeStatus,
) -> Result<Transition> {
    let transition = check_transition(graph, node_id, to)?;
    if let Some(node) = graph.node_mut(node_id) {
        node.set_status(to);
    }
    tracing::info!(
        node = %node_id,
        from = %transition.from,
        to = %transition.to,
        "Applied transition"
    );
    Ok(transition)
}
