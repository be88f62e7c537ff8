//! Decide what the runner should do next.
//!
//! [`plan_cycle`] is a pure function of the graph and the runner state. The
//! maximum-retry cutoff lives here: the state machine always allows
//! `failed -> active`, the scheduler stops proposing it.

use chrono::Utc;
use conductor_types::NodeStatus;

use crate::dependency::DependencyResolver;
use crate::graph::{NodeKind, PipelineGraph, PipelineNode};
use crate::plan::{ActionKind, BlockedNode, NodeAction, RunnerPlan};
use crate::runner_state::RunnerState;

fn start_action(node: &PipelineNode, retry: bool) -> NodeAction {
    let (kind, what) = match node.kind() {
        NodeKind::Start => (ActionKind::Initialize, "start node"),
        NodeKind::Exit => (ActionKind::ApplyTransition, "exit node"),
        NodeKind::Noop => (ActionKind::ApplyTransition, "no-op node"),
        NodeKind::Conditional => (ActionKind::EvaluateCondition, "conditional node"),
        NodeKind::Join => (ActionKind::SyncJoin, "join node"),
        NodeKind::Approval => (ActionKind::RequestApproval, "approval gate"),
        NodeKind::Worker => (ActionKind::SpawnWorker, "worker node"),
    };
    let reason = if retry {
        format!("retrying {what} '{}'", node.id)
    } else {
        format!("{what} '{}' is ready", node.id)
    };
    let action = NodeAction::new(kind, node.id.clone(), reason).with_worker_type(node.worker_type());
    if kind.completes_structurally() {
        action.with_target(NodeStatus::Validated)
    } else {
        action.with_target(NodeStatus::Active)
    }
}

/// Plan one decision cycle. Nodes are considered in id order.
pub fn plan_cycle(graph: &PipelineGraph, state: &RunnerState, max_retries: u32) -> RunnerPlan {
    let resolver = DependencyResolver::new(graph);
    let mut actions = Vec::new();
    let mut blocked_nodes = Vec::new();
    let mut completed_nodes = Vec::new();
    let mut active_nodes = Vec::new();

    for node in graph.all_nodes() {
        let id = node.id.as_str();
        let satisfied = resolver.satisfied_dependencies(graph, id);
        match node.status() {
            NodeStatus::Validated => completed_nodes.push(node.id.clone()),
            NodeStatus::Pending => {
                let missing = resolver.missing_dependencies(graph, id);
                if missing.is_empty() {
                    actions.push(start_action(node, false).with_dependencies(satisfied));
                } else {
                    blocked_nodes.push(BlockedNode {
                        node_id: node.id.clone(),
                        reason: format!("waiting on {}", missing.join(", ")),
                        missing_dependencies: missing,
                    });
                }
            }
            NodeStatus::Active => active_nodes.push(node.id.clone()),
            NodeStatus::ImplComplete => {
                if state.awaiting_validation.contains(id) {
                    active_nodes.push(node.id.clone());
                } else {
                    actions.push(
                        NodeAction::new(
                            ActionKind::DispatchValidation,
                            id,
                            format!("'{id}' is implemented and needs review"),
                        )
                        .with_dependencies(satisfied)
                        .with_target(NodeStatus::Validated),
                    );
                }
            }
            NodeStatus::Failed => {
                let retries = state.retry_count(id);
                if retries < max_retries {
                    actions.push(start_action(node, true).with_dependencies(satisfied));
                } else {
                    actions.push(
                        NodeAction::new(
                            ActionKind::SignalStuck,
                            id,
                            format!("'{id}' failed {retries} times (max {max_retries})"),
                        )
                        .with_dependencies(satisfied),
                    );
                }
            }
        }
    }

    let total = graph.node_count();
    let pipeline_complete = total > 0 && completed_nodes.len() == total;
    if pipeline_complete {
        actions.clear();
        actions.push(NodeAction::new(
            ActionKind::SignalComplete,
            "",
            format!("all {total} nodes validated"),
        ));
    }

    let summary = format!(
        "{} action(s), {} blocked, {} active, {}/{} validated",
        actions.len(),
        blocked_nodes.len(),
        active_nodes.len(),
        completed_nodes.len(),
        total
    );
    tracing::debug!(pipeline = %graph.name, %summary, "Planned cycle");

    RunnerPlan {
        created_at: Utc::now(),
        actions,
        blocked_nodes,
        completed_nodes,
        active_nodes,
        pipeline_complete,
        summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> RunnerState {
        RunnerState::new("p", "p.dot", "s-1")
    }

    fn kinds(plan: &RunnerPlan) -> Vec<(ActionKind, &str)> {
        plan.actions
            .iter()
            .map(|a| (a.kind, a.node_id.as_str()))
            .collect()
    }

    #[test]
    fn fresh_pipeline_initializes_start_and_blocks_the_rest() {
        let g = PipelineGraph::parse(
            r#"digraph P {
                start [handler="start"]; impl; done [handler="exit"]
                start -> impl -> done
            }"#,
        )
        .unwrap();
        let plan = plan_cycle(&g, &state(), 3);
        assert_eq!(kinds(&plan), vec![(ActionKind::Initialize, "start")]);
        assert_eq!(plan.blocked_nodes.len(), 2);
        let impl_blocked = plan.blocked_nodes.iter().find(|b| b.node_id == "impl").unwrap();
        assert_eq!(impl_blocked.missing_dependencies, vec!["start".to_string()]);
        assert!(!plan.pipeline_complete);
    }

    #[test]
    fn handler_decides_the_action() {
        let g = PipelineGraph::parse(
            r#"digraph P {
                a [handler="conditional"]; b [handler="join"]; c [handler="wait_human"]
                d [handler="noop"]; e [worker_type="backend"]
            }"#,
        )
        .unwrap();
        let plan = plan_cycle(&g, &state(), 3);
        assert_eq!(
            kinds(&plan),
            vec![
                (ActionKind::EvaluateCondition, "a"),
                (ActionKind::SyncJoin, "b"),
                (ActionKind::RequestApproval, "c"),
                (ActionKind::ApplyTransition, "d"),
                (ActionKind::SpawnWorker, "e"),
            ]
        );
        assert_eq!(plan.actions[4].worker_type.as_deref(), Some("backend"));
    }

    #[test]
    fn implemented_node_is_dispatched_once() {
        let g = PipelineGraph::parse(r#"digraph P { a [status="impl_complete"] }"#).unwrap();
        let mut s = state();
        let plan = plan_cycle(&g, &s, 3);
        assert_eq!(kinds(&plan), vec![(ActionKind::DispatchValidation, "a")]);

        s.awaiting_validation.insert("a".into());
        let plan = plan_cycle(&g, &s, 3);
        assert!(plan.actions.is_empty());
        assert_eq!(plan.active_nodes, vec!["a".to_string()]);
    }

    #[test]
    fn failed_node_retries_until_cutoff() {
        let g = PipelineGraph::parse(r#"digraph P { a [status="failed"] }"#).unwrap();
        let mut s = state();
        s.increment_retry("a");
        let plan = plan_cycle(&g, &s, 2);
        assert_eq!(kinds(&plan), vec![(ActionKind::SpawnWorker, "a")]);
        assert!(plan.actions[0].reason.contains("retrying"));

        s.increment_retry("a");
        let plan = plan_cycle(&g, &s, 2);
        assert_eq!(kinds(&plan), vec![(ActionKind::SignalStuck, "a")]);
    }

    #[test]
    fn all_validated_signals_complete() {
        let g = PipelineGraph::parse(
            r#"digraph P { a [status="validated"]; b [status="validated"]; a -> b }"#,
        )
        .unwrap();
        let plan = plan_cycle(&g, &state(), 3);
        assert!(plan.pipeline_complete);
        assert_eq!(kinds(&plan), vec![(ActionKind::SignalComplete, "")]);
        assert_eq!(plan.completed_nodes.len(), 2);
    }

    #[test]
    fn satisfied_dependencies_are_listed() {
        let g = PipelineGraph::parse(
            r#"digraph P { a [status="validated"]; b; a -> b; b -> a [style="dashed"] }"#,
        )
        .unwrap();
        let plan = plan_cycle(&g, &state(), 3);
        assert_eq!(plan.actions[0].node_id, "b");
        assert_eq!(plan.actions[0].dependencies_satisfied, vec!["a".to_string()]);
    }
}
