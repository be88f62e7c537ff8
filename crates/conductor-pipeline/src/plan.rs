//! The per-cycle decision record emitted by the scheduler.

use chrono::{DateTime, Utc};
use conductor_types::NodeStatus;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    SpawnWorker,
    DispatchValidation,
    RequestApproval,
    ApplyTransition,
    SignalStuck,
    SignalComplete,
    Initialize,
    SyncJoin,
    EvaluateCondition,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::SpawnWorker => "spawn_worker",
            ActionKind::DispatchValidation => "dispatch_validation",
            ActionKind::RequestApproval => "request_approval",
            ActionKind::ApplyTransition => "apply_transition",
            ActionKind::SignalStuck => "signal_stuck",
            ActionKind::SignalComplete => "signal_complete",
            ActionKind::Initialize => "initialize",
            ActionKind::SyncJoin => "sync_join",
            ActionKind::EvaluateCondition => "evaluate_condition",
        }
    }

    /// Actions the runner resolves on its own by driving the node to `validated`.
    pub fn completes_structurally(&self) -> bool {
        matches!(
            self,
            ActionKind::Initialize
                | ActionKind::ApplyTransition
                | ActionKind::SyncJoin
                | ActionKind::EvaluateCondition
        )
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAction {
    pub kind: ActionKind,
    /// Empty for pipeline-wide actions such as `signal_complete`.
    pub node_id: String,
    pub dependencies_satisfied: Vec<String>,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_status: Option<NodeStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_type: Option<String>,
}

impl NodeAction {
    pub fn new(kind: ActionKind, node_id: impl Into<String>, reason: impl Into<String>) -> Self {
        NodeAction {
            kind,
            node_id: node_id.into(),
            dependencies_satisfied: Vec::new(),
            reason: reason.into(),
            target_status: None,
            worker_type: None,
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies_satisfied = deps;
        self
    }

    pub fn with_target(mut self, status: NodeStatus) -> Self {
        self.target_status = Some(status);
        self
    }

    pub fn with_worker_type(mut self, worker_type: Option<&str>) -> Self {
        self.worker_type = worker_type.map(str::to_string);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedNode {
    pub node_id: String,
    pub missing_dependencies: Vec<String>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerPlan {
    pub created_at: DateTime<Utc>,
    pub actions: Vec<NodeAction>,
    pub blocked_nodes: Vec<BlockedNode>,
    pub completed_nodes: Vec<String>,
    pub active_nodes: Vec<String>,
    pub pipeline_complete: bool,
    pub summary: String,
}

impl RunnerPlan {
    pub fn actions_of(&self, kind: ActionKind) -> impl Iterator<Item = &NodeAction> {
        self.actions.iter().filter(move |a| a.kind == kind)
    }

    pub fn has_action(&self, kind: ActionKind) -> bool {
        self.actions_of(kind).next().is_some()
    }
}
