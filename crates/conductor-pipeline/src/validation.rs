//! Pipeline validation: lint rules and diagnostics.
//!
//! Call [`validate`] for advisory diagnostics or [`validate_or_raise`] to fail
//! on `Error`-severity issues. Parsing already rejects unknown nodes and bad
//! status values, so these rules cover graph shape and attribute hygiene.

use std::collections::{BTreeSet, VecDeque};

use conductor_types::{ConductorError, Result};
use serde::Serialize;

use crate::dependency::DependencyResolver;
use crate::graph::{NodeKind, PipelineGraph};

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub node_id: Option<String>,
    pub edge: Option<(String, String)>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        })
    }
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic>;
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct ForwardCycleRule;
impl LintRule for ForwardCycleRule {
    fn name(&self) -> &str { "forward_cycle" }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let Some(cycle) = DependencyResolver::new(graph).find_cycle() else {
            return vec![];
        };
        // Self-loops have their own rule.
        if cycle.len() <= 2 {
            return vec![];
        }
        vec![Diagnostic {
            rule: self.name().into(),
            severity: Severity::Error,
            message: format!("Forward edges form a cycle: {}", cycle.join(" -> ")),
            node_id: cycle.first().cloned(),
            edge: None,
            fix: Some(
                "Mark the edge that loops back as a retry edge (condition=\"fail\" or style=\"dashed\")"
                    .into(),
            ),
        }]
    }
}

struct SelfLoopRule;
impl LintRule for SelfLoopRule {
    fn name(&self) -> &str { "self_loop" }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        graph
            .all_edges()
            .iter()
            .filter(|e| e.from == e.to && e.is_forward())
            .map(|e| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!("Node '{}' depends on itself (line {})", e.from, e.line),
                node_id: Some(e.from.clone()),
                edge: Some((e.from.clone(), e.to.clone())),
                fix: Some(format!(
                    "Remove the edge or mark it style=\"dashed\" to make '{}' a retry loop",
                    e.from
                )),
            })
            .collect()
    }
}

struct NoEntryRule;
impl LintRule for NoEntryRule {
    fn name(&self) -> &str { "no_entry" }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        if graph.node_count() == 0 {
            return vec![];
        }
        let resolver = DependencyResolver::new(graph);
        let has_entry = resolver
            .predecessor_map()
            .values()
            .any(|preds| preds.is_empty());
        if has_entry {
            return vec![];
        }
        vec![Diagnostic {
            rule: self.name().into(),
            severity: Severity::Error,
            message: "Every node has a forward predecessor; nothing can ever become ready".into(),
            node_id: None,
            edge: None,
            fix: Some("Add a start node with no incoming forward edges".into()),
        }]
    }
}

struct UnknownHandlerRule;
impl LintRule for UnknownHandlerRule {
    fn name(&self) -> &str { "unknown_handler" }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        graph
            .all_nodes()
            .filter_map(|n| {
                let handler = n.handler()?;
                if NodeKind::is_known_handler(handler) {
                    return None;
                }
                Some(Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Warning,
                    message: format!(
                        "Node '{}' has unknown handler '{handler}'; it will run as a worker node",
                        n.id
                    ),
                    node_id: Some(n.id.clone()),
                    edge: None,
                    fix: Some(format!("Use one of: {}", NodeKind::KNOWN_HANDLERS.join(", "))),
                })
            })
            .collect()
    }
}

struct RetryEdgeDirectionRule;
impl RetryEdgeDirectionRule {
    /// Every node with a forward path into `node_id`.
    fn ancestors(resolver: &DependencyResolver, node_id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([node_id.to_string()]);
        while let Some(current) = queue.pop_front() {
            for pred in resolver.predecessors(&current).into_iter().flatten() {
                if seen.insert(pred.clone()) {
                    queue.push_back(pred.clone());
                }
            }
        }
        seen
    }
}

impl LintRule for RetryEdgeDirectionRule {
    fn name(&self) -> &str { "retry_edge_direction" }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let resolver = DependencyResolver::new(graph);
        graph
            .all_edges()
            .iter()
            .filter(|e| e.is_retry_edge() && e.from != e.to)
            .filter(|e| !Self::ancestors(&resolver, &e.from).contains(&e.to))
            .map(|e| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Warning,
                message: format!(
                    "Retry edge {} -> {} does not point upstream; '{}' is not a forward ancestor of '{}'",
                    e.from, e.to, e.to, e.from
                ),
                node_id: None,
                edge: Some((e.from.clone(), e.to.clone())),
                fix: Some("Point retry edges back at a node the source depends on".into()),
            })
            .collect()
    }
}

struct AcceptanceMissingRule;
impl LintRule for AcceptanceMissingRule {
    fn name(&self) -> &str { "acceptance_missing" }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        graph
            .all_nodes()
            .filter(|n| n.kind() == NodeKind::Worker)
            .filter(|n| n.acceptance().map_or(true, |a| a.trim().is_empty()))
            .map(|n| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Info,
                message: format!("Worker node '{}' has no acceptance criteria", n.id),
                node_id: Some(n.id.clone()),
                edge: None,
                fix: Some(format!("Add acceptance=\"...\" to '{}'", n.id)),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in lint rules and return collected diagnostics.
pub fn validate(graph: &PipelineGraph) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(ForwardCycleRule),
        Box::new(SelfLoopRule),
        Box::new(NoEntryRule),
        Box::new(UnknownHandlerRule),
        Box::new(RetryEdgeDirectionRule),
        Box::new(AcceptanceMissingRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(graph));
    }
    diagnostics
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_or_raise(graph: &PipelineGraph) -> Result<Vec<Diagnostic>> {
    let diagnostics = validate(graph);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .map(|d| d.message.clone())
        .collect();
    if !errors.is_empty() {
        return Err(ConductorError::ValidationError(errors.join("; ")));
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
