//! Shared types, errors, node status, and durable-file helpers for the Conductor pipeline engine.
//!
//! This crate provides the foundational types used across all other Conductor crates:
//! - `ConductorError` — unified error taxonomy
//! - `NodeStatus` — the fixed node lifecycle and its legal-transition table
//! - `Layer` — the logical roles of the supervision hierarchy
//! - [`fs`] — atomic write-then-rename, advisory locks, and content hashing
//! - [`layout`] — state-root directory layout and the explicit session identity

pub mod fs;
pub mod layout;

pub use layout::{Role, SessionIdentity, StateLayout};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Unified error type for all Conductor subsystems.
#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    // === Structural Errors ===
    #[error("DOT parse error at line {line}, col {col}: {message}")]
    ParseError {
        line: usize,
        col: usize,
        message: String,
        source_snippet: Option<String>,
    },

    /// `line` is 0 when the reference did not come from a source file.
    #[error("Unknown node '{node}'{}", line_suffix(.line))]
    UnknownNode { node: String, line: usize },

    #[error("Invalid attribute {key}=\"{value}\" on node '{node}': {message}")]
    InvalidAttribute {
        node: String,
        key: String,
        value: String,
        message: String,
    },

    #[error("Pipeline validation failed: {0}")]
    ValidationError(String),

    // === Transition Errors ===
    #[error("Illegal transition for node '{node}': {from} -> {to} (legal targets from {from}: {})", format_targets(.legal))]
    IllegalTransition {
        node: String,
        from: NodeStatus,
        to: NodeStatus,
        legal: Vec<NodeStatus>,
    },

    // === Transport Errors ===
    #[error("Transport error on {channel}: {message}")]
    Transport { channel: String, message: String },

    #[error("Malformed signal {}: {message}", .path.display())]
    MalformedSignal { path: PathBuf, message: String },

    // === Timeout ===
    #[error("Timed out after {waited_ms}ms waiting on the {layer} mailbox")]
    Timeout { layer: String, waited_ms: u64 },

    // === Integrity Errors ===
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Malformed checkpoint {}: {message}", .path.display())]
    MalformedCheckpoint { path: PathBuf, message: String },

    // === Lookups ===
    #[error("File not found: {}", .path.display())]
    NotFound { path: PathBuf },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

fn line_suffix(line: &usize) -> String {
    if *line == 0 {
        String::new()
    } else {
        format!(" referenced at line {line}")
    }
}

fn format_targets(legal: &[NodeStatus]) -> String {
    if legal.is_empty() {
        return "none".to_string();
    }
    legal
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl ConductorError {
    /// Stable snake_case tag used in structured error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            ConductorError::ParseError { .. } => "parse_error",
            ConductorError::UnknownNode { .. } => "unknown_node",
            ConductorError::InvalidAttribute { .. } => "invalid_attribute",
            ConductorError::ValidationError(_) => "validation_error",
            ConductorError::IllegalTransition { .. } => "illegal_transition",
            ConductorError::Transport { .. } => "transport_error",
            ConductorError::MalformedSignal { .. } => "malformed_signal",
            ConductorError::Timeout { .. } => "timeout",
            ConductorError::Integrity(_) => "integrity_error",
            ConductorError::MalformedCheckpoint { .. } => "malformed_checkpoint",
            ConductorError::NotFound { .. } => "not_found",
            ConductorError::Io(_) => "io_error",
            ConductorError::Json(_) => "json_error",
            ConductorError::Other(_) => "error",
        }
    }

    /// Returns `true` if the error is transient and the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConductorError::Transport { .. })
    }

    /// Returns `true` if the error should be escalated to the next layer up
    /// rather than resolved by the immediate caller.
    pub fn is_escalation(&self) -> bool {
        matches!(
            self,
            ConductorError::Transport { .. } | ConductorError::Timeout { .. }
        )
    }

    /// Returns `true` for errors that indicate corrupted or tampered durable state.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            ConductorError::Integrity(_) | ConductorError::MalformedCheckpoint { .. }
        )
    }

    /// Map an `io::Error` on `path` to `NotFound` when appropriate.
    pub fn from_io(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            ConductorError::NotFound { path: path.into() }
        } else {
            ConductorError::Io(err)
        }
    }

    pub fn transport(channel: impl Into<String>, message: impl Into<String>) -> Self {
        ConductorError::Transport {
            channel: channel.into(),
            message: message.into(),
        }
    }
}

/// A convenience alias for `Result<T, ConductorError>`.
pub type Result<T> = std::result::Result<T, ConductorError>;

// ---------------------------------------------------------------------------
// NodeStatus — the fixed node lifecycle
// ---------------------------------------------------------------------------

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Pending,
    Active,
    ImplComplete,
    Validated,
    Failed,
}

impl NodeStatus {
    pub const ALL: [NodeStatus; 5] = [
        NodeStatus::Pending,
        NodeStatus::Active,
        NodeStatus::ImplComplete,
        NodeStatus::Validated,
        NodeStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Active => "active",
            NodeStatus::ImplComplete => "impl_complete",
            NodeStatus::Validated => "validated",
            NodeStatus::Failed => "failed",
        }
    }

    /// Statuses reachable from `self` in one step.
    pub fn legal_targets(&self) -> &'static [NodeStatus] {
        match self {
            NodeStatus::Pending => &[NodeStatus::Active],
            NodeStatus::Active => &[NodeStatus::ImplComplete],
            NodeStatus::ImplComplete => &[NodeStatus::Validated, NodeStatus::Failed],
            NodeStatus::Validated => &[],
            NodeStatus::Failed => &[NodeStatus::Active],
        }
    }

    pub fn can_transition_to(&self, to: NodeStatus) -> bool {
        self.legal_targets().contains(&to)
    }

    /// Validated nodes are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Validated)
    }

    /// Fill color used as the display hint for this status.
    pub fn fill_color(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "white",
            NodeStatus::Active => "lightyellow",
            NodeStatus::ImplComplete => "lightblue",
            NodeStatus::Validated => "lightgreen",
            NodeStatus::Failed => "lightcoral",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = ConductorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(NodeStatus::Pending),
            "active" => Ok(NodeStatus::Active),
            "impl_complete" => Ok(NodeStatus::ImplComplete),
            "validated" => Ok(NodeStatus::Validated),
            "failed" => Ok(NodeStatus::Failed),
            other => Err(ConductorError::Other(format!(
                "unknown status '{other}' (expected one of: pending, active, impl_complete, validated, failed)"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Layer — a logical role in the supervision hierarchy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Runner,
    Guardian,
    Terminal,
}

impl Layer {
    pub const ALL: [Layer; 3] = [Layer::Runner, Layer::Guardian, Layer::Terminal];

    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Runner => "runner",
            Layer::Guardian => "guardian",
            Layer::Terminal => "terminal",
        }
    }

    /// The layer a problem is escalated to. The terminal layer is the last resort.
    pub fn escalation_target(&self) -> Option<Layer> {
        match self {
            Layer::Runner => Some(Layer::Guardian),
            Layer::Guardian => Some(Layer::Terminal),
            Layer::Terminal => None,
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Layer {
    type Err = ConductorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "runner" => Ok(Layer::Runner),
            "guardian" => Ok(Layer::Guardian),
            "terminal" => Ok(Layer::Terminal),
            other => Err(ConductorError::Other(format!(
                "unknown layer '{other}' (expected runner, guardian, or terminal)"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_parse_error() {
        let err = ConductorError::ParseError {
            line: 10,
            col: 5,
            message: "unexpected token".into(),
            source_snippet: Some("digraph {".into()),
        };
        assert_eq!(
            err.to_string(),
            "DOT parse error at line 10, col 5: unexpected token"
        );
    }

    #[test]
    fn error_display_illegal_transition_lists_targets() {
        let err = ConductorError::IllegalTransition {
            node: "build".into(),
            from: NodeStatus::ImplComplete,
            to: NodeStatus::Pending,
            legal: NodeStatus::ImplComplete.legal_targets().to_vec(),
        };
        assert_eq!(
            err.to_string(),
            "Illegal transition for node 'build': impl_complete -> pending \
             (legal targets from impl_complete: validated, failed)"
        );
    }

    #[test]
    fn error_display_illegal_transition_from_validated() {
        let err = ConductorError::IllegalTransition {
            node: "a".into(),
            from: NodeStatus::Validated,
            to: NodeStatus::Active,
            legal: vec![],
        };
        assert!(err.to_string().ends_with("(legal targets from validated: none)"));
    }

    #[test]
    fn error_display_unknown_node() {
        let err = ConductorError::UnknownNode {
            node: "ghost".into(),
            line: 7,
        };
        assert_eq!(err.to_string(), "Unknown node 'ghost' referenced at line 7");
    }

    #[test]
    fn error_display_timeout() {
        let err = ConductorError::Timeout {
            layer: "guardian".into(),
            waited_ms: 1000,
        };
        assert_eq!(
            err.to_string(),
            "Timed out after 1000ms waiting on the guardian mailbox"
        );
    }

    #[test]
    fn kinds_are_stable() {
        assert_eq!(ConductorError::Integrity("x".into()).kind(), "integrity_error");
        assert_eq!(
            ConductorError::NotFound { path: "a".into() }.kind(),
            "not_found"
        );
        assert_eq!(
            ConductorError::MalformedCheckpoint {
                path: "a".into(),
                message: "bad".into()
            }
            .kind(),
            "malformed_checkpoint"
        );
    }

    #[test]
    fn transport_is_retryable_and_escalates() {
        let err = ConductorError::transport("queue", "unreachable");
        assert!(err.is_retryable());
        assert!(err.is_escalation());
    }

    #[test]
    fn timeout_escalates_but_is_not_retryable() {
        let err = ConductorError::Timeout {
            layer: "runner".into(),
            waited_ms: 5,
        };
        assert!(!err.is_retryable());
        assert!(err.is_escalation());
    }

    #[test]
    fn structural_errors_do_not_escalate() {
        let err = ConductorError::ValidationError("cycle".into());
        assert!(!err.is_escalation());
        assert!(!err.is_retryable());
    }

    #[test]
    fn from_io_maps_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = ConductorError::from_io(io, "/tmp/missing.dot");
        assert!(matches!(err, ConductorError::NotFound { .. }));

        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err = ConductorError::from_io(io, "/tmp/x");
        assert!(matches!(err, ConductorError::Io(_)));
    }

    // --- NodeStatus ---

    #[test]
    fn legal_transition_table() {
        use NodeStatus::*;
        let legal = [
            (Pending, Active),
            (Active, ImplComplete),
            (ImplComplete, Validated),
            (ImplComplete, Failed),
            (Failed, Active),
        ];
        for from in NodeStatus::ALL {
            for to in NodeStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn validated_is_terminal() {
        assert!(NodeStatus::Validated.is_terminal());
        assert!(NodeStatus::Validated.legal_targets().is_empty());
        assert!(!NodeStatus::Failed.is_terminal());
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in NodeStatus::ALL {
            assert_eq!(status.as_str().parse::<NodeStatus>().unwrap(), status);
        }
        assert!("done".parse::<NodeStatus>().is_err());
    }

    #[test]
    fn status_serializes_to_snake_case() {
        assert_eq!(
            serde_json::to_string(&NodeStatus::ImplComplete).unwrap(),
            "\"impl_complete\""
        );
    }

    // --- Layer ---

    #[test]
    fn escalation_chain() {
        assert_eq!(Layer::Runner.escalation_target(), Some(Layer::Guardian));
        assert_eq!(Layer::Guardian.escalation_target(), Some(Layer::Terminal));
        assert_eq!(Layer::Terminal.escalation_target(), None);
    }

    #[test]
    fn layer_parses_case_insensitively() {
        assert_eq!("Guardian".parse::<Layer>().unwrap(), Layer::Guardian);
        assert!("operator".parse::<Layer>().is_err());
    }
}
