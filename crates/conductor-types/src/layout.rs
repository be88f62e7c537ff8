//! On-disk layout of the state root and the explicit session identity.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{ConductorError, Layer, Result};

/// Default state root, relative to the working directory.
pub const DEFAULT_STATE_ROOT: &str = ".conductor";

/// Paths of every durable file under one state root.
///
/// ```text
/// <root>/signals/<layer>/{pending,processed}/
/// <root>/checkpoints/
/// <root>/runner-state/<pipeline>.json
/// <root>/audit/<pipeline>.jsonl
/// <root>/merge-queue/queue.json
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        StateLayout { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn signals_dir(&self) -> PathBuf {
        self.root.join("signals")
    }

    pub fn pending_dir(&self, layer: Layer) -> PathBuf {
        self.signals_dir().join(layer.as_str()).join("pending")
    }

    pub fn processed_dir(&self, layer: Layer) -> PathBuf {
        self.signals_dir().join(layer.as_str()).join("processed")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.root.join("checkpoints")
    }

    pub fn runner_state(&self, pipeline_id: &str) -> PathBuf {
        self.root
            .join("runner-state")
            .join(format!("{pipeline_id}.json"))
    }

    pub fn audit_log(&self, pipeline_id: &str) -> PathBuf {
        self.root.join("audit").join(format!("{pipeline_id}.jsonl"))
    }

    pub fn merge_queue_dir(&self) -> PathBuf {
        self.root.join("merge-queue")
    }
}

impl Default for StateLayout {
    fn default() -> Self {
        StateLayout::new(DEFAULT_STATE_ROOT)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Orchestrator,
    Worker,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Orchestrator => "orchestrator",
            Role::Worker => "worker",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ConductorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "orchestrator" => Ok(Role::Orchestrator),
            "worker" => Ok(Role::Worker),
            other => Err(ConductorError::Other(format!(
                "unknown role '{other}' (expected orchestrator or worker)"
            ))),
        }
    }
}

/// Who is acting. Passed explicitly to every component that needs it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub session_id: String,
    pub role: Role,
}

impl SessionIdentity {
    pub fn new(session_id: impl Into<String>, role: Role) -> Self {
        SessionIdentity {
            session_id: session_id.into(),
            role,
        }
    }

    pub fn orchestrator(session_id: impl Into<String>) -> Self {
        Self::new(session_id, Role::Orchestrator)
    }

    pub fn worker(session_id: impl Into<String>) -> Self {
        Self::new(session_id, Role::Worker)
    }
}
