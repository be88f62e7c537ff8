//! Persisted per-pipeline runner record, read back at startup for crash recovery.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use conductor_types::{fs, ConductorError, Result};
use serde::{Deserialize, Serialize};

use crate::plan::RunnerPlan;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerState {
    pub pipeline_id: String,
    pub pipeline_path: PathBuf,
    pub session_id: String,
    #[serde(default)]
    pub retry_counts: BTreeMap<String, u32>,
    /// Node id -> worker session that implemented it.
    #[serde(default)]
    pub implementers: BTreeMap<String, String>,
    /// Nodes whose review request has been sent and not yet answered.
    #[serde(default)]
    pub awaiting_validation: BTreeSet<String>,
    #[serde(default)]
    pub awaiting_approval: BTreeSet<String>,
    #[serde(default)]
    pub last_plan: Option<RunnerPlan>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub idle_cycles: u32,
    #[serde(default)]
    pub terminal_checkpoint: Option<PathBuf>,
}

impl RunnerState {
    pub fn new(
        pipeline_id: impl Into<String>,
        pipeline_path: impl Into<PathBuf>,
        session_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        RunnerState {
            pipeline_id: pipeline_id.into(),
            pipeline_path: pipeline_path.into(),
            session_id: session_id.into(),
            retry_counts: BTreeMap::new(),
            implementers: BTreeMap::new(),
            awaiting_validation: BTreeSet::new(),
            awaiting_approval: BTreeSet::new(),
            last_plan: None,
            created_at: now,
            updated_at: now,
            paused: false,
            idle_cycles: 0,
            terminal_checkpoint: None,
        }
    }

    /// Load the state file, or `None` when this pipeline has never run.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let text = match fs::read_to_string(path) {
            Ok(t) => t,
            Err(ConductorError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let state = serde_json::from_str(&text).map_err(|e| {
            ConductorError::Other(format!("malformed runner state {}: {e}", path.display()))
        })?;
        Ok(Some(state))
    }

    /// Resume from `path` when present, otherwise start fresh.
    ///
    /// A resumed state takes over the new session id: the implementer map
    /// still refers to the sessions that did the work.
    pub fn load_or_new(
        path: &Path,
        pipeline_id: &str,
        pipeline_path: &Path,
        session_id: &str,
    ) -> Result<Self> {
        match Self::load(path)? {
            Some(mut state) => {
                tracing::info!(
                    pipeline = %pipeline_id,
                    previous_session = %state.session_id,
                    "Resuming runner state"
                );
                state.session_id = session_id.to_string();
                Ok(state)
            }
            None => Ok(Self::new(pipeline_id, pipeline_path, session_id)),
        }
    }

    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.updated_at = Utc::now();
        fs::atomic_write_json(path, self)?;
        tracing::debug!(path = %path.display(), "Runner state saved");
        Ok(())
    }

    pub fn retry_count(&self, node_id: &str) -> u32 {
        self.retry_counts.get(node_id).copied().unwrap_or(0)
    }

    pub fn increment_retry(&mut self, node_id: &str) -> u32 {
        let count = self.retry_counts.entry(node_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn record_implementer(&mut self, node_id: &str, session_id: &str) {
        self.implementers
            .insert(node_id.to_string(), session_id.to_string());
    }

    pub fn implementer(&self, node_id: &str) -> Option<&str> {
        self.implementers.get(node_id).map(String::as_str)
    }

    /// True when `validator` did the implementation work on `node_id`.
    pub fn is_self_validation(&self, node_id: &str, validator: &str) -> bool {
        self.implementer(node_id) == Some(validator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(RunnerState::load(&dir.path().join("x.json")).unwrap().is_none());
    }

    #[test]
    fn save_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner-state").join("build.json");
        let mut state = RunnerState::new("build", "build.dot", "s-1");
        state.increment_retry("impl");
        state.increment_retry("impl");
        state.record_implementer("impl", "worker-9");
        state.awaiting_validation.insert("impl".into());
        state.paused = true;
        state.save(&path).unwrap();

        let resumed = RunnerState::load_or_new(&path, "build", Path::new("build.dot"), "s-2").unwrap();
        assert_eq!(resumed.session_id, "s-2");
        assert_eq!(resumed.retry_count("impl"), 2);
        assert_eq!(resumed.retry_count("other"), 0);
        assert!(resumed.is_self_validation("impl", "worker-9"));
        assert!(!resumed.is_self_validation("impl", "guardian"));
        assert!(resumed.paused);
        assert!(resumed.awaiting_validation.contains("impl"));
    }

    #[test]
    fn malformed_state_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        std::fs::write(&path, "{ nope").unwrap();
        assert!(RunnerState::load(&path).is_err());
    }
}
