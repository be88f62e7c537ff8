//! Append-only, hash-chained audit trail of applied transitions.
//!
//! Each [`AuditEntry`] carries the hash of the entry before it (the first one
//! carries [`GENESIS_HASH`]). [`AuditLog::verify_chain`] recomputes the chain
//! and reports the first break as an integrity error; a broken chain is never
//! repaired.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use conductor_types::{fs, ConductorError, NodeStatus, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::state_machine::Transition;

pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub node_id: String,
    pub from_status: NodeStatus,
    pub to_status: NodeStatus,
    pub agent_id: String,
    /// SHA-256 of the evidence offered for the transition, if any.
    pub evidence_hash: Option<String>,
    pub reason: String,
    pub prev_hash: String,
}

impl AuditEntry {
    /// SHA-256 (hex) of the entry's canonical JSON form.
    pub fn hash(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(fs::sha256_hex(&bytes))
    }
}

/// Builds the next entry from the hash of the current head.
pub type ChainLink<'a> = &'a mut dyn FnMut(&str) -> Result<AuditEntry>;

/// Storage backend for audit entries.
pub trait AuditStore: Send {
    /// Read the head hash, build the entry and append it as one step.
    ///
    /// No other writer may append between the read and the write.
    fn append_chained(&mut self, build: ChainLink<'_>) -> Result<AuditEntry>;

    fn entries(&self) -> Result<Vec<AuditEntry>>;
}

impl<S: AuditStore + ?Sized> AuditStore for Box<S> {
    fn append_chained(&mut self, build: ChainLink<'_>) -> Result<AuditEntry> {
        (**self).append_chained(build)
    }

    fn entries(&self) -> Result<Vec<AuditEntry>> {
        (**self).entries()
    }
}

/// Newline-delimited JSON file, one entry per line.
#[derive(Debug, Clone)]
pub struct JsonlAuditStore {
    path: PathBuf,
}

impl JsonlAuditStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonlAuditStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl JsonlAuditStore {
    fn parse_lines(&self, text: &str) -> Result<Vec<AuditEntry>> {
        text.lines()
            .enumerate()
            .filter(|(_, l)| !l.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str(line).map_err(|e| {
                    ConductorError::Integrity(format!(
                        "audit log {} line {} is not a valid entry: {e}",
                        self.path.display(),
                        i + 1
                    ))
                })
            })
            .collect()
    }

    fn append_locked(&self, file: &mut std::fs::File, build: ChainLink<'_>) -> Result<AuditEntry> {
        let mut text = String::new();
        file.read_to_string(&mut text)?;
        let head = match text.lines().rev().find(|l| !l.trim().is_empty()) {
            Some(last) => serde_json::from_str::<AuditEntry>(last)
                .map_err(|e| {
                    ConductorError::Integrity(format!(
                        "audit log {} last entry is not valid: {e}",
                        self.path.display()
                    ))
                })?
                .hash()?,
            None => GENESIS_HASH.to_string(),
        };
        let entry = build(&head)?;
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        file.write_all(&line)?;
        file.sync_data()?;
        Ok(entry)
    }
}

impl AuditStore for JsonlAuditStore {
    fn append_chained(&mut self, build: ChainLink<'_>) -> Result<AuditEntry> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        // Reads start at the beginning; writes always land at the end.
        let mut file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.lock_exclusive()?;
        let appended = self.append_locked(&mut file, build);
        let _ = FileExt::unlock(&file);
        appended
    }

    fn entries(&self) -> Result<Vec<AuditEntry>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        self.parse_lines(&text)
    }
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditStore {
    entries: Vec<AuditEntry>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct access for simulating tampering.
    pub fn entries_mut(&mut self) -> &mut Vec<AuditEntry> {
        &mut self.entries
    }
}

impl AuditStore for MemoryAuditStore {
    fn append_chained(&mut self, build: ChainLink<'_>) -> Result<AuditEntry> {
        let head = match self.entries.last() {
            Some(entry) => entry.hash()?,
            None => GENESIS_HASH.to_string(),
        };
        let entry = build(&head)?;
        self.entries.push(entry.clone());
        Ok(entry)
    }

    fn entries(&self) -> Result<Vec<AuditEntry>> {
        Ok(self.entries.clone())
    }
}

/// Hash-chained log over an [`AuditStore`].
#[derive(Debug)]
pub struct AuditLog<S> {
    store: S,
}

impl<S: AuditStore> AuditLog<S> {
    pub fn new(store: S) -> Self {
        AuditLog { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn entries(&self) -> Result<Vec<AuditEntry>> {
        self.store.entries()
    }

    /// Hash of the most recent entry, or [`GENESIS_HASH`] for an empty log.
    pub fn head_hash(&self) -> Result<String> {
        match self.store.entries()?.last() {
            Some(entry) => entry.hash(),
            None => Ok(GENESIS_HASH.to_string()),
        }
    }

    /// Append an entry chained to the current head.
    pub fn record(
        &mut self,
        node_id: &str,
        from: NodeStatus,
        to: NodeStatus,
        agent_id: &str,
        evidence: Option<&str>,
        reason: &str,
    ) -> Result<AuditEntry> {
        let evidence_hash = evidence.map(|e| fs::sha256_hex(e.as_bytes()));
        let entry = self.store.append_chained(&mut |prev_hash: &str| {
            Ok(AuditEntry {
                timestamp: Utc::now(),
                node_id: node_id.to_string(),
                from_status: from,
                to_status: to,
                agent_id: agent_id.to_string(),
                evidence_hash: evidence_hash.clone(),
                reason: reason.to_string(),
                prev_hash: prev_hash.to_string(),
            })
        })?;
        tracing::debug!(node = %node_id, from = %from, to = %to, agent = %agent_id, "Audit entry recorded");
        Ok(entry)
    }

    pub fn record_transition(
        &mut self,
        transition: &Transition,
        agent_id: &str,
        evidence: Option<&str>,
        reason: &str,
    ) -> Result<AuditEntry> {
        self.record(
            &transition.node,
            transition.from,
            transition.to,
            agent_id,
            evidence,
            reason,
        )
    }

    /// Recompute the chain end to end. Returns the number of verified entries.
    pub fn verify_chain(&self) -> Result<usize> {
        let entries = self.store.entries()?;
        let mut expected = GENESIS_HASH.to_string();
        for (i, entry) in entries.iter().enumerate() {
            if entry.prev_hash != expected {
                tracing::warn!(index = i, node = %entry.node_id, "Audit chain broken");
                return Err(ConductorError::Integrity(format!(
                    "audit chain broken at entry {i} (node '{}'): prev_hash {} does not match {}",
                    entry.node_id, entry.prev_hash, expected
                )));
            }
            expected = entry.hash()?;
        }
        Ok(entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::PipelineGraph;
    use crate::state_machine::apply_transition;

    fn lifecycle<S: AuditStore>(log: &mut AuditLog<S>) {
        let mut g = PipelineGraph::parse("digraph G { n }").unwrap();
        for to in [NodeStatus::Active, NodeStatus::ImplComplete, NodeStatus::Validated] {
            let t = apply_transition(&mut g, "n", to).unwrap();
            log.record_transition(&t, "runner-1", Some("diff --git"), "step").unwrap();
        }
        assert!(apply_transition(&mut g, "n", NodeStatus::Active).is_err());
    }

    #[test]
    fn three_transitions_chain_correctly() {
        let mut log = AuditLog::new(MemoryAuditStore::new());
        lifecycle(&mut log);

        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].prev_hash, GENESIS_HASH);
        assert_eq!(entries[1].prev_hash, entries[0].hash().unwrap());
        assert_eq!(entries[2].prev_hash, entries[1].hash().unwrap());
        assert_eq!(log.verify_chain().unwrap(), 3);
    }

    #[test]
    fn tampering_is_detected() {
        let mut log = AuditLog::new(MemoryAuditStore::new());
        lifecycle(&mut log);
        log.store_mut().entries_mut()[1].reason = "rewritten".into();

        let err = log.verify_chain().unwrap_err();
        assert!(err.is_integrity());
        assert!(err.to_string().contains("entry 2"), "{err}");
    }

    #[test]
    fn deleted_entry_is_detected() {
        let mut log = AuditLog::new(MemoryAuditStore::new());
        lifecycle(&mut log);
        log.store_mut().entries_mut().remove(0);
        assert!(log.verify_chain().is_err());
    }

    #[test]
    fn jsonl_store_persists_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit/build.jsonl");
        let mut log = AuditLog::new(JsonlAuditStore::new(&path));
        lifecycle(&mut log);

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 3);

        let reopened = AuditLog::new(JsonlAuditStore::new(&path));
        assert_eq!(reopened.verify_chain().unwrap(), 3);
    }

    #[test]
    fn jsonl_garbage_line_is_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        std::fs::write(&path, "{not json}\n").unwrap();
        let log = AuditLog::new(JsonlAuditStore::new(&path));
        assert!(log.verify_chain().unwrap_err().is_integrity());
    }

    #[test]
    fn concurrent_writers_keep_one_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit/shared.jsonl");
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let path = path.clone();
                std::thread::spawn(move || {
                    // Each writer has its own handle, as separate processes would.
                    let mut log = AuditLog::new(JsonlAuditStore::new(&path));
                    for i in 0..25 {
                        log.record(
                            &format!("n{w}"),
                            NodeStatus::Pending,
                            NodeStatus::Active,
                            &format!("writer-{w}"),
                            None,
                            &format!("step {i}"),
                        )
                        .unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        let log = AuditLog::new(JsonlAuditStore::new(&path));
        assert_eq!(log.verify_chain().unwrap(), 100);
    }

    #[test]
    fn empty_log_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(JsonlAuditStore::new(dir.path().join("none.jsonl")));
        assert_eq!(log.verify_chain().unwrap(), 0);
        assert_eq!(log.head_hash().unwrap(), GENESIS_HASH);
    }

    #[test]
    fn evidence_is_hashed_not_stored() {
        let mut log = AuditLog::new(MemoryAuditStore::new());
        let entry = log
            .record("n", NodeStatus::Pending, NodeStatus::Active, "a", Some("abc"), "go")
            .unwrap();
        assert_eq!(
            entry.evidence_hash.as_deref(),
            Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }
}
