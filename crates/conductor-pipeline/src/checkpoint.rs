//! Checkpoint save/restore for crash recovery.
//!
//! A [`Checkpoint`] is an immutable JSON snapshot of the whole graph: every
//! node with its full attribute set, every edge, graph-level metadata, and a
//! SHA-256 of the DOT text it was taken from. [`restore_checkpoint`] turns it
//! back into DOT text that parses to the same nodes, edges, and attributes.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use conductor_types::{fs, ConductorError, NodeStatus, Result};
use serde::{Deserialize, Serialize};

use crate::graph::{AttrMap, PipelineEdge, PipelineGraph, PipelineNode};

/// Schema version written by this build. Newer checkpoints are refused.
pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub source_file: Option<String>,
    pub graph_name: String,
    pub graph_attrs: AttrMap,
    #[serde(default)]
    pub defaults: CheckpointDefaults,
    pub nodes: Vec<CheckpointNode>,
    pub edges: Vec<CheckpointEdge>,
    pub content_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointDefaults {
    #[serde(default)]
    pub node: AttrMap,
    #[serde(default)]
    pub edge: AttrMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointNode {
    pub id: String,
    pub status: NodeStatus,
    #[serde(default)]
    pub attrs: AttrMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEdge {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub attrs: AttrMap,
}

impl Checkpoint {
    /// Snapshot `graph`. `source_text` is the DOT text the hash is computed over.
    pub fn from_graph(graph: &PipelineGraph, source_text: &str, source_file: Option<String>) -> Self {
        Checkpoint {
            version: CHECKPOINT_VERSION,
            created_at: Utc::now(),
            source_file,
            graph_name: graph.name.clone(),
            graph_attrs: graph.attrs.clone(),
            defaults: CheckpointDefaults {
                node: graph.node_defaults.clone(),
                edge: graph.edge_defaults.clone(),
            },
            nodes: graph
                .all_nodes()
                .map(|n| CheckpointNode {
                    id: n.id.clone(),
                    status: n.status(),
                    attrs: n.attrs.clone(),
                })
                .collect(),
            edges: graph
                .all_edges()
                .iter()
                .map(|e| CheckpointEdge {
                    from: e.from.clone(),
                    to: e.to.clone(),
                    attrs: e.attrs.clone(),
                })
                .collect(),
            content_hash: fs::sha256_hex(source_text.as_bytes()),
        }
    }

    /// Rebuild the pipeline graph held by this snapshot.
    pub fn to_graph(&self) -> Result<PipelineGraph> {
        let nodes = self
            .nodes
            .iter()
            .map(|n| {
                let mut node = PipelineNode::new(n.id.clone(), n.status);
                node.attrs = n.attrs.clone();
                node
            })
            .collect();
        let edges = self
            .edges
            .iter()
            .map(|e| {
                let mut edge = PipelineEdge::new(e.from.clone(), e.to.clone());
                edge.attrs = e.attrs.clone();
                edge
            })
            .collect();
        let mut graph =
            PipelineGraph::from_parts(self.graph_name.clone(), self.graph_attrs.clone(), nodes, edges)?;
        graph.node_defaults = self.defaults.node.clone();
        graph.edge_defaults = self.defaults.edge.clone();
        Ok(graph)
    }

    /// Check that `text` is the exact source this checkpoint was taken from.
    pub fn verify_source(&self, text: &str) -> Result<()> {
        let actual = fs::sha256_hex(text.as_bytes());
        if actual != self.content_hash {
            tracing::warn!(
                graph = %self.graph_name,
                expected = %self.content_hash,
                actual = %actual,
                "Checkpoint content hash mismatch"
            );
            return Err(ConductorError::Integrity(format!(
                "content hash mismatch for graph '{}': checkpoint has {}, source has {}",
                self.graph_name, self.content_hash, actual
            )));
        }
        Ok(())
    }
}

/// `<dir>/<graph_name>-<UTC timestamp with microseconds>.json`
pub fn auto_checkpoint_path(dir: &Path, graph_name: &str, at: DateTime<Utc>) -> PathBuf {
    let safe: String = graph_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    dir.join(format!("{}-{}.json", safe, at.format("%Y%m%dT%H%M%S%.6fZ")))
}

/// Write `checkpoint` atomically to `target`, or to an auto-derived path in
/// `checkpoint_dir` when no target is given.
pub fn write_checkpoint(
    checkpoint: &Checkpoint,
    target: Option<&Path>,
    checkpoint_dir: &Path,
) -> Result<PathBuf> {
    let path = match target {
        Some(p) => p.to_path_buf(),
        None => auto_checkpoint_path(checkpoint_dir, &checkpoint.graph_name, checkpoint.created_at),
    };
    fs::atomic_write_json(&path, checkpoint)?;
    tracing::info!(
        graph = %checkpoint.graph_name,
        nodes = checkpoint.nodes.len(),
        path = %path.display(),
        "Checkpoint saved"
    );
    Ok(path)
}

/// Snapshot DOT `text` (already in memory) and write it.
pub fn save_checkpoint_text(
    text: &str,
    source_file: Option<String>,
    target: Option<&Path>,
    checkpoint_dir: &Path,
) -> Result<(Checkpoint, PathBuf)> {
    let graph = PipelineGraph::parse(text)?;
    let checkpoint = Checkpoint::from_graph(&graph, text, source_file);
    let path = write_checkpoint(&checkpoint, target, checkpoint_dir)?;
    Ok((checkpoint, path))
}

/// Read the graph file at `source_path`, snapshot it, and write the checkpoint.
pub fn save_checkpoint(
    source_path: &Path,
    target: Option<&Path>,
    checkpoint_dir: &Path,
) -> Result<(Checkpoint, PathBuf)> {
    let text = fs::read_to_string(source_path)?;
    save_checkpoint_text(
        &text,
        Some(source_path.display().to_string()),
        target,
        checkpoint_dir,
    )
}

/// Load a checkpoint file. A missing file is `NotFound`; bad JSON or an
/// unsupported schema version is `MalformedCheckpoint`.
pub fn load_checkpoint(path: &Path) -> Result<Checkpoint> {
    let text = fs::read_to_string(path)?;
    let checkpoint: Checkpoint =
        serde_json::from_str(&text).map_err(|e| ConductorError::MalformedCheckpoint {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
    if checkpoint.version > CHECKPOINT_VERSION {
        return Err(ConductorError::MalformedCheckpoint {
            path: path.to_path_buf(),
            message: format!(
                "schema version {} is newer than supported version {}",
                checkpoint.version, CHECKPOINT_VERSION
            ),
        });
    }
    Ok(checkpoint)
}

/// Reconstruct DOT text from a checkpoint.
pub fn restore_checkpoint(checkpoint: &Checkpoint) -> Result<String> {
    Ok(checkpoint.to_graph()?.to_dot())
}

/// Load `checkpoint_path` and write the reconstructed DOT text to `out`.
pub fn restore_to_file(checkpoint_path: &Path, out: &Path) -> Result<Checkpoint> {
    let checkpoint = load_checkpoint(checkpoint_path)?;
    let text = restore_checkpoint(&checkpoint)?;
    fs::atomic_write(out, text.as_bytes())?;
    tracing::info!(
        checkpoint = %checkpoint_path.display(),
        out = %out.display(),
        "Checkpoint restored"
    );
    Ok(checkpoint)
}

/// The most recent readable checkpoint in `dir`, optionally for one graph.
///
/// Unreadable files are skipped with a warning; `Ok(None)` means none found.
pub fn latest_checkpoint(dir: &Path, graph_name: Option<&str>) -> Result<Option<(PathBuf, Checkpoint)>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut best: Option<(PathBuf, Checkpoint)> = None;
    for entry in entries {
        let path = entry?.path();
        if fs::is_hidden(&path) || path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let checkpoint = match load_checkpoint(&path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint");
                continue;
            }
        };
        if graph_name.is_some_and(|g| g != checkpoint.graph_name) {
            continue;
        }
        let newer = match &best {
            Some((best_path, current)) => {
                (checkpoint.created_at, &path) > (current.created_at, best_path)
            }
            None => true,
        };
        if newer {
            best = Some((path, checkpoint));
        }
    }
    Ok(best)
}
