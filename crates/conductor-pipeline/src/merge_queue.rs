//! Serialized integration of finished work into the shared trunk.
//!
//! The queue lives in one JSON file rewritten whole under an exclusive lock.
//! Processing holds a second, per-repository lock for the duration of the
//! integration, so at most one entry per `repo_root` is ever in progress.
//!
//! ```text
//! <dir>/queue.json
//! <dir>/queue.lock
//! <dir>/repo-<hash>.lock
//! ```

use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::{DateTime, Utc};
use conductor_types::fs::{self, LockGuard};
use conductor_types::{ConductorError, Result};
use serde::{Deserialize, Serialize};

/// Finished entries kept in the queue file.
pub const HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Queued,
    InProgress,
    Merged,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeQueueEntry {
    pub id: String,
    pub node_id: String,
    pub branch: String,
    pub repo_root: PathBuf,
    pub enqueued_at: DateTime<Utc>,
    pub status: MergeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueFile {
    #[serde(default)]
    pub entries: Vec<MergeQueueEntry>,
    #[serde(default)]
    pub history: Vec<MergeQueueEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Enqueued {
    pub entry: MergeQueueEntry,
    /// 1-based position among the pending entries for the same repository.
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeResult {
    pub entry: MergeQueueEntry,
    pub success: bool,
    pub message: String,
}

/// Performs the actual integration of one entry.
pub trait Integrator {
    /// Returns a short description of what was merged.
    fn integrate(&self, entry: &MergeQueueEntry) -> Result<String>;
}

/// `git merge --no-ff --no-edit <branch>` in the entry's repository.
#[derive(Debug, Clone, Default)]
pub struct GitIntegrator;

impl GitIntegrator {
    fn git(repo: &Path, args: &[&str]) -> Result<std::process::Output> {
        Command::new("git")
            .arg("-C")
            .arg(repo)
            .args(args)
            .output()
            .map_err(|e| ConductorError::Other(format!("failed to run git: {e}")))
    }
}

impl Integrator for GitIntegrator {
    fn integrate(&self, entry: &MergeQueueEntry) -> Result<String> {
        let output = Self::git(&entry.repo_root, &["merge", "--no-ff", "--no-edit", &entry.branch])?;
        if output.status.success() {
            return Ok(format!("merged {} for node {}", entry.branch, entry.node_id));
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let abort = Self::git(&entry.repo_root, &["merge", "--abort"])?;
        if !abort.status.success() {
            tracing::warn!(repo = %entry.repo_root.display(), "git merge --abort failed");
        }
        Err(ConductorError::Other(format!(
            "git merge {} failed: {stderr}",
            entry.branch
        )))
    }
}

pub struct MergeQueue {
    dir: PathBuf,
}

impl MergeQueue {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        MergeQueue { dir: dir.into() }
    }

    pub fn queue_path(&self) -> PathBuf {
        self.dir.join("queue.json")
    }

    fn queue_lock_path(&self) -> PathBuf {
        self.dir.join("queue.lock")
    }

    fn repo_lock_path(&self, repo_root: &Path) -> PathBuf {
        let digest = fs::sha256_hex(repo_root.to_string_lossy().as_bytes());
        self.dir.join(format!("repo-{}.lock", &digest[..16]))
    }

    fn read(&self) -> Result<QueueFile> {
        let path = self.queue_path();
        match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                ConductorError::Integrity(format!("merge queue {} is unreadable: {e}", path.display()))
            }),
            Err(ConductorError::NotFound { .. }) => Ok(QueueFile::default()),
            Err(e) => Err(e),
        }
    }

    /// Read-modify-write the queue file under the queue lock.
    fn update<T>(&self, f: impl FnOnce(&mut QueueFile) -> T) -> Result<T> {
        let _lock = LockGuard::acquire(&self.queue_lock_path())?;
        let mut queue = self.read()?;
        let out = f(&mut queue);
        fs::atomic_write_json(&self.queue_path(), &queue)?;
        Ok(out)
    }

    /// Snapshot of the queue file.
    pub fn list(&self) -> Result<QueueFile> {
        let _lock = LockGuard::acquire(&self.queue_lock_path())?;
        self.read()
    }

    pub fn enqueue(&self, node_id: &str, branch: &str, repo_root: &Path) -> Result<Enqueued> {
        let entry = MergeQueueEntry {
            id: uuid::Uuid::new_v4().to_string(),
            node_id: node_id.to_string(),
            branch: branch.to_string(),
            repo_root: repo_root.to_path_buf(),
            enqueued_at: Utc::now(),
            status: MergeStatus::Queued,
            started_at: None,
            finished_at: None,
            message: None,
        };
        let stored = entry.clone();
        let position = self.update(move |queue| {
            queue.entries.push(entry);
            queue
                .entries
                .iter()
                .filter(|e| e.repo_root == repo_root)
                .count()
        })?;
        tracing::info!(node = %node_id, branch, position, "Merge enqueued");
        Ok(Enqueued {
            entry: stored,
            position,
        })
    }

    /// Integrate the oldest entry for `repo_root`. `Ok(None)` when nothing is queued.
    ///
    /// A failed integration is recorded and the queue advances; the failure
    /// is returned in the [`MergeResult`] for the caller to report.
    pub fn process_next(
        &self,
        repo_root: &Path,
        integrator: &dyn Integrator,
    ) -> Result<Option<MergeResult>> {
        let _repo_lock = LockGuard::acquire(&self.repo_lock_path(repo_root))?;

        // With the repo lock held, an in_progress entry for this repo was
        // abandoned by a crashed processor and goes first.
        let claimed = self.update(|queue| {
            let idx = queue
                .entries
                .iter()
                .position(|e| e.repo_root == repo_root && e.status == MergeStatus::InProgress)
                .or_else(|| {
                    queue
                        .entries
                        .iter()
                        .position(|e| e.repo_root == repo_root && e.status == MergeStatus::Queued)
                })?;
            let entry = &mut queue.entries[idx];
            if entry.status == MergeStatus::InProgress {
                tracing::warn!(node = %entry.node_id, "Retrying merge left in progress");
            }
            entry.status = MergeStatus::InProgress;
            entry.started_at = Some(Utc::now());
            Some(entry.clone())
        })?;
        let Some(entry) = claimed else {
            return Ok(None);
        };

        let outcome = integrator.integrate(&entry);
        let (success, message) = match outcome {
            Ok(msg) => (true, msg),
            Err(e) => (false, e.to_string()),
        };

        let finished = self.update(|queue| {
            let mut done = entry.clone();
            queue.entries.retain(|e| e.id != entry.id);
            done.status = if success { MergeStatus::Merged } else { MergeStatus::Failed };
            done.finished_at = Some(Utc::now());
            done.message = Some(message.clone());
            queue.history.push(done.clone());
            let excess = queue.history.len().saturating_sub(HISTORY_LIMIT);
            queue.history.drain(..excess);
            done
        })?;

        if success {
            tracing::info!(node = %finished.node_id, branch = %finished.branch, "Merge complete");
        } else {
            tracing::warn!(node = %finished.node_id, branch = %finished.branch, %message, "Merge failed");
        }
        Ok(Some(MergeResult {
            entry: finished,
            success,
            message,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        merged: Mutex<Vec<String>>,
        fail_branch: Option<String>,
    }

    impl Integrator for Recorder {
        fn integrate(&self, entry: &MergeQueueEntry) -> Result<String> {
            if self.fail_branch.as_deref() == Some(entry.branch.as_str()) {
                return Err(ConductorError::Other("conflict".into()));
            }
            self.merged.lock().unwrap().push(entry.node_id.clone());
            Ok(format!("merged {}", entry.branch))
        }
    }

    #[test]
    fn processes_in_enqueue_order() {
        let dir = tempfile::tempdir().unwrap();
        let queue = MergeQueue::new(dir.path().join("merge-queue"));
        let repo = Path::new("/repo");
        for (i, node) in ["x", "y", "z"].iter().enumerate() {
            let enq = queue.enqueue(node, &format!("b-{node}"), repo).unwrap();
            assert_eq!(enq.position, i + 1);
        }

        let recorder = Recorder::default();
        for _ in 0..3 {
            let result = queue.process_next(repo, &recorder).unwrap().unwrap();
            assert!(result.success);
        }
        assert!(queue.process_next(repo, &recorder).unwrap().is_none());
        assert_eq!(*recorder.merged.lock().unwrap(), vec!["x", "y", "z"]);

        let file = queue.list().unwrap();
        assert!(file.entries.is_empty());
        assert_eq!(file.history.len(), 3);
        assert!(file.history.iter().all(|e| e.status == MergeStatus::Merged));
    }

    #[test]
    fn failure_is_recorded_and_queue_advances() {
        let dir = tempfile::tempdir().unwrap();
        let queue = MergeQueue::new(dir.path());
        let repo = Path::new("/repo");
        queue.enqueue("a", "bad", repo).unwrap();
        queue.enqueue("b", "good", repo).unwrap();

        let recorder = Recorder {
            fail_branch: Some("bad".into()),
            ..Default::default()
        };
        let first = queue.process_next(repo, &recorder).unwrap().unwrap();
        assert!(!first.success);
        assert_eq!(first.entry.status, MergeStatus::Failed);
        assert!(first.message.contains("conflict"));

        let second = queue.process_next(repo, &recorder).unwrap().unwrap();
        assert!(second.success);
        assert_eq!(second.entry.node_id, "b");
    }

    #[test]
    fn repositories_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let queue = MergeQueue::new(dir.path());
        queue.enqueue("a", "b1", Path::new("/one")).unwrap();
        let enq = queue.enqueue("b", "b2", Path::new("/two")).unwrap();
        assert_eq!(enq.position, 1);

        let recorder = Recorder::default();
        let result = queue.process_next(Path::new("/two"), &recorder).unwrap().unwrap();
        assert_eq!(result.entry.node_id, "b");
        assert_eq!(queue.list().unwrap().entries.len(), 1);
    }

    #[test]
    fn stale_in_progress_entry_is_retried_first() {
        let dir = tempfile::tempdir().unwrap();
        let queue = MergeQueue::new(dir.path());
        let repo = Path::new("/repo");
        queue.enqueue("first", "b1", repo).unwrap();
        queue.enqueue("second", "b2", repo).unwrap();
        queue
            .update(|q| q.entries[1].status = MergeStatus::InProgress)
            .unwrap();

        let recorder = Recorder::default();
        let result = queue.process_next(repo, &recorder).unwrap().unwrap();
        assert_eq!(result.entry.node_id, "second");
    }

    #[test]
    fn history_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let queue = MergeQueue::new(dir.path());
        let repo = Path::new("/repo");
        let recorder = Recorder::default();
        for i in 0..(HISTORY_LIMIT + 5) {
            queue.enqueue(&format!("n{i}"), "b", repo).unwrap();
            queue.process_next(repo, &recorder).unwrap();
        }
        let history = queue.list().unwrap().history;
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history[0].node_id, "n5");
    }

    #[test]
    fn concurrent_processors_take_distinct_entries() {
        let dir = tempfile::tempdir().unwrap();
        let queue_dir = dir.path().to_path_buf();
        let repo = PathBuf::from("/repo");
        let queue = MergeQueue::new(&queue_dir);
        for node in ["a", "b", "c", "d"] {
            queue.enqueue(node, "b", &repo).unwrap();
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let queue_dir = queue_dir.clone();
                let repo = repo.clone();
                std::thread::spawn(move || {
                    let recorder = Recorder::default();
                    MergeQueue::new(queue_dir)
                        .process_next(&repo, &recorder)
                        .unwrap()
                        .map(|r| r.entry.node_id)
                })
            })
            .collect();
        let mut done: Vec<String> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        done.sort();
        assert_eq!(done, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn corrupt_queue_file_is_an_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        let queue = MergeQueue::new(dir.path());
        std::fs::write(queue.queue_path(), "{ not json").unwrap();
        let err = queue.enqueue("a", "b", Path::new("/r")).unwrap_err();
        assert!(err.is_integrity());
    }
}
