//! Boundary to the facility that launches worker processes.
//!
//! The runner only needs to start a detached process, talk to it, read its
//! output, and stop it. [`TmuxLauncher`] does that with one tmux session per
//! worker.

use std::path::PathBuf;

use async_trait::async_trait;
use conductor_types::{ConductorError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHandle {
    pub id: String,
    /// Launcher-specific name (the tmux session name).
    pub session: String,
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn start(&self, id: &str, command: &str) -> Result<WorkerHandle>;
    async fn send_text(&self, handle: &WorkerHandle, text: &str) -> Result<()>;
    /// Last `lines` lines of the worker's output.
    async fn capture_output(&self, handle: &WorkerHandle, lines: usize) -> Result<String>;
    async fn is_alive(&self, handle: &WorkerHandle) -> Result<bool>;
    async fn stop(&self, handle: &WorkerHandle) -> Result<()>;
}

pub struct TmuxLauncher {
    prefix: String,
    working_dir: Option<PathBuf>,
}

impl TmuxLauncher {
    pub fn new(prefix: impl Into<String>) -> Self {
        TmuxLauncher {
            prefix: prefix.into(),
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// tmux session names may not contain `.` or `:`.
    pub fn session_name(&self, id: &str) -> String {
        let safe: String = id
            .chars()
            .map(|c| if c == '.' || c == ':' || c.is_whitespace() { '_' } else { c })
            .collect();
        format!("{}-{}", self.prefix, safe)
    }

    async fn tmux(&self, args: &[&str]) -> Result<std::process::Output> {
        tokio::process::Command::new("tmux")
            .args(args)
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(|e| ConductorError::transport("tmux", format!("failed to run tmux: {e}")))
    }

    async fn tmux_checked(&self, args: &[&str]) -> Result<String> {
        let output = self.tmux(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ConductorError::transport(
                "tmux",
                format!("tmux {} failed: {}", args.first().unwrap_or(&""), stderr.trim()),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl WorkerLauncher for TmuxLauncher {
    async fn start(&self, id: &str, command: &str) -> Result<WorkerHandle> {
        let session = self.session_name(id);
        let dir = self.working_dir.as_ref().map(|d| d.display().to_string());
        let mut args = vec!["new-session", "-d", "-s", session.as_str()];
        if let Some(dir) = &dir {
            args.extend(["-c", dir.as_str()]);
        }
        args.push(command);
        self.tmux_checked(&args).await?;
        tracing::info!(worker = %id, session = %session, "Worker started");
        Ok(WorkerHandle {
            id: id.to_string(),
            session,
        })
    }

    async fn send_text(&self, handle: &WorkerHandle, text: &str) -> Result<()> {
        self.tmux_checked(&["send-keys", "-t", &handle.session, "-l", text])
            .await?;
        self.tmux_checked(&["send-keys", "-t", &handle.session, "Enter"])
            .await?;
        Ok(())
    }

    async fn capture_output(&self, handle: &WorkerHandle, lines: usize) -> Result<String> {
        let start = format!("-{lines}");
        self.tmux_checked(&["capture-pane", "-p", "-t", &handle.session, "-S", &start])
            .await
    }

    async fn is_alive(&self, handle: &WorkerHandle) -> Result<bool> {
        let output = self.tmux(&["has-session", "-t", &handle.session]).await?;
        Ok(output.status.success())
    }

    async fn stop(&self, handle: &WorkerHandle) -> Result<()> {
        if !self.is_alive(handle).await? {
            return Ok(());
        }
        self.tmux_checked(&["kill-session", "-t", &handle.session])
            .await?;
        tracing::info!(worker = %handle.id, "Worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_names_are_tmux_safe() {
        let launcher = TmuxLauncher::new("conductor");
        assert_eq!(launcher.session_name("build.impl:1"), "conductor-build_impl_1");
    }
}
