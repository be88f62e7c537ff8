//! Pluggable transport between a runner and its supervising layer.
//!
//! Every adapter produces the same [`Message`] records regardless of wire
//! format, with inbound message types normalized by
//! [`normalize_message_type`].

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use conductor_types::{fs, ConductorError, Layer, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::signal::SignalStore;

static OUTBOX_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical inbound message types.
pub mod message_types {
    pub const SHUTDOWN: &str = "shutdown";
    pub const PAUSE: &str = "pause";
    pub const RESUME: &str = "resume";
    pub const APPROVAL: &str = "approval";
    pub const OVERRIDE: &str = "override";
    pub const GUIDANCE: &str = "guidance";
    pub const MESSAGE: &str = "message";
}

/// Map known aliases onto the canonical message types.
///
/// `"Shutdown Request"`, `"shutdown_request"` and `"SHUTDOWN"` all become
/// `shutdown`; `"approval granted"` becomes `approval` and
/// `"approval rejected"` becomes `override`. Unknown types are lower-cased
/// with separators folded to `_`.
pub fn normalize_message_type(raw: &str) -> String {
    let folded: String = raw
        .trim()
        .chars()
        .map(|c| match c {
            '-' | ' ' | '.' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect();
    let canonical = match folded.as_str() {
        "" => message_types::MESSAGE,
        "shutdown" | "shutdown_request" | "stop" | "terminate" => message_types::SHUTDOWN,
        "pause" | "pause_request" => message_types::PAUSE,
        "resume" | "resume_request" | "unpause" => message_types::RESUME,
        "approval" | "approve" | "approved" | "approval_granted" => message_types::APPROVAL,
        "override" | "reject" | "rejected" | "approval_rejected" | "approval_denied" => {
            message_types::OVERRIDE
        }
        "guidance" | "guidance_response" => message_types::GUIDANCE,
        other => return other.to_string(),
    };
    canonical.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub sender: String,
    pub content: String,
    pub message_type: String,
    #[serde(default)]
    pub payload: Value,
}

impl Message {
    pub fn new(
        sender: impl Into<String>,
        content: impl Into<String>,
        message_type: &str,
        payload: Value,
    ) -> Self {
        Message {
            sender: sender.into(),
            content: content.into(),
            message_type: normalize_message_type(message_type),
            payload,
        }
    }

    /// Build a message from any JSON shape the transports produce.
    ///
    /// Accepts `sender`/`from`, `content`/`body`/`text`, and
    /// `message_type`/`type`.
    pub fn from_json(value: &Value) -> Self {
        let field = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| value.get(*k).and_then(Value::as_str))
                .unwrap_or_default()
                .to_string()
        };
        Message::new(
            field(&["sender", "from", "source"]),
            field(&["content", "body", "text"]),
            &field(&["message_type", "type", "signal_type"]),
            value.get("payload").cloned().unwrap_or(Value::Null),
        )
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    pub fn node_id(&self) -> Option<&str> {
        self.payload_str("node_id")
    }
}

/// Transport used by a runner to reach its supervisor.
///
/// `register` comes first. Until it succeeds, `send_signal` and
/// `receive_message` fail with a transport error on every adapter.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn register(&mut self, runner_id: &str, pipeline_id: &str) -> Result<()>;

    async fn unregister(&mut self) -> Result<()>;

    /// Fire-and-forget. Unrecoverable delivery failure is a transport error.
    async fn send_signal(&self, signal_type: &str, payload: Value, priority: Priority) -> Result<()>;

    /// `Duration::ZERO` polls once; `Duration::MAX` waits without a deadline.
    async fn receive_message(&self, timeout: Duration) -> Result<Option<Message>>;

    async fn send_heartbeat(&self, status: &str, current_node: Option<&str>) -> Result<()> {
        self.send_signal(
            "HEARTBEAT",
            json!({ "status": status, "current_node": current_node }),
            Priority::Low,
        )
        .await
    }

    /// Always sent at [`Priority::Urgent`].
    async fn request_approval(
        &self,
        node_id: &str,
        gate_type: &str,
        acceptance_criteria: &str,
        evidence_summary: &str,
    ) -> Result<()> {
        self.send_signal(
            "APPROVAL_REQUEST",
            json!({
                "node_id": node_id,
                "gate_type": gate_type,
                "acceptance_criteria": acceptance_criteria,
                "evidence_summary": evidence_summary,
            }),
            Priority::Urgent,
        )
        .await
    }
}

#[derive(Debug, Clone, Default)]
struct Registration {
    runner_id: String,
    pipeline_id: String,
}

impl Registration {
    fn require(&self, channel: &str) -> Result<()> {
        if self.runner_id.is_empty() {
            return Err(ConductorError::transport(channel, "adapter is not registered"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Console
// ---------------------------------------------------------------------------

/// Writes signals as JSON lines to a stream. Has no inbound channel.
pub struct ConsoleAdapter {
    out: Mutex<Box<dyn Write + Send>>,
    registration: Registration,
}

impl ConsoleAdapter {
    /// Signals go to stderr so stdout stays machine-readable.
    pub fn new() -> Self {
        Self::with_writer(Box::new(std::io::stderr()))
    }

    pub fn with_writer(out: Box<dyn Write + Send>) -> Self {
        ConsoleAdapter {
            out: Mutex::new(out),
            registration: Registration::default(),
        }
    }
}

impl Default for ConsoleAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelAdapter for ConsoleAdapter {
    fn name(&self) -> &str {
        "console"
    }

    async fn register(&mut self, runner_id: &str, pipeline_id: &str) -> Result<()> {
        self.registration = Registration {
            runner_id: runner_id.to_string(),
            pipeline_id: pipeline_id.to_string(),
        };
        Ok(())
    }

    async fn unregister(&mut self) -> Result<()> {
        self.registration = Registration::default();
        Ok(())
    }

    async fn send_signal(&self, signal_type: &str, payload: Value, priority: Priority) -> Result<()> {
        self.registration.require("console")?;
        let line = json!({
            "timestamp": Utc::now(),
            "runner_id": self.registration.runner_id,
            "pipeline_id": self.registration.pipeline_id,
            "signal_type": signal_type,
            "priority": priority,
            "payload": payload,
        });
        let mut out = self
            .out
            .lock()
            .map_err(|_| ConductorError::transport("console", "output stream lock poisoned"))?;
        writeln!(out, "{line}")
            .and_then(|_| out.flush())
            .map_err(|e| ConductorError::transport("console", e.to_string()))
    }

    async fn receive_message(&self, _timeout: Duration) -> Result<Option<Message>> {
        self.registration.require("console")?;
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// Queue CLI
// ---------------------------------------------------------------------------

/// Shells out to a small queue client.
///
/// ```text
/// <program> register   --runner <id> --pipeline <id>
/// <program> unregister --runner <id>
/// <program> send --from <id> --type <TYPE> --priority <p> --payload <json>
/// <program> recv --for <id> --timeout-ms <n>     (prints one JSON message or nothing)
/// ```
pub struct QueueAdapter {
    program: PathBuf,
    registration: Registration,
}

impl QueueAdapter {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        QueueAdapter {
            program: program.into(),
            registration: Registration::default(),
        }
    }

    async fn run(&self, args: &[String]) -> Result<String> {
        let output = tokio::process::Command::new(&self.program)
            .args(args)
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(|e| {
                ConductorError::transport(
                    "queue",
                    format!("failed to run {}: {e}", self.program.display()),
                )
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ConductorError::transport(
                "queue",
                format!(
                    "{} {} exited with {}: {}",
                    self.program.display(),
                    args.first().map(String::as_str).unwrap_or_default(),
                    output.status,
                    stderr.trim()
                ),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ChannelAdapter for QueueAdapter {
    fn name(&self) -> &str {
        "queue"
    }

    async fn register(&mut self, runner_id: &str, pipeline_id: &str) -> Result<()> {
        self.run(&[
            "register".into(),
            "--runner".into(),
            runner_id.into(),
            "--pipeline".into(),
            pipeline_id.into(),
        ])
        .await?;
        self.registration = Registration {
            runner_id: runner_id.to_string(),
            pipeline_id: pipeline_id.to_string(),
        };
        Ok(())
    }

    async fn unregister(&mut self) -> Result<()> {
        if self.registration.runner_id.is_empty() {
            return Ok(());
        }
        let runner = self.registration.runner_id.clone();
        self.run(&["unregister".into(), "--runner".into(), runner]).await?;
        self.registration = Registration::default();
        Ok(())
    }

    async fn send_signal(&self, signal_type: &str, payload: Value, priority: Priority) -> Result<()> {
        self.registration.require("queue")?;
        self.run(&[
            "send".into(),
            "--from".into(),
            self.registration.runner_id.clone(),
            "--type".into(),
            signal_type.into(),
            "--priority".into(),
            priority.as_str().into(),
            "--payload".into(),
            payload.to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn receive_message(&self, timeout: Duration) -> Result<Option<Message>> {
        self.registration.require("queue")?;
        let timeout_ms = timeout.as_millis().min(u64::MAX as u128) as u64;
        let stdout = self
            .run(&[
                "recv".into(),
                "--for".into(),
                self.registration.runner_id.clone(),
                "--timeout-ms".into(),
                timeout_ms.to_string(),
            ])
            .await?;
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        let value: Value = serde_json::from_str(trimmed).map_err(|e| {
            ConductorError::transport("queue", format!("unreadable message from queue client: {e}"))
        })?;
        Ok(Some(Message::from_json(&value)))
    }
}

// ---------------------------------------------------------------------------
// Inbox directory
// ---------------------------------------------------------------------------

/// Teammate-inbox convention: timestamp-prefixed JSON files written to an
/// outbox directory, and the oldest file of an inbox directory read and
/// deleted on receipt.
pub struct InboxAdapter {
    inbox: PathBuf,
    outbox: PathBuf,
    poll_interval: Duration,
    registration: Registration,
}

impl InboxAdapter {
    pub fn new(inbox: impl Into<PathBuf>, outbox: impl Into<PathBuf>) -> Self {
        InboxAdapter {
            inbox: inbox.into(),
            outbox: outbox.into(),
            poll_interval: Duration::from_millis(250),
            registration: Registration::default(),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn oldest_inbox_file(&self) -> Result<Option<PathBuf>> {
        let entries = match std::fs::read_dir(&self.inbox) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ConductorError::transport("inbox", e.to_string())),
        };
        let mut files: Vec<PathBuf> = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && !fs::is_hidden(&path) {
                files.push(path);
            }
        }
        files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(files.into_iter().next())
    }

    /// Unreadable entries are parked here so they stop blocking the inbox.
    pub fn rejected_dir(&self) -> PathBuf {
        self.inbox.join("rejected")
    }

    fn reject(&self, path: &Path) -> Result<()> {
        let dir = self.rejected_dir();
        let name = path.file_name().ok_or_else(|| {
            ConductorError::transport("inbox", format!("{} has no file name", path.display()))
        })?;
        std::fs::create_dir_all(&dir)
            .and_then(|_| std::fs::rename(path, dir.join(name)))
            .map_err(|e| ConductorError::transport("inbox", e.to_string()))?;
        tracing::warn!(path = %path.display(), "Inbox entry is not UTF-8, set aside");
        Ok(())
    }

    fn take(&self, path: &Path) -> Result<Option<Message>> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ConductorError::transport("inbox", e.to_string())),
        };
        let Ok(text) = String::from_utf8(bytes) else {
            self.reject(path)?;
            return Ok(None);
        };
        let value: Value = serde_json::from_str(&text).unwrap_or_else(|_| {
            // Plain-text inbox entries carry the text as content.
            json!({ "content": text.trim(), "type": "message" })
        });
        std::fs::remove_file(path).map_err(|e| ConductorError::transport("inbox", e.to_string()))?;
        Ok(Some(Message::from_json(&value)))
    }
}

#[async_trait]
impl ChannelAdapter for InboxAdapter {
    fn name(&self) -> &str {
        "inbox"
    }

    async fn register(&mut self, runner_id: &str, pipeline_id: &str) -> Result<()> {
        std::fs::create_dir_all(&self.inbox)
            .map_err(|e| ConductorError::transport("inbox", e.to_string()))?;
        self.registration = Registration {
            runner_id: runner_id.to_string(),
            pipeline_id: pipeline_id.to_string(),
        };
        Ok(())
    }

    async fn unregister(&mut self) -> Result<()> {
        self.registration = Registration::default();
        Ok(())
    }

    async fn send_signal(&self, signal_type: &str, payload: Value, priority: Priority) -> Result<()> {
        self.registration.require("inbox")?;
        let now = Utc::now();
        let seq = OUTBOX_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let path = self.outbox.join(format!(
            "{}-{:08}-{}.json",
            now.format("%Y%m%dT%H%M%S%.6fZ"),
            seq,
            signal_type
        ));
        let body = json!({
            "sender": self.registration.runner_id,
            "pipeline_id": self.registration.pipeline_id,
            "message_type": signal_type,
            "content": signal_type,
            "priority": priority,
            "payload": payload,
            "timestamp": now,
        });
        let bytes = serde_json::to_vec_pretty(&body)?;
        fs::atomic_write(&path, &bytes).map_err(|e| ConductorError::transport("inbox", e.to_string()))?;
        tracing::debug!(path = %path.display(), signal_type, "Outbox message written");
        Ok(())
    }

    async fn receive_message(&self, timeout: Duration) -> Result<Option<Message>> {
        self.registration.require("inbox")?;
        let started = tokio::time::Instant::now();
        let deadline = started.checked_add(timeout);
        loop {
            if let Some(path) = self.oldest_inbox_file()? {
                if let Some(message) = self.take(&path)? {
                    return Ok(Some(message));
                }
                continue;
            }
            let now = tokio::time::Instant::now();
            let remaining = match deadline {
                Some(d) if now >= d => return Ok(None),
                Some(d) => d - now,
                None => self.poll_interval,
            };
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Signal mailbox
// ---------------------------------------------------------------------------

/// Bridges the adapter contract onto the signal mailbox: sends go to the
/// guardian layer, control messages are received from the runner layer.
///
/// Only control types (shutdown, pause, resume, approval, override) are
/// consumed here; worker and validation signals are left for the runner's
/// own mailbox handling.
pub struct MailboxAdapter {
    store: SignalStore,
    poll_interval: Duration,
    registration: Registration,
}

impl MailboxAdapter {
    pub fn new(store: SignalStore) -> Self {
        MailboxAdapter {
            store,
            poll_interval: Duration::from_millis(250),
            registration: Registration::default(),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn is_control(signal_type: &str) -> bool {
        matches!(
            normalize_message_type(signal_type).as_str(),
            message_types::SHUTDOWN
                | message_types::PAUSE
                | message_types::RESUME
                | message_types::APPROVAL
                | message_types::OVERRIDE
        )
    }
}

#[async_trait]
impl ChannelAdapter for MailboxAdapter {
    fn name(&self) -> &str {
        "mailbox"
    }

    async fn register(&mut self, runner_id: &str, pipeline_id: &str) -> Result<()> {
        self.registration = Registration {
            runner_id: runner_id.to_string(),
            pipeline_id: pipeline_id.to_string(),
        };
        Ok(())
    }

    async fn unregister(&mut self) -> Result<()> {
        self.registration = Registration::default();
        Ok(())
    }

    async fn send_signal(&self, signal_type: &str, payload: Value, priority: Priority) -> Result<()> {
        self.registration.require("mailbox")?;
        let mut body = match payload {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("detail".into(), other);
                map
            }
        };
        body.insert("priority".into(), json!(priority));
        body.insert("runner_id".into(), json!(self.registration.runner_id));
        body.insert("pipeline_id".into(), json!(self.registration.pipeline_id));
        self.store
            .send(Layer::Runner, Layer::Guardian, signal_type, Value::Object(body))?;
        Ok(())
    }

    async fn receive_message(&self, timeout: Duration) -> Result<Option<Message>> {
        self.registration.require("mailbox")?;
        let pipeline_id = self.registration.pipeline_id.as_str();
        let found = self
            .store
            .wait_for_signal_where(
                Layer::Runner,
                |s| Self::is_control(&s.signal_type) && s.is_for_pipeline(pipeline_id),
                timeout,
                self.poll_interval,
            )
            .await;
        let pending = match found {
            Ok(p) => p,
            Err(ConductorError::Timeout { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let signal = &pending.signal;
        let message = Message::new(
            signal.source.as_str(),
            signal.payload_str("content").unwrap_or(&signal.signal_type),
            &signal.signal_type,
            signal.payload.clone(),
        );
        self.store.move_to_processed(&pending.path)?;
        Ok(Some(message))
    }
}

/// Shared in-memory writer, handy for capturing console output.
#[derive(Clone, Default)]
pub struct SharedBuffer(pub Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        self.0
            .lock()
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .map_err(|_| std::io::Error::other("buffer lock poisoned"))?
            .write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
