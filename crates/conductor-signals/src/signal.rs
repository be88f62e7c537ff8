//! Directory-based signal mailbox.
//!
//! Each layer owns `signals/<layer>/pending` and `signals/<layer>/processed`.
//! A signal is one JSON file written atomically into the target layer's
//! `pending` directory. Filenames start with a UTC timestamp so a
//! lexicographic listing returns signals oldest first.
//!
//! Delivery is at-least-once. A consumer handles a signal completely and only
//! then calls [`SignalStore::move_to_processed`]; a crash before the move
//! redelivers the same signal.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use conductor_types::{fs, ConductorError, Layer, Result, StateLayout};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-process counter that keeps filenames ordered within one microsecond.
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

fn signal_type_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Z][A-Z0-9_]*$").expect("valid signal type pattern"))
}

/// Returns `true` for upper-case tokens such as `NEEDS_REVIEW`.
pub fn is_valid_signal_type(signal_type: &str) -> bool {
    signal_type_pattern().is_match(signal_type)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub source: Layer,
    pub target: Layer,
    pub signal_type: String,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl Signal {
    pub fn new(source: Layer, target: Layer, signal_type: impl Into<String>, payload: Value) -> Self {
        Signal {
            source,
            target,
            signal_type: signal_type.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// String field of the payload.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    pub fn node_id(&self) -> Option<&str> {
        self.payload_str("node_id")
    }

    /// Pipeline the signal is addressed to, when the sender named one.
    pub fn pipeline_id(&self) -> Option<&str> {
        self.payload_str("pipeline_id")
    }

    /// `true` unless the signal names a different pipeline.
    pub fn is_for_pipeline(&self, pipeline_id: &str) -> bool {
        self.pipeline_id().map_or(true, |p| p == pipeline_id)
    }
}

/// A signal still sitting in a `pending` directory.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSignal {
    pub path: PathBuf,
    pub signal: Signal,
}

/// The mailbox rooted at a `signals/` directory.
#[derive(Debug, Clone)]
pub struct SignalStore {
    root: PathBuf,
}

impl SignalStore {
    pub fn new(signals_dir: impl Into<PathBuf>) -> Self {
        SignalStore {
            root: signals_dir.into(),
        }
    }

    pub fn from_layout(layout: &StateLayout) -> Self {
        Self::new(layout.signals_dir())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pending_dir(&self, layer: Layer) -> PathBuf {
        self.root.join(layer.as_str()).join("pending")
    }

    pub fn processed_dir(&self, layer: Layer) -> PathBuf {
        self.root.join(layer.as_str()).join("processed")
    }

    /// Malformed signals are moved here so they stop blocking the mailbox.
    pub fn rejected_dir(&self, layer: Layer) -> PathBuf {
        self.root.join(layer.as_str()).join("rejected")
    }

    fn file_name(signal: &Signal) -> String {
        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let unique = uuid::Uuid::new_v4().simple().to_string();
        format!(
            "{}-{:08}-{}-{}-{}.json",
            signal.timestamp.format("%Y%m%dT%H%M%S%.6fZ"),
            seq,
            &unique[..8],
            signal.source,
            signal.signal_type
        )
    }

    /// Persist `signal` atomically into its target's pending directory.
    pub fn write_signal(&self, signal: &Signal) -> Result<PathBuf> {
        if !is_valid_signal_type(&signal.signal_type) {
            return Err(ConductorError::Other(format!(
                "invalid signal type '{}' (expected an upper-case token like NEEDS_REVIEW)",
                signal.signal_type
            )));
        }
        let path = self.pending_dir(signal.target).join(Self::file_name(signal));
        let bytes = serde_json::to_vec_pretty(signal)?;
        fs::atomic_write(&path, &bytes).map_err(|e| {
            ConductorError::transport(format!("{} mailbox", signal.target), e.to_string())
        })?;
        tracing::debug!(
            source = %signal.source,
            target = %signal.target,
            signal_type = %signal.signal_type,
            path = %path.display(),
            "Signal written"
        );
        Ok(path)
    }

    /// Build and write a signal in one step.
    pub fn send(
        &self,
        source: Layer,
        target: Layer,
        signal_type: &str,
        payload: Value,
    ) -> Result<PathBuf> {
        self.write_signal(&Signal::new(source, target, signal_type, payload))
    }

    /// Pending signal files for `layer`, oldest first.
    pub fn list_signals(&self, layer: Layer) -> Result<Vec<PathBuf>> {
        let dir = self.pending_dir(layer);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(ConductorError::transport(
                    format!("{layer} mailbox"),
                    format!("cannot list {}: {e}", dir.display()),
                ))
            }
        };
        let mut paths = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if fs::is_hidden(&path) || path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            paths.push(path);
        }
        paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(paths)
    }

    /// Parse one signal file. A parse failure is `MalformedSignal`.
    pub fn read_signal(&self, path: &Path) -> Result<Signal> {
        let bytes = std::fs::read(path).map_err(|e| ConductorError::from_io(e, path))?;
        serde_json::from_slice(&bytes).map_err(|e| ConductorError::MalformedSignal {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Read every pending signal for `layer`, oldest first.
    pub fn pending(&self, layer: Layer) -> Result<Vec<PendingSignal>> {
        self.list_signals(layer)?
            .into_iter()
            .map(|path| {
                let signal = self.read_signal(&path)?;
                Ok(PendingSignal { path, signal })
            })
            .collect()
    }

    fn move_into(&self, path: &Path, dir: PathBuf) -> Result<PathBuf> {
        let name = path.file_name().ok_or_else(|| {
            ConductorError::Other(format!("signal path {} has no file name", path.display()))
        })?;
        std::fs::create_dir_all(&dir)?;
        let dest = dir.join(name);
        std::fs::rename(path, &dest).map_err(|e| ConductorError::from_io(e, path))?;
        Ok(dest)
    }

    fn layer_of(path: &Path) -> Result<Layer> {
        path.parent()
            .and_then(Path::parent)
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                ConductorError::Other(format!(
                    "signal path {} is not inside a layer mailbox",
                    path.display()
                ))
            })?
            .parse()
    }

    /// Consume a signal. Call this last, after the signal is fully handled.
    pub fn move_to_processed(&self, path: &Path) -> Result<PathBuf> {
        let layer = Self::layer_of(path)?;
        let dest = self.move_into(path, self.processed_dir(layer))?;
        tracing::debug!(layer = %layer, path = %dest.display(), "Signal processed");
        Ok(dest)
    }

    /// Set a malformed signal aside.
    pub fn move_to_rejected(&self, path: &Path) -> Result<PathBuf> {
        let layer = Self::layer_of(path)?;
        let dest = self.move_into(path, self.rejected_dir(layer))?;
        tracing::warn!(layer = %layer, path = %dest.display(), "Malformed signal set aside");
        Ok(dest)
    }

    /// Wait for the oldest pending signal for `layer`.
    pub async fn wait_for_signal(
        &self,
        layer: Layer,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<PendingSignal> {
        self.wait_for_signal_where(layer, |_| true, timeout, poll_interval)
            .await
    }

    /// Wait for the oldest pending signal matching `predicate`.
    ///
    /// Non-matching signals stay pending for other waiters. Nothing is
    /// consumed: the caller moves the returned signal to processed.
    /// Unparseable files are moved to rejected and the wait goes on.
    pub async fn wait_for_signal_where<F>(
        &self,
        layer: Layer,
        predicate: F,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<PendingSignal>
    where
        F: Fn(&Signal) -> bool,
    {
        let started = tokio::time::Instant::now();
        let deadline = started.checked_add(timeout);
        loop {
            for path in self.list_signals(layer)? {
                let signal = match self.read_signal(&path) {
                    Ok(signal) => signal,
                    // Consumed by another waiter between listing and reading.
                    Err(ConductorError::NotFound { .. }) => continue,
                    Err(e @ ConductorError::MalformedSignal { .. }) => {
                        tracing::warn!(layer = %layer, error = %e, "Rejecting malformed signal while waiting");
                        match self.move_to_rejected(&path) {
                            Ok(_) | Err(ConductorError::NotFound { .. }) => {}
                            Err(e) => return Err(e),
                        }
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                if predicate(&signal) {
                    return Ok(PendingSignal { path, signal });
                }
            }

            let now = tokio::time::Instant::now();
            let remaining = match deadline {
                Some(d) if now >= d => {
                    let waited_ms = now.duration_since(started).as_millis() as u64;
                    tracing::debug!(layer = %layer, waited_ms, "Signal wait timed out");
                    return Err(ConductorError::Timeout {
                        layer: layer.to_string(),
                        waited_ms,
                    });
                }
                Some(d) => d - now,
                None => poll_interval,
            };
            tokio::time::sleep(poll_interval.min(remaining)).await;
        }
    }

    /// Wait for a signal whose payload names `node_id`.
    pub async fn wait_for_node_signal(
        &self,
        layer: Layer,
        node_id: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<PendingSignal> {
        self.wait_for_signal_where(
            layer,
            |s| s.node_id() == Some(node_id),
            timeout,
            poll_interval,
        )
        .await
    }

    /// Report `error` to the layer above `from`, using the ordinary signal path.
    pub fn escalate(&self, from: Layer, error: &ConductorError, payload: Value) -> Result<PathBuf> {
        let target = from.escalation_target().ok_or_else(|| {
            ConductorError::Other(format!("the {from} layer has no layer above it"))
        })?;
        let mut body = match payload {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("detail".into(), other);
                map
            }
        };
        body.insert("error_kind".into(), Value::String(error.kind().to_string()));
        body.insert("error".into(), Value::String(error.to_string()));
        tracing::warn!(from = %from, to = %target, error = %error, "Escalating");
        self.send(from, target, "ESCALATION", Value::Object(body))
    }
}
