//! The runner loop: plan, act, persist, report.
//!
//! Each cycle reloads the graph file, drains the runner mailbox and the
//! channel, asks the scheduler for a plan and carries it out. Every applied
//! transition is audited; the graph file, runner state and a checkpoint are
//! rewritten whenever anything changed, so a crashed runner resumes from disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use conductor_signals::channel::message_types;
use conductor_signals::{ChannelAdapter, Message, PendingSignal, SignalStore};
use conductor_types::{ConductorError, Layer, NodeStatus, Result, SessionIdentity};
use serde_json::{json, Value};

use crate::audit::{AuditLog, AuditStore, JsonlAuditStore};
use crate::checkpoint::save_checkpoint_text;
use crate::config::{render_worker_command, RunnerConfig};
use crate::events::{EventEmitter, RunnerEvent};
use crate::graph::PipelineGraph;
use crate::merge_queue::MergeQueue;
use crate::plan::{ActionKind, NodeAction, RunnerPlan};
use crate::retry::{with_retry, BackoffPolicy};
use crate::runner_state::RunnerState;
use crate::scheduler::plan_cycle;
use crate::state_machine::{apply_transition, check_transition, path_to};
use crate::worker::{WorkerHandle, WorkerLauncher};

/// Signal types sent to the runner mailbox by workers and the guardian.
pub mod signal_types {
    pub const IMPL_COMPLETE: &str = "IMPL_COMPLETE";
    pub const VALIDATION_PASSED: &str = "VALIDATION_PASSED";
    pub const VALIDATION_FAILED: &str = "VALIDATION_FAILED";
    pub const GUIDANCE: &str = "GUIDANCE";
    pub const NEEDS_REVIEW: &str = "NEEDS_REVIEW";
    pub const SELF_VALIDATION_REJECTED: &str = "SELF_VALIDATION_REJECTED";
    pub const STUCK: &str = "STUCK";
    pub const ESCALATION: &str = "ESCALATION";
    pub const PIPELINE_COMPLETE: &str = "PIPELINE_COMPLETE";
}

/// Inbound messages handled per cycle before the runner moves on.
const MAX_MESSAGES_PER_CYCLE: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { checkpoint: PathBuf },
    Shutdown,
    Aborted { reason: String },
    CycleLimit { cycles: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Guidance {
    Retry(Option<String>),
    Abort(String),
    Pause,
    Continue,
}

impl Guidance {
    fn from_payload(payload: &Value) -> Self {
        let node = payload
            .get("node_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        match payload.get("action").and_then(Value::as_str).unwrap_or("continue") {
            "retry" => Guidance::Retry(node),
            "abort" => Guidance::Abort(
                payload
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("aborted by guardian")
                    .to_string(),
            ),
            "pause" => Guidance::Pause,
            _ => Guidance::Continue,
        }
    }
}

pub struct Runner {
    config: RunnerConfig,
    identity: SessionIdentity,
    pipeline_path: PathBuf,
    pipeline_id: String,
    signals: SignalStore,
    channel: Box<dyn ChannelAdapter>,
    launcher: Box<dyn WorkerLauncher>,
    audit: AuditLog<Box<dyn AuditStore>>,
    merge: Option<(MergeQueue, PathBuf)>,
    events: EventEmitter,
    state: RunnerState,
    workers: BTreeMap<String, WorkerHandle>,
    backoff: BackoffPolicy,
    cycles: u64,
    last_heartbeat: Option<Instant>,
}

impl Runner {
    /// Open the pipeline at `pipeline_path`, resuming persisted state if any.
    pub fn new(
        pipeline_path: impl Into<PathBuf>,
        identity: SessionIdentity,
        config: RunnerConfig,
        channel: Box<dyn ChannelAdapter>,
        launcher: Box<dyn WorkerLauncher>,
    ) -> Result<Self> {
        let pipeline_path = pipeline_path.into();
        let graph = PipelineGraph::load(&pipeline_path)?;
        let pipeline_id = pipeline_id_for(&graph, &pipeline_path);
        let state = RunnerState::load_or_new(
            &config.layout.runner_state(&pipeline_id),
            &pipeline_id,
            &pipeline_path,
            &identity.session_id,
        )?;
        let audit_store: Box<dyn AuditStore> =
            Box::new(JsonlAuditStore::new(config.layout.audit_log(&pipeline_id)));
        Ok(Runner {
            signals: SignalStore::from_layout(&config.layout),
            audit: AuditLog::new(audit_store),
            config,
            identity,
            pipeline_path,
            pipeline_id,
            channel,
            launcher,
            merge: None,
            events: EventEmitter::default(),
            state,
            workers: BTreeMap::new(),
            backoff: BackoffPolicy::default(),
            cycles: 0,
            last_heartbeat: None,
        })
    }

    pub fn with_audit_store(mut self, store: Box<dyn AuditStore>) -> Self {
        self.audit = AuditLog::new(store);
        self
    }

    /// Enqueue validated nodes that carry a `branch` attribute for `repo_root`.
    pub fn with_merge_queue(mut self, queue: MergeQueue, repo_root: impl Into<PathBuf>) -> Self {
        self.merge = Some((queue, repo_root.into()));
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    pub fn state(&self) -> &RunnerState {
        &self.state
    }

    pub fn audit(&self) -> &AuditLog<Box<dyn AuditStore>> {
        &self.audit
    }

    pub fn signals(&self) -> &SignalStore {
        &self.signals
    }

    pub fn events(&self) -> EventEmitter {
        self.events.clone()
    }

    fn state_path(&self) -> PathBuf {
        self.config.layout.runner_state(&self.pipeline_id)
    }

    fn save_state(&mut self) -> Result<()> {
        let path = self.state_path();
        self.state.save(&path)
    }

    /// Run until completion, shutdown, abort, or the cycle limit.
    pub async fn run(&mut self) -> Result<RunOutcome> {
        self.start().await?;
        let outcome = loop {
            if let Some(max) = self.config.max_cycles {
                if self.cycles >= max {
                    break RunOutcome::CycleLimit { cycles: self.cycles };
                }
            }
            match self.step().await {
                Ok(Some(outcome)) => break outcome,
                Ok(None) => {}
                Err(e) if e.is_escalation() => {
                    tracing::warn!(pipeline = %self.pipeline_id, error = %e, "Cycle failed, escalating");
                    self.signals
                        .escalate(Layer::Runner, &e, json!({ "pipeline_id": self.pipeline_id }))?;
                }
                Err(e) => {
                    self.finish().await;
                    return Err(e);
                }
            }
            tokio::time::sleep(self.config.poll_interval).await;
        };
        self.finish().await;
        Ok(outcome)
    }

    /// Register with the channel and announce the run.
    pub async fn start(&mut self) -> Result<()> {
        let graph = PipelineGraph::load(&self.pipeline_path)?;
        self.channel
            .register(&self.identity.session_id, &self.pipeline_id)
            .await?;
        tracing::info!(
            pipeline = %self.pipeline_id,
            session = %self.identity.session_id,
            role = %self.identity.role,
            channel = self.channel.name(),
            nodes = graph.node_count(),
            "Runner started"
        );
        self.events.emit(RunnerEvent::RunStarted {
            pipeline_id: self.pipeline_id.clone(),
            session_id: self.identity.session_id.clone(),
            node_count: graph.node_count(),
        });
        self.save_state()
    }

    async fn finish(&mut self) {
        if let Err(e) = self.channel.unregister().await {
            tracing::warn!(error = %e, "Channel unregister failed");
        }
    }

    /// One decision cycle. `Some` ends the run.
    pub async fn step(&mut self) -> Result<Option<RunOutcome>> {
        self.cycles += 1;
        let mut graph = PipelineGraph::load(&self.pipeline_path)?;

        let mut consumed = Vec::new();
        let (mut changed, mut control) = self.drain_mailbox(&mut graph, &mut consumed).await?;
        if control.is_none() {
            let (channel_changed, channel_control) = self.drain_channel(&mut graph).await?;
            changed |= channel_changed;
            control = channel_control;
        }
        // Mailbox signals are consumed only once their effects are on disk.
        if changed || !consumed.is_empty() {
            self.persist_graph(&graph, changed)?;
            self.save_state()?;
        }
        self.mark_processed(&consumed)?;

        if let Some(outcome) = control {
            self.write_checkpoint(&graph)?;
            self.save_state()?;
            return Ok(Some(outcome));
        }

        if self.state.paused {
            self.save_state()?;
            tracing::debug!(pipeline = %self.pipeline_id, "Paused");
            return Ok(None);
        }

        let plan = plan_cycle(&graph, &self.state, self.config.max_retries);
        tracing::info!(pipeline = %self.pipeline_id, cycle = self.cycles, summary = %plan.summary, "Cycle planned");
        self.events.emit(RunnerEvent::CyclePlanned {
            cycle: self.cycles,
            summary: plan.summary.clone(),
        });
        self.state.last_plan = Some(plan.clone());
        self.save_state()?;

        if plan.pipeline_complete {
            let checkpoint = self.complete(&graph).await?;
            return Ok(Some(RunOutcome::Completed { checkpoint }));
        }

        let mut acted = false;
        let mut stuck_nodes = Vec::new();
        for action in &plan.actions {
            match action.kind {
                kind if kind.completes_structurally() => {
                    self.drive(
                        &mut graph,
                        &action.node_id,
                        NodeStatus::Validated,
                        None,
                        &action.reason,
                    )?;
                    self.enqueue_merge(&graph, &action.node_id);
                    acted = true;
                }
                ActionKind::SpawnWorker => {
                    self.spawn_worker(&mut graph, action).await?;
                    acted = true;
                }
                ActionKind::DispatchValidation => {
                    self.dispatch_validation(&graph, &action.node_id)?;
                    acted = true;
                }
                ActionKind::RequestApproval => {
                    self.request_approval(&mut graph, action).await?;
                    acted = true;
                }
                ActionKind::SignalStuck => stuck_nodes.push(action.node_id.clone()),
                _ => {}
            }
        }

        self.persist_graph(&graph, acted)?;
        let progressed = changed || acted;
        if progressed && self.config.checkpoint_on_change {
            self.write_checkpoint(&graph)?;
        }

        if progressed || !plan.active_nodes.is_empty() {
            self.state.idle_cycles = 0;
        } else {
            self.state.idle_cycles += 1;
        }

        let outcome = if let Some(node) = stuck_nodes.first() {
            let reason = stuck_reason(&plan, node);
            self.handle_stuck(Some(node.clone()), reason).await?
        } else if self.state.idle_cycles >= self.config.stuck_threshold {
            let reason = format!("no progress for {} cycles", self.state.idle_cycles);
            self.state.idle_cycles = 0;
            self.handle_stuck(None, reason).await?
        } else {
            None
        };

        let due = self
            .last_heartbeat
            .map_or(true, |at| at.elapsed() >= self.config.heartbeat_interval);
        if due {
            self.heartbeat("running", plan.active_nodes.first().map(String::as_str))
                .await;
        }
        self.save_state()?;
        Ok(outcome)
    }

    // ---------------------------------------------------------------------
    // Transitions
    // ---------------------------------------------------------------------

    /// Move `node_id` to `target` through legal steps, auditing each one.
    fn drive(
        &mut self,
        graph: &mut PipelineGraph,
        node_id: &str,
        target: NodeStatus,
        agent: Option<&str>,
        reason: &str,
    ) -> Result<()> {
        let from = graph
            .node(node_id)
            .map(|n| n.status())
            .ok_or_else(|| ConductorError::UnknownNode {
                node: node_id.to_string(),
                line: 0,
            })?;
        let Some(steps) = path_to(from, target) else {
            // Reports the illegal pair with its legal targets.
            check_transition(graph, node_id, target)?;
            return Ok(());
        };
        for step in steps {
            self.transition(graph, node_id, step, agent, None, reason)?;
        }
        Ok(())
    }

    fn transition(
        &mut self,
        graph: &mut PipelineGraph,
        node_id: &str,
        to: NodeStatus,
        agent: Option<&str>,
        evidence: Option<&str>,
        reason: &str,
    ) -> Result<()> {
        let transition = apply_transition(graph, node_id, to)?;
        let agent = agent.unwrap_or(&self.identity.session_id).to_string();
        self.audit
            .record_transition(&transition, &agent, evidence, reason)?;
        self.events.emit(RunnerEvent::TransitionApplied {
            node_id: node_id.to_string(),
            from: transition.from,
            to: transition.to,
            reason: reason.to_string(),
        });
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Actions
    // ---------------------------------------------------------------------

    async fn spawn_worker(&mut self, graph: &mut PipelineGraph, action: &NodeAction) -> Result<()> {
        let id = action.node_id.as_str();
        let retry = graph.node(id).map(|n| n.status()) == Some(NodeStatus::Failed);
        self.transition(graph, id, NodeStatus::Active, None, None, &action.reason)?;
        let attempt = if retry { self.state.increment_retry(id) } else { 0 };
        self.state.awaiting_validation.remove(id);

        let node = graph.node(id).ok_or_else(|| ConductorError::UnknownNode {
            node: id.to_string(),
            line: 0,
        })?;
        let command = render_worker_command(
            &self.config.worker_command,
            &[
                ("node_id", id),
                ("bead_id", node.bead_id().unwrap_or_default()),
                ("worker_type", node.worker_type().unwrap_or_default()),
                ("pipeline_id", &self.pipeline_id),
                ("session_id", &self.identity.session_id),
                ("acceptance", node.acceptance().unwrap_or_default()),
            ],
        );
        let worker_id = format!("{}.{}", self.pipeline_id, id);
        if let Some(old) = self.workers.remove(id) {
            if let Err(e) = self.launcher.stop(&old).await {
                tracing::warn!(node = %id, error = %e, "Could not stop previous worker");
            }
        }
        match self.launcher.start(&worker_id, &command).await {
            Ok(handle) => {
                tracing::info!(node = %id, attempt, worker = %handle.session, "Worker spawned");
                self.workers.insert(id.to_string(), handle);
                self.events.emit(RunnerEvent::WorkerSpawned {
                    node_id: id.to_string(),
                    attempt,
                });
            }
            Err(e) => {
                tracing::warn!(node = %id, error = %e, "Worker launch failed");
                self.signals.escalate(
                    Layer::Runner,
                    &e,
                    json!({ "pipeline_id": self.pipeline_id, "node_id": id }),
                )?;
            }
        }
        Ok(())
    }

    fn dispatch_validation(&mut self, graph: &PipelineGraph, node_id: &str) -> Result<()> {
        let node = graph.node(node_id);
        self.signals.send(
            Layer::Runner,
            Layer::Guardian,
            signal_types::NEEDS_REVIEW,
            json!({
                "pipeline_id": self.pipeline_id,
                "node_id": node_id,
                "bead_id": node.and_then(|n| n.bead_id()),
                "acceptance": node.and_then(|n| n.acceptance()),
                "implementer": self.state.implementer(node_id),
                "runner_session": self.identity.session_id,
            }),
        )?;
        self.state.awaiting_validation.insert(node_id.to_string());
        self.events.emit(RunnerEvent::ValidationDispatched {
            node_id: node_id.to_string(),
        });
        tracing::info!(node = %node_id, "Validation requested");
        Ok(())
    }

    async fn request_approval(&mut self, graph: &mut PipelineGraph, action: &NodeAction) -> Result<()> {
        let id = action.node_id.as_str();
        if graph.node(id).map(|n| n.status()) == Some(NodeStatus::Failed) {
            self.state.increment_retry(id);
        }
        self.transition(graph, id, NodeStatus::Active, None, None, &action.reason)?;
        self.state.awaiting_approval.insert(id.to_string());

        let (gate, acceptance, summary) = match graph.node(id) {
            Some(n) => (
                n.handler().unwrap_or("approval").to_string(),
                n.acceptance().unwrap_or_default().to_string(),
                n.label().to_string(),
            ),
            None => ("approval".into(), String::new(), id.to_string()),
        };
        let channel = &self.channel;
        let sent = with_retry(
            || channel.request_approval(id, &gate, &acceptance, &summary),
            3,
            &self.backoff,
            "request_approval",
        )
        .await;
        match sent {
            Ok(()) => self.events.emit(RunnerEvent::ApprovalRequested {
                node_id: id.to_string(),
            }),
            // The node stays active and awaiting; the guardian can approve through the mailbox.
            Err(e) => {
                tracing::warn!(node = %id, error = %e, "Approval request not delivered");
                self.signals.escalate(
                    Layer::Runner,
                    &e,
                    json!({ "pipeline_id": self.pipeline_id, "node_id": id, "gate": gate }),
                )?;
            }
        }
        Ok(())
    }

    fn enqueue_merge(&mut self, graph: &PipelineGraph, node_id: &str) {
        let Some((queue, repo_root)) = &self.merge else {
            return;
        };
        let Some(branch) = graph.node(node_id).and_then(|n| n.branch()) else {
            return;
        };
        match queue.enqueue(node_id, branch, repo_root) {
            Ok(_) => self.events.emit(RunnerEvent::MergeEnqueued {
                node_id: node_id.to_string(),
                branch: branch.to_string(),
            }),
            Err(e) => tracing::warn!(node = %node_id, error = %e, "Merge enqueue failed"),
        }
    }

    // ---------------------------------------------------------------------
    // Mailbox
    // ---------------------------------------------------------------------

    /// Handle worker and guardian signals addressed to this pipeline.
    ///
    /// Handled signals are collected in `consumed`; the caller moves them to
    /// processed after the graph and state are saved. Control types are left
    /// for the channel.
    async fn drain_mailbox(
        &mut self,
        graph: &mut PipelineGraph,
        consumed: &mut Vec<PathBuf>,
    ) -> Result<(bool, Option<RunOutcome>)> {
        let mut changed = false;
        for path in self.signals.list_signals(Layer::Runner)? {
            let signal = match self.signals.read_signal(&path) {
                Ok(s) => s,
                Err(ConductorError::NotFound { .. }) => continue,
                Err(e @ ConductorError::MalformedSignal { .. }) => {
                    tracing::warn!(error = %e, "Rejecting malformed signal");
                    self.signals.move_to_rejected(&path)?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            if !signal.is_for_pipeline(&self.pipeline_id) {
                continue;
            }
            let pending = PendingSignal { path, signal };
            let handled = match pending.signal.signal_type.as_str() {
                signal_types::IMPL_COMPLETE => self.on_impl_complete(graph, &pending).await,
                signal_types::VALIDATION_PASSED => self.on_validation_passed(graph, &pending),
                signal_types::VALIDATION_FAILED => self.on_validation_failed(graph, &pending),
                signal_types::GUIDANCE => {
                    let guidance = Guidance::from_payload(&pending.signal.payload);
                    if let Some(outcome) = self.apply_guidance(guidance) {
                        consumed.push(pending.path);
                        return Ok((changed, Some(outcome)));
                    }
                    Ok(false)
                }
                other if is_control_type(other) => continue,
                other => {
                    tracing::warn!(signal_type = %other, "Ignoring unexpected signal");
                    Ok(false)
                }
            };
            match handled {
                Ok(c) => changed |= c,
                Err(e @ ConductorError::UnknownNode { .. }) if pending.signal.pipeline_id().is_none() => {
                    // Another runner sharing the mailbox may own the node.
                    tracing::debug!(error = %e, "Leaving unaddressed signal pending");
                    continue;
                }
                Err(e @ (ConductorError::IllegalTransition { .. } | ConductorError::UnknownNode { .. })) => {
                    // Redelivered or stale signal.
                    tracing::warn!(
                        signal_type = %pending.signal.signal_type,
                        error = %e,
                        "Signal does not apply to current state"
                    );
                }
                Err(e @ ConductorError::MalformedSignal { .. }) => {
                    tracing::warn!(error = %e, "Rejecting signal without a usable payload");
                    self.signals.move_to_rejected(&pending.path)?;
                    continue;
                }
                Err(e) => return Err(e),
            }
            consumed.push(pending.path);
        }
        Ok((changed, None))
    }

    fn mark_processed(&self, paths: &[PathBuf]) -> Result<()> {
        for path in paths {
            self.signals.move_to_processed(path)?;
        }
        Ok(())
    }

    fn signal_node(pending: &PendingSignal) -> Result<&str> {
        pending.signal.node_id().ok_or_else(|| ConductorError::MalformedSignal {
            path: pending.path.clone(),
            message: "payload has no node_id".into(),
        })
    }

    async fn on_impl_complete(&mut self, graph: &mut PipelineGraph, pending: &PendingSignal) -> Result<bool> {
        let node_id = Self::signal_node(pending)?.to_string();
        let payload = &pending.signal.payload;
        let worker = payload
            .get("session_id")
            .or_else(|| payload.get("worker_id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.workers.get(&node_id).map(|h| h.session.clone()))
            .unwrap_or_else(|| pending.signal.source.to_string());
        let success = payload.get("success").and_then(Value::as_bool).unwrap_or(true);
        let evidence = payload.get("evidence").map(|e| match e {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });

        self.transition(
            graph,
            &node_id,
            NodeStatus::ImplComplete,
            Some(&worker),
            evidence.as_deref(),
            "worker reported implementation complete",
        )?;
        self.state.record_implementer(&node_id, &worker);
        if !success {
            let reason = payload
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("worker reported failure");
            self.transition(graph, &node_id, NodeStatus::Failed, Some(&worker), None, reason)?;
        }
        if let Some(handle) = self.workers.remove(&node_id) {
            if let Err(e) = self.launcher.stop(&handle).await {
                tracing::warn!(node = %node_id, error = %e, "Could not stop finished worker");
            }
        }
        Ok(true)
    }

    fn on_validation_passed(&mut self, graph: &mut PipelineGraph, pending: &PendingSignal) -> Result<bool> {
        let node_id = Self::signal_node(pending)?.to_string();
        let validator = validator_of(pending);
        if self.state.is_self_validation(&node_id, &validator) {
            tracing::warn!(node = %node_id, %validator, "Refusing self-validation");
            self.signals.send(
                Layer::Runner,
                Layer::Guardian,
                signal_types::SELF_VALIDATION_REJECTED,
                json!({
                    "pipeline_id": self.pipeline_id,
                    "node_id": node_id,
                    "validator": validator,
                }),
            )?;
            // A fresh review request goes out next cycle.
            self.state.awaiting_validation.remove(&node_id);
            self.events.emit(RunnerEvent::SelfValidationRejected { node_id, validator });
            return Ok(false);
        }
        let evidence = pending.signal.payload.get("evidence").map(Value::to_string);
        self.transition(
            graph,
            &node_id,
            NodeStatus::Validated,
            Some(&validator),
            evidence.as_deref(),
            "validation passed",
        )?;
        self.state.awaiting_validation.remove(&node_id);
        self.enqueue_merge(graph, &node_id);
        Ok(true)
    }

    fn on_validation_failed(&mut self, graph: &mut PipelineGraph, pending: &PendingSignal) -> Result<bool> {
        let node_id = Self::signal_node(pending)?.to_string();
        let validator = validator_of(pending);
        let reason = pending
            .signal
            .payload_str("reason")
            .unwrap_or("validation failed")
            .to_string();
        self.transition(graph, &node_id, NodeStatus::Failed, Some(&validator), None, &reason)?;
        self.state.awaiting_validation.remove(&node_id);
        Ok(true)
    }

    fn apply_guidance(&mut self, guidance: Guidance) -> Option<RunOutcome> {
        tracing::info!(?guidance, "Applying guidance");
        self.state.idle_cycles = 0;
        match guidance {
            Guidance::Retry(Some(node)) => {
                self.state.retry_counts.remove(&node);
                self.resume();
                None
            }
            Guidance::Retry(None) => {
                self.state.retry_counts.clear();
                self.resume();
                None
            }
            Guidance::Pause => {
                self.state.paused = true;
                self.events.emit(RunnerEvent::Paused);
                None
            }
            Guidance::Abort(reason) => Some(RunOutcome::Aborted { reason }),
            Guidance::Continue => {
                self.resume();
                None
            }
        }
    }

    fn resume(&mut self) {
        if self.state.paused {
            self.state.paused = false;
            self.state.idle_cycles = 0;
            self.events.emit(RunnerEvent::Resumed);
        }
    }

    // ---------------------------------------------------------------------
    // Channel
    // ---------------------------------------------------------------------

    async fn drain_channel(&mut self, graph: &mut PipelineGraph) -> Result<(bool, Option<RunOutcome>)> {
        let mut changed = false;
        for _ in 0..MAX_MESSAGES_PER_CYCLE {
            let message = match self.channel.receive_message(Duration::ZERO).await {
                Ok(Some(m)) => m,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(channel = self.channel.name(), error = %e, "Channel receive failed");
                    break;
                }
            };
            tracing::debug!(sender = %message.sender, message_type = %message.message_type, "Channel message");
            match message.message_type.as_str() {
                message_types::SHUTDOWN => {
                    tracing::info!(pipeline = %self.pipeline_id, sender = %message.sender, "Shutdown requested");
                    self.events.emit(RunnerEvent::RunStopped {
                        pipeline_id: self.pipeline_id.clone(),
                        reason: "shutdown".into(),
                    });
                    return Ok((changed, Some(RunOutcome::Shutdown)));
                }
                message_types::PAUSE => {
                    self.state.paused = true;
                    self.events.emit(RunnerEvent::Paused);
                }
                message_types::RESUME => self.resume(),
                message_types::APPROVAL => {
                    changed |= self.on_approval(graph, &message, true)?;
                }
                message_types::OVERRIDE => {
                    changed |= self.on_approval(graph, &message, false)?;
                }
                message_types::GUIDANCE => {
                    if let Some(outcome) = self.apply_guidance(Guidance::from_payload(&message.payload)) {
                        return Ok((changed, Some(outcome)));
                    }
                }
                other => tracing::debug!(message_type = %other, "Ignoring channel message"),
            }
        }
        Ok((changed, None))
    }

    fn on_approval(&mut self, graph: &mut PipelineGraph, message: &Message, granted: bool) -> Result<bool> {
        let node_id = match message.node_id() {
            Some(id) => id.to_string(),
            None if self.state.awaiting_approval.len() == 1 => {
                match self.state.awaiting_approval.iter().next() {
                    Some(id) => id.clone(),
                    None => return Ok(false),
                }
            }
            None => {
                tracing::warn!(sender = %message.sender, "Approval message names no node");
                return Ok(false);
            }
        };
        if !self.state.awaiting_approval.contains(&node_id) {
            tracing::warn!(node = %node_id, "Approval for a node that is not awaiting one");
            return Ok(false);
        }
        let agent = if message.sender.is_empty() { "operator" } else { &message.sender };
        let target = if granted { NodeStatus::Validated } else { NodeStatus::Failed };
        let reason = if granted { "approval granted" } else { "approval overridden" };
        self.transition(graph, &node_id, NodeStatus::ImplComplete, Some(agent), None, reason)?;
        self.transition(graph, &node_id, target, Some(agent), None, reason)?;
        self.state.awaiting_approval.remove(&node_id);
        if granted {
            self.enqueue_merge(graph, &node_id);
        }
        Ok(true)
    }

    async fn heartbeat(&mut self, status: &str, current_node: Option<&str>) {
        self.last_heartbeat = Some(Instant::now());
        let channel = &self.channel;
        let sent = with_retry(
            || channel.send_heartbeat(status, current_node),
            2,
            &self.backoff,
            "heartbeat",
        )
        .await;
        if let Err(e) = sent {
            tracing::warn!(error = %e, "Heartbeat failed");
            if let Err(e2) = self
                .signals
                .escalate(Layer::Runner, &e, json!({ "pipeline_id": self.pipeline_id }))
            {
                tracing::warn!(error = %e2, "Escalation failed");
            }
        }
    }

    // ---------------------------------------------------------------------
    // Stuck, completion, persistence
    // ---------------------------------------------------------------------

    async fn handle_stuck(&mut self, node: Option<String>, reason: String) -> Result<Option<RunOutcome>> {
        tracing::warn!(pipeline = %self.pipeline_id, node = ?node, %reason, "Runner stuck");
        self.events.emit(RunnerEvent::Stuck {
            node_id: node.clone(),
            idle_cycles: self.state.idle_cycles,
        });
        self.signals.send(
            Layer::Runner,
            Layer::Guardian,
            signal_types::STUCK,
            json!({
                "pipeline_id": self.pipeline_id,
                "node_id": node,
                "reason": reason,
                "runner_session": self.identity.session_id,
            }),
        )?;
        self.save_state()?;

        let pipeline_id = self.pipeline_id.as_str();
        let reply = self
            .signals
            .wait_for_signal_where(
                Layer::Runner,
                |s| s.signal_type == signal_types::GUIDANCE && s.is_for_pipeline(pipeline_id),
                self.config.guardian_timeout,
                self.config.poll_interval,
            )
            .await;
        match reply {
            Ok(pending) => {
                let outcome = self.apply_guidance(Guidance::from_payload(&pending.signal.payload));
                self.save_state()?;
                self.signals.move_to_processed(&pending.path)?;
                Ok(outcome)
            }
            Err(ConductorError::Timeout { waited_ms, .. }) => {
                self.signals.send(
                    Layer::Runner,
                    Layer::Terminal,
                    signal_types::ESCALATION,
                    json!({
                        "pipeline_id": self.pipeline_id,
                        "node_id": node,
                        "reason": reason,
                        "error_kind": "timeout",
                        "waited_ms": waited_ms,
                    }),
                )?;
                self.state.paused = true;
                self.events.emit(RunnerEvent::Escalated {
                    signal_type: signal_types::ESCALATION.into(),
                });
                self.events.emit(RunnerEvent::Paused);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn complete(&mut self, graph: &PipelineGraph) -> Result<PathBuf> {
        let checkpoint = self.write_checkpoint(graph)?;
        self.state.terminal_checkpoint = Some(checkpoint.clone());
        self.save_state()?;
        self.signals.send(
            Layer::Runner,
            Layer::Guardian,
            signal_types::PIPELINE_COMPLETE,
            json!({
                "pipeline_id": self.pipeline_id,
                "checkpoint": checkpoint.display().to_string(),
            }),
        )?;
        self.heartbeat("complete", None).await;
        tracing::info!(pipeline = %self.pipeline_id, checkpoint = %checkpoint.display(), "Pipeline complete");
        self.events.emit(RunnerEvent::RunCompleted {
            pipeline_id: self.pipeline_id.clone(),
            checkpoint: Some(checkpoint.display().to_string()),
        });
        Ok(checkpoint)
    }

    fn persist_graph(&self, graph: &PipelineGraph, changed: bool) -> Result<()> {
        if changed {
            graph.save(&self.pipeline_path)?;
        }
        Ok(())
    }

    fn write_checkpoint(&self, graph: &PipelineGraph) -> Result<PathBuf> {
        let text = graph.to_dot();
        let (_, path) = save_checkpoint_text(
            &text,
            Some(self.pipeline_path.display().to_string()),
            None,
            &self.config.layout.checkpoints_dir(),
        )?;
        self.events.emit(RunnerEvent::CheckpointSaved {
            path: path.display().to_string(),
        });
        Ok(path)
    }
}

/// Graph name, or the file stem for anonymous graphs.
pub fn pipeline_id_for(graph: &PipelineGraph, path: &Path) -> String {
    if !graph.name.is_empty() {
        return graph.name.clone();
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("pipeline")
        .to_string()
}

fn is_control_type(signal_type: &str) -> bool {
    matches!(
        conductor_signals::normalize_message_type(signal_type).as_str(),
        message_types::SHUTDOWN
            | message_types::PAUSE
            | message_types::RESUME
            | message_types::APPROVAL
            | message_types::OVERRIDE
    )
}

fn validator_of(pending: &PendingSignal) -> String {
    let payload = &pending.signal.payload;
    payload
        .get("validator")
        .or_else(|| payload.get("session_id"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| pending.signal.source.to_string())
}

fn stuck_reason(plan: &RunnerPlan, node: &str) -> String {
    plan.actions
        .iter()
        .find(|a| a.kind == ActionKind::SignalStuck && a.node_id == node)
        .map(|a| a.reason.clone())
        .unwrap_or_else(|| format!("'{node}' cannot make progress"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditStore;
    use async_trait::async_trait;
    use conductor_signals::ConsoleAdapter;
    use conductor_types::StateLayout;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct FakeLauncher {
        started: Arc<Mutex<Vec<(String, String)>>>,
    }

    #[async_trait]
    impl WorkerLauncher for FakeLauncher {
        async fn start(&self, id: &str, command: &str) -> Result<WorkerHandle> {
            self.started
                .lock()
                .unwrap()
                .push((id.to_string(), command.to_string()));
            Ok(WorkerHandle {
                id: id.to_string(),
                session: format!("w-{id}"),
            })
        }
        async fn send_text(&self, _: &WorkerHandle, _: &str) -> Result<()> {
            Ok(())
        }
        async fn capture_output(&self, _: &WorkerHandle, _: usize) -> Result<String> {
            Ok(String::new())
        }
        async fn is_alive(&self, _: &WorkerHandle) -> Result<bool> {
            Ok(true)
        }
        async fn stop(&self, _: &WorkerHandle) -> Result<()> {
            Ok(())
        }
    }

    fn config(dir: &Path) -> RunnerConfig {
        RunnerConfig {
            poll_interval: Duration::from_millis(5),
            guardian_timeout: Duration::from_millis(50),
            worker_command: "work {node_id}".into(),
            layout: StateLayout::new(dir.join("state")),
            ..RunnerConfig::default()
        }
    }

    async fn runner_with(
        dir: &Path,
        file: &str,
        dot: &str,
        channel: Box<dyn ChannelAdapter>,
    ) -> (Runner, FakeLauncher) {
        let path = dir.join(file);
        std::fs::write(&path, dot).unwrap();
        let launcher = FakeLauncher::default();
        let mut runner = Runner::new(
            &path,
            SessionIdentity::orchestrator("runner-1"),
            config(dir),
            channel,
            Box::new(launcher.clone()),
        )
        .unwrap()
        .with_audit_store(Box::new(MemoryAuditStore::new()));
        runner.start().await.unwrap();
        (runner, launcher)
    }

    async fn runner(dir: &Path, dot: &str) -> (Runner, FakeLauncher) {
        let sink = ConsoleAdapter::with_writer(Box::new(std::io::sink()));
        runner_with(dir, "p.dot", dot, Box::new(sink)).await
    }

    /// Accepts a fixed number of appends, then fails.
    struct FailingAfter {
        inner: MemoryAuditStore,
        remaining: usize,
    }

    impl AuditStore for FailingAfter {
        fn append_chained(&mut self, build: crate::audit::ChainLink<'_>) -> Result<crate::audit::AuditEntry> {
            if self.remaining == 0 {
                return Err(ConductorError::Other("audit disk full".into()));
            }
            self.remaining -= 1;
            self.inner.append_chained(build)
        }
        fn entries(&self) -> Result<Vec<crate::audit::AuditEntry>> {
            self.inner.entries()
        }
    }

    fn status(dir: &Path, node: &str) -> NodeStatus {
        PipelineGraph::load(&dir.join("p.dot"))
            .unwrap()
            .node(node)
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn structural_nodes_complete_without_workers() {
        let dir = tempfile::tempdir().unwrap();
        let (mut runner, launcher) = runner(
            dir.path(),
            r#"digraph P { s [handler="start"]; e [handler="exit"]; s -> e }"#,
        )
        .await;
        assert_eq!(runner.step().await.unwrap(), None);
        assert_eq!(status(dir.path(), "s"), NodeStatus::Validated);
        assert_eq!(runner.step().await.unwrap(), None);
        let outcome = runner.step().await.unwrap();
        assert!(matches!(outcome, Some(RunOutcome::Completed { .. })));
        assert!(launcher.started.lock().unwrap().is_empty());
        assert_eq!(runner.audit().verify_chain().unwrap(), 6);
        assert!(runner.state().terminal_checkpoint.is_some());
    }

    #[tokio::test]
    async fn worker_failure_is_two_audited_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let (mut runner, launcher) = runner(dir.path(), r#"digraph P { w [bead_id="B-1"] }"#).await;
        runner.step().await.unwrap();
        assert_eq!(status(dir.path(), "w"), NodeStatus::Active);
        assert_eq!(launcher.started.lock().unwrap()[0].1, "work w");

        runner
            .signals()
            .send(
                Layer::Runner,
                Layer::Runner,
                signal_types::IMPL_COMPLETE,
                json!({"node_id": "w", "session_id": "worker-7", "success": false}),
            )
            .unwrap();
        runner.step().await.unwrap();
        let entries = runner.audit().entries().unwrap();
        let tail: Vec<_> = entries
            .iter()
            .skip(1)
            .take(2)
            .map(|e| (e.from_status, e.to_status, e.agent_id.as_str()))
            .collect();
        assert_eq!(
            tail,
            vec![
                (NodeStatus::Active, NodeStatus::ImplComplete, "worker-7"),
                (NodeStatus::ImplComplete, NodeStatus::Failed, "worker-7"),
            ]
        );
        // Same cycle retried the failed node.
        assert_eq!(status(dir.path(), "w"), NodeStatus::Active);
        assert_eq!(runner.state().retry_count("w"), 1);
    }

    #[tokio::test]
    async fn implementer_cannot_validate_own_work() {
        let dir = tempfile::tempdir().unwrap();
        let (mut runner, _) = runner(dir.path(), r#"digraph P { w [acceptance="ok"] }"#).await;
        runner.step().await.unwrap();
        let signals = runner.signals().clone();
        signals
            .send(Layer::Runner, Layer::Runner, "IMPL_COMPLETE", json!({"node_id": "w", "session_id": "me"}))
            .unwrap();
        runner.step().await.unwrap();
        let review = signals.pending(Layer::Guardian).unwrap();
        assert_eq!(review.len(), 1);
        assert_eq!(review[0].signal.signal_type, "NEEDS_REVIEW");
        assert_eq!(review[0].signal.payload_str("implementer"), Some("me"));

        signals
            .send(Layer::Guardian, Layer::Runner, "VALIDATION_PASSED", json!({"node_id": "w", "validator": "me"}))
            .unwrap();
        runner.step().await.unwrap();
        assert_eq!(status(dir.path(), "w"), NodeStatus::ImplComplete);
        let types: Vec<_> = signals
            .pending(Layer::Guardian)
            .unwrap()
            .into_iter()
            .map(|p| p.signal.signal_type)
            .collect();
        assert!(types.contains(&"SELF_VALIDATION_REJECTED".to_string()));

        signals
            .send(Layer::Guardian, Layer::Runner, "VALIDATION_PASSED", json!({"node_id": "w", "validator": "guardian"}))
            .unwrap();
        runner.step().await.unwrap();
        assert_eq!(status(dir.path(), "w"), NodeStatus::Validated);
    }

    #[tokio::test]
    async fn malformed_signal_is_set_aside() {
        let dir = tempfile::tempdir().unwrap();
        let (mut runner, _) = runner(dir.path(), r#"digraph P { s [handler="noop"] }"#).await;
        let pending = runner.signals().pending_dir(Layer::Runner);
        std::fs::create_dir_all(&pending).unwrap();
        std::fs::write(pending.join("20260101T000000.000000Z-bad.json"), "{ nope").unwrap();
        runner.step().await.unwrap();
        assert!(runner.signals().list_signals(Layer::Runner).unwrap().is_empty());
        let rejected = std::fs::read_dir(runner.signals().rejected_dir(Layer::Runner)).unwrap();
        assert_eq!(rejected.count(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_escalate_when_guardian_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let (mut runner, _) = runner(dir.path(), r#"digraph P { w [status="failed"] }"#).await;
        for _ in 0..3 {
            runner.state.increment_retry("w");
        }
        let outcome = runner.step().await.unwrap();
        assert_eq!(outcome, None);
        assert!(runner.state().paused);
        let guardian = runner.signals().pending(Layer::Guardian).unwrap();
        assert_eq!(guardian[0].signal.signal_type, "STUCK");
        let terminal = runner.signals().pending(Layer::Terminal).unwrap();
        assert_eq!(terminal[0].signal.signal_type, "ESCALATION");
        assert_eq!(terminal[0].signal.payload_str("error_kind"), Some("timeout"));
    }

    #[tokio::test]
    async fn early_retry_guidance_resets_the_budget() {
        let dir = tempfile::tempdir().unwrap();
        let (mut runner, _) = runner(dir.path(), r#"digraph P { w [status="failed"] }"#).await;
        for _ in 0..3 {
            runner.state.increment_retry("w");
        }
        runner
            .signals()
            .send(Layer::Guardian, Layer::Runner, "GUIDANCE", json!({"action": "retry", "node_id": "w"}))
            .unwrap();
        // Guidance arriving early resets the retry budget; the node is retried.
        runner.step().await.unwrap();
        assert_eq!(status(dir.path(), "w"), NodeStatus::Active);
        assert_eq!(runner.state().retry_count("w"), 1);
    }

    #[tokio::test]
    async fn abort_guidance_stops_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let (mut runner, _) = runner(dir.path(), r#"digraph P { w }"#).await;
        runner
            .signals()
            .send(Layer::Guardian, Layer::Runner, "GUIDANCE", json!({"action": "abort", "reason": "budget"}))
            .unwrap();
        let outcome = runner.step().await.unwrap();
        assert_eq!(outcome, Some(RunOutcome::Aborted { reason: "budget".into() }));
        assert_eq!(status(dir.path(), "w"), NodeStatus::Pending);
    }

    #[tokio::test]
    async fn runners_sharing_a_mailbox_only_take_their_own_signals() {
        let dir = tempfile::tempdir().unwrap();
        let quiet = || Box::new(ConsoleAdapter::with_writer(Box::new(std::io::sink()))) as Box<dyn ChannelAdapter>;
        let (mut a, _) = runner_with(dir.path(), "a.dot", "digraph A { wa }", quiet()).await;
        let (mut b, _) = runner_with(dir.path(), "b.dot", "digraph B { wb }", quiet()).await;
        a.step().await.unwrap();
        b.step().await.unwrap();

        let signals = a.signals().clone();
        signals
            .send(Layer::Runner, Layer::Runner, "IMPL_COMPLETE", json!({"node_id": "wb", "pipeline_id": "B"}))
            .unwrap();
        // Unaddressed and naming a node A lacks: also left for B.
        signals
            .send(Layer::Runner, Layer::Runner, "IMPL_COMPLETE", json!({"node_id": "wb", "session_id": "late"}))
            .unwrap();
        a.step().await.unwrap();
        assert_eq!(signals.list_signals(Layer::Runner).unwrap().len(), 2);

        b.step().await.unwrap();
        let wb = PipelineGraph::load(&dir.path().join("b.dot")).unwrap();
        assert_eq!(wb.node("wb").unwrap().status(), NodeStatus::ImplComplete);
        assert!(signals.list_signals(Layer::Runner).unwrap().is_empty());
    }

    #[tokio::test]
    async fn signals_stay_pending_until_their_effects_are_saved() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, _) = runner(dir.path(), "digraph P { w1; w2 }").await;
        // Two spawns, then room for one more entry.
        let mut runner = runner.with_audit_store(Box::new(FailingAfter {
            inner: MemoryAuditStore::new(),
            remaining: 3,
        }));
        runner.step().await.unwrap();
        assert_eq!(status(dir.path(), "w1"), NodeStatus::Active);

        let signals = runner.signals().clone();
        for node in ["w1", "w2"] {
            signals
                .send(Layer::Runner, Layer::Runner, "IMPL_COMPLETE", json!({"node_id": node, "pipeline_id": "P"}))
                .unwrap();
        }
        assert!(runner.step().await.is_err());
        assert_eq!(status(dir.path(), "w1"), NodeStatus::Active);
        assert_eq!(signals.list_signals(Layer::Runner).unwrap().len(), 2);

        // Redelivered once the store recovers.
        let mut runner = runner.with_audit_store(Box::new(MemoryAuditStore::new()));
        runner.step().await.unwrap();
        assert_eq!(status(dir.path(), "w1"), NodeStatus::ImplComplete);
        assert_eq!(status(dir.path(), "w2"), NodeStatus::ImplComplete);
        assert!(signals.list_signals(Layer::Runner).unwrap().is_empty());
    }

    #[tokio::test]
    async fn guardian_answer_lifts_an_escalation_pause() {
        let dir = tempfile::tempdir().unwrap();
        let (mut runner, _) = runner(dir.path(), r#"digraph P { w [status="failed"] }"#).await;
        for _ in 0..3 {
            runner.state.increment_retry("w");
        }
        runner.step().await.unwrap();
        assert!(runner.state().paused);

        runner
            .signals()
            .send(Layer::Guardian, Layer::Runner, "GUIDANCE", json!({"action": "retry", "node_id": "w"}))
            .unwrap();
        runner.step().await.unwrap();
        assert!(!runner.state().paused);
        assert_eq!(status(dir.path(), "w"), NodeStatus::Active);
    }

    #[tokio::test]
    async fn continue_guidance_resumes_planning() {
        let dir = tempfile::tempdir().unwrap();
        let (mut runner, launcher) = runner(dir.path(), "digraph P { w }").await;
        runner.state.paused = true;
        runner.step().await.unwrap();
        assert_eq!(status(dir.path(), "w"), NodeStatus::Pending);

        runner
            .signals()
            .send(Layer::Guardian, Layer::Runner, "GUIDANCE", json!({"action": "continue"}))
            .unwrap();
        runner.step().await.unwrap();
        assert!(!runner.state().paused);
        assert_eq!(status(dir.path(), "w"), NodeStatus::Active);
        assert_eq!(launcher.started.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn heartbeats_are_throttled() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = conductor_signals::channel::SharedBuffer::default();
        let console = ConsoleAdapter::with_writer(Box::new(buffer.clone()));
        let (mut runner, _) = runner_with(dir.path(), "p.dot", "digraph P { w }", Box::new(console)).await;
        for _ in 0..4 {
            runner.step().await.unwrap();
        }
        let beats = buffer
            .contents()
            .lines()
            .filter(|l| l.contains("\"HEARTBEAT\""))
            .count();
        assert_eq!(beats, 1);
    }

    #[tokio::test]
    async fn shutdown_message_ends_the_run_with_a_checkpoint() {
        struct ShutdownChannel(Mutex<Option<Message>>);

        #[async_trait]
        impl ChannelAdapter for ShutdownChannel {
            fn name(&self) -> &str {
                "test"
            }
            async fn register(&mut self, _: &str, _: &str) -> Result<()> {
                Ok(())
            }
            async fn unregister(&mut self) -> Result<()> {
                Ok(())
            }
            async fn send_signal(&self, _: &str, _: Value, _: conductor_signals::Priority) -> Result<()> {
                Ok(())
            }
            async fn receive_message(&self, _: Duration) -> Result<Option<Message>> {
                Ok(self.0.lock().unwrap().take())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.dot");
        std::fs::write(&path, "digraph P { w }").unwrap();
        let config = RunnerConfig {
            layout: StateLayout::new(dir.path().join("state")),
            ..RunnerConfig::default()
        };
        let channel = ShutdownChannel(Mutex::new(Some(Message::new("operator", "stop", "shutdown", Value::Null))));
        let mut runner = Runner::new(
            &path,
            SessionIdentity::orchestrator("r"),
            config,
            Box::new(channel),
            Box::new(FakeLauncher::default()),
        )
        .unwrap()
        .with_audit_store(Box::new(MemoryAuditStore::new()));
        assert_eq!(runner.run().await.unwrap(), RunOutcome::Shutdown);
        let checkpoints = std::fs::read_dir(dir.path().join("state").join("checkpoints")).unwrap();
        assert_eq!(checkpoints.count(), 1);
    }
}
