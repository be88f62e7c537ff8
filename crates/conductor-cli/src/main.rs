//! CLI binary for inspecting and driving Conductor pipelines.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};

use conductor_pipeline::{
    apply_transition, check_transition, latest_checkpoint, load_checkpoint, pipeline_id_for,
    restore_to_file, save_checkpoint, validate, AuditLog, DependencyResolver, GitIntegrator,
    JsonlAuditStore, MergeQueue, PipelineGraph, RunOutcome, Runner, RunnerConfig, Severity,
    TmuxLauncher,
};
use conductor_signals::{
    ChannelAdapter, ConsoleAdapter, InboxAdapter, MailboxAdapter, QueueAdapter, SignalStore,
};
use conductor_types::{
    fs, ConductorError, Layer, NodeStatus, Role, SessionIdentity, StateLayout,
};

#[derive(Parser)]
#[command(name = "conductor", version, about = "DOT-based orchestration for supervised agent pipelines")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// State root for signals, checkpoints, runner state, audit logs and the merge queue
    #[arg(long, global = true, default_value = ".conductor")]
    state_dir: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a pipeline .dot file and print it as JSON
    Parse {
        pipeline: PathBuf,
    },

    /// Lint a pipeline .dot file
    Validate {
        pipeline: PathBuf,

        /// Print diagnostics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show node statuses
    Status {
        pipeline: PathBuf,

        /// Only nodes with this status
        #[arg(long, conflicts_with = "ready")]
        status: Option<NodeStatus>,

        /// Only pending nodes whose forward predecessors are all validated
        #[arg(long)]
        ready: bool,

        #[arg(long)]
        json: bool,
    },

    /// Move one node to a new status
    Transition {
        pipeline: PathBuf,
        node: String,
        to: NodeStatus,

        /// Check legality without writing anything
        #[arg(long)]
        dry_run: bool,

        /// Audit log to append to (default: <state-dir>/audit/<pipeline>.jsonl)
        #[arg(long)]
        audit_log: Option<PathBuf>,

        /// Agent recorded in the audit entry (default: the session id)
        #[arg(long)]
        agent: Option<String>,

        #[arg(long, default_value = "manual transition")]
        reason: String,

        /// Evidence text; only its hash is recorded
        #[arg(long)]
        evidence: Option<String>,
    },

    /// Save, restore, or verify checkpoints
    #[command(subcommand)]
    Checkpoint(CheckpointCommand),

    /// Per-repository merge queue
    #[command(subcommand)]
    Merge(MergeCommand),

    /// Inter-layer signal mailbox
    #[command(subcommand)]
    Signal(SignalCommand),

    /// Audit log tools
    #[command(subcommand)]
    Audit(AuditCommand),

    /// Run a pipeline until it completes, is shut down, or aborts
    Run(RunArgs),
}

#[derive(Subcommand)]
enum CheckpointCommand {
    /// Snapshot a pipeline file
    Save {
        pipeline: PathBuf,

        /// Output path (default: <state-dir>/checkpoints/<graph>-<timestamp>.json)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Write a checkpoint back out as DOT
    Restore {
        /// Checkpoint file; defaults to the latest one in the state root
        checkpoint: Option<PathBuf>,

        #[arg(short, long)]
        output: PathBuf,

        /// Pick the latest checkpoint for this graph name
        #[arg(long)]
        graph: Option<String>,
    },
    /// Check a checkpoint's schema and, optionally, that it matches a source file
    Verify {
        checkpoint: PathBuf,

        #[arg(long)]
        source: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum MergeCommand {
    Enqueue {
        node: String,
        branch: String,

        #[arg(long, default_value = ".")]
        repo: PathBuf,
    },
    /// Integrate the oldest queued entry for a repository with git
    Process {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
    },
    List,
}

#[derive(Subcommand)]
enum SignalCommand {
    Send {
        #[arg(long)]
        from: Layer,

        #[arg(long)]
        to: Layer,

        signal_type: String,

        /// JSON object payload
        #[arg(long, default_value = "{}")]
        payload: String,
    },
    /// Pending signals for a layer, oldest first
    List {
        layer: Layer,
    },
    /// Block until a signal arrives for a layer, then consume it
    Wait {
        layer: Layer,

        /// Only accept this signal type
        #[arg(long = "type")]
        signal_type: Option<String>,

        #[arg(long, default_value = "300")]
        timeout_secs: u64,

        #[arg(long, default_value = "1000")]
        poll_ms: u64,
    },
}

#[derive(Subcommand)]
enum AuditCommand {
    /// Recompute the hash chain of an audit log
    Verify {
        log: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    pipeline: PathBuf,

    /// console | mailbox | queue:<program> | inbox:<inbox-dir>,<outbox-dir>
    #[arg(long, default_value = "console")]
    channel: String,

    /// Worker launch command; {node_id}, {pipeline_id}, {bead_id}, ... are substituted
    #[arg(long)]
    worker_command: Option<String>,

    /// Working directory for worker sessions
    #[arg(long)]
    workdir: Option<PathBuf>,

    #[arg(long, default_value = "conductor")]
    tmux_prefix: String,

    /// Enqueue validated nodes with a `branch` attribute for this repository
    #[arg(long)]
    repo_root: Option<PathBuf>,

    #[arg(long, default_value = "2000")]
    poll_ms: u64,

    #[arg(long, default_value = "300")]
    guardian_timeout_secs: u64,

    /// Minimum seconds between routine heartbeats
    #[arg(long, default_value = "30")]
    heartbeat_secs: u64,

    #[arg(long, default_value = "3")]
    max_retries: u32,

    #[arg(long, default_value = "3")]
    stuck_threshold: u32,

    /// Stop after this many cycles
    #[arg(long)]
    max_cycles: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries command output.
    let default_filter = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let kind = e
                .downcast_ref::<ConductorError>()
                .map(ConductorError::kind)
                .unwrap_or("error");
            eprintln!("{}", json!({ "error": kind, "message": format!("{e:#}") }));
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let layout = StateLayout::new(&cli.state_dir);
    match cli.command {
        Commands::Parse { pipeline } => cmd_parse(&pipeline),
        Commands::Validate { pipeline, json } => cmd_validate(&pipeline, json),
        Commands::Status {
            pipeline,
            status,
            ready,
            json,
        } => cmd_status(&pipeline, status, ready, json),
        Commands::Transition {
            pipeline,
            node,
            to,
            dry_run,
            audit_log,
            agent,
            reason,
            evidence,
        } => cmd_transition(
            &layout,
            &pipeline,
            &node,
            to,
            dry_run,
            audit_log,
            agent,
            &reason,
            evidence.as_deref(),
        ),
        Commands::Checkpoint(cmd) => cmd_checkpoint(&layout, cmd),
        Commands::Merge(cmd) => cmd_merge(&layout, cmd),
        Commands::Signal(cmd) => cmd_signal(&layout, cmd).await,
        Commands::Audit(AuditCommand::Verify { log }) => {
            let count = AuditLog::new(JsonlAuditStore::new(&log)).verify_chain()?;
            print_json(&json!({ "log": log.display().to_string(), "entries": count, "valid": true }))
        }
        Commands::Run(args) => cmd_run(layout, args).await,
    }
}

/// `CONDUCTOR_SESSION_ID` and `CONDUCTOR_ROLE`, falling back to a fresh id.
fn session_identity(default_role: Role) -> anyhow::Result<SessionIdentity> {
    let session_id = std::env::var("CONDUCTOR_SESSION_ID")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let role = match std::env::var("CONDUCTOR_ROLE") {
        Ok(r) if !r.trim().is_empty() => r.parse()?,
        _ => default_role,
    };
    Ok(SessionIdentity::new(session_id, role))
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn graph_json(graph: &PipelineGraph) -> Value {
    json!({
        "name": graph.name,
        "attrs": graph.attrs,
        "node_defaults": graph.node_defaults,
        "edge_defaults": graph.edge_defaults,
        "nodes": graph.all_nodes().map(|n| json!({
            "id": n.id,
            "status": n.status(),
            "attrs": n.attrs,
        })).collect::<Vec<_>>(),
        "edges": graph.all_edges().iter().map(|e| json!({
            "from": e.from,
            "to": e.to,
            "attrs": e.attrs,
            "retry": e.is_retry_edge(),
        })).collect::<Vec<_>>(),
    })
}

fn cmd_parse(path: &Path) -> anyhow::Result<()> {
    let graph = PipelineGraph::load(path)?;
    print_json(&graph_json(&graph))
}

fn cmd_validate(path: &Path, as_json: bool) -> anyhow::Result<()> {
    let graph = PipelineGraph::load(path)?;
    let diagnostics = validate(&graph);
    let errors = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .count();

    if as_json {
        print_json(&diagnostics)?;
    } else if diagnostics.is_empty() {
        println!("Pipeline is valid");
    } else {
        for diag in &diagnostics {
            let severity = match diag.severity {
                Severity::Error => "ERROR",
                Severity::Warning => "WARN",
                Severity::Info => "INFO",
            };
            println!("[{}] {}: {}", severity, diag.rule, diag.message);
            if let Some(fix) = &diag.fix {
                println!("        fix: {fix}");
            }
        }
    }

    if errors > 0 {
        return Err(ConductorError::ValidationError(format!("{errors} error(s)")).into());
    }
    Ok(())
}

fn cmd_status(
    path: &Path,
    status: Option<NodeStatus>,
    ready: bool,
    as_json: bool,
) -> anyhow::Result<()> {
    let graph = PipelineGraph::load(path)?;
    let ids: Vec<String> = if ready {
        DependencyResolver::new(&graph).ready_nodes(&graph)
    } else {
        graph
            .all_nodes()
            .filter(|n| status.is_none_or(|s| n.status() == s))
            .map(|n| n.id.clone())
            .collect()
    };

    if as_json {
        let nodes: Vec<Value> = ids
            .iter()
            .filter_map(|id| graph.node(id))
            .map(|n| {
                json!({
                    "id": n.id,
                    "status": n.status(),
                    "handler": n.handler(),
                    "worker_type": n.worker_type(),
                    "label": n.label(),
                })
            })
            .collect();
        return print_json(&json!({
            "pipeline": graph.name,
            "complete": graph.is_complete(),
            "nodes": nodes,
        }));
    }

    println!("Pipeline: {}", graph.name);
    for id in &ids {
        if let Some(node) = graph.node(id) {
            println!("  {:<24} {:<14} {}", node.id, node.status().as_str(), node.label());
        }
    }
    if !ready && status.is_none() {
        let validated = graph.nodes_with_status(NodeStatus::Validated).count();
        println!("\n{}/{} validated", validated, graph.node_count());
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_transition(
    layout: &StateLayout,
    path: &Path,
    node: &str,
    to: NodeStatus,
    dry_run: bool,
    audit_log: Option<PathBuf>,
    agent: Option<String>,
    reason: &str,
    evidence: Option<&str>,
) -> anyhow::Result<()> {
    let mut graph = PipelineGraph::load(path)?;
    if dry_run {
        let t = check_transition(&graph, node, to)?;
        return print_json(&json!({
            "node": t.node, "from": t.from, "to": t.to, "dry_run": true,
        }));
    }

    let transition = apply_transition(&mut graph, node, to)?;
    let pipeline_id = pipeline_id_for(&graph, path);
    let audit_path = audit_log.unwrap_or_else(|| layout.audit_log(&pipeline_id));
    let agent = match agent {
        Some(a) => a,
        None => session_identity(Role::Orchestrator)?.session_id,
    };
    // Audit first: a graph change without its audit entry is the worse failure.
    let mut audit = AuditLog::new(JsonlAuditStore::new(&audit_path));
    let entry = audit.record_transition(&transition, &agent, evidence, reason)?;
    graph.save(path)?;
    print_json(&json!({
        "node": transition.node,
        "from": transition.from,
        "to": transition.to,
        "audit_log": audit_path.display().to_string(),
        "prev_hash": entry.prev_hash,
    }))
}

fn cmd_checkpoint(layout: &StateLayout, cmd: CheckpointCommand) -> anyhow::Result<()> {
    match cmd {
        CheckpointCommand::Save { pipeline, output } => {
            let (checkpoint, path) =
                save_checkpoint(&pipeline, output.as_deref(), &layout.checkpoints_dir())?;
            print_json(&json!({
                "checkpoint": path.display().to_string(),
                "graph": checkpoint.graph_name,
                "nodes": checkpoint.nodes.len(),
                "content_hash": checkpoint.content_hash,
            }))
        }
        CheckpointCommand::Restore {
            checkpoint,
            output,
            graph,
        } => {
            let source = match checkpoint {
                Some(path) => path,
                None => latest_checkpoint(&layout.checkpoints_dir(), graph.as_deref())?
                    .map(|(path, _)| path)
                    .ok_or_else(|| ConductorError::NotFound {
                        path: layout.checkpoints_dir(),
                    })?,
            };
            let checkpoint = restore_to_file(&source, &output)?;
            print_json(&json!({
                "checkpoint": source.display().to_string(),
                "output": output.display().to_string(),
                "graph": checkpoint.graph_name,
            }))
        }
        CheckpointCommand::Verify { checkpoint, source } => {
            let loaded = load_checkpoint(&checkpoint)?;
            // Rebuilding the graph catches edges to missing nodes and bad statuses.
            loaded.to_graph()?;
            if let Some(source) = &source {
                loaded.verify_source(&fs::read_to_string(source)?)?;
            }
            print_json(&json!({
                "checkpoint": checkpoint.display().to_string(),
                "graph": loaded.graph_name,
                "version": loaded.version,
                "source_matches": source.as_ref().map(|_| true),
                "valid": true,
            }))
        }
    }
}

fn cmd_merge(layout: &StateLayout, cmd: MergeCommand) -> anyhow::Result<()> {
    let queue = MergeQueue::new(layout.merge_queue_dir());
    match cmd {
        MergeCommand::Enqueue { node, branch, repo } => {
            let repo = std::fs::canonicalize(&repo).unwrap_or(repo);
            print_json(&queue.enqueue(&node, &branch, &repo)?)
        }
        MergeCommand::Process { repo } => {
            let repo = std::fs::canonicalize(&repo).unwrap_or(repo);
            match queue.process_next(&repo, &GitIntegrator)? {
                Some(result) => {
                    print_json(&result)?;
                    if !result.success {
                        return Err(ConductorError::Other(result.message).into());
                    }
                    Ok(())
                }
                None => print_json(&json!({ "processed": null })),
            }
        }
        MergeCommand::List => print_json(&queue.list()?),
    }
}

async fn cmd_signal(layout: &StateLayout, cmd: SignalCommand) -> anyhow::Result<()> {
    let store = SignalStore::from_layout(layout);
    match cmd {
        SignalCommand::Send {
            from,
            to,
            signal_type,
            payload,
        } => {
            let payload: Value = serde_json::from_str(&payload)?;
            let path = store.send(from, to, &signal_type, payload)?;
            print_json(&json!({ "path": path.display().to_string() }))
        }
        SignalCommand::List { layer } => {
            let pending: Vec<Value> = store
                .pending(layer)?
                .into_iter()
                .map(|p| json!({ "path": p.path.display().to_string(), "signal": p.signal }))
                .collect();
            print_json(&pending)
        }
        SignalCommand::Wait {
            layer,
            signal_type,
            timeout_secs,
            poll_ms,
        } => {
            let pending = store
                .wait_for_signal_where(
                    layer,
                    |s| signal_type.as_deref().is_none_or(|t| s.signal_type == t),
                    Duration::from_secs(timeout_secs),
                    Duration::from_millis(poll_ms),
                )
                .await?;
            store.move_to_processed(&pending.path)?;
            print_json(&pending.signal)
        }
    }
}

fn build_channel(spec: &str, layout: &StateLayout, poll: Duration) -> anyhow::Result<Box<dyn ChannelAdapter>> {
    let (kind, arg) = spec.split_once(':').unwrap_or((spec, ""));
    let channel: Box<dyn ChannelAdapter> = match kind {
        "console" => Box::new(ConsoleAdapter::new()),
        "mailbox" => Box::new(
            MailboxAdapter::new(SignalStore::from_layout(layout)).with_poll_interval(poll),
        ),
        "queue" if !arg.is_empty() => Box::new(QueueAdapter::new(arg)),
        "inbox" => {
            let (inbox, outbox) = arg.split_once(',').ok_or_else(|| {
                ConductorError::Other("inbox channel needs inbox:<inbox-dir>,<outbox-dir>".into())
            })?;
            Box::new(InboxAdapter::new(inbox, outbox).with_poll_interval(poll))
        }
        _ => {
            return Err(ConductorError::Other(format!(
                "unknown channel '{spec}' (expected console, mailbox, queue:<program>, inbox:<in>,<out>)"
            ))
            .into())
        }
    };
    Ok(channel)
}

async fn cmd_run(layout: StateLayout, args: RunArgs) -> anyhow::Result<()> {
    let identity = session_identity(Role::Orchestrator)?;
    let poll = Duration::from_millis(args.poll_ms);
    let mut config = RunnerConfig {
        poll_interval: poll,
        guardian_timeout: Duration::from_secs(args.guardian_timeout_secs),
        heartbeat_interval: Duration::from_secs(args.heartbeat_secs),
        max_retries: args.max_retries,
        stuck_threshold: args.stuck_threshold,
        max_cycles: args.max_cycles,
        layout: layout.clone(),
        ..RunnerConfig::default()
    };
    if let Some(command) = args.worker_command {
        config.worker_command = command;
    }

    let channel = build_channel(&args.channel, &layout, poll)?;
    let mut launcher = TmuxLauncher::new(&args.tmux_prefix);
    if let Some(dir) = &args.workdir {
        launcher = launcher.with_working_dir(dir);
    }

    let mut runner = Runner::new(&args.pipeline, identity, config, channel, Box::new(launcher))?;
    if let Some(repo) = args.repo_root {
        let repo = std::fs::canonicalize(&repo).unwrap_or(repo);
        runner = runner.with_merge_queue(MergeQueue::new(layout.merge_queue_dir()), repo);
    }

    let outcome = runner.run().await?;
    let (status, detail) = match &outcome {
        RunOutcome::Completed { checkpoint } => ("completed", json!(checkpoint.display().to_string())),
        RunOutcome::Shutdown => ("shutdown", Value::Null),
        RunOutcome::Aborted { reason } => ("aborted", json!(reason)),
        RunOutcome::CycleLimit { cycles } => ("cycle_limit", json!(cycles)),
    };
    tracing::info!(pipeline = %runner.pipeline_id(), outcome = status, "Run finished");
    print_json(&json!({
        "pipeline": runner.pipeline_id(),
        "outcome": status,
        "detail": detail,
    }))?;
    if let RunOutcome::Aborted { reason } = outcome {
        return Err(ConductorError::Other(format!("run aborted: {reason}")).into());
    }
    Ok(())
}
