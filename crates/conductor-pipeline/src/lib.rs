//! Pipeline graph model and the runner that drives it.
//!
//! This crate implements the core Conductor pipeline engine: the typed graph
//! over a DOT file, node lifecycle transitions, dependency resolution, lint
//! rules, content-hashed checkpoints, the hash-chained audit log, the per-repo
//! merge queue, and the runner loop that ties them together.

pub mod audit;
pub mod checkpoint;
pub mod config;
pub mod dependency;
pub mod events;
pub mod graph;
pub mod merge_queue;
pub mod plan;
pub mod retry;
pub mod runner;
pub mod runner_state;
pub mod scheduler;
pub mod state_machine;
pub mod validation;
pub mod worker;

pub use audit::{AuditEntry, AuditLog, AuditStore, JsonlAuditStore, MemoryAuditStore, GENESIS_HASH};
pub use checkpoint::{
    latest_checkpoint, load_checkpoint, restore_checkpoint, restore_to_file, save_checkpoint,
    save_checkpoint_text, write_checkpoint, Checkpoint,
};
pub use config::{render_worker_command, RunnerConfig};
pub use dependency::{ready_nodes, DependencyResolver};
pub use events::{EventEmitter, RunnerEvent};
pub use graph::{NodeKind, PipelineEdge, PipelineGraph, PipelineNode};
pub use merge_queue::{
    Enqueued, GitIntegrator, Integrator, MergeQueue, MergeQueueEntry, MergeResult, MergeStatus,
};
pub use plan::{ActionKind, BlockedNode, NodeAction, RunnerPlan};
pub use retry::{with_retry, BackoffPolicy};
pub use runner::{pipeline_id_for, RunOutcome, Runner};
pub use runner_state::RunnerState;
pub use scheduler::plan_cycle;
pub use state_machine::{apply_transition, check_transition, path_to, transition_table, Transition};
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity};
pub use worker::{TmuxLauncher, WorkerHandle, WorkerLauncher};
