//! Runtime configuration for the runner loop.

use std::time::Duration;

use conductor_types::StateLayout;

/// Placeholders substituted into [`RunnerConfig::worker_command`].
pub const WORKER_COMMAND_PLACEHOLDERS: &[&str] = &[
    "{node_id}",
    "{bead_id}",
    "{worker_type}",
    "{pipeline_id}",
    "{session_id}",
    "{acceptance}",
];

/// Runner configuration. Populated from CLI flags; there is no config file.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Sleep between decision cycles and between mailbox polls.
    pub poll_interval: Duration,
    /// How long to wait for a `GUIDANCE` reply after signalling `STUCK`.
    pub guardian_timeout: Duration,
    /// Minimum gap between routine heartbeats on the channel.
    pub heartbeat_interval: Duration,
    /// Worker retries allowed per node before the scheduler signals stuck.
    pub max_retries: u32,
    /// Consecutive idle cycles before the runner reports itself stuck.
    pub stuck_threshold: u32,
    /// Stop after this many cycles; `None` runs until completion or shutdown.
    pub max_cycles: Option<u64>,
    /// Shell command used to launch a worker; see [`WORKER_COMMAND_PLACEHOLDERS`].
    pub worker_command: String,
    pub layout: StateLayout,
    /// Write a checkpoint after every cycle that changed the graph.
    pub checkpoint_on_change: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            poll_interval: Duration::from_secs(2),
            guardian_timeout: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(30),
            max_retries: 3,
            stuck_threshold: 3,
            max_cycles: None,
            worker_command: "conductor-worker --node {node_id} --pipeline {pipeline_id}".into(),
            layout: StateLayout::default(),
            checkpoint_on_change: true,
        }
    }
}

impl RunnerConfig {
    pub fn with_layout(mut self, layout: StateLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Fill the worker command template. Unknown placeholders are left as-is.
pub fn render_worker_command(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in values {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}
