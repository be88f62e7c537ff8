//! Runner event stream for observability.
//!
//! Emits [`RunnerEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! status displays and tests can follow a run without reading the mailbox.

use conductor_types::NodeStatus;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunnerEvent {
    RunStarted {
        pipeline_id: String,
        session_id: String,
        node_count: usize,
    },
    CyclePlanned {
        cycle: u64,
        summary: String,
    },
    TransitionApplied {
        node_id: String,
        from: NodeStatus,
        to: NodeStatus,
        reason: String,
    },
    WorkerSpawned {
        node_id: String,
        attempt: u32,
    },
    ValidationDispatched {
        node_id: String,
    },
    SelfValidationRejected {
        node_id: String,
        validator: String,
    },
    ApprovalRequested {
        node_id: String,
    },
    CheckpointSaved {
        path: String,
    },
    Stuck {
        node_id: Option<String>,
        idle_cycles: u32,
    },
    Escalated {
        signal_type: String,
    },
    Paused,
    Resumed,
    MergeEnqueued {
        node_id: String,
        branch: String,
    },
    RunCompleted {
        pipeline_id: String,
        checkpoint: Option<String>,
    },
    RunStopped {
        pipeline_id: String,
        reason: String,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<RunnerEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// If there are no active receivers the event is dropped.
    pub fn emit(&self, event: RunnerEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunnerEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let emitter = EventEmitter::new(16);
        let mut rx1 = emitter.subscribe();
        let mut rx2 = emitter.subscribe();

        emitter.emit(RunnerEvent::TransitionApplied {
            node_id: "impl".into(),
            from: NodeStatus::Pending,
            to: NodeStatus::Active,
            reason: "spawn".into(),
        });

        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await.unwrap() {
                RunnerEvent::TransitionApplied { node_id, to, .. } => {
                    assert_eq!(node_id, "impl");
                    assert_eq!(to, NodeStatus::Active);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[test]
    fn emit_with_no_subscribers_does_not_panic() {
        EventEmitter::new(4).emit(RunnerEvent::Paused);
    }

    #[test]
    fn events_serialize_with_a_tag() {
        let json = serde_json::to_value(RunnerEvent::Stuck {
            node_id: Some("a".into()),
            idle_cycles: 3,
        })
        .unwrap();
        assert_eq!(json["event"], "stuck");
        assert_eq!(json["idle_cycles"], 3);
    }
}
