//! Run event system for observability.
//!
//! Emits [`RunEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! external observers (loggers, progress displays, tests) can follow a run
//! without coupling to the scheduler internals.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cairn_types::Budget;

/// Events emitted during a run. `run_id` is always the id of the level the
/// event belongs to; nested levels have their own ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: Uuid,
        pipeline_name: String,
        resumed: bool,
    },
    RunFinished {
        run_id: Uuid,
        pipeline_name: String,
        status: String,
        duration_ms: u64,
    },
    StepStarted {
        run_id: Uuid,
        step: String,
        kind: String,
        attempt: u32,
    },
    StepSucceeded {
        run_id: Uuid,
        step: String,
        attempts: u32,
        duration_ms: u64,
    },
    StepSkipped {
        run_id: Uuid,
        step: String,
        reason: String,
    },
    StepFailed {
        run_id: Uuid,
        step: String,
        message: String,
        retryable: bool,
        attempts: u32,
    },
    StepRetrying {
        run_id: Uuid,
        step: String,
        attempt: u32,
        delay_ms: u64,
    },
    NestingEntered {
        parent_run_id: Uuid,
        run_id: Uuid,
        pipeline_name: String,
        depth: usize,
    },
    NestingExited {
        run_id: Uuid,
        pipeline_name: String,
        status: String,
    },
    CheckpointSaved {
        run_id: Uuid,
        step_index: usize,
    },
    CheckpointFailed {
        run_id: Uuid,
        error: String,
    },
    BudgetExceeded {
        run_id: Uuid,
        budget: Budget,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<RunEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: RunEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitter_sends_and_receives() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();
        let run_id = Uuid::new_v4();

        emitter.emit(RunEvent::RunStarted {
            run_id,
            pipeline_name: "main".into(),
            resumed: false,
        });

        match rx.recv().await.unwrap() {
            RunEvent::RunStarted {
                run_id: got,
                pipeline_name,
                resumed,
            } => {
                assert_eq!(got, run_id);
                assert_eq!(pipeline_name, "main");
                assert!(!resumed);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let emitter = EventEmitter::new(16);
        let mut rx1 = emitter.subscribe();
        let mut rx2 = emitter.subscribe();

        emitter.emit(RunEvent::CheckpointSaved {
            run_id: Uuid::nil(),
            step_index: 2,
        });

        assert_eq!(rx1.recv().await.unwrap(), rx2.recv().await.unwrap());
    }

    #[test]
    fn emit_with_no_subscribers_does_not_panic() {
        let emitter = EventEmitter::new(16);
        emitter.emit(RunEvent::BudgetExceeded {
            run_id: Uuid::nil(),
            budget: Budget::Steps,
        });
    }

    #[test]
    fn event_serializes_with_tag() {
        let event = RunEvent::StepSkipped {
            run_id: Uuid::nil(),
            step: "notify".into(),
            reason: "condition false".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "step_skipped");
        assert_eq!(json["step"], "notify");

        let back: RunEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
