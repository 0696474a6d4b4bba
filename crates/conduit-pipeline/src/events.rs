//! Pipeline event system for observability.
//!
//! Emits [`PipelineEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! external observers (loggers, metrics collectors, UI, etc.) can subscribe to
//! lifecycle progress without coupling to the orchestrator internals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events emitted during the pipeline lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    PipelineInitialized {
        pipeline_id: Uuid,
        stage_count: usize,
        issue_count: usize,
    },
    StageStarted {
        instance_name: String,
        input_records: usize,
    },
    StageCompleted {
        instance_name: String,
        records: usize,
        error_records: usize,
        duration_ms: u64,
    },
    StageOverridden {
        instance_name: String,
        records: usize,
    },
    StageFailed {
        instance_name: String,
        error: String,
    },
    PipelineFailed {
        pipeline_id: Uuid,
        error: String,
    },
    PipelineDestroyed {
        pipeline_id: Uuid,
        released: usize,
        at: DateTime<Utc>,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<PipelineEvent>,
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
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
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

        emitter.emit(PipelineEvent::StageStarted {
            instance_name: "src".into(),
            input_records: 0,
        });

        let event = rx.recv().await.unwrap();
        match event {
            PipelineEvent::StageStarted {
                instance_name,
                input_records,
            } => {
                assert_eq!(instance_name, "src");
                assert_eq!(input_records, 0);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let emitter = EventEmitter::new(16);
        let mut rx1 = emitter.subscribe();
        let mut rx2 = emitter.subscribe();

        emitter.emit(PipelineEvent::StageOverridden {
            instance_name: "p1".into(),
            records: 2,
        });

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();

        let json1 = serde_json::to_string(&e1).unwrap();
        let json2 = serde_json::to_string(&e2).unwrap();
        assert_eq!(json1, json2);
    }

    #[test]
    fn emit_with_no_subscribers_does_not_panic() {
        let emitter = EventEmitter::new(16);
        emitter.emit(PipelineEvent::PipelineFailed {
            pipeline_id: Uuid::nil(),
            error: "something went wrong".into(),
        });
    }

    #[test]
    fn event_serialization_round_trip() {
        let event = PipelineEvent::StageCompleted {
            instance_name: "sink".into(),
            records: 4,
            error_records: 1,
            duration_ms: 12,
        };

        let json = serde_json::to_string(&event).unwrap();
        let deserialized: PipelineEvent = serde_json::from_str(&json).unwrap();

        match deserialized {
            PipelineEvent::StageCompleted {
                instance_name,
                records,
                error_records,
                ..
            } => {
                assert_eq!(instance_name, "sink");
                assert_eq!(records, 4);
                assert_eq!(error_records, 1);
            }
            other => panic!("unexpected variant after round-trip: {:?}", other),
        }
    }
}
