//! Structured notification channel shared by every background component.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::worker::WorkerSnapshot;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// Queued jobs exceed the queue's `warning_queue_size`.
    QueueBacklog,
    /// Local and store clocks disagree by more than a minute.
    ClockSkew,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeeperEvent {
    /// A background cycle failed. The loop carries on with the next cycle.
    Error { source: String, message: String },
    Warning {
        kind: WarningKind,
        message: String,
        data: serde_json::Value,
    },
    /// Snapshot of every registered worker.
    Wip { workers: Vec<WorkerSnapshot> },
}

/// Fan-out of `KeeperEvent`s. Sending never blocks and is dropped silently
/// when nobody listens.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<KeeperEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KeeperEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: KeeperEvent) {
        let _ = self.tx.send(event);
    }

    pub fn error(&self, source: &str, error: impl std::fmt::Display) {
        tracing::error!(source, error = %error, "Background cycle failed");
        self.emit(KeeperEvent::Error {
            source: source.to_string(),
            message: error.to_string(),
        });
    }

    pub fn warning(&self, kind: WarningKind, message: impl Into<String>, data: serde_json::Value) {
        let message = message.into();
        tracing::warn!(kind = ?kind, "{}", message);
        self.emit(KeeperEvent::Warning {
            kind,
            message,
            data,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.warning(
            WarningKind::QueueBacklog,
            "queue q is backed up",
            serde_json::json!({ "queued": 10 }),
        );
        match rx.recv().await.unwrap() {
            KeeperEvent::Warning { kind, data, .. } => {
                assert_eq!(kind, WarningKind::QueueBacklog);
                assert_eq!(data["queued"], 10);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.error("supervisor", "boom");
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = KeeperEvent::Error {
            source: "timekeeper".into(),
            message: "down".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["source"], "timekeeper");
    }

    #[test]
    fn wip_serializes_worker_list() {
        let empty = serde_json::to_value(KeeperEvent::Wip { workers: Vec::new() }).unwrap();
        assert_eq!(empty, serde_json::json!({ "type": "wip", "workers": [] }));

        let now = chrono::Utc::now();
        let snapshot = WorkerSnapshot {
            id: uuid::Uuid::new_v4(),
            work_id: uuid::Uuid::new_v4(),
            name: "q".into(),
            state: crate::worker::WorkerState::Active,
            count: 3,
            created_on: now,
            last_fetched_on: Some(now),
            last_job_started_on: None,
            last_job_ended_on: None,
            last_error: None,
            last_error_on: None,
        };
        let json = serde_json::to_value(KeeperEvent::Wip { workers: vec![snapshot] }).unwrap();
        assert_eq!(json["type"], "wip");
        assert_eq!(json["workers"][0]["name"], "q");
        assert_eq!(json["workers"][0]["state"], "active");
        assert_eq!(json["workers"][0]["count"], 3);
    }
}
