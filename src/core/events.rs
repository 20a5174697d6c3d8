use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::core::documents::DocumentKind;
use crate::core::tasks::TaskStatus;

/// "Something changed" notifications, keyed by project or document id.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    VersionCreated {
        project_id: String,
        kind: DocumentKind,
        scene_key: Option<String>,
        version_id: String,
        version_number: i64,
    },
    ChainRebased {
        project_id: String,
        kind: DocumentKind,
        scene_key: Option<String>,
        version_id: String,
        removed: usize,
    },
    LabelUpdated {
        project_id: String,
        kind: DocumentKind,
        version_id: String,
    },
    TaskChanged {
        project_id: String,
        task_id: String,
        status: TaskStatus,
    },
    TaskDeleted {
        project_id: String,
        task_id: String,
    },
}

/// Best-effort delivery; emitting never fails the caller.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: DomainEvent);
}

pub struct BroadcastSink {
    sender: broadcast::Sender<DomainEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: DomainEvent) {
        if self.sender.send(event).is_err() {
            debug!("No event subscribers");
        }
    }
}

pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: DomainEvent) {}
}
