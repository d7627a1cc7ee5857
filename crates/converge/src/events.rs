//! Status event broadcaster.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::status::StatusReport;
use crate::sync::{PlannedAction, SyncResult};

/// Published once at the end of every completed reconciliation cycle.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub status: StatusReport,
    /// Actions computed by a dry run; nothing was applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Vec<PlannedAction>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<SyncResult>,
}

/// Broadcasts status events to any number of subscribers.
#[derive(Clone)]
pub struct StatusBroadcaster {
    sender: Arc<broadcast::Sender<StatusEvent>>,
}

impl StatusBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, event: StatusEvent) {
        if let Err(e) = self.sender.send(event) {
            log::trace!("No status subscribers: {}", e);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.sender.subscribe()
    }
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new(100)
    }
}
