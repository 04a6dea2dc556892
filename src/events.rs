//! Sync event hub.
//!
//! Rounds, applied change sets, notifications and membership changes are
//! published here and fanned out to every connected WebSocket observer.
//! Events are informational; nothing in the replication path waits on them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::registry::PeerStatus;
use crate::sync::status::Trigger;

/// Buffered events per subscriber before slow observers start lagging.
const CHANNEL_CAPACITY: usize = 64;

/// Something observers may want to know about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    RoundStarted {
        trigger: Trigger,
        peers: usize,
    },
    RoundCompleted {
        trigger: Trigger,
        peers_contacted: usize,
        tables_processed: usize,
        rows_applied: usize,
        conflicts_resolved: usize,
        errors: usize,
    },
    ChangesApplied {
        table: String,
        source_peer: String,
        rows_affected: usize,
        conflicts: usize,
    },
    ChangeNotification {
        source_peer: String,
        tables: Vec<String>,
    },
    BidirectionalSyncTriggered {
        peer_id: Option<String>,
    },
    LocalChange {
        table: String,
        id: i64,
    },
    PeerAdmitted {
        peer_id: String,
        host: String,
        port: u16,
    },
    PeerStatusChanged {
        peer_id: String,
        status: PeerStatus,
    },
    PeerEvicted {
        peer_id: String,
    },
}

/// An event with the time it was published.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: SyncEvent,
}

/// Fan-out point for sync events.
#[derive(Debug, Clone)]
pub struct EventHub {
    sender: broadcast::Sender<Envelope>,
}

impl EventHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    /// Publishes an event to all current subscribers.
    pub fn publish(&self, event: SyncEvent) {
        tracing::debug!(?event, "sync event");
        // No subscribers is not an error.
        let _ = self.sender.send(Envelope {
            timestamp: Utc::now(),
            event,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
