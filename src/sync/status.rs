//! Per-round bookkeeping, kept for observability only.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// What started a sync round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// The periodic sync loop.
    Periodic,
    /// An operator request (`/p2p/sync/bidirectional`).
    Manual,
    /// A peer announced changed tables.
    Notification,
    /// A local write in low-latency mode.
    LocalChange,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Periodic => write!(f, "periodic"),
            Trigger::Manual => write!(f, "manual"),
            Trigger::Notification => write!(f, "notification"),
            Trigger::LocalChange => write!(f, "local_change"),
        }
    }
}

/// Resume points for one (peer, table) pair. Each lives in the clock of the
/// node that filters on it, so the two are never compared with each other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncCursor {
    /// Peer watermark of the last feed applied here without failures.
    pub pulled: Option<DateTime<Utc>>,
    /// Local watermark of the last set the peer accepted in full.
    pub pushed: Option<DateTime<Utc>>,
}

impl SyncCursor {
    /// Moves each side forward to `other` where it is ahead. Returns whether
    /// anything changed.
    pub fn advance(&mut self, other: SyncCursor) -> bool {
        let before = *self;
        self.pulled = self.pulled.max(other.pulled);
        self.pushed = self.pushed.max(other.pushed);
        *self != before
    }
}

/// Outcome of one (peer, table) synchronization.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TableOutcome {
    pub peer_id: String,
    pub table: String,
    pub rows_sent: usize,
    pub rows_received: usize,
    pub rows_applied: usize,
    pub conflicts: usize,
    /// Whether either cursor moved forward.
    pub cursor_advanced: bool,
    pub errors: Vec<String>,
}

impl TableOutcome {
    pub fn new(peer_id: &str, table: &str) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            table: table.to_string(),
            ..Self::default()
        }
    }
}

/// Summary of the most recent sync round.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncRoundStatus {
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub peers_contacted: Vec<String>,
    pub tables_processed: usize,
    pub rows_sent: usize,
    pub rows_applied: usize,
    pub conflicts_resolved: usize,
    pub errors: Vec<String>,
}

impl SyncRoundStatus {
    pub fn begin(trigger: Trigger) -> Self {
        Self {
            trigger,
            started_at: Utc::now(),
            finished_at: None,
            peers_contacted: Vec::new(),
            tables_processed: 0,
            rows_sent: 0,
            rows_applied: 0,
            conflicts_resolved: 0,
            errors: Vec::new(),
        }
    }

    /// Folds one table outcome into the round totals.
    pub fn record(&mut self, outcome: &TableOutcome) {
        if !self.peers_contacted.contains(&outcome.peer_id) {
            self.peers_contacted.push(outcome.peer_id.clone());
        }
        self.tables_processed += 1;
        self.rows_sent += outcome.rows_sent;
        self.rows_applied += outcome.rows_applied;
        self.conflicts_resolved += outcome.conflicts;
        self.errors.extend(
            outcome
                .errors
                .iter()
                .map(|e| format!("{}/{}: {}", outcome.peer_id, outcome.table, e)),
        );
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}
