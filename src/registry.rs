//! In-memory peer membership.
//!
//! The registry maps peer identity to reachability. It is shared between the
//! discovery tasks (writers) and the sync engine (reader). Every operation
//! takes the lock briefly and readers get owned snapshots, so a stale view
//! only costs a wasted or deferred sync attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Reachability of a peer as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Active,
    Inactive,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            PeerStatus::Active => "active",
            PeerStatus::Inactive => "inactive",
        })
    }
}

/// A known peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: String,
    pub host: String,
    pub port: u16,
    /// Last time the peer answered a probe.
    pub last_seen: DateTime<Utc>,
    pub protocol_version: String,
    pub status: PeerStatus,
}

impl PeerRecord {
    pub fn new(peer_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            peer_id: peer_id.into(),
            host: host.into(),
            port,
            last_seen: Utc::now(),
            protocol_version: String::new(),
            status: PeerStatus::Active,
        }
    }

    /// Base URL of the peer's HTTP API.
    ///
    /// Port 443 means the peer sits behind a TLS-terminating proxy, so the
    /// port is omitted and https is used.
    pub fn base_url(&self) -> String {
        if self.port == 443 {
            format!("https://{}", self.host)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == PeerStatus::Active
    }
}

/// Errors from registry mutations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("a node cannot register itself as a peer")]
    SelfPeer,
    #[error("peer limit of {max} reached")]
    Full { max: usize },
}

/// Shared, cloneable peer table.
#[derive(Debug, Clone)]
pub struct PeerRegistry {
    local_id: Arc<str>,
    max_peers: usize,
    peers: Arc<RwLock<HashMap<String, PeerRecord>>>,
}

impl PeerRegistry {
    pub fn new(local_id: &str, max_peers: usize) -> Self {
        Self {
            local_id: Arc::from(local_id),
            max_peers,
            peers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Inserts or replaces a peer by id and refreshes its `last_seen`.
    ///
    /// Known peers can always be updated; new peers are refused once the
    /// registry holds `max_peers` entries.
    pub fn add_or_update(&self, mut peer: PeerRecord) -> Result<PeerRecord, RegistryError> {
        if peer.peer_id == *self.local_id {
            return Err(RegistryError::SelfPeer);
        }

        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        if !peers.contains_key(&peer.peer_id) && peers.len() >= self.max_peers {
            return Err(RegistryError::Full {
                max: self.max_peers,
            });
        }

        peer.last_seen = Utc::now();
        peers.insert(peer.peer_id.clone(), peer.clone());
        Ok(peer)
    }

    /// Removes a peer; a no-op if it is unknown.
    pub fn remove(&self, peer_id: &str) -> Option<PeerRecord> {
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer_id)
    }

    /// Snapshot of all active peers, ordered by id.
    pub fn active_peers(&self) -> Vec<PeerRecord> {
        let mut active: Vec<PeerRecord> = self
            .peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|p| p.is_active())
            .cloned()
            .collect();
        active.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        active
    }

    /// Snapshot of every known peer, ordered by id.
    pub fn all(&self) -> Vec<PeerRecord> {
        let mut all: Vec<PeerRecord> = self
            .peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        all
    }

    pub fn get(&self, peer_id: &str) -> Option<PeerRecord> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer_id)
            .cloned()
    }

    /// Returns the peer only if it is currently active.
    pub fn get_active(&self, peer_id: &str) -> Option<PeerRecord> {
        self.get(peer_id).filter(PeerRecord::is_active)
    }

    /// Changes a peer's status, returning the previous one. Unknown peers
    /// are ignored. `last_seen` is left untouched.
    pub fn set_status(&self, peer_id: &str, status: PeerStatus) -> Option<PeerStatus> {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        peers
            .get_mut(peer_id)
            .map(|peer| std::mem::replace(&mut peer.status, status))
    }

    /// Records a successful probe: marks the peer active and refreshes
    /// `last_seen`. Returns the previous status.
    pub fn mark_seen(&self, peer_id: &str, at: DateTime<Utc>) -> Option<PeerStatus> {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        peers.get_mut(peer_id).map(|peer| {
            peer.last_seen = at;
            std::mem::replace(&mut peer.status, PeerStatus::Active)
        })
    }

    /// Removes a peer only if it has not been seen since `cutoff`. The check
    /// and the removal happen under one lock, so a peer refreshed by a
    /// concurrent probe or announcement survives.
    pub fn evict_if_unseen_since(&self, peer_id: &str, cutoff: DateTime<Utc>) -> Option<PeerRecord> {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        match peers.get(peer_id) {
            Some(peer) if peer.last_seen < cutoff => peers.remove(peer_id),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
