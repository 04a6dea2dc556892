//! Peer discovery without a central directory.
//!
//! Three independent tasks:
//! - the announcer broadcasts this node's presence on the discovery port
//!   every sync interval
//! - the listener receives announcements, drops our own, and admits a peer
//!   only after its `/p2p/status` answers 200
//! - the health checker probes every known peer, flips its status, and
//!   evicts peers unreachable for longer than the grace period
//!
//! Announcements are unauthenticated; discovery assumes a trusted LAN.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::config::NodeConfig;
use crate::events::{EventHub, SyncEvent};
use crate::registry::{PeerRecord, PeerRegistry, PeerStatus, RegistryError};
use crate::sync::client::{PeerClient, PeerError};
use crate::sync::protocol::{Announcement, DiscoveryMessage};

const MAX_DATAGRAM: usize = 4096;

/// Errors from discovery operations.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid announcement: {0}")]
    Json(#[from] serde_json::Error),
    #[error("peer {peer_id} failed verification: {source}")]
    Unverified {
        peer_id: String,
        #[source]
        source: PeerError,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Result of one health-check pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthReport {
    pub active: Vec<String>,
    pub inactive: Vec<String>,
    pub evicted: Vec<String>,
}

/// Finds, verifies and monitors peers.
pub struct Discovery {
    config: Arc<NodeConfig>,
    registry: PeerRegistry,
    client: PeerClient,
    events: EventHub,
    discovered: Mutex<HashSet<String>>,
}

impl Discovery {
    pub fn new(
        config: Arc<NodeConfig>,
        registry: PeerRegistry,
        client: PeerClient,
        events: EventHub,
    ) -> Self {
        Self {
            config,
            registry,
            client,
            events,
            discovered: Mutex::new(HashSet::new()),
        }
    }

    /// Peers admitted through announcements and not evicted since.
    pub fn discovered_peers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .discovered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// This node's presence message.
    pub fn announcement(&self) -> DiscoveryMessage {
        DiscoveryMessage::Announce(Announcement {
            peer_id: self.config.node_id.clone(),
            host: self.config.host.clone(),
            api_port: self.config.api_port,
            last_seen: Utc::now(),
            protocol_version: self.config.protocol_version.clone(),
            status: PeerStatus::Active,
        })
    }

    /// Sends one announcement to the broadcast address.
    pub async fn broadcast_presence(&self) -> Result<(), DiscoveryError> {
        let payload = serde_json::to_vec(&self.announcement())?;
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_broadcast(true)?;
        socket
            .send_to(&payload, (Ipv4Addr::BROADCAST, self.config.discovery_port))
            .await?;
        tracing::debug!("Broadcast presence on port {}", self.config.discovery_port);
        Ok(())
    }

    /// Announces presence every sync interval until shutdown.
    pub async fn run_announcer(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.sync_period());
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.broadcast_presence().await {
                        tracing::error!("Failed to broadcast presence: {}", e);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Binds the announcement listener socket. The port is shared, so
    /// several nodes on one host can all hear announcements.
    pub fn bind_listener(&self) -> Result<UdpSocket, DiscoveryError> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.config.discovery_port));
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let socket = UdpSocket::from_std(socket.into())?;
        tracing::info!("Peer discovery listening on UDP {}", self.config.discovery_port);
        Ok(socket)
    }

    /// Receives announcements until shutdown.
    pub async fn run_listener(self: Arc<Self>, socket: UdpSocket, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => {
                        self.handle_datagram(&buf[..len], from).await;
                    }
                    Err(e) => {
                        tracing::error!("Discovery listener error: {}", e);
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Handles one datagram. Returns the admitted peer, if any.
    pub async fn handle_datagram(&self, data: &[u8], from: SocketAddr) -> Option<PeerRecord> {
        let message: DiscoveryMessage = match serde_json::from_slice(data) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("Ignoring datagram from {}: {}", from, e);
                return None;
            }
        };

        let DiscoveryMessage::Announce(announcement) = message;
        if announcement.peer_id == self.config.node_id {
            return None;
        }

        let candidate = announcement.to_record();
        if !self.needs_verification(&candidate) {
            return None;
        }

        match self.verify_and_admit(candidate).await {
            Ok(peer) => Some(peer),
            Err(e) => {
                tracing::debug!("{}", e);
                None
            }
        }
    }

    /// Known active peers at the same address need no new verification;
    /// the health checker keeps them honest.
    fn needs_verification(&self, candidate: &PeerRecord) -> bool {
        match self.registry.get(&candidate.peer_id) {
            Some(known) => {
                !known.is_active() || known.host != candidate.host || known.port != candidate.port
            }
            None => true,
        }
    }

    /// Probes a candidate and adds it to the registry if it answers 200.
    pub async fn verify_and_admit(&self, candidate: PeerRecord) -> Result<PeerRecord, DiscoveryError> {
        self.client
            .check_reachable(&candidate.base_url())
            .await
            .map_err(|source| DiscoveryError::Unverified {
                peer_id: candidate.peer_id.clone(),
                source,
            })?;

        let peer = self.registry.add_or_update(candidate)?;
        self.discovered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer.peer_id.clone());

        tracing::info!("Verified and added peer {} at {}", peer.peer_id, peer.base_url());
        self.events.publish(SyncEvent::PeerAdmitted {
            peer_id: peer.peer_id.clone(),
            host: peer.host.clone(),
            port: peer.port,
        });
        Ok(peer)
    }

    /// Probes every known peer once.
    pub async fn check_health(&self) -> HealthReport {
        self.check_health_at(Utc::now()).await
    }

    /// Health pass with an explicit clock, used for eviction decisions.
    pub async fn check_health_at(&self, now: DateTime<Utc>) -> HealthReport {
        let peers = self.registry.all();
        let probes = join_all(
            peers
                .iter()
                .map(|peer| async move { self.client.check_reachable(&peer.base_url()).await }),
        )
        .await;

        let grace = self.config.eviction_grace();
        let mut report = HealthReport::default();

        for (peer, probe) in peers.into_iter().zip(probes) {
            match probe {
                Ok(()) => {
                    if self.registry.mark_seen(&peer.peer_id, now) == Some(PeerStatus::Inactive) {
                        tracing::info!("Peer {} is reachable again", peer.peer_id);
                        self.events.publish(SyncEvent::PeerStatusChanged {
                            peer_id: peer.peer_id.clone(),
                            status: PeerStatus::Active,
                        });
                    }
                    report.active.push(peer.peer_id);
                }
                Err(e) if now - peer.last_seen > grace => {
                    let Some(evicted) = self
                        .registry
                        .evict_if_unseen_since(&peer.peer_id, now - grace)
                    else {
                        tracing::debug!("Peer {} was seen during the health pass", peer.peer_id);
                        continue;
                    };
                    tracing::info!(
                        "Evicting peer {}: unreachable since {} ({})",
                        peer.peer_id,
                        evicted.last_seen,
                        e
                    );
                    self.discovered
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&peer.peer_id);
                    self.events.publish(SyncEvent::PeerEvicted {
                        peer_id: peer.peer_id.clone(),
                    });
                    report.evicted.push(peer.peer_id);
                }
                Err(e) => {
                    tracing::debug!("Health probe of {} failed: {}", peer.peer_id, e);
                    if self.registry.set_status(&peer.peer_id, PeerStatus::Inactive)
                        == Some(PeerStatus::Active)
                    {
                        tracing::warn!("Peer {} marked inactive", peer.peer_id);
                        self.events.publish(SyncEvent::PeerStatusChanged {
                            peer_id: peer.peer_id.clone(),
                            status: PeerStatus::Inactive,
                        });
                    }
                    report.inactive.push(peer.peer_id);
                }
            }
        }

        report
    }

    /// Runs health checks every configured interval until shutdown.
    pub async fn run_health_checks(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.config.health_check_period();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.check_health().await;
                    tracing::debug!(
                        "Health check: {} active, {} inactive, {} evicted",
                        report.active.len(),
                        report.inactive.len(),
                        report.evicted.len()
                    );
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}

/// Best guess at this host's outbound IPv4 address.
///
/// Connecting a UDP socket sends nothing; it only selects a route.
pub fn local_ip() -> String {
    std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| Ipv4Addr::LOCALHOST.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Router};

    fn config(node_id: &str) -> Arc<NodeConfig> {
        Arc::new(NodeConfig {
            node_id: node_id.to_string(),
            host: "127.0.0.1".into(),
            ..NodeConfig::default()
        })
    }

    fn discovery(node_id: &str) -> (Discovery, PeerRegistry) {
        let registry = PeerRegistry::new(node_id, 10);
        let discovery = Discovery::new(
            config(node_id),
            registry.clone(),
            PeerClient::new(),
            EventHub::new(),
        );
        (discovery, registry)
    }

    fn sender() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    /// Serves a bare `/p2p/status` answering 200 and returns its port.
    async fn status_stub() -> u16 {
        let app = Router::new().route("/p2p/status", get(|| async { "{}" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    fn dead_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    fn datagram(peer_id: &str, port: u16) -> Vec<u8> {
        serde_json::to_vec(&DiscoveryMessage::Announce(Announcement {
            peer_id: peer_id.into(),
            host: "127.0.0.1".into(),
            api_port: port,
            last_seen: Utc::now(),
            protocol_version: "1.0.1".into(),
            status: PeerStatus::Active,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_own_announcement_ignored() {
        let (discovery, registry) = discovery("self");
        let own = serde_json::to_vec(&discovery.announcement()).unwrap();

        assert!(discovery.handle_datagram(&own, sender()).await.is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_garbage_datagram_ignored() {
        let (discovery, registry) = discovery("self");
        assert!(discovery
            .handle_datagram(b"not json", sender())
            .await
            .is_none());
        assert!(discovery
            .handle_datagram(br#"{"type":"hello"}"#, sender())
            .await
            .is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_verified_peer_admitted() {
        let (discovery, registry) = discovery("self");
        let port = status_stub().await;

        let admitted = discovery
            .handle_datagram(&datagram("peer-1", port), sender())
            .await
            .unwrap();
        assert_eq!(admitted.peer_id, "peer-1");
        assert!(registry.get_active("peer-1").is_some());
        assert_eq!(discovery.discovered_peers(), vec!["peer-1"]);
    }

    #[tokio::test]
    async fn test_unreachable_peer_never_admitted() {
        let (discovery, registry) = discovery("self");

        let admitted = discovery
            .handle_datagram(&datagram("ghost", dead_port()), sender())
            .await;
        assert!(admitted.is_none());
        assert!(registry.active_peers().is_empty());
        assert!(discovery.discovered_peers().is_empty());
    }

    #[tokio::test]
    async fn test_health_check_marks_inactive_then_evicts() {
        let (discovery, registry) = discovery("self");
        let port = status_stub().await;
        discovery
            .verify_and_admit(PeerRecord::new("peer-1", "127.0.0.1", port))
            .await
            .unwrap();

        // Same peer now answers on a dead port.
        let mut moved = registry.get("peer-1").unwrap();
        moved.port = dead_port();
        registry.add_or_update(moved).unwrap();

        let report = discovery.check_health().await;
        assert_eq!(report.inactive, vec!["peer-1"]);
        assert!(registry.active_peers().is_empty());
        assert!(registry.get("peer-1").is_some());

        let later = Utc::now() + chrono::Duration::minutes(3);
        let report = discovery.check_health_at(later).await;
        assert_eq!(report.evicted, vec!["peer-1"]);
        assert!(registry.get("peer-1").is_none());
        assert!(discovery.discovered_peers().is_empty());
    }

    #[tokio::test]
    async fn test_health_check_reactivates() {
        let (discovery, registry) = discovery("self");
        let port = status_stub().await;
        registry
            .add_or_update(PeerRecord::new("peer-1", "127.0.0.1", port))
            .unwrap();
        registry.set_status("peer-1", PeerStatus::Inactive);

        let report = discovery.check_health().await;
        assert_eq!(report.active, vec!["peer-1"]);
        assert!(registry.get_active("peer-1").is_some());
    }

    #[tokio::test]
    async fn test_listeners_share_discovery_port() {
        let port = {
            let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            socket.local_addr().unwrap().port()
        };
        let with_port = |node_id: &str| {
            let config = Arc::new(NodeConfig {
                node_id: node_id.to_string(),
                host: "127.0.0.1".into(),
                discovery_port: port,
                ..NodeConfig::default()
            });
            Discovery::new(config, PeerRegistry::new(node_id, 10), PeerClient::new(), EventHub::new())
        };

        let first = with_port("node-a").bind_listener().unwrap();
        let second = with_port("node-b").bind_listener().unwrap();
        assert_eq!(first.local_addr().unwrap().port(), port);
        assert_eq!(second.local_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn test_eviction_skips_peer_seen_after_cutoff() {
        let (discovery, registry) = discovery("self");
        registry
            .add_or_update(PeerRecord::new("peer-1", "127.0.0.1", dead_port()))
            .unwrap();
        let later = Utc::now() + chrono::Duration::minutes(3);
        registry.mark_seen("peer-1", later);

        let report = discovery.check_health_at(later).await;
        assert!(report.evicted.is_empty());
        assert_eq!(report.inactive, vec!["peer-1"]);
        assert!(registry.get("peer-1").is_some());
    }

    #[test]
    fn test_local_ip_is_ipv4() {
        assert!(local_ip().parse::<Ipv4Addr>().is_ok());
    }
}
