//! Sync engine: anti-entropy rounds between this node and its peers.
//!
//! A round synchronizes a set of (peer, table) pairs. Peers are handled
//! concurrently; the tables of one peer are processed one after another,
//! each with the same procedure:
//!
//! 1. read the pair's [`SyncCursor`], an absent side meaning full sync
//! 2. read local rows recorded after the push cursor
//! 3. fetch the peer's rows recorded after the pull cursor
//! 4. push local rows to the peer
//! 5. apply the peer's rows locally under last-writer-wins
//!
//! The two directions advance independently. The push cursor moves to the
//! local set's watermark once the peer accepted every row; the pull cursor
//! moves to the feed's watermark once every row applied here. Watermarks
//! come from each store's recording order, so a row written while a round
//! is in flight, or carrying an old `updated_at`, is picked up next time.
//!
//! Cursor moves and the round summary are committed together under one
//! lock at the end of the round, so concurrent rounds never interleave
//! their bookkeeping. Cursors only move forward.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::{Map, Value as Json};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

use super::client::PeerClient;
use super::protocol::{ApplyChangesRequest, NotifyChangesRequest, SyncStatusReport};
use super::status::{SyncCursor, SyncRoundStatus, TableOutcome, Trigger};
use crate::config::NodeConfig;
use crate::events::{EventHub, SyncEvent};
use crate::registry::{PeerRecord, PeerRegistry, PeerStatus};
use crate::store::{
    timestamp, ApplyContext, ChangeSet, ChangeStore, Row, StoreError, TableSchema,
};

/// Errors surfaced to callers of on-demand operations.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("peer '{0}' is not an active peer")]
    PeerNotActive(String),
    #[error("table '{0}' is not replicated by this node")]
    UnknownTable(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of applying a batch of incoming rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    /// Rows whose incoming values were written.
    pub applied: usize,
    /// Rows where local and incoming versions competed.
    pub conflicts: usize,
    /// Rows that could not be decoded or written.
    pub skipped: usize,
    pub errors: Vec<String>,
}

#[derive(Default)]
struct Ledger {
    cursors: HashMap<(String, String), SyncCursor>,
    last_round: Option<SyncRoundStatus>,
}

struct TableRun {
    outcome: TableOutcome,
    advance: SyncCursor,
}

/// Orchestrates sync rounds for one node.
pub struct SyncEngine {
    config: Arc<NodeConfig>,
    registry: PeerRegistry,
    store: Arc<dyn ChangeStore>,
    client: PeerClient,
    events: EventHub,
    ledger: Mutex<Ledger>,
    rounds_in_flight: AtomicUsize,
}

impl SyncEngine {
    pub fn new(
        config: Arc<NodeConfig>,
        registry: PeerRegistry,
        store: Arc<dyn ChangeStore>,
        client: PeerClient,
        events: EventHub,
    ) -> Self {
        Self {
            config,
            registry,
            store,
            client,
            events,
            ledger: Mutex::new(Ledger::default()),
            rounds_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ChangeStore> {
        &self.store
    }

    fn local_id(&self) -> &str {
        &self.config.node_id
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves a table name against the replicated set.
    pub fn table(&self, name: &str) -> Result<&'static TableSchema, SyncError> {
        self.config
            .sync_table(name)
            .ok_or_else(|| SyncError::UnknownTable(name.to_string()))
    }

    /// Cursors for a (peer, table) pair; both sides empty until the first
    /// successful exchange.
    pub fn cursor(&self, peer_id: &str, table: &str) -> SyncCursor {
        self.ledger()
            .cursors
            .get(&(peer_id.to_string(), table.to_string()))
            .copied()
            .unwrap_or_default()
    }

    pub fn last_round(&self) -> Option<SyncRoundStatus> {
        self.ledger().last_round.clone()
    }

    pub fn is_running(&self) -> bool {
        self.rounds_in_flight.load(Ordering::SeqCst) > 0
    }

    /// Periodic sync loop. Runs until `shutdown` flips to true.
    pub async fn run_periodic(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.config.sync_period();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!("Periodic sync every {}s", self.config.sync_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sync_with_peers(Trigger::Periodic).await;
                }
                _ = shutdown.changed() => {
                    break;
                }
            }
        }

        tracing::debug!("Periodic sync loop stopped");
    }

    /// Syncs every replicated table with every active peer.
    pub async fn sync_with_peers(&self, trigger: Trigger) -> SyncRoundStatus {
        let tables = self.config.sync_schemas();
        let targets = self
            .registry
            .active_peers()
            .into_iter()
            .map(|peer| (peer, tables.clone()))
            .collect();
        self.run_round(trigger, targets).await
    }

    /// Syncs every replicated table with one active peer.
    pub async fn sync_peer(
        &self,
        trigger: Trigger,
        peer_id: &str,
    ) -> Result<SyncRoundStatus, SyncError> {
        let peer = self
            .registry
            .get_active(peer_id)
            .ok_or_else(|| SyncError::PeerNotActive(peer_id.to_string()))?;
        Ok(self
            .run_round(trigger, vec![(peer, self.config.sync_schemas())])
            .await)
    }

    /// Syncs the given tables with one peer.
    pub async fn sync_tables_with_peer(
        &self,
        trigger: Trigger,
        peer: PeerRecord,
        tables: Vec<&'static TableSchema>,
    ) -> SyncRoundStatus {
        self.run_round(trigger, vec![(peer, tables)]).await
    }

    async fn run_round(
        &self,
        trigger: Trigger,
        targets: Vec<(PeerRecord, Vec<&'static TableSchema>)>,
    ) -> SyncRoundStatus {
        self.rounds_in_flight.fetch_add(1, Ordering::SeqCst);
        let mut status = SyncRoundStatus::begin(trigger);

        if !targets.is_empty() {
            tracing::debug!("Starting {} sync round with {} peer(s)", trigger, targets.len());
            self.events.publish(SyncEvent::RoundStarted {
                trigger,
                peers: targets.len(),
            });
        }

        let per_peer = join_all(
            targets
                .iter()
                .map(|(peer, tables)| self.sync_peer_tables(peer, tables)),
        )
        .await;

        {
            let mut ledger = self.ledger();
            for mut run in per_peer.into_iter().flatten() {
                let key = (run.outcome.peer_id.clone(), run.outcome.table.clone());
                run.outcome.cursor_advanced =
                    ledger.cursors.entry(key).or_default().advance(run.advance);
                status.record(&run.outcome);
            }
            status.finish();
            ledger.last_round = Some(status.clone());
        }

        self.rounds_in_flight.fetch_sub(1, Ordering::SeqCst);

        if !targets.is_empty() {
            if status.errors.is_empty() {
                tracing::info!(
                    "Sync round ({}) done: {} peer(s), {} table(s), {} row(s) applied, {} conflict(s)",
                    trigger,
                    status.peers_contacted.len(),
                    status.tables_processed,
                    status.rows_applied,
                    status.conflicts_resolved
                );
            } else {
                tracing::warn!(
                    "Sync round ({}) finished with {} error(s)",
                    trigger,
                    status.errors.len()
                );
            }
            self.events.publish(SyncEvent::RoundCompleted {
                trigger,
                peers_contacted: status.peers_contacted.len(),
                tables_processed: status.tables_processed,
                rows_applied: status.rows_applied,
                conflicts_resolved: status.conflicts_resolved,
                errors: status.errors.len(),
            });
        }

        status
    }

    async fn sync_peer_tables(
        &self,
        peer: &PeerRecord,
        tables: &[&'static TableSchema],
    ) -> Vec<TableRun> {
        let mut runs = Vec::with_capacity(tables.len());
        for &table in tables {
            let (run, unreachable) = self.sync_table(peer, table).await;
            runs.push(run);
            if unreachable {
                // Remaining tables would only time out as well.
                break;
            }
        }
        runs
    }

    /// Runs the per-(peer, table) procedure. Returns the run and whether the
    /// peer turned out to be unreachable.
    async fn sync_table(&self, peer: &PeerRecord, table: &'static TableSchema) -> (TableRun, bool) {
        let mut outcome = TableOutcome::new(&peer.peer_id, table.name);
        let cursor = self.cursor(&peer.peer_id, table.name);
        let mut advance = SyncCursor::default();
        let mut unreachable = false;

        let local = match self.store.changes_since(table, cursor.pushed).await {
            Ok(set) => Some(set),
            Err(e) => {
                tracing::error!("Reading local {} changes failed: {}", table.name, e);
                outcome.errors.push(format!("reading local changes: {}", e));
                None
            }
        };

        let remote = match self.client.fetch_changes(peer, table.name, cursor.pulled).await {
            Ok(feed) => match feed.into_change_set(table) {
                Ok(set) => Some(set),
                Err(e) => {
                    tracing::warn!(
                        "Malformed {} changes from {}: {}",
                        table.name,
                        peer.peer_id,
                        e
                    );
                    outcome.errors.push(format!("malformed change feed: {}", e));
                    None
                }
            },
            Err(e) => {
                tracing::warn!(
                    "Fetching {} changes from {} failed: {}",
                    table.name,
                    peer.peer_id,
                    e
                );
                outcome.errors.push(format!("fetching changes: {}", e));
                unreachable = e.is_unreachable();
                None
            }
        };

        match local {
            Some(local) if local.is_empty() => advance.pushed = local.watermark,
            Some(local) if !unreachable => {
                let request = ApplyChangesRequest::new(&local, self.local_id());
                match self.client.push_changes(peer, &request).await {
                    Ok(response) => {
                        outcome.rows_sent = local.len();
                        tracing::debug!(
                            "Pushed {} {} row(s) to {} ({} written, {} skipped)",
                            local.len(),
                            table.name,
                            peer.peer_id,
                            response.rows_affected,
                            response.skipped
                        );
                        if response.skipped == 0 {
                            advance.pushed = local.watermark;
                        } else {
                            tracing::warn!(
                                "{} skipped {} of {} pushed {} row(s)",
                                peer.peer_id,
                                response.skipped,
                                local.len(),
                                table.name
                            );
                            outcome.errors.push(format!(
                                "peer skipped {} of {} pushed row(s)",
                                response.skipped,
                                local.len()
                            ));
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Pushing {} changes to {} failed: {}",
                            table.name,
                            peer.peer_id,
                            e
                        );
                        outcome.errors.push(format!("pushing changes: {}", e));
                        unreachable = e.is_unreachable();
                    }
                }
            }
            _ => {}
        }

        if let Some(remote) = remote {
            outcome.rows_received = remote.len();
            let report = self.apply_change_set(&remote, &peer.peer_id).await;
            outcome.rows_applied = report.applied;
            outcome.conflicts = report.conflicts;
            if report.skipped == 0 {
                advance.pulled = remote.watermark;
            }
            outcome.errors.extend(report.errors);
        }

        let was_active = unreachable
            && self.registry.set_status(&peer.peer_id, PeerStatus::Inactive)
                == Some(PeerStatus::Active);
        if was_active {
            tracing::info!("Peer {} is unreachable, marked inactive", peer.peer_id);
            self.events.publish(SyncEvent::PeerStatusChanged {
                peer_id: peer.peer_id.clone(),
                status: PeerStatus::Inactive,
            });
        }

        (TableRun { outcome, advance }, unreachable)
    }

    /// Applies decoded rows from `source_node`. A failing row is logged and
    /// skipped; the rest of the set is still applied.
    pub async fn apply_change_set(&self, set: &ChangeSet, source_node: &str) -> ApplyReport {
        let mut report = ApplyReport::default();
        for change in &set.changes {
            self.apply_one(set.table, &change.row, source_node, &mut report)
                .await;
        }
        self.publish_applied(set.table, source_node, &report);
        report
    }

    /// Decodes and applies raw JSON rows pushed by a peer.
    pub async fn apply_rows(
        &self,
        table: &'static TableSchema,
        rows: &[Map<String, Json>],
        source_node: &str,
    ) -> ApplyReport {
        let mut report = ApplyReport::default();
        for (index, object) in rows.iter().enumerate() {
            match Row::from_json(table, object) {
                Ok(row) => self.apply_one(table, &row, source_node, &mut report).await,
                Err(e) => {
                    tracing::warn!("Skipping {} row {} from {}: {}", table.name, index, source_node, e);
                    report.skipped += 1;
                    report.errors.push(format!("row {}: {}", index, e));
                }
            }
        }
        self.publish_applied(table, source_node, &report);
        report
    }

    async fn apply_one(
        &self,
        table: &'static TableSchema,
        row: &Row,
        source_node: &str,
        report: &mut ApplyReport,
    ) {
        let ctx = ApplyContext {
            local_node: self.local_id(),
            source_node,
        };
        match self.store.apply_row(table, row, ctx).await {
            Ok(resolution) => {
                if resolution.writes_incoming() {
                    report.applied += 1;
                }
                if resolution.is_conflict() {
                    report.conflicts += 1;
                    tracing::debug!(
                        "Conflict on {} id {:?} with {}: {:?}",
                        table.name,
                        row.key(),
                        source_node,
                        resolution
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Applying {} id {:?} from {} failed: {}",
                    table.name,
                    row.key(),
                    source_node,
                    e
                );
                report.skipped += 1;
                report.errors.push(format!("id {:?}: {}", row.key(), e));
            }
        }
    }

    fn publish_applied(&self, table: &TableSchema, source_node: &str, report: &ApplyReport) {
        if report.applied > 0 || report.conflicts > 0 {
            self.events.publish(SyncEvent::ChangesApplied {
                table: table.name.to_string(),
                source_peer: source_node.to_string(),
                rows_affected: report.applied,
                conflicts: report.conflicts,
            });
        }
    }

    /// Local rows of a replicated table changed after `since`.
    pub async fn local_changes(
        &self,
        table: &'static TableSchema,
        since: Option<DateTime<Utc>>,
    ) -> Result<ChangeSet, SyncError> {
        Ok(self.store.changes_since(table, since).await?)
    }

    /// Event-driven trigger after a local write: notify every active peer
    /// and, in low-latency mode, start a targeted sync with each of them.
    pub fn notify_local_change(self: &Arc<Self>, table: &'static TableSchema) {
        let peers = self.registry.active_peers();
        if peers.is_empty() {
            return;
        }

        let request = NotifyChangesRequest {
            source_peer: Some(self.local_id().to_string()),
            tables: Some(vec![table.name.to_string()]),
            timestamp: Some(timestamp::format(&Utc::now())),
        };

        for peer in peers {
            let client = self.client.clone();
            let request = request.clone();
            let target = peer.clone();
            tokio::spawn(async move {
                if let Err(e) = client.notify_changes(&target, &request).await {
                    tracing::debug!("Notifying {} failed: {}", target.peer_id, e);
                }
            });

            if self.config.low_latency() {
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    engine
                        .sync_tables_with_peer(Trigger::LocalChange, peer, vec![table])
                        .await;
                });
            }
        }
    }

    /// Handles a peer's change notification. Starts a targeted sync for the
    /// named tables if the peer is active; returns whether one was started.
    pub fn handle_notification(self: &Arc<Self>, source_peer: &str, tables: &[String]) -> bool {
        self.events.publish(SyncEvent::ChangeNotification {
            source_peer: source_peer.to_string(),
            tables: tables.to_vec(),
        });

        let Some(peer) = self.registry.get_active(source_peer) else {
            tracing::debug!("Change notification from inactive or unknown peer {}", source_peer);
            return false;
        };

        let schemas: Vec<&'static TableSchema> =
            tables.iter().filter_map(|t| self.config.sync_table(t)).collect();
        if schemas.is_empty() {
            return false;
        }

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine
                .sync_tables_with_peer(Trigger::Notification, peer, schemas)
                .await;
        });
        true
    }

    /// Snapshot for `/p2p/sync-status`.
    pub fn status_report(&self) -> SyncStatusReport {
        let ledger = self.ledger();
        let mut peer_sync_times: BTreeMap<String, BTreeMap<String, SyncCursor>> = BTreeMap::new();
        for ((peer, table), cursor) in &ledger.cursors {
            peer_sync_times
                .entry(peer.clone())
                .or_default()
                .insert(table.clone(), *cursor);
        }

        SyncStatusReport {
            sync_running: self.is_running(),
            last_round: ledger.last_round.clone(),
            peer_sync_times,
            active_peers: self.registry.active_peers().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::PRODUCTS;
    use crate::store::sqlite::tests::product;
    use crate::store::SqliteChangeStore;
    use serde_json::json;
    use tempfile::tempdir;

    async fn engine(node_id: &str) -> (tempfile::TempDir, Arc<SyncEngine>, PeerRegistry) {
        let dir = tempdir().unwrap();
        let store = SqliteChangeStore::open(&dir.path().join("node.db"))
            .await
            .unwrap();
        let config = Arc::new(NodeConfig {
            node_id: node_id.to_string(),
            host: "127.0.0.1".into(),
            ..NodeConfig::default()
        });
        let registry = PeerRegistry::new(node_id, 10);
        let engine = SyncEngine::new(
            config,
            registry.clone(),
            Arc::new(store),
            PeerClient::new(),
            EventHub::new(),
        );
        (dir, Arc::new(engine), registry)
    }

    /// Serves a fixed change feed and answers every push with `skipped`.
    async fn stub_peer(feed: Json, skipped: usize) -> u16 {
        use axum::routing::{get, post};

        let app = axum::Router::new()
            .route(
                "/p2p/table-changes/{table}",
                get(move || {
                    let feed = feed.clone();
                    async move { axum::Json(feed) }
                }),
            )
            .route(
                "/p2p/apply-changes/{table}",
                post(move || async move {
                    axum::Json(json!({
                        "message": "applied",
                        "table": "products",
                        "rows_affected": 0,
                        "conflicts": 0,
                        "skipped": skipped,
                        "source_peer": "stub"
                    }))
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    fn feed_of(rows: Vec<Map<String, Json>>, watermark: &str) -> Json {
        json!({
            "table": "products",
            "count": rows.len(),
            "data": rows,
            "timestamp": "2030-01-01T00:00:10.000000Z",
            "since": null,
            "watermark": watermark,
            "sync_type": "full"
        })
    }

    fn dead_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[tokio::test]
    async fn test_apply_rows_twice_is_idempotent() {
        let (_dir, engine, _) = engine("aaa").await;
        let rows = vec![product(1, "kettle", 100).to_json(), product(2, "mug", 100).to_json()];

        let first = engine.apply_rows(&PRODUCTS, &rows, "zzz").await;
        assert_eq!(first.applied, 2);

        let before = engine.local_changes(&PRODUCTS, None).await.unwrap();
        let second = engine.apply_rows(&PRODUCTS, &rows, "zzz").await;
        let after = engine.local_changes(&PRODUCTS, None).await.unwrap();

        assert_eq!(second.skipped, 0);
        assert_eq!(before.changes, after.changes);
    }

    #[tokio::test]
    async fn test_apply_rows_skips_bad_row_and_continues() {
        let (_dir, engine, _) = engine("aaa").await;
        let mut bad = product(1, "broken", 100).to_json();
        bad.insert("name".into(), json!(42));
        let rows = vec![bad, product(2, "fine", 100).to_json()];

        let report = engine.apply_rows(&PRODUCTS, &rows, "zzz").await;
        assert_eq!(report.applied, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(engine.store().get_row(&PRODUCTS, 1).await.unwrap().is_none());
        assert!(engine.store().get_row(&PRODUCTS, 2).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_tie_resolves_to_larger_identity() {
        let (_dir, engine, _) = engine("aaa").await;
        engine
            .store()
            .write_local(&PRODUCTS, &product(5, "from-a", 200))
            .await
            .unwrap();

        let report = engine
            .apply_rows(&PRODUCTS, &[product(5, "from-b", 200).to_json()], "zzz")
            .await;
        assert_eq!(report.applied, 1);
        assert_eq!(report.conflicts, 1);

        let stored = engine.store().get_row(&PRODUCTS, 5).await.unwrap().unwrap();
        assert_eq!(stored, product(5, "from-b", 200));
    }

    #[tokio::test]
    async fn test_unknown_table_rejected() {
        let (_dir, engine, _) = engine("aaa").await;
        assert!(matches!(engine.table("orders"), Err(SyncError::UnknownTable(_))));
        assert!(engine.table("products").is_ok());
    }

    #[tokio::test]
    async fn test_sync_peer_requires_active_peer() {
        let (_dir, engine, _) = engine("aaa").await;
        let err = engine.sync_peer(Trigger::Manual, "ghost").await.unwrap_err();
        assert!(matches!(err, SyncError::PeerNotActive(_)));
    }

    #[tokio::test]
    async fn test_unreachable_peer_keeps_cursor_and_goes_inactive() {
        let (_dir, engine, registry) = engine("aaa").await;
        registry
            .add_or_update(PeerRecord::new("zzz", "127.0.0.1", dead_port()))
            .unwrap();
        engine
            .store()
            .write_local(&PRODUCTS, &product(1, "kettle", 100))
            .await
            .unwrap();

        let status = engine.sync_with_peers(Trigger::Manual).await;

        assert!(!status.errors.is_empty());
        assert_eq!(engine.cursor("zzz", "products"), SyncCursor::default());
        assert!(registry.active_peers().is_empty());
        // The first table failing to connect stops the peer's round.
        assert_eq!(status.tables_processed, 1);
        assert!(engine.last_round().is_some());
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_malformed_feed_holds_pull_cursor_only() {
        let (_dir, engine, registry) = engine("aaa").await;
        let mut bad = product(7, "remote", 700).to_json();
        bad.insert("name".into(), json!(42));
        let port = stub_peer(feed_of(vec![bad], "2030-01-01T00:00:05.000000Z"), 0).await;
        registry
            .add_or_update(PeerRecord::new("stub", "127.0.0.1", port))
            .unwrap();
        engine
            .store()
            .write_local(&PRODUCTS, &product(1, "kettle", 100))
            .await
            .unwrap();
        let local = engine.local_changes(&PRODUCTS, None).await.unwrap();

        let status = engine.sync_with_peers(Trigger::Manual).await;

        assert_eq!(status.rows_sent, 1);
        assert!(!status.errors.is_empty());
        let cursor = engine.cursor("stub", "products");
        assert_eq!(cursor.pulled, None);
        assert_eq!(cursor.pushed, local.watermark);
        assert!(cursor.pushed.is_some());

        // Only the failed direction is retried.
        let again = engine.sync_with_peers(Trigger::Manual).await;
        assert_eq!(again.rows_sent, 0);
        assert!(!again.errors.is_empty());
    }

    #[tokio::test]
    async fn test_skipped_push_holds_push_cursor_only() {
        let (_dir, engine, registry) = engine("aaa").await;
        let remote = product(7, "remote", 700).to_json();
        let port = stub_peer(feed_of(vec![remote], "2030-01-01T00:00:05.000000Z"), 1).await;
        registry
            .add_or_update(PeerRecord::new("stub", "127.0.0.1", port))
            .unwrap();
        engine
            .store()
            .write_local(&PRODUCTS, &product(1, "kettle", 100))
            .await
            .unwrap();

        let status = engine.sync_with_peers(Trigger::Manual).await;

        assert_eq!(status.rows_applied, 1);
        assert_eq!(status.errors.len(), 1);
        assert!(status.errors[0].contains("skipped 1 of 1"));
        let cursor = engine.cursor("stub", "products");
        assert_eq!(cursor.pushed, None);
        assert_eq!(
            cursor.pulled,
            Some(timestamp::parse("2030-01-01T00:00:05Z").unwrap())
        );
        assert!(engine.store().get_row(&PRODUCTS, 7).await.unwrap().is_some());

        // The rejected rows are offered again, plus the row applied here.
        let again = engine.sync_with_peers(Trigger::Manual).await;
        assert_eq!(again.rows_sent, 2);
        assert_eq!(engine.cursor("stub", "products").pushed, None);
    }

    #[tokio::test]
    async fn test_status_report_lists_both_cursors() {
        let (_dir, engine, registry) = engine("aaa").await;
        let port = stub_peer(feed_of(Vec::new(), "2030-01-01T00:00:05.000000Z"), 0).await;
        registry
            .add_or_update(PeerRecord::new("stub", "127.0.0.1", port))
            .unwrap();
        engine
            .store()
            .write_local(&PRODUCTS, &product(1, "kettle", 100))
            .await
            .unwrap();

        engine
            .sync_tables_with_peer(Trigger::Manual, registry.get("stub").unwrap(), vec![&PRODUCTS])
            .await;

        let report = serde_json::to_value(engine.status_report()).unwrap();
        let cursor = &report["peer_sync_times"]["stub"]["products"];
        assert!(cursor["pulled"].is_string());
        assert!(cursor["pushed"].is_string());
    }

    #[tokio::test]
    async fn test_notification_from_unknown_peer_does_not_sync() {
        let (_dir, engine, _) = engine("aaa").await;
        let mut events = engine.events.subscribe();

        assert!(!engine.handle_notification("stranger", &["products".to_string()]));
        assert!(matches!(
            events.recv().await.unwrap().event,
            SyncEvent::ChangeNotification { .. }
        ));
    }

    #[tokio::test]
    async fn test_round_without_peers() {
        let (_dir, engine, _) = engine("aaa").await;
        let status = engine.sync_with_peers(Trigger::Periodic).await;
        assert_eq!(status.tables_processed, 0);
        assert!(status.errors.is_empty());
        assert!(engine.status_report().peer_sync_times.is_empty());
    }
}
