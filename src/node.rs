//! A replication node: one owner for the registry, store, engine, discovery
//! and event hub, plus the background tasks that drive them.
//!
//! Several nodes can live in one process; nothing here is global.

use axum::Router;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::NodeConfig;
use crate::discovery::Discovery;
use crate::events::{EventHub, SyncEvent};
use crate::registry::PeerRegistry;
use crate::server::{self, AppState};
use crate::store::{ChangeStore, Row, SqliteChangeStore, StoreError, TableSchema};
use crate::sync::{PeerClient, SyncEngine, SyncError};

pub struct Node {
    config: Arc<NodeConfig>,
    registry: PeerRegistry,
    events: EventHub,
    engine: Arc<SyncEngine>,
    discovery: Arc<Discovery>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Assembles a node around an existing store.
    pub fn new(config: NodeConfig, store: Arc<dyn ChangeStore>) -> Self {
        let config = Arc::new(config);
        let registry = PeerRegistry::new(&config.node_id, config.max_peers);
        let events = EventHub::new();
        let client = PeerClient::new();

        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&config),
            registry.clone(),
            store,
            client.clone(),
            events.clone(),
        ));
        let discovery = Arc::new(Discovery::new(
            Arc::clone(&config),
            registry.clone(),
            client,
            events.clone(),
        ));
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            registry,
            events,
            engine,
            discovery,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Opens the SQLite database named in the config and assembles a node.
    pub async fn open(config: NodeConfig) -> Result<Self, StoreError> {
        let store = SqliteChangeStore::open(&config.database_path).await?;
        Ok(Self::new(config, Arc::new(store)))
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn discovery(&self) -> &Arc<Discovery> {
        &self.discovery
    }

    pub fn store(&self) -> &Arc<dyn ChangeStore> {
        self.engine.store()
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            config: Arc::clone(&self.config),
            registry: self.registry.clone(),
            engine: Arc::clone(&self.engine),
            discovery: Arc::clone(&self.discovery),
            events: self.events.clone(),
        }
    }

    /// The node's HTTP API.
    pub fn router(&self) -> Router {
        server::router(self.app_state())
    }

    /// Spawns the periodic sync loop, health checks and, when enabled, the
    /// discovery announcer and listener. A discovery port that cannot be
    /// bound only disables listening; the node still serves and syncs.
    pub fn start(&self) {
        let mut tasks = Vec::new();

        if self.config.enable_auto_discovery {
            match self.discovery.bind_listener() {
                Ok(socket) => tasks.push(tokio::spawn(
                    Arc::clone(&self.discovery).run_listener(socket, self.shutdown.subscribe()),
                )),
                Err(e) => tracing::error!(
                    "Cannot listen for peers on UDP {}: {}; continuing without discovery listener",
                    self.config.discovery_port,
                    e
                ),
            }
            tasks.push(tokio::spawn(
                Arc::clone(&self.discovery).run_announcer(self.shutdown.subscribe()),
            ));
        } else {
            tracing::info!("Auto discovery disabled");
        }

        tasks.push(tokio::spawn(
            Arc::clone(&self.discovery).run_health_checks(self.shutdown.subscribe()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(&self.engine).run_periodic(self.shutdown.subscribe()),
        ));

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);

        tracing::info!(
            "Node {} started (tables: {})",
            self.config.node_id,
            self.config.sync_tables.join(", ")
        );
    }

    /// Stops background tasks and waits for them to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Background task ended abnormally: {}", e);
            }
        }
        tracing::info!("Node {} stopped", self.config.node_id);
    }

    /// Writes a locally produced row and propagates it: notifies active
    /// peers and, in low-latency mode, starts targeted syncs.
    pub async fn record_local_change(&self, table: &str, row: &Row) -> Result<(), SyncError> {
        let schema: &'static TableSchema = self.engine.table(table)?;
        self.store().write_local(schema, row).await?;

        if let Some(id) = row.key() {
            self.events.publish(SyncEvent::LocalChange {
                table: schema.name.to_string(),
                id,
            });
        }
        self.engine.notify_local_change(schema);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::PRODUCTS;
    use crate::store::sqlite::tests::product;
    use tempfile::tempdir;

    fn config(dir: &std::path::Path) -> NodeConfig {
        NodeConfig {
            node_id: "aaa".into(),
            host: "127.0.0.1".into(),
            database_path: dir.join("node.db"),
            enable_auto_discovery: false,
            ..NodeConfig::default()
        }
    }

    #[tokio::test]
    async fn test_record_local_change_writes_and_publishes() {
        let dir = tempdir().unwrap();
        let node = Node::open(config(dir.path())).await.unwrap();
        let mut events = node.events().subscribe();

        node.record_local_change("products", &product(1, "kettle", 100))
            .await
            .unwrap();

        assert!(node.store().get_row(&PRODUCTS, 1).await.unwrap().is_some());
        assert_eq!(
            events.recv().await.unwrap().event,
            SyncEvent::LocalChange {
                table: "products".into(),
                id: 1
            }
        );
    }

    #[tokio::test]
    async fn test_record_local_change_unknown_table() {
        let dir = tempdir().unwrap();
        let node = Node::open(config(dir.path())).await.unwrap();

        let err = node
            .record_local_change("orders", &product(1, "kettle", 100))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownTable(_)));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let dir = tempdir().unwrap();
        let node = Node::open(config(dir.path())).await.unwrap();

        node.start();
        assert_eq!(node.tasks.lock().unwrap().len(), 2);
        node.shutdown().await;
        assert!(node.tasks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_survives_busy_discovery_port() {
        let dir = tempdir().unwrap();
        let taken = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
        let node = Node::open(NodeConfig {
            enable_auto_discovery: true,
            discovery_port: taken.local_addr().unwrap().port(),
            ..config(dir.path())
        })
        .await
        .unwrap();

        node.start();
        // Announcer, health checks and periodic sync; no listener.
        assert_eq!(node.tasks.lock().unwrap().len(), 3);
        node.shutdown().await;
        drop(taken);
    }
}
