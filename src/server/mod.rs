//! HTTP surface of a node.
//!
//! # Endpoints
//!
//! - `GET /p2p/status`: identity, peers and sync settings (reachability probe)
//! - `GET /p2p/table-changes/{table}?since=`: change feed
//! - `POST /p2p/apply-changes/{table}`: apply rows pushed by a peer
//! - `POST /p2p/notify-changes`: a peer's tables changed
//! - `POST /p2p/peers`, `DELETE /p2p/peers/{peer_id}`: manual membership
//! - `POST /p2p/sync/bidirectional?peer_id=`: force a round
//! - `GET /p2p/sync-status`: cursors and last round
//! - `GET /p2p/config`: node configuration
//! - `POST /p2p/discovery/refresh`: announce now
//! - `GET /p2p/ws`: sync event push channel

pub mod error;
pub mod handlers;
pub mod ws;

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::config::NodeConfig;
use crate::discovery::Discovery;
use crate::events::EventHub;
use crate::registry::PeerRegistry;
use crate::sync::SyncEngine;

pub use error::ApiError;

/// State shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<NodeConfig>,
    pub registry: PeerRegistry,
    pub engine: Arc<SyncEngine>,
    pub discovery: Arc<Discovery>,
    pub events: EventHub,
}

/// Builds the `/p2p` router.
pub fn router(state: AppState) -> Router {
    let mut routes = Router::new()
        .route("/p2p/status", get(handlers::status))
        .route("/p2p/table-changes/{table}", get(handlers::table_changes))
        .route("/p2p/apply-changes/{table}", post(handlers::apply_changes))
        .route("/p2p/notify-changes", post(handlers::notify_changes))
        .route("/p2p/peers", post(handlers::add_peer))
        .route("/p2p/peers/{peer_id}", delete(handlers::remove_peer))
        .route("/p2p/sync/bidirectional", post(handlers::bidirectional_sync))
        .route("/p2p/sync-status", get(handlers::sync_status))
        .route("/p2p/config", get(handlers::config))
        .route("/p2p/discovery/refresh", post(handlers::refresh_discovery));

    if state.config.enable_websocket_sync {
        routes = routes.route("/p2p/ws", get(ws::ws_handler));
    }

    routes.with_state(state).layer(TraceLayer::new_for_http())
}
