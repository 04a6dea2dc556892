//! Request handlers for the `/p2p` API.
//!
//! Handlers are thin: they validate input, call into the engine, registry
//! or discovery, and shape the JSON response.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::Utc;
use serde::Deserialize;

use super::{ApiError, AppState};
use crate::config::NodeConfig;
use crate::events::SyncEvent;
use crate::registry::{PeerRecord, PeerStatus};
use crate::store::timestamp;
use crate::sync::protocol::{
    AddPeerRequest, ApplyChangesRequest, ApplyChangesResponse, BidirectionalResponse, ChangeFeed,
    NotifyChangesRequest, NotifyChangesResponse, PeerResponse, StatusResponse, SyncConfigSummary,
    SyncStatusReport,
};
use crate::sync::Trigger;

/// Builds the status document, shared with the WebSocket channel. Only
/// active peers are reported.
pub fn status_response(state: &AppState) -> StatusResponse {
    let peers = state.registry.active_peers();
    StatusResponse {
        node_id: state.config.node_id.clone(),
        status: PeerStatus::Active,
        peer_count: peers.len(),
        peers,
        sync_config: SyncConfigSummary::from(state.config.as_ref()),
        protocol_version: state.config.protocol_version.clone(),
        timestamp: timestamp::format(&Utc::now()),
    }
}

pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(status_response(&state))
}

#[derive(Debug, Deserialize)]
pub struct SinceQuery {
    pub since: Option<String>,
}

pub async fn table_changes(
    State(state): State<AppState>,
    Path(table): Path<String>,
    Query(query): Query<SinceQuery>,
) -> Result<Json<ChangeFeed>, ApiError> {
    let schema = state.engine.table(&table)?;

    let since = match query.since.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(
            timestamp::parse(raw)
                .map_err(|e| ApiError::BadRequest(format!("invalid 'since': {}", e)))?,
        ),
    };

    let set = state.engine.local_changes(schema, since).await?;
    tracing::debug!("Serving {} {} change(s) since {:?}", set.len(), table, since);
    Ok(Json(ChangeFeed::from_change_set(&set)))
}

pub async fn apply_changes(
    State(state): State<AppState>,
    Path(table): Path<String>,
    Json(request): Json<ApplyChangesRequest>,
) -> Result<Json<ApplyChangesResponse>, ApiError> {
    let schema = state.engine.table(&table)?;
    if request.table != table {
        return Err(ApiError::BadRequest(format!(
            "body is for table '{}', path names '{}'",
            request.table, table
        )));
    }

    let report = state
        .engine
        .apply_rows(schema, &request.data, &request.source_node)
        .await;

    tracing::info!(
        "Applied {} of {} {} row(s) from {} ({} conflict(s), {} skipped)",
        report.applied,
        request.data.len(),
        table,
        request.source_node,
        report.conflicts,
        report.skipped
    );

    Ok(Json(ApplyChangesResponse {
        message: format!("Applied {} changes to {}", report.applied, table),
        table,
        rows_affected: report.applied,
        conflicts: report.conflicts,
        skipped: report.skipped,
        source_peer: request.source_node,
    }))
}

pub async fn notify_changes(
    State(state): State<AppState>,
    Json(request): Json<NotifyChangesRequest>,
) -> Result<Json<NotifyChangesResponse>, ApiError> {
    let (Some(source_peer), Some(tables)) = (request.source_peer, request.tables) else {
        return Err(ApiError::BadRequest(
            "source_peer and tables are required".into(),
        ));
    };

    tracing::info!("Change notification from {} for {:?}", source_peer, tables);
    let sync_triggered = state.engine.handle_notification(&source_peer, &tables);

    Ok(Json(NotifyChangesResponse {
        message: format!("Received change notification from {}", source_peer),
        tables,
        sync_triggered,
    }))
}

pub async fn add_peer(
    State(state): State<AppState>,
    Json(request): Json<AddPeerRequest>,
) -> Result<Json<PeerResponse>, ApiError> {
    if request.peer_id.trim().is_empty() || request.host.trim().is_empty() {
        return Err(ApiError::BadRequest("peer_id and host are required".into()));
    }

    let mut record = PeerRecord::new(request.peer_id, request.host, request.port);
    record.protocol_version = request
        .protocol_version
        .unwrap_or_else(|| state.config.protocol_version.clone());

    let peer = state.registry.add_or_update(record)?;
    tracing::info!("Manually added peer {} at {}", peer.peer_id, peer.base_url());
    state.events.publish(SyncEvent::PeerAdmitted {
        peer_id: peer.peer_id.clone(),
        host: peer.host.clone(),
        port: peer.port,
    });

    Ok(Json(PeerResponse {
        message: format!("Peer {} added", peer.peer_id),
        peer,
    }))
}

pub async fn remove_peer(
    State(state): State<AppState>,
    Path(peer_id): Path<String>,
) -> Result<Json<PeerResponse>, ApiError> {
    let peer = state
        .registry
        .remove(&peer_id)
        .ok_or_else(|| ApiError::NotFound(format!("peer '{}' not found", peer_id)))?;

    tracing::info!("Removed peer {}", peer_id);
    Ok(Json(PeerResponse {
        message: format!("Peer {} removed", peer_id),
        peer,
    }))
}

#[derive(Debug, Deserialize)]
pub struct BidirectionalQuery {
    pub peer_id: Option<String>,
}

pub async fn bidirectional_sync(
    State(state): State<AppState>,
    Query(query): Query<BidirectionalQuery>,
) -> Result<Json<BidirectionalResponse>, ApiError> {
    state.events.publish(SyncEvent::BidirectionalSyncTriggered {
        peer_id: query.peer_id.clone(),
    });

    let round = match query.peer_id.as_deref() {
        Some(peer_id) => state.engine.sync_peer(Trigger::Manual, peer_id).await?,
        None => state.engine.sync_with_peers(Trigger::Manual).await,
    };

    let message = match &query.peer_id {
        Some(peer_id) => format!("Bidirectional sync with {} completed", peer_id),
        None => format!(
            "Bidirectional sync with {} peer(s) completed",
            round.peers_contacted.len()
        ),
    };

    Ok(Json(BidirectionalResponse {
        message,
        peers: round.peers_contacted.clone(),
        round,
    }))
}

pub async fn sync_status(State(state): State<AppState>) -> Json<SyncStatusReport> {
    Json(state.engine.status_report())
}

pub async fn config(State(state): State<AppState>) -> Json<NodeConfig> {
    Json(state.config.as_ref().clone())
}

pub async fn refresh_discovery(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.discovery.broadcast_presence().await?;
    Ok(Json(serde_json::json!({
        "message": "Presence announced",
        "discovered_peers": state.discovery.discovered_peers(),
    })))
}
