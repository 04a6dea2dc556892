//! JSON bodies exchanged between peers.
//!
//! Rows travel as plain JSON objects so that nodes built on different stores
//! can interoperate; they are decoded against the schema registry on arrival.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use std::collections::BTreeMap;

use crate::config::NodeConfig;
use crate::registry::{PeerRecord, PeerStatus};
use crate::store::{timestamp, Change, ChangeKind, ChangeSet, Row, SchemaError, SyncType, TableSchema};

use super::status::{SyncCursor, SyncRoundStatus};

/// Field attached to each row of a change feed.
pub const CHANGE_TYPE_FIELD: &str = "change_type";

/// `GET /p2p/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub status: PeerStatus,
    pub peer_count: usize,
    pub peers: Vec<PeerRecord>,
    pub sync_config: SyncConfigSummary,
    pub protocol_version: String,
    pub timestamp: String,
}

/// Replication settings advertised in the status response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfigSummary {
    pub sync_interval: u64,
    pub sync_tables: Vec<String>,
    pub max_peers: usize,
    pub enable_auto_discovery: bool,
    pub enable_websocket_sync: bool,
}

impl From<&NodeConfig> for SyncConfigSummary {
    fn from(config: &NodeConfig) -> Self {
        Self {
            sync_interval: config.sync_interval,
            sync_tables: config.sync_tables.clone(),
            max_peers: config.max_peers,
            enable_auto_discovery: config.enable_auto_discovery,
            enable_websocket_sync: config.enable_websocket_sync,
        }
    }
}

/// `GET /p2p/table-changes/{table}` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeFeed {
    pub table: String,
    pub data: Vec<Map<String, Json>>,
    /// When the feed was generated.
    pub timestamp: String,
    pub count: usize,
    pub since: Option<String>,
    /// Resume point for the next request, in the serving node's clock.
    /// Absent when the feed covers an empty table; a peer that omits it
    /// is always read in full.
    #[serde(default)]
    pub watermark: Option<String>,
    pub sync_type: SyncType,
}

/// A change feed that could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("feed is for table '{found}', expected '{expected}'")]
    WrongTable { expected: String, found: String },
    #[error("invalid timestamp '{0}'")]
    Timestamp(String),
    #[error("row {index}: {source}")]
    Row {
        index: usize,
        #[source]
        source: SchemaError,
    },
}

impl ChangeFeed {
    pub fn from_change_set(set: &ChangeSet) -> Self {
        let data = set
            .changes
            .iter()
            .map(|change| {
                let mut object = change.row.to_json();
                object.insert(
                    CHANGE_TYPE_FIELD.to_string(),
                    Json::String(change.kind.to_string()),
                );
                object
            })
            .collect::<Vec<_>>();

        Self {
            table: set.table.name.to_string(),
            count: data.len(),
            data,
            timestamp: timestamp::format(&set.generated_at),
            since: set.since.as_ref().map(timestamp::format),
            watermark: set.watermark.as_ref().map(timestamp::format),
            sync_type: set.sync_type,
        }
    }

    /// Decodes every row against `table`. Any bad row rejects the whole feed.
    pub fn into_change_set(self, table: &'static TableSchema) -> Result<ChangeSet, FeedError> {
        if self.table != table.name {
            return Err(FeedError::WrongTable {
                expected: table.name.to_string(),
                found: self.table,
            });
        }

        let generated_at = timestamp::parse(&self.timestamp)
            .map_err(|_| FeedError::Timestamp(self.timestamp.clone()))?;
        let since = parse_optional(self.since.as_deref())?;
        let watermark = parse_optional(self.watermark.as_deref())?;

        let changes = self
            .data
            .iter()
            .enumerate()
            .map(|(index, object)| {
                let row = Row::from_json(table, object)
                    .map_err(|source| FeedError::Row { index, source })?;
                Ok(Change {
                    kind: change_kind(object),
                    row,
                })
            })
            .collect::<Result<Vec<_>, FeedError>>()?;

        Ok(ChangeSet {
            table,
            changes,
            since,
            generated_at,
            watermark,
            sync_type: self.sync_type,
        })
    }
}

fn parse_optional(text: Option<&str>) -> Result<Option<DateTime<Utc>>, FeedError> {
    text.map(|s| timestamp::parse(s).map_err(|_| FeedError::Timestamp(s.to_string())))
        .transpose()
}

fn change_kind(object: &Map<String, Json>) -> ChangeKind {
    match object.get(CHANGE_TYPE_FIELD).and_then(Json::as_str) {
        Some("INSERT") => ChangeKind::Insert,
        _ => ChangeKind::Update,
    }
}

/// `POST /p2p/apply-changes/{table}` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyChangesRequest {
    pub table: String,
    pub data: Vec<Map<String, Json>>,
    pub count: usize,
    pub source_node: String,
    pub sync_timestamp: String,
    #[serde(default)]
    pub sync_type: Option<SyncType>,
}

impl ApplyChangesRequest {
    pub fn new(set: &ChangeSet, source_node: &str) -> Self {
        let feed = ChangeFeed::from_change_set(set);
        Self {
            table: feed.table,
            count: feed.count,
            data: feed.data,
            source_node: source_node.to_string(),
            sync_timestamp: feed.timestamp,
            sync_type: Some(feed.sync_type),
        }
    }
}

/// `POST /p2p/apply-changes/{table}` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplyChangesResponse {
    pub message: String,
    pub table: String,
    pub rows_affected: usize,
    pub conflicts: usize,
    pub skipped: usize,
    pub source_peer: String,
}

/// `POST /p2p/notify-changes` body. Fields are optional so that a missing
/// field is reported as a bad request rather than a decoding failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyChangesRequest {
    pub source_peer: Option<String>,
    pub tables: Option<Vec<String>>,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyChangesResponse {
    pub message: String,
    pub tables: Vec<String>,
    pub sync_triggered: bool,
}

/// `POST /p2p/peers` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddPeerRequest {
    pub peer_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub protocol_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerResponse {
    pub message: String,
    pub peer: PeerRecord,
}

/// `POST /p2p/sync/bidirectional` response.
#[derive(Debug, Clone, Serialize)]
pub struct BidirectionalResponse {
    pub message: String,
    pub peers: Vec<String>,
    pub round: SyncRoundStatus,
}

/// `GET /p2p/sync-status` response.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatusReport {
    pub sync_running: bool,
    pub last_round: Option<SyncRoundStatus>,
    /// Pull and push cursors per peer and table.
    pub peer_sync_times: BTreeMap<String, BTreeMap<String, SyncCursor>>,
    pub active_peers: usize,
}

/// Presence announcement broadcast over UDP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    pub peer_id: String,
    pub host: String,
    pub api_port: u16,
    pub last_seen: DateTime<Utc>,
    pub protocol_version: String,
    pub status: PeerStatus,
}

impl Announcement {
    /// Registry record for the announcing peer.
    pub fn to_record(&self) -> PeerRecord {
        PeerRecord {
            peer_id: self.peer_id.clone(),
            host: self.host.clone(),
            port: self.api_port,
            last_seen: self.last_seen,
            protocol_version: self.protocol_version.clone(),
            status: PeerStatus::Active,
        }
    }
}

/// Datagrams on the discovery port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscoveryMessage {
    Announce(Announcement),
}
