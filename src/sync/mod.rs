//! Replication between nodes.
//!
//! - [`conflict`]: last-writer-wins resolution for one incoming row
//! - [`protocol`]: JSON bodies of the `/p2p` API and discovery datagrams
//! - [`client`]: HTTP client for peer endpoints
//! - [`status`]: round bookkeeping
//! - [`engine`]: the [`SyncEngine`] running rounds against peers

pub mod client;
pub mod conflict;
pub mod engine;
pub mod protocol;
pub mod status;

pub use client::{PeerClient, PeerError};
pub use conflict::{resolve, Resolution};
pub use engine::{ApplyReport, SyncEngine, SyncError};
pub use status::{SyncRoundStatus, TableOutcome, Trigger};
