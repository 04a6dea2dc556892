//! HTTP client for talking to peers.
//!
//! Every call carries its own timeout: probes are short, bulk change
//! transfers are allowed much longer since a full sync can be large.

use chrono::{DateTime, Utc};
use std::time::Duration;

use super::protocol::{ApplyChangesRequest, ApplyChangesResponse, ChangeFeed, NotifyChangesRequest};
use crate::registry::PeerRecord;
use crate::store::timestamp;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const FETCH_TIMEOUT: Duration = Duration::from_secs(60);
const PUSH_TIMEOUT: Duration = Duration::from_secs(120);
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur talking to a peer.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("peer answered {status}: {body}")]
    Status { status: u16, body: String },
}

impl PeerError {
    /// Whether the peer could not be reached at all.
    pub fn is_unreachable(&self) -> bool {
        match self {
            PeerError::Http(e) => e.is_connect() || e.is_timeout(),
            PeerError::Status { .. } => false,
        }
    }
}

/// Client for the `/p2p` API of other nodes.
#[derive(Debug, Clone, Default)]
pub struct PeerClient {
    http: reqwest::Client,
}

impl PeerClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// Builds the change-feed URL for a table.
    pub fn changes_url(base_url: &str, table: &str, since: Option<DateTime<Utc>>) -> String {
        let mut url = format!("{}/p2p/table-changes/{}", base_url, urlencoding::encode(table));
        if let Some(since) = since {
            url.push_str("?since=");
            url.push_str(&urlencoding::encode(&timestamp::format(&since)));
        }
        url
    }

    /// Reachability probe: `GET /p2p/status` answering 200. The body is not
    /// inspected.
    pub async fn check_reachable(&self, base_url: &str) -> Result<(), PeerError> {
        let response = self
            .http
            .get(format!("{}/p2p/status", base_url))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await?;
        let status = response.status();
        if status == reqwest::StatusCode::OK {
            return Ok(());
        }
        Err(PeerError::Status {
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        })
    }

    /// Fetches the peer's rows of `table` changed after `since`.
    pub async fn fetch_changes(
        &self,
        peer: &PeerRecord,
        table: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<ChangeFeed, PeerError> {
        let response = self
            .http
            .get(Self::changes_url(&peer.base_url(), table, since))
            .timeout(FETCH_TIMEOUT)
            .send()
            .await?;
        Self::expect_ok(response).await?.json().await.map_err(Into::into)
    }

    /// Pushes local changes to the peer's apply endpoint.
    pub async fn push_changes(
        &self,
        peer: &PeerRecord,
        request: &ApplyChangesRequest,
    ) -> Result<ApplyChangesResponse, PeerError> {
        let url = format!(
            "{}/p2p/apply-changes/{}",
            peer.base_url(),
            urlencoding::encode(&request.table)
        );
        let response = self
            .http
            .post(url)
            .json(request)
            .timeout(PUSH_TIMEOUT)
            .send()
            .await?;
        Self::expect_ok(response).await?.json().await.map_err(Into::into)
    }

    /// Tells the peer that `tables` changed here.
    pub async fn notify_changes(
        &self,
        peer: &PeerRecord,
        request: &NotifyChangesRequest,
    ) -> Result<(), PeerError> {
        let response = self
            .http
            .post(format!("{}/p2p/notify-changes", peer.base_url()))
            .json(request)
            .timeout(NOTIFY_TIMEOUT)
            .send()
            .await?;
        Self::expect_ok(response).await?;
        Ok(())
    }

    async fn expect_ok(response: reqwest::Response) -> Result<reqwest::Response, PeerError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(PeerError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_changes_url_without_since() {
        assert_eq!(
            PeerClient::changes_url("http://10.0.0.2:8000", "products", None),
            "http://10.0.0.2:8000/p2p/table-changes/products"
        );
    }

    #[test]
    fn test_changes_url_encodes_since() {
        let since = Utc.timestamp_opt(100, 0).unwrap();
        assert_eq!(
            PeerClient::changes_url("https://node.example.org", "users", Some(since)),
            "https://node.example.org/p2p/table-changes/users?since=1970-01-01T00%3A01%3A40.000000Z"
        );
    }

    #[tokio::test]
    async fn test_check_reachable_fails_for_closed_port() {
        // Bind then drop to get a port with nothing listening.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = PeerClient::new()
            .check_reachable(&format!("http://127.0.0.1:{}", port))
            .await
            .unwrap_err();
        assert!(err.is_unreachable());
    }
}
