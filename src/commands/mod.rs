mod changes;
mod config_cmd;
mod peers;
mod status;
mod sync_cmd;

pub use changes::ChangesCommand;
pub use config_cmd::ConfigCommand;
pub use peers::PeersCommand;
pub use status::StatusCommand;
pub use sync_cmd::SyncCommand;

use clap::ValueEnum;
use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Errors from commands that talk to a running node.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Request to node failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Node answered {status}: {message}")]
    Api { status: u16, message: String },
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Thin client for a node's `/p2p` API.
pub struct NodeApi {
    base_url: String,
    http: reqwest::Client,
}

impl NodeApi {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, CommandError> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, CommandError> {
        let mut request = self.http.post(format!("{}{}", self.base_url, path));
        if let Some(body) = body {
            request = request.json(body);
        }
        Self::decode(request.send().await?).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, CommandError> {
        let response = self
            .http
            .delete(format!("{}{}", self.base_url, path))
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, CommandError> {
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            let message = serde_json::from_str::<serde_json::Value>(&text)
                .ok()
                .and_then(|v| v["message"].as_str().map(String::from))
                .unwrap_or(text);
            return Err(CommandError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(serde_json::from_str(&text)?)
    }
}
