//! Source-reading capability: yields messages of a named public channel.
//!
//! The shipped adapter talks to a JSON gateway in front of the MTProto user
//! client; rate limiting surfaces as [`SourceError::FloodWait`].
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const DEFAULT_FLOOD_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceMessage {
    pub id: i64,
    /// Unix seconds.
    #[serde(default)]
    pub date: i64,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub has_media: bool,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("flood wait of {0:?} requested by source API")]
    FloodWait(Duration),
    #[error("channel {0} not found")]
    NotFound(String),
    #[error("source request failed: {0}")]
    Request(String),
}

#[async_trait]
pub trait SourceClient: Send + Sync {
    /// The newest `limit` messages of `entity`.
    async fn latest(&self, entity: &str, limit: u32) -> Result<Vec<SourceMessage>, SourceError>;

    /// Up to `limit` messages with id strictly greater than `after_id`.
    async fn after(
        &self,
        entity: &str,
        after_id: i64,
        limit: u32,
    ) -> Result<Vec<SourceMessage>, SourceError>;
}

#[derive(Clone)]
pub struct HttpSourceClient {
    http: Client,
    base_url: Url,
    token: Option<String>,
}

impl fmt::Debug for HttpSourceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSourceClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    messages: Vec<SourceMessage>,
}

impl HttpSourceClient {
    pub fn new(base_url: Url, token: Option<String>) -> Result<Self, SourceError> {
        let http = Client::builder()
            .user_agent("tg-curator/0.1")
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SourceError::Request(e.to_string()))?;
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    fn messages_url(&self, entity: &str) -> Result<Url, SourceError> {
        let handle = entity.trim().trim_start_matches('@');
        self.base_url
            .join(&format!("v1/channels/{}/messages", handle))
            .map_err(|e| SourceError::Request(format!("invalid source URL: {}", e)))
    }

    async fn fetch(&self, entity: &str, query: &[(&str, String)]) -> Result<Vec<SourceMessage>, SourceError> {
        let url = self.messages_url(entity)?;
        let mut req = self.http.get(url).query(query);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let res = req
            .send()
            .await
            .map_err(|e| SourceError::Request(e.to_string()))?;

        match res.status() {
            StatusCode::TOO_MANY_REQUESTS => {
                let wait = res
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_FLOOD_WAIT);
                warn!(entity, ?wait, "source API flood wait");
                Err(SourceError::FloodWait(wait))
            }
            StatusCode::NOT_FOUND => Err(SourceError::NotFound(entity.to_string())),
            status if !status.is_success() => {
                let body = res.text().await.unwrap_or_default();
                Err(SourceError::Request(format!("status {}: {}", status, body)))
            }
            _ => {
                let payload: MessagesResponse = res
                    .json()
                    .await
                    .map_err(|e| SourceError::Request(format!("invalid response JSON: {}", e)))?;
                debug!(entity, count = payload.messages.len(), "fetched source messages");
                Ok(payload.messages)
            }
        }
    }
}

#[async_trait]
impl SourceClient for HttpSourceClient {
    async fn latest(&self, entity: &str, limit: u32) -> Result<Vec<SourceMessage>, SourceError> {
        self.fetch(entity, &[("limit", limit.to_string()), ("order", "desc".into())])
            .await
    }

    async fn after(
        &self,
        entity: &str,
        after_id: i64,
        limit: u32,
    ) -> Result<Vec<SourceMessage>, SourceError> {
        self.fetch(
            entity,
            &[
                ("after_id", after_id.to_string()),
                ("limit", limit.to_string()),
                ("order", "asc".into()),
            ],
        )
        .await
    }
}
