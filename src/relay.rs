//! Bus contract: publishing delivery events and validating pushed envelopes.
use crate::model::DeliveryEvent;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("publish request failed: {0}")]
    Request(String),
    #[error("bus rejected publish with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish one event; returns the bus message id.
    async fn publish(&self, event: &DeliveryEvent, ordering_key: &str) -> Result<String, PublishError>;
}

/// Base64 of the event's JSON form, as carried in `message.data`.
pub fn encode_event(event: &DeliveryEvent) -> Result<String, serde_json::Error> {
    Ok(STANDARD.encode(serde_json::to_vec(event)?))
}

/// Publishes through the Pub/Sub REST `topics.publish` endpoint.
#[derive(Clone)]
pub struct PubSubPublisher {
    http: Client,
    publish_url: Url,
    access_token: Option<String>,
}

impl fmt::Debug for PubSubPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSubPublisher")
            .field("publish_url", &self.publish_url)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct PublishResponse {
    #[serde(default, rename = "messageIds")]
    message_ids: Vec<String>,
}

impl PubSubPublisher {
    pub fn new(publish_url: Url, access_token: Option<String>) -> Result<Self, PublishError> {
        let http = Client::builder()
            .user_agent("tg-curator/0.1")
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PublishError::Request(e.to_string()))?;
        Ok(Self {
            http,
            publish_url,
            access_token,
        })
    }

    pub fn build_body(event: &DeliveryEvent, ordering_key: &str) -> Result<Value, PublishError> {
        Ok(json!({
            "messages": [
                {
                    "data": encode_event(event)?,
                    "orderingKey": ordering_key,
                    "attributes": {
                        "trace_id": event.trace_id,
                        "workspace_id": event.workspace_id,
                    }
                }
            ]
        }))
    }
}

#[async_trait]
impl Publisher for PubSubPublisher {
    #[instrument(skip_all, fields(ordering_key, trace_id = %event.trace_id))]
    async fn publish(&self, event: &DeliveryEvent, ordering_key: &str) -> Result<String, PublishError> {
        let body = Self::build_body(event, ordering_key)?;
        let mut req = self.http.post(self.publish_url.clone()).json(&body);
        if let Some(token) = &self.access_token {
            req = req.bearer_auth(token);
        }
        let res = req
            .send()
            .await
            .map_err(|e| PublishError::Request(e.to_string()))?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(PublishError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        let payload: PublishResponse = res
            .json()
            .await
            .map_err(|e| PublishError::Request(format!("invalid publish response: {}", e)))?;
        let message_id = payload.message_ids.into_iter().next().unwrap_or_default();
        debug!(ordering_key, %message_id, "published delivery event");
        Ok(message_id)
    }
}

/// Why a pushed envelope was acknowledged without processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("envelope is not a JSON object")]
    InvalidEnvelope,
    #[error("envelope has no message")]
    MissingMessage,
    #[error("message has no data")]
    MissingData,
    #[error("message data is not base64")]
    InvalidBase64,
    #[error("decoded payload is empty")]
    EmptyPayload,
    #[error("decoded payload is not a delivery event")]
    MalformedJson,
    #[error("delivery event has no source_id")]
    MissingSourceId,
    #[error("delivery event has no origin_message_id")]
    MissingOriginMessageId,
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::InvalidEnvelope => "invalid_envelope",
            RejectReason::MissingMessage => "missing_message",
            RejectReason::MissingData => "missing_data",
            RejectReason::InvalidBase64 => "invalid_base64",
            RejectReason::EmptyPayload => "empty_payload",
            RejectReason::MalformedJson => "malformed_json",
            RejectReason::MissingSourceId => "missing_source_id",
            RejectReason::MissingOriginMessageId => "missing_origin_message_id",
        }
    }
}

/// A validated push delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushedEvent {
    pub bus_message_id: Option<String>,
    pub event: DeliveryEvent,
}

/// Validate a push body before trusting any of it.
pub fn decode_push(body: &[u8]) -> Result<PushedEvent, RejectReason> {
    let envelope: Value = serde_json::from_slice(body).map_err(|_| RejectReason::InvalidEnvelope)?;
    let envelope = envelope.as_object().ok_or(RejectReason::InvalidEnvelope)?;
    let message = envelope
        .get("message")
        .and_then(Value::as_object)
        .ok_or(RejectReason::MissingMessage)?;
    let bus_message_id = message
        .get("messageId")
        .or_else(|| message.get("message_id"))
        .and_then(Value::as_str)
        .map(str::to_owned);

    let data = message
        .get("data")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .ok_or(RejectReason::MissingData)?;
    let decoded = STANDARD
        .decode(data)
        .map_err(|_| RejectReason::InvalidBase64)?;
    if decoded.iter().all(u8::is_ascii_whitespace) {
        return Err(RejectReason::EmptyPayload);
    }

    let payload: Value = serde_json::from_slice(&decoded).map_err(|_| RejectReason::MalformedJson)?;
    let fields = payload.as_object().ok_or(RejectReason::MalformedJson)?;
    if !fields
        .get("source_id")
        .and_then(Value::as_str)
        .is_some_and(|s| !s.trim().is_empty())
    {
        return Err(RejectReason::MissingSourceId);
    }
    if !fields
        .get("origin_message_id")
        .and_then(Value::as_i64)
        .is_some_and(|id| id > 0)
    {
        return Err(RejectReason::MissingOriginMessageId);
    }

    let event: DeliveryEvent =
        serde_json::from_value(payload).map_err(|_| RejectReason::MalformedJson)?;
    Ok(PushedEvent {
        bus_message_id,
        event,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> DeliveryEvent {
        DeliveryEvent {
            workspace_id: "ws".into(),
            source_id: "nbu".into(),
            origin_message_id: 101,
            origin_text: "Ukraine raises rate".into(),
            origin_chat: "@nbu_ua".into(),
            origin_message_date: 1_700_000_000,
            has_media: false,
            trace_id: "trace-1".into(),
        }
    }

    fn push_body(data: Value) -> Vec<u8> {
        serde_json::to_vec(&json!({ "message": { "data": data, "messageId": "m-1" } })).unwrap()
    }

    #[test]
    fn valid_push_decodes() {
        let body = push_body(json!(encode_event(&event()).unwrap()));
        let pushed = decode_push(&body).unwrap();
        assert_eq!(pushed.event, event());
        assert_eq!(pushed.bus_message_id.as_deref(), Some("m-1"));
    }

    #[test]
    fn each_malformed_shape_has_its_own_reason() {
        let b64 = |s: &str| json!(STANDARD.encode(s));
        let cases: Vec<(Vec<u8>, RejectReason)> = vec![
            (b"not json".to_vec(), RejectReason::InvalidEnvelope),
            (b"[1,2]".to_vec(), RejectReason::InvalidEnvelope),
            (b"{}".to_vec(), RejectReason::MissingMessage),
            (push_body(Value::Null), RejectReason::MissingData),
            (push_body(json!("")), RejectReason::MissingData),
            (push_body(json!("%%%not-base64%%%")), RejectReason::InvalidBase64),
            (push_body(b64("   ")), RejectReason::EmptyPayload),
            (push_body(b64("{broken")), RejectReason::MalformedJson),
            (push_body(b64("[]")), RejectReason::MalformedJson),
            (
                push_body(b64(r#"{"workspace_id":"ws","origin_message_id":1}"#)),
                RejectReason::MissingSourceId,
            ),
            (
                push_body(b64(r#"{"workspace_id":"ws","source_id":"nbu"}"#)),
                RejectReason::MissingOriginMessageId,
            ),
            (
                push_body(b64(r#"{"workspace_id":"ws","source_id":"nbu","origin_message_id":"x"}"#)),
                RejectReason::MissingOriginMessageId,
            ),
            (
                push_body(b64(r#"{"workspace_id":5,"source_id":"nbu","origin_message_id":3}"#)),
                RejectReason::MalformedJson,
            ),
        ];
        for (body, expected) in cases {
            assert_eq!(decode_push(&body).unwrap_err(), expected);
        }
    }

    #[test]
    fn reason_codes_are_distinct() {
        let all = [
            RejectReason::InvalidEnvelope,
            RejectReason::MissingMessage,
            RejectReason::MissingData,
            RejectReason::InvalidBase64,
            RejectReason::EmptyPayload,
            RejectReason::MalformedJson,
            RejectReason::MissingSourceId,
            RejectReason::MissingOriginMessageId,
        ];
        let codes: std::collections::HashSet<_> = all.iter().map(|r| r.code()).collect();
        assert_eq!(codes.len(), all.len());
    }

    #[test]
    fn publish_body_carries_ordering_key() {
        let ev = event();
        let body = PubSubPublisher::build_body(&ev, &ev.ordering_key()).unwrap();
        let msg = &body["messages"][0];
        assert_eq!(msg["orderingKey"], "nbu:101");
        assert_eq!(msg["attributes"]["trace_id"], "trace-1");
        let data = STANDARD.decode(msg["data"].as_str().unwrap()).unwrap();
        let decoded: DeliveryEvent = serde_json::from_slice(&data).unwrap();
        assert_eq!(decoded, ev);
    }
}
