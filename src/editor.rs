//! Language-model editor used by the redact transition.
use crate::config;
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_PROFILE: &str = "default";

const DEFAULT_PROMPT: &str = "You are the editor of a news digest channel. Rewrite the post \
you are given as a short, neutral news item in the language of the original. Keep every \
figure, date and name exactly as written. Do not add facts, opinions, hashtags or emoji. \
Reply with the rewritten post only.";

#[derive(Debug, Error)]
pub enum EditorError {
    #[error("editor request failed: {0}")]
    Request(String),
    #[error("editor returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("editor returned no text")]
    Empty,
    #[error("editor timed out after {0:?}")]
    Timeout(Duration),
}

/// Rewritten text plus what produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redaction {
    pub text: String,
    pub model: String,
    pub tokens: Option<u32>,
}

#[async_trait]
pub trait Editor: Send + Sync {
    async fn redact(&self, text: &str, prompt: &str) -> Result<Redaction, EditorError>;
}

/// Named system prompts. Always contains [`DEFAULT_PROFILE`].
#[derive(Debug, Clone)]
pub struct Profiles {
    prompts: BTreeMap<String, String>,
}

impl Profiles {
    pub fn new(configured: &BTreeMap<String, String>) -> Self {
        let mut prompts = BTreeMap::new();
        prompts.insert(DEFAULT_PROFILE.to_string(), DEFAULT_PROMPT.to_string());
        for (name, prompt) in configured {
            if prompt.trim().is_empty() {
                warn!(profile = %name, "ignoring empty editor profile");
                continue;
            }
            prompts.insert(name.clone(), prompt.clone());
        }
        Self { prompts }
    }

    /// Prompt for `name`; unknown names fall back to the default profile.
    pub fn prompt(&self, name: Option<&str>) -> &str {
        if let Some(name) = name.filter(|n| !n.trim().is_empty()) {
            if let Some(prompt) = self.prompts.get(name) {
                return prompt;
            }
            warn!(profile = name, "editor profile missing, using default");
        }
        self.prompts
            .get(DEFAULT_PROFILE)
            .map(String::as_str)
            .unwrap_or(DEFAULT_PROMPT)
    }
}

impl Default for Profiles {
    fn default() -> Self {
        Self::new(&BTreeMap::new())
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    total_tokens: u32,
}

/// Chat-completions client.
#[derive(Clone)]
pub struct OpenAiEditor {
    http: Client,
    endpoint: Url,
    api_key: String,
    model: String,
}

impl fmt::Debug for OpenAiEditor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiEditor")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl OpenAiEditor {
    pub fn from_config(cfg: &config::Editor) -> Result<Self, EditorError> {
        let base = Url::parse(&cfg.base_url).map_err(|e| EditorError::Request(e.to_string()))?;
        let endpoint = base
            .join("v1/chat/completions")
            .map_err(|e| EditorError::Request(e.to_string()))?;
        let http = Client::builder()
            .user_agent("tg-curator/0.1")
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| EditorError::Request(e.to_string()))?;
        Ok(Self {
            http,
            endpoint,
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
        })
    }
}

fn extract_redaction(payload: ChatResponse, fallback_model: &str) -> Result<Redaction, EditorError> {
    let text = payload
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or(EditorError::Empty)?;
    let model = if payload.model.is_empty() {
        fallback_model.to_string()
    } else {
        payload.model
    };
    Ok(Redaction {
        text,
        model,
        tokens: payload.usage.map(|u| u.total_tokens),
    })
}

#[async_trait]
impl Editor for OpenAiEditor {
    async fn redact(&self, text: &str, prompt: &str) -> Result<Redaction, EditorError> {
        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: prompt,
                },
                ChatMessage {
                    role: "user",
                    content: text,
                },
            ],
            temperature: 0.2,
        };
        let res = self
            .http
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| EditorError::Request(e.to_string()))?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(EditorError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let payload: ChatResponse = res
            .json()
            .await
            .map_err(|e| EditorError::Request(format!("invalid editor response: {}", e)))?;
        let redaction = extract_redaction(payload, &self.model)?;
        debug!(model = %redaction.model, tokens = ?redaction.tokens, "editor produced text");
        Ok(redaction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_fall_back_to_default() {
        let mut configured = BTreeMap::new();
        configured.insert("short".to_string(), "Two sentences.".to_string());
        configured.insert("blank".to_string(), "  ".to_string());
        let profiles = Profiles::new(&configured);

        assert_eq!(profiles.prompt(Some("short")), "Two sentences.");
        assert_eq!(profiles.prompt(Some("missing")), DEFAULT_PROMPT);
        assert_eq!(profiles.prompt(Some("blank")), DEFAULT_PROMPT);
        assert_eq!(profiles.prompt(None), DEFAULT_PROMPT);
    }

    #[test]
    fn configured_default_overrides_builtin() {
        let mut configured = BTreeMap::new();
        configured.insert(DEFAULT_PROFILE.to_string(), "House style.".to_string());
        assert_eq!(Profiles::new(&configured).prompt(None), "House style.");
    }

    #[test]
    fn response_text_is_extracted() {
        let payload: ChatResponse = serde_json::from_str(
            r#"{"model":"gpt-4o-mini-2024","choices":[{"message":{"content":"  Rate up.  "}}],"usage":{"total_tokens":42}}"#,
        )
        .unwrap();
        let r = extract_redaction(payload, "gpt-4o-mini").unwrap();
        assert_eq!(r.text, "Rate up.");
        assert_eq!(r.model, "gpt-4o-mini-2024");
        assert_eq!(r.tokens, Some(42));

        let empty: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":""}}]}"#).unwrap();
        assert!(matches!(extract_redaction(empty, "m"), Err(EditorError::Empty)));
    }
}
