use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DraftStatus {
    Ingested,
    RedReady,
    Skipped,
    Posted,
}

impl DraftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DraftStatus::Ingested => "INGESTED",
            DraftStatus::RedReady => "RED_READY",
            DraftStatus::Skipped => "SKIPPED",
            DraftStatus::Posted => "POSTED",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "INGESTED" => Some(DraftStatus::Ingested),
            "RED_READY" => Some(DraftStatus::RedReady),
            "SKIPPED" => Some(DraftStatus::Skipped),
            "POSTED" => Some(DraftStatus::Posted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DraftStatus::Skipped | DraftStatus::Posted)
    }
}

impl fmt::Display for DraftStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a draft ended up in `SKIPPED`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    EmptyContent,
    Moderator,
    EditorFailed,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::EmptyContent => "empty_content",
            SkipReason::Moderator => "moderator",
            SkipReason::EditorFailed => "editor_failed",
        }
    }

    pub fn parse_reason(s: &str) -> Option<Self> {
        match s {
            "empty_content" => Some(SkipReason::EmptyContent),
            "moderator" => Some(SkipReason::Moderator),
            "editor_failed" => Some(SkipReason::EditorFailed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Workspace {
    pub id: String,
    pub title: String,
    pub tg_group_chat_id: i64,
    pub ingest_thread_id: Option<i32>,
    pub review_thread_id: Option<i32>,
    pub publish_channel: Option<String>,
    pub gpt_profile: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Source {
    pub workspace_id: String,
    pub id: String,
    pub tg_entity: String,
    pub enabled: bool,
    pub last_message_id: i64,
    pub last_message_date: i64,
    pub bootstrapped: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Draft {
    pub workspace_id: String,
    pub id: String,
    pub source_id: String,
    pub origin_chat: String,
    pub origin_message_id: i64,
    pub origin_message_date: i64,
    pub origin_text: String,
    pub has_media: bool,
    pub red_text: Option<String>,
    pub status: DraftStatus,
    pub skip_reason: Option<SkipReason>,
    pub ingest_message_id: Option<i32>,
    pub review_message_id: Option<i32>,
    pub trace_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Draft {
    /// Text to publish: the edited version when present, the origin otherwise.
    pub fn publish_text(&self) -> &str {
        self.red_text
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(&self.origin_text)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishedRecord {
    pub workspace_id: String,
    pub draft_id: String,
    pub target_chat: String,
    pub channel_message_id: i32,
    pub created_at: i64,
}

/// Bus payload for one origin message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryEvent {
    /// Empty means the receiving service's own workspace.
    #[serde(default)]
    pub workspace_id: String,
    pub source_id: String,
    pub origin_message_id: i64,
    #[serde(default)]
    pub origin_text: String,
    #[serde(default)]
    pub origin_chat: String,
    #[serde(default)]
    pub origin_message_date: i64,
    #[serde(default)]
    pub has_media: bool,
    #[serde(default)]
    pub trace_id: String,
}

impl DeliveryEvent {
    /// Bus ordering key; redelivery and ordering are scoped per origin message.
    pub fn ordering_key(&self) -> String {
        format!("{}:{}", self.source_id, self.origin_message_id)
    }

    pub fn draft_id(&self) -> String {
        draft_id(&self.source_id, self.origin_message_id)
    }

    pub fn has_content(&self) -> bool {
        self.has_media || !self.origin_text.trim().is_empty()
    }
}

/// Deterministic draft key; one draft per origin message.
pub fn draft_id(source_id: &str, origin_message_id: i64) -> String {
    format!("{}-{}", source_id, origin_message_id)
}

/// Moderator actions carried by inline-keyboard callbacks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DraftAction {
    Redact,
    Post,
    Skip,
}

impl DraftAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DraftAction::Redact => "redact",
            DraftAction::Post => "post",
            DraftAction::Skip => "skip",
        }
    }

    pub fn parse_action(s: &str) -> Option<Self> {
        match s {
            "redact" => Some(DraftAction::Redact),
            "post" => Some(DraftAction::Post),
            "skip" => Some(DraftAction::Skip),
            _ => None,
        }
    }
}

impl fmt::Display for DraftAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
