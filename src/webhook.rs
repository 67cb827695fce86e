//! Bot webhook payloads and the moderator inputs parsed out of them.
use crate::model::DraftAction;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

pub const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

static EDIT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^/edit(?:@[A-Za-z0-9_]+)?[ \t]+([A-Za-z0-9_\-]+)\s+(\S.*)$").expect("valid regex")
});

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    #[serde(default)]
    pub update_id: i64,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub from: Option<User>,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default)]
    pub message_thread_id: Option<i32>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub from: Option<User>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("callback data {0:?} is not a draft action")]
    NotDraftCallback(String),
    #[error("callback data has no draft id")]
    MissingDraftId,
    #[error("unknown draft action {0:?}")]
    UnknownAction(String),
    #[error("usage: /edit <draft_id> <text>")]
    EditUsage,
}

/// Moderator button press, decoded from `draft:<draft_id>:<action>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Callback {
    pub draft_id: String,
    pub action: DraftAction,
}

impl Callback {
    pub fn parse(data: &str) -> Result<Self, ParseError> {
        let rest = data
            .strip_prefix("draft:")
            .ok_or_else(|| ParseError::NotDraftCallback(data.to_string()))?;
        // Draft ids never contain ':' but source ids may contain '-'.
        let (draft_id, action) = rest.rsplit_once(':').ok_or(ParseError::MissingDraftId)?;
        if draft_id.is_empty() || draft_id.contains(':') {
            return Err(ParseError::MissingDraftId);
        }
        let action =
            DraftAction::parse_action(action).ok_or_else(|| ParseError::UnknownAction(action.to_string()))?;
        Ok(Self {
            draft_id: draft_id.to_string(),
            action,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Edit { draft_id: String, text: String },
}

impl Command {
    /// `Ok(None)` for text that is not a command this bot handles.
    pub fn parse(text: &str) -> Result<Option<Self>, ParseError> {
        let text = text.trim();
        let is_edit = text
            .strip_prefix("/edit")
            .is_some_and(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace) || rest.starts_with('@'));
        if !is_edit {
            return Ok(None);
        }
        let caps = EDIT_RE.captures(text).ok_or(ParseError::EditUsage)?;
        Ok(Some(Command::Edit {
            draft_id: caps[1].to_string(),
            text: caps[2].trim_end().to_string(),
        }))
    }
}

/// What an update asks the approver to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Callback { query_id: String, callback: Callback },
    Command { chat_id: i64, command: Command },
    Ignored,
}

/// Decode an update. Callback payloads that fail to parse carry the query
/// id back so the button press can still be answered.
pub fn classify(update: &Update) -> Result<Inbound, (Option<String>, ParseError)> {
    if let Some(query) = &update.callback_query {
        let data = query.data.as_deref().unwrap_or_default();
        return Callback::parse(data)
            .map(|callback| Inbound::Callback {
                query_id: query.id.clone(),
                callback,
            })
            .map_err(|e| (Some(query.id.clone()), e));
    }
    if let Some(message) = &update.message {
        if let Some(text) = message.text.as_deref() {
            return match Command::parse(text) {
                Ok(Some(command)) => Ok(Inbound::Command {
                    chat_id: message.chat.id,
                    command,
                }),
                Ok(None) => Ok(Inbound::Ignored),
                Err(e) => Err((None, e)),
            };
        }
    }
    Ok(Inbound::Ignored)
}
