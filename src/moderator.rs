//! Moderator-facing bot surface: sending, editing and deleting messages in
//! the workspace group and the publish channel.
use crate::model::{Draft, DraftAction};
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{
    InlineKeyboardButton, InlineKeyboardMarkup, MessageId, ParseMode, Recipient,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModeratorError {
    #[error("bot API request failed: {0}")]
    Api(String),
    #[error("invalid chat target {0:?}")]
    InvalidTarget(String),
}

impl From<teloxide::RequestError> for ModeratorError {
    fn from(err: teloxide::RequestError) -> Self {
        ModeratorError::Api(err.to_string())
    }
}

/// A chat addressed either by numeric id or by public `@username`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatTarget {
    Id(i64),
    Username(String),
}

impl ChatTarget {
    pub fn parse(raw: &str) -> Result<Self, ModeratorError> {
        let raw = raw.trim();
        if let Ok(id) = raw.parse::<i64>() {
            return Ok(ChatTarget::Id(id));
        }
        let name = raw.trim_start_matches('@');
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(ModeratorError::InvalidTarget(raw.to_string()));
        }
        Ok(ChatTarget::Username(format!("@{}", name)))
    }
}

impl From<ChatTarget> for Recipient {
    fn from(target: ChatTarget) -> Self {
        match target {
            ChatTarget::Id(id) => Recipient::Id(ChatId(id)),
            ChatTarget::Username(name) => Recipient::ChannelUsername(name),
        }
    }
}

/// Inline keyboard rows of `(label, callback_data)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keyboard {
    pub rows: Vec<Vec<(String, String)>>,
}

impl Keyboard {
    fn markup(&self) -> InlineKeyboardMarkup {
        InlineKeyboardMarkup::new(self.rows.iter().map(|row| {
            row.iter()
                .map(|(label, data)| InlineKeyboardButton::callback(label.clone(), data.clone()))
                .collect::<Vec<_>>()
        }))
    }
}

#[async_trait]
pub trait ModeratorApi: Send + Sync {
    /// Send an HTML message; returns the new message id.
    async fn send_message(
        &self,
        chat: &ChatTarget,
        thread_id: Option<i32>,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<i32, ModeratorError>;

    async fn edit_message(
        &self,
        chat: &ChatTarget,
        message_id: i32,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<(), ModeratorError>;

    async fn delete_message(&self, chat: &ChatTarget, message_id: i32) -> Result<(), ModeratorError>;

    async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<(), ModeratorError>;
}

#[derive(Debug, Clone)]
pub struct TelegramModerator {
    bot: Bot,
}

impl TelegramModerator {
    pub fn new(bot_token: &str) -> Self {
        Self {
            bot: Bot::new(bot_token),
        }
    }
}

#[async_trait]
impl ModeratorApi for TelegramModerator {
    async fn send_message(
        &self,
        chat: &ChatTarget,
        thread_id: Option<i32>,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<i32, ModeratorError> {
        let mut req = self
            .bot
            .send_message(Recipient::from(chat.clone()), text)
            .parse_mode(ParseMode::Html)
            .disable_web_page_preview(true);
        if let Some(thread_id) = thread_id {
            req = req.message_thread_id(thread_id);
        }
        if let Some(keyboard) = keyboard {
            req = req.reply_markup(keyboard.markup());
        }
        let msg = req.await?;
        Ok(msg.id.0)
    }

    async fn edit_message(
        &self,
        chat: &ChatTarget,
        message_id: i32,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<(), ModeratorError> {
        let mut req = self
            .bot
            .edit_message_text(Recipient::from(chat.clone()), MessageId(message_id), text)
            .parse_mode(ParseMode::Html)
            .disable_web_page_preview(true);
        if let Some(keyboard) = keyboard {
            req = req.reply_markup(keyboard.markup());
        }
        req.await?;
        Ok(())
    }

    async fn delete_message(&self, chat: &ChatTarget, message_id: i32) -> Result<(), ModeratorError> {
        self.bot
            .delete_message(Recipient::from(chat.clone()), MessageId(message_id))
            .await?;
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<(), ModeratorError> {
        self.bot
            .answer_callback_query(callback_id.to_string())
            .text(text)
            .await?;
        Ok(())
    }
}

pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn callback_data(draft_id: &str, action: DraftAction) -> String {
    format!("draft:{}:{}", draft_id, action.as_str())
}

pub fn ingest_keyboard(draft_id: &str) -> Keyboard {
    Keyboard {
        rows: vec![vec![
            ("✍️ Redact".into(), callback_data(draft_id, DraftAction::Redact)),
            ("❌ Skip".into(), callback_data(draft_id, DraftAction::Skip)),
        ]],
    }
}

pub fn review_keyboard(draft_id: &str) -> Keyboard {
    Keyboard {
        rows: vec![
            vec![
                ("✅ Post".into(), callback_data(draft_id, DraftAction::Post)),
                ("❌ Skip".into(), callback_data(draft_id, DraftAction::Skip)),
            ],
            vec![("🔁 Redact again".into(), callback_data(draft_id, DraftAction::Redact))],
        ],
    }
}

/// Body of the message announcing a new draft in the ingest thread.
pub fn ingest_text(draft: &Draft) -> String {
    let origin = if draft.origin_text.trim().is_empty() {
        "<i>(media without text)</i>".to_string()
    } else {
        escape_html(&draft.origin_text)
    };
    format!(
        "<b>{}</b> · {}\n<code>{}</code>\n\n{}",
        escape_html(&draft.source_id),
        escape_html(&draft.origin_chat),
        escape_html(&draft.id),
        origin
    )
}

/// Body of the review message carrying the edited text.
pub fn review_text(draft: &Draft) -> String {
    format!(
        "<b>Review</b> <code>{}</code>\n\n{}\n\n<i>/edit {} &lt;text&gt; replaces the text</i>",
        escape_html(&draft.id),
        escape_html(draft.publish_text()),
        escape_html(&draft.id)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DraftStatus;

    fn draft() -> Draft {
        Draft {
            workspace_id: "ws".into(),
            id: "nbu-101".into(),
            source_id: "nbu".into(),
            origin_chat: "@nbu_ua".into(),
            origin_message_id: 101,
            origin_message_date: 0,
            origin_text: "Rate <up> & away".into(),
            has_media: false,
            red_text: None,
            status: DraftStatus::Ingested,
            skip_reason: None,
            ingest_message_id: None,
            review_message_id: None,
            trace_id: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn chat_target_parsing() {
        assert_eq!(ChatTarget::parse("-1001234").unwrap(), ChatTarget::Id(-1001234));
        assert_eq!(
            ChatTarget::parse("finance_digest").unwrap(),
            ChatTarget::Username("@finance_digest".into())
        );
        assert_eq!(
            ChatTarget::parse(" @finance_digest ").unwrap(),
            ChatTarget::Username("@finance_digest".into())
        );
        assert!(ChatTarget::parse("@").is_err());
        assert!(ChatTarget::parse("bad name").is_err());
    }

    #[test]
    fn keyboards_carry_callback_data() {
        let kb = ingest_keyboard("nbu-101");
        assert_eq!(kb.rows[0][0].1, "draft:nbu-101:redact");
        assert_eq!(kb.rows[0][1].1, "draft:nbu-101:skip");
        let kb = review_keyboard("nbu-101");
        assert_eq!(kb.rows[0][0].1, "draft:nbu-101:post");
    }

    #[test]
    fn texts_are_escaped() {
        let d = draft();
        let text = ingest_text(&d);
        assert!(text.contains("Rate &lt;up&gt; &amp; away"));
        let mut d = d;
        d.red_text = Some("Edited <b>".into());
        assert!(review_text(&d).contains("Edited &lt;b&gt;"));
    }
}
