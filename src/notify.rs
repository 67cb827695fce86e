//! Best-effort hand-off from the processor to the moderator surface, and
//! the approver-side announcement it triggers.
use crate::db::{self, Pool};
use crate::drafts::DraftError;
use crate::model::{DraftStatus, Workspace};
use crate::moderator::{self, ChatTarget, ModeratorApi};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotifyRequest {
    pub draft_id: String,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notify request failed: {0}")]
    Request(String),
    #[error("approver answered {0}")]
    Status(u16),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, req: &NotifyRequest) -> Result<(), NotifyError>;
}

/// Used when no approver endpoint is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, req: &NotifyRequest) -> Result<(), NotifyError> {
        debug!(draft_id = %req.draft_id, "no approver endpoint configured; skipping notify");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HttpNotifier {
    http: Client,
    url: Url,
}

impl HttpNotifier {
    pub fn new(url: Url, timeout: Duration) -> Result<Self, NotifyError> {
        let http = Client::builder()
            .user_agent("tg-curator/0.1")
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Request(e.to_string()))?;
        Ok(Self { http, url })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, req: &NotifyRequest) -> Result<(), NotifyError> {
        let res = self
            .http
            .post(self.url.clone())
            .json(req)
            .send()
            .await
            .map_err(|e| NotifyError::Request(e.to_string()))?;
        if !res.status().is_success() {
            return Err(NotifyError::Status(res.status().as_u16()));
        }
        Ok(())
    }
}

/// Single attempt; failures are logged and never undo draft creation.
pub async fn notify_best_effort(notifier: &dyn Notifier, req: &NotifyRequest) -> bool {
    match notifier.notify(req).await {
        Ok(()) => true,
        Err(err) => {
            warn!(?err, draft_id = %req.draft_id, trace_id = ?req.trace_id, "approver notify failed");
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Announcement {
    Sent(i32),
    /// Not INGESTED any more, or some instance already announced it.
    Ignored,
}

impl Announcement {
    pub fn status(&self) -> &'static str {
        match self {
            Announcement::Sent(_) => "sent",
            Announcement::Ignored => "ignored",
        }
    }
}

/// Post the ingest message for a draft at most once.
#[instrument(skip_all, fields(workspace_id = %ws.id, draft_id))]
pub async fn announce(
    pool: &Pool,
    moderator: &dyn ModeratorApi,
    ws: &Workspace,
    draft_id: &str,
) -> Result<Announcement, DraftError> {
    let draft = db::get_draft(pool, &ws.id, draft_id)
        .await?
        .ok_or_else(|| DraftError::NotFound(draft_id.to_string()))?;
    if draft.status != DraftStatus::Ingested || draft.ingest_message_id.is_some() {
        debug!(status = %draft.status, "draft needs no announcement");
        return Ok(Announcement::Ignored);
    }

    let chat = ChatTarget::Id(ws.tg_group_chat_id);
    let message_id = moderator
        .send_message(
            &chat,
            ws.ingest_thread_id,
            &moderator::ingest_text(&draft),
            Some(&moderator::ingest_keyboard(&draft.id)),
        )
        .await
        .map_err(|err| DraftError::Moderator(err.to_string()))?;

    if db::set_ingest_message_id(pool, &ws.id, draft_id, message_id).await? {
        info!(message_id, "draft announced");
        return Ok(Announcement::Sent(message_id));
    }
    // Another instance recorded its message first, or the draft was skipped
    // while the message was in flight.
    if let Err(err) = moderator.delete_message(&chat, message_id).await {
        warn!(?err, message_id, "failed to delete duplicate ingest message");
    }
    Ok(Announcement::Ignored)
}

/// Announce every INGESTED draft that never got an ingest message.
#[instrument(skip_all, fields(workspace_id = %ws.id))]
pub async fn reconcile(
    pool: &Pool,
    moderator: &dyn ModeratorApi,
    ws: &Workspace,
    limit: i64,
) -> anyhow::Result<usize> {
    let pending = db::list_unannounced_drafts(pool, &ws.id, limit).await?;
    let mut notified = 0;
    for draft in pending {
        match announce(pool, moderator, ws, &draft.id).await {
            Ok(Announcement::Sent(_)) => notified += 1,
            Ok(Announcement::Ignored) => {}
            Err(DraftError::Store(err)) => return Err(err),
            Err(err) => error!(?err, draft_id = %draft.id, "reconcile announce failed"),
        }
    }
    if notified > 0 {
        info!(notified, "reconciled unannounced drafts");
    }
    Ok(notified)
}
