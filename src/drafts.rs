//! Draft lifecycle: creation from delivery events and moderator-driven
//! transitions.
//!
//! ```text
//! INGESTED ──redact/edit──▶ RED_READY ──post──▶ POSTED
//!     │                       │  ▲
//!     └──skip──▶ SKIPPED ◀──skip┘  └─redact/edit
//! ```
//!
//! Every side-effecting transition holds a store-level claim on the draft
//! row; the final status write only lands while the claim is still held.
//! A post fences its claim before sending, so the channel never sees a
//! draft twice.
use crate::db::{self, CreateOutcome, NewDraft, Pool, TransitionUpdate};
use crate::editor::{Editor, EditorError, Profiles};
use crate::model::{Draft, DraftAction, DraftStatus, DeliveryEvent, SkipReason, Workspace};
use crate::moderator::{self, ChatTarget, ModeratorApi};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DraftError {
    #[error("draft {0} not found")]
    NotFound(String),
    #[error("cannot {action} a draft in {status}")]
    IllegalTransition {
        status: DraftStatus,
        action: &'static str,
    },
    #[error("draft {0} is being changed by another request")]
    Busy(String),
    #[error("workspace has no usable publish channel")]
    ChannelNotConfigured,
    #[error("editor failed: {0}")]
    Editor(String),
    #[error("moderator API failed: {0}")]
    Moderator(String),
    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl DraftError {
    /// True when the caller should surface a failure and may retry; false
    /// for final answers.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DraftError::Store(_) | DraftError::Busy(_) | DraftError::Moderator(_)
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            DraftError::NotFound(_) => "not_found",
            DraftError::IllegalTransition { .. } => "illegal_transition",
            DraftError::Busy(_) => "busy",
            DraftError::ChannelNotConfigured => "channel_not_configured",
            DraftError::Editor(_) => "editor_failed",
            DraftError::Moderator(_) => "moderator_failed",
            DraftError::Store(_) => "store_error",
        }
    }

    /// Short text shown to the moderator in the callback answer.
    pub fn reply_text(&self) -> &'static str {
        match self {
            DraftError::NotFound(_) => "Draft not found",
            DraftError::IllegalTransition { .. } => "Not allowed in the current state",
            DraftError::Busy(_) => "Busy, try again",
            DraftError::ChannelNotConfigured => "No publish channel configured",
            DraftError::Editor(_) => "Editor failed, draft skipped",
            DraftError::Moderator(_) => "Telegram error, try again",
            DraftError::Store(_) => "Internal error",
        }
    }
}

/// A moderator request against an existing draft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Action(DraftAction),
    /// Replace the edited text with the moderator's own.
    Edit(String),
}

impl Intent {
    fn name(&self) -> &'static str {
        match self {
            Intent::Action(action) => action.as_str(),
            Intent::Edit(_) => "edit",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a legal request does to a draft in a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Move { from: DraftStatus, to: DraftStatus },
    AlreadyPosted,
}

/// The transition table. Pure; no store access.
pub fn plan(status: DraftStatus, intent: &Intent) -> Result<Step, DraftError> {
    use DraftStatus::*;
    if status.is_terminal() {
        return match status {
            Posted => Ok(Step::AlreadyPosted),
            _ => Err(DraftError::IllegalTransition {
                status,
                action: intent.name(),
            }),
        };
    }
    let to = match (status, intent) {
        (Ingested, Intent::Action(DraftAction::Redact)) | (Ingested, Intent::Edit(_)) => RedReady,
        (Ingested, Intent::Action(DraftAction::Skip)) => Skipped,
        (RedReady, Intent::Action(DraftAction::Redact)) | (RedReady, Intent::Edit(_)) => RedReady,
        (RedReady, Intent::Action(DraftAction::Post)) => Posted,
        (RedReady, Intent::Action(DraftAction::Skip)) => Skipped,
        (Ingested, Intent::Action(DraftAction::Post)) | (Posted, _) | (Skipped, _) => {
            return Err(DraftError::IllegalTransition {
                status,
                action: intent.name(),
            })
        }
    };
    Ok(Step::Move { from: status, to })
}

/// Result of handing a delivery event to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Ingested(Draft),
    Exists(Draft),
    /// Created straight into SKIPPED because there was nothing to curate.
    Skipped(Draft),
}

impl IngestOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            IngestOutcome::Ingested(_) => "ingested",
            IngestOutcome::Exists(_) => "exists",
            IngestOutcome::Skipped(_) => "skipped",
        }
    }

    pub fn draft(&self) -> &Draft {
        match self {
            IngestOutcome::Ingested(d) | IngestOutcome::Exists(d) | IngestOutcome::Skipped(d) => d,
        }
    }

    /// Only freshly ingested drafts are announced to moderators.
    pub fn needs_notification(&self) -> bool {
        matches!(self, IngestOutcome::Ingested(_))
    }
}

/// Create-if-absent keyed by the event's deterministic draft id.
#[instrument(skip_all, fields(workspace_id, draft_id = %event.draft_id(), trace_id = %event.trace_id))]
pub async fn create_draft(
    pool: &Pool,
    workspace_id: &str,
    event: &DeliveryEvent,
) -> Result<IngestOutcome, DraftError> {
    let (status, skip_reason) = if event.has_content() {
        (DraftStatus::Ingested, None)
    } else {
        (DraftStatus::Skipped, Some(SkipReason::EmptyContent))
    };
    let new = NewDraft {
        workspace_id: workspace_id.to_string(),
        id: event.draft_id(),
        source_id: event.source_id.clone(),
        origin_chat: event.origin_chat.clone(),
        origin_message_id: event.origin_message_id,
        origin_message_date: event.origin_message_date,
        origin_text: event.origin_text.clone(),
        has_media: event.has_media,
        status,
        skip_reason,
        trace_id: Some(event.trace_id.clone()).filter(|t| !t.is_empty()),
    };
    let outcome = match db::insert_draft_if_absent(pool, &new).await? {
        CreateOutcome::Exists(draft) => IngestOutcome::Exists(draft),
        CreateOutcome::Created(draft) if draft.status == DraftStatus::Skipped => {
            IngestOutcome::Skipped(draft)
        }
        CreateOutcome::Created(draft) => IngestOutcome::Ingested(draft),
    };
    info!(status = outcome.status(), "draft creation handled");
    Ok(outcome)
}

/// What a successful moderator request did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Redacted { review_message_id: Option<i32> },
    Edited { review_message_id: Option<i32> },
    Posted { channel_message_id: i32 },
    Skipped,
    AlreadyPosted,
}

impl ActionOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            ActionOutcome::Redacted { .. } => "redacted",
            ActionOutcome::Edited { .. } => "edited",
            ActionOutcome::Posted { .. } => "posted",
            ActionOutcome::Skipped => "skipped",
            ActionOutcome::AlreadyPosted => "already_posted",
        }
    }

    pub fn reply_text(&self) -> &'static str {
        match self {
            ActionOutcome::Redacted { .. } => "Redacted",
            ActionOutcome::Edited { .. } => "Text updated",
            ActionOutcome::Posted { .. } => "Posted",
            ActionOutcome::Skipped => "Skipped",
            ActionOutcome::AlreadyPosted => "Already posted",
        }
    }
}

/// Executes moderator requests against drafts.
pub struct DraftMachine {
    pool: Pool,
    moderator: Arc<dyn ModeratorApi>,
    editor: Arc<dyn Editor>,
    profiles: Profiles,
    claim_ttl: Duration,
    editor_timeout: Duration,
}

impl DraftMachine {
    pub fn new(
        pool: Pool,
        moderator: Arc<dyn ModeratorApi>,
        editor: Arc<dyn Editor>,
        profiles: Profiles,
        claim_ttl: Duration,
        editor_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            moderator,
            editor,
            profiles,
            claim_ttl,
            editor_timeout,
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn moderator(&self) -> &Arc<dyn ModeratorApi> {
        &self.moderator
    }

    /// Apply a callback action (`redact`, `post`, `skip`).
    pub async fn apply(
        &self,
        ws: &Workspace,
        draft_id: &str,
        action: DraftAction,
    ) -> Result<ActionOutcome, DraftError> {
        self.handle(ws, draft_id, Intent::Action(action)).await
    }

    /// Store moderator-supplied text as the edited version.
    pub async fn edit(&self, ws: &Workspace, draft_id: &str, text: &str) -> Result<ActionOutcome, DraftError> {
        self.handle(ws, draft_id, Intent::Edit(text.trim().to_string())).await
    }

    #[instrument(skip_all, fields(workspace_id = %ws.id, draft_id, intent = %intent))]
    async fn handle(&self, ws: &Workspace, draft_id: &str, intent: Intent) -> Result<ActionOutcome, DraftError> {
        let draft = db::get_draft(&self.pool, &ws.id, draft_id)
            .await?
            .ok_or_else(|| DraftError::NotFound(draft_id.to_string()))?;

        let (from, to) = match plan(draft.status, &intent) {
            Ok(Step::AlreadyPosted) => {
                info!("draft already posted; nothing to do");
                return Ok(ActionOutcome::AlreadyPosted);
            }
            Ok(Step::Move { from, to }) => (from, to),
            Err(err) => {
                warn!(status = %draft.status, "illegal transition requested");
                return Err(err);
            }
        };

        // Resolve the channel before claiming so a missing target never mutates anything.
        let channel = if to == DraftStatus::Posted {
            Some(publish_target(ws)?)
        } else {
            None
        };

        let token = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp();
        let claimed = db::claim_draft(
            &self.pool,
            &ws.id,
            draft_id,
            from,
            &token,
            now,
            self.claim_ttl.as_secs() as i64,
        )
        .await?;
        if !claimed {
            return self.lost_claim(ws, draft_id, &intent).await;
        }

        let result = match (&intent, to) {
            (Intent::Action(DraftAction::Redact), _) => self.redact(ws, &draft, &token).await,
            (Intent::Edit(text), _) => self.store_text(ws, &draft, &token, text.clone(), false).await,
            (_, DraftStatus::Skipped) => self.skip(ws, &draft, &token).await,
            (_, DraftStatus::Posted) => match channel {
                Some(channel) => self.post(ws, &draft, &token, channel).await,
                None => Err(DraftError::ChannelNotConfigured),
            },
            _ => Err(DraftError::IllegalTransition {
                status: from,
                action: intent.name(),
            }),
        };

        if result.is_err() {
            // No-op once the transition completed.
            if let Err(err) = db::release_claim(&self.pool, &ws.id, draft_id, &token).await {
                warn!(?err, "failed to release draft claim");
            }
        }
        result
    }

    /// Answer a request whose claim was refused or lost. A post that races
    /// another post in flight is a no-op, not a retry.
    async fn lost_claim(
        &self,
        ws: &Workspace,
        draft_id: &str,
        intent: &Intent,
    ) -> Result<ActionOutcome, DraftError> {
        let draft = db::get_draft(&self.pool, &ws.id, draft_id)
            .await?
            .ok_or_else(|| DraftError::NotFound(draft_id.to_string()))?;
        if draft.status == DraftStatus::Posted {
            return Ok(ActionOutcome::AlreadyPosted);
        }
        if draft.status.is_terminal() {
            return Err(DraftError::IllegalTransition {
                status: draft.status,
                action: intent.name(),
            });
        }
        if *intent == Intent::Action(DraftAction::Post) && db::post_in_flight(&self.pool, &ws.id, draft_id).await? {
            info!("post already in flight");
            return Ok(ActionOutcome::AlreadyPosted);
        }
        info!("draft claimed by another request");
        Err(DraftError::Busy(draft_id.to_string()))
    }

    async fn redact(&self, ws: &Workspace, draft: &Draft, token: &str) -> Result<ActionOutcome, DraftError> {
        let prompt = self.profiles.prompt(ws.gpt_profile.as_deref());
        let failure = match tokio::time::timeout(
            self.editor_timeout,
            self.editor.redact(&draft.origin_text, prompt),
        )
        .await
        {
            Ok(Ok(redaction)) => {
                info!(model = %redaction.model, tokens = ?redaction.tokens, "editor produced text");
                return self.store_text(ws, draft, token, redaction.text, true).await;
            }
            Ok(Err(err)) => err,
            Err(_) => EditorError::Timeout(self.editor_timeout),
        };

        error!(error = %failure, "editor failed; skipping draft");
        let update = TransitionUpdate {
            skip_reason: Some(SkipReason::EditorFailed),
            ..TransitionUpdate::to(DraftStatus::Skipped)
        };
        if !db::complete_transition(&self.pool, &ws.id, &draft.id, token, &update).await? {
            warn!("claim lost before recording editor failure");
        }
        Err(DraftError::Editor(failure.to_string()))
    }

    /// Persist new edited text, then refresh the review message.
    async fn store_text(
        &self,
        ws: &Workspace,
        draft: &Draft,
        token: &str,
        text: String,
        redacted: bool,
    ) -> Result<ActionOutcome, DraftError> {
        let update = TransitionUpdate {
            red_text: Some(text.clone()),
            ..TransitionUpdate::to(DraftStatus::RedReady)
        };
        if !db::complete_transition(&self.pool, &ws.id, &draft.id, token, &update).await? {
            warn!("claim expired before the edited text was stored");
            return Err(DraftError::Busy(draft.id.clone()));
        }

        let mut updated = draft.clone();
        updated.status = DraftStatus::RedReady;
        updated.red_text = Some(text);
        let review_message_id = self.refresh_review(ws, &updated).await;
        if let Some(id) = review_message_id.filter(|id| Some(*id) != draft.review_message_id) {
            if !db::set_review_message_id(&self.pool, &ws.id, &draft.id, id).await? {
                warn!(message_id = id, "draft left RED_READY before its review message was stored");
            }
        }
        Ok(if redacted {
            ActionOutcome::Redacted { review_message_id }
        } else {
            ActionOutcome::Edited { review_message_id }
        })
    }

    /// Edit the existing review message in place, falling back to a new one.
    /// Delivery failures are logged; the draft still becomes RED_READY.
    async fn refresh_review(&self, ws: &Workspace, draft: &Draft) -> Option<i32> {
        let chat = ChatTarget::Id(ws.tg_group_chat_id);
        let text = moderator::review_text(draft);
        let keyboard = moderator::review_keyboard(&draft.id);

        if let Some(existing) = draft.review_message_id {
            match self
                .moderator
                .edit_message(&chat, existing, &text, Some(&keyboard))
                .await
            {
                Ok(()) => return Some(existing),
                Err(err) => warn!(?err, message_id = existing, "review message edit failed; sending new"),
            }
        }
        match self
            .moderator
            .send_message(&chat, ws.review_thread_id, &text, Some(&keyboard))
            .await
        {
            Ok(id) => Some(id),
            Err(err) => {
                error!(?err, "failed to send review message");
                None
            }
        }
    }

    async fn skip(&self, ws: &Workspace, draft: &Draft, token: &str) -> Result<ActionOutcome, DraftError> {
        let update = TransitionUpdate {
            skip_reason: Some(SkipReason::Moderator),
            ..TransitionUpdate::to(DraftStatus::Skipped)
        };
        if !db::complete_transition(&self.pool, &ws.id, &draft.id, token, &update).await? {
            return self.lost_claim(ws, &draft.id, &Intent::Action(DraftAction::Skip)).await;
        }
        self.cleanup(ws, draft).await;
        info!("draft skipped by moderator");
        Ok(ActionOutcome::Skipped)
    }

    async fn post(
        &self,
        ws: &Workspace,
        draft: &Draft,
        token: &str,
        channel: ChatTarget,
    ) -> Result<ActionOutcome, DraftError> {
        if !db::fence_post(&self.pool, &ws.id, &draft.id, token).await? {
            return self.lost_claim(ws, &draft.id, &Intent::Action(DraftAction::Post)).await;
        }

        let text = moderator::escape_html(draft.publish_text());
        let channel_message_id = self
            .moderator
            .send_message(&channel, None, &text, None)
            .await
            .map_err(|err| {
                error!(?err, "channel publish failed");
                DraftError::Moderator(err.to_string())
            })?;

        let target = ws.publish_channel.clone().unwrap_or_default();
        if !db::record_post(&self.pool, &ws.id, &draft.id, token, &target, channel_message_id).await? {
            // The message is out; report it rather than inviting a retry.
            error!(channel_message_id, "post not recorded; channel message is orphaned");
            return Ok(ActionOutcome::Posted { channel_message_id });
        }
        info!(channel_message_id, target = %target, "draft posted");

        if let Some(review_id) = draft.review_message_id {
            let chat = ChatTarget::Id(ws.tg_group_chat_id);
            let text = format!("{}\n\n✅ Posted", moderator::review_text(draft));
            if let Err(err) = self.moderator.edit_message(&chat, review_id, &text, None).await {
                warn!(?err, "failed to mark review message as posted");
            }
        }
        Ok(ActionOutcome::Posted { channel_message_id })
    }

    /// Best-effort removal of the moderator messages of a skipped draft.
    async fn cleanup(&self, ws: &Workspace, draft: &Draft) {
        let chat = ChatTarget::Id(ws.tg_group_chat_id);
        for message_id in [draft.ingest_message_id, draft.review_message_id].into_iter().flatten() {
            if let Err(err) = self.moderator.delete_message(&chat, message_id).await {
                warn!(?err, message_id, "failed to delete moderator message");
            }
        }
    }
}

fn publish_target(ws: &Workspace) -> Result<ChatTarget, DraftError> {
    let channel = ws
        .publish_channel
        .as_deref()
        .ok_or(DraftError::ChannelNotConfigured)?;
    ChatTarget::parse(channel).map_err(|err| {
        warn!(?err, "workspace publish channel is invalid");
        DraftError::ChannelNotConfigured
    })
}
