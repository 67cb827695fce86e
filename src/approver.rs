//! Approver service: moderator webhook, notify hand-off and reconciliation.
use crate::drafts::{DraftError, DraftMachine};
use crate::model::Workspace;
use crate::moderator::ChatTarget;
use crate::notify::{self, Announcement, NotifyRequest};
use crate::webhook::{self, Command, Inbound, Update};
use crate::workspace::WorkspaceCache;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub struct ApproverState {
    pub machine: DraftMachine,
    pub workspaces: Arc<WorkspaceCache>,
    pub default_workspace: String,
    pub webhook_secret: Option<String>,
    pub reconcile_limit: i64,
}

pub fn router(state: Arc<ApproverState>) -> Router {
    Router::new()
        .route("/telegram/webhook", post(telegram_webhook))
        .route("/internal/notify", post(internal_notify))
        .route("/internal/reconcile", post(internal_reconcile))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

fn status(code: StatusCode, status: &str) -> Response {
    (code, Json(json!({ "status": status }))).into_response()
}

impl ApproverState {
    async fn workspace(&self, requested: Option<&str>) -> Result<Option<Workspace>, anyhow::Error> {
        let id = requested
            .filter(|id| !id.trim().is_empty())
            .unwrap_or(&self.default_workspace);
        self.workspaces.get(self.machine.pool(), id).await
    }

    async fn answer(&self, query_id: &str, text: &str) {
        if let Err(err) = self.machine.moderator().answer_callback(query_id, text).await {
            warn!(?err, "failed to answer callback query");
        }
    }
}

/// POST /telegram/webhook
///
/// Always 200 unless the store failed, so the Bot API does not redeliver
/// updates that can never succeed.
async fn telegram_webhook(State(state): State<Arc<ApproverState>>, headers: HeaderMap, body: Bytes) -> Response {
    if let Some(secret) = &state.webhook_secret {
        let given = headers
            .get(webhook::SECRET_HEADER)
            .and_then(|v| v.to_str().ok());
        if given != Some(secret.as_str()) {
            warn!("webhook secret mismatch");
            return status(StatusCode::OK, "unauthorized");
        }
    }

    let update: Update = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(err) => {
            warn!(%err, "webhook body is not a valid update");
            return status(StatusCode::OK, "invalid_json");
        }
    };

    let inbound = match webhook::classify(&update) {
        Ok(inbound) => inbound,
        Err((query_id, err)) => {
            warn!(update_id = update.update_id, %err, "unrecognized moderator input");
            if let Some(query_id) = query_id {
                state.answer(&query_id, "Unknown action").await;
            }
            return status(StatusCode::OK, "ignored");
        }
    };

    let ws = match &inbound {
        Inbound::Ignored => return status(StatusCode::OK, "ignored"),
        _ => match state.workspace(None).await {
            Ok(Some(ws)) => ws,
            Ok(None) => {
                error!(workspace_id = %state.default_workspace, "approver workspace missing");
                return status(StatusCode::OK, "failed");
            }
            Err(err) => {
                error!(?err, "workspace lookup failed");
                return status(StatusCode::INTERNAL_SERVER_ERROR, "error");
            }
        },
    };

    match inbound {
        Inbound::Callback { query_id, callback } => {
            let result = state.machine.apply(&ws, &callback.draft_id, callback.action).await;
            match result {
                Ok(outcome) => {
                    state.answer(&query_id, outcome.reply_text()).await;
                    status(StatusCode::OK, outcome.status())
                }
                Err(err) => {
                    log_draft_error(&err, &callback.draft_id);
                    state.answer(&query_id, err.reply_text()).await;
                    draft_error_response(&err)
                }
            }
        }
        Inbound::Command {
            chat_id,
            command: Command::Edit { draft_id, text },
        } => match state.machine.edit(&ws, &draft_id, &text).await {
            Ok(outcome) => status(StatusCode::OK, outcome.status()),
            Err(err) => {
                log_draft_error(&err, &draft_id);
                let reply = format!("{}: {}", draft_id, err.reply_text());
                if let Err(send_err) = state
                    .machine
                    .moderator()
                    .send_message(&ChatTarget::Id(chat_id), None, &reply, None)
                    .await
                {
                    warn!(?send_err, "failed to reply to /edit");
                }
                draft_error_response(&err)
            }
        },
        Inbound::Ignored => status(StatusCode::OK, "ignored"),
    }
}

fn log_draft_error(err: &DraftError, draft_id: &str) {
    if err.is_transient() {
        warn!(?err, draft_id, "draft request failed");
    } else {
        info!(%err, draft_id, "draft request refused");
    }
}

fn draft_error_response(err: &DraftError) -> Response {
    let code = match err {
        DraftError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::OK,
    };
    status(code, err.code())
}

/// POST /internal/notify
async fn internal_notify(State(state): State<Arc<ApproverState>>, Json(req): Json<NotifyRequest>) -> Response {
    let ws = match state.workspace(req.workspace_id.as_deref()).await {
        Ok(Some(ws)) => ws,
        Ok(None) => return status(StatusCode::NOT_FOUND, "not_found"),
        Err(err) => {
            error!(?err, "workspace lookup failed");
            return status(StatusCode::INTERNAL_SERVER_ERROR, "error");
        }
    };
    let moderator = state.machine.moderator().as_ref();
    match notify::announce(state.machine.pool(), moderator, &ws, &req.draft_id).await {
        Ok(announcement) => {
            if let Announcement::Sent(message_id) = announcement {
                info!(draft_id = %req.draft_id, trace_id = ?req.trace_id, message_id, "ingest message sent");
            }
            status(StatusCode::OK, announcement.status())
        }
        Err(DraftError::NotFound(_)) => status(StatusCode::NOT_FOUND, "not_found"),
        Err(err) => {
            warn!(?err, draft_id = %req.draft_id, "announce failed");
            status(StatusCode::INTERNAL_SERVER_ERROR, err.code())
        }
    }
}

/// POST /internal/reconcile
async fn internal_reconcile(State(state): State<Arc<ApproverState>>) -> Response {
    match reconcile_once(&state).await {
        Ok(notified) => (StatusCode::OK, Json(json!({ "status": "ok", "notified": notified }))).into_response(),
        Err(err) => {
            error!(?err, "reconcile failed");
            status(StatusCode::INTERNAL_SERVER_ERROR, "error")
        }
    }
}

pub async fn reconcile_once(state: &ApproverState) -> anyhow::Result<usize> {
    let Some(ws) = state.workspace(None).await? else {
        anyhow::bail!("workspace {} not found", state.default_workspace);
    };
    notify::reconcile(
        state.machine.pool(),
        state.machine.moderator().as_ref(),
        &ws,
        state.reconcile_limit,
    )
    .await
}

/// Periodically announce drafts whose notification got lost.
pub fn spawn_reconciler(state: Arc<ApproverState>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            if let Err(err) = reconcile_once(&state).await {
                error!(?err, "periodic reconcile failed");
            }
        }
    })
}
