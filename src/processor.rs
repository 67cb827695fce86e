//! Processor service: consumes bus pushes and turns them into drafts.
use crate::auth::{self, AuthError, TokenVerifier};
use crate::db::Pool;
use crate::drafts::{self, DraftError};
use crate::notify::{self, Notifier, NotifyRequest};
use crate::relay;
use crate::workspace::WorkspaceCache;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct ProcessorState {
    pub pool: Pool,
    pub workspaces: Arc<WorkspaceCache>,
    /// Used for events that do not name a workspace.
    pub default_workspace: String,
    pub verifier: Arc<dyn TokenVerifier>,
    pub audience: Option<String>,
    pub notifier: Arc<dyn Notifier>,
}

pub fn router(state: ProcessorState) -> Router {
    Router::new()
        .route("/pubsub/push", post(push))
        .route("/healthz", get(healthz))
        .with_state(Arc::new(state))
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

fn status(code: StatusCode, status: &str) -> Response {
    (code, Json(json!({ "status": status }))).into_response()
}

/// POST /pubsub/push
///
/// 204 acknowledges envelopes that can never succeed, 401 rejects
/// unauthenticated pushes, 500 asks the bus to redeliver after a transient
/// failure, and 200 reports what happened to an understood event.
async fn push(State(state): State<Arc<ProcessorState>>, headers: HeaderMap, body: Bytes) -> Response {
    let authorization = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    match auth::check_push_auth(state.verifier.as_ref(), state.audience.as_deref(), authorization).await {
        Ok(()) => {}
        Err(AuthError::Unavailable(err)) => {
            error!(%err, "push token verification unavailable");
            return status(StatusCode::INTERNAL_SERVER_ERROR, "auth_unavailable");
        }
        Err(err) => {
            warn!(?err, "push authentication failed");
            return status(StatusCode::UNAUTHORIZED, "unauthorized");
        }
    }

    let pushed = match relay::decode_push(&body) {
        Ok(pushed) => pushed,
        Err(reason) => {
            warn!(code = reason.code(), %reason, "push envelope rejected");
            return StatusCode::NO_CONTENT.into_response();
        }
    };
    let event = pushed.event;
    let workspace_id = if event.workspace_id.trim().is_empty() {
        state.default_workspace.clone()
    } else {
        event.workspace_id.clone()
    };

    let ws = match state.workspaces.get(&state.pool, &workspace_id).await {
        Ok(Some(ws)) => ws,
        Ok(None) => {
            warn!(%workspace_id, trace_id = %event.trace_id, "push for unknown workspace");
            return status(StatusCode::OK, "failed");
        }
        Err(err) => {
            error!(?err, %workspace_id, "workspace lookup failed");
            return status(StatusCode::INTERNAL_SERVER_ERROR, "error");
        }
    };

    let outcome = match drafts::create_draft(&state.pool, &ws.id, &event).await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(?err, trace_id = %event.trace_id, "draft creation failed");
            let code = match err {
                DraftError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
                _ => StatusCode::OK,
            };
            return status(code, "error");
        }
    };

    if outcome.needs_notification() {
        let req = NotifyRequest {
            draft_id: outcome.draft().id.clone(),
            workspace_id: Some(ws.id.clone()),
            trace_id: Some(event.trace_id.clone()).filter(|t| !t.is_empty()),
        };
        notify::notify_best_effort(state.notifier.as_ref(), &req).await;
    }
    info!(
        draft_id = %outcome.draft().id,
        bus_message_id = ?pushed.bus_message_id,
        trace_id = %event.trace_id,
        status = outcome.status(),
        "push processed"
    );
    (
        StatusCode::OK,
        Json(json!({ "status": outcome.status(), "draft_id": outcome.draft().id })),
    )
        .into_response()
}
