mod common;

use common::*;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use tg_curator::approver::{self, ApproverState};
use tg_curator::auth::TokenVerifier;
use tg_curator::db::{self, Pool};
use tg_curator::model::{DeliveryEvent, DraftStatus};
use tg_curator::notify::Notifier;
use tg_curator::processor::{self, ProcessorState};
use tg_curator::relay;
use tg_curator::webhook::SECRET_HEADER;
use tg_curator::workspace::WorkspaceCache;

async fn serve(app: axum::Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    addr
}

fn push_body(event: &DeliveryEvent) -> Value {
    json!({
        "message": { "data": relay::encode_event(event).unwrap(), "messageId": "bus-1" },
        "subscription": "projects/p/subscriptions/processor"
    })
}

async fn processor_app(pool: &Pool, audience: Option<&str>, notifier: Arc<RecordingNotifier>) -> SocketAddr {
    let verifier: Arc<dyn TokenVerifier> = Arc::new(StaticVerifier("good"));
    let notifier: Arc<dyn Notifier> = notifier;
    let state = ProcessorState {
        pool: pool.clone(),
        workspaces: Arc::new(WorkspaceCache::new(Duration::from_secs(60))),
        default_workspace: WS.into(),
        verifier,
        audience: audience.map(str::to_string),
        notifier,
    };
    serve(processor::router(state)).await
}

async fn post_json(client: &reqwest::Client, url: String, body: &Value) -> (u16, Value) {
    let resp = client.post(url).json(body).send().await.unwrap();
    let code = resp.status().as_u16();
    let body = resp.json::<Value>().await.unwrap_or(Value::Null);
    (code, body)
}

#[tokio::test]
async fn push_creates_draft_once_and_notifies_once() {
    let pool = seeded_pool().await;
    let notifier = Arc::new(RecordingNotifier::default());
    let addr = processor_app(&pool, None, notifier.clone()).await;
    let client = reqwest::Client::new();
    let url = format!("http://{}/pubsub/push", addr);
    let body = push_body(&event("nbu", 101, "Ukraine raises rate"));

    let (code, resp) = post_json(&client, url.clone(), &body).await;
    assert_eq!(code, 200);
    assert_eq!(resp["status"], "ingested");
    assert_eq!(resp["draft_id"], "nbu-101");

    let (code, resp) = post_json(&client, url, &body).await;
    assert_eq!(code, 200);
    assert_eq!(resp["status"], "exists");

    let requests = notifier.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].draft_id, "nbu-101");
    assert_eq!(requests[0].workspace_id.as_deref(), Some(WS));
    assert_eq!(requests[0].trace_id.as_deref(), Some("trace-101"));
    assert_eq!(db::count_drafts(&pool, WS).await.unwrap(), 1);
}

#[tokio::test]
async fn notify_failure_does_not_fail_the_push() {
    let pool = seeded_pool().await;
    let notifier = Arc::new(RecordingNotifier::default());
    notifier.fail.store(true, std::sync::atomic::Ordering::SeqCst);
    let addr = processor_app(&pool, None, notifier.clone()).await;

    let (code, resp) = post_json(
        &reqwest::Client::new(),
        format!("http://{}/pubsub/push", addr),
        &push_body(&event("nbu", 7, "text")),
    )
    .await;
    assert_eq!(code, 200);
    assert_eq!(resp["status"], "ingested");
    assert_eq!(notifier.requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn malformed_pushes_are_acknowledged_without_drafts() {
    let pool = seeded_pool().await;
    let addr = processor_app(&pool, None, Arc::new(RecordingNotifier::default())).await;
    let client = reqwest::Client::new();
    let url = format!("http://{}/pubsub/push", addr);

    let bad = [
        json!({}),
        json!({ "message": {} }),
        json!({ "message": { "data": "%%%" } }),
        json!({ "message": { "data": relay::encode_event(&event("", 5, "x")).unwrap() } }),
        json!({ "message": { "data": relay::encode_event(&event("nbu", 0, "x")).unwrap() } }),
    ];
    for body in &bad {
        let resp = client.post(&url).json(body).send().await.unwrap();
        assert_eq!(resp.status().as_u16(), 204, "body {}", body);
    }
    let resp = client.post(&url).body("not json").send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 204);
    assert_eq!(db::count_drafts(&pool, WS).await.unwrap(), 0);
}

#[tokio::test]
async fn push_requires_bearer_token_when_audience_is_set() {
    let pool = seeded_pool().await;
    let addr = processor_app(&pool, Some("https://processor.example"), Arc::new(RecordingNotifier::default())).await;
    let client = reqwest::Client::new();
    let url = format!("http://{}/pubsub/push", addr);
    let body = push_body(&event("nbu", 9, "text"));

    let resp = client.post(&url).json(&body).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 401);
    let resp = client
        .post(&url)
        .bearer_auth("forged")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);
    assert_eq!(db::count_drafts(&pool, WS).await.unwrap(), 0);

    let resp = client.post(&url).bearer_auth("good").json(&body).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
}

#[tokio::test]
async fn push_for_unknown_workspace_reports_failed() {
    let pool = seeded_pool().await;
    let addr = processor_app(&pool, None, Arc::new(RecordingNotifier::default())).await;
    let mut ev = event("nbu", 3, "text");
    ev.workspace_id = "elsewhere".into();
    let (code, resp) = post_json(
        &reqwest::Client::new(),
        format!("http://{}/pubsub/push", addr),
        &push_body(&ev),
    )
    .await;
    assert_eq!(code, 200);
    assert_eq!(resp["status"], "failed");
    assert_eq!(db::count_drafts(&pool, WS).await.unwrap(), 0);
}

#[tokio::test]
async fn health_endpoints_answer() {
    let pool = seeded_pool().await;
    let addr = processor_app(&pool, Some("aud"), Arc::new(RecordingNotifier::default())).await;
    let resp = reqwest::get(format!("http://{}/healthz", addr)).await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.json::<Value>().await.unwrap()["status"], "ok");
}

struct Approver {
    pool: Pool,
    moderator: Arc<RecordingModerator>,
    addr: SocketAddr,
}

async fn approver_app(secret: Option<&str>) -> Approver {
    let pool = seeded_pool().await;
    let moderator = Arc::new(RecordingModerator::default());
    let editor = Arc::new(ScriptedEditor::default());
    let state = ApproverState {
        machine: machine(&pool, moderator.clone(), editor),
        workspaces: Arc::new(WorkspaceCache::new(Duration::from_secs(60))),
        default_workspace: WS.into(),
        webhook_secret: secret.map(str::to_string),
        reconcile_limit: 50,
    };
    let addr = serve(approver::router(Arc::new(state))).await;
    Approver { pool, moderator, addr }
}

fn callback_update(query_id: &str, data: &str) -> Value {
    json!({
        "update_id": 1,
        "callback_query": {
            "id": query_id,
            "data": data,
            "from": { "id": 42, "username": "moderator" },
            "message": { "message_id": 1000, "chat": { "id": GROUP_CHAT } }
        }
    })
}

#[tokio::test]
async fn webhook_checks_secret_and_body() {
    let app = approver_app(Some("s3cret")).await;
    let client = reqwest::Client::new();
    let url = format!("http://{}/telegram/webhook", app.addr);
    drafts_seed(&app.pool, 1).await;

    let resp = client
        .post(&url)
        .header(SECRET_HEADER, "wrong")
        .json(&callback_update("q1", "draft:nbu-1:skip"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.json::<Value>().await.unwrap()["status"], "unauthorized");
    assert_eq!(
        db::get_draft(&app.pool, WS, "nbu-1").await.unwrap().unwrap().status,
        DraftStatus::Ingested
    );

    let resp = client
        .post(&url)
        .header(SECRET_HEADER, "s3cret")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.json::<Value>().await.unwrap()["status"], "invalid_json");
}

async fn drafts_seed(pool: &Pool, id: i64) {
    tg_curator::drafts::create_draft(pool, WS, &event("nbu", id, "Ukraine raises rate"))
        .await
        .unwrap();
}

#[tokio::test]
async fn callback_redacts_and_answers() {
    let app = approver_app(None).await;
    drafts_seed(&app.pool, 101).await;
    let client = reqwest::Client::new();
    let url = format!("http://{}/telegram/webhook", app.addr);

    let (code, resp) = post_json(&client, url.clone(), &callback_update("q1", "draft:nbu-101:redact")).await;
    assert_eq!(code, 200);
    assert_eq!(resp["status"], "redacted");
    assert_eq!(
        app.moderator.answers.lock().unwrap().as_slice(),
        &[("q1".to_string(), "Redacted".to_string())]
    );
    let draft = db::get_draft(&app.pool, WS, "nbu-101").await.unwrap().unwrap();
    assert_eq!(draft.status, DraftStatus::RedReady);

    let (_, resp) = post_json(&client, url.clone(), &callback_update("q2", "draft:nbu-101:post")).await;
    assert_eq!(resp["status"], "posted");
    let (_, resp) = post_json(&client, url.clone(), &callback_update("q3", "draft:nbu-101:post")).await;
    assert_eq!(resp["status"], "already_posted");
    assert_eq!(db::count_published(&app.pool, WS).await.unwrap(), 1);

    let (code, resp) = post_json(&client, url.clone(), &callback_update("q4", "draft:nbu-404:skip")).await;
    assert_eq!(code, 200);
    assert_eq!(resp["status"], "not_found");

    let (_, resp) = post_json(&client, url, &callback_update("q5", "draft:nbu-101:approve")).await;
    assert_eq!(resp["status"], "ignored");
    let answers = app.moderator.answers.lock().unwrap().clone();
    assert_eq!(answers.last().unwrap(), &("q5".to_string(), "Unknown action".to_string()));
}

#[tokio::test]
async fn edit_command_sets_text_or_replies_with_error() {
    let app = approver_app(None).await;
    drafts_seed(&app.pool, 5).await;
    let client = reqwest::Client::new();
    let url = format!("http://{}/telegram/webhook", app.addr);
    let update = |text: &str| {
        json!({
            "update_id": 2,
            "message": { "message_id": 77, "chat": { "id": GROUP_CHAT }, "text": text }
        })
    };

    let (_, resp) = post_json(&client, url.clone(), &update("/edit nbu-5 Rate is up")).await;
    assert_eq!(resp["status"], "edited");
    let draft = db::get_draft(&app.pool, WS, "nbu-5").await.unwrap().unwrap();
    assert_eq!(draft.red_text.as_deref(), Some("Rate is up"));

    let (_, resp) = post_json(&client, url.clone(), &update("/edit nbu-999 whatever")).await;
    assert_eq!(resp["status"], "not_found");
    let replies = app.moderator.sent_to(&tg_curator::moderator::ChatTarget::Id(GROUP_CHAT));
    assert!(replies.last().unwrap().text.starts_with("nbu-999:"));

    let (_, resp) = post_json(&client, url, &update("just chatting")).await;
    assert_eq!(resp["status"], "ignored");
}

#[tokio::test]
async fn notify_announces_once() {
    let app = approver_app(None).await;
    drafts_seed(&app.pool, 101).await;
    let client = reqwest::Client::new();
    let url = format!("http://{}/internal/notify", app.addr);
    let req = json!({ "draft_id": "nbu-101", "workspace_id": WS, "trace_id": "t-1" });

    let (code, resp) = post_json(&client, url.clone(), &req).await;
    assert_eq!(code, 200);
    assert_eq!(resp["status"], "sent");
    let (code, resp) = post_json(&client, url.clone(), &req).await;
    assert_eq!(code, 200);
    assert_eq!(resp["status"], "ignored");
    assert_eq!(app.moderator.sent.lock().unwrap().len(), 1);

    let (code, _) = post_json(&client, url.clone(), &json!({ "draft_id": "nbu-404" })).await;
    assert_eq!(code, 404);
    let (code, _) = post_json(&client, url, &json!({ "draft_id": "nbu-101", "workspace_id": "elsewhere" })).await;
    assert_eq!(code, 404);
}

#[tokio::test]
async fn reconcile_announces_missed_drafts() {
    let app = approver_app(None).await;
    drafts_seed(&app.pool, 1).await;
    drafts_seed(&app.pool, 2).await;
    let client = reqwest::Client::new();
    let url = format!("http://{}/internal/reconcile", app.addr);

    let (code, resp) = post_json(&client, url.clone(), &json!({})).await;
    assert_eq!(code, 200);
    assert_eq!(resp, json!({ "status": "ok", "notified": 2 }));
    let (_, resp) = post_json(&client, url, &json!({})).await;
    assert_eq!(resp["notified"], 0);
}
