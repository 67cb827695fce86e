#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tg_curator::auth::{AuthError, TokenVerifier};
use tg_curator::db::{self, Pool};
use tg_curator::drafts::DraftMachine;
use tg_curator::editor::{Editor, EditorError, Profiles, Redaction};
use tg_curator::model::{DeliveryEvent, Workspace};
use tg_curator::moderator::{ChatTarget, Keyboard, ModeratorApi, ModeratorError};
use tg_curator::notify::{Notifier, NotifyError, NotifyRequest};
use tg_curator::relay::{PublishError, Publisher};
use tg_curator::source::{SourceClient, SourceError, SourceMessage};

pub const WS: &str = "finance-ua";
pub const GROUP_CHAT: i64 = -1001234567890;

pub async fn setup_pool() -> Pool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

pub fn workspace() -> Workspace {
    Workspace {
        id: WS.into(),
        title: "Finance UA".into(),
        tg_group_chat_id: GROUP_CHAT,
        ingest_thread_id: Some(2),
        review_thread_id: Some(3),
        publish_channel: Some("@finance_digest".into()),
        gpt_profile: None,
    }
}

pub async fn seeded_pool() -> Pool {
    let pool = setup_pool().await;
    db::upsert_workspace(&pool, &workspace()).await.unwrap();
    pool
}

pub fn event(source_id: &str, origin_message_id: i64, text: &str) -> DeliveryEvent {
    DeliveryEvent {
        workspace_id: WS.into(),
        source_id: source_id.into(),
        origin_message_id,
        origin_text: text.into(),
        origin_chat: format!("@{}", source_id),
        origin_message_date: 1_700_000_000 + origin_message_id,
        has_media: false,
        trace_id: format!("trace-{}", origin_message_id),
    }
}

pub fn msg(id: i64, text: &str) -> SourceMessage {
    SourceMessage {
        id,
        date: 1_700_000_000 + id,
        text: text.into(),
        has_media: false,
    }
}

/// In-memory channels keyed by entity, with a scripted number of flood
/// responses per entity.
#[derive(Default)]
pub struct FakeSource {
    pub channels: Mutex<HashMap<String, Vec<SourceMessage>>>,
    pub floods: Mutex<HashMap<String, u32>>,
    pub broken: Mutex<Vec<String>>,
    pub calls: Mutex<Vec<(String, Option<i64>, u32)>>,
}

impl FakeSource {
    pub fn with_channel(self, entity: &str, messages: Vec<SourceMessage>) -> Self {
        self.channels.lock().unwrap().insert(entity.into(), messages);
        self
    }

    pub fn push(&self, entity: &str, message: SourceMessage) {
        self.channels
            .lock()
            .unwrap()
            .entry(entity.into())
            .or_default()
            .push(message);
    }

    pub fn flood(&self, entity: &str, times: u32) {
        self.floods.lock().unwrap().insert(entity.into(), times);
    }

    fn check(&self, entity: &str) -> Result<(), SourceError> {
        if self.broken.lock().unwrap().iter().any(|e| e == entity) {
            return Err(SourceError::Request("gateway down".into()));
        }
        let mut floods = self.floods.lock().unwrap();
        if let Some(left) = floods.get_mut(entity) {
            if *left > 0 {
                *left -= 1;
                return Err(SourceError::FloodWait(Duration::ZERO));
            }
        }
        Ok(())
    }

    fn sorted(&self, entity: &str) -> Vec<SourceMessage> {
        let mut all = self
            .channels
            .lock()
            .unwrap()
            .get(entity)
            .cloned()
            .unwrap_or_default();
        all.sort_by_key(|m| m.id);
        all
    }
}

#[async_trait]
impl SourceClient for FakeSource {
    async fn latest(&self, entity: &str, limit: u32) -> Result<Vec<SourceMessage>, SourceError> {
        self.calls.lock().unwrap().push((entity.into(), None, limit));
        self.check(entity)?;
        let all = self.sorted(entity);
        let skip = all.len().saturating_sub(limit as usize);
        Ok(all.into_iter().skip(skip).rev().collect())
    }

    async fn after(&self, entity: &str, after_id: i64, limit: u32) -> Result<Vec<SourceMessage>, SourceError> {
        self.calls.lock().unwrap().push((entity.into(), Some(after_id), limit));
        self.check(entity)?;
        Ok(self
            .sorted(entity)
            .into_iter()
            .filter(|m| m.id > after_id)
            .take(limit as usize)
            .collect())
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    pub published: Mutex<Vec<(DeliveryEvent, String)>>,
    /// Origin ids whose publish fails.
    pub fail_ids: Mutex<Vec<i64>>,
}

impl RecordingPublisher {
    pub fn keys(&self) -> Vec<String> {
        self.published.lock().unwrap().iter().map(|(_, k)| k.clone()).collect()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, event: &DeliveryEvent, ordering_key: &str) -> Result<String, PublishError> {
        if self.fail_ids.lock().unwrap().contains(&event.origin_message_id) {
            return Err(PublishError::Rejected {
                status: 503,
                body: "unavailable".into(),
            });
        }
        let mut published = self.published.lock().unwrap();
        published.push((event.clone(), ordering_key.to_string()));
        Ok(format!("bus-{}", published.len()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub chat: ChatTarget,
    pub thread_id: Option<i32>,
    pub text: String,
    pub keyboard: Option<Keyboard>,
    pub message_id: i32,
}

#[derive(Default)]
pub struct RecordingModerator {
    pub sent: Mutex<Vec<Sent>>,
    pub edited: Mutex<Vec<(ChatTarget, i32, String)>>,
    pub deleted: Mutex<Vec<(ChatTarget, i32)>>,
    pub answers: Mutex<Vec<(String, String)>>,
    /// Sends to this chat fail.
    pub fail_chat: Mutex<Option<ChatTarget>>,
    pub fail_edits: AtomicBool,
    /// How long each send takes before it is recorded.
    pub send_delay: Mutex<Option<Duration>>,
    next_id: AtomicI32,
}

impl RecordingModerator {
    pub fn sent_to(&self, chat: &ChatTarget) -> Vec<Sent> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|s| &s.chat == chat)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ModeratorApi for RecordingModerator {
    async fn send_message(
        &self,
        chat: &ChatTarget,
        thread_id: Option<i32>,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<i32, ModeratorError> {
        if self.fail_chat.lock().unwrap().as_ref() == Some(chat) {
            return Err(ModeratorError::Api("chat not found".into()));
        }
        let delay = *self.send_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let message_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1000;
        self.sent.lock().unwrap().push(Sent {
            chat: chat.clone(),
            thread_id,
            text: text.to_string(),
            keyboard: keyboard.cloned(),
            message_id,
        });
        Ok(message_id)
    }

    async fn edit_message(
        &self,
        chat: &ChatTarget,
        message_id: i32,
        text: &str,
        _keyboard: Option<&Keyboard>,
    ) -> Result<(), ModeratorError> {
        if self.fail_edits.load(Ordering::SeqCst) {
            return Err(ModeratorError::Api("message to edit not found".into()));
        }
        self.edited
            .lock()
            .unwrap()
            .push((chat.clone(), message_id, text.to_string()));
        Ok(())
    }

    async fn delete_message(&self, chat: &ChatTarget, message_id: i32) -> Result<(), ModeratorError> {
        self.deleted.lock().unwrap().push((chat.clone(), message_id));
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<(), ModeratorError> {
        self.answers
            .lock()
            .unwrap()
            .push((callback_id.to_string(), text.to_string()));
        Ok(())
    }
}

/// Returns scripted results, then `Edited: <text>` once the script runs out.
#[derive(Default)]
pub struct ScriptedEditor {
    pub script: Mutex<VecDeque<Result<String, EditorError>>>,
    pub delay: Option<Duration>,
    pub calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedEditor {
    pub fn failing_once() -> Self {
        let editor = Self::default();
        editor
            .script
            .lock()
            .unwrap()
            .push_back(Err(EditorError::Status {
                status: 500,
                body: "boom".into(),
            }));
        editor
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }
}

#[async_trait]
impl Editor for ScriptedEditor {
    async fn redact(&self, text: &str, prompt: &str) -> Result<Redaction, EditorError> {
        self.calls
            .lock()
            .unwrap()
            .push((text.to_string(), prompt.to_string()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        let text = match next {
            Some(result) => result?,
            None => format!("Edited: {}", text),
        };
        Ok(Redaction {
            text,
            model: "fake".into(),
            tokens: Some(1),
        })
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub requests: Mutex<Vec<NotifyRequest>>,
    pub fail: AtomicBool,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, req: &NotifyRequest) -> Result<(), NotifyError> {
        self.requests.lock().unwrap().push(req.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotifyError::Status(503));
        }
        Ok(())
    }
}

/// Accepts exactly one token.
pub struct StaticVerifier(pub &'static str);

#[async_trait]
impl TokenVerifier for StaticVerifier {
    async fn verify(&self, token: &str, _audience: &str) -> Result<(), AuthError> {
        if token == self.0 {
            Ok(())
        } else {
            Err(AuthError::Invalid("unknown token".into()))
        }
    }
}

pub fn machine(pool: &Pool, moderator: Arc<RecordingModerator>, editor: Arc<ScriptedEditor>) -> DraftMachine {
    DraftMachine::new(
        pool.clone(),
        moderator,
        editor,
        Profiles::default(),
        Duration::from_secs(120),
        Duration::from_secs(5),
    )
}
