use super::model::{CreateOutcome, NewDraft, TransitionUpdate};
use crate::model::{Draft, DraftStatus, PublishedRecord, SkipReason, Source, Workspace};
use anyhow::{anyhow, Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

const DRAFT_COLUMNS: &str = "workspace_id, id, source_id, origin_chat, origin_message_id, \
     origin_message_date, origin_text, has_media, red_text, status, skip_reason, \
     ingest_message_id, review_message_id, trace_id, created_at, updated_at";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("failed to open database {}", normalized))?;
    // WAL lets several service instances share the file.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// Normalize a file-backed SQLite URL: expand a leading `~/`, make sure the
/// parent directory exists and prefer the `sqlite://` form. Other schemes
/// and in-memory URLs pass through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) => format!("sqlite://{}?{}", path, q),
        None => format!("sqlite://{}", path),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

// ---------------------------------------------------------------------------
// Workspaces

#[instrument(skip_all, fields(workspace_id = %ws.id))]
pub async fn upsert_workspace(pool: &Pool, ws: &Workspace) -> Result<()> {
    sqlx::query(
        "INSERT INTO workspaces (id, title, tg_group_chat_id, ingest_thread_id, review_thread_id, publish_channel, gpt_profile) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET title = excluded.title, tg_group_chat_id = excluded.tg_group_chat_id, \
             ingest_thread_id = excluded.ingest_thread_id, review_thread_id = excluded.review_thread_id, \
             publish_channel = excluded.publish_channel, gpt_profile = excluded.gpt_profile, updated_at = ?",
    )
    .bind(&ws.id)
    .bind(&ws.title)
    .bind(ws.tg_group_chat_id)
    .bind(ws.ingest_thread_id)
    .bind(ws.review_thread_id)
    .bind(ws.publish_channel.as_deref())
    .bind(ws.gpt_profile.as_deref())
    .bind(now_secs())
    .execute(pool)
    .await
    .context("failed to upsert workspace")?;
    Ok(())
}

#[instrument(skip_all, fields(workspace_id))]
pub async fn get_workspace(pool: &Pool, workspace_id: &str) -> Result<Option<Workspace>> {
    let row = sqlx::query(
        "SELECT id, title, tg_group_chat_id, ingest_thread_id, review_thread_id, publish_channel, gpt_profile \
         FROM workspaces WHERE id = ?",
    )
    .bind(workspace_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| Workspace {
        id: row.get("id"),
        title: row.get("title"),
        tg_group_chat_id: row.get("tg_group_chat_id"),
        ingest_thread_id: row.get("ingest_thread_id"),
        review_thread_id: row.get("review_thread_id"),
        publish_channel: row
            .get::<Option<String>, _>("publish_channel")
            .filter(|s| !s.trim().is_empty()),
        gpt_profile: row.get("gpt_profile"),
    }))
}

// ---------------------------------------------------------------------------
// Sources

/// Insert a source or refresh its handle and `enabled` flag. Cursors are
/// preserved unless `reset_cursor` is set.
#[instrument(skip_all, fields(workspace_id, source_id))]
pub async fn upsert_source(
    pool: &Pool,
    workspace_id: &str,
    source_id: &str,
    tg_entity: &str,
    enabled: bool,
    reset_cursor: bool,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO sources (workspace_id, id, tg_entity, enabled) VALUES (?, ?, ?, ?) \
         ON CONFLICT(workspace_id, id) DO UPDATE SET tg_entity = excluded.tg_entity, \
             enabled = excluded.enabled, updated_at = ?",
    )
    .bind(workspace_id)
    .bind(source_id)
    .bind(tg_entity)
    .bind(enabled)
    .bind(now_secs())
    .execute(&mut *tx)
    .await?;
    if reset_cursor {
        sqlx::query(
            "UPDATE sources SET last_message_id = 0, last_message_date = 0, bootstrapped = 0 \
             WHERE workspace_id = ? AND id = ?",
        )
        .bind(workspace_id)
        .bind(source_id)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

fn source_from_row(row: &SqliteRow) -> Source {
    Source {
        workspace_id: row.get("workspace_id"),
        id: row.get("id"),
        tg_entity: row.get("tg_entity"),
        enabled: row.get("enabled"),
        last_message_id: row.get("last_message_id"),
        last_message_date: row.get("last_message_date"),
        bootstrapped: row.get("bootstrapped"),
    }
}

#[instrument(skip_all, fields(workspace_id))]
pub async fn list_sources(pool: &Pool, workspace_id: &str, enabled_only: bool) -> Result<Vec<Source>> {
    let rows = sqlx::query(
        "SELECT workspace_id, id, tg_entity, enabled, last_message_id, last_message_date, bootstrapped \
         FROM sources WHERE workspace_id = ? AND (enabled = 1 OR ? = 0) ORDER BY id ASC",
    )
    .bind(workspace_id)
    .bind(enabled_only)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(source_from_row).collect())
}

#[instrument(skip_all, fields(workspace_id, source_id))]
pub async fn get_source(pool: &Pool, workspace_id: &str, source_id: &str) -> Result<Option<Source>> {
    let row = sqlx::query(
        "SELECT workspace_id, id, tg_entity, enabled, last_message_id, last_message_date, bootstrapped \
         FROM sources WHERE workspace_id = ? AND id = ?",
    )
    .bind(workspace_id)
    .bind(source_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(source_from_row))
}

/// Move the cursor forward. The store refuses to move it backwards or
/// sideways; returns whether a row changed.
#[instrument(skip_all, fields(workspace_id, source_id, last_message_id))]
pub async fn update_source_offsets(
    pool: &Pool,
    workspace_id: &str,
    source_id: &str,
    last_message_id: i64,
    last_message_date: i64,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE sources SET last_message_id = ?, last_message_date = ?, updated_at = ? \
         WHERE workspace_id = ? AND id = ? AND last_message_id < ?",
    )
    .bind(last_message_id)
    .bind(last_message_date)
    .bind(now_secs())
    .bind(workspace_id)
    .bind(source_id)
    .bind(last_message_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Record the bootstrap baseline. Never lowers an existing cursor and only
/// applies once.
#[instrument(skip_all, fields(workspace_id, source_id, baseline_id))]
pub async fn mark_source_bootstrapped(
    pool: &Pool,
    workspace_id: &str,
    source_id: &str,
    baseline_id: i64,
    baseline_date: i64,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE sources SET bootstrapped = 1, \
             last_message_date = CASE WHEN ? > last_message_id THEN ? ELSE last_message_date END, \
             last_message_id = MAX(last_message_id, ?), updated_at = ? \
         WHERE workspace_id = ? AND id = ? AND bootstrapped = 0",
    )
    .bind(baseline_id)
    .bind(baseline_date)
    .bind(baseline_id)
    .bind(now_secs())
    .bind(workspace_id)
    .bind(source_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

// ---------------------------------------------------------------------------
// Drafts

fn draft_from_row(row: &SqliteRow) -> Result<Draft> {
    let id: String = row.get("id");
    let status_str: String = row.get("status");
    let status = DraftStatus::parse_state(&status_str)
        .ok_or_else(|| anyhow!("draft {} has unknown status {}", id, status_str))?;
    Ok(Draft {
        workspace_id: row.get("workspace_id"),
        source_id: row.get("source_id"),
        origin_chat: row.get("origin_chat"),
        origin_message_id: row.get("origin_message_id"),
        origin_message_date: row.get("origin_message_date"),
        origin_text: row.get("origin_text"),
        has_media: row.get("has_media"),
        red_text: row.get("red_text"),
        status,
        skip_reason: row
            .get::<Option<String>, _>("skip_reason")
            .and_then(|s| SkipReason::parse_reason(&s)),
        ingest_message_id: row.get("ingest_message_id"),
        review_message_id: row.get("review_message_id"),
        trace_id: row.get("trace_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        id,
    })
}

#[instrument(skip_all, fields(workspace_id, draft_id))]
pub async fn get_draft(pool: &Pool, workspace_id: &str, draft_id: &str) -> Result<Option<Draft>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM drafts WHERE workspace_id = ? AND id = ?",
        DRAFT_COLUMNS
    ))
    .bind(workspace_id)
    .bind(draft_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(draft_from_row).transpose()
}

/// Create-if-absent keyed by the deterministic draft id.
#[instrument(skip_all, fields(workspace_id = %new.workspace_id, draft_id = %new.id))]
pub async fn insert_draft_if_absent(pool: &Pool, new: &NewDraft) -> Result<CreateOutcome> {
    let now = now_secs();
    let res = sqlx::query(
        "INSERT INTO drafts (workspace_id, id, source_id, origin_chat, origin_message_id, origin_message_date, \
             origin_text, has_media, status, skip_reason, trace_id, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT DO NOTHING",
    )
    .bind(&new.workspace_id)
    .bind(&new.id)
    .bind(&new.source_id)
    .bind(&new.origin_chat)
    .bind(new.origin_message_id)
    .bind(new.origin_message_date)
    .bind(&new.origin_text)
    .bind(new.has_media)
    .bind(new.status.as_str())
    .bind(new.skip_reason.map(|r| r.as_str()))
    .bind(new.trace_id.as_deref())
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .context("failed to insert draft")?;

    let draft = get_draft(pool, &new.workspace_id, &new.id)
        .await?
        .ok_or_else(|| anyhow!("draft {} missing after insert", new.id))?;
    if res.rows_affected() == 1 {
        Ok(CreateOutcome::Created(draft))
    } else {
        Ok(CreateOutcome::Exists(draft))
    }
}

/// Take the transition claim on a draft still in `expected`. A claim older
/// than `ttl_secs` is considered abandoned and may be taken over, unless its
/// holder has already fenced a post (see [`fence_post`]).
#[instrument(skip_all, fields(workspace_id, draft_id, expected = %expected))]
pub async fn claim_draft(
    pool: &Pool,
    workspace_id: &str,
    draft_id: &str,
    expected: DraftStatus,
    token: &str,
    now: i64,
    ttl_secs: i64,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE drafts SET claim_token = ?, claimed_at = ? \
         WHERE workspace_id = ? AND id = ? AND status = ? \
           AND posting_token IS NULL \
           AND (claim_token IS NULL OR claimed_at IS NULL OR claimed_at <= ?)",
    )
    .bind(token)
    .bind(now)
    .bind(workspace_id)
    .bind(draft_id)
    .bind(expected.as_str())
    .bind(now - ttl_secs)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all, fields(workspace_id, draft_id))]
pub async fn release_claim(pool: &Pool, workspace_id: &str, draft_id: &str, token: &str) -> Result<()> {
    sqlx::query(
        "UPDATE drafts SET claim_token = NULL, claimed_at = NULL, posting_token = NULL \
         WHERE workspace_id = ? AND id = ? AND claim_token = ?",
    )
    .bind(workspace_id)
    .bind(draft_id)
    .bind(token)
    .execute(pool)
    .await?;
    Ok(())
}

/// Apply a transition and drop the claim, provided `token` still owns it.
#[instrument(skip_all, fields(workspace_id, draft_id, to = %update.status))]
pub async fn complete_transition(
    pool: &Pool,
    workspace_id: &str,
    draft_id: &str,
    token: &str,
    update: &TransitionUpdate,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE drafts SET status = ?, red_text = COALESCE(?, red_text), skip_reason = ?, \
             review_message_id = COALESCE(?, review_message_id), \
             claim_token = NULL, claimed_at = NULL, updated_at = ? \
         WHERE workspace_id = ? AND id = ? AND claim_token = ?",
    )
    .bind(update.status.as_str())
    .bind(update.red_text.as_deref())
    .bind(update.skip_reason.map(|r| r.as_str()))
    .bind(update.review_message_id)
    .bind(now_secs())
    .bind(workspace_id)
    .bind(draft_id)
    .bind(token)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Mark a claimed `RED_READY` draft as sending to the channel. From here on
/// the claim cannot be taken over until it is released or the post is
/// recorded.
#[instrument(skip_all, fields(workspace_id, draft_id))]
pub async fn fence_post(pool: &Pool, workspace_id: &str, draft_id: &str, token: &str) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE drafts SET posting_token = ? \
         WHERE workspace_id = ? AND id = ? AND status = ? AND claim_token = ? AND posting_token IS NULL",
    )
    .bind(token)
    .bind(workspace_id)
    .bind(draft_id)
    .bind(DraftStatus::RedReady.as_str())
    .bind(token)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// True while a fenced post of this draft is in flight.
pub async fn post_in_flight(pool: &Pool, workspace_id: &str, draft_id: &str) -> Result<bool> {
    let fenced: Option<bool> = sqlx::query_scalar(
        "SELECT posting_token IS NOT NULL FROM drafts WHERE workspace_id = ? AND id = ?",
    )
    .bind(workspace_id)
    .bind(draft_id)
    .fetch_optional(pool)
    .await?;
    Ok(fenced.unwrap_or(false))
}

/// Move a claimed `RED_READY` draft to `POSTED` and record where it went, in
/// one transaction. Returns false when the claim was lost; the published
/// record's primary key rejects a second post outright.
#[instrument(skip_all, fields(workspace_id, draft_id, target_chat))]
pub async fn record_post(
    pool: &Pool,
    workspace_id: &str,
    draft_id: &str,
    token: &str,
    target_chat: &str,
    channel_message_id: i32,
) -> Result<bool> {
    let now = now_secs();
    let mut tx = pool.begin().await?;
    let res = sqlx::query(
        "UPDATE drafts SET status = ?, claim_token = NULL, claimed_at = NULL, posting_token = NULL, \
             updated_at = ? \
         WHERE workspace_id = ? AND id = ? AND status = ? AND claim_token = ?",
    )
    .bind(DraftStatus::Posted.as_str())
    .bind(now)
    .bind(workspace_id)
    .bind(draft_id)
    .bind(DraftStatus::RedReady.as_str())
    .bind(token)
    .execute(&mut *tx)
    .await?;
    if res.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(false);
    }
    sqlx::query(
        "INSERT INTO published (workspace_id, draft_id, target_chat, channel_message_id, created_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(workspace_id)
    .bind(draft_id)
    .bind(target_chat)
    .bind(channel_message_id)
    .bind(now)
    .execute(&mut *tx)
    .await
    .context("failed to insert published record")?;
    tx.commit().await?;
    Ok(true)
}

/// Record the ingest message once, and only while the draft is still
/// `INGESTED`. A concurrent notifier that lost the race, or a draft skipped
/// meanwhile, gets `false`.
#[instrument(skip_all, fields(workspace_id, draft_id, message_id))]
pub async fn set_ingest_message_id(
    pool: &Pool,
    workspace_id: &str,
    draft_id: &str,
    message_id: i32,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE drafts SET ingest_message_id = ?, updated_at = ? \
         WHERE workspace_id = ? AND id = ? AND status = ? AND ingest_message_id IS NULL",
    )
    .bind(message_id)
    .bind(now_secs())
    .bind(workspace_id)
    .bind(draft_id)
    .bind(DraftStatus::Ingested.as_str())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Point a `RED_READY` draft at its current review message.
#[instrument(skip_all, fields(workspace_id, draft_id, message_id))]
pub async fn set_review_message_id(
    pool: &Pool,
    workspace_id: &str,
    draft_id: &str,
    message_id: i32,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE drafts SET review_message_id = ?, updated_at = ? \
         WHERE workspace_id = ? AND id = ? AND status = ?",
    )
    .bind(message_id)
    .bind(now_secs())
    .bind(workspace_id)
    .bind(draft_id)
    .bind(DraftStatus::RedReady.as_str())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// `INGESTED` drafts that never got an ingest message, oldest first.
#[instrument(skip_all, fields(workspace_id))]
pub async fn list_unannounced_drafts(pool: &Pool, workspace_id: &str, limit: i64) -> Result<Vec<Draft>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM drafts WHERE workspace_id = ? AND status = ? AND ingest_message_id IS NULL \
         ORDER BY created_at ASC, origin_message_id ASC LIMIT ?",
        DRAFT_COLUMNS
    ))
    .bind(workspace_id)
    .bind(DraftStatus::Ingested.as_str())
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(draft_from_row).collect()
}

#[instrument(skip_all, fields(workspace_id, draft_id))]
pub async fn get_published(pool: &Pool, workspace_id: &str, draft_id: &str) -> Result<Option<PublishedRecord>> {
    let row = sqlx::query(
        "SELECT workspace_id, draft_id, target_chat, channel_message_id, created_at \
         FROM published WHERE workspace_id = ? AND draft_id = ?",
    )
    .bind(workspace_id)
    .bind(draft_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| PublishedRecord {
        workspace_id: row.get("workspace_id"),
        draft_id: row.get("draft_id"),
        target_chat: row.get("target_chat"),
        channel_message_id: row.get("channel_message_id"),
        created_at: row.get("created_at"),
    }))
}

#[instrument(skip_all)]
pub async fn count_drafts(pool: &Pool, workspace_id: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM drafts WHERE workspace_id = ?")
        .bind(workspace_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[instrument(skip_all)]
pub async fn count_published(pool: &Pool, workspace_id: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM published WHERE workspace_id = ?")
        .bind(workspace_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}
