//! One ingestion pass: fetch new messages per source, publish one delivery
//! event per message, then advance the source cursor.
use crate::config;
use crate::cursor::{self, Cursor};
use crate::db::{self, Pool};
use crate::model::{DeliveryEvent, Source};
use crate::relay::Publisher;
use crate::retry::jitter_delay;
use crate::source::{SourceClient, SourceError, SourceMessage};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("source {source_id} still flood-limited after {attempts} attempts; pass aborted")]
    FloodAborted { source_id: String, attempts: u32 },
    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassLimits {
    pub per_source_limit: u32,
    pub total_limit: u32,
    pub flood_max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl From<&config::Ingest> for PassLimits {
    fn from(cfg: &config::Ingest) -> Self {
        Self {
            per_source_limit: cfg.per_source_limit,
            total_limit: cfg.total_limit,
            flood_max_retries: cfg.flood_max_retries,
            backoff_base: Duration::from_millis(cfg.backoff_base_ms),
            backoff_max: Duration::from_millis(cfg.backoff_max_ms),
        }
    }
}

impl Default for PassLimits {
    fn default() -> Self {
        Self::from(&config::Ingest::default())
    }
}

pub struct IngestDeps<'a> {
    pub pool: &'a Pool,
    pub source: &'a dyn SourceClient,
    pub publisher: &'a dyn Publisher,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub sources_visited: usize,
    pub sources_bootstrapped: usize,
    pub events_published: usize,
    pub sources_failed: usize,
}

/// Process every enabled source of the workspace in `source_id` order.
#[instrument(skip_all, fields(workspace_id))]
pub async fn run_pass(
    deps: &IngestDeps<'_>,
    workspace_id: &str,
    limits: &PassLimits,
) -> Result<PassReport, IngestError> {
    let sources = db::list_sources(deps.pool, workspace_id, true).await?;
    let mut report = PassReport::default();
    let mut budget = limits.total_limit;

    for source in &sources {
        if budget == 0 {
            info!("pass budget spent; remaining sources wait for the next pass");
            break;
        }
        report.sources_visited += 1;

        let cursor = cursor::get_cursor(deps.pool, workspace_id, &source.id).await?;
        if !cursor.bootstrapped {
            if bootstrap_source(deps, source, limits).await? {
                report.sources_bootstrapped += 1;
            } else {
                report.sources_failed += 1;
            }
            continue;
        }

        let limit = limits.per_source_limit.min(budget);
        let messages = match fetch_after(deps, source, &cursor, limit, limits).await {
            Ok(messages) => messages,
            Err(FetchFailure::Flood(attempts)) => {
                error!(source_id = %source.id, attempts, "flood limit not lifted; aborting pass");
                return Err(IngestError::FloodAborted {
                    source_id: source.id.clone(),
                    attempts,
                });
            }
            Err(FetchFailure::Source(err)) => {
                error!(source_id = %source.id, ?err, "fetch failed; cursor left as is");
                report.sources_failed += 1;
                continue;
            }
        };
        let batch = new_messages(messages, &cursor, limit);
        budget = budget.saturating_sub(batch.len() as u32);
        if batch.is_empty() {
            continue;
        }

        match publish_batch(deps, workspace_id, source, &batch).await {
            Ok(published) => report.events_published += published,
            Err(published) => {
                report.events_published += published;
                report.sources_failed += 1;
            }
        }
    }

    info!(
        visited = report.sources_visited,
        bootstrapped = report.sources_bootstrapped,
        published = report.events_published,
        failed = report.sources_failed,
        "ingest pass finished"
    );
    Ok(report)
}

enum FetchFailure {
    Flood(u32),
    Source(SourceError),
}

/// Fetch with pass-level flood handling: sleep `max(wait, backoff)` and
/// retry the same source until the retry budget runs out.
async fn with_flood_retry<F, Fut>(
    limits: &PassLimits,
    source_id: &str,
    mut fetch: F,
) -> Result<Vec<SourceMessage>, FetchFailure>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<Vec<SourceMessage>, SourceError>>,
{
    let mut attempts = 0u32;
    loop {
        match fetch().await {
            Ok(messages) => return Ok(messages),
            Err(SourceError::FloodWait(wait)) => {
                attempts += 1;
                if attempts >= limits.flood_max_retries {
                    return Err(FetchFailure::Flood(attempts));
                }
                let delay = wait.max(jitter_delay(limits.backoff_base, attempts - 1, limits.backoff_max));
                warn!(source_id, attempts, ?delay, "flood wait; pausing pass");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(FetchFailure::Source(err)),
        }
    }
}

async fn fetch_after(
    deps: &IngestDeps<'_>,
    source: &Source,
    cursor: &Cursor,
    limit: u32,
    limits: &PassLimits,
) -> Result<Vec<SourceMessage>, FetchFailure> {
    with_flood_retry(limits, &source.id, || {
        deps.source.after(&source.tg_entity, cursor.last_id, limit)
    })
    .await
}

/// First contact: remember the newest id as baseline and emit nothing.
async fn bootstrap_source(deps: &IngestDeps<'_>, source: &Source, limits: &PassLimits) -> Result<bool, IngestError> {
    let latest = match with_flood_retry(limits, &source.id, || deps.source.latest(&source.tg_entity, 1)).await {
        Ok(latest) => latest,
        Err(FetchFailure::Flood(attempts)) => {
            return Err(IngestError::FloodAborted {
                source_id: source.id.clone(),
                attempts,
            })
        }
        Err(FetchFailure::Source(err)) => {
            // Not bootstrapped yet; the next pass tries again.
            error!(source_id = %source.id, ?err, "bootstrap fetch failed");
            return Ok(false);
        }
    };
    let (baseline_id, baseline_date) = latest
        .iter()
        .max_by_key(|m| m.id)
        .map(|m| (m.id, m.date))
        .unwrap_or((0, 0));
    cursor::bootstrap(deps.pool, &source.workspace_id, &source.id, baseline_id, baseline_date).await?;
    Ok(true)
}

/// Ids strictly after the cursor, ascending, deduplicated, at most `limit`.
fn new_messages(mut messages: Vec<SourceMessage>, cursor: &Cursor, limit: u32) -> Vec<SourceMessage> {
    messages.retain(|m| m.id > cursor.last_id);
    messages.sort_by_key(|m| m.id);
    messages.dedup_by_key(|m| m.id);
    messages.truncate(limit as usize);
    messages
}

fn to_event(workspace_id: &str, source: &Source, msg: &SourceMessage) -> DeliveryEvent {
    DeliveryEvent {
        workspace_id: workspace_id.to_string(),
        source_id: source.id.clone(),
        origin_message_id: msg.id,
        origin_text: msg.text.clone(),
        origin_chat: source.tg_entity.clone(),
        origin_message_date: msg.date,
        has_media: msg.has_media,
        trace_id: Uuid::new_v4().to_string(),
    }
}

/// Publish in origin order; the cursor only moves once every event is on
/// the bus. `Err` carries how many were published before the failure.
async fn publish_batch(
    deps: &IngestDeps<'_>,
    workspace_id: &str,
    source: &Source,
    batch: &[SourceMessage],
) -> Result<usize, usize> {
    for (published, msg) in batch.iter().enumerate() {
        let event = to_event(workspace_id, source, msg);
        let key = event.ordering_key();
        if let Err(err) = deps.publisher.publish(&event, &key).await {
            error!(source_id = %source.id, ordering_key = %key, ?err, "publish failed; cursor left as is");
            return Err(published);
        }
    }

    // Batch is sorted, so the last message carries the new cursor.
    let Some(last) = batch.last() else {
        return Ok(0);
    };
    match cursor::advance_cursor(deps.pool, workspace_id, &source.id, last.id, last.date).await {
        Ok(_) => {
            info!(source_id = %source.id, count = batch.len(), last_id = last.id, "source batch published");
            Ok(batch.len())
        }
        Err(err) => {
            // Events are on the bus; redelivery is absorbed by draft dedup.
            error!(source_id = %source.id, ?err, "cursor advance failed after publish");
            Err(batch.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: i64) -> SourceMessage {
        SourceMessage {
            id,
            date: id * 10,
            text: format!("m{}", id),
            has_media: false,
        }
    }

    #[test]
    fn new_messages_filters_sorts_and_caps() {
        let cursor = Cursor {
            last_id: 100,
            last_date: 0,
            bootstrapped: true,
        };
        let batch = new_messages(vec![msg(104), msg(99), msg(101), msg(100), msg(103), msg(101)], &cursor, 2);
        let ids: Vec<i64> = batch.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![101, 103]);
    }

    #[test]
    fn limits_follow_config() {
        let limits = PassLimits::default();
        assert_eq!(limits.per_source_limit, 50);
        assert_eq!(limits.total_limit, 200);
        assert_eq!(limits.backoff_base, Duration::from_secs(2));
    }
}
