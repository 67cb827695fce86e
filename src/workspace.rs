use crate::config::WorkspaceSeed;
use crate::db::{self, Pool};
use crate::model::Workspace;
use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

static SOURCE_HANDLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("valid regex"));

/// TTL cache of workspace rows, shared through router state.
#[derive(Debug)]
pub struct WorkspaceCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, (Instant, Workspace)>>,
}

impl WorkspaceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Cached workspace, reloaded from the store once the entry is older
    /// than the TTL. Unknown workspaces are not cached.
    pub async fn get(&self, pool: &Pool, workspace_id: &str) -> Result<Option<Workspace>> {
        {
            let entries = self.entries.read().await;
            if let Some((loaded_at, ws)) = entries.get(workspace_id) {
                if loaded_at.elapsed() < self.ttl {
                    return Ok(Some(ws.clone()));
                }
            }
        }
        self.refresh(pool, workspace_id).await
    }

    pub async fn refresh(&self, pool: &Pool, workspace_id: &str) -> Result<Option<Workspace>> {
        let loaded = db::get_workspace(pool, workspace_id).await?;
        let mut entries = self.entries.write().await;
        match &loaded {
            Some(ws) => {
                debug!(workspace_id, "workspace loaded into cache");
                entries.insert(workspace_id.to_string(), (Instant::now(), ws.clone()));
            }
            None => {
                entries.remove(workspace_id);
            }
        }
        Ok(loaded)
    }
}

/// Strip a leading `@`, drop blanks and duplicates, and require plain
/// channel usernames. Order is preserved.
pub fn normalize_sources(raw: &[String]) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for item in raw {
        let handle = item.trim().trim_start_matches('@');
        if handle.is_empty() || !seen.insert(handle.to_string()) {
            continue;
        }
        if !SOURCE_HANDLE_RE.is_match(handle) {
            bail!("source {:?} is not a channel username (letters, digits, underscores)", item);
        }
        out.push(handle.to_string());
    }
    if out.is_empty() {
        bail!("workspace.sources must list at least one channel");
    }
    Ok(out)
}

/// Upsert the workspace row and its sources. Source ids are the bare
/// handles; `tg_entity` is `@handle`.
pub async fn provision(pool: &Pool, workspace_id: &str, seed: &WorkspaceSeed, reset_cursors: bool) -> Result<Vec<String>> {
    let sources = normalize_sources(&seed.sources)?;
    let ws = Workspace {
        id: workspace_id.to_string(),
        title: seed.title.trim().to_string(),
        tg_group_chat_id: seed.group_chat_id,
        ingest_thread_id: seed.ingest_thread_id,
        review_thread_id: seed.review_thread_id,
        publish_channel: seed.publish_channel.clone().filter(|c| !c.trim().is_empty()),
        gpt_profile: seed.gpt_profile.clone().filter(|p| !p.trim().is_empty()),
    };
    db::upsert_workspace(pool, &ws).await?;
    for handle in &sources {
        db::upsert_source(pool, workspace_id, handle, &format!("@{}", handle), true, reset_cursors).await?;
        info!(workspace_id, source_id = %handle, "source upserted");
    }
    info!(workspace_id, sources = sources.len(), "workspace provisioned");
    Ok(sources)
}
