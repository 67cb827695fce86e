//! Per-source cursor tracking.
//!
//! The cursor is the highest origin id already handed to the bus. It is read
//! fresh on every pass and only advanced after a whole batch published.
use crate::db::{self, Pool};
use anyhow::{anyhow, Result};
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub last_id: i64,
    pub last_date: i64,
    pub bootstrapped: bool,
}

#[instrument(skip_all, fields(workspace_id, source_id))]
pub async fn get_cursor(pool: &Pool, workspace_id: &str, source_id: &str) -> Result<Cursor> {
    let source = db::get_source(pool, workspace_id, source_id)
        .await?
        .ok_or_else(|| anyhow!("source {}/{} not found", workspace_id, source_id))?;
    Ok(Cursor {
        last_id: source.last_message_id,
        last_date: source.last_message_date,
        bootstrapped: source.bootstrapped,
    })
}

/// Advance to `new_last_id`; a no-op returning false when it is not ahead
/// of the stored cursor.
#[instrument(skip_all, fields(workspace_id, source_id, new_last_id))]
pub async fn advance_cursor(
    pool: &Pool,
    workspace_id: &str,
    source_id: &str,
    new_last_id: i64,
    new_last_date: i64,
) -> Result<bool> {
    let advanced =
        db::update_source_offsets(pool, workspace_id, source_id, new_last_id, new_last_date)
            .await?;
    if advanced {
        debug!(source_id, new_last_id, "cursor advanced");
    } else {
        debug!(source_id, new_last_id, "cursor not behind; left as is");
    }
    Ok(advanced)
}

/// Establish the initial baseline without emitting history.
#[instrument(skip_all, fields(workspace_id, source_id, baseline_id))]
pub async fn bootstrap(
    pool: &Pool,
    workspace_id: &str,
    source_id: &str,
    baseline_id: i64,
    baseline_date: i64,
) -> Result<()> {
    if db::mark_source_bootstrapped(pool, workspace_id, source_id, baseline_id, baseline_date)
        .await?
    {
        info!(source_id, baseline_id, "source bootstrapped");
    }
    Ok(())
}
