//! Repository inputs and outcomes.
//!
//! Keep these focused on what the queries need. Transition rules live in
//! `crate::drafts`.

use crate::model::{Draft, DraftStatus, SkipReason};

/// Everything needed to insert a draft for one delivery event.
#[derive(Debug, Clone)]
pub struct NewDraft {
    pub workspace_id: String,
    pub id: String,
    pub source_id: String,
    pub origin_chat: String,
    pub origin_message_id: i64,
    pub origin_message_date: i64,
    pub origin_text: String,
    pub has_media: bool,
    pub status: DraftStatus,
    pub skip_reason: Option<SkipReason>,
    pub trace_id: Option<String>,
}

/// Result of a create-if-absent insert.
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    Created(Draft),
    Exists(Draft),
}

impl CreateOutcome {
    pub fn draft(&self) -> &Draft {
        match self {
            CreateOutcome::Created(d) | CreateOutcome::Exists(d) => d,
        }
    }
}

/// Fields written when a claimed transition completes. `None` leaves the
/// stored value untouched, except `skip_reason`, which is always written.
#[derive(Debug, Clone)]
pub struct TransitionUpdate {
    pub status: DraftStatus,
    pub red_text: Option<String>,
    pub skip_reason: Option<SkipReason>,
    pub review_message_id: Option<i32>,
}

impl TransitionUpdate {
    pub fn to(status: DraftStatus) -> Self {
        Self {
            status,
            red_text: None,
            skip_reason: None,
            review_message_id: None,
        }
    }
}
