//! Database module: view models and SQL repositories.
//!
//! - `model`: inputs and outcomes exchanged with the repositories.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! Callers import from `tg_curator::db`; the repository API is re-exported
//! here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{CreateOutcome, NewDraft, TransitionUpdate};
