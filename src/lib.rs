//! Curation pipeline from monitored public channels to a moderated feed.
//!
//! - `ingest` fetches new channel messages and publishes delivery events.
//! - `processor` consumes the bus and creates drafts.
//! - `approver` drives drafts through moderator review to publication.

pub mod approver;
pub mod auth;
pub mod config;
pub mod cursor;
pub mod db;
pub mod drafts;
pub mod editor;
pub mod ingest;
pub mod model;
pub mod moderator;
pub mod notify;
pub mod processor;
pub mod relay;
pub mod retry;
pub mod source;
pub mod webhook;
pub mod workspace;
