//! Sync reconciliation for a feed reader's local article store.
//!
//! [`storage`] holds articles, statuses and the pending change queue in
//! SQLite. [`remote`] talks to cursor-stream and delta-zone services.
//! [`sync`] runs dependency-ordered sync passes that push queued local edits
//! and merge remote state without overwriting them.

pub mod config;
pub mod remote;
pub mod storage;
pub mod sync;
