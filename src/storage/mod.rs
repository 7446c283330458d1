mod articles;
mod cache;
mod folders;
mod pending;
mod schema;
mod statuses;
mod sync_state;
mod types;

pub use cache::DEFAULT_CACHE_CAPACITY;
pub use schema::Database;
pub use types::{
    Article, ArticleStatus, Collection, CollectionFeed, DatabaseError, DefaultReadPolicy, Feed,
    Folder, MirrorOutcome, PendingChange, StatusKey, StoreResult, SyncCheckpoint, UpsertOutcome,
};

/// Ids bound per `IN (...)` list. Keeps every statement under SQLite's
/// bound-parameter limit.
pub(crate) const ID_CHUNK: usize = 500;

/// Collect a set into a sorted vector so chunked statements run in a stable order.
pub(crate) fn sorted_ids(ids: &std::collections::HashSet<String>) -> Vec<&String> {
    let mut ids: Vec<&String> = ids.iter().collect();
    ids.sort();
    ids
}
