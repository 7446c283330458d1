use crate::remote::retry::{ENTRIES_CHUNK_SIZE, MODIFY_CHUNK_SIZE, STATUS_CHUNK_SIZE};
use crate::remote::RetryPolicy;
use crate::storage::DefaultReadPolicy;

const SECONDS_PER_DAY: i64 = 86_400;

/// Tunables for one sync engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Pending rows claimed per pass.
    pub status_batch_size: usize,
    /// Ids per status push to a cursor-stream provider.
    pub status_chunk_size: usize,
    /// Ids per entry download.
    pub entries_chunk_size: usize,
    /// Records per zone `modify`, and the chunk size used after `LimitExceeded`.
    pub modify_chunk_size: usize,
    /// Entry downloads in flight at once.
    pub download_concurrency: usize,
    pub retry: RetryPolicy,
    pub default_read: DefaultReadPolicy,
    /// Unstarred articles older than this are deleted once the remote stops listing them.
    pub retention_days: i64,
    /// How far back the updated-ids stream looks on a first sync.
    pub unread_window_days: i64,
    /// Zone name for delta-zone providers.
    pub zone_name: String,
    /// Token resets or zone re-creations allowed per fetch before giving up.
    pub max_fetch_restarts: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            status_batch_size: 1000,
            status_chunk_size: STATUS_CHUNK_SIZE,
            entries_chunk_size: ENTRIES_CHUNK_SIZE,
            modify_chunk_size: MODIFY_CHUNK_SIZE,
            download_concurrency: 4,
            retry: RetryPolicy::default(),
            default_read: DefaultReadPolicy::Unread,
            retention_days: 30,
            unread_window_days: 31,
            zone_name: "articles".to_string(),
            max_fetch_restarts: 2,
        }
    }
}

impl SyncSettings {
    pub fn retention_cutoff(&self, now: i64) -> i64 {
        now - self.retention_days * SECONDS_PER_DAY
    }

    pub fn unread_window_start(&self, now: i64) -> i64 {
        now - self.unread_window_days * SECONDS_PER_DAY
    }
}
