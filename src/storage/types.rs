use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another instance of the application has locked the database
    #[error("Another instance of tidings appears to be running. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// A stored value could not be decoded
    #[error("Corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },

    /// The status key has no column in the `statuses` table
    #[error("Status key {0} cannot be stored as an article status")]
    UnstoredKey(StatusKey),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5), SQLITE_LOCKED (6), SQLITE_CANTOPEN (14)
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }
}

pub type StoreResult<T> = Result<T, DatabaseError>;

// ============================================================================
// Status Keys
// ============================================================================

/// Which piece of per-article state a pending change refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKey {
    Read,
    Starred,
    /// The article was created locally and the remote has not seen it yet.
    New,
    /// The article was deleted locally and the remote has not seen it yet.
    Deleted,
}

impl StatusKey {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusKey::Read => "read",
            StatusKey::Starred => "starred",
            StatusKey::New => "new",
            StatusKey::Deleted => "deleted",
        }
    }

    /// Column in the `statuses` table backing this key, if any.
    pub(crate) fn status_column(self) -> Option<&'static str> {
        match self {
            StatusKey::Read => Some("read"),
            StatusKey::Starred => Some("starred"),
            StatusKey::New | StatusKey::Deleted => None,
        }
    }
}

impl fmt::Display for StatusKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatusKey {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(StatusKey::Read),
            "starred" => Ok(StatusKey::Starred),
            "new" => Ok(StatusKey::New),
            "deleted" => Ok(StatusKey::Deleted),
            other => Err(DatabaseError::Corrupt {
                table: "sync_status",
                detail: format!("unknown status key {other:?}"),
            }),
        }
    }
}

// ============================================================================
// Pending Changes
// ============================================================================

/// An unacknowledged local status edit awaiting remote confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingChange {
    pub article_id: String,
    pub key: StatusKey,
    pub flag: bool,
    /// Claimed by an in-flight send.
    pub in_progress: bool,
}

impl PendingChange {
    pub fn new(article_id: impl Into<String>, key: StatusKey, flag: bool) -> Self {
        Self {
            article_id: article_id.into(),
            key,
            flag,
            in_progress: false,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct PendingRow {
    pub article_id: String,
    pub key: String,
    pub flag: bool,
    pub selected: bool,
}

impl PendingRow {
    pub(crate) fn into_change(self) -> StoreResult<PendingChange> {
        Ok(PendingChange {
            article_id: self.article_id,
            key: self.key.parse()?,
            flag: self.flag,
            in_progress: self.selected,
        })
    }
}

// ============================================================================
// Articles and Statuses
// ============================================================================

/// Whether newly observed articles start out read or unread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultReadPolicy {
    #[default]
    Unread,
    Read,
}

impl DefaultReadPolicy {
    pub fn read(self) -> bool {
        matches!(self, DefaultReadPolicy::Read)
    }
}

/// Article record as stored locally and exchanged with providers.
///
/// The body fields are opaque to the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Article {
    pub article_id: String,
    pub feed_id: String,
    #[serde(default)]
    pub unique_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content_html: Option<String>,
    #[serde(default)]
    pub content_text: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub external_url: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    /// Unix seconds
    #[serde(default)]
    pub date_published: Option<i64>,
    /// Unix seconds
    #[serde(default)]
    pub date_modified: Option<i64>,
    #[serde(default)]
    pub authors: Vec<String>,
}

impl Article {
    /// Stable identifier for providers that only supply a per-feed unique id.
    pub fn content_addressed_id(feed_id: &str, unique_id: &str) -> String {
        let input = format!("{}|{}", feed_id, unique_id.trim());
        let hash = Sha256::digest(input.as_bytes());
        format!("{:x}", hash)
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ArticleDbRow {
    pub article_id: String,
    pub feed_id: String,
    pub unique_id: String,
    pub title: Option<String>,
    pub content_html: Option<String>,
    pub content_text: Option<String>,
    pub summary: Option<String>,
    pub url: Option<String>,
    pub external_url: Option<String>,
    pub image_url: Option<String>,
    pub date_published: Option<i64>,
    pub date_modified: Option<i64>,
    pub authors: String,
}

impl ArticleDbRow {
    pub(crate) fn into_article(self) -> Article {
        let authors = match serde_json::from_str::<Vec<String>>(&self.authors) {
            Ok(authors) => authors,
            Err(e) => {
                tracing::warn!(article_id = %self.article_id, error = %e, "Unreadable authors column, treating as empty");
                Vec::new()
            }
        };
        Article {
            article_id: self.article_id,
            feed_id: self.feed_id,
            unique_id: self.unique_id,
            title: self.title,
            content_html: self.content_html,
            content_text: self.content_text,
            summary: self.summary,
            url: self.url,
            external_url: self.external_url,
            image_url: self.image_url,
            date_published: self.date_published,
            date_modified: self.date_modified,
            authors,
        }
    }
}

/// Per-article read/starred state.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ArticleStatus {
    pub article_id: String,
    pub read: bool,
    pub starred: bool,
    /// Unix seconds of the first time the id was observed.
    pub date_arrived: i64,
}

/// Result of a field-diffing article upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl UpsertOutcome {
    /// Number of rows actually written.
    pub fn writes(&self) -> usize {
        self.inserted + self.updated
    }
}

// ============================================================================
// Feeds and Folders
// ============================================================================

/// A remote collection (folder) and the feeds it contains, as of the latest snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub feeds: Vec<CollectionFeed>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionFeed {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Feed {
    pub feed_id: String,
    pub title: String,
    pub url: Option<String>,
    pub home_page_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Folder {
    pub id: i64,
    pub external_id: String,
    pub name: String,
}

/// Counts of what a collection mirror pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MirrorOutcome {
    pub folders_added: usize,
    pub folders_renamed: usize,
    pub folders_removed: usize,
    pub feeds_added: usize,
    pub feeds_removed: usize,
    /// Unstarred articles (and their statuses) of removed feeds.
    pub articles_removed: usize,
    pub memberships: usize,
}

// ============================================================================
// Sync State
// ============================================================================

/// Persisted cursor/token state for one stream or zone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncCheckpoint {
    pub token: Option<String>,
    /// Unix seconds at which the last successful fetch started.
    pub last_fetch_start: Option<i64>,
}
