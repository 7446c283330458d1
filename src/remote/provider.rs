//! Provider-agnostic interface to a remote sync service.
//!
//! A provider either exposes paginated id streams ([`CursorStream`]) or a
//! token-based change feed over a record zone ([`DeltaZone`]). Both accept
//! status pushes through [`StatusSender`]. Implementations make a single
//! attempt per call; retrying and chunking live in [`super::retry`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::RemoteResult;
use crate::storage::{Article, Collection, StatusKey};

// ============================================================================
// Status Push
// ============================================================================

#[async_trait]
pub trait StatusSender: Send + Sync {
    /// Tell the remote that `key` is now `flag` for every id in `article_ids`.
    ///
    /// Success means the remote has durably applied the whole batch.
    async fn send_status_batch(
        &self,
        article_ids: &[String],
        key: StatusKey,
        flag: bool,
    ) -> RemoteResult<()>;
}

// ============================================================================
// Cursor Stream
// ============================================================================

/// Which id stream to page through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamResource {
    All,
    Unread,
    Starred,
}

impl StreamResource {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamResource::All => "all",
            StreamResource::Unread => "unread",
            StreamResource::Starred => "starred",
        }
    }
}

impl fmt::Display for StreamResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional narrowing applied by the remote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFilter {
    /// Only ids updated at or after this Unix time (seconds).
    pub newer_than: Option<i64>,
    /// Page size hint.
    pub count: Option<u32>,
}

/// One page of ids. `continuation` is `None` on the last page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct IdPage {
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(default)]
    pub continuation: Option<String>,
}

#[async_trait]
pub trait CursorStream: StatusSender {
    async fn fetch_page(
        &self,
        resource: StreamResource,
        continuation: Option<&str>,
        filter: &StreamFilter,
    ) -> RemoteResult<IdPage>;

    /// The current folder/feed layout.
    async fn fetch_collections(&self) -> RemoteResult<Vec<Collection>>;

    /// Full article records for `article_ids`. Unknown ids are omitted.
    async fn fetch_entries(&self, article_ids: &[String]) -> RemoteResult<Vec<Article>>;
}

// ============================================================================
// Delta Zone
// ============================================================================

/// Key of a record in a zone: `s|{article_id}` for statuses, `a|{article_id}`
/// for article bodies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RecordKey {
    Status(String),
    Article(String),
}

impl RecordKey {
    pub fn article_id(&self) -> &str {
        match self {
            RecordKey::Status(id) | RecordKey::Article(id) => id,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Status(id) => write!(f, "s|{id}"),
            RecordKey::Article(id) => write!(f, "a|{id}"),
        }
    }
}

impl TryFrom<String> for RecordKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.split_once('|') {
            Some(("s", id)) if !id.is_empty() => Ok(RecordKey::Status(id.to_string())),
            Some(("a", id)) if !id.is_empty() => Ok(RecordKey::Article(id.to_string())),
            _ => Err(format!("invalid record key {value:?}")),
        }
    }
}

impl From<RecordKey> for String {
    fn from(key: RecordKey) -> Self {
        key.to_string()
    }
}

/// Status fields carried by a status record. `None` means the record does
/// not speak for that field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    pub article_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starred: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ZoneRecord {
    Status(StatusRecord),
    Article(Article),
}

impl ZoneRecord {
    pub fn key(&self) -> RecordKey {
        match self {
            ZoneRecord::Status(status) => RecordKey::Status(status.article_id.clone()),
            ZoneRecord::Article(article) => RecordKey::Article(article.article_id.clone()),
        }
    }
}

/// One batch of the change feed since a token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneChanges {
    #[serde(default)]
    pub changed: Vec<ZoneRecord>,
    #[serde(default)]
    pub deleted: Vec<RecordKey>,
    #[serde(default)]
    pub new_token: Option<String>,
    /// More batches are available from `new_token`.
    #[serde(default)]
    pub more_coming: bool,
}

#[async_trait]
pub trait DeltaZone: StatusSender {
    /// Changes since `token`; `None` fetches everything.
    async fn fetch_changes(&self, token: Option<&str>) -> RemoteResult<ZoneChanges>;

    async fn modify(&self, save: &[ZoneRecord], delete: &[RecordKey]) -> RemoteResult<()>;

    /// Create the zone. Succeeds if it already exists.
    async fn create_zone(&self) -> RemoteResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_key_round_trips_through_string() {
        let key = RecordKey::try_from("s|abc|def".to_string()).unwrap();
        assert_eq!(key, RecordKey::Status("abc|def".to_string()));
        assert_eq!(key.to_string(), "s|abc|def");
        assert_eq!(key.article_id(), "abc|def");
    }

    #[test]
    fn test_record_key_rejects_unknown_prefix() {
        assert!(RecordKey::try_from("x|abc".to_string()).is_err());
        assert!(RecordKey::try_from("s|".to_string()).is_err());
        assert!(RecordKey::try_from("abc".to_string()).is_err());
    }

    #[test]
    fn test_zone_changes_decode() {
        let json = r#"{
            "changed": [
                {"type": "status", "articleId": "a1", "starred": true},
                {"type": "article", "articleId": "a2", "feedId": "f1", "title": "Hello"}
            ],
            "deleted": ["a|a3", "s|a3"],
            "newToken": "t2",
            "moreComing": true
        }"#;
        let changes: ZoneChanges = serde_json::from_str(json).unwrap();
        assert_eq!(changes.changed.len(), 2);
        assert_eq!(
            changes.changed[0],
            ZoneRecord::Status(StatusRecord {
                article_id: "a1".into(),
                read: None,
                starred: Some(true),
            })
        );
        assert_eq!(changes.changed[1].key(), RecordKey::Article("a2".into()));
        assert_eq!(changes.deleted[1], RecordKey::Status("a3".into()));
        assert_eq!(changes.new_token.as_deref(), Some("t2"));
        assert!(changes.more_coming);
    }
}
