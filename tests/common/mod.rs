//! In-process fake providers shared by the sync integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;

use tidings::remote::{
    CursorStream, DeltaZone, IdPage, RecordKey, RemoteError, RemoteResult, StatusSender,
    StreamFilter, StreamResource, ZoneChanges, ZoneRecord,
};
use tidings::storage::{Article, Collection, CollectionFeed, Database, StatusKey};
use tidings::sync::{queue_local_edit, SyncSettings};

pub fn set(ids: &[&str]) -> HashSet<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

pub fn article(id: &str) -> Article {
    Article {
        article_id: id.to_string(),
        feed_id: "f1".to_string(),
        unique_id: id.to_string(),
        title: Some(format!("Article {id}")),
        ..Default::default()
    }
}

/// Settings with no backoff so retries do not slow tests down.
pub fn fast_settings() -> SyncSettings {
    let mut settings = SyncSettings::default();
    settings.retry.base_delay = std::time::Duration::from_millis(1);
    settings
}

// ============================================================================
// Cursor Stream
// ============================================================================

/// A remote holding id sets, served in fixed-size pages.
///
/// Continuations are `p2`, `p3`, ... for the second, third, ... page. Status
/// pushes are applied to the sets, like a real service would.
pub struct FakeStream {
    pub page_size: usize,
    pub all: Mutex<BTreeSet<String>>,
    pub unread: Mutex<BTreeSet<String>>,
    pub starred: Mutex<BTreeSet<String>>,
    pub collections: Vec<Collection>,
    /// `page:{resource}:{continuation or -}`, `send:{key}:{flag}:{count}`, `entries:{count}`
    pub calls: Mutex<Vec<String>>,
    /// Returned by the next status push.
    pub send_error: Mutex<Option<RemoteError>>,
    /// The next fetch of this page never completes.
    pub stall_page: Mutex<Option<(StreamResource, Option<String>)>>,
    /// The next status push never completes.
    pub stall_send: Mutex<bool>,
    pub stalled: Notify,
    /// While serving this resource, star an article locally (a user edit racing the sync).
    pub star_during: Mutex<Option<(StreamResource, Database, String)>>,
}

impl FakeStream {
    pub fn new(all: &[&str], unread: &[&str], starred: &[&str]) -> Self {
        let to_set = |ids: &[&str]| ids.iter().map(|s| s.to_string()).collect();
        Self {
            page_size: 3,
            all: Mutex::new(to_set(all)),
            unread: Mutex::new(to_set(unread)),
            starred: Mutex::new(to_set(starred)),
            collections: vec![Collection {
                id: "c1".to_string(),
                label: "Tech".to_string(),
                feeds: vec![CollectionFeed {
                    id: "f1".to_string(),
                    title: "Feed One".to_string(),
                    url: Some("https://example.com/feed.xml".to_string()),
                    website: None,
                }],
            }],
            calls: Mutex::new(Vec::new()),
            send_error: Mutex::new(None),
            stall_page: Mutex::new(None),
            stall_send: Mutex::new(false),
            stalled: Notify::new(),
            star_during: Mutex::new(None),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn unread(&self) -> HashSet<String> {
        self.unread.lock().unwrap().iter().cloned().collect()
    }

    fn ids_for(&self, resource: StreamResource) -> Vec<String> {
        let source = match resource {
            StreamResource::All => &self.all,
            StreamResource::Unread => &self.unread,
            StreamResource::Starred => &self.starred,
        };
        source.lock().unwrap().iter().cloned().collect()
    }
}

fn page_index(continuation: Option<&str>) -> usize {
    continuation
        .and_then(|c| c.strip_prefix('p'))
        .and_then(|n| n.parse::<usize>().ok())
        .map_or(0, |n| n - 1)
}

#[async_trait]
impl StatusSender for FakeStream {
    async fn send_status_batch(
        &self,
        article_ids: &[String],
        key: StatusKey,
        flag: bool,
    ) -> RemoteResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("send:{key}:{flag}:{}", article_ids.len()));

        let stall = std::mem::take(&mut *self.stall_send.lock().unwrap());
        if stall {
            self.stalled.notify_one();
            std::future::pending::<()>().await;
        }
        if let Some(e) = self.send_error.lock().unwrap().take() {
            return Err(e);
        }

        let (target, insert) = match key {
            StatusKey::Read => (&self.unread, !flag),
            StatusKey::Starred => (&self.starred, flag),
            StatusKey::New | StatusKey::Deleted => return Ok(()),
        };
        let mut target = target.lock().unwrap();
        for id in article_ids {
            if insert {
                target.insert(id.clone());
            } else {
                target.remove(id);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CursorStream for FakeStream {
    async fn fetch_page(
        &self,
        resource: StreamResource,
        continuation: Option<&str>,
        _filter: &StreamFilter,
    ) -> RemoteResult<IdPage> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("page:{resource}:{}", continuation.unwrap_or("-")));

        let stall = {
            let mut stall_page = self.stall_page.lock().unwrap();
            let hit = stall_page
                .as_ref()
                .is_some_and(|(r, c)| *r == resource && c.as_deref() == continuation);
            if hit {
                stall_page.take();
            }
            hit
        };
        if stall {
            self.stalled.notify_one();
            std::future::pending::<()>().await;
        }

        let edit = {
            let mut star_during = self.star_during.lock().unwrap();
            match star_during.as_ref() {
                Some((r, _, _)) if *r == resource => star_during.take(),
                _ => None,
            }
        };
        if let Some((_, db, id)) = edit {
            queue_local_edit(&db, &set(&[id.as_str()]), StatusKey::Starred, true)
                .await
                .map_err(|e| RemoteError::Decode(e.to_string()))?;
        }

        let ids = self.ids_for(resource);
        let index = page_index(continuation);
        let start = (index * self.page_size).min(ids.len());
        let end = (start + self.page_size).min(ids.len());
        let continuation = (end < ids.len()).then(|| format!("p{}", index + 2));
        Ok(IdPage {
            ids: ids[start..end].to_vec(),
            continuation,
        })
    }

    async fn fetch_collections(&self) -> RemoteResult<Vec<Collection>> {
        Ok(self.collections.clone())
    }

    async fn fetch_entries(&self, article_ids: &[String]) -> RemoteResult<Vec<Article>> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("entries:{}", article_ids.len()));
        let all = self.all.lock().unwrap();
        Ok(article_ids
            .iter()
            .filter(|id| all.contains(*id))
            .map(|id| article(id))
            .collect())
    }
}

// ============================================================================
// Delta Zone
// ============================================================================

/// A zone that replays scripted change-feed responses.
#[derive(Default)]
pub struct FakeZone {
    /// Responses to successive `fetch_changes` calls. When exhausted, an
    /// empty final batch echoing the request token is returned.
    pub responses: Mutex<VecDeque<RemoteResult<ZoneChanges>>>,
    pub fetched_tokens: Mutex<Vec<Option<String>>>,
    pub sent: Mutex<Vec<(Vec<String>, StatusKey, bool)>>,
    pub modified: Mutex<Vec<(Vec<ZoneRecord>, Vec<RecordKey>)>>,
    pub zones_created: AtomicU32,
}

impl FakeZone {
    pub fn with_responses(responses: Vec<RemoteResult<ZoneChanges>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            ..Default::default()
        }
    }

    pub fn fetched_tokens(&self) -> Vec<Option<String>> {
        self.fetched_tokens.lock().unwrap().clone()
    }

    pub fn zones_created(&self) -> u32 {
        self.zones_created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusSender for FakeZone {
    async fn send_status_batch(
        &self,
        article_ids: &[String],
        key: StatusKey,
        flag: bool,
    ) -> RemoteResult<()> {
        self.sent
            .lock()
            .unwrap()
            .push((article_ids.to_vec(), key, flag));
        Ok(())
    }
}

#[async_trait]
impl DeltaZone for FakeZone {
    async fn fetch_changes(&self, token: Option<&str>) -> RemoteResult<ZoneChanges> {
        self.fetched_tokens
            .lock()
            .unwrap()
            .push(token.map(str::to_string));
        let next = self.responses.lock().unwrap().pop_front();
        next.unwrap_or_else(|| {
            Ok(ZoneChanges {
                new_token: token.map(str::to_string),
                ..Default::default()
            })
        })
    }

    async fn modify(&self, save: &[ZoneRecord], delete: &[RecordKey]) -> RemoteResult<()> {
        self.modified
            .lock()
            .unwrap()
            .push((save.to_vec(), delete.to_vec()));
        Ok(())
    }

    async fn create_zone(&self) -> RemoteResult<()> {
        self.zones_created.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
