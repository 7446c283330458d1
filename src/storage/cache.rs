//! Bounded in-memory caches owned by [`Database`](super::Database).
//!
//! Both caches are read-through: a miss falls back to SQLite and the result
//! is inserted. Every write path invalidates the affected ids, so a cached
//! value is never newer or older than the row it mirrors.
use lru::LruCache;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};

use super::types::{Article, ArticleStatus};

/// Default number of entries kept per cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 512;

pub(crate) struct StoreCache {
    articles: Mutex<Slot<Article>>,
    statuses: Mutex<Slot<ArticleStatus>>,
}

/// Entries plus an epoch bumped on every invalidation. A read-through fill
/// carries the epoch seen before its query and is dropped if a write
/// invalidated in between, so a row loaded before a commit cannot be cached
/// after it.
struct Slot<V> {
    entries: LruCache<String, V>,
    epoch: u64,
}

impl<V: Clone> Slot<V> {
    fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: LruCache::new(capacity),
            epoch: 0,
        }
    }

    fn lookup(&mut self, ids: &HashSet<String>) -> (Vec<V>, HashSet<String>, u64) {
        let mut found = Vec::new();
        let mut missing = HashSet::new();
        for id in ids {
            match self.entries.get(id) {
                Some(value) => found.push(value.clone()),
                None => {
                    missing.insert(id.clone());
                }
            }
        }
        (found, missing, self.epoch)
    }

    fn fill<'a>(&mut self, epoch: u64, values: impl IntoIterator<Item = (&'a String, &'a V)>)
    where
        V: 'a,
    {
        if epoch != self.epoch {
            return;
        }
        for (id, value) in values {
            self.entries.put(id.clone(), value.clone());
        }
    }

    fn invalidate<'a>(&mut self, ids: impl IntoIterator<Item = &'a String>) {
        self.epoch = self.epoch.wrapping_add(1);
        for id in ids {
            self.entries.pop(id);
        }
    }

    fn clear(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        self.entries.clear();
    }
}

/// Lock a cache mutex, recovering from poisoning (a panic while holding the
/// lock cannot leave an LruCache in an invalid state).
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl StoreCache {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            articles: Mutex::new(Slot::new(capacity)),
            statuses: Mutex::new(Slot::new(capacity)),
        }
    }

    /// Split `ids` into cached articles and ids that must be loaded. The
    /// returned epoch is passed back to [`StoreCache::put_articles`].
    pub(crate) fn articles(&self, ids: &HashSet<String>) -> (Vec<Article>, HashSet<String>, u64) {
        lock(&self.articles).lookup(ids)
    }

    pub(crate) fn put_articles<'a>(&self, epoch: u64, articles: impl IntoIterator<Item = &'a Article>) {
        lock(&self.articles).fill(epoch, articles.into_iter().map(|a| (&a.article_id, a)));
    }

    pub(crate) fn statuses(&self, ids: &HashSet<String>) -> (Vec<ArticleStatus>, HashSet<String>, u64) {
        lock(&self.statuses).lookup(ids)
    }

    pub(crate) fn put_statuses<'a>(
        &self,
        epoch: u64,
        statuses: impl IntoIterator<Item = &'a ArticleStatus>,
    ) {
        lock(&self.statuses).fill(epoch, statuses.into_iter().map(|s| (&s.article_id, s)));
    }

    pub(crate) fn invalidate_articles<'a>(&self, ids: impl IntoIterator<Item = &'a String>) {
        lock(&self.articles).invalidate(ids);
    }

    pub(crate) fn invalidate_statuses<'a>(&self, ids: impl IntoIterator<Item = &'a String>) {
        lock(&self.statuses).invalidate(ids);
    }

    pub(crate) fn clear(&self) {
        lock(&self.articles).clear();
        lock(&self.statuses).clear();
    }

    pub(crate) fn len(&self) -> (usize, usize) {
        (lock(&self.articles).entries.len(), lock(&self.statuses).entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn article(id: &str) -> Article {
        Article {
            article_id: id.to_string(),
            feed_id: "feed/1".to_string(),
            ..Default::default()
        }
    }

    fn ids(values: &[&str]) -> HashSet<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_hit_and_miss_split() {
        let cache = StoreCache::new(8);
        cache.put_articles(0, &[article("a"), article("b")]);

        let (found, missing, _) = cache.articles(&ids(&["a", "c"]));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].article_id, "a");
        assert_eq!(missing, ids(&["c"]));
    }

    #[test]
    fn test_capacity_is_bounded() {
        let cache = StoreCache::new(2);
        cache.put_articles(0, &[article("a"), article("b"), article("c")]);
        assert_eq!(cache.len().0, 2);

        let (_, missing, _) = cache.articles(&ids(&["a"]));
        assert_eq!(missing, ids(&["a"]), "least recently used entry is evicted");
    }

    #[test]
    fn test_invalidate_and_clear() {
        let cache = StoreCache::new(8);
        cache.put_articles(0, &[article("a"), article("b")]);
        cache.put_statuses(0, &[ArticleStatus {
            article_id: "a".into(),
            read: false,
            starred: false,
            date_arrived: 0,
        }]);

        cache.invalidate_articles(&ids(&["a"]));
        let (_, missing, _) = cache.articles(&ids(&["a", "b"]));
        assert_eq!(missing, ids(&["a"]));

        cache.clear();
        assert_eq!(cache.len(), (0, 0));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let cache = StoreCache::new(0);
        cache.put_articles(0, &[article("a")]);
        assert_eq!(cache.len().0, 1);
    }

    #[test]
    fn test_fill_after_invalidation_is_dropped() {
        let cache = StoreCache::new(8);
        let stale = ArticleStatus {
            article_id: "a".into(),
            read: false,
            starred: false,
            date_arrived: 0,
        };

        // Miss, then a write lands before the loaded row is cached.
        let (_, missing, epoch) = cache.statuses(&ids(&["a"]));
        assert_eq!(missing, ids(&["a"]));
        cache.invalidate_statuses(&ids(&["a"]));
        cache.put_statuses(epoch, &[stale.clone()]);

        let (found, missing, epoch) = cache.statuses(&ids(&["a"]));
        assert!(found.is_empty());
        assert_eq!(missing, ids(&["a"]));

        cache.put_statuses(epoch, &[stale]);
        let (found, _, _) = cache.statuses(&ids(&["a"]));
        assert_eq!(found.len(), 1);
    }
}
