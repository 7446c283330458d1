use sqlx::{QueryBuilder, SqliteConnection};
use std::collections::HashSet;

use super::schema::Database;
use super::types::{ArticleStatus, DatabaseError, StatusKey, StoreResult};
use super::{sorted_ids, ID_CHUNK};

/// Insert statuses for ids that have none, returning the ids created.
///
/// Shared by [`Database::ensure_statuses`] and the article upsert so both
/// create statuses inside their own transaction.
pub(crate) async fn insert_missing_statuses(
    conn: &mut SqliteConnection,
    ids: &[&String],
    read: bool,
) -> Result<HashSet<String>, sqlx::Error> {
    let now = chrono::Utc::now().timestamp();
    let mut created = HashSet::new();
    for chunk in ids.chunks(ID_CHUNK / 2) {
        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("INSERT INTO statuses (article_id, read, starred, date_arrived) ");
        builder.push_values(chunk, |mut b, id| {
            b.push_bind(*id).push_bind(read).push_bind(false).push_bind(now);
        });
        builder.push(" ON CONFLICT(article_id) DO NOTHING RETURNING article_id");
        let rows: Vec<(String,)> = builder.build_query_as().fetch_all(&mut *conn).await?;
        created.extend(rows.into_iter().map(|(id,)| id));
    }
    Ok(created)
}

impl Database {
    // ========================================================================
    // Status Writes
    // ========================================================================

    /// Create statuses for ids seen for the first time.
    ///
    /// Existing statuses are left untouched. Returns the ids that were created.
    pub async fn ensure_statuses(
        &self,
        article_ids: &HashSet<String>,
        read: bool,
    ) -> StoreResult<HashSet<String>> {
        if article_ids.is_empty() {
            return Ok(HashSet::new());
        }

        let ids = sorted_ids(article_ids);
        let mut tx = self.pool.begin().await?;
        let created = insert_missing_statuses(&mut *tx, &ids, read).await?;
        tx.commit().await?;

        self.cache.invalidate_statuses(&created);
        if !created.is_empty() {
            tracing::debug!(created = created.len(), read = read, "Created article statuses");
        }
        Ok(created)
    }

    /// Set `key` to `flag` for every id, creating missing statuses first.
    ///
    /// Returns the ids whose stored value actually changed.
    pub async fn mark(
        &self,
        article_ids: &HashSet<String>,
        key: StatusKey,
        flag: bool,
    ) -> StoreResult<HashSet<String>> {
        self.mark_statuses(article_ids, key, flag, false).await
    }

    /// Like [`Database::mark`], but leaves ids that have a queued change for
    /// `key` untouched. The check runs inside the UPDATE, so an edit queued
    /// after the caller read the pending set is still respected.
    pub async fn mark_unless_pending(
        &self,
        article_ids: &HashSet<String>,
        key: StatusKey,
        flag: bool,
    ) -> StoreResult<HashSet<String>> {
        self.mark_statuses(article_ids, key, flag, true).await
    }

    async fn mark_statuses(
        &self,
        article_ids: &HashSet<String>,
        key: StatusKey,
        flag: bool,
        skip_pending: bool,
    ) -> StoreResult<HashSet<String>> {
        let column = key.status_column().ok_or(DatabaseError::UnstoredKey(key))?;
        if article_ids.is_empty() {
            return Ok(HashSet::new());
        }

        let now = chrono::Utc::now().timestamp();
        let ids = sorted_ids(article_ids);
        let mut changed = HashSet::new();
        let mut tx = self.pool.begin().await?;
        for chunk in ids.chunks(ID_CHUNK / 2) {
            // A status created here starts at the opposite value so the UPDATE
            // below reports it as changed.
            let mut insert: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "INSERT INTO statuses (article_id, read, starred, date_arrived) ",
            );
            insert.push_values(chunk, |mut b, id| {
                let (read, starred) = match key {
                    StatusKey::Read => (!flag, false),
                    _ => (false, !flag),
                };
                b.push_bind(*id).push_bind(read).push_bind(starred).push_bind(now);
            });
            insert.push(" ON CONFLICT(article_id) DO NOTHING");
            insert.build().execute(&mut *tx).await?;

            let mut update: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new(format!("UPDATE statuses SET {column} = "));
            update.push_bind(flag);
            update.push(format!(" WHERE {column} != "));
            update.push_bind(flag);
            if skip_pending {
                update.push(
                    " AND NOT EXISTS (SELECT 1 FROM sync_status p \
                     WHERE p.article_id = statuses.article_id AND p.key = ",
                );
                update.push_bind(key.as_str());
                update.push(")");
            }
            update.push(" AND article_id IN (");
            let mut separated = update.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(") RETURNING article_id");
            let rows: Vec<(String,)> = update.build_query_as().fetch_all(&mut *tx).await?;
            changed.extend(rows.into_iter().map(|(id,)| id));
        }
        tx.commit().await?;

        self.cache.invalidate_statuses(ids.iter().copied());
        Ok(changed)
    }

    /// Remove statuses outright. Used when the remote deletes an article.
    pub async fn delete_statuses(&self, article_ids: &HashSet<String>) -> StoreResult<u64> {
        if article_ids.is_empty() {
            return Ok(0);
        }

        let ids = sorted_ids(article_ids);
        let mut deleted = 0;
        let mut tx = self.pool.begin().await?;
        for chunk in ids.chunks(ID_CHUNK) {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("DELETE FROM statuses WHERE article_id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
            deleted += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;

        self.cache.invalidate_statuses(ids.iter().copied());
        Ok(deleted)
    }

    /// Delete read, unstarred statuses older than `cutoff` whose article is gone.
    pub async fn prune_statuses(&self, cutoff: i64) -> StoreResult<u64> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            DELETE FROM statuses
            WHERE date_arrived < ?
              AND read = 1
              AND starred = 0
              AND NOT EXISTS (SELECT 1 FROM articles a WHERE a.article_id = statuses.article_id)
            RETURNING article_id
        "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let pruned: Vec<String> = rows.into_iter().map(|(id,)| id).collect();
        self.cache.invalidate_statuses(&pruned);
        if !pruned.is_empty() {
            tracing::info!(pruned = pruned.len(), cutoff = cutoff, "Pruned old statuses");
        }
        Ok(pruned.len() as u64)
    }

    // ========================================================================
    // Status Queries
    // ========================================================================

    /// Statuses for the given ids. Unknown ids are skipped.
    pub async fn statuses(&self, article_ids: &HashSet<String>) -> StoreResult<Vec<ArticleStatus>> {
        let (mut found, missing, epoch) = self.cache.statuses(article_ids);
        if missing.is_empty() {
            return Ok(found);
        }

        let ids = sorted_ids(&missing);
        let mut loaded = Vec::new();
        for chunk in ids.chunks(ID_CHUNK) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "SELECT article_id, read, starred, date_arrived FROM statuses WHERE article_id IN (",
            );
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
            let rows: Vec<ArticleStatus> = builder.build_query_as().fetch_all(&self.pool).await?;
            loaded.extend(rows);
        }

        self.cache.put_statuses(epoch, &loaded);
        found.extend(loaded);
        Ok(found)
    }

    /// Ids whose `key` status equals `flag`.
    pub async fn ids_with_flag(&self, key: StatusKey, flag: bool) -> StoreResult<HashSet<String>> {
        let column = key.status_column().ok_or(DatabaseError::UnstoredKey(key))?;
        let rows: Vec<(String,)> =
            sqlx::query_as(&format!("SELECT article_id FROM statuses WHERE {column} = ?"))
                .bind(flag)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn unread_ids(&self) -> StoreResult<HashSet<String>> {
        self.ids_with_flag(StatusKey::Read, false).await
    }

    pub async fn starred_ids(&self) -> StoreResult<HashSet<String>> {
        self.ids_with_flag(StatusKey::Starred, true).await
    }

    /// Ids that have a status but no article row, limited to starred ids and
    /// ids that arrived after `cutoff`. These are the articles to download.
    pub async fn ids_missing_or_stale_since(&self, cutoff: i64) -> StoreResult<HashSet<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT s.article_id FROM statuses s
            WHERE (s.starred = 1 OR s.date_arrived > ?)
              AND NOT EXISTS (SELECT 1 FROM articles a WHERE a.article_id = s.article_id)
        "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn set(values: &[&str]) -> HashSet<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_ensure_statuses_returns_only_new_ids() {
        let db = test_db().await;
        let created = db.ensure_statuses(&set(&["a", "b"]), false).await.unwrap();
        assert_eq!(created, set(&["a", "b"]));

        let created = db.ensure_statuses(&set(&["b", "c"]), true).await.unwrap();
        assert_eq!(created, set(&["c"]));

        let statuses = db.statuses(&set(&["b", "c"])).await.unwrap();
        let b = statuses.iter().find(|s| s.article_id == "b").unwrap();
        let c = statuses.iter().find(|s| s.article_id == "c").unwrap();
        assert!(!b.read, "existing status keeps its value");
        assert!(c.read, "new status uses the ingestion policy");
    }

    #[tokio::test]
    async fn test_mark_reports_only_changes() {
        let db = test_db().await;
        db.ensure_statuses(&set(&["a", "b"]), false).await.unwrap();
        db.mark(&set(&["a"]), StatusKey::Read, true).await.unwrap();

        let changed = db.mark(&set(&["a", "b"]), StatusKey::Read, true).await.unwrap();
        assert_eq!(changed, set(&["b"]));
        assert!(db.unread_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_creates_missing_status() {
        let db = test_db().await;
        let changed = db.mark(&set(&["x"]), StatusKey::Starred, true).await.unwrap();
        assert_eq!(changed, set(&["x"]));
        assert_eq!(db.starred_ids().await.unwrap(), set(&["x"]));
        assert_eq!(db.unread_ids().await.unwrap(), set(&["x"]));
    }

    #[tokio::test]
    async fn test_mark_rejects_keys_without_column() {
        let db = test_db().await;
        let err = db.mark(&set(&["a"]), StatusKey::Deleted, true).await;
        assert!(matches!(err, Err(DatabaseError::UnstoredKey(StatusKey::Deleted))));
    }

    #[tokio::test]
    async fn test_status_cache_invalidated_by_mark() {
        let db = test_db().await;
        db.ensure_statuses(&set(&["a"]), false).await.unwrap();
        let before = db.statuses(&set(&["a"])).await.unwrap();
        assert!(!before[0].read);

        db.mark(&set(&["a"]), StatusKey::Read, true).await.unwrap();
        let after = db.statuses(&set(&["a"])).await.unwrap();
        assert!(after[0].read);
    }

    #[tokio::test]
    async fn test_missing_ids_includes_starred_and_recent() {
        let db = test_db().await;
        db.ensure_statuses(&set(&["recent", "old", "old-starred"]), false)
            .await
            .unwrap();
        sqlx::query("UPDATE statuses SET date_arrived = 100 WHERE article_id IN ('old', 'old-starred')")
            .execute(&db.pool)
            .await
            .unwrap();
        db.mark(&set(&["old-starred"]), StatusKey::Starred, true)
            .await
            .unwrap();

        let missing = db.ids_missing_or_stale_since(1000).await.unwrap();
        assert_eq!(missing, set(&["recent", "old-starred"]));
    }

    #[tokio::test]
    async fn test_prune_statuses_only_removes_read_unstarred_orphans() {
        let db = test_db().await;
        db.ensure_statuses(&set(&["read-old", "unread-old", "starred-old"]), true)
            .await
            .unwrap();
        db.mark(&set(&["unread-old"]), StatusKey::Read, false)
            .await
            .unwrap();
        db.mark(&set(&["starred-old"]), StatusKey::Starred, true)
            .await
            .unwrap();
        sqlx::query("UPDATE statuses SET date_arrived = 100")
            .execute(&db.pool)
            .await
            .unwrap();

        assert_eq!(db.prune_statuses(1000).await.unwrap(), 1);
        let remaining = db
            .statuses(&set(&["read-old", "unread-old", "starred-old"]))
            .await
            .unwrap();
        let ids: HashSet<String> = remaining.into_iter().map(|s| s.article_id).collect();
        assert_eq!(ids, set(&["unread-old", "starred-old"]));
    }

    #[tokio::test]
    async fn test_mark_unless_pending_skips_queued_ids() {
        let db = test_db().await;
        db.ensure_statuses(&set(&["a", "b"]), false).await.unwrap();
        // Queued after any pending set a caller might have read.
        db.enqueue("a", StatusKey::Read, false).await.unwrap();

        let changed = db
            .mark_unless_pending(&set(&["a", "b"]), StatusKey::Read, true)
            .await
            .unwrap();
        assert_eq!(changed, set(&["b"]));
        assert_eq!(db.unread_ids().await.unwrap(), set(&["a"]));

        // A queued change for another key does not block this one.
        db.enqueue("b", StatusKey::Starred, true).await.unwrap();
        let changed = db
            .mark_unless_pending(&set(&["b"]), StatusKey::Read, false)
            .await
            .unwrap();
        assert_eq!(changed, set(&["b"]));
    }
}
