use sqlx::{QueryBuilder, Sqlite};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::schema::Database;
use super::types::{Collection, CollectionFeed, Feed, Folder, MirrorOutcome, StoreResult};
use super::ID_CHUNK;

impl Database {
    // ========================================================================
    // Folder Mirroring
    // ========================================================================

    /// Make local folders, feeds and memberships match a remote collection snapshot.
    ///
    /// Folders are matched on their remote id: new ones are created, renamed
    /// ones updated, absent ones removed together with their memberships.
    /// Feeds that no longer appear in any collection are removed along with
    /// their articles and statuses, except starred articles and articles with
    /// queued local changes. Running the same snapshot twice, in any order,
    /// changes nothing the second time.
    ///
    /// `memberships` in the outcome counts folder/feed edges added plus removed.
    pub async fn mirror_collections(&self, collections: &[Collection]) -> StoreResult<MirrorOutcome> {
        // Normalise the snapshot first so the result does not depend on input order.
        let mut labels: BTreeMap<&str, &str> = BTreeMap::new();
        let mut wanted_feeds: BTreeMap<&str, &CollectionFeed> = BTreeMap::new();
        let mut wanted_edges: BTreeSet<(&str, &str)> = BTreeSet::new();
        for collection in collections {
            labels.insert(collection.id.as_str(), collection.label.trim());
            for feed in &collection.feeds {
                wanted_feeds.insert(feed.id.as_str(), feed);
                wanted_edges.insert((collection.id.as_str(), feed.id.as_str()));
            }
        }

        let mut outcome = MirrorOutcome::default();
        let mut tx = self.pool.begin().await?;

        // Folders
        let existing: Vec<Folder> = sqlx::query_as("SELECT id, external_id, name FROM folders")
            .fetch_all(&mut *tx)
            .await?;
        let existing: HashMap<String, Folder> = existing
            .into_iter()
            .map(|f| (f.external_id.clone(), f))
            .collect();

        for (external_id, folder) in &existing {
            if !labels.contains_key(external_id.as_str()) {
                sqlx::query("DELETE FROM folders WHERE id = ?")
                    .bind(folder.id)
                    .execute(&mut *tx)
                    .await?;
                outcome.folders_removed += 1;
            }
        }

        let mut folder_ids: HashMap<&str, i64> = HashMap::new();
        for (&external_id, &label) in &labels {
            match existing.get(external_id) {
                Some(folder) => {
                    if folder.name != label {
                        sqlx::query("UPDATE folders SET name = ? WHERE id = ?")
                            .bind(label)
                            .bind(folder.id)
                            .execute(&mut *tx)
                            .await?;
                        outcome.folders_renamed += 1;
                    }
                    folder_ids.insert(external_id, folder.id);
                }
                None => {
                    let (id,): (i64,) = sqlx::query_as(
                        "INSERT INTO folders (external_id, name) VALUES (?, ?) RETURNING id",
                    )
                    .bind(external_id)
                    .bind(label)
                    .fetch_one(&mut *tx)
                    .await?;
                    folder_ids.insert(external_id, id);
                    outcome.folders_added += 1;
                }
            }
        }

        // Feeds
        let existing_feeds: Vec<(String,)> = sqlx::query_as("SELECT feed_id FROM feeds")
            .fetch_all(&mut *tx)
            .await?;
        let existing_feeds: BTreeSet<String> = existing_feeds.into_iter().map(|(id,)| id).collect();

        let mut orphaned: Vec<String> = Vec::new();
        for feed_id in &existing_feeds {
            if !wanted_feeds.contains_key(feed_id.as_str()) {
                sqlx::query("DELETE FROM feeds WHERE feed_id = ?")
                    .bind(feed_id)
                    .execute(&mut *tx)
                    .await?;
                outcome.feeds_removed += 1;

                let rows: Vec<(String,)> = sqlx::query_as(
                    r#"
                    DELETE FROM articles
                    WHERE feed_id = ?
                      AND NOT EXISTS (
                          SELECT 1 FROM statuses s
                          WHERE s.article_id = articles.article_id AND s.starred = 1
                      )
                      AND NOT EXISTS (
                          SELECT 1 FROM sync_status p WHERE p.article_id = articles.article_id
                      )
                    RETURNING article_id
                "#,
                )
                .bind(feed_id)
                .fetch_all(&mut *tx)
                .await?;
                orphaned.extend(rows.into_iter().map(|(id,)| id));
            }
        }
        for chunk in orphaned.chunks(ID_CHUNK) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("DELETE FROM statuses WHERE article_id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(id);
            }
            separated.push_unseparated(")");
            builder.build().execute(&mut *tx).await?;
        }
        outcome.articles_removed = orphaned.len();

        for (&feed_id, feed) in &wanted_feeds {
            if !existing_feeds.contains(feed_id) {
                outcome.feeds_added += 1;
            }
            sqlx::query(
                r#"
                INSERT INTO feeds (feed_id, title, url, home_page_url)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(feed_id) DO UPDATE SET
                    title = excluded.title,
                    url = excluded.url,
                    home_page_url = excluded.home_page_url
                WHERE feeds.title IS NOT excluded.title
                   OR feeds.url IS NOT excluded.url
                   OR feeds.home_page_url IS NOT excluded.home_page_url
            "#,
            )
            .bind(feed_id)
            .bind(feed.title.trim())
            .bind(&feed.url)
            .bind(&feed.website)
            .execute(&mut *tx)
            .await?;
        }

        // Memberships (edges of removed folders/feeds are gone via ON DELETE CASCADE)
        let current_edges: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT f.external_id, ff.feed_id
            FROM folder_feeds ff JOIN folders f ON f.id = ff.folder_id
        "#,
        )
        .fetch_all(&mut *tx)
        .await?;
        let current_edges: BTreeSet<(String, String)> = current_edges.into_iter().collect();

        for (external_id, feed_id) in &current_edges {
            if !wanted_edges.contains(&(external_id.as_str(), feed_id.as_str())) {
                if let Some(folder_id) = folder_ids.get(external_id.as_str()) {
                    sqlx::query("DELETE FROM folder_feeds WHERE folder_id = ? AND feed_id = ?")
                        .bind(folder_id)
                        .bind(feed_id)
                        .execute(&mut *tx)
                        .await?;
                    outcome.memberships += 1;
                }
            }
        }

        for &(external_id, feed_id) in &wanted_edges {
            if current_edges.contains(&(external_id.to_string(), feed_id.to_string())) {
                continue;
            }
            if let Some(folder_id) = folder_ids.get(external_id) {
                sqlx::query("INSERT OR IGNORE INTO folder_feeds (folder_id, feed_id) VALUES (?, ?)")
                    .bind(folder_id)
                    .bind(feed_id)
                    .execute(&mut *tx)
                    .await?;
                outcome.memberships += 1;
            }
        }

        tx.commit().await?;
        self.cache.invalidate_articles(&orphaned);
        self.cache.invalidate_statuses(&orphaned);

        tracing::info!(
            folders_added = outcome.folders_added,
            folders_renamed = outcome.folders_renamed,
            folders_removed = outcome.folders_removed,
            feeds_added = outcome.feeds_added,
            feeds_removed = outcome.feeds_removed,
            articles_removed = outcome.articles_removed,
            memberships = outcome.memberships,
            "Mirrored remote collections"
        );
        Ok(outcome)
    }

    // ========================================================================
    // Folder Queries
    // ========================================================================

    pub async fn folders(&self) -> StoreResult<Vec<Folder>> {
        let folders = sqlx::query_as::<_, Folder>(
            "SELECT id, external_id, name FROM folders ORDER BY name COLLATE NOCASE, external_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(folders)
    }

    pub async fn feeds(&self) -> StoreResult<Vec<Feed>> {
        let feeds = sqlx::query_as::<_, Feed>(
            "SELECT feed_id, title, url, home_page_url FROM feeds ORDER BY title COLLATE NOCASE, feed_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(feeds)
    }

    /// Feeds filed under the folder with remote id `external_id`.
    pub async fn feeds_in_folder(&self, external_id: &str) -> StoreResult<Vec<Feed>> {
        let feeds = sqlx::query_as::<_, Feed>(
            r#"
            SELECT fe.feed_id, fe.title, fe.url, fe.home_page_url
            FROM feeds fe
            JOIN folder_feeds ff ON ff.feed_id = fe.feed_id
            JOIN folders f ON f.id = ff.folder_id
            WHERE f.external_id = ?
            ORDER BY fe.title COLLATE NOCASE, fe.feed_id
        "#,
        )
        .bind(external_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(feeds)
    }
}
