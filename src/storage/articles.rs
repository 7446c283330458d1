use sqlx::{query_builder::Separated, QueryBuilder, Sqlite};
use std::collections::{HashMap, HashSet};

use super::schema::Database;
use super::statuses::insert_missing_statuses;
use super::types::{Article, ArticleDbRow, DefaultReadPolicy, StoreResult, UpsertOutcome};
use super::{sorted_ids, ID_CHUNK};

/// Rows per multi-row article INSERT (13 bound values each).
const INSERT_BATCH: usize = 50;

const ARTICLE_COLUMNS: &str = "article_id, feed_id, unique_id, title, content_html, content_text, \
     summary, url, external_url, image_url, date_published, date_modified, authors";

fn authors_json(authors: &[String]) -> String {
    match serde_json::to_string(authors) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode authors, storing empty list");
            "[]".to_string()
        }
    }
}

/// Push `column = ?` for every field that differs. Returns the number of
/// columns pushed.
fn push_changed_columns<'args>(
    set: &mut Separated<'_, 'args, Sqlite, &'static str>,
    old: &Article,
    new: &'args Article,
) -> usize {
    let mut pushed = 0;

    macro_rules! diff {
        ($field:ident) => {
            if old.$field != new.$field {
                set.push(concat!(stringify!($field), " = "));
                set.push_bind_unseparated(&new.$field);
                pushed += 1;
            }
        };
    }

    diff!(feed_id);
    diff!(unique_id);
    diff!(title);
    diff!(content_html);
    diff!(content_text);
    diff!(summary);
    diff!(url);
    diff!(external_url);
    diff!(image_url);
    diff!(date_published);
    diff!(date_modified);

    if old.authors != new.authors {
        set.push("authors = ");
        set.push_bind_unseparated(authors_json(&new.authors));
        pushed += 1;
    }

    pushed
}

impl Database {
    // ========================================================================
    // Article Writes
    // ========================================================================

    /// Insert new articles, update changed ones, and skip identical ones.
    ///
    /// Updates only touch the columns that differ, so re-ingesting the same
    /// page performs no writes. New articles also get a status (if they lack
    /// one) whose read flag comes from `policy`. Duplicate ids in the input
    /// collapse to the last occurrence.
    pub async fn upsert_articles(
        &self,
        articles: &[Article],
        policy: DefaultReadPolicy,
    ) -> StoreResult<UpsertOutcome> {
        let mut outcome = UpsertOutcome::default();
        if articles.is_empty() {
            return Ok(outcome);
        }

        let mut latest: HashMap<&str, &Article> = HashMap::with_capacity(articles.len());
        let mut order: Vec<&str> = Vec::with_capacity(articles.len());
        for article in articles {
            if latest.insert(article.article_id.as_str(), article).is_none() {
                order.push(article.article_id.as_str());
            }
        }
        let incoming: Vec<&Article> = order.iter().filter_map(|id| latest.get(id).copied()).collect();

        let mut inserted_ids: Vec<&String> = Vec::new();
        let mut written_ids: Vec<&String> = Vec::new();
        let mut tx = self.pool.begin().await?;

        for chunk in incoming.chunks(ID_CHUNK) {
            let mut select: QueryBuilder<Sqlite> =
                QueryBuilder::new(format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE article_id IN ("));
            let mut separated = select.separated(", ");
            for article in chunk {
                separated.push_bind(&article.article_id);
            }
            separated.push_unseparated(")");
            let rows: Vec<ArticleDbRow> = select.build_query_as().fetch_all(&mut *tx).await?;
            let existing: HashMap<String, Article> = rows
                .into_iter()
                .map(|row| {
                    let article = row.into_article();
                    (article.article_id.clone(), article)
                })
                .collect();

            let mut new_articles: Vec<&Article> = Vec::new();
            for &article in chunk {
                match existing.get(&article.article_id) {
                    None => new_articles.push(article),
                    Some(old) if old == article => outcome.unchanged += 1,
                    Some(old) => {
                        let mut update: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE articles SET ");
                        let mut set = update.separated(", ");
                        let columns = push_changed_columns(&mut set, old, article);
                        if columns == 0 {
                            outcome.unchanged += 1;
                            continue;
                        }
                        update.push(" WHERE article_id = ");
                        update.push_bind(&article.article_id);
                        update.build().execute(&mut *tx).await?;
                        outcome.updated += 1;
                        written_ids.push(&article.article_id);
                    }
                }
            }

            for batch in new_articles.chunks(INSERT_BATCH) {
                let mut insert: QueryBuilder<Sqlite> =
                    QueryBuilder::new(format!("INSERT INTO articles ({ARTICLE_COLUMNS}) "));
                insert.push_values(batch, |mut b, article| {
                    b.push_bind(&article.article_id)
                        .push_bind(&article.feed_id)
                        .push_bind(&article.unique_id)
                        .push_bind(&article.title)
                        .push_bind(&article.content_html)
                        .push_bind(&article.content_text)
                        .push_bind(&article.summary)
                        .push_bind(&article.url)
                        .push_bind(&article.external_url)
                        .push_bind(&article.image_url)
                        .push_bind(article.date_published)
                        .push_bind(article.date_modified)
                        .push_bind(authors_json(&article.authors));
                });
                insert.build().execute(&mut *tx).await?;
            }
            outcome.inserted += new_articles.len();
            inserted_ids.extend(new_articles.iter().map(|&a| &a.article_id));
            written_ids.extend(new_articles.iter().map(|&a| &a.article_id));
        }

        let created_statuses = insert_missing_statuses(&mut *tx, &inserted_ids, policy.read()).await?;
        tx.commit().await?;

        self.cache.invalidate_articles(written_ids.iter().copied());
        self.cache.invalidate_statuses(&created_statuses);

        tracing::debug!(
            inserted = outcome.inserted,
            updated = outcome.updated,
            unchanged = outcome.unchanged,
            "Upserted articles"
        );
        Ok(outcome)
    }

    /// Delete article rows. Statuses are kept; see [`Database::prune_statuses`].
    pub async fn delete_articles(&self, article_ids: &HashSet<String>) -> StoreResult<u64> {
        if article_ids.is_empty() {
            return Ok(0);
        }

        let ids = sorted_ids(article_ids);
        let mut deleted = 0;
        let mut tx = self.pool.begin().await?;
        for chunk in ids.chunks(ID_CHUNK) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("DELETE FROM articles WHERE article_id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
            deleted += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;

        self.cache.invalidate_articles(ids.iter().copied());
        Ok(deleted)
    }

    /// Apply the retention policy.
    ///
    /// An article is removed only when it is read, unstarred, arrived before
    /// `cutoff`, and is absent from `remote_snapshot` (the ids the remote
    /// still reports). Unread articles are never removed by age. Returns the
    /// number of articles deleted.
    pub async fn delete_old_articles(
        &self,
        cutoff: i64,
        remote_snapshot: &HashSet<String>,
    ) -> StoreResult<u64> {
        let candidates: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT a.article_id FROM articles a
            JOIN statuses s ON s.article_id = a.article_id
            WHERE s.read = 1 AND s.starred = 0 AND s.date_arrived < ?
        "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let doomed: HashSet<String> = candidates
            .into_iter()
            .map(|(id,)| id)
            .filter(|id| !remote_snapshot.contains(id))
            .collect();

        let deleted = self.delete_articles(&doomed).await?;
        if deleted > 0 {
            tracing::info!(deleted = deleted, cutoff = cutoff, "Deleted articles past retention");
        }
        Ok(deleted)
    }

    // ========================================================================
    // Article Queries
    // ========================================================================

    /// Load articles by id. Unknown ids are skipped.
    pub async fn fetch_articles(&self, article_ids: &HashSet<String>) -> StoreResult<Vec<Article>> {
        let (mut found, missing, epoch) = self.cache.articles(article_ids);
        if missing.is_empty() {
            return Ok(found);
        }

        let ids = sorted_ids(&missing);
        let mut loaded = Vec::new();
        for chunk in ids.chunks(ID_CHUNK) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new(format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE article_id IN ("));
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
            let rows: Vec<ArticleDbRow> = builder.build_query_as().fetch_all(&self.pool).await?;
            loaded.extend(rows.into_iter().map(ArticleDbRow::into_article));
        }

        self.cache.put_articles(epoch, &loaded);
        found.extend(loaded);
        Ok(found)
    }

    pub async fn article_ids(&self) -> StoreResult<HashSet<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT article_id FROM articles")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn article_count(&self) -> StoreResult<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM articles")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}
