use sqlx::QueryBuilder;
use std::collections::HashSet;

use super::schema::Database;
use super::types::{PendingChange, PendingRow, StatusKey, StoreResult};
use super::{sorted_ids, ID_CHUNK};

/// Rows per multi-row INSERT (3 bound values each).
const ENQUEUE_BATCH: usize = 300;

impl Database {
    // ========================================================================
    // Pending Change Queue
    // ========================================================================

    /// Record a local edit that the remote has not acknowledged yet.
    ///
    /// Upserts on `(article_id, key)`: the latest flag wins. A row that is
    /// currently claimed keeps its claim; [`Database::commit`] notices the
    /// changed flag and releases it instead of deleting it.
    pub async fn enqueue(&self, article_id: &str, key: StatusKey, flag: bool) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_status (article_id, key, flag, selected)
            VALUES (?, ?, ?, 0)
            ON CONFLICT(article_id, key) DO UPDATE SET flag = excluded.flag
        "#,
        )
        .bind(article_id)
        .bind(key.as_str())
        .bind(flag)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Enqueue many changes in one transaction.
    pub async fn enqueue_many(&self, changes: &[PendingChange]) -> StoreResult<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for chunk in changes.chunks(ENQUEUE_BATCH) {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("INSERT INTO sync_status (article_id, key, flag, selected) ");
            builder.push_values(chunk, |mut b, change| {
                b.push_bind(&change.article_id)
                    .push_bind(change.key.as_str())
                    .push_bind(change.flag)
                    .push_bind(false);
            });
            builder.push(" ON CONFLICT(article_id, key) DO UPDATE SET flag = excluded.flag");
            builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;

        tracing::debug!(count = changes.len(), "Enqueued pending changes");
        Ok(())
    }

    /// Atomically claim up to `limit` unclaimed rows for sending.
    ///
    /// One UPDATE statement both selects and marks the rows, so two callers
    /// racing on the same queue never receive the same row.
    pub async fn claim_batch(&self, limit: usize) -> StoreResult<Vec<PendingChange>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, PendingRow>(
            r#"
            UPDATE sync_status SET selected = 1
            WHERE rowid IN (
                SELECT rowid FROM sync_status
                WHERE selected = 0
                ORDER BY rowid
                LIMIT ?
            )
            RETURNING article_id, key, flag, selected
        "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PendingRow::into_change).collect()
    }

    /// Remove rows the remote has acknowledged.
    ///
    /// Only rows whose stored flag still equals the flag that was sent are
    /// deleted. A row re-enqueued with the opposite flag during the send is
    /// released so the newer edit goes out on the next pass.
    pub async fn commit(&self, changes: &[PendingChange]) -> StoreResult<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let mut deleted: u64 = 0;
        for change in changes {
            let result = sqlx::query(
                "DELETE FROM sync_status WHERE article_id = ? AND key = ? AND flag = ?",
            )
            .bind(&change.article_id)
            .bind(change.key.as_str())
            .bind(change.flag)
            .execute(&mut *tx)
            .await?;
            deleted += result.rows_affected();

            if result.rows_affected() == 0 {
                sqlx::query("UPDATE sync_status SET selected = 0 WHERE article_id = ? AND key = ?")
                    .bind(&change.article_id)
                    .bind(change.key.as_str())
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;

        let superseded = changes.len() as u64 - deleted;
        if superseded > 0 {
            tracing::debug!(
                superseded = superseded,
                "Pending changes edited during send were kept for the next pass"
            );
        }
        Ok(())
    }

    /// Return claimed rows to the queue after a failed or canceled send.
    pub async fn release(&self, changes: &[PendingChange]) -> StoreResult<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for change in changes {
            sqlx::query("UPDATE sync_status SET selected = 0 WHERE article_id = ? AND key = ?")
                .bind(&change.article_id)
                .bind(change.key.as_str())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Clear every claim. Run on open so rows claimed by a send that never
    /// finished become claimable again.
    pub async fn release_all_in_progress(&self) -> StoreResult<u64> {
        let result = sqlx::query("UPDATE sync_status SET selected = 0 WHERE selected = 1")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Ids with a pending change for `key`, claimed or not.
    pub async fn pending_article_ids(&self, key: StatusKey) -> StoreResult<HashSet<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT article_id FROM sync_status WHERE key = ?")
                .bind(key.as_str())
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn pending_count(&self) -> StoreResult<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sync_status")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Every queued change in insertion order.
    pub async fn pending_changes(&self) -> StoreResult<Vec<PendingChange>> {
        let rows = sqlx::query_as::<_, PendingRow>(
            "SELECT article_id, key, flag, selected FROM sync_status ORDER BY rowid",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(PendingRow::into_change).collect()
    }

    /// Drop queued changes for articles the remote has deleted.
    pub async fn discard_pending(&self, article_ids: &HashSet<String>) -> StoreResult<u64> {
        if article_ids.is_empty() {
            return Ok(0);
        }

        let ids = sorted_ids(article_ids);
        let mut tx = self.pool.begin().await?;
        let mut discarded = 0;
        for chunk in ids.chunks(ID_CHUNK) {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("DELETE FROM sync_status WHERE article_id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
            discarded += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;

        if discarded > 0 {
            tracing::info!(discarded = discarded, "Discarded pending changes for remotely deleted articles");
        }
        Ok(discarded)
    }
}
