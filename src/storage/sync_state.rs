use super::schema::Database;
use super::types::{StoreResult, SyncCheckpoint};

impl Database {
    // ========================================================================
    // Sync Checkpoints
    // ========================================================================

    /// Load the stored token and fetch start for a stream or zone.
    ///
    /// Names are free-form: `stream.unread`, `zone.articles`, etc. An unknown
    /// name yields an empty checkpoint.
    pub async fn checkpoint(&self, name: &str) -> StoreResult<SyncCheckpoint> {
        let row: Option<(Option<String>, Option<i64>)> =
            sqlx::query_as("SELECT token, last_fetch_start FROM sync_state WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row
            .map(|(token, last_fetch_start)| SyncCheckpoint {
                token,
                last_fetch_start,
            })
            .unwrap_or_default())
    }

    /// Replace the token in one statement. `None` clears it.
    pub async fn save_token(&self, name: &str, token: Option<&str>) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (name, token, updated_at)
            VALUES (?, ?, datetime('now'))
            ON CONFLICT(name) DO UPDATE SET token = excluded.token, updated_at = excluded.updated_at
        "#,
        )
        .bind(name)
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Forget the token after the remote reported it expired.
    pub async fn reset_token(&self, name: &str) -> StoreResult<()> {
        tracing::info!(name = %name, "Resetting sync token");
        self.save_token(name, None).await
    }

    /// Record when the last successful fetch started (Unix seconds).
    pub async fn set_last_fetch_start(&self, name: &str, started_at: i64) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (name, last_fetch_start, updated_at)
            VALUES (?, ?, datetime('now'))
            ON CONFLICT(name) DO UPDATE SET
                last_fetch_start = excluded.last_fetch_start,
                updated_at = excluded.updated_at
        "#,
        )
        .bind(name)
        .bind(started_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{Database, SyncCheckpoint};

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_checkpoint_missing() {
        let db = test_db().await;
        let checkpoint = db.checkpoint("zone.articles").await.unwrap();
        assert_eq!(checkpoint, SyncCheckpoint::default());
    }

    #[tokio::test]
    async fn test_save_and_reset_token() {
        let db = test_db().await;
        db.save_token("zone.articles", Some("t1")).await.unwrap();
        db.save_token("zone.articles", Some("t2")).await.unwrap();
        assert_eq!(
            db.checkpoint("zone.articles").await.unwrap().token.as_deref(),
            Some("t2")
        );

        db.reset_token("zone.articles").await.unwrap();
        assert_eq!(db.checkpoint("zone.articles").await.unwrap().token, None);
    }

    #[tokio::test]
    async fn test_token_and_fetch_start_are_independent() {
        let db = test_db().await;
        db.set_last_fetch_start("stream.updated", 1_700_000_000)
            .await
            .unwrap();
        db.save_token("stream.updated", Some("cursor")).await.unwrap();
        db.reset_token("stream.updated").await.unwrap();

        let checkpoint = db.checkpoint("stream.updated").await.unwrap();
        assert_eq!(checkpoint.token, None);
        assert_eq!(checkpoint.last_fetch_start, Some(1_700_000_000));
    }
}
