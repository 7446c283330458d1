use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use super::cache::{StoreCache, DEFAULT_CACHE_CAPACITY};
use super::types::{DatabaseError, StoreResult};

// ============================================================================
// Database
// ============================================================================

/// Handle to the local article store, status table, pending-change queue and
/// sync checkpoints. Cheap to clone; all clones share one pool and one cache.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
    pub(crate) cache: Arc<StoreCache>,
}

impl Database {
    /// Open a database connection and run migrations
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::InstanceLocked` if another process holds the
    /// database lock (SQLITE_BUSY, SQLITE_LOCKED, SQLITE_CANTOPEN).
    /// Returns `DatabaseError::Migration` if the schema cannot be created.
    pub async fn open(path: &str) -> StoreResult<Self> {
        Self::open_with_cache(path, DEFAULT_CACHE_CAPACITY).await
    }

    /// Like [`Database::open`] with an explicit per-cache entry limit.
    pub async fn open_with_cache(path: &str, cache_capacity: usize) -> StoreResult<Self> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // Pre-create the file user-only so there is no window with umask permissions
        #[cfg(unix)]
        if path != ":memory:" {
            use std::os::unix::fs::PermissionsExt;
            let db_path = std::path::Path::new(path);
            if db_path.exists() {
                let perms = std::fs::Permissions::from_mode(0o600);
                if let Err(e) = std::fs::set_permissions(path, perms) {
                    tracing::warn!(path = %path, error = %e, "Failed to set database file permissions");
                }
            } else if let Some(parent) = db_path.parent() {
                if parent.exists() {
                    use std::os::unix::fs::OpenOptionsExt;
                    let _file = std::fs::OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .mode(0o600)
                        .open(db_path)
                        .ok(); // If creation fails, SQLite will report the error at connect_with.
                }
            }
        }

        // busy_timeout=5000: wait up to 5s for the writer lock instead of failing with SQLITE_BUSY.
        // Claim/commit/release are single statements, so contention is short.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .foreign_keys(true)
            .pragma("busy_timeout", "5000");
        // Every connection to :memory: opens its own empty database.
        let max_connections = if path == ":memory:" { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        let db = Self {
            pool,
            cache: Arc::new(StoreCache::new(cache_capacity)),
        };
        db.migrate().await.map_err(|e| {
            let error_string = e.to_string().to_lowercase();
            if error_string.contains("database is locked")
                || error_string.contains("database table is locked")
                || error_string.contains("sqlite_busy")
                || error_string.contains("sqlite_locked")
            {
                DatabaseError::InstanceLocked
            } else {
                DatabaseError::Migration(e.to_string())
            }
        })?;

        // Rows claimed by a send that never finished (crash, kill) become claimable again.
        let released = db.release_all_in_progress().await?;
        if released > 0 {
            tracing::info!(
                released = released,
                "Released pending changes left in progress by a previous run"
            );
        }

        Ok(db)
    }

    /// Close the pool, waiting for checked-out connections to return.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Drop every cached article and status. Safe to call at any time; the
    /// caches refill from SQLite on the next read.
    pub fn empty_caches(&self) {
        self.cache.clear();
        tracing::debug!("Article and status caches emptied");
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// All statements use `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                feed_id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                url TEXT,
                home_page_url TEXT
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS folders (
                id INTEGER PRIMARY KEY,
                external_id TEXT UNIQUE NOT NULL,
                name TEXT NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // A feed may sit in several folders, so membership is an edge table.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS folder_feeds (
                folder_id INTEGER NOT NULL REFERENCES folders(id) ON DELETE CASCADE,
                feed_id TEXT NOT NULL REFERENCES feeds(feed_id) ON DELETE CASCADE,
                PRIMARY KEY (folder_id, feed_id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Articles are not tied to the feeds table: a status sync may download an
        // article whose feed has not been mirrored yet.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS articles (
                article_id TEXT PRIMARY KEY,
                feed_id TEXT NOT NULL,
                unique_id TEXT NOT NULL,
                title TEXT,
                content_html TEXT,
                content_text TEXT,
                summary TEXT,
                url TEXT,
                external_url TEXT,
                image_url TEXT,
                date_published INTEGER,
                date_modified INTEGER,
                authors TEXT NOT NULL DEFAULT '[]'
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS statuses (
                article_id TEXT PRIMARY KEY,
                read INTEGER NOT NULL DEFAULT 0,
                starred INTEGER NOT NULL DEFAULT 0,
                date_arrived INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // At most one pending row per (article_id, key).
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_status (
                article_id TEXT NOT NULL,
                key TEXT NOT NULL,
                flag INTEGER NOT NULL,
                selected INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (article_id, key)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_state (
                name TEXT PRIMARY KEY,
                token TEXT,
                last_fetch_start INTEGER,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_articles_feed ON articles(feed_id)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_statuses_read ON statuses(read)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_statuses_starred ON statuses(starred)")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_statuses_arrived ON statuses(date_arrived)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sync_status_selected ON sync_status(selected)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_folder_feeds_feed ON folder_feeds(feed_id)")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_memory_creates_schema() {
        let db = Database::open(":memory:").await.unwrap();
        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(&db.pool)
        .await
        .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
        for expected in [
            "articles",
            "feeds",
            "folder_feeds",
            "folders",
            "statuses",
            "sync_state",
            "sync_status",
        ] {
            assert!(names.contains(&expected), "missing table {expected}");
        }
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let db = Database::open(":memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn test_foreign_keys_enabled() {
        let db = Database::open(":memory:").await.unwrap();
        let (enabled,): (i64,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(enabled, 1);
    }
}
