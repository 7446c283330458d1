//! Queue state across process restarts, using an on-disk database.

mod common;

use pretty_assertions::assert_eq;
use std::sync::Arc;

use common::{fast_settings, set, FakeStream};
use tidings::storage::{Database, StatusKey};
use tidings::sync::{queue_local_edit, Provider, SyncEngine};

#[tokio::test]
async fn test_interrupted_send_is_retried_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tidings.db");
    let path = path.to_str().unwrap();

    {
        let db = Database::open(path).await.unwrap();
        db.ensure_statuses(&set(&["A", "B"]), false).await.unwrap();
        queue_local_edit(&db, &set(&["A"]), StatusKey::Read, true)
            .await
            .unwrap();
        // Claimed by a send that never finished.
        let claimed = db.claim_batch(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        db.close().await;
    }

    let db = Database::open(path).await.unwrap();
    let pending = db.pending_changes().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert!(!pending[0].in_progress);

    let remote = Arc::new(FakeStream::new(&["A", "B"], &["A", "B"], &[]));
    let provider: Arc<FakeStream> = Arc::clone(&remote);
    let engine = SyncEngine::new(db.clone(), Provider::Stream(provider), fast_settings());
    engine.run_sync().await.unwrap();

    assert_eq!(db.pending_count().await.unwrap(), 0);
    assert_eq!(remote.unread(), set(&["B"]));
    assert_eq!(db.unread_ids().await.unwrap(), set(&["B"]));
}

#[tokio::test]
async fn test_checkpoints_persist_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tidings.db");
    let path = path.to_str().unwrap();

    {
        let db = Database::open(path).await.unwrap();
        db.save_token("stream.all", Some("p7")).await.unwrap();
        db.set_last_fetch_start("stream.all", 1_700_000_000).await.unwrap();
        db.close().await;
    }

    let db = Database::open(path).await.unwrap();
    let checkpoint = db.checkpoint("stream.all").await.unwrap();
    assert_eq!(checkpoint.token.as_deref(), Some("p7"));
    assert_eq!(checkpoint.last_fetch_start, Some(1_700_000_000));
}
