//! End-to-end sync runs against an in-process cursor-stream provider.
//!
//! Each test creates its own in-memory SQLite database for isolation.

mod common;

use pretty_assertions::assert_eq;
use std::sync::Arc;

use common::{fast_settings, set, FakeStream};
use tidings::remote::{RemoteError, StreamResource};
use tidings::storage::{Database, StatusKey};
use tidings::sync::{Provider, StepState, SyncEngine, SyncError, ALL_IDS_CHECKPOINT, UPDATED_CHECKPOINT};

async fn test_db() -> Database {
    Database::open(":memory:").await.unwrap()
}

fn engine(db: &Database, remote: &Arc<FakeStream>) -> Arc<SyncEngine> {
    let provider: Arc<FakeStream> = Arc::clone(remote);
    Arc::new(SyncEngine::new(
        db.clone(),
        Provider::Stream(provider),
        fast_settings(),
    ))
}

// ============================================================================
// Convergence
// ============================================================================

#[tokio::test]
async fn test_unread_set_converges_across_pages() {
    let db = test_db().await;
    db.ensure_statuses(&set(&["A", "B", "X"]), false).await.unwrap();
    let remote = Arc::new(FakeStream::new(
        &["A", "B", "C", "D", "X"],
        &["A", "B", "C", "D"],
        &[],
    ));

    let report = engine(&db, &remote).run_sync().await.unwrap();

    assert!(report.all_completed());
    assert_eq!(db.unread_ids().await.unwrap(), set(&["A", "B", "C", "D"]));
    // The unread stream came back as {A,B,C} then "p2" → {D}.
    let calls = remote.calls();
    assert!(calls.contains(&"page:unread:-".to_string()));
    assert!(calls.contains(&"page:unread:p2".to_string()));
    assert_eq!(db.article_count().await.unwrap(), 5);
}

#[tokio::test]
async fn test_second_run_writes_nothing_new() {
    let db = test_db().await;
    let remote = Arc::new(FakeStream::new(&["A", "B"], &["A"], &["B"]));
    let engine = engine(&db, &remote);

    engine.run_sync().await.unwrap();
    let unread = db.unread_ids().await.unwrap();
    let starred = db.starred_ids().await.unwrap();

    engine.run_sync().await.unwrap();
    assert_eq!(db.unread_ids().await.unwrap(), unread);
    assert_eq!(db.starred_ids().await.unwrap(), starred);
    assert_eq!(starred, set(&["B"]));
}

#[tokio::test]
async fn test_local_edit_is_pushed_before_remote_state_is_read() {
    let db = test_db().await;
    let remote = Arc::new(FakeStream::new(&["A", "B"], &["A", "B"], &[]));
    let engine = engine(&db, &remote);
    engine.run_sync().await.unwrap();

    let queued = engine
        .enqueue_local_edit(&set(&["A"]), StatusKey::Read, true)
        .await
        .unwrap();
    assert_eq!(queued, 1);

    engine.run_sync().await.unwrap();

    assert_eq!(remote.unread(), set(&["B"]));
    assert_eq!(db.unread_ids().await.unwrap(), set(&["B"]));
    assert_eq!(db.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_unchanged_local_edit_is_not_queued() {
    let db = test_db().await;
    db.ensure_statuses(&set(&["A"]), true).await.unwrap();
    let remote = Arc::new(FakeStream::new(&["A"], &[], &[]));

    let queued = engine(&db, &remote)
        .enqueue_local_edit(&set(&["A"]), StatusKey::Read, true)
        .await
        .unwrap();
    assert_eq!(queued, 0);
    assert_eq!(db.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_star_made_during_sync_survives_reconciliation() {
    let db = test_db().await;
    let remote = Arc::new(FakeStream::new(&["A", "B"], &[], &[]));
    *remote.star_during.lock().unwrap() =
        Some((StreamResource::Starred, db.clone(), "B".to_string()));

    engine(&db, &remote).run_sync().await.unwrap();

    // The remote still lists no stars, but the queued local star wins.
    assert_eq!(db.starred_ids().await.unwrap(), set(&["B"]));
    assert_eq!(
        db.pending_article_ids(StatusKey::Starred).await.unwrap(),
        set(&["B"])
    );
}

#[tokio::test]
async fn test_folders_are_mirrored() {
    let db = test_db().await;
    let remote = Arc::new(FakeStream::new(&[], &[], &[]));

    engine(&db, &remote).run_sync().await.unwrap();

    let folders = db.folders().await.unwrap();
    assert_eq!(folders.len(), 1);
    assert_eq!(folders[0].name, "Tech");
    assert_eq!(db.feeds_in_folder("c1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_checkpoints_after_successful_run() {
    let db = test_db().await;
    let remote = Arc::new(FakeStream::new(&["A", "B", "C", "D"], &[], &[]));
    let engine = engine(&db, &remote);

    engine.run_sync().await.unwrap();

    assert_eq!(db.checkpoint(ALL_IDS_CHECKPOINT).await.unwrap().token, None);
    assert!(db
        .checkpoint(UPDATED_CHECKPOINT)
        .await
        .unwrap()
        .last_fetch_start
        .is_some());
    let progress = *engine.progress().borrow();
    assert_eq!(progress.total, 10);
    assert_eq!(progress.remaining, 0);
}

// ============================================================================
// Failure and Cancellation
// ============================================================================

#[tokio::test]
async fn test_failed_push_fails_fast_and_keeps_rows() {
    let db = test_db().await;
    let remote = Arc::new(FakeStream::new(&["A"], &["A"], &[]));
    *remote.send_error.lock().unwrap() = Some(RemoteError::Http {
        status: 400,
        message: "rejected".into(),
    });
    let engine = engine(&db, &remote);
    engine
        .enqueue_local_edit(&set(&["A"]), StatusKey::Read, true)
        .await
        .unwrap();

    let err = engine.run_sync().await.unwrap_err();

    assert!(matches!(err, SyncError::Remote(RemoteError::Http { status: 400, .. })));
    let report = engine.last_report().unwrap();
    assert_eq!(report.state("send_statuses"), Some(StepState::Failed));
    assert_eq!(report.state("get_collections"), Some(StepState::Canceled));
    assert_eq!(report.state("checkpoint"), Some(StepState::Canceled));
    assert!(!remote.calls().iter().any(|c| c.starts_with("page:")));

    let pending = db.pending_changes().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert!(!pending[0].in_progress);
}

#[tokio::test]
async fn test_transient_push_error_is_retried() {
    let db = test_db().await;
    let remote = Arc::new(FakeStream::new(&["A"], &["A"], &[]));
    *remote.send_error.lock().unwrap() = Some(RemoteError::RateLimited { retry_after: None });
    let engine = engine(&db, &remote);
    engine
        .enqueue_local_edit(&set(&["A"]), StatusKey::Read, true)
        .await
        .unwrap();

    engine.run_sync().await.unwrap();

    let sends = remote
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("send:"))
        .count();
    assert_eq!(sends, 2);
    assert_eq!(db.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_cancel_mid_pagination_keeps_cursor_at_last_applied_page() {
    let db = test_db().await;
    let remote = Arc::new(FakeStream::new(&["A", "B", "C"], &[], &[]).with_page_size(1));
    *remote.stall_page.lock().unwrap() = Some((StreamResource::All, Some("p3".to_string())));
    let engine = engine(&db, &remote);

    let run = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.run_sync().await }
    });
    remote.stalled.notified().await;
    engine.cancel();

    let err = run.await.unwrap().unwrap_err();
    assert!(err.is_canceled());
    let report = engine.last_report().unwrap();
    assert_eq!(report.state("send_statuses"), Some(StepState::Completed));
    assert_eq!(report.state("ingest_all_ids"), Some(StepState::Canceled));
    assert_eq!(report.state("download"), Some(StepState::Canceled));

    // Pages one and two were applied; the cursor points at page three.
    assert_eq!(
        db.checkpoint(ALL_IDS_CHECKPOINT).await.unwrap().token.as_deref(),
        Some("p3")
    );
    assert_eq!(db.statuses(&set(&["A", "B", "C"])).await.unwrap().len(), 2);
    assert!(db.pending_changes().await.unwrap().iter().all(|c| !c.in_progress));

    // The next run resumes from the stored cursor and finishes the pass.
    engine.run_sync().await.unwrap();
    let resumed_at = remote
        .calls()
        .iter()
        .filter(|c| c.starts_with("page:all:"))
        .nth(3)
        .cloned();
    assert_eq!(resumed_at.as_deref(), Some("page:all:p3"));
    assert_eq!(db.checkpoint(ALL_IDS_CHECKPOINT).await.unwrap().token, None);
    assert_eq!(db.statuses(&set(&["A", "B", "C"])).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_cancel_during_push_releases_claimed_rows() {
    let db = test_db().await;
    let remote = Arc::new(FakeStream::new(&["A", "B"], &["A", "B"], &[]));
    *remote.stall_send.lock().unwrap() = true;
    let engine = engine(&db, &remote);
    engine
        .enqueue_local_edit(&set(&["A", "B"]), StatusKey::Read, true)
        .await
        .unwrap();

    let run = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.run_sync().await }
    });
    remote.stalled.notified().await;
    engine.cancel();

    assert!(run.await.unwrap().unwrap_err().is_canceled());
    let pending = db.pending_changes().await.unwrap();
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|c| !c.in_progress));
    assert_eq!(remote.unread(), set(&["A", "B"]));
}

#[tokio::test]
async fn test_only_one_run_at_a_time() {
    let db = test_db().await;
    let remote = Arc::new(FakeStream::new(&["A"], &[], &[]));
    *remote.stall_page.lock().unwrap() = Some((StreamResource::All, None));
    let engine = engine(&db, &remote);

    let run = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.run_sync().await }
    });
    remote.stalled.notified().await;

    assert!(engine.is_running());
    assert!(matches!(engine.run_sync().await, Err(SyncError::AlreadyRunning)));

    engine.cancel();
    assert!(run.await.unwrap().unwrap_err().is_canceled());
    assert!(!engine.is_running());
    engine.run_sync().await.unwrap();
}
