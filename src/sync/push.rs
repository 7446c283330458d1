//! Draining the pending change queue to the remote.

use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use super::error::SyncError;
use super::settings::SyncSettings;
use crate::remote::{send_chunked, with_retry, ChunkReport, RemoteError, StatusSender};
use crate::storage::{Database, PendingChange, StatusKey};

/// Rows acknowledged and rows handed back to the queue by one push.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushOutcome {
    pub sent: usize,
    pub released: usize,
}

/// Send every pending change, one claimed batch at a time.
///
/// Acknowledged rows are committed and failed rows released before the next
/// batch is claimed. The first batch with a failure ends the push and its
/// first error is returned. Claimed rows are never left in progress.
pub(crate) async fn push_pending(
    db: &Database,
    sender: &dyn StatusSender,
    chunk_size: usize,
    settings: &SyncSettings,
    cancel: &CancellationToken,
) -> Result<PushOutcome, SyncError> {
    let mut outcome = PushOutcome::default();

    loop {
        if cancel.is_cancelled() {
            return Err(SyncError::Canceled);
        }

        let claimed = db.claim_batch(settings.status_batch_size).await?;
        if claimed.is_empty() {
            break;
        }

        let (acked, failed, error) = send_claimed(sender, &claimed, chunk_size, settings, cancel).await;

        if let Err(e) = db.commit(&acked).await {
            // Rows acked but not committed are resent later; the remote treats a repeat as a no-op.
            release_quietly(db, &claimed).await;
            return Err(e.into());
        }
        if let Err(e) = db.release(&failed).await {
            release_quietly(db, &failed).await;
            return Err(e.into());
        }

        outcome.sent += acked.len();
        outcome.released += failed.len();
        tracing::debug!(sent = acked.len(), released = failed.len(), "Pushed pending batch");

        if let Some(error) = error {
            return Err(error.into());
        }
    }

    if outcome.sent > 0 {
        tracing::info!(sent = outcome.sent, "Pushed pending status changes");
    }
    Ok(outcome)
}

async fn release_quietly(db: &Database, changes: &[PendingChange]) {
    if let Err(e) = db.release(changes).await {
        tracing::error!(error = %e, rows = changes.len(), "Failed to release claimed rows");
    }
}

/// Send one claimed batch grouped by (key, flag).
///
/// Returns acknowledged rows, failed rows, and the first error seen.
async fn send_claimed(
    sender: &dyn StatusSender,
    claimed: &[PendingChange],
    chunk_size: usize,
    settings: &SyncSettings,
    cancel: &CancellationToken,
) -> (Vec<PendingChange>, Vec<PendingChange>, Option<RemoteError>) {
    let mut groups: HashMap<(StatusKey, bool), Vec<&PendingChange>> = HashMap::new();
    for change in claimed {
        groups.entry((change.key, change.flag)).or_default().push(change);
    }
    let mut groups: Vec<_> = groups.into_iter().collect();
    groups.sort_by_key(|((key, flag), _)| (key.as_str(), *flag));

    let mut acked = Vec::new();
    let mut failed = Vec::new();
    let mut first_error = None;

    for ((key, flag), changes) in groups {
        let ids: Vec<String> = changes.iter().map(|c| c.article_id.clone()).collect();
        let report = send_ids(sender, &ids, key, flag, chunk_size, settings, cancel).await;

        for range in &report.succeeded {
            acked.extend(changes[range.clone()].iter().map(|c| (*c).clone()));
        }
        for (range, error) in report.failed {
            failed.extend(changes[range].iter().map(|c| (*c).clone()));
            if first_error.is_none() {
                first_error = Some(error);
            }
        }
    }

    (acked, failed, first_error)
}

/// Chunked send with retry. Chunks rejected as too large are split to
/// `modify_chunk_size` and resubmitted once.
async fn send_ids(
    sender: &dyn StatusSender,
    ids: &[String],
    key: StatusKey,
    flag: bool,
    chunk_size: usize,
    settings: &SyncSettings,
    cancel: &CancellationToken,
) -> ChunkReport {
    let retry = &settings.retry;
    let send = move |chunk: &[String]| {
        let chunk = chunk.to_vec();
        async move {
            with_retry(retry, cancel, "send statuses", || {
                sender.send_status_batch(&chunk, key, flag)
            })
            .await
        }
    };

    let report = send_chunked(ids, chunk_size, cancel, send).await;
    if report.is_complete() {
        return report;
    }

    let mut merged = ChunkReport {
        succeeded: report.succeeded,
        failed: Vec::new(),
    };
    for (range, error) in report.failed {
        let splittable = matches!(error, RemoteError::LimitExceeded)
            && range.len() > settings.modify_chunk_size;
        if !splittable {
            merged.failed.push((range, error));
            continue;
        }

        tracing::info!(
            len = range.len(),
            chunk_size = settings.modify_chunk_size,
            "Status batch too large, resubmitting in smaller chunks"
        );
        let offset = range.start;
        let retried = send_chunked(&ids[range], settings.modify_chunk_size, cancel, send).await;
        merged
            .succeeded
            .extend(retried.succeeded.into_iter().map(|r| r.start + offset..r.end + offset));
        merged.failed.extend(
            retried
                .failed
                .into_iter()
                .map(|(r, e)| (r.start + offset..r.end + offset, e)),
        );
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;
    use std::sync::Mutex;

    use crate::remote::RemoteResult;

    #[derive(Default)]
    struct RecordingSender {
        calls: Mutex<Vec<(StatusKey, bool, usize)>>,
        reject_larger_than: Option<usize>,
        fail_with: Mutex<Option<RemoteError>>,
    }

    #[async_trait]
    impl StatusSender for RecordingSender {
        async fn send_status_batch(
            &self,
            article_ids: &[String],
            key: StatusKey,
            flag: bool,
        ) -> RemoteResult<()> {
            self.calls.lock().unwrap().push((key, flag, article_ids.len()));
            if let Some(e) = self.fail_with.lock().unwrap().take() {
                return Err(e);
            }
            match self.reject_larger_than {
                Some(max) if article_ids.len() > max => Err(RemoteError::LimitExceeded),
                _ => Ok(()),
            }
        }
    }

    fn settings() -> SyncSettings {
        SyncSettings {
            status_batch_size: 10,
            modify_chunk_size: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_push_commits_acknowledged_rows() {
        let db = Database::open(":memory:").await.unwrap();
        db.enqueue("a1", StatusKey::Read, true).await.unwrap();
        db.enqueue("a2", StatusKey::Read, true).await.unwrap();
        db.enqueue("a1", StatusKey::Starred, false).await.unwrap();
        let sender = RecordingSender::default();

        let outcome = push_pending(&db, &sender, 100, &settings(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, PushOutcome { sent: 3, released: 0 });
        assert_eq!(db.pending_count().await.unwrap(), 0);
        let calls = sender.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![(StatusKey::Read, true, 2), (StatusKey::Starred, false, 1)]
        );
    }

    #[tokio::test]
    async fn test_failed_send_leaves_rows_queued_and_unclaimed() {
        let db = Database::open(":memory:").await.unwrap();
        db.enqueue("a1", StatusKey::Read, true).await.unwrap();
        let sender = RecordingSender {
            fail_with: Mutex::new(Some(RemoteError::Http {
                status: 400,
                message: "bad".into(),
            })),
            ..Default::default()
        };

        let err = push_pending(&db, &sender, 100, &settings(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Remote(RemoteError::Http { status: 400, .. })));
        let pending = db.pending_changes().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(!pending[0].in_progress);
    }

    #[tokio::test]
    async fn test_limit_exceeded_resubmits_in_smaller_chunks() {
        let db = Database::open(":memory:").await.unwrap();
        for i in 0..5 {
            db.enqueue(&format!("a{i}"), StatusKey::Starred, true).await.unwrap();
        }
        let sender = RecordingSender {
            reject_larger_than: Some(2),
            ..Default::default()
        };

        let outcome = push_pending(&db, &sender, 100, &settings(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.sent, 5);
        let sizes: Vec<usize> = sender.calls.lock().unwrap().iter().map(|c| c.2).collect();
        assert_eq!(sizes, vec![5, 2, 2, 1]);
        assert_eq!(db.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_canceled_push_releases_claims() {
        let db = Database::open(":memory:").await.unwrap();
        db.enqueue("a1", StatusKey::Read, true).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = push_pending(&db, &RecordingSender::default(), 100, &settings(), &cancel)
            .await
            .unwrap_err();

        assert!(err.is_canceled());
        let ids: HashSet<String> = db.pending_article_ids(StatusKey::Read).await.unwrap();
        assert!(ids.contains("a1"));
        assert!(db.pending_changes().await.unwrap().iter().all(|c| !c.in_progress));
    }
}
