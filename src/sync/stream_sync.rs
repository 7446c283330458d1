//! Sync graph for cursor-stream providers.
//!
//! ```text
//! send_statuses ───────────────────────────────────────────────┐
//! get_collections → mirror_folders → ingest_all_ids ─┐          │
//!                                   ├ ingest_unread ─┤          │
//!                                   ├ ingest_starred ┼ missing_ids → download → checkpoint
//!                                   └ get_updated ───┘
//! ```

use futures::{FutureExt, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::error::{PipelineError, SyncError};
use super::pipeline::{Pipeline, PipelineBuilder, StepOutput};
use super::push::push_pending;
use super::reconcile::{ingest_existence, reconcile, ReconcileTarget};
use super::settings::SyncSettings;
use crate::remote::{with_retry, CursorStream, StreamFilter, StreamResource};
use crate::storage::{Collection, Database};

/// Checkpoint holding the continuation of an interrupted all-ids pass.
pub const ALL_IDS_CHECKPOINT: &str = "stream.all";
/// Checkpoint holding the start time of the last completed run.
pub const UPDATED_CHECKPOINT: &str = "stream.updated";

/// Ids seen by the all-ids pass.
#[derive(Debug, Clone, Default)]
pub(crate) struct AllIdsPass {
    pub ids: HashSet<String>,
    /// False when the pass resumed from a stored continuation and so only saw
    /// the tail of the stream.
    pub complete: bool,
}

pub(crate) struct StreamContext {
    db: Database,
    provider: Arc<dyn CursorStream>,
    settings: SyncSettings,
    cancel: CancellationToken,
    run_started: i64,
    collections: StepOutput<Vec<Collection>>,
    all_ids: StepOutput<AllIdsPass>,
    updated_ids: StepOutput<HashSet<String>>,
    missing_ids: StepOutput<Vec<String>>,
}

impl StreamContext {
    pub(crate) fn new(
        db: Database,
        provider: Arc<dyn CursorStream>,
        settings: SyncSettings,
        cancel: CancellationToken,
        run_started: i64,
    ) -> Self {
        Self {
            db,
            provider,
            settings,
            cancel,
            run_started,
            collections: StepOutput::new("get_collections"),
            all_ids: StepOutput::new("ingest_all_ids"),
            updated_ids: StepOutput::new("get_updated"),
            missing_ids: StepOutput::new("missing_ids"),
        }
    }

    fn check_canceled(&self) -> Result<(), SyncError> {
        if self.cancel.is_cancelled() {
            Err(SyncError::Canceled)
        } else {
            Ok(())
        }
    }

    async fn send_statuses(&self) -> Result<(), SyncError> {
        push_pending(
            &self.db,
            self.provider.as_ref(),
            self.settings.status_chunk_size,
            &self.settings,
            &self.cancel,
        )
        .await?;
        Ok(())
    }

    async fn get_collections(&self) -> Result<(), SyncError> {
        let provider = self.provider.as_ref();
        let collections = with_retry(&self.settings.retry, &self.cancel, "fetch collections", || {
            provider.fetch_collections()
        })
        .await?;
        self.collections.set(collections);
        Ok(())
    }

    async fn mirror_folders(&self) -> Result<(), SyncError> {
        let collections = self.collections.get()?;
        self.db.mirror_collections(collections).await?;
        Ok(())
    }

    /// Page through every id the remote holds, creating statuses for new ones.
    ///
    /// The continuation is stored after each page, so a canceled or failed
    /// pass resumes from the last page that was fully applied.
    async fn ingest_all_ids(&self) -> Result<(), SyncError> {
        let provider = self.provider.as_ref();
        let filter = StreamFilter::default();
        let mut continuation = self.db.checkpoint(ALL_IDS_CHECKPOINT).await?.token;
        let resumed = continuation.is_some();
        if resumed {
            tracing::info!(continuation = ?continuation, "Resuming interrupted all-ids pass");
        }

        let mut seen = HashSet::new();
        let mut pages = 0u32;
        loop {
            self.check_canceled()?;
            let cursor = continuation.as_deref();
            let page = with_retry(&self.settings.retry, &self.cancel, "fetch all ids", || {
                provider.fetch_page(StreamResource::All, cursor, &filter)
            })
            .await?;
            // Cancellation between fetch and apply drops the page; the stored cursor still points before it.
            self.check_canceled()?;

            let ids: HashSet<String> = page.ids.into_iter().collect();
            ingest_existence(&self.db, &ids, self.settings.default_read).await?;
            seen.extend(ids);
            self.db
                .save_token(ALL_IDS_CHECKPOINT, page.continuation.as_deref())
                .await?;
            pages += 1;

            match page.continuation {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }

        tracing::info!(ids = seen.len(), pages = pages, resumed = resumed, "Ingested all ids");
        self.all_ids.set(AllIdsPass {
            ids: seen,
            complete: !resumed,
        });
        Ok(())
    }

    /// Drain a stream into memory. Nothing is applied until the last page.
    async fn drain(&self, resource: StreamResource, filter: &StreamFilter) -> Result<HashSet<String>, SyncError> {
        let provider = self.provider.as_ref();
        let mut ids = HashSet::new();
        let mut continuation: Option<String> = None;
        loop {
            self.check_canceled()?;
            let cursor = continuation.as_deref();
            let page = with_retry(&self.settings.retry, &self.cancel, resource.as_str(), || {
                provider.fetch_page(resource, cursor, filter)
            })
            .await?;
            ids.extend(page.ids);
            match page.continuation {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }
        tracing::debug!(stream = %resource, ids = ids.len(), "Drained id stream");
        Ok(ids)
    }

    async fn ingest_status_set(&self, target: ReconcileTarget) -> Result<(), SyncError> {
        let resource = match target {
            ReconcileTarget::Unread => StreamResource::Unread,
            ReconcileTarget::Starred => StreamResource::Starred,
        };
        let remote = self.drain(resource, &StreamFilter::default()).await?;
        self.check_canceled()?;
        reconcile(&self.db, target, &remote).await?;
        Ok(())
    }

    async fn get_updated(&self) -> Result<(), SyncError> {
        let since = self
            .db
            .checkpoint(UPDATED_CHECKPOINT)
            .await?
            .last_fetch_start
            .unwrap_or_else(|| self.settings.unread_window_start(self.run_started));
        let filter = StreamFilter {
            newer_than: Some(since),
            count: None,
        };
        let updated = self.drain(StreamResource::All, &filter).await?;
        self.updated_ids.set(updated);
        Ok(())
    }

    async fn missing_ids(&self) -> Result<(), SyncError> {
        let cutoff = self.settings.unread_window_start(self.run_started);
        let mut missing = self.db.ids_missing_or_stale_since(cutoff).await?;
        missing.extend(self.updated_ids.get()?.iter().cloned());

        let mut missing: Vec<String> = missing.into_iter().collect();
        missing.sort();
        tracing::info!(count = missing.len(), "Articles to download");
        self.missing_ids.set(missing);
        Ok(())
    }

    /// Fetch bodies for missing ids in chunks, a few requests at a time.
    async fn download(&self) -> Result<(), SyncError> {
        let missing = self.missing_ids.get()?;
        if missing.is_empty() {
            return Ok(());
        }

        let provider = self.provider.as_ref();
        let retry = &self.settings.retry;
        let cancel = &self.cancel;
        let chunks: Vec<Vec<String>> = missing
            .chunks(self.settings.entries_chunk_size.max(1))
            .map(<[String]>::to_vec)
            .collect();
        let mut fetches = futures::stream::iter(chunks)
            .map(move |chunk: Vec<String>| async move {
                with_retry(retry, cancel, "fetch entries", || provider.fetch_entries(&chunk)).await
            })
            .buffer_unordered(self.settings.download_concurrency.max(1));

        let mut written = 0;
        while let Some(fetched) = fetches.next().await {
            let articles = fetched?;
            self.check_canceled()?;
            written += self
                .db
                .upsert_articles(&articles, self.settings.default_read)
                .await?
                .writes();
        }
        tracing::info!(requested = missing.len(), written = written, "Downloaded articles");
        Ok(())
    }

    /// Record the run start and apply retention. Only a complete all-ids pass
    /// says which old articles the remote has dropped.
    async fn checkpoint(&self) -> Result<(), SyncError> {
        self.db
            .set_last_fetch_start(UPDATED_CHECKPOINT, self.run_started)
            .await?;

        let cutoff = self.settings.retention_cutoff(self.run_started);
        let pass = self.all_ids.get()?;
        if pass.complete {
            self.db.delete_old_articles(cutoff, &pass.ids).await?;
        } else {
            tracing::debug!("Skipping retention after a resumed all-ids pass");
        }
        self.db.prune_statuses(cutoff).await?;
        Ok(())
    }
}

/// Build the cursor-stream graph. Insertion order breaks ties among ready steps.
pub(crate) fn stream_pipeline() -> Result<Pipeline<StreamContext>, PipelineError> {
    PipelineBuilder::new()
        .step("send_statuses", &[], |ctx: Arc<StreamContext>| {
            async move { ctx.send_statuses().await }.boxed()
        })
        .step("get_collections", &[], |ctx: Arc<StreamContext>| {
            async move { ctx.get_collections().await }.boxed()
        })
        .step("mirror_folders", &["get_collections"], |ctx: Arc<StreamContext>| {
            async move { ctx.mirror_folders().await }.boxed()
        })
        .step("ingest_all_ids", &["mirror_folders"], |ctx: Arc<StreamContext>| {
            async move { ctx.ingest_all_ids().await }.boxed()
        })
        .step("ingest_unread", &["mirror_folders"], |ctx: Arc<StreamContext>| {
            async move { ctx.ingest_status_set(ReconcileTarget::Unread).await }.boxed()
        })
        .step("ingest_starred", &["mirror_folders"], |ctx: Arc<StreamContext>| {
            async move { ctx.ingest_status_set(ReconcileTarget::Starred).await }.boxed()
        })
        .step("get_updated", &["mirror_folders"], |ctx: Arc<StreamContext>| {
            async move { ctx.get_updated().await }.boxed()
        })
        .step(
            "missing_ids",
            &["ingest_all_ids", "ingest_unread", "ingest_starred", "get_updated"],
            |ctx: Arc<StreamContext>| async move { ctx.missing_ids().await }.boxed(),
        )
        .step("download", &["missing_ids"], |ctx: Arc<StreamContext>| {
            async move { ctx.download().await }.boxed()
        })
        .step("checkpoint", &["download", "send_statuses"], |ctx: Arc<StreamContext>| {
            async move { ctx.checkpoint().await }.boxed()
        })
        .build()
}
