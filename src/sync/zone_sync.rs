//! Sync graph for delta-zone providers:
//! `send_statuses → fetch_zone_changes → prune → checkpoint`.

use futures::FutureExt;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::error::{PipelineError, SyncError};
use super::pipeline::{Pipeline, PipelineBuilder};
use super::push::push_pending;
use super::reconcile::{apply_zone_changes, ZoneApplyOutcome};
use super::settings::SyncSettings;
use crate::remote::{with_retry, DeltaZone, RemoteError};
use crate::storage::Database;

/// Checkpoint name for a zone's change token.
pub fn zone_checkpoint(zone: &str) -> String {
    format!("zone.{zone}")
}

pub(crate) struct ZoneContext {
    db: Database,
    provider: Arc<dyn DeltaZone>,
    settings: SyncSettings,
    cancel: CancellationToken,
    run_started: i64,
    checkpoint: String,
}

impl ZoneContext {
    pub(crate) fn new(
        db: Database,
        provider: Arc<dyn DeltaZone>,
        settings: SyncSettings,
        cancel: CancellationToken,
        run_started: i64,
    ) -> Self {
        let checkpoint = zone_checkpoint(&settings.zone_name);
        Self {
            db,
            provider,
            settings,
            cancel,
            run_started,
            checkpoint,
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
            self.settings.modify_chunk_size,
            &self.settings,
            &self.cancel,
        )
        .await?;
        Ok(())
    }

    /// Follow the change feed from the stored token until the remote has no
    /// more batches.
    ///
    /// The token is stored after each applied batch. An expired token is
    /// forgotten and the feed restarts from the beginning; a missing zone is
    /// created first. Both restarts are bounded by `max_fetch_restarts`.
    async fn fetch_zone_changes(&self) -> Result<(), SyncError> {
        let provider = self.provider.as_ref();
        let retry = &self.settings.retry;
        let mut token = self.db.checkpoint(&self.checkpoint).await?.token;
        let mut restarts = 0;
        let mut totals = ZoneApplyOutcome::default();
        let mut batches = 0u32;

        loop {
            self.check_canceled()?;
            let current = token.as_deref();
            let fetched = with_retry(retry, &self.cancel, "fetch zone changes", || {
                provider.fetch_changes(current)
            })
            .await;

            let changes = match fetched {
                Ok(changes) => changes,
                Err(RemoteError::ChangeTokenExpired) if restarts < self.settings.max_fetch_restarts => {
                    tracing::warn!(zone = %self.settings.zone_name, "Change token expired, refetching zone");
                    self.db.reset_token(&self.checkpoint).await?;
                    token = None;
                    restarts += 1;
                    continue;
                }
                Err(RemoteError::ZoneNotFound) if restarts < self.settings.max_fetch_restarts => {
                    tracing::warn!(zone = %self.settings.zone_name, "Zone not found, creating it");
                    with_retry(retry, &self.cancel, "create zone", || provider.create_zone()).await?;
                    self.db.reset_token(&self.checkpoint).await?;
                    token = None;
                    restarts += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            self.check_canceled()?;

            let applied = apply_zone_changes(&self.db, &changes, self.settings.default_read).await?;
            totals.articles_written += applied.articles_written;
            totals.statuses_changed += applied.statuses_changed;
            totals.articles_deleted += applied.articles_deleted;
            totals.pending_discarded += applied.pending_discarded;
            batches += 1;

            if let Some(new_token) = changes.new_token.as_deref() {
                self.db.save_token(&self.checkpoint, Some(new_token)).await?;
            }
            if !changes.more_coming {
                break;
            }
            if changes.new_token.is_none() {
                tracing::warn!(zone = %self.settings.zone_name, "Zone reported more changes without a token, stopping");
                break;
            }
            token = changes.new_token;
        }

        tracing::info!(
            zone = %self.settings.zone_name,
            batches = batches,
            articles_written = totals.articles_written,
            statuses_changed = totals.statuses_changed,
            articles_deleted = totals.articles_deleted,
            "Applied zone changes"
        );
        Ok(())
    }

    /// Retention. The change feed never enumerates the whole zone, so only
    /// ids with queued local changes are protected besides starred articles.
    async fn prune(&self) -> Result<(), SyncError> {
        let cutoff = self.settings.retention_cutoff(self.run_started);
        let protected: HashSet<String> = self
            .db
            .pending_changes()
            .await?
            .into_iter()
            .map(|change| change.article_id)
            .collect();
        self.db.delete_old_articles(cutoff, &protected).await?;
        self.db.prune_statuses(cutoff).await?;
        Ok(())
    }

    async fn checkpoint(&self) -> Result<(), SyncError> {
        self.db
            .set_last_fetch_start(&self.checkpoint, self.run_started)
            .await?;
        Ok(())
    }
}

pub(crate) fn zone_pipeline() -> Result<Pipeline<ZoneContext>, PipelineError> {
    PipelineBuilder::new()
        .step("send_statuses", &[], |ctx: Arc<ZoneContext>| {
            async move { ctx.send_statuses().await }.boxed()
        })
        .step("fetch_zone_changes", &["send_statuses"], |ctx: Arc<ZoneContext>| {
            async move { ctx.fetch_zone_changes().await }.boxed()
        })
        .step("prune", &["fetch_zone_changes"], |ctx: Arc<ZoneContext>| {
            async move { ctx.prune().await }.boxed()
        })
        .step("checkpoint", &["prune"], |ctx: Arc<ZoneContext>| {
            async move { ctx.checkpoint().await }.boxed()
        })
        .build()
}
