use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::error::SyncError;
use super::pipeline::RunReport;
use super::progress::{Progress, ProgressTracker};
use super::settings::SyncSettings;
use super::stream_sync::{stream_pipeline, StreamContext};
use super::zone_sync::{zone_pipeline, ZoneContext};
use crate::remote::{CursorStream, DeltaZone};
use crate::storage::{Database, PendingChange, StatusKey};

/// The remote an engine syncs with.
#[derive(Clone)]
pub enum Provider {
    Stream(Arc<dyn CursorStream>),
    Zone(Arc<dyn DeltaZone>),
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provider::Stream(_) => f.write_str("Provider::Stream"),
            Provider::Zone(_) => f.write_str("Provider::Zone"),
        }
    }
}

/// Clears the running flag when a run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs sync passes against one provider and records local edits.
///
/// One run at a time; a second `run_sync` while one is active fails with
/// [`SyncError::AlreadyRunning`].
pub struct SyncEngine {
    db: Database,
    provider: Provider,
    settings: SyncSettings,
    progress: ProgressTracker,
    cancel: Mutex<CancellationToken>,
    running: AtomicBool,
    runs: AtomicU64,
    last_report: Mutex<Option<RunReport>>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("provider", &self.provider)
            .field("running", &self.is_running())
            .field("runs", &self.runs.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    pub fn new(db: Database, provider: Provider, settings: SyncSettings) -> Self {
        Self {
            db,
            provider,
            settings,
            progress: ProgressTracker::new(),
            cancel: Mutex::new(CancellationToken::new()),
            running: AtomicBool::new(false),
            runs: AtomicU64::new(0),
            last_report: Mutex::new(None),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn progress(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Cancel the active run, if any. Unstarted steps are canceled at once;
    /// the running step stops at its next page or chunk boundary.
    pub fn cancel(&self) {
        let token = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        if !token.is_cancelled() {
            tracing::info!("Sync cancel requested");
        }
        token.cancel();
    }

    /// Per-step states of the most recent finished run.
    pub fn last_report(&self) -> Option<RunReport> {
        self.last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run one full sync pass.
    ///
    /// `Ok` means every step completed. A canceled run returns
    /// [`SyncError::Canceled`]; the per-step report is still available from
    /// [`SyncEngine::last_report`].
    pub async fn run_sync(&self) -> Result<RunReport, SyncError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(SyncError::AlreadyRunning);
        }
        let _guard = RunGuard(&self.running);

        let cancel = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = cancel.clone();

        let run_id = self.runs.fetch_add(1, Ordering::Relaxed) + 1;
        let span = tracing::info_span!("sync_run", run_id = run_id);
        self.run_pipeline(cancel).instrument(span).await
    }

    async fn run_pipeline(&self, cancel: CancellationToken) -> Result<RunReport, SyncError> {
        let run_started = chrono::Utc::now().timestamp();
        tracing::info!(provider = ?self.provider, "Sync started");

        let (report, outcome) = match &self.provider {
            Provider::Stream(provider) => {
                let pipeline = stream_pipeline()?;
                let ctx = Arc::new(StreamContext::new(
                    self.db.clone(),
                    Arc::clone(provider),
                    self.settings.clone(),
                    cancel.clone(),
                    run_started,
                ));
                pipeline.run(ctx, &cancel, &self.progress).await
            }
            Provider::Zone(provider) => {
                let pipeline = zone_pipeline()?;
                let ctx = Arc::new(ZoneContext::new(
                    self.db.clone(),
                    Arc::clone(provider),
                    self.settings.clone(),
                    cancel.clone(),
                    run_started,
                ));
                pipeline.run(ctx, &cancel, &self.progress).await
            }
        };

        *self.last_report.lock().unwrap_or_else(PoisonError::into_inner) = Some(report.clone());

        match outcome {
            Ok(()) => {
                tracing::info!(steps = report.states.len(), "Sync finished");
                Ok(report)
            }
            Err(SyncError::Canceled) => {
                tracing::info!(report = %report, "Sync canceled");
                Err(SyncError::Canceled)
            }
            Err(e) => {
                tracing::warn!(error = %e, report = %report, "Sync failed");
                Err(e)
            }
        }
    }

    /// Record a local edit and queue it for the remote. See [`queue_local_edit`].
    pub async fn enqueue_local_edit(
        &self,
        article_ids: &HashSet<String>,
        key: StatusKey,
        flag: bool,
    ) -> Result<usize, SyncError> {
        queue_local_edit(&self.db, article_ids, key, flag).await
    }
}

/// Record a local edit and queue it for the remote.
///
/// For `Read` and `Starred` only ids whose stored value differs are queued,
/// and they are queued before the local status changes so a concurrent
/// reconciliation already sees them as pending. `New` and `Deleted` have no
/// local column and are queued for every id. Returns the number of queued
/// changes.
pub async fn queue_local_edit(
    db: &Database,
    article_ids: &HashSet<String>,
    key: StatusKey,
    flag: bool,
) -> Result<usize, SyncError> {
    if key.status_column().is_none() {
        let changes: Vec<PendingChange> = article_ids
            .iter()
            .map(|id| PendingChange::new(id.clone(), key, flag))
            .collect();
        db.enqueue_many(&changes).await?;
        return Ok(changes.len());
    }

    let current = db.statuses(article_ids).await?;
    let unchanged: HashSet<&str> = current
        .iter()
        .filter(|status| match key {
            StatusKey::Read => status.read == flag,
            _ => status.starred == flag,
        })
        .map(|status| status.article_id.as_str())
        .collect();
    let changed: HashSet<String> = article_ids
        .iter()
        .filter(|id| !unchanged.contains(id.as_str()))
        .cloned()
        .collect();

    let changes: Vec<PendingChange> = changed
        .iter()
        .map(|id| PendingChange::new(id.clone(), key, flag))
        .collect();
    db.enqueue_many(&changes).await?;
    db.mark(&changed, key, flag).await?;

    tracing::debug!(key = %key, flag = flag, queued = changes.len(), "Queued local edit");
    Ok(changes.len())
}
