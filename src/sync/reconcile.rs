//! Merging authoritative remote state into the local store.
//!
//! Every reconciliation excludes ids with a pending local change for the same
//! key: an unacknowledged local edit is never overwritten by a remote read.

use std::collections::{HashMap, HashSet};

use crate::remote::{ZoneChanges, ZoneRecord};
use crate::storage::{Article, Database, DefaultReadPolicy, StatusKey, StoreResult};

/// Which status set a remote id stream describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconcileTarget {
    /// The stream lists unread ids (`read = false`).
    Unread,
    /// The stream lists starred ids (`starred = true`).
    Starred,
}

impl ReconcileTarget {
    pub fn key(self) -> StatusKey {
        match self {
            ReconcileTarget::Unread => StatusKey::Read,
            ReconcileTarget::Starred => StatusKey::Starred,
        }
    }

    /// Stored flag value meaning "listed by the remote stream".
    pub fn present_flag(self) -> bool {
        match self {
            ReconcileTarget::Unread => false,
            ReconcileTarget::Starred => true,
        }
    }
}

/// Minimal status writes that bring the local set in line with the remote one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Ids to move into the target set.
    pub add: HashSet<String>,
    /// Ids to move out of the target set.
    pub remove: HashSet<String>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

/// Pure reconciliation planner.
///
/// `add = (remote - pending) - local`, `remove = local - remote - pending`.
pub fn plan(
    remote: &HashSet<String>,
    pending: &HashSet<String>,
    local: &HashSet<String>,
) -> ReconcilePlan {
    let add = remote
        .iter()
        .filter(|id| !pending.contains(*id) && !local.contains(*id))
        .cloned()
        .collect();
    let remove = local
        .iter()
        .filter(|id| !remote.contains(*id) && !pending.contains(*id))
        .cloned()
        .collect();
    ReconcilePlan { add, remove }
}

/// Ids whose stored status changed while applying a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub added: usize,
    pub removed: usize,
}

/// Reconcile one target set against a fully drained remote id stream.
///
/// Both halves are attempted. If either fails the first error is returned and
/// the half that succeeded stays applied.
pub async fn reconcile(
    db: &Database,
    target: ReconcileTarget,
    remote: &HashSet<String>,
) -> StoreResult<ReconcileOutcome> {
    let key = target.key();
    let present = target.present_flag();

    let local = db.ids_with_flag(key, present).await?;
    // Read pending last so an edit made while the local set was loading is still excluded.
    let pending = db.pending_article_ids(key).await?;
    let plan = plan(remote, &pending, &local);

    if plan.is_empty() {
        tracing::debug!(status_set = ?target, remote = remote.len(), "Status set already in sync");
        return Ok(ReconcileOutcome::default());
    }

    let added = db.mark_unless_pending(&plan.add, key, present).await;
    let removed = db.mark_unless_pending(&plan.remove, key, !present).await;

    let outcome = ReconcileOutcome {
        added: added.as_ref().map_or(0, |ids| ids.len()),
        removed: removed.as_ref().map_or(0, |ids| ids.len()),
    };
    tracing::info!(
        status_set = ?target,
        remote = remote.len(),
        pending = pending.len(),
        added = outcome.added,
        removed = outcome.removed,
        "Reconciled status set"
    );

    added?;
    removed?;
    Ok(outcome)
}

/// Record that the remote knows these ids. Ids seen for the first time get
/// a status whose read flag follows `policy`; known ids are left alone.
pub async fn ingest_existence(
    db: &Database,
    remote_ids: &HashSet<String>,
    policy: DefaultReadPolicy,
) -> StoreResult<HashSet<String>> {
    db.ensure_statuses(remote_ids, policy.read()).await
}

/// Counts from applying one delta-zone batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZoneApplyOutcome {
    pub articles_written: usize,
    pub statuses_changed: usize,
    pub articles_deleted: u64,
    pub pending_discarded: u64,
}

/// Apply one batch of the zone change feed.
///
/// Article records are upserted. Status records set only the fields they
/// carry, skipping ids with a pending change for that field. Deleted keys
/// win over local state: the article, its status and any pending rows for
/// the id are removed.
pub async fn apply_zone_changes(
    db: &Database,
    changes: &ZoneChanges,
    policy: DefaultReadPolicy,
) -> StoreResult<ZoneApplyOutcome> {
    let mut outcome = ZoneApplyOutcome::default();
    let deleted: HashSet<String> = changes
        .deleted
        .iter()
        .map(|key| key.article_id().to_string())
        .collect();

    let articles: Vec<Article> = changes
        .changed
        .iter()
        .filter_map(|record| match record {
            ZoneRecord::Article(article) if !deleted.contains(&article.article_id) => {
                Some(article.clone())
            }
            _ => None,
        })
        .collect();
    outcome.articles_written = db.upsert_articles(&articles, policy).await?.writes();

    // A later record for the same id and key overrides an earlier one.
    let mut latest: HashMap<(&str, StatusKey), bool> = HashMap::new();
    for record in &changes.changed {
        let ZoneRecord::Status(status) = record else {
            continue;
        };
        if deleted.contains(&status.article_id) {
            continue;
        }
        if let Some(read) = status.read {
            latest.insert((status.article_id.as_str(), StatusKey::Read), read);
        }
        if let Some(starred) = status.starred {
            latest.insert((status.article_id.as_str(), StatusKey::Starred), starred);
        }
    }

    for key in [StatusKey::Read, StatusKey::Starred] {
        let pending = db.pending_article_ids(key).await?;
        for flag in [true, false] {
            let ids: HashSet<String> = latest
                .iter()
                .filter(|((id, k), f)| *k == key && **f == flag && !pending.contains(*id))
                .map(|((id, _), _)| id.to_string())
                .collect();
            outcome.statuses_changed += db.mark_unless_pending(&ids, key, flag).await?.len();
        }
    }

    if !deleted.is_empty() {
        outcome.articles_deleted = db.delete_articles(&deleted).await?;
        db.delete_statuses(&deleted).await?;
        outcome.pending_discarded = db.discard_pending(&deleted).await?;
        if outcome.pending_discarded > 0 {
            tracing::info!(
                discarded = outcome.pending_discarded,
                "Discarded pending changes for remotely deleted articles"
            );
        }
    }

    Ok(outcome)
}
