//! Per-entity-type sync handlers.
//!
//! A handler translates between local records and remote rows for one
//! entity type: it applies delta fetches through the conflict resolver,
//! reconciles remote deletes, pushes local intent and records the outcome.

mod link;
mod record;

pub use link::LinkHandler;
pub use record::RecordHandler;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fieldsync_common::{ActorId, EntityId, EntityType, Error, Result};
use fieldsync_remote::{RemoteEndpoint, RemoteRow};

use crate::config::SyncConfig;
use crate::conflict::ConflictResolver;
use crate::entity::{decode_wire, SyncMeta, SyncState, SyncTurn, SyncableEntity};
use crate::retry::{RetryCoordinator, RetrySummary};
use crate::store::{LocalStore, Transaction};

/// Everything a handler needs during one sync turn.
pub struct SyncContext<'a> {
    pub(crate) store: &'a LocalStore,
    pub(crate) remote: &'a dyn RemoteEndpoint,
    pub(crate) resolver: &'a ConflictResolver,
    pub(crate) retry: &'a RetryCoordinator,
    pub(crate) config: &'a SyncConfig,
    pub(crate) actor: &'a ActorId,
    pub(crate) turn: &'a SyncTurn,
    pub(crate) cancel: &'a CancellationToken,
}

impl SyncContext<'_> {
    pub fn actor(&self) -> &ActorId {
        self.actor
    }

    pub fn turn(&self) -> &SyncTurn {
        self.turn
    }

    /// Run one remote call under the caller's cancellation and the
    /// configured deadline. Both surface as errors, never as success.
    pub async fn call<T, F>(&self, request: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let timeout = self.config.request_timeout();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                Err(Error::Cancelled("sync turn cancelled".to_string()))
            }
            result = tokio::time::timeout(timeout, request) => {
                result.unwrap_or_else(|_| {
                    Err(Error::Network(format!("request timed out after {:?}", timeout)))
                })
            }
        }
    }

    /// Lower bound of the next delta window for `entity_type`.
    pub(crate) async fn delta_since(&self, entity_type: EntityType) -> Result<DateTime<Utc>> {
        Ok(match self.store.cursor(entity_type).await? {
            Some(cursor) => cursor - self.config.cursor_safety_buffer(),
            None => DateTime::<Utc>::UNIX_EPOCH,
        })
    }
}

/// Outcome of one sync-down step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DownReport {
    pub fetched: usize,
    pub applied: usize,
    pub unchanged: usize,
    pub kept_local: usize,
    /// Rows that failed to decode and were skipped this cycle.
    pub skipped: usize,
    /// Local rows removed because the remote no longer has them.
    pub removed: usize,
    /// Cursor to persist once the whole turn finalizes.
    #[serde(skip)]
    pub cursor: Option<DateTime<Utc>>,
}

/// Outcome of one sync-up step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpReport {
    pub pushed: usize,
    pub failed: usize,
    /// Failed entities skipped because their retry budget is spent.
    pub exhausted: usize,
    /// Remote deletes confirmed.
    pub deleted: usize,
    /// Local duplicate link rows collapsed before pushing.
    pub deduplicated: usize,
    /// Link rows re-keyed to the canonical remote id.
    pub adopted: usize,
    /// User-facing summaries of push failures.
    pub errors: Vec<String>,
}

/// Sync logic for one entity type.
#[async_trait]
pub trait EntitySyncHandler: Send + Sync {
    fn entity_type(&self) -> EntityType;

    /// Reclassify rows claiming `synced` without a confirmation timestamp.
    async fn repair_phantoms(&self, store: &LocalStore) -> Result<usize>;

    /// Fetch and apply remote changes since the cursor.
    async fn sync_down(&self, ctx: &SyncContext<'_>) -> Result<DownReport>;

    /// Push local deletes and `pending`/`failed` records.
    async fn sync_up(&self, ctx: &SyncContext<'_>) -> Result<UpReport>;

    /// Retry eligible `failed` records only.
    async fn retry_failed(&self, ctx: &SyncContext<'_>) -> Result<RetrySummary>;

    /// Store a row confirmed by the remote (e.g. a restore) as `synced`.
    async fn materialize(&self, store: &LocalStore, turn: &SyncTurn, row: &RemoteRow) -> Result<()>;

    /// Explicit user recovery of a failed record.
    ///
    /// Returns `false` if the record does not exist or is not failed.
    async fn reset_retries(&self, store: &LocalStore, id: EntityId) -> Result<bool>;
}

/// What applying one remote row did locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Applied {
    Inserted,
    Updated,
    Unchanged,
    KeptLocal,
    /// Deleted locally; the remote delete is still outstanding.
    Tombstoned,
}

/// Writes and counters of one sync-up step.
pub(crate) struct UpStep<'a> {
    pub(crate) txn: Transaction<'a>,
    pub(crate) report: UpReport,
    pub(crate) recovered: usize,
}

impl<'a> UpStep<'a> {
    pub(crate) fn new(txn: Transaction<'a>) -> Self {
        Self {
            txn,
            report: UpReport::default(),
            recovered: 0,
        }
    }
}

/// Fetch the delta window, then (optionally) the full id set.
///
/// Rows are fetched first so every row seen in the window is also covered
/// by the id set used for delete reconciliation.
pub(crate) async fn fetch_window(
    ctx: &SyncContext<'_>,
    entity_type: EntityType,
) -> Result<(Vec<RemoteRow>, Option<HashSet<EntityId>>)> {
    let since = ctx.delta_since(entity_type).await?;
    let rows = ctx.call(ctx.remote.fetch_changed(entity_type, since)).await?;
    let ids = if ctx.config.reconcile_deletes {
        Some(ctx.call(ctx.remote.fetch_ids(entity_type)).await?)
    } else {
        None
    };
    debug!("{}: {} rows since {}", entity_type, rows.len(), since);
    Ok((rows, ids))
}

/// Tracks the next cursor for a delta window.
///
/// The cursor never passes a row that failed to decode, so the row is
/// fetched again next cycle.
#[derive(Debug, Default)]
pub(crate) struct CursorTracker {
    newest: Option<DateTime<Utc>>,
    oldest_skipped: Option<DateTime<Utc>>,
}

impl CursorTracker {
    pub(crate) fn seen(&mut self, at: DateTime<Utc>) {
        self.newest = Some(self.newest.map_or(at, |n| n.max(at)));
    }

    pub(crate) fn skipped(&mut self, at: DateTime<Utc>) {
        self.oldest_skipped = Some(self.oldest_skipped.map_or(at, |o| o.min(at)));
    }

    pub(crate) fn cursor(&self) -> Option<DateTime<Utc>> {
        match (self.newest, self.oldest_skipped) {
            (Some(newest), Some(skipped)) => Some(newest.min(skipped)),
            (newest, None) => newest,
            (None, Some(skipped)) => Some(skipped),
        }
    }
}

/// Decode a row, logging and counting shape errors.
pub(crate) fn decode_or_skip<E: SyncableEntity>(
    row: &RemoteRow,
    report: &mut DownReport,
    cursor: &mut CursorTracker,
) -> Option<E::Wire> {
    cursor.seen(row.updated_at);
    match decode_wire::<E>(row) {
        Ok(wire) => Some(wire),
        Err(e) => {
            warn!(
                entity_type = %E::ENTITY_TYPE,
                id = %row.id,
                "Skipping malformed remote row: {}",
                e
            );
            report.skipped += 1;
            cursor.skipped(row.updated_at);
            None
        }
    }
}

/// Apply one decoded remote row under the conflict resolver.
pub(crate) async fn apply_remote_row<E: SyncableEntity>(
    ctx: &SyncContext<'_>,
    txn: &mut Transaction<'_>,
    row: &RemoteRow,
    wire: E::Wire,
) -> Result<Applied> {
    if txn.is_tombstoned(E::ENTITY_TYPE, row.id).await? {
        return Ok(Applied::Tombstoned);
    }

    let Some(mut local) = txn.get::<E>(row.id).await? else {
        let entity = E::from_wire(row.id, SyncMeta::confirmed(row.updated_at), wire);
        txn.put(&entity, None)?;
        return Ok(Applied::Inserted);
    };

    let authority = ctx.resolver.authority(&local, row.updated_at);
    if authority.is_local() {
        debug!(
            "Keeping local {} {} ({:?})",
            E::ENTITY_TYPE,
            row.id,
            authority
        );
        return Ok(Applied::KeptLocal);
    }

    let meta = local.meta();
    let unchanged = meta.sync_state() == SyncState::Synced
        && meta.synced_at().is_some()
        && meta.updated_at() == row.updated_at
        && local.to_wire() == wire;
    if unchanged {
        return Ok(Applied::Unchanged);
    }

    let base = txn.base_of(E::ENTITY_TYPE, row.id).await?;
    local.apply_wire(wire);
    local.meta_mut().adopt_remote(row.updated_at);
    txn.put(&local, base)?;
    Ok(Applied::Updated)
}

/// Count an apply outcome.
pub(crate) fn tally(report: &mut DownReport, applied: Applied) {
    match applied {
        Applied::Inserted | Applied::Updated => report.applied += 1,
        Applied::Unchanged => report.unchanged += 1,
        Applied::KeptLocal | Applied::Tombstoned => report.kept_local += 1,
    }
}

/// Remove local rows confirmed earlier but absent remotely.
///
/// Rows never confirmed by the remote are local intent and are kept.
pub(crate) async fn reconcile_deletes<E: SyncableEntity>(
    txn: &mut Transaction<'_>,
    remote_ids: &HashSet<EntityId>,
) -> Result<Vec<E>> {
    let mut removed = Vec::new();
    for local in txn.all::<E>().await? {
        let meta = local.meta();
        let confirmed = meta.sync_state() == SyncState::Synced && meta.synced_at().is_some();
        if confirmed && !remote_ids.contains(&local.id()) {
            debug!("{} {} was deleted remotely", E::ENTITY_TYPE, local.id());
            let base = txn.base_of(E::ENTITY_TYPE, local.id()).await?;
            txn.remove(E::ENTITY_TYPE, local.id(), base);
            removed.push(local);
        }
    }
    Ok(removed)
}

/// Push outstanding local deletes. Returns the ids confirmed deleted.
pub(crate) async fn push_tombstones(
    ctx: &SyncContext<'_>,
    step: &mut UpStep<'_>,
    entity_type: EntityType,
) -> Result<Vec<EntityId>> {
    let mut confirmed = Vec::new();
    for id in ctx.store.tombstones(entity_type).await? {
        let result = {
            let _in_flight = ctx.resolver.begin_push(id);
            ctx.call(ctx.remote.delete(entity_type, id, ctx.actor)).await
        };
        match result {
            Ok(()) | Err(Error::NotFound(_)) => {
                step.txn.clear_tombstone(entity_type, id, None);
                step.report.deleted += 1;
                confirmed.push(id);
            }
            Err(e) => {
                warn!("Delete of {} {} failed: {}", entity_type, id, e);
                step.report.failed += 1;
                step.report.errors.push(e.summary());
            }
        }
    }
    Ok(confirmed)
}

/// Record the outcome of a push on the pushed copy and stage it.
///
/// Transient failures stay eligible for automatic retry; anything else
/// (permission, integrity, shape) exhausts the retry budget.
pub(crate) fn record_push<E: SyncableEntity>(
    ctx: &SyncContext<'_>,
    step: &mut UpStep<'_>,
    mut entity: E,
    base: Option<DateTime<Utc>>,
    result: &Result<RemoteRow>,
) {
    let was_retry = entity.meta().retry_count() > 0;
    match result {
        Ok(stored) => {
            entity.meta_mut().adopt_remote(stored.updated_at);
            step.report.pushed += 1;
            if was_retry {
                step.recovered += 1;
            }
        }
        Err(e) => {
            let exhaust = (!e.is_transient()).then_some(ctx.config.max_retries);
            warn!(
                entity_type = %E::ENTITY_TYPE,
                id = %entity.id(),
                retry_count = entity.meta().retry_count(),
                "Push failed: {}",
                e
            );
            entity.meta_mut().mark_failed(e.to_string(), exhaust);
            step.report.failed += 1;
            step.report.errors.push(e.summary());
        }
    }
    if let Err(e) = step.txn.put(&entity, base) {
        warn!("Could not stage {} {}: {}", E::ENTITY_TYPE, entity.id(), e);
    }
}

/// Re-read `entity` inside the step so a push never sends a stale copy.
///
/// Retry bookkeeping decided on the detached copy is carried over.
pub(crate) async fn fresh_copy<E: SyncableEntity>(
    step: &UpStep<'_>,
    entity: &E,
) -> Result<Option<(E, Option<DateTime<Utc>>)>> {
    let Some(mut current) = step.txn.get::<E>(entity.id()).await? else {
        return Ok(None);
    };
    if !current.meta().sync_state().needs_push() {
        return Ok(None);
    }
    let base = step.txn.base_of(E::ENTITY_TYPE, entity.id()).await?;
    if current.meta().retry_count() != entity.meta().retry_count() {
        current.meta_mut().carry_retry_from(entity.meta());
    }
    Ok(Some((current, base)))
}

pub(crate) async fn repair_phantoms<E: SyncableEntity>(store: &LocalStore) -> Result<usize> {
    let mut txn = store.begin();
    let mut repaired = 0;
    for mut entity in store.all::<E>().await? {
        if entity.meta().is_phantom() {
            let base = Some(entity.meta().updated_at());
            entity.meta_mut().demote_phantom();
            txn.put(&entity, base)?;
            repaired += 1;
        }
    }
    txn.commit().await?;
    if repaired > 0 {
        info!("Reclassified {} phantom {} rows as pending", repaired, E::ENTITY_TYPE);
    }
    Ok(repaired)
}

pub(crate) async fn reset_retries<E: SyncableEntity>(store: &LocalStore, id: EntityId) -> Result<bool> {
    let Some(mut entity) = store.get::<E>(id).await? else {
        return Ok(false);
    };
    if entity.meta().sync_state() != SyncState::Failed {
        return Ok(false);
    }
    let base = Some(entity.meta().updated_at());
    entity.meta_mut().reset_retries();
    let mut txn = store.begin();
    txn.put(&entity, base)?;
    Ok(txn.commit().await? > 0)
}

/// Store a remote-confirmed row as `synced`, clearing any tombstone.
pub(crate) async fn materialize_row<E: SyncableEntity>(
    txn: &mut Transaction<'_>,
    row: &RemoteRow,
) -> Result<E> {
    let wire = decode_wire::<E>(row)?;
    let base = txn.base_of(E::ENTITY_TYPE, row.id).await?;
    let entity = match txn.get::<E>(row.id).await? {
        Some(mut local) => {
            local.apply_wire(wire);
            local.meta_mut().adopt_remote(row.updated_at);
            local
        }
        None => E::from_wire(row.id, SyncMeta::confirmed(row.updated_at), wire),
    };
    txn.clear_tombstone(E::ENTITY_TYPE, row.id, base);
    txn.put(&entity, base)?;
    Ok(entity)
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_cursor_stops_at_oldest_skipped_row() {
        let now = Utc::now();
        let mut tracker = CursorTracker::default();
        assert_eq!(tracker.cursor(), None);

        tracker.seen(now - Duration::seconds(10));
        tracker.seen(now);
        assert_eq!(tracker.cursor(), Some(now));

        tracker.skipped(now - Duration::seconds(5));
        tracker.skipped(now - Duration::seconds(2));
        assert_eq!(tracker.cursor(), Some(now - Duration::seconds(5)));
    }
}
