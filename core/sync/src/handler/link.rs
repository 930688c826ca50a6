//! Handler for link rows unique on a natural key.
//!
//! Link rows are pushed by natural key, so the remote may answer with a
//! different primary key than the one generated locally. Local duplicates
//! of a key are collapsed before any push, and the parent's member
//! collection is kept in line with the local link rows using sync-turn
//! origin, which never marks the parent pending.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::marker::PhantomData;
use tracing::{debug, warn};

use fieldsync_common::{EntityId, EntityType, Result};
use fieldsync_remote::RemoteRow;

use super::{
    apply_remote_row, decode_or_skip, fetch_window, fresh_copy, materialize_row, push_tombstones,
    reconcile_deletes, record_push, repair_phantoms, reset_retries, tally, CursorTracker,
    DownReport, EntitySyncHandler, SyncContext, UpReport, UpStep,
};
use crate::entity::{
    to_row, LinkEntity, MutationOrigin, RelationshipParent, SyncMeta, SyncState, SyncTurn,
    SyncableEntity,
};
use crate::retry::RetrySummary;
use crate::store::{LocalStore, Transaction};

/// Sync handler for a link entity type.
pub struct LinkHandler<L> {
    _link: PhantomData<fn() -> L>,
}

impl<L: LinkEntity> LinkHandler<L> {
    pub fn new() -> Self {
        Self { _link: PhantomData }
    }

    async fn push(&self, ctx: &SyncContext<'_>, step: &mut UpStep<'_>, entity: L) {
        let (mut fresh, mut base) = match fresh_copy(step, &entity).await {
            Ok(Some(found)) => found,
            Ok(None) => {
                debug!("{} {} no longer needs a push", L::ENTITY_TYPE, entity.id());
                return;
            }
            Err(e) => {
                warn!("Could not reload {} {}: {}", L::ENTITY_TYPE, entity.id(), e);
                return;
            }
        };

        let result = match to_row(&fresh) {
            Ok(row) => {
                let _in_flight = ctx.resolver.begin_push(fresh.id());
                ctx.call(ctx.remote.upsert_by_natural_key(L::ENTITY_TYPE, row, ctx.actor))
                    .await
            }
            Err(e) => Err(e),
        };

        if let Ok(canonical) = &result {
            if canonical.id != fresh.id() {
                debug!(
                    "Adopting canonical id {} for {} {}",
                    canonical.id,
                    L::ENTITY_TYPE,
                    fresh.id()
                );
                step.txn.remove(L::ENTITY_TYPE, fresh.id(), base);
                base = match step.txn.base_of(L::ENTITY_TYPE, canonical.id).await {
                    Ok(base) => base,
                    Err(e) => {
                        warn!("Could not re-key {} {}: {}", L::ENTITY_TYPE, fresh.id(), e);
                        return;
                    }
                };
                fresh.set_id(canonical.id);
                step.report.adopted += 1;
            }
        }
        record_push(ctx, step, fresh, base, &result);
    }

    async fn push_all(&self, ctx: &SyncContext<'_>, step: &mut UpStep<'_>, candidates: Vec<L>) {
        for mut entity in candidates {
            if entity.meta().sync_state() == SyncState::Failed {
                let step_ref = &mut *step;
                let dispatched = ctx
                    .retry
                    .retry(&mut entity, ctx.config.max_retries, move |copy| {
                        self.push(ctx, step_ref, copy)
                    })
                    .await;
                if !dispatched {
                    step.report.exhausted += 1;
                }
            } else {
                self.push(ctx, step, entity).await;
            }
        }
    }
}

impl<L: LinkEntity> Default for LinkHandler<L> {
    fn default() -> Self {
        Self::new()
    }
}

/// Collapse local rows sharing a natural key down to the newest one.
///
/// Discarded rows are removed without a tombstone: the remote holds at
/// most one row per key, which the survivor adopts when pushed.
async fn collapse_duplicates<L: LinkEntity>(txn: &mut Transaction<'_>) -> Result<usize> {
    let mut groups: BTreeMap<(EntityId, EntityId), Vec<L>> = BTreeMap::new();
    for link in txn.all::<L>().await? {
        groups.entry(link.natural_key()).or_default().push(link);
    }

    let mut removed = 0;
    for (key, mut rows) in groups {
        if rows.len() < 2 {
            continue;
        }
        rows.sort_by_key(|l| (l.meta().updated_at(), l.id()));
        let Some(keep) = rows.pop() else {
            continue;
        };
        for duplicate in rows {
            let base = txn.base_of(L::ENTITY_TYPE, duplicate.id()).await?;
            txn.remove(L::ENTITY_TYPE, duplicate.id(), base);
            removed += 1;
        }
        debug!(
            "Collapsed duplicate {} rows for ({}, {}) into {}",
            L::ENTITY_TYPE,
            key.0,
            key.1,
            keep.id()
        );
    }
    Ok(removed)
}

/// Bring every parent's member collection in line with the local link rows.
async fn mirror_parents<L: LinkEntity>(txn: &mut Transaction<'_>, turn: &SyncTurn) -> Result<usize> {
    let mut wanted: HashMap<EntityId, BTreeSet<EntityId>> = HashMap::new();
    for link in txn.all::<L>().await? {
        wanted.entry(link.parent_id()).or_default().insert(link.member_id());
    }

    let parent_type = <L::Parent as SyncableEntity>::ENTITY_TYPE;
    let mut changed = 0;
    for mut parent in txn.all::<L::Parent>().await? {
        let members = wanted.remove(&parent.id()).unwrap_or_default();
        let current: BTreeSet<EntityId> = parent.members().into_iter().collect();
        if members == current {
            continue;
        }
        for stale in current.difference(&members) {
            parent.detach_member(*stale, MutationOrigin::SyncTurn(turn));
        }
        for missing in members.difference(&current) {
            parent.attach_member(*missing, MutationOrigin::SyncTurn(turn));
        }
        let base = txn.base_of(parent_type, parent.id()).await?;
        txn.put(&parent, base)?;
        changed += 1;
    }
    if changed > 0 {
        debug!("Updated {} {} member collections", changed, parent_type);
    }
    Ok(changed)
}

#[async_trait]
impl<L: LinkEntity> EntitySyncHandler for LinkHandler<L> {
    fn entity_type(&self) -> EntityType {
        L::ENTITY_TYPE
    }

    async fn repair_phantoms(&self, store: &LocalStore) -> Result<usize> {
        repair_phantoms::<L>(store).await
    }

    async fn sync_down(&self, ctx: &SyncContext<'_>) -> Result<DownReport> {
        let (rows, remote_ids) = fetch_window(ctx, L::ENTITY_TYPE).await?;
        let mut report = DownReport {
            fetched: rows.len(),
            ..DownReport::default()
        };
        let mut cursor = CursorTracker::default();
        let mut txn = ctx.store.begin();

        for row in &rows {
            let Some(wire) = decode_or_skip::<L>(row, &mut report, &mut cursor) else {
                continue;
            };
            let incoming = L::from_wire(row.id, SyncMeta::confirmed(row.updated_at), wire);
            if !self.replace_duplicates(ctx, &mut txn, &incoming, row.updated_at).await? {
                report.kept_local += 1;
                continue;
            }
            let applied = apply_remote_row::<L>(ctx, &mut txn, row, incoming.to_wire()).await?;
            tally(&mut report, applied);
        }
        if let Some(ids) = remote_ids {
            report.removed = reconcile_deletes::<L>(&mut txn, &ids).await?.len();
        }

        mirror_parents::<L>(&mut txn, ctx.turn).await?;
        txn.commit().await?;
        report.cursor = cursor.cursor();
        Ok(report)
    }

    async fn sync_up(&self, ctx: &SyncContext<'_>) -> Result<UpReport> {
        let mut step = UpStep::new(ctx.store.begin());
        push_tombstones(ctx, &mut step, L::ENTITY_TYPE).await?;
        step.report.deduplicated = collapse_duplicates::<L>(&mut step.txn).await?;

        let candidates: Vec<L> = step
            .txn
            .all::<L>()
            .await?
            .into_iter()
            .filter(|l| l.meta().sync_state().needs_push())
            .collect();
        self.push_all(ctx, &mut step, candidates).await;

        mirror_parents::<L>(&mut step.txn, ctx.turn).await?;
        step.txn.commit().await?;
        Ok(step.report)
    }

    async fn retry_failed(&self, ctx: &SyncContext<'_>) -> Result<RetrySummary> {
        let mut step = UpStep::new(ctx.store.begin());
        collapse_duplicates::<L>(&mut step.txn).await?;
        let mut summary = RetrySummary::default();

        let failed: Vec<L> = step
            .txn
            .all::<L>()
            .await?
            .into_iter()
            .filter(|l| l.meta().sync_state() == SyncState::Failed)
            .collect();
        for mut entity in failed {
            let step_ref = &mut step;
            let dispatched = ctx
                .retry
                .retry(&mut entity, ctx.config.max_retries, move |copy| {
                    self.push(ctx, step_ref, copy)
                })
                .await;
            if dispatched {
                summary.attempted += 1;
            } else {
                summary.exhausted += 1;
            }
        }

        summary.recovered = step.recovered;
        mirror_parents::<L>(&mut step.txn, ctx.turn).await?;
        step.txn.commit().await?;
        Ok(summary)
    }

    async fn materialize(&self, store: &LocalStore, turn: &SyncTurn, row: &RemoteRow) -> Result<()> {
        let mut txn = store.begin();
        let link = materialize_row::<L>(&mut txn, row).await?;
        debug!("Materialized {} {}", L::ENTITY_TYPE, link.id());
        mirror_parents::<L>(&mut txn, turn).await?;
        txn.commit().await?;
        Ok(())
    }

    async fn reset_retries(&self, store: &LocalStore, id: EntityId) -> Result<bool> {
        reset_retries::<L>(store, id).await
    }
}

impl<L: LinkEntity> LinkHandler<L> {
    /// Drop local rows holding the incoming row's natural key under another id.
    ///
    /// Returns `false` if one of them is authoritative; the remote row is
    /// then skipped and the local row later adopts the canonical id.
    async fn replace_duplicates(
        &self,
        ctx: &SyncContext<'_>,
        txn: &mut Transaction<'_>,
        incoming: &L,
        remote_updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let key = incoming.natural_key();
        let duplicates: Vec<L> = txn
            .all::<L>()
            .await?
            .into_iter()
            .filter(|l| l.id() != incoming.id() && l.natural_key() == key)
            .collect();

        let mut replaceable = true;
        for duplicate in duplicates {
            if ctx.resolver.authority(&duplicate, remote_updated_at).is_local() {
                replaceable = false;
                continue;
            }
            debug!(
                "Replacing local {} {} with remote {}",
                L::ENTITY_TYPE,
                duplicate.id(),
                incoming.id()
            );
            let base = txn.base_of(L::ENTITY_TYPE, duplicate.id()).await?;
            txn.remove(L::ENTITY_TYPE, duplicate.id(), base);
        }
        Ok(replaceable)
    }
}
