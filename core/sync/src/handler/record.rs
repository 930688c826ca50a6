//! Handler for plain records keyed by primary key.

use async_trait::async_trait;
use std::marker::PhantomData;
use tracing::{debug, warn};

use fieldsync_common::{EntityId, EntityType, Result};
use fieldsync_remote::RemoteRow;

use super::{
    apply_remote_row, decode_or_skip, fetch_window, fresh_copy, materialize_row, push_tombstones,
    reconcile_deletes, record_push, repair_phantoms, reset_retries, tally, CursorTracker,
    DownReport, EntitySyncHandler, SyncContext, UpReport, UpStep,
};
use crate::entity::{to_row, SyncState, SyncTurn, SyncableEntity};
use crate::retry::RetrySummary;
use crate::store::LocalStore;

/// Sync handler for an entity type pushed by primary key.
pub struct RecordHandler<E> {
    _entity: PhantomData<fn() -> E>,
}

impl<E: SyncableEntity> RecordHandler<E> {
    pub fn new() -> Self {
        Self {
            _entity: PhantomData,
        }
    }

    async fn push(&self, ctx: &SyncContext<'_>, step: &mut UpStep<'_>, entity: E) {
        let (fresh, base) = match fresh_copy(step, &entity).await {
            Ok(Some(found)) => found,
            Ok(None) => {
                debug!("{} {} no longer needs a push", E::ENTITY_TYPE, entity.id());
                return;
            }
            Err(e) => {
                warn!("Could not reload {} {}: {}", E::ENTITY_TYPE, entity.id(), e);
                return;
            }
        };

        let result = match to_row(&fresh) {
            Ok(row) => {
                let _in_flight = ctx.resolver.begin_push(fresh.id());
                ctx.call(ctx.remote.upsert(E::ENTITY_TYPE, row, ctx.actor)).await
            }
            Err(e) => Err(e),
        };
        record_push(ctx, step, fresh, base, &result);
    }

    /// Push candidates; `failed` ones go through the retry coordinator.
    async fn push_all(&self, ctx: &SyncContext<'_>, step: &mut UpStep<'_>, candidates: Vec<E>) {
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

impl<E: SyncableEntity> Default for RecordHandler<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<E: SyncableEntity> EntitySyncHandler for RecordHandler<E> {
    fn entity_type(&self) -> EntityType {
        E::ENTITY_TYPE
    }

    async fn repair_phantoms(&self, store: &LocalStore) -> Result<usize> {
        repair_phantoms::<E>(store).await
    }

    async fn sync_down(&self, ctx: &SyncContext<'_>) -> Result<DownReport> {
        let (rows, remote_ids) = fetch_window(ctx, E::ENTITY_TYPE).await?;
        let mut report = DownReport {
            fetched: rows.len(),
            ..DownReport::default()
        };
        let mut cursor = CursorTracker::default();
        let mut txn = ctx.store.begin();

        for row in &rows {
            let Some(wire) = decode_or_skip::<E>(row, &mut report, &mut cursor) else {
                continue;
            };
            let applied = apply_remote_row::<E>(ctx, &mut txn, row, wire).await?;
            tally(&mut report, applied);
        }
        if let Some(ids) = remote_ids {
            report.removed = reconcile_deletes::<E>(&mut txn, &ids).await?.len();
        }

        txn.commit().await?;
        report.cursor = cursor.cursor();
        Ok(report)
    }

    async fn sync_up(&self, ctx: &SyncContext<'_>) -> Result<UpReport> {
        let mut step = UpStep::new(ctx.store.begin());
        push_tombstones(ctx, &mut step, E::ENTITY_TYPE).await?;

        let candidates: Vec<E> = step
            .txn
            .all::<E>()
            .await?
            .into_iter()
            .filter(|e| e.meta().sync_state().needs_push())
            .collect();
        self.push_all(ctx, &mut step, candidates).await;

        step.txn.commit().await?;
        Ok(step.report)
    }

    async fn retry_failed(&self, ctx: &SyncContext<'_>) -> Result<RetrySummary> {
        let mut step = UpStep::new(ctx.store.begin());
        let mut summary = RetrySummary::default();

        let failed: Vec<E> = step
            .txn
            .all::<E>()
            .await?
            .into_iter()
            .filter(|e| e.meta().sync_state() == SyncState::Failed)
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
        step.txn.commit().await?;
        Ok(summary)
    }

    async fn materialize(&self, store: &LocalStore, _turn: &SyncTurn, row: &RemoteRow) -> Result<()> {
        let mut txn = store.begin();
        materialize_row::<E>(&mut txn, row).await?;
        txn.commit().await?;
        Ok(())
    }

    async fn reset_retries(&self, store: &LocalStore, id: EntityId) -> Result<bool> {
        reset_retries::<E>(store, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::testing::Harness;
    use crate::model::{Listing, Task};
    use chrono::{Duration, Utc};
    use fieldsync_common::Error;
    use fieldsync_remote::RemoteEndpoint;
    use serde_json::json;

    #[tokio::test]
    async fn test_push_marks_synced() {
        let harness = Harness::new();
        let task = harness.store.save(Task::new("Call listing agent")).await.unwrap();

        let turn = harness.turn();
        let report = RecordHandler::<Task>::new()
            .sync_up(&harness.ctx(&turn))
            .await
            .unwrap();
        assert_eq!(report.pushed, 1);

        let stored = harness.store.get::<Task>(task.id()).await.unwrap().unwrap();
        assert_eq!(stored.meta().sync_state(), SyncState::Synced);
        assert_eq!(stored.meta().retry_count(), 0);
        assert!(stored.meta().synced_at().is_some());
        assert!(harness.remote.row(EntityType::Task, task.id()).await.is_some());
    }

    #[tokio::test]
    async fn test_push_adopts_commit_timestamp() {
        let harness = Harness::new();
        let task = harness.store.save(Task::new("Order lockbox")).await.unwrap();

        let turn = harness.turn();
        let handler = RecordHandler::<Task>::new();
        handler.sync_up(&harness.ctx(&turn)).await.unwrap();

        let remote = harness.remote.row(EntityType::Task, task.id()).await.unwrap();
        let stored = harness.store.get::<Task>(task.id()).await.unwrap().unwrap();
        assert!(remote.updated_at >= task.meta().updated_at());
        assert_eq!(stored.meta().updated_at(), remote.updated_at);

        // the echo of our own push is not applied again
        let down = handler.sync_down(&harness.ctx(&turn)).await.unwrap();
        assert_eq!(down.applied, 0);
        assert_eq!(down.unchanged, 1);
    }

    #[tokio::test]
    async fn test_transient_failure_stays_retryable() {
        let harness = Harness::new();
        let task = harness.store.save(Task::new("Fix gutter")).await.unwrap();
        harness.remote.set_offline(true).await;

        let turn = harness.turn();
        let handler = RecordHandler::<Task>::new();
        let report = handler.sync_up(&harness.ctx(&turn)).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.errors, vec!["network error".to_string()]);

        let stored = harness.store.get::<Task>(task.id()).await.unwrap().unwrap();
        assert_eq!(stored.meta().sync_state(), SyncState::Failed);
        assert_eq!(stored.meta().retry_count(), 0);

        // second cycle goes through the retry coordinator
        let report = handler.sync_up(&harness.ctx(&turn)).await.unwrap();
        assert_eq!(report.failed, 1);
        let stored = harness.store.get::<Task>(task.id()).await.unwrap().unwrap();
        assert_eq!(stored.meta().retry_count(), 1);

        harness.remote.set_offline(false).await;
        let summary = handler.retry_failed(&harness.ctx(&turn)).await.unwrap();
        assert_eq!(summary.attempted, 1);
        assert_eq!(summary.recovered, 1);
        let stored = harness.store.get::<Task>(task.id()).await.unwrap().unwrap();
        assert_eq!(stored.meta().sync_state(), SyncState::Synced);
        assert_eq!(stored.meta().retry_count(), 0);
    }

    #[tokio::test]
    async fn test_permission_denied_is_not_retried() {
        let harness = Harness::new();
        let task = harness.store.save(Task::new("Renew permit")).await.unwrap();
        harness.remote.deny(EntityType::Task).await;

        let turn = harness.turn();
        let handler = RecordHandler::<Task>::new();
        let report = handler.sync_up(&harness.ctx(&turn)).await.unwrap();
        assert_eq!(report.errors, vec!["permission denied syncing tasks".to_string()]);

        let stored = harness.store.get::<Task>(task.id()).await.unwrap().unwrap();
        assert_eq!(stored.meta().sync_state(), SyncState::Failed);
        assert_eq!(stored.meta().retry_count(), harness.config.max_retries);

        let report = handler.sync_up(&harness.ctx(&turn)).await.unwrap();
        assert_eq!(report.exhausted, 1);
        assert_eq!(report.failed, 0);

        assert!(handler.reset_retries(&harness.store, task.id()).await.unwrap());
        let stored = harness.store.get::<Task>(task.id()).await.unwrap().unwrap();
        assert_eq!(stored.meta().sync_state(), SyncState::Pending);
        assert_eq!(stored.meta().retry_count(), 0);
    }

    #[tokio::test]
    async fn test_sync_down_is_idempotent() {
        let harness = Harness::new();
        let id = EntityId::new();
        harness
            .remote
            .seed(
                EntityType::Listing,
                RemoteRow::new(id, Utc::now(), json!({ "title": "3BR bungalow", "status": "active" })),
            )
            .await;

        let turn = harness.turn();
        let handler = RecordHandler::<Listing>::new();
        let first = handler.sync_down(&harness.ctx(&turn)).await.unwrap();
        assert_eq!(first.applied, 1);
        let snapshot = harness.store.get::<Listing>(id).await.unwrap().unwrap();

        let second = handler.sync_down(&harness.ctx(&turn)).await.unwrap();
        assert_eq!(second.applied, 0);
        assert_eq!(second.unchanged, 1);
        assert_eq!(harness.store.all::<Listing>().await.unwrap().len(), 1);
        assert_eq!(harness.store.get::<Listing>(id).await.unwrap().unwrap(), snapshot);
    }

    #[tokio::test]
    async fn test_pending_local_beats_older_remote() {
        let harness = Harness::new();
        let task = harness.store.save(Task::new("Local title")).await.unwrap();
        harness
            .remote
            .seed(
                EntityType::Task,
                RemoteRow::new(
                    task.id(),
                    task.meta().updated_at() - Duration::seconds(30),
                    json!({ "title": "Remote title" }),
                ),
            )
            .await;

        let turn = harness.turn();
        let report = RecordHandler::<Task>::new()
            .sync_down(&harness.ctx(&turn))
            .await
            .unwrap();
        assert_eq!(report.kept_local, 1);
        let stored = harness.store.get::<Task>(task.id()).await.unwrap().unwrap();
        assert_eq!(stored.title, "Local title");
    }

    #[tokio::test]
    async fn test_malformed_row_is_skipped_and_refetched() {
        let harness = Harness::new();
        let good = EntityId::new();
        let bad_at = Utc::now() - Duration::seconds(60);
        harness
            .remote
            .seed(EntityType::Task, RemoteRow::new(EntityId::new(), bad_at, json!({ "title": 42 })))
            .await;
        harness
            .remote
            .seed(EntityType::Task, RemoteRow::new(good, Utc::now(), json!({ "title": "ok" })))
            .await;

        let turn = harness.turn();
        let report = RecordHandler::<Task>::new()
            .sync_down(&harness.ctx(&turn))
            .await
            .unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.applied, 1);
        assert_eq!(report.cursor, Some(bad_at));
        assert!(harness.store.get::<Task>(good).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reconcile_removes_only_confirmed_rows() {
        let harness = Harness::new();
        let turn = harness.turn();
        let handler = RecordHandler::<Task>::new();

        let confirmed = harness.store.save(Task::new("Confirmed")).await.unwrap();
        handler.sync_up(&harness.ctx(&turn)).await.unwrap();
        let local_only = harness.store.save(Task::new("Local only")).await.unwrap();

        harness
            .remote
            .external_delete(EntityType::Task, confirmed.id(), None)
            .await
            .unwrap();
        let report = handler.sync_down(&harness.ctx(&turn)).await.unwrap();

        assert_eq!(report.removed, 1);
        assert!(harness.store.get::<Task>(confirmed.id()).await.unwrap().is_none());
        assert!(harness.store.get::<Task>(local_only.id()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_local_delete_pushed_once() {
        let harness = Harness::new();
        let turn = harness.turn();
        let handler = RecordHandler::<Task>::new();

        let task = harness.store.save(Task::new("Obsolete")).await.unwrap();
        handler.sync_up(&harness.ctx(&turn)).await.unwrap();
        harness.store.delete(EntityType::Task, task.id()).await.unwrap();

        let report = handler.sync_up(&harness.ctx(&turn)).await.unwrap();
        assert_eq!(report.deleted, 1);
        assert!(harness.remote.row(EntityType::Task, task.id()).await.is_none());
        assert!(harness.store.tombstones(EntityType::Task).await.unwrap().is_empty());

        let trail = harness.remote.audit_trail(EntityType::Task, task.id()).await.unwrap();
        assert_eq!(trail.len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_push_is_a_failure() {
        let harness = Harness::new();
        let task = harness.store.save(Task::new("Cancelled")).await.unwrap();
        harness.cancel.cancel();

        let turn = harness.turn();
        let report = RecordHandler::<Task>::new()
            .sync_up(&harness.ctx(&turn))
            .await
            .unwrap();
        assert_eq!(report.failed, 1);

        let stored = harness.store.get::<Task>(task.id()).await.unwrap().unwrap();
        assert_eq!(stored.meta().sync_state(), SyncState::Failed);
        assert!(stored.meta().retry_count() < harness.config.max_retries);
        assert!(!harness.resolver.is_in_flight(task.id()));
        assert!(Error::Cancelled(String::new()).is_transient());
    }
}
