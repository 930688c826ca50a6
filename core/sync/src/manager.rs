//! Sync manager that orchestrates sync turns, user edits and restores.
//!
//! One turn runs at a time: phantom repair, then `sync_down` for every
//! entity type in dependency order, then `sync_up` in the same order, then
//! cursor finalization. A failing entity type does not stop the others;
//! a fatal error (closed datastore, no identity) aborts the turn before
//! any entity is touched.

use chrono::Utc;
use futures::future::{self, BoxFuture};
use futures::stream::{self, BoxStream, StreamExt};
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fieldsync_common::{ActorId, EntityId, EntityType, Error, Result};
use fieldsync_remote::{AuditRecord, RemoteEndpoint, RemoteRow};

use crate::config::SyncConfig;
use crate::conflict::ConflictResolver;
use crate::entity::{LinkEntity, MutationOrigin, RelationshipParent, SyncMeta, SyncTurn, SyncableEntity};
use crate::handler::{EntitySyncHandler, LinkHandler, RecordHandler, SyncContext};
use crate::identity::IdentityProvider;
use crate::model::{Activity, ActivityAssignee, Listing, Note, Property, Task, TaskAssignee, User};
use crate::queue::{RequestOutcome, SyncQueue, TurnFn};
use crate::restore::RestoreService;
use crate::retry::{DelayMode, RetryCoordinator, RetrySummary};
use crate::status::{SyncPhase, SyncStatus, SyncStatusSnapshot, TurnReport};
use crate::store::{EntityChange, LocalStore};

fn handler_for(entity_type: EntityType) -> Arc<dyn EntitySyncHandler> {
    match entity_type {
        EntityType::User => Arc::new(RecordHandler::<User>::new()),
        EntityType::Property => Arc::new(RecordHandler::<Property>::new()),
        EntityType::Listing => Arc::new(RecordHandler::<Listing>::new()),
        EntityType::Task => Arc::new(RecordHandler::<Task>::new()),
        EntityType::Activity => Arc::new(RecordHandler::<Activity>::new()),
        EntityType::TaskAssignee => Arc::new(LinkHandler::<TaskAssignee>::new()),
        EntityType::ActivityAssignee => Arc::new(LinkHandler::<ActivityAssignee>::new()),
        EntityType::Note => Arc::new(RecordHandler::<Note>::new()),
    }
}

struct ManagerInner {
    store: LocalStore,
    remote: Arc<dyn RemoteEndpoint>,
    identity: Arc<dyn IdentityProvider>,
    config: SyncConfig,
    /// In dependency order.
    handlers: Vec<Arc<dyn EntitySyncHandler>>,
    resolver: ConflictResolver,
    retry: RetryCoordinator,
    restore: RestoreService,
    /// Serializes turns, retry passes and restores.
    turn_lock: tokio::sync::Mutex<()>,
    syncing: Arc<AtomicBool>,
    status_tx: watch::Sender<SyncStatusSnapshot>,
    active_cancel: Mutex<Option<CancellationToken>>,
}

impl ManagerInner {
    fn handler(&self, entity_type: EntityType) -> Result<&Arc<dyn EntitySyncHandler>> {
        self.handlers
            .iter()
            .find(|h| h.entity_type() == entity_type)
            .ok_or_else(|| Error::InvalidInput(format!("no sync handler for {}", entity_type)))
    }

    /// Conditions without which no turn may start.
    fn preflight(&self) -> Result<ActorId> {
        self.store.ensure_open()?;
        self.identity
            .current_actor()
            .ok_or_else(|| Error::Configuration("no authenticated actor".to_string()))
    }

    fn publish(&self, status: SyncStatus, phase: SyncPhase) {
        self.status_tx.send_modify(|s| {
            s.status = status;
            s.phase = phase;
        });
    }

    fn set_active_cancel(&self, token: Option<CancellationToken>) {
        *self
            .active_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = token;
    }

    async fn repair_phantoms(&self) -> Result<usize> {
        let mut repaired = 0;
        for handler in &self.handlers {
            repaired += handler.repair_phantoms(&self.store).await?;
        }
        Ok(repaired)
    }

    async fn run_turn(&self) -> TurnReport {
        let _serial = self.turn_lock.lock().await;
        let mut report = TurnReport {
            started_at: Some(Utc::now()),
            ..TurnReport::default()
        };

        let actor = match self.preflight() {
            Ok(actor) => actor,
            Err(e) => {
                error!("Sync turn aborted: {}", e);
                report.fatal = Some(e.to_string());
                return self.finish(report);
            }
        };

        let turn = SyncTurn::begin(self.syncing.clone());
        let cancel = CancellationToken::new();
        self.set_active_cancel(Some(cancel.clone()));
        self.publish(SyncStatus::Syncing, SyncPhase::SyncingDown);
        info!("Sync turn started for {}", actor);

        match self.repair_phantoms().await {
            Ok(repaired) => report.phantoms_repaired = repaired,
            Err(e) if e.is_fatal() => report.fatal = Some(e.to_string()),
            Err(e) => report.errors.push((None, e.summary())),
        }

        let ctx = SyncContext {
            store: &self.store,
            remote: self.remote.as_ref(),
            resolver: &self.resolver,
            retry: &self.retry,
            config: &self.config,
            actor: &actor,
            turn: &turn,
            cancel: &cancel,
        };

        if report.fatal.is_none() {
            for handler in &self.handlers {
                let entity_type = handler.entity_type();
                match handler.sync_down(&ctx).await {
                    Ok(down) => {
                        debug!("{} down: {:?}", entity_type, down);
                        report.down.insert(entity_type, down);
                    }
                    Err(e) if e.is_fatal() => {
                        report.fatal = Some(e.to_string());
                        break;
                    }
                    Err(e) => {
                        warn!("Sync down of {} failed: {}", entity_type, e);
                        report.errors.push((Some(entity_type), e.summary()));
                    }
                }
            }
        }

        if report.fatal.is_none() {
            self.publish(SyncStatus::Syncing, SyncPhase::SyncingUp);
            for handler in &self.handlers {
                let entity_type = handler.entity_type();
                match handler.sync_up(&ctx).await {
                    Ok(up) => {
                        debug!("{} up: {:?}", entity_type, up);
                        report.up.insert(entity_type, up);
                    }
                    Err(e) if e.is_fatal() => {
                        report.fatal = Some(e.to_string());
                        break;
                    }
                    Err(e) => {
                        warn!("Sync up of {} failed: {}", entity_type, e);
                        report.errors.push((Some(entity_type), e.summary()));
                    }
                }
            }
        }

        if report.fatal.is_none() {
            self.publish(SyncStatus::Syncing, SyncPhase::Finalizing);
            if let Err(e) = self.finalize_cursors(&report).await {
                warn!("Could not persist sync cursors: {}", e);
                report.errors.push((None, e.summary()));
            }
        }

        drop(ctx);
        drop(turn);
        self.set_active_cancel(None);
        info!(
            "Sync turn finished: {} applied, {} pushed, {} failed, {} step errors",
            report.applied(),
            report.pushed(),
            report.failed(),
            report.errors.len()
        );
        self.finish(report)
    }

    /// Advance cursors only for entity types whose whole turn succeeded.
    async fn finalize_cursors(&self, report: &TurnReport) -> Result<()> {
        let mut txn = self.store.begin();
        for (entity_type, down) in &report.down {
            if !report.type_completed(*entity_type) {
                continue;
            }
            if let Some(cursor) = down.cursor {
                debug!("Cursor for {} -> {}", entity_type, cursor);
                txn.set_cursor(*entity_type, cursor);
            }
        }
        txn.commit().await?;
        Ok(())
    }

    fn finish(&self, mut report: TurnReport) -> TurnReport {
        report.finished_at = Some(Utc::now());
        let error = report.first_error();
        let snapshot = report.clone();
        self.status_tx.send_modify(move |s| {
            s.status = if error.is_some() {
                SyncStatus::Error
            } else {
                SyncStatus::Idle
            };
            s.phase = SyncPhase::Idle;
            s.last_sync_error = error;
            s.last_turn = Some(snapshot);
        });
        report
    }
}

/// Entry point of the sync engine.
///
/// Owns the handlers, the conflict resolver, the retry coordinator and the
/// request queue. Application code edits records through the manager so
/// that every edit marks the record pending and requests a sync.
#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<ManagerInner>,
    queue: SyncQueue,
    periodic_stop: CancellationToken,
}

impl SyncManager {
    /// Create a manager. Must be called inside a tokio runtime.
    ///
    /// # Errors
    /// - `Configuration` if `config` is invalid or no runtime is available
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteEndpoint>,
        identity: Arc<dyn IdentityProvider>,
        config: SyncConfig,
        mode: DelayMode,
    ) -> Result<Self> {
        config.validate()?;
        let (status_tx, _) = watch::channel(SyncStatusSnapshot::default());
        let inner = Arc::new(ManagerInner {
            handlers: EntityType::DEPENDENCY_ORDER
                .iter()
                .copied()
                .map(handler_for)
                .collect(),
            resolver: ConflictResolver::new(),
            retry: RetryCoordinator::new(config.retry_config(), mode),
            restore: RestoreService::new(remote.clone(), config.request_timeout()),
            turn_lock: tokio::sync::Mutex::new(()),
            syncing: Arc::new(AtomicBool::new(false)),
            status_tx,
            active_cancel: Mutex::new(None),
            store,
            remote,
            identity,
            config,
        });

        let runner = inner.clone();
        let turn: TurnFn = Arc::new(move || -> BoxFuture<'static, ()> {
            let inner = runner.clone();
            async move {
                inner.run_turn().await;
            }
            .boxed()
        });

        Ok(Self {
            queue: SyncQueue::new(turn)?,
            inner,
            periodic_stop: CancellationToken::new(),
        })
    }

    /// Repair phantom `synced` rows left by an earlier run, then request
    /// the first turn.
    pub async fn start(&self) -> Result<RequestOutcome> {
        let repaired = self.inner.repair_phantoms().await?;
        if repaired > 0 {
            info!("Repaired {} phantom rows on start", repaired);
        }
        Ok(self.queue.request_sync())
    }

    /// Request a sync every `period` until [`SyncManager::shutdown`].
    pub fn start_periodic(&self, period: Duration) -> JoinHandle<()> {
        self.queue.spawn_periodic(period, self.periodic_stop.child_token())
    }

    pub fn request_sync(&self) -> RequestOutcome {
        self.queue.request_sync()
    }

    /// Request a turn and wait until the queue is idle.
    ///
    /// Returns the report of the last finished turn. While the queue is
    /// paused this returns the previous report without running a turn.
    pub async fn sync_now(&self) -> Option<TurnReport> {
        self.queue.request_sync();
        self.queue.wait_idle().await;
        self.inner.status_tx.borrow().last_turn.clone()
    }

    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await;
    }

    /// `true` while a sync turn is executing.
    pub fn is_syncing(&self) -> bool {
        self.inner.syncing.load(Ordering::SeqCst)
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &LocalStore {
        &self.inner.store
    }

    pub fn status(&self) -> SyncStatusSnapshot {
        self.inner.status_tx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatusSnapshot> {
        self.inner.status_tx.subscribe()
    }

    /// Changes to one record, starting now.
    pub fn observe(&self, entity_type: EntityType, id: EntityId) -> BoxStream<'static, EntityChange> {
        self.changes()
            .filter(move |c| future::ready(c.entity_type == entity_type && c.id == id))
            .boxed()
    }

    /// All committed changes, starting now. Slow observers skip ahead.
    pub fn changes(&self) -> BoxStream<'static, EntityChange> {
        let rx = self.inner.store.subscribe();
        stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(change) => return Some((change, rx)),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Change observer lagged; skipped {} changes", skipped);
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    pub async fn get<E: SyncableEntity>(&self, id: EntityId) -> Result<Option<E>> {
        self.inner.store.get(id).await
    }

    pub async fn all<E: SyncableEntity>(&self) -> Result<Vec<E>> {
        self.inner.store.all().await
    }

    /// Save a user edit; the record becomes `pending`.
    pub async fn save<E: SyncableEntity>(&self, entity: E) -> Result<E> {
        let saved = self.inner.store.save(entity).await?;
        self.after_edit();
        Ok(saved)
    }

    /// Delete a record locally and queue the remote delete.
    ///
    /// Returns `false` if no such record exists.
    pub async fn delete(&self, entity_type: EntityType, id: EntityId) -> Result<bool> {
        let deleted = match entity_type {
            EntityType::TaskAssignee => self.unlink::<TaskAssignee>(id).await?,
            EntityType::ActivityAssignee => self.unlink::<ActivityAssignee>(id).await?,
            _ => self.inner.store.delete(entity_type, id).await?,
        };
        if deleted {
            self.after_edit();
        }
        Ok(deleted)
    }

    /// Link a user to a parent record.
    ///
    /// Returns the existing link if the pair is already linked locally.
    ///
    /// # Errors
    /// - `InvalidInput` if the parent or the user does not exist locally
    pub async fn link<L: LinkEntity>(&self, mut link: L) -> Result<L> {
        let store = &self.inner.store;
        let parent_type = <L::Parent as SyncableEntity>::ENTITY_TYPE;
        let Some(mut parent) = store.get::<L::Parent>(link.parent_id()).await? else {
            return Err(Error::InvalidInput(format!(
                "no {} {}",
                parent_type,
                link.parent_id()
            )));
        };
        if store.get::<User>(link.member_id()).await?.is_none() {
            return Err(Error::InvalidInput(format!("no user {}", link.member_id())));
        }
        if let Some(existing) = store
            .all::<L>()
            .await?
            .into_iter()
            .find(|l| l.natural_key() == link.natural_key())
        {
            return Ok(existing);
        }

        *link.meta_mut() = SyncMeta::new_local();
        let mut txn = store.begin();
        txn.put(&link, None)?;
        let base = Some(parent.meta().updated_at());
        if parent.attach_member(link.member_id(), MutationOrigin::User) {
            txn.put(&parent, base)?;
        }
        txn.commit().await?;
        self.after_edit();
        Ok(link)
    }

    async fn unlink<L: LinkEntity>(&self, id: EntityId) -> Result<bool> {
        let store = &self.inner.store;
        let Some(link) = store.get::<L>(id).await? else {
            return Ok(false);
        };

        let mut txn = store.begin();
        txn.delete(L::ENTITY_TYPE, id, Some(link.meta().updated_at()));
        let still_linked = txn
            .all::<L>()
            .await?
            .iter()
            .any(|l| l.natural_key() == link.natural_key());
        if !still_linked {
            if let Some(mut parent) = txn.get::<L::Parent>(link.parent_id()).await? {
                let base = Some(parent.meta().updated_at());
                if parent.detach_member(link.member_id(), MutationOrigin::User) {
                    txn.put(&parent, base)?;
                }
            }
        }
        Ok(txn.commit().await? > 0)
    }

    fn after_edit(&self) {
        if self.inner.config.sync_on_edit {
            let outcome = self.queue.request_sync();
            debug!(?outcome, "Sync requested after edit");
        }
    }

    /// Run one retry pass over `failed` entities of every type.
    pub async fn retry_failed_entities(&self) -> Result<RetrySummary> {
        let inner = &self.inner;
        let _serial = inner.turn_lock.lock().await;
        let actor = inner.preflight()?;
        let turn = SyncTurn::begin(inner.syncing.clone());
        let cancel = CancellationToken::new();
        inner.set_active_cancel(Some(cancel.clone()));

        let ctx = SyncContext {
            store: &inner.store,
            remote: inner.remote.as_ref(),
            resolver: &inner.resolver,
            retry: &inner.retry,
            config: &inner.config,
            actor: &actor,
            turn: &turn,
            cancel: &cancel,
        };
        let summary = inner.retry.retry_failed_entities(&inner.handlers, &ctx).await;
        inner.set_active_cancel(None);
        Ok(summary)
    }

    /// Explicit user recovery of an exhausted `failed` record.
    ///
    /// Returns `false` if the record does not exist or is not failed.
    pub async fn reset_retries(&self, entity_type: EntityType, id: EntityId) -> Result<bool> {
        let reset = self
            .inner
            .handler(entity_type)?
            .reset_retries(&self.inner.store, id)
            .await?;
        if reset {
            info!("Reset retries for {} {}", entity_type, id);
            self.queue.request_sync();
        }
        Ok(reset)
    }

    /// Restore a deleted row from the audit log.
    pub async fn restore(&self, entity_type: EntityType, id: EntityId) -> Result<RemoteRow> {
        let inner = &self.inner;
        let handler = inner.handler(entity_type)?;
        let _serial = inner.turn_lock.lock().await;
        inner.store.ensure_open()?;
        let actor = inner.identity.current_actor();
        let turn = SyncTurn::begin(inner.syncing.clone());
        inner
            .restore
            .restore(handler.as_ref(), &inner.store, &turn, id, actor.as_ref())
            .await
    }

    /// Audit trail of a key, oldest first.
    pub async fn history(&self, entity_type: EntityType, id: EntityId) -> Result<Vec<AuditRecord>> {
        self.inner.restore.history(entity_type, id).await
    }

    /// Cancel in-flight remote calls of the active turn. Cancelled pushes
    /// are recorded as failures and stay eligible for retry.
    pub fn cancel_active_turn(&self) -> bool {
        let active = self
            .inner
            .active_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match active {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop starting turns and wait for the active one to finish.
    pub async fn shutdown(&self) {
        self.periodic_stop.cancel();
        self.queue.pause();
        self.queue.wait_idle().await;
        info!("Sync manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::SyncState;
    use crate::identity::StaticIdentity;
    use fieldsync_remote::MemoryRemote;

    fn manager(remote: Arc<MemoryRemote>, identity: StaticIdentity) -> SyncManager {
        SyncManager::new(
            LocalStore::in_memory(),
            remote,
            Arc::new(identity),
            SyncConfig::default().with_sync_on_edit(false),
            DelayMode::Skip,
        )
        .unwrap()
    }

    fn agent() -> StaticIdentity {
        StaticIdentity::new(ActorId::new("agent-1").unwrap())
    }

    #[tokio::test]
    async fn test_handlers_follow_dependency_order() {
        let manager = manager(Arc::new(MemoryRemote::new()), agent());
        let order: Vec<EntityType> = manager.inner.handlers.iter().map(|h| h.entity_type()).collect();
        assert_eq!(order, EntityType::DEPENDENCY_ORDER.to_vec());
    }

    #[tokio::test]
    async fn test_missing_identity_is_fatal_and_touches_nothing() {
        let remote = Arc::new(MemoryRemote::new());
        let manager = manager(remote.clone(), StaticIdentity::anonymous());
        let task = manager.save(Task::new("Stage living room")).await.unwrap();

        let report = manager.sync_now().await.unwrap();
        assert!(report.fatal.is_some());
        assert!(report.down.is_empty() && report.up.is_empty());

        let status = manager.status();
        assert_eq!(status.status, SyncStatus::Error);
        assert_eq!(status.last_sync_error.as_deref(), report.fatal.as_deref());
        assert_eq!(remote.fetch_calls().await, 0);

        let stored = manager.get::<Task>(task.id()).await.unwrap().unwrap();
        assert_eq!(stored.meta().sync_state(), SyncState::Pending);
    }

    #[tokio::test]
    async fn test_closed_store_is_fatal() {
        let manager = manager(Arc::new(MemoryRemote::new()), agent());
        manager.store().close();

        let report = manager.sync_now().await.unwrap();
        assert!(report.fatal.unwrap().contains("closed"));
        assert!(!manager.is_syncing());
    }

    #[tokio::test]
    async fn test_user_link_leaves_parent_synced_and_unlink_detaches() {
        let remote = Arc::new(MemoryRemote::new());
        let manager = manager(remote.clone(), agent());
        let user = manager.save(User::new("Ari")).await.unwrap();
        let task = manager.save(Task::new("Order sign")).await.unwrap();
        manager.sync_now().await.unwrap();
        let synced = manager.get::<Task>(task.id()).await.unwrap().unwrap();
        assert_eq!(synced.meta().sync_state(), SyncState::Synced);

        let link = manager.link(TaskAssignee::new(task.id(), user.id())).await.unwrap();
        let again = manager.link(TaskAssignee::new(task.id(), user.id())).await.unwrap();
        assert_eq!(again.id(), link.id());

        let parent = manager.get::<Task>(task.id()).await.unwrap().unwrap();
        assert_eq!(parent.meta().sync_state(), SyncState::Synced);
        assert_eq!(parent.meta().updated_at(), synced.meta().updated_at());
        assert!(parent.assignees().contains(&user.id()));

        // only the link row goes up
        let task_upserts = remote.upsert_calls(EntityType::Task).await;
        let report = manager.sync_now().await.unwrap();
        assert_eq!(report.up[&EntityType::TaskAssignee].pushed, 1);
        assert_eq!(report.up[&EntityType::Task].pushed, 0);
        assert_eq!(remote.upsert_calls(EntityType::Task).await, task_upserts);

        assert!(manager.delete(EntityType::TaskAssignee, link.id()).await.unwrap());
        let parent = manager.get::<Task>(task.id()).await.unwrap().unwrap();
        assert!(parent.assignees().is_empty());
        assert_eq!(parent.meta().sync_state(), SyncState::Synced);
    }

    #[tokio::test]
    async fn test_link_requires_local_parent() {
        let manager = manager(Arc::new(MemoryRemote::new()), agent());
        let user = manager.save(User::new("Ari")).await.unwrap();
        let err = manager
            .link(TaskAssignee::new(EntityId::new(), user.id()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_observe_sees_saves() {
        let manager = manager(Arc::new(MemoryRemote::new()), agent());
        let task = manager.save(Task::new("Pick up keys")).await.unwrap();
        let mut changes = manager.observe(EntityType::Task, task.id());

        let mut edit = task.clone();
        edit.title = "Pick up both keys".to_string();
        manager.save(edit).await.unwrap();

        let change = changes.next().await.unwrap();
        assert_eq!(change.id, task.id());
    }
}
