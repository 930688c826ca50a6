//! Point-in-time restore from the remote audit log.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use fieldsync_common::{ActorId, EntityId, EntityType, Error, Result};
use fieldsync_remote::{AuditRecord, RemoteEndpoint, RemoteRow};

use crate::entity::SyncTurn;
use crate::handler::EntitySyncHandler;
use crate::store::LocalStore;

/// Restores deleted rows and reads audit history.
///
/// Every backend call is bounded by `timeout`.
#[derive(Clone)]
pub struct RestoreService {
    remote: Arc<dyn RemoteEndpoint>,
    timeout: Duration,
}

impl RestoreService {
    pub fn new(remote: Arc<dyn RemoteEndpoint>, timeout: Duration) -> Self {
        Self { remote, timeout }
    }

    async fn bounded<T>(&self, request: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, request)
            .await
            .unwrap_or_else(|_| {
                Err(Error::Network(format!("request timed out after {:?}", self.timeout)))
            })
    }

    /// Ask the backend to re-materialize a deleted row, then store the
    /// restored row locally as `synced`.
    ///
    /// Backend errors (`UNIQUE_CONFLICT`, `FK_MISSING`, `NOT_FOUND`,
    /// `NOT_AUTHORIZED`) are returned unchanged and leave local state alone.
    /// So does a timeout, reported as `Network`.
    pub async fn restore(
        &self,
        handler: &dyn EntitySyncHandler,
        store: &LocalStore,
        turn: &SyncTurn,
        id: EntityId,
        actor: Option<&ActorId>,
    ) -> Result<RemoteRow> {
        let entity_type = handler.entity_type();
        let row = match self.bounded(self.remote.restore(entity_type, id, actor)).await {
            Ok(row) => row,
            Err(e) => {
                warn!(
                    entity_type = %entity_type,
                    id = %id,
                    code = e.code().unwrap_or("OTHER"),
                    "Restore failed: {}",
                    e
                );
                return Err(e);
            }
        };

        handler.materialize(store, turn, &row).await?;
        info!("Restored {} {}", entity_type, id);
        Ok(row)
    }

    /// Audit trail for a key, oldest first.
    pub async fn history(&self, entity_type: EntityType, id: EntityId) -> Result<Vec<AuditRecord>> {
        self.bounded(self.remote.audit_trail(entity_type, id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{SyncState, SyncableEntity};
    use crate::handler::testing::Harness;
    use crate::handler::RecordHandler;
    use crate::model::Listing;
    use fieldsync_remote::{AuditAction, MemoryRemote};

    const TIMEOUT: Duration = Duration::from_secs(30);

    async fn pushed_then_deleted(harness: &Harness) -> Listing {
        let listing = harness.store.save(Listing::new("12 Elm St")).await.unwrap();
        let turn = harness.turn();
        let handler = RecordHandler::<Listing>::new();
        handler.sync_up(&harness.ctx(&turn)).await.unwrap();
        harness.store.delete(EntityType::Listing, listing.id()).await.unwrap();
        handler.sync_up(&harness.ctx(&turn)).await.unwrap();
        assert!(harness.remote.row(EntityType::Listing, listing.id()).await.is_none());
        listing
    }

    #[tokio::test]
    async fn test_restore_round_trip() {
        let harness = Harness::new();
        let listing = pushed_then_deleted(&harness).await;
        let service = RestoreService::new(harness.remote.clone(), TIMEOUT);

        let turn = harness.turn();
        let row = service
            .restore(
                &RecordHandler::<Listing>::new(),
                &harness.store,
                &turn,
                listing.id(),
                Some(&harness.actor),
            )
            .await
            .unwrap();
        assert_eq!(row.id, listing.id());

        let local = harness.store.get::<Listing>(listing.id()).await.unwrap().unwrap();
        assert_eq!(local.title, "12 Elm St");
        assert_eq!(local.meta().sync_state(), SyncState::Synced);
        assert!(local.meta().synced_at().is_some());

        let actions: Vec<AuditAction> = service
            .history(EntityType::Listing, listing.id())
            .await
            .unwrap()
            .iter()
            .map(|r| r.action)
            .collect();
        assert_eq!(
            actions,
            vec![AuditAction::Insert, AuditAction::Delete, AuditAction::Insert]
        );
    }

    #[tokio::test]
    async fn test_restore_errors_leave_local_state() {
        let harness = Harness::new();
        let listing = pushed_then_deleted(&harness).await;
        let service = RestoreService::new(harness.remote.clone(), TIMEOUT);
        let handler = RecordHandler::<Listing>::new();
        let turn = harness.turn();

        let stranger = ActorId::new("someone-else").unwrap();
        let err = service
            .restore(&handler, &harness.store, &turn, listing.id(), Some(&stranger))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("NOT_AUTHORIZED"));

        let err = service
            .restore(&handler, &harness.store, &turn, EntityId::new(), Some(&harness.actor))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        assert!(harness.store.get::<Listing>(listing.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_history_of_unknown_key_is_empty() {
        let service = RestoreService::new(Arc::new(MemoryRemote::new()), TIMEOUT);
        assert!(service
            .history(EntityType::Task, EntityId::new())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_backend_times_out() {
        let remote = Arc::new(MemoryRemote::new());
        remote.set_latency(Duration::from_secs(5)).await;
        let service = RestoreService::new(remote, Duration::from_millis(200));

        let err = service
            .history(EntityType::Task, EntityId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Network(_)));
        assert!(err.is_transient());

        let store = LocalStore::in_memory();
        let turn = SyncTurn::begin(Arc::new(std::sync::atomic::AtomicBool::new(false)));
        let id = EntityId::new();
        let err = service
            .restore(&RecordHandler::<Listing>::new(), &store, &turn, id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Network(_)));
        assert!(store.get::<Listing>(id).await.unwrap().is_none());
    }
}
