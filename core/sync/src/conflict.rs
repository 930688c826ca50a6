//! Local-versus-remote authority decisions.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use fieldsync_common::EntityId;

use crate::entity::{SyncMeta, SyncState, SyncableEntity};

/// Why the local copy was kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalReason {
    /// The value is being pushed right now; the incoming row is an echo.
    InFlight,
    /// An unsent failed change must not be discarded by a read.
    Failed,
    /// Pending local intent is at least as new as the remote row.
    NewerLocal,
}

/// Which side is authoritative for one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authority {
    Local(LocalReason),
    Remote,
}

impl Authority {
    pub fn is_local(&self) -> bool {
        matches!(self, Authority::Local(_))
    }
}

/// Conflict resolver with the set of ids currently being pushed.
#[derive(Debug, Default)]
pub struct ConflictResolver {
    in_flight: Mutex<HashSet<EntityId>>,
}

impl ConflictResolver {
    /// Create a resolver with nothing in flight.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide who wins. Rules are evaluated in order:
    ///
    /// 1. in flight: local
    /// 2. `failed`: local
    /// 3. `synced`: remote
    /// 4. `pending`: local unless the remote row is strictly newer
    pub fn decide(meta: &SyncMeta, remote_updated_at: DateTime<Utc>, in_flight: bool) -> Authority {
        if in_flight {
            return Authority::Local(LocalReason::InFlight);
        }
        match meta.sync_state() {
            SyncState::Failed => Authority::Local(LocalReason::Failed),
            SyncState::Synced => Authority::Remote,
            SyncState::Pending => {
                if remote_updated_at > meta.updated_at() {
                    Authority::Remote
                } else {
                    Authority::Local(LocalReason::NewerLocal)
                }
            }
        }
    }

    /// Pure form of the decision for one entity.
    pub fn is_local_authoritative<E: SyncableEntity>(
        entity: &E,
        remote_updated_at: DateTime<Utc>,
        in_flight: bool,
    ) -> bool {
        Self::decide(entity.meta(), remote_updated_at, in_flight).is_local()
    }

    /// Decision using the tracked in-flight set.
    pub fn authority<E: SyncableEntity>(&self, entity: &E, remote_updated_at: DateTime<Utc>) -> Authority {
        Self::decide(entity.meta(), remote_updated_at, self.is_in_flight(entity.id()))
    }

    pub fn is_in_flight(&self, id: EntityId) -> bool {
        self.lock().contains(&id)
    }

    /// Number of ids currently marked in flight.
    pub fn in_flight_count(&self) -> usize {
        self.lock().len()
    }

    /// Mark `id` in flight until the returned guard is dropped.
    ///
    /// Take the guard immediately before issuing the push and drop it as
    /// soon as the response is in hand; dropping also covers errors and
    /// cancellation.
    pub fn begin_push(&self, id: EntityId) -> InFlightGuard<'_> {
        self.lock().insert(id);
        InFlightGuard { resolver: self, id }
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<EntityId>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clears an in-flight mark on drop.
#[derive(Debug)]
pub struct InFlightGuard<'a> {
    resolver: &'a ConflictResolver,
    id: EntityId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.resolver.lock().remove(&self.id);
    }
}
