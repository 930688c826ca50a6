//! The contract every synchronized record implements.
//!
//! Sync-control fields (`sync_state`, `retry_count`, `last_sync_error`,
//! `synced_at`) live in [`SyncMeta`]. Their mutators are crate-private: only
//! the engine moves an entity between states, application code edits
//! content fields and hands the record to the store.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fieldsync_common::{EntityId, EntityType, Error, Result};
use fieldsync_remote::RemoteRow;
use tracing::trace;

/// Sync state of a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Unsent local intent.
    Pending,
    /// Local state matches the last known remote state.
    Synced,
    /// The last push failed; local intent is still unsent.
    Failed,
}

impl SyncState {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Pending => "pending",
            SyncState::Synced => "synced",
            SyncState::Failed => "failed",
        }
    }

    /// Whether the record carries local intent that must be pushed.
    pub fn needs_push(&self) -> bool {
        matches!(self, SyncState::Pending | SyncState::Failed)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(SyncState::Pending),
            "synced" => Ok(SyncState::Synced),
            "failed" => Ok(SyncState::Failed),
            other => Err(Error::Decode(format!("unknown sync state '{}'", other))),
        }
    }
}

/// Sync bookkeeping attached to every record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMeta {
    updated_at: DateTime<Utc>,
    sync_state: SyncState,
    retry_count: u32,
    last_sync_error: Option<String>,
    synced_at: Option<DateTime<Utc>>,
}

impl SyncMeta {
    /// Metadata for a record created locally; it starts out pending.
    pub fn new_local() -> Self {
        Self {
            updated_at: Utc::now(),
            sync_state: SyncState::Pending,
            retry_count: 0,
            last_sync_error: None,
            synced_at: None,
        }
    }

    /// Metadata for a record materialized from a confirmed remote row.
    pub(crate) fn confirmed(updated_at: DateTime<Utc>) -> Self {
        Self {
            updated_at,
            sync_state: SyncState::Synced,
            retry_count: 0,
            last_sync_error: None,
            synced_at: Some(Utc::now()),
        }
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync_state
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn last_sync_error(&self) -> Option<&str> {
        self.last_sync_error.as_deref()
    }

    pub fn synced_at(&self) -> Option<DateTime<Utc>> {
        self.synced_at
    }

    /// Claims `synced` without ever having persisted a confirmation.
    pub fn is_phantom(&self) -> bool {
        self.sync_state == SyncState::Synced && self.synced_at.is_none()
    }

    /// Record a user edit. `updated_at` strictly increases.
    pub(crate) fn mark_dirty(&mut self) {
        let now = Utc::now();
        let floor = self.updated_at + Duration::microseconds(1);
        self.updated_at = now.max(floor);
        self.sync_state = SyncState::Pending;
    }

    pub(crate) fn mark_synced(&mut self, at: DateTime<Utc>) {
        self.sync_state = SyncState::Synced;
        self.synced_at = Some(at);
        self.retry_count = 0;
        self.last_sync_error = None;
    }

    /// Record a failed push. Non-retryable failures exhaust the retry budget
    /// so only an explicit user action revives the record.
    pub(crate) fn mark_failed(&mut self, error: impl Into<String>, exhaust_at: Option<u32>) {
        self.sync_state = SyncState::Failed;
        self.last_sync_error = Some(error.into());
        if let Some(max_retries) = exhaust_at {
            self.retry_count = self.retry_count.max(max_retries);
        }
    }

    /// Accept the remote row as authoritative.
    pub(crate) fn adopt_remote(&mut self, remote_updated_at: DateTime<Utc>) {
        self.updated_at = remote_updated_at;
        self.mark_synced(Utc::now());
    }

    pub(crate) fn begin_retry(&mut self) {
        self.retry_count += 1;
        self.sync_state = SyncState::Pending;
    }

    /// Carry retry bookkeeping decided on a detached copy.
    pub(crate) fn carry_retry_from(&mut self, other: &SyncMeta) {
        self.retry_count = other.retry_count;
        self.sync_state = SyncState::Pending;
    }

    pub(crate) fn reset_retries(&mut self) {
        self.retry_count = 0;
        self.last_sync_error = None;
        self.sync_state = SyncState::Pending;
    }

    pub(crate) fn demote_phantom(&mut self) {
        self.sync_state = SyncState::Pending;
    }

    /// Relationship bookkeeping on a parent record.
    ///
    /// The member set is carried by link rows, which have their own sync
    /// state. The parent's state and `updated_at` stay as they are for
    /// either origin.
    pub(crate) fn record_relationship_change(&self, origin: MutationOrigin<'_>) {
        match origin {
            MutationOrigin::User => trace!(state = ?self.sync_state, "Membership changed by user"),
            MutationOrigin::SyncTurn(turn) => trace!(
                state = ?self.sync_state,
                turn_started = %turn.started_at(),
                "Membership mirrored from link rows"
            ),
        }
    }
}

/// Marker for an active sync turn.
///
/// While a `SyncTurn` is alive the engine reports `is_syncing`. It can only
/// be created by the engine, so application code cannot pass itself off as
/// sync-internal.
#[derive(Debug)]
pub struct SyncTurn {
    flag: Arc<AtomicBool>,
    started_at: DateTime<Utc>,
}

impl SyncTurn {
    pub(crate) fn begin(flag: Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self {
            flag,
            started_at: Utc::now(),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn is_active(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl Drop for SyncTurn {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Who performs a relationship mutation.
#[derive(Debug, Clone, Copy)]
pub enum MutationOrigin<'a> {
    /// Application code acting on user intent.
    User,
    /// The engine, as a side effect of an active sync turn.
    SyncTurn(&'a SyncTurn),
}

/// A synchronized domain record.
///
/// `Wire` is the remote payload shape (content columns only); the id and
/// `updated_at` travel in [`RemoteRow`].
pub trait SyncableEntity:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const ENTITY_TYPE: EntityType;

    type Wire: Serialize + DeserializeOwned + PartialEq + Send;

    fn id(&self) -> EntityId;

    fn meta(&self) -> &SyncMeta;

    /// Mutable access for the engine. Sync-control mutators are not public.
    fn meta_mut(&mut self) -> &mut SyncMeta;

    fn to_wire(&self) -> Self::Wire;

    fn from_wire(id: EntityId, meta: SyncMeta, wire: Self::Wire) -> Self;

    /// Overwrite content fields, keeping local-only bookkeeping.
    fn apply_wire(&mut self, wire: Self::Wire);

    /// Shape checks beyond what deserialization enforces.
    fn validate(_wire: &Self::Wire) -> Result<()> {
        Ok(())
    }

    /// Keep local-only state of the stored copy when a user edit replaces it.
    fn merge_local_only(&mut self, _stored: &Self) {}
}

/// A many-to-many link row identified by a natural key.
pub trait LinkEntity: SyncableEntity {
    type Parent: RelationshipParent;

    fn parent_id(&self) -> EntityId;

    fn member_id(&self) -> EntityId;

    /// Re-key the row to the canonical remote id.
    fn set_id(&mut self, id: EntityId);

    fn natural_key(&self) -> (EntityId, EntityId) {
        (self.parent_id(), self.member_id())
    }
}

/// A record owning a relationship collection maintained from link rows.
pub trait RelationshipParent: SyncableEntity {
    fn members(&self) -> Vec<EntityId>;

    /// Returns `true` if the collection changed.
    fn attach_member(&mut self, member: EntityId, origin: MutationOrigin<'_>) -> bool;

    /// Returns `true` if the collection changed.
    fn detach_member(&mut self, member: EntityId, origin: MutationOrigin<'_>) -> bool;
}

/// Encode a record for the remote endpoint.
pub(crate) fn to_row<E: SyncableEntity>(entity: &E) -> Result<RemoteRow> {
    let fields = serde_json::to_value(entity.to_wire())?;
    Ok(RemoteRow::new(entity.id(), entity.meta().updated_at(), fields))
}

/// Decode a remote payload, reporting shape problems as `Decode` errors.
pub(crate) fn decode_wire<E: SyncableEntity>(row: &RemoteRow) -> Result<E::Wire> {
    let wire: E::Wire = serde_json::from_value(serde_json::Value::Object(row.fields.clone()))
        .map_err(|e| {
            Error::Decode(format!("{} row {}: {}", E::ENTITY_TYPE, row.id, e))
        })?;
    E::validate(&wire)
        .map_err(|e| Error::Decode(format!("{} row {}: {}", E::ENTITY_TYPE, row.id, e)))?;
    Ok(wire)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_local_is_pending() {
        let meta = SyncMeta::new_local();
        assert_eq!(meta.sync_state(), SyncState::Pending);
        assert_eq!(meta.retry_count(), 0);
        assert!(meta.synced_at().is_none());
        assert!(!meta.is_phantom());
    }

    #[test]
    fn test_mark_dirty_is_strictly_monotonic() {
        let mut meta = SyncMeta::confirmed(Utc::now() + Duration::seconds(60));
        let before = meta.updated_at();
        meta.mark_dirty();
        assert!(meta.updated_at() > before);
        assert_eq!(meta.sync_state(), SyncState::Pending);
    }

    #[test]
    fn test_mark_synced_clears_failure() {
        let mut meta = SyncMeta::new_local();
        meta.mark_failed("connection lost", None);
        meta.begin_retry();
        meta.mark_failed("connection lost", None);
        assert_eq!(meta.retry_count(), 1);

        meta.mark_synced(Utc::now());
        assert_eq!(meta.sync_state(), SyncState::Synced);
        assert_eq!(meta.retry_count(), 0);
        assert!(meta.last_sync_error().is_none());
        assert!(meta.synced_at().is_some());
    }

    #[test]
    fn test_permanent_failure_exhausts_retries() {
        let mut meta = SyncMeta::new_local();
        meta.mark_failed("permission denied syncing tasks", Some(5));
        assert_eq!(meta.retry_count(), 5);
        assert_eq!(meta.last_sync_error(), Some("permission denied syncing tasks"));

        meta.reset_retries();
        assert_eq!(meta.retry_count(), 0);
        assert_eq!(meta.sync_state(), SyncState::Pending);
    }

    #[test]
    fn test_relationship_change_never_dirties_parent() {
        let flag = Arc::new(AtomicBool::new(false));
        let turn = SyncTurn::begin(flag.clone());
        assert!(turn.is_active());

        let meta = SyncMeta::confirmed(Utc::now());
        let updated_at = meta.updated_at();
        meta.record_relationship_change(MutationOrigin::SyncTurn(&turn));
        assert_eq!(meta.sync_state(), SyncState::Synced);

        meta.record_relationship_change(MutationOrigin::User);
        assert_eq!(meta.sync_state(), SyncState::Synced);
        assert_eq!(meta.updated_at(), updated_at);

        drop(turn);
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_phantom_detection() {
        let mut meta = SyncMeta::new_local();
        meta.sync_state = SyncState::Synced;
        assert!(meta.is_phantom());
        meta.demote_phantom();
        assert_eq!(meta.sync_state(), SyncState::Pending);
    }

    #[test]
    fn test_sync_state_storage_form() {
        assert_eq!(serde_json::to_string(&SyncState::Failed).unwrap(), "\"failed\"");
        assert_eq!("synced".parse::<SyncState>().unwrap(), SyncState::Synced);
        assert!("dirty".parse::<SyncState>().is_err());
    }
}
