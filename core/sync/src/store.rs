//! Embedded local datastore.
//!
//! Every write, whether a user edit or a sync step, goes through one
//! commit path: staged changes are applied to a copy of the data, the copy
//! is persisted (temp file + rename) and only then swapped in. A crash
//! mid-commit leaves the previous snapshot intact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use fieldsync_common::{EntityId, EntityType, Error, Result};

use crate::entity::{SyncMeta, SyncState, SyncableEntity};

const EVENT_CAPACITY: usize = 256;

/// What happened to a record in a committed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "sync_state")]
pub enum ChangeKind {
    Saved(SyncState),
    Removed,
}

/// Change notification emitted after a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityChange {
    pub entity_type: EntityType,
    pub id: EntityId,
    pub kind: ChangeKind,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    tables: BTreeMap<EntityType, BTreeMap<EntityId, Value>>,
    /// Local deletes not yet confirmed by the remote.
    #[serde(default)]
    tombstones: BTreeMap<EntityType, BTreeMap<EntityId, DateTime<Utc>>>,
    #[serde(default)]
    cursors: BTreeMap<EntityType, DateTime<Utc>>,
}

impl StoreData {
    fn row(&self, entity_type: EntityType, id: EntityId) -> Option<&Value> {
        self.tables.get(&entity_type)?.get(&id)
    }

    fn updated_at(&self, entity_type: EntityType, id: EntityId) -> Option<DateTime<Utc>> {
        self.row(entity_type, id)
            .and_then(meta_of)
            .map(|meta| meta.updated_at())
    }

    /// Rows marked synced that the remote never confirmed.
    fn phantom_count(&self) -> usize {
        self.tables
            .values()
            .flat_map(|t| t.values())
            .filter_map(meta_of)
            .filter(|meta| meta.is_phantom())
            .count()
    }

    fn is_tombstoned(&self, entity_type: EntityType, id: EntityId) -> bool {
        self.tombstones
            .get(&entity_type)
            .is_some_and(|t| t.contains_key(&id))
    }
}

fn meta_of(value: &Value) -> Option<SyncMeta> {
    value
        .get("meta")
        .and_then(|m| serde_json::from_value(m.clone()).ok())
}

fn decode<E: SyncableEntity>(id: EntityId, value: &Value) -> Result<E> {
    serde_json::from_value(value.clone()).map_err(|e| {
        Error::Storage(format!("corrupt {} row {}: {}", E::ENTITY_TYPE, id, e))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TombstoneOp {
    Keep,
    Record,
    Clear,
}

/// One staged change for a key.
#[derive(Debug, Clone)]
struct Staged {
    /// New row content; `None` removes the row.
    value: Option<(Value, SyncState)>,
    /// `updated_at` of the stored row the change was computed against;
    /// `None` means the row was absent.
    base: Option<DateTime<Utc>>,
    tombstone: TombstoneOp,
}

struct StoreInner {
    data: Mutex<StoreData>,
    path: Option<PathBuf>,
    open: AtomicBool,
    events: broadcast::Sender<EntityChange>,
}

/// Local datastore shared by the sync engine and user-edit paths.
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<StoreInner>,
}

impl LocalStore {
    fn with_data(data: StoreData, path: Option<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(StoreInner {
                data: Mutex::new(data),
                path,
                open: AtomicBool::new(true),
                events,
            }),
        }
    }

    /// Create a store that lives only in memory.
    pub fn in_memory() -> Self {
        Self::with_data(StoreData::default(), None)
    }

    /// Open a store persisted at `path`, creating it if missing.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let data = match fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreData::default(),
            Err(e) => return Err(Error::Io(e)),
        };
        info!("Opened local store at {}", path.display());
        let phantoms = data.phantom_count();
        if phantoms > 0 {
            warn!("{} rows claim synced without a confirmation timestamp", phantoms);
        }
        Ok(Self::with_data(data, Some(path)))
    }

    /// Backing file, if persisted.
    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Refuse all further reads and writes.
    pub fn close(&self) {
        self.inner.open.store(false, Ordering::SeqCst);
    }

    /// # Errors
    /// - `Configuration` if the store has been closed
    pub fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::Configuration("local datastore is closed".to_string()))
        }
    }

    /// Receive a notification for every committed change.
    pub fn subscribe(&self) -> broadcast::Receiver<EntityChange> {
        self.inner.events.subscribe()
    }

    pub async fn get<E: SyncableEntity>(&self, id: EntityId) -> Result<Option<E>> {
        self.ensure_open()?;
        let data = self.inner.data.lock().await;
        data.row(E::ENTITY_TYPE, id)
            .map(|value| decode(id, value))
            .transpose()
    }

    pub async fn all<E: SyncableEntity>(&self) -> Result<Vec<E>> {
        self.ensure_open()?;
        let data = self.inner.data.lock().await;
        data.tables
            .get(&E::ENTITY_TYPE)
            .map(|table| table.iter().map(|(id, v)| decode(*id, v)).collect())
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    /// Sync metadata of every row of a type, without decoding content.
    pub async fn sync_states(&self, entity_type: EntityType) -> Result<Vec<(EntityId, SyncMeta)>> {
        self.ensure_open()?;
        let data = self.inner.data.lock().await;
        Ok(data
            .tables
            .get(&entity_type)
            .map(|table| {
                table
                    .iter()
                    .filter_map(|(id, v)| meta_of(v).map(|m| (*id, m)))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Delta cursor of the last completed sync down.
    pub async fn cursor(&self, entity_type: EntityType) -> Result<Option<DateTime<Utc>>> {
        self.ensure_open()?;
        Ok(self.inner.data.lock().await.cursors.get(&entity_type).copied())
    }

    /// Ids deleted locally whose remote delete is still outstanding.
    pub async fn tombstones(&self, entity_type: EntityType) -> Result<Vec<EntityId>> {
        self.ensure_open()?;
        let data = self.inner.data.lock().await;
        Ok(data
            .tombstones
            .get(&entity_type)
            .map(|t| t.keys().copied().collect())
            .unwrap_or_default())
    }

    /// Save a user edit.
    ///
    /// Sync-control fields come from the stored copy, never from `entity`;
    /// the record is marked dirty with a strictly newer `updated_at`.
    ///
    /// # Errors
    /// - `InvalidInput` if the id was deleted locally
    pub async fn save<E: SyncableEntity>(&self, mut entity: E) -> Result<E> {
        self.ensure_open()?;
        let id = entity.id();
        let mut data = self.inner.data.lock().await;
        if data.is_tombstoned(E::ENTITY_TYPE, id) {
            return Err(Error::InvalidInput(format!(
                "{} {} was deleted; ids are never reused",
                E::ENTITY_TYPE,
                id
            )));
        }

        let stored: Option<E> = data
            .row(E::ENTITY_TYPE, id)
            .map(|v| decode(id, v))
            .transpose()?;
        let base = stored.as_ref().map(|s| s.meta().updated_at());
        match stored {
            Some(stored) => {
                entity.merge_local_only(&stored);
                *entity.meta_mut() = stored.meta().clone();
                entity.meta_mut().mark_dirty();
            }
            None => *entity.meta_mut() = SyncMeta::new_local(),
        }

        let mut staged = BTreeMap::new();
        staged.insert(
            (E::ENTITY_TYPE, id),
            Staged {
                value: Some((serde_json::to_value(&entity)?, entity.meta().sync_state())),
                base,
                tombstone: TombstoneOp::Keep,
            },
        );
        let changes = self.apply_and_persist(&mut data, staged, BTreeMap::new()).await?;
        drop(data);
        self.emit(changes);
        Ok(entity)
    }

    /// Delete a record locally and queue the remote delete.
    ///
    /// Returns `false` if no such row exists.
    pub async fn delete(&self, entity_type: EntityType, id: EntityId) -> Result<bool> {
        self.ensure_open()?;
        let mut data = self.inner.data.lock().await;
        let Some(base) = data.updated_at(entity_type, id) else {
            return Ok(false);
        };

        let mut staged = BTreeMap::new();
        staged.insert(
            (entity_type, id),
            Staged {
                value: None,
                base: Some(base),
                tombstone: TombstoneOp::Record,
            },
        );
        let changes = self.apply_and_persist(&mut data, staged, BTreeMap::new()).await?;
        drop(data);
        self.emit(changes);
        Ok(true)
    }

    /// Start a write transaction for a sync step.
    pub(crate) fn begin(&self) -> Transaction<'_> {
        Transaction {
            store: self,
            staged: BTreeMap::new(),
            cursors: BTreeMap::new(),
        }
    }

    async fn commit_staged(
        &self,
        staged: BTreeMap<(EntityType, EntityId), Staged>,
        cursors: BTreeMap<EntityType, DateTime<Utc>>,
    ) -> Result<usize> {
        self.ensure_open()?;
        let mut data = self.inner.data.lock().await;
        let changes = self.apply_and_persist(&mut data, staged, cursors).await?;
        drop(data);
        let applied = changes.len();
        self.emit(changes);
        Ok(applied)
    }

    async fn apply_and_persist(
        &self,
        data: &mut StoreData,
        staged: BTreeMap<(EntityType, EntityId), Staged>,
        cursors: BTreeMap<EntityType, DateTime<Utc>>,
    ) -> Result<Vec<EntityChange>> {
        if staged.is_empty() && cursors.is_empty() {
            return Ok(Vec::new());
        }

        let mut next = data.clone();
        let mut changes = Vec::new();
        for ((entity_type, id), change) in staged {
            if let Some(event) = apply_staged(&mut next, entity_type, id, change) {
                changes.push(event);
            }
        }
        for (entity_type, at) in cursors {
            let cursor = next.cursors.entry(entity_type).or_insert(at);
            if at > *cursor {
                *cursor = at;
            }
        }

        self.persist(&next).await?;
        *data = next;
        Ok(changes)
    }

    async fn persist(&self, data: &StoreData) -> Result<()> {
        let Some(path) = &self.inner.path else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(data)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    fn emit(&self, changes: Vec<EntityChange>) {
        for change in changes {
            // no receivers is fine
            let _ = self.inner.events.send(change);
        }
    }
}

/// Apply one staged change unless the stored row moved underneath it.
fn apply_staged(
    data: &mut StoreData,
    entity_type: EntityType,
    id: EntityId,
    change: Staged,
) -> Option<EntityChange> {
    let current = data.updated_at(entity_type, id);
    if current != change.base {
        debug!(
            "Dropping stale write to {} {}: stored {:?}, expected {:?}",
            entity_type, id, current, change.base
        );
        return None;
    }
    if change.value.is_some()
        && change.tombstone != TombstoneOp::Clear
        && data.is_tombstoned(entity_type, id)
    {
        debug!("Dropping write to locally deleted {} {}", entity_type, id);
        return None;
    }

    match change.tombstone {
        TombstoneOp::Keep => {}
        TombstoneOp::Record => {
            data.tombstones
                .entry(entity_type)
                .or_default()
                .insert(id, Utc::now());
        }
        TombstoneOp::Clear => {
            if let Some(t) = data.tombstones.get_mut(&entity_type) {
                t.remove(&id);
            }
        }
    }

    match change.value {
        Some((value, state)) => {
            data.tables.entry(entity_type).or_default().insert(id, value);
            Some(EntityChange {
                entity_type,
                id,
                kind: ChangeKind::Saved(state),
            })
        }
        None => data
            .tables
            .get_mut(&entity_type)
            .and_then(|t| t.remove(&id))
            .map(|_| EntityChange {
                entity_type,
                id,
                kind: ChangeKind::Removed,
            }),
    }
}

/// Writes staged by one sync step, committed together.
///
/// Reads see the transaction's own staged writes. Each staged write carries
/// the `updated_at` it was computed against; a write whose row changed in
/// the meantime (a user edit during a remote call) is dropped at commit.
pub(crate) struct Transaction<'a> {
    store: &'a LocalStore,
    staged: BTreeMap<(EntityType, EntityId), Staged>,
    cursors: BTreeMap<EntityType, DateTime<Utc>>,
}

impl Transaction<'_> {
    pub(crate) async fn get<E: SyncableEntity>(&self, id: EntityId) -> Result<Option<E>> {
        match self.staged.get(&(E::ENTITY_TYPE, id)) {
            Some(staged) => staged
                .value
                .as_ref()
                .map(|(value, _)| decode(id, value))
                .transpose(),
            None => self.store.get(id).await,
        }
    }

    pub(crate) async fn all<E: SyncableEntity>(&self) -> Result<Vec<E>> {
        let mut rows: BTreeMap<EntityId, E> = self
            .store
            .all::<E>()
            .await?
            .into_iter()
            .map(|e| (e.id(), e))
            .collect();
        for ((entity_type, id), staged) in &self.staged {
            if *entity_type != E::ENTITY_TYPE {
                continue;
            }
            match &staged.value {
                Some((value, _)) => {
                    rows.insert(*id, decode(*id, value)?);
                }
                None => {
                    rows.remove(id);
                }
            }
        }
        Ok(rows.into_values().collect())
    }

    pub(crate) async fn is_tombstoned(&self, entity_type: EntityType, id: EntityId) -> Result<bool> {
        if let Some(staged) = self.staged.get(&(entity_type, id)) {
            match staged.tombstone {
                TombstoneOp::Record => return Ok(true),
                TombstoneOp::Clear => return Ok(false),
                TombstoneOp::Keep => {}
            }
        }
        self.store.ensure_open()?;
        let data = self.store.inner.data.lock().await;
        Ok(data.is_tombstoned(entity_type, id))
    }

    /// The `updated_at` a new write to this key must be checked against.
    pub(crate) async fn base_of(&self, entity_type: EntityType, id: EntityId) -> Result<Option<DateTime<Utc>>> {
        if let Some(staged) = self.staged.get(&(entity_type, id)) {
            return Ok(staged.base);
        }
        self.store.ensure_open()?;
        let data = self.store.inner.data.lock().await;
        Ok(data.updated_at(entity_type, id))
    }

    /// Stage a write computed from the row as it was at `base`.
    pub(crate) fn put<E: SyncableEntity>(&mut self, entity: &E, base: Option<DateTime<Utc>>) -> Result<()> {
        let value = (serde_json::to_value(entity)?, entity.meta().sync_state());
        self.staged
            .entry((E::ENTITY_TYPE, entity.id()))
            .and_modify(|s| s.value = Some(value.clone()))
            .or_insert(Staged {
                value: Some(value),
                base,
                tombstone: TombstoneOp::Keep,
            });
        Ok(())
    }

    /// Stage removal of a row without queueing a remote delete.
    pub(crate) fn remove(&mut self, entity_type: EntityType, id: EntityId, base: Option<DateTime<Utc>>) {
        self.staged
            .entry((entity_type, id))
            .and_modify(|s| s.value = None)
            .or_insert(Staged {
                value: None,
                base,
                tombstone: TombstoneOp::Keep,
            });
    }

    /// Stage a user delete: remove the row and queue the remote delete.
    pub(crate) fn delete(&mut self, entity_type: EntityType, id: EntityId, base: Option<DateTime<Utc>>) {
        self.staged.insert(
            (entity_type, id),
            Staged {
                value: None,
                base,
                tombstone: TombstoneOp::Record,
            },
        );
    }

    /// Stage removal of a tombstone once the remote delete is confirmed.
    pub(crate) fn clear_tombstone(&mut self, entity_type: EntityType, id: EntityId, base: Option<DateTime<Utc>>) {
        self.staged
            .entry((entity_type, id))
            .and_modify(|s| s.tombstone = TombstoneOp::Clear)
            .or_insert(Staged {
                value: None,
                base,
                tombstone: TombstoneOp::Clear,
            });
    }

    pub(crate) fn set_cursor(&mut self, entity_type: EntityType, at: DateTime<Utc>) {
        self.cursors.insert(entity_type, at);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.staged.is_empty() && self.cursors.is_empty()
    }

    /// Apply all staged writes atomically. Returns the number of rows changed.
    pub(crate) async fn commit(self) -> Result<usize> {
        if self.is_empty() {
            return Ok(0);
        }
        self.store.commit_staged(self.staged, self.cursors).await
    }
}
