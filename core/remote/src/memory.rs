//! In-memory backend for testing and local simulation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use fieldsync_common::{ActorId, EntityId, EntityType, Error, Result};

use crate::audit::{AuditAction, AuditLog, AuditRecord};
use crate::endpoint::{RemoteEndpoint, RemoteRow};

type Table = BTreeMap<EntityId, RemoteRow>;

/// Persistent part of the backend.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RemoteState {
    tables: BTreeMap<EntityType, Table>,
    audit: AuditLog,
    admins: BTreeSet<ActorId>,
}

/// Injected failures.
#[derive(Debug, Default)]
struct Faults {
    offline: bool,
    denied: HashSet<EntityType>,
    failing_ids: HashSet<EntityId>,
    latency: Duration,
}

#[derive(Debug, Default)]
struct Counters {
    fetches: usize,
    upserts: HashMap<EntityType, usize>,
    natural_key_upserts: HashMap<(EntityType, Vec<String>), usize>,
}

/// In-memory backend.
///
/// Behaves like a relational backend with audit triggers: every committed
/// insert, update and delete appends an [`AuditRecord`], foreign keys and
/// natural-key uniqueness are enforced, and restore re-materializes rows
/// from their last delete record. Failures can be injected for testing.
pub struct MemoryRemote {
    state: RwLock<RemoteState>,
    faults: RwLock<Faults>,
    counters: Mutex<Counters>,
}

impl MemoryRemote {
    /// Create a new empty backend.
    pub fn new() -> Self {
        Self::from_state(RemoteState::default())
    }

    fn from_state(state: RemoteState) -> Self {
        Self {
            state: RwLock::new(state),
            faults: RwLock::new(Faults::default()),
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Load a backend snapshot, or start empty if the file does not exist.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = fs::read_to_string(path).await.map_err(Error::Io)?;
        let state: RemoteState = serde_json::from_str(&content)?;
        Ok(Self::from_state(state))
    }

    /// Persist tables, audit log and administrators to a JSON snapshot.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = {
            let state = self.state.read().await;
            serde_json::to_string_pretty(&*state)?
        };
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json).await.map_err(Error::Io)?;
        fs::rename(&tmp, path).await.map_err(Error::Io)
    }

    /// Allow an actor to restore any row.
    pub async fn grant_admin(&self, actor: ActorId) {
        self.state.write().await.admins.insert(actor);
    }

    /// Simulate losing or regaining connectivity.
    pub async fn set_offline(&self, offline: bool) {
        self.faults.write().await.offline = offline;
    }

    /// Reject every call touching an entity type with a permission error.
    pub async fn deny(&self, entity_type: EntityType) {
        self.faults.write().await.denied.insert(entity_type);
    }

    /// Lift a previous [`MemoryRemote::deny`].
    pub async fn allow(&self, entity_type: EntityType) {
        self.faults.write().await.denied.remove(&entity_type);
    }

    /// Make pushes of a specific row fail with a network error.
    pub async fn fail_pushes_for(&self, id: EntityId) {
        self.faults.write().await.failing_ids.insert(id);
    }

    /// Lift a previous [`MemoryRemote::fail_pushes_for`].
    pub async fn clear_push_failure(&self, id: EntityId) {
        self.faults.write().await.failing_ids.remove(&id);
    }

    /// Delay every call by `latency`.
    pub async fn set_latency(&self, latency: Duration) {
        self.faults.write().await.latency = latency;
    }

    /// Insert a row directly, bypassing constraints and audit.
    pub async fn seed(&self, entity_type: EntityType, row: RemoteRow) {
        self.state
            .write()
            .await
            .tables
            .entry(entity_type)
            .or_default()
            .insert(row.id, row);
    }

    /// Write made by another client; constraints and audit apply.
    pub async fn external_upsert(
        &self,
        entity_type: EntityType,
        row: RemoteRow,
        actor: Option<&ActorId>,
    ) -> Result<RemoteRow> {
        let mut state = self.state.write().await;
        apply_upsert(&mut state, entity_type, row, actor)
    }

    /// Delete made by another client; audit applies.
    pub async fn external_delete(
        &self,
        entity_type: EntityType,
        id: EntityId,
        actor: Option<&ActorId>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        apply_delete(&mut state, entity_type, id, actor)
    }

    /// Get a row by primary key.
    pub async fn row(&self, entity_type: EntityType, id: EntityId) -> Option<RemoteRow> {
        let state = self.state.read().await;
        state.tables.get(&entity_type)?.get(&id).cloned()
    }

    /// All rows of an entity type.
    pub async fn rows(&self, entity_type: EntityType) -> Vec<RemoteRow> {
        let state = self.state.read().await;
        state
            .tables
            .get(&entity_type)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of audit records.
    pub async fn audit_len(&self) -> usize {
        self.state.read().await.audit.len()
    }

    /// Number of range queries served.
    pub async fn fetch_calls(&self) -> usize {
        self.counters.lock().await.fetches
    }

    /// Number of primary-key upserts served for an entity type.
    pub async fn upsert_calls(&self, entity_type: EntityType) -> usize {
        self.counters
            .lock()
            .await
            .upserts
            .get(&entity_type)
            .copied()
            .unwrap_or(0)
    }

    /// Number of natural-key upserts served for one key.
    pub async fn natural_key_upserts(&self, entity_type: EntityType, key: &[String]) -> usize {
        self.counters
            .lock()
            .await
            .natural_key_upserts
            .get(&(entity_type, key.to_vec()))
            .copied()
            .unwrap_or(0)
    }

    /// Apply injected latency and failures.
    async fn gate(&self, entity_type: Option<EntityType>, id: Option<EntityId>) -> Result<()> {
        let latency = self.faults.read().await.latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let faults = self.faults.read().await;
        if faults.offline {
            return Err(Error::Network("connection lost".to_string()));
        }
        if let Some(entity_type) = entity_type {
            if faults.denied.contains(&entity_type) {
                return Err(Error::PermissionDenied {
                    entity_type,
                    message: "row level security policy".to_string(),
                });
            }
        }
        if let Some(id) = id {
            if faults.failing_ids.contains(&id) {
                return Err(Error::Network(format!("request for {} timed out", id)));
            }
        }
        Ok(())
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteEndpoint for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn fetch_changed(
        &self,
        entity_type: EntityType,
        since: DateTime<Utc>,
    ) -> Result<Vec<RemoteRow>> {
        self.gate(Some(entity_type), None).await?;
        self.counters.lock().await.fetches += 1;

        let state = self.state.read().await;
        let mut rows: Vec<RemoteRow> = state
            .tables
            .get(&entity_type)
            .map(|t| t.values().filter(|r| r.updated_at >= since).cloned().collect())
            .unwrap_or_default();
        rows.sort_by_key(|r| r.updated_at);

        debug!("{} rows of {} changed since {}", rows.len(), entity_type, since);
        Ok(rows)
    }

    async fn fetch_ids(&self, entity_type: EntityType) -> Result<HashSet<EntityId>> {
        self.gate(Some(entity_type), None).await?;
        let state = self.state.read().await;
        Ok(state
            .tables
            .get(&entity_type)
            .map(|t| t.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn upsert(
        &self,
        entity_type: EntityType,
        row: RemoteRow,
        actor: &ActorId,
    ) -> Result<RemoteRow> {
        self.gate(Some(entity_type), Some(row.id)).await?;
        *self
            .counters
            .lock()
            .await
            .upserts
            .entry(entity_type)
            .or_insert(0) += 1;

        let mut state = self.state.write().await;
        apply_upsert(&mut state, entity_type, row, Some(actor))
    }

    async fn upsert_by_natural_key(
        &self,
        entity_type: EntityType,
        row: RemoteRow,
        actor: &ActorId,
    ) -> Result<RemoteRow> {
        self.gate(Some(entity_type), Some(row.id)).await?;

        let columns = entity_type.natural_key_columns().ok_or_else(|| {
            Error::InvalidInput(format!("{} has no natural key", entity_type))
        })?;
        let key = row.natural_key(columns).ok_or_else(|| {
            Error::InvalidInput(format!("{} row {} is missing its natural key", entity_type, row.id))
        })?;
        *self
            .counters
            .lock()
            .await
            .natural_key_upserts
            .entry((entity_type, key.clone()))
            .or_insert(0) += 1;

        let mut state = self.state.write().await;
        check_foreign_keys(&state, entity_type, &row)?;

        let existing_id = find_by_natural_key(&state, entity_type, columns, &key, None);
        let canonical = RemoteRow {
            id: existing_id.unwrap_or(row.id),
            updated_at: row.updated_at,
            fields: row.fields,
        };
        write_row(&mut state, entity_type, canonical, Some(actor))
    }

    async fn delete(&self, entity_type: EntityType, id: EntityId, actor: &ActorId) -> Result<()> {
        self.gate(Some(entity_type), Some(id)).await?;
        let mut state = self.state.write().await;
        apply_delete(&mut state, entity_type, id, Some(actor))
    }

    async fn audit_trail(&self, entity_type: EntityType, id: EntityId) -> Result<Vec<AuditRecord>> {
        self.gate(None, None).await?;
        Ok(self.state.read().await.audit.for_key(entity_type, id))
    }

    async fn restore(
        &self,
        entity_type: EntityType,
        id: EntityId,
        actor: Option<&ActorId>,
    ) -> Result<RemoteRow> {
        self.gate(None, None).await?;

        let actor = actor.ok_or_else(|| {
            Error::NotAuthorized("restore requires an authenticated actor".to_string())
        })?;

        let mut state = self.state.write().await;
        let record = state
            .audit
            .latest_delete(entity_type, id)
            .ok_or_else(|| Error::NotFound(format!("no deleted {} row {}", entity_type, id)))?;

        let authorized =
            state.admins.contains(actor) || record.actor.as_ref() == Some(actor);
        if !authorized {
            return Err(Error::NotAuthorized(format!(
                "{} may not restore {} {}",
                actor, entity_type, id
            )));
        }

        let row = record
            .before
            .as_ref()
            .and_then(RemoteRow::from_snapshot)
            .ok_or_else(|| {
                Error::NotFound(format!("delete record for {} {} has no snapshot", entity_type, id))
            })?;

        if state
            .tables
            .get(&entity_type)
            .is_some_and(|t| t.contains_key(&id))
        {
            return Err(Error::UniqueConflict(format!(
                "{} {} already exists",
                entity_type, id
            )));
        }
        if let Some(columns) = entity_type.natural_key_columns() {
            if let Some(key) = row.natural_key(columns) {
                if let Some(other) = find_by_natural_key(&state, entity_type, columns, &key, None) {
                    return Err(Error::UniqueConflict(format!(
                        "{} {} already holds ({})",
                        entity_type,
                        other,
                        key.join(", ")
                    )));
                }
            }
        }
        check_foreign_keys(&state, entity_type, &row)?;

        write_row(&mut state, entity_type, row, Some(actor))
    }
}

fn apply_upsert(
    state: &mut RemoteState,
    entity_type: EntityType,
    row: RemoteRow,
    actor: Option<&ActorId>,
) -> Result<RemoteRow> {
    check_foreign_keys(state, entity_type, &row)?;
    if let Some(columns) = entity_type.natural_key_columns() {
        if let Some(key) = row.natural_key(columns) {
            if let Some(other) = find_by_natural_key(state, entity_type, columns, &key, Some(row.id)) {
                return Err(Error::UniqueConflict(format!(
                    "{} {} already holds ({})",
                    entity_type,
                    other,
                    key.join(", ")
                )));
            }
        }
    }
    write_row(state, entity_type, row, actor)
}

fn apply_delete(
    state: &mut RemoteState,
    entity_type: EntityType,
    id: EntityId,
    actor: Option<&ActorId>,
) -> Result<()> {
    let removed = state
        .tables
        .get_mut(&entity_type)
        .and_then(|t| t.remove(&id))
        .ok_or_else(|| Error::NotFound(format!("{} {} not found", entity_type, id)))?;

    state.audit.append(
        AuditAction::Delete,
        actor,
        entity_type,
        id,
        Some(removed.snapshot()),
        None,
    );
    Ok(())
}

/// Store a row and append the matching audit record.
///
/// `updated_at` is stamped at commit, whatever the caller sent.
fn write_row(
    state: &mut RemoteState,
    entity_type: EntityType,
    mut row: RemoteRow,
    actor: Option<&ActorId>,
) -> Result<RemoteRow> {
    row.updated_at = Utc::now();
    let previous = state
        .tables
        .entry(entity_type)
        .or_default()
        .insert(row.id, row.clone());

    let (action, before) = match previous {
        Some(prev) => (AuditAction::Update, Some(prev.snapshot())),
        None => (AuditAction::Insert, None),
    };
    state
        .audit
        .append(action, actor, entity_type, row.id, before, Some(row.snapshot()));
    Ok(row)
}

fn find_by_natural_key(
    state: &RemoteState,
    entity_type: EntityType,
    columns: &[&str],
    key: &[String],
    exclude: Option<EntityId>,
) -> Option<EntityId> {
    state.tables.get(&entity_type)?.values().find_map(|r| {
        let matches = Some(r.id) != exclude
            && r.natural_key(columns).as_deref() == Some(key);
        matches.then_some(r.id)
    })
}

fn check_foreign_keys(state: &RemoteState, entity_type: EntityType, row: &RemoteRow) -> Result<()> {
    for key in entity_type.foreign_keys() {
        let target = match row.field(key.column) {
            None | Some(Value::Null) => continue,
            Some(Value::String(s)) => EntityId::parse(s)?,
            Some(other) => {
                return Err(Error::InvalidInput(format!(
                    "{}.{} must be an id, got {}",
                    entity_type, key.column, other
                )))
            }
        };
        let exists = state
            .tables
            .get(&key.references)
            .is_some_and(|t| t.contains_key(&target));
        if !exists {
            return Err(Error::ForeignKeyMissing(format!(
                "{}.{} references missing {} {}",
                entity_type, key.column, key.references, target
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn actor() -> ActorId {
        ActorId::new("agent-1").unwrap()
    }

    fn user_row(name: &str) -> RemoteRow {
        RemoteRow::new(EntityId::new(), Utc::now(), json!({ "name": name }))
    }

    fn task_row(title: &str) -> RemoteRow {
        RemoteRow::new(EntityId::new(), Utc::now(), json!({ "title": title, "listing_id": null }))
    }

    fn assignee_row(task: EntityId, user: EntityId) -> RemoteRow {
        RemoteRow::new(
            EntityId::new(),
            Utc::now(),
            json!({ "task_id": task.to_string(), "user_id": user.to_string() }),
        )
    }

    #[tokio::test]
    async fn test_fetch_changed_is_inclusive() {
        let remote = MemoryRemote::new();
        let stored = remote
            .upsert(EntityType::Task, task_row("Inspect roof"), &actor())
            .await
            .unwrap();
        let at = stored.updated_at;

        let rows = remote.fetch_changed(EntityType::Task, at).await.unwrap();
        assert_eq!(rows.len(), 1);

        let later = at + chrono::Duration::microseconds(1);
        assert!(remote.fetch_changed(EntityType::Task, later).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_stamps_commit_time() {
        let remote = MemoryRemote::new();
        let mut row = task_row("Reshoot kitchen");
        let sent = Utc::now() - chrono::Duration::hours(1);
        row.updated_at = sent;

        let stored = remote.upsert(EntityType::Task, row.clone(), &actor()).await.unwrap();
        assert!(stored.updated_at > sent);
        assert_eq!(remote.row(EntityType::Task, row.id).await, Some(stored.clone()));

        // a delta started before the push still sees the row
        let rows = remote
            .fetch_changed(EntityType::Task, sent + chrono::Duration::minutes(30))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);

        let user = remote.upsert(EntityType::User, user_row("Dana"), &actor()).await.unwrap();
        let mut link = assignee_row(row.id, user.id);
        link.updated_at = sent;
        let canonical = remote
            .upsert_by_natural_key(EntityType::TaskAssignee, link, &actor())
            .await
            .unwrap();
        assert!(canonical.updated_at > sent);
    }

    #[tokio::test]
    async fn test_every_mutation_is_audited() {
        let remote = MemoryRemote::new();
        let mut row = task_row("Stage living room");
        let id = row.id;

        remote.upsert(EntityType::Task, row.clone(), &actor()).await.unwrap();
        row.fields.insert("title".into(), json!("Stage den"));
        remote.upsert(EntityType::Task, row, &actor()).await.unwrap();
        remote.delete(EntityType::Task, id, &actor()).await.unwrap();

        let trail = remote.audit_trail(EntityType::Task, id).await.unwrap();
        let actions: Vec<_> = trail.iter().map(|r| r.action).collect();
        assert_eq!(
            actions,
            vec![AuditAction::Insert, AuditAction::Update, AuditAction::Delete]
        );
        assert!(trail[0].before.is_none());
        assert!(trail[2].after.is_none());
        assert_eq!(trail[2].before.as_ref().unwrap()["title"], "Stage den");
    }

    #[tokio::test]
    async fn test_natural_key_upsert_keeps_one_row() {
        let remote = MemoryRemote::new();
        let user = user_row("Dana");
        let task = task_row("Open house");
        remote.upsert(EntityType::User, user.clone(), &actor()).await.unwrap();
        remote.upsert(EntityType::Task, task.clone(), &actor()).await.unwrap();

        let first = assignee_row(task.id, user.id);
        let second = assignee_row(task.id, user.id);
        let a = remote
            .upsert_by_natural_key(EntityType::TaskAssignee, first.clone(), &actor())
            .await
            .unwrap();
        let b = remote
            .upsert_by_natural_key(EntityType::TaskAssignee, second, &actor())
            .await
            .unwrap();

        assert_eq!(a.id, first.id);
        assert_eq!(b.id, first.id);
        assert_eq!(remote.rows(EntityType::TaskAssignee).await.len(), 1);
    }

    #[tokio::test]
    async fn test_primary_key_upsert_enforces_natural_key() {
        let remote = MemoryRemote::new();
        let user = user_row("Dana");
        let task = task_row("Open house");
        remote.upsert(EntityType::User, user.clone(), &actor()).await.unwrap();
        remote.upsert(EntityType::Task, task.clone(), &actor()).await.unwrap();

        remote
            .upsert(EntityType::TaskAssignee, assignee_row(task.id, user.id), &actor())
            .await
            .unwrap();
        let err = remote
            .upsert(EntityType::TaskAssignee, assignee_row(task.id, user.id), &actor())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UniqueConflict(_)));
    }

    #[tokio::test]
    async fn test_foreign_keys_enforced() {
        let remote = MemoryRemote::new();
        let err = remote
            .upsert(
                EntityType::TaskAssignee,
                assignee_row(EntityId::new(), EntityId::new()),
                &actor(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("FK_MISSING"));
    }

    #[tokio::test]
    async fn test_restore_round_trip() {
        let remote = MemoryRemote::new();
        let row = task_row("Order sign");
        let id = row.id;
        remote.upsert(EntityType::Task, row.clone(), &actor()).await.unwrap();
        remote.delete(EntityType::Task, id, &actor()).await.unwrap();

        let restored = remote.restore(EntityType::Task, id, Some(&actor())).await.unwrap();
        assert_eq!(restored.id, id);
        assert_eq!(restored.fields, row.fields);
        assert!(remote.row(EntityType::Task, id).await.is_some());

        let err = remote.restore(EntityType::Task, id, Some(&actor())).await.unwrap_err();
        assert_eq!(err.code(), Some("UNIQUE_CONFLICT"));
    }

    #[tokio::test]
    async fn test_restore_error_taxonomy() {
        let remote = MemoryRemote::new();
        let stranger = ActorId::new("agent-2").unwrap();

        let err = remote
            .restore(EntityType::Task, EntityId::new(), Some(&actor()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("NOT_FOUND"));

        let row = task_row("Book photographer");
        remote.upsert(EntityType::Task, row.clone(), &actor()).await.unwrap();
        remote.delete(EntityType::Task, row.id, &actor()).await.unwrap();

        let err = remote.restore(EntityType::Task, row.id, None).await.unwrap_err();
        assert_eq!(err.code(), Some("NOT_AUTHORIZED"));
        let err = remote
            .restore(EntityType::Task, row.id, Some(&stranger))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("NOT_AUTHORIZED"));

        remote.grant_admin(stranger.clone()).await;
        assert!(remote.restore(EntityType::Task, row.id, Some(&stranger)).await.is_ok());
    }

    #[tokio::test]
    async fn test_restore_requires_parents() {
        let remote = MemoryRemote::new();
        let user = user_row("Dana");
        let task = task_row("Walkthrough");
        remote.upsert(EntityType::User, user.clone(), &actor()).await.unwrap();
        remote.upsert(EntityType::Task, task.clone(), &actor()).await.unwrap();
        let link = remote
            .upsert_by_natural_key(EntityType::TaskAssignee, assignee_row(task.id, user.id), &actor())
            .await
            .unwrap();

        remote.delete(EntityType::TaskAssignee, link.id, &actor()).await.unwrap();
        remote.delete(EntityType::Task, task.id, &actor()).await.unwrap();

        let err = remote
            .restore(EntityType::TaskAssignee, link.id, Some(&actor()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("FK_MISSING"));
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let remote = MemoryRemote::new();
        remote.set_offline(true).await;
        let err = remote.fetch_ids(EntityType::Task).await.unwrap_err();
        assert!(err.is_transient());

        remote.set_offline(false).await;
        remote.deny(EntityType::Task).await;
        let err = remote
            .fetch_changed(EntityType::Task, Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.summary(), "permission denied syncing tasks");
    }

    #[tokio::test]
    async fn test_persistence() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("remote.json");

        let row = {
            let remote = MemoryRemote::new();
            let row = remote
                .upsert(EntityType::Task, task_row("Measure lot"), &actor())
                .await
                .unwrap();
            remote.save(&path).await.unwrap();
            row
        };

        let remote = MemoryRemote::load(&path).await.unwrap();
        assert_eq!(remote.row(EntityType::Task, row.id).await, Some(row));
        assert_eq!(remote.audit_len().await, 1);
    }
}
