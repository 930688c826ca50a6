//! Remote endpoint trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

use fieldsync_common::{ActorId, EntityId, EntityType, Result};

use crate::audit::AuditRecord;

/// A row as it travels between the engine and the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRow {
    /// Primary key.
    pub id: EntityId,
    /// Last-mutation timestamp. The backend stamps it when a write commits.
    pub updated_at: DateTime<Utc>,
    /// Content columns, keyed by column name.
    pub fields: Map<String, Value>,
}

impl RemoteRow {
    /// Create a row from a JSON object of content columns.
    ///
    /// Non-object values produce a row without content columns.
    pub fn new(id: EntityId, updated_at: DateTime<Utc>, fields: Value) -> Self {
        let fields = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            id,
            updated_at,
            fields,
        }
    }

    /// Get a content column.
    pub fn field(&self, column: &str) -> Option<&Value> {
        self.fields.get(column)
    }

    /// Get a content column as a string, treating null as absent.
    pub fn str_field(&self, column: &str) -> Option<&str> {
        self.fields.get(column).and_then(Value::as_str)
    }

    /// Values of the natural key columns, or `None` if any is missing.
    pub fn natural_key(&self, columns: &[&str]) -> Option<Vec<String>> {
        columns
            .iter()
            .map(|c| self.str_field(c).map(str::to_string))
            .collect()
    }

    /// Full row snapshot as stored in audit records.
    pub fn snapshot(&self) -> Value {
        let mut map = self.fields.clone();
        map.insert("id".to_string(), Value::String(self.id.to_string()));
        map.insert(
            "updated_at".to_string(),
            Value::String(self.updated_at.to_rfc3339()),
        );
        Value::Object(map)
    }

    /// Rebuild a row from an audit snapshot.
    pub fn from_snapshot(snapshot: &Value) -> Option<Self> {
        let mut map = snapshot.as_object()?.clone();
        let id = map
            .remove("id")
            .and_then(|v| v.as_str().and_then(|s| EntityId::parse(s).ok()))?;
        let updated_at = map
            .remove("updated_at")
            .and_then(|v| v.as_str().and_then(|s| DateTime::parse_from_rfc3339(s).ok()))
            .map(|t| t.with_timezone(&Utc))?;
        Some(Self {
            id,
            updated_at,
            fields: map,
        })
    }
}

/// Remote data endpoint consumed by the sync engine.
///
/// Implementations must enforce the natural-key uniqueness constraint of
/// link tables; the engine's dedup and upsert strategy depends on it.
#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
    /// Get the endpoint name (e.g., "memory", "postgrest").
    fn name(&self) -> &str;

    /// Range query for rows with `updated_at >= since`.
    ///
    /// The comparison is inclusive; callers subtract a safety buffer from
    /// their cursor before calling.
    async fn fetch_changed(
        &self,
        entity_type: EntityType,
        since: DateTime<Utc>,
    ) -> Result<Vec<RemoteRow>>;

    /// All primary keys currently present for an entity type.
    async fn fetch_ids(&self, entity_type: EntityType) -> Result<HashSet<EntityId>>;

    /// Insert-or-update keyed by primary key.
    ///
    /// Returns the stored row with the commit-time `updated_at`.
    ///
    /// # Errors
    /// - `PermissionDenied` if the actor may not write this entity type
    /// - `ForeignKeyMissing` if a referenced parent row does not exist
    /// - `UniqueConflict` if the row collides with another row's natural key
    async fn upsert(
        &self,
        entity_type: EntityType,
        row: RemoteRow,
        actor: &ActorId,
    ) -> Result<RemoteRow>;

    /// Insert-or-update keyed by the entity type's natural key.
    ///
    /// # Postconditions
    /// - Exactly one row exists for the natural key
    /// - The returned row carries the canonical primary key, which may
    ///   differ from the pushed row's id when the key already existed
    async fn upsert_by_natural_key(
        &self,
        entity_type: EntityType,
        row: RemoteRow,
        actor: &ActorId,
    ) -> Result<RemoteRow>;

    /// Delete a row by primary key.
    ///
    /// # Errors
    /// - `NotFound` if no such row exists
    async fn delete(&self, entity_type: EntityType, id: EntityId, actor: &ActorId) -> Result<()>;

    /// Audit records for a primary key, oldest first.
    async fn audit_trail(&self, entity_type: EntityType, id: EntityId) -> Result<Vec<AuditRecord>>;

    /// Re-materialize a deleted row from its most recent delete record.
    ///
    /// # Errors
    /// - `NotFound` if no delete record exists for the key
    /// - `UniqueConflict` if the id or natural key is taken again
    /// - `ForeignKeyMissing` if a referenced parent row no longer exists
    /// - `NotAuthorized` if the actor may not restore the row
    async fn restore(
        &self,
        entity_type: EntityType,
        id: EntityId,
        actor: Option<&ActorId>,
    ) -> Result<RemoteRow>;
}
