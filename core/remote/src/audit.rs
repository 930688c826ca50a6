//! Append-only audit log of committed row mutations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use fieldsync_common::{ActorId, EntityId, EntityType};

/// Kind of mutation an audit record captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Insert,
    Update,
    Delete,
}

/// Immutable record of a single committed mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub audit_id: Uuid,
    pub action: AuditAction,
    pub at: DateTime<Utc>,
    /// `None` means the mutation was made by the system.
    pub actor: Option<ActorId>,
    pub entity_type: EntityType,
    pub entity_pk: EntityId,
    /// Full row before the mutation; `None` for inserts.
    pub before: Option<Value>,
    /// Full row after the mutation; `None` for deletes.
    pub after: Option<Value>,
}

/// Audit log kept by the backend.
///
/// Records can only be appended; there is no update or removal API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditLog {
    records: Vec<AuditRecord>,
}

impl AuditLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record for a committed mutation and return it.
    pub fn append(
        &mut self,
        action: AuditAction,
        actor: Option<&ActorId>,
        entity_type: EntityType,
        entity_pk: EntityId,
        before: Option<Value>,
        after: Option<Value>,
    ) -> &AuditRecord {
        self.records.push(AuditRecord {
            audit_id: Uuid::new_v4(),
            action,
            at: Utc::now(),
            actor: actor.cloned(),
            entity_type,
            entity_pk,
            before,
            after,
        });
        &self.records[self.records.len() - 1]
    }

    /// All records for a primary key, oldest first.
    pub fn for_key(&self, entity_type: EntityType, entity_pk: EntityId) -> Vec<AuditRecord> {
        self.records
            .iter()
            .filter(|r| r.entity_type == entity_type && r.entity_pk == entity_pk)
            .cloned()
            .collect()
    }

    /// Most recent delete record for a primary key.
    pub fn latest_delete(&self, entity_type: EntityType, entity_pk: EntityId) -> Option<&AuditRecord> {
        self.records.iter().rev().find(|r| {
            r.action == AuditAction::Delete
                && r.entity_type == entity_type
                && r.entity_pk == entity_pk
        })
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the log is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_latest_delete_picks_newest() {
        let mut log = AuditLog::new();
        let id = EntityId::new();
        let actor = ActorId::new("agent-1").unwrap();

        log.append(AuditAction::Insert, Some(&actor), EntityType::Task, id, None, Some(json!({"v": 1})));
        log.append(AuditAction::Delete, Some(&actor), EntityType::Task, id, Some(json!({"v": 1})), None);
        log.append(AuditAction::Insert, None, EntityType::Task, id, None, Some(json!({"v": 1})));
        log.append(AuditAction::Delete, None, EntityType::Task, id, Some(json!({"v": 2})), None);

        let latest = log.latest_delete(EntityType::Task, id).unwrap();
        assert_eq!(latest.before, Some(json!({"v": 2})));
        assert!(latest.actor.is_none());
        assert_eq!(log.for_key(EntityType::Task, id).len(), 4);
    }

    #[test]
    fn test_keys_are_scoped_by_entity_type() {
        let mut log = AuditLog::new();
        let id = EntityId::new();
        log.append(AuditAction::Delete, None, EntityType::Note, id, Some(json!({})), None);

        assert!(log.latest_delete(EntityType::Task, id).is_none());
        assert!(log.latest_delete(EntityType::Note, id).is_some());
    }
}
