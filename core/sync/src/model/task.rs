use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use fieldsync_common::{EntityId, EntityType, Result};

use crate::entity::{MutationOrigin, RelationshipParent, SyncMeta, SyncableEntity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Open,
    InProgress,
    Done,
}

/// A to-do item, optionally tied to a listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    id: EntityId,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub listing_id: Option<EntityId>,
    pub due_at: Option<DateTime<Utc>>,
    /// Users linked through local `task_assignees` rows, whatever their sync state.
    #[serde(default)]
    assignees: BTreeSet<EntityId>,
    meta: SyncMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskWire {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub listing_id: Option<EntityId>,
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: EntityId::new(),
            title: title.into(),
            description: None,
            status: TaskStatus::Open,
            listing_id: None,
            due_at: None,
            assignees: BTreeSet::new(),
            meta: SyncMeta::new_local(),
        }
    }

    pub fn for_listing(mut self, listing_id: EntityId) -> Self {
        self.listing_id = Some(listing_id);
        self
    }

    pub fn assignees(&self) -> &BTreeSet<EntityId> {
        &self.assignees
    }
}

impl SyncableEntity for Task {
    const ENTITY_TYPE: EntityType = EntityType::Task;
    type Wire = TaskWire;

    fn id(&self) -> EntityId {
        self.id
    }

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn to_wire(&self) -> TaskWire {
        TaskWire {
            title: self.title.clone(),
            description: self.description.clone(),
            status: self.status,
            listing_id: self.listing_id,
            due_at: self.due_at,
        }
    }

    fn from_wire(id: EntityId, meta: SyncMeta, wire: TaskWire) -> Self {
        Self {
            id,
            title: wire.title,
            description: wire.description,
            status: wire.status,
            listing_id: wire.listing_id,
            due_at: wire.due_at,
            assignees: BTreeSet::new(),
            meta,
        }
    }

    fn apply_wire(&mut self, wire: TaskWire) {
        self.title = wire.title;
        self.description = wire.description;
        self.status = wire.status;
        self.listing_id = wire.listing_id;
        self.due_at = wire.due_at;
    }

    fn validate(wire: &TaskWire) -> Result<()> {
        super::require_text("title", &wire.title)
    }

    fn merge_local_only(&mut self, stored: &Self) {
        self.assignees = stored.assignees.clone();
    }
}

impl RelationshipParent for Task {
    fn members(&self) -> Vec<EntityId> {
        self.assignees.iter().copied().collect()
    }

    fn attach_member(&mut self, member: EntityId, origin: MutationOrigin<'_>) -> bool {
        let changed = self.assignees.insert(member);
        if changed {
            self.meta.record_relationship_change(origin);
        }
        changed
    }

    fn detach_member(&mut self, member: EntityId, origin: MutationOrigin<'_>) -> bool {
        let changed = self.assignees.remove(&member);
        if changed {
            self.meta.record_relationship_change(origin);
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{SyncState, SyncTurn};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn test_sync_attach_keeps_synced_parent_clean() {
        let mut task = Task::new("Schedule photographer");
        task.meta_mut().mark_synced(Utc::now());
        let updated_at = task.meta().updated_at();

        let turn = SyncTurn::begin(Arc::new(AtomicBool::new(false)));
        assert!(task.attach_member(EntityId::new(), MutationOrigin::SyncTurn(&turn)));

        assert_eq!(task.meta().sync_state(), SyncState::Synced);
        assert_eq!(task.meta().updated_at(), updated_at);
        assert_eq!(task.assignees().len(), 1);
    }

    #[test]
    fn test_user_attach_keeps_synced_parent_clean() {
        let mut task = Task::new("Schedule photographer");
        task.meta_mut().mark_synced(Utc::now());
        let updated_at = task.meta().updated_at();

        let member = EntityId::new();
        assert!(task.attach_member(member, MutationOrigin::User));
        assert!(!task.attach_member(member, MutationOrigin::User));
        assert_eq!(task.meta().sync_state(), SyncState::Synced);
        assert_eq!(task.meta().updated_at(), updated_at);

        assert!(task.detach_member(member, MutationOrigin::User));
        assert_eq!(task.meta().sync_state(), SyncState::Synced);
        assert!(task.assignees().is_empty());
    }

    #[test]
    fn test_wire_excludes_assignees() {
        let mut task = Task::new("Stage living room");
        task.attach_member(EntityId::new(), MutationOrigin::User);

        let wire = serde_json::to_value(task.to_wire()).unwrap();
        assert!(wire.get("assignees").is_none());
        assert_eq!(wire["status"], "open");
    }
}
