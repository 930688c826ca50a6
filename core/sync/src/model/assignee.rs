//! Many-to-many assignment rows, unique on (parent, user).

use serde::{Deserialize, Serialize};

use fieldsync_common::{EntityId, EntityType};

use crate::entity::{LinkEntity, SyncMeta, SyncableEntity};
use crate::model::{Activity, Task};

/// Assignment of a user to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignee {
    id: EntityId,
    task_id: EntityId,
    user_id: EntityId,
    pub role: Option<String>,
    meta: SyncMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssigneeWire {
    pub task_id: EntityId,
    pub user_id: EntityId,
    #[serde(default)]
    pub role: Option<String>,
}

impl TaskAssignee {
    pub fn new(task_id: EntityId, user_id: EntityId) -> Self {
        Self {
            id: EntityId::new(),
            task_id,
            user_id,
            role: None,
            meta: SyncMeta::new_local(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn task_id(&self) -> EntityId {
        self.task_id
    }

    pub fn user_id(&self) -> EntityId {
        self.user_id
    }
}

impl SyncableEntity for TaskAssignee {
    const ENTITY_TYPE: EntityType = EntityType::TaskAssignee;
    type Wire = TaskAssigneeWire;

    fn id(&self) -> EntityId {
        self.id
    }

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn to_wire(&self) -> TaskAssigneeWire {
        TaskAssigneeWire {
            task_id: self.task_id,
            user_id: self.user_id,
            role: self.role.clone(),
        }
    }

    fn from_wire(id: EntityId, meta: SyncMeta, wire: TaskAssigneeWire) -> Self {
        Self {
            id,
            task_id: wire.task_id,
            user_id: wire.user_id,
            role: wire.role,
            meta,
        }
    }

    fn apply_wire(&mut self, wire: TaskAssigneeWire) {
        self.task_id = wire.task_id;
        self.user_id = wire.user_id;
        self.role = wire.role;
    }
}

impl LinkEntity for TaskAssignee {
    type Parent = Task;

    fn parent_id(&self) -> EntityId {
        self.task_id
    }

    fn member_id(&self) -> EntityId {
        self.user_id
    }

    fn set_id(&mut self, id: EntityId) {
        self.id = id;
    }
}

/// Assignment of a user to an activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityAssignee {
    id: EntityId,
    activity_id: EntityId,
    user_id: EntityId,
    pub role: Option<String>,
    meta: SyncMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityAssigneeWire {
    pub activity_id: EntityId,
    pub user_id: EntityId,
    #[serde(default)]
    pub role: Option<String>,
}

impl ActivityAssignee {
    pub fn new(activity_id: EntityId, user_id: EntityId) -> Self {
        Self {
            id: EntityId::new(),
            activity_id,
            user_id,
            role: None,
            meta: SyncMeta::new_local(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn activity_id(&self) -> EntityId {
        self.activity_id
    }

    pub fn user_id(&self) -> EntityId {
        self.user_id
    }
}

impl SyncableEntity for ActivityAssignee {
    const ENTITY_TYPE: EntityType = EntityType::ActivityAssignee;
    type Wire = ActivityAssigneeWire;

    fn id(&self) -> EntityId {
        self.id
    }

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn to_wire(&self) -> ActivityAssigneeWire {
        ActivityAssigneeWire {
            activity_id: self.activity_id,
            user_id: self.user_id,
            role: self.role.clone(),
        }
    }

    fn from_wire(id: EntityId, meta: SyncMeta, wire: ActivityAssigneeWire) -> Self {
        Self {
            id,
            activity_id: wire.activity_id,
            user_id: wire.user_id,
            role: wire.role,
            meta,
        }
    }

    fn apply_wire(&mut self, wire: ActivityAssigneeWire) {
        self.activity_id = wire.activity_id;
        self.user_id = wire.user_id;
        self.role = wire.role;
    }
}

impl LinkEntity for ActivityAssignee {
    type Parent = Activity;

    fn parent_id(&self) -> EntityId {
        self.activity_id
    }

    fn member_id(&self) -> EntityId {
        self.user_id
    }

    fn set_id(&mut self, id: EntityId) {
        self.id = id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_remote::RemoteRow;

    #[test]
    fn test_wire_matches_backend_natural_key() {
        let link = TaskAssignee::new(EntityId::new(), EntityId::new()).with_role("lead");
        let row = crate::entity::to_row(&link).unwrap();

        let columns = EntityType::TaskAssignee.natural_key_columns().unwrap();
        assert_eq!(
            row.natural_key(columns),
            Some(vec![link.task_id().to_string(), link.user_id().to_string()])
        );
        assert_eq!(link.natural_key(), (link.task_id(), link.user_id()));
    }

    #[test]
    fn test_missing_user_id_is_a_decode_error() {
        let row = RemoteRow::new(
            EntityId::new(),
            chrono::Utc::now(),
            serde_json::json!({ "activity_id": EntityId::new().to_string() }),
        );
        let err = crate::entity::decode_wire::<ActivityAssignee>(&row).unwrap_err();
        assert!(matches!(err, fieldsync_common::Error::Decode(_)));
    }
}
