use serde::{Deserialize, Serialize};

use fieldsync_common::{EntityId, EntityType, Error, Result};

use crate::entity::{SyncMeta, SyncableEntity};

/// Free-text note attached to a task or an activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    id: EntityId,
    pub body: String,
    pub task_id: Option<EntityId>,
    pub activity_id: Option<EntityId>,
    meta: SyncMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteWire {
    pub body: String,
    #[serde(default)]
    pub task_id: Option<EntityId>,
    #[serde(default)]
    pub activity_id: Option<EntityId>,
}

impl Note {
    pub fn on_task(task_id: EntityId, body: impl Into<String>) -> Self {
        Self {
            id: EntityId::new(),
            body: body.into(),
            task_id: Some(task_id),
            activity_id: None,
            meta: SyncMeta::new_local(),
        }
    }

    pub fn on_activity(activity_id: EntityId, body: impl Into<String>) -> Self {
        Self {
            id: EntityId::new(),
            body: body.into(),
            task_id: None,
            activity_id: Some(activity_id),
            meta: SyncMeta::new_local(),
        }
    }
}

impl SyncableEntity for Note {
    const ENTITY_TYPE: EntityType = EntityType::Note;
    type Wire = NoteWire;

    fn id(&self) -> EntityId {
        self.id
    }

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn to_wire(&self) -> NoteWire {
        NoteWire {
            body: self.body.clone(),
            task_id: self.task_id,
            activity_id: self.activity_id,
        }
    }

    fn from_wire(id: EntityId, meta: SyncMeta, wire: NoteWire) -> Self {
        Self {
            id,
            body: wire.body,
            task_id: wire.task_id,
            activity_id: wire.activity_id,
            meta,
        }
    }

    fn apply_wire(&mut self, wire: NoteWire) {
        self.body = wire.body;
        self.task_id = wire.task_id;
        self.activity_id = wire.activity_id;
    }

    fn validate(wire: &NoteWire) -> Result<()> {
        if wire.task_id.is_none() && wire.activity_id.is_none() {
            return Err(Error::Decode(
                "note must belong to a task or an activity".to_string(),
            ));
        }
        Ok(())
    }
}
