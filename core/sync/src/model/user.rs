use serde::{Deserialize, Serialize};

use fieldsync_common::{EntityId, EntityType, Result};

use crate::entity::{SyncMeta, SyncableEntity};

/// A field agent or office user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    id: EntityId,
    pub name: String,
    pub email: Option<String>,
    meta: SyncMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserWire {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

impl User {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: EntityId::new(),
            name: name.into(),
            email: None,
            meta: SyncMeta::new_local(),
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

impl SyncableEntity for User {
    const ENTITY_TYPE: EntityType = EntityType::User;
    type Wire = UserWire;

    fn id(&self) -> EntityId {
        self.id
    }

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn to_wire(&self) -> UserWire {
        UserWire {
            name: self.name.clone(),
            email: self.email.clone(),
        }
    }

    fn from_wire(id: EntityId, meta: SyncMeta, wire: UserWire) -> Self {
        Self {
            id,
            name: wire.name,
            email: wire.email,
            meta,
        }
    }

    fn apply_wire(&mut self, wire: UserWire) {
        self.name = wire.name;
        self.email = wire.email;
    }

    fn validate(wire: &UserWire) -> Result<()> {
        super::require_text("name", &wire.name)
    }
}
