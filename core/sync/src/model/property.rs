use serde::{Deserialize, Serialize};

use fieldsync_common::{EntityId, EntityType, Result};

use crate::entity::{SyncMeta, SyncableEntity};

/// A physical property; listings hang off it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    id: EntityId,
    pub address: String,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    meta: SyncMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyWire {
    pub address: String,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
}

impl Property {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            id: EntityId::new(),
            address: address.into(),
            city: None,
            postal_code: None,
            meta: SyncMeta::new_local(),
        }
    }
}

impl SyncableEntity for Property {
    const ENTITY_TYPE: EntityType = EntityType::Property;
    type Wire = PropertyWire;

    fn id(&self) -> EntityId {
        self.id
    }

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn to_wire(&self) -> PropertyWire {
        PropertyWire {
            address: self.address.clone(),
            city: self.city.clone(),
            postal_code: self.postal_code.clone(),
        }
    }

    fn from_wire(id: EntityId, meta: SyncMeta, wire: PropertyWire) -> Self {
        Self {
            id,
            address: wire.address,
            city: wire.city,
            postal_code: wire.postal_code,
            meta,
        }
    }

    fn apply_wire(&mut self, wire: PropertyWire) {
        self.address = wire.address;
        self.city = wire.city;
        self.postal_code = wire.postal_code;
    }

    fn validate(wire: &PropertyWire) -> Result<()> {
        super::require_text("address", &wire.address)
    }
}
