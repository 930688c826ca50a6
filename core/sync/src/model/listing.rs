use serde::{Deserialize, Serialize};

use fieldsync_common::{EntityId, EntityType, Result};

use crate::entity::{SyncMeta, SyncableEntity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    #[default]
    Draft,
    Active,
    UnderContract,
    Sold,
    Withdrawn,
}

/// A listing of a property for sale or rent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    id: EntityId,
    pub property_id: Option<EntityId>,
    pub title: String,
    pub status: ListingStatus,
    /// Asking price in minor currency units.
    pub price_cents: Option<i64>,
    meta: SyncMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingWire {
    #[serde(default)]
    pub property_id: Option<EntityId>,
    pub title: String,
    #[serde(default)]
    pub status: ListingStatus,
    #[serde(default)]
    pub price_cents: Option<i64>,
}

impl Listing {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: EntityId::new(),
            property_id: None,
            title: title.into(),
            status: ListingStatus::Draft,
            price_cents: None,
            meta: SyncMeta::new_local(),
        }
    }

    pub fn for_property(mut self, property_id: EntityId) -> Self {
        self.property_id = Some(property_id);
        self
    }
}

impl SyncableEntity for Listing {
    const ENTITY_TYPE: EntityType = EntityType::Listing;
    type Wire = ListingWire;

    fn id(&self) -> EntityId {
        self.id
    }

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn to_wire(&self) -> ListingWire {
        ListingWire {
            property_id: self.property_id,
            title: self.title.clone(),
            status: self.status,
            price_cents: self.price_cents,
        }
    }

    fn from_wire(id: EntityId, meta: SyncMeta, wire: ListingWire) -> Self {
        Self {
            id,
            property_id: wire.property_id,
            title: wire.title,
            status: wire.status,
            price_cents: wire.price_cents,
            meta,
        }
    }

    fn apply_wire(&mut self, wire: ListingWire) {
        self.property_id = wire.property_id;
        self.title = wire.title;
        self.status = wire.status;
        self.price_cents = wire.price_cents;
    }

    fn validate(wire: &ListingWire) -> Result<()> {
        super::require_text("title", &wire.title)?;
        if wire.price_cents.is_some_and(|p| p < 0) {
            return Err(fieldsync_common::Error::Decode(
                "price_cents must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}
