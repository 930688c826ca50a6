use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use fieldsync_common::{EntityId, EntityType, Result};

use crate::entity::{MutationOrigin, RelationshipParent, SyncMeta, SyncableEntity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Call,
    Email,
    Showing,
    Meeting,
    #[default]
    Other,
}

/// Something that happened around a listing: a showing, a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    id: EntityId,
    pub kind: ActivityKind,
    pub title: String,
    pub listing_id: Option<EntityId>,
    pub occurred_at: Option<DateTime<Utc>>,
    /// Users linked through local `activity_assignees` rows, whatever their sync state.
    #[serde(default)]
    assignees: BTreeSet<EntityId>,
    meta: SyncMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityWire {
    #[serde(default)]
    pub kind: ActivityKind,
    pub title: String,
    #[serde(default)]
    pub listing_id: Option<EntityId>,
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
}

impl Activity {
    pub fn new(kind: ActivityKind, title: impl Into<String>) -> Self {
        Self {
            id: EntityId::new(),
            kind,
            title: title.into(),
            listing_id: None,
            occurred_at: None,
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

impl SyncableEntity for Activity {
    const ENTITY_TYPE: EntityType = EntityType::Activity;
    type Wire = ActivityWire;

    fn id(&self) -> EntityId {
        self.id
    }

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn to_wire(&self) -> ActivityWire {
        ActivityWire {
            kind: self.kind,
            title: self.title.clone(),
            listing_id: self.listing_id,
            occurred_at: self.occurred_at,
        }
    }

    fn from_wire(id: EntityId, meta: SyncMeta, wire: ActivityWire) -> Self {
        Self {
            id,
            kind: wire.kind,
            title: wire.title,
            listing_id: wire.listing_id,
            occurred_at: wire.occurred_at,
            assignees: BTreeSet::new(),
            meta,
        }
    }

    fn apply_wire(&mut self, wire: ActivityWire) {
        self.kind = wire.kind;
        self.title = wire.title;
        self.listing_id = wire.listing_id;
        self.occurred_at = wire.occurred_at;
    }

    fn validate(wire: &ActivityWire) -> Result<()> {
        super::require_text("title", &wire.title)
    }

    fn merge_local_only(&mut self, stored: &Self) {
        self.assignees = stored.assignees.clone();
    }
}

impl RelationshipParent for Activity {
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
