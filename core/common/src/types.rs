//! Common types used throughout fieldsync.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Stable, client-generated identifier of a synchronized record.
///
/// Identifiers are never reused; a restored row keeps the identifier of the
/// row it re-materializes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(Uuid);

impl EntityId {
    /// Generate a fresh identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an identifier from its hyphenated string form.
    ///
    /// # Errors
    /// - Returns error if `s` is not a valid UUID
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| crate::Error::InvalidInput(format!("invalid entity id '{}': {}", s, e)))
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EntityId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Identifier of the actor a mutation is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    /// Create a new ActorId from a string.
    ///
    /// # Preconditions
    /// - `id` must contain a non-whitespace character
    ///
    /// # Errors
    /// - Returns error if id is blank
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(crate::Error::InvalidInput(
                "ActorId cannot be empty".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A column referencing a row of another entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignKey {
    pub column: &'static str,
    pub references: EntityType,
}

const fn fk(column: &'static str, references: EntityType) -> ForeignKey {
    ForeignKey { column, references }
}

/// Kinds of synchronized records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    User,
    Property,
    Listing,
    Task,
    Activity,
    TaskAssignee,
    ActivityAssignee,
    Note,
}

impl EntityType {
    /// Referential parents before children; sync steps run in this order.
    pub const DEPENDENCY_ORDER: [EntityType; 8] = [
        EntityType::User,
        EntityType::Property,
        EntityType::Listing,
        EntityType::Task,
        EntityType::Activity,
        EntityType::TaskAssignee,
        EntityType::ActivityAssignee,
        EntityType::Note,
    ];

    /// Remote table name.
    pub fn table_name(&self) -> &'static str {
        match self {
            EntityType::User => "users",
            EntityType::Property => "properties",
            EntityType::Listing => "listings",
            EntityType::Task => "tasks",
            EntityType::Activity => "activities",
            EntityType::TaskAssignee => "task_assignees",
            EntityType::ActivityAssignee => "activity_assignees",
            EntityType::Note => "notes",
        }
    }

    /// Columns forming the natural uniqueness constraint, if any.
    pub fn natural_key_columns(&self) -> Option<&'static [&'static str]> {
        match self {
            EntityType::TaskAssignee => Some(&["task_id", "user_id"]),
            EntityType::ActivityAssignee => Some(&["activity_id", "user_id"]),
            _ => None,
        }
    }

    /// Foreign key columns. A null value in a listed column is allowed.
    pub fn foreign_keys(&self) -> &'static [ForeignKey] {
        const LISTING: &[ForeignKey] = &[fk("property_id", EntityType::Property)];
        const TASK: &[ForeignKey] = &[fk("listing_id", EntityType::Listing)];
        const ACTIVITY: &[ForeignKey] = &[fk("listing_id", EntityType::Listing)];
        const TASK_ASSIGNEE: &[ForeignKey] = &[
            fk("task_id", EntityType::Task),
            fk("user_id", EntityType::User),
        ];
        const ACTIVITY_ASSIGNEE: &[ForeignKey] = &[
            fk("activity_id", EntityType::Activity),
            fk("user_id", EntityType::User),
        ];
        const NOTE: &[ForeignKey] = &[
            fk("task_id", EntityType::Task),
            fk("activity_id", EntityType::Activity),
        ];

        match self {
            EntityType::User | EntityType::Property => &[],
            EntityType::Listing => LISTING,
            EntityType::Task => TASK,
            EntityType::Activity => ACTIVITY,
            EntityType::TaskAssignee => TASK_ASSIGNEE,
            EntityType::ActivityAssignee => ACTIVITY_ASSIGNEE,
            EntityType::Note => NOTE,
        }
    }

    /// Whether rows of this type are many-to-many link rows.
    pub fn is_link(&self) -> bool {
        self.natural_key_columns().is_some()
    }

    /// Position in [`EntityType::DEPENDENCY_ORDER`].
    pub fn dependency_rank(&self) -> usize {
        Self::DEPENDENCY_ORDER
            .iter()
            .position(|t| t == self)
            .unwrap_or(Self::DEPENDENCY_ORDER.len())
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

impl FromStr for EntityType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        EntityType::DEPENDENCY_ORDER
            .iter()
            .copied()
            .find(|t| {
                t.table_name() == normalized
                    || t.table_name().trim_end_matches('s') == normalized
                    || (normalized == "property" && *t == EntityType::Property)
                    || (normalized == "activity" && *t == EntityType::Activity)
            })
            .ok_or_else(|| crate::Error::InvalidInput(format!("unknown entity type '{}'", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_entity_id_parse() {
        let id = EntityId::new();
        let parsed = EntityId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
        assert!(EntityId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn test_actor_id_empty_fails() {
        assert!(ActorId::new("").is_err());
        assert!(ActorId::new("   ").is_err());
        assert_eq!(ActorId::new(" agent-7 ").unwrap().as_str(), "agent-7");
    }

    #[test]
    fn test_dependency_order_puts_parents_first() {
        for entity_type in EntityType::DEPENDENCY_ORDER {
            for key in entity_type.foreign_keys() {
                assert!(
                    key.references.dependency_rank() < entity_type.dependency_rank(),
                    "{} must sync after {}",
                    entity_type,
                    key.references
                );
            }
        }
    }

    #[test]
    fn test_entity_type_from_str() {
        assert_eq!("tasks".parse::<EntityType>().unwrap(), EntityType::Task);
        assert_eq!("task".parse::<EntityType>().unwrap(), EntityType::Task);
        assert_eq!("Task-Assignees".parse::<EntityType>().unwrap(), EntityType::TaskAssignee);
        assert_eq!("property".parse::<EntityType>().unwrap(), EntityType::Property);
        assert_eq!("activity".parse::<EntityType>().unwrap(), EntityType::Activity);
        assert!("widgets".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_link_types_have_natural_keys() {
        assert!(EntityType::TaskAssignee.is_link());
        assert!(EntityType::ActivityAssignee.is_link());
        assert!(!EntityType::Task.is_link());
    }

    proptest! {
        #[test]
        fn prop_actor_id_is_trimmed(raw in "[ ]{0,3}[a-z0-9-]{1,16}[ ]{0,3}") {
            let actor = ActorId::new(raw.clone()).unwrap();
            prop_assert_eq!(actor.as_str(), raw.trim());
        }
    }
}
