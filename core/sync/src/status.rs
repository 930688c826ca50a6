//! Observable sync status and per-turn reports.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use fieldsync_common::EntityType;

use crate::handler::{DownReport, UpReport};

/// Coarse engine status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Error,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Error => "error",
        })
    }
}

/// Step of the active turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    SyncingDown,
    SyncingUp,
    Finalizing,
}

/// What one sync turn did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TurnReport {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub phantoms_repaired: usize,
    pub down: BTreeMap<EntityType, DownReport>,
    pub up: BTreeMap<EntityType, UpReport>,
    /// Step failures; `None` marks a failure not tied to one entity type.
    pub errors: Vec<(Option<EntityType>, String)>,
    /// Set when the turn aborted before touching any entity.
    pub fatal: Option<String>,
}

impl TurnReport {
    pub fn is_clean(&self) -> bool {
        self.fatal.is_none() && self.errors.is_empty()
    }

    /// Number of entities pushed across all types.
    pub fn pushed(&self) -> usize {
        self.up.values().map(|r| r.pushed).sum()
    }

    pub fn failed(&self) -> usize {
        self.up.values().map(|r| r.failed).sum()
    }

    pub fn applied(&self) -> usize {
        self.down.values().map(|r| r.applied).sum()
    }

    /// First user-facing error of the turn.
    pub fn first_error(&self) -> Option<String> {
        if let Some(fatal) = &self.fatal {
            return Some(fatal.clone());
        }
        if let Some((_, e)) = self.errors.first() {
            return Some(e.clone());
        }
        self.up
            .values()
            .flat_map(|r| r.errors.iter())
            .next()
            .cloned()
    }

    /// Whether the down and up steps of `entity_type` both completed.
    pub fn type_completed(&self, entity_type: EntityType) -> bool {
        self.down.contains_key(&entity_type)
            && self.up.contains_key(&entity_type)
            && !self.errors.iter().any(|(t, _)| *t == Some(entity_type))
    }
}

/// Point-in-time view of the engine, published on every change.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStatusSnapshot {
    pub status: SyncStatus,
    pub phase: SyncPhase,
    pub last_sync_error: Option<String>,
    pub last_turn: Option<TurnReport>,
}
