//! fieldsync sync engine
//!
//! This crate keeps a local datastore consistent with a remote relational
//! backend, including:
//! - A request-coalescing queue that runs one sync turn at a time
//! - Delta fetches per entity type behind a persisted cursor
//! - Conflict resolution between local intent and remote state
//! - Retry with exponential backoff and a bounded retry budget
//! - Natural-key deduplication of link rows
//! - Point-in-time restore from the remote audit log

pub mod config;
pub mod conflict;
pub mod entity;
pub mod handler;
pub mod identity;
pub mod manager;
pub mod model;
pub mod queue;
pub mod restore;
pub mod retry;
pub mod status;
pub mod store;

// Re-export main types
pub use config::SyncConfig;
pub use conflict::{Authority, ConflictResolver, LocalReason};
pub use entity::{
    LinkEntity, MutationOrigin, RelationshipParent, SyncMeta, SyncState, SyncTurn, SyncableEntity,
};
pub use handler::{DownReport, EntitySyncHandler, LinkHandler, RecordHandler, SyncContext, UpReport};
pub use identity::{IdentityProvider, SessionIdentity, StaticIdentity};
pub use manager::SyncManager;
pub use queue::{RequestOutcome, SyncQueue};
pub use restore::RestoreService;
pub use retry::{DelayMode, RetryConfig, RetryCoordinator, RetrySummary};
pub use status::{SyncPhase, SyncStatus, SyncStatusSnapshot, TurnReport};
pub use store::{ChangeKind, EntityChange, LocalStore};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        let _config = SyncConfig::default();
        let _retry_config = RetryConfig::default();
        let _resolver = ConflictResolver::default();
        let _store = LocalStore::in_memory();
    }
}
