//! Common error types for fieldsync.

use thiserror::Error;

use crate::types::EntityType;

/// Top-level error type for fieldsync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Transient network failure (timeout, connection lost).
    #[error("Network error: {0}")]
    Network(String),

    /// The caller cancelled the operation or its deadline elapsed.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The backend refused access to an entity type.
    #[error("permission denied syncing {entity_type}: {message}")]
    PermissionDenied {
        entity_type: EntityType,
        message: String,
    },

    /// A uniqueness constraint would be violated.
    #[error("Unique conflict: {0}")]
    UniqueConflict(String),

    /// A referenced parent row does not exist.
    #[error("Foreign key missing: {0}")]
    ForeignKeyMissing(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The actor may not perform this operation.
    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    /// A remote payload could not be mapped to a local record.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Missing datastore or identity; sync cannot run at all.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Local datastore failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Whether the failure may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Cancelled(_) | Error::Io(_))
    }

    /// Whether the failure must abort a whole sync turn.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Configuration(_))
    }

    /// Stable code for the restore error taxonomy.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Error::UniqueConflict(_) => Some("UNIQUE_CONFLICT"),
            Error::ForeignKeyMissing(_) => Some("FK_MISSING"),
            Error::NotFound(_) => Some("NOT_FOUND"),
            Error::NotAuthorized(_) => Some("NOT_AUTHORIZED"),
            _ => None,
        }
    }

    /// Short, user-facing description used for status surfaces.
    pub fn summary(&self) -> String {
        match self {
            Error::Network(_) | Error::Cancelled(_) | Error::Io(_) => "network error".to_string(),
            Error::PermissionDenied { entity_type, .. } => {
                format!("permission denied syncing {}", entity_type)
            }
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
