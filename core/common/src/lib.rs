//! Common utilities and types shared across fieldsync crates.
//!
//! This module provides the error taxonomy and the identifier types used by
//! the remote boundary and the sync engine alike.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{ActorId, EntityId, EntityType, ForeignKey};
