//! Remote data endpoint abstraction for fieldsync.
//!
//! This module provides the trait-based interface the sync engine uses to
//! talk to the relational backend, the append-only audit log the backend
//! keeps for every committed mutation, and an in-memory backend.
//!
//! # Design Principles
//! - Transport isolation: no wire-format or query-builder details leak into the engine
//! - Async operations: all backend calls are async
//! - Audit by trigger: audit records are written by the backend, never by clients
//! - Unified error semantics: consistent error taxonomy across backends

pub mod audit;
pub mod endpoint;
pub mod memory;

pub use audit::{AuditAction, AuditLog, AuditRecord};
pub use endpoint::{RemoteEndpoint, RemoteRow};
pub use memory::MemoryRemote;
