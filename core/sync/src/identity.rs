//! Authenticated actor lookup for sync turns and restores.

use std::sync::{PoisonError, RwLock};

use fieldsync_common::ActorId;

/// Source of the currently authenticated actor.
pub trait IdentityProvider: Send + Sync {
    /// `None` when nobody is signed in; sync turns then fail fast.
    fn current_actor(&self) -> Option<ActorId>;
}

/// A fixed identity.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity(Option<ActorId>);

impl StaticIdentity {
    pub fn new(actor: ActorId) -> Self {
        Self(Some(actor))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_actor(&self) -> Option<ActorId> {
        self.0.clone()
    }
}

/// Identity that changes as users sign in and out.
#[derive(Debug, Default)]
pub struct SessionIdentity {
    actor: RwLock<Option<ActorId>>,
}

impl SessionIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sign_in(&self, actor: ActorId) {
        *self.actor.write().unwrap_or_else(PoisonError::into_inner) = Some(actor);
    }

    pub fn sign_out(&self) {
        *self.actor.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl IdentityProvider for SessionIdentity {
    fn current_actor(&self) -> Option<ActorId> {
        self.actor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
