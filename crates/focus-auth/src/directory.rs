//! User directory seam.
//!
//! The hub never stores users. Refreshing credentials only needs to know
//! whether an identity still exists, which the surrounding system answers
//! through [`UserDirectory`].

use async_trait::async_trait;
use dashmap::DashSet;
use focus_protocol::Identity;

use crate::error::AuthResult;

/// Answers whether an identity belongs to a known user.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Whether the identity exists.
    async fn exists(&self, identity: &Identity) -> AuthResult<bool>;
}

/// In-process directory backed by a concurrent set.
#[derive(Debug, Default)]
pub struct MemoryUserDirectory {
    users: DashSet<Identity>,
}

impl MemoryUserDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an identity. Returns `false` if it was already known.
    pub fn insert(&self, identity: impl Into<Identity>) -> bool {
        self.users.insert(identity.into())
    }

    /// Forget an identity. Returns `true` if it was known.
    pub fn remove(&self, identity: &Identity) -> bool {
        self.users.remove(identity).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn exists(&self, identity: &Identity) -> AuthResult<bool> {
        Ok(self.users.contains(identity))
    }
}
