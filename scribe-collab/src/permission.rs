//! Capabilities and the client-side permission gate.
//!
//! The server's [`DocumentDirectory`](crate::directory::DocumentDirectory) is
//! the source of truth. [`PermissionGate`] keeps an advisory per-document cache
//! for UI gating and for filtering outbound writes before they hit the wire.
//! Cached roles are tagged with the session generation that produced them, so
//! a logout invalidates the whole cache without anyone walking it.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::SyncError;
use crate::session::SessionContext;

/// Access level of one user on one document. Ordered by privilege.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum Role {
    #[default]
    None,
    Read,
    Write,
    Owner,
}

impl Role {
    pub fn can_read(self) -> bool {
        self >= Role::Read
    }

    pub fn can_write(self) -> bool {
        self >= Role::Write
    }

    pub fn is_owner(self) -> bool {
        self == Role::Owner
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::None => "NONE",
            Role::Read => "READ",
            Role::Write => "WRITE",
            Role::Owner => "OWNER",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = PermissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(Role::None),
            "READ" => Ok(Role::Read),
            "WRITE" => Ok(Role::Write),
            "OWNER" => Ok(Role::Owner),
            _ => Err(PermissionError::UnknownRole(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PermissionError {
    #[error("authentication required")]
    Unauthenticated,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("document {0} not found")]
    NotFound(Uuid),

    #[error("role {0} cannot be granted")]
    InvalidRole(Role),

    #[error("unknown role {0:?}")]
    UnknownRole(String),
}

/// One `(document, user) → role` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRecord {
    pub document_id: Uuid,
    pub user_id: Uuid,
    pub role: Role,
}

/// Authoritative permission endpoint, addressed with the caller's bearer token.
pub trait PermissionSource: Send + Sync {
    fn resolve<'a>(
        &'a self,
        token: &'a str,
        document_id: Uuid,
        user_id: Uuid,
    ) -> BoxFuture<'a, Result<Role, PermissionError>>;

    fn grant<'a>(
        &'a self,
        token: &'a str,
        document_id: Uuid,
        target: Uuid,
        role: Role,
    ) -> BoxFuture<'a, Result<(), PermissionError>>;

    fn revoke<'a>(
        &'a self,
        token: &'a str,
        document_id: Uuid,
        target: Uuid,
    ) -> BoxFuture<'a, Result<(), PermissionError>>;

    fn list<'a>(
        &'a self,
        token: &'a str,
        document_id: Uuid,
    ) -> BoxFuture<'a, Result<Vec<PermissionRecord>, PermissionError>>;
}

#[derive(Debug, Clone, Copy)]
struct CachedRole {
    role: Role,
    generation: u64,
}

/// Client-side permission gate for the current session.
pub struct PermissionGate {
    session: SessionContext,
    source: Arc<dyn PermissionSource>,
    cache: RwLock<HashMap<Uuid, CachedRole>>,
}

impl PermissionGate {
    pub fn new(session: SessionContext, source: Arc<dyn PermissionSource>) -> Self {
        Self {
            session,
            source,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    /// Ask the server for `user_id`'s role on `document_id`.
    pub async fn resolve(&self, document_id: Uuid, user_id: Uuid) -> Result<Role, SyncError> {
        let token = self.token()?;
        let result = self.source.resolve(&token, document_id, user_id).await;
        self.settle(&token, result)
    }

    /// Re-resolve the current user's role and update the cache.
    pub async fn refresh(&self, document_id: Uuid) -> Result<Role, SyncError> {
        let user_id = self.session.identity().ok_or(SyncError::AuthExpired)?;
        let role = self.resolve(document_id, user_id).await?;
        self.record(document_id, role);
        log::debug!("Capability for document {document_id} refreshed: {role}");
        Ok(role)
    }

    /// Cached capability for the current session; `None` when unknown.
    pub fn cached(&self, document_id: Uuid) -> Role {
        let generation = self.session.generation();
        self.cache
            .read()
            .get(&document_id)
            .filter(|entry| entry.generation == generation)
            .map_or(Role::None, |entry| entry.role)
    }

    /// Pre-send filter for writes.
    pub fn check_write(&self, document_id: Uuid) -> Result<(), SyncError> {
        self.check(document_id, Role::Write)
    }

    /// Pre-send filter for presence.
    pub fn check_read(&self, document_id: Uuid) -> Result<(), SyncError> {
        self.check(document_id, Role::Read)
    }

    /// Store a role learned from the server (handshake or refresh).
    pub fn record(&self, document_id: Uuid, role: Role) {
        let generation = self.session.generation();
        self.cache
            .write()
            .insert(document_id, CachedRole { role, generation });
    }

    /// The server rejected something: its view replaces the cached one.
    pub fn apply_denial(&self, document_id: Uuid, role: Role) {
        let previous = self.cached(document_id);
        self.record(document_id, role);
        if previous != role {
            log::warn!("Capability for document {document_id} downgraded {previous} -> {role}");
        }
    }

    pub fn forget(&self, document_id: Uuid) {
        self.cache.write().remove(&document_id);
    }

    pub fn clear(&self) {
        self.cache.write().clear();
    }

    /// Grant `role` on `document_id` to `target`. Caller must be OWNER.
    pub async fn grant(&self, document_id: Uuid, target: Uuid, role: Role) -> Result<(), SyncError> {
        let token = self.token()?;
        let result = self.source.grant(&token, document_id, target, role).await;
        self.settle(&token, result)
    }

    /// Remove `target`'s access. Caller must be OWNER; the owner is untouchable.
    pub async fn revoke(&self, document_id: Uuid, target: Uuid) -> Result<(), SyncError> {
        let token = self.token()?;
        let result = self.source.revoke(&token, document_id, target).await;
        self.settle(&token, result)
    }

    pub async fn list(&self, document_id: Uuid) -> Result<Vec<PermissionRecord>, SyncError> {
        let token = self.token()?;
        let result = self.source.list(&token, document_id).await;
        self.settle(&token, result)
    }

    fn check(&self, document_id: Uuid, needed: Role) -> Result<(), SyncError> {
        if !self.session.is_authenticated() {
            return Err(SyncError::AuthExpired);
        }
        let role = self.cached(document_id);
        if role >= needed {
            Ok(())
        } else {
            Err(SyncError::Forbidden(format!(
                "{needed} access to document {document_id} denied (have {role})"
            )))
        }
    }

    fn token(&self) -> Result<String, SyncError> {
        self.session.current_token().ok_or(SyncError::AuthExpired)
    }

    /// Map a source result, turning authentication failures into a logout.
    fn settle<T>(&self, token: &str, result: Result<T, PermissionError>) -> Result<T, SyncError> {
        match result {
            Ok(value) => Ok(value),
            Err(PermissionError::Unauthenticated) => {
                self.session.expire(token);
                Err(SyncError::AuthExpired)
            }
            Err(e) => Err(e.into()),
        }
    }
}
