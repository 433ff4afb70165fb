//! Error taxonomy surfaced to editor bindings and applications.

use thiserror::Error;
use uuid::Uuid;

use crate::auth::AuthError;
use crate::permission::PermissionError;
use crate::protocol::ProtocolError;
use scribe_core::ReplicaError;

/// Errors from the synchronization core.
///
/// `AuthExpired` always coincides with a process-wide logout; `Forbidden` must
/// not be retried; `TransientNetwork` is retried by the channel and only shows
/// up here once a configured retry ceiling is exceeded.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("authentication expired")]
    AuthExpired,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("corrupt delta: {0}")]
    CorruptDelta(String),

    #[error("document {0} needs a full resync")]
    ResyncRequired(Uuid),

    #[error("document {0} was deleted")]
    DocumentDeleted(Uuid),

    #[error("document {0} not found")]
    NotFound(Uuid),

    #[error("channel closed")]
    Closed,

    #[error(transparent)]
    Replica(ReplicaError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Auth(AuthError),

    #[error(transparent)]
    Permission(PermissionError),
}

impl SyncError {
    /// Whether retrying the same call later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransientNetwork(_))
    }
}

impl From<ReplicaError> for SyncError {
    fn from(e: ReplicaError) -> Self {
        match e {
            ReplicaError::CorruptDelta(msg) => SyncError::CorruptDelta(msg),
            other => SyncError::Replica(other),
        }
    }
}

impl From<AuthError> for SyncError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Unauthenticated | AuthError::Expired => SyncError::AuthExpired,
            other => SyncError::Auth(other),
        }
    }
}

impl From<PermissionError> for SyncError {
    fn from(e: PermissionError) -> Self {
        match e {
            PermissionError::Unauthenticated => SyncError::AuthExpired,
            PermissionError::Forbidden(msg) => SyncError::Forbidden(msg),
            PermissionError::NotFound(id) => SyncError::NotFound(id),
            other => SyncError::Permission(other),
        }
    }
}
