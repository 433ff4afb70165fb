//! # scribe-core — replicated document model for Scribe
//!
//! A [`DocumentReplica`] is the CRDT state of one open document: a rich-text
//! sequence backed by a `yrs` document plus an ephemeral presence map.
//! It has no network dependency; every operation is synchronous and bounded.
//!
//! ```text
//! local op ──► apply_local ──► update delta ──► (network)
//!                                                   │
//! (network) ──► apply_remote ◄──────────────────────┘
//!                   │
//!                   ▼
//!            text runs + presence ──► editor surface
//! ```
//!
//! ## Modules
//!
//! - [`replica`] — text CRDT, delta production/merge, state-vector diffing
//! - [`presence`] — last-writer-wins cursor/selection map and cursor colors

pub mod presence;
pub mod replica;

pub use presence::{CursorColor, PresenceMap, PresenceState, Selection};
pub use replica::{
    empty_state_vector, ApplyOutcome, DocumentReplica, MarkValue, Marks, ReplicaError, TextOp,
    TextRun, CONTENT_FIELD,
};

/// Stable document identifier.
pub type DocumentId = uuid::Uuid;

/// Resolved account identifier.
pub type UserId = uuid::Uuid;

/// One connection of one user to one document.
pub type SessionId = uuid::Uuid;
