//! # scribe-collab — authenticated real-time sync for Scribe documents
//!
//! Connects [`scribe_core::DocumentReplica`]s over WebSocket, gated by
//! sessions and per-document roles.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐                         ┌─────────────────┐
//! │ EditorBinding │                         │   SyncServer    │
//! │  + replica    │   /ws/{doc}?token=…     │  rooms + auth   │
//! └──────┬────────┘                         └───────┬─────────┘
//!        │                                          │
//!        ▼                                          ▼
//! ┌───────────────┐   Welcome / Delta /     ┌─────────────────┐
//! │ SyncChannel   │ ◄─────────────────────► │ DocumentRoom    │
//! │ (reconnects)  │   Presence / Denied     │ replica + fanout│
//! └──────┬────────┘                         └───────┬─────────┘
//!        │                                          │
//!        ▼                                          ▼
//! SessionContext ─► PermissionGate         AccountStore · DocumentDirectory
//! ```
//!
//! ## Modules
//!
//! - [`session`] — login/logout, token lifecycle, logout notification
//! - [`permission`] — roles and the client-side capability cache
//! - [`channel`] — per-document transport with backoff and resync
//! - [`editor`] — binds an editor surface to a replica and a channel
//! - [`server`] — WebSocket sync server
//! - [`auth`], [`directory`] — server-side accounts, documents and grants
//! - [`protocol`] — binary wire format
//! - [`storage`] — compressed snapshots for unloaded rooms

pub mod auth;
pub mod backoff;
pub mod broadcast;
pub mod channel;
pub mod config;
pub mod directory;
pub mod editor;
pub mod error;
pub mod permission;
pub mod presence;
pub mod protocol;
pub mod room;
pub mod server;
pub mod session;
pub mod storage;

pub use auth::{AccountStore, AuthBackend, AuthConfig, AuthError, Credentials, Identity, Session};
pub use broadcast::{BroadcastGroup, BroadcastStats, Frame};
pub use channel::{
    ChannelConfig, ChannelEvent, CloseReason, OutboundQueue, SyncChannel, TransportState,
};
pub use config::ConfigError;
pub use directory::{AccessService, DocumentDirectory, DocumentInfo};
pub use editor::{EditorBinding, EditorInput, EditorSurface, RemoteCursor};
pub use error::SyncError;
pub use permission::{PermissionError, PermissionGate, PermissionRecord, PermissionSource, Role};
pub use protocol::{
    Denial, MessageType, PeerInfo, PresenceFrame, ProtocolError, RejectReason, SyncMessage,
    Welcome,
};
pub use room::{DocumentRoom, RoomRegistry};
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use session::{LogoutReason, SessionContext, SessionSnapshot};
pub use storage::{SnapshotStore, StoreConfig, StoreError};
