//! Binary protocol for CRDT delta synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬────────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ session_id │ doc_id   │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes   │ 16 bytes │ varint   │ variable │
//! └──────────┴────────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Handshake: the client connects to `/ws/{doc_id}?token=…` and sends nothing
//! until the server's first frame, which is either `Welcome` or `Reject`.
//! `Delta`, `SyncStep1` and `SyncStep2` carry raw yrs v1 payloads; every other
//! payload is itself bincode-encoded.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::permission::Role;
use scribe_core::{PresenceState, Selection};

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// State vector; the receiver answers with `SyncStep2`
    SyncStep1 = 1,
    /// Diff against a previously sent state vector
    SyncStep2 = 2,
    /// Incremental CRDT update
    Delta = 3,
    /// Cursor/selection presence
    Presence = 4,
    PeerJoined = 5,
    PeerLeft = 6,
    Ping = 7,
    Pong = 8,
    /// Handshake accepted
    Welcome = 9,
    /// Handshake refused, or token invalidated mid-session
    Reject = 10,
    /// A write or presence frame was refused for lack of capability
    Denied = 11,
    /// The document no longer exists; fatal
    DocumentDeleted = 12,
}

/// Peer identity as announced to the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
}

impl PeerInfo {
    /// New session for `user_id` with a fresh session id.
    pub fn new(user_id: Uuid, name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), user_id, name)
    }

    pub fn with_id(session_id: Uuid, user_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            session_id,
            user_id,
            name: name.into(),
        }
    }
}

/// Handshake acceptance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub role: Role,
    /// Encoded state vector of the server's replica at accept time.
    pub state_vector: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    Unauthenticated,
    Forbidden,
    NotFound,
}

/// Capability denial; `role` is the server's current view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Denial {
    pub attempted: MessageType,
    pub role: Role,
}

/// Presence frame `{session_id, cursor, selection, label, clock}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceFrame {
    pub session_id: Uuid,
    pub cursor: Option<u32>,
    pub selection: Option<Selection>,
    pub label: String,
    pub clock: u64,
}

impl PresenceFrame {
    pub fn from_state(session_id: Uuid, state: &PresenceState) -> Self {
        Self {
            session_id,
            cursor: state.cursor,
            selection: state.selection,
            label: state.label.clone(),
            clock: state.clock,
        }
    }

    pub fn to_state(&self) -> PresenceState {
        PresenceState {
            cursor: self.cursor,
            selection: self.selection,
            label: self.label.clone(),
            clock: self.clock,
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Sender session (nil for server-originated frames)
    pub session_id: Uuid,
    pub doc_id: Uuid,
    /// Per-sender monotonic counter
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn raw(msg_type: MessageType, session_id: Uuid, doc_id: Uuid, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            session_id,
            doc_id,
            clock,
            payload,
        }
    }

    pub fn delta(session_id: Uuid, doc_id: Uuid, clock: u64, update: Vec<u8>) -> Self {
        Self::raw(MessageType::Delta, session_id, doc_id, clock, update)
    }

    pub fn sync_step1(session_id: Uuid, doc_id: Uuid, state_vector: Vec<u8>) -> Self {
        Self::raw(MessageType::SyncStep1, session_id, doc_id, 0, state_vector)
    }

    pub fn sync_step2(session_id: Uuid, doc_id: Uuid, diff: Vec<u8>) -> Self {
        Self::raw(MessageType::SyncStep2, session_id, doc_id, 0, diff)
    }

    pub fn presence(doc_id: Uuid, frame: &PresenceFrame) -> Result<Self, ProtocolError> {
        Ok(Self::raw(
            MessageType::Presence,
            frame.session_id,
            doc_id,
            frame.clock,
            encode_payload(frame)?,
        ))
    }

    pub fn peer_joined(doc_id: Uuid, info: &PeerInfo) -> Result<Self, ProtocolError> {
        Ok(Self::raw(
            MessageType::PeerJoined,
            info.session_id,
            doc_id,
            0,
            encode_payload(info)?,
        ))
    }

    pub fn peer_left(session_id: Uuid, doc_id: Uuid) -> Self {
        Self::raw(MessageType::PeerLeft, session_id, doc_id, 0, Vec::new())
    }

    pub fn ping(session_id: Uuid) -> Self {
        Self::raw(MessageType::Ping, session_id, Uuid::nil(), 0, Vec::new())
    }

    pub fn pong(session_id: Uuid) -> Self {
        Self::raw(MessageType::Pong, session_id, Uuid::nil(), 0, Vec::new())
    }

    pub fn welcome(doc_id: Uuid, welcome: &Welcome) -> Result<Self, ProtocolError> {
        Ok(Self::raw(
            MessageType::Welcome,
            Uuid::nil(),
            doc_id,
            0,
            encode_payload(welcome)?,
        ))
    }

    pub fn reject(doc_id: Uuid, reason: RejectReason) -> Result<Self, ProtocolError> {
        Ok(Self::raw(
            MessageType::Reject,
            Uuid::nil(),
            doc_id,
            0,
            encode_payload(&reason)?,
        ))
    }

    pub fn denied(doc_id: Uuid, denial: &Denial) -> Result<Self, ProtocolError> {
        Ok(Self::raw(
            MessageType::Denied,
            Uuid::nil(),
            doc_id,
            0,
            encode_payload(denial)?,
        ))
    }

    pub fn document_deleted(doc_id: Uuid) -> Self {
        Self::raw(MessageType::DocumentDeleted, Uuid::nil(), doc_id, 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_payload(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_payload(bytes)
    }

    pub fn presence_frame(&self) -> Result<PresenceFrame, ProtocolError> {
        self.parse(MessageType::Presence)
    }

    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        self.parse(MessageType::PeerJoined)
    }

    pub fn welcome_payload(&self) -> Result<Welcome, ProtocolError> {
        self.parse(MessageType::Welcome)
    }

    pub fn reject_reason(&self) -> Result<RejectReason, ProtocolError> {
        self.parse(MessageType::Reject)
    }

    pub fn denial(&self) -> Result<Denial, ProtocolError> {
        self.parse(MessageType::Denied)
    }

    fn parse<T: DeserializeOwned>(&self, expected: MessageType) -> Result<T, ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::InvalidMessageType {
                expected,
                actual: self.msg_type,
            });
        }
        decode_payload(&self.payload)
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("expected {expected:?} frame, got {actual:?}")]
    InvalidMessageType {
        expected: MessageType,
        actual: MessageType,
    },
}
