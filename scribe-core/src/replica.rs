//! CRDT document replica.
//!
//! Wraps a `yrs` document holding a single rich-text sequence under
//! [`CONTENT_FIELD`]. Positions are measured in UTF-16 code units so that
//! offsets line up with browser-style editor surfaces.
//!
//! Every mutation produces a self-contained v1 update ("delta"). Remote deltas
//! merge commutatively; re-delivery is detected through the state vector and
//! reported as [`ApplyOutcome::Duplicate`] rather than an error.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use yrs::types::text::{Diff, YChange};
use yrs::types::Attrs;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Doc, GetString, OffsetKind, Options, Out, ReadTxn, StateVector, Text, Transact, Update,
    WriteTxn,
};

use crate::presence::{PresenceMap, PresenceState};

/// Name of the shared text root inside every document.
pub const CONTENT_FIELD: &str = "content";

/// Value of a single formatting mark (bold, link, heading level...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MarkValue {
    Flag(bool),
    Text(String),
    Number(f64),
    /// Removes the mark from the formatted range.
    Clear,
}

impl MarkValue {
    fn to_any(&self) -> Any {
        match self {
            MarkValue::Flag(b) => Any::Bool(*b),
            MarkValue::Text(s) => Any::String(Arc::from(s.as_str())),
            MarkValue::Number(n) => Any::Number(*n),
            MarkValue::Clear => Any::Null,
        }
    }

    fn from_any(value: &Any) -> Option<Self> {
        match value {
            Any::Bool(b) => Some(MarkValue::Flag(*b)),
            Any::String(s) => Some(MarkValue::Text(s.to_string())),
            Any::Number(n) => Some(MarkValue::Number(*n)),
            Any::BigInt(n) => Some(MarkValue::Number(*n as f64)),
            Any::Null => Some(MarkValue::Clear),
            _ => None,
        }
    }
}

/// Formatting marks keyed by name. Ordered so runs compare deterministically.
pub type Marks = BTreeMap<String, MarkValue>;

/// A local editing operation anchored at a logical position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TextOp {
    Insert { index: u32, text: String, marks: Marks },
    Delete { index: u32, len: u32 },
    Format { index: u32, len: u32, marks: Marks },
}

impl TextOp {
    /// Plain (unformatted) insertion.
    pub fn insert(index: u32, text: impl Into<String>) -> Self {
        TextOp::Insert {
            index,
            text: text.into(),
            marks: Marks::new(),
        }
    }

    pub fn delete(index: u32, len: u32) -> Self {
        TextOp::Delete { index, len }
    }

    /// Apply a single mark over `[index, index + len)`.
    pub fn format(index: u32, len: u32, mark: impl Into<String>, value: MarkValue) -> Self {
        let mut marks = Marks::new();
        marks.insert(mark.into(), value);
        TextOp::Format { index, len, marks }
    }

    fn validate(&self, current_len: u32) -> Result<(), ReplicaError> {
        match self {
            TextOp::Insert { index, text, .. } => {
                if text.is_empty() {
                    return Err(ReplicaError::EmptyOperation);
                }
                if *index > current_len {
                    return Err(ReplicaError::OutOfBounds {
                        index: *index,
                        len: current_len,
                    });
                }
            }
            TextOp::Delete { index, len } | TextOp::Format { index, len, .. } => {
                if *len == 0 {
                    return Err(ReplicaError::EmptyOperation);
                }
                let end = u64::from(*index) + u64::from(*len);
                if end > u64::from(current_len) {
                    return Err(ReplicaError::OutOfBounds {
                        index: *index,
                        len: current_len,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Outcome of merging a remote delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// New content was integrated.
    Applied,
    /// Everything in the delta was already known; nothing changed.
    Duplicate,
    /// The delta depends on updates not seen yet. It is held until they arrive.
    Pending,
}

/// A contiguous piece of text sharing the same marks.
#[derive(Debug, Clone, PartialEq)]
pub struct TextRun {
    pub text: String,
    pub marks: Marks,
}

/// Replica errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ReplicaError {
    #[error("corrupt delta: {0}")]
    CorruptDelta(String),

    #[error("invalid state vector: {0}")]
    InvalidStateVector(String),

    #[error("position {index} out of bounds (length {len})")]
    OutOfBounds { index: u32, len: u32 },

    #[error("empty operation")]
    EmptyOperation,
}

/// Encoded state vector of a replica that has seen nothing.
///
/// Diffing against it yields the full document state.
pub fn empty_state_vector() -> Vec<u8> {
    StateVector::default().encode_v1()
}

/// The CRDT state of one open document.
pub struct DocumentReplica {
    document_id: Uuid,
    doc: Doc,
    presence: PresenceMap,
    /// Upper bound of clocks referenced by deltas that could not integrate yet.
    pending: Option<StateVector>,
}

impl DocumentReplica {
    pub fn new(document_id: Uuid) -> Self {
        let doc = Doc::with_options(Options {
            offset_kind: OffsetKind::Utf16,
            ..Options::default()
        });
        // Materialize the root so read transactions always find it.
        doc.get_or_insert_text(CONTENT_FIELD);

        Self {
            document_id,
            doc,
            presence: PresenceMap::new(),
            pending: None,
        }
    }

    /// Build a replica from a full-state update (snapshot or server diff).
    pub fn from_state(document_id: Uuid, state: &[u8]) -> Result<Self, ReplicaError> {
        let mut replica = Self::new(document_id);
        replica.apply_remote(state)?;
        Ok(replica)
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    /// Apply a local operation and return the delta to broadcast.
    pub fn apply_local(&mut self, op: &TextOp) -> Result<Vec<u8>, ReplicaError> {
        let mut txn = self.doc.transact_mut();
        let content = txn.get_or_insert_text(CONTENT_FIELD);
        op.validate(content.len(&txn))?;

        match op {
            TextOp::Insert { index, text, marks } => {
                if marks.is_empty() {
                    content.insert(&mut txn, *index, text);
                } else {
                    content.insert_with_attributes(&mut txn, *index, text, to_attrs(marks));
                }
            }
            TextOp::Delete { index, len } => {
                content.remove_range(&mut txn, *index, *len);
            }
            TextOp::Format { index, len, marks } => {
                content.format(&mut txn, *index, *len, to_attrs(marks));
            }
        }

        Ok(txn.encode_update_v1())
    }

    /// Merge a delta received from a peer.
    ///
    /// Decoding happens before the document is touched, so a malformed delta
    /// leaves the replica exactly as it was.
    pub fn apply_remote(&mut self, delta: &[u8]) -> Result<ApplyOutcome, ReplicaError> {
        let update =
            Update::decode_v1(delta).map_err(|e| ReplicaError::CorruptDelta(e.to_string()))?;
        let incoming = update.state_vector();

        let before = self.raw_state_vector();
        let text_before = self.text();
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| ReplicaError::CorruptDelta(e.to_string()))?;
        }
        let after = self.raw_state_vector();

        if !covers(&after, &incoming) {
            let pending = self.pending.get_or_insert_with(StateVector::default);
            for (client, clock) in incoming.iter() {
                pending.set_max(*client, *clock);
            }
            log::debug!(
                "Delta for document {} is missing dependencies; holding it",
                self.document_id
            );
            return Ok(ApplyOutcome::Pending);
        }

        if self.pending.as_ref().is_some_and(|p| covers(&after, p)) {
            self.pending = None;
        }

        if covers(&before, &after) && covers(&after, &before) && self.text() == text_before {
            Ok(ApplyOutcome::Duplicate)
        } else {
            Ok(ApplyOutcome::Applied)
        }
    }

    /// Minimal update the peer described by `peer_state_vector` is missing.
    pub fn compute_diff(&self, peer_state_vector: &[u8]) -> Result<Vec<u8>, ReplicaError> {
        let sv = StateVector::decode_v1(peer_state_vector)
            .map_err(|e| ReplicaError::InvalidStateVector(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Encoded state vector of this replica.
    pub fn state_vector(&self) -> Vec<u8> {
        self.raw_state_vector().encode_v1()
    }

    /// Entire document state as one update.
    pub fn full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Whether some received delta is still waiting for its dependencies.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Visible plain text.
    pub fn text(&self) -> String {
        let txn = self.doc.transact();
        match txn.get_text(CONTENT_FIELD) {
            Some(content) => content.get_string(&txn),
            None => String::new(),
        }
    }

    /// Length in UTF-16 code units.
    pub fn len(&self) -> u32 {
        let txn = self.doc.transact();
        txn.get_text(CONTENT_FIELD)
            .map_or(0, |content| content.len(&txn))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visible content split into runs of identical formatting.
    pub fn runs(&self) -> Vec<TextRun> {
        let txn = self.doc.transact();
        let Some(content) = txn.get_text(CONTENT_FIELD) else {
            return Vec::new();
        };

        content
            .diff(&txn, YChange::identity)
            .into_iter()
            .filter_map(|chunk: Diff<YChange>| {
                let text = match chunk.insert {
                    Out::Any(Any::String(s)) => s.to_string(),
                    _ => return None,
                };
                let marks = chunk
                    .attributes
                    .map(|attrs| from_attrs(&attrs))
                    .unwrap_or_default();
                Some(TextRun { text, marks })
            })
            .collect()
    }

    /// Record a remote session's cursor. Returns `false` for stale states.
    pub fn set_presence(&mut self, session_id: Uuid, state: PresenceState) -> bool {
        self.presence.set(session_id, state)
    }

    pub fn clear_presence(&mut self, session_id: Uuid) -> Option<PresenceState> {
        self.presence.clear(session_id)
    }

    /// Drop every presence entry. Returns whether there were any.
    pub fn reset_presence(&mut self) -> bool {
        let had_entries = !self.presence.is_empty();
        self.presence.clear_all();
        had_entries
    }

    pub fn presence(&self) -> &PresenceMap {
        &self.presence
    }

    fn raw_state_vector(&self) -> StateVector {
        self.doc.transact().state_vector()
    }
}

impl std::fmt::Debug for DocumentReplica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentReplica")
            .field("document_id", &self.document_id)
            .field("len", &self.len())
            .field("presence", &self.presence.len())
            .field("pending", &self.pending.is_some())
            .finish()
    }
}

/// True when `sv` has seen at least every clock in `other`.
fn covers(sv: &StateVector, other: &StateVector) -> bool {
    other.iter().all(|(client, clock)| sv.get(client) >= *clock)
}

fn to_attrs(marks: &Marks) -> Attrs {
    marks
        .iter()
        .map(|(name, value)| (Arc::<str>::from(name.as_str()), value.to_any()))
        .collect()
}

fn from_attrs(attrs: &Attrs) -> Marks {
    attrs
        .iter()
        .filter_map(|(name, value)| Some((name.to_string(), MarkValue::from_any(value)?)))
        .collect()
}
