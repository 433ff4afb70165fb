//! Ephemeral presence: who is where in the document.
//!
//! Presence never enters the CRDT history. Each session owns one entry that is
//! replaced wholesale (last-writer-wins on the sender's presence clock) and
//! dropped when the session disconnects.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Selection range in UTF-16 offsets. `anchor` may be after `head`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: u32,
    pub head: u32,
}

impl Selection {
    pub fn new(anchor: u32, head: u32) -> Self {
        Self { anchor, head }
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.head
    }

    /// Ordered `(start, end)` bounds.
    pub fn range(&self) -> (u32, u32) {
        (self.anchor.min(self.head), self.anchor.max(self.head))
    }
}

/// One session's cursor, selection and display label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
    pub cursor: Option<u32>,
    pub selection: Option<Selection>,
    pub label: String,
    /// Sender-side counter; higher wins.
    pub clock: u64,
}

impl PresenceState {
    /// Collapsed caret at `position`.
    pub fn caret(position: u32, label: impl Into<String>, clock: u64) -> Self {
        Self {
            cursor: Some(position),
            selection: None,
            label: label.into(),
            clock,
        }
    }
}

/// Last-writer-wins presence map keyed by session id.
#[derive(Debug, Clone, Default)]
pub struct PresenceMap {
    entries: HashMap<Uuid, PresenceState>,
}

impl PresenceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `state` unless an entry with a newer clock is already present.
    pub fn set(&mut self, session_id: Uuid, state: PresenceState) -> bool {
        match self.entries.get(&session_id) {
            Some(existing) if existing.clock > state.clock => {
                log::trace!(
                    "Stale presence for session {session_id} ({} < {})",
                    state.clock,
                    existing.clock
                );
                false
            }
            _ => {
                self.entries.insert(session_id, state);
                true
            }
        }
    }

    pub fn clear(&mut self, session_id: Uuid) -> Option<PresenceState> {
        self.entries.remove(&session_id)
    }

    pub fn get(&self, session_id: &Uuid) -> Option<&PresenceState> {
        self.entries.get(session_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Uuid, &PresenceState)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear_all(&mut self) {
        self.entries.clear();
    }
}

/// RGBA color for remote cursor/selection rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, saturated color derived from a session id.
    pub fn from_uuid(id: Uuid) -> Self {
        let hue = (id.as_u128() % 360) as f32 / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }

    /// `#rrggbb` form for text surfaces.
    pub fn to_hex(&self) -> String {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!(
            "#{:02x}{:02x}{:02x}",
            channel(self.r),
            channel(self.g),
            channel(self.b)
        )
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}
