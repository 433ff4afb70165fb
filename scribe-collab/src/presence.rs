//! Outbound presence coalescing.
//!
//! Cursor moves arrive far faster than they are worth sending. The coalescer
//! forwards the first update of an interval immediately and keeps only the
//! latest of the rest, flushing it once the interval has elapsed.

use std::time::{Duration, Instant};

use crate::protocol::PresenceFrame;

#[derive(Debug)]
pub struct PresenceCoalescer {
    interval: Duration,
    last_sent: Option<Instant>,
    pending: Option<PresenceFrame>,
}

impl PresenceCoalescer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
            pending: None,
        }
    }

    /// Offer a new local presence state. Returns it if it may go out now;
    /// otherwise it replaces whatever was waiting.
    pub fn offer(&mut self, frame: PresenceFrame) -> Option<PresenceFrame> {
        self.offer_at(frame, Instant::now())
    }

    /// The waiting frame, once its interval has elapsed.
    pub fn take_due(&mut self) -> Option<PresenceFrame> {
        self.take_due_at(Instant::now())
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// When the waiting frame becomes due, if any.
    pub fn next_due(&self) -> Option<Instant> {
        self.pending.as_ref()?;
        Some(self.last_sent.map_or_else(Instant::now, |t| t + self.interval))
    }

    /// Drop anything waiting, e.g. after the connection went away.
    pub fn clear(&mut self) {
        self.pending = None;
    }

    fn offer_at(&mut self, frame: PresenceFrame, now: Instant) -> Option<PresenceFrame> {
        if self.is_due(now) {
            self.pending = None;
            self.last_sent = Some(now);
            Some(frame)
        } else {
            self.pending = Some(frame);
            None
        }
    }

    fn take_due_at(&mut self, now: Instant) -> Option<PresenceFrame> {
        if self.pending.is_some() && self.is_due(now) {
            self.last_sent = Some(now);
            self.pending.take()
        } else {
            None
        }
    }

    fn is_due(&self, now: Instant) -> bool {
        self.last_sent
            .is_none_or(|sent| now.saturating_duration_since(sent) >= self.interval)
    }
}
