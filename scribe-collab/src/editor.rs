//! Editor binding: glue between an editor surface, a replica and a channel.
//!
//! The binding owns the [`DocumentReplica`] exclusively. Local input and
//! channel events are both processed through `&mut self`, so local and remote
//! application never interleave.

use std::sync::Arc;

use uuid::Uuid;

use crate::channel::{ChannelConfig, ChannelEvent, CloseReason, SyncChannel, TransportState};
use crate::error::SyncError;
use crate::permission::{PermissionGate, Role};
use crate::session::SessionContext;
use scribe_core::{
    ApplyOutcome, CursorColor, DocumentReplica, PresenceState, ReplicaError, Selection, TextOp,
    TextRun,
};

/// A remote participant's cursor as the surface should draw it.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCursor {
    pub session_id: Uuid,
    pub label: String,
    pub cursor: Option<u32>,
    pub selection: Option<Selection>,
    pub color: CursorColor,
}

/// The visible editor. Implemented by the UI layer.
pub trait EditorSurface: Send {
    /// Replace the visible content.
    fn render(&mut self, runs: &[TextRun]);

    fn render_cursors(&mut self, cursors: &[RemoteCursor]);

    fn set_read_only(&mut self, read_only: bool);

    fn set_status(&mut self, _state: TransportState) {}

    /// The document can no longer be edited; the UI should navigate away or
    /// ask the user to log in again.
    fn on_closed(&mut self, _reason: CloseReason) {}
}

/// Local user input.
#[derive(Debug, Clone, PartialEq)]
pub enum EditorInput {
    Edit(TextOp),
    Cursor {
        position: u32,
        selection: Option<Selection>,
    },
}

pub struct EditorBinding<S: EditorSurface> {
    replica: DocumentReplica,
    channel: SyncChannel,
    gate: Arc<PermissionGate>,
    surface: S,
    label: String,
    session_id: Option<Uuid>,
    presence_clock: u64,
    read_only: bool,
    awaiting_full_state: bool,
    closed: Option<CloseReason>,
}

impl<S: EditorSurface> EditorBinding<S> {
    /// Resolve the capability, then open a replica and its channel.
    ///
    /// Fails with `Forbidden` when the user has no access at all.
    pub async fn open(
        document_id: Uuid,
        session: SessionContext,
        gate: Arc<PermissionGate>,
        config: ChannelConfig,
        mut surface: S,
    ) -> Result<Self, SyncError> {
        let role = gate.refresh(document_id).await?;
        if !role.can_read() {
            return Err(SyncError::Forbidden(format!(
                "no access to document {document_id}"
            )));
        }

        let label = session.username().unwrap_or_default();
        let channel = SyncChannel::open(document_id, session, gate.clone(), config)?;
        let replica = DocumentReplica::new(document_id);

        let read_only = !role.can_write();
        surface.set_read_only(read_only);
        surface.render(&replica.runs());

        Ok(Self {
            replica,
            channel,
            gate,
            surface,
            label,
            session_id: None,
            presence_clock: 0,
            read_only,
            awaiting_full_state: false,
            closed: None,
        })
    }

    pub fn document_id(&self) -> Uuid {
        self.replica.document_id()
    }

    pub fn replica(&self) -> &DocumentReplica {
        &self.replica
    }

    pub fn text(&self) -> String {
        self.replica.text()
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn channel(&self) -> &SyncChannel {
        &self.channel
    }

    pub fn role(&self) -> Role {
        self.gate.cached(self.document_id())
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Our session id on the server, once the channel opened.
    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.closed
    }

    /// Apply local input.
    ///
    /// Edits are checked against the cached capability before they touch the
    /// replica; a denied edit leaves everything unchanged, flips the surface to
    /// read-only and returns `Forbidden`.
    pub fn handle_input(&mut self, input: EditorInput) -> Result<(), SyncError> {
        if let Some(reason) = self.closed {
            return Err(reason.to_error(self.document_id()).unwrap_or(SyncError::Closed));
        }
        match input {
            EditorInput::Edit(op) => {
                if let Err(e) = self.gate.check_write(self.document_id()) {
                    if matches!(e, SyncError::Forbidden(_)) {
                        self.set_read_only(true);
                    }
                    return Err(e);
                }
                let delta = self.replica.apply_local(&op)?;
                self.surface.render(&self.replica.runs());
                self.channel.send_delta(delta)
            }
            EditorInput::Cursor {
                position,
                selection,
            } => {
                self.presence_clock += 1;
                let state = PresenceState {
                    cursor: Some(position),
                    selection,
                    label: self.label.clone(),
                    clock: self.presence_clock,
                };
                self.channel.send_presence(&state)
            }
        }
    }

    /// Wait for the next channel event and process it.
    ///
    /// Returns the event, or `None` once the channel is gone.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        let event = self.channel.next_event().await?;
        if let Err(e) = self.process(event.clone()) {
            log::warn!("Document {}: {e}", self.document_id());
        }
        Some(event)
    }

    /// Process one channel event.
    pub fn process(&mut self, event: ChannelEvent) -> Result<(), SyncError> {
        match event {
            ChannelEvent::StateChanged(state) => {
                self.surface.set_status(state);
                // Departures during the outage are never announced to us.
                if state == TransportState::Reconnecting {
                    self.drop_remote_presence();
                }
                Ok(())
            }
            ChannelEvent::Closed(reason) => {
                self.closed = Some(reason);
                self.set_read_only(true);
                self.surface.on_closed(reason);
                Ok(())
            }
            _ if !self.channel.is_active() => {
                log::debug!("Document {}: ignoring event on inactive channel", self.document_id());
                Ok(())
            }
            ChannelEvent::Opened {
                role,
                session_id,
                server_state_vector,
            } => {
                self.session_id = Some(session_id);
                self.set_read_only(!role.can_write());
                self.awaiting_full_state = false;
                // The server replays current presence right after the Welcome.
                self.drop_remote_presence();
                self.resync(role, &server_state_vector)
            }
            ChannelEvent::ResyncRequested(server_state_vector) => {
                let role = self.role();
                self.resync(role, &server_state_vector)
            }
            ChannelEvent::RemoteDelta { peer_id, update } => {
                match self.replica.apply_remote(&update) {
                    Ok(ApplyOutcome::Applied) => self.surface.render(&self.replica.runs()),
                    Ok(ApplyOutcome::Duplicate) => {}
                    Ok(ApplyOutcome::Pending) => {
                        log::debug!("Delta from {peer_id} waits for missing dependencies");
                    }
                    Err(ReplicaError::CorruptDelta(why)) => {
                        log::warn!("Dropping corrupt delta from {peer_id}: {why}");
                    }
                    Err(e) => return Err(e.into()),
                }
                Ok(())
            }
            ChannelEvent::StateDiff(diff) => self.apply_state_diff(&diff),
            ChannelEvent::Presence(frame) => {
                if Some(frame.session_id) != self.session_id
                    && self.replica.set_presence(frame.session_id, frame.to_state())
                {
                    self.render_cursors();
                }
                Ok(())
            }
            ChannelEvent::PeerJoined(info) => {
                log::debug!("{} joined document {}", info.name, self.document_id());
                Ok(())
            }
            ChannelEvent::PeerLeft(session_id) => {
                if self.replica.clear_presence(session_id).is_some() {
                    self.render_cursors();
                }
                Ok(())
            }
            ChannelEvent::CapabilityChanged(role) => {
                self.set_read_only(!role.can_write());
                Ok(())
            }
        }
    }

    /// Refresh the cached capability from the server.
    pub async fn refresh_capability(&mut self) -> Result<Role, SyncError> {
        let role = self.gate.refresh(self.document_id()).await?;
        self.set_read_only(!role.can_write());
        Ok(role)
    }

    /// Tear down the channel. The replica stays readable.
    pub fn close(&mut self) {
        self.channel.close();
        if self.closed.is_none() {
            self.closed = Some(CloseReason::Requested);
        }
    }

    /// Push what the server lacks (writers only) and ask for what we lack.
    fn resync(&mut self, role: Role, server_state_vector: &[u8]) -> Result<(), SyncError> {
        if role.can_write() {
            let diff = self.replica.compute_diff(server_state_vector)?;
            self.channel.send_state_diff(diff)?;
        }
        self.channel.request_sync(self.replica.state_vector())
    }

    fn apply_state_diff(&mut self, diff: &[u8]) -> Result<(), SyncError> {
        match self.replica.apply_remote(diff) {
            Ok(ApplyOutcome::Pending) if !self.awaiting_full_state => {
                log::warn!(
                    "Document {}: resync diff left gaps, refetching full state",
                    self.document_id()
                );
                self.awaiting_full_state = true;
                self.channel.request_full_state()
            }
            Ok(ApplyOutcome::Pending) => Err(SyncError::ResyncRequired(self.document_id())),
            Ok(outcome) => {
                self.awaiting_full_state = false;
                if outcome == ApplyOutcome::Applied {
                    self.surface.render(&self.replica.runs());
                }
                Ok(())
            }
            Err(ReplicaError::CorruptDelta(why)) => {
                log::warn!("Document {}: dropping corrupt diff: {why}", self.document_id());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn set_read_only(&mut self, read_only: bool) {
        if self.read_only != read_only {
            self.read_only = read_only;
            self.surface.set_read_only(read_only);
        }
    }

    fn drop_remote_presence(&mut self) {
        if self.replica.reset_presence() {
            self.render_cursors();
        }
    }

    fn render_cursors(&mut self) {
        let own = self.session_id;
        let mut cursors: Vec<RemoteCursor> = self
            .replica
            .presence()
            .iter()
            .filter(|(id, _)| Some(**id) != own)
            .map(|(id, state)| RemoteCursor {
                session_id: *id,
                label: state.label.clone(),
                cursor: state.cursor,
                selection: state.selection,
                color: CursorColor::from_uuid(*id),
            })
            .collect();
        cursors.sort_by(|a, b| a.label.cmp(&b.label).then(a.session_id.cmp(&b.session_id)));
        self.surface.render_cursors(&cursors);
    }
}

impl<S: EditorSurface> std::fmt::Debug for EditorBinding<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditorBinding")
            .field("document_id", &self.document_id())
            .field("channel", &self.channel)
            .field("read_only", &self.read_only)
            .field("closed", &self.closed)
            .finish()
    }
}
