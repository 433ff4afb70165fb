//! Client sync channel: one duplex WebSocket transport per open document.
//!
//! ```text
//!            open()
//!              │
//!              ▼
//!        ┌───────────┐  Welcome   ┌──────┐
//!        │CONNECTING │ ─────────► │ OPEN │ ◄─────────────┐
//!        └─────┬─────┘            └──┬───┘               │ Welcome
//!              │ drop / timeout      │ drop / heartbeat  │
//!              ▼                     ▼                   │
//!        ┌──────────────────────────────────┐            │
//!        │ RECONNECTING (backoff, jitter)   │ ───────────┘
//!        └─────────────────┬────────────────┘
//!                          │ close() · Reject · logout · DocumentDeleted
//!                          ▼
//!                      ┌────────┐
//!                      │ CLOSED │
//!                      └────────┘
//! ```
//!
//! The token is read from the [`SessionContext`] once per connection attempt.
//! Outbound writes are checked against the [`PermissionGate`] before they are
//! queued, so a reader never puts a delta on the wire.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::error::SyncError;
use crate::permission::{PermissionGate, Role};
use crate::presence::PresenceCoalescer;
use crate::protocol::{MessageType, PeerInfo, PresenceFrame, RejectReason, SyncMessage, Welcome};
use crate::session::{LogoutReason, SessionContext, SessionSnapshot};
use scribe_core::{empty_state_vector, PresenceState};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

/// Why a channel reached `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called.
    Requested,
    /// The session ended or was replaced.
    LoggedOut,
    /// The server rejected the token; the session was expired.
    AuthExpired,
    /// The user has no access to the document.
    Forbidden,
    NotFound,
    DocumentDeleted,
    /// The configured retry ceiling was reached.
    RetriesExhausted,
}

impl CloseReason {
    /// The taxonomy error matching this reason, if the close was not requested.
    pub fn to_error(self, document_id: Uuid) -> Option<SyncError> {
        match self {
            CloseReason::Requested => None,
            CloseReason::LoggedOut | CloseReason::AuthExpired => Some(SyncError::AuthExpired),
            CloseReason::Forbidden => Some(SyncError::Forbidden(format!(
                "access to document {document_id} denied"
            ))),
            CloseReason::NotFound => Some(SyncError::NotFound(document_id)),
            CloseReason::DocumentDeleted => Some(SyncError::DocumentDeleted(document_id)),
            CloseReason::RetriesExhausted => Some(SyncError::TransientNetwork(format!(
                "gave up reconnecting to document {document_id}"
            ))),
        }
    }
}

/// Notifications from the channel to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    StateChanged(TransportState),
    /// Handshake accepted. The owner should run the resync exchange.
    Opened {
        role: Role,
        session_id: Uuid,
        server_state_vector: Vec<u8>,
    },
    RemoteDelta { peer_id: Uuid, update: Vec<u8> },
    /// Answer to our `SyncStep1`.
    StateDiff(Vec<u8>),
    /// The server lost track of us and asks for a resync against this vector.
    ResyncRequested(Vec<u8>),
    Presence(PresenceFrame),
    PeerJoined(PeerInfo),
    PeerLeft(Uuid),
    /// The server refused a frame; `Role` is its current view.
    CapabilityChanged(Role),
    Closed(CloseReason),
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Base URL; the document id and token are appended per attempt.
    pub server_url: String,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// `None` retries forever.
    pub max_retries: Option<u32>,
    pub presence_interval: Duration,
    /// Maximum queued deltas while disconnected.
    pub outbound_capacity: usize,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090/ws".to_string(),
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
            max_retries: None,
            presence_interval: Duration::from_millis(50),
            outbound_capacity: 10_000,
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(15),
        }
    }
}

impl ChannelConfig {
    pub fn with_url(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }
}

/// Ordered queue of local deltas not yet handed to the socket.
pub struct OutboundQueue {
    queue: VecDeque<QueuedDelta>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedDelta {
    clock: u64,
    payload: Vec<u8>,
}

impl OutboundQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Returns false when the queue is full.
    pub fn enqueue(&mut self, clock: u64, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedDelta { clock, payload });
        true
    }

    /// Oldest entry, left in place until it was actually sent.
    pub fn front(&self) -> Option<(u64, &[u8])> {
        self.queue.front().map(|d| (d.clock, d.payload.as_slice()))
    }

    pub fn pop_front(&mut self) -> Option<(u64, Vec<u8>)> {
        self.queue.pop_front().map(|d| (d.clock, d.payload))
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|d| d.payload.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ControlFrame {
    SyncStep1(Vec<u8>),
    SyncStep2(Vec<u8>),
}

enum Outgoing {
    Control(ControlFrame),
    Presence(PresenceFrame),
    Delta(u64, Vec<u8>),
}

struct Outbox {
    deltas: OutboundQueue,
    /// Resync frames; only meaningful on the connection they were issued for.
    control: VecDeque<ControlFrame>,
    presence: PresenceCoalescer,
    ready_presence: Option<PresenceFrame>,
    clock: u64,
}

impl Outbox {
    fn next(&mut self) -> Option<Outgoing> {
        if let Some(frame) = self.control.pop_front() {
            return Some(Outgoing::Control(frame));
        }
        if let Some(frame) = self.ready_presence.take() {
            return Some(Outgoing::Presence(frame));
        }
        self.deltas
            .front()
            .map(|(clock, payload)| Outgoing::Delta(clock, payload.to_vec()))
    }
}

struct Shared {
    state: watch::Sender<TransportState>,
    outbox: Mutex<Outbox>,
    wake: Notify,
}

/// Handle to a running channel. Dropping it closes the channel.
pub struct SyncChannel {
    document_id: Uuid,
    session: SessionContext,
    gate: Arc<PermissionGate>,
    generation: u64,
    shared: Arc<Shared>,
    events: mpsc::Receiver<ChannelEvent>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    closed: bool,
}

impl SyncChannel {
    /// Start connecting to `document_id` under the current session.
    ///
    /// Fails with `AuthExpired` when nobody is logged in. Everything else
    /// (handshake rejection, network trouble) arrives as events.
    pub fn open(
        document_id: Uuid,
        session: SessionContext,
        gate: Arc<PermissionGate>,
        config: ChannelConfig,
    ) -> Result<Self, SyncError> {
        let session_rx = session.subscribe();
        let generation = session_rx.borrow().generation;
        if !session_rx.borrow().is_active() {
            return Err(SyncError::AuthExpired);
        }

        let (state, _) = watch::channel(TransportState::Connecting);
        let shared = Arc::new(Shared {
            state,
            outbox: Mutex::new(Outbox {
                deltas: OutboundQueue::new(config.outbound_capacity),
                control: VecDeque::new(),
                presence: PresenceCoalescer::new(config.presence_interval),
                ready_presence: None,
                clock: 0,
            }),
            wake: Notify::new(),
        });
        let (event_tx, events) = mpsc::channel(256);
        let cancel = CancellationToken::new();

        let worker = Worker {
            document_id,
            session: session.clone(),
            gate: gate.clone(),
            generation,
            config,
            shared: shared.clone(),
            events: event_tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(worker.run(session_rx));

        log::debug!("Channel for document {document_id} opened (generation {generation})");
        Ok(Self {
            document_id,
            session,
            gate,
            generation,
            shared,
            events,
            cancel,
            task: Some(task),
            closed: false,
        })
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    pub fn state(&self) -> TransportState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TransportState> {
        self.shared.state.subscribe()
    }

    /// Cached capability on this document.
    pub fn role(&self) -> Role {
        self.gate.cached(self.document_id)
    }

    /// Still running under the session it was opened with.
    pub fn is_active(&self) -> bool {
        !self.closed
            && self.state() != TransportState::Closed
            && self.session.generation() == self.generation
    }

    /// Queue a local delta. Rejected locally without WRITE.
    pub fn send_delta(&self, update: Vec<u8>) -> Result<(), SyncError> {
        self.ensure_usable()?;
        self.gate.check_write(self.document_id)?;
        {
            let mut outbox = self.shared.outbox.lock();
            outbox.clock += 1;
            let clock = outbox.clock;
            if !outbox.deltas.enqueue(clock, update) {
                return Err(SyncError::TransientNetwork(format!(
                    "outbound queue full ({} deltas)",
                    outbox.deltas.len()
                )));
            }
        }
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Publish local presence. Requires READ; coalesced per interval.
    pub fn send_presence(&self, state: &PresenceState) -> Result<(), SyncError> {
        self.ensure_usable()?;
        self.gate.check_read(self.document_id)?;
        {
            let mut outbox = self.shared.outbox.lock();
            // The server stamps the real session id.
            let frame = PresenceFrame::from_state(Uuid::nil(), state);
            if let Some(ready) = outbox.presence.offer(frame) {
                outbox.ready_presence = Some(ready);
            }
        }
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Ask the server for everything missing from `state_vector`.
    pub fn request_sync(&self, state_vector: Vec<u8>) -> Result<(), SyncError> {
        self.ensure_usable()?;
        self.push_control(ControlFrame::SyncStep1(state_vector));
        Ok(())
    }

    /// Push the diff the server is missing. Requires WRITE.
    pub fn send_state_diff(&self, diff: Vec<u8>) -> Result<(), SyncError> {
        self.ensure_usable()?;
        self.gate.check_write(self.document_id)?;
        self.push_control(ControlFrame::SyncStep2(diff));
        Ok(())
    }

    /// Refetch the whole document (diff against an empty state vector).
    pub fn request_full_state(&self) -> Result<(), SyncError> {
        self.request_sync(empty_state_vector())
    }

    /// Deltas waiting for the socket.
    pub fn pending_outbound(&self) -> usize {
        self.shared.outbox.lock().deltas.len()
    }

    /// State vectors of the `SyncStep1` requests not yet sent.
    #[cfg(test)]
    pub(crate) fn queued_sync_requests(&self) -> Vec<Vec<u8>> {
        self.shared
            .outbox
            .lock()
            .control
            .iter()
            .filter_map(|frame| match frame {
                ControlFrame::SyncStep1(sv) => Some(sv.clone()),
                ControlFrame::SyncStep2(_) => None,
            })
            .collect()
    }

    /// Next event, or `None` once the channel is closed and drained.
    ///
    /// After a logout only lifecycle events are delivered.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        loop {
            if self.closed {
                return None;
            }
            let event = self.events.recv().await?;
            if self.session.generation() != self.generation
                && !matches!(
                    event,
                    ChannelEvent::StateChanged(_) | ChannelEvent::Closed(_)
                )
            {
                log::trace!("Dropping {event:?} for a superseded session");
                continue;
            }
            return Some(event);
        }
    }

    /// Stop the channel now. Nothing is sent or delivered afterwards and any
    /// pending reconnect is abandoned.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.shared.state.send_replace(TransportState::Closed);
        self.shared.outbox.lock().deltas.clear();
        self.events.close();
        log::debug!("Channel for document {} closed", self.document_id);
    }

    fn ensure_usable(&self) -> Result<(), SyncError> {
        if self.closed || self.state() == TransportState::Closed {
            return Err(SyncError::Closed);
        }
        if self.session.generation() != self.generation {
            return Err(SyncError::AuthExpired);
        }
        Ok(())
    }

    fn push_control(&self, frame: ControlFrame) {
        self.shared.outbox.lock().control.push_back(frame);
        self.shared.wake.notify_one();
    }
}

impl Drop for SyncChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SyncChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncChannel")
            .field("document_id", &self.document_id)
            .field("state", &self.state())
            .field("generation", &self.generation)
            .finish()
    }
}

/// How one connection ended.
enum Ended {
    Fatal(CloseReason),
    Dropped(String),
    /// The owner went away.
    Abandoned,
}

struct Worker {
    document_id: Uuid,
    session: SessionContext,
    gate: Arc<PermissionGate>,
    generation: u64,
    config: ChannelConfig,
    shared: Arc<Shared>,
    events: mpsc::Sender<ChannelEvent>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self, session_rx: watch::Receiver<SessionSnapshot>) {
        let cancel = self.cancel.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {}
            reason = self.reconnect_loop(session_rx) => {
                if let Some(reason) = reason {
                    self.finish(reason).await;
                }
            }
        }
    }

    /// Returns the close reason, or `None` if the owner disappeared.
    async fn reconnect_loop(
        &self,
        mut session_rx: watch::Receiver<SessionSnapshot>,
    ) -> Option<CloseReason> {
        let mut backoff = Backoff::new(self.config.initial_backoff, self.config.max_backoff);
        let mut first_attempt = true;

        loop {
            let snapshot = session_rx.borrow_and_update().clone();
            if let Some(reason) = self.superseded(&snapshot) {
                return Some(reason);
            }
            let token = snapshot.token()?.to_string();

            let state = if first_attempt {
                TransportState::Connecting
            } else {
                TransportState::Reconnecting
            };
            first_attempt = false;
            if !self.set_state(state).await {
                return None;
            }

            match self.connect(&token).await {
                Ok((sink, source, welcome)) => {
                    backoff.reset();
                    match self.serve(sink, source, welcome, &token, &mut session_rx).await {
                        Ended::Fatal(reason) => return Some(reason),
                        Ended::Abandoned => return None,
                        Ended::Dropped(why) => {
                            log::warn!("Document {} connection dropped: {why}", self.document_id);
                        }
                    }
                }
                Err(Ended::Fatal(reason)) => return Some(reason),
                Err(Ended::Abandoned) => return None,
                Err(Ended::Dropped(why)) => {
                    log::debug!("Document {} connect attempt failed: {why}", self.document_id);
                }
            }

            if let Some(max) = self.config.max_retries {
                if backoff.attempts() >= max {
                    log::warn!(
                        "Document {}: giving up after {max} reconnect attempts",
                        self.document_id
                    );
                    return Some(CloseReason::RetriesExhausted);
                }
            }
            if !self.set_state(TransportState::Reconnecting).await {
                return None;
            }

            let delay = backoff.next_delay();
            log::debug!(
                "Document {}: reconnecting in {delay:?} (attempt {})",
                self.document_id,
                backoff.attempts()
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = session_rx.changed() => {
                    if changed.is_err() {
                        return Some(CloseReason::LoggedOut);
                    }
                    // Re-checked at the top of the loop.
                }
            }
        }
    }

    /// Dial and complete the handshake.
    async fn connect(&self, token: &str) -> Result<(WsSink, WsSource, Welcome), Ended> {
        let url = format!(
            "{}/{}?token={}",
            self.config.server_url.trim_end_matches('/'),
            self.document_id,
            token
        );
        let timeout = self.config.connect_timeout;

        let (stream, _) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url))
            .await
            .map_err(|_| Ended::Dropped("connect timed out".into()))?
            .map_err(|e| Ended::Dropped(e.to_string()))?;
        let (sink, mut source) = stream.split();

        let first = tokio::time::timeout(timeout, next_frame(&mut source))
            .await
            .map_err(|_| Ended::Dropped("handshake timed out".into()))?
            .ok_or_else(|| Ended::Dropped("closed during handshake".into()))?;

        match first.msg_type {
            MessageType::Welcome => {
                let welcome = first
                    .welcome_payload()
                    .map_err(|e| Ended::Dropped(e.to_string()))?;
                Ok((sink, source, welcome))
            }
            MessageType::Reject => {
                let reason = first
                    .reject_reason()
                    .map_err(|e| Ended::Dropped(e.to_string()))?;
                Err(Ended::Fatal(self.rejected(reason, token)))
            }
            MessageType::DocumentDeleted => Err(Ended::Fatal(CloseReason::DocumentDeleted)),
            other => Err(Ended::Dropped(format!("unexpected {other:?} during handshake"))),
        }
    }

    async fn serve(
        &self,
        mut sink: WsSink,
        mut source: WsSource,
        welcome: Welcome,
        token: &str,
        session_rx: &mut watch::Receiver<SessionSnapshot>,
    ) -> Ended {
        let session_id = welcome.session_id;
        self.gate.record(self.document_id, welcome.role);
        {
            let mut outbox = self.shared.outbox.lock();
            outbox.control.clear();
            outbox.presence.clear();
            outbox.ready_presence = None;
        }
        if !self.set_state(TransportState::Open).await {
            return Ended::Abandoned;
        }
        log::info!(
            "Document {} open as {} (session {session_id})",
            self.document_id,
            welcome.role
        );
        if !self
            .emit(ChannelEvent::Opened {
                role: welcome.role,
                session_id,
                server_state_vector: welcome.state_vector,
            })
            .await
        {
            return Ended::Abandoned;
        }

        if let Err(e) = self.flush(&mut sink, session_id).await {
            return Ended::Dropped(e.to_string());
        }

        let heartbeat_every = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + heartbeat_every,
            heartbeat_every,
        );
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();

        loop {
            let presence_due = self.shared.outbox.lock().presence.next_due();

            tokio::select! {
                biased;

                changed = session_rx.changed() => {
                    if changed.is_err() {
                        return Ended::Fatal(CloseReason::LoggedOut);
                    }
                    let snapshot = session_rx.borrow_and_update().clone();
                    if let Some(reason) = self.superseded(&snapshot) {
                        return Ended::Fatal(reason);
                    }
                }

                frame = source.next() => {
                    let msg = match frame {
                        Some(Ok(Message::Binary(data))) => data,
                        Some(Ok(Message::Close(_))) | None => {
                            return Ended::Dropped("server closed the connection".into());
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Ended::Dropped(e.to_string()),
                    };
                    last_seen = Instant::now();
                    let msg = match SyncMessage::decode(&msg) {
                        Ok(msg) => msg,
                        Err(e) => {
                            log::warn!("Document {}: dropping undecodable frame: {e}", self.document_id);
                            continue;
                        }
                    };
                    match self.handle_frame(msg, session_id, token, &mut sink).await {
                        Ok(()) => {}
                        Err(ended) => return ended,
                    }
                }

                _ = self.shared.wake.notified() => {
                    if let Err(e) = self.flush(&mut sink, session_id).await {
                        return Ended::Dropped(e.to_string());
                    }
                }

                _ = async {
                    match presence_due {
                        Some(due) => tokio::time::sleep_until(due.into()).await,
                        None => std::future::pending().await,
                    }
                }, if presence_due.is_some() => {
                    let due = self.shared.outbox.lock().presence.take_due();
                    if let Some(frame) = due {
                        self.shared.outbox.lock().ready_presence = Some(frame);
                        if let Err(e) = self.flush(&mut sink, session_id).await {
                            return Ended::Dropped(e.to_string());
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > heartbeat_every * 2 {
                        return Ended::Dropped("heartbeat timed out".into());
                    }
                    if let Err(e) = send(&mut sink, &SyncMessage::ping(session_id)).await {
                        return Ended::Dropped(e.to_string());
                    }
                }
            }
        }
    }

    async fn handle_frame(
        &self,
        msg: SyncMessage,
        session_id: Uuid,
        token: &str,
        sink: &mut WsSink,
    ) -> Result<(), Ended> {
        let event = match msg.msg_type {
            MessageType::Delta => {
                if msg.session_id == session_id {
                    return Ok(());
                }
                ChannelEvent::RemoteDelta {
                    peer_id: msg.session_id,
                    update: msg.payload,
                }
            }
            MessageType::SyncStep2 => ChannelEvent::StateDiff(msg.payload),
            MessageType::SyncStep1 => {
                log::info!("Document {}: server requested a resync", self.document_id);
                ChannelEvent::ResyncRequested(msg.payload)
            }
            MessageType::Presence => match msg.presence_frame() {
                Ok(frame) if frame.session_id != session_id => ChannelEvent::Presence(frame),
                Ok(_) => return Ok(()),
                Err(e) => {
                    log::warn!("Document {}: bad presence frame: {e}", self.document_id);
                    return Ok(());
                }
            },
            MessageType::PeerJoined => match msg.peer_info() {
                Ok(info) => ChannelEvent::PeerJoined(info),
                Err(e) => {
                    log::warn!("Document {}: bad join frame: {e}", self.document_id);
                    return Ok(());
                }
            },
            MessageType::PeerLeft => ChannelEvent::PeerLeft(msg.session_id),
            MessageType::Ping => {
                send(sink, &SyncMessage::pong(session_id))
                    .await
                    .map_err(|e| Ended::Dropped(e.to_string()))?;
                return Ok(());
            }
            MessageType::Pong | MessageType::Welcome => return Ok(()),
            MessageType::Denied => {
                let denial = match msg.denial() {
                    Ok(denial) => denial,
                    Err(e) => {
                        log::warn!("Document {}: bad denial frame: {e}", self.document_id);
                        return Ok(());
                    }
                };
                log::warn!(
                    "Document {}: server refused {:?}, role is now {}",
                    self.document_id,
                    denial.attempted,
                    denial.role
                );
                self.gate.apply_denial(self.document_id, denial.role);
                if denial.role == Role::None {
                    return Err(Ended::Fatal(CloseReason::Forbidden));
                }
                if denial.attempted == MessageType::Delta
                    || denial.attempted == MessageType::SyncStep2
                {
                    self.shared.outbox.lock().deltas.clear();
                }
                ChannelEvent::CapabilityChanged(denial.role)
            }
            MessageType::Reject => {
                let reason = msg.reject_reason().unwrap_or(RejectReason::Unauthenticated);
                return Err(Ended::Fatal(self.rejected(reason, token)));
            }
            MessageType::DocumentDeleted => {
                log::warn!("Document {} was deleted", self.document_id);
                return Err(Ended::Fatal(CloseReason::DocumentDeleted));
            }
        };

        if self.emit(event).await {
            Ok(())
        } else {
            Err(Ended::Abandoned)
        }
    }

    /// Send everything the outbox holds. Deltas leave the queue only once the
    /// socket accepted them.
    async fn flush(&self, sink: &mut WsSink, session_id: Uuid) -> Result<(), SyncError> {
        loop {
            let next = self.shared.outbox.lock().next();
            let Some(item) = next else {
                return Ok(());
            };
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let doc = self.document_id;
            let (msg, sent_delta) = match item {
                Outgoing::Control(ControlFrame::SyncStep1(sv)) => {
                    (SyncMessage::sync_step1(session_id, doc, sv), false)
                }
                Outgoing::Control(ControlFrame::SyncStep2(diff)) => {
                    (SyncMessage::sync_step2(session_id, doc, diff), false)
                }
                Outgoing::Presence(mut frame) => {
                    frame.session_id = session_id;
                    (SyncMessage::presence(doc, &frame)?, false)
                }
                Outgoing::Delta(clock, payload) => {
                    (SyncMessage::delta(session_id, doc, clock, payload), true)
                }
            };
            send(sink, &msg).await?;
            if sent_delta {
                self.shared.outbox.lock().deltas.pop_front();
            }
        }
    }

    /// Translate a rejection, expiring the session or downgrading the cache.
    fn rejected(&self, reason: RejectReason, token: &str) -> CloseReason {
        log::warn!("Document {}: server rejected us ({reason:?})", self.document_id);
        match reason {
            RejectReason::Unauthenticated => {
                self.session.expire(token);
                CloseReason::AuthExpired
            }
            RejectReason::Forbidden => {
                self.gate.apply_denial(self.document_id, Role::None);
                CloseReason::Forbidden
            }
            RejectReason::NotFound => {
                self.gate.forget(self.document_id);
                CloseReason::NotFound
            }
        }
    }

    fn superseded(&self, snapshot: &SessionSnapshot) -> Option<CloseReason> {
        if snapshot.generation == self.generation && snapshot.is_active() {
            return None;
        }
        Some(match snapshot.last_logout {
            Some(LogoutReason::Expired) if !snapshot.is_active() => CloseReason::AuthExpired,
            _ => CloseReason::LoggedOut,
        })
    }

    async fn set_state(&self, state: TransportState) -> bool {
        let changed = self.shared.state.send_if_modified(|current| {
            if *current == state || *current == TransportState::Closed {
                false
            } else {
                *current = state;
                true
            }
        });
        !changed || self.emit(ChannelEvent::StateChanged(state)).await
    }

    async fn finish(&self, reason: CloseReason) {
        self.shared.state.send_replace(TransportState::Closed);
        log::info!("Document {} channel closed: {reason:?}", self.document_id);
        let _ = self
            .emit(ChannelEvent::StateChanged(TransportState::Closed))
            .await;
        let _ = self.emit(ChannelEvent::Closed(reason)).await;
    }

    async fn emit(&self, event: ChannelEvent) -> bool {
        self.events.send(event).await.is_ok()
    }
}

async fn next_frame(source: &mut WsSource) -> Option<SyncMessage> {
    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Binary(data)) => match SyncMessage::decode(&data) {
                Ok(msg) => return Some(msg),
                Err(e) => log::warn!("Dropping undecodable handshake frame: {e}"),
            },
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

async fn send(sink: &mut WsSink, msg: &SyncMessage) -> Result<(), SyncError> {
    let encoded = msg.encode()?;
    sink.send(Message::Binary(encoded.into()))
        .await
        .map_err(|e| SyncError::TransientNetwork(e.to_string()))
}
