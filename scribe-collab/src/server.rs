//! WebSocket sync server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐  /ws/{doc}?token=…
//!            ├── handshake: AccountStore::validate ─► DocumentDirectory::resolve
//! Client B ──┘                        │
//!                                     ▼
//!                          DocumentRoom (doc_id)
//!                          ├── DocumentReplica (authoritative)
//!                          ├── BroadcastGroup ──► Client A, B, C
//!                          └── SnapshotStore (on room close)
//! ```
//!
//! Authorization is not a handshake-only affair: every write frame re-validates
//! the token and every frame re-resolves the sender's role at receipt time, so
//! a revocation takes effect on the very next frame.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::auth::{AccountStore, Identity};
use crate::broadcast::Frame;
use crate::config::{env_var, ConfigError};
use crate::directory::{DocumentDirectory, DocumentInfo};
use crate::permission::{PermissionError, Role};
use crate::protocol::{
    Denial, MessageType, PeerInfo, ProtocolError, RejectReason, SyncMessage, Welcome,
};
use crate::room::{DocumentRoom, RoomRegistry};
use crate::storage::{SnapshotStore, StoreConfig, StoreError};
use scribe_core::{ApplyOutcome, DocumentReplica, ReplicaError};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Connections beyond this are turned away before the handshake completes.
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// A connection silent for two intervals is dropped.
    pub heartbeat_interval_secs: u64,
    /// Snapshot directory (None = rooms stay in memory)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `SCRIBE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(addr) = env_var::<String>("SCRIBE_BIND_ADDR")? {
            config.bind_addr = addr;
        }
        if let Some(path) = env_var::<PathBuf>("SCRIBE_STORAGE_PATH")? {
            config.storage_path = Some(path);
        }
        if let Some(capacity) = env_var::<usize>("SCRIBE_BROADCAST_CAPACITY")? {
            config.broadcast_capacity = capacity;
        }
        if let Some(max) = env_var::<usize>("SCRIBE_MAX_PEERS")? {
            config.max_peers_per_room = max;
        }
        if let Some(secs) = env_var::<u64>("SCRIBE_HEARTBEAT_SECS")? {
            config.heartbeat_interval_secs = secs;
        }
        Ok(config)
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub denied_frames: u64,
    pub active_rooms: usize,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_handshakes: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    denied_frames: AtomicU64,
}

/// Who is on the other end of an accepted connection.
struct Peer {
    doc_id: Uuid,
    session_id: Uuid,
    identity: Identity,
    token: String,
    room: Arc<DocumentRoom>,
}

/// Why a connection loop ended.
enum Exit {
    Disconnected,
    Evicted,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    accounts: Arc<AccountStore>,
    directory: Arc<DocumentDirectory>,
    rooms: RoomRegistry,
    stats: AtomicServerStats,
    /// Cancelled to drop every current connection; replaced afterwards.
    evict: parking_lot::Mutex<CancellationToken>,
}

impl SyncServer {
    pub async fn new(
        config: ServerConfig,
        accounts: Arc<AccountStore>,
        directory: Arc<DocumentDirectory>,
    ) -> Result<Self, ServerError> {
        let store = match &config.storage_path {
            Some(path) => Some(Arc::new(SnapshotStore::open(StoreConfig::at(path)).await?)),
            None => None,
        };
        if let Some(store) = &store {
            let persisted = store.list_documents().await?;
            log::info!("{} persisted documents available", persisted.len());
        }

        Ok(Self {
            rooms: RoomRegistry::new(config.broadcast_capacity, store),
            config,
            accounts,
            directory,
            stats: AtomicServerStats::default(),
            evict: parking_lot::Mutex::new(CancellationToken::new()),
        })
    }

    /// Bind the configured address and serve forever.
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("Sync server listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub fn accounts(&self) -> &Arc<AccountStore> {
        &self.accounts
    }

    pub fn directory(&self) -> &Arc<DocumentDirectory> {
        &self.directory
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn stats(&self) -> ServerStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        ServerStats {
            total_connections: load(&self.stats.total_connections),
            active_connections: load(&self.stats.active_connections),
            rejected_handshakes: load(&self.stats.rejected_handshakes),
            total_messages: load(&self.stats.total_messages),
            total_bytes: load(&self.stats.total_bytes),
            denied_frames: load(&self.stats.denied_frames),
            active_rooms: self.rooms.room_count().await,
        }
    }

    /// Disconnect every peer without stopping the listener. Clients reconnect.
    pub fn drop_connections(&self) {
        let previous = std::mem::replace(&mut *self.evict.lock(), CancellationToken::new());
        previous.cancel();
        log::info!("Dropping all connections");
    }

    /// Delete a document (owner only) and tell everyone connected to it.
    pub async fn delete_document(
        &self,
        token: &str,
        doc_id: Uuid,
    ) -> Result<DocumentInfo, PermissionError> {
        let identity = self
            .accounts
            .validate(token)
            .await
            .map_err(|_| PermissionError::Unauthenticated)?;
        let info = self.directory.delete(identity.user_id, doc_id).await?;
        if let Err(e) = self.rooms.remove(doc_id).await {
            log::error!("Failed to drop storage for deleted document {doc_id}: {e}");
        }
        log::info!("Document {doc_id} deleted by {}", identity.username);
        Ok(info)
    }

    /// Current server-side text of a document, loaded or persisted.
    pub async fn document_text(&self, doc_id: Uuid) -> Option<String> {
        if let Some(room) = self.rooms.get(doc_id).await {
            return Some(room.text());
        }
        let state = self.rooms.store()?.load_snapshot(doc_id).await.ok()?;
        DocumentReplica::from_state(doc_id, &state)
            .ok()
            .map(|replica| replica.text())
    }

    /// Number of connections currently in the document's room.
    pub async fn peer_count(&self, doc_id: Uuid) -> usize {
        match self.rooms.get(doc_id).await {
            Some(room) => room.broadcast().peer_count().await,
            None => 0,
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let mut target: Option<Uri> = None;
        let mut ws = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                target = Some(request.uri().clone());
                Ok(response)
            },
        )
        .await?;
        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);

        let (peer, receiver) = match self.admit(target.as_ref()).await {
            Ok(admitted) => admitted,
            Err(Refusal::Reject(doc_id, reason)) => {
                log::warn!("Rejected handshake from {addr}: {reason:?}");
                self.stats.rejected_handshakes.fetch_add(1, Ordering::Relaxed);
                let msg = SyncMessage::reject(doc_id, reason)?;
                ws.send(Message::Binary(msg.encode()?.into())).await?;
                ws.close(None).await?;
                return Ok(());
            }
            Err(Refusal::Busy(doc_id)) => {
                log::warn!("Room {doc_id} is full; turning away {addr}");
                ws.close(None).await?;
                return Ok(());
            }
        };

        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        let result = self.session(ws, &peer, receiver, addr).await;
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        self.disconnect(&peer).await;
        result
    }

    /// Authenticate the handshake target and resolve the caller's role.
    async fn admit(&self, target: Option<&Uri>) -> Result<(Peer, broadcast::Receiver<Frame>), Refusal> {
        let (doc_id, token) = target
            .and_then(parse_target)
            .ok_or(Refusal::Reject(Uuid::nil(), RejectReason::NotFound))?;
        let token = token.ok_or(Refusal::Reject(doc_id, RejectReason::Unauthenticated))?;
        let identity = self
            .accounts
            .validate(&token)
            .await
            .map_err(|_| Refusal::Reject(doc_id, RejectReason::Unauthenticated))?;
        if !self.directory.exists(doc_id).await {
            return Err(Refusal::Reject(doc_id, RejectReason::NotFound));
        }
        if !self.directory.resolve(doc_id, identity.user_id).await.can_read() {
            return Err(Refusal::Reject(doc_id, RejectReason::Forbidden));
        }
        if self.peer_count(doc_id).await >= self.config.max_peers_per_room {
            return Err(Refusal::Busy(doc_id));
        }

        let session_id = Uuid::new_v4();
        let info = PeerInfo::with_id(session_id, identity.user_id, identity.username.clone());
        let membership = self
            .rooms
            .join(doc_id, info)
            .await
            .map_err(|e| {
                log::error!("Failed to open room {doc_id}: {e}");
                Refusal::Busy(doc_id)
            })?;
        let peer = Peer {
            doc_id,
            session_id,
            identity,
            token,
            room: membership.room,
        };
        Ok((peer, membership.receiver))
    }

    async fn session(
        &self,
        ws: WebSocketStream<TcpStream>,
        peer: &Peer,
        mut receiver: broadcast::Receiver<Frame>,
        addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let Peer {
            doc_id,
            session_id,
            room,
            ..
        } = peer;
        let (doc_id, session_id) = (*doc_id, *session_id);
        let (mut sink, mut source) = ws.split();

        // Resolved again here: a grant may have changed between admit and now.
        let role = self.directory.resolve(doc_id, peer.identity.user_id).await;
        let welcome = Welcome {
            session_id,
            user_id: peer.identity.user_id,
            role,
            state_vector: room.state_vector(),
        };
        send(&mut sink, &SyncMessage::welcome(doc_id, &welcome)?).await?;

        for existing in room.broadcast().peers().await {
            if existing.session_id != session_id {
                send(&mut sink, &SyncMessage::peer_joined(doc_id, &existing)?).await?;
            }
        }
        for frame in room.presence_frames() {
            send(&mut sink, &SyncMessage::presence(doc_id, &frame)?).await?;
        }
        let info = PeerInfo::with_id(session_id, peer.identity.user_id, peer.identity.username.clone());
        room.broadcast().broadcast(&SyncMessage::peer_joined(doc_id, &info)?)?;
        log::info!(
            "{} ({session_id}) joined document {doc_id} as {role} from {addr}",
            peer.identity.username
        );

        let evict = self.evict.lock().clone();
        let deleted = room.deleted();
        let heartbeat_every = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + heartbeat_every,
            heartbeat_every,
        );
        let mut last_seen = Instant::now();

        let exit = loop {
            tokio::select! {
                _ = evict.cancelled() => break Exit::Evicted,

                _ = deleted.cancelled() => {
                    send(&mut sink, &SyncMessage::document_deleted(doc_id)).await?;
                    break Exit::Evicted;
                }

                incoming = source.next() => {
                    let data = match incoming {
                        Some(Ok(Message::Binary(data))) => data,
                        Some(Ok(Message::Close(_))) | None => break Exit::Disconnected,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            log::debug!("WebSocket error from {addr}: {e}");
                            break Exit::Disconnected;
                        }
                    };
                    last_seen = Instant::now();
                    self.stats.total_messages.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .total_bytes
                        .fetch_add(data.len() as u64, Ordering::Relaxed);

                    let msg = match SyncMessage::decode(&data) {
                        Ok(msg) => msg,
                        Err(e) => {
                            log::warn!("Failed to decode message from {addr}: {e}");
                            continue;
                        }
                    };
                    if !self.handle_frame(msg, peer, &mut sink).await? {
                        break Exit::Evicted;
                    }
                }

                frame = receiver.recv() => match frame {
                    Ok(frame) if frame.origin == session_id => {}
                    Ok(frame) => {
                        sink.send(Message::Binary(frame.bytes.to_vec().into())).await?;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Session {session_id} lagged by {skipped} frames; requesting resync");
                        room.broadcast().record_lag(skipped);
                        send(&mut sink, &SyncMessage::sync_step1(Uuid::nil(), doc_id, room.state_vector())).await?;
                    }
                    Err(RecvError::Closed) => break Exit::Disconnected,
                },

                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > heartbeat_every * 2 {
                        log::info!("Session {session_id} timed out");
                        break Exit::Disconnected;
                    }
                }
            }
        };

        if let Exit::Evicted = exit {
            // Best effort; the peer may already be gone.
            let _ = sink.close().await;
        }
        Ok(())
    }

    /// Handle one client frame. Returns false when the connection must end.
    async fn handle_frame(
        &self,
        msg: SyncMessage,
        peer: &Peer,
        sink: &mut WsSink,
    ) -> Result<bool, ServerError> {
        let (doc_id, session_id, room) = (peer.doc_id, peer.session_id, &peer.room);

        match msg.msg_type {
            MessageType::Delta | MessageType::SyncStep2 => {
                if self.accounts.validate(&peer.token).await.is_err() {
                    log::warn!("Session {session_id}: token no longer valid");
                    send(sink, &SyncMessage::reject(doc_id, RejectReason::Unauthenticated)?).await?;
                    return Ok(false);
                }
                let role = self.directory.resolve(doc_id, peer.identity.user_id).await;
                if !role.can_write() {
                    return self.deny(sink, doc_id, msg.msg_type, role).await;
                }

                match room.apply(&msg.payload) {
                    Ok(ApplyOutcome::Duplicate) => {}
                    Ok(_) => {
                        let relay = SyncMessage::delta(session_id, doc_id, msg.clock, msg.payload);
                        room.broadcast().broadcast(&relay)?;
                    }
                    Err(ReplicaError::CorruptDelta(why)) => {
                        log::warn!("Session {session_id}: dropping corrupt delta: {why}");
                    }
                    Err(e) => log::warn!("Session {session_id}: delta rejected: {e}"),
                }
            }

            MessageType::SyncStep1 => {
                let role = self.directory.resolve(doc_id, peer.identity.user_id).await;
                if !role.can_read() {
                    return self.deny(sink, doc_id, msg.msg_type, role).await;
                }
                match room.diff(&msg.payload) {
                    Ok(diff) => {
                        send(sink, &SyncMessage::sync_step2(Uuid::nil(), doc_id, diff)).await?;
                    }
                    Err(e) => log::warn!("Session {session_id}: bad state vector: {e}"),
                }
            }

            MessageType::Presence => {
                let role = self.directory.resolve(doc_id, peer.identity.user_id).await;
                if !role.can_read() {
                    return self.deny(sink, doc_id, msg.msg_type, role).await;
                }
                let mut frame = match msg.presence_frame() {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::warn!("Session {session_id}: bad presence frame: {e}");
                        return Ok(true);
                    }
                };
                frame.session_id = session_id;
                if room.set_presence(session_id, frame.to_state()) {
                    room.broadcast().broadcast(&SyncMessage::presence(doc_id, &frame)?)?;
                }
            }

            MessageType::Ping => {
                send(sink, &SyncMessage::pong(session_id)).await?;
            }

            MessageType::Pong => {}

            other => {
                log::debug!("Session {session_id}: ignoring client {other:?} frame");
            }
        }
        Ok(true)
    }

    async fn deny(
        &self,
        sink: &mut WsSink,
        doc_id: Uuid,
        attempted: MessageType,
        role: Role,
    ) -> Result<bool, ServerError> {
        self.stats.denied_frames.fetch_add(1, Ordering::Relaxed);
        log::warn!("Denied {attempted:?} on {doc_id}: role is {role}");
        send(sink, &SyncMessage::denied(doc_id, &Denial { attempted, role })?).await?;
        Ok(role != Role::None)
    }

    async fn disconnect(&self, peer: &Peer) {
        // Presence is cleared before the announcement: anyone who was replayed
        // the old entry is already subscribed and sees the departure.
        match self.rooms.leave(peer.doc_id, peer.session_id).await {
            Ok(true) => log::info!("Room {} closed (empty)", peer.doc_id),
            Ok(false) => {}
            Err(e) => log::error!("Failed to persist document {}: {e}", peer.doc_id),
        }
        let left = SyncMessage::peer_left(peer.session_id, peer.doc_id);
        if let Err(e) = peer.room.broadcast().broadcast(&left) {
            log::warn!("Failed to announce departure of {}: {e}", peer.session_id);
        }
        log::info!(
            "{} ({}) left document {}",
            peer.identity.username,
            peer.session_id,
            peer.doc_id
        );
    }
}

enum Refusal {
    Reject(Uuid, RejectReason),
    Busy(Uuid),
}

/// `/ws/{doc_id}?token=…` → `(doc_id, token)`.
fn parse_target(uri: &Uri) -> Option<(Uuid, Option<String>)> {
    let doc = uri.path().strip_prefix("/ws/")?.trim_end_matches('/');
    let doc_id = Uuid::parse_str(doc).ok()?;
    let token = uri.query().and_then(|query| {
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "token")
            .map(|(_, value)| value.to_string())
            .filter(|value| !value.is_empty())
    });
    Some((doc_id, token))
}

async fn send(sink: &mut WsSink, msg: &SyncMessage) -> Result<(), ServerError> {
    sink.send(Message::Binary(msg.encode()?.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthConfig, Credentials};

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    async fn server(config: ServerConfig) -> SyncServer {
        let accounts = Arc::new(AccountStore::new(AuthConfig {
            bcrypt_cost: 4,
            ..AuthConfig::default()
        }));
        SyncServer::new(config, accounts, Arc::new(DocumentDirectory::new()))
            .await
            .unwrap()
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_parse_target() {
        let doc = Uuid::new_v4();
        let (id, token) = parse_target(&uri(&format!("/ws/{doc}?token=abc"))).unwrap();
        assert_eq!(id, doc);
        assert_eq!(token.as_deref(), Some("abc"));

        let (_, token) = parse_target(&uri(&format!("/ws/{doc}?x=1&token=t2"))).unwrap();
        assert_eq!(token.as_deref(), Some("t2"));

        let (_, token) = parse_target(&uri(&format!("/ws/{doc}"))).unwrap();
        assert!(token.is_none());

        assert!(parse_target(&uri("/ws/not-a-uuid?token=a")).is_none());
        assert!(parse_target(&uri(&format!("/other/{doc}"))).is_none());
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = server(ServerConfig::default()).await;
        assert_eq!(server.stats().await, ServerStats::default());
    }

    #[tokio::test]
    async fn test_server_with_storage_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshots");
        server(ServerConfig {
            storage_path: Some(path.clone()),
            ..ServerConfig::default()
        })
        .await;
        assert!(path.is_dir());
    }

    #[tokio::test]
    async fn test_delete_document_requires_owner() {
        let server = server(ServerConfig::default()).await;
        let owner = server
            .accounts()
            .register(&Credentials::new("owner", "pw"))
            .await
            .unwrap();
        let other = server
            .accounts()
            .register(&Credentials::new("other", "pw"))
            .await
            .unwrap();
        let doc = server.directory().create(owner.user_id, "Notes").await.id;

        assert!(matches!(
            server.delete_document(&other.token, doc).await,
            Err(PermissionError::Forbidden(_))
        ));
        assert!(matches!(
            server.delete_document("bogus", doc).await,
            Err(PermissionError::Unauthenticated)
        ));
        assert_eq!(server.delete_document(&owner.token, doc).await.unwrap().id, doc);
        assert!(!server.directory().exists(doc).await);
    }
}
