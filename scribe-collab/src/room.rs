//! Server-side document rooms.
//!
//! A [`DocumentRoom`] holds the authoritative replica of one document and the
//! broadcast group its connections share. The [`RoomRegistry`] maps document
//! ids to rooms, loading snapshots on first join and, when a store is
//! configured, persisting and unloading a room once its last peer leaves.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, Frame};
use crate::protocol::{PeerInfo, PresenceFrame};
use crate::storage::{SnapshotStore, StoreError};
use scribe_core::{ApplyOutcome, DocumentReplica, PresenceState, ReplicaError};

/// Authoritative replica + broadcast group for one document.
pub struct DocumentRoom {
    document_id: Uuid,
    replica: Mutex<DocumentReplica>,
    broadcast: Arc<BroadcastGroup>,
    deleted: CancellationToken,
}

impl DocumentRoom {
    pub fn new(document_id: Uuid, broadcast_capacity: usize) -> Self {
        Self::with_replica(DocumentReplica::new(document_id), broadcast_capacity)
    }

    /// Room seeded from a full-state snapshot.
    pub fn load(document_id: Uuid, state: &[u8], broadcast_capacity: usize) -> Result<Self, ReplicaError> {
        let replica = DocumentReplica::from_state(document_id, state)?;
        Ok(Self::with_replica(replica, broadcast_capacity))
    }

    fn with_replica(replica: DocumentReplica, broadcast_capacity: usize) -> Self {
        Self {
            document_id: replica.document_id(),
            replica: Mutex::new(replica),
            broadcast: Arc::new(BroadcastGroup::new(broadcast_capacity)),
            deleted: CancellationToken::new(),
        }
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    pub fn broadcast(&self) -> &Arc<BroadcastGroup> {
        &self.broadcast
    }

    /// Merge a client delta into the authoritative replica.
    pub fn apply(&self, delta: &[u8]) -> Result<ApplyOutcome, ReplicaError> {
        self.replica.lock().apply_remote(delta)
    }

    /// Update the client at `state_vector` is missing.
    pub fn diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, ReplicaError> {
        self.replica.lock().compute_diff(state_vector)
    }

    pub fn state_vector(&self) -> Vec<u8> {
        self.replica.lock().state_vector()
    }

    pub fn full_state(&self) -> Vec<u8> {
        self.replica.lock().full_state()
    }

    pub fn text(&self) -> String {
        self.replica.lock().text()
    }

    /// Record presence for `session_id`; false when it was stale.
    pub fn set_presence(&self, session_id: Uuid, state: PresenceState) -> bool {
        self.replica.lock().set_presence(session_id, state)
    }

    pub fn clear_presence(&self, session_id: Uuid) -> Option<PresenceState> {
        self.replica.lock().clear_presence(session_id)
    }

    /// Current presence of every session, for newcomers.
    pub fn presence_frames(&self) -> Vec<PresenceFrame> {
        self.replica
            .lock()
            .presence()
            .iter()
            .map(|(session_id, state)| PresenceFrame::from_state(*session_id, state))
            .collect()
    }

    /// Signal every connection that the document is gone.
    pub fn mark_deleted(&self) {
        self.deleted.cancel();
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.is_cancelled()
    }

    /// Token cancelled by [`mark_deleted`](Self::mark_deleted).
    pub fn deleted(&self) -> CancellationToken {
        self.deleted.clone()
    }
}

/// Result of joining a room.
pub struct Membership {
    pub room: Arc<DocumentRoom>,
    pub receiver: broadcast::Receiver<Frame>,
    /// Whether this join loaded the room.
    pub created: bool,
}

/// Room registry: maps document ids to loaded rooms.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<Uuid, Arc<DocumentRoom>>>,
    broadcast_capacity: usize,
    store: Option<Arc<SnapshotStore>>,
}

impl RoomRegistry {
    pub fn new(broadcast_capacity: usize, store: Option<Arc<SnapshotStore>>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            broadcast_capacity,
            store,
        }
    }

    pub fn store(&self) -> Option<&Arc<SnapshotStore>> {
        self.store.as_ref()
    }

    /// Get or load the room for `doc_id` and register `peer` in it.
    ///
    /// Loading and registration happen under the registry lock so a room that
    /// is being unloaded can never gain a member.
    pub async fn join(&self, doc_id: Uuid, peer: PeerInfo) -> Result<Membership, StoreError> {
        let mut rooms = self.rooms.write().await;
        let (room, created) = match rooms.get(&doc_id) {
            Some(room) => (room.clone(), false),
            None => {
                let room = Arc::new(self.load_room(doc_id).await?);
                rooms.insert(doc_id, room.clone());
                log::info!("Room {doc_id} opened ({} loaded)", rooms.len());
                (room, true)
            }
        };
        let receiver = room.broadcast().add_peer(peer).await;
        Ok(Membership {
            room,
            receiver,
            created,
        })
    }

    /// Remove `session_id` from the room. If the room is now empty and a store
    /// is configured, snapshot it and unload it. Returns whether it was unloaded.
    pub async fn leave(&self, doc_id: Uuid, session_id: Uuid) -> Result<bool, StoreError> {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(&doc_id).cloned() else {
            return Ok(false);
        };
        room.broadcast().remove_peer(&session_id).await;
        room.clear_presence(session_id);

        let Some(store) = &self.store else {
            return Ok(false);
        };
        if room.broadcast().peer_count().await > 0 {
            return Ok(false);
        }

        rooms.remove(&doc_id);
        if !room.is_deleted() {
            let info = store.save_snapshot(doc_id, &room.full_state()).await?;
            log::info!(
                "Persisted snapshot for {doc_id} ({} bytes compressed); room closed",
                info.compressed_size
            );
        }
        Ok(true)
    }

    /// Mark a room deleted and drop it along with its snapshot.
    pub async fn remove(&self, doc_id: Uuid) -> Result<Option<Arc<DocumentRoom>>, StoreError> {
        let room = self.rooms.write().await.remove(&doc_id);
        if let Some(room) = &room {
            room.mark_deleted();
        }
        if let Some(store) = &self.store {
            store.remove(doc_id).await?;
        }
        Ok(room)
    }

    pub async fn get(&self, doc_id: Uuid) -> Option<Arc<DocumentRoom>> {
        self.rooms.read().await.get(&doc_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().copied().collect()
    }

    async fn load_room(&self, doc_id: Uuid) -> Result<DocumentRoom, StoreError> {
        let Some(store) = &self.store else {
            return Ok(DocumentRoom::new(doc_id, self.broadcast_capacity));
        };
        match store.load_snapshot(doc_id).await {
            Ok(state) => {
                let room = DocumentRoom::load(doc_id, &state, self.broadcast_capacity).map_err(
                    |e| StoreError::Corrupt {
                        doc_id,
                        reason: e.to_string(),
                    },
                )?;
                log::info!("Loaded persisted snapshot for {doc_id}");
                Ok(room)
            }
            Err(StoreError::NotFound(_)) => Ok(DocumentRoom::new(doc_id, self.broadcast_capacity)),
            Err(e) => Err(e),
        }
    }
}
