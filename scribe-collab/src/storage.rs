//! Snapshot persistence for document rooms.
//!
//! One file per document under the store root:
//! ```text
//! <path>/<doc_id>.snap      bincode(SnapshotFile { .., compressed: lz4(full_state) })
//! <path>/<doc_id>.snap.tmp  in-flight write, renamed over the snapshot
//! ```
//!
//! A snapshot replaces the document's whole update history; no delta log is
//! kept beside it.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

const SNAPSHOT_EXT: &str = "snap";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding snapshot files; created on open.
    pub path: PathBuf,
    /// fsync each snapshot before renaming it into place.
    pub sync_writes: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("scribe_data"),
            sync_writes: true,
        }
    }
}

impl StoreConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no snapshot for document {0}")]
    NotFound(Uuid),

    #[error("snapshot for document {doc_id} is corrupt: {reason}")]
    Corrupt { doc_id: Uuid, reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotFile {
    format: u32,
    doc_id: Uuid,
    original_size: u64,
    checksum: u32,
    saved_at: u64,
    compressed: Vec<u8>,
}

/// Metadata of a saved snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub doc_id: Uuid,
    pub original_size: u64,
    pub compressed_size: u64,
    pub saved_at: u64,
}

/// Filesystem snapshot store.
#[derive(Debug)]
pub struct SnapshotStore {
    config: StoreConfig,
}

impl SnapshotStore {
    pub async fn open(config: StoreConfig) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(&config.path).await?;
        log::info!("Snapshot store opened at {}", config.path.display());
        Ok(Self { config })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Persist the full state of `doc_id`, replacing any earlier snapshot.
    pub async fn save_snapshot(&self, doc_id: Uuid, state: &[u8]) -> Result<SnapshotInfo, StoreError> {
        let saved_at = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let file = SnapshotFile {
            format: FORMAT_VERSION,
            doc_id,
            original_size: state.len() as u64,
            checksum: checksum(state),
            saved_at,
            compressed: lz4_flex::compress_prepend_size(state),
        };
        let encoded = bincode::serde::encode_to_vec(&file, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let target = self.snapshot_path(doc_id);
        let tmp = target.with_extension(format!("{SNAPSHOT_EXT}.tmp"));
        {
            use tokio::io::AsyncWriteExt;
            let mut out = tokio::fs::File::create(&tmp).await?;
            out.write_all(&encoded).await?;
            if self.config.sync_writes {
                out.sync_all().await?;
            }
        }
        tokio::fs::rename(&tmp, &target).await?;

        log::debug!(
            "Snapshot for {doc_id}: {} bytes -> {} bytes",
            state.len(),
            file.compressed.len()
        );
        Ok(SnapshotInfo {
            doc_id,
            original_size: file.original_size,
            compressed_size: file.compressed.len() as u64,
            saved_at,
        })
    }

    /// Load and verify the full state of `doc_id`.
    pub async fn load_snapshot(&self, doc_id: Uuid) -> Result<Vec<u8>, StoreError> {
        let bytes = match tokio::fs::read(self.snapshot_path(doc_id)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(doc_id))
            }
            Err(e) => return Err(e.into()),
        };
        let corrupt = |reason: String| StoreError::Corrupt { doc_id, reason };

        let (file, _): (SnapshotFile, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| corrupt(e.to_string()))?;
        if file.format != FORMAT_VERSION {
            return Err(corrupt(format!("unsupported format {}", file.format)));
        }
        if file.doc_id != doc_id {
            return Err(corrupt(format!("file belongs to {}", file.doc_id)));
        }
        let state = lz4_flex::decompress_size_prepended(&file.compressed)
            .map_err(|e| corrupt(e.to_string()))?;
        if state.len() as u64 != file.original_size || checksum(&state) != file.checksum {
            return Err(corrupt("checksum mismatch".into()));
        }
        Ok(state)
    }

    pub async fn has_snapshot(&self, doc_id: Uuid) -> bool {
        tokio::fs::try_exists(self.snapshot_path(doc_id))
            .await
            .unwrap_or(false)
    }

    /// Delete the snapshot of `doc_id`. Returns whether one existed.
    pub async fn remove(&self, doc_id: Uuid) -> Result<bool, StoreError> {
        match tokio::fs::remove_file(self.snapshot_path(doc_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Every document with a snapshot on disk.
    pub async fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.config.path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXT) {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn snapshot_path(&self, doc_id: Uuid) -> PathBuf {
        self.config.path.join(format!("{doc_id}.{SNAPSHOT_EXT}"))
    }
}

/// FNV-1a over the uncompressed state.
fn checksum(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in data {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_core::{DocumentReplica, TextOp};

    async fn store() -> (tempfile::TempDir, SnapshotStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(StoreConfig::at(dir.path().join("snapshots")))
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip_restores_replica() {
        let (_dir, store) = store().await;
        let doc_id = Uuid::new_v4();
        let mut replica = DocumentReplica::new(doc_id);
        replica
            .apply_local(&TextOp::insert(0, "Hello, persistence!"))
            .unwrap();

        let info = store.save_snapshot(doc_id, &replica.full_state()).await.unwrap();
        assert_eq!(info.doc_id, doc_id);
        assert!(store.has_snapshot(doc_id).await);

        let state = store.load_snapshot(doc_id).await.unwrap();
        let restored = DocumentReplica::from_state(doc_id, &state).unwrap();
        assert_eq!(restored.text(), "Hello, persistence!");
    }

    #[tokio::test]
    async fn test_missing_snapshot() {
        let (_dir, store) = store().await;
        let doc_id = Uuid::new_v4();
        assert!(matches!(
            store.load_snapshot(doc_id).await,
            Err(StoreError::NotFound(id)) if id == doc_id
        ));
        assert!(!store.remove(doc_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupted_snapshot_detected() {
        let (_dir, store) = store().await;
        let doc_id = Uuid::new_v4();
        store.save_snapshot(doc_id, b"some state bytes").await.unwrap();

        let path = store.snapshot_path(doc_id);
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            store.load_snapshot(doc_id).await,
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn test_overwrite_and_list() {
        let (_dir, store) = store().await;
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.save_snapshot(a, b"first").await.unwrap();
        store.save_snapshot(a, b"second").await.unwrap();
        store.save_snapshot(b, b"other").await.unwrap();

        assert_eq!(store.load_snapshot(a).await.unwrap(), b"second");
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(store.list_documents().await.unwrap(), expected);

        assert!(store.remove(a).await.unwrap());
        assert_eq!(store.list_documents().await.unwrap(), vec![b]);
    }

    #[test]
    fn test_checksum_differs() {
        assert_ne!(checksum(b"abc"), checksum(b"abd"));
        assert_eq!(checksum(b""), 0x811c_9dc5);
    }
}
