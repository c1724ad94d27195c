//! Checkpoints of verified document state.
//!
//! Snapshots are bincode-encoded, then LZ4 block-compressed with the
//! original size prepended. The store keeps the newest checkpoint per
//! document; durable storage is left to other implementations of
//! [`CheckpointStore`].

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use concord_core::Snapshot;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

/// Sink for verified snapshots.
pub trait CheckpointStore: Send + Sync {
    fn checkpoint(&self, document_id: Uuid, snapshot: &Snapshot) -> Result<(), StoreError>;

    fn latest(&self, document_id: Uuid) -> Result<Option<Snapshot>, StoreError>;
}

/// A compressed snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCheckpoint {
    pub version: u64,
    /// Encoded size before compression
    pub original_size: u32,
    pub compressed: Vec<u8>,
}

impl StoredCheckpoint {
    pub fn compress(snapshot: &Snapshot) -> Result<Self, StoreError> {
        let encoded = bincode::serde::encode_to_vec(snapshot, bincode::config::standard())?;
        Ok(Self {
            version: snapshot.version,
            original_size: encoded.len() as u32,
            compressed: lz4_flex::compress_prepend_size(&encoded),
        })
    }

    pub fn decompress(&self) -> Result<Snapshot, StoreError> {
        let encoded = lz4_flex::decompress_size_prepended(&self.compressed)
            .map_err(|e| StoreError::Decompression(e.to_string()))?;
        let (snapshot, _): (Snapshot, usize) =
            bincode::serde::decode_from_slice(&encoded, bincode::config::standard())?;
        if !snapshot.is_intact() {
            return Err(StoreError::Checksum(snapshot.document_id));
        }
        Ok(snapshot)
    }

    /// Original / compressed.
    pub fn compression_ratio(&self) -> f64 {
        if self.compressed.is_empty() {
            return 0.0;
        }
        self.original_size as f64 / self.compressed.len() as f64
    }
}

/// Checkpoint statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckpointStats {
    pub documents: usize,
    pub checkpoints_written: u64,
    pub compressed_bytes: u64,
}

/// In-memory [`CheckpointStore`].
#[derive(Default)]
pub struct MemoryCheckpointStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    latest: HashMap<Uuid, StoredCheckpoint>,
    written: u64,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> CheckpointStats {
        let inner = self.inner();
        CheckpointStats {
            documents: inner.latest.len(),
            checkpoints_written: inner.written,
            compressed_bytes: inner
                .latest
                .values()
                .map(|c| c.compressed.len() as u64)
                .sum(),
        }
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn checkpoint(&self, document_id: Uuid, snapshot: &Snapshot) -> Result<(), StoreError> {
        let stored = StoredCheckpoint::compress(snapshot)?;
        let mut inner = self.inner();
        // An older checkpoint never replaces a newer one.
        let newer = inner
            .latest
            .get(&document_id)
            .map_or(true, |existing| existing.version <= stored.version);
        if newer {
            inner.latest.insert(document_id, stored);
            inner.written += 1;
        }
        Ok(())
    }

    fn latest(&self, document_id: Uuid) -> Result<Option<Snapshot>, StoreError> {
        let stored = self.inner().latest.get(&document_id).cloned();
        stored.map(|s| s.decompress()).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::DocumentContent;

    fn snapshot(doc: Uuid, version: u64, text: &str) -> Snapshot {
        Snapshot::new(doc, version, DocumentContent::from_text(text))
    }

    #[test]
    fn test_compress_roundtrip() {
        let doc = Uuid::new_v4();
        let snap = snapshot(doc, 3, &"repetitive text ".repeat(64));
        let stored = StoredCheckpoint::compress(&snap).unwrap();
        assert!(stored.compression_ratio() > 2.0);
        assert_eq!(stored.decompress().unwrap(), snap);
    }

    #[test]
    fn test_latest_keeps_newest() {
        let store = MemoryCheckpointStore::new();
        let doc = Uuid::new_v4();
        store.checkpoint(doc, &snapshot(doc, 5, "five")).unwrap();
        store.checkpoint(doc, &snapshot(doc, 2, "two")).unwrap();
        let latest = store.latest(doc).unwrap().unwrap();
        assert_eq!(latest.version, 5);
        assert_eq!(store.stats().checkpoints_written, 1);
    }

    #[test]
    fn test_missing_document() {
        let store = MemoryCheckpointStore::new();
        assert!(store.latest(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_payload_is_rejected() {
        let doc = Uuid::new_v4();
        let mut stored = StoredCheckpoint::compress(&snapshot(doc, 1, "abc")).unwrap();
        stored.compressed.truncate(stored.compressed.len() / 2);
        assert!(stored.decompress().is_err());
    }

    #[test]
    fn test_checksum_mismatch_is_rejected() {
        let doc = Uuid::new_v4();
        let mut bad = snapshot(doc, 1, "abc");
        bad.checksum ^= 1;
        let stored = StoredCheckpoint::compress(&bad).unwrap();
        assert!(matches!(stored.decompress(), Err(StoreError::Checksum(id)) if id == doc));
    }
}
