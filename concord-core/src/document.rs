//! Document replica: content, version counter, and the applied-operation log.
//!
//! ```text
//! ┌────────────────────────────────────────────────────┐
//! │                 DocumentReplica                    │
//! │                                                    │
//! │  base (v = base_version) ──► op ──► op ──► op      │
//! │                                         │          │
//! │                              content (v = version) │
//! │                                                    │
//! │  Compaction folds the oldest ops into the base.    │
//! └────────────────────────────────────────────────────┘
//! ```
//!
//! Invariant: replaying `log` over `base` reproduces `content`, and
//! `version == base_version + log.len()`.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ReplicaError, ValidationError};
use crate::operation::{OpKind, Operation};

/// Default number of operations kept in the log after compaction.
pub const DEFAULT_RETENTION: usize = 1024;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// One character and the marks applied to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Element {
    pub ch: char,
    pub marks: BTreeSet<String>,
}

impl Element {
    pub fn plain(ch: char) -> Self {
        Self { ch, marks: BTreeSet::new() }
    }
}

/// Ordered sequence of elements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentContent {
    elements: Vec<Element>,
}

impl DocumentContent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_text(text: &str) -> Self {
        Self {
            elements: text.chars().map(Element::plain).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn text(&self) -> String {
        self.elements.iter().map(|e| e.ch).collect()
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    /// Marks on the char at `index`.
    pub fn marks_at(&self, index: usize) -> Option<&BTreeSet<String>> {
        self.elements.get(index).map(|e| &e.marks)
    }

    /// Apply an operation. Validates first; on error nothing changes.
    ///
    /// The base version is not checked here; that is the replica's job.
    pub fn apply(&mut self, op: &Operation) -> Result<(), ValidationError> {
        op.validate(self.elements.len())?;
        let start = op.position;
        let end = start + op.length;
        match op.kind {
            OpKind::Insert => {
                let inserted = op.payload.chars().map(|ch| Element {
                    ch,
                    marks: op.attributes.clone(),
                });
                self.elements.splice(start..end, inserted);
            }
            OpKind::Delete => {
                self.elements.drain(start..end);
            }
            OpKind::FormatRange => {
                for element in &mut self.elements[start..end] {
                    element.marks.insert(op.payload.clone());
                }
            }
        }
        Ok(())
    }

    /// FNV-1a over chars and marks.
    pub fn checksum(&self) -> u64 {
        let mut hash = FNV_OFFSET;
        let mut mix = |bytes: &[u8]| {
            for byte in bytes {
                hash ^= u64::from(*byte);
                hash = hash.wrapping_mul(FNV_PRIME);
            }
        };
        for element in &self.elements {
            mix(&u32::from(element.ch).to_le_bytes());
            for mark in &element.marks {
                mix(mark.as_bytes());
                mix(&[0x1f]);
            }
            mix(&[0x1e]);
        }
        hash
    }
}

/// Consistent point-in-time copy of a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub document_id: Uuid,
    pub version: u64,
    pub content: DocumentContent,
    pub checksum: u64,
}

impl Snapshot {
    pub fn new(document_id: Uuid, version: u64, content: DocumentContent) -> Self {
        let checksum = content.checksum();
        Self {
            document_id,
            version,
            content,
            checksum,
        }
    }

    pub fn text(&self) -> String {
        self.content.text()
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Whether the stored checksum still matches the content.
    pub fn is_intact(&self) -> bool {
        self.content.checksum() == self.checksum
    }
}

/// Authoritative copy of one document.
#[derive(Debug, Clone)]
pub struct DocumentReplica {
    document_id: Uuid,
    base: DocumentContent,
    base_version: u64,
    log: Vec<Operation>,
    content: DocumentContent,
    version: u64,
    retention: usize,
}

impl DocumentReplica {
    /// New replica at version 0 holding `text`.
    pub fn new(document_id: Uuid, text: &str, retention: usize) -> Self {
        let content = DocumentContent::from_text(text);
        Self {
            document_id,
            base: content.clone(),
            base_version: 0,
            log: Vec::new(),
            content,
            version: 0,
            retention,
        }
    }

    /// Replica starting from a snapshot, with an empty log.
    pub fn from_snapshot(snapshot: &Snapshot, retention: usize) -> Self {
        Self {
            document_id: snapshot.document_id,
            base: snapshot.content.clone(),
            base_version: snapshot.version,
            log: Vec::new(),
            content: snapshot.content.clone(),
            version: snapshot.version,
            retention,
        }
    }

    /// Reassemble a replica from a base snapshot, the operations applied
    /// after it, and the live content.
    ///
    /// Nothing is checked here. Call [`DocumentReplica::verify`] before
    /// trusting the result.
    pub fn from_parts(
        base: Snapshot,
        log: Vec<Operation>,
        content: DocumentContent,
        retention: usize,
    ) -> Self {
        let version = base.version + log.len() as u64;
        Self {
            document_id: base.document_id,
            base: base.content,
            base_version: base.version,
            log,
            content,
            version,
            retention,
        }
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    /// Number of applied operations since the document was opened.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Oldest version still reachable through [`DocumentReplica::operations_since`].
    pub fn base_version(&self) -> u64 {
        self.base_version
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    pub fn retained_len(&self) -> usize {
        self.log.len()
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn text(&self) -> String {
        self.content.text()
    }

    pub fn content(&self) -> &DocumentContent {
        &self.content
    }

    /// Apply an operation already rebased onto the current version.
    ///
    /// Returns the new version.
    pub fn apply(&mut self, op: Operation) -> Result<u64, ValidationError> {
        if op.base_version > self.version {
            return Err(ValidationError::FutureBase {
                base: op.base_version,
                current: self.version,
            });
        }
        if op.base_version != self.version {
            return Err(ValidationError::VersionMismatch {
                base: op.base_version,
                current: self.version,
            });
        }
        self.content.apply(&op)?;
        self.log.push(op);
        self.version += 1;

        if self.log.len() > self.retention.saturating_mul(2) {
            if let Err(e) = self.compact() {
                log::warn!("Compaction of document {} skipped: {e}", self.document_id);
            }
        }
        Ok(self.version)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.document_id, self.version, self.content.clone())
    }

    /// Snapshot of the compaction base.
    pub fn base_snapshot(&self) -> Snapshot {
        Snapshot::new(self.document_id, self.base_version, self.base.clone())
    }

    /// Operations applied after `version`, in application order.
    pub fn operations_since(&self, version: u64) -> Result<Vec<Operation>, ReplicaError> {
        if version > self.version {
            return Err(ReplicaError::FutureVersion {
                requested: version,
                current: self.version,
            });
        }
        if version < self.base_version {
            return Err(ReplicaError::Compacted {
                requested: version,
                oldest: self.base_version,
            });
        }
        let skip = (version - self.base_version) as usize;
        Ok(self.log[skip..].to_vec())
    }

    /// Replay the log over the base and compare against the live content.
    pub fn verify(&self) -> Result<(), ReplicaError> {
        let mut replay = self.base.clone();
        for op in &self.log {
            replay.apply(op)?;
        }
        let expected = replay.checksum();
        let actual = self.content.checksum();
        if expected != actual || self.version != self.base_version + self.log.len() as u64 {
            return Err(ReplicaError::Corruption {
                version: self.version,
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Fold everything but the newest `retention` operations into the base.
    ///
    /// Returns how many operations were folded.
    pub fn compact(&mut self) -> Result<usize, ReplicaError> {
        let excess = self.log.len().saturating_sub(self.retention);
        if excess == 0 {
            return Ok(0);
        }
        let mut base = self.base.clone();
        for op in &self.log[..excess] {
            base.apply(op)?;
        }
        self.base = base;
        self.base_version += excess as u64;
        self.log.drain(..excess);
        log::debug!(
            "Compacted {excess} operations of document {} (base now v{})",
            self.document_id,
            self.base_version
        );
        Ok(excess)
    }

    /// Discard all state and continue from `snapshot`.
    pub fn restore(&mut self, snapshot: &Snapshot) {
        self.base = snapshot.content.clone();
        self.base_version = snapshot.version;
        self.log.clear();
        self.content = snapshot.content.clone();
        self.version = snapshot.version;
        log::info!(
            "Document {} restored to v{}",
            self.document_id,
            snapshot.version
        );
    }
}
