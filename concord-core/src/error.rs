//! Error types for the editing core.

use thiserror::Error;

/// An operation that cannot be applied to the document as it stands.
///
/// Raised before any mutation, so a rejected operation never leaves
/// partial effects behind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("range {position}..{end} exceeds document length {len}")]
    OutOfBounds { position: usize, end: usize, len: usize },

    #[error("delete operation must not carry a payload")]
    DeleteWithPayload,

    #[error("format operation must name a mark")]
    MissingMark,

    #[error("operation is based on version {base}, replica is at {current}")]
    VersionMismatch { base: u64, current: u64 },

    #[error("operation is based on version {base}, which the replica has not reached (at {current})")]
    FutureBase { base: u64, current: u64 },

    #[error("range starting at {position} with length {length} overflows")]
    Overflow { position: usize, length: usize },
}

/// An operation that cannot be rebased onto the concurrent history.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictError {
    #[error("concurrent operation {index} is based on version {found}, expected {expected}")]
    Discontinuous { index: usize, expected: u64, found: u64 },

    #[error("history before version {oldest} has been compacted (operation based on {base})")]
    HistoryCompacted { base: u64, oldest: u64 },

    #[error("position arithmetic overflowed while transforming operation {id}")]
    Overflow { id: u64 },
}

/// Replica-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicaError {
    #[error("versions before {oldest} have been compacted (requested {requested})")]
    Compacted { requested: u64, oldest: u64 },

    #[error("requested version {requested} is ahead of the replica (at {current})")]
    FutureVersion { requested: u64, current: u64 },

    #[error("replica state at version {version} diverges from its log (checksum {expected:#018x}, found {actual:#018x})")]
    Corruption { version: u64, expected: u64, actual: u64 },

    #[error("log replay failed: {0}")]
    Replay(#[from] ValidationError),
}
