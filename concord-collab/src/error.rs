//! Error types for the collaboration layer.

use concord_core::{ConflictError, ParticipantId, ReplicaError, ValidationError};
use thiserror::Error;
use uuid::Uuid;

use crate::reconnect::{ConnectionStatus, Transition};

/// Errors returned by session, presence and reconnection calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollabError {
    #[error("session for document {document_id} is full ({capacity} participants)")]
    Capacity { document_id: Uuid, capacity: usize },

    #[error("participant {0} has already joined")]
    AlreadyJoined(ParticipantId),

    #[error("participant {0} has not joined")]
    NotJoined(ParticipantId),

    #[error("operation {operation_id} was authored by {author}, not {participant_id}")]
    AuthorMismatch {
        operation_id: u64,
        author: ParticipantId,
        participant_id: ParticipantId,
    },

    #[error("selection end {end} precedes start {start}")]
    InvalidSelection { start: usize, end: usize },

    #[error("invalid operation: {0}")]
    Validation(#[from] ValidationError),

    #[error("cannot rebase operation: {0}")]
    Conflict(#[from] ConflictError),

    #[error("participant {0} is not reachable")]
    Connectivity(ParticipantId),

    #[error("document state is corrupt: {0}")]
    Corruption(ReplicaError),

    #[error("section {section_id} is locked by {holder}")]
    SectionLocked {
        section_id: String,
        holder: ParticipantId,
    },

    #[error("participant {participant_id} does not hold the lock on section {section_id}")]
    NotLockHolder {
        section_id: String,
        participant_id: ParticipantId,
    },

    #[error("participant {participant_id} cannot apply {transition:?} while {from:?}")]
    InvalidTransition {
        participant_id: ParticipantId,
        from: ConnectionStatus,
        transition: Transition,
    },
}

impl CollabError {
    /// Whether the caller may succeed by resyncing and trying again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CollabError::Capacity { .. }
                | CollabError::Conflict(_)
                | CollabError::Connectivity(_)
                | CollabError::Corruption(_)
                | CollabError::Validation(ValidationError::FutureBase { .. })
        )
    }
}

impl From<ReplicaError> for CollabError {
    fn from(err: ReplicaError) -> Self {
        match err {
            ReplicaError::Compacted { requested, oldest } => {
                CollabError::Conflict(ConflictError::HistoryCompacted {
                    base: requested,
                    oldest,
                })
            }
            ReplicaError::FutureVersion { requested, current } => {
                CollabError::Validation(ValidationError::FutureBase {
                    base: requested,
                    current,
                })
            }
            other => CollabError::Corruption(other),
        }
    }
}

/// Wire and client-side failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid local edit: {0}")]
    Edit(#[from] ValidationError),

    #[error("cannot rebase remote operation: {0}")]
    Rebase(#[from] ConflictError),
}

/// Checkpoint store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("checkpoint encoding failed: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("checkpoint decoding failed: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("checkpoint decompression failed: {0}")]
    Decompression(String),

    #[error("checkpoint for document {0} failed its checksum")]
    Checksum(Uuid),
}

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}
