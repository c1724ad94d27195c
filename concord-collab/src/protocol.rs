//! Binary wire protocol between participants and the server.
//!
//! Every frame is one bincode-encoded message (`bincode::serde`, standard
//! config), carried in a WebSocket binary frame.
//!
//! ```text
//! client                                server
//!   │ Join{doc, pid, last_known_version} │
//!   │ ──────────────────────────────────►│
//!   │◄────────────── ResyncSnapshot / ops│
//!   │◄─────────────── ResyncComplete{v}  │
//!   │ Submit{op} ───────────────────────►│──► OperationApplied (others)
//!   │◄──────────── OperationAcknowledged │
//!   │ Ack{v} ───────────────────────────►│
//! ```

use concord_core::{Operation, ParticipantId, Snapshot};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::presence::{ParticipantState, Selection};
use crate::sections::SectionLock;

/// Presence payload carried by [`ServerMessage::PresenceUpdate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Presence {
    Cursor { position: usize },
    Selection { selection: Option<Selection> },
}

/// Messages pushed from the server to a participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// An operation committed at `version`, already rebased
    OperationApplied { operation: Operation, version: u64 },
    /// The recipient's own operation committed at `version`
    OperationAcknowledged { operation_id: u64, version: u64 },
    /// The recipient's operation was not applied
    OperationRejected {
        operation_id: u64,
        reason: String,
        retryable: bool,
    },
    ParticipantJoined { participant_id: ParticipantId },
    ParticipantLeft { participant_id: ParticipantId },
    PresenceUpdate {
        participant_id: ParticipantId,
        presence: Presence,
    },
    /// Full document state; replaces whatever the recipient holds
    ResyncSnapshot { snapshot: Snapshot },
    /// End of a resync; acknowledge `version` to resume normal operation
    ResyncComplete { version: u64 },
    /// A section was locked; its range refers to the current version
    SectionLocked { lock: SectionLock },
    SectionUnlocked {
        section_id: String,
        participant_id: ParticipantId,
    },
    /// Reply to [`ClientMessage::ListParticipants`]
    Participants {
        participants: Vec<ParticipantState>,
        locks: Vec<SectionLock>,
    },
    Error { message: String },
    Pong,
}

/// Messages sent from a participant to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// First frame on every connection
    Join {
        document_id: Uuid,
        participant_id: ParticipantId,
        /// `Some` when reconnecting with local state at that version
        last_known_version: Option<u64>,
    },
    Submit { operation: Operation },
    Cursor { position: usize },
    Selection { selection: Option<Selection> },
    /// Every version up to `version` has been applied locally
    Ack { version: u64 },
    RequestSnapshot,
    /// Take `start..end` exclusively under `section_id`
    LockSection {
        section_id: String,
        start: usize,
        end: usize,
    },
    UnlockSection { section_id: String },
    ListParticipants,
    Leave,
    Ping,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    Ok(bincode::serde::encode_to_vec(value, bincode::config::standard())?)
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(value)
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::OperationApplied { .. } => "OperationApplied",
            ServerMessage::OperationAcknowledged { .. } => "OperationAcknowledged",
            ServerMessage::OperationRejected { .. } => "OperationRejected",
            ServerMessage::ParticipantJoined { .. } => "ParticipantJoined",
            ServerMessage::ParticipantLeft { .. } => "ParticipantLeft",
            ServerMessage::PresenceUpdate { .. } => "PresenceUpdate",
            ServerMessage::ResyncSnapshot { .. } => "ResyncSnapshot",
            ServerMessage::ResyncComplete { .. } => "ResyncComplete",
            ServerMessage::SectionLocked { .. } => "SectionLocked",
            ServerMessage::SectionUnlocked { .. } => "SectionUnlocked",
            ServerMessage::Participants { .. } => "Participants",
            ServerMessage::Error { .. } => "Error",
            ServerMessage::Pong => "Pong",
        }
    }
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::{DocumentReplica, DEFAULT_RETENTION};

    #[test]
    fn test_operation_applied_roundtrip() {
        let op = Operation::replace(4, Uuid::new_v4(), 2, 1, 3, "héllo").with_attributes(["bold"]);
        let msg = ServerMessage::OperationApplied {
            operation: op.clone(),
            version: 3,
        };
        let decoded = ServerMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_snapshot_survives_encoding() {
        let mut replica = DocumentReplica::new(Uuid::new_v4(), "abc", DEFAULT_RETENTION);
        replica
            .apply(Operation::format(1, Uuid::new_v4(), 0, 0, 2, "em"))
            .unwrap();
        let msg = ServerMessage::ResyncSnapshot {
            snapshot: replica.snapshot(),
        };
        match ServerMessage::decode(&msg.encode().unwrap()).unwrap() {
            ServerMessage::ResyncSnapshot { snapshot } => {
                assert!(snapshot.is_intact());
                assert_eq!(snapshot.version, 1);
                assert!(snapshot.content.marks_at(1).unwrap().contains("em"));
            }
            other => panic!("Expected ResyncSnapshot, got {other:?}"),
        }
    }

    #[test]
    fn test_join_encoding() {
        let msg = ClientMessage::Join {
            document_id: Uuid::new_v4(),
            participant_id: Uuid::new_v4(),
            last_known_version: Some(17),
        };
        assert_eq!(ClientMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_presence_encoding() {
        let msg = ServerMessage::PresenceUpdate {
            participant_id: Uuid::new_v4(),
            presence: Presence::Selection {
                selection: Some(Selection::new(2, 9)),
            },
        };
        assert_eq!(ServerMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_participants_encoding() {
        let holder = Uuid::new_v4();
        let mut state = ParticipantState::new(holder, 4);
        state.selection = Some(Selection::new(1, 3));
        let msg = ServerMessage::Participants {
            participants: vec![state],
            locks: vec![SectionLock {
                section_id: "intro".into(),
                holder,
                start: 0,
                end: 5,
            }],
        };
        assert_eq!(ServerMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
        assert_eq!(msg.kind(), "Participants");
    }

    #[test]
    fn test_small_messages_stay_small() {
        let encoded = ServerMessage::ResyncComplete { version: 5 }.encode().unwrap();
        assert!(encoded.len() < 8);
        assert_eq!(ClientMessage::Ping.encode().unwrap().len(), 1);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(ServerMessage::decode(&[0xff, 0xff, 0xff]).is_err());
        assert!(ClientMessage::decode(&[]).is_err());
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(ServerMessage::Pong.kind(), "Pong");
        assert_eq!(
            ServerMessage::ResyncComplete { version: 1 }.kind(),
            "ResyncComplete"
        );
    }
}
