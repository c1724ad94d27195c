//! Membership and per-participant presence for one document.
//!
//! ## Architecture
//!
//! ```text
//! update_cursor / update_selection
//!       │  (read lock on the map, then the participant's own lock)
//!       ▼
//! ParticipantState ── mutated in place
//!       │
//!       ▼
//! Transport::broadcast(PresenceUpdate, exclude = sender)
//! ```
//!
//! The tracker never touches the document version or log. Join and leave
//! take the map's write lock; presence updates from different participants
//! proceed concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use concord_core::ParticipantId;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::CollabError;
use crate::protocol::{Presence, ServerMessage};
use crate::reconnect::ConnectionStatus;
use crate::transport::Transport;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// A selected range of chars, `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Selection {
    pub start: usize,
    pub end: usize,
}

impl Selection {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn validate(&self) -> Result<(), CollabError> {
        if self.start > self.end {
            return Err(CollabError::InvalidSelection {
                start: self.start,
                end: self.end,
            });
        }
        Ok(())
    }
}

/// Session-owned state of one joined participant. Never persisted, but
/// listed to participants on request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantState {
    pub participant_id: ParticipantId,
    pub connection_status: ConnectionStatus,
    /// Highest version the participant is known to hold
    pub last_acked_version: u64,
    pub cursor_position: usize,
    pub selection: Option<Selection>,
    /// Version to acknowledge before leaving `Resyncing`
    pub resync_target: Option<u64>,
}

impl ParticipantState {
    pub fn new(participant_id: ParticipantId, version: u64) -> Self {
        Self {
            participant_id,
            connection_status: ConnectionStatus::Connected,
            last_acked_version: version,
            cursor_position: 0,
            selection: None,
            resync_target: None,
        }
    }
}

pub type ParticipantEntry = Arc<Mutex<ParticipantState>>;

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

/// Capacity-bounded participant map for one document.
pub struct PresenceTracker {
    document_id: Uuid,
    capacity: usize,
    participants: RwLock<HashMap<ParticipantId, ParticipantEntry>>,
    transport: Arc<dyn Transport>,
}

impl PresenceTracker {
    pub fn new(document_id: Uuid, capacity: usize, transport: Arc<dyn Transport>) -> Self {
        Self {
            document_id,
            capacity,
            participants: RwLock::new(HashMap::new()),
            transport,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add a participant holding `version`.
    ///
    /// Rejects rather than queues when the session is full.
    pub async fn admit(&self, participant_id: ParticipantId, version: u64) -> Result<(), CollabError> {
        let mut participants = self.participants.write().await;
        if participants.contains_key(&participant_id) {
            return Err(CollabError::AlreadyJoined(participant_id));
        }
        if participants.len() >= self.capacity {
            log::warn!(
                "Document {} is full, rejecting {participant_id}",
                self.document_id
            );
            return Err(CollabError::Capacity {
                document_id: self.document_id,
                capacity: self.capacity,
            });
        }
        participants.insert(
            participant_id,
            Arc::new(Mutex::new(ParticipantState::new(participant_id, version))),
        );
        Ok(())
    }

    /// Remove a participant, returning its final state.
    pub async fn remove(&self, participant_id: &ParticipantId) -> Option<ParticipantState> {
        let entry = self.participants.write().await.remove(participant_id)?;
        let state = entry.lock().await.clone();
        Some(state)
    }

    pub async fn entry(&self, participant_id: &ParticipantId) -> Option<ParticipantEntry> {
        self.participants.read().await.get(participant_id).cloned()
    }

    pub(crate) async fn require(&self, participant_id: &ParticipantId) -> Result<ParticipantEntry, CollabError> {
        self.entry(participant_id)
            .await
            .ok_or(CollabError::NotJoined(*participant_id))
    }

    pub async fn state(&self, participant_id: &ParticipantId) -> Option<ParticipantState> {
        let entry = self.entry(participant_id).await?;
        let state = entry.lock().await.clone();
        Some(state)
    }

    pub async fn contains(&self, participant_id: &ParticipantId) -> bool {
        self.participants.read().await.contains_key(participant_id)
    }

    pub async fn len(&self) -> usize {
        self.participants.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.participants.read().await.is_empty()
    }

    /// Current state of every participant, ordered by id.
    pub async fn participants(&self) -> Vec<ParticipantState> {
        let entries: Vec<ParticipantEntry> =
            self.participants.read().await.values().cloned().collect();
        let mut states = Vec::with_capacity(entries.len());
        for entry in entries {
            states.push(entry.lock().await.clone());
        }
        states.sort_by_key(|s| s.participant_id);
        states
    }

    pub(crate) async fn entries(&self) -> Vec<ParticipantEntry> {
        self.participants.read().await.values().cloned().collect()
    }

    pub async fn update_cursor(&self, participant_id: ParticipantId, position: usize) -> Result<(), CollabError> {
        let entry = self.require(&participant_id).await?;
        entry.lock().await.cursor_position = position;
        self.publish(participant_id, Presence::Cursor { position });
        Ok(())
    }

    pub async fn update_selection(
        &self,
        participant_id: ParticipantId,
        selection: Option<Selection>,
    ) -> Result<(), CollabError> {
        if let Some(selection) = &selection {
            selection.validate()?;
        }
        let entry = self.require(&participant_id).await?;
        entry.lock().await.selection = selection;
        self.publish(participant_id, Presence::Selection { selection });
        Ok(())
    }

    /// Raise the participant's acknowledged version. Never lowers it.
    pub async fn record_ack(&self, participant_id: &ParticipantId, version: u64) -> Result<u64, CollabError> {
        let entry = self.require(participant_id).await?;
        let mut state = entry.lock().await;
        state.last_acked_version = state.last_acked_version.max(version);
        Ok(state.last_acked_version)
    }

    fn publish(&self, participant_id: ParticipantId, presence: Presence) {
        let reached = self.transport.broadcast(
            self.document_id,
            Some(participant_id),
            &ServerMessage::PresenceUpdate {
                participant_id,
                presence,
            },
        );
        log::trace!("Presence of {participant_id} sent to {reached} participants");
    }
}
