//! Reconnection handling.
//!
//! ```text
//!             Lost                  Restored               Synced
//! Connected ───────► Disconnected ───────────► Resyncing ─────────► Connected
//!     ▲                    ▲                       │
//!     │                    └──────── Lost ─────────┘
//!     └─────────── Restored, already up to date ───┘
//! ```
//!
//! A disconnected participant keeps its state; its last acknowledged
//! version is frozen. On return the session computes a [`ResyncPlan`]
//! (nothing, the missing operations, or a full snapshot) and the
//! participant leaves `Resyncing` once it acknowledges the plan's version.

use std::sync::Arc;

use concord_core::ParticipantId;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::CollabError;
use crate::presence::ParticipantState;
use crate::session::{ResyncPlan, Session};

/// Connection status of a joined participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Resyncing,
}

/// Inputs to the status machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transition {
    /// Transport failure
    Lost,
    /// Transport re-established
    Restored,
    /// Resync target acknowledged
    Synced,
}

impl ConnectionStatus {
    /// Next status, or `None` when the transition is not allowed.
    pub fn apply(self, transition: Transition) -> Option<ConnectionStatus> {
        use ConnectionStatus::*;
        match (self, transition) {
            (Connected | Resyncing, Transition::Lost) => Some(Disconnected),
            (Disconnected, Transition::Restored) => Some(Resyncing),
            (Resyncing, Transition::Synced) => Some(Connected),
            _ => None,
        }
    }
}

/// Connectivity change reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Lost(ParticipantId),
    Restored(ParticipantId),
}

fn step(state: &mut ParticipantState, transition: Transition) -> Result<ConnectionStatus, CollabError> {
    let next = state
        .connection_status
        .apply(transition)
        .ok_or(CollabError::InvalidTransition {
            participant_id: state.participant_id,
            from: state.connection_status,
            transition,
        })?;
    state.connection_status = next;
    Ok(next)
}

/// Drives participants through disconnect and resync for one session.
pub struct ReconnectionController {
    session: Arc<Session>,
}

impl ReconnectionController {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Mark the participant `Disconnected`.
    pub async fn handle_disconnect(&self, participant_id: ParticipantId) -> Result<(), CollabError> {
        let entry = self.session.presence().require(&participant_id).await?;
        let mut state = entry.lock().await;
        step(&mut state, Transition::Lost)?;
        state.resync_target = None;
        log::info!(
            "Participant {participant_id} disconnected from {} at v{}",
            self.session.document_id(),
            state.last_acked_version
        );
        Ok(())
    }

    /// Move the participant to `Resyncing` and deliver what it missed.
    ///
    /// An up-to-date participant goes straight back to `Connected`.
    pub async fn handle_reconnect(&self, participant_id: ParticipantId) -> Result<ResyncPlan, CollabError> {
        {
            let entry = self.session.presence().require(&participant_id).await?;
            let mut state = entry.lock().await;
            step(&mut state, Transition::Restored)?;
        }

        let plan = self.session.resync_participant(participant_id).await?;
        log::info!(
            "Participant {participant_id} resyncing via {} (target v{})",
            plan.describe(),
            plan.version()
        );
        if let ResyncPlan::UpToDate { .. } = plan {
            self.complete(participant_id, plan.version()).await?;
        }
        Ok(plan)
    }

    /// Record an acknowledgement; completes a pending resync once the
    /// target version is reached.
    pub async fn acknowledge(&self, participant_id: ParticipantId, version: u64) -> Result<ConnectionStatus, CollabError> {
        self.session.acknowledge(participant_id, version).await?;
        self.complete(participant_id, version).await
    }

    async fn complete(&self, participant_id: ParticipantId, version: u64) -> Result<ConnectionStatus, CollabError> {
        let entry = self.session.presence().require(&participant_id).await?;
        let mut state = entry.lock().await;
        let reached = state.resync_target.is_some_and(|target| version >= target);
        if state.connection_status == ConnectionStatus::Resyncing && reached {
            step(&mut state, Transition::Synced)?;
            state.resync_target = None;
            log::debug!("Participant {participant_id} back in sync at v{version}");
        }
        Ok(state.connection_status)
    }

    pub async fn handle(&self, event: ConnectivityEvent) -> Result<(), CollabError> {
        match event {
            ConnectivityEvent::Lost(pid) => self.handle_disconnect(pid).await,
            ConnectivityEvent::Restored(pid) => self.handle_reconnect(pid).await.map(|_| ()),
        }
    }

    /// Process connectivity events until the channel closes.
    pub fn spawn(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<ConnectivityEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Err(e) = self.handle(event).await {
                    log::warn!(
                        "Connectivity event {event:?} on document {} ignored: {e}",
                        self.session.document_id()
                    );
                }
            }
        })
    }
}
