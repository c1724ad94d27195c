//! Per-document editing session.
//!
//! ```text
//!                 submit_operation (write lock)
//!                           │
//!   validate author ─► operations_since(base) ─► transform ─► apply
//!                                                             │
//!                       ┌──────────────── send_to(author) ◄───┤ OperationAcknowledged
//!                       │                                     │
//!                       └──────────────── broadcast(others) ◄─┘ OperationApplied
//! ```
//!
//! The replica lock is the single serialization point: one operation is
//! transformed and applied at a time, and every outgoing message is handed
//! to the transport before the lock is released, so all participants see
//! versions in log order.
//!
//! Lock order is always replica, then the membership map, then a
//! participant entry. Section locks are only touched with the replica lock
//! held, and never across an await.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use concord_core::{
    transform, DocumentReplica, Operation, ParticipantId, ReplicaError, Snapshot, ValidationError,
};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::checkpoint::CheckpointStore;
use crate::config::SessionConfig;
use crate::error::CollabError;
use crate::presence::{ParticipantState, PresenceTracker, Selection};
use crate::protocol::ServerMessage;
use crate::reconnect::ConnectivityEvent;
use crate::sections::{SectionLock, SectionLocks};
use crate::transport::{ConnectivityCallback, Transport};

/// An operation as committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedOperation {
    /// The operation after rebasing
    pub operation: Operation,
    /// Version the operation produced
    pub version: u64,
}

/// How a returning participant catches up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResyncPlan {
    /// Nothing missed
    UpToDate { version: u64 },
    /// Replay of the operations after the participant's version
    Incremental {
        operations: Vec<Operation>,
        version: u64,
    },
    /// Gap too large or history unavailable
    Snapshot(Snapshot),
}

impl ResyncPlan {
    /// Version the participant holds once the plan is applied.
    pub fn version(&self) -> u64 {
        match self {
            ResyncPlan::UpToDate { version } | ResyncPlan::Incremental { version, .. } => *version,
            ResyncPlan::Snapshot(snapshot) => snapshot.version,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            ResyncPlan::UpToDate { .. } => "no-op",
            ResyncPlan::Incremental { .. } => "incremental replay",
            ResyncPlan::Snapshot(_) => "full snapshot",
        }
    }
}

/// One open document shared by up to `capacity` participants.
pub struct Session {
    document_id: Uuid,
    config: SessionConfig,
    replica: RwLock<DocumentReplica>,
    presence: PresenceTracker,
    sections: Mutex<SectionLocks>,
    transport: Arc<dyn Transport>,
    /// Next sequence number handed out by [`Session::next_sequence`]
    sequence: AtomicU64,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    /// Last state that passed verification
    last_good: RwLock<Snapshot>,
    events_tx: mpsc::UnboundedSender<ConnectivityEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectivityEvent>>>,
}

impl Session {
    /// Open a session over a fresh document holding `text`.
    pub fn new(
        document_id: Uuid,
        text: &str,
        config: SessionConfig,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let replica = DocumentReplica::new(document_id, text, config.retention_threshold);
        Self::with_replica(replica, config, transport)
    }

    /// Open a session over an existing replica.
    ///
    /// The replica is verified; if it fails, its compaction base becomes
    /// the recovery point.
    pub fn with_replica(
        replica: DocumentReplica,
        config: SessionConfig,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let document_id = replica.document_id();
        let last_good = match replica.verify() {
            Ok(()) => replica.snapshot(),
            Err(e) => {
                log::warn!("Document {document_id} opened with inconsistent state: {e}");
                replica.base_snapshot()
            }
        };
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            document_id,
            presence: PresenceTracker::new(document_id, config.capacity, transport.clone()),
            config,
            replica: RwLock::new(replica),
            sections: Mutex::new(SectionLocks::new()),
            transport,
            sequence: AtomicU64::new(1),
            checkpoints: None,
            last_good: RwLock::new(last_good),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Persist verified snapshots to `store` every `checkpoint_interval`
    /// versions.
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// Take the connectivity event stream (can only be called once).
    ///
    /// Events are produced by the transport callbacks registered on join
    /// and consumed by a [`crate::ReconnectionController`].
    pub fn take_connectivity_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectivityEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Allocate a sequence number for an in-process author.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    pub async fn version(&self) -> u64 {
        self.replica.read().await.version()
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.replica.read().await.snapshot()
    }

    pub async fn is_member(&self, participant_id: &ParticipantId) -> bool {
        self.presence.contains(participant_id).await
    }

    pub async fn participant_count(&self) -> usize {
        self.presence.len().await
    }

    /// Everyone currently joined, ordered by id.
    pub async fn participants(&self) -> Vec<ParticipantState> {
        self.presence.participants().await
    }

    /// Held section locks, ordered by section id.
    pub async fn section_locks(&self) -> Vec<SectionLock> {
        let _replica = self.replica.read().await;
        self.sections().all()
    }

    fn sections(&self) -> MutexGuard<'_, SectionLocks> {
        self.sections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn announce_unlocked(&self, released: Vec<SectionLock>) {
        for lock in released {
            self.transport.broadcast(
                self.document_id,
                None,
                &ServerMessage::SectionUnlocked {
                    section_id: lock.section_id,
                    participant_id: lock.holder,
                },
            );
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Membership
    // ───────────────────────────────────────────────────────────────

    /// Admit a participant and return the document as of its join.
    ///
    /// The snapshot is also delivered through the transport, followed by
    /// `ResyncComplete` and the held section locks, ahead of any operation
    /// committed later.
    pub async fn join_session(&self, participant_id: ParticipantId) -> Result<Snapshot, CollabError> {
        let replica = self.replica.read().await;
        self.presence.admit(participant_id, replica.version()).await?;
        let snapshot = replica.snapshot();

        self.transport.subscribe(self.document_id, participant_id);
        self.transport
            .on_disconnect(participant_id, self.connectivity_callback(ConnectivityEvent::Lost));
        self.transport
            .on_reconnect(participant_id, self.connectivity_callback(ConnectivityEvent::Restored));

        self.transport.send_to(
            participant_id,
            &ServerMessage::ResyncSnapshot {
                snapshot: snapshot.clone(),
            },
        );
        self.transport.send_to(
            participant_id,
            &ServerMessage::ResyncComplete {
                version: snapshot.version,
            },
        );
        let locks = self.sections().all();
        for lock in locks {
            self.transport
                .send_to(participant_id, &ServerMessage::SectionLocked { lock });
        }
        self.transport.broadcast(
            self.document_id,
            Some(participant_id),
            &ServerMessage::ParticipantJoined { participant_id },
        );
        drop(replica);

        log::info!(
            "Participant {participant_id} joined {} at v{} ({}/{})",
            self.document_id,
            snapshot.version,
            self.presence.len().await,
            self.presence.capacity()
        );
        Ok(snapshot)
    }

    /// Remove a participant and release its section locks. Returns `false`
    /// if it was not joined.
    pub async fn leave_session(&self, participant_id: ParticipantId) -> bool {
        let replica = self.replica.read().await;
        let Some(state) = self.presence.remove(&participant_id).await else {
            return false;
        };
        self.transport.unsubscribe(self.document_id, participant_id);
        let released = self.sections().release_held_by(&participant_id);
        let released_count = released.len();
        self.announce_unlocked(released);
        self.transport.broadcast(
            self.document_id,
            Some(participant_id),
            &ServerMessage::ParticipantLeft { participant_id },
        );
        drop(replica);

        log::info!(
            "Participant {participant_id} left {} (last acked v{}, released {released_count} section(s))",
            self.document_id,
            state.last_acked_version
        );
        true
    }

    fn connectivity_callback(
        &self,
        event: fn(ParticipantId) -> ConnectivityEvent,
    ) -> ConnectivityCallback {
        let tx = self.events_tx.clone();
        Arc::new(move |participant_id| {
            let _ = tx.send(event(participant_id));
        })
    }

    // ───────────────────────────────────────────────────────────────
    // Editing
    // ───────────────────────────────────────────────────────────────

    /// Rebase, apply and distribute one operation.
    ///
    /// Any error leaves the document untouched and is reported only to the
    /// caller.
    pub async fn submit_operation(
        &self,
        participant_id: ParticipantId,
        operation: Operation,
    ) -> Result<AppliedOperation, CollabError> {
        let mut replica = self.replica.write().await;
        let entry = self.presence.require(&participant_id).await?;
        if operation.author != participant_id {
            return Err(CollabError::AuthorMismatch {
                operation_id: operation.id,
                author: operation.author,
                participant_id,
            });
        }
        let current = replica.version();
        if operation.base_version > current {
            return Err(ValidationError::FutureBase {
                base: operation.base_version,
                current,
            }
            .into());
        }

        let concurrent = replica.operations_since(operation.base_version)?;
        let rebased = transform(&operation, &concurrent)?;
        if let Some(lock) = self.sections().blocking(&rebased) {
            return Err(CollabError::SectionLocked {
                section_id: lock.section_id.clone(),
                holder: lock.holder,
            });
        }
        let version = replica.apply(rebased.clone())?;
        self.sections().follow(&rebased);

        {
            let mut state = entry.lock().await;
            state.last_acked_version = state.last_acked_version.max(operation.base_version);
        }
        self.sequence
            .fetch_max(operation.id.saturating_add(1), Ordering::SeqCst);

        self.transport.send_to(
            participant_id,
            &ServerMessage::OperationAcknowledged {
                operation_id: operation.id,
                version,
            },
        );
        let reached = self.transport.broadcast(
            self.document_id,
            Some(participant_id),
            &ServerMessage::OperationApplied {
                operation: rebased.clone(),
                version,
            },
        );
        drop(replica);

        log::debug!(
            "Applied op {} from {participant_id} to {} at v{version} (rebased over {}, sent to {reached})",
            operation.id,
            self.document_id,
            concurrent.len()
        );

        if self.config.checkpoint_interval > 0 && version % self.config.checkpoint_interval == 0 {
            if let Err(e) = self.checkpoint().await {
                log::error!("Checkpoint of {} at v{version} failed: {e}", self.document_id);
            }
        }

        Ok(AppliedOperation {
            operation: rebased,
            version,
        })
    }

    pub async fn update_cursor(&self, participant_id: ParticipantId, position: usize) -> Result<(), CollabError> {
        self.presence.update_cursor(participant_id, position).await
    }

    pub async fn update_selection(
        &self,
        participant_id: ParticipantId,
        selection: Option<Selection>,
    ) -> Result<(), CollabError> {
        self.presence.update_selection(participant_id, selection).await
    }

    // ───────────────────────────────────────────────────────────────
    // Section locks
    // ───────────────────────────────────────────────────────────────

    /// Lock `start..end` of the current version under `section_id`.
    ///
    /// Until released, edits from other participants touching the range
    /// are refused. Everyone, the holder included, receives
    /// `SectionLocked`.
    pub async fn lock_section(
        &self,
        participant_id: ParticipantId,
        section_id: impl Into<String>,
        start: usize,
        end: usize,
    ) -> Result<SectionLock, CollabError> {
        let replica = self.replica.read().await;
        self.presence.require(&participant_id).await?;
        let lock = self
            .sections()
            .acquire(section_id.into(), participant_id, start, end, replica.len())?;
        self.transport.broadcast(
            self.document_id,
            None,
            &ServerMessage::SectionLocked { lock: lock.clone() },
        );
        drop(replica);

        log::debug!(
            "Participant {participant_id} locked section {} of {} at {}..{}",
            lock.section_id,
            self.document_id,
            lock.start,
            lock.end
        );
        Ok(lock)
    }

    /// Release a section held by `participant_id`.
    pub async fn unlock_section(
        &self,
        participant_id: ParticipantId,
        section_id: &str,
    ) -> Result<SectionLock, CollabError> {
        let _replica = self.replica.read().await;
        self.presence.require(&participant_id).await?;
        let lock = self.sections().release(section_id, participant_id)?;
        self.announce_unlocked(vec![lock.clone()]);
        log::debug!("Participant {participant_id} unlocked section {section_id} of {}", self.document_id);
        Ok(lock)
    }

    // ───────────────────────────────────────────────────────────────
    // Resync
    // ───────────────────────────────────────────────────────────────

    /// Record that `participant_id` holds every version up to `version`.
    pub async fn acknowledge(&self, participant_id: ParticipantId, version: u64) -> Result<u64, CollabError> {
        self.presence.record_ack(&participant_id, version).await
    }

    /// Replace the participant's known version with what it reports on
    /// reconnect.
    pub async fn record_known_version(
        &self,
        participant_id: ParticipantId,
        version: u64,
    ) -> Result<(), CollabError> {
        let entry = self.presence.require(&participant_id).await?;
        entry.lock().await.last_acked_version = version;
        Ok(())
    }

    /// Compute and deliver what the participant missed, followed by
    /// `ResyncComplete`.
    pub async fn resync_participant(&self, participant_id: ParticipantId) -> Result<ResyncPlan, CollabError> {
        let replica = self.replica.read().await;
        let entry = self.presence.require(&participant_id).await?;
        let mut state = entry.lock().await;

        let known = state.last_acked_version;
        let current = replica.version();
        let gap = current.saturating_sub(known);
        let plan = if known == current {
            ResyncPlan::UpToDate { version: current }
        } else if known < current && gap <= self.config.retention_threshold as u64 {
            match replica.operations_since(known) {
                Ok(operations) => ResyncPlan::Incremental {
                    operations,
                    version: current,
                },
                Err(_) => ResyncPlan::Snapshot(replica.snapshot()),
            }
        } else {
            ResyncPlan::Snapshot(replica.snapshot())
        };

        match &plan {
            ResyncPlan::UpToDate { .. } => {}
            ResyncPlan::Incremental { operations, .. } => {
                for (offset, operation) in operations.iter().enumerate() {
                    self.transport.send_to(
                        participant_id,
                        &ServerMessage::OperationApplied {
                            operation: operation.clone(),
                            version: known + offset as u64 + 1,
                        },
                    );
                }
            }
            ResyncPlan::Snapshot(snapshot) => {
                self.transport.send_to(
                    participant_id,
                    &ServerMessage::ResyncSnapshot {
                        snapshot: snapshot.clone(),
                    },
                );
            }
        }
        self.transport
            .send_to(participant_id, &ServerMessage::ResyncComplete { version: current });
        state.resync_target = Some(current);
        Ok(plan)
    }

    /// Send the full document to one participant on request.
    pub async fn send_snapshot(&self, participant_id: ParticipantId) -> Result<u64, CollabError> {
        let replica = self.replica.read().await;
        let entry = self.presence.require(&participant_id).await?;
        let snapshot = replica.snapshot();
        let version = snapshot.version;
        self.transport
            .send_to(participant_id, &ServerMessage::ResyncSnapshot { snapshot });
        self.transport
            .send_to(participant_id, &ServerMessage::ResyncComplete { version });
        entry.lock().await.resync_target = Some(version);
        Ok(version)
    }

    // ───────────────────────────────────────────────────────────────
    // Integrity
    // ───────────────────────────────────────────────────────────────

    /// Verify the replica against its log.
    ///
    /// On success the current state becomes the recovery point. On
    /// corruption the replica is restored to the last verified snapshot,
    /// every participant receives it, and the error is returned.
    pub async fn verify_integrity(&self) -> Result<Snapshot, CollabError> {
        let verified = {
            let replica = self.replica.read().await;
            replica.verify().map(|()| replica.snapshot())
        };
        match verified {
            Ok(snapshot) => {
                *self.last_good.write().await = snapshot.clone();
                Ok(snapshot)
            }
            Err(e) => {
                self.recover(&e).await;
                Err(CollabError::Corruption(e))
            }
        }
    }

    /// Verify, then hand the snapshot to the checkpoint store if any.
    pub async fn checkpoint(&self) -> Result<u64, CollabError> {
        let snapshot = self.verify_integrity().await?;
        if let Some(store) = &self.checkpoints {
            if let Err(e) = store.checkpoint(self.document_id, &snapshot) {
                log::error!("Checkpoint store rejected {} v{}: {e}", self.document_id, snapshot.version);
            } else {
                log::debug!("Checkpointed {} at v{}", self.document_id, snapshot.version);
            }
        }
        Ok(snapshot.version)
    }

    async fn recover(&self, cause: &ReplicaError) {
        let good = self.last_good.read().await.clone();
        log::error!(
            "Document {} corrupt ({cause}); restoring v{} and resyncing all participants",
            self.document_id,
            good.version
        );

        let mut replica = self.replica.write().await;
        replica.restore(&good);
        // Ranges refer to the discarded state
        let released = self.sections().clear();
        self.announce_unlocked(released);
        for entry in self.presence.entries().await {
            let mut state = entry.lock().await;
            state.last_acked_version = good.version;
            state.resync_target = Some(good.version);
        }
        self.transport.broadcast(
            self.document_id,
            None,
            &ServerMessage::ResyncSnapshot {
                snapshot: good.clone(),
            },
        );
        self.transport.broadcast(
            self.document_id,
            None,
            &ServerMessage::ResyncComplete {
                version: good.version,
            },
        );
    }

    /// Final checkpoint before the session is dropped.
    pub async fn close(&self) {
        match self.checkpoint().await {
            Ok(version) => log::info!("Closed document {} at v{version}", self.document_id),
            Err(e) => log::warn!("Closed document {} after failed checkpoint: {e}", self.document_id),
        }
    }
}
