//! WebSocket client for a collaboration server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect with resume)
//! - Local editing with optimistic apply and rebasing of remote operations
//! - Cursor and selection updates
//! - Section locking and participant listing
//! - Offline queueing of edits made while disconnected
//!
//! At most one operation is in flight. Later edits wait in `pending`
//! and are sent, rebased onto the latest confirmed version, once the
//! server acknowledges the previous one.

use std::collections::VecDeque;
use std::sync::Arc;

use concord_core::{transform_pair, DocumentContent, Operation, ParticipantId, Snapshot};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::presence::{ParticipantState, Selection};
use crate::protocol::{ClientMessage, Presence, ServerMessage};
use crate::sections::SectionLock;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// A remote operation, rebased and applied locally
    RemoteOperation { operation: Operation, version: u64 },
    /// Our operation committed at `version`
    Acknowledged { operation_id: u64, version: u64 },
    /// Our operation was refused; the document is being resynced
    Rejected {
        operation_id: u64,
        reason: String,
        retryable: bool,
    },
    PresenceUpdate {
        participant_id: ParticipantId,
        presence: Presence,
    },
    ParticipantJoined(ParticipantId),
    ParticipantLeft(ParticipantId),
    SectionLocked(SectionLock),
    SectionUnlocked {
        section_id: String,
        participant_id: ParticipantId,
    },
    /// Reply to [`SyncClient::list_participants`]
    Participants {
        participants: Vec<ParticipantState>,
        locks: Vec<SectionLock>,
    },
    /// Local state matches the server at `version`
    Resynced { version: u64 },
    ServerError(String),
}

/// Result of feeding a committed operation to [`LocalDocument::on_remote`].
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// A remote operation, rebased over local edits and applied
    Applied(Operation),
    /// The echo of our in-flight operation; carries the next one to send
    Confirmed(Option<Operation>),
    /// Already seen, or replayed by a resync under way
    Ignored,
    /// A version was missed; only a snapshot can repair local state
    Gap,
}

/// Client-side replica with optimistic local edits.
#[derive(Debug, Clone)]
pub struct LocalDocument {
    participant_id: ParticipantId,
    content: DocumentContent,
    /// Last version confirmed by the server
    version: u64,
    /// `false` until the first snapshot arrives
    synced: bool,
    /// Between (re)connecting and `ResyncComplete`; nothing is sent
    resyncing: bool,
    /// A `RequestSnapshot` is outstanding
    awaiting_snapshot: bool,
    /// In-flight operation discarded by the last snapshot
    dropped: Option<u64>,
    inflight: Option<Operation>,
    pending: VecDeque<Operation>,
    clock: u64,
}

impl LocalDocument {
    pub fn new(participant_id: ParticipantId) -> Self {
        Self {
            participant_id,
            content: DocumentContent::new(),
            version: 0,
            synced: false,
            resyncing: true,
            awaiting_snapshot: false,
            dropped: None,
            inflight: None,
            pending: VecDeque::new(),
            clock: 0,
        }
    }

    pub fn participant_id(&self) -> ParticipantId {
        self.participant_id
    }

    pub fn text(&self) -> String {
        self.content.text()
    }

    pub fn content(&self) -> &DocumentContent {
        &self.content
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Version to report when resuming, if any state has been received.
    pub fn known_version(&self) -> Option<u64> {
        self.synced.then_some(self.version)
    }

    pub fn inflight(&self) -> Option<&Operation> {
        self.inflight.as_ref()
    }

    /// Edits not yet acknowledged, in flight included.
    pub fn unacknowledged(&self) -> usize {
        self.pending.len() + usize::from(self.inflight.is_some())
    }

    /// Lamport clock value for the next local operation.
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn observe(&mut self, id: u64) {
        self.clock = self.clock.max(id);
    }

    pub fn insert(&mut self, position: usize, text: &str) -> Result<Operation, ProtocolError> {
        let op = Operation::insert(self.tick(), self.participant_id, self.version, position, text);
        self.apply_local(op)
    }

    pub fn delete(&mut self, position: usize, length: usize) -> Result<Operation, ProtocolError> {
        let op = Operation::delete(self.tick(), self.participant_id, self.version, position, length);
        self.apply_local(op)
    }

    pub fn replace(&mut self, position: usize, length: usize, text: &str) -> Result<Operation, ProtocolError> {
        let op = Operation::replace(
            self.tick(),
            self.participant_id,
            self.version,
            position,
            length,
            text,
        );
        self.apply_local(op)
    }

    pub fn format(&mut self, position: usize, length: usize, mark: &str) -> Result<Operation, ProtocolError> {
        let op = Operation::format(self.tick(), self.participant_id, self.version, position, length, mark);
        self.apply_local(op)
    }

    fn apply_local(&mut self, op: Operation) -> Result<Operation, ProtocolError> {
        self.content.apply(&op)?;
        self.pending.push_back(op.clone());
        Ok(op)
    }

    /// Promote the oldest pending edit to in flight, based on the current
    /// version. `None` while another operation is in flight or a resync
    /// is under way.
    pub fn take_next(&mut self) -> Option<Operation> {
        if self.inflight.is_some() || self.resyncing {
            return None;
        }
        let mut next = self.pending.pop_front()?;
        next.base_version = self.version;
        self.inflight = Some(next.clone());
        Some(next)
    }

    /// Hold back outgoing operations until [`LocalDocument::complete_resync`].
    pub fn begin_resync(&mut self) {
        self.resyncing = true;
    }

    /// Stop sending until a requested snapshot and its `ResyncComplete`
    /// arrive. Returns `false` if a request is already outstanding.
    pub fn request_snapshot(&mut self) -> bool {
        if self.awaiting_snapshot {
            return false;
        }
        self.awaiting_snapshot = true;
        self.resyncing = true;
        true
    }

    /// End a resync. Returns the in-flight operation rebased onto the
    /// current version, since the server may never have seen it, or else
    /// the next pending one.
    pub fn complete_resync(&mut self) -> Option<Operation> {
        self.resyncing = false;
        match &mut self.inflight {
            Some(op) => {
                op.base_version = self.version;
                Some(op.clone())
            }
            None => self.take_next(),
        }
    }

    /// Handle an operation the server committed at `version`.
    pub fn on_remote(&mut self, operation: &Operation, version: u64) -> Result<Incoming, ProtocolError> {
        if !self.synced || version <= self.version {
            return Ok(Incoming::Ignored);
        }
        if version > self.version + 1 {
            return Ok(self.gap());
        }
        self.observe(operation.id);

        let own = self
            .inflight
            .as_ref()
            .is_some_and(|op| op.author == operation.author && op.id == operation.id);
        if own {
            self.inflight = None;
            self.version = version;
            return Ok(Incoming::Confirmed(self.take_next()));
        }

        // Rebase the remote op over our local edits and our local edits
        // over the remote op, pairwise in order.
        let mut remote = operation.clone();
        let mut inflight = self.inflight.clone();
        if let Some(local) = &mut inflight {
            let rebased_remote = transform_pair(&remote, local)?;
            *local = transform_pair(local, &remote)?;
            remote = rebased_remote;
        }
        let mut pending = self.pending.clone();
        for local in pending.iter_mut() {
            let rebased_remote = transform_pair(&remote, local)?;
            *local = transform_pair(local, &remote)?;
            remote = rebased_remote;
        }

        self.content.apply(&remote)?;
        self.inflight = inflight;
        self.pending = pending;
        self.version = version;
        Ok(Incoming::Applied(remote))
    }

    /// Handle the acknowledgement of our in-flight operation.
    /// `Confirmed` carries the next operation to send.
    pub fn on_ack(&mut self, operation_id: u64, version: u64) -> Incoming {
        let matches = self.inflight.as_ref().is_some_and(|op| op.id == operation_id);
        if matches {
            if version == self.version + 1 {
                self.inflight = None;
                self.version = version;
                return Incoming::Confirmed(self.take_next());
            }
            return if version > self.version + 1 {
                self.gap()
            } else {
                Incoming::Ignored
            };
        }
        // Committed after the snapshot that discarded it
        if self.dropped == Some(operation_id) && version > self.version {
            self.dropped = None;
            return Incoming::Gap;
        }
        Incoming::Ignored
    }

    /// Versions skipped during a resync are replayed by it.
    fn gap(&self) -> Incoming {
        if self.resyncing {
            Incoming::Ignored
        } else {
            Incoming::Gap
        }
    }

    /// Replace local state with a server snapshot.
    ///
    /// Unacknowledged edits cannot be rebased onto a snapshot and are
    /// discarded.
    pub fn reset(&mut self, snapshot: &Snapshot) {
        let discarded = self.unacknowledged();
        if discarded > 0 {
            log::warn!("Discarding {discarded} unacknowledged edits on snapshot v{}", snapshot.version);
        }
        self.content = snapshot.content.clone();
        self.version = snapshot.version;
        self.synced = true;
        self.awaiting_snapshot = false;
        self.dropped = self.inflight.take().map(|op| op.id);
        self.pending.clear();
    }
}

/// The sync client.
///
/// Manages a WebSocket connection to the collaboration server, keeps a
/// [`LocalDocument`] in step with it, and reports what happens through
/// [`SyncEvent`]s.
pub struct SyncClient {
    participant_id: ParticipantId,
    document_id: Uuid,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    document: Arc<Mutex<LocalDocument>>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::UnboundedSender<ClientMessage>>,
    tasks: Vec<JoinHandle<()>>,
    event_rx: Option<mpsc::UnboundedReceiver<SyncEvent>>,
    event_tx: mpsc::UnboundedSender<SyncEvent>,
}

impl SyncClient {
    pub fn new(participant_id: ParticipantId, document_id: Uuid, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            participant_id,
            document_id,
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            document: Arc::new(Mutex::new(LocalDocument::new(participant_id))),
            outgoing_tx: None,
            tasks: Vec::new(),
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect and join the document.
    ///
    /// A client that already holds state reports its version so the
    /// server can resume it instead of starting over.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        {
            let mut state = self.state.write().await;
            if *state != ConnectionState::Reconnecting {
                *state = ConnectionState::Connecting;
            }
        }

        let ws_stream = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let writer = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let encoded = match message.encode() {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        log::error!("Failed to encode {message:?}: {e}");
                        continue;
                    }
                };
                if ws_writer.send(Message::Binary(encoded.into())).await.is_err() {
                    break;
                }
            }
        });

        let last_known_version = {
            let mut document = self.document.lock().await;
            document.begin_resync();
            document.known_version()
        };
        out_tx
            .send(ClientMessage::Join {
                document_id: self.document_id,
                participant_id: self.participant_id,
                last_known_version,
            })
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected);

        // Reader task: process incoming WebSocket messages
        let document = self.document.clone();
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let reply_tx = out_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match ServerMessage::decode(&data) {
                        Ok(message) => {
                            let events = handle_server_message(&document, &reply_tx, message).await;
                            for event in events {
                                let _ = event_tx.send(event);
                            }
                        }
                        Err(e) => log::warn!("Failed to decode server message: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected);
        });

        self.outgoing_tx = Some(out_tx);
        self.tasks = vec![writer, reader];
        Ok(())
    }

    /// Drop the connection without leaving; the server keeps our
    /// membership so [`SyncClient::reconnect`] can resume.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        *self.state.write().await = ConnectionState::Disconnected;
        let _ = self.event_tx.send(SyncEvent::Disconnected);
    }

    /// Reconnect, resuming from the local version.
    pub async fn reconnect(&mut self) -> Result<(), ProtocolError> {
        if self.connection_state().await == ConnectionState::Connected {
            self.disconnect().await;
        }
        *self.state.write().await = ConnectionState::Reconnecting;
        self.connect().await
    }

    /// Leave the document and close the connection.
    pub async fn leave(&mut self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Leave)?;
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
        Ok(())
    }

    fn send(&self, message: ClientMessage) -> Result<(), ProtocolError> {
        self.outgoing_tx
            .as_ref()
            .ok_or(ProtocolError::ConnectionClosed)?
            .send(message)
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Apply a local edit and send it if nothing else is in flight.
    ///
    /// While disconnected the edit is queued and sent after the next
    /// resync.
    async fn edit(
        &self,
        make: impl FnOnce(&mut LocalDocument) -> Result<Operation, ProtocolError>,
    ) -> Result<Operation, ProtocolError> {
        let connected = self.connection_state().await == ConnectionState::Connected;
        let mut document = self.document.lock().await;
        let op = make(&mut document)?;
        if connected {
            if let Some(next) = document.take_next() {
                self.send(ClientMessage::Submit { operation: next })?;
            }
        }
        Ok(op)
    }

    pub async fn insert(&self, position: usize, text: &str) -> Result<Operation, ProtocolError> {
        self.edit(|doc| doc.insert(position, text)).await
    }

    pub async fn delete(&self, position: usize, length: usize) -> Result<Operation, ProtocolError> {
        self.edit(|doc| doc.delete(position, length)).await
    }

    pub async fn replace(&self, position: usize, length: usize, text: &str) -> Result<Operation, ProtocolError> {
        self.edit(|doc| doc.replace(position, length, text)).await
    }

    pub async fn format(&self, position: usize, length: usize, mark: &str) -> Result<Operation, ProtocolError> {
        self.edit(|doc| doc.format(position, length, mark)).await
    }

    /// Send a cursor update. Dropped silently when offline.
    pub async fn update_cursor(&self, position: usize) -> Result<(), ProtocolError> {
        if self.connection_state().await != ConnectionState::Connected {
            return Ok(());
        }
        self.send(ClientMessage::Cursor { position })
    }

    /// Send a selection update. Dropped silently when offline.
    pub async fn update_selection(&self, selection: Option<Selection>) -> Result<(), ProtocolError> {
        if self.connection_state().await != ConnectionState::Connected {
            return Ok(());
        }
        self.send(ClientMessage::Selection { selection })
    }

    /// Ask for exclusive use of `start..end` of the server's current
    /// version. The answer arrives as [`SyncEvent::SectionLocked`] or
    /// [`SyncEvent::ServerError`].
    pub async fn lock_section(&self, section_id: &str, start: usize, end: usize) -> Result<(), ProtocolError> {
        self.send(ClientMessage::LockSection {
            section_id: section_id.to_string(),
            start,
            end,
        })
    }

    pub async fn unlock_section(&self, section_id: &str) -> Result<(), ProtocolError> {
        self.send(ClientMessage::UnlockSection {
            section_id: section_id.to_string(),
        })
    }

    /// Request [`SyncEvent::Participants`].
    pub async fn list_participants(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::ListParticipants)
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Ping)
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn participant_id(&self) -> ParticipantId {
        self.participant_id
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn text(&self) -> String {
        self.document.lock().await.text()
    }

    pub async fn version(&self) -> u64 {
        self.document.lock().await.version()
    }

    pub async fn unacknowledged(&self) -> usize {
        self.document.lock().await.unacknowledged()
    }
}

/// Fold one server message into the local document, replying through
/// `reply_tx` where the protocol requires it.
async fn handle_server_message(
    document: &Mutex<LocalDocument>,
    reply_tx: &mpsc::UnboundedSender<ClientMessage>,
    message: ServerMessage,
) -> Vec<SyncEvent> {
    let reply = |message: ClientMessage| {
        let _ = reply_tx.send(message);
    };
    let mut events = Vec::new();

    match message {
        ServerMessage::OperationApplied { operation, version } => {
            let mut doc = document.lock().await;
            match doc.on_remote(&operation, version) {
                Ok(Incoming::Applied(applied)) => {
                    reply(ClientMessage::Ack { version });
                    events.push(SyncEvent::RemoteOperation {
                        operation: applied,
                        version,
                    });
                }
                Ok(Incoming::Confirmed(next)) => {
                    reply(ClientMessage::Ack { version });
                    events.push(SyncEvent::Acknowledged {
                        operation_id: operation.id,
                        version,
                    });
                    if let Some(next) = next {
                        reply(ClientMessage::Submit { operation: next });
                    }
                }
                Ok(Incoming::Ignored) => {
                    log::trace!("Ignoring v{version} (local v{})", doc.version());
                }
                Ok(Incoming::Gap) => {
                    log::warn!("Missed versions before v{version} (local v{}); requesting snapshot", doc.version());
                    if doc.request_snapshot() {
                        reply(ClientMessage::RequestSnapshot);
                    }
                }
                Err(e) => {
                    log::warn!("Cannot apply remote v{version}: {e}; requesting snapshot");
                    if doc.request_snapshot() {
                        reply(ClientMessage::RequestSnapshot);
                    }
                }
            }
        }
        ServerMessage::OperationAcknowledged { operation_id, version } => {
            let mut doc = document.lock().await;
            match doc.on_ack(operation_id, version) {
                Incoming::Confirmed(next) => {
                    reply(ClientMessage::Ack { version });
                    events.push(SyncEvent::Acknowledged { operation_id, version });
                    if let Some(next) = next {
                        reply(ClientMessage::Submit { operation: next });
                    }
                }
                Incoming::Gap => {
                    log::warn!("Ack v{version} for {operation_id} skips local v{}; requesting snapshot", doc.version());
                    if doc.request_snapshot() {
                        reply(ClientMessage::RequestSnapshot);
                    }
                }
                Incoming::Applied(_) | Incoming::Ignored => {}
            }
        }
        ServerMessage::OperationRejected {
            operation_id,
            reason,
            retryable,
        } => {
            log::warn!("Operation {operation_id} rejected: {reason}");
            if document.lock().await.request_snapshot() {
                reply(ClientMessage::RequestSnapshot);
            }
            events.push(SyncEvent::Rejected {
                operation_id,
                reason,
                retryable,
            });
        }
        ServerMessage::ParticipantJoined { participant_id } => {
            events.push(SyncEvent::ParticipantJoined(participant_id));
        }
        ServerMessage::ParticipantLeft { participant_id } => {
            events.push(SyncEvent::ParticipantLeft(participant_id));
        }
        ServerMessage::PresenceUpdate {
            participant_id,
            presence,
        } => {
            events.push(SyncEvent::PresenceUpdate {
                participant_id,
                presence,
            });
        }
        ServerMessage::SectionLocked { lock } => {
            events.push(SyncEvent::SectionLocked(lock));
        }
        ServerMessage::SectionUnlocked {
            section_id,
            participant_id,
        } => {
            events.push(SyncEvent::SectionUnlocked {
                section_id,
                participant_id,
            });
        }
        ServerMessage::Participants { participants, locks } => {
            events.push(SyncEvent::Participants { participants, locks });
        }
        ServerMessage::ResyncSnapshot { snapshot } => {
            document.lock().await.reset(&snapshot);
        }
        ServerMessage::ResyncComplete { version } => {
            let mut doc = document.lock().await;
            if doc.known_version() == Some(version) {
                reply(ClientMessage::Ack { version });
                if let Some(op) = doc.complete_resync() {
                    reply(ClientMessage::Submit { operation: op });
                }
                events.push(SyncEvent::Resynced { version });
            } else {
                log::warn!("Resync to v{version} incomplete (local v{}); requesting snapshot", doc.version());
                if doc.request_snapshot() {
                    reply(ClientMessage::RequestSnapshot);
                }
            }
        }
        ServerMessage::Error { message } => {
            log::warn!("Server error: {message}");
            events.push(SyncEvent::ServerError(message));
        }
        ServerMessage::Pong => {}
    }
    events
}
