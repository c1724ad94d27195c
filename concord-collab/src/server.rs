//! WebSocket server hosting editing sessions.
//!
//! Architecture:
//! ```text
//! Client A ──┐                               ┌── Session (doc 1) ── ReconnectionController
//!             ├── connection task ── registry ┤
//! Client B ──┘        ▲                      └── Session (doc 2) ── ReconnectionController
//!                     │                                  │
//!                     └──── ChannelTransport ◄───────────┘
//! ```
//!
//! Each connection task reads `ClientMessage` frames and calls into its
//! session; everything the session sends comes back through the
//! participant's transport channel and is written to the socket by the
//! same task. The first frame must be `Join`.

use std::net::SocketAddr;
use std::sync::Arc;

use concord_core::ParticipantId;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::checkpoint::MemoryCheckpointStore;
use crate::config::ServerConfig;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::registry::{SessionHandle, SessionRegistry};
use crate::transport::{ChannelTransport, Transport};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_operations: u64,
    pub active_sessions: usize,
}

/// The collaboration server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    transport: Arc<ChannelTransport>,
    checkpoints: Arc<MemoryCheckpointStore>,
    stats: Arc<RwLock<ServerStats>>,
}

/// Shared state handed to each connection task.
#[derive(Clone)]
struct Shared {
    registry: Arc<SessionRegistry>,
    transport: Arc<ChannelTransport>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let transport = Arc::new(ChannelTransport::new());
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let registry = SessionRegistry::new(config.session.clone(), transport.clone())
            .with_checkpoint_store(checkpoints.clone());
        Self {
            config,
            registry: Arc::new(registry),
            transport,
            checkpoints,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    fn shared(&self) -> Shared {
        Shared {
            registry: self.registry.clone(),
            transport: self.transport.clone(),
            stats: self.stats.clone(),
        }
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_sessions = self.registry.session_count().await;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn transport(&self) -> &Arc<ChannelTransport> {
        &self.transport
    }

    pub fn checkpoints(&self) -> &Arc<MemoryCheckpointStore> {
        &self.checkpoints
    }
}

async fn send(ws_sender: &mut WsSink, message: &ServerMessage) -> Result<(), BoxError> {
    let encoded = message.encode()?;
    ws_sender.send(Message::Binary(encoded.into())).await?;
    Ok(())
}

/// Wait for the opening `Join` frame.
async fn read_join(
    ws_sender: &mut WsSink,
    ws_receiver: &mut WsSource,
    addr: SocketAddr,
) -> Result<Option<(Uuid, ParticipantId, Option<u64>)>, BoxError> {
    while let Some(msg) = ws_receiver.next().await {
        match msg? {
            Message::Binary(data) => {
                return match ClientMessage::decode(&data) {
                    Ok(ClientMessage::Join {
                        document_id,
                        participant_id,
                        last_known_version,
                    }) => Ok(Some((document_id, participant_id, last_known_version))),
                    Ok(_) => {
                        let message = "first message must be Join".to_string();
                        send(ws_sender, &ServerMessage::Error { message }).await?;
                        Ok(None)
                    }
                    Err(e) => {
                        log::warn!("Failed to decode join from {addr}: {e}");
                        send(ws_sender, &ServerMessage::Error { message: e.to_string() }).await?;
                        Ok(None)
                    }
                };
            }
            Message::Ping(data) => ws_sender.send(Message::Pong(data)).await?,
            Message::Close(_) => return Ok(None),
            _ => {}
        }
    }
    Ok(None)
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, shared: Shared) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::info!("WebSocket connection established from {addr}");

    let Some((document_id, participant_id, last_known_version)) =
        read_join(&mut ws_sender, &mut ws_receiver, addr).await?
    else {
        return Ok(());
    };

    let handle = shared.registry.get_or_create(document_id).await;
    let session = handle.session.clone();

    // A member reporting its version resumes; anyone else starts fresh.
    let resuming = match last_known_version {
        Some(version) if session.is_member(&participant_id).await => {
            session.record_known_version(participant_id, version).await?;
            true
        }
        None if session.is_member(&participant_id).await => {
            session.leave_session(participant_id).await;
            shared.transport.release(participant_id);
            false
        }
        _ => false,
    };

    let (mut outgoing, generation) = shared.transport.connect(participant_id);
    if !resuming {
        if let Err(e) = session.join_session(participant_id).await {
            log::warn!("Participant {participant_id} refused by {document_id}: {e}");
            shared.transport.release(participant_id);
            send(&mut ws_sender, &ServerMessage::Error { message: e.to_string() }).await?;
            shared.registry.remove_if_empty(&document_id).await;
            return Ok(());
        }
    }

    {
        let mut s = shared.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }
    log::info!(
        "Participant {participant_id} {} document {document_id} from {addr}",
        if resuming { "resumed" } else { "joined" }
    );

    let result = pump(
        &mut ws_sender,
        &mut ws_receiver,
        &mut outgoing,
        &handle,
        &shared,
        participant_id,
    )
    .await;

    let left = matches!(result, Ok(true));
    if left {
        session.leave_session(participant_id).await;
        shared.transport.release(participant_id);
        shared.registry.remove_if_empty(&document_id).await;
    } else {
        // Keep membership so the participant can resume.
        shared.transport.disconnect(participant_id, generation);
    }

    {
        let mut s = shared.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
    }
    log::info!("Connection closed from {addr} ({participant_id}, left: {left})");
    result.map(|_| ())
}

/// Move frames until the connection ends. Returns `true` on an explicit
/// `Leave`.
async fn pump(
    ws_sender: &mut WsSink,
    ws_receiver: &mut WsSource,
    outgoing: &mut tokio::sync::mpsc::UnboundedReceiver<ServerMessage>,
    handle: &SessionHandle,
    shared: &Shared,
    participant_id: ParticipantId,
) -> Result<bool, BoxError> {
    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        {
                            let mut s = shared.stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += data.len() as u64;
                        }
                        match ClientMessage::decode(&data) {
                            Ok(message) => {
                                if dispatch(handle, shared, participant_id, message).await {
                                    return Ok(true);
                                }
                            }
                            Err(e) => {
                                log::warn!("Failed to decode message from {participant_id}: {e}");
                                shared.transport.send_to(
                                    participant_id,
                                    &ServerMessage::Error { message: e.to_string() },
                                );
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(false),
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {participant_id}: {e}");
                        return Ok(false);
                    }
                    _ => {}
                }
            }

            msg = outgoing.recv() => {
                match msg {
                    Some(message) => send(ws_sender, &message).await?,
                    // Superseded by a newer connection
                    None => return Ok(false),
                }
            }
        }
    }
}

/// Handle one client frame. Returns `true` when the participant leaves.
async fn dispatch(
    handle: &SessionHandle,
    shared: &Shared,
    participant_id: ParticipantId,
    message: ClientMessage,
) -> bool {
    let session = &handle.session;
    let reply_error = |message: String| {
        shared
            .transport
            .send_to(participant_id, &ServerMessage::Error { message });
    };

    match message {
        ClientMessage::Submit { operation } => {
            let operation_id = operation.id;
            if let Err(e) = session.submit_operation(participant_id, operation).await {
                log::debug!("Rejected op {operation_id} from {participant_id}: {e}");
                shared.stats.write().await.rejected_operations += 1;
                shared.transport.send_to(
                    participant_id,
                    &ServerMessage::OperationRejected {
                        operation_id,
                        reason: e.to_string(),
                        retryable: e.is_retryable(),
                    },
                );
            }
        }
        ClientMessage::Cursor { position } => {
            if let Err(e) = session.update_cursor(participant_id, position).await {
                reply_error(e.to_string());
            }
        }
        ClientMessage::Selection { selection } => {
            if let Err(e) = session.update_selection(participant_id, selection).await {
                reply_error(e.to_string());
            }
        }
        ClientMessage::Ack { version } => {
            if let Err(e) = handle.controller.acknowledge(participant_id, version).await {
                reply_error(e.to_string());
            }
        }
        ClientMessage::RequestSnapshot => {
            if let Err(e) = session.send_snapshot(participant_id).await {
                reply_error(e.to_string());
            }
        }
        ClientMessage::LockSection { section_id, start, end } => {
            if let Err(e) = session.lock_section(participant_id, section_id, start, end).await {
                reply_error(e.to_string());
            }
        }
        ClientMessage::UnlockSection { section_id } => {
            if let Err(e) = session.unlock_section(participant_id, &section_id).await {
                reply_error(e.to_string());
            }
        }
        ClientMessage::ListParticipants => {
            let participants = session.participants().await;
            let locks = session.section_locks().await;
            shared
                .transport
                .send_to(participant_id, &ServerMessage::Participants { participants, locks });
        }
        ClientMessage::Ping => {
            shared.transport.send_to(participant_id, &ServerMessage::Pong);
        }
        ClientMessage::Leave => return true,
        ClientMessage::Join { .. } => reply_error("already joined".to_string()),
    }
    false
}
