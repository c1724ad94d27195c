//! # concord-collab — Sessions, presence and sync for concord documents
//!
//! Hosts up to [`DEFAULT_CAPACITY`] participants per document around an
//! authoritative [`concord_core::DocumentReplica`], and carries their
//! edits over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────────────────────────┐
//! │ SyncClient  │ ◄────────────────► │ SyncServer                      │
//! │ LocalDoc    │   bincode frames   │  SessionRegistry                │
//! └─────────────┘                    │   └─ Session ── PresenceTracker │
//!                                    │        │    └── Reconnection-   │
//!                                    │        │        Controller      │
//!                                    │   ChannelTransport (fan-out)    │
//!                                    │   MemoryCheckpointStore (LZ4)   │
//!                                    └─────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`session`] — join/leave, submit with rebase, resync, integrity
//! - [`presence`] — participant state, cursors and selections
//! - [`sections`] — exclusive section locks
//! - [`reconnect`] — connection status machine and resync driver
//! - [`transport`] — delivery seam and the in-process channel transport
//! - [`checkpoint`] — compressed snapshots of verified state
//! - [`registry`] — document id to session mapping
//! - [`protocol`] — binary wire protocol
//! - [`server`] — WebSocket server
//! - [`client`] — WebSocket client with optimistic local editing
//! - [`config`] — session and server settings

pub mod checkpoint;
pub mod client;
pub mod config;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod reconnect;
pub mod registry;
pub mod sections;
pub mod server;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use checkpoint::{CheckpointStats, CheckpointStore, MemoryCheckpointStore, StoredCheckpoint};
pub use client::{ConnectionState, Incoming, LocalDocument, SyncClient, SyncEvent};
pub use config::{ServerConfig, SessionConfig, DEFAULT_CAPACITY};
pub use error::{CollabError, ConfigError, ProtocolError, StoreError};
pub use presence::{ParticipantEntry, ParticipantState, PresenceTracker, Selection};
pub use protocol::{ClientMessage, Presence, ServerMessage};
pub use reconnect::{ConnectionStatus, ConnectivityEvent, ReconnectionController, Transition};
pub use registry::{SessionHandle, SessionRegistry};
pub use sections::{SectionLock, SectionLocks};
pub use server::{ServerStats, SyncServer};
pub use session::{AppliedOperation, ResyncPlan, Session};
pub use transport::{ChannelTransport, ConnectivityCallback, Transport, TransportStats};
