//! Message delivery between a session and its participants.
//!
//! The session never talks to sockets directly. It hands messages to a
//! [`Transport`], which routes them per document and reports connectivity
//! changes through registered callbacks.
//!
//! [`ChannelTransport`] is the in-process implementation: one unbounded
//! channel per connected participant. The WebSocket server drains those
//! channels into sockets; tests drain them directly.
//!
//! ```text
//!                       ┌────────────── ChannelTransport ──────────────┐
//! Session ─ broadcast ─►│ rooms: doc ─► {pid, pid, pid}                │
//!         ─ send_to ───►│ channels: pid ─► mpsc ─────────────────────► │──► connection
//!                       │ connect / disconnect ─► callbacks            │
//!                       └──────────────────────────────────────────────┘
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use concord_core::ParticipantId;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::ServerMessage;

/// Invoked with the participant whose connectivity changed.
pub type ConnectivityCallback = Arc<dyn Fn(ParticipantId) + Send + Sync>;

/// Delivery interface used by sessions.
///
/// Sends must not block: sessions call them while holding the document
/// lock so that every participant observes commits in log order.
pub trait Transport: Send + Sync {
    /// Route messages for `document_id` to `participant_id`.
    fn subscribe(&self, document_id: Uuid, participant_id: ParticipantId);

    /// Stop routing; drops the participant's connectivity callbacks once it
    /// is no longer routed anywhere.
    fn unsubscribe(&self, document_id: Uuid, participant_id: ParticipantId);

    /// Deliver to every subscriber of `document_id` except `exclude`.
    /// Returns the number of participants reached.
    fn broadcast(
        &self,
        document_id: Uuid,
        exclude: Option<ParticipantId>,
        message: &ServerMessage,
    ) -> usize;

    /// Deliver to one participant. `false` if it is not reachable.
    fn send_to(&self, participant_id: ParticipantId, message: &ServerMessage) -> bool;

    fn on_disconnect(&self, participant_id: ParticipantId, callback: ConnectivityCallback);

    fn on_reconnect(&self, participant_id: ParticipantId, callback: ConnectivityCallback);
}

/// Transport statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub connected_participants: usize,
    pub documents: usize,
}

struct Connection {
    sender: mpsc::UnboundedSender<ServerMessage>,
    generation: u64,
}

#[derive(Default)]
struct Handlers {
    disconnect: Vec<ConnectivityCallback>,
    reconnect: Vec<ConnectivityCallback>,
}

#[derive(Default)]
struct Routes {
    connections: HashMap<ParticipantId, Connection>,
    rooms: HashMap<Uuid, HashSet<ParticipantId>>,
    handlers: HashMap<ParticipantId, Handlers>,
    /// Participants that lost their connection and may come back
    offline: HashSet<ParticipantId>,
    next_generation: u64,
}

impl Routes {
    fn is_routed(&self, participant_id: &ParticipantId) -> bool {
        self.rooms.values().any(|members| members.contains(participant_id))
    }
}

/// In-process transport over tokio unbounded channels.
#[derive(Default)]
pub struct ChannelTransport {
    routes: Mutex<Routes>,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn routes(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a channel for `participant_id`.
    ///
    /// Returns the receiving end and a generation number identifying this
    /// connection. A participant coming back after [`ChannelTransport::disconnect`]
    /// triggers its reconnect callbacks; one replacing a live connection
    /// triggers disconnect then reconnect.
    pub fn connect(
        &self,
        participant_id: ParticipantId,
    ) -> (mpsc::UnboundedReceiver<ServerMessage>, u64) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (generation, fired) = {
            let mut routes = self.routes();
            let generation = routes.next_generation;
            routes.next_generation += 1;
            let replaced = routes
                .connections
                .insert(participant_id, Connection { sender, generation })
                .is_some();
            let returning = routes.offline.remove(&participant_id);
            let mut fired = Vec::new();
            if let Some(handlers) = routes.handlers.get(&participant_id) {
                if replaced {
                    fired.extend(handlers.disconnect.iter().cloned());
                }
                if replaced || returning {
                    fired.extend(handlers.reconnect.iter().cloned());
                }
            }
            (generation, fired)
        };

        log::debug!("Participant {participant_id} connected (generation {generation})");
        for callback in fired {
            callback(participant_id);
        }
        (receiver, generation)
    }

    /// Drop the connection opened as `generation`.
    ///
    /// Ignored when a newer connection has already replaced it.
    pub fn disconnect(&self, participant_id: ParticipantId, generation: u64) -> bool {
        let fired = {
            let mut routes = self.routes();
            match routes.connections.get(&participant_id) {
                Some(conn) if conn.generation == generation => {}
                _ => return false,
            }
            routes.connections.remove(&participant_id);
            routes.offline.insert(participant_id);
            routes
                .handlers
                .get(&participant_id)
                .map(|h| h.disconnect.clone())
                .unwrap_or_default()
        };

        log::debug!("Participant {participant_id} disconnected (generation {generation})");
        for callback in fired {
            callback(participant_id);
        }
        true
    }

    /// Forget a participant entirely without firing callbacks.
    pub fn release(&self, participant_id: ParticipantId) {
        let mut routes = self.routes();
        routes.connections.remove(&participant_id);
        routes.offline.remove(&participant_id);
        routes.handlers.remove(&participant_id);
        for members in routes.rooms.values_mut() {
            members.remove(&participant_id);
        }
        routes.rooms.retain(|_, members| !members.is_empty());
    }

    pub fn is_connected(&self, participant_id: &ParticipantId) -> bool {
        self.routes().connections.contains_key(participant_id)
    }

    pub fn subscribers(&self, document_id: &Uuid) -> Vec<ParticipantId> {
        self.routes()
            .rooms
            .get(document_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> TransportStats {
        let routes = self.routes();
        TransportStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            connected_participants: routes.connections.len(),
            documents: routes.rooms.len(),
        }
    }

    fn deliver(&self, routes: &Routes, participant_id: &ParticipantId, message: &ServerMessage) -> bool {
        let delivered = routes
            .connections
            .get(participant_id)
            .is_some_and(|conn| conn.sender.send(message.clone()).is_ok());
        if delivered {
            self.messages_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.messages_dropped.fetch_add(1, Ordering::Relaxed);
            log::trace!("Dropped {} for unreachable {participant_id}", message.kind());
        }
        delivered
    }
}

impl Transport for ChannelTransport {
    fn subscribe(&self, document_id: Uuid, participant_id: ParticipantId) {
        self.routes()
            .rooms
            .entry(document_id)
            .or_default()
            .insert(participant_id);
    }

    fn unsubscribe(&self, document_id: Uuid, participant_id: ParticipantId) {
        let mut routes = self.routes();
        if let Some(members) = routes.rooms.get_mut(&document_id) {
            members.remove(&participant_id);
            if members.is_empty() {
                routes.rooms.remove(&document_id);
            }
        }
        if !routes.is_routed(&participant_id) {
            routes.handlers.remove(&participant_id);
        }
    }

    fn broadcast(
        &self,
        document_id: Uuid,
        exclude: Option<ParticipantId>,
        message: &ServerMessage,
    ) -> usize {
        let routes = self.routes();
        let Some(members) = routes.rooms.get(&document_id) else {
            return 0;
        };
        members
            .iter()
            .filter(|pid| Some(**pid) != exclude)
            .filter(|pid| self.deliver(&routes, pid, message))
            .count()
    }

    fn send_to(&self, participant_id: ParticipantId, message: &ServerMessage) -> bool {
        let routes = self.routes();
        self.deliver(&routes, &participant_id, message)
    }

    fn on_disconnect(&self, participant_id: ParticipantId, callback: ConnectivityCallback) {
        self.routes()
            .handlers
            .entry(participant_id)
            .or_default()
            .disconnect
            .push(callback);
    }

    fn on_reconnect(&self, participant_id: ParticipantId, callback: ConnectivityCallback) {
        self.routes()
            .handlers
            .entry(participant_id)
            .or_default()
            .reconnect
            .push(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, ConnectivityCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let callback: ConnectivityCallback = Arc::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (count, callback)
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let transport = ChannelTransport::new();
        let doc = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let (mut rx_a, _) = transport.connect(alice);
        let (mut rx_b, _) = transport.connect(bob);
        transport.subscribe(doc, alice);
        transport.subscribe(doc, bob);

        let reached = transport.broadcast(doc, Some(alice), &ServerMessage::Pong);
        assert_eq!(reached, 1);
        assert_eq!(rx_b.recv().await, Some(ServerMessage::Pong));
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_to_unknown_is_dropped() {
        let transport = ChannelTransport::new();
        assert!(!transport.send_to(Uuid::new_v4(), &ServerMessage::Pong));
        assert_eq!(transport.stats().messages_dropped, 1);
    }

    #[tokio::test]
    async fn test_documents_are_isolated() {
        let transport = ChannelTransport::new();
        let doc1 = Uuid::new_v4();
        let doc2 = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let (_rx_a, _) = transport.connect(alice);
        let (mut rx_b, _) = transport.connect(bob);
        transport.subscribe(doc1, alice);
        transport.subscribe(doc2, bob);

        assert_eq!(transport.broadcast(doc1, None, &ServerMessage::Pong), 1);
        assert!(rx_b.try_recv().is_err());
        assert_eq!(transport.stats().documents, 2);
    }

    #[tokio::test]
    async fn test_disconnect_then_connect_fires_callbacks() {
        let transport = ChannelTransport::new();
        let alice = Uuid::new_v4();
        let (lost, on_lost) = counter();
        let (back, on_back) = counter();

        let (_rx, generation) = transport.connect(alice);
        transport.on_disconnect(alice, on_lost);
        transport.on_reconnect(alice, on_back);

        assert!(transport.disconnect(alice, generation));
        assert_eq!(lost.load(Ordering::SeqCst), 1);
        assert!(!transport.is_connected(&alice));

        let (_rx, _) = transport.connect(alice);
        assert_eq!(back.load(Ordering::SeqCst), 1);
        assert!(transport.is_connected(&alice));
    }

    #[tokio::test]
    async fn test_stale_disconnect_is_ignored() {
        let transport = ChannelTransport::new();
        let alice = Uuid::new_v4();
        let (lost, on_lost) = counter();
        let (back, on_back) = counter();

        let (_old, old_generation) = transport.connect(alice);
        transport.on_disconnect(alice, on_lost);
        transport.on_reconnect(alice, on_back);

        // Replacing a live connection counts as a drop and a return
        let (_new, _) = transport.connect(alice);
        assert_eq!(lost.load(Ordering::SeqCst), 1);
        assert_eq!(back.load(Ordering::SeqCst), 1);

        assert!(!transport.disconnect(alice, old_generation));
        assert!(transport.is_connected(&alice));
        assert_eq!(lost.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_drops_handlers() {
        let transport = ChannelTransport::new();
        let doc = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let (lost, on_lost) = counter();

        let (_rx, generation) = transport.connect(alice);
        transport.subscribe(doc, alice);
        transport.on_disconnect(alice, on_lost);
        transport.unsubscribe(doc, alice);

        transport.disconnect(alice, generation);
        assert_eq!(lost.load(Ordering::SeqCst), 0);
        assert!(transport.subscribers(&doc).is_empty());
    }

    #[tokio::test]
    async fn test_release_forgets_everything() {
        let transport = ChannelTransport::new();
        let doc = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let (back, on_back) = counter();

        let (_rx, generation) = transport.connect(alice);
        transport.subscribe(doc, alice);
        transport.on_reconnect(alice, on_back);
        transport.disconnect(alice, generation);
        transport.release(alice);

        let (_rx, _) = transport.connect(alice);
        assert_eq!(back.load(Ordering::SeqCst), 0);
        assert_eq!(transport.stats().documents, 0);
    }
}
