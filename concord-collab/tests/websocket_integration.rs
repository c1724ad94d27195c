//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients,
//! verifying the full sync pipeline.

use concord_collab::{
    ClientMessage, ConnectionState, Presence, ServerConfig, ServerMessage, SessionConfig,
    SyncClient, SyncEvent, SyncServer,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return the URL.
async fn start_test_server() -> String {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        session: SessionConfig::for_testing(),
    };
    let server = SyncServer::new(config);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("ws://127.0.0.1:{port}")
}

/// Wait for the first event matching `pred`, skipping others.
async fn wait_for(
    events: &mut UnboundedReceiver<SyncEvent>,
    pred: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    let found = timeout(Duration::from_secs(2), async {
        while let Some(event) = events.recv().await {
            if pred(&event) {
                return Some(event);
            }
        }
        None
    })
    .await;
    match found {
        Ok(Some(event)) => event,
        other => panic!("Expected event not received: {other:?}"),
    }
}

async fn joined_client(url: &str, doc_id: Uuid) -> (SyncClient, UnboundedReceiver<SyncEvent>) {
    let mut client = SyncClient::new(Uuid::new_v4(), doc_id, url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::Resynced { .. })).await;
    (client, events)
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let url = start_test_server().await;
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_client_joins_and_resyncs() {
    let url = start_test_server().await;
    let (client, _events) = joined_client(&url, Uuid::new_v4()).await;
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
    assert_eq!(client.version().await, 0);
    assert_eq!(client.text().await, "");
}

#[tokio::test]
async fn test_second_client_is_announced() {
    let url = start_test_server().await;
    let doc_id = Uuid::new_v4();
    let (_alice, mut alice_events) = joined_client(&url, doc_id).await;
    let (bob, _bob_events) = joined_client(&url, doc_id).await;

    let event = wait_for(&mut alice_events, |e| matches!(e, SyncEvent::ParticipantJoined(_))).await;
    assert_eq!(event, SyncEvent::ParticipantJoined(bob.participant_id()));
}

#[tokio::test]
async fn test_edits_reach_other_client() {
    let url = start_test_server().await;
    let doc_id = Uuid::new_v4();
    let (alice, mut alice_events) = joined_client(&url, doc_id).await;
    let (bob, mut bob_events) = joined_client(&url, doc_id).await;

    alice.insert(0, "hello").await.unwrap();
    wait_for(&mut alice_events, |e| matches!(e, SyncEvent::Acknowledged { .. })).await;
    wait_for(&mut bob_events, |e| matches!(e, SyncEvent::RemoteOperation { .. })).await;

    bob.insert(5, " world").await.unwrap();
    wait_for(&mut bob_events, |e| matches!(e, SyncEvent::Acknowledged { .. })).await;
    wait_for(&mut alice_events, |e| matches!(e, SyncEvent::RemoteOperation { .. })).await;

    assert_eq!(alice.text().await, "hello world");
    assert_eq!(bob.text().await, "hello world");
    assert_eq!(alice.version().await, 2);
}

#[tokio::test]
async fn test_concurrent_client_edits_converge() {
    let url = start_test_server().await;
    let doc_id = Uuid::new_v4();
    let (alice, mut alice_events) = joined_client(&url, doc_id).await;
    let (bob, mut bob_events) = joined_client(&url, doc_id).await;

    alice.insert(0, "left").await.unwrap();
    bob.insert(0, "right").await.unwrap();

    let settled = timeout(Duration::from_secs(2), async {
        loop {
            let (a, b) = (alice.text().await, bob.text().await);
            if a == b && a.len() == 9 && alice.unacknowledged().await == 0 && bob.unacknowledged().await == 0 {
                return a;
            }
            // Keep the event queues drained
            while alice_events.try_recv().is_ok() {}
            while bob_events.try_recv().is_ok() {}
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    let text = settled.expect("Clients never converged");
    assert!(text == "leftright" || text == "rightleft");
}

#[tokio::test]
async fn test_cursor_presence_sync() {
    let url = start_test_server().await;
    let doc_id = Uuid::new_v4();
    let (alice, _alice_events) = joined_client(&url, doc_id).await;
    let (_bob, mut bob_events) = joined_client(&url, doc_id).await;

    alice.update_cursor(7).await.unwrap();
    let event = wait_for(&mut bob_events, |e| matches!(e, SyncEvent::PresenceUpdate { .. })).await;
    assert_eq!(
        event,
        SyncEvent::PresenceUpdate {
            participant_id: alice.participant_id(),
            presence: Presence::Cursor { position: 7 },
        }
    );
}

#[tokio::test]
async fn test_reconnect_resumes_with_missed_operations() {
    let url = start_test_server().await;
    let doc_id = Uuid::new_v4();
    let (alice, mut alice_events) = joined_client(&url, doc_id).await;
    let (mut bob, mut bob_events) = joined_client(&url, doc_id).await;

    bob.disconnect().await;
    assert_eq!(bob.connection_state().await, ConnectionState::Disconnected);
    // Let the server notice the closed socket
    tokio::time::sleep(Duration::from_millis(100)).await;

    alice.insert(0, "missed").await.unwrap();
    wait_for(&mut alice_events, |e| matches!(e, SyncEvent::Acknowledged { .. })).await;
    // Edits made offline wait for the resync
    bob.insert(0, ">").await.unwrap();

    bob.reconnect().await.unwrap();
    wait_for(&mut bob_events, |e| matches!(e, SyncEvent::Resynced { version: 1 })).await;
    wait_for(&mut bob_events, |e| matches!(e, SyncEvent::Acknowledged { .. })).await;
    wait_for(&mut alice_events, |e| matches!(e, SyncEvent::RemoteOperation { .. })).await;

    assert_eq!(bob.text().await, alice.text().await);
    assert_eq!(bob.version().await, 2);
}

#[tokio::test]
async fn test_locked_section_refuses_other_client() {
    let url = start_test_server().await;
    let doc_id = Uuid::new_v4();
    let (mut alice, mut alice_events) = joined_client(&url, doc_id).await;
    let (bob, mut bob_events) = joined_client(&url, doc_id).await;
    alice.insert(0, "hello world").await.unwrap();
    wait_for(&mut alice_events, |e| matches!(e, SyncEvent::Acknowledged { .. })).await;
    wait_for(&mut bob_events, |e| matches!(e, SyncEvent::RemoteOperation { .. })).await;

    alice.lock_section("title", 0, 5).await.unwrap();
    let event = wait_for(&mut bob_events, |e| matches!(e, SyncEvent::SectionLocked(_))).await;
    let SyncEvent::SectionLocked(lock) = event else {
        unreachable!()
    };
    assert_eq!(lock.holder, alice.participant_id());
    assert_eq!((lock.start, lock.end), (0, 5));

    // Bob's optimistic edit is refused and rolled back by a snapshot
    bob.insert(2, "x").await.unwrap();
    wait_for(&mut bob_events, |e| matches!(e, SyncEvent::Rejected { retryable: false, .. })).await;
    wait_for(&mut bob_events, |e| matches!(e, SyncEvent::Resynced { version: 1 })).await;
    assert_eq!(bob.text().await, "hello world");
    assert_eq!(bob.unacknowledged().await, 0);

    bob.list_participants().await.unwrap();
    let event = wait_for(&mut bob_events, |e| matches!(e, SyncEvent::Participants { .. })).await;
    let SyncEvent::Participants { participants, locks } = event else {
        unreachable!()
    };
    assert_eq!(participants.len(), 2);
    assert_eq!(locks, vec![lock]);

    alice.leave().await.unwrap();
    let event = wait_for(&mut bob_events, |e| matches!(e, SyncEvent::SectionUnlocked { .. })).await;
    assert_eq!(
        event,
        SyncEvent::SectionUnlocked {
            section_id: "title".into(),
            participant_id: alice.participant_id()
        }
    );
    bob.insert(2, "x").await.unwrap();
    wait_for(&mut bob_events, |e| matches!(e, SyncEvent::Acknowledged { .. })).await;
    assert_eq!(bob.text().await, "hexllo world");
}

#[tokio::test]
async fn test_rejoin_after_leave_starts_fresh() {
    let url = start_test_server().await;
    let doc_id = Uuid::new_v4();
    let (alice, mut alice_events) = joined_client(&url, doc_id).await;
    let (mut bob, _bob_events) = joined_client(&url, doc_id).await;
    alice.insert(0, "kept").await.unwrap();
    wait_for(&mut alice_events, |e| matches!(e, SyncEvent::Acknowledged { .. })).await;

    bob.leave().await.unwrap();
    let event = wait_for(&mut alice_events, |e| matches!(e, SyncEvent::ParticipantLeft(_))).await;
    assert_eq!(event, SyncEvent::ParticipantLeft(bob.participant_id()));

    let (carol, _carol_events) = joined_client(&url, doc_id).await;
    assert_eq!(carol.text().await, "kept");
}

#[tokio::test]
async fn test_first_message_must_be_join() {
    let url = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let ping = ClientMessage::Ping.encode().unwrap();
    ws.send(Message::Binary(ping.into())).await.unwrap();

    let reply = timeout(Duration::from_secs(2), ws.next()).await.unwrap();
    match reply {
        Some(Ok(Message::Binary(data))) => {
            let msg = ServerMessage::decode(&data).unwrap();
            assert!(matches!(msg, ServerMessage::Error { .. }));
        }
        other => panic!("Expected error frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_ping_pong() {
    let url = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let join = ClientMessage::Join {
        document_id: Uuid::new_v4(),
        participant_id: Uuid::new_v4(),
        last_known_version: None,
    };
    ws.send(Message::Binary(join.encode().unwrap().into())).await.unwrap();
    ws.send(Message::Binary(ClientMessage::Ping.encode().unwrap().into()))
        .await
        .unwrap();

    let pong = timeout(Duration::from_secs(2), async {
        while let Some(Ok(frame)) = ws.next().await {
            if let Message::Binary(data) = frame {
                if ServerMessage::decode(&data).unwrap() == ServerMessage::Pong {
                    return true;
                }
            }
        }
        false
    })
    .await;
    assert!(matches!(pong, Ok(true)), "No pong received");
}
