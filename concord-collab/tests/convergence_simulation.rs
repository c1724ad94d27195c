//! Randomized multi-participant editing through a session.
//!
//! Participants edit, submit and receive in arbitrary interleavings; once
//! every queue is drained all of them must hold the server's document.

use std::collections::VecDeque;
use std::sync::Arc;

use concord_collab::{ChannelTransport, Incoming, LocalDocument, ServerMessage, Session, SessionConfig};
use concord_core::Operation;
use proptest::prelude::*;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

const PARTICIPANTS: usize = 3;

#[derive(Debug, Clone)]
enum Step {
    Edit {
        participant: usize,
        kind: u8,
        position: usize,
        length: usize,
        text: String,
    },
    Deliver { participant: usize },
    Submit { participant: usize },
}

fn step() -> impl Strategy<Value = Step> {
    let participant = 0..PARTICIPANTS;
    prop_oneof![
        (
            participant.clone(),
            0u8..4,
            any::<usize>(),
            prop_oneof![1 => Just(0usize), 3 => any::<usize>()],
            "[x-z]{0,3}",
        )
            .prop_map(|(participant, kind, position, length, text)| Step::Edit {
                participant,
                kind,
                position,
                length,
                text,
            }),
        participant.clone().prop_map(|participant| Step::Deliver { participant }),
        participant.prop_map(|participant| Step::Submit { participant }),
    ]
}

/// A client without a socket: server messages are read from its transport
/// channel one at a time, and submissions wait in `outbox`.
struct Participant {
    id: Uuid,
    rx: UnboundedReceiver<ServerMessage>,
    doc: LocalDocument,
    outbox: VecDeque<Operation>,
}

impl Participant {
    async fn join(session: &Session, transport: &ChannelTransport) -> Self {
        let id = Uuid::new_v4();
        let (rx, _) = transport.connect(id);
        session.join_session(id).await.unwrap();
        let mut participant = Self {
            id,
            rx,
            doc: LocalDocument::new(id),
            outbox: VecDeque::new(),
        };
        while participant.deliver(session).await {}
        participant
    }

    fn edit(&mut self, kind: u8, position: usize, length: usize, text: &str) {
        let len = self.doc.content().len();
        let position = position % (len + 1);
        let length = length % (len - position + 1);
        match kind {
            0 => self.doc.insert(position, text),
            1 => self.doc.replace(position, length, text),
            2 => self.doc.delete(position, length),
            _ => self.doc.format(position, length, "bold"),
        }
        .unwrap();
        self.outbox.extend(self.doc.take_next());
    }

    /// Handle one queued message; `false` when none is waiting.
    async fn deliver(&mut self, session: &Session) -> bool {
        let Ok(message) = self.rx.try_recv() else {
            return false;
        };
        let next = match message {
            ServerMessage::ResyncSnapshot { snapshot } => {
                self.doc.reset(&snapshot);
                None
            }
            ServerMessage::ResyncComplete { version } => {
                session.acknowledge(self.id, version).await.unwrap();
                self.doc.complete_resync()
            }
            ServerMessage::OperationApplied { operation, version } => {
                match self.doc.on_remote(&operation, version).unwrap() {
                    Incoming::Applied(_) => None,
                    other => panic!("{other:?} for remote v{version}"),
                }
            }
            ServerMessage::OperationAcknowledged { operation_id, version } => {
                match self.doc.on_ack(operation_id, version) {
                    Incoming::Confirmed(next) => next,
                    other => panic!("{other:?} for ack of {operation_id} at v{version}"),
                }
            }
            _ => None,
        };
        self.outbox.extend(next);
        true
    }

    async fn submit(&mut self, session: &Session) {
        if let Some(op) = self.outbox.pop_front() {
            session.submit_operation(self.id, op).await.unwrap();
        }
    }
}

async fn run(steps: &[Step]) {
    let transport = Arc::new(ChannelTransport::new());
    let config = SessionConfig {
        checkpoint_interval: 0,
        ..SessionConfig::default()
    };
    let session = Session::new(Uuid::new_v4(), "hello world", config, transport.clone());
    let mut participants = Vec::new();
    for _ in 0..PARTICIPANTS {
        participants.push(Participant::join(&session, &transport).await);
    }

    for step in steps {
        match step {
            Step::Edit {
                participant,
                kind,
                position,
                length,
                text,
            } => participants[*participant].edit(*kind, *position, *length, text),
            Step::Deliver { participant } => {
                participants[*participant].deliver(&session).await;
            }
            Step::Submit { participant } => participants[*participant].submit(&session).await,
        }
    }

    loop {
        let mut busy = false;
        for participant in participants.iter_mut() {
            if !participant.outbox.is_empty() {
                participant.submit(&session).await;
                busy = true;
            }
            while participant.deliver(&session).await {
                busy = true;
            }
        }
        if !busy {
            break;
        }
    }

    let server = session.snapshot().await;
    for participant in &participants {
        assert_eq!(participant.doc.content(), &server.content);
        assert_eq!(participant.doc.version(), server.version);
        assert_eq!(participant.doc.unacknowledged(), 0);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn test_participants_converge_with_server(steps in prop::collection::vec(step(), 1..80)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(run(&steps));
    }
}

#[tokio::test]
async fn test_superseded_edit_after_concurrent_delete() {
    let steps = [
        // 0 and 1 replace the same span concurrently; 1 commits first
        Step::Edit { participant: 1, kind: 1, position: 8, length: 2, text: "XY".into() },
        Step::Submit { participant: 1 },
        Step::Edit { participant: 0, kind: 1, position: 8, length: 2, text: "Q".into() },
        // 2 sees the winner, then cuts the front of the document
        Step::Deliver { participant: 2 },
        Step::Deliver { participant: 2 },
        Step::Edit { participant: 2, kind: 2, position: 0, length: 5, text: String::new() },
        Step::Submit { participant: 2 },
        Step::Submit { participant: 0 },
    ];
    run(&steps).await;
}
