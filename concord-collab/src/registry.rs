//! Maps document ids to live sessions.
//!
//! Each document gets its own [`Session`] and [`ReconnectionController`],
//! so edits and presence are isolated between documents. A session is
//! opened from the newest checkpoint when one exists.

use std::collections::HashMap;
use std::sync::Arc;

use concord_core::DocumentReplica;
use tokio::sync::RwLock;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::checkpoint::CheckpointStore;
use crate::config::SessionConfig;
use crate::reconnect::ReconnectionController;
use crate::session::Session;
use crate::transport::Transport;

/// A live session and the controller consuming its connectivity events.
#[derive(Clone)]
pub struct SessionHandle {
    pub session: Arc<Session>,
    pub controller: Arc<ReconnectionController>,
    events_task: Option<AbortHandle>,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, SessionHandle>>,
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
            transport,
            checkpoints: None,
        }
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Get or open the session for `document_id`.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn get_or_create(&self, document_id: Uuid) -> SessionHandle {
        // Fast path: read lock
        if let Some(handle) = self.sessions.read().await.get(&document_id) {
            return handle.clone();
        }

        let mut sessions = self.sessions.write().await;
        // Double-check after acquiring write lock
        if let Some(handle) = sessions.get(&document_id) {
            return handle.clone();
        }

        let handle = self.open(document_id);
        sessions.insert(document_id, handle.clone());
        handle
    }

    fn open(&self, document_id: Uuid) -> SessionHandle {
        let restored = self.checkpoints.as_ref().and_then(|store| {
            match store.latest(document_id) {
                Ok(found) => found,
                Err(e) => {
                    log::warn!("Ignoring unreadable checkpoint for {document_id}: {e}");
                    None
                }
            }
        });

        let mut session = match restored {
            Some(snapshot) => {
                log::info!("Opening {document_id} from checkpoint v{}", snapshot.version);
                let replica =
                    DocumentReplica::from_snapshot(&snapshot, self.config.retention_threshold);
                Session::with_replica(replica, self.config.clone(), self.transport.clone())
            }
            None => {
                log::info!("Opening new document {document_id}");
                Session::new(document_id, "", self.config.clone(), self.transport.clone())
            }
        };
        if let Some(store) = &self.checkpoints {
            session = session.with_checkpoint_store(store.clone());
        }

        let session = Arc::new(session);
        let controller = Arc::new(ReconnectionController::new(session.clone()));
        let events_task = session
            .take_connectivity_events()
            .map(|events| controller.clone().spawn(events).abort_handle());
        SessionHandle {
            session,
            controller,
            events_task,
        }
    }

    pub async fn get(&self, document_id: &Uuid) -> Option<SessionHandle> {
        self.sessions.read().await.get(document_id).cloned()
    }

    /// Close and drop the session if nobody is joined.
    ///
    /// The final checkpoint runs without the registry lock held. The entry
    /// is dropped afterwards only if the session is still empty and
    /// unchanged; otherwise it stays open.
    pub async fn remove_if_empty(&self, document_id: &Uuid) -> bool {
        let Some(handle) = self.get(document_id).await else {
            return false;
        };
        if handle.session.participant_count().await > 0 {
            return false;
        }
        let version = handle.session.version().await;
        handle.session.close().await;

        let mut sessions = self.sessions.write().await;
        let unchanged = match sessions.get(document_id) {
            Some(current) => Arc::ptr_eq(&current.session, &handle.session),
            None => false,
        };
        if !unchanged
            || handle.session.participant_count().await > 0
            || handle.session.version().await != version
        {
            log::debug!("Session {document_id} became busy while closing; kept open");
            return false;
        }
        sessions.remove(document_id);
        drop(sessions);

        if let Some(task) = &handle.events_task {
            task.abort();
        }
        log::info!("Session {document_id} removed (empty)");
        true
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<Uuid> {
        self.sessions.read().await.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::transport::ChannelTransport;
    use concord_core::Operation;

    fn registry() -> (SessionRegistry, Arc<MemoryCheckpointStore>) {
        let store = Arc::new(MemoryCheckpointStore::new());
        let registry = SessionRegistry::new(SessionConfig::default(), Arc::new(ChannelTransport::new()))
            .with_checkpoint_store(store.clone());
        (registry, store)
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_session() {
        let (registry, _) = registry();
        let doc = Uuid::new_v4();
        let a = registry.get_or_create(doc).await;
        let b = registry.get_or_create(doc).await;
        assert!(Arc::ptr_eq(&a.session, &b.session));
        assert_eq!(registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_multiple_documents() {
        let (registry, _) = registry();
        let doc1 = Uuid::new_v4();
        let doc2 = Uuid::new_v4();
        registry.get_or_create(doc1).await;
        registry.get_or_create(doc2).await;
        let docs = registry.active_documents().await;
        assert!(docs.contains(&doc1));
        assert!(docs.contains(&doc2));
    }

    #[tokio::test]
    async fn test_empty_session_is_checkpointed_and_reopened() {
        let (registry, store) = registry();
        let doc = Uuid::new_v4();
        let alice = Uuid::new_v4();

        let handle = registry.get_or_create(doc).await;
        handle.session.join_session(alice).await.unwrap();
        handle
            .session
            .submit_operation(alice, Operation::insert(1, alice, 0, 0, "kept"))
            .await
            .unwrap();

        assert!(!registry.remove_if_empty(&doc).await);
        handle.session.leave_session(alice).await;
        assert!(registry.remove_if_empty(&doc).await);
        assert_eq!(registry.session_count().await, 0);
        assert_eq!(store.stats().documents, 1);

        let reopened = registry.get_or_create(doc).await;
        let snapshot = reopened.session.snapshot().await;
        assert_eq!(snapshot.text(), "kept");
        assert_eq!(snapshot.version, 1);
    }

    /// Holds every checkpoint call until released.
    struct GatedStore {
        inner: MemoryCheckpointStore,
        entered: std::sync::Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
        release: std::sync::Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl CheckpointStore for GatedStore {
        fn checkpoint(&self, document_id: Uuid, snapshot: &concord_core::Snapshot) -> Result<(), crate::error::StoreError> {
            if let Some(entered) = self.entered.lock().unwrap().take() {
                let _ = entered.send(());
                let _ = self
                    .release
                    .lock()
                    .unwrap()
                    .recv_timeout(std::time::Duration::from_secs(5));
            }
            self.inner.checkpoint(document_id, snapshot)
        }

        fn latest(&self, document_id: Uuid) -> Result<Option<concord_core::Snapshot>, crate::error::StoreError> {
            self.inner.latest(document_id)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_registry_stays_usable_while_a_session_closes() {
        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let store = Arc::new(GatedStore {
            inner: MemoryCheckpointStore::new(),
            entered: std::sync::Mutex::new(Some(entered_tx)),
            release: std::sync::Mutex::new(release_rx),
        });
        let registry = Arc::new(
            SessionRegistry::new(SessionConfig::default(), Arc::new(ChannelTransport::new()))
                .with_checkpoint_store(store.clone()),
        );
        let doc = Uuid::new_v4();
        registry.get_or_create(doc).await;

        let closing = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.remove_if_empty(&doc).await })
        };
        entered_rx.await.unwrap();

        // The final checkpoint is still blocked here
        let other = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            registry.get_or_create(Uuid::new_v4()),
        )
        .await;
        assert!(other.is_ok());
        assert_eq!(registry.session_count().await, 2);

        release_tx.send(()).unwrap();
        assert!(closing.await.unwrap());
        assert_eq!(registry.session_count().await, 1);
        assert!(store.inner.latest(doc).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_session_joined_again_is_not_removed() {
        let (registry, _) = registry();
        let doc = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let handle = registry.get_or_create(doc).await;
        handle.session.join_session(alice).await.unwrap();
        assert!(!registry.remove_if_empty(&doc).await);
        assert!(!registry.remove_if_empty(&Uuid::new_v4()).await);
        assert_eq!(registry.session_count().await, 1);
    }
}
