//! Per-document actor: one task owning one hub and one persistence engine.
//!
//! Every attach, message and detach for a document goes through the
//! actor's queue, so the hub sees them one at a time and persistence
//! calls finish before the next event is handled.
//!
//! ```text
//! socket tasks ──Command──► mpsc ──► DocumentActor::run
//!                                       │   ├─ SharedDoc (live doc + presence)
//!                                       │   └─ PersistenceEngine (Store)
//!                                       └─ every 3s: prune stale presence
//! ```
//!
//! With [`ActorOptions::stop_when_idle`] the task ends once its last
//! session detaches.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;
use yrs::Doc;

use crate::hub::{ConnectionId, HubError, HubEvent, HubOptions, PersistenceBridge, SharedDoc, Sink};
use crate::persistence::{PersistenceEngine, PersistenceError};
use crate::presence::CHECK_INTERVAL;
use crate::protocol::MessageKind;

/// Actor errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ActorError {
    /// Loading the persisted document failed
    Persistence(PersistenceError),
    Hub(HubError),
    /// The actor task has stopped
    Closed,
}

impl std::fmt::Display for ActorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorError::Persistence(e) => write!(f, "Persistence error: {e}"),
            ActorError::Hub(e) => write!(f, "Hub error: {e}"),
            ActorError::Closed => write!(f, "Document actor closed"),
        }
    }
}

impl std::error::Error for ActorError {}

impl From<PersistenceError> for ActorError {
    fn from(e: PersistenceError) -> Self {
        ActorError::Persistence(e)
    }
}

impl From<HubError> for ActorError {
    fn from(e: HubError) -> Self {
        ActorError::Hub(e)
    }
}

/// Actor tunables.
#[derive(Debug, Clone)]
pub struct ActorOptions {
    pub hub: HubOptions,
    /// Interval between stale-presence sweeps (default: 3s)
    pub presence_check_interval: Duration,
    /// Stop the actor once its last session detaches (default: false)
    pub stop_when_idle: bool,
}

impl Default for ActorOptions {
    fn default() -> Self {
        Self {
            hub: HubOptions::default(),
            presence_check_interval: CHECK_INTERVAL,
            stop_when_idle: false,
        }
    }
}

type LocalEdit = Box<dyn FnOnce(&Doc) + Send>;

enum Command {
    Attach {
        session: Uuid,
        sink: Sink,
        reply: oneshot::Sender<bool>,
    },
    Deliver {
        session: Uuid,
        bytes: Vec<u8>,
        reply: oneshot::Sender<Option<MessageKind>>,
    },
    Detach {
        session: Uuid,
        reply: oneshot::Sender<bool>,
    },
    GetYDoc {
        reply: oneshot::Sender<Result<Doc, PersistenceError>>,
    },
    Local {
        edit: LocalEdit,
        reply: oneshot::Sender<()>,
    },
    ConnectionCount {
        reply: oneshot::Sender<usize>,
    },
    Subscribe {
        reply: oneshot::Sender<broadcast::Receiver<HubEvent>>,
    },
}

/// Owner of one document's hub and engine.
pub struct DocumentActor {
    name: String,
    hub: SharedDoc,
    engine: PersistenceEngine,
    /// Transport session → hub connection
    sessions: HashMap<Uuid, ConnectionId>,
    stop_when_idle: bool,
    stopping: bool,
}

impl DocumentActor {
    /// Hydrate the document, re-attach `surviving` sessions and start the
    /// actor task.
    ///
    /// The returned handle only exists once hydration finished, so no new
    /// session can attach to a partially loaded document.
    pub async fn activate(
        name: impl Into<String>,
        engine: PersistenceEngine,
        options: ActorOptions,
        surviving: Vec<(Uuid, Sink)>,
    ) -> Result<ActorHandle, ActorError> {
        let name = name.into();
        let bridge: Arc<dyn PersistenceBridge> = Arc::new(engine.clone());
        let mut hub = SharedDoc::with_options(Some(bridge), options.hub.clone())?;

        let persisted = engine.get_ydoc().await?;
        hub.hydrate(&persisted)?;

        let mut sessions = HashMap::new();
        for (session, sink) in surviving {
            sessions.insert(session, hub.setup_conn(sink));
        }
        log::info!(
            "Activated document '{name}' ({} surviving sessions)",
            sessions.len()
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let actor = DocumentActor {
            name: name.clone(),
            hub,
            engine,
            sessions,
            stop_when_idle: options.stop_when_idle,
            stopping: false,
        };
        tokio::spawn(actor.run(rx, options.presence_check_interval));
        Ok(ActorHandle { name, tx })
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>, check_interval: Duration) {
        let mut ticker = tokio::time::interval(check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately.
        ticker.tick().await;

        while !self.stopping {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                _ = ticker.tick() => {
                    self.hub.prune_presence(Instant::now());
                }
            }
        }
        // Commands still queued are dropped with `rx`; their callers see
        // `ActorError::Closed`.
        log::info!("Document actor '{}' stopped", self.name);
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Attach {
                session,
                sink,
                reply,
            } => {
                let attached = if self.sessions.contains_key(&session) {
                    log::warn!("'{}': session {session} already attached", self.name);
                    false
                } else {
                    let conn = self.hub.setup_conn(sink);
                    self.sessions.insert(session, conn);
                    true
                };
                reply.send(attached).ok();
            }
            Command::Deliver {
                session,
                bytes,
                reply,
            } => {
                let kind = match self.sessions.get(&session).copied() {
                    Some(conn) => self.hub.message(conn, &bytes).await,
                    None => {
                        log::debug!("'{}': dropping message from detached session {session}", self.name);
                        None
                    }
                };
                reply.send(kind).ok();
            }
            Command::Detach { session, reply } => {
                let detached = match self.sessions.remove(&session) {
                    Some(conn) => self.hub.close_conn(conn).await,
                    None => false,
                };
                if detached && self.stop_when_idle && self.hub.connection_count() == 0 {
                    log::info!("'{}': last session detached, stopping", self.name);
                    self.stopping = true;
                }
                reply.send(detached).ok();
            }
            Command::GetYDoc { reply } => {
                reply.send(self.engine.get_ydoc().await).ok();
            }
            Command::Local { edit, reply } => {
                self.hub.transact_local(edit).await;
                reply.send(()).ok();
            }
            Command::ConnectionCount { reply } => {
                reply.send(self.hub.connection_count()).ok();
            }
            Command::Subscribe { reply } => {
                reply.send(self.hub.subscribe()).ok();
            }
        }
    }
}

/// Cloneable address of a running [`DocumentActor`].
#[derive(Clone)]
pub struct ActorHandle {
    name: String,
    tx: mpsc::UnboundedSender<Command>,
}

impl ActorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the actor task has stopped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ActorError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).map_err(|_| ActorError::Closed)?;
        rx.await.map_err(|_| ActorError::Closed)
    }

    /// Attach a transport session. Returns `false` if it was already attached.
    pub async fn attach(&self, session: Uuid, sink: Sink) -> Result<bool, ActorError> {
        self.request(|reply| Command::Attach {
            session,
            sink,
            reply,
        })
        .await
    }

    /// Deliver one binary message; `None` means it was rejected or the
    /// session is not attached.
    pub async fn deliver(
        &self,
        session: Uuid,
        bytes: Vec<u8>,
    ) -> Result<Option<MessageKind>, ActorError> {
        self.request(|reply| Command::Deliver {
            session,
            bytes,
            reply,
        })
        .await
    }

    /// Detach a session. Repeated detaches return `false`.
    pub async fn detach(&self, session: Uuid) -> Result<bool, ActorError> {
        self.request(|reply| Command::Detach { session, reply }).await
    }

    /// Document as currently persisted.
    pub async fn get_ydoc(&self) -> Result<Doc, ActorError> {
        Ok(self.request(|reply| Command::GetYDoc { reply }).await??)
    }

    /// Mutate the live document from the server side.
    pub async fn transact_local<F, R>(&self, f: F) -> Result<R, ActorError>
    where
        F: FnOnce(&Doc) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let edit: LocalEdit = Box::new(move |doc| {
            result_tx.send(f(doc)).ok();
        });
        self.request(|reply| Command::Local { edit, reply }).await?;
        result_rx.await.map_err(|_| ActorError::Closed)
    }

    pub async fn connection_count(&self) -> Result<usize, ActorError> {
        self.request(|reply| Command::ConnectionCount { reply }).await
    }

    pub async fn subscribe(&self) -> Result<broadcast::Receiver<HubEvent>, ActorError> {
        self.request(|reply| Command::Subscribe { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::PersistenceConfig;
    use crate::protocol::{Frame, SyncMessage};
    use crate::storage::Store;
    use std::sync::Mutex;
    use yrs::{GetString, ReadTxn, StateVector, Text, Transact};

    type Outbox = Arc<Mutex<Vec<Frame>>>;

    fn sink() -> (Sink, Outbox) {
        let outbox: Outbox = Arc::new(Mutex::new(Vec::new()));
        let target = Arc::clone(&outbox);
        let sink: Sink = Box::new(move |bytes: Arc<Vec<u8>>| {
            target.lock().unwrap().push(Frame::decode(&bytes).unwrap());
        });
        (sink, outbox)
    }

    fn text_update(text: &str) -> Vec<u8> {
        let doc = Doc::new();
        let shared = doc.get_or_insert_text("text");
        {
            let mut txn = doc.transact_mut();
            shared.insert(&mut txn, 0, text);
        }
        let update = doc.transact().encode_state_as_update_v1(&StateVector::default());
        update
    }

    fn text_of(doc: &Doc) -> String {
        let shared = doc.get_or_insert_text("text");
        let txn = doc.transact();
        shared.get_string(&txn)
    }

    fn engine(store: &Store) -> PersistenceEngine {
        PersistenceEngine::for_document(store.clone(), "doc", PersistenceConfig::default())
    }

    #[tokio::test]
    async fn test_activation_hydrates_before_attach() {
        let store = Store::memory();
        engine(&store).store_update(&text_update("persisted")).await.unwrap();

        let handle = DocumentActor::activate("doc", engine(&store), ActorOptions::default(), vec![])
            .await
            .unwrap();
        let (s, outbox) = sink();
        handle.attach(Uuid::new_v4(), s).await.unwrap();

        // The step 1 frame advertises the hydrated state.
        let frames = outbox.lock().unwrap().clone();
        match &frames[0] {
            Frame::Sync(SyncMessage::SyncStep1(sv)) => assert_ne!(sv, &vec![0u8]),
            other => panic!("expected step 1, got {other:?}"),
        }
        // Hydration appended nothing.
        assert_eq!(engine(&store).stats().await.unwrap().pending_updates, 1);
    }

    #[tokio::test]
    async fn test_deliver_persists_update() {
        let store = Store::memory();
        let handle = DocumentActor::activate("doc", engine(&store), ActorOptions::default(), vec![])
            .await
            .unwrap();
        let session = Uuid::new_v4();
        let (s, _outbox) = sink();
        handle.attach(session, s).await.unwrap();

        let kind = handle
            .deliver(session, Frame::update(text_update("UpdateFromClient")).encode())
            .await
            .unwrap();

        assert_eq!(kind, Some(MessageKind::Sync));
        assert_eq!(text_of(&handle.get_ydoc().await.unwrap()), "UpdateFromClient");
    }

    #[tokio::test]
    async fn test_duplicate_detach_is_suppressed() {
        let store = Store::memory();
        let handle = DocumentActor::activate("doc", engine(&store), ActorOptions::default(), vec![])
            .await
            .unwrap();
        let session = Uuid::new_v4();
        let (s, _outbox) = sink();
        assert!(handle.attach(session, s).await.unwrap());
        let (again, _) = sink();
        assert!(!handle.attach(session, again).await.unwrap());

        handle
            .deliver(session, Frame::update(text_update("x")).encode())
            .await
            .unwrap();
        assert!(handle.detach(session).await.unwrap());
        assert!(!handle.detach(session).await.unwrap());

        // Last detach flushed the log into one chunk.
        let stats = engine(&store).stats().await.unwrap();
        assert_eq!(stats.pending_updates, 0);
        assert_eq!(stats.chunks, 1);
        assert_eq!(handle.connection_count().await.unwrap(), 0);
        assert_eq!(handle.deliver(session, vec![2]).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_surviving_sessions_reattached() {
        let store = Store::memory();
        let session = Uuid::new_v4();
        let (s, outbox) = sink();

        let handle = DocumentActor::activate(
            "doc",
            engine(&store),
            ActorOptions::default(),
            vec![(session, s)],
        )
        .await
        .unwrap();

        assert_eq!(handle.connection_count().await.unwrap(), 1);
        assert_eq!(outbox.lock().unwrap().len(), 1);
        assert!(handle.detach(session).await.unwrap());
    }

    #[tokio::test]
    async fn test_transact_local_reaches_clients_and_storage() {
        let store = Store::memory();
        let handle = DocumentActor::activate("doc", engine(&store), ActorOptions::default(), vec![])
            .await
            .unwrap();
        let (s, outbox) = sink();
        handle.attach(Uuid::new_v4(), s).await.unwrap();

        let len = handle
            .transact_local(|doc| {
                let text = doc.get_or_insert_text("text");
                let mut txn = doc.transact_mut();
                text.insert(&mut txn, 0, "server");
                text.len(&txn)
            })
            .await
            .unwrap();

        assert_eq!(len, 6);
        assert!(matches!(
            outbox.lock().unwrap().last(),
            Some(Frame::Sync(SyncMessage::Update(_)))
        ));
        assert_eq!(text_of(&handle.get_ydoc().await.unwrap()), "server");
    }

    #[tokio::test]
    async fn test_stale_presence_pruned_by_ticker() {
        let store = Store::memory();
        let options = ActorOptions {
            hub: HubOptions {
                presence_timeout: Duration::from_millis(50),
                ..HubOptions::default()
            },
            presence_check_interval: Duration::from_millis(10),
            ..ActorOptions::default()
        };
        let handle = DocumentActor::activate("doc", engine(&store), options, vec![])
            .await
            .unwrap();
        let mut events = handle.subscribe().await.unwrap();
        let session = Uuid::new_v4();
        let (s, _outbox) = sink();
        handle.attach(session, s).await.unwrap();

        let update = crate::presence::PresenceEntry::encode_all(&[crate::presence::PresenceEntry::new(
            5,
            1,
            Some(serde_json::json!({"name": "ann"})),
        )]);
        handle.deliver(session, Frame::Awareness(update).encode()).await.unwrap();

        let removed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(HubEvent::PresenceChanged { origin: None, change }) = events.recv().await {
                    return change.removed;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(removed, vec![5]);
    }

    #[tokio::test]
    async fn test_idle_actor_stops_after_last_detach() {
        let store = Store::memory();
        let options = ActorOptions {
            stop_when_idle: true,
            ..ActorOptions::default()
        };
        let handle = DocumentActor::activate("doc", engine(&store), options, vec![])
            .await
            .unwrap();
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        handle.attach(first, sink().0).await.unwrap();
        handle.attach(second, sink().0).await.unwrap();
        handle
            .deliver(first, Frame::update(text_update("kept")).encode())
            .await
            .unwrap();

        assert!(handle.detach(first).await.unwrap());
        assert!(!handle.is_closed());
        assert!(handle.detach(second).await.unwrap());

        tokio::time::timeout(Duration::from_secs(2), handle.closed())
            .await
            .unwrap();
        assert_eq!(handle.connection_count().await, Err(ActorError::Closed));
        assert_eq!(engine(&store).stats().await.unwrap().chunks, 1);
    }

    fn assert_send<T: Send>() {}

    #[test]
    fn test_actor_can_be_spawned() {
        assert_send::<DocumentActor>();
        assert_send::<ActorHandle>();
        assert_send::<SharedDoc>();
    }
}
