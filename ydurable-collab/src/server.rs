//! WebSocket sync server with path-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐  ws://host/notes
//!             ├──► DocumentActor("notes") ── SharedDoc ── PersistenceEngine
//! Client B ──┘                                                │
//!                                                             ▼
//! Client C ─────► DocumentActor("todo")  ── ... ──────► Store (RocksDB)
//!                                                      v1:ydoc@notes:*
//!                                                      v1:ydoc@todo:*
//! ```
//!
//! Each socket gets one task: incoming binary frames go to the document's
//! actor, outgoing frames arrive through a per-socket queue that the hub
//! writes into. All documents share one [`Store`]; each has its own key
//! space and its own transaction scope.
//!
//! A document's actor is activated by the first session and evicted once
//! its last session detaches; the next session hydrates it again from
//! storage.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, OnceCell, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::actor::{ActorError, ActorHandle, ActorOptions, DocumentActor};
use crate::hub::{HubOptions, Sink};
use crate::persistence::{PersistenceConfig, PersistenceEngine};
use crate::presence::OUTDATED_TIMEOUT;
use crate::storage::{RocksBackend, StorageError, Store, StoreConfig};

/// Attach attempts per socket when the actor stops underneath it.
const ATTACH_ATTEMPTS: usize = 3;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    pub persistence: PersistenceConfig,
    /// Hub event channel capacity per document
    pub event_capacity: usize,
    /// Stale-presence sweep interval in milliseconds
    pub presence_check_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            persistence: PersistenceConfig::default(),
            event_capacity: 256,
            presence_check_interval_ms: 3000,
        }
    }
}

impl ServerConfig {
    fn actor_options(&self) -> ActorOptions {
        ActorOptions {
            hub: HubOptions {
                event_capacity: self.event_capacity,
                presence_timeout: OUTDATED_TIMEOUT,
            },
            presence_check_interval: Duration::from_millis(self.presence_check_interval_ms.max(1)),
            stop_when_idle: true,
        }
    }
}

/// Server errors.
#[derive(Debug)]
pub enum ServerError {
    Storage(StorageError),
    Io(std::io::Error),
    WebSocket(tokio_tungstenite::tungstenite::Error),
    Actor(ActorError),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Storage(e) => write!(f, "Storage error: {e}"),
            ServerError::Io(e) => write!(f, "I/O error: {e}"),
            ServerError::WebSocket(e) => write!(f, "WebSocket error: {e}"),
            ServerError::Actor(e) => write!(f, "Actor error: {e}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<StorageError> for ServerError {
    fn from(e: StorageError) -> Self {
        ServerError::Storage(e)
    }
}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        ServerError::Io(e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ServerError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ServerError::WebSocket(e)
    }
}

impl From<ActorError> for ServerError {
    fn from(e: ActorError) -> Self {
        ServerError::Actor(e)
    }
}

/// Document name addressed by a request path: `/notes?x=1` → `notes`.
pub fn document_name_from_path(path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    path.trim_matches('/').to_string()
}

/// Activation slot: empty until the document is hydrated.
type Slot = Arc<OnceCell<ActorHandle>>;

/// The sync server.
#[derive(Clone)]
pub struct SyncServer {
    config: ServerConfig,
    store: Store,
    /// Document name → actor slot
    actors: Arc<RwLock<HashMap<String, Slot>>>,
}

impl SyncServer {
    /// Create a server, opening RocksDB if `storage_path` is set.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let store = match &config.storage_path {
            Some(path) => {
                let backend = RocksBackend::open(StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                })?;
                log::info!("Opened document store at {}", path.display());
                Store::new(Arc::new(backend))
            }
            None => Store::memory(),
        };
        Ok(Self::with_store(config, store))
    }

    /// Create a server over an existing store.
    pub fn with_store(config: ServerConfig, store: Store) -> Self {
        Self {
            config,
            store,
            actors: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// In-memory server on the default address.
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), Store::memory())
    }

    /// RocksDB-backed server.
    pub fn with_storage(
        bind_addr: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Result<Self, ServerError> {
        Self::new(ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Number of activated documents.
    pub async fn document_count(&self) -> usize {
        self.actors
            .read()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    /// Actor for `name`, activating (and hydrating) it on first use.
    ///
    /// Hydration runs outside the map lock, so a slow document never
    /// delays sessions of other documents. Concurrent callers for the
    /// same name wait on one activation.
    pub async fn actor(&self, name: &str) -> Result<ActorHandle, ActorError> {
        let slot = self.slot(name).await;
        match slot.get_or_try_init(|| self.activate(name, &slot)).await {
            Ok(handle) => Ok(handle.clone()),
            Err(e) => {
                let mut actors = self.actors.write().await;
                if actors
                    .get(name)
                    .is_some_and(|current| Arc::ptr_eq(current, &slot) && !current.initialized())
                {
                    actors.remove(name);
                }
                Err(e)
            }
        }
    }

    async fn slot(&self, name: &str) -> Slot {
        let mut actors = self.actors.write().await;
        let stale = actors
            .get(name)
            .and_then(|slot| slot.get())
            .is_some_and(ActorHandle::is_closed);
        if stale {
            actors.remove(name);
        }
        Arc::clone(actors.entry(name.to_string()).or_default())
    }

    async fn activate(&self, name: &str, slot: &Slot) -> Result<ActorHandle, ActorError> {
        let engine = PersistenceEngine::for_document(
            self.store.clone(),
            name,
            self.config.persistence.clone(),
        );
        let handle =
            DocumentActor::activate(name, engine, self.config.actor_options(), Vec::new()).await?;

        let actors = Arc::clone(&self.actors);
        let slot = Arc::clone(slot);
        let watched = handle.clone();
        tokio::spawn(async move {
            watched.closed().await;
            let mut actors = actors.write().await;
            if actors
                .get(watched.name())
                .is_some_and(|current| Arc::ptr_eq(current, &slot))
            {
                actors.remove(watched.name());
                log::info!("Evicted idle document '{}'", watched.name());
            }
        });
        Ok(handle)
    }

    /// Bind `bind_addr` and serve forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept loop over an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), ServerError> {
        let mut path = String::new();
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            path = req.uri().path().to_string();
            Ok::<_, ErrorResponse>(resp)
        })
        .await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let name = document_name_from_path(&path);
        let session = Uuid::new_v4();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Arc<Vec<u8>>>();

        let mut attempt = 1;
        let actor = loop {
            let actor = self.actor(&name).await?;
            let sink_tx = out_tx.clone();
            let sink: Sink = Box::new(move |bytes| {
                sink_tx.send(bytes).ok();
            });
            match actor.attach(session, sink).await {
                Ok(_) => break actor,
                // Evicted between lookup and attach.
                Err(ActorError::Closed) if attempt < ATTACH_ATTEMPTS => {
                    log::debug!("'{name}' stopped before session {session} attached, retrying");
                    attempt += 1;
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e.into()),
            }
        };
        drop(out_tx);
        log::info!("Session {session} from {addr} attached to '{name}'");

        let result = self
            .pump(&actor, session, &mut ws_sender, &mut ws_receiver, &mut out_rx)
            .await;

        actor.detach(session).await?;
        log::info!("Session {session} from {addr} detached from '{name}'");
        result
    }

    async fn pump<W, R>(
        &self,
        actor: &ActorHandle,
        session: Uuid,
        ws_sender: &mut W,
        ws_receiver: &mut R,
        out_rx: &mut mpsc::UnboundedReceiver<Arc<Vec<u8>>>,
    ) -> Result<(), ServerError>
    where
        W: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
        R: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            actor.deliver(session, data.to_vec()).await?;
                        }
                        Some(Ok(Message::Text(_))) => {
                            log::debug!("Session {session}: ignoring text message");
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Ok(());
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error on session {session}: {e}");
                            return Ok(());
                        }
                        _ => {}
                    }
                }

                outgoing = out_rx.recv() => {
                    match outgoing {
                        Some(bytes) => {
                            ws_sender.send(Message::Binary(bytes.as_ref().clone().into())).await?;
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }
}
