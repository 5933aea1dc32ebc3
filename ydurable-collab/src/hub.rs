//! Shared document hub: one live CRDT document, N connections.
//!
//! The hub owns the document, the presence state and the connection
//! registry. It is driven by three calls from its host
//! ([`SharedDoc::setup_conn`], [`SharedDoc::message`],
//! [`SharedDoc::close_conn`]) which must be delivered one at a time.
//!
//! ```text
//!  conn A ──bytes──► message() ──► Frame::decode
//!                                    │
//!            ┌───────────────────────┼──────────────────────────┐
//!            ▼ sync                  ▼ awareness                ▼ other
//!   apply to Doc / reply step2   Presence::apply_update      ignored
//!            │                       │
//!   observe_update_v1 queue          │ PresenceChange
//!            │                       ▼
//!            ▼                 broadcast kind=1 to all
//!   broadcast kind=0 to all
//!   bridge.on_update(update)
//! ```
//!
//! Broadcasts go to every registered connection, the originator included.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use yrs::updates::decoder::Decode;
use yrs::{Doc, Options, ReadTxn, StateVector, Subscription, Transact, Update};

use crate::persistence::{PersistenceEngine, PersistenceError};
use crate::presence::{ClientId, Presence, PresenceChange, OUTDATED_TIMEOUT};
use crate::protocol::{Frame, MessageKind, ProtocolError, SyncMessage};

/// Outbound frame sink of one connection.
pub type Sink = Box<dyn Fn(Arc<Vec<u8>>) + Send + Sync>;

/// Opaque handle of a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Durable side of the hub.
///
/// `on_update` receives every raw document update, `on_close_all` runs
/// when the last connection leaves.
#[async_trait]
pub trait PersistenceBridge: Send + Sync {
    async fn on_update(&self, update: &[u8]) -> Result<(), PersistenceError>;
    async fn on_close_all(&self) -> Result<(), PersistenceError>;
}

#[async_trait]
impl PersistenceBridge for PersistenceEngine {
    async fn on_update(&self, update: &[u8]) -> Result<(), PersistenceError> {
        self.store_update(update).await.map(|_| ())
    }

    async fn on_close_all(&self) -> Result<(), PersistenceError> {
        self.flush_document().await
    }
}

/// Hub errors, reported through [`HubEvent::Error`].
#[derive(Debug, Clone, PartialEq)]
pub enum HubError {
    Protocol(ProtocolError),
    Persistence(PersistenceError),
    UnknownConnection(ConnectionId),
    /// The document refused an observer registration
    Document(String),
}

impl std::fmt::Display for HubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HubError::Protocol(e) => write!(f, "Protocol error: {e}"),
            HubError::Persistence(e) => write!(f, "Persistence error: {e}"),
            HubError::UnknownConnection(id) => write!(f, "Unknown connection: {id}"),
            HubError::Document(e) => write!(f, "Document error: {e}"),
        }
    }
}

impl std::error::Error for HubError {}

impl From<ProtocolError> for HubError {
    fn from(e: ProtocolError) -> Self {
        HubError::Protocol(e)
    }
}

impl From<PersistenceError> for HubError {
    fn from(e: PersistenceError) -> Self {
        HubError::Persistence(e)
    }
}

/// Observable hub events.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    /// A message or persistence call failed; the hub state is unchanged
    Error {
        conn: Option<ConnectionId>,
        error: HubError,
    },
    PresenceChanged {
        origin: Option<ConnectionId>,
        change: PresenceChange,
    },
}

/// Hub tunables.
#[derive(Debug, Clone)]
pub struct HubOptions {
    /// Buffered events per subscriber (default: 256)
    pub event_capacity: usize,
    /// Presence entries older than this are pruned (default: 30s)
    pub presence_timeout: Duration,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            event_capacity: 256,
            presence_timeout: OUTDATED_TIMEOUT,
        }
    }
}

struct Connection {
    /// Presence client ids contributed by this connection
    presence_ids: BTreeSet<ClientId>,
    sink: Sink,
}

/// The live document of one document instance.
pub struct SharedDoc {
    doc: Doc,
    /// Raw updates captured by the document observer, drained after each mutation
    pending: Arc<Mutex<Vec<Vec<u8>>>>,
    _update_sub: Subscription,
    presence: Presence,
    conns: BTreeMap<ConnectionId, Connection>,
    next_conn: u64,
    bridge: Option<Arc<dyn PersistenceBridge>>,
    events: broadcast::Sender<HubEvent>,
}

impl SharedDoc {
    pub fn new(bridge: Option<Arc<dyn PersistenceBridge>>) -> Result<Self, HubError> {
        Self::with_options(bridge, HubOptions::default())
    }

    pub fn with_options(
        bridge: Option<Arc<dyn PersistenceBridge>>,
        options: HubOptions,
    ) -> Result<Self, HubError> {
        let doc = Doc::with_options(Options {
            skip_gc: true,
            ..Options::default()
        });

        let pending: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let queue = Arc::clone(&pending);
        let update_sub = doc
            .observe_update_v1(move |_txn, event| {
                if let Ok(mut queue) = queue.lock() {
                    queue.push(event.update.clone());
                }
            })
            .map_err(|e| HubError::Document(e.to_string()))?;

        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        Ok(Self {
            doc,
            pending,
            _update_sub: update_sub,
            presence: Presence::with_timeout(options.presence_timeout),
            conns: BTreeMap::new(),
            next_conn: 0,
            bridge,
            events,
        })
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    pub fn is_connected(&self, conn: ConnectionId) -> bool {
        self.conns.contains_key(&conn)
    }

    /// Presence ids contributed by `conn`, ascending.
    pub fn presence_ids(&self, conn: ConnectionId) -> Option<Vec<ClientId>> {
        self.conns
            .get(&conn)
            .map(|c| c.presence_ids.iter().copied().collect())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }

    /// Load persisted state into the live document.
    ///
    /// The state is already durable, so it is neither broadcast nor handed
    /// to the bridge.
    pub fn hydrate(&mut self, persisted: &Doc) -> Result<(), HubError> {
        let state = persisted
            .transact()
            .encode_state_as_update_v1(&StateVector::default());
        let update = Update::decode_v1(&state)
            .map_err(|e| ProtocolError::InvalidUpdate(e.to_string()))?;
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| ProtocolError::InvalidUpdate(e.to_string()))?;
        }
        let discarded = self.take_pending().len();
        log::debug!("Hydrated shared doc ({} bytes, {discarded} updates)", state.len());
        Ok(())
    }

    /// Register a connection and send it the initial sync frames.
    pub fn setup_conn(&mut self, sink: Sink) -> ConnectionId {
        let id = ConnectionId(self.next_conn);
        self.next_conn += 1;

        let sv = self.doc.transact().state_vector();
        sink(Arc::new(Frame::sync_step1(&sv).encode()));

        let clients = self.presence.client_ids();
        if !clients.is_empty() {
            sink(Arc::new(Frame::Awareness(self.presence.encode_update(&clients)).encode()));
        }

        self.conns.insert(
            id,
            Connection {
                presence_ids: BTreeSet::new(),
                sink,
            },
        );
        log::info!("{id} attached ({} connections)", self.conns.len());
        id
    }

    /// Handle one inbound binary message from `conn`.
    ///
    /// Returns the message kind, or `None` when the message was rejected.
    /// Rejections are logged and reported as [`HubEvent::Error`]; the
    /// connection stays registered.
    pub async fn message(&mut self, conn: ConnectionId, bytes: &[u8]) -> Option<MessageKind> {
        let result = self.dispatch(conn, bytes);
        self.flush_updates().await;
        match result {
            Ok(kind) => Some(kind),
            Err(error) => {
                log::warn!("{conn}: rejected message: {error}");
                self.emit(HubEvent::Error {
                    conn: Some(conn),
                    error,
                });
                None
            }
        }
    }

    /// Unregister `conn` and drop its presence entries.
    ///
    /// Returns `false` if `conn` was not registered. Calls the bridge's
    /// `on_close_all` when this removes the last connection.
    pub async fn close_conn(&mut self, conn: ConnectionId) -> bool {
        let Some(entry) = self.conns.remove(&conn) else {
            return false;
        };
        log::info!("{conn} detached ({} connections)", self.conns.len());

        let ids: Vec<ClientId> = entry.presence_ids.into_iter().collect();
        let removed = self.presence.remove_states(&ids);
        self.on_presence_change(None, PresenceChange::removed(removed));

        if self.conns.is_empty() {
            if let Some(bridge) = self.bridge.clone() {
                if let Err(e) = bridge.on_close_all().await {
                    self.report_persistence_error(e);
                }
            }
        }
        true
    }

    /// Run a server-side mutation; resulting updates are broadcast and
    /// persisted like client updates.
    pub async fn transact_local<F, R>(&mut self, f: F) -> R
    where
        F: FnOnce(&Doc) -> R,
    {
        let result = f(&self.doc);
        self.flush_updates().await;
        result
    }

    /// Drop presence entries that timed out and broadcast their removal.
    pub fn prune_presence(&mut self, now: Instant) -> Vec<ClientId> {
        let removed = self.presence.prune_outdated(now);
        self.on_presence_change(None, PresenceChange::removed(removed.clone()));
        removed
    }

    fn dispatch(&mut self, conn: ConnectionId, bytes: &[u8]) -> Result<MessageKind, HubError> {
        if !self.conns.contains_key(&conn) {
            return Err(HubError::UnknownConnection(conn));
        }
        let frame = Frame::decode(bytes)?;
        let kind = frame.kind();
        match frame {
            Frame::Sync(msg) => self.handle_sync(conn, msg)?,
            Frame::Awareness(update) => {
                let change = self.presence.apply_update(&update)?;
                self.on_presence_change(Some(conn), change);
            }
            Frame::Other(tag) => log::debug!("{conn}: ignoring message kind {tag}"),
        }
        Ok(kind)
    }

    fn handle_sync(&mut self, conn: ConnectionId, msg: SyncMessage) -> Result<(), ProtocolError> {
        match msg {
            SyncMessage::SyncStep1(sv) => {
                let sv = StateVector::decode_v1(&sv)
                    .map_err(|e| ProtocolError::InvalidUpdate(e.to_string()))?;
                let diff = self.doc.transact().encode_state_as_update_v1(&sv);
                self.send(conn, Arc::new(Frame::sync_step2(diff).encode()));
            }
            SyncMessage::SyncStep2(update) | SyncMessage::Update(update) => {
                let update = Update::decode_v1(&update)
                    .map_err(|e| ProtocolError::InvalidUpdate(e.to_string()))?;
                let mut txn = self.doc.transact_mut();
                txn.apply_update(update)
                    .map_err(|e| ProtocolError::InvalidUpdate(e.to_string()))?;
            }
        }
        Ok(())
    }

    fn on_presence_change(&mut self, origin: Option<ConnectionId>, change: PresenceChange) {
        if change.is_empty() {
            return;
        }
        if let Some(entry) = origin.and_then(|id| self.conns.get_mut(&id)) {
            entry
                .presence_ids
                .extend(change.added.iter().chain(&change.updated).copied());
            for id in &change.removed {
                entry.presence_ids.remove(id);
            }
        }

        let frame = Frame::Awareness(self.presence.encode_update(&change.all())).encode();
        self.broadcast(Arc::new(frame));
        self.emit(HubEvent::PresenceChanged { origin, change });
    }

    /// Broadcast and persist every update the document emitted.
    async fn flush_updates(&mut self) {
        for update in self.take_pending() {
            self.broadcast(Arc::new(Frame::update(update.clone()).encode()));
            if let Some(bridge) = self.bridge.clone() {
                if let Err(e) = bridge.on_update(&update).await {
                    self.report_persistence_error(e);
                }
            }
        }
    }

    fn take_pending(&self) -> Vec<Vec<u8>> {
        self.pending
            .lock()
            .map(|mut queue| std::mem::take(&mut *queue))
            .unwrap_or_default()
    }

    fn send(&self, conn: ConnectionId, frame: Arc<Vec<u8>>) {
        if let Some(entry) = self.conns.get(&conn) {
            (entry.sink)(frame);
        }
    }

    fn broadcast(&self, frame: Arc<Vec<u8>>) {
        for entry in self.conns.values() {
            (entry.sink)(Arc::clone(&frame));
        }
    }

    fn report_persistence_error(&self, e: PersistenceError) {
        log::error!("Persistence bridge failed: {e}");
        self.emit(HubEvent::Error {
            conn: None,
            error: HubError::Persistence(e),
        });
    }

    fn emit(&self, event: HubEvent) {
        // No subscribers is fine.
        self.events.send(event).ok();
    }
}
