//! # ydurable-collab: Durable shared documents over WebSocket
//!
//! One live CRDT document per document name, synced to every connected
//! client and persisted as an append-only update log that is periodically
//! packed into size-bounded chunks.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌────────────────┐
//! │ y-websocket │ ◄─────────────────► │ SyncServer     │
//! │ client      │   sync + awareness  │ (path routing) │
//! └─────────────┘                     └───────┬────────┘
//!                                             │ one per document
//!                                     ┌───────▼────────┐
//!                                     │ DocumentActor  │
//!                                     │  └ SharedDoc   │ fan-out, presence
//!                                     └───────┬────────┘
//!                                             │ on_update / on_close_all
//!                                     ┌───────▼────────┐
//!                                     │PersistenceEngine│ log + chunks
//!                                     └───────┬────────┘
//!                                     ┌───────▼────────┐
//!                                     │ Store          │ memory | RocksDB
//!                                     └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`storage`]: Ordered key-value store with atomic transactions
//! - [`persistence`]: Update log, chunk packing, document reconstruction
//! - [`protocol`]: Binary wire frames (sync steps, awareness)
//! - [`presence`]: Awareness state with clock-based conflict resolution
//! - [`hub`]: Connection registry and broadcast for one live document
//! - [`actor`]: Serialized per-document event loop
//! - [`server`]: WebSocket listener

pub mod actor;
pub mod hub;
pub mod persistence;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use actor::{ActorError, ActorHandle, ActorOptions, DocumentActor};
pub use hub::{ConnectionId, HubError, HubEvent, HubOptions, PersistenceBridge, SharedDoc, Sink};
pub use persistence::{
    KeySpace, PersistenceConfig, PersistenceEngine, PersistenceError, PersistenceStats,
};
pub use presence::{ClientId, Presence, PresenceChange, PresenceEntry};
pub use protocol::{Frame, MessageKind, ProtocolError, SyncMessage};
pub use server::{ServerConfig, ServerError, SyncServer};
pub use storage::{
    KvBackend, ListOptions, MemoryBackend, RocksBackend, StorageError, Store, StoreConfig,
    Transaction,
};
