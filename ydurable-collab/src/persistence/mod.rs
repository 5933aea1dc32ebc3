//! Durable, size-bounded update log for one document.
//!
//! Incoming CRDT updates are appended under increasing clocks. Reads merge
//! the stored chunks and the pending updates into a fresh document, and
//! compact the pending log into chunks once it grows past the configured
//! thresholds.
//!
//! ```text
//! store_update ─► <ns>:updates:NNNNNN  ──┐
//!                 <ns>:bytes (+len)      │ flush (one transaction)
//!                                        ▼
//!                 <ns>:merged:NNNNNN  ◄── pack_chunks(seed = last chunk)
//! ```
//!
//! Every operation runs inside one [`Store`] transaction scoped to the
//! document's key prefix, so a failure leaves no partial state behind and
//! other documents in the same store are never blocked.

pub mod chunk;
pub mod keys;

use serde::{Deserialize, Serialize};
use yrs::updates::decoder::Decode;
use yrs::{Doc, Transact, Update};

use crate::storage::{decode_u64, encode_u64, ListOptions, StorageError, Store, Transaction};

pub use chunk::{merge_updates, pack_chunks};
pub use keys::KeySpace;

/// Persistence errors.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistenceError {
    Storage(StorageError),
    /// A stored update or chunk is not a valid v1 update
    Decode(String),
    /// The merged state could not be applied to a document
    Apply(String),
    /// A key under the document namespace has an unexpected shape
    CorruptKey(String),
}

impl std::fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistenceError::Storage(e) => write!(f, "Storage error: {e}"),
            PersistenceError::Decode(e) => write!(f, "Update decode error: {e}"),
            PersistenceError::Apply(e) => write!(f, "Update apply error: {e}"),
            PersistenceError::CorruptKey(k) => write!(f, "Corrupt key: {k}"),
        }
    }
}

impl std::error::Error for PersistenceError {}

impl From<StorageError> for PersistenceError {
    fn from(e: StorageError) -> Self {
        PersistenceError::Storage(e)
    }
}

/// Flush thresholds and chunk size limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Pending byte total that triggers a flush on the next read (default: 10KB)
    pub flush_bytes: u64,
    /// Pending update count that triggers a flush on the next read (default: 300)
    pub flush_update_clock: usize,
    /// Size at which a new chunk is started (default: 100KB)
    pub max_chunk_bytes: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            flush_bytes: 10 * 1024,
            flush_update_clock: 300,
            max_chunk_bytes: 100 * 1024,
        }
    }
}

/// Snapshot of the log's bookkeeping, mostly for tests and logging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistenceStats {
    pub pending_updates: usize,
    /// `None` when the byte counter key is absent
    pub pending_bytes: Option<u64>,
    pub chunks: usize,
    /// Highest clock ever assigned
    pub last_clock: Option<u64>,
}

/// Update log + chunk store for one document key space.
#[derive(Clone)]
pub struct PersistenceEngine {
    store: Store,
    keys: KeySpace,
    config: PersistenceConfig,
}

impl PersistenceEngine {
    pub fn new(store: Store, config: PersistenceConfig) -> Self {
        Self::with_key_space(store, KeySpace::default(), config)
    }

    /// Engine for the named document inside a shared store.
    pub fn for_document(store: Store, name: &str, config: PersistenceConfig) -> Self {
        Self::with_key_space(store, KeySpace::for_document(name), config)
    }

    pub fn with_key_space(store: Store, keys: KeySpace, config: PersistenceConfig) -> Self {
        Self { store, keys, config }
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    pub fn key_space(&self) -> &KeySpace {
        &self.keys
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Append one update and return its clock.
    ///
    /// The clock is one past the highest clock ever assigned in this key
    /// space, so numbering continues across flushes.
    pub async fn store_update(&self, update: &[u8]) -> Result<u64, PersistenceError> {
        let keys = &self.keys;
        let clock = self
            .store
            .scoped_transaction(&self.keys.root_prefix(), |tx| {
                let last_listed = tx
                    .list(&ListOptions::last(keys.updates_prefix()))?
                    .into_iter()
                    .next()
                    .map(|(key, _)| {
                        keys.parse_update_clock(&key)
                            .ok_or(PersistenceError::CorruptKey(key))
                    })
                    .transpose()?;
                let watermark = read_u64(tx, &keys.clock_key())?;
                let clock = last_listed.max(watermark).map_or(0, |c| c + 1);

                tx.put(keys.update_key(clock), update.to_vec());
                tx.put(keys.clock_key(), encode_u64(clock)?);

                let bytes = read_u64(tx, &keys.bytes_key())?.unwrap_or(0);
                tx.put(keys.bytes_key(), encode_u64(bytes + update.len() as u64)?);
                Ok::<_, PersistenceError>(clock)
            })
            .await?;

        log::trace!("{}: stored update {clock} ({} bytes)", keys.namespace(), update.len());
        Ok(clock)
    }

    /// Fold every pending update into chunks.
    pub async fn flush_document(&self) -> Result<(), PersistenceError> {
        self.store
            .scoped_transaction(&self.keys.root_prefix(), |tx| {
                let pending = tx.list(&ListOptions::prefix(self.keys.updates_prefix()))?;
                self.flush_pending(tx, &pending)
            })
            .await
    }

    /// Reconstruct the document from chunks and pending updates.
    ///
    /// Flushes in the same transaction when the pending log has reached
    /// `flush_update_clock` updates or `flush_bytes` bytes.
    pub async fn get_ydoc(&self) -> Result<Doc, PersistenceError> {
        self.store
            .scoped_transaction(&self.keys.root_prefix(), |tx| {
                let chunks = tx.list(&ListOptions::prefix(self.keys.merged_prefix()))?;
                let pending = tx.list(&ListOptions::prefix(self.keys.updates_prefix()))?;

                let mut decoded = Vec::with_capacity(chunks.len() + pending.len());
                for (_, bytes) in chunks.iter().chain(pending.iter()) {
                    let update = Update::decode_v1(bytes)
                        .map_err(|e| PersistenceError::Decode(e.to_string()))?;
                    decoded.push(update);
                }

                let doc = Doc::new();
                if !decoded.is_empty() {
                    let mut txn = doc.transact_mut();
                    txn.apply_update(Update::merge_updates(decoded))
                        .map_err(|e| PersistenceError::Apply(e.to_string()))?;
                }

                let pending_bytes = read_u64(tx, &self.keys.bytes_key())?.unwrap_or(0);
                if !pending.is_empty()
                    && (pending.len() >= self.config.flush_update_clock
                        || pending_bytes >= self.config.flush_bytes)
                {
                    self.flush_pending(tx, &pending)?;
                }
                Ok::<_, PersistenceError>(doc)
            })
            .await
    }

    /// Delete every key of this document.
    pub async fn clear(&self) -> Result<(), PersistenceError> {
        let prefix = self.keys.root_prefix();
        self.store
            .scoped_transaction(&prefix, |tx| {
                tx.delete_prefix(prefix.as_str());
                Ok::<_, StorageError>(())
            })
            .await?;
        log::debug!("{}: cleared", self.keys.namespace());
        Ok(())
    }

    pub async fn stats(&self) -> Result<PersistenceStats, PersistenceError> {
        self.store
            .scoped_transaction(&self.keys.root_prefix(), |tx| {
                Ok::<_, PersistenceError>(PersistenceStats {
                    pending_updates: tx.list(&ListOptions::prefix(self.keys.updates_prefix()))?.len(),
                    pending_bytes: read_u64(tx, &self.keys.bytes_key())?,
                    chunks: tx.list(&ListOptions::prefix(self.keys.merged_prefix()))?.len(),
                    last_clock: read_u64(tx, &self.keys.clock_key())?,
                })
            })
            .await
    }

    /// Pack `pending` onto the last chunk and delete exactly those updates.
    fn flush_pending(
        &self,
        tx: &mut Transaction<'_>,
        pending: &[(String, Vec<u8>)],
    ) -> Result<(), PersistenceError> {
        if !pending.is_empty() {
            let (start, seed) = match tx
                .list(&ListOptions::last(self.keys.merged_prefix()))?
                .into_iter()
                .next()
            {
                Some((key, bytes)) => match self.keys.parse_chunk_index(&key) {
                    Some(index) => (index, Some(bytes)),
                    None => return Err(PersistenceError::CorruptKey(key)),
                },
                None => (0, None),
            };

            let records: Vec<Vec<u8>> = pending.iter().map(|(_, bytes)| bytes.clone()).collect();
            let chunks = pack_chunks(&records, seed, self.config.max_chunk_bytes)?;
            let produced = chunks.len();
            for (offset, chunk) in chunks.into_iter().enumerate() {
                tx.put(self.keys.merged_key(start + offset as u64), chunk);
            }
            for (key, _) in pending {
                tx.delete(key.clone());
            }
            log::debug!(
                "{}: flushed {} updates into {produced} chunks from index {start}",
                self.keys.namespace(),
                pending.len()
            );
        }
        tx.delete(self.keys.bytes_key());
        Ok(())
    }
}

fn read_u64(tx: &Transaction<'_>, key: &str) -> Result<Option<u64>, StorageError> {
    tx.get(key)?.map(|bytes| decode_u64(&bytes)).transpose()
}
