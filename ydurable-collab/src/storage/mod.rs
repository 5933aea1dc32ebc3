//! Ordered key-value storage with scoped transactions.
//!
//! Architecture:
//! ```text
//! ┌──────────────────┐  transaction(|tx| …)   ┌──────────────────┐
//! │ PersistenceEngine│ ─────────────────────► │ Store            │
//! └──────────────────┘                        │  (scope locks)   │
//!                                             └────────┬─────────┘
//!                                                      │ overlay + batch
//!                                      ┌───────────────┴───────────────┐
//!                                      ▼                               ▼
//!                              ┌───────────────┐              ┌───────────────┐
//!                              │ MemoryBackend │              │ RocksBackend  │
//!                              │ (BTreeMap)    │              │ (RocksDB, LZ4)│
//!                              └───────────────┘              └───────────────┘
//! ```
//!
//! A [`Transaction`] reads through a private overlay of its own writes and
//! commits them as one backend write batch when its closure returns `Ok`.
//! If the closure fails the overlay is dropped and nothing reaches the
//! backend. Transactions sharing a scope never interleave.

pub mod memory;
pub mod rocks;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub use memory::MemoryBackend;
pub use rocks::{RocksBackend, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageError {
    /// Backend (RocksDB) internal error
    DatabaseError(String),
    /// A lock guarding backend state was poisoned
    Poisoned,
    /// Stored value could not be encoded or decoded
    CodecError(String),
    /// Value compression/decompression failed
    CompressionError(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StorageError::Poisoned => write!(f, "Storage lock poisoned"),
            StorageError::CodecError(e) => write!(f, "Value codec error: {e}"),
            StorageError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::DatabaseError(e.to_string())
    }
}

/// A single write applied atomically as part of a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    Put(String, Vec<u8>),
    Delete(String),
    /// Remove every key starting with the prefix.
    DeletePrefix(String),
}

/// Minimal ordered key-value backend.
///
/// Implementations must apply a whole batch atomically.
pub trait KvBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// All entries whose key starts with `prefix`, in ascending key order.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError>;

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StorageError>;

    /// Remove every key in the backend.
    fn delete_all(&self) -> Result<(), StorageError>;
}

/// Range listing options.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub prefix: String,
    /// Descending key order when true
    pub reverse: bool,
    /// Maximum number of entries returned (None = unlimited)
    pub limit: Option<usize>,
}

impl ListOptions {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }

    /// The greatest key under `prefix`.
    pub fn last(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            reverse: true,
            limit: Some(1),
        }
    }
}

/// Transaction locks: one store-wide lock plus one lock per scope.
#[derive(Default)]
struct LockTable {
    store: tokio::sync::RwLock<()>,
    scopes: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LockTable {
    fn scope(&self, scope: &str) -> Result<Arc<tokio::sync::Mutex<()>>, StorageError> {
        let mut scopes = self.scopes.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(Arc::clone(scopes.entry(scope.to_string()).or_default()))
    }

    /// Forget the scope's lock once no other transaction references it.
    fn release(&self, scope: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        if let Ok(mut scopes) = self.scopes.lock() {
            // One reference in the table, one in `lock`.
            if Arc::strong_count(&lock) == 2 {
                scopes.remove(scope);
            }
        }
    }
}

/// Transactional handle over a shared backend.
///
/// Cloning is cheap; clones share the transaction locks, so every clone
/// is the same storage instance as far as serialization is concerned.
///
/// Transactions in the same scope never interleave. Transactions in
/// different scopes run concurrently and must only touch keys under
/// their own scope. Unscoped transactions exclude everything else.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn KvBackend>,
    locks: Arc<LockTable>,
}

impl Store {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            backend,
            locks: Arc::new(LockTable::default()),
        }
    }

    /// In-memory store (tests, ephemeral servers).
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Run `f` inside a store-wide transaction.
    ///
    /// Writes become visible to other transactions only if `f` returns
    /// `Ok` and the batch commits.
    pub async fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T, E>,
        E: From<StorageError>,
    {
        let _guard = self.locks.store.write().await;
        self.run(f)
    }

    /// Run `f` inside a transaction restricted to keys starting with `scope`.
    pub async fn scoped_transaction<T, E, F>(&self, scope: &str, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T, E>,
        E: From<StorageError>,
    {
        let _store = self.locks.store.read().await;
        let lock = self.locks.scope(scope)?;
        let result = {
            let _guard = lock.lock().await;
            self.run(f)
        };
        self.locks.release(scope, lock);
        result
    }

    fn run<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T, E>,
        E: From<StorageError>,
    {
        let mut tx = Transaction::new(self.backend.as_ref());
        let value = f(&mut tx)?;
        let ops = tx.into_batch();
        if !ops.is_empty() {
            self.backend.write_batch(ops)?;
        }
        Ok(value)
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let key = key.to_string();
        self.transaction(move |tx| tx.get(&key)).await
    }

    pub async fn list(&self, options: ListOptions) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        self.transaction(move |tx| tx.list(&options)).await
    }

    pub async fn delete_prefix(&self, prefix: &str) -> Result<(), StorageError> {
        let prefix = prefix.to_string();
        self.transaction(move |tx| {
            tx.delete_prefix(&prefix);
            Ok::<_, StorageError>(())
        })
        .await
    }

    /// Remove every key in the underlying backend.
    pub async fn delete_all(&self) -> Result<(), StorageError> {
        let _guard = self.locks.store.write().await;
        self.backend.delete_all()
    }
}

/// Uncommitted view of the store: backend state plus pending writes.
pub struct Transaction<'a> {
    backend: &'a dyn KvBackend,
    /// Pending point writes (`None` = delete)
    writes: BTreeMap<String, Option<Vec<u8>>>,
    /// Prefixes removed by this transaction, applied before point writes
    cleared: Vec<String>,
}

impl<'a> Transaction<'a> {
    fn new(backend: &'a dyn KvBackend) -> Self {
        Self {
            backend,
            writes: BTreeMap::new(),
            cleared: Vec::new(),
        }
    }

    fn is_cleared(&self, key: &str) -> bool {
        self.cleared.iter().any(|p| key.starts_with(p.as_str()))
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        if let Some(pending) = self.writes.get(key) {
            return Ok(pending.clone());
        }
        if self.is_cleared(key) {
            return Ok(None);
        }
        self.backend.get(key)
    }

    pub fn list(&self, options: &ListOptions) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let mut merged: BTreeMap<String, Vec<u8>> = self
            .backend
            .scan_prefix(&options.prefix)?
            .into_iter()
            .filter(|(key, _)| !self.is_cleared(key))
            .collect();

        for (key, value) in self.writes.range(options.prefix.clone()..) {
            if !key.starts_with(options.prefix.as_str()) {
                break;
            }
            match value {
                Some(v) => {
                    merged.insert(key.clone(), v.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }

        let limit = options.limit.unwrap_or(usize::MAX);
        let entries: Vec<(String, Vec<u8>)> = if options.reverse {
            merged.into_iter().rev().take(limit).collect()
        } else {
            merged.into_iter().take(limit).collect()
        };
        Ok(entries)
    }

    pub fn put(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.writes.insert(key.into(), Some(value));
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.writes.insert(key.into(), None);
    }

    pub fn delete_prefix(&mut self, prefix: impl Into<String>) {
        let prefix = prefix.into();
        self.writes.retain(|key, _| !key.starts_with(prefix.as_str()));
        self.cleared.push(prefix);
    }

    fn into_batch(self) -> Vec<BatchOp> {
        let mut ops: Vec<BatchOp> = self.cleared.into_iter().map(BatchOp::DeletePrefix).collect();
        ops.extend(self.writes.into_iter().map(|(key, value)| match value {
            Some(v) => BatchOp::Put(key, v),
            None => BatchOp::Delete(key),
        }));
        ops
    }
}

/// Encode a `u64` counter value.
pub fn encode_u64(value: u64) -> Result<Vec<u8>, StorageError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StorageError::CodecError(e.to_string()))
}

/// Decode a `u64` counter value written by [`encode_u64`].
pub fn decode_u64(bytes: &[u8]) -> Result<u64, StorageError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StorageError::CodecError(e.to_string()))?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Aborted;

    impl From<StorageError> for Aborted {
        fn from(_: StorageError) -> Self {
            Aborted
        }
    }

    #[tokio::test]
    async fn test_transaction_commits_writes() {
        let store = Store::memory();
        store
            .transaction(|tx| {
                tx.put("a", vec![1]);
                tx.put("b", vec![2]);
                Ok::<_, StorageError>(())
            })
            .await
            .unwrap();

        assert_eq!(store.get("a").await.unwrap(), Some(vec![1]));
        assert_eq!(store.get("b").await.unwrap(), Some(vec![2]));
    }

    #[tokio::test]
    async fn test_transaction_reads_own_writes() {
        let store = Store::memory();
        let seen = store
            .transaction(|tx| {
                tx.put("k", vec![7]);
                let value = tx.get("k")?;
                tx.delete("k");
                let after_delete = tx.get("k")?;
                Ok::<_, StorageError>((value, after_delete))
            })
            .await
            .unwrap();

        assert_eq!(seen, (Some(vec![7]), None));
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_transaction_leaves_no_writes() {
        let store = Store::memory();
        let result = store
            .transaction(|tx| {
                tx.put("x", vec![1]);
                Err::<(), _>(Aborted)
            })
            .await;

        assert!(result.is_err());
        assert_eq!(store.get("x").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_prefix_order_and_limit() {
        let store = Store::memory();
        store
            .transaction(|tx| {
                tx.put("p:000002", vec![2]);
                tx.put("p:000000", vec![0]);
                tx.put("p:000001", vec![1]);
                tx.put("q:000000", vec![9]);
                Ok::<_, StorageError>(())
            })
            .await
            .unwrap();

        let asc = store.list(ListOptions::prefix("p:")).await.unwrap();
        let keys: Vec<&str> = asc.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["p:000000", "p:000001", "p:000002"]);

        let last = store.list(ListOptions::last("p:")).await.unwrap();
        assert_eq!(last, vec![("p:000002".to_string(), vec![2])]);
    }

    #[tokio::test]
    async fn test_list_merges_pending_writes() {
        let store = Store::memory();
        store
            .transaction(|tx| {
                tx.put("p:1", vec![1]);
                tx.put("p:2", vec![2]);
                Ok::<_, StorageError>(())
            })
            .await
            .unwrap();

        let keys = store
            .transaction(|tx| {
                tx.delete("p:1");
                tx.put("p:3", vec![3]);
                let listed = tx.list(&ListOptions::prefix("p:"))?;
                Ok::<_, StorageError>(listed.into_iter().map(|(k, _)| k).collect::<Vec<_>>())
            })
            .await
            .unwrap();

        assert_eq!(keys, vec!["p:2".to_string(), "p:3".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_prefix_then_put_survives() {
        let store = Store::memory();
        store
            .transaction(|tx| {
                tx.put("ns:a", vec![1]);
                tx.put("ns:b", vec![2]);
                tx.put("other", vec![3]);
                Ok::<_, StorageError>(())
            })
            .await
            .unwrap();

        store
            .transaction(|tx| {
                tx.delete_prefix("ns:");
                assert_eq!(tx.get("ns:a")?, None);
                tx.put("ns:c", vec![4]);
                Ok::<_, StorageError>(())
            })
            .await
            .unwrap();

        let listed = store.list(ListOptions::prefix("ns:")).await.unwrap();
        assert_eq!(listed, vec![("ns:c".to_string(), vec![4])]);
        assert_eq!(store.get("other").await.unwrap(), Some(vec![3]));
    }

    #[tokio::test]
    async fn test_delete_all() {
        let store = Store::memory();
        store
            .transaction(|tx| {
                tx.put("a", vec![1]);
                tx.put("b", vec![2]);
                Ok::<_, StorageError>(())
            })
            .await
            .unwrap();

        store.delete_all().await.unwrap();
        assert!(store.list(ListOptions::prefix("")).await.unwrap().is_empty());
    }

    /// Memory backend whose scans under `slow:` block for a while.
    struct SlowScans(MemoryBackend);

    impl KvBackend for SlowScans {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
            self.0.get(key)
        }

        fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
            if prefix.starts_with("slow:") {
                std::thread::sleep(std::time::Duration::from_millis(400));
            }
            self.0.scan_prefix(prefix)
        }

        fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StorageError> {
            self.0.write_batch(ops)
        }

        fn delete_all(&self) -> Result<(), StorageError> {
            self.0.delete_all()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scopes_do_not_block_each_other() {
        let store = Store::new(Arc::new(SlowScans(MemoryBackend::new())));

        let slow_store = store.clone();
        let slow = tokio::spawn(async move {
            slow_store
                .scoped_transaction("slow:", |tx| tx.list(&ListOptions::prefix("slow:")))
                .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        let started = std::time::Instant::now();
        store
            .scoped_transaction("fast:", |tx| {
                tx.put("fast:a", vec![1]);
                Ok::<_, StorageError>(())
            })
            .await
            .unwrap();
        assert!(started.elapsed() < std::time::Duration::from_millis(200));

        slow.await.unwrap().unwrap();
        assert_eq!(store.get("fast:a").await.unwrap(), Some(vec![1]));
        // Idle scopes leave nothing behind.
        assert!(store.locks.scopes.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_same_scope_serializes() {
        let store = Store::memory();
        let mut tasks = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .scoped_transaction("n:", |tx| {
                        let current = tx.get("n:count")?.map(|b| decode_u64(&b)).transpose()?;
                        tx.put("n:count", encode_u64(current.unwrap_or(0) + 1)?);
                        Ok::<_, StorageError>(())
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let count = store.get("n:count").await.unwrap().unwrap();
        assert_eq!(decode_u64(&count).unwrap(), 20);
    }

    #[test]
    fn test_u64_codec() {
        let encoded = encode_u64(10_240).unwrap();
        assert_eq!(decode_u64(&encoded).unwrap(), 10_240);
        assert!(decode_u64(&[]).is_err());
    }

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::DatabaseError("boom".into());
        assert!(err.to_string().contains("Database error"));
        assert!(StorageError::Poisoned.to_string().contains("poisoned"));
    }
}
