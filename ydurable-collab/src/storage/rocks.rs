//! RocksDB-backed ordered key-value backend.
//!
//! All keys live in one column family (`ydoc`). Keys are UTF-8 strings so
//! the zero-padded persistence keys sort the same way in RocksDB as they
//! do in memory. Values are optionally LZ4 compressed on top of RocksDB's
//! own block compression.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use super::{BatchOp, KvBackend, StorageError};

/// Column family holding every document key space.
const CF_YDOC: &str = "ydoc";

/// Backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every batch (default: true; one batch per transaction)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size (default: 16MB)
    pub write_buffer_size: usize,
    /// LZ4-compress values before handing them to RocksDB
    pub compress_values: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("ydurable_data"),
            block_cache_size: 64 * 1024 * 1024, // 64MB
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024, // 16MB
            compress_values: true,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
            compress_values: true,
        }
    }
}

/// RocksDB backend.
pub struct RocksBackend {
    /// RocksDB instance (single-threaded mode; transactions serialize in `Store`)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksBackend {
    /// Open the database at the configured path, creating it if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StorageError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf = ColumnFamilyDescriptor::new(CF_YDOC, Self::cf_options(&config));
        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            vec![cf],
        )?;

        log::info!("Opened RocksDB backend at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024); // 16KB blocks
        opts.set_block_based_table_factory(&block_opts);

        // Already-compressed values gain little from a second pass.
        let compression = if config.compress_values {
            DBCompressionType::None
        } else {
            DBCompressionType::Lz4
        };
        opts.set_compression_type(compression);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(4);
        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.db
            .cf_handle(CF_YDOC)
            .ok_or_else(|| StorageError::DatabaseError(format!("Column family '{CF_YDOC}' not found")))
    }

    fn encode_value(&self, value: &[u8]) -> Vec<u8> {
        if self.config.compress_values {
            lz4_flex::compress_prepend_size(value)
        } else {
            value.to_vec()
        }
    }

    fn decode_value(&self, stored: &[u8]) -> Result<Vec<u8>, StorageError> {
        if self.config.compress_values {
            lz4_flex::decompress_size_prepended(stored)
                .map_err(|e| StorageError::CompressionError(e.to_string()))
        } else {
            Ok(stored.to_vec())
        }
    }

    fn decode_key(key: &[u8]) -> Result<String, StorageError> {
        String::from_utf8(key.to_vec()).map_err(|e| StorageError::CodecError(e.to_string()))
    }

    /// Raw keys currently stored under `prefix`.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<Box<[u8]>>, StorageError> {
        let cf = self.cf()?;
        let mut keys = Vec::new();
        let iter = self.db.iterator_cf(
            cf,
            IteratorMode::From(prefix.as_bytes(), Direction::Forward),
        );
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }
}

impl KvBackend for RocksBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let cf = self.cf()?;
        match self.db.get_cf(cf, key.as_bytes())? {
            Some(stored) => Ok(Some(self.decode_value(&stored)?)),
            None => Ok(None),
        }
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let cf = self.cf()?;
        let mut entries = Vec::new();
        let iter = self.db.iterator_cf(
            cf,
            IteratorMode::From(prefix.as_bytes(), Direction::Forward),
        );
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            entries.push((Self::decode_key(&key)?, self.decode_value(&value)?));
        }
        Ok(entries)
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StorageError> {
        let cf = self.cf()?;
        let mut batch = WriteBatch::default();
        // Keys put earlier in this batch are invisible to the prefix scan.
        let mut pending_puts: BTreeSet<String> = BTreeSet::new();

        for op in ops {
            match op {
                BatchOp::Put(key, value) => {
                    batch.put_cf(cf, key.as_bytes(), self.encode_value(&value));
                    pending_puts.insert(key);
                }
                BatchOp::Delete(key) => {
                    batch.delete_cf(cf, key.as_bytes());
                    pending_puts.remove(&key);
                }
                BatchOp::DeletePrefix(prefix) => {
                    for key in self.keys_with_prefix(&prefix)? {
                        batch.delete_cf(cf, &key);
                    }
                    pending_puts.retain(|key| {
                        if key.starts_with(prefix.as_str()) {
                            batch.delete_cf(cf, key.as_bytes());
                            false
                        } else {
                            true
                        }
                    });
                }
            }
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn delete_all(&self) -> Result<(), StorageError> {
        let cf = self.cf()?;
        let mut batch = WriteBatch::default();
        let mut count = 0u64;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            batch.delete_cf(cf, &key);
            count += 1;
        }
        if count > 0 {
            let mut write_opts = WriteOptions::default();
            write_opts.set_sync(self.config.sync_writes);
            self.db.write_opt(batch, &write_opts)?;
        }
        log::debug!("Deleted {count} keys from {}", self.config.path.display());
        Ok(())
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_temp() -> (tempfile::TempDir, RocksBackend) {
        let dir = tempdir().unwrap();
        let backend = RocksBackend::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, backend)
    }

    #[test]
    fn test_open_creates_directory() {
        let (_dir, backend) = open_temp();
        assert!(backend.path().exists());
    }

    #[test]
    fn test_put_get_roundtrip_compressed() {
        let (_dir, backend) = open_temp();
        let value = b"the quick brown fox jumps over the lazy dog".repeat(20);
        backend
            .write_batch(vec![BatchOp::Put("v1:ydoc:updates:000000".into(), value.clone())])
            .unwrap();

        assert_eq!(backend.get("v1:ydoc:updates:000000").unwrap(), Some(value));
        assert_eq!(backend.get("missing").unwrap(), None);
    }

    #[test]
    fn test_scan_prefix_sorted() {
        let (_dir, backend) = open_temp();
        backend
            .write_batch(vec![
                BatchOp::Put("u:000002".into(), vec![2]),
                BatchOp::Put("u:000000".into(), vec![0]),
                BatchOp::Put("u:000001".into(), vec![1]),
                BatchOp::Put("v:000000".into(), vec![9]),
            ])
            .unwrap();

        let entries = backend.scan_prefix("u:").unwrap();
        let keys: Vec<&str> = entries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["u:000000", "u:000001", "u:000002"]);
    }

    #[test]
    fn test_delete_prefix_includes_pending_puts() {
        let (_dir, backend) = open_temp();
        backend
            .write_batch(vec![BatchOp::Put("a:1".into(), vec![1])])
            .unwrap();
        backend
            .write_batch(vec![
                BatchOp::Put("a:2".into(), vec![2]),
                BatchOp::DeletePrefix("a:".into()),
                BatchOp::Put("a:3".into(), vec![3]),
                BatchOp::Put("b:1".into(), vec![4]),
            ])
            .unwrap();

        let entries = backend.scan_prefix("a:").unwrap();
        assert_eq!(entries, vec![("a:3".to_string(), vec![3])]);
        assert_eq!(backend.get("b:1").unwrap(), Some(vec![4]));
    }

    #[test]
    fn test_delete_all() {
        let (_dir, backend) = open_temp();
        backend
            .write_batch(vec![
                BatchOp::Put("a".into(), vec![1]),
                BatchOp::Put("b".into(), vec![2]),
            ])
            .unwrap();
        backend.delete_all().unwrap();
        assert!(backend.scan_prefix("").unwrap().is_empty());
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path().join("db"));
        {
            let backend = RocksBackend::open(config.clone()).unwrap();
            backend
                .write_batch(vec![BatchOp::Put("k".into(), vec![42])])
                .unwrap();
        }
        let backend = RocksBackend::open(config).unwrap();
        assert_eq!(backend.get("k").unwrap(), Some(vec![42]));
    }

    #[test]
    fn test_uncompressed_values() {
        let dir = tempdir().unwrap();
        let config = StoreConfig {
            compress_values: false,
            ..StoreConfig::for_testing(dir.path().join("db"))
        };
        let backend = RocksBackend::open(config).unwrap();
        backend
            .write_batch(vec![BatchOp::Put("k".into(), vec![1, 2, 3])])
            .unwrap();
        assert_eq!(backend.get("k").unwrap(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.block_cache_size, 64 * 1024 * 1024);
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(config.sync_writes);
        assert!(config.compress_values);
    }
}
