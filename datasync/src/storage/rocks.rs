//! RocksDB-backed persistent document store.
//!
//! Column families:
//! - `documents`: JSON document snapshots (LZ4 compressed)
//! - `metadata` : per-document metadata (bincode: version, sizes, timestamps)
//!
//! Keys are the UTF-8 bytes of the full `namespace:collection:id` key.
//!
//! Reference: Kleppmann: DDIA, Chapter 3 (LSM Trees, SSTables)

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::ops::Operation;
use crate::protocol::{DataKey, UserContext};
use crate::provider::{StorageError, SyncStorage};

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("datasync_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-provided directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

/// Metadata stored alongside each snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub key: String,
    /// Number of snapshots written (monotonically increasing)
    pub version: u64,
    /// Uncompressed JSON size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    /// Seconds since epoch
    pub updated_at: u64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl DocumentMetadata {
    fn new(key: &DataKey) -> Self {
        let now = now_secs();
        Self {
            key: key.to_string(),
            version: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Document not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Compression error: {0}")]
    CompressionError(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

impl From<StoreError> for StorageError {
    fn from(e: StoreError) -> Self {
        StorageError::Backend(e.to_string())
    }
}

/// RocksDB-backed document store.
pub struct DocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl DocumentStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened document store at {}", config.path.display());

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);

        match name {
            // Snapshots are already LZ4 compressed.
            CF_DOCUMENTS => opts.set_compression_type(DBCompressionType::None),
            CF_METADATA => opts.optimize_for_point_lookup(config.block_cache_size as u64),
            _ => {}
        }

        opts
    }

    // ─── Document Snapshots ───────────────────────────────────────────

    /// Persist `document` as the latest snapshot of `key`.
    pub fn save_document(&self, key: &DataKey, document: &Value) -> Result<DocumentMetadata, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let json = serde_json::to_vec(document)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&json);

        let mut meta = self
            .load_metadata(key)
            .unwrap_or_else(|_| DocumentMetadata::new(key));
        meta.version += 1;
        meta.snapshot_size = json.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();

        // Snapshot and metadata land together or not at all.
        let db_key = key.to_string();
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, db_key.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, db_key.as_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    /// Latest snapshot of `key`, `None` when never saved.
    pub fn load_document(&self, key: &DataKey) -> Result<Option<Value>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let Some(compressed) = self.db.get_cf(&cf, key.to_string().as_bytes())? else {
            return Ok(None);
        };
        let json = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        serde_json::from_slice(&json)
            .map(Some)
            .map_err(|e| StoreError::DeserializationError(e.to_string()))
    }

    pub fn document_exists(&self, key: &DataKey) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(&cf, key.to_string().as_bytes())?.is_some())
    }

    pub fn load_metadata(&self, key: &DataKey) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, key.to_string().as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }

    /// Every stored key, in byte order.
    pub fn list_documents(&self) -> Result<Vec<DataKey>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut keys = Vec::new();

        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (raw, _) = item?;
            let text = std::str::from_utf8(&raw)
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            match DataKey::parse(text) {
                Ok(key) => keys.push(key),
                Err(e) => log::warn!("Skipping unreadable stored key {text:?}: {e}"),
            }
        }

        Ok(keys)
    }

    /// Remove the snapshot and metadata of `key`.
    pub fn delete_document(&self, key: &DataKey) -> Result<bool, StoreError> {
        let existed = self.document_exists(key)?;
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let db_key = key.to_string();
        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_docs, db_key.as_bytes());
        batch.delete_cf(&cf_meta, db_key.as_bytes());
        self.db.write(batch)?;

        Ok(existed)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

// ─── SyncStorage backend ──────────────────────────────────────────────

/// [`SyncStorage`] that persists every committed document.
///
/// `clear` only drops the provider's memory copy; the snapshot stays on disk
/// and is reloaded on the next bind. Use [`DocumentStore::delete_document`]
/// to remove it.
#[derive(Clone)]
pub struct RocksStorage {
    store: Arc<DocumentStore>,
}

impl RocksStorage {
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        Ok(Self::new(Arc::new(DocumentStore::open(config)?)))
    }

    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&DocumentStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .map_err(StorageError::from)
    }
}

impl SyncStorage for RocksStorage {
    fn get<'a>(
        &'a self,
        key: &'a DataKey,
        _ctx: &'a UserContext,
    ) -> BoxFuture<'a, Result<Option<Value>, StorageError>> {
        let key = key.clone();
        async move { self.blocking(move |store| store.load_document(&key)).await }.boxed()
    }

    fn set<'a>(
        &'a self,
        key: &'a DataKey,
        value: &'a Value,
        _ctx: &'a UserContext,
    ) -> BoxFuture<'a, Result<Vec<Operation>, StorageError>> {
        let key = key.clone();
        let value = value.clone();
        async move {
            let meta = self
                .blocking(move |store| store.save_document(&key, &value))
                .await?;
            log::trace!("Persisted {} v{} ({} bytes)", meta.key, meta.version, meta.compressed_size);
            Ok(Vec::new())
        }
        .boxed()
    }

    fn clear<'a>(
        &'a self,
        _key: &'a DataKey,
        _ctx: &'a UserContext,
    ) -> BoxFuture<'a, Result<bool, StorageError>> {
        async move { Ok(false) }.boxed()
    }

    fn clear_all<'a>(&'a self, _ctx: &'a UserContext) -> BoxFuture<'a, Result<(), StorageError>> {
        async move { Ok(()) }.boxed()
    }
}
