//! RocksDB-backed durable store.
//!
//! Column families:
//! - `documents`    : persisted merge-state per document (LZ4 compressed),
//!   keyed by [`DocumentKey::storage_key`]
//! - `sessions`     : connection sessions, keyed by the 16-byte handle
//! - `session_index`: `<document key><handle>` → empty; prefix-scanned to
//!   list the connections on one document
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

use crate::registry::{ConnectionId, ConnectionSession, DocumentKey, SessionStore};

/// Column family names.
const CF_DOCUMENTS: &str = "documents";
const CF_SESSIONS: &str = "sessions";
const CF_SESSION_INDEX: &str = "session_index";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_SESSIONS, CF_SESSION_INDEX];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("collab_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
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
}

/// Durable merge-state of one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedDocumentState {
    pub tenant_id: String,
    pub document_id: String,
    pub encoded_state: Vec<u8>,
    /// Unix millis of the last save
    pub updated_at: u64,
}

impl PersistedDocumentState {
    pub fn key(&self) -> DocumentKey {
        DocumentKey::new(self.tenant_id.clone(), self.document_id.clone())
    }
}

/// On-disk row: same fields, state compressed.
#[derive(Serialize, Deserialize)]
struct DocumentRow {
    tenant_id: String,
    document_id: String,
    compressed_state: Vec<u8>,
    updated_at: u64,
}

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),
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

/// RocksDB-backed store for document state and connection sessions.
pub struct Store {
    /// RocksDB instance (single-threaded mode, concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl Store {
    /// Open the store at the configured path, creating it if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024);
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

        log::info!("Opened collab store at {}", config.path.display());
        Ok(Self { db, config })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS => {
                // States are compressed by us already
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_SESSIONS => {
                // Small values, frequent point reads on every message
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_SESSION_INDEX => {
                // Empty values, range-scanned by document prefix
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }

        opts
    }

    // ─── Document State ───────────────────────────────────────────────

    /// Upsert the persisted state of a document.
    pub fn put_document(&self, state: &PersistedDocumentState) -> Result<(), StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let row = DocumentRow {
            tenant_id: state.tenant_id.clone(),
            document_id: state.document_id.clone(),
            compressed_state: lz4_flex::compress_prepend_size(&state.encoded_state),
            updated_at: state.updated_at,
        };
        let bytes = bincode::serde::encode_to_vec(&row, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;

        self.db
            .put_cf_opt(&cf, state.key().storage_key(), bytes, &self.write_opts())?;
        Ok(())
    }

    /// Load the persisted state of a document, `None` if never saved.
    pub fn get_document(
        &self,
        key: &DocumentKey,
    ) -> Result<Option<PersistedDocumentState>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let Some(bytes) = self.db.get_cf(&cf, key.storage_key())? else {
            return Ok(None);
        };
        let (row, _): (DocumentRow, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        let encoded_state = lz4_flex::decompress_size_prepended(&row.compressed_state)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        Ok(Some(PersistedDocumentState {
            tenant_id: row.tenant_id,
            document_id: row.document_id,
            encoded_state,
            updated_at: row.updated_at,
        }))
    }

    /// Delete a document's persisted state.
    pub fn delete_document(&self, key: &DocumentKey) -> Result<(), StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        self.db.delete_cf_opt(&cf, key.storage_key(), &self.write_opts())?;
        Ok(())
    }

    /// List every persisted document key.
    pub fn list_documents(&self) -> Result<Vec<DocumentKey>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            match DocumentKey::from_storage_key(&key) {
                Some((doc_key, used)) if used == key.len() => keys.push(doc_key),
                _ => log::warn!("Skipping malformed document key ({} bytes)", key.len()),
            }
        }
        Ok(keys)
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Force a memtable flush to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn write_opts(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    /// Index key: document key followed by the 16-byte connection handle.
    fn index_key(key: &DocumentKey, id: ConnectionId) -> Vec<u8> {
        let mut index_key = key.storage_key();
        index_key.extend_from_slice(id.as_bytes());
        index_key
    }
}

// ─── Sessions ─────────────────────────────────────────────────────────

impl SessionStore for Store {
    fn put_session(&self, session: &ConnectionSession) -> Result<(), StoreError> {
        let cf_sessions = self.cf(CF_SESSIONS)?;
        let cf_index = self.cf(CF_SESSION_INDEX)?;
        let id = session.connection_id;

        // Record + index entry in one atomic batch; drop a stale index entry
        // if the handle was registered on another document before.
        let mut batch = WriteBatch::default();
        if let Some(previous) = self.get_session(id)? {
            batch.delete_cf(&cf_index, Self::index_key(&previous.document_key(), id));
        }
        batch.put_cf(&cf_sessions, id.as_bytes(), session.encode()?);
        batch.put_cf(&cf_index, Self::index_key(&session.document_key(), id), b"");

        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    fn get_session(&self, id: ConnectionId) -> Result<Option<ConnectionSession>, StoreError> {
        let cf = self.cf(CF_SESSIONS)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(ConnectionSession::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn delete_session(&self, id: ConnectionId) -> Result<Option<ConnectionSession>, StoreError> {
        let Some(session) = self.get_session(id)? else {
            return Ok(None);
        };
        let cf_sessions = self.cf(CF_SESSIONS)?;
        let cf_index = self.cf(CF_SESSION_INDEX)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_sessions, id.as_bytes());
        batch.delete_cf(&cf_index, Self::index_key(&session.document_key(), id));
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(Some(session))
    }

    fn sessions_for_document(
        &self,
        key: &DocumentKey,
    ) -> Result<Vec<ConnectionSession>, StoreError> {
        let cf_index = self.cf(CF_SESSION_INDEX)?;
        let prefix = key.storage_key();

        let mut sessions = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf_index, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (index_key, _) = item?;
            if !index_key.starts_with(&prefix) {
                break;
            }
            let handle: [u8; 16] = match index_key[prefix.len()..].try_into() {
                Ok(bytes) => bytes,
                Err(_) => {
                    log::warn!("Skipping malformed session index entry for {key}");
                    continue;
                }
            };
            // An index entry may outlive its record; skip it.
            if let Some(session) = self.get_session(Uuid::from_bytes(handle))? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    fn all_sessions(&self) -> Result<Vec<ConnectionSession>, StoreError> {
        let cf = self.cf(CF_SESSIONS)?;
        let mut sessions = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            sessions.push(ConnectionSession::decode(&value)?);
        }
        Ok(sessions)
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
