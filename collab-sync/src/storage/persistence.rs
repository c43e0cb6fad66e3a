//! Persistence adapter: load / save the encoded merge-state of a document.
//!
//! The cache only talks to [`PersistenceAdapter`]. [`RocksPersistence`] is
//! the durable implementation; [`MemoryPersistence`] backs tests and
//! storage-less runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::registry::{unix_millis, DocumentKey};
use crate::storage::rocks::{PersistedDocumentState, Store};
use crate::storage::StoreError;

#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    /// Encoded state for `key`, `None` if the document was never saved.
    async fn load(&self, key: &DocumentKey) -> Result<Option<Vec<u8>>, StoreError>;

    /// Upsert the encoded state for `key`.
    async fn save(&self, key: &DocumentKey, encoded_state: Vec<u8>) -> Result<(), StoreError>;
}

/// RocksDB-backed adapter; calls run on the blocking pool.
pub struct RocksPersistence {
    store: Arc<Store>,
}

impl RocksPersistence {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl PersistenceAdapter for RocksPersistence {
    async fn load(&self, key: &DocumentKey) -> Result<Option<Vec<u8>>, StoreError> {
        let store = self.store.clone();
        let key = key.clone();
        let row = tokio::task::spawn_blocking(move || store.get_document(&key))
            .await
            .map_err(|e| StoreError::DatabaseError(format!("load task failed: {e}")))??;
        Ok(row.map(|row| row.encoded_state))
    }

    async fn save(&self, key: &DocumentKey, encoded_state: Vec<u8>) -> Result<(), StoreError> {
        let store = self.store.clone();
        let state = PersistedDocumentState {
            tenant_id: key.tenant_id.clone(),
            document_id: key.document_id.clone(),
            encoded_state,
            updated_at: unix_millis(),
        };
        tokio::task::spawn_blocking(move || store.put_document(&state))
            .await
            .map_err(|e| StoreError::DatabaseError(format!("save task failed: {e}")))?
    }
}

/// In-memory adapter. Counts saves so callers can observe write coalescing.
#[derive(Default)]
pub struct MemoryPersistence {
    documents: Mutex<HashMap<DocumentKey, PersistedDocumentState>>,
    loads: AtomicU64,
    saves: AtomicU64,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    fn documents(&self) -> std::sync::MutexGuard<'_, HashMap<DocumentKey, PersistedDocumentState>> {
        self.documents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stored row for `key`, if any.
    pub fn get(&self, key: &DocumentKey) -> Option<PersistedDocumentState> {
        self.documents().get(key).cloned()
    }

    /// Seed a document as if it had been saved earlier.
    pub fn insert(&self, key: &DocumentKey, encoded_state: Vec<u8>) {
        self.documents().insert(
            key.clone(),
            PersistedDocumentState {
                tenant_id: key.tenant_id.clone(),
                document_id: key.document_id.clone(),
                encoded_state,
                updated_at: unix_millis(),
            },
        );
    }

    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PersistenceAdapter for MemoryPersistence {
    async fn load(&self, key: &DocumentKey) -> Result<Option<Vec<u8>>, StoreError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.get(key).map(|row| row.encoded_state))
    }

    async fn save(&self, key: &DocumentKey, encoded_state: Vec<u8>) -> Result<(), StoreError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.insert(key, encoded_state);
        Ok(())
    }
}
