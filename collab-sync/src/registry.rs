//! Connection registry: live connection handle → session context.
//!
//! Records live in a [`SessionStore`] keyed by connection handle, each with
//! an expiry timestamp. A secondary index keyed by [`DocumentKey`] answers
//! "who is on this document" without scanning every connection; fan-out
//! depends on it.
//!
//! Expired records read as absent everywhere, whether or not the sweep has
//! physically removed them yet.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AccessGrant;
use crate::storage::StoreError;

/// Opaque per-connection handle supplied by the transport.
pub type ConnectionId = Uuid;

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Tenant-scoped document identity.
///
/// All per-document state is keyed by this pair; the same document id under
/// two tenants names two unrelated documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentKey {
    pub tenant_id: String,
    pub document_id: String,
}

impl DocumentKey {
    pub fn new(tenant_id: impl Into<String>, document_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            document_id: document_id.into(),
        }
    }

    /// Binary key: `<u32 len><tenant><u32 len><document>`.
    ///
    /// Length-prefixed so one key is never a byte prefix of another
    /// document's key, which keeps index prefix scans exact.
    pub fn storage_key(&self) -> Vec<u8> {
        let tenant = self.tenant_id.as_bytes();
        let doc = self.document_id.as_bytes();
        let mut key = Vec::with_capacity(8 + tenant.len() + doc.len());
        write_prefixed(&mut key, tenant);
        write_prefixed(&mut key, doc);
        key
    }

    /// Parse a key produced by [`DocumentKey::storage_key`], returning the
    /// key and the number of bytes consumed.
    pub fn from_storage_key(bytes: &[u8]) -> Option<(Self, usize)> {
        let (tenant, rest_at) = read_prefixed(bytes, 0)?;
        let (doc, end) = read_prefixed(bytes, rest_at)?;
        Some((Self::new(tenant, doc), end))
    }
}

fn write_prefixed(key: &mut Vec<u8>, value: &[u8]) {
    // AccessValidator caps ids at MAX_ID_BYTES, far below u32::MAX.
    let len = u32::try_from(value.len()).unwrap_or(u32::MAX);
    key.extend_from_slice(&len.to_be_bytes());
    key.extend_from_slice(&value[..len as usize]);
}

fn read_prefixed(bytes: &[u8], at: usize) -> Option<(String, usize)> {
    let len_bytes: [u8; 4] = bytes.get(at..at.checked_add(4)?)?.try_into().ok()?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let start = at + 4;
    let value = bytes.get(start..start.checked_add(len)?)?;
    Some((String::from_utf8(value.to_vec()).ok()?, start + len))
}

impl std::fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.document_id)
    }
}

/// Session context of one live connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSession {
    pub connection_id: ConnectionId,
    pub tenant_id: String,
    pub principal_id: String,
    pub document_id: String,
    pub display_name: String,
    pub role: String,
    /// Unix millis
    pub connected_at: u64,
    /// Unix millis; the session reads as absent from this instant on
    pub expires_at: u64,
}

impl ConnectionSession {
    /// Session for an approved connect, valid for `ttl` from now.
    pub fn from_grant(
        connection_id: ConnectionId,
        grant: &AccessGrant,
        document_id: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        let now = unix_millis();
        Self {
            connection_id,
            tenant_id: grant.tenant_id.clone(),
            principal_id: grant.principal_id.clone(),
            document_id: document_id.into(),
            display_name: grant.display_name.clone(),
            role: grant.role.clone(),
            connected_at: now,
            expires_at: now.saturating_add(ttl.as_millis() as u64),
        }
    }

    pub fn document_key(&self) -> DocumentKey {
        DocumentKey::new(self.tenant_id.clone(), self.document_id.clone())
    }

    pub fn is_expired_at(&self, now_millis: u64) -> bool {
        self.expires_at <= now_millis
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (session, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(session)
    }
}

/// Keyed storage for session records plus the per-document index.
///
/// Implementations must keep the index consistent with the primary records:
/// replacing a session moves its index entry, deleting it removes the entry.
pub trait SessionStore: Send + Sync {
    fn put_session(&self, session: &ConnectionSession) -> Result<(), StoreError>;

    fn get_session(&self, id: ConnectionId) -> Result<Option<ConnectionSession>, StoreError>;

    /// Delete and return the record, expired or not.
    fn delete_session(&self, id: ConnectionId) -> Result<Option<ConnectionSession>, StoreError>;

    /// Index lookup: every record (expired included) for `key`.
    fn sessions_for_document(
        &self,
        key: &DocumentKey,
    ) -> Result<Vec<ConnectionSession>, StoreError>;

    /// Every record, for the expiry sweep.
    fn all_sessions(&self) -> Result<Vec<ConnectionSession>, StoreError>;

    /// Whether calls may block on I/O. Blocking stores are driven from the
    /// blocking thread pool.
    fn is_blocking(&self) -> bool {
        true
    }
}

/// Process-local session store, for tests and storage-less deployments.
#[derive(Default)]
pub struct MemorySessionStore {
    inner: Mutex<MemorySessions>,
}

#[derive(Default)]
struct MemorySessions {
    by_id: HashMap<ConnectionId, ConnectionSession>,
    by_document: HashMap<DocumentKey, HashSet<ConnectionId>>,
}

impl MemorySessions {
    fn unindex(&mut self, session: &ConnectionSession) {
        let key = session.document_key();
        if let Some(ids) = self.by_document.get_mut(&key) {
            ids.remove(&session.connection_id);
            if ids.is_empty() {
                self.by_document.remove(&key);
            }
        }
    }
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemorySessions> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SessionStore for MemorySessionStore {
    fn put_session(&self, session: &ConnectionSession) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(previous) = inner.by_id.insert(session.connection_id, session.clone()) {
            inner.unindex(&previous);
        }
        inner
            .by_document
            .entry(session.document_key())
            .or_default()
            .insert(session.connection_id);
        Ok(())
    }

    fn get_session(&self, id: ConnectionId) -> Result<Option<ConnectionSession>, StoreError> {
        Ok(self.lock().by_id.get(&id).cloned())
    }

    fn delete_session(&self, id: ConnectionId) -> Result<Option<ConnectionSession>, StoreError> {
        let mut inner = self.lock();
        let removed = inner.by_id.remove(&id);
        if let Some(session) = &removed {
            inner.unindex(session);
        }
        Ok(removed)
    }

    fn sessions_for_document(
        &self,
        key: &DocumentKey,
    ) -> Result<Vec<ConnectionSession>, StoreError> {
        let inner = self.lock();
        let sessions = inner
            .by_document
            .get(key)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.by_id.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        Ok(sessions)
    }

    fn all_sessions(&self) -> Result<Vec<ConnectionSession>, StoreError> {
        Ok(self.lock().by_id.values().cloned().collect())
    }

    fn is_blocking(&self) -> bool {
        false
    }
}

/// Expiry-aware view over a [`SessionStore`].
///
/// Calls into a blocking store (RocksDB) run on the blocking thread pool,
/// the same way the persistence adapter reaches the document rows.
#[derive(Clone)]
pub struct ConnectionRegistry {
    store: Arc<dyn SessionStore>,
}

impl ConnectionRegistry {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// Registry backed by a fresh [`MemorySessionStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemorySessionStore::new()))
    }

    async fn run<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn SessionStore) -> Result<T, StoreError> + Send + 'static,
    {
        if !self.store.is_blocking() {
            return op(self.store.as_ref());
        }
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || op(store.as_ref()))
            .await
            .map_err(|e| StoreError::DatabaseError(format!("session store task failed: {e}")))?
    }

    /// Insert or replace the session for its connection handle.
    pub async fn register(&self, session: &ConnectionSession) -> Result<(), StoreError> {
        let record = session.clone();
        self.run(move |store| store.put_session(&record)).await?;
        log::debug!(
            "Registered connection {} on {}",
            session.connection_id,
            session.document_key()
        );
        Ok(())
    }

    /// Live session for `id`; expired records read as absent.
    pub async fn get(&self, id: ConnectionId) -> Result<Option<ConnectionSession>, StoreError> {
        let session = self.run(move |store| store.get_session(id)).await?;
        let now = unix_millis();
        Ok(session.filter(|session| !session.is_expired_at(now)))
    }

    /// Remove the record for `id`, returning it even if it had expired.
    pub async fn remove(&self, id: ConnectionId) -> Result<Option<ConnectionSession>, StoreError> {
        self.run(move |store| store.delete_session(id)).await
    }

    /// Live sessions on a document, via the document index.
    pub async fn list_by_document(
        &self,
        key: &DocumentKey,
    ) -> Result<Vec<ConnectionSession>, StoreError> {
        let key = key.clone();
        let records = self
            .run(move |store| store.sessions_for_document(&key))
            .await?;
        let now = unix_millis();
        let mut sessions: Vec<_> = records
            .into_iter()
            .filter(|session| !session.is_expired_at(now))
            .collect();
        sessions.sort_by_key(|s| s.connected_at);
        Ok(sessions)
    }

    /// Every record in the store, expired ones included.
    pub async fn all(&self) -> Result<Vec<ConnectionSession>, StoreError> {
        self.run(|store| store.all_sessions()).await
    }

    /// Number of live sessions across all documents.
    pub async fn len(&self) -> Result<usize, StoreError> {
        let now = unix_millis();
        Ok(self
            .all()
            .await?
            .iter()
            .filter(|session| !session.is_expired_at(now))
            .count())
    }

    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }

    /// Physically delete expired records and return them, so the caller can
    /// tear down whatever else still refers to those connections.
    pub async fn purge_expired(&self) -> Result<Vec<ConnectionSession>, StoreError> {
        let purged = self
            .run(|store| {
                let now = unix_millis();
                let mut purged = Vec::new();
                for session in store.all_sessions()? {
                    if session.is_expired_at(now) {
                        if let Some(removed) = store.delete_session(session.connection_id)? {
                            purged.push(removed);
                        }
                    }
                }
                Ok(purged)
            })
            .await?;
        if !purged.is_empty() {
            log::info!("Purged {} expired connection sessions", purged.len());
        }
        Ok(purged)
    }
}
