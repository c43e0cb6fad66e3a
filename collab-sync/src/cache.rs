//! Document session cache: one warm replica per open document.
//!
//! Architecture:
//! ```text
//!                 arena: RwLock<HashMap<DocumentKey, OnceCell<CachedDocument>>>
//!                          │  (held only to look up / insert a cell)
//!                          ▼
//!   apply ──► CachedDocument ── state: Mutex<DocState> ── replica, dirty,
//!                          │                             generation, timer
//!                          └─ flush_lock: Mutex<()>  (serializes saves)
//!                                    │
//!                                    ▼
//!                          PersistenceAdapter::save   (lock released)
//! ```
//!
//! Hydration runs once per key: concurrent first references share one
//! `OnceCell` and wait for the same load. A failed load removes its empty
//! cell, so the next reference retries. Every applied update bumps the
//! document's flush generation and replaces its debounce timer, so a burst of
//! edits costs one save once the burst goes quiet.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 5

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{SyncError, SyncResult};
use crate::registry::DocumentKey;
use crate::replica::{Replica, ReplicaFactory};
use crate::storage::{PersistenceAdapter, StoreError};

type Slot = Arc<OnceCell<Arc<CachedDocument>>>;

/// Mutable part of a cached document.
struct DocState {
    replica: Box<dyn Replica>,
    last_activity: Instant,
    /// Replica holds changes not yet saved
    dirty: bool,
    /// Debounce timer, if one is armed
    pending_flush: Option<JoinHandle<()>>,
    /// Bumped on every applied update; a timer only flushes its own generation
    flush_generation: u64,
    /// Removed from the arena; holders must look the key up again
    evicted: bool,
}

/// A hydrated document held by the cache.
pub struct CachedDocument {
    key: DocumentKey,
    flush_lock: Mutex<()>,
    state: Mutex<DocState>,
}

impl CachedDocument {
    fn new(key: DocumentKey, replica: Box<dyn Replica>) -> Self {
        Self {
            key,
            flush_lock: Mutex::new(()),
            state: Mutex::new(DocState {
                replica,
                last_activity: Instant::now(),
                dirty: false,
                pending_flush: None,
                flush_generation: 0,
                evicted: false,
            }),
        }
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub async fn is_dirty(&self) -> bool {
        self.state.lock().await.dirty
    }

    pub async fn flush_generation(&self) -> u64 {
        self.state.lock().await.flush_generation
    }
}

/// What asked for a flush.
#[derive(Debug, Clone, Copy)]
enum FlushTrigger {
    /// Debounce timer armed at this generation
    Timer(u64),
    /// Caller-requested flush; cancels any armed timer
    Explicit,
}

/// Save the document's state if it is dirty. Returns whether a save ran.
async fn flush_document(
    doc: &CachedDocument,
    persistence: &dyn PersistenceAdapter,
    trigger: FlushTrigger,
) -> Result<bool, StoreError> {
    let _serialized = doc.flush_lock.lock().await;

    let encoded = {
        let mut state = doc.state.lock().await;
        match trigger {
            FlushTrigger::Timer(generation) => {
                if state.flush_generation != generation {
                    // A newer update re-armed the timer.
                    return Ok(false);
                }
                // Our own handle: drop it without aborting the running task.
                state.pending_flush.take();
            }
            FlushTrigger::Explicit => {
                if let Some(timer) = state.pending_flush.take() {
                    timer.abort();
                }
            }
        }
        if !state.dirty {
            return Ok(false);
        }
        state.dirty = false;
        state.replica.encode_state()
    };

    let size = encoded.len();
    if let Err(e) = persistence.save(&doc.key, encoded).await {
        doc.state.lock().await.dirty = true;
        return Err(e);
    }
    log::debug!("Flushed {} ({size} bytes)", doc.key);
    Ok(true)
}

/// Arena of warm documents.
pub struct DocumentCache {
    arena: RwLock<HashMap<DocumentKey, Slot>>,
    persistence: Arc<dyn PersistenceAdapter>,
    factory: ReplicaFactory,
    debounce: Duration,
}

impl DocumentCache {
    pub fn new(
        persistence: Arc<dyn PersistenceAdapter>,
        factory: ReplicaFactory,
        debounce: Duration,
    ) -> Self {
        Self {
            arena: RwLock::new(HashMap::new()),
            persistence,
            factory,
            debounce,
        }
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    // ─── Lookup & hydration ──────────────────────────────────────────

    async fn slot(&self, key: &DocumentKey) -> Slot {
        // Fast path: read lock
        {
            let arena = self.arena.read().await;
            if let Some(slot) = arena.get(key) {
                return slot.clone();
            }
        }

        // Slow path: write lock, double-checked by `entry`
        let mut arena = self.arena.write().await;
        arena.entry(key.clone()).or_default().clone()
    }

    async fn hydrate(&self, key: &DocumentKey) -> SyncResult<Arc<CachedDocument>> {
        let mut replica = (self.factory)();
        match self.persistence.load(key).await? {
            Some(stored) => {
                replica.merge(&stored).map_err(|e| {
                    SyncError::Persistence(StoreError::DeserializationError(format!(
                        "stored state for {key}: {e}"
                    )))
                })?;
                log::info!("Hydrated {key} from storage ({} bytes)", stored.len());
            }
            None => log::info!("Created new document {key}"),
        }
        Ok(Arc::new(CachedDocument::new(key.clone(), replica)))
    }

    /// Warm document for `key`, loading it from persistence on first use.
    ///
    /// A load failure caches nothing; the next call retries.
    pub async fn get_or_create(&self, key: &DocumentKey) -> SyncResult<Arc<CachedDocument>> {
        let slot = self.slot(key).await;
        let doc = match slot.get_or_try_init(|| self.hydrate(key)).await {
            Ok(doc) => doc.clone(),
            Err(e) => {
                self.discard_empty(key, &slot).await;
                return Err(e);
            }
        };
        doc.state.lock().await.last_activity = Instant::now();
        Ok(doc)
    }

    /// Drop `slot` from the arena if it is still the entry for `key` and
    /// nothing ever filled it.
    async fn discard_empty(&self, key: &DocumentKey, slot: &Slot) {
        let mut arena = self.arena.write().await;
        let unfilled = arena
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, slot) && current.get().is_none());
        if unfilled {
            arena.remove(key);
        }
    }

    /// Cached document for `key` without hydrating.
    async fn cached(&self, key: &DocumentKey) -> Option<Arc<CachedDocument>> {
        self.arena.read().await.get(key)?.get().cloned()
    }

    async fn cached_documents(&self) -> Vec<Arc<CachedDocument>> {
        self.arena
            .read()
            .await
            .values()
            .filter_map(|slot| slot.get().cloned())
            .collect()
    }

    // ─── Mutation ─────────────────────────────────────────────────────

    fn arm_timer(&self, doc: Arc<CachedDocument>, generation: u64) -> JoinHandle<()> {
        let persistence = self.persistence.clone();
        let debounce = self.debounce;
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if let Err(e) =
                flush_document(&doc, persistence.as_ref(), FlushTrigger::Timer(generation)).await
            {
                log::error!("Debounced flush of {} failed: {e}", doc.key);
            }
        })
    }

    /// Merge an encoded update into the document and re-arm its debounce
    /// timer. An update that fails to merge changes nothing.
    pub async fn apply(&self, key: &DocumentKey, update: &[u8]) -> SyncResult<()> {
        loop {
            let doc = self.get_or_create(key).await?;
            let mut state = doc.state.lock().await;
            if state.evicted {
                // Lost a race with eviction; the arena no longer has it.
                drop(state);
                tokio::task::yield_now().await;
                continue;
            }

            state.replica.merge(update)?;
            state.dirty = true;
            state.last_activity = Instant::now();
            state.flush_generation += 1;
            if let Some(timer) = state.pending_flush.take() {
                timer.abort();
            }
            let generation = state.flush_generation;
            state.pending_flush = Some(self.arm_timer(doc.clone(), generation));
            return Ok(());
        }
    }

    // ─── Reads ────────────────────────────────────────────────────────

    /// What a peer with `peer_digest` is missing (empty digest = everything).
    pub async fn diff(&self, key: &DocumentKey, peer_digest: &[u8]) -> SyncResult<Vec<u8>> {
        let doc = self.get_or_create(key).await?;
        let state = doc.state.lock().await;
        Ok(state.replica.diff(peer_digest)?)
    }

    pub async fn digest(&self, key: &DocumentKey) -> SyncResult<Vec<u8>> {
        let doc = self.get_or_create(key).await?;
        let state = doc.state.lock().await;
        Ok(state.replica.digest())
    }

    pub async fn encode_state(&self, key: &DocumentKey) -> SyncResult<Vec<u8>> {
        let doc = self.get_or_create(key).await?;
        let state = doc.state.lock().await;
        Ok(state.replica.encode_state())
    }

    // ─── Flushing & eviction ──────────────────────────────────────────

    /// Save `key` now if it is cached and dirty, cancelling its timer.
    /// Returns whether a save ran.
    pub async fn flush(&self, key: &DocumentKey) -> SyncResult<bool> {
        match self.cached(key).await {
            Some(doc) => {
                let saved =
                    flush_document(&doc, self.persistence.as_ref(), FlushTrigger::Explicit).await?;
                Ok(saved)
            }
            None => Ok(false),
        }
    }

    /// Flush every dirty document. Failures are logged; returns how many saved.
    pub async fn flush_all(&self) -> usize {
        let mut saved = 0;
        for doc in self.cached_documents().await {
            match flush_document(&doc, self.persistence.as_ref(), FlushTrigger::Explicit).await {
                Ok(true) => saved += 1,
                Ok(false) => {}
                Err(e) => log::error!("Flush of {} failed: {e}", doc.key),
            }
        }
        saved
    }

    /// Flush and drop every document idle for at least `threshold`.
    ///
    /// A document whose final save fails stays cached (and dirty) for the
    /// next sweep. Returns how many documents were evicted.
    pub async fn evict_idle(&self, threshold: Duration) -> usize {
        let mut evicted = 0;
        for doc in self.cached_documents().await {
            let _serialized = doc.flush_lock.lock().await;
            let mut state = doc.state.lock().await;
            if state.evicted || state.last_activity.elapsed() < threshold {
                continue;
            }
            if let Some(timer) = state.pending_flush.take() {
                timer.abort();
            }
            if state.dirty {
                // Idle document: holding its lock across the final save is fine.
                let encoded = state.replica.encode_state();
                if let Err(e) = self.persistence.save(&doc.key, encoded).await {
                    log::error!("Final flush of {} failed, keeping it cached: {e}", doc.key);
                    continue;
                }
                state.dirty = false;
            }
            state.evicted = true;
            self.arena.write().await.remove(&doc.key);
            evicted += 1;
            log::info!("Evicted idle document {}", doc.key);
        }
        evicted
    }

    // ─── Introspection ────────────────────────────────────────────────

    pub async fn contains(&self, key: &DocumentKey) -> bool {
        self.cached(key).await.is_some()
    }

    pub async fn len(&self) -> usize {
        self.cached_documents().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn has_pending_flush(&self, key: &DocumentKey) -> bool {
        match self.cached(key).await {
            Some(doc) => doc.state.lock().await.pending_flush.is_some(),
            None => false,
        }
    }
}
