//! Sync service: the three transport events and the process lifecycle.
//!
//! ```text
//!            connect                     message                 disconnect
//!               │                           │                        │
//!       AccessValidator              registry.get ──► 404     registry.remove
//!               │                           │                        │
//!      registry.register            ProtocolRouter::route     presence.remove
//!               │                           │                        │
//!     cache.get_or_create        cache / presence / fan-out     fan-out Left
//!               │                                                    │
//!   presence.set + fan-out Joined                               cache.flush
//! ```
//!
//! All collaborators are constructed once and injected, so tests can run any
//! number of isolated services in one process. `start` drops stored sessions
//! no socket of this process owns and launches the sweep (idle eviction and
//! session expiry); `shutdown` stops it and flushes every cached document.
//!
//! A connection counts as active from the moment its presence entry is set
//! until that entry is removed, by disconnect or by the sweep when its
//! session expires, whichever comes first.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use crate::auth::AccessValidator;
use crate::broadcast::{ChannelTransport, FanOut, FanOutStats};
use crate::cache::DocumentCache;
use crate::config::ServerConfig;
use crate::error::{EventStatus, SyncError, SyncResult};
use crate::presence::{PresenceEntry, PresenceTracker};
use crate::protocol::{AwarenessMessage, Envelope};
use crate::registry::{ConnectionId, ConnectionRegistry, ConnectionSession, DocumentKey};
use crate::replica::{ReplicaFactory, YrsReplica};
use crate::router::{MessageOutcome, ProtocolRouter};
use crate::storage::{MemoryPersistence, PersistenceAdapter};

/// Service statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_messages: u64,
    pub messages_sent: u64,
    pub messages_dropped: u64,
}

#[derive(Default)]
struct AtomicServiceStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    rejected_messages: AtomicU64,
}

/// Result of a successful connect.
#[derive(Debug, Clone)]
pub struct Connected {
    pub session: ConnectionSession,
    /// PRESENCE frames announcing every peer already on the document
    pub snapshot: Vec<Vec<u8>>,
}

/// The sync core.
pub struct SyncService {
    config: ServerConfig,
    validator: AccessValidator,
    registry: ConnectionRegistry,
    cache: Arc<DocumentCache>,
    presence: Arc<PresenceTracker>,
    transport: Arc<ChannelTransport>,
    fanout: Arc<FanOut>,
    router: ProtocolRouter,
    stats: AtomicServiceStats,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SyncService {
    /// Service over the given registry and persistence, with yrs replicas.
    pub fn new(
        config: ServerConfig,
        validator: AccessValidator,
        registry: ConnectionRegistry,
        persistence: Arc<dyn PersistenceAdapter>,
    ) -> Self {
        Self::with_factory(config, validator, registry, persistence, YrsReplica::factory())
    }

    /// Fully in-memory service.
    pub fn in_memory(config: ServerConfig, validator: AccessValidator) -> Self {
        Self::new(
            config,
            validator,
            ConnectionRegistry::in_memory(),
            Arc::new(MemoryPersistence::new()),
        )
    }

    pub fn with_factory(
        config: ServerConfig,
        validator: AccessValidator,
        registry: ConnectionRegistry,
        persistence: Arc<dyn PersistenceAdapter>,
        factory: ReplicaFactory,
    ) -> Self {
        let cache = Arc::new(DocumentCache::new(persistence, factory, config.debounce));
        let presence = Arc::new(PresenceTracker::new());
        let transport = Arc::new(ChannelTransport::new(config.channel_capacity));
        let fanout = Arc::new(FanOut::new(registry.clone(), transport.clone()));
        let router = ProtocolRouter::new(cache.clone(), presence.clone(), fanout.clone());
        Self {
            config,
            validator,
            registry,
            cache,
            presence,
            transport,
            fanout,
            router,
            stats: AtomicServiceStats::default(),
            sweeper: Mutex::new(None),
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────────────

    /// Drop stale stored sessions, then launch the background sweep.
    /// Calling it again is a no-op. Returns how many sessions were dropped.
    pub async fn start(self: &Arc<Self>) -> SyncResult<usize> {
        if self.sweeper_running() {
            return Ok(0);
        }
        let dropped = self.recover_sessions().await?;

        let mut sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if sweeper.is_some() {
            return Ok(dropped);
        }
        let service = Arc::downgrade(self);
        let every = self.config.sweep_interval;
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(service) = service.upgrade() else {
                    break;
                };
                service.sweep().await;
            }
        }));
        log::info!(
            "Sweep started (every {:?}, idle timeout {:?})",
            self.config.sweep_interval,
            self.config.idle_timeout
        );
        Ok(dropped)
    }

    fn sweeper_running(&self) -> bool {
        self.sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    /// Remove stored sessions that have no open connection queue in this
    /// process, such as records a previous run left in a durable store.
    pub async fn recover_sessions(&self) -> SyncResult<usize> {
        let mut dropped = 0;
        for session in self.registry.all().await? {
            if !self.transport.is_open(session.connection_id).await {
                self.registry.remove(session.connection_id).await?;
                dropped += 1;
            }
        }
        if dropped > 0 {
            log::info!("Dropped {dropped} sessions with no live connection");
        }
        Ok(dropped)
    }

    /// One sweep pass: evict idle documents and purge expired sessions.
    ///
    /// A purged session's connection is released like a disconnect (presence
    /// removed, `Left` announced, document flushed) and its outbound queue is
    /// closed, which ends the socket.
    pub async fn sweep(&self) -> (usize, usize) {
        let evicted = self.cache.evict_idle(self.config.idle_timeout).await;
        let purged = match self.registry.purge_expired().await {
            Ok(purged) => purged,
            Err(e) => {
                log::warn!("Session purge failed: {e}");
                Vec::new()
            }
        };
        for session in &purged {
            self.transport.close(session.connection_id).await;
            self.release(session.connection_id).await;
        }
        if evicted > 0 || !purged.is_empty() {
            log::debug!(
                "Sweep: {evicted} documents evicted, {} sessions purged",
                purged.len()
            );
        }
        (evicted, purged.len())
    }

    /// Stop the sweep and flush every cached document.
    pub async fn shutdown(&self) -> usize {
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        let flushed = self.cache.flush_all().await;
        log::info!("Shutdown: flushed {flushed} documents");
        flushed
    }

    // ─── Events ──────────────────────────────────────────────────────

    /// Connect `connection_id` to `document_id`.
    ///
    /// On any failure nothing stays registered for the handle.
    pub async fn handle_connect(
        &self,
        connection_id: ConnectionId,
        credential: Option<&str>,
        document_id: &str,
    ) -> SyncResult<Connected> {
        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        let result = self.connect(connection_id, credential, document_id).await;
        match &result {
            Ok(connected) => {
                log::info!(
                    "{} ({}) connected to {} as {connection_id}",
                    connected.session.display_name,
                    connected.session.principal_id,
                    connected.session.document_key()
                );
            }
            Err(e) => {
                self.stats.rejected_connections.fetch_add(1, Ordering::Relaxed);
                log::info!("Rejected connect {connection_id} to {document_id}: {e}");
            }
        }
        result
    }

    async fn connect(
        &self,
        connection_id: ConnectionId,
        credential: Option<&str>,
        document_id: &str,
    ) -> SyncResult<Connected> {
        let grant = self.validator.validate(credential, document_id).await?;
        let session =
            ConnectionSession::from_grant(connection_id, &grant, document_id, self.config.session_ttl);
        let key = session.document_key();

        self.registry.register(&session).await?;
        if let Err(e) = self.cache.get_or_create(&key).await {
            if let Err(cleanup) = self.registry.remove(connection_id).await {
                log::warn!("Could not unregister {connection_id} after failed hydration: {cleanup}");
            }
            return Err(e);
        }

        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        let entry = self
            .presence
            .set_presence(&key, connection_id, &grant.principal_id, &grant.display_name)
            .await;
        self.announce(&key, connection_id, AwarenessMessage::Joined(entry.to_peer()))
            .await;

        let snapshot = self
            .presence
            .list_presence(&key)
            .await
            .iter()
            .filter(|peer| peer.connection_id != connection_id)
            .map(|peer| Envelope::awareness(&AwarenessMessage::Joined(peer.to_peer())))
            .map(|frame| frame.map(|f| f.encode()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Connected { session, snapshot })
    }

    /// Route one frame from `connection_id`.
    ///
    /// Returns the frame to send back to the sender, if any.
    pub async fn handle_message(
        &self,
        connection_id: ConnectionId,
        frame: &[u8],
    ) -> SyncResult<MessageOutcome> {
        self.stats.total_messages.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_bytes
            .fetch_add(frame.len() as u64, Ordering::Relaxed);

        let result = if frame.len() > self.config.max_frame_bytes {
            Err(SyncError::ProtocolDecode(format!(
                "frame of {} bytes exceeds the {} byte limit",
                frame.len(),
                self.config.max_frame_bytes
            )))
        } else {
            match self.registry.get(connection_id).await {
                Ok(Some(session)) => self.router.route(&session, frame).await,
                Ok(None) => Err(SyncError::SessionNotFound(connection_id)),
                Err(e) => Err(e.into()),
            }
        };
        match &result {
            Ok(MessageOutcome::Ignored { .. }) => {
                self.stats.rejected_messages.fetch_add(1, Ordering::Relaxed);
            }
            Ok(_) => {}
            Err(e) => {
                self.stats.rejected_messages.fetch_add(1, Ordering::Relaxed);
                log::debug!("Message from {connection_id} rejected: {e}");
            }
        }
        result
    }

    /// Tear down `connection_id`. Never fails; problems are logged.
    ///
    /// The session record may already be gone (expired and purged); the
    /// connection's presence is still released if the sweep has not done it.
    pub async fn handle_disconnect(&self, connection_id: ConnectionId) {
        if let Err(e) = self.registry.remove(connection_id).await {
            log::warn!("Could not remove session {connection_id}: {e}");
        }
        match self.release(connection_id).await {
            Some(entry) => log::info!("{} disconnected from {}", entry.principal_id, entry.key),
            None => log::debug!("Disconnect for released connection {connection_id}"),
        }
    }

    /// Remove the presence of `connection_id`, announce `Left` and flush its
    /// document. Only the first call for a connection does anything.
    async fn release(&self, connection_id: ConnectionId) -> Option<PresenceEntry> {
        let entry = self.presence.remove_connection(connection_id).await?;
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        self.announce(
            &entry.key,
            connection_id,
            AwarenessMessage::Left {
                connection_id,
                principal_id: entry.principal_id.clone(),
            },
        )
        .await;
        if let Err(e) = self.cache.flush(&entry.key).await {
            log::warn!("Flush of {} on release failed: {e}", entry.key);
        }
        Some(entry)
    }

    async fn announce(&self, key: &DocumentKey, origin: ConnectionId, msg: AwarenessMessage) {
        let frame = match Envelope::awareness(&msg) {
            Ok(frame) => Arc::new(frame.encode()),
            Err(e) => {
                log::warn!("Could not encode awareness message: {e}");
                return;
            }
        };
        if let Err(e) = self.fanout.broadcast(key, Some(origin), frame).await {
            log::warn!("Awareness fan-out on {key} failed: {e}");
        }
    }

    // ─── Status wrappers ─────────────────────────────────────────────

    /// `handle_connect` reduced to the status the gateway reports.
    pub async fn connect_status(
        &self,
        connection_id: ConnectionId,
        credential: Option<&str>,
        document_id: &str,
    ) -> EventStatus {
        match self.handle_connect(connection_id, credential, document_id).await {
            Ok(_) => EventStatus::Ok,
            Err(e) => e.status(),
        }
    }

    /// `handle_message` reduced to the status the gateway reports.
    pub async fn message_status(&self, connection_id: ConnectionId, frame: &[u8]) -> EventStatus {
        match self.handle_message(connection_id, frame).await {
            Ok(outcome) => outcome.status(),
            Err(e) => e.status(),
        }
    }

    /// Disconnect always reports success.
    pub async fn disconnect_status(&self, connection_id: ConnectionId) -> EventStatus {
        self.handle_disconnect(connection_id).await;
        EventStatus::Ok
    }

    // ─── Accessors ───────────────────────────────────────────────────

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<DocumentCache> {
        &self.cache
    }

    pub fn transport(&self) -> &Arc<ChannelTransport> {
        &self.transport
    }

    pub async fn list_presence(&self, key: &DocumentKey) -> Vec<PresenceEntry> {
        self.presence.list_presence(key).await
    }

    pub fn stats(&self) -> ServiceStats {
        let FanOutStats {
            messages_sent,
            messages_dropped,
        } = self.fanout.stats();
        ServiceStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.stats.rejected_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
            rejected_messages: self.stats.rejected_messages.load(Ordering::Relaxed),
            messages_sent,
            messages_dropped,
        }
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        let sweeper = self
            .sweeper
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
    }
}
