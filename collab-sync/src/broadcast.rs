//! Fan-out of encoded frames to every other live connection on a document.
//!
//! Recipients are resolved through the connection registry's document index
//! on every call, so a connection that disconnected or expired stops
//! receiving immediately. Delivery goes through a [`Transport`]; the gateway
//! plugs in [`ChannelTransport`], one bounded queue per socket.
//!
//! A failed delivery to one connection (full queue, closed socket) is logged
//! and counted and never stops delivery to the rest. A connection whose
//! queue is full has missed a frame, so its channel is closed: the socket
//! task ends, and the client reconnects and re-syncs from a fresh digest.
//!
//! Reference: Patterson & Hennessy, Section 6.4: Interconnection Networks

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};

use crate::error::SyncResult;
use crate::registry::{ConnectionId, ConnectionRegistry, DocumentKey};

/// Frame bytes shared between all recipients of one fan-out.
pub type Frame = Arc<Vec<u8>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("connection {0} has no open channel")]
    UnknownConnection(ConnectionId),
    #[error("outbound queue for {0} is full")]
    QueueFull(ConnectionId),
    #[error("connection {0} is closed")]
    Closed(ConnectionId),
}

/// Delivers frames to connections.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, connection_id: ConnectionId, frame: Frame) -> Result<(), DeliveryError>;

    /// Stop delivering to `connection_id` and end its socket.
    async fn disconnect(&self, connection_id: ConnectionId);
}

// ─── Channel transport ───────────────────────────────────────────────

/// One bounded `mpsc` queue per connection; the socket task drains it.
pub struct ChannelTransport {
    channels: RwLock<HashMap<ConnectionId, mpsc::Sender<Frame>>>,
    capacity: usize,
}

impl ChannelTransport {
    /// `capacity` is how many frames may queue for one slow connection
    /// before further deliveries to it fail.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Open the queue for a connection. Replaces any previous queue.
    pub async fn open(&self, connection_id: ConnectionId) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.channels.write().await.insert(connection_id, tx);
        rx
    }

    pub async fn close(&self, connection_id: ConnectionId) {
        self.channels.write().await.remove(&connection_id);
    }

    pub async fn is_open(&self, connection_id: ConnectionId) -> bool {
        self.channels.read().await.contains_key(&connection_id)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn deliver(&self, connection_id: ConnectionId, frame: Frame) -> Result<(), DeliveryError> {
        let sender = self
            .channels
            .read()
            .await
            .get(&connection_id)
            .cloned()
            .ok_or(DeliveryError::UnknownConnection(connection_id))?;
        sender.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::QueueFull(connection_id),
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed(connection_id),
        })
    }

    async fn disconnect(&self, connection_id: ConnectionId) {
        // Dropping the only sender ends the receiver once it drains.
        self.close(connection_id).await;
    }
}

// ─── Fan-out ─────────────────────────────────────────────────────────

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOutReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Snapshot of the fan-out counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOutStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
}

/// Lock-free counters for the hot path.
#[derive(Default)]
struct AtomicFanOutStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Resolves recipients of a document and delivers to them.
pub struct FanOut {
    registry: ConnectionRegistry,
    transport: Arc<dyn Transport>,
    stats: AtomicFanOutStats,
}

impl FanOut {
    pub fn new(registry: ConnectionRegistry, transport: Arc<dyn Transport>) -> Self {
        Self {
            registry,
            transport,
            stats: AtomicFanOutStats::default(),
        }
    }

    /// Deliver `frame` to every live connection on `key` except `exclude`.
    ///
    /// Only a registry lookup failure is an error; per-connection delivery
    /// failures are reported in the [`FanOutReport`].
    pub async fn broadcast(
        &self,
        key: &DocumentKey,
        exclude: Option<ConnectionId>,
        frame: Frame,
    ) -> SyncResult<FanOutReport> {
        let recipients = self.registry.list_by_document(key).await?;
        let mut report = FanOutReport::default();

        for session in recipients {
            if Some(session.connection_id) == exclude {
                continue;
            }
            match self
                .transport
                .deliver(session.connection_id, frame.clone())
                .await
            {
                Ok(()) => {
                    report.delivered += 1;
                    self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    report.failed += 1;
                    log::warn!("Fan-out on {key}: {e}");
                    self.dropped(e).await;
                }
            }
        }

        log::trace!(
            "Fan-out on {key}: {} delivered, {} failed",
            report.delivered,
            report.failed
        );
        Ok(report)
    }

    /// Deliver `frame` to a single connection, counting the outcome.
    pub async fn send_to(&self, connection_id: ConnectionId, frame: Frame) -> bool {
        match self.transport.deliver(connection_id, frame).await {
            Ok(()) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                log::warn!("Direct send failed: {e}");
                self.dropped(e).await;
                false
            }
        }
    }

    async fn dropped(&self, error: DeliveryError) {
        self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
        if let DeliveryError::QueueFull(connection_id) = error {
            log::warn!("Closing lagging connection {connection_id}");
            self.transport.disconnect(connection_id).await;
        }
    }

    pub fn stats(&self) -> FanOutStats {
        FanOutStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
        }
    }
}
