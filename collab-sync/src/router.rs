//! Protocol router: one decoded frame in, its effects out.
//!
//! ```text
//! frame ─► Envelope::decode ─┬─ SYNC_REQUEST ─► cache.diff ─────────► reply SYNC_FULL
//!                            ├─ SYNC_FULL ────┐
//!                            ├─ UPDATE ───────┴► cache.apply ─► fan-out (same bytes)
//!                            ├─ PRESENCE ─────► presence.update ─► fan-out Updated
//!                            └─ other ────────► warn, ignore
//! ```
//!
//! Relaying the identical bytes matters: live editors converge only if each
//! of them merges what the server merged.

use std::sync::Arc;

use thiserror::Error;

use crate::broadcast::{FanOut, FanOutReport};
use crate::cache::DocumentCache;
use crate::error::{EventStatus, SyncError, SyncResult};
use crate::presence::PresenceTracker;
use crate::protocol::{AwarenessMessage, AwarenessState, Envelope, MessageTag};
use crate::registry::ConnectionSession;

// ─── Connection phases ───────────────────────────────────────────────

/// Lifecycle of one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionPhase {
    Connecting,
    Authenticated,
    Active,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid connection transition {from:?} -> {to:?}")]
pub struct PhaseError {
    pub from: ConnectionPhase,
    pub to: ConnectionPhase,
}

impl ConnectionPhase {
    /// Whether `self -> next` is a legal step. Any live phase may close.
    pub fn can_transition(self, next: ConnectionPhase) -> bool {
        use ConnectionPhase::*;
        matches!(
            (self, next),
            (Connecting, Authenticated)
                | (Authenticated, Active)
                | (Connecting | Authenticated | Active, Closed)
        )
    }

    pub fn transition(self, next: ConnectionPhase) -> Result<ConnectionPhase, PhaseError> {
        if self.can_transition(next) {
            Ok(next)
        } else {
            Err(PhaseError {
                from: self,
                to: next,
            })
        }
    }

    /// Message events are only accepted while active.
    pub fn accepts_messages(self) -> bool {
        self == ConnectionPhase::Active
    }
}

// ─── Routing ─────────────────────────────────────────────────────────

/// Effect of routing one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Frame for the sender only.
    Reply(Vec<u8>),
    /// Update merged and relayed to peers.
    Applied(FanOutReport),
    /// Presence changed and announced to peers.
    PresenceUpdated(FanOutReport),
    /// Recognized header, nothing to do with it.
    Ignored { tag: u8 },
}

impl MessageOutcome {
    pub fn status(&self) -> EventStatus {
        match self {
            MessageOutcome::Ignored { .. } => EventStatus::BadRequest,
            _ => EventStatus::Ok,
        }
    }
}

/// Dispatches frames of active connections.
pub struct ProtocolRouter {
    cache: Arc<DocumentCache>,
    presence: Arc<PresenceTracker>,
    fanout: Arc<FanOut>,
}

impl ProtocolRouter {
    pub fn new(
        cache: Arc<DocumentCache>,
        presence: Arc<PresenceTracker>,
        fanout: Arc<FanOut>,
    ) -> Self {
        Self {
            cache,
            presence,
            fanout,
        }
    }

    /// Decode `frame` and apply it on behalf of `session`.
    pub async fn route(
        &self,
        session: &ConnectionSession,
        frame: &[u8],
    ) -> SyncResult<MessageOutcome> {
        let key = session.document_key();
        match Envelope::decode(frame)? {
            Envelope::SyncRequest(digest) => {
                let missing = self.cache.diff(&key, &digest).await?;
                log::debug!(
                    "Sync request on {key} from {}: {} bytes missing",
                    session.connection_id,
                    missing.len()
                );
                Ok(MessageOutcome::Reply(Envelope::SyncFull(missing).encode()))
            }

            Envelope::SyncFull(update) | Envelope::Update(update) => {
                self.cache.apply(&key, &update).await?;
                let report = self
                    .fanout
                    .broadcast(&key, Some(session.connection_id), Arc::new(frame.to_vec()))
                    .await?;
                Ok(MessageOutcome::Applied(report))
            }

            Envelope::Presence(blob) => {
                let state = AwarenessState::decode(&blob)?;
                let entry = match self
                    .presence
                    .update_cursor(&key, session.connection_id, state.cursor)
                    .await
                {
                    Some(entry) => entry,
                    None => {
                        // Presence was dropped under a live session; put it back.
                        self.presence
                            .set_presence(
                                &key,
                                session.connection_id,
                                &session.principal_id,
                                &session.display_name,
                            )
                            .await;
                        self.presence
                            .update_cursor(&key, session.connection_id, state.cursor)
                            .await
                            .ok_or(SyncError::SessionNotFound(session.connection_id))?
                    }
                };
                let announce = Envelope::awareness(&AwarenessMessage::Updated(entry.to_peer()))?;
                let report = self
                    .fanout
                    .broadcast(
                        &key,
                        Some(session.connection_id),
                        Arc::new(announce.encode()),
                    )
                    .await?;
                Ok(MessageOutcome::PresenceUpdated(report))
            }

            Envelope::Error { status, .. } => {
                log::warn!(
                    "Ignoring client-sent error frame (status {status}) from {}",
                    session.connection_id
                );
                Ok(MessageOutcome::Ignored {
                    tag: MessageTag::Error as u8,
                })
            }

            Envelope::Unknown { tag, .. } => {
                log::warn!(
                    "Ignoring frame with unknown tag {tag} from {} on {key}",
                    session.connection_id
                );
                Ok(MessageOutcome::Ignored { tag })
            }
        }
    }
}
