//! Presence tracking: who is on each document and where their cursor is.
//!
//! ## Architecture
//!
//! ```text
//! connect ──► set_presence ─────┐
//!                               ▼
//! PRESENCE ─► update_cursor ──► room[DocumentKey] ─► AwarenessMessage
//!                               ▲                        │
//! disconnect ► remove_presence ─┘                        ▼
//!                                                 FanOut (peers)
//! ```
//!
//! Entries are ephemeral: nothing here is ever persisted, and a room with no
//! entries is dropped. Colors are a pure function of the principal id, so the
//! same user gets the same color on every connection and every node.
//!
//! Reference: Kleppmann, Chapter 8: Broadcast Protocols

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::protocol::{Cursor, PeerPresence};
use crate::registry::{unix_millis, ConnectionId, DocumentKey};

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// Palette of visually distinct cursor colors.
pub const PALETTE: [&str; 12] = [
    "#e6194b", "#3cb44b", "#4363d8", "#f58231", "#911eb4", "#42d4f4",
    "#f032e6", "#bfef45", "#469990", "#9a6324", "#800000", "#000075",
];

/// Stable color for a principal (FNV-1a over the id bytes).
pub fn color_for(principal_id: &str) -> &'static str {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let hash = principal_id.bytes().fold(FNV_OFFSET, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    });
    PALETTE[(hash % PALETTE.len() as u64) as usize]
}

// ───────────────────────────────────────────────────────────────────
// Entries
// ───────────────────────────────────────────────────────────────────

/// One connection's presence on a document.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    pub key: DocumentKey,
    pub connection_id: ConnectionId,
    pub principal_id: String,
    pub display_name: String,
    pub color: String,
    pub cursor: Option<Cursor>,
    /// Unix millis
    pub last_seen_at: u64,
}

impl PresenceEntry {
    /// What other peers see of this entry.
    pub fn to_peer(&self) -> PeerPresence {
        PeerPresence {
            connection_id: self.connection_id,
            principal_id: self.principal_id.clone(),
            display_name: self.display_name.clone(),
            color: self.color.clone(),
            cursor: self.cursor,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

type Room = HashMap<ConnectionId, PresenceEntry>;

#[derive(Default)]
struct Rooms {
    by_document: HashMap<DocumentKey, Room>,
    /// Reverse index: the one document each connection is present on.
    by_connection: HashMap<ConnectionId, DocumentKey>,
}

impl Rooms {
    fn remove(&mut self, key: &DocumentKey, connection_id: ConnectionId) -> Option<PresenceEntry> {
        let room = self.by_document.get_mut(key)?;
        let removed = room.remove(&connection_id)?;
        if room.is_empty() {
            self.by_document.remove(key);
        }
        self.by_connection.remove(&connection_id);
        Some(removed)
    }
}

/// Per-document presence rooms.
#[derive(Default)]
pub struct PresenceTracker {
    rooms: RwLock<Rooms>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `connection_id`. The cursor starts empty.
    pub async fn set_presence(
        &self,
        key: &DocumentKey,
        connection_id: ConnectionId,
        principal_id: &str,
        display_name: &str,
    ) -> PresenceEntry {
        let entry = PresenceEntry {
            key: key.clone(),
            connection_id,
            principal_id: principal_id.to_string(),
            display_name: display_name.to_string(),
            color: color_for(principal_id).to_string(),
            cursor: None,
            last_seen_at: unix_millis(),
        };
        let mut rooms = self.rooms.write().await;
        if let Some(previous) = rooms.by_connection.get(&connection_id).cloned() {
            rooms.remove(&previous, connection_id);
        }
        rooms
            .by_document
            .entry(key.clone())
            .or_default()
            .insert(connection_id, entry.clone());
        rooms.by_connection.insert(connection_id, key.clone());
        log::debug!("Presence: {principal_id} joined {key}");
        entry
    }

    /// Move (or clear) the cursor of an existing entry.
    ///
    /// Returns `None` when the connection has no presence on `key`.
    pub async fn update_cursor(
        &self,
        key: &DocumentKey,
        connection_id: ConnectionId,
        cursor: Option<Cursor>,
    ) -> Option<PresenceEntry> {
        let mut rooms = self.rooms.write().await;
        let entry = rooms.by_document.get_mut(key)?.get_mut(&connection_id)?;
        entry.cursor = cursor;
        entry.last_seen_at = unix_millis();
        log::trace!("Presence: cursor update in {key}");
        Some(entry.clone())
    }

    /// Remove the entry; drops the room once it is empty.
    pub async fn remove_presence(
        &self,
        key: &DocumentKey,
        connection_id: ConnectionId,
    ) -> Option<PresenceEntry> {
        let removed = self.rooms.write().await.remove(key, connection_id);
        if let Some(entry) = &removed {
            log::debug!("Presence: {} left {key}", entry.principal_id);
        }
        removed
    }

    /// Remove whatever entry `connection_id` has, on any document.
    pub async fn remove_connection(&self, connection_id: ConnectionId) -> Option<PresenceEntry> {
        let mut rooms = self.rooms.write().await;
        let key = rooms.by_connection.get(&connection_id)?.clone();
        let removed = rooms.remove(&key, connection_id);
        if let Some(entry) = &removed {
            log::debug!("Presence: {} left {key}", entry.principal_id);
        }
        removed
    }

    /// Entries on `key`, ordered by principal id then connection handle.
    pub async fn list_presence(&self, key: &DocumentKey) -> Vec<PresenceEntry> {
        let rooms = self.rooms.read().await;
        let mut entries: Vec<_> = rooms
            .by_document
            .get(key)
            .map(|room| room.values().cloned().collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| {
            a.principal_id
                .cmp(&b.principal_id)
                .then(a.connection_id.cmp(&b.connection_id))
        });
        entries
    }

    /// Number of documents with at least one present connection.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.by_document.len()
    }
}

// ===================================================================
// Tests
// ===================================================================
