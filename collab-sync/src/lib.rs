//! # collab-sync: real-time collaborative document sync core
//!
//! Many editors mutate one shared document concurrently; the server merges
//! every update into a warm CRDT replica, relays it to the other editors of
//! the same document, tracks who is present, and persists the merged state
//! in the background.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  WebSocket  ┌──────────────┐      ┌──────────────────┐
//! │ Editor A   │ ◄─────────► │ SyncServer   │ ───► │ AccessValidator  │
//! └────────────┘ Binary Proto│ (gateway)    │      └──────────────────┘
//! ┌────────────┐             └──────┬───────┘
//! │ Editor B   │ ◄──────────────────┤ SyncService
//! └────────────┘                    ▼
//!                  ┌───────────────────────────────────┐
//!                  │ ProtocolRouter                    │
//!                  └──┬──────────────┬──────────────┬──┘
//!                     ▼              ▼              ▼
//!              ┌────────────┐ ┌─────────────┐ ┌──────────┐
//!              │ Document   │ │ Presence    │ │ FanOut   │──► ConnectionRegistry
//!              │ Cache      │ │ Tracker     │ │          │    (document index)
//!              └─────┬──────┘ └─────────────┘ └──────────┘
//!                    │ debounced
//!                    ▼
//!              ┌────────────────────┐
//!              │ PersistenceAdapter │──► RocksDB
//!              └────────────────────┘
//! ```
//!
//! Every document-scoped structure is keyed by [`DocumentKey`]
//! (tenant, document), so tenants never share state.
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire envelope and awareness payloads
//! - [`auth`]: Credential verification and document authorization
//! - [`registry`]: Live connection sessions with a per-document index
//! - [`replica`]: Mergeable document state (yrs CRDT)
//! - [`cache`]: Warm documents with debounced persistence
//! - [`presence`]: Ephemeral cursors and deterministic colors
//! - [`broadcast`]: Fan-out to the other connections of a document
//! - [`router`]: Frame dispatch and connection phases
//! - [`service`]: Connect / message / disconnect events and lifecycle
//! - [`server`]: WebSocket gateway
//! - [`storage`]: RocksDB store and persistence adapters

pub mod auth;
pub mod broadcast;
pub mod cache;
pub mod config;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod replica;
pub mod router;
pub mod server;
pub mod service;
pub mod storage;

// Re-exports for convenience
pub use auth::{
    AccessGrant, AccessValidator, DocumentAuthorizer, Identity, IdentityService,
    JwtIdentityService, StaticAuthorizer, StaticIdentityService, TenantAuthorizer,
};
pub use broadcast::{ChannelTransport, FanOut, FanOutReport, Transport};
pub use cache::DocumentCache;
pub use config::{ConfigError, ServerConfig};
pub use error::{EventStatus, SyncError, SyncResult};
pub use presence::{PresenceEntry, PresenceTracker};
pub use protocol::{AwarenessMessage, AwarenessState, Cursor, Envelope, MessageTag, PeerPresence};
pub use registry::{ConnectionId, ConnectionRegistry, ConnectionSession, DocumentKey};
pub use replica::{Replica, YrsReplica};
pub use router::{ConnectionPhase, MessageOutcome, ProtocolRouter};
pub use server::SyncServer;
pub use service::{Connected, ServiceStats, SyncService};
pub use storage::{MemoryPersistence, PersistenceAdapter, RocksPersistence, Store, StoreConfig};
