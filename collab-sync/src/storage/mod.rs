//! Durable storage for the sync core.
//!
//! Architecture:
//! ```text
//! ┌───────────────┐  load/save   ┌────────────────────┐
//! │ DocumentCache │ ───────────► │ PersistenceAdapter │
//! └───────────────┘              └─────────┬──────────┘
//!                                          │
//! ┌────────────────────┐                   ▼
//! │ ConnectionRegistry │ ──────────► ┌─────────────┐
//! │ (SessionStore)     │             │ Store       │
//! └────────────────────┘             │ (RocksDB)   │
//!                                    └──────┬──────┘
//!                                           │ column families
//!                   ┌───────────────────────┴──────────────────────┐
//!                   │ CF "documents"    : encoded state (LZ4)      │
//!                   │ CF "sessions"     : connection sessions      │
//!                   │ CF "session_index": document → connections   │
//!                   └──────────────────────────────────────────────┘
//! ```
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 3

pub mod persistence;
pub mod rocks;

pub use persistence::{MemoryPersistence, PersistenceAdapter, RocksPersistence};
pub use rocks::{PersistedDocumentState, Store, StoreConfig, StoreError};
