//! Durable store abstraction for credvault.
//!
//! This module provides a trait-based interface over a transactional
//! key-value store with two collections: a single-record "meta" collection
//! holding the vault header, and an "items" collection keyed by item id.
//!
//! # Design Principles
//! - Records are opaque bytes; the vault crate owns their schema
//! - Async operations: All I/O operations are async
//! - One all-or-nothing commit primitive spanning both collections
//! - Unified error semantics: backend errors surface as `Error::Storage`

pub mod store;
pub mod memory;
pub mod sqlite;

pub use store::{ExclusiveGuard, KvStore, StoredRecord, WriteBatch, WriteOp, HEADER_KEY};
pub use memory::{MemoryStore, StoreSnapshot};
pub use sqlite::SqliteStore;
