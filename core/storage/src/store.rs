//! Durable store trait definition.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use credvault_common::{Error, Result};

/// Fixed key of the header record in the meta collection.
pub const HEADER_KEY: &str = "header";

/// Guard held for the duration of an exclusive maintenance operation (rekey).
pub type ExclusiveGuard = OwnedMutexGuard<()>;

/// A record read from the items collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    /// Item id (collection key).
    pub id: String,
    /// Serialized record.
    pub value: Vec<u8>,
}

/// A single write inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Put a record into the meta collection.
    PutMeta { key: String, value: Vec<u8> },
    /// Put (insert or overwrite) an item record.
    PutItem { id: String, value: Vec<u8> },
    /// Delete an item record if present.
    DeleteItem { id: String },
    /// Remove every item record.
    ClearItems,
}

/// Ordered set of writes applied atomically by [`KvStore::commit`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a meta put.
    pub fn put_meta(&mut self, key: impl Into<String>, value: Vec<u8>) -> &mut Self {
        self.ops.push(WriteOp::PutMeta {
            key: key.into(),
            value,
        });
        self
    }

    /// Queue an item put.
    pub fn put_item(&mut self, id: impl Into<String>, value: Vec<u8>) -> &mut Self {
        self.ops.push(WriteOp::PutItem {
            id: id.into(),
            value,
        });
        self
    }

    /// Queue an item delete.
    pub fn delete_item(&mut self, id: impl Into<String>) -> &mut Self {
        self.ops.push(WriteOp::DeleteItem { id: id.into() });
        self
    }

    /// Queue removal of all items.
    pub fn clear_items(&mut self) -> &mut Self {
        self.ops.push(WriteOp::ClearItems);
        self
    }

    /// Number of queued writes.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Check if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Queued writes in order.
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }
}

impl IntoIterator for WriteBatch {
    type Item = WriteOp;
    type IntoIter = std::vec::IntoIter<WriteOp>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.into_iter()
    }
}

/// Transactional key-value store with a meta and an items collection.
///
/// Single-collection operations are individually atomic. [`KvStore::commit`]
/// is the only operation spanning both collections and must be all-or-nothing.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Get the backend name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Read a record from the meta collection.
    async fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a record to the meta collection, replacing any previous value.
    async fn put_meta(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Read one item record.
    async fn get_item(&self, id: &str) -> Result<Option<Vec<u8>>>;

    /// Read every item record, ordered by id.
    async fn get_all_items(&self) -> Result<Vec<StoredRecord>>;

    /// Insert or overwrite an item record.
    async fn put_item(&self, id: &str, value: Vec<u8>) -> Result<()>;

    /// Delete an item record. Deleting a missing id is not an error.
    async fn delete_item(&self, id: &str) -> Result<()>;

    /// Remove every item record.
    async fn clear_items(&self) -> Result<()>;

    /// Apply a batch atomically across both collections.
    ///
    /// # Postconditions
    /// - On `Ok`, every write in the batch is durable
    /// - On `Err`, no write in the batch is observable
    async fn commit(&self, batch: WriteBatch) -> Result<()>;

    /// Acquire the store's exclusive maintenance lock without waiting.
    ///
    /// # Errors
    /// - `Error::Conflict` if another holder has it
    fn try_lock_exclusive(&self) -> Result<ExclusiveGuard>;
}

/// Shared exclusive lock used by the backends.
#[derive(Debug, Clone, Default)]
pub(crate) struct ExclusiveLock(Arc<Mutex<()>>);

impl ExclusiveLock {
    pub(crate) fn try_acquire(&self) -> Result<ExclusiveGuard> {
        self.0
            .clone()
            .try_lock_owned()
            .map_err(|_| Error::Conflict("Another rekey is already in progress".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_preserves_order() {
        let mut batch = WriteBatch::new();
        batch
            .clear_items()
            .put_item("a", vec![1])
            .delete_item("b")
            .put_meta(HEADER_KEY, vec![2]);

        assert_eq!(batch.len(), 4);
        assert_eq!(batch.ops()[0], WriteOp::ClearItems);
        assert_eq!(
            batch.ops()[3],
            WriteOp::PutMeta {
                key: HEADER_KEY.to_string(),
                value: vec![2]
            }
        );
    }

    #[test]
    fn test_exclusive_lock_rejects_second_holder() {
        let lock = ExclusiveLock::default();
        let guard = lock.try_acquire().unwrap();

        assert!(matches!(lock.try_acquire(), Err(Error::Conflict(_))));

        drop(guard);
        assert!(lock.try_acquire().is_ok());
    }
}
