//! In-memory store for testing.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::store::{ExclusiveGuard, ExclusiveLock, KvStore, StoredRecord, WriteBatch, WriteOp};
use credvault_common::{Error, Result};

/// Full copy of both collections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreSnapshot {
    /// Meta collection.
    pub meta: BTreeMap<String, Vec<u8>>,
    /// Items collection.
    pub items: BTreeMap<String, Vec<u8>>,
}

impl StoreSnapshot {
    fn apply(&mut self, op: WriteOp) {
        match op {
            WriteOp::PutMeta { key, value } => {
                self.meta.insert(key, value);
            }
            WriteOp::PutItem { id, value } => {
                self.items.insert(id, value);
            }
            WriteOp::DeleteItem { id } => {
                self.items.remove(&id);
            }
            WriteOp::ClearItems => self.items.clear(),
        }
    }
}

/// In-memory store.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop. Commits are staged on a copy and swapped in only
/// when every write succeeded.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<StoreSnapshot>,
    fail_commit_after: Mutex<Option<usize>>,
    exclusive: ExclusiveLock,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next commit fail after `writes` of its operations were staged.
    pub fn fail_commit_after(&self, writes: usize) {
        if let Ok(mut slot) = self.fail_commit_after.lock() {
            *slot = Some(writes);
        }
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Result<StoreSnapshot> {
        Ok(self.read()?.clone())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, StoreSnapshot>> {
        self.data
            .read()
            .map_err(|_| Error::Storage("Memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, StoreSnapshot>> {
        self.data
            .write()
            .map_err(|_| Error::Storage("Memory store lock poisoned".to_string()))
    }

    fn take_injected_failure(&self) -> Result<Option<usize>> {
        let mut slot = self
            .fail_commit_after
            .lock()
            .map_err(|_| Error::Storage("Memory store lock poisoned".to_string()))?;
        Ok(slot.take())
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.read()?.meta.get(key).cloned())
    }

    async fn put_meta(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.write()?.meta.insert(key.to_string(), value);
        Ok(())
    }

    async fn get_item(&self, id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.read()?.items.get(id).cloned())
    }

    async fn get_all_items(&self) -> Result<Vec<StoredRecord>> {
        Ok(self
            .read()?
            .items
            .iter()
            .map(|(id, value)| StoredRecord {
                id: id.clone(),
                value: value.clone(),
            })
            .collect())
    }

    async fn put_item(&self, id: &str, value: Vec<u8>) -> Result<()> {
        self.write()?.items.insert(id.to_string(), value);
        Ok(())
    }

    async fn delete_item(&self, id: &str) -> Result<()> {
        self.write()?.items.remove(id);
        Ok(())
    }

    async fn clear_items(&self) -> Result<()> {
        self.write()?.items.clear();
        Ok(())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        let fail_after = self.take_injected_failure()?;
        let mut guard = self.write()?;
        let mut staged = guard.clone();

        for (applied, op) in batch.into_iter().enumerate() {
            if fail_after == Some(applied) {
                debug!(applied, "Injected commit failure, discarding staged writes");
                return Err(Error::Storage(format!(
                    "Injected failure after {} writes",
                    applied
                )));
            }
            staged.apply(op);
        }

        *guard = staged;
        Ok(())
    }

    fn try_lock_exclusive(&self) -> Result<ExclusiveGuard> {
        self.exclusive.try_acquire()
    }
}
