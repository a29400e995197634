//! Encrypted item records.

use chrono::{serde::ts_milliseconds, DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use credvault_common::{Error, ItemId, Result};
use credvault_crypto::{decrypt, encrypt, EncryptedBlob, VaultKey};
use credvault_storage::{KvStore, WriteBatch};

use crate::payload::CredentialPayload;

/// Current time truncated to the millisecond precision records are stored with.
pub(crate) fn now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// A stored item: plaintext metadata around an encrypted payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultItem {
    /// Normalized item name.
    pub id: ItemId,
    /// Creation time.
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    #[serde(with = "ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
    /// Encrypted [`CredentialPayload`].
    pub enc: EncryptedBlob,
}

impl VaultItem {
    /// Encrypt a normalized payload into a record.
    ///
    /// # Preconditions
    /// - `payload` is already normalized
    pub fn seal(
        key: &VaultKey,
        payload: &CredentialPayload,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Result<Self> {
        Ok(Self {
            id: payload.id()?,
            created_at,
            updated_at,
            enc: encrypt(key, payload)?,
        })
    }

    /// Decrypt the payload.
    ///
    /// # Errors
    /// - `Error::CorruptItem` carrying this item's id
    pub fn open(&self, key: &VaultKey) -> Result<CredentialPayload> {
        decrypt(key, &self.enc).map_err(|e| Error::for_item(self.id.as_str(), e))
    }

    /// Serialize for storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Parse a stored record.
    pub fn from_bytes(id: &str, bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::for_item(id, Error::Format(e.to_string())))
    }
}

/// A record together with its decrypted payload.
#[derive(Debug, Clone)]
pub struct DecryptedItem {
    /// Stored record.
    pub item: VaultItem,
    /// Plaintext payload.
    pub payload: CredentialPayload,
}

/// CRUD over the items collection.
#[derive(Clone)]
pub struct ItemStore {
    store: Arc<dyn KvStore>,
}

impl ItemStore {
    /// Create an item store over `store`.
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Every record, still encrypted, ordered by id.
    pub async fn records(&self) -> Result<Vec<VaultItem>> {
        self.store
            .get_all_items()
            .await?
            .iter()
            .map(|r| VaultItem::from_bytes(&r.id, &r.value))
            .collect()
    }

    /// The record with the lowest id, if any.
    pub async fn first(&self) -> Result<Option<VaultItem>> {
        self.store
            .get_all_items()
            .await?
            .first()
            .map(|r| VaultItem::from_bytes(&r.id, &r.value))
            .transpose()
    }

    /// Read one record.
    pub async fn record(&self, id: &ItemId) -> Result<Option<VaultItem>> {
        self.store
            .get_item(id.as_str())
            .await?
            .map(|bytes| VaultItem::from_bytes(id.as_str(), &bytes))
            .transpose()
    }

    /// Normalize, encrypt and insert a new item.
    ///
    /// # Postconditions
    /// - `created_at == updated_at`
    ///
    /// # Errors
    /// - `Error::InvalidPayload` if normalization fails
    /// - `Error::AlreadyExists` if an item with the same id exists
    pub async fn create(&self, key: &VaultKey, payload: &CredentialPayload) -> Result<VaultItem> {
        let payload = payload.normalized()?;
        let id = payload.id()?;

        if self.store.get_item(id.as_str()).await?.is_some() {
            return Err(Error::AlreadyExists(format!("Item '{}' already exists", id)));
        }

        let timestamp = now();
        let item = VaultItem::seal(key, &payload, timestamp, timestamp)?;
        self.store.put_item(id.as_str(), item.to_bytes()?).await?;

        debug!(id = %id, "Item created");
        Ok(item)
    }

    /// Decrypt every item, ordered by id.
    ///
    /// # Errors
    /// - `Error::CorruptItem` for the first record that fails to decrypt
    pub async fn list(&self, key: &VaultKey) -> Result<Vec<DecryptedItem>> {
        let mut items = Vec::new();
        for item in self.records().await? {
            let payload = item.open(key)?;
            items.push(DecryptedItem { item, payload });
        }
        Ok(items)
    }

    /// Decrypt one item.
    ///
    /// # Errors
    /// - `Error::NotFound` if no item has this id
    pub async fn get(&self, key: &VaultKey, id: &ItemId) -> Result<DecryptedItem> {
        let item = self
            .record(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Item '{}' not found", id)))?;
        let payload = item.open(key)?;
        Ok(DecryptedItem { item, payload })
    }

    /// Replace the payload of an existing item.
    ///
    /// A changed name moves the record to the new id in one commit.
    ///
    /// # Postconditions
    /// - `created_at` is preserved, `updated_at` is now
    ///
    /// # Errors
    /// - `Error::InvalidPayload` if normalization fails
    /// - `Error::NotFound` if `id` does not exist
    /// - `Error::AlreadyExists` if the new name belongs to another item
    pub async fn update(
        &self,
        key: &VaultKey,
        id: &ItemId,
        payload: &CredentialPayload,
    ) -> Result<VaultItem> {
        let payload = payload.normalized()?;
        let existing = self
            .record(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Item '{}' not found", id)))?;

        let item = VaultItem::seal(key, &payload, existing.created_at, now())?;

        if item.id == existing.id {
            self.store.put_item(item.id.as_str(), item.to_bytes()?).await?;
            debug!(id = %item.id, "Item updated");
            return Ok(item);
        }

        if self.store.get_item(item.id.as_str()).await?.is_some() {
            return Err(Error::AlreadyExists(format!(
                "Item '{}' already exists",
                item.id
            )));
        }

        let mut batch = WriteBatch::new();
        batch
            .delete_item(existing.id.as_str())
            .put_item(item.id.as_str(), item.to_bytes()?);
        self.store.commit(batch).await?;

        info!(from = %existing.id, to = %item.id, "Item renamed");
        Ok(item)
    }

    /// Remove an item.
    ///
    /// # Errors
    /// - `Error::NotFound` if no item has this id
    pub async fn delete(&self, id: &ItemId) -> Result<()> {
        if self.store.get_item(id.as_str()).await?.is_none() {
            return Err(Error::NotFound(format!("Item '{}' not found", id)));
        }
        self.store.delete_item(id.as_str()).await?;
        debug!(id = %id, "Item deleted");
        Ok(())
    }

    /// Union of all item tags, sorted.
    pub async fn tag_index(&self, key: &VaultKey) -> Result<BTreeSet<String>> {
        let mut tags = BTreeSet::new();
        for item in self.list(key).await? {
            tags.extend(item.payload.tags.iter().cloned());
        }
        Ok(tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use credvault_crypto::KEY_LENGTH;
    use credvault_storage::MemoryStore;

    fn setup() -> (Arc<MemoryStore>, ItemStore, VaultKey) {
        let store = Arc::new(MemoryStore::new());
        let items = ItemStore::new(store.clone());
        (store, items, VaultKey::from_bytes([3; KEY_LENGTH]))
    }

    fn id(s: &str) -> ItemId {
        ItemId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_create_normalizes_and_encrypts() {
        let (store, items, key) = setup();
        let payload = CredentialPayload::new(" github ", "alice", "p1").with_tags(["Work"]);

        let item = items.create(&key, &payload).await.unwrap();

        assert_eq!(item.id.as_str(), "github");
        assert_eq!(item.created_at, item.updated_at);

        let raw = store.get_item("github").await.unwrap().unwrap();
        let raw = String::from_utf8(raw).unwrap();
        assert!(!raw.contains("alice"));
        assert!(!raw.contains("p1"));

        let read = items.get(&key, &id("github")).await.unwrap();
        assert_eq!(read.payload.tags, vec!["work"]);
        assert_eq!(read.item, item);
    }

    #[tokio::test]
    async fn test_create_duplicate_rejected() {
        let (_store, items, key) = setup();
        items
            .create(&key, &CredentialPayload::new("mail", "a", "b"))
            .await
            .unwrap();

        let result = items
            .create(&key, &CredentialPayload::new("  mail", "c", "d"))
            .await;
        assert!(matches!(result, Err(Error::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_list_sorted_by_id() {
        let (_store, items, key) = setup();
        for name in ["zulu", "alpha", "mike"] {
            items
                .create(&key, &CredentialPayload::new(name, "u", "p"))
                .await
                .unwrap();
        }

        let names: Vec<String> = items
            .list(&key)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.item.id.to_string())
            .collect();
        assert_eq!(names, vec!["alpha", "mike", "zulu"]);
    }

    #[tokio::test]
    async fn test_list_reports_corrupt_item() {
        let (store, items, key) = setup();
        items
            .create(&key, &CredentialPayload::new("good", "u", "p"))
            .await
            .unwrap();

        let other = VaultKey::from_bytes([9; KEY_LENGTH]);
        let foreign = VaultItem::seal(
            &other,
            &CredentialPayload::new("bad", "u", "p"),
            now(),
            now(),
        )
        .unwrap();
        store
            .put_item("bad", foreign.to_bytes().unwrap())
            .await
            .unwrap();

        match items.list(&key).await {
            Err(Error::CorruptItem { id, source }) => {
                assert_eq!(id, "bad");
                assert!(source.is_decryption());
            }
            other => panic!("expected CorruptItem, got {:?}", other.map(|v| v.len())),
        }
    }

    #[tokio::test]
    async fn test_update_keeps_created_at() {
        let (_store, items, key) = setup();
        let created = items
            .create(&key, &CredentialPayload::new("mail", "a", "old"))
            .await
            .unwrap();

        let updated = items
            .update(&key, &id("mail"), &CredentialPayload::new("mail", "a", "new"))
            .await
            .unwrap();

        assert_eq!(updated.created_at, created.created_at);
        assert!(updated.updated_at >= created.updated_at);
        let read = items.get(&key, &id("mail")).await.unwrap();
        assert_eq!(read.payload.password, "new");
    }

    #[tokio::test]
    async fn test_update_rename_moves_record() {
        let (_store, items, key) = setup();
        let created = items
            .create(&key, &CredentialPayload::new("mail", "a", "b"))
            .await
            .unwrap();

        let renamed = items
            .update(&key, &id("mail"), &CredentialPayload::new("email", "a", "b"))
            .await
            .unwrap();

        assert_eq!(renamed.id.as_str(), "email");
        assert_eq!(renamed.created_at, created.created_at);
        assert!(items.record(&id("mail")).await.unwrap().is_none());
        assert!(items.record(&id("email")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_update_rename_onto_existing_rejected() {
        let (_store, items, key) = setup();
        for name in ["a", "b"] {
            items
                .create(&key, &CredentialPayload::new(name, "u", "p"))
                .await
                .unwrap();
        }

        let result = items
            .update(&key, &id("a"), &CredentialPayload::new("b", "u", "p"))
            .await;
        assert!(matches!(result, Err(Error::AlreadyExists(_))));
        assert_eq!(items.records().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_update_missing_item() {
        let (_store, items, key) = setup();
        let result = items
            .update(&key, &id("ghost"), &CredentialPayload::new("ghost", "u", "p"))
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_invalid_payload_not_written() {
        let (store, items, key) = setup();
        let result = items
            .create(&key, &CredentialPayload::new("x", "u", "p").with_url("ftp://x"))
            .await;

        assert!(matches!(result, Err(Error::InvalidPayload(_))));
        assert!(store.get_all_items().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete() {
        let (_store, items, key) = setup();
        items
            .create(&key, &CredentialPayload::new("x", "u", "p"))
            .await
            .unwrap();

        items.delete(&id("x")).await.unwrap();
        assert!(items.records().await.unwrap().is_empty());
        assert!(matches!(
            items.delete(&id("x")).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_tag_index_is_sorted_union() {
        let (_store, items, key) = setup();
        items
            .create(&key, &CredentialPayload::new("a", "u", "p").with_tags(["Work", "mail"]))
            .await
            .unwrap();
        items
            .create(&key, &CredentialPayload::new("b", "u", "p").with_tags(["work", "dev"]))
            .await
            .unwrap();

        let tags: Vec<String> = items.tag_index(&key).await.unwrap().into_iter().collect();
        assert_eq!(tags, vec!["dev", "mail", "work"]);
    }

    #[test]
    fn test_record_wire_shape() {
        let key = VaultKey::from_bytes([1; KEY_LENGTH]);
        let at = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        let item = VaultItem::seal(&key, &CredentialPayload::new("x", "u", "p"), at, at).unwrap();

        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["id"], "x");
        assert_eq!(json["createdAt"], 1_700_000_000_123i64);
        assert_eq!(json["updatedAt"], 1_700_000_000_123i64);
        assert_eq!(json["enc"]["version"], 2);
    }
}
