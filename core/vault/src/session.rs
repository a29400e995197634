//! Vault session management.
//!
//! A session is either locked or unlocked. Only an unlocked session holds a
//! key, and it holds exactly one; locking drops it, which zeroizes it.

use chrono::{DateTime, Utc};
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use credvault_common::{Error, ItemId, Result};
use credvault_crypto::VaultKey;
use credvault_storage::KvStore;

use crate::config::VaultOptions;
use crate::header::{ensure_canary, verify_key, HeaderStore, VaultHeader};
use crate::items::{now, DecryptedItem, ItemStore, VaultItem};
use crate::payload::CredentialPayload;
use crate::rekey::{OldKey, RekeyEngine, RekeyProgress, RekeyRequest};

/// Observer notified when a session locks.
///
/// Presentation layers use this to hide any revealed secrets.
pub trait LockListener: Send + Sync {
    /// Called before the key is dropped.
    fn on_lock(&self);
}

/// State of the vault session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Key is resident.
    Unlocked,
    /// No key in memory.
    Locked,
}

struct Unlocked {
    header: VaultHeader,
    key: VaultKey,
    unlocked_at: DateTime<Utc>,
    tag_index: BTreeSet<String>,
}

/// Vault session.
///
/// Owns the store handle and, while unlocked, the header the key was
/// derived from together with the key itself.
pub struct VaultSession {
    store: Arc<dyn KvStore>,
    headers: HeaderStore,
    items: ItemStore,
    options: VaultOptions,
    unlocked: Option<Unlocked>,
    listeners: Vec<Arc<dyn LockListener>>,
}

impl VaultSession {
    /// Create a locked session over `store`.
    pub fn new(store: Arc<dyn KvStore>, options: VaultOptions) -> Self {
        Self {
            headers: HeaderStore::new(store.clone()),
            items: ItemStore::new(store.clone()),
            store,
            options,
            unlocked: None,
            listeners: Vec::new(),
        }
    }

    /// Register a lock observer.
    pub fn add_lock_listener(&mut self, listener: Arc<dyn LockListener>) {
        self.listeners.push(listener);
    }

    /// Unlock the vault with a passphrase.
    ///
    /// A vault with no header gets one on first unlock; the passphrase used
    /// then becomes the vault passphrase.
    ///
    /// # Postconditions
    /// - Session is unlocked with the derived key
    /// - The stored header carries a canary
    /// - The tag index is current
    ///
    /// # Errors
    /// - `Error::InvalidInput` if the passphrase is empty
    /// - `Error::IncorrectPassphrase` if key verification fails
    /// - `Error::CorruptItem` if an item cannot be read for the tag index
    ///
    /// Any resident key is dropped first, so a failed attempt always leaves
    /// the session locked.
    pub async fn unlock(&mut self, passphrase: &str) -> Result<()> {
        if self.unlocked.is_some() {
            self.lock();
        }

        let header = self.headers.get_or_create(&self.options).await?;
        let key = header.derive_key(passphrase)?;

        let first = self.items.first().await?;
        verify_key(&key, &header, first.as_ref().map(|i| &i.enc))?;

        let updated = match ensure_canary(&header, &key)? {
            Cow::Owned(updated) => Some(updated),
            Cow::Borrowed(_) => None,
        };
        let header = match updated {
            Some(updated) => {
                self.headers.save(&updated).await?;
                updated
            }
            None => header,
        };

        let tag_index = self.items.tag_index(&key).await?;
        self.unlocked = Some(Unlocked {
            header,
            key,
            unlocked_at: now(),
            tag_index,
        });

        info!(backend = self.store.name(), "Vault unlocked");
        Ok(())
    }

    /// Lock the session.
    ///
    /// Listeners run first; then the key is dropped and zeroized.
    pub fn lock(&mut self) {
        for listener in &self.listeners {
            listener.on_lock();
        }
        if self.unlocked.take().is_some() {
            info!("Vault locked");
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        if self.unlocked.is_some() {
            SessionState::Unlocked
        } else {
            SessionState::Locked
        }
    }

    /// Check if a key is resident.
    pub fn is_unlocked(&self) -> bool {
        self.unlocked.is_some()
    }

    /// Header the resident key was derived from.
    pub fn header(&self) -> Option<&VaultHeader> {
        self.unlocked.as_ref().map(|u| &u.header)
    }

    /// Time of the last successful unlock.
    pub fn unlocked_at(&self) -> Option<DateTime<Utc>> {
        self.unlocked.as_ref().map(|u| u.unlocked_at)
    }

    /// Sorted union of all tags; empty while locked.
    pub fn tags(&self) -> Vec<&str> {
        self.unlocked
            .as_ref()
            .map(|u| u.tag_index.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Session options.
    pub fn options(&self) -> &VaultOptions {
        &self.options
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Header persistence.
    pub fn header_store(&self) -> &HeaderStore {
        &self.headers
    }

    /// Item persistence.
    pub fn item_store(&self) -> &ItemStore {
        &self.items
    }

    /// Recompute the tag index from the stored items. No-op while locked.
    pub async fn refresh_tag_index(&mut self) -> Result<()> {
        let Some(unlocked) = self.unlocked.as_ref() else {
            return Ok(());
        };
        let tag_index = self.items.tag_index(&unlocked.key).await?;
        if let Some(unlocked) = self.unlocked.as_mut() {
            debug!(tags = tag_index.len(), "Tag index refreshed");
            unlocked.tag_index = tag_index;
        }
        Ok(())
    }

    /// Create an item and refresh the tag index.
    pub async fn create_item(&mut self, payload: &CredentialPayload) -> Result<VaultItem> {
        let item = self.items.create(self.key()?, payload).await?;
        self.refresh_tag_index().await?;
        Ok(item)
    }

    /// Decrypt every item.
    pub async fn list_items(&self) -> Result<Vec<DecryptedItem>> {
        self.items.list(self.key()?).await
    }

    /// Decrypt the items carrying `tag`.
    pub async fn items_with_tag(&self, tag: &str) -> Result<Vec<DecryptedItem>> {
        let tag = tag.trim().to_lowercase();
        Ok(self
            .list_items()
            .await?
            .into_iter()
            .filter(|d| d.payload.tags.iter().any(|t| *t == tag))
            .collect())
    }

    /// Decrypt one item.
    pub async fn get_item(&self, id: &ItemId) -> Result<DecryptedItem> {
        self.items.get(self.key()?, id).await
    }

    /// Update an item and refresh the tag index.
    pub async fn update_item(
        &mut self,
        id: &ItemId,
        payload: &CredentialPayload,
    ) -> Result<VaultItem> {
        let item = self.items.update(self.key()?, id, payload).await?;
        self.refresh_tag_index().await?;
        Ok(item)
    }

    /// Delete an item.
    ///
    /// Deleting needs no key, so it works while locked.
    pub async fn delete_item(&mut self, id: &ItemId) -> Result<()> {
        self.items.delete(id).await?;
        self.refresh_tag_index().await
    }

    /// Rotate the vault passphrase.
    ///
    /// Uses the resident key when unlocked; otherwise `current` is required.
    /// On success the session holds the new header and key.
    ///
    /// # Errors
    /// - `Error::NotPermitted` if locked and no current passphrase is given
    /// - Any rekey error; the store and session are then unchanged
    pub async fn change_passphrase(
        &mut self,
        current: Option<&str>,
        new_passphrase: &str,
        iterations: Option<u32>,
        progress: &mut (dyn FnMut(&RekeyProgress) + Send),
    ) -> Result<usize> {
        let engine = RekeyEngine::new(self.store.clone(), self.options.clone());

        let old_key = match (&self.unlocked, current) {
            (Some(unlocked), _) => OldKey::Session(&unlocked.key),
            (None, Some(passphrase)) => OldKey::Passphrase(passphrase),
            (None, None) => {
                return Err(Error::NotPermitted(
                    "Vault is locked; the current passphrase is required".to_string(),
                ))
            }
        };

        let outcome = engine
            .rekey(
                RekeyRequest {
                    old_key,
                    new_passphrase,
                    iterations,
                },
                progress,
            )
            .await?;

        self.install(outcome.header, outcome.key).await?;
        Ok(outcome.count)
    }

    /// Key of the unlocked session.
    pub(crate) fn key(&self) -> Result<&VaultKey> {
        self.unlocked
            .as_ref()
            .map(|u| &u.key)
            .ok_or_else(|| Error::NotPermitted("Vault is locked".to_string()))
    }

    /// Replace the resident header; the key stays.
    pub(crate) fn replace_header(&mut self, header: VaultHeader) {
        if let Some(unlocked) = self.unlocked.as_mut() {
            unlocked.header = header;
        }
    }

    /// Swap in a header and its key as one unit, then rebuild the tag index.
    pub(crate) async fn install(&mut self, header: VaultHeader, key: VaultKey) -> Result<()> {
        self.unlocked = Some(Unlocked {
            header,
            key,
            unlocked_at: now(),
            tag_index: BTreeSet::new(),
        });
        self.refresh_tag_index().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use credvault_storage::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ITERATIONS: u32 = 1_000;

    fn session() -> (Arc<MemoryStore>, VaultSession) {
        let store = Arc::new(MemoryStore::new());
        let session = VaultSession::new(store.clone(), VaultOptions::with_iterations(ITERATIONS));
        (store, session)
    }

    #[derive(Default)]
    struct CountingListener(AtomicUsize);

    impl LockListener for CountingListener {
        fn on_lock(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_first_unlock_creates_header_with_canary() {
        let (_store, mut session) = session();
        assert_eq!(session.state(), SessionState::Locked);

        session.unlock("pw").await.unwrap();

        assert_eq!(session.state(), SessionState::Unlocked);
        assert!(session.unlocked_at().is_some());
        let stored = session.header_store().load().await.unwrap().unwrap();
        assert!(stored.canary.is_some());
        assert_eq!(session.header(), Some(&stored));
    }

    #[tokio::test]
    async fn test_wrong_passphrase_stays_locked() {
        let (_store, mut session) = session();
        session.unlock("right").await.unwrap();
        session.lock();

        assert!(matches!(
            session.unlock("wrong").await,
            Err(Error::IncorrectPassphrase)
        ));
        assert!(!session.is_unlocked());
    }

    #[tokio::test]
    async fn test_failed_unlock_while_unlocked_locks() {
        let (_store, mut session) = session();
        let listener = Arc::new(CountingListener::default());
        session.add_lock_listener(listener.clone());
        session.unlock("right").await.unwrap();
        session
            .create_item(&CredentialPayload::new("a", "u", "p").with_tags(["x"]))
            .await
            .unwrap();

        assert!(matches!(
            session.unlock("wrong").await,
            Err(Error::IncorrectPassphrase)
        ));
        assert_eq!(session.state(), SessionState::Locked);
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);
        assert!(session.header().is_none());
        assert!(session.tags().is_empty());
        assert!(matches!(
            session.list_items().await,
            Err(Error::NotPermitted(_))
        ));

        session.unlock("right").await.unwrap();
        assert_eq!(session.tags(), vec!["x"]);
    }

    #[tokio::test]
    async fn test_empty_passphrase_rejected() {
        let (_store, mut session) = session();
        assert!(matches!(
            session.unlock("").await,
            Err(Error::InvalidInput(_))
        ));
        assert!(!session.is_unlocked());
    }

    #[tokio::test]
    async fn test_lock_notifies_and_blocks_reads() {
        let (_store, mut session) = session();
        let listener = Arc::new(CountingListener::default());
        session.add_lock_listener(listener.clone());

        session.unlock("pw").await.unwrap();
        session.lock();

        assert_eq!(listener.0.load(Ordering::SeqCst), 1);
        assert!(session.header().is_none());
        assert!(session.tags().is_empty());
        assert!(matches!(
            session.list_items().await,
            Err(Error::NotPermitted(_))
        ));
        assert!(matches!(
            session
                .create_item(&CredentialPayload::new("x", "u", "p"))
                .await,
            Err(Error::NotPermitted(_))
        ));
    }

    #[tokio::test]
    async fn test_tag_index_follows_writes() {
        let (_store, mut session) = session();
        session.unlock("pw").await.unwrap();

        session
            .create_item(&CredentialPayload::new("a", "u", "p").with_tags(["Work"]))
            .await
            .unwrap();
        session
            .create_item(&CredentialPayload::new("b", "u", "p").with_tags(["dev"]))
            .await
            .unwrap();
        assert_eq!(session.tags(), vec!["dev", "work"]);

        let work = session.items_with_tag("WORK").await.unwrap();
        assert_eq!(work.len(), 1);
        assert_eq!(work[0].item.id.as_str(), "a");

        session.delete_item(&ItemId::new("b").unwrap()).await.unwrap();
        assert_eq!(session.tags(), vec!["work"]);
    }

    #[tokio::test]
    async fn test_delete_while_locked() {
        let (_store, mut session) = session();
        session.unlock("pw").await.unwrap();
        session
            .create_item(&CredentialPayload::new("a", "u", "p"))
            .await
            .unwrap();
        session.lock();

        session.delete_item(&ItemId::new("a").unwrap()).await.unwrap();
        assert!(session.item_store().records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unlock_legacy_vault_without_canary() {
        let (store, mut session) = session();
        let header = VaultHeader::new(ITERATIONS).unwrap();
        let key = header.derive_key("pw").unwrap();
        HeaderStore::new(store.clone()).save(&header).await.unwrap();
        ItemStore::new(store.clone())
            .create(&key, &CredentialPayload::new("a", "u", "p"))
            .await
            .unwrap();

        assert!(matches!(
            session.unlock("nope").await,
            Err(Error::IncorrectPassphrase)
        ));
        assert!(session.header_store().load().await.unwrap().unwrap().canary.is_none());

        session.unlock("pw").await.unwrap();
        assert!(session.header_store().load().await.unwrap().unwrap().canary.is_some());
    }

    #[tokio::test]
    async fn test_change_passphrase_while_unlocked() {
        let (_store, mut session) = session();
        session.unlock("old").await.unwrap();
        session
            .create_item(&CredentialPayload::new("a", "u", "secret").with_tags(["x"]))
            .await
            .unwrap();

        let count = session
            .change_passphrase(None, "new", None, &mut |_: &RekeyProgress| {})
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(session.tags(), vec!["x"]);

        session.lock();
        assert!(matches!(
            session.unlock("old").await,
            Err(Error::IncorrectPassphrase)
        ));
        session.unlock("new").await.unwrap();
        let item = session.get_item(&ItemId::new("a").unwrap()).await.unwrap();
        assert_eq!(item.payload.password, "secret");
    }

    #[tokio::test]
    async fn test_change_passphrase_while_locked() {
        let (_store, mut session) = session();
        session.unlock("old").await.unwrap();
        session.lock();

        assert!(matches!(
            session
                .change_passphrase(None, "new", None, &mut |_: &RekeyProgress| {})
                .await,
            Err(Error::NotPermitted(_))
        ));

        session
            .change_passphrase(Some("old"), "new", None, &mut |_: &RekeyProgress| {})
            .await
            .unwrap();
        assert!(session.is_unlocked());
    }
}
