//! Passphrase rotation.
//!
//! A rekey re-encrypts every item under a key derived from a new passphrase
//! and a fresh salt. All items and the new header are written in a single
//! store commit: readers observe either the old vault or the new one, never
//! a mixture.

use std::sync::Arc;
use tracing::{info, warn};

use credvault_common::{Error, Result};
use credvault_crypto::VaultKey;
use credvault_storage::{KvStore, WriteBatch, HEADER_KEY};

use crate::config::VaultOptions;
use crate::header::{ensure_canary, verify_key, HeaderStore, VaultHeader};
use crate::items::{now, ItemStore, VaultItem};

/// Stage of a rekey.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RekeyPhase {
    /// No rekey running.
    #[default]
    Idle,
    /// Decrypting the item snapshot under the old key.
    Decrypt,
    /// Re-encrypting under the new key.
    Reencrypt,
    /// Committing items and header.
    Writing,
    /// Commit done, swapping the session key.
    Finalize,
    /// Finished successfully.
    Done,
    /// Aborted; nothing was written.
    Failed,
}

impl RekeyPhase {
    fn label(self) -> &'static str {
        match self {
            RekeyPhase::Idle => "Idle",
            RekeyPhase::Decrypt => "Decrypting items",
            RekeyPhase::Reencrypt => "Re-encrypting items",
            RekeyPhase::Writing => "Writing vault",
            RekeyPhase::Finalize => "Finalizing",
            RekeyPhase::Done => "Passphrase changed",
            RekeyPhase::Failed => "Passphrase change failed",
        }
    }
}

/// One progress event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RekeyProgress {
    /// Current phase.
    pub phase: RekeyPhase,
    /// Steps completed in this phase.
    pub done: usize,
    /// Steps in this phase.
    pub total: usize,
    /// Human-readable status.
    pub message: String,
}

impl RekeyProgress {
    fn new(phase: RekeyPhase, done: usize, total: usize) -> Self {
        Self {
            phase,
            done,
            total,
            message: phase.label().to_string(),
        }
    }

    fn failed(error: &Error) -> Self {
        Self {
            phase: RekeyPhase::Failed,
            done: 0,
            total: 0,
            message: format!("{}: {}", RekeyPhase::Failed.label(), error),
        }
    }
}

/// Aggregated view of a progress stream, for status displays.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RekeyMonitor {
    active: bool,
    phase: RekeyPhase,
    done: usize,
    total: usize,
    percent: u8,
    message: Option<String>,
}

impl RekeyMonitor {
    /// Idle monitor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event into the state.
    pub fn observe(&mut self, event: &RekeyProgress) {
        self.phase = event.phase;
        self.message = Some(event.message.clone());

        match event.phase {
            RekeyPhase::Done => {
                self.active = false;
                self.done = self.total;
                self.percent = 100;
            }
            RekeyPhase::Failed | RekeyPhase::Idle => {
                self.active = false;
                self.done = 0;
                self.total = 0;
                self.percent = 0;
            }
            _ => {
                let denom = event.total.max(1);
                let done = event.done.min(denom);
                self.active = true;
                self.done = event.done;
                self.total = event.total;
                self.percent = ((done * 100 + denom / 2) / denom) as u8;
            }
        }
    }

    /// Whether a rekey is running.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Last reported phase.
    pub fn phase(&self) -> RekeyPhase {
        self.phase
    }

    /// Progress within the current phase, 0..=100.
    pub fn percent(&self) -> u8 {
        self.percent
    }

    /// Steps finished in the current phase.
    pub fn done(&self) -> usize {
        self.done
    }

    /// Steps in the current phase.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Last status message.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

/// Where the old key comes from.
pub enum OldKey<'a> {
    /// The key held by an unlocked session.
    Session(&'a VaultKey),
    /// The current passphrase; verified before anything is decrypted.
    Passphrase(&'a str),
}

/// Parameters of one rekey.
pub struct RekeyRequest<'a> {
    /// Key currently protecting the vault.
    pub old_key: OldKey<'a>,
    /// Passphrase to rotate to.
    pub new_passphrase: &'a str,
    /// Iteration count for the new header; defaults to the current one.
    pub iterations: Option<u32>,
}

/// Result of a committed rekey.
pub struct RekeyOutcome {
    /// Header now in the store.
    pub header: VaultHeader,
    /// Key derived from the new passphrase.
    pub key: VaultKey,
    /// Number of items re-encrypted.
    pub count: usize,
}

/// Runs rekeys against one store.
pub struct RekeyEngine {
    store: Arc<dyn KvStore>,
    headers: HeaderStore,
    items: ItemStore,
    options: VaultOptions,
}

impl RekeyEngine {
    /// Create an engine over `store`.
    pub fn new(store: Arc<dyn KvStore>, options: VaultOptions) -> Self {
        Self {
            headers: HeaderStore::new(store.clone()),
            items: ItemStore::new(store.clone()),
            store,
            options,
        }
    }

    /// Rotate the vault to a new passphrase.
    ///
    /// `progress` receives every phase transition. On failure it receives a
    /// final [`RekeyPhase::Failed`] event.
    ///
    /// # Postconditions
    /// - On `Ok`, every item and the header are under the new key
    /// - On `Err`, the store is byte-for-byte unchanged
    ///
    /// # Errors
    /// - `Error::InvalidInput` if the new passphrase is empty or `iterations`
    ///   is out of range
    /// - `Error::Conflict` if another rekey on this store is running
    /// - `Error::IncorrectPassphrase` if the old passphrase is wrong
    /// - `Error::CorruptItem` if any item fails to decrypt under the old key
    /// - `Error::Storage` if the commit fails
    pub async fn rekey(
        &self,
        request: RekeyRequest<'_>,
        progress: &mut (dyn FnMut(&RekeyProgress) + Send),
    ) -> Result<RekeyOutcome> {
        match self.run(request, progress).await {
            Ok(outcome) => {
                progress(&RekeyProgress::new(
                    RekeyPhase::Done,
                    outcome.count,
                    outcome.count,
                ));
                info!(count = outcome.count, "Rekey complete");
                Ok(outcome)
            }
            Err(e) => {
                warn!(error = %e, "Rekey aborted");
                progress(&RekeyProgress::failed(&e));
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        request: RekeyRequest<'_>,
        progress: &mut (dyn FnMut(&RekeyProgress) + Send),
    ) -> Result<RekeyOutcome> {
        if request.new_passphrase.trim().is_empty() {
            return Err(Error::InvalidInput(
                "New passphrase cannot be empty".to_string(),
            ));
        }

        if let Some(iterations) = request.iterations {
            VaultOptions::with_iterations(iterations).validate()?;
        }

        let _guard = self.store.try_lock_exclusive()?;

        // A store without a header gets one only through the final commit.
        let header = match self.headers.load().await? {
            Some(header) => header,
            None => VaultHeader::new(self.options.iterations)?,
        };
        let snapshot = self.items.records().await?;
        let total = snapshot.len();

        let derived;
        let old_key = match request.old_key {
            OldKey::Session(key) => key,
            OldKey::Passphrase(passphrase) => {
                let key = header.derive_key(passphrase)?;
                verify_key(&key, &header, snapshot.first().map(|i| &i.enc))?;
                derived = key;
                &derived
            }
        };

        progress(&RekeyProgress::new(RekeyPhase::Decrypt, 0, total));
        let mut decrypted = Vec::with_capacity(total);
        for (index, item) in snapshot.into_iter().enumerate() {
            let payload = item.open(old_key)?;
            decrypted.push((item, payload));
            progress(&RekeyProgress::new(RekeyPhase::Decrypt, index + 1, total));
        }

        let iterations = request.iterations.unwrap_or(header.kdf.iterations);
        let fresh = VaultHeader::new(iterations)?;
        let new_key = fresh.derive_key(request.new_passphrase)?;
        let fresh = ensure_canary(&fresh, &new_key)?.into_owned();

        progress(&RekeyProgress::new(RekeyPhase::Reencrypt, 0, total));
        let updated_at = now();
        let mut batch = WriteBatch::new();
        for (index, (item, payload)) in decrypted.iter().enumerate() {
            let resealed = VaultItem::seal(&new_key, payload, item.created_at, updated_at)?;
            batch.put_item(item.id.as_str(), resealed.to_bytes()?);
            progress(&RekeyProgress::new(RekeyPhase::Reencrypt, index + 1, total));
        }
        batch.put_meta(HEADER_KEY, fresh.to_bytes()?);

        progress(&RekeyProgress::new(RekeyPhase::Writing, 0, total + 1));
        self.store.commit(batch).await?;
        progress(&RekeyProgress::new(RekeyPhase::Writing, total + 1, total + 1));

        progress(&RekeyProgress::new(RekeyPhase::Finalize, 1, 1));
        Ok(RekeyOutcome {
            header: fresh,
            key: new_key,
            count: total,
        })
    }
}
