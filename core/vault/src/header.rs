//! Vault header persistence and key verification.
//!
//! The header holds the KDF parameters every key is derived from, plus an
//! optional canary: a marker encrypted under the vault key. Decrypting the
//! canary proves a candidate key is the right one without touching items.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{debug, info};

use credvault_common::{Error, Result};
use credvault_crypto::{decrypt, encrypt, EncryptedBlob, KdfParams, VaultKey};
use credvault_storage::{KvStore, HEADER_KEY};

use crate::config::VaultOptions;

/// Current header format version.
pub const HEADER_VERSION: u8 = 1;

/// Plaintext sealed into the canary.
pub const CANARY_MARKER: &str = "credvault:canary:v1";

/// Persisted vault header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultHeader {
    /// Header format version.
    pub version: u8,
    /// Key derivation parameters.
    pub kdf: KdfParams,
    /// Key-check blob.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canary: Option<EncryptedBlob>,
}

impl VaultHeader {
    /// Create a header with a fresh salt and no canary.
    ///
    /// # Errors
    /// - `Error::Format` if `iterations` is out of range
    pub fn new(iterations: u32) -> Result<Self> {
        Ok(Self {
            version: HEADER_VERSION,
            kdf: KdfParams::generate(iterations)?,
            canary: None,
        })
    }

    /// Check version and KDF parameters.
    pub fn validate(&self) -> Result<()> {
        if self.version != HEADER_VERSION {
            return Err(Error::Format(format!(
                "Unsupported header version {}",
                self.version
            )));
        }
        self.kdf.validate()
    }

    /// Derive the vault key for `passphrase` under this header.
    ///
    /// # Errors
    /// - `Error::InvalidInput` if the passphrase is empty
    /// - `Error::Format` if the header is invalid
    ///
    /// # Security
    /// - The passphrase is never logged
    pub fn derive_key(&self, passphrase: &str) -> Result<VaultKey> {
        self.validate()?;
        self.kdf.derive(passphrase.as_bytes())
    }

    /// Serialize for storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Parse a stored header.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header: Self = serde_json::from_slice(bytes)
            .map_err(|e| Error::Format(format!("Unreadable vault header: {}", e)))?;
        header.validate()?;
        Ok(header)
    }
}

/// Attach a canary to `header` if it has none.
///
/// Returns `Cow::Borrowed` when the header already carries a canary, so the
/// caller only persists when something changed.
///
/// # Preconditions
/// - `key` is the key derived from `header`
pub fn ensure_canary<'a>(header: &'a VaultHeader, key: &VaultKey) -> Result<Cow<'a, VaultHeader>> {
    if header.canary.is_some() {
        return Ok(Cow::Borrowed(header));
    }

    let mut updated = header.clone();
    updated.canary = Some(encrypt(key, CANARY_MARKER)?);
    debug!("Canary attached to header");
    Ok(Cow::Owned(updated))
}

/// Check that `key` is the key of the vault described by `header`.
///
/// Uses the canary when present, otherwise the first stored item. With
/// neither, any key is accepted.
///
/// # Errors
/// - `Error::IncorrectPassphrase` if authentication fails
/// - `Error::Format` if the probed blob is malformed
pub fn verify_key(
    key: &VaultKey,
    header: &VaultHeader,
    first_item: Option<&EncryptedBlob>,
) -> Result<()> {
    let Some(probe) = header.canary.as_ref().or(first_item) else {
        return Ok(());
    };

    match decrypt::<serde_json::Value>(key, probe) {
        Ok(_) => Ok(()),
        Err(Error::Decryption(_)) => Err(Error::IncorrectPassphrase),
        Err(e) => Err(e),
    }
}

/// Reads and writes the header record.
#[derive(Clone)]
pub struct HeaderStore {
    store: Arc<dyn KvStore>,
}

impl HeaderStore {
    /// Create a header store over `store`.
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Read the header if one exists.
    pub async fn load(&self) -> Result<Option<VaultHeader>> {
        self.store
            .get_meta(HEADER_KEY)
            .await?
            .map(|bytes| VaultHeader::from_bytes(&bytes))
            .transpose()
    }

    /// Read the header, creating and persisting one on first use.
    ///
    /// # Postconditions
    /// - A header exists in the store
    /// - A freshly created header has no canary
    pub async fn get_or_create(&self, options: &VaultOptions) -> Result<VaultHeader> {
        if let Some(header) = self.load().await? {
            return Ok(header);
        }

        let header = VaultHeader::new(options.iterations)?;
        self.save(&header).await?;
        info!(
            backend = self.store.name(),
            iterations = header.kdf.iterations,
            "Vault header created"
        );
        Ok(header)
    }

    /// Overwrite the header record.
    pub async fn save(&self, header: &VaultHeader) -> Result<()> {
        self.store.put_meta(HEADER_KEY, header.to_bytes()?).await
    }
}
