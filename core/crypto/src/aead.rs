//! Authenticated encryption of JSON payloads using AES-256-GCM.
//!
//! Every payload is serialized to JSON and sealed under a fresh random
//! 96-bit IV with no associated data. The resulting [`EncryptedBlob`] is
//! the only encrypted shape the store ever persists.

use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::keys::VaultKey;
use credvault_common::{Error, Result};

/// Envelope version tag written into every blob.
pub const BLOB_VERSION: u8 = 2;

/// IV size for AES-GCM (12 bytes).
pub const IV_SIZE: usize = 12;

/// Authentication tag size (16 bytes).
pub const TAG_SIZE: usize = 16;

/// Authenticated ciphertext envelope.
///
/// Produced only by [`encrypt`]. Byte fields serialize as JSON number arrays;
/// the legacy field names `v` and `ct` are accepted on input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    #[serde(alias = "v")]
    version: u8,
    iv: Vec<u8>,
    #[serde(alias = "ct")]
    ciphertext: Vec<u8>,
}

impl EncryptedBlob {
    /// Envelope version.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// The 12-byte IV.
    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    /// Ciphertext including the trailing authentication tag.
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// Check version tag and field lengths.
    ///
    /// # Errors
    /// - `Error::Format` when the envelope cannot possibly decrypt
    pub fn validate(&self) -> Result<()> {
        if self.version != BLOB_VERSION {
            return Err(Error::Format(format!(
                "Unsupported envelope version {}",
                self.version
            )));
        }
        if self.iv.len() != IV_SIZE {
            return Err(Error::Format(format!(
                "IV must be {} bytes, got {}",
                IV_SIZE,
                self.iv.len()
            )));
        }
        if self.ciphertext.len() < TAG_SIZE {
            return Err(Error::Format(format!(
                "Ciphertext must be at least {} bytes, got {}",
                TAG_SIZE,
                self.ciphertext.len()
            )));
        }
        Ok(())
    }
}

/// Encrypt a serializable payload.
///
/// # Postconditions
/// - Returns a version 2 blob with a random IV
/// - Two calls on identical input never share an IV
///
/// # Errors
/// - Returns error if the payload cannot be serialized
/// - Returns error if encryption fails
pub fn encrypt<T: Serialize + ?Sized>(key: &VaultKey, payload: &T) -> Result<EncryptedBlob> {
    let plaintext = Zeroizing::new(
        serde_json::to_vec(payload).map_err(|e| Error::Serialization(e.to_string()))?,
    );

    let cipher = Aes256Gcm::new(GenericArray::from_slice(key.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_slice())
        .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;

    Ok(EncryptedBlob {
        version: BLOB_VERSION,
        iv: nonce.to_vec(),
        ciphertext,
    })
}

/// Decrypt a blob and deserialize its payload.
///
/// # Errors
/// - `Error::Format` if the envelope is malformed (checked before decrypting)
/// - `Error::Decryption` if authentication fails (wrong key, tampered data)
/// - `Error::Serialization` if the plaintext is not the expected JSON shape
pub fn decrypt<T: DeserializeOwned>(key: &VaultKey, blob: &EncryptedBlob) -> Result<T> {
    blob.validate()?;

    let cipher = Aes256Gcm::new(GenericArray::from_slice(key.as_bytes()));
    let nonce = GenericArray::from_slice(&blob.iv);

    let plaintext = Zeroizing::new(
        cipher
            .decrypt(nonce, blob.ciphertext.as_slice())
            .map_err(|_| Error::Decryption("authentication tag mismatch".to_string()))?,
    );

    serde_json::from_slice(&plaintext).map_err(|e| Error::Serialization(e.to_string()))
}
