//! Key derivation using PBKDF2-HMAC-SHA256.
//!
//! The iteration count makes every passphrase guess expensive; the salt is
//! regenerated whenever a new header is created.

use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::keys::{Salt, VaultKey, KEY_LENGTH};
use credvault_common::{Error, Result};

/// Default PBKDF2 iteration count.
pub const DEFAULT_ITERATIONS: u32 = 250_000;

/// Upper bound accepted from headers, including headers read from files.
pub const MAX_ITERATIONS: u32 = 10_000_000;

/// Supported key-derivation algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KdfAlgorithm {
    /// PBKDF2 with HMAC-SHA256. `"PBKDF2"` is the legacy spelling.
    #[serde(rename = "PBKDF2-HMAC-SHA256", alias = "PBKDF2")]
    Pbkdf2HmacSha256,
}

/// Parameters for key derivation, as persisted in a vault header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Derivation algorithm.
    #[serde(alias = "type")]
    pub algorithm: KdfAlgorithm,
    /// Number of PBKDF2 iterations.
    pub iterations: u32,
    /// Random per-header salt.
    pub salt: Salt,
}

impl KdfParams {
    /// Create parameters with a fresh random salt.
    ///
    /// # Errors
    /// - Returns error if `iterations` is out of range
    pub fn generate(iterations: u32) -> Result<Self> {
        let params = Self {
            algorithm: KdfAlgorithm::Pbkdf2HmacSha256,
            iterations,
            salt: Salt::generate(),
        };
        params.validate()?;
        Ok(params)
    }

    /// Check that the iteration count is usable.
    pub fn validate(&self) -> Result<()> {
        if self.iterations == 0 || self.iterations > MAX_ITERATIONS {
            return Err(Error::Format(format!(
                "KDF iteration count {} outside 1..={}",
                self.iterations, MAX_ITERATIONS
            )));
        }
        Ok(())
    }

    /// Derive the vault key for `passphrase` under these parameters.
    pub fn derive(&self, passphrase: &[u8]) -> Result<VaultKey> {
        self.validate()?;
        match self.algorithm {
            KdfAlgorithm::Pbkdf2HmacSha256 => derive_key(passphrase, &self.salt, self.iterations),
        }
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            algorithm: KdfAlgorithm::Pbkdf2HmacSha256,
            iterations: DEFAULT_ITERATIONS,
            salt: Salt::generate(),
        }
    }
}

/// Derive a 256-bit vault key from a passphrase and salt.
///
/// # Preconditions
/// - `passphrase` must not be empty
/// - `iterations` must be at least 1
///
/// # Postconditions
/// - The derived key is deterministic given the same inputs
///
/// # Errors
/// - Returns error if passphrase is empty or iterations is zero
///
/// # Security
/// - Passphrase is not stored or logged
/// - The intermediate buffer is zeroized after derivation
pub fn derive_key(passphrase: &[u8], salt: &Salt, iterations: u32) -> Result<VaultKey> {
    if passphrase.is_empty() {
        return Err(Error::InvalidInput("Passphrase cannot be empty".to_string()));
    }
    if iterations == 0 {
        return Err(Error::InvalidInput(
            "Iteration count must be positive".to_string(),
        ));
    }

    let mut key_bytes = [0u8; KEY_LENGTH];
    pbkdf2_hmac::<Sha256>(passphrase, salt.as_bytes(), iterations, &mut key_bytes);

    let key = VaultKey::from_bytes(key_bytes);
    key_bytes.zeroize();
    Ok(key)
}
