//! Vault options.

use serde::{Deserialize, Serialize};

use credvault_common::{Error, Result};
use credvault_crypto::{DEFAULT_ITERATIONS, MAX_ITERATIONS};

/// Tunables for a vault session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultOptions {
    /// PBKDF2 iterations for lazily created headers and the default for rekeys.
    pub iterations: u32,
}

impl VaultOptions {
    /// Options with a custom iteration count.
    pub fn with_iterations(iterations: u32) -> Self {
        Self { iterations }
    }

    /// Check the options are usable.
    pub fn validate(&self) -> Result<()> {
        if self.iterations == 0 || self.iterations > MAX_ITERATIONS {
            return Err(Error::InvalidInput(format!(
                "iterations must be within 1..={}",
                MAX_ITERATIONS
            )));
        }
        Ok(())
    }

    /// Serialize options to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize options from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let options: Self =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }
}

impl Default for VaultOptions {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
        }
    }
}
