//! Common error types for credvault.

use std::fmt;

use thiserror::Error;

/// Top-level error type for credvault operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Canary or first-item verification rejected the candidate key.
    #[error("Incorrect passphrase")]
    IncorrectPassphrase,

    /// Malformed input: bad file, wrong iv/ciphertext length, missing fields.
    #[error("Invalid format: {0}")]
    Format(String),

    /// Authentication tag mismatch.
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// A stored item could not be read back.
    #[error("Item {id} is unreadable: {source}")]
    CorruptItem {
        /// Id of the offending record.
        id: String,
        /// Underlying decryption or format failure.
        #[source]
        source: Box<Error>,
    },

    /// Field-level validation failure on a credential payload.
    #[error("Invalid payload: {0}")]
    InvalidPayload(FieldErrors),

    /// Cryptographic operation failed.
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation not permitted.
    #[error("Not permitted: {0}")]
    NotPermitted(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Conflict detected.
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl Error {
    /// Wrap an error with the id of the item it was raised for.
    pub fn for_item(id: impl Into<String>, source: Error) -> Self {
        Self::CorruptItem {
            id: id.into(),
            source: Box::new(source),
        }
    }

    /// Returns true for a failed authentication tag check.
    pub fn is_decryption(&self) -> bool {
        matches!(self, Self::Decryption(_))
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

/// A single field-level validation message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// Payload field name, e.g. `"name"` or `"url"`.
    pub field: &'static str,
    /// Human readable reason.
    pub message: String,
}

/// All validation failures collected for one payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldErrors(Vec<FieldError>);

impl FieldErrors {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure for `field`.
    pub fn push(&mut self, field: &'static str, message: impl Into<String>) {
        self.0.push(FieldError {
            field,
            message: message.into(),
        });
    }

    /// Check if no failures were recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the recorded failures.
    pub fn iter(&self) -> impl Iterator<Item = &FieldError> {
        self.0.iter()
    }

    /// Message recorded for `field`, if any.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|e| e.field == field)
            .map(|e| e.message.as_str())
    }

    /// Convert into `Err(Error::InvalidPayload)` when non-empty.
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidPayload(self))
        }
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for e in &self.0 {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{}: {}", e.field, e.message)?;
            first = false;
        }
        Ok(())
    }
}
