//! Credential vault engine for credvault.
//!
//! This module provides:
//! - Header management with lazy creation and a key-check canary
//! - Encrypted item CRUD with payload normalization
//! - Locked/unlocked session handling with a single resident key
//! - Atomic passphrase rotation (rekey) with progress reporting
//! - Vault file import and export
//!
//! # Architecture
//! The vault sits between the user interface and a [`KvStore`] backend.
//! Every persisted secret is an AES-GCM blob; plaintext only exists inside
//! an unlocked session or in an explicit export.
//!
//! [`KvStore`]: credvault_storage::KvStore

pub mod bridge;
pub mod config;
pub mod header;
pub mod items;
pub mod payload;
pub mod rekey;
pub mod session;

pub use bridge::{
    export, export_file, import, import_file, validate_file_passphrase, FileEntry, ImportMode,
    ImportSummary, VaultFile,
};
pub use config::VaultOptions;
pub use header::{ensure_canary, verify_key, HeaderStore, VaultHeader, CANARY_MARKER, HEADER_VERSION};
pub use items::{DecryptedItem, ItemStore, VaultItem};
pub use payload::{CredentialPayload, MAX_NAME_CHARS, MAX_NOTES_CHARS};
pub use rekey::{
    OldKey, RekeyEngine, RekeyMonitor, RekeyOutcome, RekeyPhase, RekeyProgress, RekeyRequest,
};
pub use session::{LockListener, SessionState, VaultSession};
