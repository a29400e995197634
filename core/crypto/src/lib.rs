//! Cryptographic primitives for credvault.
//!
//! This module provides:
//! - Key derivation using PBKDF2-HMAC-SHA256
//! - Authenticated encryption of JSON payloads using AES-256-GCM
//! - Secure key handling with automatic zeroization
//! - Random password generation
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//! - Every encryption uses a fresh random 96-bit IV

pub mod kdf;
pub mod aead;
pub mod keys;
pub mod generator;

pub use aead::{decrypt, encrypt, EncryptedBlob, BLOB_VERSION, IV_SIZE, TAG_SIZE};
pub use generator::{
    generate_password, PasswordPolicy, DEFAULT_PASSWORD_LENGTH, MAX_PASSWORD_LENGTH,
};
pub use kdf::{derive_key, KdfAlgorithm, KdfParams, DEFAULT_ITERATIONS, MAX_ITERATIONS};
pub use keys::{Salt, VaultKey, KEY_LENGTH, SALT_LENGTH};
