//! Common utilities and types shared across credvault crates.
//!
//! This module provides the error taxonomy used by every layer of the store
//! and the small identifier types that cross crate boundaries.

pub mod error;
pub mod types;

pub use error::{Error, FieldError, FieldErrors, Result};
pub use types::ItemId;
