//! Credential payloads and their normalization rules.
//!
//! A payload is the plaintext behind every stored item. All write paths
//! (create, update, import) pass through [`CredentialPayload::normalized`],
//! so there is exactly one place that decides what a valid entry looks like.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use url::Url;
use zeroize::{Zeroize, ZeroizeOnDrop};

use credvault_common::{FieldErrors, ItemId, Result};

/// Maximum length of `name`, in characters.
pub const MAX_NAME_CHARS: usize = 200;

/// Maximum length of `notes`, in characters.
pub const MAX_NOTES_CHARS: usize = 4000;

/// Plaintext fields of one credential entry.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct CredentialPayload {
    /// Display name; its normalized form is the item id.
    pub name: String,
    /// Account name.
    #[serde(default)]
    pub username: String,
    /// Secret.
    #[serde(default)]
    pub password: String,
    /// Absolute http(s) URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Lower-cased, deduplicated, sorted labels.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Free text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl CredentialPayload {
    /// Create a payload with the required fields.
    pub fn new(
        name: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            username: username.into(),
            password: password.into(),
            url: None,
            tags: Vec::new(),
            notes: None,
        }
    }

    /// Set the URL.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Set the tags.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Set the notes.
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Return the normalized copy of this payload.
    ///
    /// # Postconditions
    /// - `name` is trimmed and non-empty
    /// - `url` is absent or an absolute http(s) URL
    /// - `tags` are lower-cased, deduplicated and sorted
    /// - `notes` is absent or non-empty
    ///
    /// # Errors
    /// - `Error::InvalidPayload` listing every failing field
    pub fn normalized(&self) -> Result<Self> {
        let mut errors = FieldErrors::new();

        let name = self.name.trim().to_string();
        if name.is_empty() {
            errors.push("name", "name is required");
        } else if name.chars().count() > MAX_NAME_CHARS {
            errors.push(
                "name",
                format!("name must be at most {} characters", MAX_NAME_CHARS),
            );
        }

        let url = match self.url.as_deref().map(normalize_url).transpose() {
            Ok(url) => url.flatten(),
            Err(message) => {
                errors.push("url", message);
                None
            }
        };

        let notes = self.notes.as_deref().filter(|n| !n.trim().is_empty());
        if let Some(notes) = notes {
            if notes.chars().count() > MAX_NOTES_CHARS {
                errors.push(
                    "notes",
                    format!("notes must be at most {} characters", MAX_NOTES_CHARS),
                );
            }
        }

        errors.into_result()?;

        Ok(Self {
            name,
            username: self.username.clone(),
            password: self.password.clone(),
            url,
            tags: normalize_tags(&self.tags),
            notes: notes.map(str::to_string),
        })
    }

    /// Canonical item id for this payload.
    pub fn id(&self) -> Result<ItemId> {
        ItemId::new(self.name.trim())
    }
}

impl fmt::Debug for CredentialPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPayload")
            .field("name", &self.name)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("url", &self.url)
            .field("tags", &self.tags)
            .field("notes", &self.notes.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Coerce user input into an absolute URL.
///
/// Empty input means "no URL". Input without a scheme gets `https://`.
fn normalize_url(raw: &str) -> std::result::Result<Option<String>, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };

    let parsed = Url::parse(&candidate).map_err(|e| format!("url is invalid: {}", e))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(format!("url scheme '{}' is not allowed", other)),
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err("url must include a host".to_string());
    }

    Ok(Some(parsed.into()))
}

fn normalize_tags(tags: &[String]) -> Vec<String> {
    tags.iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use credvault_common::Error;
    use proptest::prelude::*;

    fn field_error(result: Result<CredentialPayload>, field: &str) -> String {
        match result {
            Err(Error::InvalidPayload(errors)) => errors
                .get(field)
                .map(str::to_string)
                .unwrap_or_else(|| panic!("no error for {}: {}", field, errors)),
            other => panic!("expected InvalidPayload, got {:?}", other),
        }
    }

    #[test]
    fn test_normalizes_all_fields() {
        let payload = CredentialPayload::new("  github  ", "alice", "p1")
            .with_url("github.com/login")
            .with_tags(["Work", "dev", "work ", ""])
            .with_notes("   ");

        let normalized = payload.normalized().unwrap();

        assert_eq!(normalized.name, "github");
        assert_eq!(normalized.url.as_deref(), Some("https://github.com/login"));
        assert_eq!(normalized.tags, vec!["dev", "work"]);
        assert_eq!(normalized.notes, None);
        assert_eq!(normalized.id().unwrap().as_str(), "github");
    }

    #[test]
    fn test_keeps_explicit_http_scheme() {
        let payload = CredentialPayload::new("router", "admin", "x").with_url("http://192.168.1.1");
        let normalized = payload.normalized().unwrap();
        assert_eq!(normalized.url.as_deref(), Some("http://192.168.1.1/"));
    }

    #[test]
    fn test_empty_url_is_absent() {
        let payload = CredentialPayload::new("mail", "bob", "x").with_url("  ");
        assert_eq!(payload.normalized().unwrap().url, None);
    }

    #[test]
    fn test_empty_name_rejected() {
        let message = field_error(CredentialPayload::new("   ", "a", "b").normalized(), "name");
        assert!(message.contains("required"));
    }

    #[test]
    fn test_long_name_rejected() {
        let name = "n".repeat(MAX_NAME_CHARS + 1);
        field_error(CredentialPayload::new(name, "a", "b").normalized(), "name");

        let ok = "n".repeat(MAX_NAME_CHARS);
        assert!(CredentialPayload::new(ok, "a", "b").normalized().is_ok());
    }

    #[test]
    fn test_long_notes_rejected() {
        let payload =
            CredentialPayload::new("x", "a", "b").with_notes("n".repeat(MAX_NOTES_CHARS + 1));
        field_error(payload.normalized(), "notes");
    }

    #[test]
    fn test_bad_scheme_rejected() {
        let payload = CredentialPayload::new("x", "a", "b").with_url("ftp://files.example.com");
        let message = field_error(payload.normalized(), "url");
        assert!(message.contains("ftp"));
    }

    #[test]
    fn test_reports_every_failing_field() {
        let payload = CredentialPayload::new("", "a", "b")
            .with_url("ftp://x")
            .with_notes("n".repeat(MAX_NOTES_CHARS + 1));

        match payload.normalized() {
            Err(Error::InvalidPayload(errors)) => assert_eq!(errors.iter().count(), 3),
            other => panic!("expected InvalidPayload, got {:?}", other),
        }
    }

    #[test]
    fn test_debug_redacts_secret() {
        let payload = CredentialPayload::new("x", "a", "hunter2");
        assert!(!format!("{:?}", payload).contains("hunter2"));
    }

    #[test]
    fn test_optional_fields_omitted_from_json() {
        let payload = CredentialPayload::new("x", "a", "b");
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("url").is_none());
        assert!(json.get("notes").is_none());
        assert_eq!(json["tags"], serde_json::json!([]));
    }

    proptest! {
        #[test]
        fn prop_tags_sorted_unique_lowercase(tags in proptest::collection::vec("[A-Za-z ]{0,6}", 0..12)) {
            let payload = CredentialPayload::new("x", "a", "b").with_tags(tags);
            let normalized = payload.normalized().unwrap();

            let mut expected = normalized.tags.clone();
            expected.sort();
            expected.dedup();
            prop_assert_eq!(&normalized.tags, &expected);
            for tag in &normalized.tags {
                prop_assert!(!tag.is_empty());
                prop_assert_eq!(tag, &tag.to_lowercase());
                prop_assert_eq!(tag.as_str(), tag.trim());
            }
        }
    }
}
