//! Vault file import and export.
//!
//! A vault file is a JSON document `{ header, items }`. Exports write items
//! as plaintext payloads next to a header whose canary lets an importer
//! check the passphrase. Older files carry encrypted item records instead;
//! both shapes are accepted on import.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use chrono::{DateTime, Utc};
use credvault_common::{Error, ItemId, Result};
use credvault_crypto::VaultKey;
use credvault_storage::{WriteBatch, HEADER_KEY};

use crate::header::{ensure_canary, verify_key, VaultHeader};
use crate::items::{now, VaultItem};
use crate::payload::CredentialPayload;
use crate::session::VaultSession;

/// One entry of a vault file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileEntry {
    /// Encrypted record under the file's key.
    Sealed(VaultItem),
    /// Plaintext payload.
    Plain(CredentialPayload),
}

/// Portable vault document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultFile {
    /// Header the file's key is derived from.
    pub header: VaultHeader,
    /// Entries in file order.
    pub items: Vec<FileEntry>,
}

impl VaultFile {
    /// Parse a vault file.
    ///
    /// # Errors
    /// - `Error::Format` if the document is not a vault file
    pub fn parse(text: &str) -> Result<Self> {
        let file: Self = serde_json::from_str(text)
            .map_err(|e| Error::Format(format!("Not a vault file: {}", e)))?;
        file.header.validate()?;
        Ok(file)
    }

    /// Render as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// How an import treats items already in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImportMode {
    /// Upsert by id; other items are kept.
    #[default]
    Merge,
    /// Remove every item first.
    Replace,
}

/// What an import did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSummary {
    /// Entries written.
    pub imported: usize,
    /// Mode used.
    pub mode: ImportMode,
    /// The file's header became the store header (locked import).
    pub restored: bool,
}

/// Derive the file key and check it against the file.
///
/// The canary is checked when present, otherwise the first entry if it is
/// encrypted. A file with neither is accepted.
///
/// # Errors
/// - `Error::InvalidInput` if the passphrase is empty
/// - `Error::IncorrectPassphrase` if the check fails
/// - `Error::Format` if the header or probed blob is malformed
pub fn validate_file_passphrase(
    header: &VaultHeader,
    items: &[FileEntry],
    passphrase: &str,
) -> Result<VaultKey> {
    let key = header.derive_key(passphrase)?;
    let first = items.first().and_then(|entry| match entry {
        FileEntry::Sealed(item) => Some(&item.enc),
        FileEntry::Plain(_) => None,
    });
    verify_key(&key, header, first)?;
    Ok(key)
}

struct Incoming {
    payload: CredentialPayload,
    created_at: Option<DateTime<Utc>>,
    source: String,
}

/// Normalize every entry before anything is written. Later entries with the
/// same id win.
fn prepare(entries: &[FileEntry], file_key: &VaultKey) -> Result<BTreeMap<ItemId, Incoming>> {
    let mut incoming: BTreeMap<ItemId, Incoming> = BTreeMap::new();
    for (index, entry) in entries.iter().enumerate() {
        let (payload, created_at, source) = match entry {
            FileEntry::Sealed(item) => (
                item.open(file_key)?,
                Some(item.created_at),
                item.id.to_string(),
            ),
            FileEntry::Plain(payload) => (payload.clone(), None, format!("entry #{}", index)),
        };
        let payload = payload.normalized()?;
        let id = payload.id()?;
        let next = Incoming {
            payload,
            created_at,
            source,
        };
        if let Some(previous) = incoming.insert(id.clone(), next) {
            warn!(
                id = %id,
                dropped = %previous.source,
                kept = %incoming[&id].source,
                "Duplicate entry in vault file; keeping the later one"
            );
        }
    }
    Ok(incoming)
}

/// Import a vault file.
///
/// While unlocked, entries are re-encrypted under the session key. While
/// locked, the import restores the file as the whole vault: this is allowed
/// for an empty store or in [`ImportMode::Replace`], and leaves the session
/// unlocked with the file's key.
///
/// # Postconditions
/// - All writes land in one commit, or none do
/// - Merge keeps `created_at` of existing items
///
/// # Errors
/// - `Error::Format` if the file is malformed
/// - `Error::IncorrectPassphrase` if the file passphrase is wrong
/// - `Error::InvalidPayload` if any entry fails normalization
/// - `Error::NotPermitted` for a locked merge into a non-empty store
pub async fn import(
    session: &mut VaultSession,
    text: &str,
    passphrase: &str,
    mode: ImportMode,
) -> Result<ImportSummary> {
    let file = VaultFile::parse(text)?;
    let file_key = validate_file_passphrase(&file.header, &file.items, passphrase)?;
    let incoming = prepare(&file.items, &file_key)?;
    let imported = incoming.len();

    let restored = if session.is_unlocked() {
        import_unlocked(session, incoming, mode).await?;
        false
    } else {
        restore(session, file.header, file_key, incoming, mode).await?;
        true
    };

    info!(imported, ?mode, restored, "Vault file imported");
    Ok(ImportSummary {
        imported,
        mode,
        restored,
    })
}

async fn import_unlocked(
    session: &mut VaultSession,
    incoming: BTreeMap<ItemId, Incoming>,
    mode: ImportMode,
) -> Result<()> {
    let new_header = {
        let key = session.key()?;
        let header = session
            .header()
            .ok_or_else(|| Error::NotPermitted("Vault is locked".to_string()))?;

        let mut batch = WriteBatch::new();
        let new_header = match ensure_canary(header, key)? {
            Cow::Owned(updated) => {
                batch.put_meta(HEADER_KEY, updated.to_bytes()?);
                Some(updated)
            }
            Cow::Borrowed(_) => None,
        };

        let existing: HashMap<ItemId, DateTime<Utc>> = match mode {
            ImportMode::Merge => session
                .item_store()
                .records()
                .await?
                .into_iter()
                .map(|item| (item.id, item.created_at))
                .collect(),
            ImportMode::Replace => {
                batch.clear_items();
                HashMap::new()
            }
        };

        let updated_at = now();
        for (id, entry) in &incoming {
            let created_at = existing
                .get(id)
                .copied()
                .or(entry.created_at)
                .unwrap_or(updated_at);
            let item = VaultItem::seal(key, &entry.payload, created_at, updated_at)?;
            batch.put_item(id.as_str(), item.to_bytes()?);
        }

        session.store().commit(batch).await?;
        new_header
    };

    if let Some(header) = new_header {
        session.replace_header(header);
    }
    session.refresh_tag_index().await
}

async fn restore(
    session: &mut VaultSession,
    header: VaultHeader,
    file_key: VaultKey,
    incoming: BTreeMap<ItemId, Incoming>,
    mode: ImportMode,
) -> Result<()> {
    if mode == ImportMode::Merge && session.item_store().first().await?.is_some() {
        return Err(Error::NotPermitted(
            "Unlock the vault to merge into existing items".to_string(),
        ));
    }

    let header = ensure_canary(&header, &file_key)?.into_owned();

    let mut batch = WriteBatch::new();
    batch.clear_items();
    let updated_at = now();
    for (id, entry) in &incoming {
        let created_at = entry.created_at.unwrap_or(updated_at);
        let item = VaultItem::seal(&file_key, &entry.payload, created_at, updated_at)?;
        batch.put_item(id.as_str(), item.to_bytes()?);
    }
    batch.put_meta(HEADER_KEY, header.to_bytes()?);
    session.store().commit(batch).await?;

    session.install(header, file_key).await
}

/// Export every item as a vault file.
///
/// Uses the session key when `passphrase` is `None`. With a passphrase, the
/// key is derived from the stored header and verified first, so a locked
/// vault can be exported too. The store is not modified.
///
/// # Errors
/// - `Error::NotPermitted` if locked and no passphrase is given
/// - `Error::IncorrectPassphrase` if the passphrase is wrong
/// - `Error::CorruptItem` if any item fails to decrypt
pub async fn export(session: &VaultSession, passphrase: Option<&str>) -> Result<VaultFile> {
    let file = match passphrase {
        Some(passphrase) => {
            let header = session
                .header_store()
                .load()
                .await?
                .ok_or_else(|| Error::NotFound("Vault has no header".to_string()))?;
            let key = header.derive_key(passphrase)?;
            let first = session.item_store().first().await?;
            verify_key(&key, &header, first.as_ref().map(|i| &i.enc))?;
            assemble(session, &header, &key).await?
        }
        None => {
            let key = session.key()?;
            let header = session
                .header()
                .ok_or_else(|| Error::NotPermitted("Vault is locked".to_string()))?;
            assemble(session, header, key).await?
        }
    };

    info!(items = file.items.len(), "Vault exported");
    Ok(file)
}

async fn assemble(
    session: &VaultSession,
    header: &VaultHeader,
    key: &VaultKey,
) -> Result<VaultFile> {
    let header = ensure_canary(header, key)?.into_owned();
    let items = session
        .item_store()
        .list(key)
        .await?
        .into_iter()
        .map(|d| FileEntry::Plain(d.payload))
        .collect();
    Ok(VaultFile { header, items })
}

/// Read and import a vault file from disk.
pub async fn import_file(
    session: &mut VaultSession,
    path: impl AsRef<Path>,
    passphrase: &str,
    mode: ImportMode,
) -> Result<ImportSummary> {
    let text = tokio::fs::read_to_string(path.as_ref()).await?;
    import(session, &text, passphrase, mode).await
}

/// Export to a file on disk, readable only by the owner where supported.
pub async fn export_file(
    session: &VaultSession,
    path: impl AsRef<Path>,
    passphrase: Option<&str>,
) -> Result<usize> {
    let path = path.as_ref();
    let file = export(session, passphrase).await?;
    let json = file.to_json()?;

    let mut open = tokio::fs::OpenOptions::new();
    open.write(true).create(true).truncate(true);
    #[cfg(unix)]
    open.mode(0o600);
    let mut handle = open.open(path).await?;

    // `mode` only applies to newly created files; tighten an existing one
    // before any plaintext lands in it.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        handle
            .set_permissions(std::fs::Permissions::from_mode(0o600))
            .await?;
    }

    handle.write_all(json.as_bytes()).await?;
    handle.flush().await?;
    handle.sync_all().await?;

    Ok(file.items.len())
}
