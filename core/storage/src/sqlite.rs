//! SQLite-backed durable store.
//!
//! Both collections live in one database file so that a commit spanning
//! the header and the items is a single SQLite transaction.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::store::{ExclusiveGuard, ExclusiveLock, KvStore, StoredRecord, WriteBatch, WriteOp};
use credvault_common::{Error, Result};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value BLOB NOT NULL
    );

    CREATE TABLE IF NOT EXISTS items (
        id TEXT PRIMARY KEY,
        value BLOB NOT NULL
    );
"#;

fn storage_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

/// Store backed by a SQLite database.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    exclusive: ExclusiveLock,
}

impl SqliteStore {
    /// Create or open a store database.
    ///
    /// # Errors
    /// - Database creation or schema setup failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path).map_err(storage_err)?;
        let store = Self::with_connection(conn)?;
        info!(path = %db_path.display(), "SQLite store opened");
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(storage_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
            exclusive: ExclusiveLock::default(),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("SQLite connection lock poisoned".to_string()))
    }

    fn apply(tx: &Transaction<'_>, op: WriteOp) -> rusqlite::Result<()> {
        match op {
            WriteOp::PutMeta { key, value } => {
                tx.execute(
                    "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
                    params![key, value],
                )?;
            }
            WriteOp::PutItem { id, value } => {
                tx.execute(
                    "INSERT OR REPLACE INTO items (id, value) VALUES (?1, ?2)",
                    params![id, value],
                )?;
            }
            WriteOp::DeleteItem { id } => {
                tx.execute("DELETE FROM items WHERE id = ?1", params![id])?;
            }
            WriteOp::ClearItems => {
                tx.execute("DELETE FROM items", [])?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.conn()?
            .query_row("SELECT value FROM meta WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(storage_err)
    }

    async fn put_meta(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    async fn get_item(&self, id: &str) -> Result<Option<Vec<u8>>> {
        self.conn()?
            .query_row("SELECT value FROM items WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()
            .map_err(storage_err)
    }

    async fn get_all_items(&self) -> Result<Vec<StoredRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, value FROM items ORDER BY id")
            .map_err(storage_err)?;

        let rows = stmt
            .query_map([], |row| {
                Ok(StoredRecord {
                    id: row.get(0)?,
                    value: row.get(1)?,
                })
            })
            .map_err(storage_err)?;

        let records = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_err)?;
        Ok(records)
    }

    async fn put_item(&self, id: &str, value: Vec<u8>) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO items (id, value) VALUES (?1, ?2)",
                params![id, value],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    async fn delete_item(&self, id: &str) -> Result<()> {
        debug!(id, "Deleting item record");
        self.conn()?
            .execute("DELETE FROM items WHERE id = ?1", params![id])
            .map_err(storage_err)?;
        Ok(())
    }

    async fn clear_items(&self) -> Result<()> {
        info!("Clearing item records");
        self.conn()?
            .execute("DELETE FROM items", [])
            .map_err(storage_err)?;
        Ok(())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        let writes = batch.len();
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(storage_err)?;

        for op in batch {
            // Dropping `tx` on error rolls the whole batch back.
            Self::apply(&tx, op).map_err(storage_err)?;
        }

        tx.commit().map_err(storage_err)?;
        debug!(writes, "Batch committed");
        Ok(())
    }

    fn try_lock_exclusive(&self) -> Result<ExclusiveGuard> {
        self.exclusive.try_acquire()
    }
}
