//! SQLite storage backend
//!
//! Sensitive columns hold base64 of the raw cipher blob
//! (`nonce || ciphertext || tag`). Nothing in this module can decrypt them.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use secretum_core::{RecordId, RecordStore, SecretRecord, SecretType, StoreError};
use secretum_crypto::CipherBlob;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, warn};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS secrets (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL,
        category TEXT NOT NULL DEFAULT 'ELSE',
        account TEXT NOT NULL,
        password TEXT NOT NULL,
        note TEXT,
        created_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_secrets_created ON secrets(created_at DESC);
    CREATE INDEX IF NOT EXISTS idx_secrets_category ON secrets(category);";

const COLUMNS: &str = "id, title, category, account, password, note, created_at";

fn backend(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// SQLite-backed record store
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    /// Open or create the database at `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| backend(format!("Failed to create vault dir: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(|e| backend(format!("Failed to open vault database: {}", e)))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").map_err(backend)?;
        debug!(path = %path.display(), "Opened vault database");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(backend)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| backend(format!("Failed to create secrets table: {}", e)))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

/// A column that fails to decode becomes an empty blob, which the cipher
/// rejects as corrupted when it is opened.
fn blob_column(id: RecordId, column: &str, encoded: &str) -> CipherBlob {
    CipherBlob::from_base64(encoded).unwrap_or_else(|_| {
        warn!(id, column, "Stored blob is not valid base64");
        CipherBlob::from_bytes(Vec::new())
    })
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<SecretRecord> {
    let id: RecordId = row.get(0)?;
    let category: String = row.get(2)?;
    let account: String = row.get(3)?;
    let password: String = row.get(4)?;
    let note: Option<String> = row.get(5)?;
    let created_ms: i64 = row.get(6)?;

    let created_at = DateTime::<Utc>::from_timestamp_millis(created_ms).unwrap_or_else(|| {
        warn!(id, created_ms, "Creation time out of range");
        DateTime::<Utc>::default()
    });

    Ok(SecretRecord {
        id: Some(id),
        title: row.get(1)?,
        category: SecretType::from_tag(&category),
        created_at,
        account: blob_column(id, "account", &account),
        password: blob_column(id, "password", &password),
        note: note.map(|n| blob_column(id, "note", &n)),
    })
}

impl RecordStore for SqliteRecordStore {
    fn put(&self, record: &SecretRecord) -> Result<RecordId, StoreError> {
        let conn = self.conn.lock().map_err(backend)?;
        let note = record.note.as_ref().map(|n| n.to_base64());

        match record.id {
            None => {
                conn.execute(
                    "INSERT INTO secrets (title, category, account, password, note, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        record.title,
                        record.category.tag(),
                        record.account.to_base64(),
                        record.password.to_base64(),
                        note,
                        record.created_at.timestamp_millis(),
                    ],
                )
                .map_err(|e| backend(format!("Failed to store secret: {}", e)))?;
                Ok(conn.last_insert_rowid())
            }
            Some(id) => {
                conn.execute(
                    "INSERT INTO secrets (id, title, category, account, password, note, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(id) DO UPDATE SET
                        title = excluded.title,
                        category = excluded.category,
                        account = excluded.account,
                        password = excluded.password,
                        note = excluded.note,
                        created_at = excluded.created_at",
                    params![
                        id,
                        record.title,
                        record.category.tag(),
                        record.account.to_base64(),
                        record.password.to_base64(),
                        note,
                        record.created_at.timestamp_millis(),
                    ],
                )
                .map_err(|e| backend(format!("Failed to store secret: {}", e)))?;
                Ok(id)
            }
        }
    }

    fn get(&self, id: RecordId) -> Result<Option<SecretRecord>, StoreError> {
        let conn = self.conn.lock().map_err(backend)?;
        conn.query_row(
            &format!("SELECT {} FROM secrets WHERE id = ?1", COLUMNS),
            params![id],
            record_from_row,
        )
        .optional()
        .map_err(backend)
    }

    fn delete(&self, id: RecordId) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(backend)?;
        let deleted = conn
            .execute("DELETE FROM secrets WHERE id = ?1", params![id])
            .map_err(|e| backend(format!("Failed to delete secret: {}", e)))?;

        if deleted == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    fn list_all(&self) -> Result<Vec<SecretRecord>, StoreError> {
        let conn = self.conn.lock().map_err(backend)?;
        let mut stmt = conn
            .prepare(&format!("SELECT {} FROM secrets ORDER BY created_at DESC, id DESC", COLUMNS))
            .map_err(backend)?;

        let rows = stmt.query_map([], record_from_row).map_err(backend)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(backend)
    }
}
