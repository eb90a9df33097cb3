//! Storage layer for lifeline.
//!
//! This module provides `SQLite`-based local persistence: a key/value table
//! of JSON documents (contact cache, outbox, flags, last location) and an
//! append-only per-recipient delivery log.

pub mod migrations;
pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Keys of the documents kept in the state table.
pub mod keys {
    /// Cached contact set (`CachedContactSet`).
    pub const CONTACT_CACHE: &str = "contact_cache";
    /// Outbox contents (`Vec<QueuedAlert>`).
    pub const QUEUED_ALERTS: &str = "queued_alerts";
    /// Completion time of the last replay.
    pub const LAST_SYNC_AT: &str = "last_sync_at";
    /// Explicit offline-mode flag.
    pub const OFFLINE_MODE: &str = "offline_mode";
    /// Active tracking session descriptor.
    pub const TRACKING_SESSION: &str = "tracking_session";
    /// Most recent position fix.
    pub const LAST_KNOWN_LOCATION: &str = "last_known_location";
}

/// Suffix under which an unreadable document is set aside.
const QUARANTINE_SUFFIX: &str = ".corrupt";

/// One row of the delivery log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryLogEntry {
    /// Row id (assigned by storage).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// Alert (or location share) this attempt belonged to.
    pub alert_id: String,
    /// Recipient contact id.
    pub contact_id: String,
    /// SMS accepted by the gateway.
    pub sms_ok: bool,
    /// Email accepted by the gateway.
    pub email_ok: bool,
    /// Gateway error text, if the call itself failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the attempt finished.
    pub recorded_at: DateTime<Utc>,
}

impl DeliveryLogEntry {
    /// Whether the recipient was reached on any channel.
    #[must_use]
    pub fn reached(&self) -> bool {
        self.sms_ok || self.email_ok
    }
}

/// Local state store.
///
/// The connection sits behind a mutex so the store can be shared across
/// tasks; every method holds the lock only for its own statements.
#[derive(Debug)]
pub struct Storage {
    /// Path to the database file.
    path: PathBuf,
    /// Database connection.
    conn: Mutex<Connection>,
}

impl Storage {
    /// Open or create a storage database at the given path.
    ///
    /// Creates the parent directories and database file if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or schema initialization fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        debug!("Opening database at {}", path.display());
        let mut conn = Connection::open(&path).map_err(|source| Error::DatabaseOpen {
            path: path.clone(),
            source,
        })?;

        // WAL keeps readers (CLI) from blocking the running process
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        migrations::initialize_schema(&mut conn)?;

        info!("Database opened successfully at {}", path.display());
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory storage instance for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
            path: PathBuf::from(":memory:"),
            source,
        })?;

        migrations::initialize_schema(&mut conn)?;

        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn: Mutex::new(conn),
        })
    }

    /// Get the path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panic elsewhere cannot leave the connection half-written
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read the raw JSON text stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn get_raw(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .lock()
            .query_row("SELECT value FROM kv_state WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    /// Read and decode the document stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the stored document does not decode as
    /// `T`, or an error if the database operation fails.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_raw(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Store `value` under `key`, replacing any previous document.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the database operation fails.
    pub fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        Self::write_raw(&self.lock(), key, &raw)?;
        debug!(key, bytes = raw.len(), "Stored state document");
        Ok(())
    }

    /// Delete the document under `key`.
    ///
    /// Returns `true` if a document was deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn remove(&self, key: &str) -> Result<bool> {
        let affected = self
            .lock()
            .execute("DELETE FROM kv_state WHERE key = ?1", [key])?;
        Ok(affected > 0)
    }

    /// Atomically read, modify and write the document under `key`.
    ///
    /// A missing document starts as `T::default()`. A document that no
    /// longer decodes is moved to `<key>.corrupt` and replaced by the
    /// default, so the bad bytes survive for inspection.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or a database operation fails.
    pub fn update_json<T, R>(&self, key: &str, f: impl FnOnce(&mut T) -> R) -> Result<R>
    where
        T: Default + Serialize + DeserializeOwned,
    {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let raw: Option<String> = tx
            .query_row("SELECT value FROM kv_state WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;

        let mut value = match raw {
            None => T::default(),
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(value) => value,
                Err(e) => {
                    let quarantine_key = format!("{key}{QUARANTINE_SUFFIX}");
                    warn!(key, quarantine_key, error = %e, "Quarantining unreadable state document");
                    Self::write_raw(&tx, &quarantine_key, &raw)?;
                    T::default()
                }
            },
        };

        let result = f(&mut value);
        Self::write_raw(&tx, key, &serde_json::to_string(&value)?)?;
        tx.commit()?;
        Ok(result)
    }

    fn write_raw(conn: &Connection, key: &str, raw: &str) -> Result<()> {
        conn.execute(
            r"
            INSERT INTO kv_state (key, value, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            ",
            params![key, raw, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Append a row to the delivery log.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn record_delivery(&self, entry: &DeliveryLogEntry) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            r"
            INSERT INTO delivery_log (alert_id, contact_id, sms_ok, email_ok, error, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            params![
                entry.alert_id,
                entry.contact_id,
                entry.sms_ok,
                entry.email_ok,
                entry.error,
                entry.recorded_at.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent delivery log rows, optionally for one alert.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn deliveries(&self, alert_id: Option<&str>, limit: usize) -> Result<Vec<DeliveryLogEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            r"
            SELECT id, alert_id, contact_id, sms_ok, email_ok, error, recorded_at
            FROM delivery_log
            WHERE ?1 IS NULL OR alert_id = ?1
            ORDER BY id DESC LIMIT ?2
            ",
        )?;

        let limit_i64 = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![alert_id, limit_i64], Self::row_to_delivery)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Get database statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn stats(&self) -> Result<StorageStats> {
        let (state_documents, delivery_rows) = {
            let conn = self.lock();
            let docs: i64 = conn.query_row("SELECT COUNT(*) FROM kv_state", [], |row| row.get(0))?;
            let rows: i64 =
                conn.query_row("SELECT COUNT(*) FROM delivery_log", [], |row| row.get(0))?;
            (docs, rows)
        };

        let db_size_bytes = if self.path.to_string_lossy() == ":memory:" {
            0
        } else {
            std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
        };

        Ok(StorageStats {
            state_documents,
            delivery_rows,
            db_size_bytes,
        })
    }

    fn row_to_delivery(row: &rusqlite::Row) -> rusqlite::Result<DeliveryLogEntry> {
        let recorded_at: String = row.get(6)?;
        let recorded_at = DateTime::parse_from_rfc3339(&recorded_at)
            .map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc));

        Ok(DeliveryLogEntry {
            id: Some(row.get(0)?),
            alert_id: row.get(1)?,
            contact_id: row.get(2)?,
            sms_ok: row.get(3)?,
            email_ok: row.get(4)?,
            error: row.get(5)?,
            recorded_at,
        })
    }
}

/// Statistics about the storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    /// Number of documents in the state table.
    pub state_documents: i64,
    /// Number of delivery log rows.
    pub delivery_rows: i64,
    /// Size of the database file in bytes.
    pub db_size_bytes: u64,
}
