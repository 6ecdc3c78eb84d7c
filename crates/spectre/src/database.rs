//! SQLite database holding blobs, captures and resources.
//!
//! A single writer connection, guarded by a mutex, serializes every mutation.
//! Reads open their own connection so that, with the WAL journal, queries from
//! the analyzer or a serving layer never wait on the append stream.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};

use crate::types::{SpectreError, SpectreResult};

/// Current on-disk schema version (`PRAGMA user_version`).
const SCHEMA_VERSION: i32 = 1;

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA_V1: &str = "
    CREATE TABLE IF NOT EXISTS blobs (
        digest TEXT PRIMARY KEY,
        body BLOB NOT NULL,
        size INTEGER NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS captures (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        session_id TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        method TEXT NOT NULL,
        raw_url TEXT NOT NULL,
        normalized_url TEXT NOT NULL,
        status INTEGER NOT NULL,
        blob_digest TEXT REFERENCES blobs(digest),
        size INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_captures_timestamp ON captures(timestamp);
    CREATE INDEX IF NOT EXISTS idx_captures_session ON captures(session_id);
    CREATE INDEX IF NOT EXISTS idx_captures_template ON captures(normalized_url, method);
    CREATE INDEX IF NOT EXISTS idx_captures_blob ON captures(blob_digest);

    CREATE TABLE IF NOT EXISTS resources (
        name TEXT PRIMARY KEY,
        pattern TEXT NOT NULL,
        method TEXT NOT NULL,
        source TEXT NOT NULL,
        sample_count INTEGER NOT NULL DEFAULT 0,
        primary_key TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );
";

/// Handle to the durable capture database.
pub struct Database {
    path: PathBuf,
    writer: Mutex<Connection>,
}

impl Database {
    /// Open or create the database file, applying the schema if needed.
    pub fn open(path: impl AsRef<Path>) -> SpectreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    SpectreError::StorageFailure(format!(
                        "failed to create directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let mut conn = open_writer(&path)?;
        migrate(&mut conn)?;
        tracing::debug!("Opened capture database: {}", path.display());

        Ok(Self {
            path,
            writer: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` inside one immediate write transaction.
    ///
    /// The transaction commits when `f` returns `Ok` and rolls back otherwise.
    pub(crate) fn write<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> SpectreResult<T>,
    ) -> SpectreResult<T> {
        let mut conn = self
            .writer
            .lock()
            .map_err(|_| SpectreError::StorageFailure("writer connection poisoned".into()))?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Open a fresh query-only connection.
    pub(crate) fn read(&self) -> SpectreResult<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&self.path, flags).map_err(|e| {
            SpectreError::StorageFailure(format!("failed to open {}: {e}", self.path.display()))
        })?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "query_only", true)?;
        Ok(conn)
    }
}

fn open_writer(path: &Path) -> SpectreResult<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags).map_err(|e| {
        SpectreError::StorageFailure(format!("failed to open {}: {e}", path.display()))
    })?;

    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

fn migrate(conn: &mut Connection) -> SpectreResult<()> {
    let user_version: i32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;

    match user_version {
        0 => {
            let tx = conn.transaction()?;
            tx.execute_batch(SCHEMA_V1)?;
            tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
            tx.commit()?;
            tracing::info!("Initialized capture database schema v{SCHEMA_VERSION}");
            Ok(())
        }
        SCHEMA_VERSION => Ok(()),
        other => Err(SpectreError::StorageFailure(format!(
            "unsupported database schema version {other} (expected {SCHEMA_VERSION})"
        ))),
    }
}
