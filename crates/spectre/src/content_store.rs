//! Content-addressable blob store for captured JSON bodies.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{OptionalExtension, Transaction};
use sha2::{Digest as _, Sha256};

use crate::database::Database;
use crate::types::{to_millis, Digest, SpectreError, SpectreResult};

/// Compute the content digest of a body.
pub fn digest_of(bytes: &[u8]) -> Digest {
    let hash = Sha256::digest(bytes);
    let mut hex = String::with_capacity(Digest::HEX_LEN);
    for byte in hash.iter() {
        hex.push_str(&format!("{byte:02x}"));
    }
    Digest::from_hex_unchecked(hex)
}

/// Blob storage keyed by SHA-256 digest. Each distinct body is stored once.
pub struct ContentStore {
    db: Arc<Database>,
}

impl ContentStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Store `bytes` if absent and return their digest.
    pub fn put(&self, bytes: &[u8]) -> SpectreResult<Digest> {
        let digest = digest_of(bytes);
        self.db.write(|tx| self.put_digest_in(tx, &digest, bytes))?;
        Ok(digest)
    }

    /// Same as [`put`](Self::put) inside a caller-owned transaction.
    pub(crate) fn put_in(&self, tx: &Transaction<'_>, bytes: &[u8]) -> SpectreResult<Digest> {
        let digest = digest_of(bytes);
        self.put_digest_in(tx, &digest, bytes)?;
        Ok(digest)
    }

    fn put_digest_in(
        &self,
        tx: &Transaction<'_>,
        digest: &Digest,
        bytes: &[u8],
    ) -> SpectreResult<()> {
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO blobs (digest, body, size, created_at) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                digest.as_str(),
                bytes,
                bytes.len() as i64,
                to_millis(Utc::now())
            ],
        )?;
        if inserted > 0 {
            tracing::debug!("Stored new blob {} ({} bytes)", digest.short(), bytes.len());
        }
        Ok(())
    }

    /// Fetch the bytes stored under `digest`.
    pub fn get(&self, digest: &Digest) -> SpectreResult<Vec<u8>> {
        let conn = self.db.read()?;
        conn.query_row(
            "SELECT body FROM blobs WHERE digest = ?1",
            rusqlite::params![digest.as_str()],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()?
        .ok_or_else(|| SpectreError::NotFound(format!("blob {digest}")))
    }

    /// Fetch and parse a stored body as JSON.
    pub fn get_json(&self, digest: &Digest) -> SpectreResult<serde_json::Value> {
        let bytes = self.get(digest)?;
        serde_json::from_slice(&bytes).map_err(|e| {
            SpectreError::InvalidInput(format!("blob {} is not valid JSON: {e}", digest.short()))
        })
    }

    pub fn contains(&self, digest: &Digest) -> SpectreResult<bool> {
        let conn = self.db.read()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM blobs WHERE digest = ?1",
                rusqlite::params![digest.as_str()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Number of stored blobs.
    pub fn len(&self) -> SpectreResult<u64> {
        let conn = self.db.read()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM blobs", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn is_empty(&self) -> SpectreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Remove a blob. Returns `false` when it was already gone.
    ///
    /// Callers must have confirmed that no capture references the digest in
    /// the same transaction.
    pub(crate) fn delete_in(&self, tx: &Transaction<'_>, digest: &Digest) -> SpectreResult<bool> {
        let removed = tx.execute(
            "DELETE FROM blobs WHERE digest = ?1",
            rusqlite::params![digest.as_str()],
        )?;
        if removed > 0 {
            tracing::debug!("Deleted blob {}", digest.short());
        }
        Ok(removed > 0)
    }

    /// Digests of every blob that no capture references.
    pub(crate) fn orphans(&self) -> SpectreResult<Vec<Digest>> {
        let conn = self.db.read()?;
        let mut stmt = conn.prepare(
            "SELECT b.digest FROM blobs b
             WHERE NOT EXISTS (SELECT 1 FROM captures c WHERE c.blob_digest = b.digest)
             ORDER BY b.digest",
        )?;
        let digests = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .map(|r| r.map(Digest::from_hex_unchecked))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(digests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(dir: &tempfile::TempDir) -> ContentStore {
        let db = Database::open(dir.path().join("spectre.db")).unwrap();
        ContentStore::new(Arc::new(db))
    }

    #[test]
    fn test_digest_is_sha256_hex() {
        let digest = digest_of(b"");
        assert_eq!(
            digest.as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);
        let body = br#"{"id": 1, "name": "widget"}"#;

        let digest = store.put(body).unwrap();
        assert_eq!(store.get(&digest).unwrap(), body.to_vec());
        assert_eq!(store.get_json(&digest).unwrap()["name"], "widget");
    }

    #[test]
    fn test_identical_bytes_stored_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);

        let a = store.put(b"[1,2,3]").unwrap();
        let b = store.put(b"[1,2,3]").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len().unwrap(), 1);

        let c = store.put(b"[1,2,3] ").unwrap();
        assert_ne!(a, c);
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn test_get_unknown_digest_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);
        let missing = digest_of(b"never stored");
        assert!(matches!(store.get(&missing), Err(SpectreError::NotFound(_))));
        assert!(!store.contains(&missing).unwrap());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(dir.path().join("spectre.db")).unwrap());
        let store = ContentStore::new(db.clone());
        let digest = store.put(b"{}").unwrap();

        assert!(db.write(|tx| store.delete_in(tx, &digest)).unwrap());
        assert!(!db.write(|tx| store.delete_in(tx, &digest)).unwrap());
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_concurrent_put_same_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(temp_store(&dir));
        let body = br#"{"shared": true}"#.to_vec();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let body = body.clone();
                std::thread::spawn(move || store.put(&body).unwrap())
            })
            .collect();

        let digests: Vec<Digest> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(digests.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.len().unwrap(), 1);
    }
}
