//! Append-only log of captured request/response events.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::types::Value;
use rusqlite::{OptionalExtension, Row, Transaction};
use uuid::Uuid;

use crate::database::Database;
use crate::types::{
    from_millis, to_millis, Capture, CaptureId, Digest, NewCapture, SpectreError, SpectreResult,
    TemplateCount,
};

/// Default tolerance for captures arriving slightly out of order.
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(5);

const CAPTURE_COLUMNS: &str =
    "id, session_id, timestamp, method, raw_url, normalized_url, status, blob_digest, size";

/// Filter for [`CaptureLog::query`].
#[derive(Debug, Clone, Default)]
pub struct CaptureQuery {
    pub session_id: Option<String>,
    /// Regex matched against the raw URL.
    pub url_pattern: Option<Regex>,
    pub method: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub offset: usize,
    pub limit: usize,
    pub newest_first: bool,
}

impl CaptureQuery {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn url_pattern(mut self, pattern: Regex) -> Self {
        self.url_pattern = Some(pattern);
        self
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into().to_ascii_uppercase());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn newest_first(mut self) -> Self {
        self.newest_first = true;
        self
    }
}

/// Rows removed by [`CaptureLog::delete_older_than`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeOutcome {
    pub deleted: u64,
    /// Blobs referenced by the deleted rows; candidates for garbage collection.
    pub digests: BTreeSet<Digest>,
}

/// Append-only capture records.
pub struct CaptureLog {
    db: Arc<Database>,
    clock_skew: Duration,
    last_timestamp: Mutex<Option<i64>>,
}

impl CaptureLog {
    pub fn new(db: Arc<Database>, clock_skew: Duration) -> SpectreResult<Self> {
        let last: Option<i64> = db
            .read()?
            .query_row("SELECT MAX(timestamp) FROM captures", [], |row| row.get(0))?;
        Ok(Self {
            db,
            clock_skew,
            last_timestamp: Mutex::new(last),
        })
    }

    /// Append one capture and return its id.
    pub fn append(&self, capture: NewCapture) -> SpectreResult<CaptureId> {
        let id = self.db.write(|tx| self.append_in(tx, &capture))?;
        self.record_committed(capture.timestamp);
        Ok(id)
    }

    /// Advance the skew baseline. Called once the appending transaction has
    /// committed, so rolled-back appends leave it alone.
    pub(crate) fn record_committed(&self, timestamp: DateTime<Utc>) {
        let ts = to_millis(timestamp);
        if let Ok(mut last) = self.last_timestamp.lock() {
            *last = Some(last.map_or(ts, |prev| prev.max(ts)));
        }
    }

    pub(crate) fn append_in(
        &self,
        tx: &Transaction<'_>,
        capture: &NewCapture,
    ) -> SpectreResult<CaptureId> {
        let method = validate(capture)?;

        if let Some(digest) = &capture.blob_digest {
            let exists = tx
                .query_row(
                    "SELECT 1 FROM blobs WHERE digest = ?1",
                    rusqlite::params![digest.as_str()],
                    |_| Ok(()),
                )
                .optional()?;
            if exists.is_none() {
                return Err(SpectreError::NotFound(format!(
                    "capture references unknown blob {digest}"
                )));
            }
        }

        let ts = to_millis(capture.timestamp);
        self.check_skew(ts, &capture.raw_url);

        let id = Uuid::new_v4();
        tx.execute(
            "INSERT INTO captures
                (id, session_id, timestamp, method, raw_url, normalized_url, status, blob_digest, size)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                id.to_string(),
                capture.session_id,
                ts,
                method,
                capture.raw_url,
                capture.normalized_url,
                capture.status as i64,
                capture.blob_digest.as_ref().map(|d| d.as_str()),
                capture.size as i64,
            ],
        )?;

        tracing::debug!("Appended capture {id} {method} {}", capture.raw_url);
        Ok(id)
    }

    fn check_skew(&self, ts: i64, raw_url: &str) {
        let Ok(last) = self.last_timestamp.lock() else {
            return;
        };
        if let Some(prev) = *last {
            let behind = prev - ts;
            if behind > self.clock_skew.as_millis() as i64 {
                tracing::warn!(
                    "Capture for {raw_url} is {behind} ms older than the previous append; accepting"
                );
            }
        }
    }

    /// Fetch one capture by id.
    pub fn get(&self, id: CaptureId) -> SpectreResult<Capture> {
        let conn = self.db.read()?;
        let sql = format!("SELECT {CAPTURE_COLUMNS} FROM captures WHERE id = ?1");
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(rusqlite::params![id.to_string()])?;
        let capture = match rows.next()? {
            Some(row) => capture_from_row(row)?,
            None => return Err(SpectreError::NotFound(format!("capture {id}"))),
        };
        Ok(capture)
    }

    /// Captures matching `filter`, ordered by timestamp.
    pub fn query(&self, filter: &CaptureQuery) -> SpectreResult<Vec<Capture>> {
        if filter.limit == 0 {
            return Ok(Vec::new());
        }

        let mut sql = format!("SELECT {CAPTURE_COLUMNS} FROM captures WHERE 1 = 1");
        let mut params: Vec<Value> = Vec::new();

        if let Some(session) = &filter.session_id {
            sql.push_str(" AND session_id = ?");
            params.push(Value::Text(session.clone()));
        }
        if let Some(method) = &filter.method {
            sql.push_str(" AND method = ?");
            params.push(Value::Text(method.to_ascii_uppercase()));
        }
        if let Some(since) = filter.since {
            sql.push_str(" AND timestamp >= ?");
            params.push(Value::Integer(to_millis(since)));
        }
        if let Some(until) = filter.until {
            sql.push_str(" AND timestamp <= ?");
            params.push(Value::Integer(to_millis(until)));
        }

        if filter.newest_first {
            sql.push_str(" ORDER BY timestamp DESC, seq DESC");
        } else {
            sql.push_str(" ORDER BY timestamp ASC, seq ASC");
        }

        // Regex filtering happens row by row, so paging can only move into SQL
        // when there is no URL pattern.
        if filter.url_pattern.is_none() {
            sql.push_str(" LIMIT ? OFFSET ?");
            params.push(Value::Integer(filter.limit as i64));
            params.push(Value::Integer(filter.offset as i64));
        }

        let conn = self.db.read()?;
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(params))?;

        let mut out = Vec::new();
        let mut skipped = 0usize;
        while let Some(row) = rows.next()? {
            if let Some(pattern) = &filter.url_pattern {
                let raw_url: String = row.get(4)?;
                if !pattern.is_match(&raw_url) {
                    continue;
                }
                if skipped < filter.offset {
                    skipped += 1;
                    continue;
                }
            }
            out.push(capture_from_row(row)?);
            if out.len() >= filter.limit {
                break;
            }
        }
        Ok(out)
    }

    /// Distinct `(normalized_url, method)` pairs by descending frequency.
    pub fn distinct_normalized_urls(&self, limit: usize) -> SpectreResult<Vec<TemplateCount>> {
        let conn = self.db.read()?;
        let mut stmt = conn.prepare(
            "SELECT normalized_url, method, COUNT(*) AS n
             FROM captures
             GROUP BY normalized_url, method
             ORDER BY n DESC, normalized_url ASC, method ASC
             LIMIT ?1",
        )?;
        let counts = stmt
            .query_map(rusqlite::params![limit as i64], |row| {
                Ok(TemplateCount {
                    normalized_url: row.get(0)?,
                    method: row.get(1)?,
                    count: row.get::<_, i64>(2)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(counts)
    }

    /// Delete every capture with `timestamp < cutoff`.
    pub fn delete_older_than(&self, cutoff: DateTime<Utc>) -> SpectreResult<PurgeOutcome> {
        let cutoff_ms = to_millis(cutoff);
        self.db.write(|tx| {
            let mut stmt = tx.prepare(
                "SELECT DISTINCT blob_digest FROM captures
                 WHERE timestamp < ?1 AND blob_digest IS NOT NULL",
            )?;
            let digests = stmt
                .query_map(rusqlite::params![cutoff_ms], |row| row.get::<_, String>(0))?
                .map(|r| r.map(Digest::from_hex_unchecked))
                .collect::<Result<BTreeSet<_>, _>>()?;

            let deleted = tx.execute(
                "DELETE FROM captures WHERE timestamp < ?1",
                rusqlite::params![cutoff_ms],
            )?;

            Ok(PurgeOutcome {
                deleted: deleted as u64,
                digests,
            })
        })
    }

    /// Number of captures referencing `digest`.
    pub fn reference_count(&self, digest: &Digest) -> SpectreResult<u64> {
        let conn = self.db.read()?;
        count_references(&conn, digest)
    }

    pub(crate) fn reference_count_in(
        &self,
        tx: &Transaction<'_>,
        digest: &Digest,
    ) -> SpectreResult<u64> {
        count_references(tx, digest)
    }

    /// Most recent blob captured for a template, used as a sample body.
    pub fn latest_blob_for(&self, template: &str, method: &str) -> SpectreResult<Option<Digest>> {
        let conn = self.db.read()?;
        let digest = conn
            .query_row(
                "SELECT blob_digest FROM captures
                 WHERE normalized_url = ?1 AND method = ?2 AND blob_digest IS NOT NULL
                 ORDER BY timestamp DESC, seq DESC
                 LIMIT 1",
                rusqlite::params![template, method.to_ascii_uppercase()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(digest.map(Digest::from_hex_unchecked))
    }

    /// Total number of captures.
    pub fn len(&self) -> SpectreResult<u64> {
        let conn = self.db.read()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM captures", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn is_empty(&self) -> SpectreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Capture counts per session, most recent session first.
    pub fn sessions(&self) -> SpectreResult<Vec<(String, u64)>> {
        let conn = self.db.read()?;
        let mut stmt = conn.prepare(
            "SELECT session_id, COUNT(*) FROM captures
             GROUP BY session_id
             ORDER BY MAX(timestamp) DESC",
        )?;
        let sessions = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get::<_, i64>(1)? as u64)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sessions)
    }
}

fn count_references(conn: &rusqlite::Connection, digest: &Digest) -> SpectreResult<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM captures WHERE blob_digest = ?1",
        rusqlite::params![digest.as_str()],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Check the fields of a new capture and return its uppercased method.
fn validate(capture: &NewCapture) -> SpectreResult<String> {
    let method = capture.method.trim();
    if method.is_empty() {
        return Err(SpectreError::InvalidInput("method is empty".into()));
    }
    if !method
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(SpectreError::InvalidInput(format!(
            "method {method:?} is not an HTTP token"
        )));
    }
    if capture.raw_url.trim().is_empty() {
        return Err(SpectreError::InvalidInput("url is empty".into()));
    }
    if capture.normalized_url.is_empty() {
        return Err(SpectreError::InvalidInput("normalized url is empty".into()));
    }
    if !(100..=599).contains(&capture.status) {
        return Err(SpectreError::InvalidInput(format!(
            "status {} is outside 100..=599",
            capture.status
        )));
    }
    Ok(method.to_ascii_uppercase())
}

fn capture_from_row(row: &Row<'_>) -> SpectreResult<Capture> {
    let id: String = row.get(0)?;
    let status: i64 = row.get(6)?;
    let digest: Option<String> = row.get(7)?;
    let size: i64 = row.get(8)?;

    Ok(Capture {
        id: Uuid::parse_str(&id)
            .map_err(|e| SpectreError::StorageFailure(format!("bad capture id {id:?}: {e}")))?,
        session_id: row.get(1)?,
        timestamp: from_millis(row.get(2)?)?,
        method: row.get(3)?,
        raw_url: row.get(4)?,
        normalized_url: row.get(5)?,
        status: u16::try_from(status)
            .map_err(|_| SpectreError::StorageFailure(format!("bad status {status}")))?,
        blob_digest: digest.map(Digest::from_hex_unchecked),
        size: size.max(0) as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_store::ContentStore;

    fn setup(dir: &tempfile::TempDir) -> (Arc<Database>, CaptureLog, ContentStore) {
        let db = Arc::new(Database::open(dir.path().join("spectre.db")).unwrap());
        let log = CaptureLog::new(db.clone(), DEFAULT_CLOCK_SKEW).unwrap();
        let content = ContentStore::new(db.clone());
        (db, log, content)
    }

    fn capture(url: &str, template: &str, at: DateTime<Utc>) -> NewCapture {
        NewCapture {
            session_id: "s1".into(),
            method: "get".into(),
            raw_url: url.into(),
            normalized_url: template.into(),
            status: 200,
            blob_digest: None,
            size: 0,
            timestamp: at,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_append_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, log, _) = setup(&dir);

        let id = log
            .append(capture("https://shop.test/api/items/1?x=1", "/api/items/{id}", at(0)))
            .unwrap();
        let stored = log.get(id).unwrap();
        assert_eq!(stored.method, "GET");
        assert_eq!(stored.raw_url, "https://shop.test/api/items/1?x=1");
        assert_eq!(stored.normalized_url, "/api/items/{id}");
        assert_eq!(stored.timestamp, at(0));
    }

    #[test]
    fn test_append_rejects_invalid_input() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, log, _) = setup(&dir);

        let mut empty_method = capture("/a", "/a", at(0));
        empty_method.method = "  ".into();
        assert!(matches!(log.append(empty_method), Err(SpectreError::InvalidInput(_))));

        let empty_url = capture("", "/", at(0));
        assert!(matches!(log.append(empty_url), Err(SpectreError::InvalidInput(_))));

        let mut bad_status = capture("/a", "/a", at(0));
        bad_status.status = 42;
        assert!(matches!(log.append(bad_status), Err(SpectreError::InvalidInput(_))));

        assert!(log.is_empty().unwrap());
    }

    #[test]
    fn test_append_accepts_skewed_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, log, _) = setup(&dir);

        log.append(capture("/a", "/a", at(100))).unwrap();
        log.append(capture("/b", "/b", at(0))).unwrap();
        assert_eq!(log.len().unwrap(), 2);
    }

    #[test]
    fn test_rolled_back_append_keeps_skew_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let (db, log, _) = setup(&dir);
        log.append(capture("/a", "/a", at(100))).unwrap();

        let aborted = db.write(|tx| {
            log.append_in(tx, &capture("/b", "/b", at(1_000)))?;
            Err::<(), _>(SpectreError::StorageFailure("disk full".into()))
        });
        assert!(aborted.is_err());

        assert_eq!(log.len().unwrap(), 1);
        assert_eq!(*log.last_timestamp.lock().unwrap(), Some(to_millis(at(100))));
    }

    #[test]
    fn test_append_unknown_blob_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, log, _) = setup(&dir);

        let mut dangling = capture("/a", "/a", at(0));
        dangling.blob_digest = Some(crate::content_store::digest_of(b"missing"));
        assert!(matches!(log.append(dangling), Err(SpectreError::NotFound(_))));
        assert!(log.is_empty().unwrap());
    }

    #[test]
    fn test_query_orders_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, log, _) = setup(&dir);

        log.append(capture("/api/items/2", "/api/items/{id}", at(20))).unwrap();
        log.append(capture("/api/items/1", "/api/items/{id}", at(10))).unwrap();
        let mut other = capture("/api/users/1", "/api/users/{id}", at(30));
        other.session_id = "s2".into();
        log.append(other).unwrap();

        let all = log.query(&CaptureQuery::new(10)).unwrap();
        let urls: Vec<_> = all.iter().map(|c| c.raw_url.as_str()).collect();
        assert_eq!(urls, vec!["/api/items/1", "/api/items/2", "/api/users/1"]);

        let items = log
            .query(&CaptureQuery::new(10).url_pattern(Regex::new("^/api/items/").unwrap()))
            .unwrap();
        assert_eq!(items.len(), 2);

        let session = log.query(&CaptureQuery::new(10).session("s2")).unwrap();
        assert_eq!(session.len(), 1);

        let window = log
            .query(&CaptureQuery::new(10).since(at(15)).until(at(25)))
            .unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].raw_url, "/api/items/2");

        let newest = log.query(&CaptureQuery::new(1).newest_first()).unwrap();
        assert_eq!(newest[0].raw_url, "/api/users/1");

        assert!(log.query(&CaptureQuery::new(0)).unwrap().is_empty());
    }

    #[test]
    fn test_query_paginates_with_and_without_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, log, _) = setup(&dir);
        for i in 0..5 {
            log.append(capture(&format!("/p/{i}"), "/p/{id}", at(i))).unwrap();
        }

        let page = log.query(&CaptureQuery::new(2).offset(2)).unwrap();
        let urls: Vec<_> = page.iter().map(|c| c.raw_url.as_str()).collect();
        assert_eq!(urls, vec!["/p/2", "/p/3"]);

        let page = log
            .query(
                &CaptureQuery::new(2)
                    .offset(2)
                    .url_pattern(Regex::new("^/p/").unwrap()),
            )
            .unwrap();
        let urls: Vec<_> = page.iter().map(|c| c.raw_url.as_str()).collect();
        assert_eq!(urls, vec!["/p/2", "/p/3"]);
    }

    #[test]
    fn test_distinct_normalized_urls_by_frequency() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, log, _) = setup(&dir);

        for i in 0..3 {
            log.append(capture(&format!("/b/{i}"), "/b/{id}", at(i))).unwrap();
        }
        for i in 0..3 {
            log.append(capture(&format!("/a/{i}"), "/a/{id}", at(i))).unwrap();
        }
        log.append(capture("/c", "/c", at(9))).unwrap();

        let counts = log.distinct_normalized_urls(10).unwrap();
        let keys: Vec<_> = counts
            .iter()
            .map(|c| (c.normalized_url.as_str(), c.count))
            .collect();
        assert_eq!(keys, vec![("/a/{id}", 3), ("/b/{id}", 3), ("/c", 1)]);

        assert_eq!(log.distinct_normalized_urls(1).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_older_than_returns_digests() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, log, content) = setup(&dir);

        let old_blob = content.put(b"{\"old\":true}").unwrap();
        let new_blob = content.put(b"{\"new\":true}").unwrap();

        let mut old = capture("/old", "/old", at(0));
        old.blob_digest = Some(old_blob.clone());
        log.append(old).unwrap();
        let mut new = capture("/new", "/new", at(100));
        new.blob_digest = Some(new_blob.clone());
        log.append(new).unwrap();

        let outcome = log.delete_older_than(at(50)).unwrap();
        assert_eq!(outcome.deleted, 1);
        assert_eq!(outcome.digests.into_iter().collect::<Vec<_>>(), vec![old_blob.clone()]);
        assert_eq!(log.len().unwrap(), 1);
        assert_eq!(log.reference_count(&old_blob).unwrap(), 0);
        assert_eq!(log.reference_count(&new_blob).unwrap(), 1);
    }

    #[test]
    fn test_latest_blob_for_template() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, log, content) = setup(&dir);

        let first = content.put(b"{\"v\":1}").unwrap();
        let second = content.put(b"{\"v\":2}").unwrap();
        for (digest, secs) in [(&first, 0), (&second, 10)] {
            let mut c = capture("/x/1", "/x/{id}", at(secs));
            c.blob_digest = Some(digest.clone());
            log.append(c).unwrap();
        }

        assert_eq!(log.latest_blob_for("/x/{id}", "get").unwrap(), Some(second));
        assert_eq!(log.latest_blob_for("/y", "GET").unwrap(), None);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let (_db, log, _) = setup(&dir);
            log.append(capture("/a", "/a", at(0))).unwrap()
        };
        let (_db, log, _) = setup(&dir);
        assert_eq!(log.get(id).unwrap().raw_url, "/a");
    }
}
