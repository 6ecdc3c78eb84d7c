//! Turning capture-source events into stored captures.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capture_log::CaptureLog;
use crate::content_store::ContentStore;
use crate::database::Database;
use crate::normalizer::UrlNormalizer;
use crate::types::{CaptureId, NewCapture, SpectreError, SpectreResult};

/// One intercepted request/response pair, as delivered by a capture source.
#[derive(Debug, Clone)]
pub struct CaptureEvent {
    pub session_id: String,
    pub method: String,
    pub raw_url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Option<Vec<u8>>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    /// Retries of a failed storage write before giving up.
    pub max_retries: u32,
    /// Delay before the first retry; grows linearly.
    pub retry_backoff_ms: u64,
    /// Hosts (and their subdomains) whose traffic is never stored.
    pub ignored_domains: Vec<String>,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff_ms: 50,
            ignored_domains: [
                "google-analytics.com",
                "analytics.google.com",
                "doubleclick.net",
                "googletagmanager.com",
                "googlesyndication.com",
                "googleadservices.com",
                "facebook.com",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    IgnoredDomain(String),
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Stored(CaptureId),
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestSummary {
    pub stored: u64,
    pub dropped: u64,
}

/// Normalizes events and writes blob and capture row in one transaction.
pub struct Ingestor {
    db: Arc<Database>,
    normalizer: Arc<UrlNormalizer>,
    content: Arc<ContentStore>,
    log: Arc<CaptureLog>,
    settings: IngestSettings,
}

impl Ingestor {
    pub fn new(
        db: Arc<Database>,
        normalizer: Arc<UrlNormalizer>,
        content: Arc<ContentStore>,
        log: Arc<CaptureLog>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            db,
            normalizer,
            content,
            log,
            settings,
        }
    }

    /// Store one event. Invalid events are dropped; storage failures are
    /// retried and then returned.
    pub fn ingest(&self, event: CaptureEvent) -> SpectreResult<IngestOutcome> {
        if let Some(domain) = self.ignored_domain(&event.raw_url) {
            tracing::debug!("Ignoring {} (domain {domain})", event.raw_url);
            return Ok(IngestOutcome::Dropped(DropReason::IgnoredDomain(
                domain.to_string(),
            )));
        }

        let body = json_body(
            event.body.as_deref(),
            event.content_type.as_deref(),
            &event.raw_url,
        );
        let capture = NewCapture {
            session_id: event.session_id,
            method: event.method,
            normalized_url: self.normalizer.normalize(&event.raw_url),
            raw_url: event.raw_url,
            status: event.status,
            blob_digest: None,
            size: event.body.as_ref().map_or(0, |b| b.len() as u64),
            timestamp: event.timestamp,
        };

        let mut attempt = 0u32;
        loop {
            let result = self.db.write(|tx| {
                let mut capture = capture.clone();
                if let Some(bytes) = body {
                    capture.blob_digest = Some(self.content.put_in(tx, bytes)?);
                }
                self.log.append_in(tx, &capture)
            });

            match result {
                Ok(id) => {
                    self.log.record_committed(capture.timestamp);
                    return Ok(IngestOutcome::Stored(id));
                }
                Err(SpectreError::InvalidInput(reason)) => {
                    tracing::warn!("Dropping capture of {}: {reason}", capture.raw_url);
                    return Ok(IngestOutcome::Dropped(DropReason::Invalid(reason)));
                }
                Err(e) if e.is_retryable() && attempt < self.settings.max_retries => {
                    attempt += 1;
                    let delay = self.settings.retry_backoff_ms * u64::from(attempt);
                    tracing::warn!(
                        "Storing capture of {} failed (attempt {attempt}): {e}; retrying in {delay} ms",
                        capture.raw_url
                    );
                    std::thread::sleep(Duration::from_millis(delay));
                }
                Err(e) => {
                    tracing::error!("Giving up on capture of {}: {e}", capture.raw_url);
                    return Err(e);
                }
            }
        }
    }

    /// Ingest events in order, stopping at the first fatal error.
    pub fn ingest_all(
        &self,
        events: impl IntoIterator<Item = CaptureEvent>,
    ) -> SpectreResult<IngestSummary> {
        let mut summary = IngestSummary::default();
        for event in events {
            match self.ingest(event)? {
                IngestOutcome::Stored(_) => summary.stored += 1,
                IngestOutcome::Dropped(_) => summary.dropped += 1,
            }
        }
        tracing::info!(
            "Ingested {} captures, dropped {}",
            summary.stored,
            summary.dropped
        );
        Ok(summary)
    }

    fn ignored_domain(&self, raw_url: &str) -> Option<&str> {
        let parsed = url::Url::parse(raw_url).ok()?;
        let host = parsed.host_str()?.to_ascii_lowercase();
        self.settings
            .ignored_domains
            .iter()
            .find(|domain| {
                let domain = domain.to_ascii_lowercase();
                host == domain || host.ends_with(&format!(".{domain}"))
            })
            .map(String::as_str)
    }
}

/// The body bytes worth storing: present, JSON-typed when a type is given,
/// and parseable as JSON.
fn json_body<'a>(
    body: Option<&'a [u8]>,
    content_type: Option<&str>,
    raw_url: &str,
) -> Option<&'a [u8]> {
    let body = body?;
    if let Some(content_type) = content_type {
        if !is_json_content_type(content_type) {
            tracing::debug!("Not storing {content_type} body of {raw_url}");
            return None;
        }
    }
    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(_) => Some(body),
        Err(e) => {
            tracing::debug!("Body of {raw_url} is not JSON: {e}");
            None
        }
    }
}

pub fn is_json_content_type(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    mime == "application/json" || mime == "text/json" || mime.ends_with("+json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture_log::{CaptureQuery, DEFAULT_CLOCK_SKEW};

    struct Fixture {
        _dir: tempfile::TempDir,
        log: Arc<CaptureLog>,
        content: Arc<ContentStore>,
        ingestor: Ingestor,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(dir.path().join("spectre.db")).unwrap());
        let log = Arc::new(CaptureLog::new(db.clone(), DEFAULT_CLOCK_SKEW).unwrap());
        let content = Arc::new(ContentStore::new(db.clone()));
        let ingestor = Ingestor::new(
            db,
            Arc::new(UrlNormalizer::default()),
            content.clone(),
            log.clone(),
            IngestSettings::default(),
        );
        Fixture {
            _dir: dir,
            log,
            content,
            ingestor,
        }
    }

    fn event(url: &str, body: Option<&str>) -> CaptureEvent {
        CaptureEvent {
            session_id: "session-1".into(),
            method: "get".into(),
            raw_url: url.into(),
            status: 200,
            content_type: Some("application/json; charset=utf-8".into()),
            body: body.map(|b| b.as_bytes().to_vec()),
            timestamp: Utc::now(),
        }
    }

    fn stored_id(outcome: IngestOutcome) -> CaptureId {
        match outcome {
            IngestOutcome::Stored(id) => id,
            other => panic!("expected a stored capture, got {other:?}"),
        }
    }

    #[test]
    fn test_json_capture_is_stored_normalized() {
        let f = fixture();
        let id = stored_id(
            f.ingestor
                .ingest(event(
                    "https://shop.test/api/v1/products/123?page=2",
                    Some(r#"{"id": 123}"#),
                ))
                .unwrap(),
        );

        let capture = f.log.get(id).unwrap();
        assert_eq!(capture.method, "GET");
        assert_eq!(capture.normalized_url, "/api/v1/products/{id}");
        assert_eq!(capture.raw_url, "https://shop.test/api/v1/products/123?page=2");
        assert_eq!(capture.size, 11);
        let digest = capture.blob_digest.unwrap();
        assert_eq!(f.content.get_json(&digest).unwrap()["id"], 123);
    }

    #[test]
    fn test_identical_bodies_share_a_blob() {
        let f = fixture();
        let summary = f
            .ingestor
            .ingest_all(vec![
                event("https://s.test/a/1", Some("[1,2]")),
                event("https://s.test/a/2", Some("[1,2]")),
            ])
            .unwrap();
        assert_eq!(summary, IngestSummary { stored: 2, dropped: 0 });
        assert_eq!(f.content.len().unwrap(), 1);
    }

    #[test]
    fn test_non_json_body_stores_null_blob() {
        let f = fixture();
        let html = stored_id(f.ingestor.ingest(event("https://s.test/page", Some("<html>"))).unwrap());
        assert_eq!(f.log.get(html).unwrap().blob_digest, None);

        let mut typed = event("https://s.test/text", Some("{}"));
        typed.content_type = Some("text/html".into());
        let typed = stored_id(f.ingestor.ingest(typed).unwrap());
        assert_eq!(f.log.get(typed).unwrap().blob_digest, None);

        let empty = stored_id(f.ingestor.ingest(event("https://s.test/empty", None)).unwrap());
        assert_eq!(f.log.get(empty).unwrap().size, 0);
        assert!(f.content.is_empty().unwrap());
    }

    #[test]
    fn test_ignored_domains_are_dropped() {
        let f = fixture();
        let outcome = f
            .ingestor
            .ingest(event("https://www.google-analytics.com/collect", Some("{}")))
            .unwrap();
        assert_eq!(
            outcome,
            IngestOutcome::Dropped(DropReason::IgnoredDomain("google-analytics.com".into()))
        );

        // Suffix match only on label boundaries.
        let kept = f
            .ingestor
            .ingest(event("https://notfacebook.com/api", Some("{}")))
            .unwrap();
        assert!(matches!(kept, IngestOutcome::Stored(_)));
    }

    #[test]
    fn test_invalid_event_is_dropped_without_blob() {
        let f = fixture();
        let mut bad = event("https://s.test/a", Some(r#"{"x":1}"#));
        bad.status = 0;
        let outcome = f.ingestor.ingest(bad).unwrap();
        assert!(matches!(outcome, IngestOutcome::Dropped(DropReason::Invalid(_))));
        assert!(f.log.is_empty().unwrap());
        assert!(f.content.is_empty().unwrap());
    }

    #[test]
    fn test_ingest_all_counts_and_sessions() {
        let f = fixture();
        let mut other = event("https://s.test/b", None);
        other.session_id = "session-2".into();
        let summary = f
            .ingestor
            .ingest_all(vec![
                event("https://s.test/a", None),
                event("https://doubleclick.net/x", None),
                other,
            ])
            .unwrap();
        assert_eq!(summary, IngestSummary { stored: 2, dropped: 1 });

        let s2 = f.log.query(&CaptureQuery::new(10).session("session-2")).unwrap();
        assert_eq!(s2.len(), 1);
    }

    #[test]
    fn test_json_content_types() {
        for (ct, expected) in [
            ("application/json", true),
            ("Application/JSON; charset=utf-8", true),
            ("application/vnd.api+json", true),
            ("text/json", true),
            ("text/html", false),
            ("", false),
        ] {
            assert_eq!(is_json_content_type(ct), expected, "{ct}");
        }
    }
}
