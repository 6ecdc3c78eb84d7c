//! JSON Lines capture events, as written by browser capture sources.
//!
//! One object per line:
//! `{"session_id", "method", "url", "status", "content_type", "body" | "body_base64", "timestamp"}`.
//! `body` may be any JSON value and is stored exactly as written on the line;
//! a string body is taken as the raw response text. Only `url` and `status`
//! are required.

use std::io::BufRead;

use anyhow::Context;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::value::RawValue;
use spectre::CaptureEvent;

#[derive(Debug, Deserialize)]
struct EventLine {
    session_id: Option<String>,
    #[serde(default = "default_method")]
    method: String,
    url: String,
    status: u16,
    content_type: Option<String>,
    body: Option<Box<RawValue>>,
    body_base64: Option<String>,
    timestamp: Option<DateTime<Utc>>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Session id used when neither the event nor the operator names one.
pub fn default_session_id() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Parse one line into an event. `session` is used when the line has none.
pub fn parse_event(line: &str, session: &str) -> anyhow::Result<CaptureEvent> {
    let raw: EventLine = serde_json::from_str(line).context("Malformed capture event")?;

    let body = match (raw.body, raw.body_base64) {
        (Some(_), Some(_)) => anyhow::bail!("Event has both body and body_base64"),
        (Some(raw), None) if raw.get().starts_with('"') => {
            let text: String = serde_json::from_str(raw.get())?;
            Some(text.into_bytes())
        }
        (Some(raw), None) => Some(raw.get().as_bytes().to_vec()),
        (None, Some(encoded)) => Some(
            base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .context("Invalid body_base64")?,
        ),
        (None, None) => None,
    };

    Ok(CaptureEvent {
        session_id: raw.session_id.unwrap_or_else(|| session.to_string()),
        method: raw.method,
        raw_url: raw.url,
        status: raw.status,
        content_type: raw.content_type,
        body,
        timestamp: raw.timestamp.unwrap_or_else(Utc::now),
    })
}

/// Lines that could not be turned into events are reported and skipped.
pub struct EventReader<R> {
    lines: std::io::Lines<R>,
    session: String,
    line_no: usize,
    pub skipped: u64,
}

impl<R: BufRead> EventReader<R> {
    pub fn new(reader: R, session: impl Into<String>) -> Self {
        Self {
            lines: reader.lines(),
            session: session.into(),
            line_no: 0,
            skipped: 0,
        }
    }

    /// Next well-formed event, or `None` at end of input.
    pub fn next_event(&mut self) -> anyhow::Result<Option<CaptureEvent>> {
        for line in self.lines.by_ref() {
            self.line_no += 1;
            let line = line.context("Failed to read capture events")?;
            if line.trim().is_empty() {
                continue;
            }
            match parse_event(&line, &self.session) {
                Ok(event) => return Ok(Some(event)),
                Err(e) => {
                    tracing::warn!("Skipping line {}: {e:#}", self.line_no);
                    self.skipped += 1;
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_body() {
        let event = parse_event(
            r#"{"url": "https://s.test/a/1", "status": 200, "body": {"id": 1}}"#,
            "fallback",
        )
        .unwrap();
        assert_eq!(event.session_id, "fallback");
        assert_eq!(event.method, "GET");
        assert_eq!(event.body.unwrap(), br#"{"id": 1}"#.to_vec());
    }

    #[test]
    fn test_json_body_keeps_key_order_and_spacing() {
        let event = parse_event(
            r#"{"url": "/a", "status": 200, "body": {"b": 1,  "a": [2, 1.50]}}"#,
            "s",
        )
        .unwrap();
        assert_eq!(event.body.unwrap(), br#"{"b": 1,  "a": [2, 1.50]}"#.to_vec());

        let empty = parse_event(r#"{"url": "/a", "status": 200, "body": null}"#, "s").unwrap();
        assert_eq!(empty.body, None);
    }

    #[test]
    fn test_parse_text_and_base64_bodies() {
        let text = parse_event(
            r#"{"url": "/a", "status": 200, "body": "{\"raw\": true}", "session_id": "s9"}"#,
            "fallback",
        )
        .unwrap();
        assert_eq!(text.session_id, "s9");
        assert_eq!(text.body.unwrap(), br#"{"raw": true}"#.to_vec());

        let encoded = parse_event(
            r#"{"url": "/a", "status": 201, "method": "post", "body_base64": "e30="}"#,
            "s",
        )
        .unwrap();
        assert_eq!(encoded.method, "post");
        assert_eq!(encoded.body.unwrap(), b"{}".to_vec());
    }

    #[test]
    fn test_parse_rejects_bad_lines() {
        assert!(parse_event("not json", "s").is_err());
        assert!(parse_event(r#"{"status": 200}"#, "s").is_err());
        assert!(parse_event(
            r#"{"url": "/a", "status": 200, "body": {}, "body_base64": "e30="}"#,
            "s"
        )
        .is_err());
    }

    #[test]
    fn test_reader_skips_blank_and_malformed_lines() {
        let input = "\n{\"url\": \"/a\", \"status\": 200}\nbroken\n{\"url\": \"/b\", \"status\": 404}\n";
        let mut reader = EventReader::new(input.as_bytes(), "s");

        let mut urls = Vec::new();
        while let Some(event) = reader.next_event().unwrap() {
            urls.push(event.raw_url);
        }
        assert_eq!(urls, vec!["/a", "/b"]);
        assert_eq!(reader.skipped, 1);
    }

    #[test]
    fn test_explicit_timestamp_is_kept() {
        let event = parse_event(
            r#"{"url": "/a", "status": 200, "timestamp": "2024-02-19T12:00:00Z"}"#,
            "s",
        )
        .unwrap();
        assert_eq!(event.timestamp.to_rfc3339(), "2024-02-19T12:00:00+00:00");
    }
}
