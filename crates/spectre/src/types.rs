//! Core data types for captures, blobs and resources.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a capture record.
pub type CaptureId = Uuid;

/// Lowercase hex SHA-256 digest identifying a blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Length of a hex-encoded SHA-256 digest.
    pub const HEX_LEN: usize = 64;

    /// Parse a digest from its hex form.
    pub fn parse(raw: &str) -> SpectreResult<Self> {
        let raw = raw.trim();
        if raw.len() != Self::HEX_LEN || !raw.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(SpectreError::InvalidInput(format!(
                "digest must be {} hex characters, got {raw:?}",
                Self::HEX_LEN
            )));
        }
        Ok(Self(raw.to_ascii_lowercase()))
    }

    pub(crate) fn from_hex_unchecked(hex: String) -> Self {
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One observed request/response event as stored in the capture log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capture {
    pub id: CaptureId,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub raw_url: String,
    pub normalized_url: String,
    pub status: u16,
    pub blob_digest: Option<Digest>,
    pub size: u64,
}

/// Fields supplied when appending a capture.
#[derive(Debug, Clone)]
pub struct NewCapture {
    pub session_id: String,
    pub method: String,
    pub raw_url: String,
    pub normalized_url: String,
    pub status: u16,
    pub blob_digest: Option<Digest>,
    pub size: u64,
    pub timestamp: DateTime<Utc>,
}

/// Where a resource definition came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceSource {
    Inferred,
    Declared,
}

impl ResourceSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inferred => "inferred",
            Self::Declared => "declared",
        }
    }

    pub fn parse(raw: &str) -> SpectreResult<Self> {
        match raw {
            "inferred" => Ok(Self::Inferred),
            "declared" => Ok(Self::Declared),
            other => Err(SpectreError::StorageFailure(format!(
                "unknown resource source {other:?}"
            ))),
        }
    }
}

/// A named, pattern-matched grouping of captures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub pattern: String,
    pub method: String,
    pub source: ResourceSource,
    pub sample_count: u64,
    pub primary_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A normalized template with its occurrence count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateCount {
    pub normalized_url: String,
    pub method: String,
    pub count: u64,
}

/// Errors that can occur in the capture pipeline.
#[derive(thiserror::Error, Debug)]
pub enum SpectreError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage failure: {0}")]
    StorageFailure(String),
}

impl SpectreError {
    /// Only storage failures are worth retrying; the rest are deterministic.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SpectreError::StorageFailure(_))
    }
}

impl From<rusqlite::Error> for SpectreError {
    fn from(e: rusqlite::Error) -> Self {
        SpectreError::StorageFailure(e.to_string())
    }
}

impl From<std::io::Error> for SpectreError {
    fn from(e: std::io::Error) -> Self {
        SpectreError::StorageFailure(e.to_string())
    }
}

/// Convenience result type.
pub type SpectreResult<T> = Result<T, SpectreError>;

/// Convert a timestamp to the millisecond integer stored on disk.
pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Convert a stored millisecond integer back to a timestamp.
pub(crate) fn from_millis(ms: i64) -> SpectreResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| SpectreError::StorageFailure(format!("timestamp out of range: {ms}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_parse_normalizes_case() {
        let hex = "AB".repeat(32);
        let digest = Digest::parse(&hex).unwrap();
        assert_eq!(digest.as_str(), "ab".repeat(32));
        assert_eq!(digest.short(), "abababab");
    }

    #[test]
    fn test_digest_parse_rejects_bad_input() {
        assert!(Digest::parse("abc").is_err());
        assert!(Digest::parse(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn test_only_storage_failures_retry() {
        assert!(SpectreError::StorageFailure("disk".into()).is_retryable());
        assert!(!SpectreError::InvalidInput("x".into()).is_retryable());
        assert!(!SpectreError::Conflict("x".into()).is_retryable());
        assert!(!SpectreError::NotFound("x".into()).is_retryable());
    }

    #[test]
    fn test_millis_roundtrip() {
        let now = DateTime::<Utc>::from_timestamp_millis(1_708_345_678_123).unwrap();
        assert_eq!(from_millis(to_millis(now)).unwrap(), now);
    }
}
