//! Spectre: capture, normalize, discover and store JSON API traffic.

pub mod analyzer;
pub mod capture_log;
pub mod config;
pub mod content_store;
pub mod database;
pub mod engine;
pub mod ingest;
pub mod normalizer;
pub mod resource_store;
pub mod retention;
pub mod types;

pub use analyzer::{generate_config, ResourceAnalyzer, ResourceCandidate};
pub use capture_log::{CaptureLog, CaptureQuery, PurgeOutcome, DEFAULT_CLOCK_SKEW};
pub use config::{ConfigDocument, DeclaredResource, SpectreConfig, DEFAULT_DATABASE_PATH};
pub use content_store::{digest_of, ContentStore};
pub use database::Database;
pub use engine::Spectre;
pub use ingest::{CaptureEvent, DropReason, IngestOutcome, IngestSettings, IngestSummary, Ingestor};
pub use normalizer::{NormalizerPolicy, SegmentRule, UrlNormalizer, PLACEHOLDER};
pub use resource_store::{compile_pattern, ResourceStore};
pub use retention::{CleanupReport, RetentionManager};
pub use types::*;
