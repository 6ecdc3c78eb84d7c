//! The assembled pipeline: one database, every component wired to it.

use std::path::Path;
use std::sync::Arc;

use crate::analyzer::ResourceAnalyzer;
use crate::capture_log::CaptureLog;
use crate::config::SpectreConfig;
use crate::content_store::ContentStore;
use crate::database::Database;
use crate::ingest::Ingestor;
use crate::normalizer::UrlNormalizer;
use crate::resource_store::ResourceStore;
use crate::retention::RetentionManager;
use crate::types::SpectreResult;

/// Entry point for capture sources, operators and serving layers.
pub struct Spectre {
    config: SpectreConfig,
    db: Arc<Database>,
    normalizer: Arc<UrlNormalizer>,
    content: Arc<ContentStore>,
    captures: Arc<CaptureLog>,
    resources: Arc<ResourceStore>,
    analyzer: ResourceAnalyzer,
    ingestor: Ingestor,
    retention: RetentionManager,
}

impl Spectre {
    /// Open the configured database and apply declared resources.
    pub fn open(config: SpectreConfig) -> SpectreResult<Self> {
        config.validate()?;

        let db = Arc::new(Database::open(&config.database_path)?);
        let normalizer = Arc::new(UrlNormalizer::new(&config.normalizer));
        let content = Arc::new(ContentStore::new(db.clone()));
        let captures = Arc::new(CaptureLog::new(
            db.clone(),
            config.capture_log.clock_skew(),
        )?);
        let resources = Arc::new(ResourceStore::new(db.clone(), captures.clone()));

        resources.load_declared(&config.resources)?;

        let analyzer = ResourceAnalyzer::new(
            captures.clone(),
            content.clone(),
            resources.clone(),
            config.analyzer.min_samples,
        );
        let ingestor = Ingestor::new(
            db.clone(),
            normalizer.clone(),
            content.clone(),
            captures.clone(),
            config.ingest.clone(),
        );
        let retention = RetentionManager::new(db.clone(), captures.clone(), content.clone());

        tracing::info!(
            "Spectre project {:?} opened at {}",
            config.project,
            db.path().display()
        );

        Ok(Self {
            config,
            db,
            normalizer,
            content,
            captures,
            resources,
            analyzer,
            ingestor,
            retention,
        })
    }

    pub fn config(&self) -> &SpectreConfig {
        &self.config
    }

    pub fn database_path(&self) -> &Path {
        self.db.path()
    }

    pub fn normalizer(&self) -> &UrlNormalizer {
        &self.normalizer
    }

    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    pub fn captures(&self) -> &CaptureLog {
        &self.captures
    }

    pub fn resources(&self) -> &ResourceStore {
        &self.resources
    }

    pub fn analyzer(&self) -> &ResourceAnalyzer {
        &self.analyzer
    }

    pub fn ingestor(&self) -> &Ingestor {
        &self.ingestor
    }

    pub fn retention(&self) -> &RetentionManager {
        &self.retention
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeclaredResource;
    use crate::types::ResourceSource;

    #[test]
    fn test_open_loads_declared_resources() {
        let dir = tempfile::tempdir().unwrap();
        let config = SpectreConfig {
            database_path: dir.path().join("db").join("spectre.db"),
            resources: vec![DeclaredResource {
                name: "products".into(),
                pattern: "/api/products/{id}".into(),
                method: "GET".into(),
                primary_key: Some("id".into()),
            }],
            ..SpectreConfig::default()
        };

        let spectre = Spectre::open(config).unwrap();
        let products = spectre.resources().get("products").unwrap();
        assert_eq!(products.source, ResourceSource::Declared);
        assert!(spectre.database_path().exists());
        assert!(spectre.captures().is_empty().unwrap());
    }

    #[test]
    fn test_open_rejects_invalid_declared_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let config = SpectreConfig {
            database_path: dir.path().join("spectre.db"),
            resources: vec![DeclaredResource {
                name: "broken".into(),
                pattern: "^(".into(),
                method: "GET".into(),
                primary_key: None,
            }],
            ..SpectreConfig::default()
        };
        assert!(Spectre::open(config).is_err());
    }
}
