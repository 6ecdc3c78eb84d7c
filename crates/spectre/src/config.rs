//! Configuration document: declared resources and component settings.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ingest::IngestSettings;
use crate::normalizer::NormalizerPolicy;
use crate::types::{SpectreError, SpectreResult};

/// Default location of the capture database.
pub const DEFAULT_DATABASE_PATH: &str = "./data/spectre.db";

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectreConfig {
    pub project: String,

    /// Base URL of the captured API, informational.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    pub database_path: PathBuf,

    /// Declared resources, in file order. They win over inferred resources
    /// with the same name.
    pub resources: Vec<DeclaredResource>,

    pub normalizer: NormalizerPolicy,
    pub ingest: IngestSettings,
    pub capture_log: CaptureLogSettings,
    pub analyzer: AnalyzerSettings,
}

impl Default for SpectreConfig {
    fn default() -> Self {
        Self {
            project: "default".to_string(),
            base_url: None,
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            resources: Vec::new(),
            normalizer: NormalizerPolicy::default(),
            ingest: IngestSettings::default(),
            capture_log: CaptureLogSettings::default(),
            analyzer: AnalyzerSettings::default(),
        }
    }
}

impl SpectreConfig {
    /// Parse a YAML document. An empty document yields the defaults.
    pub fn from_yaml_str(content: &str) -> SpectreResult<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: SpectreConfig = serde_yaml::from_str(content)
            .map_err(|e| SpectreError::InvalidInput(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> SpectreResult<String> {
        serde_yaml::to_string(self)
            .map_err(|e| SpectreError::InvalidInput(format!("cannot serialize configuration: {e}")))
    }

    /// Reject duplicate resource names and obviously broken entries.
    pub fn validate(&self) -> SpectreResult<()> {
        let mut seen = HashSet::new();
        for resource in &self.resources {
            if resource.name.trim().is_empty() {
                return Err(SpectreError::InvalidInput(
                    "declared resource with empty name".into(),
                ));
            }
            if resource.pattern.trim().is_empty() {
                return Err(SpectreError::InvalidInput(format!(
                    "declared resource {:?} has an empty pattern",
                    resource.name
                )));
            }
            if !seen.insert(resource.name.as_str()) {
                return Err(SpectreError::InvalidInput(format!(
                    "resource {:?} is declared more than once",
                    resource.name
                )));
            }
        }
        Ok(())
    }
}

/// A resource written in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredResource {
    pub name: String,

    /// Path template such as `/api/items/{id}`, or a regex starting with `^`.
    #[serde(alias = "url_pattern")]
    pub pattern: String,

    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureLogSettings {
    /// Out-of-order tolerance before a late capture is logged.
    pub clock_skew_secs: u64,
}

impl Default for CaptureLogSettings {
    fn default() -> Self {
        Self { clock_skew_secs: 5 }
    }
}

impl CaptureLogSettings {
    pub fn clock_skew(&self) -> Duration {
        Duration::from_secs(self.clock_skew_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerSettings {
    /// Templates seen fewer times are not proposed.
    pub min_samples: u64,
    /// Maximum number of distinct templates read per analysis.
    pub limit: usize,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            min_samples: 1,
            limit: 1000,
        }
    }
}

/// Configuration emitted by the analyzer; loadable as a [`SpectreConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDocument {
    pub project: String,
    pub resources: Vec<DeclaredResource>,
}

impl ConfigDocument {
    pub fn to_yaml(&self) -> SpectreResult<String> {
        serde_yaml::to_string(self)
            .map_err(|e| SpectreError::InvalidInput(format!("cannot serialize configuration: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(SpectreConfig::from_yaml_str("").unwrap(), SpectreConfig::default());
        assert_eq!(
            SpectreConfig::default().database_path,
            PathBuf::from("./data/spectre.db")
        );
    }

    #[test]
    fn test_parse_full_document() {
        let yaml = r#"
project: shop
base_url: https://shop.test
database_path: /tmp/shop.db
resources:
  - name: products
    pattern: /api/v1/products/{id}
    primary_key: sku
  - name: orders
    url_pattern: ^/orders/\d+$
    method: post
normalizer:
  hex_min_len: 12
capture_log:
  clock_skew_secs: 30
analyzer:
  min_samples: 2
"#;
        let config = SpectreConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.project, "shop");
        assert_eq!(config.base_url.as_deref(), Some("https://shop.test"));
        assert_eq!(config.database_path, PathBuf::from("/tmp/shop.db"));
        assert_eq!(config.resources.len(), 2);
        assert_eq!(config.resources[0].method, "GET");
        assert_eq!(config.resources[0].primary_key.as_deref(), Some("sku"));
        assert_eq!(config.resources[1].pattern, r"^/orders/\d+$");
        assert_eq!(config.normalizer.hex_min_len, 12);
        assert_eq!(config.normalizer.opaque_min_len, 16);
        assert_eq!(config.capture_log.clock_skew(), Duration::from_secs(30));
        assert_eq!(config.analyzer.min_samples, 2);
        assert_eq!(config.analyzer.limit, 1000);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let yaml = r#"
resources:
  - name: items
    pattern: /a
  - name: items
    pattern: /b
"#;
        assert!(matches!(
            SpectreConfig::from_yaml_str(yaml),
            Err(SpectreError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_malformed_yaml_rejected() {
        assert!(SpectreConfig::from_yaml_str("resources: [name").is_err());
    }

    #[test]
    fn test_generated_document_loads_as_config() {
        let doc = ConfigDocument {
            project: "auto_generated".into(),
            resources: vec![DeclaredResource {
                name: "products".into(),
                pattern: "/api/products/{id}".into(),
                method: "GET".into(),
                primary_key: None,
            }],
        };
        let yaml = doc.to_yaml().unwrap();
        assert!(!yaml.contains("primary_key"));

        let config = SpectreConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(config.project, "auto_generated");
        assert_eq!(config.resources, doc.resources);
    }
}
