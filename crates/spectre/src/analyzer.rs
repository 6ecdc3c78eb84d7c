//! Resource discovery over normalized capture templates.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::capture_log::CaptureLog;
use crate::config::{ConfigDocument, DeclaredResource};
use crate::content_store::ContentStore;
use crate::normalizer::PLACEHOLDER;
use crate::resource_store::ResourceStore;
use crate::types::{Resource, ResourceSource, SpectreResult, TemplateCount};

/// Project name written into generated configuration documents.
pub const GENERATED_PROJECT: &str = "auto_generated";

/// JSON fields tried, in order, when guessing a primary key.
const PRIMARY_KEY_FIELDS: [&str; 6] = ["id", "uuid", "slug", "_id", "uid", "code"];

/// A proposed resource, not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCandidate {
    pub template: String,
    pub method: String,
    pub sample_count: u64,
    pub suggested_name: String,
    pub primary_key: Option<String>,
}

impl ResourceCandidate {
    fn to_resource(&self) -> Resource {
        let now = Utc::now();
        Resource {
            name: self.suggested_name.clone(),
            pattern: self.template.clone(),
            method: self.method.clone(),
            source: ResourceSource::Inferred,
            sample_count: self.sample_count,
            primary_key: self.primary_key.clone(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Clusters capture templates into resource candidates.
pub struct ResourceAnalyzer {
    log: Arc<CaptureLog>,
    content: Arc<ContentStore>,
    store: Arc<ResourceStore>,
    min_samples: u64,
}

impl ResourceAnalyzer {
    pub fn new(
        log: Arc<CaptureLog>,
        content: Arc<ContentStore>,
        store: Arc<ResourceStore>,
        min_samples: u64,
    ) -> Self {
        Self {
            log,
            content,
            store,
            min_samples: min_samples.max(1),
        }
    }

    /// Rank up to `limit` distinct templates as candidates.
    pub fn analyze(&self, limit: usize) -> SpectreResult<Vec<ResourceCandidate>> {
        let mut counts: Vec<TemplateCount> = self
            .log
            .distinct_normalized_urls(limit)?
            .into_iter()
            .filter(|t| t.count >= self.min_samples)
            .collect();
        counts.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.normalized_url.cmp(&b.normalized_url))
                .then_with(|| a.method.cmp(&b.method))
        });

        // Stored names are reserved; a template that already has a resource
        // keeps its name across runs.
        let mut taken = HashSet::new();
        let mut known: HashMap<(String, String), String> = HashMap::new();
        for resource in self.store.list()? {
            taken.insert(resource.name.clone());
            known
                .entry((resource.pattern, resource.method))
                .or_insert(resource.name);
        }

        let mut candidates = Vec::with_capacity(counts.len());
        for template in counts {
            let key = (template.normalized_url.clone(), template.method.clone());
            let name = match known.get(&key) {
                Some(name) => name.clone(),
                None => {
                    let base = base_name(&template.normalized_url);
                    unique_name(&base, &template.method, &mut taken)
                }
            };
            let primary_key = self.detect_primary_key(&template.normalized_url, &template.method);
            candidates.push(ResourceCandidate {
                template: template.normalized_url,
                method: template.method,
                sample_count: template.count,
                suggested_name: name,
                primary_key,
            });
        }

        tracing::info!("Analysis produced {} resource candidates", candidates.len());
        Ok(candidates)
    }

    fn detect_primary_key(&self, template: &str, method: &str) -> Option<String> {
        let mut key = template
            .split('/')
            .any(|s| s == PLACEHOLDER)
            .then(|| "id".to_string());

        let sample = match self.log.latest_blob_for(template, method) {
            Ok(Some(digest)) => self.content.get_json(&digest),
            Ok(None) => return key,
            Err(e) => Err(e),
        };
        match sample {
            Ok(body) => {
                if let Some(found) = primary_key_in(&body) {
                    key = Some(found.to_string());
                }
            }
            Err(e) => {
                tracing::warn!("Failed to inspect sample body for {method} {template}: {e}");
            }
        }
        key
    }

    /// Build a configuration document from candidates. Pure.
    pub fn generate_config(&self, candidates: &[ResourceCandidate]) -> ConfigDocument {
        generate_config(candidates)
    }

    /// Persist candidates as inferred resources, one transaction each.
    ///
    /// Stops at the first error; candidates committed before it stay.
    pub fn commit(&self, candidates: &[ResourceCandidate]) -> SpectreResult<Vec<Resource>> {
        let mut committed = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            committed.push(self.store.commit_inferred(&candidate.to_resource())?);
        }
        tracing::info!("Committed {} resources", committed.len());
        Ok(committed)
    }
}

/// Configuration document for `candidates`, in order.
pub fn generate_config(candidates: &[ResourceCandidate]) -> ConfigDocument {
    ConfigDocument {
        project: GENERATED_PROJECT.to_string(),
        resources: candidates
            .iter()
            .map(|c| DeclaredResource {
                name: c.suggested_name.clone(),
                pattern: c.template.clone(),
                method: c.method.clone(),
                primary_key: c.primary_key.clone(),
            })
            .collect(),
    }
}

/// Name derived from the last static segment of a template.
pub fn base_name(template: &str) -> String {
    template
        .split('/')
        .filter(|s| !s.is_empty() && !(s.starts_with('{') && s.ends_with('}')))
        .map(|s| {
            s.chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .collect::<String>()
                .to_ascii_lowercase()
        })
        .filter(|s| !s.is_empty())
        .last()
        .unwrap_or_else(|| "resource".to_string())
}

fn unique_name(base: &str, method: &str, taken: &mut HashSet<String>) -> String {
    if taken.insert(base.to_string()) {
        return base.to_string();
    }
    let with_method = format!("{base}_{}", method.to_ascii_lowercase());
    if taken.insert(with_method.clone()) {
        return with_method;
    }
    let mut n = 1;
    loop {
        let candidate = format!("{base}_{n}");
        if taken.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

/// First well-known key field in a JSON object, or in the first element of
/// its `data` array.
pub fn primary_key_in(body: &serde_json::Value) -> Option<&'static str> {
    let object = body.as_object()?;
    let top = PRIMARY_KEY_FIELDS
        .iter()
        .copied()
        .find(|field| object.contains_key(*field));

    let nested = object
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|items| items.first())
        .and_then(|item| item.as_object())
        .and_then(|item| {
            PRIMARY_KEY_FIELDS
                .iter()
                .copied()
                .find(|field| item.contains_key(*field))
        });

    nested.or(top)
}
