//! URL path normalization into resource templates.
//!
//! A path segment is either kept verbatim or replaced by [`PLACEHOLDER`].
//! Segments on the static keyword stoplist are always kept. Every other
//! segment runs through an ordered list of [`SegmentRule`]s; the first rule
//! that matches marks it variable. New heuristics are added as rules without
//! touching the clustering that consumes the templates.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use percent_encoding::percent_decode_str;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Token that replaces variable path segments.
pub const PLACEHOLDER: &str = "{id}";

/// Decides whether a single path segment is variable.
pub trait SegmentRule: Send + Sync {
    /// Short identifier used in logs and tests.
    fn name(&self) -> &'static str;

    /// `true` when the segment should be replaced by the placeholder.
    fn is_variable(&self, segment: &str) -> bool;
}

/// All ASCII digits, e.g. `123`.
pub struct NumericRule;

impl SegmentRule for NumericRule {
    fn name(&self) -> &'static str {
        "numeric"
    }

    fn is_variable(&self, segment: &str) -> bool {
        !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
    }
}

/// Canonical 8-4-4-4-12 UUID.
pub struct UuidRule;

impl SegmentRule for UuidRule {
    fn name(&self) -> &'static str {
        "uuid"
    }

    fn is_variable(&self, segment: &str) -> bool {
        static UUID_RE: OnceLock<Regex> = OnceLock::new();
        UUID_RE
            .get_or_init(|| {
                Regex::new(
                    r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$",
                )
                .expect("uuid regex is valid")
            })
            .is_match(segment)
    }
}

/// Hex strings at least `min_len` long, e.g. commit or content hashes.
pub struct HexHashRule {
    pub min_len: usize,
}

impl SegmentRule for HexHashRule {
    fn name(&self) -> &'static str {
        "hex_hash"
    }

    fn is_variable(&self, segment: &str) -> bool {
        segment.len() >= self.min_len && segment.bytes().all(|b| b.is_ascii_hexdigit())
    }
}

/// Long mixed-class tokens with high character entropy (slugs with ids,
/// base62 keys).
pub struct OpaqueTokenRule {
    pub min_len: usize,
    pub min_classes: usize,
    pub min_entropy: f64,
}

impl SegmentRule for OpaqueTokenRule {
    fn name(&self) -> &'static str {
        "opaque_token"
    }

    fn is_variable(&self, segment: &str) -> bool {
        segment.chars().count() >= self.min_len
            && character_classes(segment) >= self.min_classes
            && shannon_entropy(segment) >= self.min_entropy
    }
}

/// Number of distinct classes among lowercase, uppercase and digits.
pub fn character_classes(segment: &str) -> usize {
    let lower = segment.chars().any(|c| c.is_ascii_lowercase());
    let upper = segment.chars().any(|c| c.is_ascii_uppercase());
    let digit = segment.chars().any(|c| c.is_ascii_digit());
    [lower, upper, digit].iter().filter(|&&present| present).count()
}

/// Shannon entropy of the segment in bits per character.
pub fn shannon_entropy(segment: &str) -> f64 {
    let mut counts: HashMap<char, usize> = HashMap::new();
    let mut total = 0usize;
    for c in segment.chars() {
        *counts.entry(c).or_insert(0) += 1;
        total += 1;
    }
    if total == 0 {
        return 0.0;
    }
    let total = total as f64;
    counts
        .values()
        .map(|&n| {
            let p = n as f64 / total;
            -p * p.log2()
        })
        .sum()
}

/// Tunable thresholds for the default rule set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerPolicy {
    /// Segments that are always static (compared case-insensitively).
    pub static_keywords: Vec<String>,
    pub hex_min_len: usize,
    pub opaque_min_len: usize,
    pub opaque_min_classes: usize,
    pub opaque_min_entropy: f64,
}

impl Default for NormalizerPolicy {
    fn default() -> Self {
        Self {
            static_keywords: [
                "api", "v1", "v2", "v3", "v4", "graphql", "rest", "public", "internal", "latest",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            hex_min_len: 8,
            opaque_min_len: 16,
            opaque_min_classes: 2,
            opaque_min_entropy: 3.5,
        }
    }
}

/// Turns raw URLs into path templates.
pub struct UrlNormalizer {
    static_keywords: HashSet<String>,
    rules: Vec<Box<dyn SegmentRule>>,
}

impl Default for UrlNormalizer {
    fn default() -> Self {
        Self::new(&NormalizerPolicy::default())
    }
}

impl UrlNormalizer {
    /// Build the default rule list from a policy.
    pub fn new(policy: &NormalizerPolicy) -> Self {
        let rules: Vec<Box<dyn SegmentRule>> = vec![
            Box::new(NumericRule),
            Box::new(UuidRule),
            Box::new(HexHashRule {
                min_len: policy.hex_min_len,
            }),
            Box::new(OpaqueTokenRule {
                min_len: policy.opaque_min_len,
                min_classes: policy.opaque_min_classes,
                min_entropy: policy.opaque_min_entropy,
            }),
        ];
        Self::with_rules(&policy.static_keywords, rules)
    }

    /// Build a normalizer from an explicit rule list.
    pub fn with_rules(static_keywords: &[String], rules: Vec<Box<dyn SegmentRule>>) -> Self {
        Self {
            static_keywords: static_keywords
                .iter()
                .map(|k| k.to_ascii_lowercase())
                .collect(),
            rules,
        }
    }

    /// Append a rule after the existing ones.
    pub fn with_rule(mut self, rule: Box<dyn SegmentRule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Name of the rule that marks `segment` variable, if any.
    pub fn classify(&self, segment: &str) -> Option<&'static str> {
        if segment == PLACEHOLDER || self.static_keywords.contains(&segment.to_ascii_lowercase()) {
            return None;
        }
        self.rules
            .iter()
            .find(|rule| rule.is_variable(segment))
            .map(|rule| rule.name())
    }

    /// Normalize a raw URL (absolute or path-only) into its template.
    pub fn normalize(&self, raw_url: &str) -> String {
        let path = extract_path(raw_url);
        let segments: Vec<Cow<'_, str>> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(decode_segment)
            .map(|segment| match self.classify(&segment) {
                Some(_) => Cow::Borrowed(PLACEHOLDER),
                None => segment,
            })
            .collect();

        if segments.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", segments.join("/"))
        }
    }
}

/// Percent-decode one path segment.
///
/// Segments that decode to invalid UTF-8 or to a `/` are returned as given so
/// the template keeps the same segment count as the raw URL.
pub fn decode_segment(segment: &str) -> Cow<'_, str> {
    match percent_decode_str(segment).decode_utf8() {
        Ok(decoded) if !decoded.contains('/') => decoded,
        _ => Cow::Borrowed(segment),
    }
}

/// Path component of a URL without query string or fragment. Absolute URLs
/// come back percent-encoded, path-only input comes back as written.
pub fn extract_path(raw_url: &str) -> String {
    let raw_url = raw_url.trim();
    if raw_url.contains("://") {
        if let Ok(parsed) = url::Url::parse(raw_url) {
            return parsed.path().to_string();
        }
    }
    let end = raw_url
        .find(|c: char| c == '?' || c == '#')
        .unwrap_or(raw_url.len());
    raw_url[..end].to_string()
}
