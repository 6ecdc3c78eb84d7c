//! Persisted resource definitions and the captures they match.

use std::sync::Arc;

use chrono::Utc;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use regex::Regex;
use rusqlite::{Row, Transaction};

use crate::capture_log::{CaptureLog, CaptureQuery};
use crate::config::DeclaredResource;
use crate::database::Database;
use crate::normalizer::decode_segment;
use crate::types::{
    from_millis, to_millis, Capture, Resource, ResourceSource, SpectreError, SpectreResult,
};

const RESOURCE_COLUMNS: &str =
    "name, pattern, method, source, sample_count, primary_key, created_at, updated_at";

/// Compile a resource pattern into a matcher for raw capture URLs.
///
/// Patterns starting with `^` are used as regexes verbatim. Anything else is a
/// path template: `{...}` segments match exactly one path segment and all
/// other segments match literally, spelled as written or percent-encoded.
/// The compiled template accepts an optional scheme and host, an optional
/// trailing slash and an optional query string.
pub fn compile_pattern(pattern: &str) -> SpectreResult<Regex> {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return Err(SpectreError::InvalidInput("pattern is empty".into()));
    }

    let source = if pattern.starts_with('^') {
        pattern.to_string()
    } else {
        let mut path = String::new();
        for segment in pattern.split('/').filter(|s| !s.is_empty()) {
            path.push('/');
            if is_placeholder(segment) {
                path.push_str("[^/?#]+");
            } else {
                path.push_str(&static_segment(segment));
            }
        }
        format!(r"^(?:[a-zA-Z][a-zA-Z0-9+.\-]*://[^/?#]+)?{path}/?(?:[?#].*)?$")
    };

    Regex::new(&source)
        .map_err(|e| SpectreError::InvalidInput(format!("invalid pattern {pattern:?}: {e}")))
}

/// Characters escaped in a path segment, as `url` encodes them.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Regex for a literal segment accepting its decoded and percent-encoded
/// spellings. Hex digits of escapes match in either case.
fn static_segment(segment: &str) -> String {
    let decoded = decode_segment(segment);
    let encoded = utf8_percent_encode(&decoded, SEGMENT).to_string();
    if encoded == decoded {
        return regex::escape(&decoded);
    }

    let mut alternative = String::with_capacity(encoded.len() * 2);
    let mut rest = encoded.as_str();
    while let Some(pos) = rest.find('%') {
        alternative.push_str(&regex::escape(&rest[..pos]));
        let escape = rest.get(pos..pos + 3).unwrap_or(&rest[pos..]);
        alternative.push_str(&format!("(?i:{})", regex::escape(escape)));
        rest = &rest[pos + escape.len()..];
    }
    alternative.push_str(&regex::escape(rest));

    format!("(?:{}|{alternative})", regex::escape(&decoded))
}

fn is_placeholder(segment: &str) -> bool {
    segment.len() > 2
        && segment.starts_with('{')
        && segment.ends_with('}')
        && !segment[1..segment.len() - 1].contains(|c: char| c == '{' || c == '}')
}

fn validate(resource: &Resource) -> SpectreResult<()> {
    let name = resource.name.trim();
    if name.is_empty() || name.contains(char::is_whitespace) || name.contains('/') {
        return Err(SpectreError::InvalidInput(format!(
            "resource name {:?} must be non-empty without spaces or slashes",
            resource.name
        )));
    }
    if resource.method.is_empty()
        || !resource
            .method
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(SpectreError::InvalidInput(format!(
            "resource method {:?} is not an HTTP method",
            resource.method
        )));
    }
    compile_pattern(&resource.pattern)?;
    Ok(())
}

/// Storage of named resources.
pub struct ResourceStore {
    db: Arc<Database>,
    log: Arc<CaptureLog>,
}

impl ResourceStore {
    pub fn new(db: Arc<Database>, log: Arc<CaptureLog>) -> Self {
        Self { db, log }
    }

    /// Insert or replace a resource by name. `created_at` of an existing row
    /// is kept.
    pub fn upsert(&self, resource: &Resource) -> SpectreResult<()> {
        let mut resource = resource.clone();
        resource.method = resource.method.to_ascii_uppercase();
        validate(&resource)?;
        self.db.write(|tx| upsert_in(tx, &resource))
    }

    pub fn get(&self, name: &str) -> SpectreResult<Resource> {
        let conn = self.db.read()?;
        let sql = format!("SELECT {RESOURCE_COLUMNS} FROM resources WHERE name = ?1");
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(rusqlite::params![name])?;
        let resource = match rows.next()? {
            Some(row) => resource_from_row(row)?,
            None => return Err(SpectreError::NotFound(format!("resource {name:?}"))),
        };
        Ok(resource)
    }

    /// All resources ordered by name.
    pub fn list(&self) -> SpectreResult<Vec<Resource>> {
        let conn = self.db.read()?;
        let sql = format!("SELECT {RESOURCE_COLUMNS} FROM resources ORDER BY name");
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(resource_from_row(row)?);
        }
        Ok(out)
    }

    /// Delete a resource. This is the only way a resource goes away.
    pub fn remove(&self, name: &str) -> SpectreResult<Resource> {
        let existing = self.get(name)?;
        self.db.write(|tx| {
            tx.execute(
                "DELETE FROM resources WHERE name = ?1",
                rusqlite::params![name],
            )?;
            Ok(())
        })?;
        tracing::info!("Removed resource {name:?}");
        Ok(existing)
    }

    /// Captures matching the resource pattern and method, oldest first.
    pub fn matching_captures(
        &self,
        resource: &Resource,
        limit: usize,
    ) -> SpectreResult<Vec<Capture>> {
        self.log.query(&self.capture_query(resource, limit)?)
    }

    /// Matching captures newest first, for timelines.
    pub fn history(
        &self,
        resource: &Resource,
        offset: usize,
        limit: usize,
    ) -> SpectreResult<Vec<Capture>> {
        let query = self
            .capture_query(resource, limit)?
            .offset(offset)
            .newest_first();
        self.log.query(&query)
    }

    /// Most recent capture of a resource.
    pub fn latest_capture(&self, resource: &Resource) -> SpectreResult<Capture> {
        self.history(resource, 0, 1)?
            .into_iter()
            .next()
            .ok_or_else(|| SpectreError::NotFound(format!("captures for {:?}", resource.name)))
    }

    fn capture_query(&self, resource: &Resource, limit: usize) -> SpectreResult<CaptureQuery> {
        Ok(CaptureQuery::new(limit)
            .url_pattern(compile_pattern(&resource.pattern)?)
            .method(resource.method.clone()))
    }

    /// Apply declared resources from configuration. Declared definitions
    /// replace same-name resources, inferred or not.
    pub fn load_declared(&self, declared: &[DeclaredResource]) -> SpectreResult<Vec<Resource>> {
        let now = Utc::now();
        let mut applied = Vec::with_capacity(declared.len());

        for decl in declared {
            let resource = Resource {
                name: decl.name.clone(),
                pattern: decl.pattern.clone(),
                method: decl.method.to_ascii_uppercase(),
                source: ResourceSource::Declared,
                sample_count: 0,
                primary_key: decl.primary_key.clone(),
                created_at: now,
                updated_at: now,
            };
            validate(&resource)?;

            match self.get(&resource.name) {
                Ok(existing)
                    if existing.source == ResourceSource::Declared
                        && existing.pattern == resource.pattern
                        && existing.method == resource.method
                        && existing.primary_key == resource.primary_key =>
                {
                    applied.push(existing);
                    continue;
                }
                Ok(existing) => {
                    tracing::info!(
                        "Declared resource {:?} replaces {} definition {:?}",
                        resource.name,
                        existing.source.as_str(),
                        existing.pattern
                    );
                }
                Err(SpectreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }

            self.db.write(|tx| upsert_in(tx, &resource))?;
            applied.push(self.get(&resource.name)?);
        }

        if !applied.is_empty() {
            tracing::debug!("Loaded {} declared resources", applied.len());
        }
        Ok(applied)
    }

    /// Persist an inferred resource.
    ///
    /// Fails with `Conflict` when the name exists with another pattern or
    /// method. An identical pattern and method refreshes the sample count of
    /// inferred resources and leaves declared ones untouched.
    pub(crate) fn commit_inferred(&self, resource: &Resource) -> SpectreResult<Resource> {
        validate(resource)?;

        if self.matching_captures(resource, 1)?.is_empty() {
            return Err(SpectreError::InvalidInput(format!(
                "pattern {:?} of {:?} matches no capture",
                resource.pattern, resource.name
            )));
        }

        let stored = self.db.write(|tx| {
            let existing = get_in(tx, &resource.name)?;
            match existing {
                Some(existing)
                    if existing.pattern != resource.pattern
                        || existing.method != resource.method =>
                {
                    Err(SpectreError::Conflict(format!(
                        "resource {:?} already exists as {} {:?} (new {} {:?})",
                        resource.name,
                        existing.method,
                        existing.pattern,
                        resource.method,
                        resource.pattern
                    )))
                }
                Some(existing) if existing.source == ResourceSource::Declared => Ok(existing),
                Some(mut existing) => {
                    existing.sample_count = resource.sample_count;
                    existing.updated_at = resource.updated_at;
                    if resource.primary_key.is_some() {
                        existing.primary_key = resource.primary_key.clone();
                    }
                    upsert_in(tx, &existing)?;
                    Ok(existing)
                }
                None => {
                    upsert_in(tx, resource)?;
                    Ok(resource.clone())
                }
            }
        })?;

        tracing::debug!("Committed resource {:?} -> {}", stored.name, stored.pattern);
        Ok(stored)
    }
}

fn get_in(tx: &Transaction<'_>, name: &str) -> SpectreResult<Option<Resource>> {
    let sql = format!("SELECT {RESOURCE_COLUMNS} FROM resources WHERE name = ?1");
    let mut stmt = tx.prepare(&sql)?;
    let mut rows = stmt.query(rusqlite::params![name])?;
    let resource = match rows.next()? {
        Some(row) => Some(resource_from_row(row)?),
        None => None,
    };
    Ok(resource)
}

fn upsert_in(tx: &Transaction<'_>, resource: &Resource) -> SpectreResult<()> {
    tx.execute(
        "INSERT INTO resources
            (name, pattern, method, source, sample_count, primary_key, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(name) DO UPDATE SET
            pattern = excluded.pattern,
            method = excluded.method,
            source = excluded.source,
            sample_count = excluded.sample_count,
            primary_key = excluded.primary_key,
            updated_at = excluded.updated_at",
        rusqlite::params![
            resource.name,
            resource.pattern,
            resource.method,
            resource.source.as_str(),
            resource.sample_count as i64,
            resource.primary_key,
            to_millis(resource.created_at),
            to_millis(resource.updated_at),
        ],
    )?;
    Ok(())
}

fn resource_from_row(row: &Row<'_>) -> SpectreResult<Resource> {
    let source: String = row.get(3)?;
    let sample_count: i64 = row.get(4)?;
    Ok(Resource {
        name: row.get(0)?,
        pattern: row.get(1)?,
        method: row.get(2)?,
        source: ResourceSource::parse(&source)?,
        sample_count: sample_count.max(0) as u64,
        primary_key: row.get(5)?,
        created_at: from_millis(row.get(6)?)?,
        updated_at: from_millis(row.get(7)?)?,
    })
}
