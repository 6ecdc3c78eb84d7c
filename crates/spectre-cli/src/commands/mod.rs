//! Operator commands. Each takes an opened [`Spectre`] and prints its result.

mod analyze;
mod ingest;
mod resources;

pub use analyze::{analyze, AnalyzeArgs};
pub use ingest::ingest;
pub use resources::{resources, ResourcesAction};

use std::io::Write;

use serde::Serialize;
use spectre::{Digest, Spectre};

/// Human-readable or JSON output.
#[derive(Debug, Clone, Copy)]
pub struct Output {
    pub json: bool,
}

impl Output {
    /// Print `value` as JSON, or run `human` to print it for people.
    pub fn emit<T: Serialize>(&self, value: &T, human: impl FnOnce(&T)) -> anyhow::Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            human(value);
        }
        Ok(())
    }
}

pub fn init(spectre: &Spectre, out: Output) -> anyhow::Result<()> {
    let summary = serde_json::json!({
        "database": spectre.database_path().display().to_string(),
        "declared_resources": spectre.config().resources.len(),
    });
    out.emit(&summary, |_| {
        println!("Initialized database at {}", spectre.database_path().display());
        println!("  Declared resources: {}", spectre.config().resources.len());
    })
}

pub fn info(spectre: &Spectre, out: Output) -> anyhow::Result<()> {
    let sessions = spectre.captures().sessions()?;
    let info = serde_json::json!({
        "project": spectre.config().project,
        "database": spectre.database_path().display().to_string(),
        "captures": spectre.captures().len()?,
        "blobs": spectre.content().len()?,
        "resources": spectre.resources().list()?.len(),
        "sessions": sessions.len(),
        "normalizer_rules": spectre.normalizer().rule_names(),
    });
    out.emit(&info, |info| {
        println!("Project:   {}", info["project"].as_str().unwrap_or_default());
        println!("Database:  {}", info["database"].as_str().unwrap_or_default());
        println!("Captures:  {}", info["captures"]);
        println!("Blobs:     {}", info["blobs"]);
        println!("Resources: {}", info["resources"]);
        println!("Sessions:  {}", info["sessions"]);
        for (session, count) in sessions.iter().take(10) {
            println!("  {session}: {count} captures");
        }
    })
}

/// Write a stored body to stdout, unchanged.
pub fn blob(spectre: &Spectre, digest: &str) -> anyhow::Result<()> {
    let digest = Digest::parse(digest)?;
    let bytes = spectre.content().get(&digest)?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&bytes)?;
    stdout.write_all(b"\n")?;
    Ok(())
}

pub fn clean(
    spectre: &Spectre,
    older_than_days: u32,
    sweep: bool,
    out: Output,
) -> anyhow::Result<()> {
    let report = spectre.retention().clean(older_than_days)?;
    let swept = if sweep {
        spectre.retention().sweep_orphans()?
    } else {
        0
    };
    let result = serde_json::json!({
        "captures_deleted": report.captures_deleted,
        "blobs_reclaimed": report.blobs_reclaimed + swept,
    });
    out.emit(&result, |_| {
        println!(
            "Deleted {} captures older than {older_than_days} days",
            report.captures_deleted
        );
        println!("Reclaimed {} blobs", report.blobs_reclaimed + swept);
    })
}
