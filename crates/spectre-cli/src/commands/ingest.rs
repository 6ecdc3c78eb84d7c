use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::Context;
use spectre::{IngestOutcome, IngestSummary, Spectre};

use super::Output;
use crate::events::{default_session_id, EventReader};

/// Ingest JSON Lines events from `file`, or stdin when absent.
pub fn ingest(
    spectre: &Spectre,
    file: Option<&Path>,
    session: Option<String>,
    out: Output,
) -> anyhow::Result<()> {
    let session = session.unwrap_or_else(default_session_id);
    let input: Box<dyn BufRead> = match file {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(std::io::stdin())),
    };

    let mut reader = EventReader::new(input, session.as_str());
    let mut summary = IngestSummary::default();
    while let Some(event) = reader.next_event()? {
        match spectre.ingestor().ingest(event)? {
            IngestOutcome::Stored(_) => summary.stored += 1,
            IngestOutcome::Dropped(_) => summary.dropped += 1,
        }
    }
    summary.dropped += reader.skipped;

    tracing::info!(
        "Session {session}: {} stored, {} dropped",
        summary.stored,
        summary.dropped
    );
    out.emit(&summary, |s| {
        println!("Stored {} captures, dropped {}", s.stored, s.dropped);
    })
}
