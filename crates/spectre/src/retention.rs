//! Age-based pruning of captures and garbage collection of blobs.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::capture_log::CaptureLog;
use crate::content_store::ContentStore;
use crate::database::Database;
use crate::types::{Digest, SpectreError, SpectreResult};

/// Result of a retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub captures_deleted: u64,
    pub blobs_reclaimed: u64,
}

/// Deletes old captures, then the blobs nothing references anymore.
pub struct RetentionManager {
    db: Arc<Database>,
    log: Arc<CaptureLog>,
    content: Arc<ContentStore>,
    pass: Mutex<()>,
}

impl RetentionManager {
    pub fn new(db: Arc<Database>, log: Arc<CaptureLog>, content: Arc<ContentStore>) -> Self {
        Self {
            db,
            log,
            content,
            pass: Mutex::new(()),
        }
    }

    /// Remove captures older than `older_than_days` and reclaim their blobs.
    pub fn clean(&self, older_than_days: u32) -> SpectreResult<CleanupReport> {
        // Windows reaching past the earliest representable instant keep everything.
        let cutoff = Duration::try_days(i64::from(older_than_days))
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.clean_before(cutoff)
    }

    /// Remove captures with a timestamp before `cutoff`.
    pub fn clean_before(&self, cutoff: DateTime<Utc>) -> SpectreResult<CleanupReport> {
        let _pass = self.lock()?;

        let purged = self.log.delete_older_than(cutoff)?;
        let mut reclaimed = 0;
        for digest in &purged.digests {
            if self.reclaim(digest)? {
                reclaimed += 1;
            }
        }

        let report = CleanupReport {
            captures_deleted: purged.deleted,
            blobs_reclaimed: reclaimed,
        };
        tracing::info!(
            "Retention pass before {cutoff}: {} captures deleted, {} blobs reclaimed",
            report.captures_deleted,
            report.blobs_reclaimed
        );
        Ok(report)
    }

    /// Delete every blob without a referencing capture.
    pub fn sweep_orphans(&self) -> SpectreResult<u64> {
        let _pass = self.lock()?;

        let mut reclaimed = 0;
        for digest in self.content.orphans()? {
            if self.reclaim(&digest)? {
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            tracing::info!("Swept {reclaimed} orphan blobs");
        }
        Ok(reclaimed)
    }

    /// Delete one blob if it is still unreferenced, atomically with the check.
    fn reclaim(&self, digest: &Digest) -> SpectreResult<bool> {
        self.db.write(|tx| {
            if self.log.reference_count_in(tx, digest)? > 0 {
                return Ok(false);
            }
            self.content.delete_in(tx, digest)
        })
    }

    fn lock(&self) -> SpectreResult<std::sync::MutexGuard<'_, ()>> {
        self.pass
            .lock()
            .map_err(|_| SpectreError::StorageFailure("retention lock poisoned".into()))
    }
}
