use std::path::Path;
use std::time::{Duration, SystemTime};

use super::ContentCache;
use crate::error::{AppError, Result};

/// Temp files older than this belong to a write that never finished.
const STALE_TEMP_AGE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub scanned: usize,
    pub deleted: usize,
    pub errors: usize,
}

impl ContentCache {
    /// Delete cache entries whose modification time is older than `max_age`.
    ///
    /// Only files with the cache extension inside a user partition are
    /// considered, plus temp files abandoned by interrupted writes once they
    /// are older than an hour (or `max_age`, if shorter). Anything in the
    /// root itself is left alone. A failure on one file is logged and
    /// counted, the scan carries on.
    pub async fn cleanup(&self, max_age: Duration) -> Result<CleanupReport> {
        let cache = self.clone();
        let report = tokio::task::spawn_blocking(move || cache.cleanup_at(SystemTime::now(), max_age))
            .await
            .map_err(|e| AppError::Internal(format!("cache cleanup task failed: {e}")))??;

        tracing::info!(
            scanned = report.scanned,
            deleted = report.deleted,
            errors = report.errors,
            "Cache cleanup finished"
        );
        Ok(report)
    }

    pub(crate) fn cleanup_at(&self, now: SystemTime, max_age: Duration) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();

        let partitions = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(e.into()),
        };

        for partition in partitions {
            let partition = match partition {
                Ok(entry) => entry.path(),
                Err(e) => {
                    tracing::warn!("Failed to read cache root entry: {}", e);
                    report.errors += 1;
                    continue;
                }
            };
            if !partition.is_dir() {
                continue;
            }
            self.cleanup_partition(&partition, now, max_age, &mut report);
        }

        Ok(report)
    }

    fn cleanup_partition(
        &self,
        partition: &Path,
        now: SystemTime,
        max_age: Duration,
        report: &mut CleanupReport,
    ) {
        let entries = match std::fs::read_dir(partition) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Failed to scan cache partition {:?}: {}", partition, e);
                report.errors += 1;
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let max_age = if self.article_id_of(&path).is_some() {
                max_age
            } else if Self::is_temp_file(&path) {
                max_age.min(STALE_TEMP_AGE)
            } else {
                continue;
            };
            report.scanned += 1;

            let modified = match entry.metadata().and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    tracing::warn!("Failed to stat {:?}: {}", path, e);
                    report.errors += 1;
                    continue;
                }
            };
            // mtimes in the future count as fresh
            let age = now.duration_since(modified).unwrap_or_default();
            if age <= max_age {
                continue;
            }

            match std::fs::remove_file(&path) {
                Ok(()) => report.deleted += 1,
                // lost a race with another delete; nothing left to do
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!("Failed to delete {:?}: {}", path, e);
                    report.errors += 1;
                }
            }
        }
    }
}
