// backuptool/src/backup/retention.rs
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

use crate::errors::{IoResultExt, Result};

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// What one retention pass did. Per-file failures don't abort the pass.
#[derive(Debug, Default)]
pub struct RetentionReport {
    pub deleted: Vec<PathBuf>,
    pub failures: Vec<(PathBuf, io::Error)>,
}

impl RetentionReport {
    pub fn deleted_count(&self) -> usize {
        self.deleted.len()
    }
}

/// Deletes regular files directly inside `dir` older than `keep_days`.
pub fn enforce(dir: &Path, keep_days: i64) -> Result<RetentionReport> {
    enforce_at(dir, keep_days, SystemTime::now())
}

/// Same as [`enforce`] with an explicit clock. Files whose mtime is strictly
/// before `now - keep_days` go; subdirectories are never touched.
pub fn enforce_at(dir: &Path, keep_days: i64, now: SystemTime) -> Result<RetentionReport> {
    let mut report = RetentionReport::default();
    if keep_days <= 0 {
        debug!(dir = %dir.display(), keep_days, "retention disabled");
        return Ok(report);
    }
    if !dir.is_dir() {
        return Ok(report);
    }

    let window = Duration::from_secs((keep_days as u64).saturating_mul(SECONDS_PER_DAY));
    let Some(cutoff) = now.checked_sub(window) else {
        return Ok(report);
    };

    for entry in fs::read_dir(dir).at(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                report.failures.push((dir.to_path_buf(), e));
                continue;
            }
        };
        let path = entry.path();

        // `DirEntry::file_type` does not follow symlinks.
        match entry.file_type() {
            Ok(kind) if kind.is_file() => {}
            Ok(_) => continue,
            Err(e) => {
                report.failures.push((path, e));
                continue;
            }
        }

        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => {
                report.failures.push((path, e));
                continue;
            }
        };
        if modified >= cutoff {
            continue;
        }

        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "deleted expired backup");
                report.deleted.push(path);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => report.failures.push((path, e)),
        }
    }

    info!(
        dir = %dir.display(),
        keep_days,
        deleted = report.deleted_count(),
        failed = report.failures.len(),
        "retention pass finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    const DAY: Duration = Duration::from_secs(SECONDS_PER_DAY);

    fn write_aged(
        dir: &Path,
        name: &str,
        now: SystemTime,
        age: Duration,
    ) -> anyhow::Result<PathBuf> {
        let path = dir.join(name);
        fs::write(&path, name.as_bytes())?;
        File::options().write(true).open(&path)?.set_modified(now - age)?;
        Ok(path)
    }

    #[test]
    fn test_only_files_past_the_window_are_deleted() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let now = SystemTime::now();
        let fresh = write_aged(dir.path(), "full_backup_1d.zip", now, DAY)?;
        let middle = write_aged(dir.path(), "full_backup_15d.zip", now, 15 * DAY)?;
        let old = write_aged(dir.path(), "full_backup_40d.zip", now, 40 * DAY)?;

        let report = enforce_at(dir.path(), 30, now)?;
        assert_eq!(report.deleted, vec![old.clone()]);
        assert!(report.failures.is_empty());
        assert!(fresh.exists());
        assert!(middle.exists());
        assert!(!old.exists());

        let report = enforce_at(dir.path(), 14, now)?;
        assert_eq!(report.deleted, vec![middle.clone()]);
        assert!(fresh.exists());
        Ok(())
    }

    #[test]
    fn test_non_positive_keep_days_deletes_nothing() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let now = SystemTime::now();
        let old = write_aged(dir.path(), "ancient.sql.gz", now, 400 * DAY)?;

        for keep in [0, -5] {
            assert_eq!(enforce_at(dir.path(), keep, now)?.deleted_count(), 0);
        }
        assert!(old.exists());
        Ok(())
    }

    #[test]
    fn test_subdirectories_are_left_alone() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let now = SystemTime::now();
        let nested = dir.path().join("tmp_inflight");
        fs::create_dir_all(&nested)?;
        let inner = write_aged(&nested, "old.zip", now, 90 * DAY)?;

        let report = enforce_at(dir.path(), 1, now)?;
        assert_eq!(report.deleted_count(), 0);
        assert!(inner.exists());
        Ok(())
    }

    #[test]
    fn test_missing_directory_is_empty_report() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let report = enforce(&dir.path().join("never-created"), 14)?;
        assert_eq!(report.deleted_count(), 0);
        Ok(())
    }
}
