pub mod archive;
pub mod compress;
pub mod db_dump;
mod logic;
pub mod offsite;
pub mod retention;

use anyhow::Context;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::AppConfig;
use crate::errors::{IoResultExt, Result};
use crate::utils::lock::FileLock;
use crate::utils::process::SystemProcessRunner;
use crate::utils::schedule::JsonFileStateStore;

pub use logic::{BackupOrchestrator, FullBackupOptions, RunOutcome, Stage};

/// File name prefix of full bundles in `backups/full`.
pub const FULL_BUNDLE_PREFIX: &str = "full_backup_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    DbDump,
    FullBundle,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::DbDump => "db-dump",
            ArtifactKind::FullBundle => "full-bundle",
        }
    }

    /// Whether a file name in this kind's directory looks like one of ours.
    pub fn matches(&self, file_name: &str) -> bool {
        match self {
            ArtifactKind::DbDump => file_name.ends_with(".gz"),
            ArtifactKind::FullBundle => {
                file_name.starts_with(FULL_BUNDLE_PREFIX) && file_name.ends_with(".zip")
            }
        }
    }
}

/// A finished file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArtifact {
    pub path: PathBuf,
    pub kind: ArtifactKind,
    pub created_at: DateTime<Utc>,
    pub size: u64,
}

impl BackupArtifact {
    pub fn from_path(path: impl Into<PathBuf>, kind: ArtifactKind) -> Result<Self> {
        let path = path.into();
        let metadata = fs::metadata(&path).at(&path)?;
        let created_at = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(BackupArtifact {
            path,
            kind,
            created_at,
            size: metadata.len(),
        })
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Artifacts of `kind` directly inside `dir`, newest first. A missing
/// directory lists as empty.
pub fn list_artifacts(dir: &Path, kind: ArtifactKind) -> Result<Vec<BackupArtifact>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut artifacts = Vec::new();
    for entry in fs::read_dir(dir).at(dir)? {
        let entry = entry.at(dir)?;
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_file() || !kind.matches(&entry.file_name().to_string_lossy()) {
            continue;
        }
        // Files can vanish under a concurrent retention pass.
        if let Ok(artifact) = BackupArtifact::from_path(entry.path(), kind) {
            artifacts.push(artifact);
        }
    }

    // Timestamped names sort chronologically; the name breaks mtime ties.
    artifacts.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.path.cmp(&a.path))
    });
    Ok(artifacts)
}

pub fn latest_artifact(dir: &Path, kind: ArtifactKind) -> Result<Option<BackupArtifact>> {
    Ok(list_artifacts(dir, kind)?.into_iter().next())
}

/// Full-backup entry point: schedule check, lock, dump, bundle, retention,
/// offsite. Runs against the default connection.
pub fn run_full_backup_flow(
    app_config: &AppConfig,
    options: FullBackupOptions,
) -> anyhow::Result<RunOutcome> {
    let connection = app_config.connection(None)?;
    let runner = SystemProcessRunner;
    let lock = FileLock::new(&app_config.lock_dir);
    let state = JsonFileStateStore::new(&app_config.state_file);

    let orchestrator = BackupOrchestrator::new(
        &app_config.settings,
        &app_config.tools,
        &runner,
        &lock,
        &state,
    );
    orchestrator
        .run_full(connection, &options)
        .context("Full backup failed")
}

/// DB-only entry point. Never consults or updates the schedule.
pub fn run_db_backup_flow(
    app_config: &AppConfig,
    connection_name: Option<&str>,
    keep_days: Option<i64>,
) -> anyhow::Result<RunOutcome> {
    let connection = app_config.connection(connection_name)?;
    let runner = SystemProcessRunner;
    let lock = FileLock::new(&app_config.lock_dir);
    let state = JsonFileStateStore::new(&app_config.state_file);

    let orchestrator = BackupOrchestrator::new(
        &app_config.settings,
        &app_config.tools,
        &runner,
        &lock,
        &state,
    );
    orchestrator
        .run_db_only(connection, keep_days)
        .with_context(|| format!("Database backup of connection '{}' failed", connection.name))
}
