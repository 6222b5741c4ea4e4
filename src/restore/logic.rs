// backuptool/src/restore/logic.rs
use std::path::{Path, PathBuf};
use tracing::info;

use crate::backup::archive::{BUNDLE_DB_DIR, extract_member};
use crate::backup::{ArtifactKind, latest_artifact};
use crate::config::{BackupSettings, ConnectionConfig};
use crate::errors::{BackupError, IoResultExt, Result};
use crate::restore::db_restore::{RestoreEngine, require_force};
use crate::utils::{FileFormat, sniff_format};

/// Argument value that picks the newest local backup.
pub const LATEST: &str = "latest";

/// Turns the user's argument into a file. `latest` prefers the newest
/// DB-only dump and falls back to the newest full bundle.
pub fn resolve_backup_file(settings: &BackupSettings, requested: &str) -> Result<PathBuf> {
    if !requested.trim().eq_ignore_ascii_case(LATEST) {
        return Ok(PathBuf::from(requested));
    }

    let newest = match latest_artifact(&settings.db_dir(), ArtifactKind::DbDump)? {
        Some(artifact) => Some(artifact),
        None => latest_artifact(&settings.full_dir(), ArtifactKind::FullBundle)?,
    };
    newest.map(|artifact| artifact.path).ok_or_else(|| {
        BackupError::Config(format!(
            "no backups found under {}",
            settings.backup_root.display()
        ))
    })
}

/// Restores from a plain dump, a gzipped dump or a full bundle. Bundles
/// have their `db/` member extracted to a scratch directory first.
pub fn restore_from_file(
    engine: &RestoreEngine<'_>,
    connection: &ConnectionConfig,
    backup_file: &Path,
    force: bool,
) -> Result<()> {
    require_force(force)?;

    if sniff_format(backup_file)? != FileFormat::Zip {
        return engine.restore(connection, backup_file, force);
    }

    info!(bundle = %backup_file.display(), "extracting database dump from bundle");
    let scratch = tempfile::Builder::new()
        .prefix("tmp_restore_")
        .tempdir()
        .at(std::env::temp_dir())?;
    let member = extract_member(backup_file, BUNDLE_DB_DIR, scratch.path())?.ok_or_else(|| {
        BackupError::Config(format!(
            "bundle {} has no {}/ entry",
            backup_file.display(),
            BUNDLE_DB_DIR
        ))
    })?;
    engine.restore(connection, &member, force)
}
