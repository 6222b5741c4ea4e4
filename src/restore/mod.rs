pub mod db_restore;
mod logic;

use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::config::AppConfig;
use crate::utils::process::SystemProcessRunner;

pub use db_restore::RestoreEngine;
pub use logic::{LATEST, resolve_backup_file, restore_from_file};

/// Public entry point for the restore process. Returns the file restored from.
pub fn run_restore_flow(
    app_config: &AppConfig,
    requested: &str,
    connection_name: Option<&str>,
    force: bool,
) -> Result<PathBuf> {
    let connection = app_config.connection(connection_name)?;
    let backup_file = resolve_backup_file(&app_config.settings, requested)?;

    let runner = SystemProcessRunner;
    let engine = RestoreEngine::new(&runner, &app_config.tools);
    restore_from_file(&engine, connection, &backup_file, force).with_context(|| {
        format!(
            "Restore of connection '{}' from {} failed",
            connection.name,
            backup_file.display()
        )
    })?;
    Ok(backup_file)
}
