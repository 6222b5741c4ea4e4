// backuptool/src/restore/db_restore.rs
use flate2::read::MultiGzDecoder;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::backup::compress::{CHUNK_SIZE, copy_in_chunks, open_maybe_gzip};
use crate::backup::db_dump::{require_server_identity, with_password};
use crate::config::{ConnectionConfig, Driver, Tool, ToolPaths};
use crate::errors::{BackupError, IoResultExt, Result};
use crate::utils::process::{Invocation, ProcessRunner, StdoutTarget};
use crate::utils::{FileFormat, sniff_format};

/// Restores a database from a dump file. Destructive, so nothing happens
/// without `force`.
pub struct RestoreEngine<'a> {
    runner: &'a dyn ProcessRunner,
    tools: &'a ToolPaths,
}

impl<'a> RestoreEngine<'a> {
    pub fn new(runner: &'a dyn ProcessRunner, tools: &'a ToolPaths) -> Self {
        RestoreEngine { runner, tools }
    }

    pub fn restore(
        &self,
        connection: &ConnectionConfig,
        backup_file: &Path,
        force: bool,
    ) -> Result<()> {
        require_force(force)?;
        if !backup_file.is_file() {
            return Err(BackupError::io(
                backup_file,
                std::io::Error::new(std::io::ErrorKind::NotFound, "backup file not found"),
            ));
        }

        let driver = connection.driver()?;
        info!(connection = %connection.name, driver = %driver, file = %backup_file.display(), "restoring database");
        match driver {
            Driver::Mysql => self.restore_with_client(connection, Driver::Mysql, backup_file)?,
            Driver::Pgsql => self.restore_with_client(connection, Driver::Pgsql, backup_file)?,
            Driver::Sqlite => replace_sqlite_file(connection, backup_file)?,
        }
        info!(connection = %connection.name, "restore finished");
        Ok(())
    }

    fn client_invocation(
        &self,
        connection: &ConnectionConfig,
        driver: Driver,
    ) -> Result<Invocation> {
        require_server_identity(connection)?;
        let port = connection.port_or_default(driver);
        let invocation = match driver {
            Driver::Mysql => {
                let mut inv = Invocation::new(self.tools.resolve(Tool::MysqlClient)?)
                    .arg(format!("--host={}", connection.host_or_default()))
                    .arg(format!("--user={}", connection.username));
                if let Some(port) = port {
                    inv = inv.arg(format!("--port={}", port));
                }
                inv.arg(&connection.database)
            }
            Driver::Pgsql => {
                let mut inv = Invocation::new(self.tools.resolve(Tool::Psql)?)
                    .arg("-X") // Do not read psqlrc
                    .arg("-q")
                    .arg("-v")
                    .arg("ON_ERROR_STOP=1")
                    .arg("--no-password")
                    .arg("--host")
                    .arg(connection.host_or_default())
                    .arg("--username")
                    .arg(&connection.username);
                if let Some(port) = port {
                    inv = inv.arg("--port").arg(port.to_string());
                }
                inv.arg("--dbname").arg(&connection.database)
            }
            Driver::Sqlite => {
                return Err(BackupError::Config(
                    "sqlite restores replace the database file; no client tool is used".into(),
                ));
            }
        };
        Ok(with_password(invocation, connection, driver).stdout(StdoutTarget::Discard))
    }

    /// Streams the (possibly gzipped) dump into the client's stdin.
    fn restore_with_client(
        &self,
        connection: &ConnectionConfig,
        driver: Driver,
        backup_file: &Path,
    ) -> Result<()> {
        let invocation = self.client_invocation(connection, driver)?;
        let mut input = open_maybe_gzip(backup_file)?;
        let output = self.runner.run_with_stdin(&invocation, input.as_mut())?;
        output.check(&invocation.tool_name())?;
        Ok(())
    }
}

pub fn require_force(force: bool) -> Result<()> {
    if force {
        Ok(())
    } else {
        Err(BackupError::RestoreRefused(
            "restoring overwrites the target database; re-run with --force".into(),
        ))
    }
}

/// Decompresses into a sibling temp file and renames it over the live
/// database, so a failure leaves the original untouched.
fn replace_sqlite_file(connection: &ConnectionConfig, backup_file: &Path) -> Result<()> {
    if sniff_format(backup_file)? != FileFormat::Gzip {
        return Err(BackupError::Config(format!(
            "sqlite restores expect a gzip-compressed snapshot: {}",
            backup_file.display()
        )));
    }

    let live = Path::new(&connection.database);
    if connection.database.trim().is_empty() {
        return Err(BackupError::Config(format!(
            "connection '{}' has no sqlite database path",
            connection.name
        )));
    }
    let parent = live
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    if !parent.is_dir() {
        return Err(BackupError::Config(format!(
            "sqlite database directory does not exist: {}",
            parent.display()
        )));
    }

    let mut staged = tempfile::Builder::new()
        .prefix(".restore-")
        .suffix(".sqlite")
        .tempfile_in(parent)
        .at(parent)?;

    let input = File::open(backup_file).at(backup_file)?;
    let mut decoder = MultiGzDecoder::new(BufReader::with_capacity(CHUNK_SIZE, input));
    let bytes = copy_in_chunks(&mut decoder, staged.as_file_mut()).at(backup_file)?;
    staged.as_file().sync_all().at(staged.path())?;

    // The staged file is created 0600; keep whatever mode the app relies on.
    if live.exists() {
        let permissions = fs::metadata(live).at(live)?.permissions();
        fs::set_permissions(staged.path(), permissions).at(staged.path())?;
    }

    staged
        .persist(live)
        .map_err(|e| BackupError::io(live, e.error))?;

    if wal_path(live).exists() {
        warn!(database = %live.display(), "a WAL file sits next to the restored database; stop the app before restoring");
    }
    info!(database = %live.display(), bytes, "sqlite database replaced");
    Ok(())
}

/// SQLite names the journal `<database file name>-wal`.
fn wal_path(live: &Path) -> PathBuf {
    let mut name = live.as_os_str().to_os_string();
    name.push("-wal");
    PathBuf::from(name)
}
