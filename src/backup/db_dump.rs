// backuptool/src/backup/db_dump.rs
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::backup::{ArtifactKind, BackupArtifact};
use crate::config::{ConnectionConfig, Driver, Tool, ToolPaths};
use crate::errors::{BackupError, IoResultExt, Result};
use crate::utils::process::{Invocation, ProcessRunner, StdoutTarget};
use crate::utils::{file_timestamp, slugify};

/// Environment variable each client/server tool reads its password from.
pub fn password_env_var(driver: Driver) -> Option<&'static str> {
    match driver {
        Driver::Mysql => Some("MYSQL_PWD"),
        Driver::Pgsql => Some("PGPASSWORD"),
        Driver::Sqlite => None,
    }
}

/// Rejects client/server connections that would produce a partial or
/// wrong-target dump.
pub fn require_server_identity(connection: &ConnectionConfig) -> Result<()> {
    if connection.database.trim().is_empty() {
        return Err(BackupError::Config(format!(
            "connection '{}' has no database name",
            connection.name
        )));
    }
    if connection.username.trim().is_empty() {
        return Err(BackupError::Config(format!(
            "connection '{}' has no username",
            connection.name
        )));
    }
    Ok(())
}

/// `<timestamp>_<driver>_<name>`, shared by the raw dump and its `.gz`.
pub fn dump_file_stem(connection: &ConnectionConfig, driver: Driver, now: DateTime<Utc>) -> String {
    let name = if driver.is_embedded() {
        Path::new(&connection.database)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    } else {
        connection.database.clone()
    };
    format!("{}_{}_{}", file_timestamp(now), driver, slugify(&name))
}

fn raw_extension(driver: Driver) -> &'static str {
    if driver.is_embedded() { "sqlite" } else { "sql" }
}

/// Produces point-in-time snapshots, dispatching on the connection's driver.
pub struct DumpEngine<'a> {
    runner: &'a dyn ProcessRunner,
    tools: &'a ToolPaths,
}

impl<'a> DumpEngine<'a> {
    pub fn new(runner: &'a dyn ProcessRunner, tools: &'a ToolPaths) -> Self {
        DumpEngine { runner, tools }
    }

    /// Checks everything a dump needs without touching the database.
    pub fn preflight(&self, connection: &ConnectionConfig) -> Result<Driver> {
        let driver = connection.driver()?;
        match driver {
            Driver::Mysql => {
                require_server_identity(connection)?;
                self.tools.resolve(Tool::MysqlDump)?;
            }
            Driver::Pgsql => {
                require_server_identity(connection)?;
                self.tools.resolve(Tool::PgDump)?;
            }
            Driver::Sqlite => {
                let path = Path::new(&connection.database);
                if connection.database.trim().is_empty() || !path.is_file() {
                    return Err(BackupError::Config(format!(
                        "sqlite database file not found: {}",
                        path.display()
                    )));
                }
            }
        }
        Ok(driver)
    }

    /// Writes an uncompressed snapshot into `dest_dir`.
    pub fn dump(
        &self,
        connection: &ConnectionConfig,
        dest_dir: &Path,
        now: DateTime<Utc>,
    ) -> Result<BackupArtifact> {
        let driver = self.preflight(connection)?;
        let dest = dest_dir.join(format!(
            "{}.{}",
            dump_file_stem(connection, driver, now),
            raw_extension(driver)
        ));

        info!(connection = %connection.name, driver = %driver, dest = %dest.display(), "dumping database");
        match driver {
            Driver::Mysql => self.dump_mysql(connection, &dest)?,
            Driver::Pgsql => self.dump_pgsql(connection, &dest)?,
            Driver::Sqlite => copy_sqlite_file(connection, &dest)?,
        }

        let artifact = BackupArtifact::from_path(&dest, ArtifactKind::DbDump)?;
        info!(dest = %dest.display(), bytes = artifact.size, "database dump finished");
        Ok(artifact)
    }

    fn dump_mysql(&self, connection: &ConnectionConfig, dest: &Path) -> Result<()> {
        let program = self.tools.resolve(Tool::MysqlDump)?;
        let mut invocation = Invocation::new(program)
            .arg("--single-transaction")
            .arg("--skip-lock-tables")
            .arg("--routines")
            .arg("--events")
            .arg("--triggers")
            .arg("--no-tablespaces")
            .arg(format!("--host={}", connection.host_or_default()))
            .arg(format!("--user={}", connection.username));
        if let Some(port) = connection.port_or_default(Driver::Mysql) {
            invocation = invocation.arg(format!("--port={}", port));
        }
        let invocation = with_password(invocation, connection, Driver::Mysql)
            .arg(&connection.database)
            .stdout(StdoutTarget::File(dest.to_path_buf()));

        self.run_dump(&invocation, dest)
    }

    fn dump_pgsql(&self, connection: &ConnectionConfig, dest: &Path) -> Result<()> {
        let program = self.tools.resolve(Tool::PgDump)?;
        let mut invocation = Invocation::new(program)
            .arg("--no-owner")
            .arg("--no-acl")
            .arg("--no-password")
            .arg("--host")
            .arg(connection.host_or_default())
            .arg("--username")
            .arg(&connection.username);
        if let Some(port) = connection.port_or_default(Driver::Pgsql) {
            invocation = invocation.arg("--port").arg(port.to_string());
        }
        let invocation = with_password(invocation, connection, Driver::Pgsql)
            .arg("--dbname")
            .arg(&connection.database)
            .stdout(StdoutTarget::File(dest.to_path_buf()));

        self.run_dump(&invocation, dest)
    }

    fn run_dump(&self, invocation: &Invocation, dest: &Path) -> Result<()> {
        let tool = invocation.tool_name();
        let result = self
            .runner
            .run(invocation)
            .and_then(|output| output.check(&tool));
        if result.is_err() {
            // Never leave a half-written dump behind.
            let _ = fs::remove_file(dest);
        }
        result.map(|_| ())
    }
}

pub(crate) fn with_password(
    invocation: Invocation,
    connection: &ConnectionConfig,
    driver: Driver,
) -> Invocation {
    match password_env_var(driver) {
        Some(var) if !connection.password.is_empty() => {
            invocation.env(var, connection.password.clone())
        }
        _ => invocation,
    }
}

fn copy_sqlite_file(connection: &ConnectionConfig, dest: &Path) -> Result<()> {
    let source = PathBuf::from(&connection.database);
    if !source.is_file() {
        return Err(BackupError::Config(format!(
            "sqlite database file not found: {}",
            source.display()
        )));
    }
    fs::copy(&source, dest).at(&source)?;
    Ok(())
}
