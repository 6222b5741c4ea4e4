//! Database and media backup/restore tool
//!
//! Provides CLI interface for backup, restore and inspection of local backups

// backuptool/src/main.rs
use anyhow::{Context, Result};
use backuptool::backup::{self, ArtifactKind, FullBackupOptions, RunOutcome};
use backuptool::config::AppConfig;
use backuptool::errors::BackupError;
use backuptool::restore;
use backuptool::utils::schedule::{JsonFileStateStore, ScheduleState};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "backuptool", version, about = "Backs up and restores the application database and media")]
struct Cli {
    /// Path to config.json
    #[arg(long, global = true, env = "BACKUP_CONFIG", default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Database dump plus media archive in one bundle (scheduled)
    BackupFull {
        /// Run even if the schedule says it is not due
        #[arg(long)]
        force: bool,
        /// Retention window in days for this run
        #[arg(long)]
        keep: Option<i64>,
    },
    /// Database-only snapshot into backups/db
    DbBackup {
        #[arg(long)]
        connection: Option<String>,
        #[arg(long)]
        keep: Option<i64>,
    },
    /// Restore a database from a dump, a full bundle, or `latest`
    DbRestore {
        file: String,
        #[arg(long)]
        connection: Option<String>,
        /// Required; restores overwrite the target database
        #[arg(long)]
        force: bool,
    },
    /// List local backups, newest first
    List {
        #[arg(long, value_enum)]
        kind: Option<KindArg>,
    },
    /// Show schedule state and the newest backups
    Status,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KindArg {
    Full,
    Db,
}

/// Main entry point for the backup/restore tool
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run_app(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(BackupError::RestoreRefused(reason)) = e.downcast_ref::<BackupError>() {
                eprintln!("❌ {}", reason);
            } else {
                eprintln!("❌ Error: {:?}", e);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run_app(cli: Cli) -> Result<()> {
    let config_path = cli.config;
    let app_config = AppConfig::load_from_json(&config_path).with_context(|| {
        format!(
            "Failed to load application configuration from {}",
            config_path.display()
        )
    })?;

    match cli.command {
        Commands::BackupFull { force, keep } => {
            println!("🚀 Starting full backup...");
            let options = FullBackupOptions {
                force,
                keep_days: keep,
            };
            let outcome = tokio::task::spawn_blocking(move || {
                backup::run_full_backup_flow(&app_config, options)
            })
            .await
            .context("Backup task panicked")??;
            report_outcome(outcome);
        }
        Commands::DbBackup { connection, keep } => {
            println!("🚀 Starting database backup...");
            let outcome = tokio::task::spawn_blocking(move || {
                backup::run_db_backup_flow(&app_config, connection.as_deref(), keep)
            })
            .await
            .context("Backup task panicked")??;
            report_outcome(outcome);
        }
        Commands::DbRestore {
            file,
            connection,
            force,
        } => {
            println!("🔄 Starting restore from {}...", file);
            let restored = tokio::task::spawn_blocking(move || {
                restore::run_restore_flow(&app_config, &file, connection.as_deref(), force)
            })
            .await
            .context("Restore task panicked")??;
            println!("✅ Database restored from {}", restored.display());
        }
        Commands::List { kind } => {
            let settings = &app_config.settings;
            let listings = match kind {
                Some(KindArg::Full) => vec![(settings.full_dir(), ArtifactKind::FullBundle)],
                Some(KindArg::Db) => vec![(settings.db_dir(), ArtifactKind::DbDump)],
                None => vec![
                    (settings.full_dir(), ArtifactKind::FullBundle),
                    (settings.db_dir(), ArtifactKind::DbDump),
                ],
            };
            for (dir, kind) in listings {
                let artifacts = backup::list_artifacts(&dir, kind)?;
                println!("📦 {} ({}): {} file(s)", kind.as_str(), dir.display(), artifacts.len());
                for artifact in artifacts {
                    println!(
                        "  {}  {:>12} bytes  {}",
                        artifact.created_at.format("%Y-%m-%d %H:%M:%S"),
                        artifact.size,
                        artifact.file_name()
                    );
                }
            }
        }
        Commands::Status => print_status(&app_config)?,
    }
    Ok(())
}

fn report_outcome(outcome: RunOutcome) {
    match outcome {
        RunOutcome::Completed(artifact) => {
            println!(
                "✅ Backup written to {} ({} bytes)",
                artifact.path.display(),
                artifact.size
            );
        }
        RunOutcome::NotDue {
            last_run_at,
            frequency_hours,
        } => {
            println!(
                "⏭ Backup not due yet (last run {}, every {}h). Use --force to run anyway.",
                last_run_at.as_deref().unwrap_or("never"),
                frequency_hours
            );
        }
        RunOutcome::Skipped { lock } => {
            println!("⏭ Another backup holds '{}'; skipped.", lock);
        }
    }
}

fn print_status(app_config: &AppConfig) -> Result<()> {
    let settings = &app_config.settings;
    let store = JsonFileStateStore::new(&app_config.state_file);
    let schedule = ScheduleState::load(&store, settings.frequency_hours)?;
    let due = schedule.is_due(false, Utc::now());

    println!("Backup root:     {}", settings.backup_root.display());
    println!(
        "Last full run:   {}",
        schedule.last_run_at.as_deref().unwrap_or("never")
    );
    println!("Frequency:       every {}h", schedule.frequency_hours);
    println!("Due now:         {}", if due { "yes" } else { "no" });
    println!("Retention:       {} day(s)", settings.retention_days);
    println!(
        "Offsite:         {}",
        if settings.offsite.enabled {
            format!("{}:{}", settings.offsite.remote, settings.offsite.folder)
        } else {
            "disabled".to_string()
        }
    );

    for (label, dir, kind) in [
        ("Latest bundle:   ", settings.full_dir(), ArtifactKind::FullBundle),
        ("Latest DB dump:  ", settings.db_dir(), ArtifactKind::DbDump),
    ] {
        match backup::latest_artifact(&dir, kind)? {
            Some(artifact) => println!("{}{}", label, artifact.path.display()),
            None => println!("{}none", label),
        }
    }
    Ok(())
}
