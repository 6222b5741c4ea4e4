// backuptool/src/backup/logic.rs
use chrono::Utc;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use crate::backup::archive::{build_bundle, zip_directory};
use crate::backup::compress::gzip_file;
use crate::backup::db_dump::DumpEngine;
use crate::backup::offsite::OffsiteReplicator;
use crate::backup::{ArtifactKind, BackupArtifact, FULL_BUNDLE_PREFIX, retention};
use crate::config::{BackupSettings, ConnectionConfig, ToolPaths};
use crate::errors::{BackupError, IoResultExt, Result};
use crate::utils::file_timestamp;
use crate::utils::lock::{
    DB_BACKUP_LOCK, DEFAULT_LOCK_TTL, DistributedLock, FULL_BACKUP_LOCK, LockGuard,
};
use crate::utils::process::ProcessRunner;
use crate::utils::schedule::{
    LAST_RUN_AT_KEY, ScheduleState, ScheduleStateStore, format_timestamp,
};

/// Scratch directories live next to the artifacts they produce.
const SCRATCH_PREFIX: &str = "tmp_";

/// Pipeline stages, in order. `Failed` is reachable from any stage after
/// the lock is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    LockAcquired,
    Dumping,
    Compressing,
    Bundling,
    RetentionApplied,
    OffsiteAttempted,
    Done,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::LockAcquired => "lock_acquired",
            Stage::Dumping => "dumping",
            Stage::Compressing => "compressing",
            Stage::Bundling => "bundling",
            Stage::RetentionApplied => "retention_applied",
            Stage::OffsiteAttempted => "offsite_attempted",
            Stage::Done => "done",
            Stage::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct FullBackupOptions {
    /// Run even when the schedule says it is not due.
    pub force: bool,
    /// Overrides the configured retention window for this run.
    pub keep_days: Option<i64>,
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed(BackupArtifact),
    NotDue {
        last_run_at: Option<String>,
        frequency_hours: u32,
    },
    /// Another run holds the lock.
    Skipped { lock: String },
}

struct StageTracker {
    pipeline: &'static str,
    stage: Stage,
}

impl StageTracker {
    fn new(pipeline: &'static str) -> Self {
        StageTracker {
            pipeline,
            stage: Stage::Idle,
        }
    }

    fn advance(&mut self, next: Stage) {
        debug!(pipeline = self.pipeline, from = %self.stage, to = %next, "backup stage");
        self.stage = next;
    }

    fn fail(&mut self, err: &BackupError) {
        error!(pipeline = self.pipeline, stage = %self.stage, error = %err, "backup run failed");
        self.stage = Stage::Failed;
    }
}

/// Drives one backup run from schedule check to offsite copy. Every
/// collaborator is borrowed, so tests can swap in fakes.
pub struct BackupOrchestrator<'a> {
    settings: &'a BackupSettings,
    tools: &'a ToolPaths,
    runner: &'a dyn ProcessRunner,
    lock: &'a dyn DistributedLock,
    state: &'a dyn ScheduleStateStore,
    lock_ttl: Duration,
}

impl<'a> BackupOrchestrator<'a> {
    pub fn new(
        settings: &'a BackupSettings,
        tools: &'a ToolPaths,
        runner: &'a dyn ProcessRunner,
        lock: &'a dyn DistributedLock,
        state: &'a dyn ScheduleStateStore,
    ) -> Self {
        BackupOrchestrator {
            settings,
            tools,
            runner,
            lock,
            state,
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Full backup: database dump plus media archive in one bundle.
    pub fn run_full(
        &self,
        connection: &ConnectionConfig,
        options: &FullBackupOptions,
    ) -> Result<RunOutcome> {
        if let Some(not_due) = self.check_schedule(options.force)? {
            return Ok(not_due);
        }

        let mut tracker = StageTracker::new("full");
        let Some(guard) = LockGuard::acquire(self.lock, FULL_BACKUP_LOCK, self.lock_ttl)? else {
            info!(lock = FULL_BACKUP_LOCK, "another backup is running; skipping");
            return Ok(RunOutcome::Skipped {
                lock: FULL_BACKUP_LOCK.to_string(),
            });
        };

        // A run that finished while we waited for the lock may have made this one redundant.
        if let Some(not_due) = self.check_schedule(options.force)? {
            return Ok(not_due);
        }
        tracker.advance(Stage::LockAcquired);

        let keep_days = options.keep_days.unwrap_or(self.settings.retention_days);
        let outcome = match self.full_pipeline(connection, keep_days, &mut tracker) {
            Ok(artifact) => {
                tracker.advance(Stage::Done);
                self.record_last_run();
                info!(bundle = %artifact.path.display(), bytes = artifact.size, "full backup finished");
                Ok(RunOutcome::Completed(artifact))
            }
            Err(e) => {
                tracker.fail(&e);
                Err(e)
            }
        };
        drop(guard);
        outcome
    }

    /// DB-only snapshot into `backups/db`. Ignores the schedule.
    pub fn run_db_only(
        &self,
        connection: &ConnectionConfig,
        keep_days: Option<i64>,
    ) -> Result<RunOutcome> {
        let mut tracker = StageTracker::new("db");
        let Some(guard) = LockGuard::acquire(self.lock, DB_BACKUP_LOCK, self.lock_ttl)? else {
            info!(lock = DB_BACKUP_LOCK, "another database backup is running; skipping");
            return Ok(RunOutcome::Skipped {
                lock: DB_BACKUP_LOCK.to_string(),
            });
        };
        tracker.advance(Stage::LockAcquired);

        let keep_days = keep_days.unwrap_or(self.settings.retention_days);
        let outcome = match self.db_pipeline(connection, keep_days, &mut tracker) {
            Ok(artifact) => {
                tracker.advance(Stage::Done);
                info!(dump = %artifact.path.display(), bytes = artifact.size, "database backup finished");
                Ok(RunOutcome::Completed(artifact))
            }
            Err(e) => {
                tracker.fail(&e);
                Err(e)
            }
        };
        drop(guard);
        outcome
    }

    fn check_schedule(&self, force: bool) -> Result<Option<RunOutcome>> {
        let schedule = ScheduleState::load(self.state, self.settings.frequency_hours)?;
        if schedule.is_due(force, Utc::now()) {
            return Ok(None);
        }
        info!(
            last_run_at = schedule.last_run_at.as_deref().unwrap_or("never"),
            frequency_hours = schedule.frequency_hours,
            "full backup not due yet"
        );
        Ok(Some(RunOutcome::NotDue {
            last_run_at: schedule.last_run_at,
            frequency_hours: schedule.frequency_hours,
        }))
    }

    fn full_pipeline(
        &self,
        connection: &ConnectionConfig,
        keep_days: i64,
        tracker: &mut StageTracker,
    ) -> Result<BackupArtifact> {
        let engine = DumpEngine::new(self.runner, self.tools);
        engine.preflight(connection)?;
        let media_dir = self.media_dir()?;

        let full_dir = self.settings.full_dir();
        fs::create_dir_all(&full_dir).at(&full_dir)?;
        let scratch = scratch_dir(&full_dir)?;
        let now = Utc::now();
        let stamp = file_timestamp(now);

        tracker.advance(Stage::Dumping);
        let raw = engine.dump(connection, scratch.path(), now)?;

        tracker.advance(Stage::Compressing);
        let dump_gz = compress_dump(&raw.path)?;

        tracker.advance(Stage::Bundling);
        let media_zip = scratch.path().join(format!("storage_{}.zip", stamp));
        let media_files = zip_directory(&media_dir, &media_zip)?;
        let staged = scratch
            .path()
            .join(format!("{}{}.zip", FULL_BUNDLE_PREFIX, stamp));
        build_bundle(&staged, &dump_gz, &media_zip)?;
        let bundle = publish(&staged, &full_dir)?;
        close_scratch(scratch);
        debug!(bundle = %bundle.display(), media_files, "bundle published");

        let artifact = BackupArtifact::from_path(&bundle, ArtifactKind::FullBundle)?;

        isolated("retention", apply_retention(&full_dir, keep_days))?;
        tracker.advance(Stage::RetentionApplied);

        isolated("offsite", self.replicate_offsite(&artifact.path))?;
        tracker.advance(Stage::OffsiteAttempted);

        Ok(artifact)
    }

    fn db_pipeline(
        &self,
        connection: &ConnectionConfig,
        keep_days: i64,
        tracker: &mut StageTracker,
    ) -> Result<BackupArtifact> {
        let engine = DumpEngine::new(self.runner, self.tools);
        engine.preflight(connection)?;

        let db_dir = self.settings.db_dir();
        fs::create_dir_all(&db_dir).at(&db_dir)?;
        let scratch = scratch_dir(&db_dir)?;

        tracker.advance(Stage::Dumping);
        let raw = engine.dump(connection, scratch.path(), Utc::now())?;

        tracker.advance(Stage::Compressing);
        let dump_gz = compress_dump(&raw.path)?;
        let published = publish(&dump_gz, &db_dir)?;
        close_scratch(scratch);

        let artifact = BackupArtifact::from_path(&published, ArtifactKind::DbDump)?;
        isolated("retention", apply_retention(&db_dir, keep_days))?;
        tracker.advance(Stage::RetentionApplied);
        Ok(artifact)
    }

    fn media_dir(&self) -> Result<PathBuf> {
        let dir = self.settings.media_dir.as_ref().ok_or_else(|| {
            BackupError::Config("media_dir is not configured; full backups need it".into())
        })?;
        if !dir.is_dir() {
            return Err(BackupError::Config(format!(
                "media directory not found: {}",
                dir.display()
            )));
        }
        Ok(dir.clone())
    }

    fn replicate_offsite(&self, bundle: &Path) -> Result<()> {
        let offsite = &self.settings.offsite;
        if !offsite.enabled {
            debug!("offsite replication disabled");
            return Ok(());
        }
        OffsiteReplicator::new(self.runner, self.tools, offsite).replicate(bundle)?;
        Ok(())
    }

    fn record_last_run(&self) {
        let stamp = format_timestamp(Utc::now());
        if let Err(e) = self.state.set(LAST_RUN_AT_KEY, &stamp) {
            warn!(error = %e, "backup succeeded but last run time could not be saved");
        }
    }
}

fn scratch_dir(parent: &Path) -> Result<TempDir> {
    tempfile::Builder::new()
        .prefix(SCRATCH_PREFIX)
        .tempdir_in(parent)
        .at(parent)
}

fn close_scratch(scratch: TempDir) {
    let path = scratch.path().to_path_buf();
    if let Err(e) = scratch.close() {
        warn!(path = %path.display(), error = %e, "failed to remove scratch directory");
    }
}

/// Gzips a raw dump next to itself and drops the raw file.
fn compress_dump(raw: &Path) -> Result<PathBuf> {
    let mut name = raw.as_os_str().to_os_string();
    name.push(".gz");
    let compressed = PathBuf::from(name);

    if let Err(e) = gzip_file(raw, &compressed) {
        let _ = fs::remove_file(&compressed);
        return Err(e);
    }
    if let Err(e) = fs::remove_file(raw) {
        warn!(path = %raw.display(), error = %e, "failed to remove uncompressed dump");
    }
    Ok(compressed)
}

/// Moves a finished file from scratch into `dir`. A name already taken
/// gets a numeric suffix.
fn publish(staged: &Path, dir: &Path) -> Result<PathBuf> {
    let file_name = staged
        .file_name()
        .ok_or_else(|| BackupError::Config(format!("no file name: {}", staged.display())))?
        .to_string_lossy()
        .into_owned();

    let mut destination = dir.join(&file_name);
    let mut attempt = 1;
    while destination.exists() {
        let (stem, ext) = split_extension(&file_name);
        destination = dir.join(format!("{}_{}{}", stem, attempt, ext));
        attempt += 1;
    }

    fs::rename(staged, &destination).at(&destination)?;
    Ok(destination)
}

/// Splits at the first dot so `x.sql.gz` keeps its full extension.
fn split_extension(file_name: &str) -> (&str, &str) {
    match file_name.find('.') {
        Some(idx) if idx > 0 => file_name.split_at(idx),
        _ => (file_name, ""),
    }
}

fn apply_retention(dir: &Path, keep_days: i64) -> Result<()> {
    let report = retention::enforce(dir, keep_days)
        .map_err(|e| BackupError::Retention(format!("{}: {}", dir.display(), e)))?;
    for (path, err) in &report.failures {
        warn!(path = %path.display(), error = %err, "could not delete expired backup");
    }
    Ok(())
}

/// Logs and swallows non-fatal step errors; anything fatal aborts the run.
fn isolated(step: &str, result: Result<()>) -> Result<()> {
    match result {
        Err(e) if !e.is_fatal() => {
            warn!(step, error = %e, "step failed; backup kept");
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::archive::{BUNDLE_DB_DIR, extract_member, list_entries};
    use crate::backup::compress::gunzip_file;
    use crate::config::OffsiteConfig;
    use crate::utils::lock::InMemoryLock;
    use crate::utils::process::testing::{RecordingRunner, ScriptedResponse};
    use crate::utils::schedule::{InMemoryStateStore, parse_timestamp};
    use std::fs::File;
    use std::sync::{Mutex, mpsc};
    use std::thread;
    use std::time::SystemTime;

    const DB_BYTES: &[u8] = b"SQLite format 3\0fake pages for the hse kpi app";

    struct Fixture {
        dir: TempDir,
        settings: BackupSettings,
        tools: ToolPaths,
        lock: InMemoryLock,
        state: InMemoryStateStore,
    }

    impl Fixture {
        fn new() -> anyhow::Result<Self> {
            let dir = tempfile::tempdir()?;
            let media = dir.path().join("storage");
            fs::create_dir_all(media.join("uploads/2026"))?;
            fs::create_dir_all(media.join("exports"))?;
            fs::write(media.join("uploads/2026/incident-17.pdf"), b"%PDF-1.7")?;
            fs::write(dir.path().join("database.sqlite"), DB_BYTES)?;

            let mut settings = BackupSettings::new(dir.path().join("backups"));
            settings.media_dir = Some(media);
            let tools = ToolPaths {
                mysqldump: Some(PathBuf::from("/usr/bin/mysqldump")),
                rclone: Some(PathBuf::from("/usr/bin/rclone")),
                ..ToolPaths::default()
            };
            Ok(Fixture {
                dir,
                settings,
                tools,
                lock: InMemoryLock::new(),
                state: InMemoryStateStore::new(),
            })
        }

        fn orchestrator<'a>(&'a self, runner: &'a dyn ProcessRunner) -> BackupOrchestrator<'a> {
            BackupOrchestrator::new(&self.settings, &self.tools, runner, &self.lock, &self.state)
        }

        fn sqlite(&self) -> ConnectionConfig {
            ConnectionConfig {
                name: "default".into(),
                driver: "sqlite".into(),
                database: self.dir.path().join("database.sqlite").to_string_lossy().into_owned(),
                ..ConnectionConfig::default()
            }
        }

        fn mysql(&self) -> ConnectionConfig {
            ConnectionConfig {
                name: "default".into(),
                driver: "mysql".into(),
                host: "127.0.0.1".into(),
                database: "hse".into(),
                username: "backup".into(),
                password: "secret".into(),
                ..ConnectionConfig::default()
            }
        }

        fn names_in(&self, dir: &Path) -> Vec<String> {
            let mut names: Vec<String> = fs::read_dir(dir)
                .map(|entries| {
                    entries
                        .filter_map(|e| e.ok())
                        .map(|e| e.file_name().to_string_lossy().into_owned())
                        .collect()
                })
                .unwrap_or_default();
            names.sort();
            names
        }
    }

    fn forced() -> FullBackupOptions {
        FullBackupOptions {
            force: true,
            keep_days: None,
        }
    }

    #[test]
    fn test_forced_full_backup_produces_one_bundle() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let runner = RecordingRunner::new();

        let outcome = fx.orchestrator(&runner).run_full(&fx.sqlite(), &forced())?;
        let RunOutcome::Completed(artifact) = outcome else {
            panic!("expected a completed run, got {outcome:?}");
        };

        let full_dir = fx.settings.full_dir();
        let names = fx.names_in(&full_dir);
        assert_eq!(names.len(), 1, "unexpected entries: {names:?}");
        assert!(names[0].starts_with(FULL_BUNDLE_PREFIX) && names[0].ends_with(".zip"));
        assert_eq!(artifact.path, full_dir.join(&names[0]));
        assert_eq!(artifact.kind, ArtifactKind::FullBundle);

        let entries = list_entries(&artifact.path)?;
        assert_eq!(entries.len(), 2);
        assert!(entries[0].starts_with("db/") && entries[0].ends_with("_sqlite_database.sqlite.gz"));
        assert!(entries[1].starts_with("storage/storage_") && entries[1].ends_with(".zip"));

        let out = tempfile::tempdir()?;
        let member = extract_member(&artifact.path, BUNDLE_DB_DIR, out.path())?.expect("db member");
        let restored = out.path().join("restored.sqlite");
        gunzip_file(&member, &restored)?;
        assert_eq!(fs::read(&restored)?, DB_BYTES);

        let last_run = fx.state.get(LAST_RUN_AT_KEY)?.expect("last_run_at recorded");
        let last_run = parse_timestamp(&last_run).expect("parseable timestamp");
        assert!((Utc::now() - last_run).num_seconds().abs() <= 1);

        assert!(fx.lock.acquire(FULL_BACKUP_LOCK, DEFAULT_LOCK_TTL)?.is_some());
        Ok(())
    }

    #[test]
    fn test_not_due_run_does_nothing() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let an_hour_ago = Utc::now() - chrono::Duration::hours(1);
        fx.state.set(LAST_RUN_AT_KEY, &format_timestamp(an_hour_ago))?;
        let runner = RecordingRunner::new();

        let outcome = fx
            .orchestrator(&runner)
            .run_full(&fx.sqlite(), &FullBackupOptions::default())?;
        match outcome {
            RunOutcome::NotDue { frequency_hours, .. } => assert_eq!(frequency_hours, 12),
            other => panic!("expected NotDue, got {other:?}"),
        }
        assert!(fx.names_in(&fx.settings.full_dir()).is_empty());
        Ok(())
    }

    #[test]
    fn test_held_lock_skips_run() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let _held = fx.lock.acquire(FULL_BACKUP_LOCK, DEFAULT_LOCK_TTL)?.expect("lock free");
        let runner = RecordingRunner::new();

        let outcome = fx.orchestrator(&runner).run_full(&fx.sqlite(), &forced())?;
        assert!(matches!(outcome, RunOutcome::Skipped { .. }));
        assert!(fx.names_in(&fx.settings.full_dir()).is_empty());
        assert!(fx.state.get(LAST_RUN_AT_KEY)?.is_none());
        Ok(())
    }

    #[test]
    fn test_failed_dump_leaves_no_artifacts() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let runner = RecordingRunner::with_responses([ScriptedResponse::fail(
            2,
            "mysqldump: Got error: 2002: Can't connect",
        )]);

        let result = fx.orchestrator(&runner).run_full(&fx.mysql(), &forced());
        assert!(matches!(result, Err(BackupError::ToolExecutionFailed { .. })));

        assert!(fx.names_in(&fx.settings.full_dir()).is_empty());
        assert!(fx.state.get(LAST_RUN_AT_KEY)?.is_none());
        assert!(fx.lock.acquire(FULL_BACKUP_LOCK, DEFAULT_LOCK_TTL)?.is_some());
        Ok(())
    }

    #[test]
    fn test_missing_media_dir_fails_before_dumping() -> anyhow::Result<()> {
        let mut fx = Fixture::new()?;
        fx.settings.media_dir = Some(fx.dir.path().join("no-such-storage"));
        let runner = RecordingRunner::new();

        let result = fx.orchestrator(&runner).run_full(&fx.mysql(), &forced());
        assert!(matches!(result, Err(BackupError::Config(_))));
        assert!(runner.calls().is_empty());
        Ok(())
    }

    #[test]
    fn test_offsite_failure_is_not_fatal() -> anyhow::Result<()> {
        let mut fx = Fixture::new()?;
        fx.settings.offsite = OffsiteConfig {
            enabled: true,
            remote: "b2".into(),
            folder: "hse".into(),
            ..OffsiteConfig::default()
        };
        let runner = RecordingRunner::with_responses([ScriptedResponse::fail(1, "quota exceeded")]);

        let outcome = fx.orchestrator(&runner).run_full(&fx.sqlite(), &forced())?;
        assert!(matches!(outcome, RunOutcome::Completed(_)));
        assert_eq!(runner.calls().len(), 1);
        assert_eq!(runner.calls()[0].invocation.args_lossy()[0], "copyto");
        assert!(fx.state.get(LAST_RUN_AT_KEY)?.is_some());
        Ok(())
    }

    #[test]
    fn test_retention_runs_after_bundle() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let full_dir = fx.settings.full_dir();
        fs::create_dir_all(&full_dir)?;
        let stale = full_dir.join("full_backup_20260801_000000.zip");
        fs::write(&stale, b"old")?;
        File::options()
            .write(true)
            .open(&stale)?
            .set_modified(SystemTime::now() - Duration::from_secs(40 * 86_400))?;

        let runner = RecordingRunner::new();
        let options = FullBackupOptions {
            force: true,
            keep_days: Some(30),
        };
        fx.orchestrator(&runner).run_full(&fx.sqlite(), &options)?;

        assert!(!stale.exists());
        assert_eq!(fx.names_in(&full_dir).len(), 1);
        Ok(())
    }

    #[test]
    fn test_concurrent_runs_produce_one_bundle() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let runner = RecordingRunner::with_responses([ScriptedResponse::ok("-- dump\n")])
            .with_hook(move |_| {
                let _ = started_tx.send(());
                let _ = release_rx.lock().unwrap().recv_timeout(Duration::from_secs(10));
            });
        let orchestrator = fx.orchestrator(&runner);
        let connection = fx.mysql();

        thread::scope(|scope| -> anyhow::Result<()> {
            let first = scope.spawn(|| orchestrator.run_full(&connection, &forced()));
            started_rx.recv_timeout(Duration::from_secs(10))?;

            let second = orchestrator.run_full(&connection, &forced())?;
            assert!(matches!(second, RunOutcome::Skipped { .. }));

            release_tx.send(())?;
            let first = first.join().expect("backup thread panicked")?;
            assert!(matches!(first, RunOutcome::Completed(_)));
            Ok(())
        })?;

        let names = fx.names_in(&fx.settings.full_dir());
        assert_eq!(names.len(), 1, "unexpected entries: {names:?}");
        assert_eq!(runner.calls().len(), 1);
        Ok(())
    }

    #[test]
    fn test_db_only_backup_ignores_schedule() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        fx.state.set(LAST_RUN_AT_KEY, &format_timestamp(Utc::now()))?;
        let db_dir = fx.settings.db_dir();
        fs::create_dir_all(&db_dir)?;
        let stale = db_dir.join("20260801_000000_sqlite_database.sqlite.gz");
        fs::write(&stale, b"old")?;
        File::options()
            .write(true)
            .open(&stale)?
            .set_modified(SystemTime::now() - Duration::from_secs(40 * 86_400))?;

        let runner = RecordingRunner::new();
        let outcome = fx.orchestrator(&runner).run_db_only(&fx.sqlite(), None)?;
        let RunOutcome::Completed(artifact) = outcome else {
            panic!("expected a completed run, got {outcome:?}");
        };

        assert_eq!(artifact.kind, ArtifactKind::DbDump);
        assert_eq!(fx.names_in(&db_dir), vec![artifact.file_name()]);
        assert!(!fx.settings.full_dir().exists());

        let restored = fx.dir.path().join("check.sqlite");
        gunzip_file(&artifact.path, &restored)?;
        assert_eq!(fs::read(&restored)?, DB_BYTES);
        Ok(())
    }

    #[test]
    fn test_publish_never_overwrites() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let scratch = dir.path().join("scratch");
        fs::create_dir_all(&scratch)?;
        fs::write(dir.path().join("a.sql.gz"), b"first")?;
        fs::write(scratch.join("a.sql.gz"), b"second")?;

        let published = publish(&scratch.join("a.sql.gz"), dir.path())?;
        assert_eq!(published, dir.path().join("a_1.sql.gz"));
        assert_eq!(fs::read(dir.path().join("a.sql.gz"))?, b"first");
        Ok(())
    }

    #[test]
    fn test_isolated_steps_swallow_only_non_fatal_errors() {
        let offsite = isolated(
            "offsite",
            Err(BackupError::OffsiteReplicationFailed("remote down".into())),
        );
        assert!(offsite.is_ok());

        let retention = isolated("retention", Err(BackupError::Retention("denied".into())));
        assert!(retention.is_ok());

        let fatal = isolated("retention", Err(BackupError::Config("broken".into())));
        assert!(matches!(fatal, Err(BackupError::Config(_))));
    }
}
