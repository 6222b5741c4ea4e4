// backuptool/src/utils/lock.rs
//! Named, TTL-bounded run locks.
//!
//! A holder that dies without releasing only blocks others until the TTL
//! runs out. `FileLock` serves single-node deployments with several
//! processes; `InMemoryLock` serves tests and single-process embedders.

use chrono::{DateTime, SecondsFormat, Utc};
use fd_lock::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::{BackupError, IoResultExt, Result};
use crate::utils::slugify;

pub const FULL_BACKUP_LOCK: &str = "backup:full";
pub const DB_BACKUP_LOCK: &str = "backup:db";
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub name: String,
    pub token: String,
    pub acquired_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl LockHandle {
    fn new(name: &str, ttl: Duration) -> Self {
        LockHandle {
            name: name.to_string(),
            token: Uuid::new_v4().to_string(),
            acquired_at: Utc::now(),
            ttl,
        }
    }
}

pub trait DistributedLock: Send + Sync {
    /// Atomic check-and-set. `Ok(None)` means someone else holds the lock.
    fn acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockHandle>>;

    /// Idempotent; releasing an expired or already-released handle is a no-op.
    fn release(&self, handle: &LockHandle) -> Result<()>;
}

/// Releases the lock when dropped, whatever path the holder leaves by.
pub struct LockGuard<'a> {
    lock: &'a dyn DistributedLock,
    handle: Option<LockHandle>,
}

impl<'a> LockGuard<'a> {
    pub fn acquire(
        lock: &'a dyn DistributedLock,
        name: &str,
        ttl: Duration,
    ) -> Result<Option<LockGuard<'a>>> {
        Ok(lock.acquire(name, ttl)?.map(|handle| LockGuard {
            lock,
            handle: Some(handle),
        }))
    }

    pub fn name(&self) -> &str {
        self.handle.as_ref().map(|h| h.name.as_str()).unwrap_or_default()
    }

    pub fn release(mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => self.lock.release(&handle),
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.lock.release(&handle) {
                warn!(lock = %handle.name, error = %e, "failed to release run lock; it will expire after its TTL");
            } else {
                debug!(lock = %handle.name, "released run lock");
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryLock {
    held: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DistributedLock for InMemoryLock {
    fn acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockHandle>> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| BackupError::Lock("lock table mutex poisoned".into()))?;
        let now = Instant::now();
        if let Some((_, expires_at)) = held.get(name) {
            if *expires_at > now {
                return Ok(None);
            }
        }
        let handle = LockHandle::new(name, ttl);
        held.insert(name.to_string(), (handle.token.clone(), now + ttl));
        Ok(Some(handle))
    }

    fn release(&self, handle: &LockHandle) -> Result<()> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| BackupError::Lock("lock table mutex poisoned".into()))?;
        if held
            .get(&handle.name)
            .is_some_and(|(token, _)| *token == handle.token)
        {
            held.remove(&handle.name);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    name: String,
    token: String,
    pid: u32,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Lock files under a shared directory. The check-and-set is serialized
/// across processes by an OS advisory lock on a sibling `.guard` file.
#[derive(Debug, Clone)]
pub struct FileLock {
    dir: PathBuf,
}

impl FileLock {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileLock { dir: dir.into() }
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", slugify(name)))
    }

    fn with_guard<T>(&self, name: &str, f: impl FnOnce(&Path) -> Result<T>) -> Result<T> {
        fs::create_dir_all(&self.dir).at(&self.dir)?;
        let guard_path = self.dir.join(format!("{}.guard", slugify(name)));
        let guard_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&guard_path)
            .at(&guard_path)?;
        let mut locker = RwLock::new(guard_file);
        let _guard = locker.write().at(&guard_path)?;
        f(&self.record_path(name))
    }

    fn read_record(path: &Path) -> Result<Option<LockRecord>> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BackupError::io(path, e)),
        };
        match serde_json::from_str(&content) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable lock record");
                Ok(None)
            }
        }
    }
}

impl DistributedLock for FileLock {
    fn acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockHandle>> {
        self.with_guard(name, |record_path| {
            let now = Utc::now();
            if let Some(existing) = Self::read_record(record_path)? {
                if existing.expires_at > now {
                    debug!(lock = %name, holder_pid = existing.pid, "run lock is held");
                    return Ok(None);
                }
                warn!(
                    lock = %name,
                    holder_pid = existing.pid,
                    expired_at = %existing.expires_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                    "taking over expired run lock"
                );
            }

            let handle = LockHandle::new(name, ttl);
            let ttl = chrono::Duration::from_std(ttl)
                .map_err(|e| BackupError::Lock(format!("lock TTL out of range: {}", e)))?;
            let record = LockRecord {
                name: name.to_string(),
                token: handle.token.clone(),
                pid: std::process::id(),
                acquired_at: handle.acquired_at,
                expires_at: handle.acquired_at + ttl,
            };
            let body = serde_json::to_vec(&record)
                .map_err(|e| BackupError::Lock(format!("failed to encode lock record: {}", e)))?;

            let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).at(&self.dir)?;
            tmp.write_all(&body).at(tmp.path())?;
            tmp.persist(record_path)
                .map_err(|e| BackupError::io(record_path, e.error))?;
            Ok(Some(handle))
        })
    }

    fn release(&self, handle: &LockHandle) -> Result<()> {
        self.with_guard(&handle.name, |record_path| {
            match Self::read_record(record_path)? {
                Some(record) if record.token == handle.token => {
                    match fs::remove_file(record_path) {
                        Ok(()) => Ok(()),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                        Err(e) => Err(BackupError::io(record_path, e)),
                    }
                }
                Some(_) => {
                    debug!(lock = %handle.name, "run lock now belongs to another holder; nothing to release");
                    Ok(())
                }
                None => Ok(()),
            }
        })
    }
}
