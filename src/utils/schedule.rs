// backuptool/src/utils/schedule.rs
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::errors::{BackupError, IoResultExt, Result};

pub const LAST_RUN_AT_KEY: &str = "backup.last_run_at";
pub const FREQUENCY_HOURS_KEY: &str = "backup.frequency_hours";
pub const DEFAULT_FREQUENCY_HOURS: u32 = 12;

/// Decides whether a periodic run is due. `force` always wins; otherwise a
/// missing or unparseable `last_run_at` is due, and so is any run whose
/// whole elapsed hours reach `frequency_hours`.
pub fn is_due(
    last_run_at: Option<&str>,
    frequency_hours: u32,
    force: bool,
    now: DateTime<Utc>,
) -> bool {
    if force {
        return true;
    }
    let Some(last_run) = last_run_at.and_then(parse_timestamp) else {
        return true;
    };
    let frequency = i64::from(frequency_hours.max(1));
    (now - last_run).num_hours() >= frequency
}

/// Accepts RFC 3339 as well as the `YYYY-MM-DD HH:MM:SS` form settings stores
/// commonly hold (read as UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
        .ok()
        .map(|naive| naive.and_utc())
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Absent means the default; anything present is clamped to at least one hour.
pub fn coerce_frequency_hours(raw: Option<&str>) -> u32 {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return DEFAULT_FREQUENCY_HOURS;
    };
    let hours = raw
        .parse::<i64>()
        .ok()
        .or_else(|| raw.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f as i64))
        .unwrap_or(0);
    hours.clamp(1, i64::from(u32::MAX)) as u32
}

/// Key/value settings store holding the schedule state.
pub trait ScheduleStateStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Snapshot of the schedule settings read before a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleState {
    pub last_run_at: Option<String>,
    pub frequency_hours: u32,
}

impl ScheduleState {
    /// Reads both settings; `fallback_frequency` applies when the store has none.
    pub fn load(store: &dyn ScheduleStateStore, fallback_frequency: u32) -> Result<Self> {
        let last_run_at = store.get(LAST_RUN_AT_KEY)?;
        let frequency_hours = match store.get(FREQUENCY_HOURS_KEY)? {
            Some(raw) => coerce_frequency_hours(Some(&raw)),
            None => fallback_frequency.max(1),
        };
        Ok(ScheduleState {
            last_run_at,
            frequency_hours,
        })
    }

    pub fn is_due(&self, force: bool, now: DateTime<Utc>) -> bool {
        is_due(self.last_run_at.as_deref(), self.frequency_hours, force, now)
    }
}

/// Settings persisted as a flat JSON object on disk, rewritten atomically.
#[derive(Debug)]
pub struct JsonFileStateStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonFileStateStore {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(BackupError::io(&self.path, e)),
        };
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        let values: BTreeMap<String, serde_json::Value> = serde_json::from_str(&content)
            .map_err(|e| {
                BackupError::State(format!(
                    "settings file {} is not a JSON object: {}",
                    self.path.display(),
                    e
                ))
            })?;
        Ok(values
            .into_iter()
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect())
    }
}

impl ScheduleStateStore for JsonFileStateStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read_all()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| BackupError::State("settings store mutex poisoned".into()))?;

        let mut values = self.read_all()?;
        values.insert(key.to_string(), value.to_string());

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).at(parent)?;

        let body = serde_json::to_vec_pretty(&values)
            .map_err(|e| BackupError::State(format!("failed to encode settings: {}", e)))?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent).at(parent)?;
        std::io::Write::write_all(&mut tmp, &body).at(tmp.path())?;
        tmp.persist(&self.path)
            .map_err(|e| BackupError::io(&self.path, e.error))?;
        Ok(())
    }
}

/// Store used by tests and by embedders that keep settings elsewhere.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ScheduleStateStore for InMemoryStateStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self
            .values
            .lock()
            .map_err(|_| BackupError::State("state mutex poisoned".into()))?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| BackupError::State("state mutex poisoned".into()))?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}
