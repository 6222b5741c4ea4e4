pub mod lock;
pub mod process;
pub mod schedule;

use chrono::{DateTime, Utc};
use regex::Regex;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use which::which;

use crate::errors::{BackupError, IoResultExt, Result};

/// Timestamp format used in artifact file names.
pub const FILE_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZIP_MAGIC: [u8; 4] = [b'P', b'K', 0x03, 0x04];

/// Finds an executable in the system PATH.
pub fn find_executable(name: &str) -> Result<PathBuf> {
    which(name).map_err(|_| {
        BackupError::Config(format!(
            "{} executable not found in PATH. Install it or set its path under `binaries` in config.json.",
            name
        ))
    })
}

pub fn file_timestamp(now: DateTime<Utc>) -> String {
    now.format(FILE_TIMESTAMP_FORMAT).to_string()
}

/// Reduces an arbitrary name to something safe inside a file name.
pub fn slugify(name: &str) -> String {
    static UNSAFE: OnceLock<Regex> = OnceLock::new();
    let re = UNSAFE.get_or_init(|| Regex::new(r"[^A-Za-z0-9_]+").expect("static regex"));
    let slug = re.replace_all(name.trim(), "-");
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "db".to_string()
    } else {
        slug.to_string()
    }
}

/// On-disk format of a backup input, sniffed from its leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Gzip,
    Zip,
    Plain,
}

pub fn sniff_format(path: &Path) -> Result<FileFormat> {
    let mut file = File::open(path).at(path)?;
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = file.read(&mut header[filled..]).at(path)?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    if filled >= 2 && header[..2] == GZIP_MAGIC {
        Ok(FileFormat::Gzip)
    } else if filled == 4 && header == ZIP_MAGIC {
        Ok(FileFormat::Zip)
    } else {
        Ok(FileFormat::Plain)
    }
}
