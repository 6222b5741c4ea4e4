use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Upper bound on captured tool output carried inside an error.
pub const MAX_STDERR_CHARS: usize = 2000;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{tool} exited with status {}: {stderr}", code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))]
    ToolExecutionFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Restore refused: {0}")]
    RestoreRefused(String),

    #[error("Offsite replication failed: {0}")]
    OffsiteReplicationFailed(String),

    #[error("Retention pass failed: {0}")]
    Retention(String),

    #[error("Lock store error: {0}")]
    Lock(String),

    #[error("Schedule state error: {0}")]
    State(String),
}

impl BackupError {
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        BackupError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn tool_failed(tool: impl Into<String>, code: Option<i32>, stderr: &str) -> Self {
        BackupError::ToolExecutionFailed {
            tool: tool.into(),
            code,
            stderr: truncate_output(stderr.trim(), MAX_STDERR_CHARS),
        }
    }

    /// Whether this error aborts a backup pipeline. Offsite and retention
    /// failures are isolated to their own step.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            BackupError::OffsiteReplicationFailed(_) | BackupError::Retention(_)
        )
    }
}

/// Attaches the offending path to a raw `io::Error`.
pub trait IoResultExt<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::result::Result<T, io::Error> {
    fn at(self, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|e| BackupError::io(path, e))
    }
}

/// Truncates to at most `max_chars` characters, never splitting a code point.
pub fn truncate_output(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}… [truncated]", &text[..byte_idx]),
        None => text.to_string(),
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
