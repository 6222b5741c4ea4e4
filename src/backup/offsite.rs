// backuptool/src/backup/offsite.rs
use std::fs::File;
use std::path::Path;
use tracing::info;

use crate::config::{OffsiteConfig, Tool, ToolPaths};
use crate::errors::{BackupError, MAX_STDERR_CHARS, Result, truncate_output};
use crate::utils::process::{Invocation, ProcessRunner, StdoutTarget};

fn failed(message: impl Into<String>) -> BackupError {
    BackupError::OffsiteReplicationFailed(message.into())
}

/// `<remote>:<folder>/<file name>`, with stray slashes collapsed.
pub fn remote_destination(config: &OffsiteConfig, bundle: &Path) -> Result<String> {
    let remote = config.remote.trim().trim_end_matches(':');
    if remote.is_empty() {
        return Err(failed("offsite remote name is not configured"));
    }
    let file_name = bundle
        .file_name()
        .ok_or_else(|| failed(format!("bundle has no file name: {}", bundle.display())))?
        .to_string_lossy();

    let folder = config.folder.trim().trim_matches('/');
    if folder.is_empty() {
        Ok(format!("{}:{}", remote, file_name))
    } else {
        Ok(format!("{}:{}/{}", remote, folder, file_name))
    }
}

/// Pushes finished bundles to a remote through `rclone`.
pub struct OffsiteReplicator<'a> {
    runner: &'a dyn ProcessRunner,
    tools: &'a ToolPaths,
    config: &'a OffsiteConfig,
}

impl<'a> OffsiteReplicator<'a> {
    pub fn new(
        runner: &'a dyn ProcessRunner,
        tools: &'a ToolPaths,
        config: &'a OffsiteConfig,
    ) -> Self {
        OffsiteReplicator { runner, tools, config }
    }

    /// Copies `bundle` to the remote. Every failure is reported as
    /// `OffsiteReplicationFailed` so callers can treat it as non-fatal.
    pub fn replicate(&self, bundle: &Path) -> Result<String> {
        if !bundle.is_file() {
            return Err(failed(format!("bundle not found: {}", bundle.display())));
        }
        File::open(bundle)
            .map_err(|e| failed(format!("bundle {} is not readable: {}", bundle.display(), e)))?;

        let destination = remote_destination(self.config, bundle)?;

        if let Some(config_path) = &self.config.config_path {
            if !config_path.is_file() {
                return Err(failed(format!(
                    "rclone config file not found: {}",
                    config_path.display()
                )));
            }
        }

        let program = self
            .tools
            .resolve(Tool::Rclone)
            .map_err(|e| failed(e.to_string()))?;

        let mut invocation = Invocation::new(program)
            .arg("copyto")
            .arg(bundle)
            .arg(&destination)
            .stdout(StdoutTarget::Capture);
        if let Some(config_path) = &self.config.config_path {
            invocation = invocation.arg("--config").arg(config_path);
        }
        let invocation = invocation.args(&self.config.flags);

        info!(bundle = %bundle.display(), destination = %destination, "replicating bundle offsite");
        let output = self
            .runner
            .run(&invocation)
            .map_err(|e| failed(e.to_string()))?;
        if !output.success {
            let code = output
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(failed(format!(
                "rclone exited with {}: {}",
                code,
                truncate_output(output.stderr.trim(), MAX_STDERR_CHARS)
            )));
        }

        info!(destination = %destination, "offsite copy finished");
        Ok(destination)
    }
}
