// backuptool/src/utils/process.rs
//! Thin layer over `std::process::Command` so dump, restore and sync tools
//! can be swapped for a recording fake in tests.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;

use tracing::debug;

use crate::errors::{BackupError, IoResultExt, Result};

const STDIN_CHUNK_SIZE: usize = 1024 * 1024;

/// Where the child's stdout goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdoutTarget {
    /// Stream straight into a file (dump direction).
    File(PathBuf),
    Capture,
    Discard,
}

/// One external program call. Arguments are passed as a vector, never
/// through a shell.
#[derive(Clone)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub envs: Vec<(String, String)>,
    pub stdout: StdoutTarget,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Invocation {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            stdout: StdoutTarget::Capture,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Sets a variable for the child process only.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn stdout(mut self, target: StdoutTarget) -> Self {
        self.stdout = target;
        self
    }

    /// Program file name, for log lines and error messages.
    pub fn tool_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        cmd
    }
}

// Environment values routinely carry passwords, so only keys are printed.
impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let env_keys: Vec<&str> = self.envs.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("Invocation")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env_keys", &env_keys)
            .field("stdout", &self.stdout)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    /// `None` when the child was terminated by a signal.
    pub exit_code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    /// Turns a non-zero exit into `ToolExecutionFailed`.
    pub fn check(self, tool: &str) -> Result<ProcessOutput> {
        if self.success {
            Ok(self)
        } else {
            Err(BackupError::tool_failed(tool, self.exit_code, &self.stderr))
        }
    }
}

pub trait ProcessRunner: Send + Sync {
    /// Runs to completion with stdin closed.
    fn run(&self, invocation: &Invocation) -> Result<ProcessOutput>;

    /// Runs with `input` streamed into the child's stdin as it is read.
    fn run_with_stdin(&self, invocation: &Invocation, input: &mut dyn Read)
    -> Result<ProcessOutput>;
}

/// Spawns real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessRunner;

impl SystemProcessRunner {
    fn configure_stdout(cmd: &mut Command, target: &StdoutTarget) -> Result<()> {
        match target {
            StdoutTarget::File(path) => {
                let file = File::create(path).at(path)?;
                cmd.stdout(Stdio::from(file));
            }
            StdoutTarget::Capture => {
                cmd.stdout(Stdio::piped());
            }
            StdoutTarget::Discard => {
                cmd.stdout(Stdio::null());
            }
        }
        Ok(())
    }
}

impl ProcessRunner for SystemProcessRunner {
    fn run(&self, invocation: &Invocation) -> Result<ProcessOutput> {
        debug!(tool = %invocation.tool_name(), args = ?invocation.args_lossy(), "running external tool");

        let mut cmd = invocation.command();
        cmd.stdin(Stdio::null()).stderr(Stdio::piped());
        Self::configure_stdout(&mut cmd, &invocation.stdout)?;

        let output = cmd.output().at(&invocation.program)?;
        Ok(ProcessOutput {
            exit_code: output.status.code(),
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn run_with_stdin(
        &self,
        invocation: &Invocation,
        input: &mut dyn Read,
    ) -> Result<ProcessOutput> {
        debug!(tool = %invocation.tool_name(), args = ?invocation.args_lossy(), "running external tool with piped stdin");

        let mut cmd = invocation.command();
        cmd.stdin(Stdio::piped()).stderr(Stdio::piped());
        Self::configure_stdout(&mut cmd, &invocation.stdout)?;

        let mut child = cmd.spawn().at(&invocation.program)?;

        // Drain the output pipes on their own threads so a chatty child can't
        // block on a full pipe while we are still feeding stdin.
        let stderr_reader = child.stderr.take().map(drain_in_background);
        let stdout_reader = child.stdout.take().map(drain_in_background);

        let mut stdin = child.stdin.take().ok_or_else(|| {
            BackupError::io(
                &invocation.program,
                io::Error::new(io::ErrorKind::BrokenPipe, "child stdin was not captured"),
            )
        })?;
        let feed_result = feed_stdin(input, &mut stdin);

        if let Err(FeedError::Input(err)) = &feed_result {
            // Kill while stdin is still open so the tool never sees a clean EOF
            // after a truncated input.
            let _ = child.kill();
            drop(stdin);
            let _ = child.wait();
            return Err(BackupError::io(
                &invocation.program,
                io::Error::new(err.kind(), format!("failed reading restore input: {}", err)),
            ));
        }
        drop(stdin);

        let status = child.wait().at(&invocation.program)?;
        let stderr = stderr_reader.map(join_drain).unwrap_or_default();
        let stdout = stdout_reader.map(join_drain).unwrap_or_default();

        if let Err(FeedError::Output(err)) = feed_result {
            // A closed pipe just means the tool exited early; its status says why.
            if err.kind() != io::ErrorKind::BrokenPipe && status.success() {
                return Err(BackupError::io(&invocation.program, err));
            }
        }

        Ok(ProcessOutput {
            exit_code: status.code(),
            success: status.success(),
            stdout,
            stderr,
        })
    }
}

enum FeedError {
    Input(io::Error),
    Output(io::Error),
}

fn feed_stdin(input: &mut dyn Read, stdin: &mut impl Write) -> std::result::Result<u64, FeedError> {
    let mut buffer = vec![0u8; STDIN_CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = match input.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(FeedError::Input(e)),
        };
        stdin.write_all(&buffer[..n]).map_err(FeedError::Output)?;
        total += n as u64;
    }
    stdin.flush().map_err(FeedError::Output)?;
    Ok(total)
}

fn drain_in_background<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_drain(handle: thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_hides_env_values() {
        let inv = Invocation::new("mysqldump")
            .arg("--single-transaction")
            .env("MYSQL_PWD", "hunter2");
        let rendered = format!("{:?}", inv);
        assert!(rendered.contains("MYSQL_PWD"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_check_maps_non_zero_exit() {
        let failed = ProcessOutput {
            exit_code: Some(2),
            success: false,
            stdout: String::new(),
            stderr: "access denied\n".into(),
        };
        match failed.check("mysqldump") {
            Err(BackupError::ToolExecutionFailed { tool, code, stderr }) => {
                assert_eq!(tool, "mysqldump");
                assert_eq!(code, Some(2));
                assert_eq!(stderr, "access denied");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_system_runner_streams_stdout_to_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let out = dir.path().join("out.txt");
        let inv = Invocation::new("echo")
            .arg("value with spaces; $(not a subshell)")
            .stdout(StdoutTarget::File(out.clone()));

        let output = SystemProcessRunner.run(&inv)?.check("echo")?;
        assert_eq!(output.exit_code, Some(0));
        assert_eq!(
            std::fs::read_to_string(&out)?,
            "value with spaces; $(not a subshell)\n"
        );
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_system_runner_reports_exit_code_and_stderr() -> anyhow::Result<()> {
        let inv = Invocation::new("sh").args(["-c", "echo broken >&2; exit 3"]);
        let output = SystemProcessRunner.run(&inv)?;
        assert!(!output.success);
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stderr.trim(), "broken");
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_system_runner_passes_env_only_to_child() -> anyhow::Result<()> {
        let inv = Invocation::new("sh")
            .args(["-c", "printf %s \"$BACKUPTOOL_TEST_SECRET\""])
            .env("BACKUPTOOL_TEST_SECRET", "s3cret");
        let output = SystemProcessRunner.run(&inv)?.check("sh")?;
        assert_eq!(output.stdout, "s3cret");
        assert!(std::env::var("BACKUPTOOL_TEST_SECRET").is_err());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_system_runner_pipes_stdin() -> anyhow::Result<()> {
        let payload: Vec<u8> = (0..3 * STDIN_CHUNK_SIZE + 17).map(|i| (i % 251) as u8).collect();
        let inv = Invocation::new("wc").arg("-c");
        let output = SystemProcessRunner
            .run_with_stdin(&inv, &mut payload.as_slice())?
            .check("wc")?;
        assert_eq!(output.stdout.trim(), payload.len().to_string());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_system_runner_early_exit_reports_status() -> anyhow::Result<()> {
        let payload = vec![b'x'; 4 * STDIN_CHUNK_SIZE];
        let inv = Invocation::new("sh").args(["-c", "exit 5"]);
        let output = SystemProcessRunner.run_with_stdin(&inv, &mut payload.as_slice())?;
        assert_eq!(output.exit_code, Some(5));
        Ok(())
    }

    #[test]
    fn test_missing_program_is_io_error() {
        let inv = Invocation::new("/nonexistent/definitely-not-a-tool");
        assert!(matches!(
            SystemProcessRunner.run(&inv),
            Err(BackupError::Io { .. })
        ));
    }
}
