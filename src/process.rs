//! External command execution.
//!
//! [`Cmd`] is the builder used for one-off host tool invocations, and
//! [`Runner`] is the seam components take so tests can record commands
//! instead of running them.

use anyhow::{bail, Context, Result};
use std::ffi::OsString;
use std::path::Path;
use std::process::{Command, ExitStatus};

/// Runs external commands and returns their combined output.
pub trait Runner: Send + Sync {
    /// Run `command` with `args`. On a non-zero exit the error carries the
    /// captured output, and the output is returned through the error context.
    fn run(&self, command: &str, args: &[&str]) -> Result<Vec<u8>>;

    /// Whether `command` resolves on `PATH`.
    fn command_exists(&self, command: &str) -> bool {
        crate::preflight::command_exists(command)
    }
}

/// Runner backed by real host processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealRunner;

impl Runner for RealRunner {
    fn run(&self, command: &str, args: &[&str]) -> Result<Vec<u8>> {
        tracing::debug!(command, ?args, "running command");
        let result = Cmd::new(command).args(args.iter().copied()).allow_fail().run()?;
        let mut out = result.stdout.into_bytes();
        out.extend_from_slice(result.stderr.as_bytes());
        if !result.status.success() {
            bail!(
                "{} failed ({}): {}",
                command,
                result.status,
                String::from_utf8_lossy(&out).trim()
            );
        }
        Ok(out)
    }
}

/// Captured result of a finished command.
#[derive(Debug)]
pub struct CommandResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Small builder over [`std::process::Command`].
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    error_msg: Option<String>,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            error_msg: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.as_os_str().to_owned());
        self
    }

    /// Message prefixed to the error when the command exits non-zero.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Return the result instead of an error on non-zero exit.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    pub fn run(self) -> Result<CommandResult> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .output()
            .with_context(|| format!("Failed to execute {}", self.program))?;

        let result = CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() && !self.allow_fail {
            let msg = self
                .error_msg
                .unwrap_or_else(|| format!("{} failed", self.program));
            bail!("{} ({}): {}", msg, result.status, result.stderr.trim());
        }

        Ok(result)
    }
}
