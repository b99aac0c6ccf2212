// src/exec.rs

//! External command execution.
//!
//! Everything that touches the running system goes through a
//! `CommandExecutor`, which makes the whole mutation layer substitutable in
//! tests and gives one place for dry-run handling. Key features:
//!
//! - Timeout protection (default 300 seconds); a timed-out command is
//!   reported exactly like a failed one
//! - stdin nullification to prevent hangs
//! - Dry-run mode: the intended command is logged and synthetic success
//!   is returned without spawning anything

use crate::error::{Error, Result};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

/// Default timeout for external commands
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Captured output of one external command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code (-1 if terminated by signal)
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Synthetic success, used by dry-run execution
    pub fn empty_success() -> Self {
        Self {
            status: 0,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// stdout and stderr joined, for error reports
    pub fn combined(&self) -> String {
        let mut out = self.stdout.trim_end().to_string();
        let err = self.stderr.trim_end();
        if !err.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(err);
        }
        out
    }
}

/// Runs external OS commands (or simulates them in dry-run mode)
pub trait CommandExecutor: Send + Sync {
    /// Run a command to completion and capture its output
    ///
    /// Returns `Ok` with the captured output regardless of exit status;
    /// `Err` only when the command could not be run at all (spawn failure
    /// or timeout).
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;

    /// Whether this executor simulates instead of mutating
    fn is_dry_run(&self) -> bool {
        false
    }

    /// Run a command and fail with `CommandFailed` on non-zero exit
    fn run_checked(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let output = self.run(program, args)?;
        if output.success() {
            Ok(output)
        } else {
            Err(Error::command_failed(program, args, output.combined()))
        }
    }
}

/// Executor backed by real subprocesses
pub struct ShellExecutor {
    dry_run: bool,
    timeout: Duration,
}

impl ShellExecutor {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set a custom timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl CommandExecutor for ShellExecutor {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        if self.dry_run {
            info!("dry-run: {} {}", program, args.join(" "));
            return Ok(CommandOutput::empty_success());
        }

        debug!("exec: {} {}", program, args.join(" "));

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::command_failed(program, args, format!("failed to spawn: {}", e))
            })?;

        match child.wait_timeout(self.timeout)? {
            Some(status) => {
                let output = child.wait_with_output()?;
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                let code = status.code().unwrap_or(-1);

                if code != 0 {
                    warn!("{} exited with code {}", program, code);
                }

                Ok(CommandOutput {
                    status: code,
                    stdout,
                    stderr,
                })
            }
            None => {
                // Timed out: kill and report as a failure
                let _ = child.kill();
                let _ = child.wait();
                Err(Error::command_failed(
                    program,
                    args,
                    format!("timed out after {} seconds", self.timeout.as_secs()),
                ))
            }
        }
    }

    fn is_dry_run(&self) -> bool {
        self.dry_run
    }
}
