//! Bounded execution of external probe tools
//!
//! Hardware detection and the resource sampler shell out to tools such as
//! `nvidia-smi`. A wedged driver can make those tools hang indefinitely, so
//! every invocation goes through [`run_with_timeout`], which kills and reaps
//! the child once the deadline passes.

use std::io::{self, Read};
use std::process::{Child, Command, Output, Stdio};
use std::time::Duration;
use tracing::{trace, warn};
use wait_timeout::ChildExt;

use crate::error::HardwareError;

/// Timeout used by detection probes
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Shorter timeout for the periodic sampler, which must not fall behind its interval
pub const SAMPLE_TIMEOUT: Duration = Duration::from_secs(2);

/// Outcome of a bounded command
#[derive(Debug)]
pub enum CommandResult {
    /// The process exited before the deadline (any status)
    Success(Output),
    /// The process was killed at the deadline
    Timeout,
    /// The process could not be started (usually: tool not installed)
    SpawnError(io::Error),
}

impl CommandResult {
    pub fn output(self) -> Option<Output> {
        match self {
            CommandResult::Success(output) => Some(output),
            _ => None,
        }
    }

    pub fn completed(&self) -> bool {
        matches!(self, CommandResult::Success(_))
    }

    pub fn timed_out(&self) -> bool {
        matches!(self, CommandResult::Timeout)
    }

    /// Collapse into the stdout of a successful exit.
    ///
    /// Non-zero exits, timeouts and spawn failures all become
    /// [`HardwareError::CommandFailed`] tagged with `program`.
    pub fn into_stdout(self, program: &str) -> Result<String, HardwareError> {
        match self {
            CommandResult::Success(output) if output.status.success() => {
                Ok(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            CommandResult::Success(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(HardwareError::command(program, format!("{}: {}", output.status, stderr.trim())))
            }
            CommandResult::Timeout => Err(HardwareError::command(program, "timed out")),
            CommandResult::SpawnError(e) => Err(HardwareError::command(program, e.to_string())),
        }
    }
}

fn drain<R: Read>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf);
    }
    buf
}

fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Run `cmd` capturing stdout/stderr, killing it after `timeout`.
///
/// # Example
/// ```no_run
/// use std::process::Command;
/// use solollm_core::command::{run_with_timeout, DEFAULT_TIMEOUT};
///
/// let mut cmd = Command::new("nvidia-smi");
/// cmd.args(["--query-gpu=name", "--format=csv,noheader"]);
/// if let Some(output) = run_with_timeout(&mut cmd, DEFAULT_TIMEOUT).output() {
///     println!("{}", String::from_utf8_lossy(&output.stdout));
/// }
/// ```
pub fn run_with_timeout(cmd: &mut Command, timeout: Duration) -> CommandResult {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            trace!(error = %e, "Probe command failed to spawn");
            return CommandResult::SpawnError(e);
        }
    };

    match child.wait_timeout(timeout) {
        Ok(Some(status)) => CommandResult::Success(Output {
            status,
            stdout: drain(child.stdout.take()),
            stderr: drain(child.stderr.take()),
        }),
        Ok(None) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "Probe command timed out, killing it");
            kill_and_reap(&mut child);
            CommandResult::Timeout
        }
        Err(e) => {
            warn!(error = %e, "Error waiting for probe command");
            kill_and_reap(&mut child);
            CommandResult::SpawnError(e)
        }
    }
}

/// Run `program args...` and return its stdout, or a `HardwareError`
pub fn probe(program: &str, args: &[&str], timeout: Duration) -> Result<String, HardwareError> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    run_with_timeout(&mut cmd, timeout).into_stdout(program)
}
