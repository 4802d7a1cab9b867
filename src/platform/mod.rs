//! Platform-specific command execution
//!
//! Every interaction with ipset, iptables and the tunnel daemon goes through
//! [`CommandRunner`], so the stores never spawn processes themselves and
//! tests can substitute a simulated host.

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(test)]
pub(crate) mod fake;

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Command not found: {0}")]
    CommandNotFound(String),
    #[error("Not permitted to execute {program}: {message}")]
    ExecDenied { program: String, message: String },
    #[error("Command `{command}` timed out after {after:?}")]
    TimedOut { command: String, after: Duration },
    #[error("Failed to run {program}: {message}")]
    SpawnError { program: String, message: String },
    #[error("Unsupported platform")]
    UnsupportedPlatform,
}

/// Captured result of a command that ran to completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if the process was killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Stderr trimmed, falling back to stdout for tools that report there
    pub fn message(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Platform-agnostic external command interface
pub trait CommandRunner: Send + Sync {
    /// Run `program` to completion and capture its output
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, PlatformError>;

    /// Start `program` detached and return its pid
    fn spawn(&self, program: &str, args: &[&str]) -> Result<u32, PlatformError>;
}

/// Render a command line for logs and error messages
pub fn command_line(program: &str, args: &[&str]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Get the command runner for the current platform
pub fn get_command_runner(timeout: Duration) -> Result<Box<dyn CommandRunner>, PlatformError> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(linux::LinuxCommandRunner::new(timeout)))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = timeout;
        Err(PlatformError::UnsupportedPlatform)
    }
}
