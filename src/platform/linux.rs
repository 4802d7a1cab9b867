//! Linux command execution with a bounded timeout

use super::{command_line, CommandOutput, CommandRunner, PlatformError};
use std::io::{self, Read};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct LinuxCommandRunner {
    timeout: Duration,
}

impl LinuxCommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for LinuxCommandRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl CommandRunner for LinuxCommandRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, PlatformError> {
        let line = command_line(program, args);
        debug!("Running: {}", line);

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(program, e))?;

        // Drain both pipes on their own threads so a chatty command (a large
        // `ipset list`) cannot fill the pipe buffer and stall until timeout.
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    kill(&mut child, &line);
                    return Err(PlatformError::TimedOut {
                        command: line,
                        after: self.timeout,
                    });
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    kill(&mut child, &line);
                    return Err(PlatformError::SpawnError {
                        program: program.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        };

        let output = CommandOutput {
            code: status.code(),
            stdout: collect(stdout),
            stderr: collect(stderr),
        };
        debug!("{} exited with {:?}", line, output.code);
        Ok(output)
    }

    fn spawn(&self, program: &str, args: &[&str]) -> Result<u32, PlatformError> {
        debug!("Spawning: {}", command_line(program, args));
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| spawn_error(program, e))?;
        Ok(child.id())
    }
}

fn spawn_error(program: &str, err: io::Error) -> PlatformError {
    match err.kind() {
        io::ErrorKind::NotFound => PlatformError::CommandNotFound(program.to_string()),
        io::ErrorKind::PermissionDenied => PlatformError::ExecDenied {
            program: program.to_string(),
            message: err.to_string(),
        },
        _ => PlatformError::SpawnError {
            program: program.to_string(),
            message: err.to_string(),
        },
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

fn kill(child: &mut Child, line: &str) {
    if let Err(e) = child.kill() {
        warn!("Failed to kill `{}`: {}", line, e);
    }
    let _ = child.wait();
}
