//! Tunnel client process control and reachability probe
//!
//! The tunnel client (xray, v2ray, ...) is an external collaborator: we only
//! start it, stop it, ask whether it is alive, and time a request through it.

use crate::error::{Store, StoreError};
use crate::platform::{command_line, CommandRunner};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("Probe of {target} timed out after {after:?}")]
    Timeout { target: String, after: Duration },
    #[error("Invalid probe target: {0:?}")]
    InvalidTarget(String),
}

pub struct TunnelDaemon {
    runner: Arc<dyn CommandRunner>,
    binary: String,
    pidof: String,
    pkill: String,
}

impl TunnelDaemon {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        binary: impl Into<String>,
        pidof: impl Into<String>,
        pkill: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            binary: binary.into(),
            pidof: pidof.into(),
            pkill: pkill.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Process-liveness check by name
    pub fn is_running(&self) -> Result<bool, StoreError> {
        let output = self
            .runner
            .run(&self.pidof, &[self.binary.as_str()])
            .map_err(|e| StoreError::from_platform(Store::TunnelDaemon, e))?;
        match output.code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(StoreError::CommandFailed {
                store: Store::TunnelDaemon,
                command: command_line(&self.pidof, &[self.binary.as_str()]),
                detail: output.message(),
            }),
        }
    }

    /// Start the client detached; returns `None` if it was already running
    pub fn start(&self, config_path: &Path) -> Result<Option<u32>, StoreError> {
        if self.is_running()? {
            debug!("{} already running", self.binary);
            return Ok(None);
        }
        if !config_path.exists() {
            return Err(StoreError::Io {
                store: Store::TunnelDaemon,
                path: config_path.to_path_buf(),
                source: io::Error::new(io::ErrorKind::NotFound, "tunnel client config not found"),
            });
        }

        let config = config_path.to_string_lossy();
        let pid = self
            .runner
            .spawn(&self.binary, &["run", "-config", config.as_ref()])
            .map_err(|e| StoreError::from_platform(Store::TunnelDaemon, e))?;
        info!("Started {} (pid {})", self.binary, pid);
        Ok(Some(pid))
    }

    /// Stop every instance; returns false if none was running
    pub fn stop(&self) -> Result<bool, StoreError> {
        let output = self
            .runner
            .run(&self.pkill, &[self.binary.as_str()])
            .map_err(|e| StoreError::from_platform(Store::TunnelDaemon, e))?;
        match output.code {
            Some(0) => {
                info!("Stopped {}", self.binary);
                Ok(true)
            }
            Some(1) => Ok(false),
            _ => Err(StoreError::CommandFailed {
                store: Store::TunnelDaemon,
                command: command_line(&self.pkill, &[self.binary.as_str()]),
                detail: output.message(),
            }),
        }
    }
}

/// Turn a bare host into an https URL; explicit schemes are kept
pub fn probe_url(target: &str) -> Result<String, ProbeError> {
    let target = target.trim();
    if target.is_empty() || target.chars().any(char::is_whitespace) {
        return Err(ProbeError::InvalidTarget(target.to_string()));
    }
    if target.starts_with("http://") || target.starts_with("https://") {
        Ok(target.to_string())
    } else {
        Ok(format!("https://{}", target))
    }
}

/// Time a GET request to `target`. Any HTTP response counts as reachable.
pub async fn probe(target: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let url = probe_url(target)?;
    // Direct connection only: the point is to exercise the tunnel route
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .no_proxy()
        .build()?;

    debug!("Probing {}", url);
    let started = Instant::now();
    match client.get(&url).send().await {
        Ok(response) => {
            let elapsed = started.elapsed();
            debug!("{} answered {} in {:?}", url, response.status(), elapsed);
            Ok(elapsed)
        }
        Err(e) if e.is_timeout() => Err(ProbeError::Timeout {
            target: url,
            after: timeout,
        }),
        Err(e) => Err(e.into()),
    }
}
