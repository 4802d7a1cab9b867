//! Error taxonomy shared by the set, rule and directive stores
//!
//! Every variant names the store it came from and carries the text the OS
//! gave us, so a failure can be diagnosed without re-running anything.

use crate::platform::PlatformError;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Which external store an error originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Store {
    AddressSet,
    FilterRule,
    DirectiveFile,
    HostsFile,
    TunnelDaemon,
}

impl fmt::Display for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Store::AddressSet => "ipset",
            Store::FilterRule => "iptables",
            Store::DirectiveFile => "dnsmasq directives",
            Store::HostsFile => "dnsmasq hosts",
            Store::TunnelDaemon => "tunnel daemon",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{store}: permission denied: {detail}")]
    PermissionDenied { store: Store, detail: String },

    #[error("{store}: backend unavailable: {detail}")]
    BackendUnavailable { store: Store, detail: String },

    #[error("{store}: set '{set}' does not exist")]
    SetNotFound { store: Store, set: String },

    #[error("{store}: entry '{entry}' is not in set '{set}'")]
    EntryNotFound {
        store: Store,
        set: String,
        entry: String,
    },

    #[error("{store}: invalid {kind} '{value}': {reason}")]
    InvalidEntry {
        store: Store,
        kind: &'static str,
        value: String,
        reason: String,
    },

    #[error("{store}: I/O error on {}: {source}", path.display())]
    Io {
        store: Store,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{store}: `{command}` timed out after {after:?}")]
    Timeout {
        store: Store,
        command: String,
        after: Duration,
    },

    #[error("{store}: `{command}` failed: {detail}")]
    CommandFailed {
        store: Store,
        command: String,
        detail: String,
    },
}

impl StoreError {
    /// Tag a process-level failure with the store that issued the command
    pub fn from_platform(store: Store, err: PlatformError) -> Self {
        match err {
            PlatformError::CommandNotFound(program) => StoreError::BackendUnavailable {
                store,
                detail: format!("{} not found in PATH", program),
            },
            PlatformError::ExecDenied { program, message } => StoreError::PermissionDenied {
                store,
                detail: format!("cannot execute {}: {}", program, message),
            },
            PlatformError::TimedOut { command, after } => StoreError::Timeout {
                store,
                command,
                after,
            },
            PlatformError::SpawnError { program, message } => StoreError::BackendUnavailable {
                store,
                detail: format!("{}: {}", program, message),
            },
            PlatformError::UnsupportedPlatform => StoreError::BackendUnavailable {
                store,
                detail: "unsupported platform".to_string(),
            },
        }
    }

    pub(crate) fn invalid(
        store: Store,
        kind: &'static str,
        value: &str,
        reason: impl Into<String>,
    ) -> Self {
        StoreError::InvalidEntry {
            store,
            kind,
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    pub fn store(&self) -> Store {
        match self {
            StoreError::PermissionDenied { store, .. }
            | StoreError::BackendUnavailable { store, .. }
            | StoreError::SetNotFound { store, .. }
            | StoreError::EntryNotFound { store, .. }
            | StoreError::InvalidEntry { store, .. }
            | StoreError::Io { store, .. }
            | StoreError::Timeout { store, .. }
            | StoreError::CommandFailed { store, .. } => *store,
        }
    }

    /// Whether the backend could not be reached at all; a timeout counts.
    /// These failures leave the store untouched and are safe to retry.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            StoreError::BackendUnavailable { .. } | StoreError::Timeout { .. }
        )
    }
}
