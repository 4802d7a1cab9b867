//! Kernel address set management via the `ipset` tool

use super::{validate_set_name, SetKind};
use crate::error::{Store, StoreError};
use crate::platform::{command_line, CommandOutput, CommandRunner};
use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};

const MEMBERS_HEADER: &str = "Members:";

pub struct AddressSetStore {
    runner: Arc<dyn CommandRunner>,
    binary: String,
}

impl AddressSetStore {
    pub fn new(runner: Arc<dyn CommandRunner>, binary: impl Into<String>) -> Self {
        Self {
            runner,
            binary: binary.into(),
        }
    }

    /// Create the set if it does not exist. Existing membership is untouched.
    pub fn ensure_set(&self, name: &str, kind: SetKind) -> Result<(), StoreError> {
        validate_set_name(name)?;
        self.expect_success(&["create", name, kind.ipset_type(), "-exist"], name, None)?;
        debug!("ipset {} ({}) present", name, kind);
        Ok(())
    }

    pub fn set_exists(&self, name: &str) -> Result<bool, StoreError> {
        validate_set_name(name)?;
        match self.expect_success(&["list", name, "-terse"], name, None) {
            Ok(_) => Ok(true),
            Err(StoreError::SetNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Destroy the set; returns false if it was already gone.
    /// Fails while a firewall rule still references it.
    pub fn destroy_set(&self, name: &str) -> Result<bool, StoreError> {
        validate_set_name(name)?;
        match self.expect_success(&["destroy", name], name, None) {
            Ok(_) => {
                info!("Destroyed ipset {}", name);
                Ok(true)
            }
            Err(StoreError::SetNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Add an address or CIDR. Adding a present member succeeds.
    pub fn add_member(&self, name: &str, entry: &str) -> Result<(), StoreError> {
        let entry = parse_entry(entry)?;
        self.expect_success(&["add", name, entry.as_str(), "-exist"], name, Some(&entry))?;
        info!("Added {} to ipset {}", entry, name);
        Ok(())
    }

    /// Remove a member. Unlike [`add_member`](Self::add_member) this is not
    /// idempotent: a missing member fails with `EntryNotFound`.
    pub fn remove_member(&self, name: &str, entry: &str) -> Result<(), StoreError> {
        let entry = parse_entry(entry)?;
        self.expect_success(&["del", name, entry.as_str()], name, Some(&entry))?;
        info!("Removed {} from ipset {}", entry, name);
        Ok(())
    }

    /// Current members, re-read from the kernel on every call
    pub fn list_members(&self, name: &str) -> Result<Members, StoreError> {
        validate_set_name(name)?;
        let output = self.expect_success(&["list", name], name, None)?;
        Ok(Members::new(output.stdout))
    }

    fn expect_success(
        &self,
        args: &[&str],
        set: &str,
        entry: Option<&str>,
    ) -> Result<CommandOutput, StoreError> {
        let output = self
            .runner
            .run(&self.binary, args)
            .map_err(|e| StoreError::from_platform(Store::AddressSet, e))?;
        if output.success() {
            Ok(output)
        } else {
            Err(classify(&command_line(&self.binary, args), set, entry, &output))
        }
    }
}

/// Accept an IP address or CIDR literal, returned trimmed
pub fn parse_entry(entry: &str) -> Result<String, StoreError> {
    let trimmed = entry.trim();
    if trimmed.parse::<IpAddr>().is_ok() || trimmed.parse::<IpNet>().is_ok() {
        Ok(trimmed.to_string())
    } else {
        Err(StoreError::invalid(
            Store::AddressSet,
            "entry",
            entry,
            "not an IP address or CIDR network",
        ))
    }
}

fn classify(command: &str, set: &str, entry: Option<&str>, output: &CommandOutput) -> StoreError {
    let message = output.message();
    let lower = message.to_lowercase();
    let store = Store::AddressSet;

    if lower.contains("operation not permitted") || lower.contains("permission denied") {
        StoreError::PermissionDenied {
            store,
            detail: message,
        }
    } else if lower.contains("cannot open session to kernel")
        || lower.contains("protocol error")
        || lower.contains("address family not supported")
    {
        StoreError::BackendUnavailable {
            store,
            detail: message,
        }
    } else if lower.contains("set with the given name does not exist") {
        StoreError::SetNotFound {
            store,
            set: set.to_string(),
        }
    } else if let (Some(entry), true) = (entry, lower.contains("it's not added")) {
        StoreError::EntryNotFound {
            store,
            set: set.to_string(),
            entry: entry.to_string(),
        }
    } else if let (Some(entry), true) = (
        entry,
        lower.contains("syntax error")
            || lower.contains("cannot parse")
            || lower.contains("out of range")
            || lower.contains("invalid"),
    ) {
        StoreError::InvalidEntry {
            store,
            kind: "entry",
            value: entry.to_string(),
            reason: message,
        }
    } else {
        StoreError::CommandFailed {
            store,
            command: command.to_string(),
            detail: message,
        }
    }
}

/// Lazily parsed members of one `ipset list` snapshot.
///
/// Yields each trimmed, non-empty line after the `Members:` header.
#[derive(Debug, Clone)]
pub struct Members {
    listing: String,
    pos: usize,
}

impl Members {
    fn new(listing: String) -> Self {
        let mut offset = 0;
        let mut pos = listing.len();
        for line in listing.split_inclusive('\n') {
            offset += line.len();
            if line.starts_with(MEMBERS_HEADER) {
                pos = offset;
                break;
            }
        }
        Self { listing, pos }
    }
}

impl Iterator for Members {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        while self.pos < self.listing.len() {
            let rest = &self.listing[self.pos..];
            let (line, advance) = match rest.find('\n') {
                Some(idx) => (&rest[..idx], idx + 1),
                None => (rest, rest.len()),
            };
            self.pos += advance;
            let line = line.trim();
            if !line.is_empty() {
                return Some(line.to_string());
            }
        }
        None
    }
}
