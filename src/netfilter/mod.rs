//! Kernel address sets (ipset) and the packet-filter rule (iptables)
//!
//! Both stores are thin, stateless clients over a [`CommandRunner`]: every
//! query re-asks the kernel, nothing is cached.
//!
//! [`CommandRunner`]: crate::platform::CommandRunner

pub mod ipset;
pub mod iptables;

pub use ipset::{AddressSetStore, Members};
pub use iptables::FilterRuleTable;

use crate::error::{Store, StoreError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kernel limit on set names, excluding the terminating NUL
pub const MAX_SET_NAME_LEN: usize = 31;

/// Kernel limit on interface names, excluding the terminating NUL
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Element kind of a kernel address set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetKind {
    /// Individual addresses (`hash:ip`)
    #[default]
    Address,
    /// CIDR networks (`hash:net`)
    Network,
}

impl SetKind {
    pub fn ipset_type(&self) -> &'static str {
        match self {
            SetKind::Address => "hash:ip",
            SetKind::Network => "hash:net",
        }
    }
}

impl fmt::Display for SetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ipset_type())
    }
}

impl FromStr for SetKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "address" | "hash:ip" => Ok(SetKind::Address),
            "network" | "hash:net" => Ok(SetKind::Network),
            _ => Err(StoreError::invalid(
                Store::AddressSet,
                "set kind",
                s,
                "expected 'address' or 'network'",
            )),
        }
    }
}

/// The (interface, set) pair one split-tunnel policy binds together
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelIdentity {
    interface_name: String,
    set_name: String,
}

impl TunnelIdentity {
    pub fn new(
        interface_name: impl Into<String>,
        set_name: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let interface_name = interface_name.into();
        let set_name = set_name.into();
        validate_interface_name(&interface_name)?;
        validate_set_name(&set_name)?;
        Ok(Self {
            interface_name,
            set_name,
        })
    }

    pub fn interface_name(&self) -> &str {
        &self.interface_name
    }

    pub fn set_name(&self) -> &str {
        &self.set_name
    }
}

impl fmt::Display for TunnelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.interface_name, self.set_name)
    }
}

pub fn validate_set_name(name: &str) -> Result<(), StoreError> {
    let invalid = |reason: &str| StoreError::invalid(Store::AddressSet, "set name", name, reason);
    if name.is_empty() {
        return Err(invalid("empty"));
    }
    if name.len() > MAX_SET_NAME_LEN {
        return Err(invalid("longer than 31 bytes"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(invalid("only ASCII letters, digits, '_', '-' and '.' are allowed"));
    }
    Ok(())
}

fn validate_interface_name(name: &str) -> Result<(), StoreError> {
    let invalid = |reason: &str| StoreError::invalid(Store::FilterRule, "interface", name, reason);
    if name.is_empty() {
        return Err(invalid("empty"));
    }
    if name.len() > MAX_INTERFACE_NAME_LEN {
        return Err(invalid("longer than 15 bytes"));
    }
    if name.chars().any(|c| c.is_whitespace() || c == '/') {
        return Err(invalid("contains whitespace or '/'"));
    }
    Ok(())
}
