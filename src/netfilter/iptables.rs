//! The single `nat PREROUTING` rule binding a tunnel interface to its set
//!
//! `iptables -A` is not idempotent: appending an identical rule twice makes
//! traffic match twice. Every mutation is therefore preceded by a `-C`
//! existence check.

use super::TunnelIdentity;
use crate::error::{Store, StoreError};
use crate::platform::{command_line, CommandOutput, CommandRunner};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const TABLE: &str = "nat";
pub const CHAIN: &str = "PREROUTING";

/// Match spec for the identity's rule, without table/chain/operation
pub fn rule_spec(identity: &TunnelIdentity) -> Vec<String> {
    [
        "-i",
        identity.interface_name(),
        "-m",
        "set",
        "--match-set",
        identity.set_name(),
        "dst",
        "-j",
        "ACCEPT",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

pub struct FilterRuleTable {
    runner: Arc<dyn CommandRunner>,
    binary: String,
    lock_wait: Duration,
}

impl FilterRuleTable {
    /// `lock_wait` bounds how long iptables waits for the xtables lock held
    /// by another firewall manager before giving up.
    pub fn new(runner: Arc<dyn CommandRunner>, binary: impl Into<String>, lock_wait: Duration) -> Self {
        Self {
            runner,
            binary: binary.into(),
            lock_wait,
        }
    }

    pub fn rule_exists(&self, identity: &TunnelIdentity) -> Result<bool, StoreError> {
        match self.execute("-C", identity) {
            Ok(found) => Ok(found),
            // A rule cannot reference a set the kernel does not have
            Err(StoreError::SetNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Append the rule unless it is already present; returns whether it appended
    pub fn ensure_rule(&self, identity: &TunnelIdentity) -> Result<bool, StoreError> {
        if self.rule_exists(identity)? {
            debug!("Rule for {} already present", identity);
            return Ok(false);
        }
        if !self.execute("-A", identity)? {
            return Err(StoreError::CommandFailed {
                store: Store::FilterRule,
                command: self.command_line("-A", identity),
                detail: "iptables rejected the rule".to_string(),
            });
        }
        info!("Appended {} {} rule for {}", TABLE, CHAIN, identity);
        Ok(true)
    }

    /// Delete the rule if present; returns whether it deleted
    pub fn ensure_rule_absent(&self, identity: &TunnelIdentity) -> Result<bool, StoreError> {
        if !self.rule_exists(identity)? {
            debug!("Rule for {} already absent", identity);
            return Ok(false);
        }
        if !self.execute("-D", identity)? {
            warn!("Rule for {} vanished before it could be deleted", identity);
            return Ok(false);
        }
        info!("Deleted {} {} rule for {}", TABLE, CHAIN, identity);
        Ok(true)
    }

    fn args(&self, op: &str, identity: &TunnelIdentity) -> Vec<String> {
        let mut args = vec![
            "-w".to_string(),
            self.lock_wait.as_secs().max(1).to_string(),
            "-t".to_string(),
            TABLE.to_string(),
            op.to_string(),
            CHAIN.to_string(),
        ];
        args.extend(rule_spec(identity));
        args
    }

    fn command_line(&self, op: &str, identity: &TunnelIdentity) -> String {
        let args = self.args(op, identity);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        command_line(&self.binary, &args)
    }

    /// Ok(true) on success, Ok(false) when iptables reports no matching rule
    fn execute(&self, op: &str, identity: &TunnelIdentity) -> Result<bool, StoreError> {
        let args = self.args(op, identity);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self
            .runner
            .run(&self.binary, &args)
            .map_err(|e| StoreError::from_platform(Store::FilterRule, e))?;
        if output.success() {
            return Ok(true);
        }
        classify(&command_line(&self.binary, &args), identity, &output)
    }
}

fn classify(
    command: &str,
    identity: &TunnelIdentity,
    output: &CommandOutput,
) -> Result<bool, StoreError> {
    let message = output.message();
    let lower = message.to_lowercase();
    let store = Store::FilterRule;

    if lower.contains("does a matching rule exist") || lower.starts_with("iptables: bad rule") {
        Ok(false)
    } else if lower.contains("permission denied") || lower.contains("operation not permitted") {
        Err(StoreError::PermissionDenied {
            store,
            detail: message,
        })
    } else if lower.contains(&format!("set {} doesn't exist", identity.set_name().to_lowercase())) {
        Err(StoreError::SetNotFound {
            store,
            set: identity.set_name().to_string(),
        })
    } else if lower.contains("can't initialize")
        || lower.contains("table does not exist")
        || lower.contains("xtables lock")
        || lower.contains("resource temporarily unavailable")
    {
        Err(StoreError::BackendUnavailable {
            store,
            detail: message,
        })
    } else {
        Err(StoreError::CommandFailed {
            store,
            command: command.to_string(),
            detail: message,
        })
    }
}
