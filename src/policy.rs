//! Split-tunnel policy: drives the set, directive and rule stores together
//!
//! Per tunnel identity the host moves through
//! `Uninitialized → SetReady → RuleActive`. Each step of [`enable`] and
//! [`disable`] is either idempotent or check-before-write, so after a
//! partial failure the whole call can simply be run again. There is no
//! rollback across stores.
//!
//! [`enable`]: SplitTunnelPolicy::enable
//! [`disable`]: SplitTunnelPolicy::disable

use crate::config::Config;
use crate::daemon::{self, TunnelDaemon};
use crate::dns::hosts::ADDN_HOSTS_PREFIX;
use crate::dns::{normalize_domain, normalize_domains, DirectiveFile, HostsFile};
use crate::error::StoreError;
use crate::netfilter::{AddressSetStore, FilterRuleTable, Members, SetKind, TunnelIdentity};
use crate::platform::CommandRunner;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where a tunnel identity currently sits, as observed on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyState {
    Uninitialized,
    SetReady,
    RuleActive,
}

/// Result of timing a request through the tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Reachable {
        #[serde(rename = "latency_ms", serialize_with = "as_millis")]
        latency: Duration,
    },
    Failed {
        error: String,
    },
}

fn as_millis<S: Serializer>(latency: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(latency.as_millis() as u64)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelStatus {
    pub tunnel_process_running: bool,
    pub rule_active: bool,
    pub probe_target: Option<String>,
    /// Only measured while the tunnel process is running
    pub probe: Option<ProbeOutcome>,
}

/// Singleton resolver directives applied on every `enable`
#[derive(Debug, Clone, Default)]
pub struct ResolverSettings {
    pub server: Option<String>,
    pub port: Option<u16>,
}

pub struct SplitTunnelPolicy {
    sets: AddressSetStore,
    rules: FilterRuleTable,
    directives: DirectiveFile,
    hosts: HostsFile,
    daemon: TunnelDaemon,
    set_kind: SetKind,
    resolver: ResolverSettings,
}

impl SplitTunnelPolicy {
    pub fn new(
        sets: AddressSetStore,
        rules: FilterRuleTable,
        directives: DirectiveFile,
        hosts: HostsFile,
        daemon: TunnelDaemon,
        set_kind: SetKind,
    ) -> Self {
        Self {
            sets,
            rules,
            directives,
            hosts,
            daemon,
            set_kind,
            resolver: ResolverSettings::default(),
        }
    }

    pub fn with_resolver(mut self, resolver: ResolverSettings) -> Self {
        self.resolver = resolver;
        self
    }

    /// Build every store from config, sharing one command runner
    pub fn from_config(config: &Config, runner: Arc<dyn CommandRunner>) -> Self {
        let commands = &config.commands;
        Self::new(
            AddressSetStore::new(runner.clone(), &commands.ipset),
            FilterRuleTable::new(runner.clone(), &commands.iptables, config.iptables_lock_wait()),
            DirectiveFile::new(&config.dnsmasq.directive_file),
            HostsFile::new(&config.dnsmasq.hosts_file),
            TunnelDaemon::new(runner, &config.daemon.binary, &commands.pidof, &commands.pkill),
            config.tunnel.set_kind,
        )
        .with_resolver(ResolverSettings {
            server: config.dnsmasq.server.clone(),
            port: config.dnsmasq.port,
        })
    }

    pub fn directives(&self) -> &DirectiveFile {
        &self.directives
    }

    pub fn hosts(&self) -> &HostsFile {
        &self.hosts
    }

    pub fn daemon(&self) -> &TunnelDaemon {
        &self.daemon
    }

    /// Converge the host on: set present, exactly `domains` directed at it,
    /// one rule. The rule goes in last so nothing matches a half-built set.
    pub fn enable<S: AsRef<str>>(
        &self,
        identity: &TunnelIdentity,
        domains: &[S],
    ) -> Result<(), StoreError> {
        // Validate everything before touching any store
        let domains = normalize_domains(domains)?;
        info!("Enabling {} with {} domain(s)", identity, domains.len());

        self.sets.ensure_set(identity.set_name(), self.set_kind)?;

        if let Some(server) = &self.resolver.server {
            self.directives.set_server(server)?;
        }
        if let Some(port) = self.resolver.port {
            self.directives.set_port(port)?;
        }
        self.directives.sync_set_domains(identity.set_name(), &domains)?;

        // Pinned names are answered locally, so their addresses go in directly
        for addresses in self.hosts.entries()?.into_values() {
            self.load_pinned(identity, &addresses)?;
        }

        if self.rules.ensure_rule(identity)? {
            info!("Tunnel {} is active", identity);
        } else {
            debug!("Tunnel {} was already active", identity);
        }
        Ok(())
    }

    /// Remove the rule, then the identity's domain directives.
    /// Returns the domains whose directives were removed.
    pub fn disable(&self, identity: &TunnelIdentity) -> Result<Vec<String>, StoreError> {
        info!("Disabling {}", identity);
        // Rule first: traffic must stop matching before directives go away
        self.rules.ensure_rule_absent(identity)?;
        let removed = self.directives.remove_set_directives(identity.set_name())?;
        Ok(removed)
    }

    /// [`disable`](Self::disable), then destroy the set
    pub fn teardown(&self, identity: &TunnelIdentity) -> Result<Vec<String>, StoreError> {
        let removed = self.disable(identity)?;
        if self.sets.destroy_set(identity.set_name())? {
            info!("Tunnel {} torn down", identity);
        }
        Ok(removed)
    }

    /// Direct `domain` at the identity's set. Set membership fills in as
    /// dnsmasq resolves the domain; the rule is not touched.
    pub fn add_domain(&self, identity: &TunnelIdentity, domain: &str) -> Result<bool, StoreError> {
        self.directives.set_domain_directive(domain, identity.set_name())
    }

    /// Stop directing `domain` at the identity's set; returns false if it was not.
    /// Mappings of the same domain to other sets are kept.
    pub fn remove_domain(&self, identity: &TunnelIdentity, domain: &str) -> Result<bool, StoreError> {
        let removed = self
            .directives
            .remove_domain_from_set(domain, identity.set_name())?;
        if !removed {
            debug!("{} is not directed at {}", domain, identity.set_name());
        }
        Ok(removed)
    }

    /// Pin `domain` to fixed addresses: dnsmasq answers it from the hosts
    /// file and the addresses go straight into the set when it exists.
    pub fn pin_domain(
        &self,
        identity: &TunnelIdentity,
        domain: &str,
        addresses: &[IpAddr],
    ) -> Result<bool, StoreError> {
        let previous = self.hosts.addresses(domain)?;
        let changed = self.hosts.pin(domain, addresses)?;
        self.directives
            .set_singleton(ADDN_HOSTS_PREFIX, &self.hosts.directive())?;

        if self.sets.set_exists(identity.set_name())? {
            let stale: Vec<IpAddr> = previous
                .into_iter()
                .filter(|a| !addresses.contains(a))
                .collect();
            self.unload_pinned(identity, &stale)?;
            self.load_pinned(identity, addresses)?;
        } else {
            debug!("{} not created yet; pins load on enable", identity.set_name());
        }
        Ok(changed)
    }

    /// Drop every pin for `domain`; returns the addresses it had.
    /// Those addresses are taken back out of the set.
    pub fn unpin_domain(&self, identity: &TunnelIdentity, domain: &str) -> Result<Vec<IpAddr>, StoreError> {
        let domain = normalize_domain(domain)?;
        let removed = self.hosts.unpin(&domain)?;
        if !self.hosts.exists() {
            self.directives.remove_by_prefix(ADDN_HOSTS_PREFIX)?;
        }
        self.unload_pinned(identity, &removed)?;
        Ok(removed)
    }

    pub fn pinned(&self) -> Result<BTreeMap<String, Vec<IpAddr>>, StoreError> {
        self.hosts.entries()
    }

    // The set is inet family; IPv6 pins are still served by dnsmasq
    fn load_pinned(&self, identity: &TunnelIdentity, addresses: &[IpAddr]) -> Result<(), StoreError> {
        for address in addresses {
            if address.is_ipv4() {
                self.sets.add_member(identity.set_name(), &address.to_string())?;
            } else {
                debug!("Skipping {} for inet set {}", address, identity.set_name());
            }
        }
        Ok(())
    }

    fn unload_pinned(&self, identity: &TunnelIdentity, addresses: &[IpAddr]) -> Result<(), StoreError> {
        for address in addresses.iter().filter(|a| a.is_ipv4()) {
            match self.sets.remove_member(identity.set_name(), &address.to_string()) {
                Ok(()) | Err(StoreError::EntryNotFound { .. }) | Err(StoreError::SetNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn domains(&self, identity: &TunnelIdentity) -> Result<Vec<String>, StoreError> {
        self.directives.domains_for_set(identity.set_name())
    }

    pub fn members(&self, identity: &TunnelIdentity) -> Result<Members, StoreError> {
        self.sets.list_members(identity.set_name())
    }

    /// Pin an address into the set by hand, bypassing the resolver
    pub fn add_member(&self, identity: &TunnelIdentity, entry: &str) -> Result<(), StoreError> {
        self.sets.add_member(identity.set_name(), entry)
    }

    pub fn remove_member(&self, identity: &TunnelIdentity, entry: &str) -> Result<(), StoreError> {
        self.sets.remove_member(identity.set_name(), entry)
    }

    pub fn state(&self, identity: &TunnelIdentity) -> Result<PolicyState, StoreError> {
        if self.rules.rule_exists(identity)? {
            Ok(PolicyState::RuleActive)
        } else if self.sets.set_exists(identity.set_name())? {
            Ok(PolicyState::SetReady)
        } else {
            Ok(PolicyState::Uninitialized)
        }
    }

    pub async fn status(
        &self,
        identity: &TunnelIdentity,
        probe_target: Option<&str>,
        probe_timeout: Duration,
    ) -> Result<TunnelStatus, StoreError> {
        let tunnel_process_running = self.daemon.is_running()?;
        let rule_active = self.rules.rule_exists(identity)?;

        let probe = match probe_target {
            Some(target) if tunnel_process_running => {
                Some(match daemon::probe(target, probe_timeout).await {
                    Ok(latency) => ProbeOutcome::Reachable { latency },
                    Err(e) => {
                        warn!("Probe of {} failed: {}", target, e);
                        ProbeOutcome::Failed {
                            error: e.to_string(),
                        }
                    }
                })
            }
            _ => None,
        };

        Ok(TunnelStatus {
            tunnel_process_running,
            rule_active,
            probe_target: probe_target.map(str::to_string),
            probe,
        })
    }
}
