//! Pinned `address name` entries served by dnsmasq through `addn-hosts=`
//!
//! dnsmasq answers these names from the file instead of asking upstream,
//! so a pinned domain always resolves to the addresses loaded into the
//! tunnel set. Entries are keyed by exact name; comments and lines that do
//! not parse are left alone.

use super::{normalize_domain, read_lines, write_lines};
use crate::error::{Store, StoreError};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Directive that makes dnsmasq read a hosts file
pub const ADDN_HOSTS_PREFIX: &str = "addn-hosts=";

struct HostsLine<'a> {
    address: IpAddr,
    names: Vec<&'a str>,
}

impl HostsLine<'_> {
    fn names(&self, domain: &str) -> bool {
        self.names.iter().any(|n| n.eq_ignore_ascii_case(domain))
    }
}

fn parse_hosts_line(line: &str) -> Option<HostsLine<'_>> {
    let content = line.split('#').next()?;
    let mut fields = content.split_whitespace();
    let address = fields.next()?.parse().ok()?;
    let names: Vec<&str> = fields.collect();
    if names.is_empty() {
        return None;
    }
    Some(HostsLine { address, names })
}

fn render(address: IpAddr, names: &[&str]) -> String {
    format!("{}\t{}", address, names.join(" "))
}

/// Drop `domain` from every line; returns the remaining lines and the
/// addresses it was pinned to
fn without_name(lines: &[String], domain: &str) -> (Vec<String>, Vec<IpAddr>) {
    let mut out = Vec::with_capacity(lines.len());
    let mut addresses = Vec::new();
    for line in lines {
        let Some(entry) = parse_hosts_line(line).filter(|e| e.names(domain)) else {
            out.push(line.clone());
            continue;
        };
        if !addresses.contains(&entry.address) {
            addresses.push(entry.address);
        }
        let rest: Vec<&str> = entry
            .names
            .iter()
            .copied()
            .filter(|n| !n.eq_ignore_ascii_case(domain))
            .collect();
        if !rest.is_empty() {
            out.push(render(entry.address, &rest));
        }
    }
    (out, addresses)
}

pub struct HostsFile {
    path: PathBuf,
}

impl HostsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// The `addn-hosts=` line pointing dnsmasq at this file
    pub fn directive(&self) -> String {
        format!("{}{}", ADDN_HOSTS_PREFIX, self.path.display())
    }

    /// Name → pinned addresses
    pub fn entries(&self) -> Result<BTreeMap<String, Vec<IpAddr>>, StoreError> {
        let mut map: BTreeMap<String, Vec<IpAddr>> = BTreeMap::new();
        for line in self.lines()? {
            if let Some(entry) = parse_hosts_line(&line) {
                for name in &entry.names {
                    let addresses = map.entry(name.to_ascii_lowercase()).or_default();
                    if !addresses.contains(&entry.address) {
                        addresses.push(entry.address);
                    }
                }
            }
        }
        Ok(map)
    }

    pub fn addresses(&self, domain: &str) -> Result<Vec<IpAddr>, StoreError> {
        let domain = normalize_domain(domain)?;
        Ok(self.entries()?.remove(&domain).unwrap_or_default())
    }

    /// Make `addresses` the only pinned addresses of `domain`, one line each.
    /// Returns false if the file already held exactly those lines.
    pub fn pin(&self, domain: &str, addresses: &[IpAddr]) -> Result<bool, StoreError> {
        let domain = normalize_domain(domain)?;
        if addresses.is_empty() {
            return Err(StoreError::invalid(
                Store::HostsFile,
                "pin",
                &domain,
                "at least one address is required",
            ));
        }
        let mut wanted: Vec<IpAddr> = Vec::with_capacity(addresses.len());
        for address in addresses {
            if !wanted.contains(address) {
                wanted.push(*address);
            }
        }
        let desired: Vec<String> = wanted.iter().map(|a| render(*a, &[&domain])).collect();

        let lines = self.lines()?;
        let current: Vec<&String> = lines
            .iter()
            .filter(|l| parse_hosts_line(l).is_some_and(|e| e.names(&domain)))
            .collect();
        if current.len() == desired.len() && current.iter().zip(&desired).all(|(c, d)| *c == d) {
            debug!("{} already pinned", domain);
            return Ok(false);
        }

        let (mut updated, _) = without_name(&lines, &domain);
        updated.extend(desired);
        write_lines(Store::HostsFile, &self.path, &updated)?;
        info!("Pinned {} to {} address(es)", domain, wanted.len());
        Ok(true)
    }

    /// Remove every pin for `domain`; returns the addresses it had.
    /// The file is deleted once no lines remain.
    pub fn unpin(&self, domain: &str) -> Result<Vec<IpAddr>, StoreError> {
        let domain = normalize_domain(domain)?;
        let lines = self.lines()?;
        let (updated, removed) = without_name(&lines, &domain);
        if !removed.is_empty() {
            write_lines(Store::HostsFile, &self.path, &updated)?;
            info!("Unpinned {}", domain);
        }
        Ok(removed)
    }

    fn lines(&self) -> Result<Vec<String>, StoreError> {
        read_lines(Store::HostsFile, &self.path)
    }
}
