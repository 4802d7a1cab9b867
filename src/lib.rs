//! Domain tunnel - domain-based split-tunnel routing for Linux routers
//!
//! Traffic to a chosen list of domains is steered into a tunnel interface,
//! everything else stays on the default route. Three host stores carry
//! the policy:
//!
//! - an ipset address set, filled by dnsmasq as it resolves the domains
//! - one iptables `nat PREROUTING` rule matching the set
//! - a dnsmasq directive file mapping each domain to the set, plus an
//!   optional hosts file pinning domains to fixed addresses
//!
//! # Architecture
//!
//! - `config`: Configuration file handling (TOML)
//! - `platform`: External command execution with timeouts
//! - `netfilter`: ipset and iptables stores
//! - `dns`: dnsmasq directive and hosts file stores, domain validation
//! - `daemon`: Tunnel client process control and reachability probe
//! - `policy`: Enable/disable orchestration across the stores
//!
//! # Usage
//!
//! ```bash
//! sudo domain-tunnel enable example.com example.org
//! sudo domain-tunnel pin add example.com 203.0.113.7
//! sudo domain-tunnel status
//! sudo domain-tunnel disable
//! ```

pub mod config;
pub mod daemon;
pub mod dns;
pub mod error;
pub mod netfilter;
pub mod platform;
pub mod policy;

pub use config::{load_config, Config};
pub use error::{Store, StoreError};
pub use netfilter::{SetKind, TunnelIdentity};
pub use policy::{PolicyState, SplitTunnelPolicy, TunnelStatus};
