//! Configuration handling for domain-tunnel
//!
//! Every path, binary name and timeout the stores need lives here and is
//! threaded into them at construction; nothing reads process-wide globals.

use crate::error::StoreError;
use crate::netfilter::{SetKind, TunnelIdentity};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub const LOCAL_CONFIG_FILE: &str = "domain-tunnel.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Domains routed through the tunnel on `enable`
    pub domains: Vec<String>,
    pub tunnel: TunnelConfig,
    pub dnsmasq: DnsmasqConfig,
    pub commands: CommandsConfig,
    pub daemon: DaemonConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub interface: String,
    pub set_name: String,
    pub set_kind: SetKind,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            interface: "tun0".to_string(),
            set_name: "vpn_domains".to_string(),
            set_kind: SetKind::Address,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsmasqConfig {
    pub directive_file: PathBuf,
    /// Pinned `address name` entries, loaded through `addn-hosts=`
    pub hosts_file: PathBuf,
    /// Upstream server written as `server=` on `enable`
    pub server: Option<String>,
    /// Listening port written as `port=` on `enable`
    pub port: Option<u16>,
}

impl Default for DnsmasqConfig {
    fn default() -> Self {
        Self {
            directive_file: PathBuf::from("/etc/dnsmasq.d/domain-tunnel.conf"),
            // Outside dnsmasq.d: every file there is parsed as config
            hosts_file: PathBuf::from("/etc/domain-tunnel/hosts"),
            server: None,
            port: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    pub ipset: String,
    pub iptables: String,
    pub pidof: String,
    pub pkill: String,
    /// Upper bound for any single external command
    pub timeout_secs: u64,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            ipset: "ipset".to_string(),
            iptables: "iptables".to_string(),
            pidof: "pidof".to_string(),
            pkill: "pkill".to_string(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub binary: String,
    pub config_file: PathBuf,
    pub probe_target: String,
    pub probe_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            binary: "xray".to_string(),
            config_file: PathBuf::from("/opt/etc/xray/config.json"),
            probe_target: "example.com".to_string(),
            probe_timeout_secs: 10,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn identity(&self) -> Result<TunnelIdentity, StoreError> {
        TunnelIdentity::new(&self.tunnel.interface, &self.tunnel.set_name)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.commands.timeout_secs.max(1))
    }

    /// iptables `-w` value: one second under the command timeout so a held
    /// xtables lock surfaces as an iptables error before the runner kills it
    pub fn iptables_lock_wait(&self) -> Duration {
        self.command_timeout()
            .saturating_sub(Duration::from_secs(1))
            .max(Duration::from_secs(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.daemon.probe_timeout_secs.max(1))
    }

    /// `<config dir>/domain-tunnel/config.toml`, if the platform has one
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("domain-tunnel").join("config.toml"))
    }
}

/// Load config from an explicit path, else the default locations
///
/// Lookup order: `explicit`, `./domain-tunnel.toml`, the user config
/// directory, then built-in defaults.
pub fn load_config(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    if let Some(path) = explicit {
        debug!("Loading config from {}", path.display());
        return Config::load(path);
    }

    let local = PathBuf::from(LOCAL_CONFIG_FILE);
    if local.exists() {
        debug!("Loading config from {}", local.display());
        return Config::load(&local);
    }

    if let Some(user) = Config::user_config_path() {
        if user.exists() {
            debug!("Loading config from {}", user.display());
            return Config::load(&user);
        }
    }

    info!("No config file found, using defaults");
    Ok(Config::default())
}
