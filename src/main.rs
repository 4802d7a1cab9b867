use clap::{Parser, Subcommand};
use domain_tunnel::config::{self, Config, LOCAL_CONFIG_FILE};
use domain_tunnel::dns::directives::{PORT_PREFIX, SERVER_PREFIX};
use domain_tunnel::platform::get_command_runner;
use domain_tunnel::policy::ProbeOutcome;
use domain_tunnel::SplitTunnelPolicy;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "domain-tunnel")]
#[command(about = "Route traffic for selected domains through a tunnel interface")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ./domain-tunnel.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Route the given domains (or the configured ones) through the tunnel
    Enable {
        domains: Vec<String>,
    },
    /// Stop routing through the tunnel and remove domain directives
    Disable {
        /// Also destroy the address set
        #[arg(long)]
        destroy_set: bool,
    },
    /// Show tunnel process, rule and reachability status
    Status {
        /// URL or host to time a request to (default: daemon.probe_target)
        #[arg(long, conflicts_with = "skip_check")]
        target: Option<String>,
        /// Skip the reachability check
        #[arg(long)]
        skip_check: bool,
        /// Print status as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage the domains directed at the tunnel set
    #[command(subcommand)]
    Domain(DomainCommand),
    /// Answer domains from fixed addresses and load them into the set
    #[command(subcommand)]
    Pin(PinCommand),
    /// Manage resolver server/port directives
    #[command(subcommand)]
    Dns(DnsCommand),
    /// Inspect or edit the address set directly
    #[command(subcommand)]
    Set(SetCommand),
    /// Start or stop the tunnel client
    #[command(subcommand)]
    Daemon(DaemonCommand),
    /// Generate default config file
    Init,
}

#[derive(Subcommand)]
enum DomainCommand {
    Add { domain: String },
    Remove { domain: String },
    List,
}

#[derive(Subcommand)]
enum PinCommand {
    Add {
        domain: String,
        #[arg(required = true)]
        addresses: Vec<IpAddr>,
    },
    Remove { domain: String },
    List,
}

#[derive(Subcommand)]
enum DnsCommand {
    SetServer { server: String },
    SetPort { port: u16 },
    ClearServer,
    ClearPort,
    Show,
}

#[derive(Subcommand)]
enum SetCommand {
    Add { entry: String },
    Del { entry: String },
    List,
}

#[derive(Subcommand)]
enum DaemonCommand {
    Start,
    Stop,
}

impl Commands {
    fn mutates_host(&self) -> bool {
        !matches!(
            self,
            Commands::Status { .. }
                | Commands::Init
                | Commands::Domain(DomainCommand::List)
                | Commands::Pin(PinCommand::List)
                | Commands::Dns(DnsCommand::Show)
                | Commands::Set(SetCommand::List)
        )
    }
}

fn warn_if_not_root() {
    #[cfg(unix)]
    if !nix::unistd::Uid::effective().is_root() {
        warn!("Not running as root; ipset and iptables changes will likely fail");
    }
}

/// Reachability target for `status`: the explicit one, else the
/// configured default. Empty means no check.
fn status_target(config: &Config, target: Option<String>, skip_check: bool) -> Option<String> {
    if skip_check {
        return None;
    }
    let target = target.unwrap_or_else(|| config.daemon.probe_target.clone());
    (!target.trim().is_empty()).then_some(target)
}

fn init(path: Option<&Path>) -> Result<PathBuf, config::ConfigError> {
    let path = path.map_or_else(|| PathBuf::from(LOCAL_CONFIG_FILE), Path::to_path_buf);
    Config::default().save(&path)?;
    Ok(path)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so `status --json` stays machine-readable
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Init => {
            let path = init(cli.config.as_deref())?;
            println!("Created default config: {}", path.display());
            Ok(())
        }
        command => run(command, cli.config.as_deref()).await,
    }
}

async fn run(command: Commands, config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = config::load_config(config_path)?;
    if command.mutates_host() {
        warn_if_not_root();
    }

    let runner = Arc::from(get_command_runner(config.command_timeout())?);
    let policy = SplitTunnelPolicy::from_config(&config, runner);
    let identity = config.identity()?;

    match command {
        Commands::Enable { domains } => {
            let domains = if domains.is_empty() {
                config.domains.clone()
            } else {
                domains
            };
            if domains.is_empty() {
                warn!("No domains given or configured; the tunnel will match nothing");
            }
            policy.enable(&identity, &domains)?;
            println!("Enabled {} ({} domain(s))", identity, domains.len());
        }
        Commands::Disable { destroy_set } => {
            let removed = if destroy_set {
                policy.teardown(&identity)?
            } else {
                policy.disable(&identity)?
            };
            println!("Disabled {} ({} domain(s) removed)", identity, removed.len());
        }
        Commands::Status {
            target,
            skip_check,
            json,
        } => {
            let target = status_target(&config, target, skip_check);
            let status = policy
                .status(&identity, target.as_deref(), config.probe_timeout())
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("Tunnel: {}", identity);
                println!(
                    "  Process ({}): {}",
                    policy.daemon().binary(),
                    if status.tunnel_process_running { "running" } else { "stopped" }
                );
                println!(
                    "  Rule: {}",
                    if status.rule_active { "active" } else { "inactive" }
                );
                match (&status.probe_target, &status.probe) {
                    (Some(t), Some(ProbeOutcome::Reachable { latency })) => {
                        println!("  Probe {}: {} ms", t, latency.as_millis());
                    }
                    (Some(t), Some(ProbeOutcome::Failed { error })) => {
                        println!("  Probe {}: failed ({})", t, error);
                    }
                    (Some(t), None) => println!("  Probe {}: skipped, tunnel not running", t),
                    _ => {}
                }
            }
        }
        Commands::Domain(cmd) => match cmd {
            DomainCommand::Add { domain } => {
                if policy.add_domain(&identity, &domain)? {
                    println!("Added {}", domain);
                } else {
                    println!("{} already routed", domain);
                }
            }
            DomainCommand::Remove { domain } => {
                if policy.remove_domain(&identity, &domain)? {
                    println!("Removed {}", domain);
                } else {
                    println!("{} was not routed through {}", domain, identity.set_name());
                }
            }
            DomainCommand::List => {
                for domain in policy.domains(&identity)? {
                    println!("{}", domain);
                }
            }
        },
        Commands::Pin(cmd) => match cmd {
            PinCommand::Add { domain, addresses } => {
                if policy.pin_domain(&identity, &domain, &addresses)? {
                    println!("Pinned {} ({} address(es))", domain, addresses.len());
                } else {
                    println!("{} already pinned to those addresses", domain);
                }
            }
            PinCommand::Remove { domain } => {
                let removed = policy.unpin_domain(&identity, &domain)?;
                if removed.is_empty() {
                    println!("{} was not pinned", domain);
                } else {
                    println!("Unpinned {} ({} address(es))", domain, removed.len());
                }
            }
            PinCommand::List => {
                for (domain, addresses) in policy.pinned()? {
                    let addresses: Vec<String> = addresses.iter().map(ToString::to_string).collect();
                    println!("{}\t{}", domain, addresses.join(" "));
                }
            }
        },
        Commands::Dns(cmd) => {
            let directives = policy.directives();
            match cmd {
                DnsCommand::SetServer { server } => {
                    directives.set_server(&server)?;
                }
                DnsCommand::SetPort { port } => {
                    directives.set_port(port)?;
                }
                DnsCommand::ClearServer => {
                    directives.clear_server()?;
                }
                DnsCommand::ClearPort => {
                    directives.clear_port()?;
                }
                DnsCommand::Show => {
                    println!("File: {}", directives.path().display());
                    for prefix in [SERVER_PREFIX, PORT_PREFIX] {
                        match directives.singleton(prefix)? {
                            Some(line) => println!("  {}", line),
                            None => println!("  {}<unset>", prefix),
                        }
                    }
                }
            }
        }
        Commands::Set(cmd) => match cmd {
            SetCommand::Add { entry } => policy.add_member(&identity, &entry)?,
            SetCommand::Del { entry } => policy.remove_member(&identity, &entry)?,
            SetCommand::List => {
                for member in policy.members(&identity)? {
                    println!("{}", member);
                }
            }
        },
        Commands::Daemon(cmd) => match cmd {
            DaemonCommand::Start => {
                match policy.daemon().start(&config.daemon.config_file)? {
                    Some(pid) => println!("Started {} (pid {})", policy.daemon().binary(), pid),
                    None => println!("{} already running", policy.daemon().binary()),
                }
            }
            DaemonCommand::Stop => {
                if policy.daemon().stop()? {
                    println!("Stopped {}", policy.daemon().binary());
                } else {
                    println!("{} was not running", policy.daemon().binary());
                }
            }
        },
        Commands::Init => {
            let path = init(config_path)?;
            println!("Created default config: {}", path.display());
        }
    }

    Ok(())
}
