//! iptctl - idempotent iptables chain manager
//!
//! Command-line front end for [`iptctl::Manager`]. Every subcommand can be
//! re-run safely: creating an existing chain, re-adding an existing link or
//! DNAT rule changes nothing.
//!
//! # Usage
//!
//! ```bash
//! iptctl create-chain DESKTOP-SERVICES
//! iptctl link PREROUTING DESKTOP-SERVICES "desktop services portal"
//! iptctl create-chain DESKTOP-A
//! iptctl link DESKTOP-SERVICES DESKTOP-A desktop-A-service
//! iptctl dnat DESKTOP-A tcp 3000 192.168.240.98:3000 "the desktop a policy"
//!
//! # Tear down inner chains first
//! iptctl delete-chain DESKTOP-SERVICES DESKTOP-A desktop-A-service
//! iptctl delete-chain PREROUTING DESKTOP-SERVICES "desktop services portal"
//!
//! # Same operations on a remote host
//! iptctl --ssh 192.168.240.101:22 --user root --identity ~/.ssh/id_ed25519 links PREROUTING
//!
//! # Recent changes made from this machine
//! iptctl audit -n 10
//! ```
//!
//! # Exit status
//!
//! `0` on success, `1` when `exists` finds no such chain, `2` on any error.

use clap::builder::PossibleValuesParser;
use clap::{ArgAction, Args, Parser, Subcommand};
use iptctl::audit::{self, AuditLog, EventType};
use iptctl::config::{self, AppConfig};
use iptctl::core::error::IptablesErrorPattern;
use iptctl::core::tables::KNOWN_TABLES;
use iptctl::host::DynHost;
use iptctl::host::local::{LocalConfig, LocalHost};
use iptctl::host::ssh::{SshConfig, SshHost};
use iptctl::{Manager, NAT_TABLE};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;

shadow_rs::shadow!(build);

const EXIT_ABSENT: u8 = 1;
const EXIT_ERROR: u8 = 2;

#[derive(Parser)]
#[command(name = "iptctl", version, long_version = build::CLAP_LONG_VERSION)]
#[command(about = "Idempotent iptables chain, link and DNAT manager", long_about = None)]
struct Cli {
    #[command(flatten)]
    target: TargetArgs,

    /// More log detail (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Where commands run. Overrides the `ssh` section of config.json.
#[derive(Args)]
struct TargetArgs {
    /// Run on a remote host over SSH
    #[arg(long, value_name = "HOST[:PORT]", global = true)]
    ssh: Option<String>,
    /// Remote login user (default: root)
    #[arg(long, global = true)]
    user: Option<String>,
    /// Private key file for the SSH login
    #[arg(long, value_name = "FILE", global = true)]
    identity: Option<PathBuf>,
    /// Prefix remote commands with `sudo -n`
    #[arg(long, global = true)]
    sudo: bool,
    /// Per-command timeout in seconds (0 disables)
    #[arg(long, value_name = "SECONDS", global = true)]
    timeout: Option<u64>,
}

#[derive(Args)]
struct TableArg {
    /// Table to operate on
    #[arg(
        short,
        long,
        default_value = NAT_TABLE,
        value_parser = PossibleValuesParser::new(KNOWN_TABLES)
    )]
    table: String,
}

#[derive(Args)]
struct DnatArgs {
    /// Chain in the nat table holding the rule
    chain: String,
    /// tcp, udp, sctp or dccp
    protocol: String,
    /// Destination port or `start:end` range
    port: String,
    /// `ip` or `ip:port` to forward to
    destination: String,
    description: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a custom chain (no-op if it exists)
    CreateChain {
        #[command(flatten)]
        table: TableArg,
        chain: String,
    },
    /// Link a child chain into a parent chain with a tagged jump rule
    Link {
        #[command(flatten)]
        table: TableArg,
        parent: String,
        child: String,
        description: String,
    },
    /// Remove one link without deleting the child chain
    Unlink {
        #[command(flatten)]
        table: TableArg,
        parent: String,
        child: String,
        description: String,
    },
    /// Add a DNAT port forward to a chain in the nat table
    Dnat(DnatArgs),
    /// Remove a DNAT port forward added with the same arguments
    DeleteDnat(DnatArgs),
    /// Unlink a chain from its parent, flush it and delete it
    DeleteChain {
        #[command(flatten)]
        table: TableArg,
        parent: String,
        chain: String,
        description: String,
    },
    /// List the custom chains a parent chain jumps to
    Links {
        #[command(flatten)]
        table: TableArg,
        parent: String,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Exit 0 if the chain exists, 1 if it does not
    Exists {
        #[command(flatten)]
        table: TableArg,
        chain: String,
    },
    /// Show recent rule changes from the audit log, newest first
    Audit {
        /// Number of entries to show
        #[arg(short = 'n', long, default_value_t = 20)]
        count: usize,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let _ = iptctl::utils::ensure_dirs();
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {e}");
            return ExitCode::from(EXIT_ERROR);
        }
    };

    match runtime.block_on(handle_cli(cli)) {
        Ok(code) => code,
        Err(e) => {
            report_error(e.as_ref());
            ExitCode::from(EXIT_ERROR)
        }
    }
}

/// Logs to `iptctl.log` in the state directory, or stderr when that is unavailable.
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let log_file = iptctl::utils::get_state_dir().and_then(|mut path| {
        path.push("iptctl.log");
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
    });

    match log_file {
        Some(file) => tracing_subscriber::fmt()
            .with_max_level(level)
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file))
            .init(),
        None => tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .init(),
    }
}

fn report_error(error: &(dyn std::error::Error + 'static)) {
    eprintln!("Error: {error}");

    let translation = IptablesErrorPattern::match_error(&error.to_string());
    eprintln!();
    eprintln!("{}", translation.user_message);
    for suggestion in &translation.suggestions {
        eprintln!("  - {suggestion}");
    }
    if let Some(url) = translation.help_url {
        eprintln!("  See: {url}");
    }
}

/// Merges command-line target flags over the config file.
fn resolve_ssh(args: &TargetArgs, config: &AppConfig) -> Result<Option<SshConfig>, String> {
    let mut ssh = config.ssh.clone();

    if let Some(remote) = &args.ssh {
        let base = ssh
            .take()
            .unwrap_or_else(|| SshConfig::new(remote.clone(), "root"));
        ssh = Some(SshConfig {
            remote: remote.clone(),
            ..base
        });
    }

    match ssh.as_mut() {
        Some(ssh) => {
            if let Some(user) = &args.user {
                ssh.user.clone_from(user);
            }
            if let Some(key) = &args.identity {
                ssh.private_key_file = Some(key.clone());
            }
            if args.sudo {
                ssh.sudo = true;
            }
        }
        None if args.user.is_some() || args.identity.is_some() || args.sudo => {
            return Err("--user, --identity and --sudo require --ssh".to_string());
        }
        None => {}
    }

    Ok(ssh)
}

fn build_host(
    args: &TargetArgs,
    config: &AppConfig,
) -> Result<DynHost, Box<dyn std::error::Error>> {
    let timeout = match args.timeout {
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
        None => config.command_timeout(),
    };

    let host: DynHost = match resolve_ssh(args, config)? {
        Some(ssh) => Arc::new(SshHost::new(ssh, timeout)?),
        None => Arc::new(LocalHost::new(LocalConfig {
            elevate: config.elevate_local,
            timeout,
        })),
    };
    Ok(host)
}

async fn audited(
    enabled: bool,
    host: &str,
    event_type: EventType,
    details: serde_json::Value,
    result: iptctl::Result<()>,
) -> iptctl::Result<()> {
    if enabled {
        audit::log_operation(event_type, host, details, &result).await;
    }
    result
}

/// Prints the newest audit entries. Reads only the local audit log.
async fn show_audit(count: usize, json: bool) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let log = AuditLog::new()?;
    let events = match log.read_recent(count).await {
        Ok(events) => events,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("No audit entries at {}", log.path().display());
            return Ok(ExitCode::SUCCESS);
        }
        Err(e) => return Err(e.into()),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&events)?);
    } else {
        for event in &events {
            println!("{}", event.summary());
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn handle_cli(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let config = config::load_config().await;
    let host = build_host(&cli.target, &config)?;
    let target = host.describe();
    let manager = Manager::with_options(host, config.manager_options());
    let audit = config.audit_enabled;

    match cli.command {
        Commands::CreateChain { table, chain } => {
            let result = manager.create_chain_for_table(&table.table, &chain).await;
            let details = serde_json::json!({ "table": table.table, "chain": chain });
            audited(audit, &target, EventType::CreateChain, details, result).await?;
            println!("✓ Chain {chain} present in table {}", table.table);
        }
        Commands::Link {
            table,
            parent,
            child,
            description,
        } => {
            let result = manager
                .append_chain_to_parent_chain(&table.table, &parent, &child, &description)
                .await;
            let details = serde_json::json!({
                "table": table.table,
                "parent": parent,
                "child": child,
                "description": description,
            });
            audited(audit, &target, EventType::LinkChain, details, result).await?;
            println!("✓ {parent} -> {child} linked");
        }
        Commands::Unlink {
            table,
            parent,
            child,
            description,
        } => {
            let result = manager
                .remove_link(&table.table, &parent, &child, &description)
                .await;
            let details = serde_json::json!({
                "table": table.table,
                "parent": parent,
                "child": child,
                "description": description,
            });
            audited(audit, &target, EventType::UnlinkChain, details, result).await?;
            println!("✓ {parent} -> {child} unlinked");
        }
        Commands::Dnat(args) => {
            let result = manager
                .append_dnat_rule_to_chain(
                    &args.chain,
                    &args.protocol,
                    &args.port,
                    &args.destination,
                    &args.description,
                )
                .await;
            audited(audit, &target, EventType::AppendDnat, dnat_details(&args), result).await?;
            println!(
                "✓ {} {}/{} -> {}",
                args.chain, args.protocol, args.port, args.destination
            );
        }
        Commands::DeleteDnat(args) => {
            let result = manager
                .delete_dnat_rule_from_chain(
                    &args.chain,
                    &args.protocol,
                    &args.port,
                    &args.destination,
                    &args.description,
                )
                .await;
            audited(audit, &target, EventType::DeleteDnat, dnat_details(&args), result).await?;
            println!("✓ DNAT rule removed from {}", args.chain);
        }
        Commands::DeleteChain {
            table,
            parent,
            chain,
            description,
        } => {
            let result = manager
                .delete_chain(&table.table, &parent, &chain, &description)
                .await;
            let details = serde_json::json!({
                "table": table.table,
                "parent": parent,
                "chain": chain,
                "description": description,
            });
            audited(audit, &target, EventType::DeleteChain, details, result).await?;
            println!("✓ Chain {chain} deleted");
        }
        Commands::Links {
            table,
            parent,
            json,
        } => {
            let links = manager.list_links(&table.table, &parent).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&links)?);
            } else if links.is_empty() {
                println!("{parent} has no links to custom chains");
            } else {
                for link in links {
                    match link.description {
                        Some(description) => {
                            println!("{} -> {}  [{description}]", link.parent, link.child);
                        }
                        None => println!("{} -> {}", link.parent, link.child),
                    }
                }
            }
        }
        Commands::Exists { table, chain } => {
            if !manager.chain_exists(&table.table, &chain).await? {
                println!("{chain} does not exist in table {}", table.table);
                return Ok(ExitCode::from(EXIT_ABSENT));
            }
            println!("{chain} exists in table {}", table.table);
        }
        Commands::Audit { count, json } => return show_audit(count, json).await,
    }

    Ok(ExitCode::SUCCESS)
}

fn dnat_details(args: &DnatArgs) -> serde_json::Value {
    serde_json::json!({
        "table": NAT_TABLE,
        "chain": args.chain,
        "protocol": args.protocol,
        "port": args.port,
        "destination": args.destination,
        "description": args.description,
    })
}
