//! Command-line interface for linkbond.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// linkbond - software multi-link bonding
#[derive(Parser, Debug)]
#[command(
    name = "linkbond",
    author,
    version,
    about = "Bond several network interfaces and spread flows across them",
    long_about = r#"
linkbond distributes outbound flows across two or more network interfaces:

  - Round-robin, source/destination address hash and least-connections policies
  - Continuous health probing with automatic failover and recovery
  - Degraded mode when fewer than the minimum healthy links remain

QUICK START:
  List interfaces:   linkbond interfaces
  Bond two links:    linkbond run eth0 wlan0 --policy least_conn
  Where would it go: linkbond preview eth0 wlan0 --destination 93.184.216.34:443
"#
)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error) [default: from config, else info]
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List network interfaces
    Interfaces(InterfacesArgs),

    /// List distribution policies
    Policies,

    /// Enable bonding and report status until interrupted
    Run(RunArgs),

    /// Show which interface a flow would take
    Preview(PreviewArgs),

    /// Show example configuration
    Config(ConfigArgs),
}

/// Interface listing arguments
#[derive(Args, Debug)]
pub struct InterfacesArgs {
    /// Include interfaces without an address
    #[arg(short, long)]
    pub all: bool,
}

/// Bonding run arguments
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Interfaces to bond
    #[arg(required = true, num_args = 1..)]
    pub interfaces: Vec<String>,

    /// Distribution policy (defaults to the configured policy)
    #[arg(short, long)]
    pub policy: Option<String>,

    /// Authorize single-link passthrough while degraded
    #[arg(long)]
    pub passthrough: bool,

    /// Status report interval (seconds)
    #[arg(long, default_value = "5")]
    pub interval: u64,
}

/// Route preview arguments
#[derive(Args, Debug)]
pub struct PreviewArgs {
    /// Interfaces to bond
    #[arg(required = true, num_args = 1..)]
    pub interfaces: Vec<String>,

    /// Distribution policy (defaults to the configured policy)
    #[arg(short, long)]
    pub policy: Option<String>,

    /// Flow source address
    #[arg(long, default_value = "0.0.0.0:0")]
    pub source: SocketAddr,

    /// Flow destination address
    #[arg(long)]
    pub destination: SocketAddr,

    /// Transport protocol (tcp, udp, icmp or a protocol number)
    #[arg(long, default_value = "tcp")]
    pub protocol: String,

    /// Probe the interfaces once before previewing
    #[arg(long)]
    pub probe: bool,
}

/// Config command arguments
#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Output path
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}
