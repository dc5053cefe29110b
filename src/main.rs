//! linkbond CLI - software multi-link bonding.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::{ColoredString, Colorize};
use serde::Serialize;
use tokio::signal;

use linkbond::bonding::{BondEvent, BondStatus, BondingController, FlowDescriptor, Interface};
use linkbond::cli::*;
use linkbond::config::{init_logging, Config};
use linkbond::error::{Error, Result};
use linkbond::types::{BondState, HealthState, InterfaceId, Protocol};
use linkbond::util;
use linkbond::VERSION;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load config if specified
    let config = if let Some(ref path) = cli.config {
        Config::load(path)?
    } else if Config::default_path().exists() {
        Config::load(Config::default_path())?
    } else {
        Config::default()
    };

    init_logging(&config.logging.with_overrides(cli.log_level.as_deref(), cli.no_color))?;

    if cli.no_color {
        colored::control::set_override(false);
    }

    let format = cli.format;
    match cli.command {
        Commands::Interfaces(args) => run_interfaces(args, &config, format),
        Commands::Policies => run_policies(format),
        Commands::Run(args) => run_bond(args, &config, format).await,
        Commands::Preview(args) => run_preview(args, &config, format).await,
        Commands::Config(args) => run_config(args),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(anyhow::Error::from)?;
    println!("{json}");
    Ok(())
}

fn health_label(health: HealthState) -> ColoredString {
    match health {
        HealthState::Healthy => "healthy".green(),
        HealthState::Degraded => "degraded".yellow(),
        HealthState::Unreachable => "unreachable".red(),
    }
}

fn state_label(state: BondState) -> ColoredString {
    let text = state.to_string();
    match state {
        BondState::Enabled => text.green(),
        BondState::Degraded => text.yellow(),
        BondState::Validating | BondState::Disabling => text.cyan(),
        BondState::Disabled => text.dimmed(),
    }
}

fn interface_ids(names: &[String]) -> Vec<InterfaceId> {
    names.iter().map(|n| InterfaceId::new(n.as_str())).collect()
}

/// List interfaces
fn run_interfaces(args: InterfacesArgs, config: &Config, format: OutputFormat) -> Result<()> {
    let controller = BondingController::from_config(config)?;
    let interfaces: Vec<Interface> = controller
        .list_interfaces()
        .into_iter()
        .filter(|i| args.all || i.is_connected())
        .collect();

    if format == OutputFormat::Json {
        return print_json(&interfaces);
    }

    println!("{}", "Network Interfaces:".bright_white().bold());
    println!();
    if interfaces.is_empty() {
        println!("  {}", "(none)".dimmed());
    }
    for iface in interfaces {
        let up = iface.admin_state.is_up();
        println!(
            "  {} {} ({}) - {} [{}]{}",
            if up { "●".green() } else { "○".dimmed() },
            iface.id.as_str().bright_white(),
            iface
                .address
                .map_or_else(|| "no address".to_string(), |a| a.to_string()),
            iface.link_type.to_string().dimmed(),
            if up { "UP".green() } else { "DOWN".red() },
            iface
                .gateway
                .map(|g| format!(" via {g}"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

/// List policies
fn run_policies(format: OutputFormat) -> Result<()> {
    #[derive(Serialize)]
    struct PolicyInfo {
        name: &'static str,
        display_name: &'static str,
        description: &'static str,
        sticky: bool,
    }

    let policies: Vec<PolicyInfo> = linkbond::PolicyKind::ALL
        .iter()
        .map(|kind| PolicyInfo {
            name: kind.name(),
            display_name: kind.display_name(),
            description: kind.description(),
            sticky: kind.is_sticky(),
        })
        .collect();

    if format == OutputFormat::Json {
        return print_json(&policies);
    }

    println!("{}", "Distribution Policies:".bright_white().bold());
    println!();
    for policy in policies {
        println!(
            "  {:<12} {}{}",
            policy.name.cyan(),
            policy.display_name.bright_white(),
            if policy.sticky { " (sticky)".dimmed() } else { "".normal() }
        );
        println!("  {:<12} {}", "", policy.description.dimmed());
    }
    Ok(())
}

fn print_status(status: &BondStatus, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        return print_json(status);
    }

    println!(
        "{} {}  policy: {}  healthy: {}/{}  flows: {}{}",
        "Bond:".bright_white().bold(),
        state_label(status.state),
        status
            .policy
            .map_or_else(|| "-".to_string(), |p| p.to_string())
            .cyan(),
        status.healthy,
        status.required,
        status.assignment_count,
        if status.passthrough { "  passthrough".yellow() } else { "".normal() }
    );
    for line in &status.interfaces {
        let iface = &line.interface;
        println!(
            "  {:<10} {:<12} flows: {:<5} rate: {:<12} latency: {}",
            iface.id.as_str().bright_white(),
            health_label(iface.health),
            iface.load.active_flows,
            util::format_rate(iface.load.bytes_per_sec),
            iface
                .latency
                .map_or_else(|| "-".to_string(), util::format_duration)
        );
    }
    Ok(())
}

/// Enable bonding until Ctrl+C
async fn run_bond(args: RunArgs, config: &Config, format: OutputFormat) -> Result<()> {
    let controller = Arc::new(BondingController::from_config(config)?);
    if args.passthrough {
        controller.authorize_passthrough(true);
    }

    let policy = args
        .policy
        .clone()
        .unwrap_or_else(|| config.bonding.default_policy.clone());
    controller.enable(&interface_ids(&args.interfaces), &policy)?;

    if format == OutputFormat::Text {
        println!(
            "{} linkbond {} bonding {} with {}. Press Ctrl+C to stop.",
            "●".green(),
            VERSION,
            args.interfaces.join(", ").bright_white(),
            policy.cyan()
        );
        println!();
    }

    let mut events = controller.subscribe();
    let mut report = tokio::time::interval(Duration::from_secs(args.interval.max(1)));

    loop {
        tokio::select! {
            _ = report.tick() => {
                print_status(&controller.status(), format)?;
            }
            event = events.recv() => {
                if let (Ok(BondEvent::StateChanged { from, to }), OutputFormat::Text) = (event, format) {
                    println!("{} {} -> {}", "⚠".yellow(), state_label(from), state_label(to));
                }
            }
            _ = signal::ctrl_c() => break,
        }
    }

    controller.disable()?;
    if format == OutputFormat::Text {
        println!();
        println!("{} Bonding disabled.", "●".yellow());
    }
    Ok(())
}

/// Preview a routing decision
async fn run_preview(args: PreviewArgs, config: &Config, format: OutputFormat) -> Result<()> {
    let protocol: Protocol = args.protocol.parse().map_err(Error::Validation)?;
    let flow = FlowDescriptor::new(args.source, args.destination, protocol);

    let controller = Arc::new(BondingController::from_config(config)?);
    let policy = args
        .policy
        .clone()
        .unwrap_or_else(|| config.bonding.default_policy.clone());
    controller.enable(&interface_ids(&args.interfaces), &policy)?;

    let outcome = async {
        if args.probe {
            controller.probe_now().await?;
        }
        controller.route_preview(&flow)
    }
    .await;
    controller.disable()?;
    let iface = outcome?;

    if format == OutputFormat::Json {
        return print_json(&iface);
    }
    println!(
        "{} {} {} {} ({})",
        flow.to_string().bright_white(),
        "→".cyan(),
        iface.id.as_str().green().bold(),
        iface.link_type.to_string().dimmed(),
        policy.cyan()
    );
    Ok(())
}

/// Print example configuration
fn run_config(args: ConfigArgs) -> Result<()> {
    let config = Config::example();
    let output = toml::to_string_pretty(&config)
        .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

    if let Some(ref path) = args.output {
        std::fs::write(path, &output)?;
        println!(
            "{} Configuration written to {}",
            "✓".green(),
            path.display()
        );
    } else {
        println!("{output}");
    }

    Ok(())
}
