//! Configuration management for linkbond.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::bonding::{BondingConfig, Interface, PolicyKind, ProbeConfig};
use crate::error::{Error, Result};
use crate::types::LinkType;
use crate::util::DiscoveryConfig;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Bond group configuration.
    #[serde(default)]
    pub bonding: BondingConfig,

    /// Health probing configuration.
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Interface discovery configuration.
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config: {e}")))?;

        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.bonding.min_interfaces < 2 {
            return Err(Error::InvalidConfig(
                "bonding.min_interfaces must be at least 2".into(),
            ));
        }

        if self.bonding.default_policy.parse::<PolicyKind>().is_err() {
            return Err(Error::InvalidConfig(format!(
                "Unknown bonding.default_policy: {}",
                self.bonding.default_policy
            )));
        }

        if self.probe.interval.is_zero() || self.probe.timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "probe.interval and probe.timeout must be non-zero".into(),
            ));
        }

        if self.probe.timeout > self.probe.interval {
            return Err(Error::InvalidConfig(
                "probe.timeout must not exceed probe.interval".into(),
            ));
        }

        if self.probe.failure_threshold == 0 {
            return Err(Error::InvalidConfig(
                "probe.failure_threshold must be at least 1".into(),
            ));
        }

        if self.probe.max_concurrent == 0 {
            return Err(Error::InvalidConfig(
                "probe.max_concurrent must be at least 1".into(),
            ));
        }

        if self.probe.targets.is_empty() {
            return Err(Error::InvalidConfig("No probe targets configured".into()));
        }

        if self.discovery.timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "discovery.timeout must be non-zero".into(),
            ));
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(Error::InvalidConfig(format!(
                "Unknown logging.format: {}",
                self.logging.format
            )));
        }

        Ok(())
    }

    /// Get default config path.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("org", "linkbond", "linkbond").map_or_else(
            || PathBuf::from("linkbond.toml"),
            |dirs| dirs.config_dir().join("config.toml"),
        )
    }

    /// Create example configuration.
    pub fn example() -> Self {
        let mut config = Self::default();
        config.probe.interval = std::time::Duration::from_secs(2);
        config.bonding.default_policy = PolicyKind::LeastConnections.name().into();
        config.discovery.interfaces = vec![
            Interface::new("eth0", LinkType::Wired)
                .with_address(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)))
                .with_gateway(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))),
            Interface::new("wlan0", LinkType::Wireless)
                .with_address(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 20)))
                .with_gateway(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))),
        ];
        config
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text or json).
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable colored output.
    #[serde(default = "default_color")]
    pub color: bool,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_color() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_color(),
        }
    }
}

impl LoggingConfig {
    /// Layer command-line flags over the file settings.
    pub fn with_overrides(&self, level: Option<&str>, no_color: bool) -> Self {
        Self {
            level: level.map_or_else(|| self.level.clone(), str::to_string),
            color: self.color && !no_color,
            format: self.format.clone(),
        }
    }
}

/// Initialize logging.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    } else {
        subscriber
            .with(fmt::layer().with_ansi(config.color))
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    }

    Ok(())
}
