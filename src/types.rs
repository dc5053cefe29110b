//! Core types used throughout linkbond.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a network interface (its OS name).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InterfaceId(pub String);

impl InterfaceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for InterfaceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for InterfaceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Physical link classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    /// Wired Ethernet
    Wired,
    /// WiFi
    Wireless,
    /// Cellular, tunnel or anything else
    #[default]
    Other,
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wired => write!(f, "wired"),
            Self::Wireless => write!(f, "wireless"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Administrative state as reported by interface discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AdminState {
    Up,
    #[default]
    Down,
}

impl AdminState {
    pub fn is_up(self) -> bool {
        matches!(self, Self::Up)
    }
}

impl From<bool> for AdminState {
    fn from(up: bool) -> Self {
        if up {
            Self::Up
        } else {
            Self::Down
        }
    }
}

impl fmt::Display for AdminState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// Interface health as classified by the health prober.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Probes succeed within the latency budget
    #[default]
    Healthy,
    /// Recent failures or slow probes, still routable
    Degraded,
    /// Failure threshold reached, never routed
    Unreachable,
}

impl HealthState {
    /// Whether the router may select an interface in this state.
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }

    /// Classify from the number of consecutive probe failures.
    pub fn from_failures(consecutive_failures: u32, threshold: u32) -> Self {
        match consecutive_failures {
            0 => Self::Healthy,
            n if n >= threshold => Self::Unreachable,
            _ => Self::Degraded,
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// Bonding controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BondState {
    /// No bond group exists
    #[default]
    Disabled,
    /// Enable request is being checked
    Validating,
    /// Bond group active with enough healthy members
    Enabled,
    /// Bond group active but below the healthy minimum
    Degraded,
    /// Tear-down in progress
    Disabling,
}

impl BondState {
    /// Whether a bond group exists in this state.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Enabled | Self::Degraded)
    }
}

impl fmt::Display for BondState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::Validating => write!(f, "validating"),
            Self::Enabled => write!(f, "enabled"),
            Self::Degraded => write!(f, "degraded"),
            Self::Disabling => write!(f, "disabling"),
        }
    }
}

/// Transport protocol of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Icmp,
    Other(u8),
}

impl Protocol {
    /// IANA protocol number.
    pub fn number(self) -> u8 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
            Self::Icmp => 1,
            Self::Other(n) => n,
        }
    }
}

impl From<u8> for Protocol {
    fn from(n: u8) -> Self {
        match n {
            6 => Self::Tcp,
            17 => Self::Udp,
            1 => Self::Icmp,
            n => Self::Other(n),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
            Self::Icmp => write!(f, "icmp"),
            Self::Other(n) => write!(f, "proto-{n}"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "icmp" => Ok(Self::Icmp),
            other => other
                .parse::<u8>()
                .map(Self::from)
                .map_err(|_| format!("unknown protocol: {s}")),
        }
    }
}
