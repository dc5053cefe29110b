//! Interface records tracked by the registry.

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::EMA_ALPHA;
use crate::types::{AdminState, HealthState, InterfaceId, LinkType};

/// Live load counters for an interface.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct InterfaceLoad {
    /// Flows currently assigned to the interface.
    pub active_flows: u64,
    /// Smoothed egress rate.
    pub bytes_per_sec: f64,
}

impl InterfaceLoad {
    /// Fold a new throughput observation into the moving average.
    pub fn observe_throughput(&mut self, bytes_per_sec: f64) {
        if self.bytes_per_sec == 0.0 {
            self.bytes_per_sec = bytes_per_sec;
        } else {
            self.bytes_per_sec = EMA_ALPHA * bytes_per_sec + (1.0 - EMA_ALPHA) * self.bytes_per_sec;
        }
    }
}

/// A network interface known to the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interface {
    /// Interface name.
    pub id: InterfaceId,
    /// Wired / wireless classification.
    #[serde(default)]
    pub link_type: LinkType,
    /// Assigned address used for egress.
    pub address: Option<IpAddr>,
    /// Default gateway reachable through this interface.
    pub gateway: Option<IpAddr>,
    /// Administrative state from discovery.
    #[serde(default = "default_admin_state")]
    pub admin_state: AdminState,
    /// Health as classified by the prober.
    #[serde(default)]
    pub health: HealthState,
    /// Load counters maintained by the router.
    #[serde(default)]
    pub load: InterfaceLoad,
    /// Last successful probe latency.
    #[serde(default, with = "humantime_serde")]
    pub latency: Option<Duration>,
}

fn default_admin_state() -> AdminState {
    AdminState::Up
}

impl Interface {
    /// Create an administratively up, healthy interface with no load.
    pub fn new(id: impl Into<InterfaceId>, link_type: LinkType) -> Self {
        Self {
            id: id.into(),
            link_type,
            address: None,
            gateway: None,
            admin_state: AdminState::Up,
            health: HealthState::Healthy,
            load: InterfaceLoad::default(),
            latency: None,
        }
    }

    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_gateway(mut self, gateway: IpAddr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_admin_state(mut self, state: AdminState) -> Self {
        self.admin_state = state;
        self
    }

    pub fn with_health(mut self, health: HealthState) -> Self {
        self.health = health;
        self
    }

    pub fn with_active_flows(mut self, flows: u64) -> Self {
        self.load.active_flows = flows;
        self
    }

    /// Whether the router may assign flows to this interface.
    ///
    /// Administratively down or unreachable interfaces are never routable.
    pub fn is_routable(&self) -> bool {
        self.admin_state.is_up() && self.health.is_usable()
    }

    /// Whether the interface has an address to send from.
    pub fn is_connected(&self) -> bool {
        self.address.is_some()
    }

    /// Merge a fresh discovery observation into this record.
    ///
    /// Identity and addressing come from the observation; health, latency and
    /// load belong to the prober and router and are kept.
    pub(crate) fn merge_observed(&mut self, observed: &Interface) {
        self.link_type = observed.link_type;
        self.address = observed.address;
        self.gateway = observed.gateway;
        self.admin_state = observed.admin_state;
    }
}
