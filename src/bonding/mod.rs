//! Link bonding core.
//!
//! - [`InterfaceRegistry`] holds interface records and their health and load
//! - [`HealthProber`] classifies health from periodic reachability checks
//! - [`Policy`] implementations pick an interface for a flow
//! - [`FlowRouter`] applies the active policy and records assignments
//! - [`BondingController`] owns the bond group and its state machine

mod controller;
mod flow;
mod group;
mod interface;
mod policy;
mod prober;
mod registry;
mod router;

pub use controller::{BondEvent, BondStatus, BondingConfig, BondingController, InterfaceStatus};
pub use flow::{address_hash, Assignment, FlowDescriptor, FlowKey};
pub use group::BondGroup;
pub use interface::{Interface, InterfaceLoad};
pub use policy::{AddressHash, LeastConnections, Policy, PolicyKind, RoundRobin};
pub use prober::{
    HealthProber, ProbeConfig, ProbeMethod, ProbeReport, ProbeResult, ReachabilityProbe,
};
pub use registry::{InterfaceRegistry, RegistryEvent};
pub use router::FlowRouter;

/// Smoothing factor for the throughput moving average.
pub const EMA_ALPHA: f64 = 0.2;
