//! # linkbond
//!
//! Software multi-link bonding: spread outbound flows across several network
//! interfaces, keep watching their health, and fail over without operator
//! intervention.
//!
//! ## Architecture
//!
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Bonding Controller                        │
//! │        enable / disable / status, Enabled <-> Degraded          │
//! ├───────────────────────────────┬─────────────────────────────────┤
//! │          Flow Router          │          Health Prober          │
//! │   assignments, load counters  │  bounded parallel checks with   │
//! │ ┌───────────────────────────┐ │  per-check timeouts             │
//! │ │       Policy Engine       │ │                                 │
//! │ │ round-robin, src/dst hash │ │                                 │
//! │ │ least connections         │ │                                 │
//! │ └───────────────────────────┘ │                                 │
//! ├───────────────────────────────┴─────────────────────────────────┤
//! │                       Interface Registry                        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │          Discovery (getifaddrs, sysfs) / static inventory       │
//! └─────────────────────────────────────────────────────────────────┘

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow stylistic lints that don't affect correctness
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]              // ASCII diagrams in docs
#![allow(clippy::cast_possible_truncation)]  // Hash folding
#![allow(clippy::cast_possible_wrap)]        // libc flag words
#![allow(clippy::float_cmp)]                 // Zero check on the moving average
#![allow(clippy::significant_drop_tightening)] // Lock ordering is intentional
#![allow(clippy::option_if_let_else)]        // More readable in context
#![allow(clippy::use_self)]                  // Explicit type names in matches
#![allow(clippy::redundant_pub_crate)]       // Explicit visibility
#![allow(clippy::future_not_send)]           // Async internals
#![allow(clippy::match_same_arms)]           // Explicit arm per variant is clearer
#![allow(clippy::return_self_not_must_use)]  // Builder methods don't need must_use
#![allow(clippy::ignored_unit_patterns)]     // Ok(_) vs Ok(()) is stylistic

pub mod bonding;
pub mod config;
pub mod error;
pub mod types;
pub mod util;

#[cfg(feature = "cli")]
pub mod cli;

pub use bonding::{BondingController, FlowDescriptor, Interface, PolicyKind};
pub use config::Config;
pub use error::{Error, Result};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::bonding::{
        BondEvent, BondStatus, BondingController, FlowDescriptor, FlowKey, Interface,
        InterfaceRegistry, PolicyKind, ProbeConfig, ReachabilityProbe,
    };
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::types::*;
    pub use crate::util::{InterfaceDiscovery, StaticDiscovery, SystemDiscovery};
}
