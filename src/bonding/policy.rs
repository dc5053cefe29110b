//! Distribution policies for assigning flows to interfaces.
//!
//! Implements the selectable strategies:
//! - Round-robin over the current healthy candidates
//! - Source-address hash (sticky)
//! - Destination-address hash (sticky)
//! - Least connections

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{Assignment, FlowDescriptor, Interface};
use crate::error::{Error, Result};

/// Selectable distribution policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PolicyKind {
    /// Rotate through interfaces in order.
    #[default]
    #[serde(rename = "round_robin")]
    RoundRobin,
    /// Hash the source address.
    #[serde(rename = "source_hash")]
    SourceHash,
    /// Hash the destination address.
    #[serde(rename = "dest_hash")]
    DestinationHash,
    /// Pick the interface with the fewest active flows.
    #[serde(rename = "least_conn")]
    LeastConnections,
}

impl PolicyKind {
    pub const ALL: [PolicyKind; 4] = [
        PolicyKind::RoundRobin,
        PolicyKind::SourceHash,
        PolicyKind::DestinationHash,
        PolicyKind::LeastConnections,
    ];

    /// Canonical configuration name.
    pub fn name(self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::SourceHash => "source_hash",
            Self::DestinationHash => "dest_hash",
            Self::LeastConnections => "least_conn",
        }
    }

    /// Human-readable name.
    pub fn display_name(self) -> &'static str {
        match self {
            Self::RoundRobin => "Round Robin",
            Self::SourceHash => "Source IP Hash",
            Self::DestinationHash => "Destination IP Hash",
            Self::LeastConnections => "Least Connections",
        }
    }

    /// One-line description for presentation layers.
    pub fn description(self) -> &'static str {
        match self {
            Self::RoundRobin => {
                "Uses each interface in turn; suits links of similar bandwidth"
            }
            Self::SourceHash => {
                "Routes by the requesting source address; keeps sessions on one link"
            }
            Self::DestinationHash => {
                "Routes by the destination server address; keeps connections stable"
            }
            Self::LeastConnections => {
                "Picks the interface carrying the fewest active flows"
            }
        }
    }

    /// Whether flows keep their interface while it stays healthy.
    pub fn is_sticky(self) -> bool {
        matches!(self, Self::SourceHash | Self::DestinationHash)
    }

    /// Build a fresh policy instance.
    pub fn build(self) -> Arc<dyn Policy> {
        match self {
            Self::RoundRobin => Arc::new(RoundRobin::new()),
            Self::SourceHash => Arc::new(AddressHash::source()),
            Self::DestinationHash => Arc::new(AddressHash::destination()),
            Self::LeastConnections => Arc::new(LeastConnections),
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PolicyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "round_robin" | "roundrobin" | "rr" => Ok(Self::RoundRobin),
            "source_hash" | "src_hash" => Ok(Self::SourceHash),
            "dest_hash" | "destination_hash" | "dst_hash" => Ok(Self::DestinationHash),
            "least_conn" | "least_connections" | "leastconn" => Ok(Self::LeastConnections),
            _ => Err(Error::InvalidPolicy(s.to_string())),
        }
    }
}

/// A flow distribution strategy.
///
/// `candidates` are the routable interfaces of the bond group, ordered by
/// identifier. Every implementation fails with [`Error::Policy`] when the
/// list is empty.
pub trait Policy: Send + Sync + fmt::Debug {
    fn kind(&self) -> PolicyKind;

    /// Choose the interface for `flow`, advancing any internal state.
    fn select<'a>(
        &self,
        candidates: &'a [Interface],
        flow: &FlowDescriptor,
        prior: Option<&Assignment>,
    ) -> Result<&'a Interface>;

    /// Choose as `select` would, without advancing internal state.
    fn peek<'a>(
        &self,
        candidates: &'a [Interface],
        flow: &FlowDescriptor,
        prior: Option<&Assignment>,
    ) -> Result<&'a Interface> {
        self.select(candidates, flow, prior)
    }
}

fn no_candidates() -> Error {
    Error::Policy("no healthy candidate interfaces".into())
}

/// Rotating cursor over the current candidate list.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: Mutex<usize>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index the next call will use for a list of `len` candidates.
    fn position(cursor: usize, len: usize) -> usize {
        // The list may have shrunk since the last call.
        if cursor >= len {
            cursor % len
        } else {
            cursor
        }
    }
}

impl Policy for RoundRobin {
    fn kind(&self) -> PolicyKind {
        PolicyKind::RoundRobin
    }

    fn select<'a>(
        &self,
        candidates: &'a [Interface],
        _flow: &FlowDescriptor,
        _prior: Option<&Assignment>,
    ) -> Result<&'a Interface> {
        if candidates.is_empty() {
            return Err(no_candidates());
        }
        let mut cursor = self.cursor.lock();
        let index = Self::position(*cursor, candidates.len());
        *cursor = (index + 1) % candidates.len();
        Ok(&candidates[index])
    }

    fn peek<'a>(
        &self,
        candidates: &'a [Interface],
        _flow: &FlowDescriptor,
        _prior: Option<&Assignment>,
    ) -> Result<&'a Interface> {
        if candidates.is_empty() {
            return Err(no_candidates());
        }
        let index = Self::position(*self.cursor.lock(), candidates.len());
        Ok(&candidates[index])
    }
}

/// Which address the hash policy keys on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HashField {
    Source,
    Destination,
}

/// Sticky address-hash selection.
#[derive(Debug)]
pub struct AddressHash {
    field: HashField,
}

impl AddressHash {
    pub fn source() -> Self {
        Self {
            field: HashField::Source,
        }
    }

    pub fn destination() -> Self {
        Self {
            field: HashField::Destination,
        }
    }
}

impl Policy for AddressHash {
    fn kind(&self) -> PolicyKind {
        match self.field {
            HashField::Source => PolicyKind::SourceHash,
            HashField::Destination => PolicyKind::DestinationHash,
        }
    }

    fn select<'a>(
        &self,
        candidates: &'a [Interface],
        flow: &FlowDescriptor,
        prior: Option<&Assignment>,
    ) -> Result<&'a Interface> {
        if candidates.is_empty() {
            return Err(no_candidates());
        }

        // Keep the session where it is while that interface is still a candidate.
        if let Some(prior) = prior {
            if let Some(current) = candidates.iter().find(|c| c.id == prior.interface) {
                return Ok(current);
            }
        }

        let hash = match self.field {
            HashField::Source => flow.source_hash(),
            HashField::Destination => flow.destination_hash(),
        };
        Ok(&candidates[usize::from(hash) % candidates.len()])
    }
}

/// Minimum active flows, lowest identifier on ties.
///
/// An already placed flow is not counted against its own interface, and
/// stays there unless another candidate is strictly less loaded.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl Policy for LeastConnections {
    fn kind(&self) -> PolicyKind {
        PolicyKind::LeastConnections
    }

    fn select<'a>(
        &self,
        candidates: &'a [Interface],
        _flow: &FlowDescriptor,
        prior: Option<&Assignment>,
    ) -> Result<&'a Interface> {
        let current = prior.map(|p| &p.interface);
        // (load without this flow, not current, id)
        let rank = |iface: &Interface| {
            let is_current = current == Some(&iface.id);
            let load = if is_current {
                iface.load.active_flows.saturating_sub(1)
            } else {
                iface.load.active_flows
            };
            (load, !is_current)
        };

        candidates
            .iter()
            .min_by(|a, b| rank(a).cmp(&rank(b)).then_with(|| a.id.cmp(&b.id)))
            .ok_or_else(no_candidates)
    }
}
