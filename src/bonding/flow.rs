//! Flow descriptors and address hashing.
//!
//! Address hashing folds the address into 16-bit one's-complement words the
//! way ECMP routers hash headers, so the result depends only on the address
//! bytes and is stable across processes and releases.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::PolicyKind;
use crate::types::{InterfaceId, Protocol};

/// Key identifying a flow in the assignment table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKey {
    /// Derived from the flow's addresses and protocol.
    Tuple {
        source: SocketAddr,
        destination: SocketAddr,
        protocol: Protocol,
    },
    /// Caller-supplied key (connection id, request id, ...).
    Opaque(u64),
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tuple {
                source,
                destination,
                protocol,
            } => write!(f, "{protocol} {source} -> {destination}"),
            Self::Opaque(key) => write!(f, "#{key:016x}"),
        }
    }
}

/// One outbound connection or request needing an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowDescriptor {
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub protocol: Protocol,
    pub key: FlowKey,
}

impl FlowDescriptor {
    /// Create a flow keyed by its addresses and protocol.
    pub fn new(source: SocketAddr, destination: SocketAddr, protocol: Protocol) -> Self {
        Self {
            source,
            destination,
            protocol,
            key: FlowKey::Tuple {
                source,
                destination,
                protocol,
            },
        }
    }

    pub fn tcp(source: SocketAddr, destination: SocketAddr) -> Self {
        Self::new(source, destination, Protocol::Tcp)
    }

    pub fn udp(source: SocketAddr, destination: SocketAddr) -> Self {
        Self::new(source, destination, Protocol::Udp)
    }

    /// Replace the derived key with a caller-supplied one.
    pub fn with_key(mut self, key: u64) -> Self {
        self.key = FlowKey::Opaque(key);
        self
    }

    /// Stable hash of the source address.
    pub fn source_hash(&self) -> u16 {
        address_hash(self.source.ip())
    }

    /// Stable hash of the destination address.
    pub fn destination_hash(&self) -> u16 {
        address_hash(self.destination.ip())
    }
}

impl fmt::Display for FlowDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.protocol, self.source, self.destination)
    }
}

/// Binding of a flow key to the interface carrying it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub key: FlowKey,
    pub interface: InterfaceId,
    /// Policy that made the binding.
    pub policy: PolicyKind,
    pub assigned_at: Instant,
    /// Number of route calls answered from this binding.
    pub hits: u64,
}

impl Assignment {
    pub fn new(key: FlowKey, interface: InterfaceId, policy: PolicyKind) -> Self {
        Self {
            key,
            interface,
            policy,
            assigned_at: Instant::now(),
            hits: 1,
        }
    }
}

/// Fold an address into a 16-bit hash.
///
/// IPv4-mapped IPv6 addresses hash like their IPv4 form.
pub fn address_hash(addr: IpAddr) -> u16 {
    let addr = match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(IpAddr::V6(v6), IpAddr::V4),
        v4 => v4,
    };

    let mut hash: u32 = 0;
    match addr {
        IpAddr::V4(v4) => {
            for chunk in v4.octets().chunks(2) {
                hash = hash.wrapping_add(u32::from(u16::from_be_bytes([chunk[0], chunk[1]])));
            }
        }
        IpAddr::V6(v6) => {
            for segment in v6.segments() {
                hash = hash.wrapping_add(u32::from(segment));
            }
        }
    }

    while hash > 0xffff {
        hash = (hash & 0xffff) + (hash >> 16);
    }
    hash as u16
}
