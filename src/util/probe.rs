//! Reachability probes sent through a specific interface.
//!
//! Sockets are bound to the interface's address and, on Linux, to the
//! device itself so the kernel cannot route the probe out another link.
//! Neither probe applies its own timeout; the health prober bounds every
//! check.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::{TcpSocket, UdpSocket};
use tracing::debug;

use crate::bonding::{Interface, ReachabilityProbe};
use crate::error::ProbeFailure;

/// Create a non-blocking socket bound to the interface.
fn bound_socket(iface: &Interface, address: IpAddr, ty: Type, protocol: Protocol) -> std::io::Result<Socket> {
    let domain = if address.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, ty, Some(protocol))?;

    // SO_BINDTODEVICE needs CAP_NET_RAW; the address bind still applies.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        if let Err(e) = socket.bind_device(Some(iface.id.as_str().as_bytes())) {
            debug!(interface = %iface.id, "SO_BINDTODEVICE failed: {e}, using address binding");
        }
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        let _ = iface;
    }

    socket.bind(&SockAddr::from(SocketAddr::new(address, 0)))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

fn interface_address(iface: &Interface) -> Result<IpAddr, ProbeFailure> {
    iface
        .address
        .ok_or_else(|| ProbeFailure::NoAddress(iface.id.clone()))
}

/// TCP connect probe: success is a completed handshake.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnectProbe;

impl TcpConnectProbe {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ReachabilityProbe for TcpConnectProbe {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn probe(&self, iface: &Interface, target: SocketAddr) -> Result<Duration, ProbeFailure> {
        let address = interface_address(iface)?;
        let io = |source| ProbeFailure::Io { target, source };

        let socket = bound_socket(iface, address, Type::STREAM, Protocol::TCP).map_err(io)?;
        let socket = TcpSocket::from_std_stream(socket.into());

        let start = Instant::now();
        let stream = socket.connect(target).await.map_err(io)?;
        let rtt = start.elapsed();
        drop(stream);
        Ok(rtt)
    }
}

/// DNS probe: a root `A` query over UDP that must be answered.
#[derive(Debug, Clone, Copy, Default)]
pub struct DnsProbe;

impl DnsProbe {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ReachabilityProbe for DnsProbe {
    fn name(&self) -> &'static str {
        "dns"
    }

    async fn probe(&self, iface: &Interface, target: SocketAddr) -> Result<Duration, ProbeFailure> {
        let address = interface_address(iface)?;
        let io = |source| ProbeFailure::Io { target, source };

        let socket = bound_socket(iface, address, Type::DGRAM, Protocol::UDP).map_err(io)?;
        let socket = UdpSocket::from_std(socket.into()).map_err(io)?;

        let query = build_dns_query();
        let txn_id = [query[0], query[1]];

        let start = Instant::now();
        socket.send_to(&query, target).await.map_err(io)?;

        let mut buf = [0u8; 512];
        loop {
            let (len, from) = socket.recv_from(&mut buf).await.map_err(io)?;
            if from != target {
                continue;
            }
            return match check_dns_response(&buf[..len], txn_id) {
                Ok(()) => Ok(start.elapsed()),
                Err(reason) => Err(ProbeFailure::InvalidResponse { target, reason }),
            };
        }
    }
}

/// Minimal DNS query for the root zone with a random transaction id.
pub fn build_dns_query() -> Vec<u8> {
    let mut query = Vec::with_capacity(17);
    let txn_id: u16 = rand::random();
    query.extend_from_slice(&txn_id.to_be_bytes());
    // Standard query, recursion desired
    query.extend_from_slice(&[0x01, 0x00]);
    // One question, no answer/authority/additional records
    query.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    // Root name, type A, class IN
    query.push(0x00);
    query.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
    query
}

/// Accept any well-formed response to our transaction, error rcodes included:
/// the resolver answered through this interface.
pub fn check_dns_response(response: &[u8], txn_id: [u8; 2]) -> Result<(), String> {
    if response.len() < 12 {
        return Err(format!("short response ({} bytes)", response.len()));
    }
    if response[..2] != txn_id {
        return Err("transaction id mismatch".into());
    }
    if response[2] & 0x80 == 0 {
        return Err("not a response".into());
    }
    Ok(())
}
