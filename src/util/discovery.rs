//! Interface discovery.
//!
//! [`SystemDiscovery`] enumerates the host's interfaces with `getifaddrs`,
//! classifies wireless links from sysfs and reads per-interface default
//! gateways from the kernel routing table. [`StaticDiscovery`] serves a
//! fixed inventory from configuration.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::guess_link_type;
use crate::bonding::Interface;
use crate::error::{Error, Result};
use crate::types::{AdminState, LinkType};

/// Source of the interface inventory.
pub trait InterfaceDiscovery: Send + Sync {
    /// Current inventory. Health and load fields are left at their defaults;
    /// the registry keeps its own values for interfaces it already knows.
    fn discover(&self) -> Result<Vec<Interface>>;
}

/// Discovery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Inventory refresh period while bonding is active. Zero disables.
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,

    /// Longest a background refresh may wait on discovery.
    #[serde(default = "default_discovery_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Interface name prefixes to skip.
    #[serde(default = "default_ignore_patterns")]
    pub ignore_patterns: Vec<String>,

    /// Fixed inventory; replaces OS discovery when non-empty.
    #[serde(default)]
    pub interfaces: Vec<Interface>,
}

/// Default bound on one discovery call made by the bond watcher.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

fn default_refresh_interval() -> Duration { Duration::from_secs(10) }
fn default_discovery_timeout() -> Duration { DEFAULT_DISCOVERY_TIMEOUT }
fn default_ignore_patterns() -> Vec<String> {
    vec!["docker".into(), "virbr".into(), "veth".into(), "br-".into()]
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            refresh_interval: default_refresh_interval(),
            timeout: default_discovery_timeout(),
            ignore_patterns: default_ignore_patterns(),
            interfaces: Vec::new(),
        }
    }
}

/// Fixed inventory.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    interfaces: Vec<Interface>,
}

impl StaticDiscovery {
    pub fn new(interfaces: Vec<Interface>) -> Self {
        Self { interfaces }
    }
}

impl InterfaceDiscovery for StaticDiscovery {
    fn discover(&self) -> Result<Vec<Interface>> {
        Ok(self.interfaces.clone())
    }
}

/// Host interface enumeration.
#[derive(Debug, Clone)]
pub struct SystemDiscovery {
    ignore_patterns: Vec<String>,
}

impl SystemDiscovery {
    pub fn new(ignore_patterns: Vec<String>) -> Self {
        Self { ignore_patterns }
    }

    fn is_ignored(&self, name: &str) -> bool {
        self.ignore_patterns.iter().any(|p| name.starts_with(p.as_str()))
    }
}

impl Default for SystemDiscovery {
    fn default() -> Self {
        Self::new(default_ignore_patterns())
    }
}

impl InterfaceDiscovery for SystemDiscovery {
    fn discover(&self) -> Result<Vec<Interface>> {
        let gateways = default_gateways();
        let mut interfaces = Vec::new();

        for (name, entry) in enumerate()? {
            if entry.loopback || self.is_ignored(&name) {
                trace!(interface = %name, "Skipping interface");
                continue;
            }

            let mut iface = Interface::new(name.as_str(), link_type(&name))
                .with_admin_state(AdminState::from(entry.up));
            if let Some(address) = entry.primary_address() {
                iface = iface.with_address(address);
            }
            if let Some(gateway) = gateways.get(&name) {
                iface = iface.with_gateway(IpAddr::V4(*gateway));
            }
            interfaces.push(iface);
        }

        debug!(count = interfaces.len(), "Discovered interfaces");
        Ok(interfaces)
    }
}

/// Flags and addresses collected for one interface name.
#[derive(Debug, Default)]
struct RawInterface {
    up: bool,
    loopback: bool,
    addresses: Vec<IpAddr>,
}

impl RawInterface {
    /// First routable IPv4 address, else the first global IPv6 address.
    fn primary_address(&self) -> Option<IpAddr> {
        let v4 = self.addresses.iter().find(|a| match a {
            IpAddr::V4(v4) => !v4.is_link_local() && !v4.is_unspecified(),
            IpAddr::V6(_) => false,
        });
        let v6 = self.addresses.iter().find(|a| match a {
            IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) != 0xfe80 && !v6.is_unspecified(),
            IpAddr::V4(_) => false,
        });
        v4.or(v6).copied()
    }
}

#[cfg(unix)]
#[allow(clippy::cast_ptr_alignment)]
fn enumerate() -> Result<BTreeMap<String, RawInterface>> {
    use std::ffi::CStr;

    let mut found: BTreeMap<String, RawInterface> = BTreeMap::new();

    // SAFETY: the list returned by getifaddrs is only read while it is alive
    // and released exactly once with freeifaddrs.
    unsafe {
        let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(std::ptr::addr_of_mut!(ifaddrs)) != 0 {
            return Err(Error::Discovery(std::io::Error::last_os_error().to_string()));
        }

        let mut current = ifaddrs;
        while !current.is_null() {
            let ifa = &*current;
            current = ifa.ifa_next;
            if ifa.ifa_name.is_null() {
                continue;
            }

            let name = CStr::from_ptr(ifa.ifa_name).to_string_lossy().into_owned();
            let entry = found.entry(name).or_default();
            let flags = ifa.ifa_flags as i32;
            entry.up = (flags & libc::IFF_UP) != 0;
            entry.loopback = (flags & libc::IFF_LOOPBACK) != 0;

            if ifa.ifa_addr.is_null() {
                continue;
            }

            match i32::from((*ifa.ifa_addr).sa_family) {
                libc::AF_INET => {
                    let sockaddr = ifa.ifa_addr.cast::<libc::sockaddr_in>();
                    let ip = Ipv4Addr::from(u32::from_be((*sockaddr).sin_addr.s_addr));
                    entry.addresses.push(IpAddr::V4(ip));
                }
                libc::AF_INET6 => {
                    let sockaddr = ifa.ifa_addr.cast::<libc::sockaddr_in6>();
                    let ip = std::net::Ipv6Addr::from((*sockaddr).sin6_addr.s6_addr);
                    entry.addresses.push(IpAddr::V6(ip));
                }
                _ => {}
            }
        }

        libc::freeifaddrs(ifaddrs);
    }

    Ok(found)
}

#[cfg(not(unix))]
fn enumerate() -> Result<BTreeMap<String, RawInterface>> {
    Err(Error::Discovery(
        "interface enumeration is not supported on this platform".into(),
    ))
}

#[cfg(target_os = "linux")]
fn link_type(name: &str) -> LinkType {
    let sys = std::path::Path::new("/sys/class/net").join(name);
    if sys.join("wireless").exists() || sys.join("phy80211").exists() {
        LinkType::Wireless
    } else if sys.join("device").exists() {
        match guess_link_type(name) {
            LinkType::Other => LinkType::Wired,
            guessed => guessed,
        }
    } else {
        guess_link_type(name)
    }
}

#[cfg(not(target_os = "linux"))]
fn link_type(name: &str) -> LinkType {
    guess_link_type(name)
}

#[cfg(target_os = "linux")]
fn default_gateways() -> BTreeMap<String, Ipv4Addr> {
    match std::fs::read_to_string("/proc/net/route") {
        Ok(table) => parse_route_table(&table),
        Err(e) => {
            debug!("Cannot read routing table: {e}");
            BTreeMap::new()
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn default_gateways() -> BTreeMap<String, Ipv4Addr> {
    BTreeMap::new()
}

/// Default-route gateways per interface from `/proc/net/route` contents.
///
/// Addresses in the table are hex in host (little-endian) byte order.
pub fn parse_route_table(table: &str) -> BTreeMap<String, Ipv4Addr> {
    const RTF_GATEWAY: u32 = 0x2;

    let mut gateways = BTreeMap::new();
    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || fields[1] != "00000000" {
            continue;
        }
        let flags = u32::from_str_radix(fields[3], 16).unwrap_or(0);
        if flags & RTF_GATEWAY == 0 {
            continue;
        }
        if let Ok(raw) = u32::from_str_radix(fields[2], 16) {
            gateways
                .entry(fields[0].to_string())
                .or_insert_with(|| Ipv4Addr::from(raw.to_le_bytes()));
        }
    }
    gateways
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_route_table() {
        let table = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
eth0\t00000000\t0101A8C0\t0003\t0\t0\t100\t00000000\t0\t0\t0
eth0\t0001A8C0\t00000000\t0001\t0\t0\t100\t00FFFFFF\t0\t0\t0
wlan0\t00000000\t0100000A\t0003\t0\t0\t600\t00000000\t0\t0\t0
wlan0\t00000000\t0200000A\t0003\t0\t0\t700\t00000000\t0\t0\t0
";
        let gateways = parse_route_table(table);
        assert_eq!(gateways.len(), 2);
        assert_eq!(gateways["eth0"], Ipv4Addr::new(192, 168, 1, 1));
        // First (lowest metric listed first) wins
        assert_eq!(gateways["wlan0"], Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn test_primary_address_prefers_v4() {
        let raw = RawInterface {
            up: true,
            loopback: false,
            addresses: vec![
                "fe80::1".parse().unwrap(),
                "2001:db8::5".parse().unwrap(),
                "169.254.3.3".parse().unwrap(),
                "192.168.1.20".parse().unwrap(),
            ],
        };
        assert_eq!(raw.primary_address(), Some("192.168.1.20".parse().unwrap()));

        let v6_only = RawInterface {
            addresses: vec!["fe80::1".parse().unwrap(), "2001:db8::5".parse().unwrap()],
            ..Default::default()
        };
        assert_eq!(v6_only.primary_address(), Some("2001:db8::5".parse().unwrap()));
        assert_eq!(RawInterface::default().primary_address(), None);
    }

    #[test]
    fn test_ignore_patterns() {
        let discovery = SystemDiscovery::default();
        assert!(discovery.is_ignored("docker0"));
        assert!(discovery.is_ignored("br-1a2b3c"));
        assert!(!discovery.is_ignored("eth0"));
    }

    #[test]
    fn test_static_discovery() {
        let discovery = StaticDiscovery::new(vec![Interface::new("eth0", LinkType::Wired)]);
        let found = discovery.discover().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id.as_str(), "eth0");
    }

    #[test]
    fn test_system_discovery_skips_loopback() {
        if let Ok(found) = SystemDiscovery::default().discover() {
            assert!(found.iter().all(|i| i.id.as_str() != "lo"));
        }
    }
}
