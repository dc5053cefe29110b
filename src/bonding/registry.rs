//! Interface registry: the shared view of known interfaces.
//!
//! The registry is the single owner of interface records. The prober writes
//! health, the router writes load counters and discovery refreshes replace
//! the addressing. Readers always receive cloned snapshots, so a record is
//! never observed half-updated.

use std::collections::BTreeMap;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::Interface;
use crate::error::{Error, Result};
use crate::types::{HealthState, InterfaceId};

/// Change notifications published by the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    /// Interface observed for the first time.
    Added(InterfaceId),
    /// Interface missing from a refresh.
    Removed(InterfaceId),
    /// Health classification changed.
    HealthChanged {
        id: InterfaceId,
        from: HealthState,
        to: HealthState,
    },
    /// Administrative state changed on refresh.
    AdminChanged(InterfaceId),
}

/// Thread-safe registry of interfaces keyed by identifier.
pub struct InterfaceRegistry {
    interfaces: RwLock<BTreeMap<InterfaceId, Interface>>,
    event_tx: broadcast::Sender<RegistryEvent>,
}

impl InterfaceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            interfaces: RwLock::new(BTreeMap::new()),
            event_tx,
        }
    }

    /// Create a registry seeded with interfaces.
    pub fn with_interfaces(interfaces: impl IntoIterator<Item = Interface>) -> Self {
        let registry = Self::new();
        {
            let mut map = registry.interfaces.write();
            for iface in interfaces {
                map.insert(iface.id.clone(), iface);
            }
        }
        registry
    }

    /// Subscribe to registry changes.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_tx.subscribe()
    }

    /// Snapshot of all interfaces, ordered by identifier.
    pub fn list(&self) -> Vec<Interface> {
        self.interfaces.read().values().cloned().collect()
    }

    /// Snapshot of one interface.
    pub fn get(&self, id: &InterfaceId) -> Result<Interface> {
        self.interfaces
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownInterface(id.clone()))
    }

    pub fn contains(&self, id: &InterfaceId) -> bool {
        self.interfaces.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.interfaces.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.read().is_empty()
    }

    /// Routable interfaces among `members`, ordered by identifier.
    ///
    /// Members missing from the registry are skipped.
    pub fn routable(&self, members: &[InterfaceId]) -> Vec<Interface> {
        let map = self.interfaces.read();
        let mut candidates: Vec<Interface> = members
            .iter()
            .filter_map(|id| map.get(id))
            .filter(|iface| iface.is_routable())
            .cloned()
            .collect();
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        candidates.dedup_by(|a, b| a.id == b.id);
        candidates
    }

    /// Merge an observed inventory.
    ///
    /// Interfaces still present keep their health and load counters;
    /// interfaces not observed are dropped.
    pub fn update(&self, observed: Vec<Interface>) {
        let mut events = Vec::new();
        {
            let mut map = self.interfaces.write();
            let mut next = BTreeMap::new();

            for iface in observed {
                match map.remove(&iface.id) {
                    Some(mut existing) => {
                        if existing.admin_state != iface.admin_state {
                            events.push(RegistryEvent::AdminChanged(iface.id.clone()));
                        }
                        existing.merge_observed(&iface);
                        next.insert(existing.id.clone(), existing);
                    }
                    None => {
                        events.push(RegistryEvent::Added(iface.id.clone()));
                        next.insert(iface.id.clone(), iface);
                    }
                }
            }

            for id in map.keys() {
                events.push(RegistryEvent::Removed(id.clone()));
            }

            *map = next;
        }

        for event in events {
            match &event {
                RegistryEvent::Added(id) => info!(interface = %id, "Interface added"),
                RegistryEvent::Removed(id) => info!(interface = %id, "Interface removed"),
                _ => {}
            }
            let _ = self.event_tx.send(event);
        }
    }

    /// Record a probe classification for an interface.
    ///
    /// Returns the previous health, or `None` if the interface is unknown.
    pub fn set_health(
        &self,
        id: &InterfaceId,
        health: HealthState,
        latency: Option<Duration>,
    ) -> Option<HealthState> {
        let previous = {
            let mut map = self.interfaces.write();
            let iface = map.get_mut(id)?;
            let previous = iface.health;
            iface.health = health;
            if latency.is_some() {
                iface.latency = latency;
            }
            previous
        };

        if previous != health {
            debug!(interface = %id, from = %previous, to = %health, "Health changed");
            let _ = self.event_tx.send(RegistryEvent::HealthChanged {
                id: id.clone(),
                from: previous,
                to: health,
            });
        }
        Some(previous)
    }

    /// Increment the active flow counter.
    pub fn acquire_flow(&self, id: &InterfaceId) -> Result<()> {
        let mut map = self.interfaces.write();
        let iface = map
            .get_mut(id)
            .ok_or_else(|| Error::UnknownInterface(id.clone()))?;
        iface.load.active_flows += 1;
        Ok(())
    }

    /// Decrement the active flow counter, saturating at zero.
    ///
    /// Unknown interfaces are ignored: their counters left with them.
    pub fn release_flow(&self, id: &InterfaceId) {
        if let Some(iface) = self.interfaces.write().get_mut(id) {
            iface.load.active_flows = iface.load.active_flows.saturating_sub(1);
        }
    }

    /// Overwrite the active flow counter.
    pub fn set_active_flows(&self, id: &InterfaceId, flows: u64) -> Result<()> {
        let mut map = self.interfaces.write();
        let iface = map
            .get_mut(id)
            .ok_or_else(|| Error::UnknownInterface(id.clone()))?;
        iface.load.active_flows = flows;
        Ok(())
    }

    /// Fold an observed egress rate into the interface's moving average.
    pub fn record_throughput(&self, id: &InterfaceId, bytes_per_sec: f64) -> Result<()> {
        let mut map = self.interfaces.write();
        let iface = map
            .get_mut(id)
            .ok_or_else(|| Error::UnknownInterface(id.clone()))?;
        iface.load.observe_throughput(bytes_per_sec);
        Ok(())
    }
}

impl Default for InterfaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InterfaceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceRegistry")
            .field("interfaces", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AdminState, LinkType};

    fn iface(name: &str) -> Interface {
        Interface::new(name, LinkType::Wired)
    }

    #[test]
    fn test_list_is_ordered() {
        let registry = InterfaceRegistry::with_interfaces([iface("wlan0"), iface("eth1"), iface("eth0")]);
        let names: Vec<_> = registry.list().into_iter().map(|i| i.id.0).collect();
        assert_eq!(names, vec!["eth0", "eth1", "wlan0"]);
    }

    #[test]
    fn test_get_unknown() {
        let registry = InterfaceRegistry::new();
        let err = registry.get(&InterfaceId::new("eth0")).unwrap_err();
        assert!(matches!(err, Error::UnknownInterface(_)));
    }

    #[test]
    fn test_update_preserves_load_and_drops_missing() {
        let registry = InterfaceRegistry::with_interfaces([iface("eth0"), iface("wlan0")]);
        registry.set_active_flows(&InterfaceId::new("eth0"), 4).unwrap();
        let mut rx = registry.subscribe();

        registry.update(vec![iface("eth0"), iface("usb0")]);

        assert_eq!(registry.get(&InterfaceId::new("eth0")).unwrap().load.active_flows, 4);
        assert!(!registry.contains(&InterfaceId::new("wlan0")));
        assert!(registry.contains(&InterfaceId::new("usb0")));

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(events.contains(&RegistryEvent::Added(InterfaceId::new("usb0"))));
        assert!(events.contains(&RegistryEvent::Removed(InterfaceId::new("wlan0"))));
    }

    #[test]
    fn test_routable_filters_members() {
        let registry = InterfaceRegistry::with_interfaces([
            iface("eth0"),
            iface("eth1").with_admin_state(AdminState::Down),
            iface("wlan0").with_health(HealthState::Unreachable),
            iface("wlan1"),
        ]);
        let members = vec![
            InterfaceId::new("wlan1"),
            InterfaceId::new("eth0"),
            InterfaceId::new("eth1"),
            InterfaceId::new("wlan0"),
            InterfaceId::new("gone0"),
        ];
        let names: Vec<_> = registry.routable(&members).into_iter().map(|i| i.id.0).collect();
        assert_eq!(names, vec!["eth0", "wlan1"]);
    }

    #[test]
    fn test_set_health_emits_change() {
        let registry = InterfaceRegistry::with_interfaces([iface("eth0")]);
        let mut rx = registry.subscribe();
        let id = InterfaceId::new("eth0");

        let prev = registry.set_health(&id, HealthState::Degraded, None);
        assert_eq!(prev, Some(HealthState::Healthy));
        assert!(matches!(rx.try_recv(), Ok(RegistryEvent::HealthChanged { .. })));

        // Same state again publishes nothing
        registry.set_health(&id, HealthState::Degraded, None);
        assert!(rx.try_recv().is_err());

        assert_eq!(registry.set_health(&InterfaceId::new("nope"), HealthState::Healthy, None), None);
    }

    #[test]
    fn test_release_saturates() {
        let registry = InterfaceRegistry::with_interfaces([iface("eth0")]);
        let id = InterfaceId::new("eth0");
        registry.acquire_flow(&id).unwrap();
        registry.release_flow(&id);
        registry.release_flow(&id);
        assert_eq!(registry.get(&id).unwrap().load.active_flows, 0);
    }
}
