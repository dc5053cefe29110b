//! Flow router: assigns flows to bonded interfaces.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, trace};

use super::{Assignment, BondGroup, FlowDescriptor, FlowKey, Interface, InterfaceRegistry};
use crate::error::{Error, Result};
use crate::types::InterfaceId;

/// Routes flows through the active bond group.
///
/// Lock order is assignment shard, then registry. The group slot is only
/// read long enough to clone the `Arc`, so a route call sees either the
/// group before a transition or the one after it.
pub struct FlowRouter {
    registry: Arc<InterfaceRegistry>,
    group: RwLock<Option<Arc<BondGroup>>>,
    assignments: DashMap<FlowKey, Assignment>,
}

impl FlowRouter {
    pub fn new(registry: Arc<InterfaceRegistry>) -> Self {
        Self {
            registry,
            group: RwLock::new(None),
            assignments: DashMap::new(),
        }
    }

    /// Current bond group, if bonding is active.
    pub fn group(&self) -> Option<Arc<BondGroup>> {
        self.group.read().clone()
    }

    /// Atomically replace the bond group.
    pub fn install(&self, group: Arc<BondGroup>) {
        *self.group.write() = Some(group);
    }

    /// Remove the bond group and release every assignment.
    pub fn clear(&self) -> Option<Arc<BondGroup>> {
        let previous = self.group.write().take();
        let keys: Vec<FlowKey> = self.assignments.iter().map(|e| *e.key()).collect();
        for key in keys {
            self.release(&key);
        }
        previous
    }

    /// Routable members of `group`, failing when below the healthy minimum
    /// without passthrough authorization.
    fn candidates(&self, group: &BondGroup) -> Result<Vec<Interface>> {
        let candidates = self.registry.routable(group.members());
        if candidates.len() < group.min_healthy() && !group.passthrough() {
            return Err(Error::BondDegraded {
                healthy: candidates.len(),
                required: group.min_healthy(),
            });
        }
        Ok(candidates)
    }

    /// Assign `flow` to an interface and record the assignment.
    pub fn route(&self, flow: &FlowDescriptor) -> Result<Interface> {
        let group = self.group().ok_or(Error::NotEnabled)?;
        let candidates = self.candidates(&group)?;
        let policy = group.policy();

        let selected = match self.assignments.entry(flow.key) {
            Entry::Occupied(mut entry) => {
                let selected = policy.select(&candidates, flow, Some(entry.get()))?.clone();
                let assignment = entry.get_mut();
                if assignment.interface == selected.id {
                    assignment.hits += 1;
                } else {
                    self.registry.acquire_flow(&selected.id)?;
                    self.registry.release_flow(&assignment.interface);
                    debug!(
                        flow = %flow,
                        from = %assignment.interface,
                        to = %selected.id,
                        "Flow reassigned"
                    );
                    assignment.interface = selected.id.clone();
                    assignment.policy = policy.kind();
                    assignment.assigned_at = Instant::now();
                    assignment.hits = 1;
                }
                selected
            }
            Entry::Vacant(entry) => {
                let selected = policy.select(&candidates, flow, None)?.clone();
                self.registry.acquire_flow(&selected.id)?;
                entry.insert(Assignment::new(flow.key, selected.id.clone(), policy.kind()));
                trace!(flow = %flow, interface = %selected.id, "Flow assigned");
                selected
            }
        };

        Ok(self.registry.get(&selected.id).unwrap_or(selected))
    }

    /// Interface `flow` would take, without recording anything.
    pub fn preview(&self, flow: &FlowDescriptor) -> Result<Interface> {
        let group = self.group().ok_or(Error::NotEnabled)?;
        let candidates = self.candidates(&group)?;
        let prior = self.assignment(&flow.key);
        group
            .policy()
            .peek(&candidates, flow, prior.as_ref())
            .cloned()
    }

    /// Forget a flow and release its load.
    pub fn release(&self, key: &FlowKey) -> Option<Assignment> {
        let (_, assignment) = self.assignments.remove(key)?;
        self.registry.release_flow(&assignment.interface);
        Some(assignment)
    }

    /// Drop every assignment on `interface`; their flows are placed afresh
    /// on the next route call.
    pub fn evict(&self, interface: &InterfaceId) -> usize {
        let keys: Vec<FlowKey> = self
            .assignments
            .iter()
            .filter(|e| &e.value().interface == interface)
            .map(|e| *e.key())
            .collect();
        let mut evicted = 0;
        for key in keys {
            // Re-check under the shard lock; a concurrent route may have moved it.
            let removed = self
                .assignments
                .remove_if(&key, |_, a| &a.interface == interface);
            if removed.is_some() {
                self.registry.release_flow(interface);
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(interface = %interface, evicted, "Evicted flow assignments");
        }
        evicted
    }

    pub fn assignment(&self, key: &FlowKey) -> Option<Assignment> {
        self.assignments.get(key).map(|a| a.value().clone())
    }

    pub fn assignment_count(&self) -> usize {
        self.assignments.len()
    }

    /// Assignment counts per interface.
    pub fn assignments_by_interface(&self) -> Vec<(InterfaceId, usize)> {
        let mut counts: BTreeMap<InterfaceId, usize> = BTreeMap::new();
        for entry in &self.assignments {
            *counts.entry(entry.value().interface.clone()).or_default() += 1;
        }
        counts.into_iter().collect()
    }
}

impl std::fmt::Debug for FlowRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowRouter")
            .field("active", &self.group.read().is_some())
            .field("assignments", &self.assignments.len())
            .finish()
    }
}
