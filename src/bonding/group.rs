//! Bond group: the bonded interface set and its active policy.

use std::sync::Arc;
use std::time::Instant;

use super::{Policy, PolicyKind};
use crate::types::InterfaceId;

/// An immutable snapshot of the bond.
///
/// Changes build a new group that shares the policy instance (and so its
/// round-robin cursor); the router swaps the whole `Arc` in one step.
#[derive(Debug, Clone)]
pub struct BondGroup {
    members: Vec<InterfaceId>,
    policy: Arc<dyn Policy>,
    min_healthy: usize,
    passthrough: bool,
    created_at: Instant,
}

impl BondGroup {
    pub fn new(members: Vec<InterfaceId>, policy: Arc<dyn Policy>, min_healthy: usize) -> Self {
        Self {
            members,
            policy,
            min_healthy,
            passthrough: false,
            created_at: Instant::now(),
        }
    }

    pub fn members(&self) -> &[InterfaceId] {
        &self.members
    }

    pub fn contains(&self, id: &InterfaceId) -> bool {
        self.members.contains(id)
    }

    pub fn policy(&self) -> &Arc<dyn Policy> {
        &self.policy
    }

    pub fn policy_kind(&self) -> PolicyKind {
        self.policy.kind()
    }

    /// Healthy members required for normal routing.
    pub fn min_healthy(&self) -> usize {
        self.min_healthy
    }

    /// Whether single-link passthrough is authorized below the minimum.
    pub fn passthrough(&self) -> bool {
        self.passthrough
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Same group with a different member set.
    pub fn with_members(&self, members: Vec<InterfaceId>) -> Self {
        Self {
            members,
            ..self.clone()
        }
    }

    pub fn with_passthrough(&self, passthrough: bool) -> Self {
        Self {
            passthrough,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_members_shares_policy() {
        let group = BondGroup::new(
            vec!["eth0".into(), "wlan0".into()],
            PolicyKind::RoundRobin.build(),
            2,
        );
        let grown = group.with_members(vec!["eth0".into(), "wlan0".into(), "usb0".into()]);
        assert!(Arc::ptr_eq(group.policy(), grown.policy()));
        assert!(grown.contains(&"usb0".into()));
        assert!(!group.contains(&"usb0".into()));
        assert!(!grown.with_passthrough(false).passthrough());
        assert!(grown.with_passthrough(true).passthrough());
    }
}
