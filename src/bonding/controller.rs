//! Bonding controller: lifecycle and state machine of the bond.
//!
//! `Disabled -> Validating -> Enabled -> Disabling -> Disabled`, with
//! `Enabled <-> Degraded` driven by probe results. Commands are serialized
//! by one lock; routing never takes it.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{
    Assignment, BondGroup, FlowDescriptor, FlowRouter, HealthProber, Interface,
    InterfaceRegistry, PolicyKind, ProbeConfig, ProbeReport, ReachabilityProbe, RegistryEvent,
};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::types::{BondState, HealthState, InterfaceId};
use crate::util::{InterfaceDiscovery, StaticDiscovery, SystemDiscovery, DEFAULT_DISCOVERY_TIMEOUT};

/// Bonding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BondingConfig {
    /// Healthy members required for normal routing.
    #[serde(default = "default_min_interfaces")]
    pub min_interfaces: usize,

    /// Policy used when none is requested.
    #[serde(default = "default_policy")]
    pub default_policy: String,

    /// Authorize single-link passthrough while degraded.
    #[serde(default)]
    pub allow_passthrough: bool,
}

fn default_min_interfaces() -> usize { 2 }
fn default_policy() -> String { PolicyKind::default().name().to_string() }

impl Default for BondingConfig {
    fn default() -> Self {
        Self {
            min_interfaces: default_min_interfaces(),
            default_policy: default_policy(),
            allow_passthrough: false,
        }
    }
}

impl BondingConfig {
    pub fn default_policy(&self) -> Result<PolicyKind> {
        self.default_policy.parse()
    }
}

/// Controller notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum BondEvent {
    StateChanged { from: BondState, to: BondState },
    MemberAdded(InterfaceId),
    MemberRemoved(InterfaceId),
    HealthChanged {
        id: InterfaceId,
        from: HealthState,
        to: HealthState,
    },
    PassthroughChanged(bool),
}

/// Per-member status line.
#[derive(Debug, Clone, Serialize)]
pub struct InterfaceStatus {
    #[serde(flatten)]
    pub interface: Interface,
    pub consecutive_failures: u32,
    pub assignments: usize,
}

/// Read-only snapshot of the bond.
#[derive(Debug, Clone, Serialize)]
pub struct BondStatus {
    pub state: BondState,
    pub policy: Option<PolicyKind>,
    pub interfaces: Vec<InterfaceStatus>,
    pub healthy: usize,
    pub required: usize,
    pub assignment_count: usize,
    pub passthrough: bool,
}

struct WatcherTask {
    handle: JoinHandle<()>,
    shutdown_tx: broadcast::Sender<()>,
}

/// Owns the bond group and drives its lifecycle.
pub struct BondingController {
    config: BondingConfig,
    registry: Arc<InterfaceRegistry>,
    router: Arc<FlowRouter>,
    prober: Arc<HealthProber>,
    discovery: Arc<dyn InterfaceDiscovery>,
    refresh_interval: Duration,
    discovery_timeout: Duration,
    state: RwLock<BondState>,
    command: Mutex<()>,
    passthrough: AtomicBool,
    event_tx: broadcast::Sender<BondEvent>,
    watcher: Mutex<Option<WatcherTask>>,
}

impl BondingController {
    /// Create a controller and load the initial inventory from `discovery`.
    pub fn new(
        config: BondingConfig,
        probe_config: ProbeConfig,
        discovery: Arc<dyn InterfaceDiscovery>,
        probe: Arc<dyn ReachabilityProbe>,
    ) -> Result<Self> {
        if config.min_interfaces < 2 {
            return Err(Error::InvalidConfig(
                "bonding.min_interfaces must be at least 2".into(),
            ));
        }

        let registry = Arc::new(InterfaceRegistry::with_interfaces(discovery.discover()?));
        let router = Arc::new(FlowRouter::new(Arc::clone(&registry)));
        let prober = Arc::new(HealthProber::new(probe_config, Arc::clone(&registry), probe));
        let (event_tx, _) = broadcast::channel(256);

        Ok(Self {
            passthrough: AtomicBool::new(config.allow_passthrough),
            config,
            registry,
            router,
            prober,
            discovery,
            refresh_interval: Duration::ZERO,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            state: RwLock::new(BondState::Disabled),
            command: Mutex::new(()),
            event_tx,
            watcher: Mutex::new(None),
        })
    }

    /// Build a controller from a full configuration.
    ///
    /// A non-empty static inventory replaces OS discovery.
    pub fn from_config(config: &Config) -> Result<Self> {
        let discovery: Arc<dyn InterfaceDiscovery> = if config.discovery.interfaces.is_empty() {
            Arc::new(SystemDiscovery::new(config.discovery.ignore_patterns.clone()))
        } else {
            Arc::new(StaticDiscovery::new(config.discovery.interfaces.clone()))
        };
        let probe = config.probe.method.build();
        Ok(Self::new(config.bonding.clone(), config.probe.clone(), discovery, probe)?
            .with_refresh_interval(config.discovery.refresh_interval)
            .with_discovery_timeout(config.discovery.timeout))
    }

    /// Refresh the inventory on this interval while bonding is active.
    /// Zero disables periodic refresh.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Give up on a background inventory refresh after `timeout`.
    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    pub fn config(&self) -> &BondingConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<InterfaceRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<FlowRouter> {
        &self.router
    }

    pub fn prober(&self) -> &Arc<HealthProber> {
        &self.prober
    }

    pub fn state(&self) -> BondState {
        *self.state.read()
    }

    /// Subscribe to controller events.
    pub fn subscribe(&self) -> broadcast::Receiver<BondEvent> {
        self.event_tx.subscribe()
    }

    /// Available policies.
    pub fn policies(&self) -> &'static [PolicyKind] {
        &PolicyKind::ALL
    }

    /// Snapshot of every known interface.
    pub fn list_interfaces(&self) -> Vec<Interface> {
        self.registry.list()
    }

    /// Start bonding `ids` with the named policy.
    pub fn enable(self: &Arc<Self>, ids: &[InterfaceId], policy: &str) -> Result<()> {
        let _guard = self.command.lock();

        let current = self.state();
        if current.is_active() {
            return Err(Error::Validation(format!("bonding is already {current}")));
        }

        self.set_state(BondState::Validating);
        let group = match self.validate_request(ids, policy) {
            Ok(group) => group,
            Err(e) => {
                self.set_state(BondState::Disabled);
                debug!("Enable rejected: {e}");
                return Err(e);
            }
        };

        let members = group.members().to_vec();
        let kind = group.policy_kind();
        self.router.install(Arc::new(group));
        self.prober.start(members.clone());
        self.start_watcher();
        self.set_state(BondState::Enabled);

        let names: Vec<&str> = members.iter().map(InterfaceId::as_str).collect();
        info!(policy = %kind, interfaces = ?names, "Bonding enabled");
        Ok(())
    }

    fn validate_request(&self, ids: &[InterfaceId], policy: &str) -> Result<BondGroup> {
        let members: Vec<InterfaceId> = ids
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if members.len() < self.config.min_interfaces {
            return Err(Error::Validation(format!(
                "at least {} interfaces are required, {} given",
                self.config.min_interfaces,
                members.len()
            )));
        }

        let kind: PolicyKind = policy.parse()?;

        for id in &members {
            self.check_eligible(id)?;
        }

        Ok(BondGroup::new(members, kind.build(), self.config.min_interfaces)
            .with_passthrough(self.passthrough.load(Ordering::Relaxed)))
    }

    /// An interface may join the bond when it is up, addressed and usable.
    fn check_eligible(&self, id: &InterfaceId) -> Result<Interface> {
        let iface = self.registry.get(id)?;
        if !iface.admin_state.is_up() {
            return Err(Error::Validation(format!("interface {id} is down")));
        }
        if !iface.is_connected() {
            return Err(Error::Validation(format!("interface {id} has no address")));
        }
        if !iface.health.is_usable() {
            return Err(Error::Validation(format!("interface {id} is {}", iface.health)));
        }
        Ok(iface)
    }

    /// Stop bonding. A no-op when already disabled.
    pub fn disable(&self) -> Result<()> {
        let _guard = self.command.lock();
        self.disable_locked();
        Ok(())
    }

    fn disable_locked(&self) {
        if self.state() == BondState::Disabled {
            debug!("Bonding already disabled");
            return;
        }

        self.set_state(BondState::Disabling);
        self.stop_watcher();
        self.prober.stop();
        let released = self.router.assignment_count();
        self.router.clear();
        self.set_state(BondState::Disabled);
        info!(released, "Bonding disabled");
    }

    /// Read-only snapshot; never waits on the network.
    pub fn status(&self) -> BondStatus {
        let state = self.state();
        let group = self.router.group();
        let counts = self.router.assignments_by_interface();

        let interfaces: Vec<InterfaceStatus> = group
            .as_ref()
            .map(|g| g.members().to_vec())
            .unwrap_or_default()
            .iter()
            .filter_map(|id| self.registry.get(id).ok())
            .map(|interface| InterfaceStatus {
                consecutive_failures: self.prober.consecutive_failures(&interface.id),
                assignments: counts
                    .iter()
                    .find(|(id, _)| *id == interface.id)
                    .map_or(0, |(_, n)| *n),
                interface,
            })
            .collect();

        BondStatus {
            state,
            policy: group.as_ref().map(|g| g.policy_kind()),
            healthy: interfaces.iter().filter(|s| s.interface.is_routable()).count(),
            required: self.config.min_interfaces,
            interfaces,
            assignment_count: self.router.assignment_count(),
            passthrough: self.passthrough.load(Ordering::Relaxed),
        }
    }

    /// Assign a flow to an interface.
    pub fn route(&self, flow: &FlowDescriptor) -> Result<Interface> {
        self.router.route(flow)
    }

    /// Interface a flow would take, without committing an assignment.
    pub fn route_preview(&self, flow: &FlowDescriptor) -> Result<Interface> {
        self.router.preview(flow)
    }

    /// Forget a finished flow.
    pub fn release(&self, flow: &FlowDescriptor) -> Option<Assignment> {
        self.router.release(&flow.key)
    }

    /// Report an observed egress rate for an interface.
    pub fn record_throughput(&self, id: &InterfaceId, bytes_per_sec: f64) -> Result<()> {
        self.registry.record_throughput(id, bytes_per_sec)
    }

    /// Add an interface to the active bond.
    pub fn add_interface(&self, id: &InterfaceId) -> Result<()> {
        let _guard = self.command.lock();
        let group = self.active_group()?;
        if group.contains(id) {
            return Ok(());
        }
        self.check_eligible(id)?;

        let mut members = group.members().to_vec();
        members.push(id.clone());
        members.sort();
        self.prober.set_targets(members.clone());
        self.router.install(Arc::new(group.with_members(members)));

        info!(interface = %id, "Interface added to bond");
        let _ = self.event_tx.send(BondEvent::MemberAdded(id.clone()));
        self.reconcile_locked();
        Ok(())
    }

    /// Remove an interface from the active bond.
    ///
    /// Leaving fewer than the minimum members disables bonding.
    pub fn remove_interface(&self, id: &InterfaceId) -> Result<()> {
        let _guard = self.command.lock();
        let group = self.active_group()?;
        if !group.contains(id) {
            return Err(Error::Validation(format!("interface {id} is not bonded")));
        }

        let members: Vec<InterfaceId> = group
            .members()
            .iter()
            .filter(|m| *m != id)
            .cloned()
            .collect();

        info!(interface = %id, "Interface removed from bond");
        let _ = self.event_tx.send(BondEvent::MemberRemoved(id.clone()));

        if members.len() < group.min_healthy() {
            warn!(
                remaining = members.len(),
                required = group.min_healthy(),
                "Too few interfaces left, disabling bonding"
            );
            self.disable_locked();
            return Ok(());
        }

        self.router.install(Arc::new(group.with_members(members.clone())));
        self.router.evict(id);
        self.prober.set_targets(members);
        self.reconcile_locked();
        Ok(())
    }

    /// Allow or forbid single-link passthrough while degraded.
    pub fn authorize_passthrough(&self, allow: bool) {
        let _guard = self.command.lock();
        let previous = self.passthrough.swap(allow, Ordering::Relaxed);
        if let Some(group) = self.router.group() {
            self.router.install(Arc::new(group.with_passthrough(allow)));
        }
        if previous != allow {
            info!(allow, "Passthrough authorization changed");
            let _ = self.event_tx.send(BondEvent::PassthroughChanged(allow));
        }
    }

    /// Run one probe cycle now and reconcile the bond state.
    pub async fn probe_now(&self) -> Result<ProbeReport> {
        if !self.state().is_active() {
            return Err(Error::NotEnabled);
        }
        let report = self.prober.run_cycle().await;
        self.reconcile();
        Ok(report)
    }

    /// Pull the discovery inventory into the registry.
    ///
    /// Returns the number of known interfaces.
    pub fn refresh_interfaces(&self) -> Result<usize> {
        let observed = self.discovery.discover()?;
        self.registry.update(observed);
        self.reconcile();
        Ok(self.registry.len())
    }

    /// Refresh the inventory on a blocking thread, bounded by the discovery
    /// timeout. A discovery call that overruns keeps its thread but no
    /// longer holds up the caller.
    pub async fn refresh_interfaces_bounded(self: &Arc<Self>) -> Result<usize> {
        let ctrl = Arc::clone(self);
        let timeout = self.discovery_timeout;
        let task = tokio::task::spawn_blocking(move || ctrl.refresh_interfaces());
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(Error::Discovery(format!("refresh task failed: {e}"))),
            Err(_) => Err(Error::Discovery(format!(
                "interface discovery timed out after {timeout:?}"
            ))),
        }
    }

    /// Re-evaluate the bond state from current member health.
    pub fn reconcile(&self) -> BondState {
        let _guard = self.command.lock();
        self.reconcile_locked()
    }

    fn reconcile_locked(&self) -> BondState {
        let current = self.state();
        if !current.is_active() {
            return current;
        }
        let Some(group) = self.router.group() else {
            return current;
        };

        let routable = self.registry.routable(group.members());
        for id in group.members() {
            if !routable.iter().any(|iface| &iface.id == id) {
                self.router.evict(id);
            }
        }

        let next = if routable.len() >= group.min_healthy() {
            BondState::Enabled
        } else {
            BondState::Degraded
        };
        if next != current {
            if next == BondState::Degraded {
                warn!(
                    healthy = routable.len(),
                    required = group.min_healthy(),
                    passthrough = group.passthrough(),
                    "Bond degraded"
                );
            } else {
                info!(healthy = routable.len(), "Bond recovered");
            }
            self.set_state(next);
        }
        next
    }

    fn active_group(&self) -> Result<Arc<BondGroup>> {
        if !self.state().is_active() {
            return Err(Error::NotEnabled);
        }
        self.router.group().ok_or(Error::NotEnabled)
    }

    fn set_state(&self, to: BondState) {
        let from = std::mem::replace(&mut *self.state.write(), to);
        if from != to {
            debug!(%from, %to, "Bond state transition");
            let _ = self.event_tx.send(BondEvent::StateChanged { from, to });
        }
    }

    /// Follow probe reports, registry changes and the refresh timer.
    fn start_watcher(self: &Arc<Self>) {
        self.stop_watcher();

        let controller: Weak<Self> = Arc::downgrade(self);
        let mut reports = self.prober.subscribe();
        let mut registry_events = self.registry.subscribe();
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let refresh_interval = self.refresh_interval;

        let handle = tokio::spawn(async move {
            let period = if refresh_interval.is_zero() {
                Duration::from_secs(3600)
            } else {
                refresh_interval
            };
            let mut refresh = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Refreshes run beside the loop so reports keep being reconciled.
            let mut refreshing: Option<JoinHandle<()>> = None;

            loop {
                tokio::select! {
                    report = reports.recv() => {
                        match report {
                            Ok(_) | Err(RecvError::Lagged(_)) => {}
                            Err(RecvError::Closed) => break,
                        }
                        let Some(ctrl) = controller.upgrade() else { break };
                        ctrl.reconcile();
                    }
                    event = registry_events.recv() => {
                        let Some(ctrl) = controller.upgrade() else { break };
                        match event {
                            Ok(event) => ctrl.on_registry_event(event),
                            Err(RecvError::Lagged(skipped)) => {
                                debug!(skipped, "Registry events lagged");
                                ctrl.reconcile();
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                    _ = refresh.tick(), if !refresh_interval.is_zero() => {
                        if refreshing.as_ref().is_some_and(|task| !task.is_finished()) {
                            debug!("Previous interface refresh still running");
                            continue;
                        }
                        let Some(ctrl) = controller.upgrade() else { break };
                        refreshing = Some(tokio::spawn(async move {
                            if let Err(e) = ctrl.refresh_interfaces_bounded().await {
                                warn!("Interface refresh failed: {e}");
                            }
                        }));
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            if let Some(task) = refreshing {
                task.abort();
            }
            debug!("Bond watcher stopped");
        });

        *self.watcher.lock() = Some(WatcherTask { handle, shutdown_tx });
    }

    fn stop_watcher(&self) {
        if let Some(task) = self.watcher.lock().take() {
            let _ = task.shutdown_tx.send(());
            task.handle.abort();
        }
    }

    fn on_registry_event(&self, event: RegistryEvent) {
        let Some(group) = self.router.group() else {
            return;
        };
        match event {
            RegistryEvent::HealthChanged { id, from, to } if group.contains(&id) => {
                let _ = self.event_tx.send(BondEvent::HealthChanged { id, from, to });
                self.reconcile();
            }
            RegistryEvent::Removed(id) | RegistryEvent::AdminChanged(id) | RegistryEvent::Added(id)
                if group.contains(&id) =>
            {
                self.reconcile();
            }
            _ => {}
        }
    }
}

impl Drop for BondingController {
    fn drop(&mut self) {
        self.stop_watcher();
        self.prober.stop();
    }
}

impl std::fmt::Debug for BondingController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BondingController")
            .field("state", &self.state())
            .field("router", &self.router)
            .finish()
    }
}
