//! Periodic interface health probing.
//!
//! Each cycle checks every target interface in parallel, bounded by
//! `max_concurrent`, with each check cancelled after `timeout`. Results are
//! folded into per-interface failure counters and pushed into the registry:
//! one failure marks an interface degraded, `failure_threshold` consecutive
//! failures mark it unreachable, a success restores it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::{Interface, InterfaceRegistry};
use crate::error::{ProbeContext, ProbeFailure};
use crate::types::{HealthState, InterfaceId};
use crate::util::{DnsProbe, TcpConnectProbe};

/// A bounded-time connectivity check through one interface.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Check `target` through `interface`, returning the round-trip time.
    async fn probe(&self, interface: &Interface, target: SocketAddr)
        -> Result<Duration, ProbeFailure>;
}

/// Probe implementation selected in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMethod {
    /// TCP connect to the target.
    Tcp,
    /// DNS query over UDP.
    #[default]
    Dns,
}

impl ProbeMethod {
    pub fn build(self) -> Arc<dyn ReachabilityProbe> {
        match self {
            Self::Tcp => Arc::new(TcpConnectProbe::new()),
            Self::Dns => Arc::new(DnsProbe::new()),
        }
    }
}

/// Health prober configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Time between probe cycles.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Per-check timeout.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Consecutive failures before an interface is unreachable.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Checks allowed in flight at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Successful probes slower than this mark the interface degraded.
    #[serde(default, with = "humantime_serde")]
    pub degraded_latency: Option<Duration>,

    /// Probe implementation.
    #[serde(default)]
    pub method: ProbeMethod,

    /// Targets tried in order until one answers.
    #[serde(default = "default_targets")]
    pub targets: Vec<SocketAddr>,
}

fn default_interval() -> Duration { Duration::from_secs(1) }
fn default_timeout() -> Duration { Duration::from_secs(2) }
fn default_failure_threshold() -> u32 { 3 }
fn default_max_concurrent() -> usize { 8 }
fn default_targets() -> Vec<SocketAddr> {
    ["1.1.1.1:53", "8.8.8.8:53", "[2606:4700:4700::1111]:53"]
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect()
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            timeout: default_timeout(),
            failure_threshold: default_failure_threshold(),
            max_concurrent: default_max_concurrent(),
            degraded_latency: None,
            method: ProbeMethod::default(),
            targets: default_targets(),
        }
    }
}

/// Outcome of checking one interface in a cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub interface: InterfaceId,
    pub health: HealthState,
    pub latency: Option<Duration>,
    pub consecutive_failures: u32,
    pub error: Option<String>,
}

/// All results of one probe cycle.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub cycle: u64,
    pub results: Vec<ProbeResult>,
    pub finished_at: Instant,
}

impl ProbeReport {
    pub fn healthy_count(&self) -> usize {
        self.results.iter().filter(|r| r.health.is_usable()).count()
    }
}

/// Consecutive failure tracking for one interface.
#[derive(Debug, Clone, Default)]
struct FailureTracker {
    consecutive_failures: u32,
    last_success: Option<Instant>,
    last_error: Option<String>,
}

/// Scheduled reachability checks feeding the registry.
pub struct HealthProber {
    config: ProbeConfig,
    registry: Arc<InterfaceRegistry>,
    probe: Arc<dyn ReachabilityProbe>,
    targets: RwLock<Vec<InterfaceId>>,
    trackers: Mutex<HashMap<InterfaceId, FailureTracker>>,
    cycle: AtomicU64,
    cycle_lock: tokio::sync::Mutex<()>,
    report_tx: broadcast::Sender<ProbeReport>,
    task: Mutex<Option<ProberTask>>,
}

struct ProberTask {
    handle: JoinHandle<()>,
    shutdown_tx: broadcast::Sender<()>,
}

impl HealthProber {
    pub fn new(
        config: ProbeConfig,
        registry: Arc<InterfaceRegistry>,
        probe: Arc<dyn ReachabilityProbe>,
    ) -> Self {
        let (report_tx, _) = broadcast::channel(64);
        Self {
            config,
            registry,
            probe,
            targets: RwLock::new(Vec::new()),
            trackers: Mutex::new(HashMap::new()),
            cycle: AtomicU64::new(0),
            cycle_lock: tokio::sync::Mutex::new(()),
            report_tx,
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Subscribe to cycle reports.
    pub fn subscribe(&self) -> broadcast::Receiver<ProbeReport> {
        self.report_tx.subscribe()
    }

    /// Replace the set of interfaces to probe.
    pub fn set_targets(&self, interfaces: Vec<InterfaceId>) {
        self.trackers.lock().retain(|id, _| interfaces.contains(id));
        *self.targets.write() = interfaces;
    }

    pub fn targets(&self) -> Vec<InterfaceId> {
        self.targets.read().clone()
    }

    /// Consecutive failures recorded for an interface.
    pub fn consecutive_failures(&self, id: &InterfaceId) -> u32 {
        self.trackers
            .lock()
            .get(id)
            .map_or(0, |t| t.consecutive_failures)
    }

    /// Last probe error recorded for an interface.
    pub fn last_error(&self, id: &InterfaceId) -> Option<String> {
        self.trackers.lock().get(id).and_then(|t| t.last_error.clone())
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Start probing `interfaces` on the configured interval.
    ///
    /// Restarts the loop if it is already running.
    pub fn start(self: &Arc<Self>, interfaces: Vec<InterfaceId>) {
        self.stop();
        self.set_targets(interfaces);

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let prober = Arc::clone(self);
        let handle = tokio::spawn(async move {
            // Members were validated healthy on enable; first cycle after one period.
            let period = prober.config.interval;
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        prober.run_cycle().await;
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Health prober stopped");
                        break;
                    }
                }
            }
        });

        info!(
            interval = ?self.config.interval,
            method = self.probe.name(),
            "Health prober started"
        );
        *self.task.lock() = Some(ProberTask { handle, shutdown_tx });
    }

    /// Stop the probe loop. Safe to call when not running.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            let _ = task.shutdown_tx.send(());
            task.handle.abort();
        }
    }

    /// Run one probe cycle over the current targets.
    ///
    /// Cycles are serialized: one started while another is in flight waits
    /// for it, so results reach the registry in cycle order.
    pub async fn run_cycle(&self) -> ProbeReport {
        let _serial = self.cycle_lock.lock().await;
        let cycle = self.cycle.fetch_add(1, Ordering::Relaxed) + 1;
        let interfaces: Vec<Interface> = self
            .targets()
            .iter()
            .filter_map(|id| self.registry.get(id).ok())
            .filter(|iface| iface.admin_state.is_up())
            .collect();

        let outcomes: Vec<(InterfaceId, Result<Duration, ProbeFailure>)> =
            futures::stream::iter(interfaces.into_iter().map(|iface| self.check(iface)))
                .buffer_unordered(self.config.max_concurrent.max(1))
                .collect()
                .await;

        let mut results: Vec<ProbeResult> = outcomes
            .into_iter()
            .map(|(id, outcome)| self.apply(id, outcome))
            .collect();
        results.sort_by(|a, b| a.interface.cmp(&b.interface));

        let report = ProbeReport {
            cycle,
            results,
            finished_at: Instant::now(),
        };
        trace!(
            cycle,
            probed = report.results.len(),
            healthy = report.healthy_count(),
            "Probe cycle complete"
        );
        let _ = self.report_tx.send(report.clone());
        report
    }

    /// Check one interface under the per-check timeout.
    async fn check(&self, iface: Interface) -> (InterfaceId, Result<Duration, ProbeFailure>) {
        let outcome = match tokio::time::timeout(self.config.timeout, self.check_targets(&iface)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ProbeFailure::Timeout),
        };
        (iface.id, outcome)
    }

    async fn check_targets(&self, iface: &Interface) -> Result<Duration, ProbeFailure> {
        let address = iface
            .address
            .ok_or_else(|| ProbeFailure::NoAddress(iface.id.clone()))?;

        let mut last_error = ProbeFailure::NoTargets;
        let targets = self
            .config
            .targets
            .iter()
            .filter(|t| t.is_ipv4() == address.is_ipv4());

        for (attempt, target) in targets.enumerate() {
            match self.probe.probe(iface, *target).await {
                Ok(rtt) => return Ok(rtt),
                Err(e) => {
                    let ctx = ProbeContext {
                        interface: &iface.id,
                        target: Some(*target),
                        attempt: attempt as u32 + 1,
                    };
                    debug!("Probe failed ({ctx}): {e}");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Fold a check outcome into the tracker and the registry.
    ///
    /// The registry is written under the tracker lock so a classification
    /// and its publication cannot be reordered.
    fn apply(&self, id: InterfaceId, outcome: Result<Duration, ProbeFailure>) -> ProbeResult {
        let mut trackers = self.trackers.lock();
        let (health, latency, failures, error) = {
            let tracker = trackers.entry(id.clone()).or_default();
            match outcome {
                Ok(rtt) => {
                    tracker.consecutive_failures = 0;
                    tracker.last_success = Some(Instant::now());
                    tracker.last_error = None;
                    let slow = self.config.degraded_latency.is_some_and(|limit| rtt > limit);
                    let health = if slow {
                        HealthState::Degraded
                    } else {
                        HealthState::Healthy
                    };
                    (health, Some(rtt), 0, None)
                }
                Err(e) => {
                    tracker.consecutive_failures = tracker.consecutive_failures.saturating_add(1);
                    tracker.last_error = Some(e.to_string());
                    let health = HealthState::from_failures(
                        tracker.consecutive_failures,
                        self.config.failure_threshold,
                    );
                    (health, None, tracker.consecutive_failures, Some(e.to_string()))
                }
            }
        };

        let previous = self.registry.set_health(&id, health, latency);
        drop(trackers);

        if let Some(previous) = previous {
            if previous != health {
                match health {
                    HealthState::Unreachable => {
                        warn!(interface = %id, failures, "Interface unreachable");
                    }
                    HealthState::Healthy if previous == HealthState::Unreachable => {
                        info!(interface = %id, "Interface recovered");
                    }
                    _ => {}
                }
            }
        }

        ProbeResult {
            interface: id,
            health,
            latency,
            consecutive_failures: failures,
            error,
        }
    }
}

impl Drop for HealthProber {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for HealthProber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthProber")
            .field("method", &self.probe.name())
            .field("targets", &self.targets.read().len())
            .finish()
    }
}
