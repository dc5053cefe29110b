//! Health prober tests: timeouts, concurrency bounds and classification.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use linkbond::bonding::{HealthProber, Interface, InterfaceRegistry, ProbeConfig, ReachabilityProbe};
use linkbond::error::ProbeFailure;
use linkbond::types::{HealthState, InterfaceId, LinkType};

// Probe with a scripted delay per interface and in-flight accounting
#[derive(Default)]
struct ScriptedProbe {
    delays: Mutex<Vec<(String, Duration)>>,
    failing_targets: Mutex<Vec<SocketAddr>>,
    attempts: Mutex<Vec<(String, SocketAddr)>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedProbe {
    fn delay_for(&self, name: &str) -> Duration {
        self.delays
            .lock()
            .iter()
            .find(|(n, _)| n == name)
            .map_or(Duration::from_millis(1), |(_, d)| *d)
    }
}

#[async_trait]
impl ReachabilityProbe for ScriptedProbe {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn probe(&self, interface: &Interface, target: SocketAddr) -> Result<Duration, ProbeFailure> {
        self.attempts
            .lock()
            .push((interface.id.as_str().to_string(), target));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let delay = self.delay_for(interface.id.as_str());
        tokio::time::sleep(delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing_targets.lock().contains(&target) {
            Err(ProbeFailure::Io {
                target,
                source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            })
        } else {
            Ok(delay)
        }
    }
}

// First call fails slowly, every later call succeeds at once
#[derive(Default)]
struct SlowFirstFailure {
    calls: AtomicUsize,
}

#[async_trait]
impl ReachabilityProbe for SlowFirstFailure {
    fn name(&self) -> &'static str {
        "slow-first-failure"
    }

    async fn probe(&self, _interface: &Interface, _target: SocketAddr) -> Result<Duration, ProbeFailure> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Err(ProbeFailure::Timeout)
        } else {
            Ok(Duration::from_millis(1))
        }
    }
}

fn registry(names: &[&str]) -> Arc<InterfaceRegistry> {
    Arc::new(InterfaceRegistry::with_interfaces(names.iter().enumerate().map(
        |(i, n)| {
            Interface::new(*n, LinkType::Wired)
                .with_address(IpAddr::V4(Ipv4Addr::new(10, 20, 0, 1 + i as u8)))
        },
    )))
}

fn config() -> ProbeConfig {
    ProbeConfig {
        interval: Duration::from_secs(1),
        timeout: Duration::from_millis(200),
        failure_threshold: 3,
        max_concurrent: 8,
        targets: vec!["192.0.2.1:53".parse().unwrap()],
        ..Default::default()
    }
}

fn ids(names: &[&str]) -> Vec<InterfaceId> {
    names.iter().map(|n| InterfaceId::new(*n)).collect()
}

// ============================================================================
// Timeouts
// ============================================================================

#[tokio::test]
async fn test_stuck_check_times_out_without_blocking_others() {
    let registry = registry(&["fast0", "slow0"]);
    let probe = Arc::new(ScriptedProbe::default());
    probe
        .delays
        .lock()
        .push(("slow0".into(), Duration::from_secs(30)));

    let prober = HealthProber::new(config(), Arc::clone(&registry), probe.clone());
    prober.set_targets(ids(&["fast0", "slow0"]));

    let start = Instant::now();
    let report = prober.run_cycle().await;
    assert!(start.elapsed() < Duration::from_secs(5));

    let slow = report.results.iter().find(|r| r.interface.as_str() == "slow0").unwrap();
    assert_eq!(slow.consecutive_failures, 1);
    assert_eq!(slow.health, HealthState::Degraded);
    assert_eq!(slow.error.as_deref(), Some("probe timed out"));

    let fast = report.results.iter().find(|r| r.interface.as_str() == "fast0").unwrap();
    assert_eq!(fast.health, HealthState::Healthy);
    assert!(fast.latency.is_some());
}

#[tokio::test]
async fn test_timeouts_reach_threshold() {
    let registry = registry(&["slow0"]);
    let probe = Arc::new(ScriptedProbe::default());
    probe
        .delays
        .lock()
        .push(("slow0".into(), Duration::from_secs(30)));
    let prober = HealthProber::new(
        ProbeConfig {
            timeout: Duration::from_millis(20),
            ..config()
        },
        Arc::clone(&registry),
        probe,
    );
    prober.set_targets(ids(&["slow0"]));

    for _ in 0..3 {
        prober.run_cycle().await;
    }
    assert_eq!(
        registry.get(&"slow0".into()).unwrap().health,
        HealthState::Unreachable
    );
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_is_bounded() {
    let names: Vec<String> = (0..12).map(|i| format!("eth{i}")).collect();
    let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let registry = registry(&name_refs);
    let probe = Arc::new(ScriptedProbe::default());
    for name in &names {
        probe.delays.lock().push((name.clone(), Duration::from_millis(30)));
    }

    let prober = HealthProber::new(
        ProbeConfig {
            max_concurrent: 3,
            ..config()
        },
        registry,
        probe.clone(),
    );
    prober.set_targets(ids(&name_refs));

    let report = prober.run_cycle().await;
    assert_eq!(report.results.len(), 12);
    assert_eq!(report.healthy_count(), 12);
    assert!(probe.peak.load(Ordering::SeqCst) <= 3);
    assert!(probe.peak.load(Ordering::SeqCst) >= 2, "checks should overlap");
}

// ============================================================================
// Classification
// ============================================================================

#[tokio::test]
async fn test_falls_through_to_next_target() {
    let registry = registry(&["eth0"]);
    let probe = Arc::new(ScriptedProbe::default());
    let first: SocketAddr = "192.0.2.1:53".parse().unwrap();
    let second: SocketAddr = "192.0.2.2:53".parse().unwrap();
    probe.failing_targets.lock().push(first);

    let prober = HealthProber::new(
        ProbeConfig {
            targets: vec![first, second],
            ..config()
        },
        Arc::clone(&registry),
        probe.clone(),
    );
    prober.set_targets(ids(&["eth0"]));

    let report = prober.run_cycle().await;
    assert_eq!(report.results[0].health, HealthState::Healthy);
    let attempts: Vec<SocketAddr> = probe.attempts.lock().iter().map(|(_, t)| *t).collect();
    assert_eq!(attempts, vec![first, second]);
}

#[tokio::test]
async fn test_skips_targets_of_other_family() {
    let registry = registry(&["eth0"]);
    let probe = Arc::new(ScriptedProbe::default());
    let v6: SocketAddr = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 53);
    let v4: SocketAddr = "192.0.2.1:53".parse().unwrap();

    let prober = HealthProber::new(
        ProbeConfig {
            targets: vec![v6, v4],
            ..config()
        },
        registry,
        probe.clone(),
    );
    prober.set_targets(ids(&["eth0"]));
    prober.run_cycle().await;

    assert_eq!(probe.attempts.lock().as_slice(), &[("eth0".to_string(), v4)]);
}

#[tokio::test]
async fn test_no_matching_targets_is_failure() {
    let registry = registry(&["eth0"]);
    let probe = Arc::new(ScriptedProbe::default());
    let prober = HealthProber::new(
        ProbeConfig {
            targets: vec!["[2001:db8::53]:53".parse().unwrap()],
            ..config()
        },
        registry,
        probe,
    );
    prober.set_targets(ids(&["eth0"]));
    let report = prober.run_cycle().await;
    assert_eq!(report.results[0].error.as_deref(), Some("no probe targets configured"));
}

#[tokio::test]
async fn test_slow_success_marks_degraded() {
    let registry = registry(&["eth0", "wlan0"]);
    let probe = Arc::new(ScriptedProbe::default());
    probe
        .delays
        .lock()
        .push(("wlan0".into(), Duration::from_millis(80)));

    let prober = HealthProber::new(
        ProbeConfig {
            degraded_latency: Some(Duration::from_millis(40)),
            ..config()
        },
        Arc::clone(&registry),
        probe,
    );
    prober.set_targets(ids(&["eth0", "wlan0"]));
    prober.run_cycle().await;

    let wlan = registry.get(&"wlan0".into()).unwrap();
    assert_eq!(wlan.health, HealthState::Degraded);
    assert!(wlan.is_routable());
    assert_eq!(prober.consecutive_failures(&"wlan0".into()), 0);
    assert_eq!(
        registry.get(&"eth0".into()).unwrap().health,
        HealthState::Healthy
    );
}

#[tokio::test]
async fn test_overlapping_cycles_apply_in_order() {
    let registry = registry(&["eth0"]);
    let prober = HealthProber::new(
        config(),
        Arc::clone(&registry),
        Arc::new(SlowFirstFailure::default()),
    );
    prober.set_targets(ids(&["eth0"]));

    // The second cycle starts while the first is still waiting on its check
    let (first, second) = tokio::join!(prober.run_cycle(), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        prober.run_cycle().await
    });

    assert_eq!(first.cycle, 1);
    assert_eq!(first.results[0].health, HealthState::Degraded);
    assert_eq!(second.cycle, 2);
    assert_eq!(second.results[0].health, HealthState::Healthy);

    // The newest observation is the one left in the registry
    assert_eq!(
        registry.get(&"eth0".into()).unwrap().health,
        HealthState::Healthy
    );
    assert_eq!(prober.consecutive_failures(&"eth0".into()), 0);
}

#[tokio::test]
async fn test_reports_are_broadcast() {
    let registry = registry(&["eth0"]);
    let prober = HealthProber::new(config(), registry, Arc::new(ScriptedProbe::default()));
    prober.set_targets(ids(&["eth0"]));
    let mut rx = prober.subscribe();

    prober.run_cycle().await;
    prober.run_cycle().await;

    assert_eq!(rx.recv().await.unwrap().cycle, 1);
    assert_eq!(rx.recv().await.unwrap().cycle, 2);
}

#[tokio::test]
async fn test_start_and_stop_loop() {
    let registry = registry(&["eth0"]);
    let prober = Arc::new(HealthProber::new(
        ProbeConfig {
            interval: Duration::from_millis(10),
            timeout: Duration::from_millis(10),
            ..config()
        },
        registry,
        Arc::new(ScriptedProbe::default()),
    ));
    let mut rx = prober.subscribe();

    prober.start(ids(&["eth0"]));
    assert!(prober.is_running());
    let report = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("loop never reported")
        .unwrap();
    assert_eq!(report.results.len(), 1);

    prober.stop();
    prober.stop();
    assert!(!prober.is_running());
}
