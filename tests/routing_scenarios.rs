//! End-to-end routing scenarios through the bonding controller.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use linkbond::bonding::{
    BondingConfig, BondingController, FlowDescriptor, FlowKey, Interface, ProbeConfig,
    ReachabilityProbe,
};
use linkbond::error::{Error, ProbeFailure};
use linkbond::types::{BondState, HealthState, InterfaceId, LinkType};
use linkbond::util::StaticDiscovery;

// Fails every probe through the interfaces listed in `down`
#[derive(Default)]
struct LinkProbe {
    down: RwLock<Vec<String>>,
}

#[async_trait]
impl ReachabilityProbe for LinkProbe {
    fn name(&self) -> &'static str {
        "link"
    }

    async fn probe(&self, interface: &Interface, target: SocketAddr) -> Result<Duration, ProbeFailure> {
        if self.down.read().iter().any(|n| n == interface.id.as_str()) {
            Err(ProbeFailure::Timeout)
        } else {
            let _ = target;
            Ok(Duration::from_millis(2))
        }
    }
}

fn controller(names: &[&str], config: BondingConfig) -> (Arc<BondingController>, Arc<LinkProbe>) {
    let interfaces = names
        .iter()
        .enumerate()
        .map(|(i, n)| {
            Interface::new(*n, LinkType::Wired)
                .with_address(IpAddr::V4(Ipv4Addr::new(172, 16, 0, 10 + i as u8)))
        })
        .collect();
    let probe = Arc::new(LinkProbe::default());
    let probe_config = ProbeConfig {
        interval: Duration::from_secs(3600),
        failure_threshold: 1,
        targets: vec!["192.0.2.53:53".parse().unwrap()],
        ..Default::default()
    };
    let ctrl = BondingController::new(
        config,
        probe_config,
        Arc::new(StaticDiscovery::new(interfaces)),
        probe.clone(),
    )
    .unwrap();
    (Arc::new(ctrl), probe)
}

fn ids(names: &[&str]) -> Vec<InterfaceId> {
    names.iter().map(|n| InterfaceId::new(*n)).collect()
}

fn flow_from(source: &str) -> FlowDescriptor {
    FlowDescriptor::tcp(source.parse().unwrap(), "203.0.113.80:443".parse().unwrap())
}

fn flow(n: u16) -> FlowDescriptor {
    flow_from(&format!("10.9.{}.{}:{}", n / 200, n % 200 + 1, 20000 + n))
}

fn routed(ctrl: &BondingController, f: &FlowDescriptor) -> String {
    ctrl.route(f).unwrap().id.0
}

// ============================================================================
// Acceptance scenarios
// ============================================================================

#[tokio::test]
async fn test_round_robin_alternates() {
    let (ctrl, _) = controller(&["A", "B"], BondingConfig::default());
    ctrl.enable(&ids(&["A", "B"]), "round_robin").unwrap();

    let sequence: Vec<String> = (1..=4).map(|n| routed(&ctrl, &flow(n))).collect();
    assert_eq!(sequence, vec!["A", "B", "A", "B"]);

    ctrl.disable().unwrap();
}

#[tokio::test]
async fn test_least_connections_with_preexisting_load() {
    let (ctrl, _) = controller(&["A", "B"], BondingConfig::default());
    ctrl.enable(&ids(&["A", "B"]), "least_conn").unwrap();
    ctrl.registry().set_active_flows(&"A".into(), 3).unwrap();
    ctrl.registry().set_active_flows(&"B".into(), 1).unwrap();

    assert_eq!(routed(&ctrl, &flow(1)), "B");
    assert_eq!(ctrl.registry().get(&"B".into()).unwrap().load.active_flows, 2);

    assert_eq!(routed(&ctrl, &flow(2)), "B");
    assert_eq!(ctrl.registry().get(&"B".into()).unwrap().load.active_flows, 3);

    // Tied at 3: lowest identifier wins
    assert_eq!(routed(&ctrl, &flow(3)), "A");
    assert_eq!(ctrl.registry().get(&"A".into()).unwrap().load.active_flows, 4);

    // Completing a flow frees its slot
    ctrl.release(&flow(2)).unwrap();
    assert_eq!(routed(&ctrl, &flow(4)), "B");

    ctrl.disable().unwrap();
}

#[tokio::test]
async fn test_least_connections_keeps_established_flow() {
    let (ctrl, _) = controller(&["A", "B"], BondingConfig::default());
    ctrl.enable(&ids(&["A", "B"]), "least_conn").unwrap();

    let f = flow(1);
    let sequence: Vec<String> = (0..4).map(|_| routed(&ctrl, &f)).collect();
    assert_eq!(sequence, vec!["A", "A", "A", "A"]);
    assert_eq!(ctrl.router().assignment(&f.key).unwrap().hits, 4);
    assert_eq!(ctrl.registry().get(&"A".into()).unwrap().load.active_flows, 1);
    assert_eq!(ctrl.registry().get(&"B".into()).unwrap().load.active_flows, 0);

    // A second flow goes to the idle link, and both stay put
    let g = flow(2);
    assert_eq!(routed(&ctrl, &g), "B");
    for _ in 0..3 {
        assert_eq!(routed(&ctrl, &f), "A");
        assert_eq!(routed(&ctrl, &g), "B");
    }

    ctrl.disable().unwrap();
}

#[tokio::test]
async fn test_source_hash_is_deterministic() {
    let (first, _) = controller(&["A", "B", "C"], BondingConfig::default());
    let (second, _) = controller(&["A", "B", "C"], BondingConfig::default());
    first.enable(&ids(&["A", "B", "C"]), "source_hash").unwrap();
    second.enable(&ids(&["C", "B", "A"]), "source_hash").unwrap();

    for n in 0..50 {
        let f = flow(n);
        let chosen = routed(&first, &f);
        assert_eq!(routed(&first, &f), chosen, "repeat route moved flow {n}");
        assert_eq!(routed(&second, &f), chosen, "controllers disagree on flow {n}");
    }

    // Same source, different ports and destinations: same interface
    let a = routed(&first, &flow_from("10.50.0.7:1111"));
    let b = routed(
        &first,
        &FlowDescriptor::udp("10.50.0.7:2222".parse().unwrap(), "8.8.8.8:53".parse().unwrap()),
    );
    assert_eq!(a, b);

    first.disable().unwrap();
    second.disable().unwrap();
}

#[tokio::test]
async fn test_hash_policies_spread_sources() {
    let (ctrl, _) = controller(&["A", "B"], BondingConfig::default());
    ctrl.enable(&ids(&["A", "B"]), "source_hash").unwrap();

    let on_a = (1..=100)
        .filter(|n| routed(&ctrl, &flow_from(&format!("10.0.0.{n}:5000"))) == "A")
        .count();
    // Consecutive host addresses alternate parity
    assert_eq!(on_a, 50);

    ctrl.disable().unwrap();
}

// ============================================================================
// Failover
// ============================================================================

#[tokio::test]
async fn test_sticky_flow_moves_off_failed_link() {
    let (ctrl, probe) = controller(&["A", "B", "C"], BondingConfig::default());
    ctrl.enable(&ids(&["A", "B", "C"]), "dest_hash").unwrap();

    let f = flow(7);
    let original = routed(&ctrl, &f);
    probe.down.write().push(original.clone());
    ctrl.probe_now().await.unwrap();

    // Two links left: still enabled, flow evicted from the failed link
    assert_eq!(ctrl.state(), BondState::Enabled);
    assert!(ctrl.router().assignment(&f.key).is_none());
    let moved = routed(&ctrl, &f);
    assert_ne!(moved, original);

    // Once placed, it stays put even after the original link recovers
    probe.down.write().clear();
    ctrl.probe_now().await.unwrap();
    assert_eq!(routed(&ctrl, &f), moved);
    assert_eq!(ctrl.router().assignment(&f.key).unwrap().hits, 2);

    ctrl.disable().unwrap();
}

#[tokio::test]
async fn test_passthrough_when_degraded() {
    let config = BondingConfig {
        allow_passthrough: true,
        ..Default::default()
    };
    let (ctrl, probe) = controller(&["A", "B"], config);
    ctrl.enable(&ids(&["A", "B"]), "round_robin").unwrap();

    probe.down.write().push("A".into());
    ctrl.probe_now().await.unwrap();
    assert_eq!(ctrl.state(), BondState::Degraded);

    for n in 0..4 {
        assert_eq!(routed(&ctrl, &flow(n)), "B");
    }

    // Revoking the authorization makes routing fail again
    ctrl.authorize_passthrough(false);
    assert!(matches!(
        ctrl.route(&flow(10)),
        Err(Error::BondDegraded { healthy: 1, required: 2 })
    ));

    // Nothing healthy at all
    ctrl.authorize_passthrough(true);
    probe.down.write().push("B".into());
    ctrl.probe_now().await.unwrap();
    assert!(matches!(ctrl.route(&flow(11)), Err(Error::Policy(_))));

    ctrl.disable().unwrap();
}

#[tokio::test]
async fn test_preview_does_not_commit() {
    let (ctrl, _) = controller(&["A", "B"], BondingConfig::default());
    assert!(matches!(ctrl.route_preview(&flow(1)), Err(Error::NotEnabled)));

    ctrl.enable(&ids(&["A", "B"]), "round_robin").unwrap();
    assert_eq!(ctrl.route_preview(&flow(1)).unwrap().id.as_str(), "A");
    assert_eq!(ctrl.route_preview(&flow(2)).unwrap().id.as_str(), "A");
    assert_eq!(ctrl.status().assignment_count, 0);

    assert_eq!(routed(&ctrl, &flow(1)), "A");
    assert_eq!(ctrl.route_preview(&flow(2)).unwrap().id.as_str(), "B");

    ctrl.disable().unwrap();
}

#[tokio::test]
async fn test_opaque_keys_and_throughput() {
    let (ctrl, _) = controller(&["A", "B"], BondingConfig::default());
    ctrl.enable(&ids(&["A", "B"]), "least_conn").unwrap();

    let request = flow(1).with_key(0xfeed);
    let iface = ctrl.route(&request).unwrap();
    assert_eq!(ctrl.router().assignment(&FlowKey::Opaque(0xfeed)).unwrap().interface, iface.id);

    ctrl.record_throughput(&iface.id, 1000.0).unwrap();
    ctrl.record_throughput(&iface.id, 2000.0).unwrap();
    let rate = ctrl.registry().get(&iface.id).unwrap().load.bytes_per_sec;
    assert!((rate - 1200.0).abs() < 1e-6);
    assert!(matches!(
        ctrl.record_throughput(&"Z".into(), 1.0),
        Err(Error::UnknownInterface(_))
    ));

    ctrl.disable().unwrap();
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_routing_keeps_counters_consistent() {
    let (ctrl, _) = controller(&["A", "B", "C"], BondingConfig::default());
    ctrl.enable(&ids(&["A", "B", "C"]), "least_conn").unwrap();

    let mut tasks = Vec::new();
    for worker in 0..8u16 {
        let ctrl = Arc::clone(&ctrl);
        tasks.push(tokio::spawn(async move {
            for n in 0..200u16 {
                let f = flow(worker * 200 + n);
                if ctrl.route(&f).is_ok() && n % 3 == 0 {
                    ctrl.release(&f);
                }
                if n % 50 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }

    // Flap one link while routing runs
    let registry = Arc::clone(ctrl.registry());
    let flapper = tokio::spawn(async move {
        for i in 0..20 {
            let health = if i % 2 == 0 {
                HealthState::Degraded
            } else {
                HealthState::Healthy
            };
            registry.set_health(&"C".into(), health, None);
            tokio::task::yield_now().await;
        }
    });

    for task in tasks {
        task.await.unwrap();
    }
    flapper.await.unwrap();

    let total: u64 = ctrl.list_interfaces().iter().map(|i| i.load.active_flows).sum();
    assert_eq!(total as usize, ctrl.status().assignment_count);

    ctrl.disable().unwrap();
    let total: u64 = ctrl.list_interfaces().iter().map(|i| i.load.active_flows).sum();
    assert_eq!(total, 0);
}
