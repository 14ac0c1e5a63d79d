//! Fixtures and common utilities for reconciler contract tests
//!
//! Every contract test runs against the in-memory provider with a paused
//! tokio clock, so provisioning waits and retry back-off complete instantly
//! and deterministically.

#![allow(dead_code)]

use std::net::IpAddr;
use std::sync::Arc;

use lbsync_core::config::{EngineConfig, ReconcilerConfig};
use lbsync_core::model::{Node, Protocol, ServiceDescription, ServicePortSpec};
use lbsync_core::traits::{LoadBalancer, Pool};
use lbsync_core::{MemoryProvider, ReconcileEvent, Reconciler};
use tokio::sync::mpsc;

pub const CLUSTER: &str = "test-cluster";
pub const SUBNET: &str = "subnet-1";
pub const FLOATING_NETWORK: &str = "public-net";
pub const NODE_ADDRESS: [u8; 4] = [10, 250, 240, 1];

/// The fixture service: TCP 80 and UDP 53, externally reachable
pub fn fixture_service() -> ServiceDescription {
    ServiceDescription::new(
        "default",
        "echo",
        vec![
            ServicePortSpec::new("http", Protocol::Tcp, 80, 8080, 31111),
            ServicePortSpec::new("dns", Protocol::Udp, 53, 9053, 32053),
        ],
    )
}

/// The fixture service with only its TCP port
pub fn tcp_only_service() -> ServiceDescription {
    let mut service = fixture_service();
    service.ports.retain(|p| p.protocol == Protocol::Tcp);
    service
}

/// One ready node at 10.250.240.1
pub fn fixture_nodes() -> Vec<Node> {
    vec![Node::ready("node-1", IpAddr::from(NODE_ADDRESS))]
}

/// A ready node named `name` at `address`
pub fn node(name: &str, address: &str) -> Node {
    Node::ready(name, address.parse().expect("valid address"))
}

/// Engine settings sized for the paused test clock
pub fn test_engine() -> EngineConfig {
    EngineConfig {
        deadline_secs: 60,
        poll_initial_ms: 100,
        poll_max_ms: 1_000,
        poll_factor: 1.5,
        max_retries: 3,
        retry_initial_delay_ms: 100,
        retry_max_delay_ms: 1_000,
        event_channel_capacity: 1_024,
    }
}

/// Reconciler configuration used by the contract tests
pub fn test_config() -> ReconcilerConfig {
    let mut config = ReconcilerConfig::new(SUBNET).with_floating_network(FLOATING_NETWORK);
    config.cluster_name = CLUSTER.to_string();
    config.engine = test_engine();
    config
}

/// A reconciler over `provider` with [`test_config`]
pub fn reconciler(provider: &MemoryProvider) -> (Reconciler, mpsc::Receiver<ReconcileEvent>) {
    reconciler_with(provider, test_config())
}

/// A reconciler over `provider` with a custom configuration
pub fn reconciler_with(
    provider: &MemoryProvider,
    config: ReconcilerConfig,
) -> (Reconciler, mpsc::Receiver<ReconcileEvent>) {
    Reconciler::new(
        Arc::new(provider.clone()),
        Arc::new(provider.clone()),
        config,
    )
    .expect("reconciler construction succeeds")
}

/// Everything emitted so far
pub fn drain_events(rx: &mut mpsc::Receiver<ReconcileEvent>) -> Vec<ReconcileEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// The single load balancer named `name`
pub fn lb_named(provider: &MemoryProvider, name: &str) -> LoadBalancer {
    let mut matches: Vec<_> = provider
        .load_balancers()
        .into_iter()
        .filter(|lb| lb.name == name)
        .collect();
    assert_eq!(matches.len(), 1, "expected exactly one load balancer named {}", name);
    matches.remove(0)
}

/// `(protocol, port)` of every listener of `lb_id`, sorted
pub fn listener_keys(provider: &MemoryProvider, lb_id: &str) -> Vec<(Protocol, u16)> {
    let mut keys: Vec<_> = provider
        .listeners_of(lb_id)
        .into_iter()
        .map(|l| (l.protocol, l.port))
        .collect();
    keys.sort();
    keys
}

/// The pool behind the listener on `port`
pub fn pool_for_port(provider: &MemoryProvider, lb_id: &str, port: u16) -> Pool {
    let listener = provider
        .listeners_of(lb_id)
        .into_iter()
        .find(|l| l.port == port)
        .expect("listener exists");
    provider
        .pools_of(lb_id)
        .into_iter()
        .find(|p| p.listener_id.as_deref() == Some(listener.id.as_str()))
        .expect("pool exists")
}

/// `(address, port)` of every member of `pool_id`, sorted
pub fn member_endpoints(provider: &MemoryProvider, pool_id: &str) -> Vec<(IpAddr, u16)> {
    let mut endpoints: Vec<_> = provider
        .members_of(pool_id)
        .into_iter()
        .map(|m| (m.address, m.port))
        .collect();
    endpoints.sort();
    endpoints
}

/// Name the fixture service's load balancer gets
pub fn fixture_lb_name() -> String {
    lbsync_core::naming::load_balancer_name(CLUSTER, "default", "echo")
}
