//! Desired-state builder
//!
//! Turns a service description and a node set into the canonical resource
//! graph the provider should end up with. Pure: no provider calls, no clock.

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;

use tracing::warn;

use crate::config::ReconcilerConfig;
use crate::error::{Error, Result};
use crate::model::{Node, Protocol, ServiceDescription, SessionAffinity};
use crate::naming;
use crate::traits::{LbMethod, MonitorKind, SessionPersistence};

/// Default member weight
pub const DEFAULT_MEMBER_WEIGHT: u16 = 1;

/// Identity of a listener: what it listens on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerKey {
    /// Protocol
    pub protocol: Protocol,
    /// Exposed port
    pub port: u16,
}

impl ListenerKey {
    /// Create a key
    pub fn new(protocol: Protocol, port: u16) -> Self {
        Self { protocol, port }
    }
}

impl fmt::Display for ListenerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.protocol, self.port)
    }
}

/// A member the pool should contain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredMember {
    /// Node name
    pub name: String,
    /// Node internal address
    pub address: IpAddr,
    /// Node port of the service
    pub port: u16,
    /// Relative weight
    pub weight: u16,
}

/// A health monitor the pool should carry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredMonitor {
    /// Name
    pub name: String,
    /// Probe type
    pub kind: MonitorKind,
    /// Seconds between probes
    pub delay: u32,
    /// Probe timeout in seconds
    pub timeout: u32,
    /// Failures before marking down
    pub max_retries: u32,
}

/// The pool behind a listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredPool {
    /// Name
    pub name: String,
    /// Balancing algorithm
    pub lb_method: LbMethod,
    /// Session persistence
    pub session_persistence: Option<SessionPersistence>,
    /// Members, ordered by node input order
    pub members: Vec<DesiredMember>,
    /// Health monitor, if monitoring is enabled
    pub monitor: Option<DesiredMonitor>,
}

/// A listener with its pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredListener {
    /// What the listener listens on
    pub key: ListenerKey,
    /// Name
    pub name: String,
    /// Pool
    pub pool: DesiredPool,
}

/// Complete desired resource graph of one service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredState {
    /// Stable load balancer name
    pub lb_name: String,
    /// Load balancer description
    pub lb_description: String,
    /// Listeners, sorted by key
    pub listeners: Vec<DesiredListener>,
    /// Whether a floating address is requested
    pub external: bool,
}

impl DesiredState {
    /// Look up a desired listener by key
    pub fn listener(&self, key: &ListenerKey) -> Option<&DesiredListener> {
        self.listeners.iter().find(|l| &l.key == key)
    }

    /// Names of pools that will have no members
    pub fn empty_pools(&self) -> Vec<String> {
        self.listeners
            .iter()
            .filter(|l| l.pool.members.is_empty())
            .map(|l| l.pool.name.clone())
            .collect()
    }
}

/// Build the desired state of `service` over `nodes`
///
/// # Errors
///
/// [`Error::Validation`] when the service has no ports, uses a protocol other
/// than TCP/UDP, repeats a (protocol, port) pair, or asks for UDP on a
/// provider that cannot balance it.
pub fn build(
    service: &ServiceDescription,
    nodes: &[Node],
    config: &ReconcilerConfig,
) -> Result<DesiredState> {
    if service.namespace.is_empty() || service.name.is_empty() {
        return Err(Error::validation("service namespace and name are required"));
    }

    if service.ports.is_empty() {
        return Err(Error::validation(format!(
            "service {} has no ports",
            service.key()
        )));
    }

    let lb_name = naming::load_balancer_name(&config.cluster_name, &service.namespace, &service.name);
    let lb_description =
        naming::load_balancer_description(&config.cluster_name, &service.namespace, &service.name);

    let (lb_method, session_persistence) = match service.session_affinity {
        SessionAffinity::ClientIp => (LbMethod::SourceIp, Some(SessionPersistence::SourceIp)),
        SessionAffinity::None => (config.lb_method, None),
    };

    let backends = eligible_backends(nodes);

    let mut seen = HashSet::new();
    let mut listeners = Vec::with_capacity(service.ports.len());

    for port in &service.ports {
        match port.protocol {
            Protocol::Tcp => {}
            Protocol::Udp if config.use_octavia => {}
            Protocol::Udp => {
                return Err(Error::validation(format!(
                    "port {} uses UDP, which requires an Octavia provider",
                    port.name
                )));
            }
            other => {
                return Err(Error::validation(format!(
                    "port {} uses unsupported protocol {}",
                    port.name, other
                )));
            }
        }

        let key = ListenerKey::new(port.protocol, port.port);
        if !seen.insert(key) {
            return Err(Error::validation(format!(
                "service {} exposes {} more than once",
                service.key(),
                key
            )));
        }

        let members = backends
            .iter()
            .map(|(name, address)| DesiredMember {
                name: (*name).to_string(),
                address: *address,
                port: port.node_port,
                weight: DEFAULT_MEMBER_WEIGHT,
            })
            .collect();

        let monitor = config.monitor.enabled.then(|| DesiredMonitor {
            name: naming::monitor_name(key.protocol, key.port, &lb_name),
            kind: MonitorKind::for_protocol(key.protocol),
            delay: config.monitor.delay_secs,
            timeout: config.monitor.timeout_secs,
            max_retries: config.monitor.max_retries,
        });

        listeners.push(DesiredListener {
            key,
            name: naming::listener_name(key.protocol, key.port, &lb_name),
            pool: DesiredPool {
                name: naming::pool_name(key.protocol, key.port, &lb_name),
                lb_method,
                session_persistence,
                members,
                monitor,
            },
        });
    }

    listeners.sort_by_key(|l| l.key);

    let desired = DesiredState {
        lb_name,
        lb_description,
        listeners,
        external: service.external,
    };

    for pool in desired.empty_pools() {
        warn!(
            "Pool {} of service {} has no eligible members ({} node(s) offered)",
            pool,
            service.key(),
            nodes.len()
        );
    }

    Ok(desired)
}

/// Ready nodes with an address, deduplicated by address (first wins)
fn eligible_backends(nodes: &[Node]) -> Vec<(&str, IpAddr)> {
    let mut seen = HashSet::new();
    nodes
        .iter()
        .filter_map(|node| match node.internal_address {
            Some(address) if node.ready => Some((node.name.as_str(), address)),
            _ => None,
        })
        .filter(|(_, address)| seen.insert(*address))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ServicePortSpec;

    fn fixture_service() -> ServiceDescription {
        ServiceDescription::new(
            "test-namespace",
            "test-loadbalancer",
            vec![
                ServicePortSpec::new("port1", Protocol::Tcp, 80, 8080, 31111),
                ServicePortSpec::new("dns", Protocol::Udp, 53, 9053, 32053),
            ],
        )
    }

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn members_use_node_port_not_target_port() {
        let config = ReconcilerConfig::new("subnet");
        let nodes = vec![Node::ready("node-1", addr("10.250.240.1"))];

        let desired = build(&fixture_service(), &nodes, &config).unwrap();

        assert_eq!(desired.listeners.len(), 2);
        let tcp = desired.listener(&ListenerKey::new(Protocol::Tcp, 80)).unwrap();
        let udp = desired.listener(&ListenerKey::new(Protocol::Udp, 53)).unwrap();
        assert_eq!(tcp.pool.members[0].port, 31111);
        assert_eq!(udp.pool.members[0].port, 32053);
        assert_eq!(tcp.pool.members[0].address, addr("10.250.240.1"));
        assert_eq!(udp.pool.monitor.as_ref().unwrap().kind, MonitorKind::UdpConnect);
    }

    #[test]
    fn ineligible_nodes_are_filtered_out() {
        let config = ReconcilerConfig::new("subnet");
        let nodes = vec![
            Node::ready("ready", addr("10.0.0.1")),
            Node {
                name: "not-ready".to_string(),
                internal_address: Some(addr("10.0.0.2")),
                ready: false,
            },
            Node {
                name: "no-address".to_string(),
                internal_address: None,
                ready: true,
            },
            Node::ready("duplicate", addr("10.0.0.1")),
        ];

        let desired = build(&fixture_service(), &nodes, &config).unwrap();

        for listener in &desired.listeners {
            let names: Vec<_> = listener.pool.members.iter().map(|m| m.name.as_str()).collect();
            assert_eq!(names, vec!["ready"]);
        }
    }

    #[test]
    fn empty_member_set_is_not_an_error() {
        let config = ReconcilerConfig::new("subnet");
        let desired = build(&fixture_service(), &[], &config).unwrap();

        assert_eq!(desired.empty_pools().len(), 2);
    }

    #[test]
    fn empty_port_list_is_rejected() {
        let config = ReconcilerConfig::new("subnet");
        let service = ServiceDescription::new("ns", "svc", Vec::new());

        assert!(matches!(build(&service, &[], &config), Err(Error::Validation(_))));
    }

    #[test]
    fn unsupported_protocol_is_rejected() {
        let config = ReconcilerConfig::new("subnet");
        let service = ServiceDescription::new(
            "ns",
            "svc",
            vec![ServicePortSpec::new("sctp", Protocol::Sctp, 9000, 9000, 30900)],
        );

        assert!(matches!(build(&service, &[], &config), Err(Error::Validation(_))));
    }

    #[test]
    fn udp_requires_octavia() {
        let mut config = ReconcilerConfig::new("subnet");
        config.use_octavia = false;

        assert!(matches!(
            build(&fixture_service(), &[], &config),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn duplicate_listener_key_is_rejected() {
        let config = ReconcilerConfig::new("subnet");
        let service = ServiceDescription::new(
            "ns",
            "svc",
            vec![
                ServicePortSpec::new("a", Protocol::Tcp, 80, 8080, 31111),
                ServicePortSpec::new("b", Protocol::Tcp, 80, 8081, 31112),
            ],
        );

        assert!(matches!(build(&service, &[], &config), Err(Error::Validation(_))));
    }

    #[test]
    fn same_port_on_both_protocols_is_allowed() {
        let config = ReconcilerConfig::new("subnet");
        let service = ServiceDescription::new(
            "ns",
            "svc",
            vec![
                ServicePortSpec::new("dns-udp", Protocol::Udp, 53, 53, 30053),
                ServicePortSpec::new("dns-tcp", Protocol::Tcp, 53, 53, 30054),
            ],
        );

        let desired = build(&service, &[], &config).unwrap();
        assert_eq!(desired.listeners[0].key, ListenerKey::new(Protocol::Tcp, 53));
        assert_eq!(desired.listeners[1].key, ListenerKey::new(Protocol::Udp, 53));
    }

    #[test]
    fn client_ip_affinity_selects_source_ip() {
        let config = ReconcilerConfig::new("subnet");
        let service = fixture_service().with_session_affinity(SessionAffinity::ClientIp);

        let desired = build(&service, &[], &config).unwrap();
        for listener in &desired.listeners {
            assert_eq!(listener.pool.lb_method, LbMethod::SourceIp);
            assert_eq!(
                listener.pool.session_persistence,
                Some(SessionPersistence::SourceIp)
            );
        }
    }

    #[test]
    fn disabled_monitoring_produces_no_monitors() {
        let mut config = ReconcilerConfig::new("subnet");
        config.monitor.enabled = false;

        let desired = build(&fixture_service(), &[], &config).unwrap();
        assert!(desired.listeners.iter().all(|l| l.pool.monitor.is_none()));
    }
}
