//! Stable resource naming
//!
//! A service's resources are rediscovered on every reconciliation purely by
//! name, so names must be a deterministic function of the service identity.
//! Child resources embed the listener key rather than a list position so that
//! removing one port never renames the others.

use crate::model::Protocol;

/// Provider limit on resource name length
pub const MAX_NAME_LEN: usize = 255;

/// Name of the load balancer owned by `namespace/name` in `cluster`
pub fn load_balancer_name(cluster: &str, namespace: &str, name: &str) -> String {
    truncate(format!("kube_service_{}_{}_{}", cluster, namespace, name))
}

/// Description written on the load balancer, used to spot stale adoptions
pub fn load_balancer_description(cluster: &str, namespace: &str, name: &str) -> String {
    format!(
        "Kubernetes external service {}/{} from cluster {}",
        namespace, name, cluster
    )
}

/// Name of the listener for `protocol`/`port` under `lb_name`
pub fn listener_name(protocol: Protocol, port: u16, lb_name: &str) -> String {
    child_name("listener", protocol, port, lb_name)
}

/// Name of the pool behind the listener for `protocol`/`port`
pub fn pool_name(protocol: Protocol, port: u16, lb_name: &str) -> String {
    child_name("pool", protocol, port, lb_name)
}

/// Name of the health monitor of the pool for `protocol`/`port`
pub fn monitor_name(protocol: Protocol, port: u16, lb_name: &str) -> String {
    child_name("monitor", protocol, port, lb_name)
}

fn child_name(prefix: &str, protocol: Protocol, port: u16, lb_name: &str) -> String {
    truncate(format!(
        "{}_{}_{}_{}",
        prefix,
        protocol.as_str().to_ascii_lowercase(),
        port,
        lb_name
    ))
}

fn truncate(mut name: String) -> String {
    if name.len() > MAX_NAME_LEN {
        let mut end = MAX_NAME_LEN;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name.truncate(end);
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_balancer_name_is_deterministic() {
        let a = load_balancer_name("testing", "test-namespace", "test-loadbalancer");
        let b = load_balancer_name("testing", "test-namespace", "test-loadbalancer");
        assert_eq!(a, b);
        assert_eq!(a, "kube_service_testing_test-namespace_test-loadbalancer");
    }

    #[test]
    fn different_services_get_different_names() {
        assert_ne!(
            load_balancer_name("c", "ns", "a"),
            load_balancer_name("c", "ns", "b")
        );
        assert_ne!(
            load_balancer_name("c", "ns1", "a"),
            load_balancer_name("c", "ns2", "a")
        );
    }

    #[test]
    fn child_names_embed_protocol_and_port() {
        assert_eq!(listener_name(Protocol::Udp, 53, "lb"), "listener_udp_53_lb");
        assert_eq!(pool_name(Protocol::Tcp, 80, "lb"), "pool_tcp_80_lb");
        assert_eq!(monitor_name(Protocol::Tcp, 80, "lb"), "monitor_tcp_80_lb");
    }

    #[test]
    fn long_names_are_truncated() {
        let long = "x".repeat(400);
        assert_eq!(load_balancer_name("c", "ns", &long).len(), MAX_NAME_LEN);
        assert_eq!(listener_name(Protocol::Tcp, 80, &long).len(), MAX_NAME_LEN);
    }
}
