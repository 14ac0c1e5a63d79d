//! Address resolution
//!
//! Picks the address reported as the service's external endpoint once the
//! load balancer has converged.

use crate::error::{Error, Result};
use crate::model::LoadBalancerStatus;
use crate::traits::{FloatingIp, LoadBalancer, ProvisioningStatus};

/// Build the status of a converged load balancer
///
/// The floating address comes first when one is associated, followed by the
/// virtual address. `empty_pools` is carried through so callers can tell a
/// degraded result apart.
///
/// # Errors
///
/// [`Error::AddressUnavailable`] when neither address is populated; for an
/// ACTIVE load balancer this is a provider consistency violation.
pub fn resolve(
    load_balancer: &LoadBalancer,
    floating_ip: Option<&FloatingIp>,
    empty_pools: Vec<String>,
) -> Result<LoadBalancerStatus> {
    let ingress: Vec<_> = floating_ip
        .map(|fip| fip.floating_ip_address)
        .into_iter()
        .chain(load_balancer.vip_address)
        .collect();

    if ingress.is_empty() {
        return Err(Error::address_unavailable(format!(
            "{} ({}, {})",
            load_balancer.name, load_balancer.id, load_balancer.provisioning_status
        )));
    }

    Ok(LoadBalancerStatus {
        ingress,
        empty_pools,
    })
}

/// Status of a load balancer that may still be provisioning
///
/// Like [`resolve`], except that a load balancer that is not ACTIVE yet is
/// allowed to have no address; it is reported with an empty ingress.
pub fn observe(
    load_balancer: &LoadBalancer,
    floating_ip: Option<&FloatingIp>,
    empty_pools: Vec<String>,
) -> Result<LoadBalancerStatus> {
    let unaddressed = floating_ip.is_none() && load_balancer.vip_address.is_none();
    if unaddressed && load_balancer.provisioning_status != ProvisioningStatus::Active {
        return Ok(LoadBalancerStatus {
            ingress: Vec::new(),
            empty_pools,
        });
    }
    resolve(load_balancer, floating_ip, empty_pools)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn lb(vip: Option<&str>) -> LoadBalancer {
        LoadBalancer {
            id: "lb-1".to_string(),
            name: "kube_service_c_ns_svc".to_string(),
            description: String::new(),
            provisioning_status: ProvisioningStatus::Active,
            vip_address: vip.map(|v| v.parse().unwrap()),
            vip_port_id: Some("port-1".to_string()),
        }
    }

    fn fip(addr: &str) -> FloatingIp {
        FloatingIp {
            id: "fip-1".to_string(),
            floating_ip_address: addr.parse().unwrap(),
            port_id: Some("port-1".to_string()),
            floating_network_id: "public".to_string(),
        }
    }

    #[test]
    fn floating_address_is_preferred() {
        let status = resolve(&lb(Some("10.0.0.5")), Some(&fip("172.24.4.10")), Vec::new()).unwrap();

        assert_eq!(status.external_address(), Some("172.24.4.10".parse::<IpAddr>().unwrap()));
        assert_eq!(status.ingress.len(), 2);
    }

    #[test]
    fn virtual_address_is_the_fallback() {
        let status = resolve(&lb(Some("10.0.0.5")), None, Vec::new()).unwrap();
        assert_eq!(status.external_address(), Some("10.0.0.5".parse::<IpAddr>().unwrap()));
    }

    #[test]
    fn floating_address_alone_is_enough() {
        let status = resolve(&lb(None), Some(&fip("172.24.4.10")), Vec::new()).unwrap();
        assert_eq!(status.ingress.len(), 1);
    }

    #[test]
    fn missing_addresses_are_a_consistency_violation() {
        let err = resolve(&lb(None), None, Vec::new()).unwrap_err();
        assert!(matches!(err, Error::AddressUnavailable(_)));
    }

    #[test]
    fn provisioning_load_balancer_may_lack_an_address() {
        let mut pending = lb(None);
        pending.provisioning_status = ProvisioningStatus::PendingCreate;

        let status = observe(&pending, None, Vec::new()).unwrap();
        assert!(status.ingress.is_empty());
        assert!(status.external_address().is_none());

        let err = observe(&lb(None), None, Vec::new()).unwrap_err();
        assert!(matches!(err, Error::AddressUnavailable(_)));
    }

    #[test]
    fn empty_pools_mark_the_status_degraded() {
        let status = resolve(&lb(Some("10.0.0.5")), None, vec!["pool_tcp_80_lb".to_string()]).unwrap();
        assert!(status.is_degraded());
    }
}
