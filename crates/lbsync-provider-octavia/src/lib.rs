// # OpenStack Octavia / Neutron Provider
//
// This crate provides the HTTP-backed clients the lbsync reconciler drives
// against an OpenStack cloud:
//
// - `OctaviaClient` implements `LoadBalancerClient` (Octavia v2, `/v2/lbaas`)
// - `NeutronClient` implements `NetworkClient` (Neutron v2.0, floating IPs)
//
// ## Contract
//
// - One HTTP request per trait call
// - Every failure is classified (transient, validation, conflict, not found)
//   and propagated; retry, backoff and status polling are owned by the engine
// - No background tasks, no caching between calls
//
// ## Security Requirements
//
// - The Keystone token NEVER appears in logs, errors or Debug output
// - Clients fail fast on an empty token or endpoint
//
// ## API Reference
//
// - Octavia v2: https://docs.openstack.org/api-ref/load-balancer/v2/
// - Neutron floating IPs: https://docs.openstack.org/api-ref/network/v2/#floating-ips-floatingips

mod http;
mod neutron;
mod octavia;

use lbsync_core::config::ProviderConfig;
use lbsync_core::traits::{ProviderClients, ProviderFactory};
use lbsync_core::{Error, Result};
use std::sync::Arc;

pub use neutron::NeutronClient;
pub use octavia::OctaviaClient;

/// Factory for the Octavia/Neutron client pair
pub struct OctaviaFactory;

impl ProviderFactory for OctaviaFactory {
    fn create(&self, config: &ProviderConfig) -> Result<ProviderClients> {
        match config {
            ProviderConfig::Octavia {
                lb_endpoint,
                network_endpoint,
                auth_token,
            } => {
                if auth_token.is_empty() {
                    return Err(Error::config("Octavia auth token is required"));
                }

                let lb = OctaviaClient::new(lb_endpoint.clone(), auth_token.clone())?;
                let network = NeutronClient::new(network_endpoint.clone(), auth_token.clone())?;

                tracing::debug!(
                    lb_endpoint = %lb.endpoint(),
                    network_endpoint = %network.endpoint(),
                    "Created Octavia provider clients"
                );

                Ok(ProviderClients::new(Arc::new(lb), Arc::new(network)))
            }
            _ => Err(Error::config("Invalid config for Octavia provider")),
        }
    }
}

/// Register the Octavia provider with a registry
///
/// # Example
///
/// ```rust
/// use lbsync_core::ProviderRegistry;
///
/// let registry = ProviderRegistry::with_builtin();
/// lbsync_provider_octavia::register(&registry);
/// assert!(registry.has("octavia"));
/// ```
pub fn register(registry: &lbsync_core::ProviderRegistry) {
    registry.register("octavia", Box::new(OctaviaFactory));
}
