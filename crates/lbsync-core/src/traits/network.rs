// # Network Client Trait
//
// Defines the interface to the provider's network API, used for floating
// (externally routable) addresses.
//
// ## Implementations
//
// - Neutron v2.0: `lbsync-provider-octavia` crate
// - In-memory simulation: `lbsync_core::provider::MemoryProvider`
//
// Floating IP association is synchronous on the provider side: once
// `create_floating_ip` returns, the address is routed to the port.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Floating IP as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloatingIp {
    /// Provider-assigned ID
    pub id: String,
    /// Externally routable address
    pub floating_ip_address: IpAddr,
    /// Port the address is associated with
    pub port_id: Option<String>,
    /// Network the address was allocated from
    pub floating_network_id: String,
}

/// Trait for network API clients
///
/// Same contract as [`crate::traits::LoadBalancerClient`]: thread-safe,
/// single-shot, classified errors, no retries.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    /// Floating IPs currently associated with `port_id`
    async fn floating_ips_for_port(&self, port_id: &str) -> Result<Vec<FloatingIp>, crate::Error>;

    /// Allocate a floating IP from `floating_network_id` and associate it with `port_id`
    async fn create_floating_ip(
        &self,
        floating_network_id: &str,
        port_id: &str,
    ) -> Result<FloatingIp, crate::Error>;

    /// Provider name (for logging/debugging)
    fn provider_name(&self) -> &'static str;
}
