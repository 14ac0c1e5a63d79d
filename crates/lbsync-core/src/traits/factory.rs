// # Provider Factory Trait
//
// A provider backend supplies both clients the engine needs. Factories are
// registered by type name in the `ProviderRegistry` and build the client
// pair from configuration.

use std::sync::Arc;

use super::{LoadBalancerClient, NetworkClient};

/// The client pair one provider backend supplies
#[derive(Clone)]
pub struct ProviderClients {
    /// Load-balancing API
    pub lb: Arc<dyn LoadBalancerClient>,
    /// Network API (floating IPs)
    pub network: Arc<dyn NetworkClient>,
}

impl ProviderClients {
    /// Pair two clients
    pub fn new(lb: Arc<dyn LoadBalancerClient>, network: Arc<dyn NetworkClient>) -> Self {
        Self { lb, network }
    }
}

impl std::fmt::Debug for ProviderClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderClients")
            .field("lb", &self.lb.provider_name())
            .field("network", &self.network.provider_name())
            .finish()
    }
}

/// Helper trait for constructing provider clients from configuration
pub trait ProviderFactory: Send + Sync {
    /// Create the client pair from configuration
    ///
    /// # Parameters
    ///
    /// - `config`: Provider configuration; factories reject variants they do
    ///   not handle with a configuration error
    fn create(
        &self,
        config: &crate::config::ProviderConfig,
    ) -> Result<ProviderClients, crate::Error>;
}
