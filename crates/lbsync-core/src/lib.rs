// # lbsync-core
//
// Core library for reconciling provider-managed load balancers with the
// services that need them.
//
// ## Architecture Overview
//
// Given a service description and the cluster's nodes, the library converges
// an asynchronous cloud load-balancing API onto the matching resource graph
// and reports the reachable address:
// - **desired**: builds the canonical graph (listeners, pools, monitors, members)
// - **locator**: rediscovers what the provider currently holds, by stable name
// - **engine**: plans the difference and applies it in dependency order
// - **waiter**: polls provisioning status until ACTIVE, ERROR or the deadline
// - **address**: picks the floating or virtual address to report
// - **LoadBalancerClient / NetworkClient**: the provider seams
// - **ProviderRegistry**: plugin-based registry of provider backends
//
// ## Design Principles
//
// 1. **Stateless**: the provider is the source of truth; nothing is cached
// 2. **Idempotent**: a converged load balancer causes no mutating calls
// 3. **Plugin-Based**: providers are registered dynamically
// 4. **Library-First**: the daemon is a thin shell over this crate

pub mod address;
pub mod config;
pub mod desired;
pub mod engine;
pub mod error;
pub mod locator;
pub mod locks;
pub mod model;
pub mod naming;
pub mod provider;
pub mod registry;
pub mod traits;
pub mod waiter;

// Re-export core types for convenience
pub use config::{EngineConfig, MonitorConfig, ProviderConfig, ReconcilerConfig};
pub use engine::{ReconcileEvent, Reconciler};
pub use error::{Error, Result};
pub use locks::LockRegistry;
pub use model::{LoadBalancerStatus, Node, Protocol, ServiceDescription, ServicePortSpec, SessionAffinity};
pub use provider::MemoryProvider;
pub use registry::ProviderRegistry;
pub use traits::{LoadBalancerClient, NetworkClient, ProviderClients, ProviderFactory};
