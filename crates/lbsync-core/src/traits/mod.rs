//! Provider client traits
//!
//! This module defines the abstract interfaces a provider must implement.
//!
//! - [`LoadBalancerClient`]: load balancers, listeners, pools, members, monitors
//! - [`NetworkClient`]: floating (externally routable) addresses
//! - [`ProviderFactory`]: builds both clients from configuration

pub mod factory;
pub mod load_balancer;
pub mod network;

pub use factory::{ProviderClients, ProviderFactory};
pub use load_balancer::{
    CreateHealthMonitor, CreateListener, CreateLoadBalancer, CreateMember, CreatePool,
    HealthMonitor, LbMethod, Listener, LoadBalancer, LoadBalancerClient, Member, MonitorKind,
    Page, Pool, ProvisioningStatus, ResourceKind, ResourceRef, SessionPersistence,
};
pub use network::{FloatingIp, NetworkClient};
