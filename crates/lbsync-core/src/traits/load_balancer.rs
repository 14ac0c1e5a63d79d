// # Load Balancer Client Trait
//
// Defines the interface to the provider's load-balancing API.
//
// ## Implementations
//
// - Octavia v2: `lbsync-provider-octavia` crate
// - In-memory simulation: `lbsync_core::provider::MemoryProvider`
//
// ## Asynchronous provisioning
//
// Every mutating call returns as soon as the provider has *accepted* the
// request. The affected resource (and usually its parent load balancer) then
// sits in a `PENDING_*` provisioning status until the provider has applied it.
// Callers observe completion through `provisioning_status()`; the engine's
// waiter owns that polling, implementations never block on it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

use crate::model::Protocol;

/// Provisioning status of a provider resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvisioningStatus {
    /// Applied and usable
    Active,
    /// Accepted, being created
    PendingCreate,
    /// Accepted, being updated
    PendingUpdate,
    /// Accepted, being deleted
    PendingDelete,
    /// Provisioning failed
    Error,
}

impl ProvisioningStatus {
    /// ACTIVE and ERROR are terminal; no transition happens without a new call
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Active | Self::Error)
    }

    /// Any of the PENDING_* states
    pub fn is_pending(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for ProvisioningStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "ACTIVE",
            Self::PendingCreate => "PENDING_CREATE",
            Self::PendingUpdate => "PENDING_UPDATE",
            Self::PendingDelete => "PENDING_DELETE",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Balancing algorithm of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LbMethod {
    /// Round robin
    #[default]
    RoundRobin,
    /// Fewest active connections
    LeastConnections,
    /// Hash of the source address
    SourceIp,
}

/// Session persistence of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionPersistence {
    /// Stick clients to members by source address
    SourceIp,
}

/// Health monitor probe type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorKind {
    /// TCP connect
    #[serde(rename = "TCP")]
    Tcp,
    /// UDP connect probe
    #[serde(rename = "UDP-CONNECT")]
    UdpConnect,
}

impl MonitorKind {
    /// Probe type appropriate for a listener protocol
    pub fn for_protocol(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Udp => MonitorKind::UdpConnect,
            _ => MonitorKind::Tcp,
        }
    }
}

/// Kind of provider resource, used to address status reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Load balancer
    LoadBalancer,
    /// Listener
    Listener,
    /// Pool
    Pool,
    /// Pool member (status is read through its pool)
    Member,
    /// Health monitor
    HealthMonitor,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::LoadBalancer => "load balancer",
            Self::Listener => "listener",
            Self::Pool => "pool",
            Self::Member => "member",
            Self::HealthMonitor => "health monitor",
        };
        f.write_str(s)
    }
}

/// Reference to a resource whose provisioning status can be read
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    /// Resource kind
    pub kind: ResourceKind,
    /// Provider-assigned ID
    pub id: String,
    /// Parent pool ID (members only)
    pub pool_id: Option<String>,
}

impl ResourceRef {
    /// Reference a load balancer
    pub fn load_balancer(id: impl Into<String>) -> Self {
        Self::new(ResourceKind::LoadBalancer, id)
    }

    /// Reference a listener
    pub fn listener(id: impl Into<String>) -> Self {
        Self::new(ResourceKind::Listener, id)
    }

    /// Reference a pool
    pub fn pool(id: impl Into<String>) -> Self {
        Self::new(ResourceKind::Pool, id)
    }

    /// Reference a health monitor
    pub fn health_monitor(id: impl Into<String>) -> Self {
        Self::new(ResourceKind::HealthMonitor, id)
    }

    /// Reference a member of a pool
    pub fn member(pool_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Member,
            id: id.into(),
            pool_id: Some(pool_id.into()),
        }
    }

    fn new(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            pool_id: None,
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}

/// Load balancer as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancer {
    /// Provider-assigned ID
    pub id: String,
    /// Name (the stable identity)
    pub name: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
    /// Provisioning status
    pub provisioning_status: ProvisioningStatus,
    /// Virtual (internal) address
    pub vip_address: Option<IpAddr>,
    /// Port holding the virtual address; floating IPs attach here
    pub vip_port_id: Option<String>,
}

/// Listener as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listener {
    /// Provider-assigned ID
    pub id: String,
    /// Name
    pub name: String,
    /// Transport protocol
    pub protocol: Protocol,
    /// Listening port
    pub port: u16,
    /// Provisioning status
    pub provisioning_status: ProvisioningStatus,
    /// Application protocol terminated by the listener (`HTTP`,
    /// `TERMINATED_HTTPS`, ...), if any
    ///
    /// lbsync only creates plain transport listeners, so a listener with an
    /// application protocol never matches a desired one and is pruned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_protocol: Option<String>,
}

impl Listener {
    /// Whether lbsync could have created this listener
    pub fn is_managed(&self) -> bool {
        self.application_protocol.is_none()
    }
}

/// Pool as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    /// Provider-assigned ID
    pub id: String,
    /// Name
    pub name: String,
    /// Listener this pool is the default pool of
    pub listener_id: Option<String>,
    /// Balancing algorithm
    pub lb_method: LbMethod,
    /// Session persistence
    pub session_persistence: Option<SessionPersistence>,
    /// Attached health monitor
    pub healthmonitor_id: Option<String>,
    /// Provisioning status
    pub provisioning_status: ProvisioningStatus,
}

/// Pool member as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Provider-assigned ID
    pub id: String,
    /// Name (node name)
    pub name: String,
    /// Backend address
    pub address: IpAddr,
    /// Backend port
    pub port: u16,
    /// Relative weight
    pub weight: u16,
    /// Provisioning status
    pub provisioning_status: ProvisioningStatus,
}

/// Health monitor as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthMonitor {
    /// Provider-assigned ID
    pub id: String,
    /// Name
    pub name: String,
    /// Pool being monitored
    pub pool_id: String,
    /// Probe type
    pub kind: MonitorKind,
    /// Provisioning status
    pub provisioning_status: ProvisioningStatus,
}

/// One page of a marker-paginated listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    /// Items on this page
    pub items: Vec<T>,
    /// Marker to request the next page with; `None` on the last page
    pub next_marker: Option<String>,
}

impl<T> Page<T> {
    /// A single, final page
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_marker: None,
        }
    }
}

/// Request to create a load balancer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateLoadBalancer {
    /// Name (the stable identity)
    pub name: String,
    /// Description
    pub description: String,
    /// Subnet to allocate the virtual address from
    pub vip_subnet_id: String,
    /// Network of the virtual address, if pinned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vip_network_id: Option<String>,
}

/// Request to create a listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateListener {
    /// Name
    pub name: String,
    /// Parent load balancer
    pub loadbalancer_id: String,
    /// Protocol
    pub protocol: Protocol,
    /// Listening port
    pub protocol_port: u16,
}

/// Request to create a pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatePool {
    /// Name
    pub name: String,
    /// Listener the pool becomes the default pool of
    pub listener_id: String,
    /// Protocol
    pub protocol: Protocol,
    /// Balancing algorithm
    pub lb_algorithm: LbMethod,
    /// Session persistence
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_persistence: Option<SessionPersistence>,
}

/// Request to add a member to a pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateMember {
    /// Name (node name)
    pub name: String,
    /// Backend address
    pub address: IpAddr,
    /// Backend port
    pub protocol_port: u16,
    /// Relative weight
    pub weight: u16,
    /// Subnet the backend address lives on
    pub subnet_id: String,
}

/// Request to create a health monitor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateHealthMonitor {
    /// Name
    pub name: String,
    /// Pool to monitor
    pub pool_id: String,
    /// Probe type
    #[serde(rename = "type")]
    pub kind: MonitorKind,
    /// Seconds between probes
    pub delay: u32,
    /// Seconds before a probe times out
    pub timeout: u32,
    /// Failed probes before a member is marked down
    pub max_retries: u32,
}

/// Trait for load-balancer API clients
///
/// # Thread Safety
///
/// Implementations must be thread-safe and usable across async tasks. They
/// are shared read-mostly handles; any mutable state they keep must not be
/// something the engine relies on between calls.
///
/// # Contract
///
/// - Single-shot: one provider request per call. Retry, backoff and status
///   polling are owned by the engine.
/// - Errors are classified: rate limiting, timeouts and 5xx responses map to
///   [`crate::Error::TransientApi`]; refused requests (quota, invalid input)
///   map to [`crate::Error::Validation`]; concurrent-modification rejections
///   map to [`crate::Error::ResourceConflict`]; missing resources to
///   [`crate::Error::NotFound`].
/// - Listing calls are marker paginated; pass the previous page's
///   `next_marker` to continue.
#[async_trait]
pub trait LoadBalancerClient: Send + Sync {
    /// All load balancers whose name equals `name`
    async fn find_load_balancers(&self, name: &str) -> Result<Vec<LoadBalancer>, crate::Error>;

    /// Fetch a load balancer by ID
    async fn get_load_balancer(&self, id: &str) -> Result<LoadBalancer, crate::Error>;

    /// Create a load balancer
    async fn create_load_balancer(
        &self,
        request: &CreateLoadBalancer,
    ) -> Result<LoadBalancer, crate::Error>;

    /// List listeners of a load balancer
    async fn list_listeners(
        &self,
        loadbalancer_id: &str,
        marker: Option<&str>,
    ) -> Result<Page<Listener>, crate::Error>;

    /// Create a listener
    async fn create_listener(&self, request: &CreateListener) -> Result<Listener, crate::Error>;

    /// Delete a listener (its pool must already be gone)
    async fn delete_listener(&self, id: &str) -> Result<(), crate::Error>;

    /// List pools of a load balancer
    async fn list_pools(
        &self,
        loadbalancer_id: &str,
        marker: Option<&str>,
    ) -> Result<Page<Pool>, crate::Error>;

    /// Create a pool
    async fn create_pool(&self, request: &CreatePool) -> Result<Pool, crate::Error>;

    /// Delete a pool (its members and monitor must already be gone)
    async fn delete_pool(&self, id: &str) -> Result<(), crate::Error>;

    /// List members of a pool
    async fn list_members(
        &self,
        pool_id: &str,
        marker: Option<&str>,
    ) -> Result<Page<Member>, crate::Error>;

    /// Add a member to a pool
    async fn create_member(
        &self,
        pool_id: &str,
        request: &CreateMember,
    ) -> Result<Member, crate::Error>;

    /// Remove a member from a pool
    async fn delete_member(&self, pool_id: &str, member_id: &str) -> Result<(), crate::Error>;

    /// Create a health monitor
    async fn create_health_monitor(
        &self,
        request: &CreateHealthMonitor,
    ) -> Result<HealthMonitor, crate::Error>;

    /// Delete a health monitor
    async fn delete_health_monitor(&self, id: &str) -> Result<(), crate::Error>;

    /// Read the current provisioning status of a resource
    async fn provisioning_status(
        &self,
        resource: &ResourceRef,
    ) -> Result<ProvisioningStatus, crate::Error>;

    /// Provider name (for logging/debugging)
    fn provider_name(&self) -> &'static str;
}
