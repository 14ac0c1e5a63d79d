// # Memory Provider
//
// In-process simulation of an asynchronous load-balancing provider.
//
// ## Purpose
//
// Stands in for Octavia/Neutron in dry runs and tests. It models the parts of
// the provider's behavior the engine depends on:
//
// - Every mutation puts the load balancer into `PENDING_UPDATE` (or
//   `PENDING_CREATE`) and the touched resource into `PENDING_*`. The pending
//   work settles after a configurable number of status reads.
// - While the load balancer is pending it is immutable: any further mutation
//   is rejected with a conflict.
// - Children require an ACTIVE parent; parents with children cannot be
//   deleted.
// - Listings are marker-paginated.
//
// ## Fault injection
//
// Transient failures for the next N calls of an operation, persistent
// validation rejections, resources that settle into ERROR, a frozen provider
// that never settles, and load balancers without a virtual address.
//
// ## Crash Behavior
//
// All state lives in memory and is lost with the process.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use crate::Error;
use crate::config::ProviderConfig;
use crate::model::Protocol;
use crate::traits::{
    CreateHealthMonitor, CreateListener, CreateLoadBalancer, CreateMember, CreatePool,
    FloatingIp, HealthMonitor, Listener, LoadBalancer, LoadBalancerClient, Member, NetworkClient,
    Page, Pool, ProviderClients, ProviderFactory, ProvisioningStatus, ResourceKind, ResourceRef,
};

/// Default number of status reads before pending work settles
pub const DEFAULT_SETTLE_POLLS: u32 = 2;

/// Default listing page size
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// In-memory load-balancing and network provider
///
/// Cloning yields another handle to the same simulated cloud, so a test can
/// keep one handle for inspection and give another to the reconciler.
///
/// # Example
///
/// ```rust,no_run
/// use lbsync_core::provider::MemoryProvider;
/// use lbsync_core::traits::LoadBalancerClient;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let provider = MemoryProvider::new().with_settle_polls(1);
///     provider.fail_transient("create_pool", 2);
///
///     let found = provider.find_load_balancers("kube_service_c_ns_web").await?;
///     assert!(found.is_empty());
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryProvider {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug)]
struct Inner {
    next_id: u64,
    settle_polls: u32,
    page_size: usize,
    frozen: bool,
    omit_vip: bool,

    load_balancers: BTreeMap<String, LoadBalancer>,
    listeners: BTreeMap<String, Owned<Listener>>,
    pools: BTreeMap<String, Owned<Pool>>,
    members: BTreeMap<String, OwnedMember>,
    monitors: BTreeMap<String, Owned<HealthMonitor>>,
    floating_ips: BTreeMap<String, FloatingIp>,

    /// Load balancer ID → status reads left until its pending work settles
    pending: HashMap<String, u32>,

    transient_failures: HashMap<String, u32>,
    lost_responses: HashMap<String, u32>,
    rejections: HashMap<String, String>,
    failing_names: HashSet<String>,
    calls: Vec<String>,
}

#[derive(Debug, Clone)]
struct Owned<T> {
    lb_id: String,
    resource: T,
}

#[derive(Debug, Clone)]
struct OwnedMember {
    lb_id: String,
    pool_id: String,
    member: Member,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            next_id: 1,
            settle_polls: DEFAULT_SETTLE_POLLS,
            page_size: DEFAULT_PAGE_SIZE,
            frozen: false,
            omit_vip: false,
            load_balancers: BTreeMap::new(),
            listeners: BTreeMap::new(),
            pools: BTreeMap::new(),
            members: BTreeMap::new(),
            monitors: BTreeMap::new(),
            floating_ips: BTreeMap::new(),
            pending: HashMap::new(),
            transient_failures: HashMap::new(),
            lost_responses: HashMap::new(),
            rejections: HashMap::new(),
            failing_names: HashSet::new(),
            calls: Vec::new(),
        }
    }
}

impl MemoryProvider {
    /// Create an empty provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Settle pending work after `polls` status reads (minimum 1)
    pub fn with_settle_polls(self, polls: u32) -> Self {
        self.lock().settle_polls = polls.max(1);
        self
    }

    /// Return listings in pages of `size` items (minimum 1)
    pub fn with_page_size(self, size: usize) -> Self {
        self.lock().page_size = size.max(1);
        self
    }

    /// Fail the next `times` calls of `operation` with a transient error
    ///
    /// `operation` is the client method name, e.g. `"create_pool"`.
    pub fn fail_transient(&self, operation: &str, times: u32) {
        self.lock()
            .transient_failures
            .insert(operation.to_string(), times);
    }

    /// Apply the next `times` calls of `operation`, then fail them with a
    /// transient error, as if the response was lost after the provider
    /// accepted the request
    pub fn lose_response(&self, operation: &str, times: u32) {
        self.lock()
            .lost_responses
            .insert(operation.to_string(), times);
    }

    /// Reject every call of `operation` as invalid
    pub fn reject(&self, operation: &str, message: &str) {
        self.lock()
            .rejections
            .insert(operation.to_string(), message.to_string());
    }

    /// Resources named `name` settle into ERROR instead of ACTIVE
    pub fn fail_provisioning(&self, name: &str) {
        self.lock().failing_names.insert(name.to_string());
    }

    /// Drop all injected call faults and provisioning failures
    pub fn clear_faults(&self) {
        let mut inner = self.lock();
        inner.transient_failures.clear();
        inner.lost_responses.clear();
        inner.rejections.clear();
        inner.failing_names.clear();
    }

    /// Stop settling pending work
    pub fn freeze(&self) {
        self.lock().frozen = true;
    }

    /// Resume settling pending work
    pub fn unfreeze(&self) {
        self.lock().frozen = false;
    }

    /// Create load balancers without a virtual address
    pub fn omit_vip(&self) {
        self.lock().omit_vip = true;
    }

    /// Seed an ACTIVE load balancer directly, bypassing the call log
    pub fn insert_load_balancer(&self, name: &str, description: &str) -> LoadBalancer {
        let mut inner = self.lock();
        let lb = inner.new_load_balancer(name, description, ProvisioningStatus::Active);
        inner.load_balancers.insert(lb.id.clone(), lb.clone());
        lb
    }

    /// Seed an ACTIVE listener on `lb_id` directly, bypassing the call log
    ///
    /// `application_protocol` seeds a listener created outside lbsync, such
    /// as an HTTP listener added by hand.
    pub fn insert_listener(
        &self,
        lb_id: &str,
        protocol: Protocol,
        port: u16,
        application_protocol: Option<&str>,
    ) -> Listener {
        let mut inner = self.lock();
        let listener = Listener {
            id: inner.next_id("listener"),
            name: format!("listener-{}", port),
            protocol,
            port,
            provisioning_status: ProvisioningStatus::Active,
            application_protocol: application_protocol.map(str::to_string),
        };
        inner.listeners.insert(
            listener.id.clone(),
            Owned {
                lb_id: lb_id.to_string(),
                resource: listener.clone(),
            },
        );
        listener
    }

    /// Force the provisioning status of a load balancer
    ///
    /// A pending status settles like any other pending work.
    pub fn set_load_balancer_status(&self, id: &str, status: ProvisioningStatus) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let settle_polls = inner.settle_polls;
        if let Some(lb) = inner.load_balancers.get_mut(id) {
            lb.provisioning_status = status;
            if status.is_pending() {
                inner.pending.insert(id.to_string(), settle_polls);
            }
        }
    }

    /// Every client call made so far, by method name
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Client calls that create or delete something
    pub fn mutating_calls(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.starts_with("create_") || c.starts_with("delete_"))
            .cloned()
            .collect()
    }

    /// Forget recorded calls
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// All load balancers
    pub fn load_balancers(&self) -> Vec<LoadBalancer> {
        self.lock().load_balancers.values().cloned().collect()
    }

    /// Listeners of a load balancer
    pub fn listeners_of(&self, lb_id: &str) -> Vec<Listener> {
        self.lock()
            .listeners
            .values()
            .filter(|l| l.lb_id == lb_id)
            .map(|l| l.resource.clone())
            .collect()
    }

    /// Pools of a load balancer
    pub fn pools_of(&self, lb_id: &str) -> Vec<Pool> {
        self.lock()
            .pools
            .values()
            .filter(|p| p.lb_id == lb_id)
            .map(|p| p.resource.clone())
            .collect()
    }

    /// Members of a pool
    pub fn members_of(&self, pool_id: &str) -> Vec<Member> {
        self.lock()
            .members
            .values()
            .filter(|m| m.pool_id == pool_id)
            .map(|m| m.member.clone())
            .collect()
    }

    /// Health monitors of a load balancer
    pub fn monitors_of(&self, lb_id: &str) -> Vec<HealthMonitor> {
        self.lock()
            .monitors
            .values()
            .filter(|m| m.lb_id == lb_id)
            .map(|m| m.resource.clone())
            .collect()
    }

    /// All floating IPs
    pub fn floating_ips(&self) -> Vec<FloatingIp> {
        self.lock().floating_ips.values().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a call and apply injected faults
    fn enter(&self, operation: &str) -> Result<MutexGuard<'_, Inner>, Error> {
        let mut inner = self.lock();
        inner.calls.push(operation.to_string());

        if let Some(message) = inner.rejections.get(operation) {
            return Err(Error::validation(format!("{}: {}", operation, message)));
        }

        if let Some(left) = inner.transient_failures.get_mut(operation)
            && *left > 0
        {
            *left -= 1;
            return Err(Error::transient(format!("{}: 503 Service Unavailable", operation)));
        }

        Ok(inner)
    }
}

impl Inner {
    /// Answer a call that already took effect, unless its response is lost
    fn respond<T>(&mut self, operation: &str, value: T) -> Result<T, Error> {
        if let Some(left) = self.lost_responses.get_mut(operation)
            && *left > 0
        {
            *left -= 1;
            return Err(Error::transient(format!("{}: 504 Gateway Timeout", operation)));
        }
        Ok(value)
    }

    fn next_id(&mut self, prefix: &str) -> String {
        let id = format!("{}-{:04}", prefix, self.next_id);
        self.next_id += 1;
        id
    }

    fn new_load_balancer(
        &mut self,
        name: &str,
        description: &str,
        status: ProvisioningStatus,
    ) -> LoadBalancer {
        let id = self.next_id("lb");
        let n = self.load_balancers.len() as u8;
        let (vip_address, vip_port_id) = if self.omit_vip {
            (None, None)
        } else {
            (
                Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, n.wrapping_add(10)))),
                Some(format!("port-{}", id)),
            )
        };

        LoadBalancer {
            id,
            name: name.to_string(),
            description: description.to_string(),
            provisioning_status: status,
            vip_address,
            vip_port_id,
        }
    }

    /// Put `lb_id` into PENDING_UPDATE, failing if it cannot be mutated now
    fn begin_mutation(&mut self, lb_id: &str) -> Result<(), Error> {
        let lb = self
            .load_balancers
            .get_mut(lb_id)
            .ok_or_else(|| Error::not_found(format!("load balancer {}", lb_id)))?;

        if lb.provisioning_status != ProvisioningStatus::Active {
            return Err(Error::conflict(format!(
                "load balancer {} is immutable while {}",
                lb_id, lb.provisioning_status
            )));
        }

        lb.provisioning_status = ProvisioningStatus::PendingUpdate;
        self.pending.insert(lb_id.to_string(), self.settle_polls);
        Ok(())
    }

    fn owner_of(&self, resource: &ResourceRef) -> Option<String> {
        match resource.kind {
            ResourceKind::LoadBalancer => self
                .load_balancers
                .contains_key(&resource.id)
                .then(|| resource.id.clone()),
            ResourceKind::Listener => self.listeners.get(&resource.id).map(|l| l.lb_id.clone()),
            ResourceKind::Pool => self.pools.get(&resource.id).map(|p| p.lb_id.clone()),
            ResourceKind::Member => self.members.get(&resource.id).map(|m| m.lb_id.clone()),
            ResourceKind::HealthMonitor => {
                self.monitors.get(&resource.id).map(|m| m.lb_id.clone())
            }
        }
    }

    fn status_of(&self, resource: &ResourceRef) -> Option<ProvisioningStatus> {
        match resource.kind {
            ResourceKind::LoadBalancer => self
                .load_balancers
                .get(&resource.id)
                .map(|lb| lb.provisioning_status),
            ResourceKind::Listener => self
                .listeners
                .get(&resource.id)
                .map(|l| l.resource.provisioning_status),
            ResourceKind::Pool => self
                .pools
                .get(&resource.id)
                .map(|p| p.resource.provisioning_status),
            ResourceKind::Member => self
                .members
                .get(&resource.id)
                .map(|m| m.member.provisioning_status),
            ResourceKind::HealthMonitor => self
                .monitors
                .get(&resource.id)
                .map(|m| m.resource.provisioning_status),
        }
    }

    /// Count one status read against the pending work of `lb_id`
    fn tick(&mut self, lb_id: &str) {
        if self.frozen {
            return;
        }
        let Some(left) = self.pending.get_mut(lb_id) else {
            return;
        };
        *left = left.saturating_sub(1);
        if *left == 0 {
            self.pending.remove(lb_id);
            self.settle(lb_id);
        }
    }

    fn settle(&mut self, lb_id: &str) {
        let failing = &self.failing_names;
        let outcome = |name: &str| {
            if failing.contains(name) {
                ProvisioningStatus::Error
            } else {
                ProvisioningStatus::Active
            }
        };

        if let Some(lb) = self.load_balancers.get_mut(lb_id)
            && lb.provisioning_status.is_pending()
        {
            lb.provisioning_status = outcome(&lb.name);
        }

        for listener in self.listeners.values_mut().filter(|l| l.lb_id == lb_id) {
            if listener.resource.provisioning_status == ProvisioningStatus::PendingCreate {
                listener.resource.provisioning_status = outcome(&listener.resource.name);
            }
        }
        for pool in self.pools.values_mut().filter(|p| p.lb_id == lb_id) {
            if pool.resource.provisioning_status == ProvisioningStatus::PendingCreate {
                pool.resource.provisioning_status = outcome(&pool.resource.name);
            }
        }
        for monitor in self.monitors.values_mut().filter(|m| m.lb_id == lb_id) {
            if monitor.resource.provisioning_status == ProvisioningStatus::PendingCreate {
                monitor.resource.provisioning_status = outcome(&monitor.resource.name);
            }
        }
        for member in self.members.values_mut().filter(|m| m.lb_id == lb_id) {
            if member.member.provisioning_status == ProvisioningStatus::PendingCreate {
                member.member.provisioning_status = outcome(&member.member.name);
            }
        }

        let deleting = ProvisioningStatus::PendingDelete;
        self.members
            .retain(|_, m| !(m.lb_id == lb_id && m.member.provisioning_status == deleting));

        let removed_monitors: Vec<String> = self
            .monitors
            .iter()
            .filter(|(_, m)| m.lb_id == lb_id && m.resource.provisioning_status == deleting)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &removed_monitors {
            self.monitors.remove(id);
        }
        for pool in self.pools.values_mut() {
            if pool
                .resource
                .healthmonitor_id
                .as_ref()
                .is_some_and(|id| removed_monitors.contains(id))
            {
                pool.resource.healthmonitor_id = None;
            }
        }

        self.pools
            .retain(|_, p| !(p.lb_id == lb_id && p.resource.provisioning_status == deleting));
        self.listeners
            .retain(|_, l| !(l.lb_id == lb_id && l.resource.provisioning_status == deleting));

        debug!("Memory provider settled pending work of {}", lb_id);
    }

    fn page<T: Clone>(&self, items: Vec<(String, T)>, marker: Option<&str>) -> Page<T> {
        let rest: Vec<(String, T)> = items
            .into_iter()
            .filter(|(id, _)| marker.is_none_or(|m| id.as_str() > m))
            .collect();

        let has_more = rest.len() > self.page_size;
        let page: Vec<(String, T)> = rest.into_iter().take(self.page_size).collect();
        let next_marker = if has_more {
            page.last().map(|(id, _)| id.clone())
        } else {
            None
        };

        Page {
            items: page.into_iter().map(|(_, item)| item).collect(),
            next_marker,
        }
    }
}

fn require_active(kind: &str, id: &str, status: ProvisioningStatus) -> Result<(), Error> {
    if status == ProvisioningStatus::Active {
        Ok(())
    } else {
        Err(Error::conflict(format!("{} {} is {}, not ACTIVE", kind, id, status)))
    }
}

#[async_trait]
impl LoadBalancerClient for MemoryProvider {
    async fn find_load_balancers(&self, name: &str) -> Result<Vec<LoadBalancer>, Error> {
        let inner = self.enter("find_load_balancers")?;
        Ok(inner
            .load_balancers
            .values()
            .filter(|lb| lb.name == name)
            .cloned()
            .collect())
    }

    async fn get_load_balancer(&self, id: &str) -> Result<LoadBalancer, Error> {
        let inner = self.enter("get_load_balancer")?;
        inner
            .load_balancers
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("load balancer {}", id)))
    }

    async fn create_load_balancer(
        &self,
        request: &CreateLoadBalancer,
    ) -> Result<LoadBalancer, Error> {
        let mut inner = self.enter("create_load_balancer")?;
        let lb = inner.new_load_balancer(
            &request.name,
            &request.description,
            ProvisioningStatus::PendingCreate,
        );
        let settle_polls = inner.settle_polls;
        inner.pending.insert(lb.id.clone(), settle_polls);
        inner.load_balancers.insert(lb.id.clone(), lb.clone());
        inner.respond("create_load_balancer", lb)
    }

    async fn list_listeners(
        &self,
        loadbalancer_id: &str,
        marker: Option<&str>,
    ) -> Result<Page<Listener>, Error> {
        let inner = self.enter("list_listeners")?;
        let items = inner
            .listeners
            .iter()
            .filter(|(_, l)| l.lb_id == loadbalancer_id)
            .map(|(id, l)| (id.clone(), l.resource.clone()))
            .collect();
        Ok(inner.page(items, marker))
    }

    async fn create_listener(&self, request: &CreateListener) -> Result<Listener, Error> {
        let mut inner = self.enter("create_listener")?;

        let duplicate = inner.listeners.values().any(|l| {
            l.lb_id == request.loadbalancer_id
                && l.resource.protocol == request.protocol
                && l.resource.port == request.protocol_port
        });
        if duplicate {
            return Err(Error::conflict(format!(
                "{}/{} is already in use on {}",
                request.protocol, request.protocol_port, request.loadbalancer_id
            )));
        }

        inner.begin_mutation(&request.loadbalancer_id)?;
        let listener = Listener {
            id: inner.next_id("listener"),
            name: request.name.clone(),
            protocol: request.protocol,
            port: request.protocol_port,
            provisioning_status: ProvisioningStatus::PendingCreate,
            application_protocol: None,
        };
        inner.listeners.insert(
            listener.id.clone(),
            Owned {
                lb_id: request.loadbalancer_id.clone(),
                resource: listener.clone(),
            },
        );
        inner.respond("create_listener", listener)
    }

    async fn delete_listener(&self, id: &str) -> Result<(), Error> {
        let mut inner = self.enter("delete_listener")?;
        let lb_id = inner
            .listeners
            .get(id)
            .map(|l| l.lb_id.clone())
            .ok_or_else(|| Error::not_found(format!("listener {}", id)))?;

        if inner
            .pools
            .values()
            .any(|p| p.resource.listener_id.as_deref() == Some(id))
        {
            return Err(Error::conflict(format!("listener {} still has a pool", id)));
        }

        inner.begin_mutation(&lb_id)?;
        if let Some(listener) = inner.listeners.get_mut(id) {
            listener.resource.provisioning_status = ProvisioningStatus::PendingDelete;
        }
        Ok(())
    }

    async fn list_pools(
        &self,
        loadbalancer_id: &str,
        marker: Option<&str>,
    ) -> Result<Page<Pool>, Error> {
        let inner = self.enter("list_pools")?;
        let items = inner
            .pools
            .iter()
            .filter(|(_, p)| p.lb_id == loadbalancer_id)
            .map(|(id, p)| (id.clone(), p.resource.clone()))
            .collect();
        Ok(inner.page(items, marker))
    }

    async fn create_pool(&self, request: &CreatePool) -> Result<Pool, Error> {
        let mut inner = self.enter("create_pool")?;
        let listener = inner
            .listeners
            .get(&request.listener_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("listener {}", request.listener_id)))?;
        require_active("listener", &request.listener_id, listener.resource.provisioning_status)?;

        if inner
            .pools
            .values()
            .any(|p| p.resource.listener_id.as_deref() == Some(request.listener_id.as_str()))
        {
            return Err(Error::conflict(format!(
                "listener {} already has a pool",
                request.listener_id
            )));
        }

        inner.begin_mutation(&listener.lb_id)?;
        let pool = Pool {
            id: inner.next_id("pool"),
            name: request.name.clone(),
            listener_id: Some(request.listener_id.clone()),
            lb_method: request.lb_algorithm,
            session_persistence: request.session_persistence,
            healthmonitor_id: None,
            provisioning_status: ProvisioningStatus::PendingCreate,
        };
        inner.pools.insert(
            pool.id.clone(),
            Owned {
                lb_id: listener.lb_id,
                resource: pool.clone(),
            },
        );
        inner.respond("create_pool", pool)
    }

    async fn delete_pool(&self, id: &str) -> Result<(), Error> {
        let mut inner = self.enter("delete_pool")?;
        let pool = inner
            .pools
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("pool {}", id)))?;

        if inner.members.values().any(|m| m.pool_id == id) {
            return Err(Error::conflict(format!("pool {} still has members", id)));
        }
        if pool.resource.healthmonitor_id.is_some() {
            return Err(Error::conflict(format!("pool {} still has a health monitor", id)));
        }

        inner.begin_mutation(&pool.lb_id)?;
        if let Some(pool) = inner.pools.get_mut(id) {
            pool.resource.provisioning_status = ProvisioningStatus::PendingDelete;
        }
        Ok(())
    }

    async fn list_members(
        &self,
        pool_id: &str,
        marker: Option<&str>,
    ) -> Result<Page<Member>, Error> {
        let inner = self.enter("list_members")?;
        if !inner.pools.contains_key(pool_id) {
            return Err(Error::not_found(format!("pool {}", pool_id)));
        }
        let items = inner
            .members
            .iter()
            .filter(|(_, m)| m.pool_id == pool_id)
            .map(|(id, m)| (id.clone(), m.member.clone()))
            .collect();
        Ok(inner.page(items, marker))
    }

    async fn create_member(&self, pool_id: &str, request: &CreateMember) -> Result<Member, Error> {
        let mut inner = self.enter("create_member")?;
        let pool = inner
            .pools
            .get(pool_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("pool {}", pool_id)))?;
        require_active("pool", pool_id, pool.resource.provisioning_status)?;

        let duplicate = inner.members.values().any(|m| {
            m.pool_id == pool_id
                && m.member.address == request.address
                && m.member.port == request.protocol_port
        });
        if duplicate {
            return Err(Error::conflict(format!(
                "member {}:{} already exists in pool {}",
                request.address, request.protocol_port, pool_id
            )));
        }

        inner.begin_mutation(&pool.lb_id)?;
        let member = Member {
            id: inner.next_id("member"),
            name: request.name.clone(),
            address: request.address,
            port: request.protocol_port,
            weight: request.weight,
            provisioning_status: ProvisioningStatus::PendingCreate,
        };
        inner.members.insert(
            member.id.clone(),
            OwnedMember {
                lb_id: pool.lb_id,
                pool_id: pool_id.to_string(),
                member: member.clone(),
            },
        );
        inner.respond("create_member", member)
    }

    async fn delete_member(&self, pool_id: &str, member_id: &str) -> Result<(), Error> {
        let mut inner = self.enter("delete_member")?;
        let lb_id = inner
            .members
            .get(member_id)
            .filter(|m| m.pool_id == pool_id)
            .map(|m| m.lb_id.clone())
            .ok_or_else(|| Error::not_found(format!("member {} of pool {}", member_id, pool_id)))?;

        inner.begin_mutation(&lb_id)?;
        if let Some(member) = inner.members.get_mut(member_id) {
            member.member.provisioning_status = ProvisioningStatus::PendingDelete;
        }
        Ok(())
    }

    async fn create_health_monitor(
        &self,
        request: &CreateHealthMonitor,
    ) -> Result<HealthMonitor, Error> {
        let mut inner = self.enter("create_health_monitor")?;
        let pool = inner
            .pools
            .get(&request.pool_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("pool {}", request.pool_id)))?;
        require_active("pool", &request.pool_id, pool.resource.provisioning_status)?;

        if pool.resource.healthmonitor_id.is_some() {
            return Err(Error::conflict(format!(
                "pool {} already has a health monitor",
                request.pool_id
            )));
        }

        inner.begin_mutation(&pool.lb_id)?;
        let monitor = HealthMonitor {
            id: inner.next_id("monitor"),
            name: request.name.clone(),
            pool_id: request.pool_id.clone(),
            kind: request.kind,
            provisioning_status: ProvisioningStatus::PendingCreate,
        };
        if let Some(pool) = inner.pools.get_mut(&request.pool_id) {
            pool.resource.healthmonitor_id = Some(monitor.id.clone());
        }
        inner.monitors.insert(
            monitor.id.clone(),
            Owned {
                lb_id: pool.lb_id,
                resource: monitor.clone(),
            },
        );
        inner.respond("create_health_monitor", monitor)
    }

    async fn delete_health_monitor(&self, id: &str) -> Result<(), Error> {
        let mut inner = self.enter("delete_health_monitor")?;
        let lb_id = inner
            .monitors
            .get(id)
            .map(|m| m.lb_id.clone())
            .ok_or_else(|| Error::not_found(format!("health monitor {}", id)))?;

        inner.begin_mutation(&lb_id)?;
        if let Some(monitor) = inner.monitors.get_mut(id) {
            monitor.resource.provisioning_status = ProvisioningStatus::PendingDelete;
        }
        Ok(())
    }

    async fn provisioning_status(&self, resource: &ResourceRef) -> Result<ProvisioningStatus, Error> {
        let mut inner = self.enter("provisioning_status")?;
        let lb_id = inner
            .owner_of(resource)
            .ok_or_else(|| Error::not_found(resource.to_string()))?;

        inner.tick(&lb_id);
        inner
            .status_of(resource)
            .ok_or_else(|| Error::not_found(resource.to_string()))
    }

    fn provider_name(&self) -> &'static str {
        "memory"
    }
}

#[async_trait]
impl NetworkClient for MemoryProvider {
    async fn floating_ips_for_port(&self, port_id: &str) -> Result<Vec<FloatingIp>, Error> {
        let inner = self.enter("floating_ips_for_port")?;
        Ok(inner
            .floating_ips
            .values()
            .filter(|fip| fip.port_id.as_deref() == Some(port_id))
            .cloned()
            .collect())
    }

    async fn create_floating_ip(
        &self,
        floating_network_id: &str,
        port_id: &str,
    ) -> Result<FloatingIp, Error> {
        let mut inner = self.enter("create_floating_ip")?;
        let n = inner.floating_ips.len() as u8;
        let fip = FloatingIp {
            id: inner.next_id("fip"),
            floating_ip_address: IpAddr::V4(Ipv4Addr::new(172, 24, 4, n.wrapping_add(10))),
            port_id: Some(port_id.to_string()),
            floating_network_id: floating_network_id.to_string(),
        };
        inner.floating_ips.insert(fip.id.clone(), fip.clone());
        inner.respond("create_floating_ip", fip)
    }

    fn provider_name(&self) -> &'static str {
        "memory"
    }
}

/// Builds a fresh [`MemoryProvider`] for `ProviderConfig::Memory`
#[derive(Debug, Default)]
pub struct MemoryProviderFactory;

impl ProviderFactory for MemoryProviderFactory {
    fn create(&self, config: &ProviderConfig) -> Result<ProviderClients, Error> {
        match config {
            ProviderConfig::Memory => {
                let provider = MemoryProvider::new();
                Ok(ProviderClients::new(
                    Arc::new(provider.clone()),
                    Arc::new(provider),
                ))
            }
            other => Err(Error::config(format!(
                "memory factory cannot build a '{}' provider",
                other.type_name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::LbMethod;

    fn lb_request(name: &str) -> CreateLoadBalancer {
        CreateLoadBalancer {
            name: name.to_string(),
            description: String::new(),
            vip_subnet_id: "subnet".to_string(),
            vip_network_id: None,
        }
    }

    fn listener_request(lb_id: &str, port: u16) -> CreateListener {
        CreateListener {
            name: format!("listener_{}", port),
            loadbalancer_id: lb_id.to_string(),
            protocol: Protocol::Tcp,
            protocol_port: port,
        }
    }

    async fn settle(provider: &MemoryProvider, lb_id: &str) {
        let lb = ResourceRef::load_balancer(lb_id);
        while provider.provisioning_status(&lb).await.unwrap().is_pending() {}
    }

    #[tokio::test]
    async fn pending_work_settles_after_polls() {
        let provider = MemoryProvider::new().with_settle_polls(2);
        let lb = provider.create_load_balancer(&lb_request("a")).await.unwrap();
        assert_eq!(lb.provisioning_status, ProvisioningStatus::PendingCreate);

        let lb_ref = ResourceRef::load_balancer(&lb.id);
        assert_eq!(
            provider.provisioning_status(&lb_ref).await.unwrap(),
            ProvisioningStatus::PendingCreate
        );
        assert_eq!(
            provider.provisioning_status(&lb_ref).await.unwrap(),
            ProvisioningStatus::Active
        );
    }

    #[tokio::test]
    async fn pending_load_balancer_is_immutable() {
        let provider = MemoryProvider::new();
        let lb = provider.create_load_balancer(&lb_request("a")).await.unwrap();

        let err = provider
            .create_listener(&listener_request(&lb.id, 80))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ResourceConflict(_)));
    }

    #[tokio::test]
    async fn pool_requires_active_listener() {
        let provider = MemoryProvider::new().with_settle_polls(1);
        let lb = provider.create_load_balancer(&lb_request("a")).await.unwrap();
        settle(&provider, &lb.id).await;
        let listener = provider
            .create_listener(&listener_request(&lb.id, 80))
            .await
            .unwrap();

        let request = CreatePool {
            name: "pool".to_string(),
            listener_id: listener.id.clone(),
            protocol: Protocol::Tcp,
            lb_algorithm: LbMethod::RoundRobin,
            session_persistence: None,
        };
        let err = provider.create_pool(&request).await.unwrap_err();
        assert!(matches!(err, Error::ResourceConflict(_)));

        settle(&provider, &lb.id).await;
        assert!(provider.create_pool(&request).await.is_ok());
    }

    #[tokio::test]
    async fn listings_are_paginated() {
        let provider = MemoryProvider::new().with_settle_polls(1).with_page_size(2);
        let lb = provider.create_load_balancer(&lb_request("a")).await.unwrap();
        settle(&provider, &lb.id).await;
        for port in [80, 443, 8080] {
            provider
                .create_listener(&listener_request(&lb.id, port))
                .await
                .unwrap();
            settle(&provider, &lb.id).await;
        }

        let first = provider.list_listeners(&lb.id, None).await.unwrap();
        assert_eq!(first.items.len(), 2);
        let marker = first.next_marker.clone().unwrap();

        let second = provider.list_listeners(&lb.id, Some(&marker)).await.unwrap();
        assert_eq!(second.items.len(), 1);
        assert!(second.next_marker.is_none());
    }

    #[tokio::test]
    async fn transient_faults_run_out() {
        let provider = MemoryProvider::new();
        provider.fail_transient("find_load_balancers", 1);

        let err = provider.find_load_balancers("a").await.unwrap_err();
        assert!(err.is_transient());
        assert!(provider.find_load_balancers("a").await.is_ok());
        assert_eq!(provider.calls().len(), 2);
        assert!(provider.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn deletes_complete_on_settle() {
        let provider = MemoryProvider::new().with_settle_polls(1);
        let lb = provider.create_load_balancer(&lb_request("a")).await.unwrap();
        settle(&provider, &lb.id).await;
        let listener = provider
            .create_listener(&listener_request(&lb.id, 80))
            .await
            .unwrap();
        settle(&provider, &lb.id).await;

        provider.delete_listener(&listener.id).await.unwrap();
        assert_eq!(provider.listeners_of(&lb.id).len(), 1);

        settle(&provider, &lb.id).await;
        assert!(provider.listeners_of(&lb.id).is_empty());
    }

    #[tokio::test]
    async fn failing_names_settle_into_error() {
        let provider = MemoryProvider::new().with_settle_polls(1);
        provider.fail_provisioning("broken");
        let lb = provider.create_load_balancer(&lb_request("broken")).await.unwrap();

        let status = provider
            .provisioning_status(&ResourceRef::load_balancer(&lb.id))
            .await
            .unwrap();
        assert_eq!(status, ProvisioningStatus::Error);
    }
}
