//! Resource locator
//!
//! Rebuilds the current-state snapshot of one service from the provider on
//! every reconciliation. Nothing is cached between calls; the provider is the
//! single source of truth.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::desired::ListenerKey;
use crate::engine::retry::RetryPolicy;
use crate::error::{Error, Result};
use crate::traits::{
    FloatingIp, Listener, LoadBalancer, LoadBalancerClient, Member, NetworkClient, Page, Pool,
};
use crate::waiter::Deadline;

/// A pool with its members as currently provisioned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentPool {
    /// The pool
    pub pool: Pool,
    /// Its members
    pub members: Vec<Member>,
}

/// A listener with its pool, if it has one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentListener {
    /// The listener
    pub listener: Listener,
    /// Its pool; `None` when an earlier run stopped before creating it
    pub pool: Option<CurrentPool>,
}

impl CurrentListener {
    /// What the listener listens on
    pub fn key(&self) -> ListenerKey {
        ListenerKey::new(self.listener.protocol, self.listener.port)
    }

    /// The key, for listeners that can match a desired listener
    pub fn managed_key(&self) -> Option<ListenerKey> {
        self.listener.is_managed().then(|| self.key())
    }
}

/// Everything the provider currently holds for one service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentState {
    /// The load balancer
    pub load_balancer: LoadBalancer,
    /// Its listeners
    pub listeners: Vec<CurrentListener>,
    /// Floating IP on the virtual address port
    pub floating_ip: Option<FloatingIp>,
}

impl CurrentState {
    /// Look up a listener by key
    pub fn listener(&self, key: &ListenerKey) -> Option<&CurrentListener> {
        self.listeners
            .iter()
            .find(|l| l.managed_key().as_ref() == Some(key))
    }

    /// Names of pools without members
    pub fn empty_pools(&self) -> Vec<String> {
        self.listeners
            .iter()
            .filter_map(|l| l.pool.as_ref())
            .filter(|p| p.members.is_empty())
            .map(|p| p.pool.name.clone())
            .collect()
    }
}

/// Looks up a service's resources by stable name
pub struct Locator<'a> {
    lb: &'a dyn LoadBalancerClient,
    network: &'a dyn NetworkClient,
    retry: &'a RetryPolicy,
    deadline: Deadline,
}

impl<'a> Locator<'a> {
    /// Create a locator for one reconciliation
    pub fn new(
        lb: &'a dyn LoadBalancerClient,
        network: &'a dyn NetworkClient,
        retry: &'a RetryPolicy,
        deadline: Deadline,
    ) -> Self {
        Self {
            lb,
            network,
            retry,
            deadline,
        }
    }

    /// Find the load balancer named `name` and read its whole sub-tree
    ///
    /// Returns `Ok(None)` when no load balancer carries the name.
    ///
    /// # Errors
    ///
    /// [`Error::ResourceConflict`] when more than one load balancer carries
    /// the name; the ambiguity is left for an operator to resolve.
    pub async fn locate(
        &self,
        name: &str,
        expected_description: &str,
    ) -> Result<Option<CurrentState>> {
        let lb = self.lb;
        let mut matches = self
            .retry
            .run("find load balancer", self.deadline, move || lb.find_load_balancers(name))
            .await
            .map_err(|e| e.in_step("find load balancer", name))?;

        if matches.len() > 1 {
            let ids: Vec<_> = matches.iter().map(|m| m.id.as_str()).collect();
            return Err(Error::conflict(format!(
                "{} load balancers are named {}: {}",
                matches.len(),
                name,
                ids.join(", ")
            )));
        }

        let Some(load_balancer) = matches.pop() else {
            debug!("No load balancer named {}", name);
            return Ok(None);
        };

        if load_balancer.description != expected_description {
            warn!(
                "Adopting load balancer {} ({}) with unexpected description {:?}",
                load_balancer.name, load_balancer.id, load_balancer.description
            );
        }

        let listeners = self.read_listeners(&load_balancer).await?;
        let floating_ip = self.read_floating_ip(&load_balancer).await?;

        debug!(
            "Located load balancer {} ({}) with {} listener(s), floating IP: {}",
            load_balancer.name,
            load_balancer.id,
            listeners.len(),
            floating_ip.is_some()
        );

        Ok(Some(CurrentState {
            load_balancer,
            listeners,
            floating_ip,
        }))
    }

    async fn read_listeners(&self, load_balancer: &LoadBalancer) -> Result<Vec<CurrentListener>> {
        let lb = self.lb;
        let lb_id = load_balancer.id.as_str();

        let listeners = self
            .collect_pages("list listeners", lb_id, |marker| async move {
                lb.list_listeners(lb_id, marker.as_deref()).await
            })
            .await?;
        let pools = self
            .collect_pages("list pools", lb_id, |marker| async move {
                lb.list_pools(lb_id, marker.as_deref()).await
            })
            .await?;

        let mut pools_by_listener: HashMap<String, Pool> = HashMap::new();
        for pool in pools {
            match pool.listener_id.clone() {
                Some(listener_id) if pools_by_listener.contains_key(&listener_id) => {
                    warn!("Listener {} has more than one pool, ignoring {}", listener_id, pool.id);
                }
                Some(listener_id) => {
                    pools_by_listener.insert(listener_id, pool);
                }
                None => debug!("Ignoring pool {} without listener", pool.id),
            }
        }

        let mut current = Vec::with_capacity(listeners.len());
        for listener in listeners {
            let pool = match pools_by_listener.remove(&listener.id) {
                Some(pool) => {
                    let pool_id = pool.id.as_str();
                    let members = self
                        .collect_pages("list members", pool_id, |marker| async move {
                            lb.list_members(pool_id, marker.as_deref()).await
                        })
                        .await?;
                    Some(CurrentPool { pool, members })
                }
                None => {
                    debug!("Listener {} has no pool yet", listener.name);
                    None
                }
            };
            current.push(CurrentListener { listener, pool });
        }

        Ok(current)
    }

    async fn read_floating_ip(&self, load_balancer: &LoadBalancer) -> Result<Option<FloatingIp>> {
        let Some(port_id) = load_balancer.vip_port_id.as_deref() else {
            return Ok(None);
        };

        let network = self.network;
        let mut ips = self
            .retry
            .run("list floating IPs", self.deadline, move || {
                network.floating_ips_for_port(port_id)
            })
            .await
            .map_err(|e| e.in_step("list floating IPs", port_id))?;

        if ips.len() > 1 {
            warn!("Port {} has {} floating IPs, reporting the first", port_id, ips.len());
        }
        Ok(if ips.is_empty() { None } else { Some(ips.swap_remove(0)) })
    }

    /// Follow a marker-paginated listing to its end
    async fn collect_pages<T, F, Fut>(&self, what: &str, parent: &str, mut list: F) -> Result<Vec<T>>
    where
        F: FnMut(Option<String>) -> Fut,
        Fut: std::future::Future<Output = Result<Page<T>>>,
    {
        let mut items = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let page = self
                .retry
                .run(what, self.deadline, || list(marker.clone()))
                .await
                .map_err(|e| e.in_step(what, parent))?;

            items.extend(page.items);
            match page.next_marker {
                Some(next) if Some(&next) != marker.as_ref() => marker = Some(next),
                Some(_) => {
                    warn!("{} of {} returned a repeating marker, stopping", what, parent);
                    break;
                }
                None => break,
            }
        }

        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MemoryProvider;
    use std::time::Duration;

    fn retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        }
    }

    async fn locate(provider: &MemoryProvider, name: &str) -> Result<Option<CurrentState>> {
        let retry = retry();
        let locator = Locator::new(provider, provider, &retry, Deadline::after(Duration::from_secs(30)));
        locator.locate(name, "Kubernetes external service default/echo").await
    }

    #[tokio::test(start_paused = true)]
    async fn missing_load_balancer_is_none() {
        let provider = MemoryProvider::new();
        assert!(locate(&provider, "kube_service_c_default_echo").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn bare_load_balancer_has_no_children() {
        let provider = MemoryProvider::new();
        let lb = provider.insert_load_balancer("kube_service_c_default_echo", "something else");

        let current = locate(&provider, &lb.name).await.unwrap().unwrap();

        assert_eq!(current.load_balancer.id, lb.id);
        assert!(current.listeners.is_empty());
        assert!(current.floating_ip.is_none());
        assert!(current.empty_pools().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_names_are_a_conflict() {
        let provider = MemoryProvider::new();
        provider.insert_load_balancer("kube_service_c_default_echo", "");
        provider.insert_load_balancer("kube_service_c_default_echo", "");

        let err = locate(&provider, "kube_service_c_default_echo").await.unwrap_err();
        assert!(matches!(err.root(), Error::ResourceConflict(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_lookup_failures_are_retried() {
        let provider = MemoryProvider::new();
        provider.insert_load_balancer("kube_service_c_default_echo", "");
        provider.fail_transient("find_load_balancers", 1);

        assert!(locate(&provider, "kube_service_c_default_echo").await.unwrap().is_some());
    }
}
