//! Execution of a [`Plan`]
//!
//! Every mutating call is followed by a wait before the next step runs: the
//! provider rejects operations against a load balancer that is still
//! transitioning. Creates wait on the created resource, deletes wait on the
//! parent load balancer. There is no rollback; a failure leaves whatever was
//! applied for the next reconciliation to pick up.
//!
//! A create that failed transiently may still have taken effect, so before
//! re-issuing it the applier looks the resource up and adopts it if found.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, info};

use super::plan::{Plan, Step};
use super::retry::RetryPolicy;
use super::{ReconcileEvent, emit};
use crate::config::ReconcilerConfig;
use crate::desired::{DesiredListener, DesiredMember, DesiredState, ListenerKey};
use crate::error::{Error, Result};
use crate::locator::CurrentState;
use crate::traits::{
    CreateHealthMonitor, CreateListener, CreateLoadBalancer, CreateMember, CreatePool, FloatingIp,
    HealthMonitor, Listener, LoadBalancer, LoadBalancerClient, Member, NetworkClient, Page, Pool,
    ProvisioningStatus, ResourceKind, ResourceRef,
};
use crate::waiter::{Deadline, Waiter};

/// Outcome of applying a plan
#[derive(Debug)]
pub(crate) struct Applied {
    /// The load balancer after the last step
    pub load_balancer: LoadBalancer,
    /// Floating IP on its virtual address port
    pub floating_ip: Option<FloatingIp>,
}

/// Provider handles and settings one plan execution runs with
pub(crate) struct ApplyContext<'a> {
    pub lb: &'a dyn LoadBalancerClient,
    pub network: &'a dyn NetworkClient,
    pub waiter: &'a Waiter,
    pub retry: &'a RetryPolicy,
    pub config: &'a ReconcilerConfig,
    pub events: &'a mpsc::Sender<ReconcileEvent>,
    pub deadline: Deadline,
}

pub(crate) struct Applier<'a> {
    ctx: ApplyContext<'a>,
    desired: &'a DesiredState,
    load_balancer: Option<LoadBalancer>,
    listener_ids: HashMap<ListenerKey, String>,
    pool_ids: HashMap<ListenerKey, String>,
    floating_ip: Option<FloatingIp>,
}

impl<'a> Applier<'a> {
    pub fn new(
        ctx: ApplyContext<'a>,
        desired: &'a DesiredState,
        current: Option<&CurrentState>,
    ) -> Self {
        let mut listener_ids = HashMap::new();
        let mut pool_ids = HashMap::new();

        if let Some(current) = current {
            for listener in &current.listeners {
                let Some(key) = listener.managed_key() else {
                    continue;
                };
                listener_ids.insert(key, listener.listener.id.clone());
                if let Some(pool) = &listener.pool {
                    pool_ids.insert(key, pool.pool.id.clone());
                }
            }
        }

        Self {
            ctx,
            desired,
            load_balancer: current.map(|c| c.load_balancer.clone()),
            listener_ids,
            pool_ids,
            floating_ip: current.and_then(|c| c.floating_ip.clone()),
        }
    }

    /// Run every step of `plan` in order
    pub async fn apply(mut self, plan: &Plan) -> Result<Applied> {
        for step in &plan.steps {
            debug!("Applying step on {}: {}", self.desired.lb_name, step);
            self.apply_step(step)
                .await
                .map_err(|e| e.in_step(step.to_string(), &self.desired.lb_name))?;
        }

        let load_balancer = self
            .load_balancer
            .ok_or_else(|| Error::not_found(format!("load balancer {}", self.desired.lb_name)))?;

        Ok(Applied {
            load_balancer,
            floating_ip: self.floating_ip,
        })
    }

    async fn apply_step(&mut self, step: &Step) -> Result<()> {
        match step {
            Step::CreateLoadBalancer => self.create_load_balancer().await,
            Step::CreateListener { key } => self.create_listener(key).await,
            Step::CreatePool { key } => self.create_pool(key).await,
            Step::CreateMonitor { key } => self.create_monitor(key).await,
            Step::AddMember { key, member } => self.add_member(key, member).await,
            Step::RemoveMember {
                pool_id, member_id, ..
            } => {
                let lb = self.ctx.lb;
                let result = self
                    .call("delete member", move || lb.delete_member(pool_id, member_id))
                    .await;
                self.finish_delete(ResourceKind::Member, member_id, result).await
            }
            Step::DeleteMonitor { monitor_id, .. } => {
                let lb = self.ctx.lb;
                let result = self
                    .call("delete health monitor", move || lb.delete_health_monitor(monitor_id))
                    .await;
                self.finish_delete(ResourceKind::HealthMonitor, monitor_id, result)
                    .await
            }
            Step::DeletePool { key, pool_id } => {
                let lb = self.ctx.lb;
                let result = self.call("delete pool", move || lb.delete_pool(pool_id)).await;
                if self.pool_ids.get(key) == Some(pool_id) {
                    self.pool_ids.remove(key);
                }
                self.finish_delete(ResourceKind::Pool, pool_id, result).await
            }
            Step::DeleteListener { key, listener_id } => {
                let lb = self.ctx.lb;
                let result = self
                    .call("delete listener", move || lb.delete_listener(listener_id))
                    .await;
                if self.listener_ids.get(key) == Some(listener_id) {
                    self.listener_ids.remove(key);
                }
                self.finish_delete(ResourceKind::Listener, listener_id, result)
                    .await
            }
            Step::AssociateFloatingIp => self.associate_floating_ip().await,
        }
    }

    async fn create_load_balancer(&mut self) -> Result<()> {
        let request = CreateLoadBalancer {
            name: self.desired.lb_name.clone(),
            description: self.desired.lb_description.clone(),
            vip_subnet_id: self.ctx.config.subnet_id.clone(),
            vip_network_id: self.ctx.config.network_id.clone(),
        };

        let lb = self.ctx.lb;
        let request = &request;
        let name = request.name.as_str();
        let created = self
            .create_or_adopt(
                "create load balancer",
                move || lb.create_load_balancer(request),
                move || async move {
                    let mut found = lb.find_load_balancers(name).await?;
                    if found.len() > 1 {
                        return Err(Error::conflict(format!(
                            "{} load balancers are named {}",
                            found.len(),
                            name
                        )));
                    }
                    Ok::<_, Error>(found.pop())
                },
            )
            .await?;
        info!("Created load balancer {} ({})", created.name, created.id);
        self.created(ResourceKind::LoadBalancer, &created.name);

        self.wait(&ResourceRef::load_balancer(&created.id)).await?;

        // The virtual address and its port are only guaranteed once ACTIVE.
        let id = created.id.as_str();
        let refreshed = self
            .call("get load balancer", move || lb.get_load_balancer(id))
            .await?;
        self.load_balancer = Some(refreshed);
        Ok(())
    }

    async fn create_listener(&mut self, key: &ListenerKey) -> Result<()> {
        let wanted = self.wanted(key)?;
        let request = CreateListener {
            name: wanted.name.clone(),
            loadbalancer_id: self.lb_id()?.to_string(),
            protocol: key.protocol,
            protocol_port: key.port,
        };

        let lb = self.ctx.lb;
        let request = &request;
        let (lb_id, key_wanted) = (request.loadbalancer_id.as_str(), *key);
        let listener = self
            .create_or_adopt(
                "create listener",
                move || lb.create_listener(request),
                move || {
                    find_in_pages(
                        move |marker| async move { lb.list_listeners(lb_id, marker.as_deref()).await },
                        move |l: &Listener| {
                            l.is_managed()
                                && l.protocol == key_wanted.protocol
                                && l.port == key_wanted.port
                        },
                    )
                },
            )
            .await?;
        info!("Created listener {} ({})", listener.name, listener.id);
        self.created(ResourceKind::Listener, &listener.name);

        self.wait(&ResourceRef::listener(&listener.id)).await?;
        self.listener_ids.insert(*key, listener.id);
        Ok(())
    }

    async fn create_pool(&mut self, key: &ListenerKey) -> Result<()> {
        let wanted = self.wanted(key)?;
        let listener_id = self
            .listener_ids
            .get(key)
            .ok_or_else(|| Error::not_found(format!("listener {}", key)))?;
        let request = CreatePool {
            name: wanted.pool.name.clone(),
            listener_id: listener_id.clone(),
            protocol: key.protocol,
            lb_algorithm: wanted.pool.lb_method,
            session_persistence: wanted.pool.session_persistence,
        };

        let lb = self.ctx.lb;
        let request = &request;
        let (lb_id, listener_id) = (self.lb_id()?, request.listener_id.as_str());
        let pool = self
            .create_or_adopt(
                "create pool",
                move || lb.create_pool(request),
                move || {
                    find_in_pages(
                        move |marker| async move { lb.list_pools(lb_id, marker.as_deref()).await },
                        move |p: &Pool| p.listener_id.as_deref() == Some(listener_id),
                    )
                },
            )
            .await?;
        info!("Created pool {} ({})", pool.name, pool.id);
        self.created(ResourceKind::Pool, &pool.name);

        self.wait(&ResourceRef::pool(&pool.id)).await?;
        self.pool_ids.insert(*key, pool.id);
        Ok(())
    }

    async fn create_monitor(&mut self, key: &ListenerKey) -> Result<()> {
        let wanted = self.wanted(key)?;
        let Some(monitor) = &wanted.pool.monitor else {
            return Ok(());
        };
        let request = CreateHealthMonitor {
            name: monitor.name.clone(),
            pool_id: self.pool_id(key)?.to_string(),
            kind: monitor.kind,
            delay: monitor.delay,
            timeout: monitor.timeout,
            max_retries: monitor.max_retries,
        };

        let lb = self.ctx.lb;
        let request = &request;
        let lb_id = self.lb_id()?;
        let created = self
            .create_or_adopt(
                "create health monitor",
                move || lb.create_health_monitor(request),
                move || async move {
                    let pool = find_in_pages(
                        move |marker| async move { lb.list_pools(lb_id, marker.as_deref()).await },
                        move |p: &Pool| p.id == request.pool_id,
                    )
                    .await?;
                    Ok::<_, Error>(pool.and_then(|p| p.healthmonitor_id).map(|id| HealthMonitor {
                        id,
                        name: request.name.clone(),
                        pool_id: request.pool_id.clone(),
                        kind: request.kind,
                        provisioning_status: ProvisioningStatus::PendingCreate,
                    }))
                },
            )
            .await?;
        info!("Created health monitor {} ({})", created.name, created.id);
        self.created(ResourceKind::HealthMonitor, &created.name);

        self.wait(&ResourceRef::health_monitor(&created.id)).await
    }

    async fn add_member(&mut self, key: &ListenerKey, member: &DesiredMember) -> Result<()> {
        let pool_id = self.pool_id(key)?.to_string();
        let request = CreateMember {
            name: member.name.clone(),
            address: member.address,
            protocol_port: member.port,
            weight: member.weight,
            subnet_id: self.ctx.config.subnet_id.clone(),
        };

        let lb = self.ctx.lb;
        let (pool, request) = (pool_id.as_str(), &request);
        let created = self
            .create_or_adopt(
                "create member",
                move || lb.create_member(pool, request),
                move || {
                    find_in_pages(
                        move |marker| async move { lb.list_members(pool, marker.as_deref()).await },
                        move |m: &Member| {
                            m.address == request.address && m.port == request.protocol_port
                        },
                    )
                },
            )
            .await?;
        info!(
            "Added member {}:{} to pool {} of {}",
            created.address, created.port, pool_id, self.desired.lb_name
        );
        self.created(ResourceKind::Member, &format!("{}:{}", created.address, created.port));

        self.wait(&ResourceRef::member(&pool_id, &created.id)).await
    }

    async fn associate_floating_ip(&mut self) -> Result<()> {
        let floating_network_id = self
            .ctx
            .config
            .floating_network_id
            .as_deref()
            .ok_or_else(|| Error::validation("floating_network_id is required for external services"))?;
        let load_balancer = self
            .load_balancer
            .as_ref()
            .ok_or_else(|| Error::not_found(format!("load balancer {}", self.desired.lb_name)))?;
        let port_id = load_balancer.vip_port_id.as_deref().ok_or_else(|| {
            Error::address_unavailable(format!("{} has no virtual address port", load_balancer.name))
        })?;

        let network = self.ctx.network;
        let fip = self
            .create_or_adopt(
                "create floating IP",
                move || network.create_floating_ip(floating_network_id, port_id),
                move || async move {
                    let found = network.floating_ips_for_port(port_id).await?;
                    Ok::<_, Error>(found.into_iter().next())
                },
            )
            .await?;
        info!(
            "Associated floating IP {} with load balancer {}",
            fip.floating_ip_address, load_balancer.name
        );
        emit(
            self.ctx.events,
            ReconcileEvent::FloatingIpAssociated {
                load_balancer: self.desired.lb_name.clone(),
                address: fip.floating_ip_address,
            },
        );

        self.floating_ip = Some(fip);
        Ok(())
    }

    /// Deletes of something already gone count as done
    async fn finish_delete(&self, kind: ResourceKind, id: &str, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => info!("Deleted {} {} of {}", kind, id, self.desired.lb_name),
            Err(e) if e.is_not_found() => debug!("{} {} was already deleted", kind, id),
            Err(e) => return Err(e),
        }
        emit(
            self.ctx.events,
            ReconcileEvent::ResourceDeleted {
                load_balancer: self.desired.lb_name.clone(),
                kind,
                id: id.to_string(),
            },
        );

        let lb_id = self.lb_id()?.to_string();
        self.wait(&ResourceRef::load_balancer(lb_id)).await
    }

    async fn call<T, F, Fut>(&self, what: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.ctx.retry.run(what, self.ctx.deadline, op).await
    }

    /// Retry a create; after a transient failure, adopt what `lookup` finds
    /// instead of issuing the create again
    async fn create_or_adopt<T, C, CF, L, LF>(&self, what: &str, create: C, lookup: L) -> Result<T>
    where
        C: Fn() -> CF,
        CF: Future<Output = Result<T>>,
        L: Fn() -> LF,
        LF: Future<Output = Result<Option<T>>>,
    {
        let attempted = AtomicBool::new(false);
        let (attempted, create, lookup) = (&attempted, &create, &lookup);

        self.call(what, move || async move {
            if attempted.swap(true, Ordering::SeqCst)
                && let Some(existing) = lookup().await?
            {
                info!("Adopting the result of an earlier {} attempt", what);
                return Ok(existing);
            }
            create().await
        })
        .await
    }

    async fn wait(&self, resource: &ResourceRef) -> Result<()> {
        self.ctx.waiter.wait_active(resource, self.ctx.deadline).await
    }

    fn created(&self, kind: ResourceKind, name: &str) {
        emit(
            self.ctx.events,
            ReconcileEvent::ResourceCreated {
                load_balancer: self.desired.lb_name.clone(),
                kind,
                name: name.to_string(),
            },
        );
    }

    fn wanted(&self, key: &ListenerKey) -> Result<&'a DesiredListener> {
        self.desired
            .listener(key)
            .ok_or_else(|| Error::Other(format!("listener {} is not desired", key)))
    }

    fn lb_id(&self) -> Result<&str> {
        self.load_balancer
            .as_ref()
            .map(|lb| lb.id.as_str())
            .ok_or_else(|| Error::not_found(format!("load balancer {}", self.desired.lb_name)))
    }

    fn pool_id(&self, key: &ListenerKey) -> Result<&str> {
        self.pool_ids
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| Error::not_found(format!("pool {}", key)))
    }
}

/// First item of a marker-paginated listing that satisfies `wanted`
async fn find_in_pages<T, F, Fut>(mut list: F, wanted: impl Fn(&T) -> bool) -> Result<Option<T>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page<T>>>,
{
    let mut marker: Option<String> = None;

    loop {
        let page = list(marker.clone()).await?;
        if let Some(found) = page.items.into_iter().find(|item| wanted(item)) {
            return Ok(Some(found));
        }
        match page.next_marker {
            Some(next) if Some(&next) != marker.as_ref() => marker = Some(next),
            _ => return Ok(None),
        }
    }
}
