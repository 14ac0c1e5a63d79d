//! Reconciliation engine
//!
//! The [`Reconciler`] is responsible for:
//! - Building the desired resource graph of a service
//! - Reading the current graph from the provider
//! - Planning and applying the difference, waiting after every mutation
//! - Resolving the address reported back to the caller
//!
//! ## Architecture
//!
//! ```text
//! ServiceDescription + nodes
//!            │
//!            ▼
//!   ┌─────────────────┐      ┌───────────┐
//!   │ desired::build  │      │  Locator  │◀── LoadBalancerClient / NetworkClient
//!   └─────────────────┘      └───────────┘
//!            │                     │
//!            └──────────┬──────────┘
//!                       ▼
//!               ┌──────────────┐
//!               │  plan::plan  │
//!               └──────────────┘
//!                       │ steps
//!                       ▼
//!               ┌──────────────┐      ┌──────────┐
//!               │   Applier    │─────▶│  Waiter  │
//!               └──────────────┘      └──────────┘
//!                       │
//!                       ▼
//!              address::resolve ──▶ LoadBalancerStatus
//! ```
//!
//! One reconciliation runs against a single [`Deadline`] taken before the
//! per-identity lock is acquired, so time spent queued behind another
//! reconciliation of the same service counts against the budget.

pub mod apply;
pub mod plan;
pub mod retry;

use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use self::apply::{Applier, ApplyContext};
use self::plan::{PlanScope, Step};
use self::retry::RetryPolicy;
use crate::address;
use crate::config::ReconcilerConfig;
use crate::desired::{self, DesiredState};
use crate::error::{Error, Result};
use crate::locator::{CurrentState, Locator};
use crate::locks::{IdentityGuard, LockRegistry};
use crate::model::{LoadBalancerStatus, Node, ServiceDescription};
use crate::naming;
use crate::traits::{LoadBalancerClient, NetworkClient, ProvisioningStatus, ResourceKind, ResourceRef};
use crate::waiter::{Deadline, Waiter};

/// Events emitted by the Reconciler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileEvent {
    /// A reconciliation started
    Started {
        load_balancer: String,
        scope: PlanScope,
    },

    /// A resource was created and became ACTIVE
    ResourceCreated {
        load_balancer: String,
        kind: ResourceKind,
        name: String,
    },

    /// A resource was deleted
    ResourceDeleted {
        load_balancer: String,
        kind: ResourceKind,
        id: String,
    },

    /// Pool membership changed
    MembersChanged {
        load_balancer: String,
        added: usize,
        removed: usize,
    },

    /// A floating IP was associated with the virtual address port
    FloatingIpAssociated {
        load_balancer: String,
        address: IpAddr,
    },

    /// The load balancer matches the desired state
    Converged {
        load_balancer: String,
        address: Option<IpAddr>,
        steps: usize,
    },

    /// A reconciliation failed
    Failed {
        load_balancer: String,
        error: String,
    },
}

/// Send an event, dropping it with a warning if the channel is full
pub(crate) fn emit(tx: &mpsc::Sender<ReconcileEvent>, event: ReconcileEvent) {
    if let Err(mpsc::error::TrySendError::Full(event)) = tx.try_send(event) {
        warn!(
            "Event channel full, dropping event {:?}. Consider increasing event_channel_capacity.",
            event
        );
    }
}

/// Converges provider load balancers onto service descriptions
///
/// The reconciler holds no per-service state: every call re-reads the
/// provider. It can be shared between tasks behind an [`Arc`]; calls for the
/// same load balancer identity are serialized by the [`LockRegistry`], calls
/// for different identities proceed independently.
///
/// ## Lifecycle
///
/// 1. Create with [`Reconciler::new()`], keep the event receiver
/// 2. Call [`Reconciler::ensure_load_balancer()`] whenever a service or its
///    node set changes, [`Reconciler::update_load_balancer()`] when only
///    nodes changed
pub struct Reconciler {
    lb: Arc<dyn LoadBalancerClient>,
    network: Arc<dyn NetworkClient>,
    config: ReconcilerConfig,
    locks: Arc<LockRegistry>,
    waiter: Waiter,
    retry: RetryPolicy,
    event_tx: mpsc::Sender<ReconcileEvent>,
}

impl Reconciler {
    /// Create a new reconciler
    ///
    /// # Returns
    ///
    /// A tuple of (reconciler, event_receiver) where event_receiver yields
    /// reconciliation events
    pub fn new(
        lb: Arc<dyn LoadBalancerClient>,
        network: Arc<dyn NetworkClient>,
        config: ReconcilerConfig,
    ) -> Result<(Self, mpsc::Receiver<ReconcileEvent>)> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.engine.event_channel_capacity);
        let waiter = Waiter::new(Arc::clone(&lb), &config.engine);
        let retry = RetryPolicy::from_config(&config.engine);

        let reconciler = Self {
            lb,
            network,
            config,
            locks: Arc::new(LockRegistry::new()),
            waiter,
            retry,
            event_tx: tx,
        };

        Ok((reconciler, rx))
    }

    /// Share a lock registry with other reconcilers of the same process
    pub fn with_locks(mut self, locks: Arc<LockRegistry>) -> Self {
        self.locks = locks;
        self
    }

    /// The configuration in use
    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Stable identity of the load balancer backing `service`
    pub fn load_balancer_name(&self, service: &ServiceDescription) -> String {
        naming::load_balancer_name(&self.config.cluster_name, &service.namespace, &service.name)
    }

    /// Converge the provider onto `service` balanced over `nodes`
    ///
    /// Creates whatever is missing, removes listeners for ports the service
    /// no longer exposes and brings every pool's membership in line with the
    /// eligible nodes. Safe to call repeatedly; a converged load balancer
    /// causes no mutating calls.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] for a malformed service or a provider rejection
    /// - [`Error::ResourceConflict`] when the identity is ambiguous
    /// - [`Error::Provisioning`] / [`Error::ProvisioningTimeout`] while waiting
    /// - [`Error::AddressUnavailable`] when the result has no address
    ///
    /// Provider failures come wrapped in [`Error::Step`]; partial state is
    /// left in place for the next call.
    pub async fn ensure_load_balancer(
        &self,
        service: &ServiceDescription,
        nodes: &[Node],
    ) -> Result<LoadBalancerStatus> {
        self.reconcile(service, nodes, PlanScope::Full).await
    }

    /// Bring pool membership of an existing load balancer in line with `nodes`
    ///
    /// Listeners, pools and monitors are left alone.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when the load balancer does not exist, otherwise as
    /// [`Reconciler::ensure_load_balancer()`].
    pub async fn update_load_balancer(
        &self,
        service: &ServiceDescription,
        nodes: &[Node],
    ) -> Result<LoadBalancerStatus> {
        self.reconcile(service, nodes, PlanScope::MembersOnly).await
    }

    /// Current status of the load balancer backing `service`, if it exists
    ///
    /// Read-only; takes no lock. A load balancer still provisioning without
    /// an address yet reports an empty ingress.
    pub async fn get_load_balancer(
        &self,
        service: &ServiceDescription,
    ) -> Result<Option<LoadBalancerStatus>> {
        let deadline = Deadline::after(self.config.engine.deadline());
        let name = self.load_balancer_name(service);
        let description = naming::load_balancer_description(
            &self.config.cluster_name,
            &service.namespace,
            &service.name,
        );

        let current = self.locator(deadline).locate(&name, &description).await?;
        match current {
            Some(current) => {
                let status = address::observe(
                    &current.load_balancer,
                    current.floating_ip.as_ref(),
                    current.empty_pools(),
                )?;
                Ok(Some(status))
            }
            None => Ok(None),
        }
    }

    async fn reconcile(
        &self,
        service: &ServiceDescription,
        nodes: &[Node],
        scope: PlanScope,
    ) -> Result<LoadBalancerStatus> {
        let deadline = Deadline::after(self.config.engine.deadline());
        let desired = desired::build(service, nodes, &self.config)?;

        if scope == PlanScope::Full && desired.external && self.config.floating_network_id.is_none()
        {
            return Err(Error::validation(format!(
                "service {} is external but no floating_network_id is configured",
                service.key()
            )));
        }

        let _guard = self.lock(&desired.lb_name, deadline).await?;

        emit(
            &self.event_tx,
            ReconcileEvent::Started {
                load_balancer: desired.lb_name.clone(),
                scope,
            },
        );

        match self.converge(&desired, scope, deadline).await {
            Ok(status) => {
                info!(
                    "Load balancer {} converged, address: {:?}",
                    desired.lb_name,
                    status.external_address()
                );
                Ok(status)
            }
            Err(e) => {
                error!("Reconciliation of {} failed: {}", desired.lb_name, e);
                emit(
                    &self.event_tx,
                    ReconcileEvent::Failed {
                        load_balancer: desired.lb_name.clone(),
                        error: e.to_string(),
                    },
                );
                Err(e)
            }
        }
    }

    async fn lock(&self, identity: &str, deadline: Deadline) -> Result<IdentityGuard> {
        if let Some(guard) = self.locks.try_acquire(identity) {
            return Ok(guard);
        }

        debug!("Waiting for another reconciliation of {}", identity);
        tokio::time::timeout_at(deadline.instant(), self.locks.acquire(identity))
            .await
            .map_err(|_| Error::timeout(format!("lock on {}", identity)))
    }

    async fn converge(
        &self,
        desired: &DesiredState,
        scope: PlanScope,
        deadline: Deadline,
    ) -> Result<LoadBalancerStatus> {
        let mut current = self
            .locator(deadline)
            .locate(&desired.lb_name, &desired.lb_description)
            .await?;

        if current.is_none() && scope == PlanScope::MembersOnly {
            return Err(Error::not_found(format!("load balancer {}", desired.lb_name)));
        }

        // A load balancer left transitioning by an earlier call must settle
        // before anything can be changed; re-read it afterwards.
        if let Some(existing) = &current
            && existing.load_balancer.provisioning_status != ProvisioningStatus::Active
        {
            self.settle(existing, deadline).await?;
            current = self
                .locator(deadline)
                .locate(&desired.lb_name, &desired.lb_description)
                .await?;
        }

        let plan = plan::plan(desired, current.as_ref(), scope);
        info!(
            "Plan for {}: {} step(s), {} create(s), {} delete(s)",
            desired.lb_name,
            plan.steps.len(),
            plan.creates(),
            plan.deletes()
        );

        let ctx = ApplyContext {
            lb: self.lb.as_ref(),
            network: self.network.as_ref(),
            waiter: &self.waiter,
            retry: &self.retry,
            config: &self.config,
            events: &self.event_tx,
            deadline,
        };
        let applied = Applier::new(ctx, desired, current.as_ref()).apply(&plan).await?;

        let (added, removed) = member_changes(&plan.steps);
        if added + removed > 0 {
            emit(
                &self.event_tx,
                ReconcileEvent::MembersChanged {
                    load_balancer: desired.lb_name.clone(),
                    added,
                    removed,
                },
            );
        }

        let empty_pools = match scope {
            PlanScope::Full => desired.empty_pools(),
            PlanScope::MembersOnly => current
                .as_ref()
                .map(|c| members_only_empty_pools(desired, c))
                .unwrap_or_default(),
        };
        let status = address::resolve(
            &applied.load_balancer,
            applied.floating_ip.as_ref(),
            empty_pools,
        )?;

        emit(
            &self.event_tx,
            ReconcileEvent::Converged {
                load_balancer: desired.lb_name.clone(),
                address: status.external_address(),
                steps: plan.steps.len(),
            },
        );

        Ok(status)
    }

    async fn settle(&self, current: &CurrentState, deadline: Deadline) -> Result<()> {
        let lb = &current.load_balancer;
        match lb.provisioning_status {
            ProvisioningStatus::Error => Err(Error::provisioning(format!(
                "load balancer {} ({})",
                lb.name, lb.id
            ))),
            status => {
                info!("Load balancer {} is {}, waiting for it to settle", lb.name, status);
                self.waiter
                    .wait_active(&ResourceRef::load_balancer(&lb.id), deadline)
                    .await
                    .map_err(|e| e.in_step("wait for load balancer", &lb.name))
            }
        }
    }

    fn locator(&self, deadline: Deadline) -> Locator<'_> {
        Locator::new(self.lb.as_ref(), self.network.as_ref(), &self.retry, deadline)
    }
}

fn member_changes(steps: &[Step]) -> (usize, usize) {
    steps.iter().fold((0, 0), |(added, removed), step| match step {
        Step::AddMember { .. } => (added + 1, removed),
        Step::RemoveMember { .. } => (added, removed + 1),
        _ => (added, removed),
    })
}

/// Empty pools after a membership-only pass: only listeners that exist count
fn members_only_empty_pools(desired: &DesiredState, current: &CurrentState) -> Vec<String> {
    current
        .listeners
        .iter()
        .filter_map(|existing| {
            let pool = existing.pool.as_ref()?;
            match existing.managed_key().and_then(|key| desired.listener(&key)) {
                Some(wanted) if wanted.pool.members.is_empty() => Some(pool.pool.name.clone()),
                Some(_) => None,
                None if pool.members.is_empty() => Some(pool.pool.name.clone()),
                None => None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_changes_counts_member_steps_only() {
        let key = crate::desired::ListenerKey::new(crate::model::Protocol::Tcp, 80);
        let steps = vec![
            Step::CreateListener { key },
            Step::AddMember {
                key,
                member: crate::desired::DesiredMember {
                    name: "node-1".to_string(),
                    address: "10.0.0.1".parse().unwrap(),
                    port: 30080,
                    weight: 1,
                },
            },
            Step::RemoveMember {
                key,
                pool_id: "pool-1".to_string(),
                member_id: "member-1".to_string(),
                address: "10.0.0.2".parse().unwrap(),
                port: 30080,
            },
        ];

        assert_eq!(member_changes(&steps), (1, 1));
    }

    #[tokio::test]
    async fn full_channel_drops_events() {
        let (tx, mut rx) = mpsc::channel(1);
        let event = |n: &str| ReconcileEvent::Failed {
            load_balancer: n.to_string(),
            error: "boom".to_string(),
        };

        emit(&tx, event("a"));
        emit(&tx, event("b"));

        assert_eq!(rx.recv().await, Some(event("a")));
        assert!(rx.try_recv().is_err());
    }
}
