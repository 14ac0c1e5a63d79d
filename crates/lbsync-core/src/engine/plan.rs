//! Diff of desired against current state
//!
//! Produces the ordered list of provider operations that turns the current
//! snapshot into the desired graph. Pure; [`super::apply`] executes the steps.
//!
//! Ordering is part of the result: parents are created before children and
//! children are deleted before parents. Steps refer to not-yet-created
//! resources by [`ListenerKey`]; the applier resolves IDs as it goes.

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;

use crate::desired::{DesiredListener, DesiredMember, DesiredState, ListenerKey};
use crate::locator::{CurrentListener, CurrentPool, CurrentState};

/// Which parts of the graph a plan may touch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanScope {
    /// Everything: load balancer, listeners, pools, monitors, members, floating IP
    Full,
    /// Pool membership of listeners that already exist with a pool
    MembersOnly,
}

/// One provider operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Create the load balancer
    CreateLoadBalancer,
    /// Create the listener for `key`
    CreateListener { key: ListenerKey },
    /// Create the pool behind the listener for `key`
    CreatePool { key: ListenerKey },
    /// Create the health monitor of the pool for `key`
    CreateMonitor { key: ListenerKey },
    /// Add a member to the pool for `key`
    AddMember { key: ListenerKey, member: DesiredMember },
    /// Remove a member from a pool
    RemoveMember {
        key: ListenerKey,
        pool_id: String,
        member_id: String,
        address: IpAddr,
        port: u16,
    },
    /// Delete a health monitor
    DeleteMonitor { key: ListenerKey, monitor_id: String },
    /// Delete a pool
    DeletePool { key: ListenerKey, pool_id: String },
    /// Delete a listener
    DeleteListener { key: ListenerKey, listener_id: String },
    /// Allocate a floating IP and associate it with the virtual address port
    AssociateFloatingIp,
}

impl Step {
    /// Whether this step removes something
    pub fn is_delete(&self) -> bool {
        matches!(
            self,
            Step::RemoveMember { .. }
                | Step::DeleteMonitor { .. }
                | Step::DeletePool { .. }
                | Step::DeleteListener { .. }
        )
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::CreateLoadBalancer => write!(f, "create load balancer"),
            Step::CreateListener { key } => write!(f, "create listener {}", key),
            Step::CreatePool { key } => write!(f, "create pool {}", key),
            Step::CreateMonitor { key } => write!(f, "create health monitor {}", key),
            Step::AddMember { key, member } => {
                write!(f, "add member {}:{} to {}", member.address, member.port, key)
            }
            Step::RemoveMember {
                key, address, port, ..
            } => write!(f, "remove member {}:{} from {}", address, port, key),
            Step::DeleteMonitor { key, .. } => write!(f, "delete health monitor {}", key),
            Step::DeletePool { key, .. } => write!(f, "delete pool {}", key),
            Step::DeleteListener { key, .. } => write!(f, "delete listener {}", key),
            Step::AssociateFloatingIp => write!(f, "associate floating IP"),
        }
    }
}

/// Ordered provider operations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// Steps in execution order
    pub steps: Vec<Step>,
}

impl Plan {
    /// Nothing to do
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Number of creating steps
    pub fn creates(&self) -> usize {
        self.steps.iter().filter(|s| !s.is_delete()).count()
    }

    /// Number of deleting steps
    pub fn deletes(&self) -> usize {
        self.steps.iter().filter(|s| s.is_delete()).count()
    }
}

/// Compute the steps that converge `current` onto `desired`
pub fn plan(desired: &DesiredState, current: Option<&CurrentState>, scope: PlanScope) -> Plan {
    let mut steps = Vec::new();
    let full = scope == PlanScope::Full;

    if current.is_none() && full {
        steps.push(Step::CreateLoadBalancer);
    }

    // Listeners made outside lbsync may hold a port a desired listener needs,
    // so they go before any create.
    if let (Some(current), true) = (current, full) {
        for foreign in current.listeners.iter().filter(|l| !l.listener.is_managed()) {
            delete_listener_chain(foreign, &mut steps);
        }
    }

    for wanted in &desired.listeners {
        match current.and_then(|c| c.listener(&wanted.key)) {
            None if full => {
                steps.push(Step::CreateListener { key: wanted.key });
                create_pool_chain(wanted, &mut steps);
            }
            None => {}
            Some(existing) => match &existing.pool {
                None if full => create_pool_chain(wanted, &mut steps),
                None => {}
                Some(pool) => {
                    if full && wanted.pool.monitor.is_some() && pool.pool.healthmonitor_id.is_none()
                    {
                        steps.push(Step::CreateMonitor { key: wanted.key });
                    }
                    diff_members(wanted, pool, &mut steps);
                }
            },
        }
    }

    if let (Some(current), true) = (current, full) {
        for stale in &current.listeners {
            if let Some(key) = stale.managed_key()
                && desired.listener(&key).is_none()
            {
                delete_listener_chain(stale, &mut steps);
            }
        }
    }

    let has_floating_ip = current.is_some_and(|c| c.floating_ip.is_some());
    if full && desired.external && !has_floating_ip {
        steps.push(Step::AssociateFloatingIp);
    }

    Plan { steps }
}

fn create_pool_chain(wanted: &DesiredListener, steps: &mut Vec<Step>) {
    steps.push(Step::CreatePool { key: wanted.key });
    if wanted.pool.monitor.is_some() {
        steps.push(Step::CreateMonitor { key: wanted.key });
    }
    for member in &wanted.pool.members {
        steps.push(Step::AddMember {
            key: wanted.key,
            member: member.clone(),
        });
    }
}

/// Members are identified by (address, port); anything else is ignored
fn diff_members(wanted: &DesiredListener, current: &CurrentPool, steps: &mut Vec<Step>) {
    let desired: HashSet<(IpAddr, u16)> = wanted
        .pool
        .members
        .iter()
        .map(|m| (m.address, m.port))
        .collect();
    let existing: HashSet<(IpAddr, u16)> = current
        .members
        .iter()
        .map(|m| (m.address, m.port))
        .collect();

    for member in &wanted.pool.members {
        if !existing.contains(&(member.address, member.port)) {
            steps.push(Step::AddMember {
                key: wanted.key,
                member: member.clone(),
            });
        }
    }

    let mut kept = HashSet::new();
    for member in &current.members {
        let identity = (member.address, member.port);
        // Duplicates are removed too so (address, port) stays unique in the pool.
        if !desired.contains(&identity) || !kept.insert(identity) {
            steps.push(Step::RemoveMember {
                key: wanted.key,
                pool_id: current.pool.id.clone(),
                member_id: member.id.clone(),
                address: member.address,
                port: member.port,
            });
        }
    }
}

fn delete_listener_chain(stale: &CurrentListener, steps: &mut Vec<Step>) {
    let key = stale.key();
    if let Some(pool) = &stale.pool {
        for member in &pool.members {
            steps.push(Step::RemoveMember {
                key,
                pool_id: pool.pool.id.clone(),
                member_id: member.id.clone(),
                address: member.address,
                port: member.port,
            });
        }
        if let Some(monitor_id) = &pool.pool.healthmonitor_id {
            steps.push(Step::DeleteMonitor {
                key,
                monitor_id: monitor_id.clone(),
            });
        }
        steps.push(Step::DeletePool {
            key,
            pool_id: pool.pool.id.clone(),
        });
    }
    steps.push(Step::DeleteListener {
        key,
        listener_id: stale.listener.id.clone(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconcilerConfig;
    use crate::desired;
    use crate::model::{Node, Protocol, ServiceDescription, ServicePortSpec};
    use crate::traits::{
        FloatingIp, LbMethod, Listener, LoadBalancer, Member, Pool, ProvisioningStatus,
    };

    const TCP_80: ListenerKey = ListenerKey {
        protocol: Protocol::Tcp,
        port: 80,
    };
    const UDP_53: ListenerKey = ListenerKey {
        protocol: Protocol::Udp,
        port: 53,
    };

    fn ports() -> Vec<ServicePortSpec> {
        vec![
            ServicePortSpec::new("port1", Protocol::Tcp, 80, 8080, 31111),
            ServicePortSpec::new("dns", Protocol::Udp, 53, 9053, 32053),
        ]
    }

    fn desired_for(ports: Vec<ServicePortSpec>, nodes: &[Node]) -> DesiredState {
        let service = ServiceDescription::new("test-namespace", "test-loadbalancer", ports);
        desired::build(&service, nodes, &ReconcilerConfig::new("subnet")).unwrap()
    }

    fn node(addr: &str) -> Node {
        Node::ready(addr, addr.parse().unwrap())
    }

    fn member(id: &str, addr: &str, port: u16) -> Member {
        Member {
            id: id.to_string(),
            name: addr.to_string(),
            address: addr.parse().unwrap(),
            port,
            weight: 1,
            provisioning_status: ProvisioningStatus::Active,
        }
    }

    fn listener(key: ListenerKey, members: Vec<Member>, with_monitor: bool) -> CurrentListener {
        let id = format!("{}-{}", key.protocol.as_str().to_lowercase(), key.port);
        CurrentListener {
            listener: Listener {
                id: format!("listener-{}", id),
                name: format!("listener_{}", id),
                protocol: key.protocol,
                port: key.port,
                provisioning_status: ProvisioningStatus::Active,
                application_protocol: None,
            },
            pool: Some(CurrentPool {
                pool: Pool {
                    id: format!("pool-{}", id),
                    name: format!("pool_{}", id),
                    listener_id: Some(format!("listener-{}", id)),
                    lb_method: LbMethod::RoundRobin,
                    session_persistence: None,
                    healthmonitor_id: with_monitor.then(|| format!("monitor-{}", id)),
                    provisioning_status: ProvisioningStatus::Active,
                },
                members,
            }),
        }
    }

    fn current(listeners: Vec<CurrentListener>, with_fip: bool) -> CurrentState {
        CurrentState {
            load_balancer: LoadBalancer {
                id: "lb-1".to_string(),
                name: "lb".to_string(),
                description: String::new(),
                provisioning_status: ProvisioningStatus::Active,
                vip_address: Some("10.0.0.5".parse().unwrap()),
                vip_port_id: Some("port-1".to_string()),
            },
            listeners,
            floating_ip: with_fip.then(|| FloatingIp {
                id: "fip-1".to_string(),
                floating_ip_address: "172.24.4.10".parse().unwrap(),
                port_id: Some("port-1".to_string()),
                floating_network_id: "public".to_string(),
            }),
        }
    }

    fn converged() -> CurrentState {
        current(
            vec![
                listener(TCP_80, vec![member("m1", "10.250.240.1", 31111)], true),
                listener(UDP_53, vec![member("m2", "10.250.240.1", 32053)], true),
            ],
            true,
        )
    }

    #[test]
    fn fresh_service_creates_everything_parent_first() {
        let desired = desired_for(ports(), &[node("10.250.240.1")]);
        let plan = plan(&desired, None, PlanScope::Full);

        assert_eq!(plan.steps[0], Step::CreateLoadBalancer);
        assert_eq!(plan.steps[1], Step::CreateListener { key: TCP_80 });
        assert_eq!(plan.steps[2], Step::CreatePool { key: TCP_80 });
        assert_eq!(plan.steps[3], Step::CreateMonitor { key: TCP_80 });
        assert!(matches!(plan.steps[4], Step::AddMember { key: TCP_80, .. }));
        assert_eq!(plan.steps[5], Step::CreateListener { key: UDP_53 });
        assert_eq!(plan.steps.last(), Some(&Step::AssociateFloatingIp));
        assert_eq!(plan.deletes(), 0);
    }

    #[test]
    fn converged_state_needs_no_steps() {
        let desired = desired_for(ports(), &[node("10.250.240.1")]);
        assert!(plan(&desired, Some(&converged()), PlanScope::Full).is_empty());
    }

    #[test]
    fn removed_port_deletes_child_first_and_leaves_others() {
        let desired = desired_for(ports()[..1].to_vec(), &[node("10.250.240.1")]);
        let plan = plan(&desired, Some(&converged()), PlanScope::Full);

        assert_eq!(
            plan.steps,
            vec![
                Step::RemoveMember {
                    key: UDP_53,
                    pool_id: "pool-udp-53".to_string(),
                    member_id: "m2".to_string(),
                    address: "10.250.240.1".parse().unwrap(),
                    port: 32053,
                },
                Step::DeleteMonitor {
                    key: UDP_53,
                    monitor_id: "monitor-udp-53".to_string()
                },
                Step::DeletePool {
                    key: UDP_53,
                    pool_id: "pool-udp-53".to_string()
                },
                Step::DeleteListener {
                    key: UDP_53,
                    listener_id: "listener-udp-53".to_string()
                },
            ]
        );
    }

    #[test]
    fn membership_change_only_touches_members() {
        let desired = desired_for(ports(), &[node("10.250.240.2")]);
        let plan = plan(&desired, Some(&converged()), PlanScope::Full);

        assert_eq!(plan.creates(), 2);
        assert_eq!(plan.deletes(), 2);
        assert!(plan.steps.iter().all(|s| matches!(
            s,
            Step::AddMember { .. } | Step::RemoveMember { .. }
        )));
    }

    #[test]
    fn duplicate_members_are_pruned() {
        let desired = desired_for(ports()[..1].to_vec(), &[node("10.250.240.1")]);
        let state = current(
            vec![listener(
                TCP_80,
                vec![
                    member("m1", "10.250.240.1", 31111),
                    member("m1-dup", "10.250.240.1", 31111),
                ],
                true,
            )],
            true,
        );

        let plan = plan(&desired, Some(&state), PlanScope::Full);
        assert_eq!(plan.steps.len(), 1);
        assert!(matches!(&plan.steps[0], Step::RemoveMember { member_id, .. } if member_id == "m1-dup"));
    }

    #[test]
    fn listener_without_pool_is_completed() {
        let desired = desired_for(ports()[..1].to_vec(), &[node("10.250.240.1")]);
        let mut half = listener(TCP_80, Vec::new(), false);
        half.pool = None;

        let plan = plan(&desired, Some(&current(vec![half], true)), PlanScope::Full);
        assert_eq!(plan.steps[0], Step::CreatePool { key: TCP_80 });
        assert_eq!(plan.steps[1], Step::CreateMonitor { key: TCP_80 });
        assert!(matches!(plan.steps[2], Step::AddMember { .. }));
    }

    #[test]
    fn application_protocol_listener_never_matches() {
        let desired = desired_for(ports()[..1].to_vec(), &[node("10.250.240.1")]);
        let mut http = listener(TCP_80, vec![member("m1", "10.250.240.1", 31111)], false);
        http.listener.application_protocol = Some("HTTP".to_string());

        let plan = plan(&desired, Some(&current(vec![http], true)), PlanScope::Full);

        assert!(matches!(&plan.steps[0], Step::RemoveMember { member_id, .. } if member_id == "m1"));
        assert_eq!(
            plan.steps[1],
            Step::DeletePool {
                key: TCP_80,
                pool_id: "pool-tcp-80".to_string()
            }
        );
        assert_eq!(
            plan.steps[2],
            Step::DeleteListener {
                key: TCP_80,
                listener_id: "listener-tcp-80".to_string()
            }
        );
        assert_eq!(plan.steps[3], Step::CreateListener { key: TCP_80 });
    }

    #[test]
    fn floating_ip_is_sticky() {
        let mut desired = desired_for(ports(), &[node("10.250.240.1")]);
        desired.external = false;

        let plan = plan(&desired, Some(&converged()), PlanScope::Full);
        assert!(plan.is_empty());
    }

    #[test]
    fn members_only_scope_never_touches_structure() {
        let desired = desired_for(ports()[..1].to_vec(), &[node("10.250.240.2")]);
        let mut state = converged();
        state.floating_ip = None;

        let plan = plan(&desired, Some(&state), PlanScope::MembersOnly);
        assert!(plan.steps.iter().all(|s| matches!(
            s,
            Step::AddMember { key: TCP_80, .. } | Step::RemoveMember { key: TCP_80, .. }
        )));
        assert_eq!(plan.steps.len(), 2);
    }
}
