// # Octavia v2 load-balancer client
//
// Maps `LoadBalancerClient` onto `/v2/lbaas/...`. One HTTP request per call;
// provisioning status is read back through plain GETs of the resource.
//
// Wire shapes differ from the engine's types in a few places (`protocol_port`
// vs `port`, pools pointing at listeners through a `listeners` array, session
// persistence as an object), so responses go through private `*Body` types.

use async_trait::async_trait;
use lbsync_core::model::Protocol;
use lbsync_core::traits::{
    CreateHealthMonitor, CreateListener, CreateLoadBalancer, CreateMember, CreatePool,
    HealthMonitor, LbMethod, Listener, LoadBalancer, LoadBalancerClient, Member, MonitorKind, Page,
    Pool, ProvisioningStatus, ResourceKind, ResourceRef, SessionPersistence,
};
use lbsync_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;

use crate::http::{ApiClient, Link, envelope, next_marker, unwrap_key};

const LBAAS: &str = "/v2/lbaas";

/// Octavia v2 client
///
/// Stateless apart from the HTTP connection pool; safe to share.
#[derive(Debug, Clone)]
pub struct OctaviaClient {
    api: ApiClient,
}

impl OctaviaClient {
    /// Create a client for the Octavia endpoint (e.g. `https://lb.example.com:9876`)
    pub fn new(endpoint: impl Into<String>, auth_token: impl Into<String>) -> Result<Self> {
        Ok(Self {
            api: ApiClient::new("octavia", endpoint, auth_token)?,
        })
    }

    /// Endpoint this client talks to
    pub fn endpoint(&self) -> &str {
        self.api.base_url()
    }

    async fn status_of(&self, path: &str, key: &str) -> Result<ProvisioningStatus> {
        let body: HashMap<String, StatusBody> = self.api.get(path, &[]).await?;
        Ok(unwrap_key(body, key)?.provisioning_status)
    }
}

fn paging<'a>(filter: (&'a str, &'a str), marker: Option<&'a str>) -> Vec<(&'a str, &'a str)> {
    let mut query = vec![filter];
    if let Some(marker) = marker {
        query.push(("marker", marker));
    }
    query
}

#[async_trait]
impl LoadBalancerClient for OctaviaClient {
    async fn find_load_balancers(&self, name: &str) -> Result<Vec<LoadBalancer>> {
        let path = format!("{}/loadbalancers", LBAAS);
        let mut found = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let query = paging(("name", name), marker.as_deref());
            let page: LoadBalancerPage = self.api.get(&path, &query).await?;
            found.extend(page.loadbalancers.into_iter().map(LoadBalancer::from));

            match next_marker(&page.loadbalancers_links) {
                Some(next) if Some(&next) != marker.as_ref() => marker = Some(next),
                Some(_) => {
                    tracing::warn!(name = %name, "Octavia returned a repeating marker, stopping");
                    break;
                }
                None => break,
            }
        }

        // The name filter is server-side; keep the check local as well.
        found.retain(|lb| lb.name == name);
        tracing::debug!(name = %name, matches = found.len(), "Octavia load balancer lookup");
        Ok(found)
    }

    async fn get_load_balancer(&self, id: &str) -> Result<LoadBalancer> {
        let path = format!("{}/loadbalancers/{}", LBAAS, id);
        let body: HashMap<String, LoadBalancerBody> = self.api.get(&path, &[]).await?;
        Ok(unwrap_key(body, "loadbalancer")?.into())
    }

    async fn create_load_balancer(&self, request: &CreateLoadBalancer) -> Result<LoadBalancer> {
        let path = format!("{}/loadbalancers", LBAAS);
        let body: HashMap<String, LoadBalancerBody> = self
            .api
            .post(&path, &envelope("loadbalancer", request)?)
            .await?;
        let lb: LoadBalancer = unwrap_key(body, "loadbalancer")?.into();
        tracing::info!(name = %lb.name, id = %lb.id, "Octavia accepted load balancer");
        Ok(lb)
    }

    async fn list_listeners(
        &self,
        loadbalancer_id: &str,
        marker: Option<&str>,
    ) -> Result<Page<Listener>> {
        let path = format!("{}/listeners", LBAAS);
        let query = paging(("loadbalancer_id", loadbalancer_id), marker);
        let page: ListenerPage = self.api.get(&path, &query).await?;

        Ok(Page {
            items: page.listeners.into_iter().map(Listener::from).collect(),
            next_marker: next_marker(&page.listeners_links),
        })
    }

    async fn create_listener(&self, request: &CreateListener) -> Result<Listener> {
        let path = format!("{}/listeners", LBAAS);
        let body: HashMap<String, ListenerBody> =
            self.api.post(&path, &envelope("listener", request)?).await?;
        Ok(unwrap_key(body, "listener")?.into())
    }

    async fn delete_listener(&self, id: &str) -> Result<()> {
        self.api.delete(&format!("{}/listeners/{}", LBAAS, id)).await
    }

    async fn list_pools(&self, loadbalancer_id: &str, marker: Option<&str>) -> Result<Page<Pool>> {
        let path = format!("{}/pools", LBAAS);
        let query = paging(("loadbalancer_id", loadbalancer_id), marker);
        let page: PoolPage = self.api.get(&path, &query).await?;

        Ok(Page {
            items: page.pools.into_iter().map(Pool::from).collect(),
            next_marker: next_marker(&page.pools_links),
        })
    }

    async fn create_pool(&self, request: &CreatePool) -> Result<Pool> {
        let path = format!("{}/pools", LBAAS);
        let wire = NewPool::from(request);
        let body: HashMap<String, PoolBody> = self.api.post(&path, &envelope("pool", &wire)?).await?;
        Ok(unwrap_key(body, "pool")?.into())
    }

    async fn delete_pool(&self, id: &str) -> Result<()> {
        self.api.delete(&format!("{}/pools/{}", LBAAS, id)).await
    }

    async fn list_members(&self, pool_id: &str, marker: Option<&str>) -> Result<Page<Member>> {
        let path = format!("{}/pools/{}/members", LBAAS, pool_id);
        let query: Vec<(&str, &str)> = marker.map(|m| ("marker", m)).into_iter().collect();
        let page: MemberPage = self.api.get(&path, &query).await?;

        Ok(Page {
            items: page.members.into_iter().map(Member::from).collect(),
            next_marker: next_marker(&page.members_links),
        })
    }

    async fn create_member(&self, pool_id: &str, request: &CreateMember) -> Result<Member> {
        let path = format!("{}/pools/{}/members", LBAAS, pool_id);
        let body: HashMap<String, MemberBody> =
            self.api.post(&path, &envelope("member", request)?).await?;
        Ok(unwrap_key(body, "member")?.into())
    }

    async fn delete_member(&self, pool_id: &str, member_id: &str) -> Result<()> {
        self.api
            .delete(&format!("{}/pools/{}/members/{}", LBAAS, pool_id, member_id))
            .await
    }

    async fn create_health_monitor(&self, request: &CreateHealthMonitor) -> Result<HealthMonitor> {
        let path = format!("{}/healthmonitors", LBAAS);
        let body: HashMap<String, HealthMonitorBody> = self
            .api
            .post(&path, &envelope("healthmonitor", request)?)
            .await?;
        Ok(unwrap_key(body, "healthmonitor")?.into_monitor(&request.pool_id))
    }

    async fn delete_health_monitor(&self, id: &str) -> Result<()> {
        self.api
            .delete(&format!("{}/healthmonitors/{}", LBAAS, id))
            .await
    }

    async fn provisioning_status(&self, resource: &ResourceRef) -> Result<ProvisioningStatus> {
        let id = &resource.id;
        match resource.kind {
            ResourceKind::LoadBalancer => {
                self.status_of(&format!("{}/loadbalancers/{}", LBAAS, id), "loadbalancer")
                    .await
            }
            ResourceKind::Listener => {
                self.status_of(&format!("{}/listeners/{}", LBAAS, id), "listener")
                    .await
            }
            ResourceKind::Pool => {
                self.status_of(&format!("{}/pools/{}", LBAAS, id), "pool").await
            }
            ResourceKind::HealthMonitor => {
                self.status_of(&format!("{}/healthmonitors/{}", LBAAS, id), "healthmonitor")
                    .await
            }
            ResourceKind::Member => {
                let pool_id = resource.pool_id.as_deref().ok_or_else(|| {
                    Error::Other(format!("{} has no parent pool", resource))
                })?;
                self.status_of(
                    &format!("{}/pools/{}/members/{}", LBAAS, pool_id, id),
                    "member",
                )
                .await
            }
        }
    }

    fn provider_name(&self) -> &'static str {
        "octavia"
    }
}

// Wire types

#[derive(Debug, Deserialize)]
struct StatusBody {
    provisioning_status: ProvisioningStatus,
}

#[derive(Debug, Deserialize)]
struct IdRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct LoadBalancerPage {
    loadbalancers: Vec<LoadBalancerBody>,
    #[serde(default)]
    loadbalancers_links: Vec<Link>,
}

#[derive(Debug, Deserialize)]
struct LoadBalancerBody {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    provisioning_status: ProvisioningStatus,
    #[serde(default)]
    vip_address: Option<String>,
    #[serde(default)]
    vip_port_id: Option<String>,
}

impl From<LoadBalancerBody> for LoadBalancer {
    fn from(body: LoadBalancerBody) -> Self {
        // Octavia reports "" rather than null before the VIP is allocated.
        let vip_address = body
            .vip_address
            .as_deref()
            .and_then(|addr| addr.parse::<IpAddr>().ok());
        let vip_port_id = body.vip_port_id.filter(|id| !id.is_empty());

        LoadBalancer {
            id: body.id,
            name: body.name.unwrap_or_default(),
            description: body.description.unwrap_or_default(),
            provisioning_status: body.provisioning_status,
            vip_address,
            vip_port_id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListenerPage {
    listeners: Vec<ListenerBody>,
    #[serde(default)]
    listeners_links: Vec<Link>,
}

#[derive(Debug, Deserialize)]
struct ListenerBody {
    id: String,
    #[serde(default)]
    name: Option<String>,
    protocol: String,
    protocol_port: u16,
    provisioning_status: ProvisioningStatus,
}

impl From<ListenerBody> for Listener {
    fn from(body: ListenerBody) -> Self {
        // HTTP, HTTPS, TERMINATED_HTTPS, PROXY and friends all ride on TCP.
        let (protocol, application_protocol) = match body.protocol.parse::<Protocol>() {
            Ok(protocol) => (protocol, None),
            Err(_) => {
                tracing::debug!(
                    listener = %body.id,
                    protocol = %body.protocol,
                    "Octavia listener terminates an application protocol"
                );
                (Protocol::Tcp, Some(body.protocol))
            }
        };

        Listener {
            id: body.id,
            name: body.name.unwrap_or_default(),
            protocol,
            port: body.protocol_port,
            provisioning_status: body.provisioning_status,
            application_protocol,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistenceBody {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct PoolPage {
    pools: Vec<PoolBody>,
    #[serde(default)]
    pools_links: Vec<Link>,
}

#[derive(Debug, Deserialize)]
struct PoolBody {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    listeners: Vec<IdRef>,
    lb_algorithm: LbMethod,
    #[serde(default)]
    session_persistence: Option<PersistenceBody>,
    #[serde(default)]
    healthmonitor_id: Option<String>,
    provisioning_status: ProvisioningStatus,
}

impl From<PoolBody> for Pool {
    fn from(body: PoolBody) -> Self {
        let session_persistence = body
            .session_persistence
            .filter(|p| p.kind == "SOURCE_IP")
            .map(|_| SessionPersistence::SourceIp);

        Pool {
            id: body.id,
            name: body.name.unwrap_or_default(),
            listener_id: body.listeners.into_iter().next().map(|l| l.id),
            lb_method: body.lb_algorithm,
            session_persistence,
            healthmonitor_id: body.healthmonitor_id.filter(|id| !id.is_empty()),
            provisioning_status: body.provisioning_status,
        }
    }
}

#[derive(Debug, Serialize)]
struct NewPool<'a> {
    name: &'a str,
    listener_id: &'a str,
    protocol: Protocol,
    lb_algorithm: LbMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_persistence: Option<PersistenceBody>,
}

impl<'a> From<&'a CreatePool> for NewPool<'a> {
    fn from(request: &'a CreatePool) -> Self {
        let session_persistence = request.session_persistence.map(|p| match p {
            SessionPersistence::SourceIp => PersistenceBody {
                kind: "SOURCE_IP".to_string(),
            },
        });

        NewPool {
            name: &request.name,
            listener_id: &request.listener_id,
            protocol: request.protocol,
            lb_algorithm: request.lb_algorithm,
            session_persistence,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MemberPage {
    members: Vec<MemberBody>,
    #[serde(default)]
    members_links: Vec<Link>,
}

fn default_weight() -> u16 {
    1
}

#[derive(Debug, Deserialize)]
struct MemberBody {
    id: String,
    #[serde(default)]
    name: Option<String>,
    address: IpAddr,
    protocol_port: u16,
    #[serde(default = "default_weight")]
    weight: u16,
    provisioning_status: ProvisioningStatus,
}

impl From<MemberBody> for Member {
    fn from(body: MemberBody) -> Self {
        Member {
            id: body.id,
            name: body.name.unwrap_or_default(),
            address: body.address,
            port: body.protocol_port,
            weight: body.weight,
            provisioning_status: body.provisioning_status,
        }
    }
}

#[derive(Debug, Deserialize)]
struct HealthMonitorBody {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    pools: Vec<IdRef>,
    #[serde(rename = "type")]
    kind: MonitorKind,
    provisioning_status: ProvisioningStatus,
}

impl HealthMonitorBody {
    fn into_monitor(self, requested_pool: &str) -> HealthMonitor {
        let pool_id = self
            .pools
            .into_iter()
            .next()
            .map(|p| p.id)
            .unwrap_or_else(|| requested_pool.to_string());

        HealthMonitor {
            id: self.id,
            name: self.name.unwrap_or_default(),
            pool_id,
            kind: self.kind,
            provisioning_status: self.provisioning_status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_load_balancer_without_vip() {
        let body: LoadBalancerBody = serde_json::from_value(json!({
            "id": "lb-1",
            "name": "kube_service_c_default_echo",
            "description": null,
            "provisioning_status": "PENDING_CREATE",
            "vip_address": "",
            "vip_port_id": ""
        }))
        .unwrap();

        let lb = LoadBalancer::from(body);
        assert_eq!(lb.provisioning_status, ProvisioningStatus::PendingCreate);
        assert_eq!(lb.vip_address, None);
        assert_eq!(lb.vip_port_id, None);
        assert_eq!(lb.description, "");
    }

    #[test]
    fn test_load_balancer_with_vip() {
        let body: LoadBalancerBody = serde_json::from_value(json!({
            "id": "lb-1",
            "name": "lb",
            "provisioning_status": "ACTIVE",
            "operating_status": "ONLINE",
            "vip_address": "10.0.0.7",
            "vip_port_id": "port-1"
        }))
        .unwrap();

        let lb = LoadBalancer::from(body);
        assert_eq!(lb.vip_address, Some("10.0.0.7".parse().unwrap()));
        assert_eq!(lb.vip_port_id.as_deref(), Some("port-1"));
    }

    #[test]
    fn test_listener_page() {
        let page: ListenerPage = serde_json::from_value(json!({
            "listeners": [
                {
                    "id": "l-1",
                    "name": "listener_tcp_80_lb",
                    "protocol": "TCP",
                    "protocol_port": 80,
                    "provisioning_status": "ACTIVE",
                    "loadbalancers": [{"id": "lb-1"}]
                },
                {
                    "id": "l-2",
                    "protocol": "TERMINATED_HTTPS",
                    "protocol_port": 443,
                    "provisioning_status": "ACTIVE"
                }
            ],
            "listeners_links": [{
                "rel": "next",
                "href": "https://lb.example.com:9876/v2/lbaas/listeners?marker=l-2"
            }]
        }))
        .unwrap();

        assert_eq!(next_marker(&page.listeners_links).as_deref(), Some("l-2"));
        let listeners: Vec<Listener> = page.listeners.into_iter().map(Listener::from).collect();

        assert_eq!(listeners[0].protocol, Protocol::Tcp);
        assert_eq!(listeners[0].port, 80);
        assert!(listeners[0].is_managed());

        assert_eq!(listeners[1].port, 443);
        assert_eq!(listeners[1].application_protocol.as_deref(), Some("TERMINATED_HTTPS"));
        assert!(!listeners[1].is_managed());
    }

    #[test]
    fn test_pool_body() {
        let body: PoolBody = serde_json::from_value(json!({
            "id": "pool-1",
            "name": "pool_tcp_80_lb",
            "listeners": [{"id": "l-1"}],
            "loadbalancers": [{"id": "lb-1"}],
            "lb_algorithm": "SOURCE_IP",
            "session_persistence": {"type": "SOURCE_IP", "cookie_name": null},
            "healthmonitor_id": "hm-1",
            "provisioning_status": "ACTIVE"
        }))
        .unwrap();

        let pool = Pool::from(body);
        assert_eq!(pool.listener_id.as_deref(), Some("l-1"));
        assert_eq!(pool.lb_method, LbMethod::SourceIp);
        assert_eq!(pool.session_persistence, Some(SessionPersistence::SourceIp));
        assert_eq!(pool.healthmonitor_id.as_deref(), Some("hm-1"));
    }

    #[test]
    fn test_pool_request_wraps_persistence() {
        let request = CreatePool {
            name: "pool_tcp_80_lb".to_string(),
            listener_id: "l-1".to_string(),
            protocol: Protocol::Tcp,
            lb_algorithm: LbMethod::SourceIp,
            session_persistence: Some(SessionPersistence::SourceIp),
        };

        let body = envelope("pool", &NewPool::from(&request)).unwrap();
        assert_eq!(body["pool"]["session_persistence"]["type"], "SOURCE_IP");
        assert_eq!(body["pool"]["lb_algorithm"], "SOURCE_IP");
        assert_eq!(body["pool"]["protocol"], "TCP");
    }

    #[test]
    fn test_member_defaults_weight() {
        let body: MemberBody = serde_json::from_value(json!({
            "id": "m-1",
            "name": "node-1",
            "address": "10.250.240.1",
            "protocol_port": 31111,
            "provisioning_status": "PENDING_CREATE"
        }))
        .unwrap();

        let member = Member::from(body);
        assert_eq!(member.weight, 1);
        assert_eq!(member.port, 31111);
    }

    #[test]
    fn test_monitor_falls_back_to_requested_pool() {
        let body: HealthMonitorBody = serde_json::from_value(json!({
            "id": "hm-1",
            "type": "UDP-CONNECT",
            "provisioning_status": "PENDING_CREATE"
        }))
        .unwrap();

        let monitor = body.into_monitor("pool-9");
        assert_eq!(monitor.pool_id, "pool-9");
        assert_eq!(monitor.kind, MonitorKind::UdpConnect);
    }

    #[test]
    fn test_paging_query() {
        assert_eq!(paging(("name", "lb"), None), vec![("name", "lb")]);
        assert_eq!(
            paging(("loadbalancer_id", "lb-1"), Some("m")),
            vec![("loadbalancer_id", "lb-1"), ("marker", "m")]
        );
    }

    #[test]
    fn test_provider_name() {
        let client = OctaviaClient::new("https://lb.example.com:9876", "token").unwrap();
        assert_eq!(client.provider_name(), "octavia");
    }
}
