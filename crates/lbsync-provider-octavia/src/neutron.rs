// # Neutron v2.0 network client
//
// Floating IPs only: look up the addresses bound to a port, and allocate a
// new one directly bound to a port. Neutron applies the association before
// answering, so there is no provisioning status to poll.

use async_trait::async_trait;
use lbsync_core::Result;
use lbsync_core::traits::{FloatingIp, NetworkClient};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::http::{ApiClient, Link, envelope, next_marker, unwrap_key};

const FLOATING_IPS: &str = "/v2.0/floatingips";

/// Neutron v2.0 client
#[derive(Debug, Clone)]
pub struct NeutronClient {
    api: ApiClient,
}

impl NeutronClient {
    /// Create a client for the Neutron endpoint (e.g. `https://network.example.com:9696`)
    pub fn new(endpoint: impl Into<String>, auth_token: impl Into<String>) -> Result<Self> {
        Ok(Self {
            api: ApiClient::new("neutron", endpoint, auth_token)?,
        })
    }

    /// Endpoint this client talks to
    pub fn endpoint(&self) -> &str {
        self.api.base_url()
    }
}

#[derive(Debug, Deserialize)]
struct FloatingIpPage {
    floatingips: Vec<FloatingIp>,
    #[serde(default)]
    floatingips_links: Vec<Link>,
}

#[derive(Debug, Serialize)]
struct NewFloatingIp<'a> {
    floating_network_id: &'a str,
    port_id: &'a str,
}

#[async_trait]
impl NetworkClient for NeutronClient {
    async fn floating_ips_for_port(&self, port_id: &str) -> Result<Vec<FloatingIp>> {
        let mut found = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut query = vec![("port_id", port_id)];
            if let Some(ref marker) = marker {
                query.push(("marker", marker.as_str()));
            }

            let page: FloatingIpPage = self.api.get(FLOATING_IPS, &query).await?;
            found.extend(page.floatingips);

            match next_marker(&page.floatingips_links) {
                Some(next) if Some(&next) != marker.as_ref() => marker = Some(next),
                Some(_) => {
                    tracing::warn!(port_id = %port_id, "Neutron returned a repeating marker, stopping");
                    break;
                }
                None => break,
            }
        }

        found.retain(|fip| fip.port_id.as_deref() == Some(port_id));
        Ok(found)
    }

    async fn create_floating_ip(
        &self,
        floating_network_id: &str,
        port_id: &str,
    ) -> Result<FloatingIp> {
        let request = NewFloatingIp {
            floating_network_id,
            port_id,
        };
        let body: HashMap<String, FloatingIp> = self
            .api
            .post(FLOATING_IPS, &envelope("floatingip", &request)?)
            .await?;
        let fip = unwrap_key(body, "floatingip")?;

        tracing::info!(
            address = %fip.floating_ip_address,
            port_id = %port_id,
            "Neutron allocated floating IP"
        );
        Ok(fip)
    }

    fn provider_name(&self) -> &'static str {
        "neutron"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_floating_ip_page() {
        let page: FloatingIpPage = serde_json::from_value(json!({
            "floatingips": [{
                "id": "fip-1",
                "floating_ip_address": "172.24.4.10",
                "fixed_ip_address": "10.0.0.7",
                "port_id": "port-1",
                "floating_network_id": "public",
                "status": "ACTIVE"
            }]
        }))
        .unwrap();

        assert!(page.floatingips_links.is_empty());
        assert_eq!(page.floatingips[0].port_id.as_deref(), Some("port-1"));
        assert_eq!(
            page.floatingips[0].floating_ip_address,
            "172.24.4.10".parse::<std::net::IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_create_request_shape() {
        let request = NewFloatingIp {
            floating_network_id: "public",
            port_id: "port-1",
        };
        let body = envelope("floatingip", &request).unwrap();
        assert_eq!(
            body,
            json!({"floatingip": {"floating_network_id": "public", "port_id": "port-1"}})
        );
    }

    #[test]
    fn test_provider_name() {
        let client = NeutronClient::new("https://network.example.com:9696", "token").unwrap();
        assert_eq!(client.provider_name(), "neutron");
        assert_eq!(client.endpoint(), "https://network.example.com:9696");
    }
}
