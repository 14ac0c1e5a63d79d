//! Input and output types of a reconciliation
//!
//! These are plain data handed over by the orchestrator (service and node
//! descriptions) and the status value handed back. Provider-side resource
//! types live next to the client traits in [`crate::traits`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Transport protocol of a service port
///
/// `Sctp` is representable so that service descriptions carrying it can be
/// parsed, but the desired-state builder rejects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    /// TCP
    Tcp,
    /// UDP
    Udp,
    /// SCTP (not balanced by the provider)
    Sctp,
}

impl Protocol {
    /// Wire name used by the provider API
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Sctp => "SCTP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TCP" => Ok(Protocol::Tcp),
            "UDP" => Ok(Protocol::Udp),
            "SCTP" => Ok(Protocol::Sctp),
            other => Err(crate::Error::validation(format!(
                "unsupported protocol: {}",
                other
            ))),
        }
    }
}

/// Session affinity requested by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SessionAffinity {
    /// No affinity
    #[default]
    None,
    /// Pin clients to a backend by source address
    #[serde(rename = "ClientIP")]
    ClientIp,
}

/// One exposed port of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePortSpec {
    /// Port name (informational)
    #[serde(default)]
    pub name: String,
    /// Transport protocol
    pub protocol: Protocol,
    /// Port the load balancer listens on
    pub port: u16,
    /// Container port behind the node port (never used for members)
    pub target_port: u16,
    /// Port every node exposes the service on; members receive traffic here
    pub node_port: u16,
}

impl ServicePortSpec {
    /// Create a service port
    pub fn new(
        name: impl Into<String>,
        protocol: Protocol,
        port: u16,
        target_port: u16,
        node_port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            protocol,
            port,
            target_port,
            node_port,
        }
    }
}

/// Logical service to expose through a load balancer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescription {
    /// Namespace of the service
    pub namespace: String,
    /// Name of the service
    pub name: String,
    /// Exposed ports
    pub ports: Vec<ServicePortSpec>,
    /// Whether an externally routable (floating) address is requested
    #[serde(default = "default_external")]
    pub external: bool,
    /// Session affinity policy
    #[serde(default)]
    pub session_affinity: SessionAffinity,
}

fn default_external() -> bool {
    true
}

impl ServiceDescription {
    /// Create an externally reachable service without session affinity
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        ports: Vec<ServicePortSpec>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ports,
            external: true,
            session_affinity: SessionAffinity::None,
        }
    }

    /// Request or drop external reachability
    pub fn with_external(mut self, external: bool) -> Self {
        self.external = external;
        self
    }

    /// Set the session affinity
    pub fn with_session_affinity(mut self, affinity: SessionAffinity) -> Self {
        self.session_affinity = affinity;
        self
    }

    /// `namespace/name`, used in logs and descriptions
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Backend node candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Node name, used as the member name
    pub name: String,
    /// First internal address of the node, if it reported one
    #[serde(default)]
    pub internal_address: Option<IpAddr>,
    /// Whether the node's Ready condition is true
    #[serde(default)]
    pub ready: bool,
}

impl Node {
    /// A ready node with an internal address
    pub fn ready(name: impl Into<String>, address: IpAddr) -> Self {
        Self {
            name: name.into(),
            internal_address: Some(address),
            ready: true,
        }
    }

    /// Whether this node may receive traffic
    pub fn is_eligible(&self) -> bool {
        self.ready && self.internal_address.is_some()
    }
}

/// Result of a successful reconciliation
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerStatus {
    /// Reachable addresses, preferred first
    pub ingress: Vec<IpAddr>,
    /// Pools that ended up without any member
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub empty_pools: Vec<String>,
}

impl LoadBalancerStatus {
    /// The address to report as the service's external endpoint
    pub fn external_address(&self) -> Option<IpAddr> {
        self.ingress.first().copied()
    }

    /// Whether any pool has no members
    pub fn is_degraded(&self) -> bool {
        !self.empty_pools.is_empty()
    }
}
