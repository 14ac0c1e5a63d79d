//! Configuration types for the reconciler
//!
//! This module defines all configuration structures used throughout the crate.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::traits::LbMethod;

/// Main reconciler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Provider configuration
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Cluster name, part of every load balancer's stable identity
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    /// Subnet the virtual address and the pool members attach to
    pub subnet_id: String,

    /// Network of the virtual address (optional, derived from the subnet otherwise)
    #[serde(default)]
    pub network_id: Option<String>,

    /// Network to allocate floating addresses from (required for external services)
    #[serde(default)]
    pub floating_network_id: Option<String>,

    /// Load-balancer API dialect; only "v2" is supported
    #[serde(default = "default_provider_version")]
    pub provider_version: String,

    /// Whether the provider is Octavia (UDP listeners are Octavia-only)
    #[serde(default = "default_use_octavia")]
    pub use_octavia: bool,

    /// Balancing algorithm for pools of services without session affinity
    #[serde(default)]
    pub lb_method: LbMethod,

    /// Health monitor settings
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Engine settings
    #[serde(default)]
    pub engine: EngineConfig,
}

impl ReconcilerConfig {
    /// Create a configuration with defaults for the given subnet
    pub fn new(subnet_id: impl Into<String>) -> Self {
        Self {
            provider: ProviderConfig::default(),
            cluster_name: default_cluster_name(),
            subnet_id: subnet_id.into(),
            network_id: None,
            floating_network_id: None,
            provider_version: default_provider_version(),
            use_octavia: default_use_octavia(),
            lb_method: LbMethod::default(),
            monitor: MonitorConfig::default(),
            engine: EngineConfig::default(),
        }
    }

    /// Set the floating network
    pub fn with_floating_network(mut self, network_id: impl Into<String>) -> Self {
        self.floating_network_id = Some(network_id.into());
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.subnet_id.trim().is_empty() {
            return Err(crate::Error::config("subnet_id is required"));
        }

        if self.cluster_name.trim().is_empty() {
            return Err(crate::Error::config("cluster_name cannot be empty"));
        }

        if self.provider_version != "v2" {
            return Err(crate::Error::config(format!(
                "unsupported provider_version '{}', only 'v2' is supported",
                self.provider_version
            )));
        }

        if let Some(ref id) = self.floating_network_id
            && id.trim().is_empty()
        {
            return Err(crate::Error::config("floating_network_id cannot be empty when set"));
        }

        self.provider.validate()?;
        self.monitor.validate()?;
        self.engine.validate()?;

        Ok(())
    }
}

fn default_cluster_name() -> String {
    "kubernetes".to_string()
}

fn default_provider_version() -> String {
    "v2".to_string()
}

fn default_use_octavia() -> bool {
    true
}

/// Provider configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderConfig {
    /// OpenStack Octavia (load balancing) + Neutron (floating IPs)
    Octavia {
        /// Octavia endpoint, e.g. `https://lb.example.com:9876`
        lb_endpoint: String,
        /// Neutron endpoint, e.g. `https://network.example.com:9696`
        network_endpoint: String,
        /// Pre-issued Keystone token
        auth_token: String,
    },

    /// In-process simulated provider (dry runs and tests)
    #[default]
    Memory,

    /// Custom provider
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl ProviderConfig {
    /// Validate the provider configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            ProviderConfig::Octavia {
                lb_endpoint,
                network_endpoint,
                auth_token,
            } => {
                if lb_endpoint.is_empty() || network_endpoint.is_empty() {
                    return Err(crate::Error::config("Octavia and Neutron endpoints are required"));
                }
                if auth_token.is_empty() {
                    return Err(crate::Error::config("Octavia auth token cannot be empty"));
                }
                Ok(())
            }
            ProviderConfig::Custom { factory, config } => {
                if factory.is_empty() {
                    return Err(crate::Error::config("Custom provider factory cannot be empty"));
                }
                if config.is_null() {
                    return Err(crate::Error::config("Custom provider config cannot be null"));
                }
                Ok(())
            }
            ProviderConfig::Memory => Ok(()),
        }
    }

    /// Get the provider type name
    pub fn type_name(&self) -> &str {
        match self {
            ProviderConfig::Octavia { .. } => "octavia",
            ProviderConfig::Memory => "memory",
            ProviderConfig::Custom { factory, .. } => factory,
        }
    }
}

/// Health monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Whether to create a health monitor for every pool
    #[serde(default = "default_monitor_enabled")]
    pub enabled: bool,

    /// Seconds between probes
    #[serde(default = "default_monitor_delay_secs")]
    pub delay_secs: u32,

    /// Seconds before a probe times out (must not exceed the delay)
    #[serde(default = "default_monitor_timeout_secs")]
    pub timeout_secs: u32,

    /// Failed probes before a member is marked down
    #[serde(default = "default_monitor_max_retries")]
    pub max_retries: u32,
}

impl MonitorConfig {
    /// Validate the monitor configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if !self.enabled {
            return Ok(());
        }
        if self.delay_secs == 0 || self.timeout_secs == 0 {
            return Err(crate::Error::config("monitor delay and timeout must be > 0"));
        }
        if self.timeout_secs > self.delay_secs {
            return Err(crate::Error::config(
                "monitor timeout_secs must not exceed delay_secs",
            ));
        }
        if !(1..=10).contains(&self.max_retries) {
            return Err(crate::Error::config("monitor max_retries must be between 1 and 10"));
        }
        Ok(())
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: default_monitor_enabled(),
            delay_secs: default_monitor_delay_secs(),
            timeout_secs: default_monitor_timeout_secs(),
            max_retries: default_monitor_max_retries(),
        }
    }
}

fn default_monitor_enabled() -> bool {
    true
}

fn default_monitor_delay_secs() -> u32 {
    5
}

fn default_monitor_timeout_secs() -> u32 {
    3
}

fn default_monitor_max_retries() -> u32 {
    1
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Wall-clock budget for one whole reconciliation (in seconds)
    ///
    /// Shared by every wait and retry of the operation; it is not reset per
    /// resource.
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,

    /// Delay before the second status poll (in milliseconds)
    #[serde(default = "default_poll_initial_ms")]
    pub poll_initial_ms: u64,

    /// Upper bound of the poll delay (in milliseconds)
    #[serde(default = "default_poll_max_ms")]
    pub poll_max_ms: u64,

    /// Growth factor of the poll delay
    #[serde(default = "default_poll_factor")]
    pub poll_factor: f64,

    /// Maximum retry attempts for a transient provider error
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Delay before the first retry (in milliseconds), doubled per attempt
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,

    /// Upper bound of the retry delay (in milliseconds)
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Capacity of the reconcile event channel
    ///
    /// When full, new events are dropped (with a warning log).
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

/// Longest accepted reconciliation budget (one day)
pub const MAX_DEADLINE_SECS: u64 = 86_400;

impl EngineConfig {
    /// Validate the engine configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.deadline_secs == 0 || self.deadline_secs > MAX_DEADLINE_SECS {
            return Err(crate::Error::config(format!(
                "deadline_secs must be between 1 and {}",
                MAX_DEADLINE_SECS
            )));
        }
        let budget_ms = self.deadline_secs * 1000;
        if self.poll_initial_ms == 0 || self.poll_max_ms < self.poll_initial_ms {
            return Err(crate::Error::config(
                "poll_initial_ms must be > 0 and not exceed poll_max_ms",
            ));
        }
        if self.poll_max_ms > budget_ms {
            return Err(crate::Error::config(
                "poll_max_ms must not exceed the reconciliation deadline",
            ));
        }
        if !self.poll_factor.is_finite() || self.poll_factor < 1.0 {
            return Err(crate::Error::config("poll_factor must be >= 1.0"));
        }
        if self.retry_max_delay_ms < self.retry_initial_delay_ms {
            return Err(crate::Error::config(
                "retry_max_delay_ms must not be below retry_initial_delay_ms",
            ));
        }
        if self.retry_max_delay_ms > budget_ms {
            return Err(crate::Error::config(
                "retry_max_delay_ms must not exceed the reconciliation deadline",
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(crate::Error::config("event_channel_capacity must be > 0"));
        }
        Ok(())
    }

    /// Overall reconciliation budget
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    /// First poll delay
    pub fn poll_initial(&self) -> Duration {
        Duration::from_millis(self.poll_initial_ms)
    }

    /// Poll delay cap
    pub fn poll_max(&self) -> Duration {
        Duration::from_millis(self.poll_max_ms)
    }

    /// First retry delay
    pub fn retry_initial_delay(&self) -> Duration {
        Duration::from_millis(self.retry_initial_delay_ms)
    }

    /// Retry delay cap
    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            deadline_secs: default_deadline_secs(),
            poll_initial_ms: default_poll_initial_ms(),
            poll_max_ms: default_poll_max_ms(),
            poll_factor: default_poll_factor(),
            max_retries: default_max_retries(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

fn default_deadline_secs() -> u64 {
    600
}

fn default_poll_initial_ms() -> u64 {
    1000
}

fn default_poll_max_ms() -> u64 {
    10_000
}

fn default_poll_factor() -> f64 {
    1.2
}

fn default_max_retries() -> usize {
    3
}

fn default_retry_initial_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    8000
}

fn default_event_channel_capacity() -> usize {
    256
}
