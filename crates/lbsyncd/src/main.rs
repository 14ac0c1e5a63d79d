// # lbsyncd - one-shot load balancer reconciliation
//
// This binary is a THIN integration layer:
// - DO NOT add reconciliation, retry or provider logic here
// - All of that lives in lbsync-core and the provider crates
// - Configuration is via environment variables ONLY
//
// lbsyncd is responsible for:
// 1. Reading configuration from environment variables
// 2. Loading the service and node description file
// 3. Registering providers and building the reconciler
// 4. Running one operation and printing the resulting status as JSON
//
// ## Configuration
//
// ### Provider
// - `LBSYNC_PROVIDER_TYPE`: Provider type (octavia, memory; default octavia)
// - `LBSYNC_LB_ENDPOINT`: Octavia endpoint (octavia)
// - `LBSYNC_NETWORK_ENDPOINT`: Neutron endpoint (octavia)
// - `LBSYNC_AUTH_TOKEN`: Keystone token (octavia)
//
// ### Placement
// - `LBSYNC_SUBNET_ID`: Subnet for the virtual address and members (required)
// - `LBSYNC_NETWORK_ID`: Network of the virtual address (optional)
// - `LBSYNC_FLOATING_NETWORK_ID`: Network for floating addresses (external services)
// - `LBSYNC_CLUSTER_NAME`: Cluster name, part of every identity (default kubernetes)
//
// ### Run
// - `LBSYNC_SERVICE_FILE`: JSON file `{"service": {...}, "nodes": [...]}` (required)
// - `LBSYNC_OPERATION`: ensure, update or get (default ensure)
// - `LBSYNC_DEADLINE_SECS`: Budget for the whole operation (default 600)
// - `LBSYNC_LOG_LEVEL`: trace, debug, info, warn, error (default info)
//
// ## Example
//
// ```bash
// export LBSYNC_LB_ENDPOINT=https://lb.example.com:9876
// export LBSYNC_NETWORK_ENDPOINT=https://network.example.com:9696
// export LBSYNC_AUTH_TOKEN=$(openstack token issue -f value -c id)
// export LBSYNC_SUBNET_ID=5f0e9c8a-...
// export LBSYNC_FLOATING_NETWORK_ID=public
// export LBSYNC_SERVICE_FILE=./echo.json
//
// lbsyncd > status.json
// ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use lbsync_core::config::{MAX_DEADLINE_SECS, ProviderConfig, ReconcilerConfig};
use lbsync_core::model::{LoadBalancerStatus, Node, ServiceDescription};
use lbsync_core::{ProviderRegistry, Reconciler};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

/// Exit codes for different termination scenarios
///
/// - 0: The operation succeeded
/// - 1: Configuration or startup error
/// - 2: The reconciliation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LbsyncExitCode {
    /// Success
    Success = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Reconciliation error
    ReconcileError = 2,
}

impl From<LbsyncExitCode> for ExitCode {
    fn from(code: LbsyncExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Which reconciler operation to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Ensure,
    Update,
    Get,
}

impl Operation {
    fn parse(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "ensure" => Ok(Operation::Ensure),
            "update" => Ok(Operation::Update),
            "get" => Ok(Operation::Get),
            other => anyhow::bail!(
                "LBSYNC_OPERATION '{}' is not valid. Valid operations: ensure, update, get",
                other
            ),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Operation::Ensure => "ensure",
            Operation::Update => "update",
            Operation::Get => "get",
        }
    }
}

/// Application configuration
struct Config {
    provider_type: String,
    lb_endpoint: Option<String>,
    network_endpoint: Option<String>,
    auth_token: Option<String>,
    subnet_id: String,
    network_id: Option<String>,
    floating_network_id: Option<String>,
    cluster_name: Option<String>,
    service_file: PathBuf,
    operation: Operation,
    deadline_secs: Option<u64>,
    log_level: String,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("provider_type", &self.provider_type)
            .field("lb_endpoint", &self.lb_endpoint)
            .field("network_endpoint", &self.network_endpoint)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<REDACTED>"))
            .field("subnet_id", &self.subnet_id)
            .field("floating_network_id", &self.floating_network_id)
            .field("service_file", &self.service_file)
            .field("operation", &self.operation)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through `lookup`, which returns a variable's value
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let deadline_secs = match var("LBSYNC_DEADLINE_SECS") {
            Some(raw) => Some(raw.trim().parse::<u64>().with_context(|| {
                format!("LBSYNC_DEADLINE_SECS must be a number of seconds. Got: {}", raw)
            })?),
            None => None,
        };

        Ok(Self {
            provider_type: var("LBSYNC_PROVIDER_TYPE").unwrap_or_else(|| "octavia".to_string()),
            lb_endpoint: var("LBSYNC_LB_ENDPOINT"),
            network_endpoint: var("LBSYNC_NETWORK_ENDPOINT"),
            auth_token: var("LBSYNC_AUTH_TOKEN"),
            subnet_id: var("LBSYNC_SUBNET_ID").context(
                "LBSYNC_SUBNET_ID is required. Set it via: export LBSYNC_SUBNET_ID=<subnet id>",
            )?,
            network_id: var("LBSYNC_NETWORK_ID"),
            floating_network_id: var("LBSYNC_FLOATING_NETWORK_ID"),
            cluster_name: var("LBSYNC_CLUSTER_NAME"),
            service_file: var("LBSYNC_SERVICE_FILE")
                .map(PathBuf::from)
                .context("LBSYNC_SERVICE_FILE is required")?,
            operation: Operation::parse(
                &var("LBSYNC_OPERATION").unwrap_or_else(|| "ensure".to_string()),
            )?,
            deadline_secs,
            log_level: var("LBSYNC_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        match self.provider_type.as_str() {
            "octavia" => {
                if self.lb_endpoint.is_none() || self.network_endpoint.is_none() {
                    anyhow::bail!(
                        "LBSYNC_LB_ENDPOINT and LBSYNC_NETWORK_ENDPOINT are required \
                        when LBSYNC_PROVIDER_TYPE=octavia"
                    );
                }
                for endpoint in [&self.lb_endpoint, &self.network_endpoint].into_iter().flatten() {
                    if !endpoint.starts_with("https://") && !endpoint.starts_with("http://") {
                        anyhow::bail!("Endpoint must use HTTP or HTTPS scheme. Got: {}", endpoint);
                    }
                }
                if self.auth_token.is_none() {
                    anyhow::bail!(
                        "LBSYNC_AUTH_TOKEN is required when LBSYNC_PROVIDER_TYPE=octavia"
                    );
                }
            }
            "memory" => {}
            other => anyhow::bail!(
                "LBSYNC_PROVIDER_TYPE '{}' is not supported. Supported providers: octavia, memory",
                other
            ),
        }

        if let Some(secs) = self.deadline_secs
            && (secs == 0 || secs > MAX_DEADLINE_SECS)
        {
            anyhow::bail!(
                "LBSYNC_DEADLINE_SECS must be between 1 and {}. Got: {}",
                MAX_DEADLINE_SECS,
                secs
            );
        }

        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "LBSYNC_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }

        Ok(())
    }

    /// Translate into the reconciler's configuration
    fn reconciler_config(&self) -> Result<ReconcilerConfig> {
        let mut config = ReconcilerConfig::new(self.subnet_id.clone());

        config.provider = match self.provider_type.as_str() {
            "memory" => ProviderConfig::Memory,
            _ => ProviderConfig::Octavia {
                lb_endpoint: self.lb_endpoint.clone().unwrap_or_default(),
                network_endpoint: self.network_endpoint.clone().unwrap_or_default(),
                auth_token: self.auth_token.clone().unwrap_or_default(),
            },
        };
        config.network_id = self.network_id.clone();
        config.floating_network_id = self.floating_network_id.clone();
        if let Some(ref cluster_name) = self.cluster_name {
            config.cluster_name = cluster_name.clone();
        }
        if let Some(deadline_secs) = self.deadline_secs {
            config.engine.deadline_secs = deadline_secs;
        }

        config.validate()?;
        Ok(config)
    }

    fn log_level(&self) -> Level {
        match self.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }
}

/// Contents of `LBSYNC_SERVICE_FILE`
#[derive(Debug, Deserialize)]
struct ServiceFile {
    service: ServiceDescription,
    #[serde(default)]
    nodes: Vec<Node>,
}

fn load_service_file(path: &Path) -> Result<ServiceFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read service file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse service file {}", path.display()))
}

/// What lbsyncd prints on stdout
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Report {
    load_balancer: String,
    operation: &'static str,
    reconciled_at: DateTime<Utc>,
    /// `None` when `get` finds no load balancer
    status: Option<LoadBalancerStatus>,
}

fn main() -> ExitCode {
    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return LbsyncExitCode::ConfigError.into();
        }
    };

    // Validate configuration
    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {:#}", e);
        return LbsyncExitCode::ConfigError.into();
    }

    // Logs go to stderr; stdout carries the report
    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.log_level())
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return LbsyncExitCode::ConfigError.into();
    }

    info!("Starting lbsyncd");

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return LbsyncExitCode::ConfigError.into();
        }
    };

    let code = rt.block_on(run(config));
    code.into()
}

/// Set up the reconciler and run the configured operation
async fn run(config: Config) -> LbsyncExitCode {
    let (reconciler, service_file) = match setup(&config) {
        Ok(ready) => ready,
        Err(e) => {
            error!("Startup failed: {:#}", e);
            return LbsyncExitCode::ConfigError;
        }
    };

    match execute(&reconciler, config.operation, &service_file).await {
        Ok(report) => match serde_json::to_string_pretty(&report) {
            Ok(json) => {
                println!("{}", json);
                LbsyncExitCode::Success
            }
            Err(e) => {
                error!("Failed to serialize report: {}", e);
                LbsyncExitCode::ReconcileError
            }
        },
        Err(e) => {
            error!("Reconciliation failed: {}", e);
            LbsyncExitCode::ReconcileError
        }
    }
}

fn setup(config: &Config) -> Result<(Reconciler, ServiceFile)> {
    let reconciler_config = config.reconciler_config()?;
    let service_file = load_service_file(&config.service_file)?;

    let registry = ProviderRegistry::with_builtin();

    #[cfg(feature = "octavia")]
    {
        info!("Registering Octavia provider");
        lbsync_provider_octavia::register(&registry);
    }

    info!(
        provider = %reconciler_config.provider.type_name(),
        registered = ?registry.list(),
        "Creating provider clients"
    );
    let clients = registry.create(&reconciler_config.provider)?;

    let (reconciler, mut events) = Reconciler::new(clients.lb, clients.network, reconciler_config)?;

    // Surface progress in the log while the operation runs.
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            info!(?event, "Reconcile event");
        }
    });

    Ok((reconciler, service_file))
}

async fn execute(
    reconciler: &Reconciler,
    operation: Operation,
    file: &ServiceFile,
) -> lbsync_core::Result<Report> {
    let load_balancer = reconciler.load_balancer_name(&file.service);
    info!(
        load_balancer = %load_balancer,
        operation = operation.as_str(),
        nodes = file.nodes.len(),
        "Running reconciliation"
    );

    let status = match operation {
        Operation::Ensure => Some(
            reconciler
                .ensure_load_balancer(&file.service, &file.nodes)
                .await?,
        ),
        Operation::Update => Some(
            reconciler
                .update_load_balancer(&file.service, &file.nodes)
                .await?,
        ),
        Operation::Get => reconciler.get_load_balancer(&file.service).await?,
    };

    Ok(Report {
        load_balancer,
        operation: operation.as_str(),
        reconciled_at: Utc::now(),
        status,
    })
}
