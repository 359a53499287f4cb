// # ovnbgpd - OVN BGP Route Exposure Daemon
//
// This daemon is a thin integration layer. Exposure decisions, kernel
// reconciliation and the route-update bridge all live in ovnbgp-core;
// this binary only wires them together.
//
// The ovnbgpd daemon is responsible for:
// 1. Reading configuration from environment variables
// 2. Initializing logging and the runtime
// 3. Registering backends and creating the collaborators
// 4. Running the dispatcher and, when enabled, the FPM bridge
//
// ## Configuration
//
// ### Agent
// - `OVNBGP_CHASSIS`: Name of this chassis (required)
// - `OVNBGP_BGP_NIC`: Dummy device carrying exposed addresses
// - `OVNBGP_BGP_VRF`: VRF the dummy device is enslaved to
// - `OVNBGP_BGP_VRF_TABLE_ID`: Routing table backing the VRF
// - `OVNBGP_BRIDGE_MAPPINGS`: `network:bridge:table,...`
// - `OVNBGP_EXPOSE_TENANT_NETWORKS`: Expose tenant subnets (true/false)
// - `OVNBGP_EXPOSE_IPV6_GUA_TENANT_NETWORKS`: Expose IPv6 GUA tenant subnets only
// - `OVNBGP_RECONCILE_INTERVAL`: Seconds between resyncs (0 disables)
//
// ### FPM bridge
// - `OVNBGP_FPM_ENABLED`: Run the bridge server (true/false)
// - `OVNBGP_FPM_PORT`: Loopback port to listen on
// - `OVNBGP_FPM_FORMAT`: `structured` or `netlink`
// - `OVNBGP_FPM_ROUTER`: Logical router receiving static routes
//
// ### Backends
// - `OVNBGP_KERNEL_BACKEND`: `netlink` or `memory`
// - `OVNBGP_SOUTHBOUND_BACKEND`: Southbound database backend
// - `OVNBGP_NORTHBOUND_BACKEND`: Northbound database backend
//
// ### Logging
// - `OVNBGP_LOG_LEVEL`: trace, debug, info, warn, error
//
// ## Example
//
// ```bash
// export OVNBGP_CHASSIS=compute-0
// export OVNBGP_BRIDGE_MAPPINGS=public:br-ex:200
// export OVNBGP_EXPOSE_TENANT_NETWORKS=true
//
// ovnbgpd
// ```

use anyhow::{Context, Result};
use ovnbgp_core::config::{AgentConfig, BackendConfig, BridgeMapping, FpmFormat};
use ovnbgp_core::registry::BackendRegistry;
use ovnbgp_core::traits::InterfaceAddresses;
use ovnbgp_core::watcher::{Dispatcher, EventRegistry};
use ovnbgp_core::{ExposureController, FpmServer, RouteBridge};
use std::env;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{Level, debug, error, info};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OvnbgpExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure, including the first sync
    ConfigError = 1,
    /// Runtime error (unexpected failure)
    RuntimeError = 2,
}

impl From<OvnbgpExitCode> for ExitCode {
    fn from(code: OvnbgpExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Why the daemon stopped early
#[derive(Debug)]
enum DaemonError {
    Startup(anyhow::Error),
    Runtime(anyhow::Error),
}

impl DaemonError {
    fn exit_code(&self) -> OvnbgpExitCode {
        match self {
            DaemonError::Startup(_) => OvnbgpExitCode::ConfigError,
            DaemonError::Runtime(_) => OvnbgpExitCode::RuntimeError,
        }
    }
}

impl std::fmt::Display for DaemonError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaemonError::Startup(e) => write!(f, "startup failed: {:#}", e),
            DaemonError::Runtime(e) => write!(f, "runtime failure: {:#}", e),
        }
    }
}

/// Application configuration
struct Config {
    agent: AgentConfig,
    log_level: String,
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("{} must be true or false. Got: {}", name, other),
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("{} must be a number. Got: {}", name, value))
}

/// `network:bridge:table` entries separated by commas
fn parse_bridge_mappings(value: &str) -> Result<Vec<BridgeMapping>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let parts: Vec<&str> = entry.split(':').collect();
            let [network, bridge, table] = parts.as_slice() else {
                anyhow::bail!(
                    "OVNBGP_BRIDGE_MAPPINGS entry '{}' must be network:bridge:table",
                    entry
                );
            };
            Ok(BridgeMapping {
                network: network.to_string(),
                bridge: bridge.to_string(),
                table_id: parse_number("OVNBGP_BRIDGE_MAPPINGS table", table)?,
            })
        })
        .collect()
}

fn parse_backend(value: &str) -> BackendConfig {
    match value.trim() {
        "memory" => BackendConfig::Memory,
        "netlink" => BackendConfig::Netlink,
        other => BackendConfig::Custom {
            factory: other.to_string(),
            config: serde_json::Value::Null,
        },
    }
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let chassis = get("OVNBGP_CHASSIS").context(
            "OVNBGP_CHASSIS is required. Set it via: export OVNBGP_CHASSIS=$(hostname)",
        )?;
        let mut agent = AgentConfig::new(chassis);

        if let Some(nic) = get("OVNBGP_BGP_NIC") {
            agent.bgp.nic = nic;
        }
        if let Some(vrf) = get("OVNBGP_BGP_VRF") {
            agent.bgp.vrf = vrf;
        }
        if let Some(table) = get("OVNBGP_BGP_VRF_TABLE_ID") {
            agent.bgp.vrf_table_id = parse_number("OVNBGP_BGP_VRF_TABLE_ID", &table)?;
        }
        if let Some(mappings) = get("OVNBGP_BRIDGE_MAPPINGS") {
            agent.bridge_mappings = parse_bridge_mappings(&mappings)?;
        }
        if let Some(flag) = get("OVNBGP_EXPOSE_TENANT_NETWORKS") {
            agent.exposure.expose_tenant_networks =
                parse_bool("OVNBGP_EXPOSE_TENANT_NETWORKS", &flag)?;
        }
        if let Some(flag) = get("OVNBGP_EXPOSE_IPV6_GUA_TENANT_NETWORKS") {
            agent.exposure.expose_ipv6_gua_tenant_networks =
                parse_bool("OVNBGP_EXPOSE_IPV6_GUA_TENANT_NETWORKS", &flag)?;
        }
        if let Some(interval) = get("OVNBGP_RECONCILE_INTERVAL") {
            agent.engine.reconcile_interval_secs =
                parse_number("OVNBGP_RECONCILE_INTERVAL", &interval)?;
        }

        if let Some(flag) = get("OVNBGP_FPM_ENABLED") {
            agent.fpm.enabled = parse_bool("OVNBGP_FPM_ENABLED", &flag)?;
        }
        if let Some(port) = get("OVNBGP_FPM_PORT") {
            agent.fpm.port = parse_number("OVNBGP_FPM_PORT", &port)?;
        }
        if let Some(format) = get("OVNBGP_FPM_FORMAT") {
            agent.fpm.format = format.parse::<FpmFormat>()?;
        }
        if let Some(router) = get("OVNBGP_FPM_ROUTER") {
            agent.fpm.router = router;
        }

        if let Some(backend) = get("OVNBGP_KERNEL_BACKEND") {
            agent.kernel = parse_backend(&backend);
        }
        if let Some(backend) = get("OVNBGP_SOUTHBOUND_BACKEND") {
            agent.southbound = parse_backend(&backend);
        }
        if let Some(backend) = get("OVNBGP_NORTHBOUND_BACKEND") {
            agent.northbound = parse_backend(&backend);
        }

        Ok(Self {
            agent,
            log_level: get("OVNBGP_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        self.agent.validate()?;

        if self.agent.bridge_mappings.is_empty() {
            eprintln!(
                "WARNING: OVNBGP_BRIDGE_MAPPINGS is empty. \
                 No provider network can be exposed."
            );
        }

        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "OVNBGP_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }

        Ok(())
    }
}

fn main() -> ExitCode {
    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return OvnbgpExitCode::ConfigError.into();
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {:#}", e);
        return OvnbgpExitCode::ConfigError.into();
    }

    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return OvnbgpExitCode::ConfigError.into();
    }

    info!("Starting ovnbgpd on chassis {}", config.agent.chassis);
    info!(
        "Configuration loaded: {} bridge mapping(s)",
        config.agent.bridge_mappings.len()
    );

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return OvnbgpExitCode::RuntimeError.into();
        }
    };

    let code = rt.block_on(async {
        match run_daemon(config).await {
            Ok(()) => OvnbgpExitCode::CleanShutdown,
            Err(e) => {
                error!("Daemon error: {}", e);
                e.exit_code()
            }
        }
    });

    code.into()
}

/// Backend registry with everything this build knows about
fn registry() -> BackendRegistry {
    let registry = BackendRegistry::with_memory_backends();

    #[cfg(feature = "netlink")]
    {
        info!("Registering netlink kernel backend");
        ovnbgp_netlink::register(&registry);
    }

    registry
}

/// Run the daemon
async fn run_daemon(config: Config) -> std::result::Result<(), DaemonError> {
    let agent = config.agent;
    let registry = registry();
    let startup = |e: ovnbgp_core::Error| DaemonError::Startup(e.into());

    info!("Kernel backend: {}", agent.kernel.type_name());
    info!("Southbound backend: {}", agent.southbound.type_name());

    let kernel = registry.create_kernel(&agent.kernel).map_err(startup)?;
    let southbound = registry
        .create_southbound(&agent.southbound)
        .map_err(startup)?;
    let source = registry
        .create_notification_source(&agent.southbound)
        .map_err(startup)?;

    let controller = Arc::new(ExposureController::new(
        agent.clone(),
        southbound,
        kernel.clone(),
    ));
    let (dispatcher, mut dispatch_events) = Dispatcher::new(
        source,
        controller,
        EventRegistry::with_default_events(agent.exposure.tenant_enabled()),
        &agent.engine,
    )
    .map_err(startup)?;
    info!(
        "Registered {} event handler(s)",
        dispatcher.registry().len()
    );

    tokio::spawn(async move {
        while let Some(event) = dispatch_events.recv().await {
            debug!("Dispatch event: {:?}", event);
        }
    });

    let (bridge_stop_tx, bridge_stop_rx) = oneshot::channel();
    let bridge_task = if agent.fpm.enabled {
        info!("Northbound backend: {}", agent.northbound.type_name());
        let northbound = registry
            .create_northbound(&agent.northbound)
            .map_err(startup)?;
        let addresses: Arc<dyn InterfaceAddresses> = Arc::new(kernel.clone());
        let bridge = RouteBridge::new(
            northbound,
            addresses,
            agent.fpm.router.clone(),
            agent.fpm.format,
        );
        let (server, mut bridge_events) = FpmServer::new(
            Arc::new(bridge),
            &agent.fpm,
            agent.engine.event_channel_capacity,
        )
        .map_err(startup)?;
        let listener = server.bind().await.map_err(startup)?;

        tokio::spawn(async move {
            while let Some(event) = bridge_events.recv().await {
                debug!("Bridge event: {:?}", event);
            }
        });
        Some(tokio::spawn(async move {
            server.run(listener, Some(bridge_stop_rx)).await
        }))
    } else {
        info!("FPM bridge disabled");
        None
    };

    let (dispatch_stop_tx, dispatch_stop_rx) = oneshot::channel();
    tokio::spawn(async move {
        match wait_for_shutdown().await {
            Ok(signal) => info!("Received shutdown signal: {}", signal),
            Err(e) => error!("Shutdown error: {}", e),
        }
        let _ = dispatch_stop_tx.send(());
    });

    info!("Daemon initialized successfully");
    // Only the first sync can fail the dispatcher
    let dispatched = dispatcher.run_with_shutdown(Some(dispatch_stop_rx)).await;

    info!("Shutting down daemon");
    let _ = bridge_stop_tx.send(());
    let bridged = match bridge_task {
        Some(task) => match task.await {
            Ok(result) => result.map_err(|e| DaemonError::Runtime(e.into())),
            Err(e) => Err(DaemonError::Runtime(e.into())),
        },
        None => Ok(()),
    };

    dispatched.map_err(startup)?;
    bridged
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
///
/// # Returns
///
/// Returns the name of the signal received.
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Wait for shutdown signals (SIGINT only)
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}
