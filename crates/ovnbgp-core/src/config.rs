//! Configuration types for the route exposure daemon
//!
//! This module defines all configuration structures used throughout the crate.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};

/// Main agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Name of the chassis this agent runs on
    pub chassis: String,

    /// BGP device and VRF settings
    #[serde(default)]
    pub bgp: BgpConfig,

    /// What gets advertised
    #[serde(default)]
    pub exposure: ExposureConfig,

    /// Provider network to bridge mappings
    #[serde(default)]
    pub bridge_mappings: Vec<BridgeMapping>,

    /// Route-update bridge settings
    #[serde(default)]
    pub fpm: FpmConfig,

    /// Dispatcher settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Kernel collaborator
    #[serde(default = "default_kernel_backend")]
    pub kernel: BackendConfig,

    /// Southbound database collaborator
    #[serde(default)]
    pub southbound: BackendConfig,

    /// Northbound database collaborator
    #[serde(default)]
    pub northbound: BackendConfig,
}

impl AgentConfig {
    /// Create a configuration with defaults for the given chassis
    pub fn new(chassis: impl Into<String>) -> Self {
        Self {
            chassis: chassis.into(),
            bgp: BgpConfig::default(),
            exposure: ExposureConfig::default(),
            bridge_mappings: Vec::new(),
            fpm: FpmConfig::default(),
            engine: EngineConfig::default(),
            kernel: default_kernel_backend(),
            southbound: BackendConfig::default(),
            northbound: BackendConfig::default(),
        }
    }

    /// Add a bridge mapping
    pub fn with_bridge_mapping(
        mut self,
        network: impl Into<String>,
        bridge: impl Into<String>,
        table_id: u32,
    ) -> Self {
        self.bridge_mappings.push(BridgeMapping {
            network: network.into(),
            bridge: bridge.into(),
            table_id,
        });
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.chassis.trim().is_empty() {
            return Err(Error::config("Chassis name cannot be empty"));
        }

        self.bgp.validate()?;

        let mut networks = HashSet::new();
        for mapping in &self.bridge_mappings {
            if mapping.network.is_empty() || mapping.bridge.is_empty() {
                return Err(Error::config(format!(
                    "Bridge mapping {:?} must name both network and bridge",
                    mapping
                )));
            }
            if !networks.insert(mapping.network.as_str()) {
                return Err(Error::config(format!(
                    "Duplicate bridge mapping for network {}",
                    mapping.network
                )));
            }
            if mapping.table_id == 0 || mapping.table_id > 252 {
                return Err(Error::config(format!(
                    "Table {} for bridge {} must be within 1..=252",
                    mapping.table_id, mapping.bridge
                )));
            }
            if mapping.table_id == self.bgp.vrf_table_id {
                return Err(Error::config(format!(
                    "Table {} for bridge {} collides with the VRF table",
                    mapping.table_id, mapping.bridge
                )));
            }
        }

        self.fpm.validate()?;
        self.kernel.validate("kernel", true)?;
        self.southbound.validate("southbound", false)?;
        self.northbound.validate("northbound", false)?;

        Ok(())
    }

    /// Look up the mapping for a provider network
    pub fn bridge_for_network(&self, network: &str) -> Option<&BridgeMapping> {
        self.bridge_mappings.iter().find(|m| m.network == network)
    }
}

/// BGP device and VRF settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BgpConfig {
    /// Dummy device carrying exposed addresses
    #[serde(default = "default_bgp_nic")]
    pub nic: String,

    /// VRF the dummy device is enslaved to
    #[serde(default = "default_bgp_vrf")]
    pub vrf: String,

    /// Routing table backing the VRF
    #[serde(default = "default_bgp_vrf_table_id")]
    pub vrf_table_id: u32,
}

impl BgpConfig {
    fn validate(&self) -> Result<()> {
        if self.nic.is_empty() || self.vrf.is_empty() {
            return Err(Error::config("BGP nic and vrf names cannot be empty"));
        }
        if self.vrf_table_id == 0 {
            return Err(Error::config("VRF table id must be > 0"));
        }
        Ok(())
    }
}

impl Default for BgpConfig {
    fn default() -> Self {
        Self {
            nic: default_bgp_nic(),
            vrf: default_bgp_vrf(),
            vrf_table_id: default_bgp_vrf_table_id(),
        }
    }
}

/// Tenant exposure toggles
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExposureConfig {
    /// Advertise every tenant address behind a local router port
    #[serde(default)]
    pub expose_tenant_networks: bool,

    /// Advertise only IPv6 global unicast tenant addresses
    #[serde(default)]
    pub expose_ipv6_gua_tenant_networks: bool,
}

impl ExposureConfig {
    /// Whether any tenant exposure is enabled
    pub fn tenant_enabled(&self) -> bool {
        self.expose_tenant_networks || self.expose_ipv6_gua_tenant_networks
    }
}

/// Provider network to bridge mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeMapping {
    /// Provider network name
    pub network: String,

    /// Bridge device name (e.g. "br-ex")
    pub bridge: String,

    /// Routing table dedicated to this bridge
    pub table_id: u32,
}

/// Route-update bridge settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FpmConfig {
    /// Whether the bridge server runs at all
    #[serde(default = "default_fpm_enabled")]
    pub enabled: bool,

    /// Listen address, loopback only
    #[serde(default = "default_fpm_listen_addr")]
    pub listen_addr: IpAddr,

    /// Listen port
    #[serde(default = "default_fpm_port")]
    pub port: u16,

    /// Active payload format
    #[serde(default)]
    pub format: FpmFormat,

    /// Logical router receiving static routes
    #[serde(default = "default_fpm_router")]
    pub router: String,

    /// Read timeout for a partially received frame (None waits forever)
    #[serde(default)]
    pub read_timeout_secs: Option<u64>,
}

impl FpmConfig {
    fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if !self.listen_addr.is_loopback() {
            return Err(Error::config(format!(
                "FPM listen address {} must be loopback",
                self.listen_addr
            )));
        }
        if self.router.is_empty() {
            return Err(Error::config("FPM router name cannot be empty"));
        }
        if self.read_timeout_secs == Some(0) {
            return Err(Error::config("FPM read timeout must be > 0"));
        }
        Ok(())
    }
}

impl Default for FpmConfig {
    fn default() -> Self {
        Self {
            enabled: default_fpm_enabled(),
            listen_addr: default_fpm_listen_addr(),
            port: default_fpm_port(),
            format: FpmFormat::default(),
            router: default_fpm_router(),
            read_timeout_secs: None,
        }
    }
}

/// Payload format accepted by the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FpmFormat {
    /// Structured route-change records (frame type 1)
    Structured,
    /// Kernel route messages (frame type 2)
    #[default]
    Netlink,
}

impl std::str::FromStr for FpmFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "structured" | "protobuf" => Ok(FpmFormat::Structured),
            "netlink" => Ok(FpmFormat::Netlink),
            other => Err(Error::config(format!("Unknown FPM format: {}", other))),
        }
    }
}

/// Collaborator backend selection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// In-memory backend (dry run)
    #[default]
    Memory,

    /// Linux netlink backend (kernel only)
    Netlink,

    /// Backend created by a registered factory
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl BackendConfig {
    /// Factory name this configuration resolves to
    pub fn type_name(&self) -> &str {
        match self {
            BackendConfig::Memory => "memory",
            BackendConfig::Netlink => "netlink",
            BackendConfig::Custom { factory, .. } => factory,
        }
    }

    fn validate(&self, role: &str, netlink_allowed: bool) -> Result<()> {
        match self {
            BackendConfig::Memory => Ok(()),
            BackendConfig::Netlink if netlink_allowed => Ok(()),
            BackendConfig::Netlink => Err(Error::config(format!(
                "netlink is not a valid {} backend",
                role
            ))),
            BackendConfig::Custom { factory, config } => {
                if factory.is_empty() {
                    return Err(Error::config(format!(
                        "Custom {} backend factory cannot be empty",
                        role
                    )));
                }
                if config.is_null() {
                    return Err(Error::config(format!(
                        "Custom {} backend config cannot be null",
                        role
                    )));
                }
                Ok(())
            }
        }
    }
}

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capacity of the monitoring event channel
    ///
    /// When full, new events are dropped with a warning log.
    ///
    /// Default: 1000 events
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Interval between periodic resyncs (0 disables)
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// Run a full sync before processing notifications
    #[serde(default = "default_sync_on_start")]
    pub sync_on_start: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: default_event_channel_capacity(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            sync_on_start: default_sync_on_start(),
        }
    }
}

fn default_bgp_nic() -> String {
    "bgp-nic".to_string()
}

fn default_bgp_vrf() -> String {
    "bgp-vrf".to_string()
}

fn default_bgp_vrf_table_id() -> u32 {
    10
}

fn default_fpm_enabled() -> bool {
    true
}

fn default_fpm_listen_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_fpm_port() -> u16 {
    2620
}

fn default_fpm_router() -> String {
    "rtr".to_string()
}

fn default_kernel_backend() -> BackendConfig {
    BackendConfig::Netlink
}

fn default_event_channel_capacity() -> usize {
    1000
}

fn default_reconcile_interval_secs() -> u64 {
    120
}

fn default_sync_on_start() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_minimal_json() {
        let config: AgentConfig = serde_json::from_str(r#"{"chassis": "node-1"}"#).unwrap();
        assert_eq!(config.bgp.nic, "bgp-nic");
        assert_eq!(config.bgp.vrf_table_id, 10);
        assert_eq!(config.fpm.port, 2620);
        assert_eq!(config.fpm.format, FpmFormat::Netlink);
        assert_eq!(config.engine.reconcile_interval_secs, 120);
        assert!(matches!(config.kernel, BackendConfig::Netlink));
        assert!(matches!(config.southbound, BackendConfig::Memory));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_empty_chassis() {
        assert!(AgentConfig::new("").validate().is_err());
    }

    #[test]
    fn rejects_duplicate_networks_and_bad_tables() {
        let dup = AgentConfig::new("n")
            .with_bridge_mapping("public", "br-ex", 200)
            .with_bridge_mapping("public", "br-vlan", 201);
        assert!(dup.validate().is_err());

        let reserved = AgentConfig::new("n").with_bridge_mapping("public", "br-ex", 254);
        assert!(reserved.validate().is_err());

        let vrf_clash = AgentConfig::new("n").with_bridge_mapping("public", "br-ex", 10);
        assert!(vrf_clash.validate().is_err());
    }

    #[test]
    fn rejects_non_loopback_fpm() {
        let mut config = AgentConfig::new("n");
        config.fpm.listen_addr = "192.0.2.1".parse().unwrap();
        assert!(config.validate().is_err());

        config.fpm.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn netlink_backend_is_kernel_only() {
        let mut config = AgentConfig::new("n");
        config.northbound = BackendConfig::Netlink;
        assert!(config.validate().is_err());
    }

    #[test]
    fn backend_tagging() {
        let backend: BackendConfig = serde_json::from_str(
            r#"{"type": "custom", "factory": "ovsdb", "config": {"remote": "tcp:127.0.0.1:6642"}}"#,
        )
        .unwrap();
        assert_eq!(backend.type_name(), "ovsdb");
    }

    #[test]
    fn fpm_format_parsing() {
        assert_eq!("structured".parse::<FpmFormat>().unwrap(), FpmFormat::Structured);
        assert_eq!("NETLINK".parse::<FpmFormat>().unwrap(), FpmFormat::Netlink);
        assert!("xml".parse::<FpmFormat>().is_err());
    }
}
