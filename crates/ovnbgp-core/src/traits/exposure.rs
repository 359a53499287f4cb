//! The exposure operations invoked by the dispatcher

use crate::error::Result;
use crate::net::IpPrefix;
use crate::ovn::PortBinding;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;

/// Controller lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Lifecycle {
    /// No full sync has completed yet
    #[default]
    Unsynced,
    /// A full sync is running
    Syncing,
    /// At least one full sync completed
    Steady,
}

/// Chassis-redirect port as seen by predicates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrLrpView {
    pub name: String,
    pub provider_datapath: String,
    pub subnet_datapaths: BTreeSet<String>,
    /// Load balancers exposed through this port
    pub ovn_lbs: BTreeSet<String>,
}

/// Read-only snapshot of controller state
///
/// Predicates only ever see this; they never mutate the controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentView {
    pub chassis: String,
    pub lifecycle: Lifecycle,
    /// At least one router port is exposed through a local gateway
    pub has_local_lrps: bool,
    pub cr_lrps: Vec<CrLrpView>,
}

impl AgentView {
    pub fn new(chassis: impl Into<String>) -> Self {
        Self {
            chassis: chassis.into(),
            ..Default::default()
        }
    }
}

/// Operations that advertise or withdraw addresses on this node
#[async_trait]
pub trait ExposureActions: Send + Sync {
    /// Current state snapshot
    async fn view(&self) -> AgentView;

    /// Full synchronization against the database and the kernel
    async fn sync(&self) -> Result<()>;

    /// Incremental resynchronization after startup
    async fn resync(&self) -> Result<()>;

    async fn expose_ip(
        &self,
        ips: &[IpPrefix],
        row: &PortBinding,
        associated_port: Option<&str>,
    ) -> Result<()>;

    async fn withdraw_ip(
        &self,
        ips: &[IpPrefix],
        row: &PortBinding,
        associated_port: Option<&str>,
    ) -> Result<()>;

    /// Route a tenant subnet behind a local gateway
    async fn expose_subnet(&self, subnet: IpPrefix, row: &PortBinding) -> Result<()>;

    async fn withdraw_subnet(&self, subnet: IpPrefix, row: &PortBinding) -> Result<()>;

    /// Router port addresses changed between two snapshots
    async fn update_subnet(&self, old: &PortBinding, row: &PortBinding) -> Result<()>;

    /// Tenant addresses reachable through a local router port
    async fn expose_remote_ip(&self, ips: &[IpPrefix], row: &PortBinding) -> Result<()>;

    async fn withdraw_remote_ip(
        &self,
        ips: &[IpPrefix],
        row: &PortBinding,
        chassis: Option<&str>,
    ) -> Result<()>;

    async fn expose_ovn_lb_on_provider(&self, lb: &str, vip: IpAddr, cr_lrp: &str) -> Result<()>;

    async fn withdraw_ovn_lb_on_provider(&self, lb: &str, cr_lrp: &str) -> Result<()>;
}
