//! Per-node exposure state
//!
//! Populated by a full sync, then updated incrementally by every expose and
//! withdraw call. Predicates only ever see it through [`AgentView`].

use crate::net::{IpPrefix, MacAddr};
use crate::traits::{AgentView, CrLrpView, Lifecycle};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

/// A chassis-redirect port hosted on this node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrLrpInfo {
    pub router_datapath: Option<String>,
    pub provider_datapath: String,
    pub ips: Vec<IpPrefix>,
    /// Router port name to the datapath of the switch behind it
    pub subnets_datapath: BTreeMap<String, String>,
    pub subnets_cidr: Vec<IpPrefix>,
    pub ovn_lbs: BTreeSet<String>,
    pub bridge_device: Option<String>,
    pub bridge_vlan: Option<u16>,
    pub mac: Option<MacAddr>,
}

impl CrLrpInfo {
    /// Gateway address of the same family as `prefix`
    pub fn gateway_for(&self, prefix: &IpPrefix) -> Option<IpAddr> {
        self.ips
            .iter()
            .find(|ip| ip.family() == prefix.family())
            .map(IpPrefix::addr)
    }

    pub fn has_gateway_ip(&self, ip: &IpAddr) -> bool {
        self.ips.iter().any(|g| g.addr() == *ip)
    }

    /// Bridge and VLAN, when the provider network is mapped
    pub fn bridge(&self) -> Option<(String, Option<u16>)> {
        self.bridge_device
            .clone()
            .map(|device| (device, self.bridge_vlan))
    }
}

/// An address currently advertised from this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposedAddress {
    pub ip: IpAddr,
    pub owner_port: String,
    pub associated_port: Option<String>,
    pub exposed_at: DateTime<Utc>,
}

/// Everything the controller knows about this node
#[derive(Debug, Clone, Default)]
pub struct LocalState {
    pub lifecycle: Lifecycle,
    /// Provider network name to bridge
    pub bridge_mappings: BTreeMap<String, String>,
    pub cr_lrps: BTreeMap<String, CrLrpInfo>,
    /// Router port name to the chassis-redirect port exposing it
    pub lrps: BTreeMap<String, String>,
    /// Load balancer name to the VIPs exposed for it
    pub lb_vips: BTreeMap<String, Vec<IpAddr>>,
    exposed: BTreeMap<(IpAddr, String), ExposedAddress>,
}

impl LocalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything except the lifecycle
    pub fn reset(&mut self) {
        let lifecycle = self.lifecycle;
        *self = Self {
            lifecycle,
            ..Self::default()
        };
    }

    /// Record an exposure; false if the pair was already tracked
    pub fn track_exposed(&mut self, ip: IpAddr, owner: &str, associated: Option<&str>) -> bool {
        let key = (ip, owner.to_string());
        if self.exposed.contains_key(&key) {
            return false;
        }
        self.exposed.insert(
            key,
            ExposedAddress {
                ip,
                owner_port: owner.to_string(),
                associated_port: associated.map(str::to_string),
                exposed_at: Utc::now(),
            },
        );
        true
    }

    /// Drop an exposure; false if the pair was not tracked
    pub fn untrack_exposed(&mut self, ip: IpAddr, owner: &str) -> bool {
        self.exposed.remove(&(ip, owner.to_string())).is_some()
    }

    /// Drop every owner of an address
    pub fn untrack_ip(&mut self, ip: IpAddr) {
        self.exposed.retain(|(tracked, _), _| *tracked != ip);
    }

    pub fn is_exposed_by(&self, ip: IpAddr, owner: &str) -> bool {
        self.exposed.contains_key(&(ip, owner.to_string()))
    }

    /// Whether any owner still exposes the address
    pub fn is_exposed(&self, ip: IpAddr) -> bool {
        self.exposed.keys().any(|(tracked, _)| *tracked == ip)
    }

    pub fn exposed(&self) -> impl Iterator<Item = &ExposedAddress> {
        self.exposed.values()
    }

    pub fn exposed_count(&self) -> usize {
        self.exposed.len()
    }

    /// Chassis-redirect ports sharing a provider datapath
    pub fn cr_lrps_on_provider(&self, datapath: &str) -> usize {
        self.cr_lrps
            .values()
            .filter(|info| info.provider_datapath == datapath)
            .count()
    }

    pub fn view(&self, chassis: &str) -> AgentView {
        AgentView {
            chassis: chassis.to_string(),
            lifecycle: self.lifecycle,
            has_local_lrps: !self.lrps.is_empty(),
            cr_lrps: self
                .cr_lrps
                .iter()
                .map(|(name, info)| CrLrpView {
                    name: name.clone(),
                    provider_datapath: info.provider_datapath.clone(),
                    subnet_datapaths: info.subnets_datapath.values().cloned().collect(),
                    ovn_lbs: info.ovn_lbs.clone(),
                })
                .collect(),
        }
    }
}
