//! Southbound row model
//!
//! Rows are snapshots delivered with change notifications. Every column is
//! optional: an update's `old` row only carries the columns that changed, and
//! predicates treat an absent column as "does not match".

pub mod nat;

pub use nat::NatAddress;

use crate::net::IpPrefix;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;

/// Prefix of logical router port names
pub const LRP_PREFIX: &str = "lrp-";
/// Prefix of chassis-redirect router port names
pub const CR_LRP_PREFIX: &str = "cr-lrp-";
/// Option marking a router port as the peer of a chassis-redirect port
pub const REDIRECT_OPTION: &str = "chassis-redirect-port";
/// External id carrying the port CIDRs when the MAC column says "unknown"
pub const CIDRS_EXT_ID: &str = "neutron:cidrs";

/// Port_Binding.type values this agent cares about
pub mod port_type {
    pub const VM: &str = "";
    pub const VIRTUAL: &str = "virtual";
    pub const PATCH: &str = "patch";
    pub const CHASSIS_REDIRECT: &str = "chassisredirect";
    pub const LOCALNET: &str = "localnet";

    /// Types that represent workloads
    pub fn is_vif(kind: &str) -> bool {
        kind == VM || kind == VIRTUAL
    }
}

/// Southbound tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Table {
    PortBinding,
    LoadBalancer,
    Chassis,
    ChassisPrivate,
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Table::PortBinding => "Port_Binding",
            Table::LoadBalancer => "Load_Balancer",
            Table::Chassis => "Chassis",
            Table::ChassisPrivate => "Chassis_Private",
        };
        f.write_str(name)
    }
}

/// Port_Binding row
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    #[serde(default)]
    pub logical_port: Option<String>,
    #[serde(default, rename = "type")]
    pub port_type: Option<String>,
    #[serde(default)]
    pub mac: Option<Vec<String>>,
    /// Names of the bound chassis
    #[serde(default)]
    pub chassis: Option<Vec<String>>,
    #[serde(default)]
    pub datapath: Option<String>,
    #[serde(default)]
    pub nat_addresses: Option<Vec<String>>,
    #[serde(default)]
    pub options: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub external_ids: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub up: Option<Vec<bool>>,
    #[serde(default)]
    pub tag: Option<Vec<u16>>,
}

impl PortBinding {
    /// Start a row for a logical port
    pub fn new(logical_port: impl Into<String>) -> Self {
        Self {
            logical_port: Some(logical_port.into()),
            ..Default::default()
        }
    }

    pub fn with_type(mut self, kind: impl Into<String>) -> Self {
        self.port_type = Some(kind.into());
        self
    }

    pub fn with_mac(mut self, mac: impl Into<String>) -> Self {
        self.mac = Some(vec![mac.into()]);
        self
    }

    pub fn with_chassis(mut self, chassis: impl Into<String>) -> Self {
        self.chassis = Some(vec![chassis.into()]);
        self
    }

    pub fn unbound(mut self) -> Self {
        self.chassis = Some(Vec::new());
        self
    }

    pub fn with_datapath(mut self, datapath: impl Into<String>) -> Self {
        self.datapath = Some(datapath.into());
        self
    }

    pub fn with_nat_addresses<I, S>(mut self, nat: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.nat_addresses = Some(nat.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn with_external_id(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.external_ids
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn with_up(mut self, up: bool) -> Self {
        self.up = Some(vec![up]);
        self
    }

    pub fn with_tag(mut self, tag: u16) -> Self {
        self.tag = Some(vec![tag]);
        self
    }

    pub fn name(&self) -> &str {
        self.logical_port.as_deref().unwrap_or_default()
    }

    pub fn kind(&self) -> Option<&str> {
        self.port_type.as_deref()
    }

    /// First bound chassis, if the column is present and non-empty
    pub fn first_chassis(&self) -> Option<&str> {
        self.chassis.as_ref()?.first().map(String::as_str)
    }

    /// Chassis column present and empty
    pub fn is_unbound(&self) -> bool {
        matches!(&self.chassis, Some(c) if c.is_empty())
    }

    /// Bound to `chassis`
    pub fn is_bound_to(&self, chassis: &str) -> bool {
        self.first_chassis() == Some(chassis)
    }

    /// Raw first MAC column entry
    pub fn mac_field(&self) -> Option<&str> {
        self.mac.as_ref()?.first().map(String::as_str)
    }

    /// Ethernet address token of the MAC column
    pub fn mac_address(&self) -> Option<&str> {
        self.mac_field()?.split_whitespace().next()
    }

    /// Whether the MAC column reads `"<mac> <ip> [<ip>...]"`
    pub fn has_mac_ips(&self) -> bool {
        self.mac_field()
            .map(|m| m.split_whitespace().count() >= 2)
            .unwrap_or(false)
    }

    /// Addresses from the MAC column, in column order
    ///
    /// Returns `None` if the column is missing, has no address tokens, or any
    /// token fails to parse.
    pub fn mac_ips(&self) -> Option<Vec<IpPrefix>> {
        let field = self.mac_field()?;
        let ips: Vec<IpPrefix> = field
            .split_whitespace()
            .skip(1)
            .map(|token| token.parse().ok())
            .collect::<Option<_>>()?;
        if ips.is_empty() { None } else { Some(ips) }
    }

    /// MAC column is the "unknown" sentinel
    pub fn mac_is_unknown(&self) -> bool {
        self.mac_field().map(str::trim) == Some("unknown")
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.as_ref()?.get(key).map(String::as_str)
    }

    pub fn has_option(&self, key: &str) -> bool {
        self.options
            .as_ref()
            .map(|o| o.contains_key(key))
            .unwrap_or(false)
    }

    pub fn external_id(&self, key: &str) -> Option<&str> {
        self.external_ids.as_ref()?.get(key).map(String::as_str)
    }

    /// CIDRs recorded by the cloud layer, as host addresses
    pub fn cidr_ips(&self) -> Option<Vec<IpPrefix>> {
        let cidrs = self.external_id(CIDRS_EXT_ID)?;
        let ips: Vec<IpPrefix> = cidrs
            .split_whitespace()
            .map(|cidr| {
                let addr = cidr.split('/').next()?;
                addr.parse::<IpAddr>().ok().map(IpPrefix::host)
            })
            .collect::<Option<_>>()?;
        if ips.is_empty() { None } else { Some(ips) }
    }

    /// First `up` value
    pub fn is_up(&self) -> Option<bool> {
        self.up.as_ref()?.first().copied()
    }

    /// Localnet VLAN tag
    pub fn vlan_tag(&self) -> Option<u16> {
        self.tag.as_ref()?.first().copied()
    }

    /// Parsed NAT column entries; malformed entries are skipped
    pub fn nat_entries(&self) -> Option<Vec<NatAddress>> {
        let nat = self.nat_addresses.as_ref()?;
        Some(nat.iter().filter_map(|s| s.parse().ok()).collect())
    }

    pub fn is_router_port(&self) -> bool {
        self.name().starts_with(LRP_PREFIX)
    }

    pub fn is_cr_lrp(&self) -> bool {
        self.name().starts_with(CR_LRP_PREFIX)
    }
}

/// A group of datapaths shared by load balancers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatapathGroup {
    pub uuid: String,
    #[serde(default)]
    pub datapaths: Option<Vec<String>>,
}

/// Load_Balancer row
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancer {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub datapaths: Option<Vec<String>>,
    #[serde(default)]
    pub datapath_group: Option<Vec<DatapathGroup>>,
    /// VIP (`ip:port`) to backends (`ip:port,ip:port`)
    #[serde(default)]
    pub vips: Option<BTreeMap<String, String>>,
}

impl LoadBalancer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_datapaths<I, S>(mut self, datapaths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.datapaths = Some(datapaths.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_datapath_group<I, S>(mut self, uuid: impl Into<String>, datapaths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.datapath_group
            .get_or_insert_with(Vec::new)
            .push(DatapathGroup {
                uuid: uuid.into(),
                datapaths: Some(datapaths.into_iter().map(Into::into).collect()),
            });
        self
    }

    pub fn with_vip(mut self, vip: impl Into<String>, backends: impl Into<String>) -> Self {
        self.vips
            .get_or_insert_with(BTreeMap::new)
            .insert(vip.into(), backends.into());
        self
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or_default()
    }

    /// Datapaths the balancer is attached to
    ///
    /// The datapath group takes precedence over the legacy column. A group
    /// without its datapaths column makes the whole set unknown.
    pub fn attached_datapaths(&self) -> Option<BTreeSet<String>> {
        if let Some(groups) = &self.datapath_group {
            let mut set = BTreeSet::new();
            for group in groups {
                set.extend(group.datapaths.as_ref()?.iter().cloned());
            }
            return Some(set);
        }
        self.datapaths
            .as_ref()
            .map(|dps| dps.iter().cloned().collect())
    }

    /// VIP addresses, ports stripped
    pub fn vip_addresses(&self) -> Vec<IpAddr> {
        self.vips
            .as_ref()
            .map(|vips| vips.keys().filter_map(|k| parse_vip(k)).collect())
            .unwrap_or_default()
    }
}

/// Extract the address from a VIP key (`1.2.3.4:80`, `[fd00::1]:80`, bare)
pub fn parse_vip(vip: &str) -> Option<IpAddr> {
    let vip = vip.trim();
    if let Ok(ip) = vip.parse() {
        return Some(ip);
    }
    if let Some(rest) = vip.strip_prefix('[') {
        let (addr, _) = rest.split_once(']')?;
        return addr.parse().ok();
    }
    let (addr, _) = vip.rsplit_once(':')?;
    addr.parse().ok()
}

/// Chassis / Chassis_Private row
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChassisRow {
    #[serde(default)]
    pub name: Option<String>,
}

impl ChassisRow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
        }
    }
}

/// A row from any watched table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "table", content = "columns")]
pub enum Row {
    PortBinding(PortBinding),
    LoadBalancer(LoadBalancer),
    Chassis(ChassisRow),
    ChassisPrivate(ChassisRow),
}

impl Row {
    pub fn table(&self) -> Table {
        match self {
            Row::PortBinding(_) => Table::PortBinding,
            Row::LoadBalancer(_) => Table::LoadBalancer,
            Row::Chassis(_) => Table::Chassis,
            Row::ChassisPrivate(_) => Table::ChassisPrivate,
        }
    }

    pub fn as_port_binding(&self) -> Option<&PortBinding> {
        match self {
            Row::PortBinding(row) => Some(row),
            _ => None,
        }
    }

    pub fn as_load_balancer(&self) -> Option<&LoadBalancer> {
        match self {
            Row::LoadBalancer(row) => Some(row),
            _ => None,
        }
    }

    pub fn as_chassis(&self) -> Option<&ChassisRow> {
        match self {
            Row::Chassis(row) | Row::ChassisPrivate(row) => Some(row),
            _ => None,
        }
    }
}

/// Kind of change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NotificationKind::Create => "create",
            NotificationKind::Update => "update",
            NotificationKind::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// A database change notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub row: Row,
    /// Previous values of the changed columns (None on create)
    #[serde(default)]
    pub old: Option<Row>,
}

impl Notification {
    pub fn create(row: Row) -> Self {
        Self {
            kind: NotificationKind::Create,
            row,
            old: None,
        }
    }

    pub fn update(row: Row, old: Row) -> Self {
        Self {
            kind: NotificationKind::Update,
            row,
            old: Some(old),
        }
    }

    pub fn delete(row: Row) -> Self {
        Self {
            kind: NotificationKind::Delete,
            row,
            old: None,
        }
    }

    pub fn table(&self) -> Table {
        self.row.table()
    }

    /// Port bindings for `row` and `old`
    pub fn port_bindings(&self) -> Option<(&PortBinding, Option<&PortBinding>)> {
        let row = self.row.as_port_binding()?;
        let old = self.old.as_ref().and_then(Row::as_port_binding);
        Some((row, old))
    }

    /// Load balancers for `row` and `old`
    pub fn load_balancers(&self) -> Option<(&LoadBalancer, Option<&LoadBalancer>)> {
        let row = self.row.as_load_balancer()?;
        let old = self.old.as_ref().and_then(Row::as_load_balancer);
        Some((row, old))
    }
}
