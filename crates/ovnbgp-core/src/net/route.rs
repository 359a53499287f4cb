//! Route primitives

use super::{DeviceRef, Family, IpPrefix};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Route scope (rtm_scope)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RouteScope {
    Universe,
    Site,
    Link,
    Host,
    Nowhere,
    Other(u8),
}

impl RouteScope {
    pub fn as_u8(self) -> u8 {
        match self {
            RouteScope::Universe => 0,
            RouteScope::Site => 200,
            RouteScope::Link => 253,
            RouteScope::Host => 254,
            RouteScope::Nowhere => 255,
            RouteScope::Other(v) => v,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => RouteScope::Universe,
            200 => RouteScope::Site,
            253 => RouteScope::Link,
            254 => RouteScope::Host,
            255 => RouteScope::Nowhere,
            v => RouteScope::Other(v),
        }
    }
}

/// Route protocol (rtm_protocol)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RouteProtocol {
    Kernel,
    Boot,
    Static,
    Zebra,
    Bgp,
    Other(u8),
}

impl RouteProtocol {
    /// Protocol stamped on every route this daemon installs
    pub const MANAGED: RouteProtocol = RouteProtocol::Boot;

    pub fn as_u8(self) -> u8 {
        match self {
            RouteProtocol::Kernel => 2,
            RouteProtocol::Boot => 3,
            RouteProtocol::Static => 4,
            RouteProtocol::Zebra => 11,
            RouteProtocol::Bgp => 186,
            RouteProtocol::Other(v) => v,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            2 => RouteProtocol::Kernel,
            3 => RouteProtocol::Boot,
            4 => RouteProtocol::Static,
            11 => RouteProtocol::Zebra,
            186 => RouteProtocol::Bgp,
            v => RouteProtocol::Other(v),
        }
    }
}

/// Next hop of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NextHop {
    /// Gateway address
    Address(IpAddr),
    /// Directly out of an interface index
    Interface(u32),
}

/// A route as requested by the exposure logic
///
/// The device is a name; it is only resolved to an index when the route is
/// applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteEntry {
    pub destination: IpPrefix,
    pub next_hop: Option<NextHop>,
    pub table: u32,
    pub protocol: RouteProtocol,
    pub scope: Option<RouteScope>,
    pub device: DeviceRef,
    pub vlan: Option<u16>,
}

impl RouteEntry {
    /// Prefix length used when the caller gives none
    pub fn default_prefix_len(family: Family) -> u8 {
        match family {
            Family::V4 => 32,
            Family::V6 => 64,
        }
    }

    /// Build a direct route to `addr` in `table` out of `device`
    ///
    /// With an explicit `prefix_len` the destination is normalized to its
    /// network address.
    pub fn new(
        addr: IpAddr,
        prefix_len: Option<u8>,
        table: u32,
        device: impl Into<DeviceRef>,
    ) -> Result<Self> {
        let family = Family::of(&addr);
        let destination = match prefix_len {
            Some(len) => IpPrefix::new(addr, len)?.network(),
            None => IpPrefix::new(addr, Self::default_prefix_len(family))?,
        };

        Ok(Self {
            destination,
            next_hop: None,
            table,
            protocol: RouteProtocol::MANAGED,
            scope: default_scope(family, false),
            device: device.into(),
            vlan: None,
        })
    }

    /// Route through a gateway
    pub fn via(mut self, gateway: IpAddr) -> Self {
        self.next_hop = Some(NextHop::Address(gateway));
        self.scope = default_scope(self.family(), true);
        self
    }

    /// Send out of the VLAN sub-interface of the device
    pub fn on_vlan(mut self, vlan: Option<u16>) -> Self {
        self.vlan = vlan;
        self
    }

    pub fn family(&self) -> Family {
        self.destination.family()
    }

    pub fn gateway(&self) -> Option<IpAddr> {
        match self.next_hop {
            Some(NextHop::Address(gw)) => Some(gw),
            _ => None,
        }
    }

    /// Device the route actually leaves through
    pub fn out_device(&self) -> DeviceRef {
        match self.vlan {
            Some(vlan) => self.device.vlan(vlan),
            None => self.device.clone(),
        }
    }

    /// Kernel representation once the out device has been resolved
    pub fn resolve(&self, oif: u32) -> KernelRoute {
        let oif = match self.next_hop {
            Some(NextHop::Interface(index)) => index,
            _ => oif,
        };
        KernelRoute {
            destination: self.destination,
            gateway: self.gateway(),
            oif: Some(oif),
            table: self.table,
            protocol: self.protocol,
            scope: self.scope,
        }
    }
}

impl fmt::Display for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.destination)?;
        if let Some(gw) = self.gateway() {
            write!(f, " via {}", gw)?;
        }
        write!(f, " dev {} table {}", self.out_device(), self.table)
    }
}

/// IPv6 routes carry no scope
fn default_scope(family: Family, has_gateway: bool) -> Option<RouteScope> {
    match (family, has_gateway) {
        (Family::V6, _) => None,
        (Family::V4, true) => Some(RouteScope::Universe),
        (Family::V4, false) => Some(RouteScope::Link),
    }
}

/// A route as the kernel sees it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelRoute {
    pub destination: IpPrefix,
    pub gateway: Option<IpAddr>,
    pub oif: Option<u32>,
    pub table: u32,
    pub protocol: RouteProtocol,
    pub scope: Option<RouteScope>,
}

impl KernelRoute {
    pub fn family(&self) -> Family {
        self.destination.family()
    }

    /// Default route (0.0.0.0/0 or ::/0)
    pub fn is_default(&self) -> bool {
        self.destination.len() == 0
    }

    /// Default route out of `oif` in `table`
    pub fn default_via_device(family: Family, table: u32, oif: u32) -> Self {
        Self {
            destination: IpPrefix::any(family),
            gateway: None,
            oif: Some(oif),
            table,
            protocol: RouteProtocol::MANAGED,
            scope: default_scope(family, false),
        }
    }
}

impl fmt::Display for KernelRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.destination)?;
        if let Some(gw) = self.gateway {
            write!(f, " via {}", gw)?;
        }
        if let Some(oif) = self.oif {
            write!(f, " oif {}", oif)?;
        }
        write!(f, " table {} proto {}", self.table, self.protocol.as_u8())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_prefix_is_asymmetric() {
        let v4 = RouteEntry::new("10.0.0.5".parse().unwrap(), None, 200, "br-ex").unwrap();
        assert_eq!(v4.destination.len(), 32);

        let v6 = RouteEntry::new("2001:db8::5".parse().unwrap(), None, 200, "br-ex").unwrap();
        assert_eq!(v6.destination.len(), 64);
    }

    #[test]
    fn explicit_mask_normalizes_to_network() {
        let route = RouteEntry::new("10.0.0.1".parse().unwrap(), Some(24), 200, "br-ex").unwrap();
        assert_eq!(route.destination.to_string(), "10.0.0.0/24");
    }

    #[test]
    fn scope_follows_gateway_and_family() {
        let direct = RouteEntry::new("10.0.0.1".parse().unwrap(), None, 200, "br-ex").unwrap();
        assert_eq!(direct.scope, Some(RouteScope::Link));
        assert_eq!(direct.protocol.as_u8(), 3);

        let via = direct.via("172.24.4.1".parse().unwrap());
        assert_eq!(via.scope, Some(RouteScope::Universe));

        let v6 = RouteEntry::new("fd00::1".parse().unwrap(), Some(64), 200, "br-ex")
            .unwrap()
            .via("fd00::ffff".parse().unwrap());
        assert_eq!(v6.scope, None);
    }

    #[test]
    fn vlan_changes_out_device() {
        let route = RouteEntry::new("10.0.0.1".parse().unwrap(), None, 200, "br-ex")
            .unwrap()
            .on_vlan(Some(100));
        assert_eq!(route.out_device().as_str(), "br-ex.100");
        assert_eq!(route.device.as_str(), "br-ex");
    }

    #[test]
    fn resolve_keeps_gateway() {
        let route = RouteEntry::new("10.0.0.0".parse().unwrap(), Some(24), 200, "br-ex")
            .unwrap()
            .via("172.24.4.10".parse().unwrap());
        let kernel = route.resolve(7);
        assert_eq!(kernel.oif, Some(7));
        assert_eq!(kernel.gateway, Some("172.24.4.10".parse().unwrap()));
        assert_eq!(kernel.table, 200);
    }

    #[test]
    fn default_route_has_zero_length() {
        let route = KernelRoute::default_via_device(Family::V4, 200, 3);
        assert!(route.is_default());
        assert_eq!(route.destination.to_string(), "0.0.0.0/0");
        assert_eq!(route.scope, Some(RouteScope::Link));
    }
}
