//! Network state primitives
//!
//! Plain data describing the kernel objects the reconciler manages: rules,
//! routes, neighbour entries, devices and sysctl toggles. Everything here is
//! validated on construction and performs no I/O.

pub mod prefix;
pub mod route;

pub use prefix::{Family, IpPrefix};
pub use route::{KernelRoute, NextHop, RouteEntry, RouteProtocol, RouteScope};

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use std::str::FromStr;

/// A network interface referenced by name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceRef(String);

impl DeviceRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// VLAN sub-interface of this device (`br-ex` → `br-ex.100`)
    pub fn vlan(&self, tag: u16) -> DeviceRef {
        DeviceRef(format!("{}.{}", self.0, tag))
    }
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceRef {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for DeviceRef {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl From<&DeviceRef> for DeviceRef {
    fn from(dev: &DeviceRef) -> Self {
        dev.clone()
    }
}

/// Ethernet address, written `aa:bb:cc:dd:ee:ff` or `aa-bb-cc-dd-ee-ff`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl FromStr for MacAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let separator = if s.contains(':') { ':' } else { '-' };
        let parts: Vec<&str> = s.split(separator).collect();
        if parts.len() != 6 {
            return Err(Error::invalid_address(format!("bad MAC {}", s)));
        }

        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(&parts) {
            if part.len() != 2 {
                return Err(Error::invalid_address(format!("bad MAC {}", s)));
            }
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| Error::invalid_address(format!("bad MAC {}", s)))?;
        }
        Ok(MacAddr(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d, e, g)
    }
}

impl TryFrom<String> for MacAddr {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<MacAddr> for String {
    fn from(mac: MacAddr) -> String {
        mac.to_string()
    }
}

impl From<[u8; 6]> for MacAddr {
    fn from(octets: [u8; 6]) -> Self {
        MacAddr(octets)
    }
}

/// Static neighbour (ARP/NDP) entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NeighborEntry {
    pub ip: IpAddr,
    pub lladdr: MacAddr,
    pub device: DeviceRef,
}

/// Policy rule steering a destination into a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IpRule {
    pub destination: IpPrefix,
    pub table: u32,
}

impl IpRule {
    pub fn new(destination: IpPrefix, table: u32) -> Self {
        Self { destination, table }
    }

    /// Parse `addr` or `addr/len`; a bare address becomes /32 or /128
    pub fn parse(literal: &str, table: u32) -> Result<Self> {
        Ok(Self::new(literal.parse()?, table))
    }

    pub fn family(&self) -> Family {
        self.destination.family()
    }

    /// Lookup key, `"dst/dst_len"`
    pub fn key(&self) -> String {
        self.destination.to_string()
    }
}

impl fmt::Display for IpRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "to {} lookup {}", self.destination, self.table)
    }
}

/// A device the reconciler can create
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DeviceSpec {
    Dummy {
        name: String,
    },
    Vrf {
        name: String,
        table: u32,
    },
    Vxlan {
        name: String,
        vni: u32,
        local: IpAddr,
        dstport: u16,
    },
    Veth {
        name: String,
        peer: String,
    },
    Vlan {
        parent: String,
        vlan_id: u16,
    },
}

impl DeviceSpec {
    /// Name of the device once created
    pub fn name(&self) -> String {
        match self {
            DeviceSpec::Dummy { name }
            | DeviceSpec::Vrf { name, .. }
            | DeviceSpec::Vxlan { name, .. }
            | DeviceSpec::Veth { name, .. } => name.clone(),
            DeviceSpec::Vlan { parent, vlan_id } => format!("{}.{}", parent, vlan_id),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DeviceSpec::Dummy { .. } => "dummy",
            DeviceSpec::Vrf { .. } => "vrf",
            DeviceSpec::Vxlan { .. } => "vxlan",
            DeviceSpec::Veth { .. } => "veth",
            DeviceSpec::Vlan { .. } => "vlan",
        }
    }
}

/// Per-device kernel toggles
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KernelFlag {
    ProxyArp(DeviceRef),
    ProxyNdp(DeviceRef),
}

impl KernelFlag {
    /// Dotted sysctl key; dots inside device names become slashes
    pub fn sysctl_key(&self) -> String {
        match self {
            KernelFlag::ProxyArp(dev) => {
                format!("net.ipv4.conf.{}.proxy_arp", dev.as_str().replace('.', "/"))
            }
            KernelFlag::ProxyNdp(dev) => {
                format!("net.ipv6.conf.{}.proxy_ndp", dev.as_str().replace('.', "/"))
            }
        }
    }

    /// Path below /proc/sys
    pub fn proc_path(&self) -> String {
        match self {
            KernelFlag::ProxyArp(dev) => format!("net/ipv4/conf/{}/proxy_arp", dev),
            KernelFlag::ProxyNdp(dev) => format!("net/ipv6/conf/{}/proxy_ndp", dev),
        }
    }
}

/// Proxy NDP entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NdpProxy {
    pub ip: Ipv6Addr,
    pub device: DeviceRef,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_parse_and_display() {
        let mac: MacAddr = "FA:16:3E:00:00:01".parse().unwrap();
        assert_eq!(mac.to_string(), "fa:16:3e:00:00:01");
        assert!("fa:16:3e:00:00".parse::<MacAddr>().is_err());
        assert!("fa:16:3e:00:00:01:02".parse::<MacAddr>().is_err());
        assert!("zz:16:3e:00:00:01".parse::<MacAddr>().is_err());
    }

    #[test]
    fn mac_accepts_hyphens_and_serializes_as_string() {
        let mac: MacAddr = "fa-16-3e-00-00-01".parse().unwrap();
        assert_eq!(mac.as_bytes(), &[0xfa, 0x16, 0x3e, 0, 0, 1]);
        assert_eq!(serde_json::to_string(&mac).unwrap(), r#""fa:16:3e:00:00:01""#);
        assert!(serde_json::from_str::<MacAddr>(r#""nope""#).is_err());
    }

    #[test]
    fn rule_defaults_to_host_prefix() {
        let v4 = IpRule::parse("172.24.4.10", 200).unwrap();
        assert_eq!(v4.key(), "172.24.4.10/32");

        let v6 = IpRule::parse("2001:db8::10", 200).unwrap();
        assert_eq!(v6.key(), "2001:db8::10/128");
        assert_eq!(v6.family(), Family::V6);
    }

    #[test]
    fn rule_rejects_double_slash() {
        let err = IpRule::parse("10.0.0.0/24/1", 200).unwrap_err();
        assert!(matches!(err, Error::InvalidAddress(_)));
    }

    #[test]
    fn vlan_device_names() {
        let spec = DeviceSpec::Vlan {
            parent: "br-ex".into(),
            vlan_id: 100,
        };
        assert_eq!(spec.name(), "br-ex.100");
        assert_eq!(DeviceRef::from("br-ex").vlan(100), DeviceRef::from("br-ex.100"));
    }

    #[test]
    fn sysctl_keys_escape_vlan_dots() {
        let flag = KernelFlag::ProxyArp(DeviceRef::from("br-ex.100"));
        assert_eq!(flag.sysctl_key(), "net.ipv4.conf.br-ex/100.proxy_arp");
        assert_eq!(flag.proc_path(), "net/ipv4/conf/br-ex.100/proxy_arp");
    }
}
