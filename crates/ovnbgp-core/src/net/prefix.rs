//! IP prefixes and address families

use crate::error::{Error, Result};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Address family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// Family of an address
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    /// Longest prefix for this family
    pub fn max_len(self) -> u8 {
        match self {
            Family::V4 => 32,
            Family::V6 => 128,
        }
    }

    /// Kernel address family constant (AF_INET / AF_INET6)
    pub fn af(self) -> u8 {
        match self {
            Family::V4 => 2,
            Family::V6 => 10,
        }
    }

    /// Unspecified address of this family
    pub fn unspecified(self) -> IpAddr {
        match self {
            Family::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Family::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => write!(f, "ipv4"),
            Family::V6 => write!(f, "ipv6"),
        }
    }
}

/// An address plus prefix length
///
/// The address is kept as written; [`IpPrefix::network`] yields the masked
/// form. `10.0.0.1/24` is a router port address, `10.0.0.0/24` its subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IpPrefix(IpNet);

impl IpPrefix {
    /// Create a prefix, rejecting lengths longer than the family allows
    pub fn new(addr: IpAddr, len: u8) -> Result<Self> {
        IpNet::new(addr, len).map(Self).map_err(|_| {
            Error::invalid_address(format!("prefix length {} out of range for {}", len, addr))
        })
    }

    /// Single-address prefix (/32 or /128)
    pub fn host(addr: IpAddr) -> Self {
        Self(IpNet::from(addr))
    }

    /// The default-route prefix (0.0.0.0/0 or ::/0)
    pub fn any(family: Family) -> Self {
        match family {
            Family::V4 => Self(IpNet::V4(Ipv4Net::default())),
            Family::V6 => Self(IpNet::V6(Ipv6Net::default())),
        }
    }

    /// Parse `addr` or `addr/len`, using `default_len` when the length is omitted
    pub fn parse_with_default(literal: &str, default_len: impl Fn(Family) -> u8) -> Result<Self> {
        let literal = literal.trim();
        if literal.contains('/') {
            return IpNet::from_str(literal)
                .map(Self)
                .map_err(|_| Error::invalid_address(literal));
        }
        let addr = IpAddr::from_str(literal).map_err(|_| Error::invalid_address(literal))?;
        Self::new(addr, default_len(Family::of(&addr)))
    }

    pub fn addr(&self) -> IpAddr {
        self.0.addr()
    }

    pub fn len(&self) -> u8 {
        self.0.prefix_len()
    }

    pub fn family(&self) -> Family {
        Family::of(&self.addr())
    }

    /// True for /32 and /128
    pub fn is_host(&self) -> bool {
        self.0.prefix_len() == self.0.max_prefix_len()
    }

    /// The prefix with host bits cleared
    pub fn network(&self) -> Self {
        Self(self.0.trunc())
    }

    /// Whether `ip` falls inside this prefix
    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.0.contains(ip)
    }

    /// IPv6 global unicast (2000::/3)
    pub fn is_ipv6_gua(&self) -> bool {
        match self.0 {
            IpNet::V6(net) => (net.addr().segments()[0] & 0xe000) == 0x2000,
            IpNet::V4(_) => false,
        }
    }
}

impl FromStr for IpPrefix {
    type Err = Error;

    /// A bare address parses as a host prefix
    fn from_str(s: &str) -> Result<Self> {
        Self::parse_with_default(s, Family::max_len)
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<IpAddr> for IpPrefix {
    fn from(addr: IpAddr) -> Self {
        Self::host(addr)
    }
}

impl From<IpNet> for IpPrefix {
    fn from(net: IpNet) -> Self {
        Self(net)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_address_is_host_prefix() {
        let v4: IpPrefix = "10.0.0.5".parse().unwrap();
        assert_eq!(v4.len(), 32);
        assert!(v4.is_host());

        let v6: IpPrefix = "2001:db8::1".parse().unwrap();
        assert_eq!(v6.len(), 128);
        assert_eq!(v6.family(), Family::V6);
    }

    #[test]
    fn extra_slash_is_invalid_address() {
        let err = "10.0.0.1/24/8".parse::<IpPrefix>().unwrap_err();
        assert!(matches!(err, Error::InvalidAddress(_)));
    }

    #[test]
    fn garbage_is_invalid_address() {
        assert!("not-an-ip".parse::<IpPrefix>().is_err());
        assert!("10.0.0.1/33".parse::<IpPrefix>().is_err());
        assert!("10.0.0.1/abc".parse::<IpPrefix>().is_err());
    }

    #[test]
    fn network_masks_host_bits() {
        let p: IpPrefix = "10.0.0.77/24".parse().unwrap();
        assert_eq!(p.network().to_string(), "10.0.0.0/24");

        let p6: IpPrefix = "fd00:1:2:3::9/64".parse().unwrap();
        assert_eq!(p6.network().to_string(), "fd00:1:2:3::/64");

        let zero: IpPrefix = "10.1.2.3/0".parse().unwrap();
        assert_eq!(zero.network().to_string(), "0.0.0.0/0");
    }

    #[test]
    fn contains_checks_family_and_mask() {
        let p: IpPrefix = "10.0.0.0/24".parse().unwrap();
        assert!(p.contains(&"10.0.0.200".parse().unwrap()));
        assert!(!p.contains(&"10.0.1.1".parse().unwrap()));
        assert!(!p.contains(&"::1".parse().unwrap()));
    }

    #[test]
    fn parse_with_custom_default() {
        let p = IpPrefix::parse_with_default("fd00::1", |f| match f {
            Family::V4 => 32,
            Family::V6 => 64,
        })
        .unwrap();
        assert_eq!(p.len(), 64);
    }

    #[test]
    fn keeps_host_bits_until_masked() {
        let p: IpPrefix = "10.0.0.1/24".parse().unwrap();
        assert_eq!(p.to_string(), "10.0.0.1/24");
        assert_ne!(p, p.network());
        assert_eq!(IpPrefix::any(Family::V6).to_string(), "::/0");
    }

    #[test]
    fn serializes_as_cidr_string() {
        let p: IpPrefix = "172.24.4.0/24".parse().unwrap();
        assert_eq!(serde_json::to_string(&p).unwrap(), r#""172.24.4.0/24""#);
        let back: IpPrefix = serde_json::from_str(r#""fd00::1/64""#).unwrap();
        assert_eq!(back.len(), 64);
    }

    #[test]
    fn gua_detection() {
        assert!("2001:db8::1".parse::<IpPrefix>().unwrap().is_ipv6_gua());
        assert!(!"fd00::1".parse::<IpPrefix>().unwrap().is_ipv6_gua());
        assert!(!"10.0.0.1".parse::<IpPrefix>().unwrap().is_ipv6_gua());
    }
}
