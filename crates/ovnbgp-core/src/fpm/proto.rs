//! Structured route-change records
//!
//! Hand-derived prost messages for the subset of the zebra FPM schema the
//! bridge reads. Field numbers follow the routing daemon's `fpm.proto` and
//! `qpb.proto`.

use super::{DecodedRoute, RouteOperation};
use crate::error::{Error, Result};
use crate::net::{Family, IpPrefix};
use prost::Message as _;
use std::net::{IpAddr, Ipv4Addr};
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum AddressFamily {
    UnknownAf = 0,
    Ipv4 = 1,
    Ipv6 = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum SubAddressFamily {
    UnknownSaf = 0,
    Unicast = 1,
    Multicast = 2,
}

/// Route origin as reported by the routing daemon
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Protocol {
    UnknownProto = 0,
    Local = 1,
    Connected = 2,
    Kernel = 3,
    Static = 4,
    Rip = 5,
    Ripng = 6,
    Ospf = 7,
    Isis = 8,
    Bgp = 9,
    Other = 10,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum RouteType {
    Unknown = 0,
    Normal = 1,
    Unreachable = 2,
    Blackhole = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MsgType {
    UnknownMsg = 0,
    AddRoute = 1,
    DeleteRoute = 2,
}

/// Network prefix; `bytes` holds only the significant octets
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct L3Prefix {
    #[prost(uint32, required, tag = "1")]
    pub length: u32,
    #[prost(bytes = "vec", required, tag = "2")]
    pub bytes: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IfIdentifier {
    #[prost(int32, optional, tag = "1")]
    pub index: Option<i32>,
    #[prost(string, optional, tag = "2")]
    pub name: Option<String>,
}

/// IPv4 address as a host-order integer of the network-order octets
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ipv4Address {
    #[prost(fixed32, required, tag = "1")]
    pub value: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ipv6Address {
    #[prost(bytes = "vec", required, tag = "1")]
    pub bytes: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct L3Address {
    #[prost(message, optional, tag = "1")]
    pub v4: Option<Ipv4Address>,
    #[prost(message, optional, tag = "2")]
    pub v6: Option<Ipv6Address>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RouteKey {
    #[prost(message, optional, tag = "1")]
    pub prefix: Option<L3Prefix>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Nexthop {
    #[prost(message, optional, tag = "2")]
    pub if_id: Option<IfIdentifier>,
    #[prost(message, optional, tag = "3")]
    pub address: Option<L3Address>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddRoute {
    #[prost(uint32, required, tag = "1")]
    pub vrf_id: u32,
    #[prost(enumeration = "AddressFamily", required, tag = "2")]
    pub address_family: i32,
    #[prost(enumeration = "SubAddressFamily", required, tag = "3")]
    pub sub_address_family: i32,
    #[prost(message, required, tag = "4")]
    pub key: RouteKey,
    #[prost(enumeration = "RouteType", optional, tag = "5")]
    pub route_type: Option<i32>,
    #[prost(enumeration = "Protocol", required, tag = "6")]
    pub protocol: i32,
    #[prost(int32, required, tag = "8")]
    pub metric: i32,
    #[prost(message, repeated, tag = "9")]
    pub nexthops: Vec<Nexthop>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteRoute {
    #[prost(uint32, required, tag = "1")]
    pub vrf_id: u32,
    #[prost(enumeration = "AddressFamily", required, tag = "2")]
    pub address_family: i32,
    #[prost(enumeration = "SubAddressFamily", required, tag = "3")]
    pub sub_address_family: i32,
    #[prost(message, required, tag = "4")]
    pub key: RouteKey,
}

/// Top-level record: at most one add and one delete
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    #[prost(enumeration = "MsgType", optional, tag = "1")]
    pub r#type: Option<i32>,
    #[prost(message, optional, tag = "2")]
    pub add_route: Option<AddRoute>,
    #[prost(message, optional, tag = "3")]
    pub delete_route: Option<DeleteRoute>,
}

fn is_ipv4(family: i32) -> bool {
    family == AddressFamily::Ipv4 as i32
}

/// IPv4 destination; short prefix byte strings are zero padded and the
/// length is taken as sent, so `0.0.0.0/0` stays a default route
fn ipv4_destination(key: &RouteKey) -> Result<IpPrefix> {
    let prefix = key
        .prefix
        .as_ref()
        .ok_or_else(|| Error::decode("route key without prefix"))?;

    let mut octets = [0u8; 4];
    for (slot, byte) in octets.iter_mut().zip(&prefix.bytes) {
        *slot = *byte;
    }

    let len = u8::try_from(prefix.length)
        .map_err(|_| Error::decode(format!("prefix length {}", prefix.length)))?;
    IpPrefix::new(IpAddr::V4(Ipv4Addr::from(octets)), len)
        .map_err(|e| Error::decode(e.to_string()))
}

/// Decode a structured payload
///
/// Only IPv4 entries are returned, and adds only when the route is BGP
/// originated. Next hops come from the embedded address, else the
/// interface index is kept for resolution by the caller.
pub fn decode(payload: &[u8]) -> Result<Vec<DecodedRoute>> {
    let message = Message::decode(payload).map_err(|e| Error::decode(e.to_string()))?;
    let mut routes = Vec::new();

    if let Some(add) = &message.add_route {
        let protocol = add.protocol;
        if !is_ipv4(add.address_family) {
            debug!("Skipping non IPv4 structured add");
        } else if protocol != Protocol::Bgp as i32 {
            debug!("Skipping structured add with protocol {}", protocol);
        } else {
            let destination = ipv4_destination(&add.key)?;
            let first = add.nexthops.first();
            let next_hop = first
                .and_then(|nh| nh.address.as_ref())
                .and_then(|a| a.v4.as_ref())
                .map(|v4| IpAddr::V4(Ipv4Addr::from(v4.value)));
            let oif = first
                .and_then(|nh| nh.if_id.as_ref())
                .and_then(|id| id.index)
                .and_then(|index| u32::try_from(index).ok())
                .filter(|index| *index > 0);

            routes.push(DecodedRoute {
                family: Family::V4,
                destination,
                next_hop,
                oif,
                protocol: u8::try_from(protocol).unwrap_or_default(),
                operation: RouteOperation::Add,
            });
        }
    }

    if let Some(delete) = &message.delete_route {
        if is_ipv4(delete.address_family) {
            routes.push(DecodedRoute {
                family: Family::V4,
                destination: ipv4_destination(&delete.key)?,
                next_hop: None,
                oif: None,
                protocol: 0,
                operation: RouteOperation::Delete,
            });
        } else {
            debug!("Skipping non IPv4 structured delete");
        }
    }

    Ok(routes)
}
