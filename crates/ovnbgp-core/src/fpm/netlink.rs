//! Kernel route messages carried in FPM frames
//!
//! A payload is a sequence of netlink messages; each header reports its own
//! length, which is how the decoder advances.

use super::{DecodedRoute, RouteOperation};
use crate::error::{Error, Result};
use crate::net::{Family, IpPrefix, RouteEntry};
use netlink_packet_core::{NetlinkMessage, NetlinkPayload};
use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteMessage, RouteProtocol};
use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
use std::net::IpAddr;
use tracing::debug;

fn address(addr: &RouteAddress) -> Option<IpAddr> {
    match addr {
        RouteAddress::Inet(v4) => Some(IpAddr::V4(*v4)),
        RouteAddress::Inet6(v6) => Some(IpAddr::V6(*v6)),
        _ => None,
    }
}

fn decode_route(route: &RouteMessage, operation: RouteOperation) -> Result<Option<DecodedRoute>> {
    let family = match route.header.address_family {
        AddressFamily::Inet => Family::V4,
        AddressFamily::Inet6 => Family::V6,
        other => {
            debug!("Skipping route of family {:?}", other);
            return Ok(None);
        }
    };

    let mut destination = None;
    let mut next_hop = None;
    let mut oif = None;
    for attr in &route.attributes {
        match attr {
            RouteAttribute::Destination(addr) => destination = address(addr),
            RouteAttribute::Gateway(addr) => next_hop = address(addr),
            RouteAttribute::Oif(index) => oif = Some(*index),
            _ => {}
        }
    }

    let Some(destination) = destination else {
        debug!("Skipping route without destination");
        return Ok(None);
    };

    let len = match route.header.destination_prefix_length {
        0 => RouteEntry::default_prefix_len(family),
        len => len,
    };

    Ok(Some(DecodedRoute {
        family,
        destination: IpPrefix::new(destination, len)?,
        next_hop,
        oif,
        protocol: u8::from(route.header.protocol),
        operation,
    }))
}

/// Decode every route message in a payload
///
/// NEWROUTE from zebra becomes an add; every DELROUTE becomes a delete.
/// Other messages are skipped.
pub fn decode(payload: &[u8]) -> Result<Vec<DecodedRoute>> {
    let mut routes = Vec::new();
    let mut offset = 0;

    while offset < payload.len() {
        let message = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&payload[offset..])
            .map_err(|e| Error::decode(format!("netlink message at offset {}: {}", offset, e)))?;

        let length = message.header.length as usize;
        if length == 0 {
            return Err(Error::decode(format!("zero length netlink message at offset {}", offset)));
        }

        match &message.payload {
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewRoute(route)) => {
                if route.header.protocol == RouteProtocol::Zebra {
                    routes.extend(decode_route(route, RouteOperation::Add)?);
                } else {
                    debug!("Skipping NEWROUTE with protocol {:?}", route.header.protocol);
                }
            }
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelRoute(route)) => {
                routes.extend(decode_route(route, RouteOperation::Delete)?);
            }
            _ => debug!("Skipping netlink message type {}", message.header.message_type),
        }

        offset += length;
    }

    Ok(routes)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    pub(crate) fn route_message(
        new: bool,
        protocol: RouteProtocol,
        dst: IpAddr,
        len: u8,
        gateway: Option<IpAddr>,
        oif: Option<u32>,
    ) -> Vec<u8> {
        let mut route = RouteMessage::default();
        route.header.address_family = match dst {
            IpAddr::V4(_) => AddressFamily::Inet,
            IpAddr::V6(_) => AddressFamily::Inet6,
        };
        route.header.destination_prefix_length = len;
        route.header.protocol = protocol;

        let to_route_address = |ip: IpAddr| match ip {
            IpAddr::V4(v4) => RouteAddress::Inet(v4),
            IpAddr::V6(v6) => RouteAddress::Inet6(v6),
        };
        route
            .attributes
            .push(RouteAttribute::Destination(to_route_address(dst)));
        if let Some(gw) = gateway {
            route.attributes.push(RouteAttribute::Gateway(to_route_address(gw)));
        }
        if let Some(index) = oif {
            route.attributes.push(RouteAttribute::Oif(index));
        }

        let inner = if new {
            RouteNetlinkMessage::NewRoute(route)
        } else {
            RouteNetlinkMessage::DelRoute(route)
        };
        let mut message = NetlinkMessage::from(inner);
        message.finalize();
        let mut buf = vec![0u8; message.header.length as usize];
        message.serialize(&mut buf);
        buf
    }

    #[test]
    fn test_zebra_newroute_is_add() {
        let payload = route_message(
            true,
            RouteProtocol::Zebra,
            IpAddr::V4(Ipv4Addr::new(10, 2, 0, 0)),
            24,
            Some(IpAddr::V4(Ipv4Addr::new(172, 24, 4, 1))),
            None,
        );
        let routes = decode(&payload).unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].operation, RouteOperation::Add);
        assert_eq!(routes[0].destination.to_string(), "10.2.0.0/24");
        assert_eq!(routes[0].next_hop, Some("172.24.4.1".parse().unwrap()));
    }

    #[test]
    fn test_kernel_newroute_skipped() {
        let payload = route_message(
            true,
            RouteProtocol::Kernel,
            IpAddr::V4(Ipv4Addr::new(10, 2, 0, 0)),
            24,
            None,
            Some(3),
        );
        assert!(decode(&payload).unwrap().is_empty());
    }

    #[test]
    fn test_concatenated_messages() {
        let mut payload = route_message(
            true,
            RouteProtocol::Zebra,
            IpAddr::V4(Ipv4Addr::new(10, 2, 0, 0)),
            24,
            None,
            Some(3),
        );
        payload.extend(route_message(
            false,
            RouteProtocol::Zebra,
            IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 0)),
            0,
            None,
            None,
        ));

        let routes = decode(&payload).unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].oif, Some(3));
        assert_eq!(routes[0].next_hop, None);
        assert_eq!(routes[1].operation, RouteOperation::Delete);
        // missing length falls back to the family default
        assert_eq!(routes[1].destination.len(), 64);
    }

    #[test]
    fn test_missing_length_defaults_to_host_v4() {
        let payload = route_message(
            true,
            RouteProtocol::Zebra,
            IpAddr::V4(Ipv4Addr::new(10, 2, 0, 9)),
            0,
            None,
            None,
        );
        let routes = decode(&payload).unwrap();
        assert_eq!(routes[0].destination.len(), 32);
    }

    #[test]
    fn test_truncated_payload_is_decode_error() {
        let payload = route_message(
            true,
            RouteProtocol::Zebra,
            IpAddr::V4(Ipv4Addr::new(10, 2, 0, 0)),
            24,
            None,
            None,
        );
        let err = decode(&payload[..payload.len() - 2]).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }
}
