//! Replays decoded routes as northbound static-route transactions

use super::frame::{frame_type, FpmFrame};
use super::{netlink, proto, DecodedRoute, RouteOperation};
use crate::config::FpmFormat;
use crate::error::{Error, Result};
use crate::traits::{InterfaceAddresses, NorthboundDb, RoutingProto, StaticRouteOp};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Decoder plus transaction issuer for one payload format
pub struct RouteBridge {
    northbound: Arc<dyn NorthboundDb>,
    addresses: Arc<dyn InterfaceAddresses>,
    router: String,
    format: FpmFormat,
}

impl RouteBridge {
    pub fn new(
        northbound: Arc<dyn NorthboundDb>,
        addresses: Arc<dyn InterfaceAddresses>,
        router: impl Into<String>,
        format: FpmFormat,
    ) -> Self {
        Self {
            northbound,
            addresses,
            router: router.into(),
            format,
        }
    }

    pub fn format(&self) -> FpmFormat {
        self.format
    }

    pub fn router(&self) -> &str {
        &self.router
    }

    /// Decode a frame with the active decoder
    ///
    /// A frame of the other format is a protocol violation.
    pub fn decode(&self, frame: &FpmFrame) -> Result<Vec<DecodedRoute>> {
        let expected = frame_type(self.format);
        if frame.msg_type() != expected {
            return Err(Error::protocol(format!(
                "unexpected frame type {} (expecting {})",
                frame.msg_type(),
                expected
            )));
        }
        match self.format {
            FpmFormat::Structured => proto::decode(&frame.payload),
            FpmFormat::Netlink => netlink::decode(&frame.payload),
        }
    }

    /// Gateway of the route, else an address of the outgoing interface in
    /// the same family
    pub async fn resolve_next_hop(&self, route: &DecodedRoute) -> Result<Option<IpAddr>> {
        if let Some(next_hop) = route.next_hop {
            return Ok(Some(next_hop));
        }
        let Some(oif) = route.oif else {
            return Ok(None);
        };
        let addresses = self.addresses.interface_addresses(oif).await?;
        Ok(addresses
            .into_iter()
            .find(|ip| crate::net::Family::of(ip) == route.family))
    }

    /// Static-route operations for a set of decoded routes
    ///
    /// Adds without a resolvable next hop are dropped with a warning.
    pub async fn operations(&self, routes: &[DecodedRoute]) -> Result<Vec<StaticRouteOp>> {
        let mut ops = Vec::with_capacity(routes.len());
        for route in routes {
            let next_hop = self.resolve_next_hop(route).await?;
            match route.operation {
                RouteOperation::Add => match next_hop {
                    Some(nexthop) => ops.push(StaticRouteOp::Add {
                        router: self.router.clone(),
                        prefix: route.destination.network(),
                        nexthop,
                        routing_proto: RoutingProto::Bgp,
                    }),
                    None => warn!("No next hop for {}, not adding", route.destination),
                },
                RouteOperation::Delete => ops.push(StaticRouteOp::Delete {
                    router: self.router.clone(),
                    prefix: route.destination.network(),
                    nexthop: next_hop,
                    if_exists: true,
                }),
            }
        }
        Ok(ops)
    }

    /// Decode a frame and commit its routes in one transaction
    ///
    /// Returns the number of committed operations.
    pub async fn handle_frame(&self, frame: &FpmFrame) -> Result<usize> {
        let routes = self.decode(frame)?;
        let ops = self.operations(&routes).await?;
        if ops.is_empty() {
            debug!("Frame carried no actionable routes");
            return Ok(0);
        }

        for op in &ops {
            info!("Northbound {}", op);
        }
        let count = ops.len();
        self.northbound.transact(ops).await?;
        Ok(count)
    }
}
