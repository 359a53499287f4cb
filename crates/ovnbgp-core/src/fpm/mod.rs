//! Route-update protocol bridge
//!
//! The routing daemon pushes its RIB over a framed TCP stream (FPM). Each
//! connection runs the cycle
//!
//! ```text
//! AWAIT_HEADER → AWAIT_PAYLOAD → DECODE → (ADD | DELETE) → AWAIT_HEADER
//! ```
//!
//! and every frame's routes are committed to the northbound database in a
//! single static-route transaction. Only one payload format is active per
//! bridge; see [`frame::frame_type`].

pub mod bridge;
pub mod frame;
pub mod netlink;
pub mod proto;
pub mod server;

pub use bridge::RouteBridge;
pub use frame::{FpmFrame, FpmHeader};
pub use server::{BridgeEvent, FpmServer};

use crate::net::{Family, IpPrefix};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteOperation {
    Add,
    Delete,
}

/// A route decoded from either payload format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedRoute {
    pub family: Family,
    pub destination: IpPrefix,
    pub next_hop: Option<IpAddr>,
    /// Outgoing interface, used when no next hop was sent
    pub oif: Option<u32>,
    /// Protocol number as sent by the peer
    pub protocol: u8,
    pub operation: RouteOperation,
}
