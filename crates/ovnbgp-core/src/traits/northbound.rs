//! Northbound static route transactions

use crate::config::BackendConfig;
use crate::error::Result;
use crate::net::IpPrefix;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

/// Key of the external id tagging route origin
pub const ROUTING_PROTO_KEY: &str = "routing_proto";

/// Origin marker stored on static routes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingProto {
    Bgp,
    Static,
}

impl fmt::Display for RoutingProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingProto::Bgp => f.write_str("bgp"),
            RoutingProto::Static => f.write_str("static"),
        }
    }
}

/// One operation inside a northbound transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StaticRouteOp {
    Add {
        router: String,
        prefix: IpPrefix,
        nexthop: IpAddr,
        routing_proto: RoutingProto,
    },
    Delete {
        router: String,
        prefix: IpPrefix,
        nexthop: Option<IpAddr>,
        if_exists: bool,
    },
}

impl StaticRouteOp {
    /// External ids written with an add
    pub fn external_ids(&self) -> BTreeMap<String, String> {
        let mut ids = BTreeMap::new();
        if let StaticRouteOp::Add { routing_proto, .. } = self {
            ids.insert(ROUTING_PROTO_KEY.to_string(), routing_proto.to_string());
        }
        ids
    }
}

impl fmt::Display for StaticRouteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaticRouteOp::Add {
                router,
                prefix,
                nexthop,
                routing_proto,
            } => write!(f, "add {} via {} on {} ({})", prefix, nexthop, router, routing_proto),
            StaticRouteOp::Delete {
                router,
                prefix,
                nexthop,
                ..
            } => match nexthop {
                Some(nh) => write!(f, "delete {} via {} on {}", prefix, nh, router),
                None => write!(f, "delete {} on {}", prefix, router),
            },
        }
    }
}

/// A static route as stored in the northbound database
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StaticRoute {
    pub router: String,
    pub prefix: IpPrefix,
    pub nexthop: IpAddr,
    pub external_ids: BTreeMap<String, String>,
}

/// Transactional write access to the northbound database
///
/// A transaction either commits every operation or fails as a whole; the
/// error is returned to the caller.
#[async_trait]
pub trait NorthboundDb: Send + Sync {
    async fn transact(&self, ops: Vec<StaticRouteOp>) -> Result<()>;
}

/// Helper trait for constructing northbound clients from configuration
pub trait NorthboundDbFactory: Send + Sync {
    fn create(&self, config: &BackendConfig) -> Result<Arc<dyn NorthboundDb>>;
}
