//! Collaborator seams
//!
//! - [`KernelNetwork`]: privileged kernel operations
//! - [`SouthboundDb`] / [`NotificationSource`]: control-plane reads and change feed
//! - [`NorthboundDb`]: static route transactions
//! - [`ExposureActions`]: what the dispatcher asks the controller to do

pub mod exposure;
pub mod kernel;
pub mod northbound;
pub mod notification;
pub mod southbound;

pub use exposure::{AgentView, CrLrpView, ExposureActions, Lifecycle};
pub use kernel::{InterfaceAddresses, KernelNetwork, KernelNetworkFactory};
pub use northbound::{
    NorthboundDb, NorthboundDbFactory, RoutingProto, StaticRoute, StaticRouteOp, ROUTING_PROTO_KEY,
};
pub use notification::{NotificationSource, NotificationSourceFactory};
pub use southbound::{SouthboundDb, SouthboundDbFactory};
