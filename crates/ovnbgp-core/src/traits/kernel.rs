// # Kernel Network Trait
//
// The narrow interface the reconciler drives. Implementations talk to the
// kernel (rtnetlink, procfs, `ip`) or keep everything in memory.
//
// ## Implementations
//
// - Netlink-based (Linux): `ovnbgp-netlink` crate
// - In-memory: `ovnbgp_core::memory::MemoryKernel`
//
// ## Semantics
//
// - Adds are idempotent: an object that already exists is not an error.
// - Deletes of absent objects succeed.
// - Everything else propagates unchanged; no retries happen at this layer.

use crate::error::Result;
use crate::net::{
    DeviceSpec, Family, IpPrefix, IpRule, KernelFlag, KernelRoute, NdpProxy, NeighborEntry,
};
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;

/// Kernel-facing operations keyed by device name or resolved index
///
/// # Trust Level: Privileged
///
/// Implementations perform privileged I/O and nothing else. They never
/// decide what should be exposed; that belongs to the exposure controller.
#[async_trait]
pub trait KernelNetwork: Send + Sync {
    /// Resolve a device name to its index
    async fn link_index(&self, name: &str) -> Result<Option<u32>>;

    /// Index of the device's master, if enslaved
    async fn link_master(&self, name: &str) -> Result<Option<u32>>;

    /// Create a device; an existing device with the same name is left alone
    async fn create_device(&self, spec: &DeviceSpec) -> Result<()>;

    async fn delete_device(&self, name: &str) -> Result<()>;

    /// Enslave `name` to `master`
    async fn set_master(&self, name: &str, master: &str) -> Result<()>;

    async fn set_link_up(&self, name: &str) -> Result<()>;

    /// Addresses configured on a device
    async fn addresses(&self, device: &str) -> Result<Vec<IpPrefix>>;

    /// Addresses configured on a device, by index
    async fn index_addresses(&self, ifindex: u32) -> Result<Vec<IpAddr>>;

    /// Add an address; returns false if it was already present
    async fn add_address(&self, device: &str, addr: IpPrefix) -> Result<bool>;

    async fn del_address(&self, device: &str, addr: IpPrefix) -> Result<()>;

    /// Policy rules of a family
    async fn rules(&self, family: Family) -> Result<Vec<IpRule>>;

    async fn add_rule(&self, rule: &IpRule) -> Result<()>;

    async fn del_rule(&self, rule: &IpRule) -> Result<()>;

    /// Routes in a table
    async fn routes(&self, table: u32) -> Result<Vec<KernelRoute>>;

    /// Whether an equivalent route is installed
    async fn route_exists(&self, route: &KernelRoute) -> Result<bool>;

    async fn add_route(&self, route: &KernelRoute) -> Result<()>;

    async fn del_route(&self, route: &KernelRoute) -> Result<()>;

    /// Add a permanent neighbour entry
    async fn add_neighbor(&self, entry: &NeighborEntry) -> Result<()>;

    async fn del_neighbor(&self, entry: &NeighborEntry) -> Result<()>;

    async fn add_ndp_proxy(&self, proxy: &NdpProxy) -> Result<()>;

    async fn del_ndp_proxy(&self, proxy: &NdpProxy) -> Result<()>;

    /// Toggle a per-device sysctl
    async fn set_kernel_flag(&self, flag: &KernelFlag, value: bool) -> Result<()>;
}

/// Resolves an interface index to its configured addresses
///
/// Used by the route-update bridge when a next hop is given as an
/// interface rather than an address.
#[async_trait]
pub trait InterfaceAddresses: Send + Sync {
    async fn interface_addresses(&self, ifindex: u32) -> Result<Vec<IpAddr>>;
}

#[async_trait]
impl InterfaceAddresses for Arc<dyn KernelNetwork> {
    async fn interface_addresses(&self, ifindex: u32) -> Result<Vec<IpAddr>> {
        self.index_addresses(ifindex).await
    }
}

/// Helper trait for constructing kernel backends from configuration
pub trait KernelNetworkFactory: Send + Sync {
    fn create(&self, config: &crate::config::BackendConfig) -> Result<Arc<dyn KernelNetwork>>;
}
