// # Memory Kernel
//
// In-memory implementation of KernelNetwork.
//
// ## Purpose
//
// Keeps devices, addresses, rules, routes and neighbour entries in a map so
// the reconciler and the exposure controller can run without privileges.
// Used by the test suites and as the daemon's dry-run kernel backend.
//
// ## Route identity
//
// Two routes are the same route when table, destination, gateway and output
// interface match. Protocol and scope are attributes, not identity.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::net::{
    DeviceSpec, Family, IpPrefix, IpRule, KernelFlag, KernelRoute, NdpProxy, NeighborEntry,
};
use crate::traits::{KernelNetwork, KernelNetworkFactory};

#[derive(Debug, Clone)]
struct Link {
    index: u32,
    kind: String,
    master: Option<u32>,
    up: bool,
    addresses: BTreeSet<IpPrefix>,
}

#[derive(Debug, Default)]
struct KernelState {
    links: BTreeMap<String, Link>,
    next_index: u32,
    rules: BTreeSet<IpRule>,
    routes: Vec<KernelRoute>,
    neighbors: HashSet<NeighborEntry>,
    ndp_proxies: HashSet<NdpProxy>,
    flags: BTreeMap<String, bool>,
}

impl KernelState {
    fn insert_link(&mut self, name: &str, kind: &str) -> u32 {
        if let Some(link) = self.links.get(name) {
            return link.index;
        }
        self.next_index += 1;
        let index = self.next_index;
        self.links.insert(
            name.to_string(),
            Link {
                index,
                kind: kind.to_string(),
                master: None,
                up: false,
                addresses: BTreeSet::new(),
            },
        );
        index
    }

    fn link_mut(&mut self, name: &str) -> Result<&mut Link> {
        self.links
            .get_mut(name)
            .ok_or_else(|| Error::device_not_found(name))
    }
}

fn same_route(a: &KernelRoute, b: &KernelRoute) -> bool {
    a.table == b.table
        && a.destination == b.destination
        && a.gateway == b.gateway
        && a.oif == b.oif
}

/// Point-in-time copy of the exposed kernel objects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSnapshot {
    pub addresses: BTreeMap<String, BTreeSet<IpPrefix>>,
    pub rules: BTreeSet<IpRule>,
    pub routes: HashSet<KernelRoute>,
    pub neighbors: HashSet<NeighborEntry>,
    pub ndp_proxies: HashSet<NdpProxy>,
}

/// In-memory kernel
///
/// Cloning shares the underlying state.
///
/// # Example
///
/// ```rust,no_run
/// use ovnbgp_core::memory::MemoryKernel;
/// use ovnbgp_core::traits::KernelNetwork;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let kernel = MemoryKernel::with_links(["br-ex"]);
///     assert!(kernel.link_index("br-ex").await?.is_some());
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryKernel {
    inner: Arc<RwLock<KernelState>>,
    route_adds: Arc<AtomicUsize>,
}

impl MemoryKernel {
    /// Create an empty kernel with no devices
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a kernel that already has the named devices (e.g. bridges)
    pub fn with_links<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut state = KernelState::default();
        for name in names {
            state.insert_link(name.as_ref(), "bridge");
        }
        Self {
            inner: Arc::new(RwLock::new(state)),
            route_adds: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Add a device outside of the reconciler
    pub async fn add_link(&self, name: &str) -> u32 {
        self.inner.write().await.insert_link(name, "bridge")
    }

    /// Install a route outside of the reconciler (e.g. left by an earlier run)
    pub async fn inject_route(&self, route: KernelRoute) {
        let mut state = self.inner.write().await;
        if !state.routes.iter().any(|r| same_route(r, &route)) {
            state.routes.push(route);
        }
    }

    /// Install a rule outside of the reconciler
    pub async fn inject_rule(&self, rule: IpRule) {
        self.inner.write().await.rules.insert(rule);
    }

    /// Number of routes actually written by `add_route`
    pub fn route_adds(&self) -> usize {
        self.route_adds.load(Ordering::SeqCst)
    }

    /// Kind of a device ("dummy", "vrf", "vlan", ...)
    pub async fn link_kind(&self, name: &str) -> Option<String> {
        self.inner.read().await.links.get(name).map(|l| l.kind.clone())
    }

    pub async fn is_up(&self, name: &str) -> bool {
        self.inner
            .read()
            .await
            .links
            .get(name)
            .map(|l| l.up)
            .unwrap_or(false)
    }

    /// Current value of a kernel flag, if it was ever set
    pub async fn flag(&self, flag: &KernelFlag) -> Option<bool> {
        self.inner.read().await.flags.get(&flag.sysctl_key()).copied()
    }

    pub async fn all_routes(&self) -> Vec<KernelRoute> {
        self.inner.read().await.routes.clone()
    }

    pub async fn snapshot(&self) -> KernelSnapshot {
        let state = self.inner.read().await;
        KernelSnapshot {
            addresses: state
                .links
                .iter()
                .filter(|(_, l)| !l.addresses.is_empty())
                .map(|(name, l)| (name.clone(), l.addresses.clone()))
                .collect(),
            rules: state.rules.clone(),
            routes: state.routes.iter().cloned().collect(),
            neighbors: state.neighbors.clone(),
            ndp_proxies: state.ndp_proxies.clone(),
        }
    }
}

#[async_trait]
impl KernelNetwork for MemoryKernel {
    async fn link_index(&self, name: &str) -> Result<Option<u32>> {
        Ok(self.inner.read().await.links.get(name).map(|l| l.index))
    }

    async fn link_master(&self, name: &str) -> Result<Option<u32>> {
        Ok(self
            .inner
            .read()
            .await
            .links
            .get(name)
            .and_then(|l| l.master))
    }

    async fn create_device(&self, spec: &DeviceSpec) -> Result<()> {
        let mut state = self.inner.write().await;
        if let DeviceSpec::Vlan { parent, .. } = spec {
            if !state.links.contains_key(parent) {
                return Err(Error::device_not_found(parent.clone()));
            }
        }
        let name = spec.name();
        state.insert_link(&name, spec.kind());
        if let DeviceSpec::Veth { peer, .. } = spec {
            state.insert_link(peer, spec.kind());
        }
        debug!("memory kernel: created {} device {}", spec.kind(), name);
        Ok(())
    }

    async fn delete_device(&self, name: &str) -> Result<()> {
        let mut state = self.inner.write().await;
        if let Some(link) = state.links.remove(name) {
            state.routes.retain(|r| r.oif != Some(link.index));
        }
        Ok(())
    }

    async fn set_master(&self, name: &str, master: &str) -> Result<()> {
        let mut state = self.inner.write().await;
        let master_index = state
            .links
            .get(master)
            .map(|l| l.index)
            .ok_or_else(|| Error::device_not_found(master))?;
        state.link_mut(name)?.master = Some(master_index);
        Ok(())
    }

    async fn set_link_up(&self, name: &str) -> Result<()> {
        self.inner.write().await.link_mut(name)?.up = true;
        Ok(())
    }

    async fn addresses(&self, device: &str) -> Result<Vec<IpPrefix>> {
        let state = self.inner.read().await;
        let link = state
            .links
            .get(device)
            .ok_or_else(|| Error::device_not_found(device))?;
        Ok(link.addresses.iter().copied().collect())
    }

    async fn index_addresses(&self, ifindex: u32) -> Result<Vec<IpAddr>> {
        let state = self.inner.read().await;
        Ok(state
            .links
            .values()
            .find(|l| l.index == ifindex)
            .map(|l| l.addresses.iter().map(|a| a.addr()).collect())
            .unwrap_or_default())
    }

    async fn add_address(&self, device: &str, addr: IpPrefix) -> Result<bool> {
        Ok(self.inner.write().await.link_mut(device)?.addresses.insert(addr))
    }

    async fn del_address(&self, device: &str, addr: IpPrefix) -> Result<()> {
        if let Some(link) = self.inner.write().await.links.get_mut(device) {
            link.addresses.remove(&addr);
        }
        Ok(())
    }

    async fn rules(&self, family: Family) -> Result<Vec<IpRule>> {
        Ok(self
            .inner
            .read()
            .await
            .rules
            .iter()
            .filter(|r| r.family() == family)
            .copied()
            .collect())
    }

    async fn add_rule(&self, rule: &IpRule) -> Result<()> {
        self.inner.write().await.rules.insert(*rule);
        Ok(())
    }

    async fn del_rule(&self, rule: &IpRule) -> Result<()> {
        self.inner.write().await.rules.remove(rule);
        Ok(())
    }

    async fn routes(&self, table: u32) -> Result<Vec<KernelRoute>> {
        Ok(self
            .inner
            .read()
            .await
            .routes
            .iter()
            .filter(|r| r.table == table)
            .cloned()
            .collect())
    }

    async fn route_exists(&self, route: &KernelRoute) -> Result<bool> {
        Ok(self
            .inner
            .read()
            .await
            .routes
            .iter()
            .any(|r| same_route(r, route)))
    }

    async fn add_route(&self, route: &KernelRoute) -> Result<()> {
        let mut state = self.inner.write().await;
        if let Some(oif) = route.oif {
            if !state.links.values().any(|l| l.index == oif) {
                return Err(Error::kernel(format!("no device with index {}", oif)));
            }
        }
        if !state.routes.iter().any(|r| same_route(r, route)) {
            state.routes.push(route.clone());
            self.route_adds.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn del_route(&self, route: &KernelRoute) -> Result<()> {
        self.inner
            .write()
            .await
            .routes
            .retain(|r| !same_route(r, route));
        Ok(())
    }

    async fn add_neighbor(&self, entry: &NeighborEntry) -> Result<()> {
        self.inner.write().await.neighbors.insert(entry.clone());
        Ok(())
    }

    async fn del_neighbor(&self, entry: &NeighborEntry) -> Result<()> {
        self.inner.write().await.neighbors.remove(entry);
        Ok(())
    }

    async fn add_ndp_proxy(&self, proxy: &NdpProxy) -> Result<()> {
        self.inner.write().await.ndp_proxies.insert(proxy.clone());
        Ok(())
    }

    async fn del_ndp_proxy(&self, proxy: &NdpProxy) -> Result<()> {
        self.inner.write().await.ndp_proxies.remove(proxy);
        Ok(())
    }

    async fn set_kernel_flag(&self, flag: &KernelFlag, value: bool) -> Result<()> {
        self.inner
            .write()
            .await
            .flags
            .insert(flag.sysctl_key(), value);
        Ok(())
    }
}

/// Factory for the in-memory kernel
pub struct MemoryKernelFactory;

impl KernelNetworkFactory for MemoryKernelFactory {
    fn create(&self, config: &BackendConfig) -> Result<Arc<dyn KernelNetwork>> {
        match config {
            BackendConfig::Memory => Ok(Arc::new(MemoryKernel::new())),
            other => Err(Error::config(format!(
                "memory kernel factory cannot build a {} backend",
                other.type_name()
            ))),
        }
    }
}
