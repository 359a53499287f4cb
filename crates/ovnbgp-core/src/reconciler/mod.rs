// # Linux Network Reconciler
//
// Turns exposure decisions into kernel objects through `KernelNetwork`.
//
// ## Guarantees
//
// - Every ensure/add is idempotent; running it twice leaves the kernel as
//   running it once.
// - Literals are validated before any kernel call (`Error::InvalidAddress`).
// - Kernel failures propagate unchanged. The only retry is a single device
//   creation when a VLAN sub-interface cannot be resolved.
// - Stale route cleanup never deletes BGP-learned routes.

pub mod tables;

pub use tables::RoutingTables;

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::net::{
    DeviceRef, DeviceSpec, Family, IpPrefix, IpRule, KernelFlag, KernelRoute, MacAddr, NdpProxy,
    NeighborEntry, RouteEntry, RouteProtocol,
};
use crate::traits::KernelNetwork;

/// Base of the IPv6 address put on bridges to enable NDP
const NDP_BASE: u128 = 0xfd53_d91e_0400_7f17_0000_0000_0000_0000;

/// Kernel reconciler
///
/// Owns the tracked routing state. Callers serialize access (the exposure
/// controller keeps it behind a mutex), so no device is ever mutated by two
/// calls at once.
pub struct LinuxNet {
    kernel: Arc<dyn KernelNetwork>,
    tables: RoutingTables,
}

impl LinuxNet {
    pub fn new(kernel: Arc<dyn KernelNetwork>) -> Self {
        Self {
            kernel,
            tables: RoutingTables::new(),
        }
    }

    pub fn kernel(&self) -> &Arc<dyn KernelNetwork> {
        &self.kernel
    }

    pub fn tables(&self) -> &RoutingTables {
        &self.tables
    }

    pub fn tables_mut(&mut self) -> &mut RoutingTables {
        &mut self.tables
    }

    async fn require_index(&self, name: &str) -> Result<u32> {
        self.kernel
            .link_index(name)
            .await?
            .ok_or_else(|| Error::device_not_found(name))
    }

    // ---- devices ----

    /// Ensure a VRF bound to `table` exists and is up
    pub async fn ensure_vrf(&self, name: &str, table: u32) -> Result<()> {
        self.kernel
            .create_device(&DeviceSpec::Vrf {
                name: name.to_string(),
                table,
            })
            .await?;
        self.kernel.set_link_up(name).await
    }

    pub async fn ensure_dummy_device(&self, name: &str) -> Result<()> {
        self.kernel
            .create_device(&DeviceSpec::Dummy {
                name: name.to_string(),
            })
            .await?;
        self.kernel.set_link_up(name).await
    }

    /// Ensure the BGP dummy device exists inside `vrf`
    ///
    /// The master is only rewritten when it differs.
    pub async fn ensure_ovn_device(&self, name: &str, vrf: &str) -> Result<()> {
        self.ensure_dummy_device(name).await?;
        let vrf_index = self.require_index(vrf).await?;
        if self.kernel.link_master(name).await? != Some(vrf_index) {
            debug!("Enslaving {} to {}", name, vrf);
            self.kernel.set_master(name, vrf).await?;
        }
        Ok(())
    }

    pub async fn ensure_vxlan(&self, name: &str, vni: u32, local: IpAddr, dstport: u16) -> Result<()> {
        self.kernel
            .create_device(&DeviceSpec::Vxlan {
                name: name.to_string(),
                vni,
                local,
                dstport,
            })
            .await?;
        self.kernel.set_link_up(name).await
    }

    pub async fn ensure_veth(&self, name: &str, peer: &str) -> Result<()> {
        self.kernel
            .create_device(&DeviceSpec::Veth {
                name: name.to_string(),
                peer: peer.to_string(),
            })
            .await?;
        self.kernel.set_link_up(name).await?;
        self.kernel.set_link_up(peer).await
    }

    pub async fn delete_device(&self, name: &str) -> Result<()> {
        self.kernel.delete_device(name).await
    }

    /// Ensure the VLAN sub-interface of a provider bridge, with proxy ARP/NDP
    pub async fn ensure_vlan_device_for_network(&self, bridge: &str, vlan: u16) -> Result<()> {
        let spec = DeviceSpec::Vlan {
            parent: bridge.to_string(),
            vlan_id: vlan,
        };
        let name = spec.name();
        self.kernel.create_device(&spec).await?;
        self.kernel.set_link_up(&name).await?;

        let device = DeviceRef::new(name);
        self.kernel
            .set_kernel_flag(&KernelFlag::ProxyArp(device.clone()), true)
            .await?;
        self.kernel
            .set_kernel_flag(&KernelFlag::ProxyNdp(device), true)
            .await
    }

    pub async fn delete_vlan_device_for_network(&self, bridge: &str, vlan: u16) -> Result<()> {
        self.delete_device(DeviceRef::new(bridge).vlan(vlan).as_str())
            .await
    }

    /// Put the per-bridge neighbour discovery addresses on a bridge
    ///
    /// `offset` is the 1-based position of the bridge among the mappings.
    /// Proxy ARP/NDP is only switched on for untagged bridges; tagged ones get
    /// it on their VLAN device instead.
    pub async fn ensure_arp_ndp_enabled_for_bridge(
        &self,
        bridge: &str,
        offset: u32,
        vlan: Option<u16>,
    ) -> Result<()> {
        let (v4, v6) = arp_ndp_addresses(offset)?;
        for addr in [v4, v6] {
            if !self.kernel.add_address(bridge, addr).await? {
                debug!("{} already present on {}", addr, bridge);
            }
        }

        if vlan.is_none() {
            let device = DeviceRef::new(bridge);
            self.kernel
                .set_kernel_flag(&KernelFlag::ProxyArp(device.clone()), true)
                .await?;
            self.kernel
                .set_kernel_flag(&KernelFlag::ProxyNdp(device), true)
                .await?;
        }
        Ok(())
    }

    /// Register the bridge table and make sure it routes out of the bridge
    ///
    /// Creates the IPv4 and IPv6 default routes via the bridge when they are
    /// missing. Returns every other route found in the table: defaults via
    /// other devices and all non-default routes. Those are candidates for
    /// [`LinuxNet::delete_bridge_ip_routes`].
    pub async fn ensure_routing_table_for_bridge(
        &mut self,
        bridge: &str,
        table: u32,
    ) -> Result<Vec<KernelRoute>> {
        self.tables.register(bridge, table);
        let oif = self.require_index(bridge).await?;

        let mut v4_missing = true;
        let mut v6_missing = true;
        let mut extra = Vec::new();
        for route in self.kernel.routes(table).await? {
            if route.is_default() && route.oif == Some(oif) {
                match route.family() {
                    Family::V4 => v4_missing = false,
                    Family::V6 => v6_missing = false,
                }
            } else {
                extra.push(route);
            }
        }

        for (family, missing) in [(Family::V4, v4_missing), (Family::V6, v6_missing)] {
            if missing {
                let route = KernelRoute::default_via_device(family, table, oif);
                debug!("Creating default route for {}: {}", bridge, route);
                self.kernel.add_route(&route).await?;
            }
        }

        info!(
            "Routing table {} ready for {} ({} extra route(s))",
            table,
            bridge,
            extra.len()
        );
        Ok(extra)
    }

    // ---- addresses ----

    /// Add addresses to a device; returns the ones that were not there yet
    pub async fn add_ips_to_dev(&self, nic: &str, ips: &[IpPrefix]) -> Result<Vec<IpPrefix>> {
        let mut added = Vec::new();
        for ip in ips {
            if self.kernel.add_address(nic, *ip).await? {
                added.push(*ip);
            }
        }
        Ok(added)
    }

    pub async fn del_ips_from_dev(&self, nic: &str, ips: &[IpPrefix]) -> Result<()> {
        for ip in ips {
            self.kernel.del_address(nic, *ip).await?;
        }
        Ok(())
    }

    /// Host addresses (/32, /128) configured on a device
    pub async fn get_exposed_ips(&self, nic: &str) -> Result<Vec<IpAddr>> {
        Ok(self
            .kernel
            .addresses(nic)
            .await?
            .into_iter()
            .filter(IpPrefix::is_host)
            .map(|p| p.addr())
            .collect())
    }

    /// Host addresses of a device inside `network`; a missing device has none
    pub async fn get_exposed_ips_on_network(&self, nic: &str, network: IpPrefix) -> Result<Vec<IpAddr>> {
        if self.kernel.link_index(nic).await?.is_none() {
            debug!("{} does not exist yet, nothing exposed on it", nic);
            return Ok(Vec::new());
        }
        Ok(self
            .get_exposed_ips(nic)
            .await?
            .into_iter()
            .filter(|ip| network.contains(ip))
            .collect())
    }

    pub async fn delete_exposed_ips(&self, ips: &[IpAddr], nic: &str) -> Result<()> {
        for ip in ips {
            self.kernel.del_address(nic, IpPrefix::host(*ip)).await?;
        }
        Ok(())
    }

    // ---- rules and neighbours ----

    /// Rules pointing at any of `tables`, keyed by `"dst/dst_len"`
    pub async fn get_ovn_ip_rules(&self, tables: &[u32]) -> Result<BTreeMap<String, IpRule>> {
        let mut rules = BTreeMap::new();
        for family in [Family::V4, Family::V6] {
            for rule in self.kernel.rules(family).await? {
                if tables.contains(&rule.table) {
                    rules.insert(rule.key(), rule);
                }
            }
        }
        Ok(rules)
    }

    pub async fn delete_ip_rules(&self, rules: impl IntoIterator<Item = IpRule>) -> Result<()> {
        for rule in rules {
            self.kernel.del_rule(&rule).await?;
        }
        Ok(())
    }

    /// Add a rule for `ip` (`addr` or `addr/len`) into `table`
    ///
    /// With a neighbour, a permanent entry mapping the address to `lladdr` is
    /// added on `dev` as well.
    pub async fn add_ip_rule(
        &self,
        ip: &str,
        table: u32,
        neighbor: Option<(&DeviceRef, MacAddr)>,
    ) -> Result<()> {
        let rule = IpRule::parse(ip, table)?;
        debug!("Adding rule {}", rule);
        self.kernel.add_rule(&rule).await?;

        if let Some((dev, lladdr)) = neighbor {
            self.kernel
                .add_neighbor(&NeighborEntry {
                    ip: rule.destination.addr(),
                    lladdr,
                    device: dev.clone(),
                })
                .await?;
        }
        Ok(())
    }

    pub async fn del_ip_rule(
        &self,
        ip: &str,
        table: u32,
        neighbor: Option<(&DeviceRef, MacAddr)>,
    ) -> Result<()> {
        let rule = IpRule::parse(ip, table)?;
        debug!("Deleting rule {}", rule);
        self.kernel.del_rule(&rule).await?;

        if let Some((dev, lladdr)) = neighbor {
            self.kernel
                .del_neighbor(&NeighborEntry {
                    ip: rule.destination.addr(),
                    lladdr,
                    device: dev.clone(),
                })
                .await?;
        }
        Ok(())
    }

    pub async fn add_ndp_proxy(&self, ip: Ipv6Addr, dev: &str, vlan: Option<u16>) -> Result<()> {
        self.kernel
            .add_ndp_proxy(&NdpProxy {
                ip,
                device: proxy_device(dev, vlan),
            })
            .await
    }

    pub async fn del_ndp_proxy(&self, ip: Ipv6Addr, dev: &str, vlan: Option<u16>) -> Result<()> {
        self.kernel
            .del_ndp_proxy(&NdpProxy {
                ip,
                device: proxy_device(dev, vlan),
            })
            .await
    }

    // ---- routes ----

    async fn resolve_out_device(&self, route: &RouteEntry) -> Result<u32> {
        let out = route.out_device();
        if let Some(index) = self.kernel.link_index(out.as_str()).await? {
            return Ok(index);
        }
        match route.vlan {
            Some(vlan) => {
                // the provider network may be newer than the last sync
                debug!("{} missing, creating it and retrying", out);
                self.ensure_vlan_device_for_network(route.device.as_str(), vlan)
                    .await?;
                self.require_index(out.as_str()).await
            }
            None => Err(Error::device_not_found(out.as_str())),
        }
    }

    /// Install a route unless an equivalent one is present, and track it
    pub async fn add_ip_route(&mut self, route: RouteEntry) -> Result<()> {
        let oif = self.resolve_out_device(&route).await?;
        let kernel_route = route.resolve(oif);

        if self.kernel.route_exists(&kernel_route).await? {
            debug!("Route already present: {}", route);
        } else {
            debug!("Creating route at table {}: {}", route.table, route);
            self.kernel.add_route(&kernel_route).await?;
        }
        self.tables.track(route);
        Ok(())
    }

    /// Remove a route and stop tracking it
    ///
    /// If the out device is gone the kernel already dropped its routes, so
    /// only the tracked state of the device is cleared.
    pub async fn del_ip_route(&mut self, route: &RouteEntry) -> Result<()> {
        let out = route.out_device();
        let Some(oif) = self.kernel.link_index(out.as_str()).await? else {
            debug!("{} does not exist, its routes are already gone", out);
            self.tables.forget_device(route.device.as_str());
            return Ok(());
        };

        debug!("Deleting route at table {}: {}", route.table, route);
        self.kernel.del_route(&route.resolve(oif)).await?;
        self.tables.untrack(route);
        Ok(())
    }

    /// Delete observed routes that no tracked route accounts for
    ///
    /// `extra` maps a bridge to the routes found in its table. A tracked
    /// gateway route matches on destination and gateway, a direct one on
    /// destination and output interface (the VLAN device when tagged).
    /// Returns the number of routes deleted.
    pub async fn delete_bridge_ip_routes(
        &mut self,
        mut extra: BTreeMap<String, Vec<KernelRoute>>,
    ) -> Result<usize> {
        for (device, observed) in extra.iter_mut() {
            if observed.is_empty() {
                continue;
            }
            for tracked in self.tables.tracked(device).to_vec() {
                let gateway = tracked.gateway();
                let oif = if gateway.is_some() {
                    None
                } else {
                    match self.kernel.link_index(tracked.out_device().as_str()).await? {
                        Some(index) => Some(index),
                        None => continue,
                    }
                };
                observed.retain(|r| {
                    let same_dst = r.destination == tracked.destination;
                    match gateway {
                        Some(gw) => !(same_dst && r.gateway == Some(gw)),
                        None => !(same_dst && r.oif == oif),
                    }
                });
            }
        }

        let mut deleted = 0;
        for (bridge, routes) in extra {
            for route in routes {
                if route.protocol == RouteProtocol::Bgp {
                    continue;
                }
                info!("Deleting stale route on {}: {}", bridge, route);
                self.kernel.del_route(&route).await?;
                deleted += 1;
            }
        }
        if deleted > 0 {
            warn!("Removed {} stale bridge route(s)", deleted);
        }
        Ok(deleted)
    }
}

/// IPv4 and IPv6 addresses that enable ARP/NDP on the bridge at `offset`
pub fn arp_ndp_addresses(offset: u32) -> Result<(IpPrefix, IpPrefix)> {
    if offset > u32::from(u16::MAX) {
        return Err(Error::invalid_address(format!(
            "bridge offset {} out of range",
            offset
        )));
    }
    let v4 = Ipv4Addr::new(192, 168, (offset / 256) as u8, (offset % 256) as u8);
    let v6 = Ipv6Addr::from(NDP_BASE | u128::from(offset));
    Ok((
        IpPrefix::host(IpAddr::V4(v4)),
        IpPrefix::host(IpAddr::V6(v6)),
    ))
}

fn proxy_device(dev: &str, vlan: Option<u16>) -> DeviceRef {
    let device = DeviceRef::new(dev);
    match vlan {
        Some(tag) => device.vlan(tag),
        None => device,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKernel;
    use crate::net::RouteScope;

    fn setup() -> (MemoryKernel, LinuxNet) {
        let kernel = MemoryKernel::with_links(["br-ex", "bgp-nic"]);
        let net = LinuxNet::new(Arc::new(kernel.clone()));
        (kernel, net)
    }

    #[test]
    fn test_arp_ndp_addresses() {
        let (v4, v6) = arp_ndp_addresses(1).unwrap();
        assert_eq!(v4.to_string(), "192.168.0.1/32");
        assert_eq!(v6.to_string(), "fd53:d91e:400:7f17::1/128");

        let (v4, v6) = arp_ndp_addresses(300).unwrap();
        assert_eq!(v4.to_string(), "192.168.1.44/32");
        assert_eq!(v6.to_string(), "fd53:d91e:400:7f17::12c/128");
    }

    #[tokio::test]
    async fn test_ensure_ovn_device_sets_master_once() {
        let (kernel, net) = setup();
        net.ensure_vrf("bgp-vrf", 10).await.unwrap();
        net.ensure_ovn_device("bgp-nic", "bgp-vrf").await.unwrap();

        let vrf = kernel.link_index("bgp-vrf").await.unwrap();
        assert_eq!(kernel.link_master("bgp-nic").await.unwrap(), vrf);
        assert!(kernel.is_up("bgp-nic").await);
        assert_eq!(kernel.link_kind("bgp-vrf").await.as_deref(), Some("vrf"));

        net.ensure_ovn_device("bgp-nic", "bgp-vrf").await.unwrap();
        assert_eq!(kernel.link_master("bgp-nic").await.unwrap(), vrf);
    }

    #[tokio::test]
    async fn test_ensure_ovn_device_without_vrf_fails() {
        let (_kernel, net) = setup();
        let result = net.ensure_ovn_device("bgp-nic", "bgp-vrf").await;
        assert!(matches!(result, Err(Error::DeviceNotFound(_))));
    }

    #[tokio::test]
    async fn test_arp_ndp_flags_only_untagged() {
        let (kernel, net) = setup();
        kernel.add_link("br-vlan").await;

        net.ensure_arp_ndp_enabled_for_bridge("br-ex", 1, None).await.unwrap();
        net.ensure_arp_ndp_enabled_for_bridge("br-vlan", 2, Some(100))
            .await
            .unwrap();

        let br_ex = DeviceRef::new("br-ex");
        let br_vlan = DeviceRef::new("br-vlan");
        assert_eq!(kernel.flag(&KernelFlag::ProxyArp(br_ex.clone())).await, Some(true));
        assert_eq!(kernel.flag(&KernelFlag::ProxyNdp(br_ex)).await, Some(true));
        assert_eq!(kernel.flag(&KernelFlag::ProxyArp(br_vlan)).await, None);
        assert_eq!(kernel.addresses("br-vlan").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_routing_table_defaults_and_extras() {
        let (kernel, mut net) = setup();
        let bgp_nic = kernel.link_index("bgp-nic").await.unwrap().unwrap();
        let stale = KernelRoute {
            destination: "10.0.1.0/24".parse().unwrap(),
            gateway: None,
            oif: Some(bgp_nic),
            table: 200,
            protocol: RouteProtocol::MANAGED,
            scope: Some(RouteScope::Link),
        };
        kernel.inject_route(stale.clone()).await;

        let extra = net.ensure_routing_table_for_bridge("br-ex", 200).await.unwrap();
        assert_eq!(extra, vec![stale]);
        assert_eq!(net.tables().table_for("br-ex"), Some(200));

        let routes = kernel.routes(200).await.unwrap();
        assert_eq!(routes.iter().filter(|r| r.is_default()).count(), 2);

        // second run finds both defaults
        let before = kernel.route_adds();
        net.ensure_routing_table_for_bridge("br-ex", 200).await.unwrap();
        assert_eq!(kernel.route_adds(), before);
    }

    #[tokio::test]
    async fn test_add_ip_rule_rejects_bad_literal_before_kernel() {
        let (kernel, net) = setup();
        let result = net.add_ip_rule("10.0.0.1/24/8", 200, None).await;

        assert!(matches!(result, Err(Error::InvalidAddress(_))));
        assert!(kernel.snapshot().await.rules.is_empty());
    }

    #[tokio::test]
    async fn test_add_ip_rule_with_neighbor() {
        let (kernel, net) = setup();
        let dev = DeviceRef::new("br-ex");
        let mac: MacAddr = "fa:16:3e:11:22:33".parse().unwrap();

        net.add_ip_rule("172.24.4.10", 200, Some((&dev, mac))).await.unwrap();
        let snap = kernel.snapshot().await;
        assert!(snap.rules.contains(&IpRule::parse("172.24.4.10/32", 200).unwrap()));
        assert_eq!(snap.neighbors.len(), 1);

        net.del_ip_rule("172.24.4.10", 200, Some((&dev, mac))).await.unwrap();
        let snap = kernel.snapshot().await;
        assert!(snap.rules.is_empty());
        assert!(snap.neighbors.is_empty());
    }

    #[tokio::test]
    async fn test_add_ip_route_only_writes_once() {
        let (kernel, mut net) = setup();
        let route = RouteEntry::new("172.24.4.10".parse().unwrap(), None, 200, "br-ex").unwrap();

        net.add_ip_route(route.clone()).await.unwrap();
        net.add_ip_route(route.clone()).await.unwrap();

        assert_eq!(kernel.route_adds(), 1);
        assert_eq!(net.tables().len(), 1);

        net.del_ip_route(&route).await.unwrap();
        assert!(kernel.routes(200).await.unwrap().is_empty());
        assert!(net.tables().is_empty());
    }

    #[tokio::test]
    async fn test_add_ip_route_creates_missing_vlan_device() {
        let (kernel, mut net) = setup();
        let route = RouteEntry::new("172.24.4.10".parse().unwrap(), None, 200, "br-ex")
            .unwrap()
            .on_vlan(Some(100));

        net.add_ip_route(route).await.unwrap();

        let vlan = kernel.link_index("br-ex.100").await.unwrap().unwrap();
        let routes = kernel.routes(200).await.unwrap();
        assert_eq!(routes[0].oif, Some(vlan));
        assert_eq!(
            kernel
                .flag(&KernelFlag::ProxyArp(DeviceRef::new("br-ex.100")))
                .await,
            Some(true)
        );
    }

    #[tokio::test]
    async fn test_add_ip_route_missing_device() {
        let (_kernel, mut net) = setup();
        let route = RouteEntry::new("172.24.4.10".parse().unwrap(), None, 200, "br-nope").unwrap();

        let result = net.add_ip_route(route).await;
        assert!(matches!(result, Err(Error::DeviceNotFound(_))));
        assert!(net.tables().is_empty());
    }

    #[tokio::test]
    async fn test_del_ip_route_on_vanished_device() {
        let (kernel, mut net) = setup();
        let route = RouteEntry::new("172.24.4.10".parse().unwrap(), None, 200, "br-ex").unwrap();
        net.add_ip_route(route.clone()).await.unwrap();

        kernel.delete_device("br-ex").await.unwrap();
        net.del_ip_route(&route).await.unwrap();
        assert!(net.tables().tracked("br-ex").is_empty());
    }

    #[tokio::test]
    async fn test_exposed_ips_filters_hosts() {
        let (kernel, net) = setup();
        kernel
            .add_address("bgp-nic", "172.24.4.10/32".parse().unwrap())
            .await
            .unwrap();
        kernel
            .add_address("bgp-nic", "10.0.0.1/24".parse().unwrap())
            .await
            .unwrap();

        let ips = net.get_exposed_ips("bgp-nic").await.unwrap();
        assert_eq!(ips, vec!["172.24.4.10".parse::<IpAddr>().unwrap()]);

        let none = net
            .get_exposed_ips_on_network("bgp-nic", "192.168.0.0/16".parse().unwrap())
            .await
            .unwrap();
        assert!(none.is_empty());
        let missing = net
            .get_exposed_ips_on_network("nope", "0.0.0.0/0".parse().unwrap())
            .await
            .unwrap();
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn test_get_ovn_ip_rules_by_table() {
        let (kernel, net) = setup();
        kernel.inject_rule(IpRule::parse("172.24.4.10", 200).unwrap()).await;
        kernel.inject_rule(IpRule::parse("2001:db8::10", 200).unwrap()).await;
        kernel.inject_rule(IpRule::parse("10.1.1.1", 50).unwrap()).await;

        let rules = net.get_ovn_ip_rules(&[200]).await.unwrap();
        assert_eq!(rules.len(), 2);
        assert!(rules.contains_key("172.24.4.10/32"));
        assert!(rules.contains_key("2001:db8::10/128"));
    }
}
