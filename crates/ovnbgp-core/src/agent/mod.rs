// # Exposure Controller
//
// Decides what this node advertises and drives the reconciler to make the
// kernel match.
//
// ## How addresses get advertised
//
// An address is advertised by putting it on the BGP dummy device (inside the
// BGP VRF); the routing daemon picks it up from there. Traffic coming back
// for it is steered into the provider bridge's routing table by a policy
// rule plus a route out of the bridge (or its VLAN device).
//
// ## Port kinds
//
// - VM or virtual port on a provider network: its own addresses
// - VM port on a tenant network: its floating IP, if any
// - Patch port: NAT addresses resident on a chassis-redirect port here
// - Chassis-redirect port: gateway addresses, then the tenant networks and
//   load balancers behind the router
//
// All operations are serialized by one mutex; no two calls touch the kernel
// concurrently.

pub mod state;

pub use state::{CrLrpInfo, ExposedAddress, LocalState};

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::net::{DeviceRef, Family, IpPrefix, IpRule, KernelRoute, MacAddr, RouteEntry};
use crate::ovn::{port_type, PortBinding, LRP_PREFIX, REDIRECT_OPTION};
use crate::reconciler::{LinuxNet, RoutingTables};
use crate::traits::{AgentView, ExposureActions, KernelNetwork, Lifecycle, SouthboundDb};

struct Inner {
    state: LocalState,
    net: LinuxNet,
}

/// Kernel objects found before a sync that nothing has claimed yet
#[derive(Debug, Default)]
struct Leftovers {
    ips: BTreeSet<IpAddr>,
    rules: BTreeMap<String, IpRule>,
}

impl Leftovers {
    fn claim(&mut self, ip: IpAddr) {
        self.ips.remove(&ip);
        self.rules.remove(&IpPrefix::host(ip).to_string());
    }

    fn claim_rule(&mut self, prefix: &IpPrefix) {
        self.rules.remove(&prefix.to_string());
    }
}

fn addresses(ips: &[IpPrefix]) -> Vec<IpAddr> {
    ips.iter().map(IpPrefix::addr).collect()
}

fn host_route(ip: IpAddr, table: u32, bridge: &str, vlan: Option<u16>) -> Result<RouteEntry> {
    Ok(RouteEntry::new(ip, Some(Family::of(&ip).max_len()), table, bridge)?.on_vlan(vlan))
}

/// The node's exposure controller
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use ovnbgp_core::agent::ExposureController;
/// use ovnbgp_core::config::AgentConfig;
/// use ovnbgp_core::memory::{MemoryKernel, MemorySouthbound};
/// use ovnbgp_core::traits::ExposureActions;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = AgentConfig::new("chassis-a").with_bridge_mapping("public", "br-ex", 200);
///     let controller = ExposureController::new(
///         config,
///         Arc::new(MemorySouthbound::new()),
///         Arc::new(MemoryKernel::with_links(["br-ex"])),
///     );
///     controller.sync().await?;
///     Ok(())
/// }
/// ```
pub struct ExposureController {
    chassis: String,
    config: AgentConfig,
    sb: Arc<dyn SouthboundDb>,
    inner: Mutex<Inner>,
}

impl ExposureController {
    pub fn new(
        config: AgentConfig,
        sb: Arc<dyn SouthboundDb>,
        kernel: Arc<dyn KernelNetwork>,
    ) -> Self {
        Self {
            chassis: config.chassis.clone(),
            inner: Mutex::new(Inner {
                state: LocalState::new(),
                net: LinuxNet::new(kernel),
            }),
            config,
            sb,
        }
    }

    pub fn chassis(&self) -> &str {
        &self.chassis
    }

    /// Copy of the current local state
    pub async fn state(&self) -> LocalState {
        self.inner.lock().await.state.clone()
    }

    /// Copy of the tracked routing tables
    pub async fn routing_tables(&self) -> RoutingTables {
        self.inner.lock().await.net.tables().clone()
    }

    fn bgp_nic(&self) -> &str {
        &self.config.bgp.nic
    }

    fn tenant_enabled(&self) -> bool {
        self.config.exposure.tenant_enabled()
    }

    /// Whether a tenant prefix passes the exposure toggles
    fn tenant_allowed(&self, prefix: &IpPrefix) -> bool {
        self.config.exposure.expose_tenant_networks || prefix.is_ipv6_gua()
    }

    fn table_for(&self, bridge: &str) -> Result<u32> {
        self.config
            .bridge_mappings
            .iter()
            .find(|m| m.bridge == bridge)
            .map(|m| m.table_id)
            .ok_or_else(|| Error::config(format!("no routing table for bridge {}", bridge)))
    }

    /// Bridge (and VLAN) serving a provider datapath
    async fn bridge_for_datapath(&self, datapath: &str) -> Result<Option<(String, Option<u16>)>> {
        let networks: Vec<String> = self
            .config
            .bridge_mappings
            .iter()
            .map(|m| m.network.clone())
            .collect();
        let Some((network, tag)) = self.sb.network_name_and_tag(datapath, &networks).await? else {
            return Ok(None);
        };
        Ok(self
            .config
            .bridge_for_network(&network)
            .map(|m| (m.bridge.clone(), tag)))
    }

    async fn expose_provider_port(
        &self,
        inner: &mut Inner,
        ips: &[IpAddr],
        bridge: Option<(String, Option<u16>)>,
        lladdr: Option<MacAddr>,
    ) -> Result<bool> {
        let Some((bridge, vlan)) = bridge else {
            warn!("No bridge mapped for {:?}, not exposing", ips);
            return Ok(false);
        };
        let table = self.table_for(&bridge)?;
        let hosts: Vec<IpPrefix> = ips.iter().copied().map(IpPrefix::host).collect();
        inner.net.add_ips_to_dev(self.bgp_nic(), &hosts).await?;

        let device = DeviceRef::new(bridge.as_str());
        for ip in ips {
            inner
                .net
                .add_ip_rule(&ip.to_string(), table, lladdr.map(|mac| (&device, mac)))
                .await?;
            inner
                .net
                .add_ip_route(host_route(*ip, table, &bridge, vlan)?)
                .await?;
        }
        Ok(true)
    }

    async fn withdraw_provider_port(
        &self,
        inner: &mut Inner,
        ips: &[IpAddr],
        bridge: Option<(String, Option<u16>)>,
        lladdr: Option<MacAddr>,
    ) -> Result<()> {
        if ips.is_empty() {
            return Ok(());
        }
        let hosts: Vec<IpPrefix> = ips.iter().copied().map(IpPrefix::host).collect();
        inner.net.del_ips_from_dev(self.bgp_nic(), &hosts).await?;

        let Some((bridge, vlan)) = bridge else {
            warn!("No bridge mapped for {:?}, only removed the addresses", ips);
            return Ok(());
        };
        let table = self.table_for(&bridge)?;
        let device = DeviceRef::new(bridge.as_str());
        for ip in ips {
            inner
                .net
                .del_ip_rule(&ip.to_string(), table, lladdr.map(|mac| (&device, mac)))
                .await?;
            inner
                .net
                .del_ip_route(&host_route(*ip, table, &bridge, vlan)?)
                .await?;
        }
        Ok(())
    }

    /// Expose the addresses not yet tracked for `owner`
    async fn expose_owned(
        &self,
        inner: &mut Inner,
        ips: &[IpAddr],
        owner: &str,
        associated: Option<&str>,
        datapath: &str,
    ) -> Result<Vec<IpAddr>> {
        let fresh: Vec<IpAddr> = ips
            .iter()
            .copied()
            .filter(|ip| !inner.state.is_exposed_by(*ip, owner))
            .collect();
        if fresh.is_empty() {
            debug!("{:?} already exposed for {}", ips, owner);
            return Ok(ips.to_vec());
        }

        let bridge = self.bridge_for_datapath(datapath).await?;
        if !self.expose_provider_port(inner, &fresh, bridge, None).await? {
            return Ok(Vec::new());
        }
        for ip in &fresh {
            inner.state.track_exposed(*ip, owner, associated);
        }
        info!("Exposed {:?} for port {}", fresh, owner);
        Ok(ips.to_vec())
    }

    /// Withdraw the addresses tracked for `owner`
    ///
    /// Addresses still exposed by another owner stay in the kernel.
    async fn withdraw_owned(
        &self,
        inner: &mut Inner,
        ips: &[IpAddr],
        owner: &str,
        datapath: &str,
    ) -> Result<()> {
        let tracked: Vec<IpAddr> = ips
            .iter()
            .copied()
            .filter(|ip| inner.state.untrack_exposed(*ip, owner))
            .collect();
        if tracked.is_empty() {
            debug!("Nothing exposed for {} among {:?}", owner, ips);
            return Ok(());
        }

        let released: Vec<IpAddr> = tracked
            .into_iter()
            .filter(|ip| !inner.state.is_exposed(*ip))
            .collect();
        let bridge = self.bridge_for_datapath(datapath).await?;
        self.withdraw_provider_port(inner, &released, bridge, None)
            .await?;
        info!("Withdrew {:?} for port {}", released, owner);
        Ok(())
    }

    async fn expose_ip_locked(
        &self,
        inner: &mut Inner,
        ips: &[IpPrefix],
        row: &PortBinding,
        associated: Option<&str>,
        leftovers: &mut Leftovers,
    ) -> Result<Vec<IpAddr>> {
        let kind = row.kind().unwrap_or_default();
        let name = row.name();

        if port_type::is_vif(kind) {
            let Some(datapath) = row.datapath.as_deref() else {
                return Ok(Vec::new());
            };
            if self.sb.is_provider_network(datapath).await? {
                return self
                    .expose_owned(inner, &addresses(ips), name, None, datapath)
                    .await;
            }
            // tenant VM: only its floating IP is reachable from outside
            return match self.sb.get_fip_associated(name).await? {
                Some((fip, fip_datapath)) => {
                    self.expose_owned(inner, &[fip], name, None, &fip_datapath)
                        .await
                }
                None => Ok(Vec::new()),
            };
        }

        if kind == port_type::PATCH {
            let Some(associated) = associated else {
                return Ok(Vec::new());
            };
            if !self.sb.is_port_on_chassis(associated, &self.chassis).await? {
                debug!("{} is not on this chassis, skipping {:?}", associated, ips);
                return Ok(Vec::new());
            }
            let Some(datapath) = row.datapath.as_deref() else {
                return Ok(Vec::new());
            };
            return self
                .expose_owned(inner, &addresses(ips), name, Some(associated), datapath)
                .await;
        }

        if kind == port_type::CHASSIS_REDIRECT && row.is_cr_lrp() {
            return self.expose_cr_lrp(inner, ips, row, leftovers).await;
        }
        Ok(Vec::new())
    }

    async fn expose_cr_lrp(
        &self,
        inner: &mut Inner,
        ips: &[IpPrefix],
        row: &PortBinding,
        leftovers: &mut Leftovers,
    ) -> Result<Vec<IpAddr>> {
        let name = row.name().to_string();
        let Some(provider_datapath) = self.sb.provider_datapath_from_cr_lrp(&name).await? else {
            debug!("No provider datapath for {}", name);
            return Ok(Vec::new());
        };
        let addrs = addresses(ips);
        if inner.state.cr_lrps.contains_key(&name)
            && addrs.iter().all(|ip| inner.state.is_exposed_by(*ip, &name))
        {
            debug!("Gateway port {} already exposed", name);
            return Ok(addrs);
        }

        let bridge = self.bridge_for_datapath(&provider_datapath).await?;
        let mac = row.mac_address().and_then(|m| m.parse::<MacAddr>().ok());
        inner.state.cr_lrps.insert(
            name.clone(),
            CrLrpInfo {
                router_datapath: row.datapath.clone(),
                provider_datapath: provider_datapath.clone(),
                ips: ips.to_vec(),
                bridge_device: bridge.as_ref().map(|(b, _)| b.clone()),
                bridge_vlan: bridge.as_ref().and_then(|(_, v)| *v),
                mac,
                ..Default::default()
            },
        );

        if self
            .expose_provider_port(inner, &addrs, bridge.clone(), mac)
            .await?
        {
            for ip in &addrs {
                inner.state.track_exposed(*ip, &name, None);
            }
            if let Some((device, vlan)) = &bridge {
                for ip in &addrs {
                    if let IpAddr::V6(v6) = ip {
                        inner.net.add_ndp_proxy(*v6, device, *vlan).await?;
                    }
                }
            }
            info!("Exposed gateway port {} with {:?}", name, addrs);
        }

        if let Some(router_datapath) = row.datapath.as_deref() {
            self.collect_router_subnets(inner, &name, router_datapath, leftovers)
                .await?;
        }
        self.expose_lbs_for_cr_lrp(inner, &name, &provider_datapath, leftovers)
            .await?;
        Ok(addrs)
    }

    /// Record the tenant networks behind a gateway port, exposing them when
    /// tenant exposure is on
    async fn collect_router_subnets(
        &self,
        inner: &mut Inner,
        cr_lrp: &str,
        router_datapath: &str,
        leftovers: &mut Leftovers,
    ) -> Result<()> {
        for lrp in self.sb.lrp_ports_for_router(router_datapath).await? {
            if lrp.first_chassis().is_some()
                || !lrp.is_router_port()
                || lrp.has_option(REDIRECT_OPTION)
            {
                continue;
            }
            let lrp_name = lrp.name().to_string();
            let switch_port = lrp_name.strip_prefix(LRP_PREFIX).unwrap_or(&lrp_name);
            let subnet_datapath = self.sb.port_datapath(switch_port).await?;
            let cidr = lrp.mac_ips().and_then(|ips| ips.first().copied());

            if let Some(info) = inner.state.cr_lrps.get_mut(cr_lrp) {
                if let Some(dp) = subnet_datapath {
                    info.subnets_datapath.insert(lrp_name.clone(), dp);
                }
                if let Some(cidr) = cidr {
                    if !info.subnets_cidr.contains(&cidr) {
                        info.subnets_cidr.push(cidr);
                    }
                }
            }

            if self.tenant_enabled() {
                self.ensure_network_exposed(inner, &lrp, cr_lrp, leftovers)
                    .await?;
            }
        }
        Ok(())
    }

    async fn expose_lbs_for_cr_lrp(
        &self,
        inner: &mut Inner,
        cr_lrp: &str,
        provider_datapath: &str,
        leftovers: &mut Leftovers,
    ) -> Result<()> {
        let subnet_datapaths: BTreeSet<String> = inner
            .state
            .cr_lrps
            .get(cr_lrp)
            .map(|info| info.subnets_datapath.values().cloned().collect())
            .unwrap_or_default();

        for lb in self.sb.ovn_lbs_on_provider_datapath(provider_datapath).await? {
            let attached = lb.attached_datapaths().unwrap_or_default();
            if !attached.iter().any(|dp| subnet_datapaths.contains(dp)) {
                continue;
            }
            for vip in lb.vip_addresses() {
                self.expose_lb_locked(inner, lb.name(), vip, cr_lrp).await?;
                leftovers.claim(vip);
            }
        }
        Ok(())
    }

    /// Rule and route for a tenant network behind a local gateway, plus the
    /// addresses of the workloads on it
    async fn ensure_network_exposed(
        &self,
        inner: &mut Inner,
        lrp: &PortBinding,
        cr_lrp: &str,
        leftovers: &mut Leftovers,
    ) -> Result<()> {
        let Some(info) = inner.state.cr_lrps.get(cr_lrp).cloned() else {
            return Ok(());
        };
        let Some(router_ip) = lrp.mac_ips().and_then(|ips| ips.first().copied()) else {
            return Ok(());
        };
        if !self.tenant_allowed(&router_ip) || info.has_gateway_ip(&router_ip.addr()) {
            return Ok(());
        }

        inner
            .state
            .lrps
            .insert(lrp.name().to_string(), cr_lrp.to_string());
        let Some((bridge, vlan)) = info.bridge() else {
            return Ok(());
        };
        let table = self.table_for(&bridge)?;
        let subnet = router_ip.network();

        inner.net.add_ip_rule(&subnet.to_string(), table, None).await?;
        leftovers.claim_rule(&subnet);

        if let Some(gateway) = info.gateway_for(&router_ip) {
            let route = RouteEntry::new(router_ip.addr(), Some(router_ip.len()), table, bridge.as_str())?
                .via(gateway)
                .on_vlan(vlan);
            inner.net.add_ip_route(route).await?;
        }

        let Some(peer) = lrp.option("peer") else {
            return Ok(());
        };
        if let Some(network_datapath) = self.sb.port_datapath(peer).await? {
            for port in self.sb.ports_on_datapath(&network_datapath, None).await? {
                self.expose_tenant_port(inner, &port, router_ip.family(), leftovers)
                    .await?;
            }
        }
        info!("Exposed tenant network {} behind {}", subnet, cr_lrp);
        Ok(())
    }

    async fn expose_tenant_port(
        &self,
        inner: &mut Inner,
        port: &PortBinding,
        family: Family,
        leftovers: &mut Leftovers,
    ) -> Result<()> {
        let unbound = port.first_chassis().is_none();
        let no_mac = port.mac.as_ref().is_none_or(|m| m.is_empty());

        // load balancer VIP on a tenant network
        if no_mac && unbound && port.is_up() == Some(false) {
            if let Some(vip) = port.cidr_ips().and_then(|ips| ips.first().copied()) {
                inner.net.add_ips_to_dev(self.bgp_nic(), &[vip]).await?;
                inner.state.track_exposed(vip.addr(), port.name(), None);
                leftovers.claim(vip.addr());
            }
            return Ok(());
        }

        let kind = port.kind().unwrap_or_default();
        if no_mac || !port_type::is_vif(kind) || (kind == port_type::VM && unbound) {
            return Ok(());
        }
        let Some(ips) = port.mac_ips() else {
            return Ok(());
        };
        for ip in ips.into_iter().filter(|ip| ip.family() == family) {
            inner
                .net
                .add_ips_to_dev(self.bgp_nic(), &[IpPrefix::host(ip.addr())])
                .await?;
            inner.state.track_exposed(ip.addr(), port.name(), None);
            leftovers.claim(ip.addr());
        }
        Ok(())
    }

    /// Drop workload addresses inside `network` from the BGP device
    async fn withdraw_network_ips(&self, inner: &mut Inner, network: IpPrefix) -> Result<()> {
        let on_network = inner
            .net
            .get_exposed_ips_on_network(self.bgp_nic(), network)
            .await?;
        if on_network.is_empty() {
            return Ok(());
        }
        inner
            .net
            .delete_exposed_ips(&on_network, self.bgp_nic())
            .await?;
        for ip in on_network {
            inner.state.untrack_ip(ip);
        }
        Ok(())
    }

    async fn remove_network_exposed(
        &self,
        inner: &mut Inner,
        subnet: IpPrefix,
        info: &CrLrpInfo,
    ) -> Result<()> {
        for lrp in info.subnets_datapath.keys() {
            inner.state.lrps.remove(lrp);
        }
        let Some((bridge, vlan)) = info.bridge() else {
            return Ok(());
        };
        let table = self.table_for(&bridge)?;

        inner
            .net
            .del_ip_rule(&subnet.network().to_string(), table, None)
            .await?;
        if let Some(gateway) = info.gateway_for(&subnet) {
            let route = RouteEntry::new(subnet.addr(), Some(subnet.len()), table, bridge.as_str())?
                .via(gateway)
                .on_vlan(vlan);
            inner.net.del_ip_route(&route).await?;
        }
        self.withdraw_network_ips(inner, subnet.network()).await
    }

    async fn withdraw_ip_locked(
        &self,
        inner: &mut Inner,
        ips: &[IpPrefix],
        row: &PortBinding,
        associated: Option<&str>,
    ) -> Result<()> {
        let kind = row.kind().unwrap_or_default();
        let name = row.name();

        if port_type::is_vif(kind) {
            let Some(datapath) = row.datapath.as_deref() else {
                return Ok(());
            };
            if self.sb.is_provider_network(datapath).await? {
                return self
                    .withdraw_owned(inner, &addresses(ips), name, datapath)
                    .await;
            }
            if let Some((fip, fip_datapath)) = self.sb.get_fip_associated(name).await? {
                self.withdraw_owned(inner, &[fip], name, &fip_datapath)
                    .await?;
            }
            return Ok(());
        }

        if kind == port_type::PATCH {
            let Some(associated) = associated else {
                return Ok(());
            };
            let relevant = self.sb.is_port_on_chassis(associated, &self.chassis).await?
                || self.sb.is_port_deleted(associated).await?;
            if !relevant {
                return Ok(());
            }
            let Some(datapath) = row.datapath.as_deref() else {
                return Ok(());
            };
            return self
                .withdraw_owned(inner, &addresses(ips), name, datapath)
                .await;
        }

        if kind == port_type::CHASSIS_REDIRECT && row.is_cr_lrp() {
            return self.withdraw_cr_lrp(inner, ips, row).await;
        }
        Ok(())
    }

    async fn withdraw_cr_lrp(
        &self,
        inner: &mut Inner,
        ips: &[IpPrefix],
        row: &PortBinding,
    ) -> Result<()> {
        let name = row.name();
        let Some(info) = inner.state.cr_lrps.get(name).cloned() else {
            debug!("Gateway port {} is not exposed here", name);
            return Ok(());
        };
        let addrs = addresses(ips);
        let lladdr = row
            .mac_address()
            .and_then(|m| m.parse::<MacAddr>().ok())
            .or(info.mac);
        let bridge = info.bridge();

        for ip in &addrs {
            inner.state.untrack_exposed(*ip, name);
        }
        self.withdraw_provider_port(inner, &addrs, bridge.clone(), lladdr)
            .await?;

        if let Some((device, vlan)) = &bridge {
            if inner.state.cr_lrps_on_provider(&info.provider_datapath) > 1 {
                for ip in &addrs {
                    if let IpAddr::V6(v6) = ip {
                        inner.net.del_ndp_proxy(*v6, device, *vlan).await?;
                    }
                }
            }
        }

        for cidr in &info.subnets_cidr {
            self.remove_network_exposed(inner, *cidr, &info).await?;
        }
        for lb in &info.ovn_lbs {
            self.withdraw_lb_locked(inner, lb, name).await?;
        }
        inner.state.cr_lrps.remove(name);
        info!("Withdrew gateway port {} with {:?}", name, addrs);
        Ok(())
    }

    async fn expose_lb_locked(
        &self,
        inner: &mut Inner,
        lb: &str,
        vip: IpAddr,
        cr_lrp: &str,
    ) -> Result<()> {
        let Some(info) = inner.state.cr_lrps.get_mut(cr_lrp) else {
            warn!("Load balancer {}: gateway port {} is not local", lb, cr_lrp);
            return Ok(());
        };
        info.ovn_lbs.insert(lb.to_string());
        let bridge = info.bridge();

        let vips = inner.state.lb_vips.entry(lb.to_string()).or_default();
        if !vips.contains(&vip) {
            vips.push(vip);
        }
        if !inner.state.track_exposed(vip, lb, Some(cr_lrp)) {
            debug!("VIP {} of {} already exposed", vip, lb);
            return Ok(());
        }

        self.expose_provider_port(inner, &[vip], bridge, None).await?;
        info!("Exposed VIP {} of load balancer {} via {}", vip, lb, cr_lrp);
        Ok(())
    }

    async fn withdraw_lb_locked(&self, inner: &mut Inner, lb: &str, cr_lrp: &str) -> Result<()> {
        let Some(info) = inner.state.cr_lrps.get_mut(cr_lrp) else {
            return Ok(());
        };
        info.ovn_lbs.remove(lb);
        let bridge = info.bridge();

        let vips = inner.state.lb_vips.remove(lb).unwrap_or_default();
        for vip in vips {
            inner.state.untrack_exposed(vip, lb);
            if inner.state.is_exposed(vip) {
                continue;
            }
            self.withdraw_provider_port(inner, &[vip], bridge.clone(), None)
                .await?;
            info!("Withdrew VIP {} of load balancer {}", vip, lb);
        }
        Ok(())
    }

    async fn expose_subnet_locked(
        &self,
        inner: &mut Inner,
        subnet: IpPrefix,
        row: &PortBinding,
    ) -> Result<()> {
        let Some(datapath) = row.datapath.as_deref() else {
            return Ok(());
        };
        let Some(cr_lrp) = self
            .sb
            .router_gateway_on_chassis(datapath, &self.chassis)
            .await?
        else {
            return Ok(());
        };
        let network_datapath = match row.option("peer") {
            Some(peer) => self.sb.port_datapath(peer).await?,
            None => None,
        };

        let Some(info) = inner.state.cr_lrps.get_mut(&cr_lrp) else {
            return Ok(());
        };
        if let Some(dp) = &network_datapath {
            info.subnets_datapath.insert(row.name().to_string(), dp.clone());
        }
        if !info.subnets_cidr.contains(&subnet) {
            info.subnets_cidr.push(subnet);
        }
        let info = info.clone();

        if !self.tenant_enabled() || !self.tenant_allowed(&subnet) {
            return Ok(());
        }
        inner
            .state
            .lrps
            .insert(row.name().to_string(), cr_lrp.clone());

        let Some((bridge, vlan)) = info.bridge() else {
            warn!("Gateway port {} has no bridge, not routing {}", cr_lrp, subnet);
            return Ok(());
        };
        let table = self.table_for(&bridge)?;
        inner
            .net
            .add_ip_rule(&subnet.network().to_string(), table, None)
            .await?;
        if let Some(gateway) = info.gateway_for(&subnet) {
            let route = RouteEntry::new(subnet.addr(), Some(subnet.len()), table, bridge.as_str())?
                .via(gateway)
                .on_vlan(vlan);
            inner.net.add_ip_route(route).await?;
        }
        info!("Exposed subnet {} behind {} on {}", subnet, cr_lrp, self.chassis);

        if let Some(dp) = network_datapath {
            let mut scratch = Leftovers::default();
            for port in self.sb.ports_on_datapath(&dp, None).await? {
                self.expose_tenant_port(inner, &port, subnet.family(), &mut scratch)
                    .await?;
            }
        }
        Ok(())
    }

    async fn withdraw_subnet_locked(
        &self,
        inner: &mut Inner,
        subnet: IpPrefix,
        row: &PortBinding,
    ) -> Result<()> {
        // the router side of a gateway port never exposed a subnet
        if inner.state.cr_lrps.keys().any(|cr| cr.contains(row.name())) {
            debug!("{} belongs to a gateway port, nothing to withdraw", row.name());
            return Ok(());
        }
        let Some(datapath) = row.datapath.as_deref() else {
            return Ok(());
        };
        let Some(cr_lrp) = self
            .sb
            .router_gateway_on_chassis(datapath, &self.chassis)
            .await?
        else {
            return Ok(());
        };

        let Some(info) = inner.state.cr_lrps.get_mut(&cr_lrp) else {
            return Ok(());
        };
        info.subnets_datapath.remove(row.name());
        info.subnets_cidr.retain(|c| *c != subnet);
        let info = info.clone();

        if !self.tenant_enabled() || !self.tenant_allowed(&subnet) {
            return Ok(());
        }
        inner.state.lrps.remove(row.name());

        let Some((bridge, vlan)) = info.bridge() else {
            return Ok(());
        };
        let table = self.table_for(&bridge)?;
        inner
            .net
            .del_ip_rule(&subnet.network().to_string(), table, None)
            .await?;
        if let Some(gateway) = info.gateway_for(&subnet) {
            let route = RouteEntry::new(subnet.addr(), Some(subnet.len()), table, bridge.as_str())?
                .via(gateway)
                .on_vlan(vlan);
            inner.net.del_ip_route(&route).await?;
        }
        self.withdraw_network_ips(inner, subnet.network()).await?;
        info!("Withdrew subnet {} behind {} on {}", subnet, cr_lrp, self.chassis);
        Ok(())
    }

    /// Tenant addresses gated by the toggles and a local router port
    async fn remote_ips_to_handle(
        &self,
        inner: &Inner,
        ips: &[IpPrefix],
        row: &PortBinding,
    ) -> Result<Vec<IpPrefix>> {
        let Some(datapath) = row.datapath.as_deref() else {
            return Ok(Vec::new());
        };
        if !self.tenant_enabled() || self.sb.is_provider_network(datapath).await? {
            return Ok(Vec::new());
        }
        let ips: Vec<IpPrefix> = ips
            .iter()
            .filter(|ip| self.tenant_allowed(ip))
            .map(|ip| IpPrefix::host(ip.addr()))
            .collect();
        if ips.is_empty() {
            return Ok(ips);
        }
        match self.sb.lrp_port_for_datapath(datapath).await? {
            Some(lrp) if inner.state.lrps.contains_key(&lrp) => Ok(ips),
            _ => Ok(Vec::new()),
        }
    }

    async fn sync_locked(&self, inner: &mut Inner) -> Result<()> {
        inner.state.reset();
        inner.net.tables_mut().clear();

        debug!("Ensuring VRF configuration for advertising routes");
        inner
            .net
            .ensure_vrf(&self.config.bgp.vrf, self.config.bgp.vrf_table_id)
            .await?;
        inner
            .net
            .ensure_ovn_device(self.bgp_nic(), &self.config.bgp.vrf)
            .await?;

        let mut extra: BTreeMap<String, Vec<KernelRoute>> = BTreeMap::new();
        for (index, mapping) in self.config.bridge_mappings.iter().enumerate() {
            let offset = index as u32 + 1;
            inner
                .state
                .bridge_mappings
                .insert(mapping.network.clone(), mapping.bridge.clone());

            if !extra.contains_key(&mapping.bridge) {
                let routes = inner
                    .net
                    .ensure_routing_table_for_bridge(&mapping.bridge, mapping.table_id)
                    .await?;
                extra.insert(mapping.bridge.clone(), routes);
            }

            let vlan = self
                .sb
                .network_vlan_tag_by_network_name(&mapping.network)
                .await?;
            if let Some(tag) = vlan {
                inner
                    .net
                    .ensure_vlan_device_for_network(&mapping.bridge, tag)
                    .await?;
            }
            inner
                .net
                .ensure_arp_ndp_enabled_for_bridge(&mapping.bridge, offset, vlan)
                .await?;
        }

        debug!("Syncing current routes");
        let table_ids = inner.net.tables().table_ids();
        let mut leftovers = Leftovers {
            ips: inner
                .net
                .get_exposed_ips(self.bgp_nic())
                .await?
                .into_iter()
                .collect(),
            rules: inner.net.get_ovn_ip_rules(&table_ids).await?,
        };

        for port in self.sb.ports_on_chassis(&self.chassis).await? {
            let kind = port.kind().unwrap_or_default();
            if !port_type::is_vif(kind) && kind != port_type::CHASSIS_REDIRECT {
                continue;
            }
            let Some(ips) = port.mac_ips() else {
                continue;
            };
            for ip in self
                .expose_ip_locked(inner, &ips, &port, None, &mut leftovers)
                .await?
            {
                leftovers.claim(ip);
            }
        }

        for cr_lrp in self.sb.cr_lrp_ports_on_chassis(&self.chassis).await? {
            let (ips, patch) = self
                .sb
                .cr_lrp_nat_addresses_info(&cr_lrp, &self.chassis)
                .await?;
            let Some(patch) = patch else {
                continue;
            };
            if ips.is_empty() {
                continue;
            }
            for ip in self
                .expose_ip_locked(inner, &ips, &patch, Some(&cr_lrp), &mut leftovers)
                .await?
            {
                leftovers.claim(ip);
            }
        }

        let gateways: Vec<(String, CrLrpInfo)> = inner
            .state
            .cr_lrps
            .iter()
            .map(|(name, info)| (name.clone(), info.clone()))
            .collect();
        for (cr_lrp, info) in gateways {
            if let Some(router_datapath) = info.router_datapath.as_deref() {
                self.collect_router_subnets(inner, &cr_lrp, router_datapath, &mut leftovers)
                    .await?;
            }
            self.expose_lbs_for_cr_lrp(inner, &cr_lrp, &info.provider_datapath, &mut leftovers)
                .await?;
        }

        let stale_ips: Vec<IpAddr> = leftovers.ips.into_iter().collect();
        if !stale_ips.is_empty() {
            info!("Removing {} leftover exposed address(es)", stale_ips.len());
        }
        inner
            .net
            .delete_exposed_ips(&stale_ips, self.bgp_nic())
            .await?;
        inner
            .net
            .delete_ip_rules(leftovers.rules.into_values())
            .await?;
        inner.net.delete_bridge_ip_routes(extra).await?;
        Ok(())
    }

    async fn run_sync(&self, reason: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let previous = inner.state.lifecycle;
        inner.state.lifecycle = Lifecycle::Syncing;
        info!("Starting {} for chassis {}", reason, self.chassis);

        match self.sync_locked(&mut inner).await {
            Ok(()) => {
                inner.state.lifecycle = Lifecycle::Steady;
                info!(
                    "Finished {}: {} exposed address(es), {} local gateway port(s)",
                    reason,
                    inner.state.exposed_count(),
                    inner.state.cr_lrps.len()
                );
                Ok(())
            }
            Err(e) => {
                inner.state.lifecycle = previous;
                error!("{} failed for chassis {}: {}", reason, self.chassis, e);
                Err(Error::sync(format!("{}: {}", reason, e)))
            }
        }
    }
}

#[async_trait]
impl ExposureActions for ExposureController {
    async fn view(&self) -> AgentView {
        self.inner.lock().await.state.view(&self.chassis)
    }

    async fn sync(&self) -> Result<()> {
        self.run_sync("full sync").await
    }

    async fn resync(&self) -> Result<()> {
        self.run_sync("resync").await
    }

    async fn expose_ip(
        &self,
        ips: &[IpPrefix],
        row: &PortBinding,
        associated_port: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let mut scratch = Leftovers::default();
        self.expose_ip_locked(&mut inner, ips, row, associated_port, &mut scratch)
            .await?;
        Ok(())
    }

    async fn withdraw_ip(
        &self,
        ips: &[IpPrefix],
        row: &PortBinding,
        associated_port: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.withdraw_ip_locked(&mut inner, ips, row, associated_port)
            .await
    }

    async fn expose_subnet(&self, subnet: IpPrefix, row: &PortBinding) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.expose_subnet_locked(&mut inner, subnet, row).await
    }

    async fn withdraw_subnet(&self, subnet: IpPrefix, row: &PortBinding) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.withdraw_subnet_locked(&mut inner, subnet, row).await
    }

    async fn update_subnet(&self, old: &PortBinding, row: &PortBinding) -> Result<()> {
        let before = old.mac_ips().unwrap_or_default();
        let after = row.mac_ips().unwrap_or_default();

        let mut inner = self.inner.lock().await;
        for removed in before.iter().filter(|ip| !after.contains(ip)) {
            self.withdraw_subnet_locked(&mut inner, *removed, row).await?;
        }
        for added in after.iter().filter(|ip| !before.contains(ip)) {
            self.expose_subnet_locked(&mut inner, *added, row).await?;
        }
        Ok(())
    }

    async fn expose_remote_ip(&self, ips: &[IpPrefix], row: &PortBinding) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let ips = self.remote_ips_to_handle(&inner, ips, row).await?;
        if ips.is_empty() {
            return Ok(());
        }
        inner.net.add_ips_to_dev(self.bgp_nic(), &ips).await?;
        for ip in &ips {
            inner.state.track_exposed(ip.addr(), row.name(), None);
        }
        info!(
            "Exposed tenant addresses {:?} of {} on chassis {}",
            ips,
            row.name(),
            self.chassis
        );
        Ok(())
    }

    async fn withdraw_remote_ip(
        &self,
        ips: &[IpPrefix],
        row: &PortBinding,
        chassis: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let ips = self.remote_ips_to_handle(&inner, ips, row).await?;
        if ips.is_empty() {
            return Ok(());
        }
        inner.net.del_ips_from_dev(self.bgp_nic(), &ips).await?;
        for ip in &ips {
            inner.state.untrack_exposed(ip.addr(), row.name());
        }
        info!(
            "Withdrew tenant addresses {:?} of {} (was on {})",
            ips,
            row.name(),
            chassis.unwrap_or("unknown chassis")
        );
        Ok(())
    }

    async fn expose_ovn_lb_on_provider(&self, lb: &str, vip: IpAddr, cr_lrp: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.expose_lb_locked(&mut inner, lb, vip, cr_lrp).await
    }

    async fn withdraw_ovn_lb_on_provider(&self, lb: &str, cr_lrp: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.withdraw_lb_locked(&mut inner, lb, cr_lrp).await
    }
}
