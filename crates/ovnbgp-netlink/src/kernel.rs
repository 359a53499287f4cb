// # Rtnetlink Kernel
//
// `KernelNetwork` over a live Linux network stack.
//
// Links, addresses, routes, policy rules, neighbours and NDP proxies are
// rtnetlink requests. Creating typed devices (vrf, vxlan, veth, vlan) goes
// through `ip` (see `command`), and flags are written to procfs.
//
// Every add checks for the object first and every delete removes the
// dumped message it matched, so repeated calls converge instead of failing
// on EEXIST/ENOENT.

use crate::command::{self, IpCommand};
use crate::sysctl::Sysctl;
use async_trait::async_trait;
use futures::TryStreamExt;
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use netlink_packet_route::link::{LinkAttribute, LinkMessage};
use netlink_packet_route::neighbour::{
    NeighbourAddress, NeighbourAttribute, NeighbourFlag, NeighbourMessage, NeighbourState,
};
use netlink_packet_route::route::{
    RouteAddress, RouteAttribute, RouteMessage, RouteProtocol as NlProtocol, RouteScope as NlScope,
};
use netlink_packet_route::rule::{RuleAttribute, RuleMessage};
use netlink_packet_route::AddressFamily;
use ovnbgp_core::net::{
    DeviceSpec, Family, IpPrefix, IpRule, KernelFlag, KernelRoute, NdpProxy, NeighborEntry,
    RouteProtocol, RouteScope,
};
use ovnbgp_core::traits::KernelNetwork;
use ovnbgp_core::{Error, Result};
use rtnetlink::{new_connection, Handle, IpVersion};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{debug, info};

fn netlink_err(e: rtnetlink::Error) -> Error {
    Error::kernel(e.to_string())
}

fn link_name(link: &LinkMessage) -> Option<&str> {
    link.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::IfName(name) => Some(name.as_str()),
        _ => None,
    })
}

fn message_address(msg: &AddressMessage) -> Option<IpAddr> {
    msg.attributes.iter().find_map(|attr| match attr {
        AddressAttribute::Address(addr) => Some(*addr),
        _ => None,
    })
}

fn route_address(addr: &RouteAddress) -> Option<IpAddr> {
    match addr {
        RouteAddress::Inet(v4) => Some(IpAddr::V4(*v4)),
        RouteAddress::Inet6(v6) => Some(IpAddr::V6(*v6)),
        _ => None,
    }
}

/// Convert a dumped route; a missing destination is the default route
pub(crate) fn kernel_route(msg: &RouteMessage) -> Option<KernelRoute> {
    let family = match msg.header.address_family {
        AddressFamily::Inet => Family::V4,
        AddressFamily::Inet6 => Family::V6,
        _ => return None,
    };

    let mut destination = None;
    let mut gateway = None;
    let mut oif = None;
    let mut table = u32::from(msg.header.table);
    for attr in &msg.attributes {
        match attr {
            RouteAttribute::Destination(addr) => destination = route_address(addr),
            RouteAttribute::Gateway(addr) => gateway = route_address(addr),
            RouteAttribute::Oif(index) => oif = Some(*index),
            RouteAttribute::Table(id) => table = *id,
            _ => {}
        }
    }

    let destination = match destination {
        Some(addr) => IpPrefix::new(addr, msg.header.destination_prefix_length).ok()?,
        None => IpPrefix::any(family),
    };
    let scope = match family {
        Family::V4 => Some(RouteScope::from_u8(u8::from(msg.header.scope))),
        Family::V6 => None,
    };

    Some(KernelRoute {
        destination,
        gateway,
        oif,
        table,
        protocol: RouteProtocol::from_u8(u8::from(msg.header.protocol)),
        scope,
    })
}

/// Destination rule out of a rule dump; rules without a destination are
/// the stock lookups and are skipped
pub(crate) fn ip_rule(msg: &RuleMessage) -> Option<IpRule> {
    let mut destination = None;
    let mut table = u32::from(msg.header.table);
    for attr in &msg.attributes {
        match attr {
            RuleAttribute::Destination(addr) => destination = Some(*addr),
            RuleAttribute::Table(id) => table = *id,
            _ => {}
        }
    }
    let prefix = IpPrefix::new(destination?, msg.header.dst_len).ok()?;
    Some(IpRule::new(prefix, table))
}

pub(crate) fn neighbour_destination(msg: &NeighbourMessage) -> Option<IpAddr> {
    msg.attributes.iter().find_map(|attr| match attr {
        NeighbourAttribute::Destination(NeighbourAddress::Inet(v4)) => Some(IpAddr::V4(*v4)),
        NeighbourAttribute::Destination(NeighbourAddress::Inet6(v6)) => Some(IpAddr::V6(*v6)),
        _ => None,
    })
}

fn same_route(a: &KernelRoute, b: &KernelRoute) -> bool {
    a.destination == b.destination && a.gateway == b.gateway && a.oif == b.oif
}

/// Kernel backend over an rtnetlink connection
pub struct RtnetlinkKernel {
    handle: Handle,
    ip: IpCommand,
    sysctl: Sysctl,
    sys_class_net: PathBuf,
}

impl RtnetlinkKernel {
    /// Open a route netlink socket and spawn its connection task
    ///
    /// Must be called from inside a Tokio runtime.
    pub fn connect() -> Result<Self> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(Error::config(
                "netlink kernel backend requires a running Tokio runtime",
            ));
        }
        let (connection, handle, _) = new_connection()?;
        tokio::spawn(connection);
        info!("Connected to rtnetlink");

        Ok(Self {
            handle,
            ip: IpCommand::default(),
            sysctl: Sysctl::default(),
            sys_class_net: PathBuf::from("/sys/class/net"),
        })
    }

    pub fn with_ip_command(mut self, ip: IpCommand) -> Self {
        self.ip = ip;
        self
    }

    pub fn with_sysctl(mut self, sysctl: Sysctl) -> Self {
        self.sysctl = sysctl;
        self
    }

    async fn find_link(&self, matches: impl Fn(&LinkMessage) -> bool) -> Result<Option<LinkMessage>> {
        let mut links = self.handle.link().get().execute();
        while let Some(link) = links.try_next().await.map_err(netlink_err)? {
            if matches(&link) {
                return Ok(Some(link));
            }
        }
        Ok(None)
    }

    async fn name_of(&self, index: u32) -> Result<Option<String>> {
        Ok(self
            .find_link(|link| link.header.index == index)
            .await?
            .and_then(|link| link_name(&link).map(str::to_string)))
    }

    async fn require_index(&self, name: &str) -> Result<u32> {
        self.link_index(name)
            .await?
            .ok_or_else(|| Error::device_not_found(name))
    }

    async fn address_messages(&self, index: u32) -> Result<Vec<AddressMessage>> {
        let mut stream = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();
        let mut out = Vec::new();
        while let Some(msg) = stream.try_next().await.map_err(netlink_err)? {
            out.push(msg);
        }
        Ok(out)
    }

    async fn route_messages(&self, version: IpVersion) -> Result<Vec<RouteMessage>> {
        self.handle
            .route()
            .get(version)
            .execute()
            .try_collect()
            .await
            .map_err(netlink_err)
    }

    async fn dump_routes(&self, version: IpVersion, table: u32) -> Result<Vec<KernelRoute>> {
        Ok(self
            .route_messages(version)
            .await?
            .iter()
            .filter_map(kernel_route)
            .filter(|route| route.table == table)
            .collect())
    }

    /// Dumped message for an installed route equivalent to `route`
    async fn find_route(&self, route: &KernelRoute) -> Result<Option<RouteMessage>> {
        Ok(self
            .route_messages(ip_version(route.family()))
            .await?
            .into_iter()
            .find(|msg| {
                kernel_route(msg)
                    .is_some_and(|found| found.table == route.table && same_route(&found, route))
            }))
    }

    async fn rule_messages(&self, family: Family) -> Result<Vec<RuleMessage>> {
        self.handle
            .rule()
            .get(ip_version(family))
            .execute()
            .try_collect()
            .await
            .map_err(netlink_err)
    }

    async fn neighbour_messages(&self, proxies: bool) -> Result<Vec<NeighbourMessage>> {
        let request = self.handle.neighbours().get();
        let request = if proxies { request.proxies() } else { request };
        request.execute().try_collect().await.map_err(netlink_err)
    }

    /// Dumped neighbour (or proxy) entry for `ip` on device `index`
    async fn find_neighbour(&self, index: u32, ip: IpAddr, proxies: bool) -> Result<Option<NeighbourMessage>> {
        Ok(self
            .neighbour_messages(proxies)
            .await?
            .into_iter()
            .find(|msg| msg.header.ifindex == index && neighbour_destination(msg) == Some(ip)))
    }
}

fn ip_version(family: Family) -> IpVersion {
    match family {
        Family::V4 => IpVersion::V4,
        Family::V6 => IpVersion::V6,
    }
}

fn mismatched_gateway(route: &KernelRoute) -> Error {
    Error::invalid_address(format!("gateway family differs from destination in {}", route))
}

#[async_trait]
impl KernelNetwork for RtnetlinkKernel {
    async fn link_index(&self, name: &str) -> Result<Option<u32>> {
        Ok(self
            .find_link(|link| link_name(link) == Some(name))
            .await?
            .map(|link| link.header.index))
    }

    async fn link_master(&self, name: &str) -> Result<Option<u32>> {
        let master = match tokio::fs::read_link(self.sys_class_net.join(name).join("master")).await {
            Ok(target) => target,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match master.file_name().and_then(|n| n.to_str()) {
            Some(master_name) => self.link_index(master_name).await,
            None => Ok(None),
        }
    }

    async fn create_device(&self, spec: &DeviceSpec) -> Result<()> {
        let name = spec.name();
        if self.link_index(&name).await?.is_some() {
            debug!("{} device {} already exists", spec.kind(), name);
            return Ok(());
        }
        if let DeviceSpec::Vlan { parent, .. } = spec {
            self.require_index(parent).await?;
        }
        self.ip.run(&command::device_args(spec)).await?;
        info!("Created {} device {}", spec.kind(), name);
        Ok(())
    }

    async fn delete_device(&self, name: &str) -> Result<()> {
        let Some(index) = self.link_index(name).await? else {
            return Ok(());
        };
        self.handle
            .link()
            .del(index)
            .execute()
            .await
            .map_err(netlink_err)?;
        info!("Deleted device {}", name);
        Ok(())
    }

    async fn set_master(&self, name: &str, master: &str) -> Result<()> {
        let index = self.require_index(name).await?;
        let master_index = self.require_index(master).await?;
        if self.link_master(name).await? == Some(master_index) {
            return Ok(());
        }
        self.handle
            .link()
            .set(index)
            .master(master_index)
            .execute()
            .await
            .map_err(netlink_err)?;
        debug!("Enslaved {} to {}", name, master);
        Ok(())
    }

    async fn set_link_up(&self, name: &str) -> Result<()> {
        let index = self.require_index(name).await?;
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(netlink_err)
    }

    async fn addresses(&self, device: &str) -> Result<Vec<IpPrefix>> {
        let index = self.require_index(device).await?;
        Ok(self
            .address_messages(index)
            .await?
            .iter()
            .filter_map(|msg| {
                let addr = message_address(msg)?;
                IpPrefix::new(addr, msg.header.prefix_len).ok()
            })
            .collect())
    }

    async fn index_addresses(&self, ifindex: u32) -> Result<Vec<IpAddr>> {
        Ok(self
            .address_messages(ifindex)
            .await?
            .iter()
            .filter_map(message_address)
            .collect())
    }

    async fn add_address(&self, device: &str, addr: IpPrefix) -> Result<bool> {
        let index = self.require_index(device).await?;
        if self.addresses(device).await?.contains(&addr) {
            return Ok(false);
        }
        self.handle
            .address()
            .add(index, addr.addr(), addr.len())
            .execute()
            .await
            .map_err(netlink_err)?;
        debug!("Added {} to {}", addr, device);
        Ok(true)
    }

    async fn del_address(&self, device: &str, addr: IpPrefix) -> Result<()> {
        let Some(index) = self.link_index(device).await? else {
            return Ok(());
        };
        for msg in self.address_messages(index).await? {
            if message_address(&msg) == Some(addr.addr()) && msg.header.prefix_len == addr.len() {
                self.handle
                    .address()
                    .del(msg)
                    .execute()
                    .await
                    .map_err(netlink_err)?;
                debug!("Removed {} from {}", addr, device);
            }
        }
        Ok(())
    }

    async fn rules(&self, family: Family) -> Result<Vec<IpRule>> {
        Ok(self
            .rule_messages(family)
            .await?
            .iter()
            .filter_map(ip_rule)
            .filter(|rule| rule.family() == family)
            .collect())
    }

    async fn add_rule(&self, rule: &IpRule) -> Result<()> {
        if self.rules(rule.family()).await?.contains(rule) {
            return Ok(());
        }
        let request = self.handle.rule().add().table_id(rule.table);
        let len = rule.destination.len();
        let result = match rule.destination.addr() {
            IpAddr::V4(dst) => request.v4().destination_prefix(dst, len).execute().await,
            IpAddr::V6(dst) => request.v6().destination_prefix(dst, len).execute().await,
        };
        result.map_err(netlink_err)?;
        debug!("Added rule {}", rule);
        Ok(())
    }

    async fn del_rule(&self, rule: &IpRule) -> Result<()> {
        for msg in self.rule_messages(rule.family()).await? {
            if ip_rule(&msg).as_ref() == Some(rule) {
                self.handle
                    .rule()
                    .del(msg)
                    .execute()
                    .await
                    .map_err(netlink_err)?;
                debug!("Deleted rule {}", rule);
            }
        }
        Ok(())
    }

    async fn routes(&self, table: u32) -> Result<Vec<KernelRoute>> {
        let mut routes = self.dump_routes(IpVersion::V4, table).await?;
        routes.extend(self.dump_routes(IpVersion::V6, table).await?);
        Ok(routes)
    }

    async fn route_exists(&self, route: &KernelRoute) -> Result<bool> {
        Ok(self.find_route(route).await?.is_some())
    }

    async fn add_route(&self, route: &KernelRoute) -> Result<()> {
        if self.route_exists(route).await? {
            return Ok(());
        }
        let request = self
            .handle
            .route()
            .add()
            .table_id(route.table)
            .protocol(NlProtocol::from(route.protocol.as_u8()));
        let request = match route.oif {
            Some(index) => request.output_interface(index),
            None => request,
        };
        let request = match route.scope {
            Some(scope) => request.scope(NlScope::from(scope.as_u8())),
            None => request,
        };

        let len = route.destination.len();
        let result = match (route.destination.addr(), route.gateway) {
            (IpAddr::V4(dst), None) => request.v4().destination_prefix(dst, len).execute().await,
            (IpAddr::V4(dst), Some(IpAddr::V4(gw))) => {
                request
                    .v4()
                    .destination_prefix(dst, len)
                    .gateway(gw)
                    .execute()
                    .await
            }
            (IpAddr::V6(dst), None) => request.v6().destination_prefix(dst, len).execute().await,
            (IpAddr::V6(dst), Some(IpAddr::V6(gw))) => {
                request
                    .v6()
                    .destination_prefix(dst, len)
                    .gateway(gw)
                    .execute()
                    .await
            }
            _ => return Err(mismatched_gateway(route)),
        };
        result.map_err(netlink_err)?;
        debug!("Added route {}", route);
        Ok(())
    }

    async fn del_route(&self, route: &KernelRoute) -> Result<()> {
        let Some(msg) = self.find_route(route).await? else {
            return Ok(());
        };
        self.handle
            .route()
            .del(msg)
            .execute()
            .await
            .map_err(netlink_err)?;
        debug!("Deleted route {}", route);
        Ok(())
    }

    async fn add_neighbor(&self, entry: &NeighborEntry) -> Result<()> {
        let index = self.require_index(entry.device.as_str()).await?;
        self.handle
            .neighbours()
            .add(index, entry.ip)
            .link_local_address(entry.lladdr.as_bytes())
            .state(NeighbourState::Permanent)
            .replace()
            .execute()
            .await
            .map_err(netlink_err)?;
        debug!("Neighbour {} lladdr {} on {}", entry.ip, entry.lladdr, entry.device);
        Ok(())
    }

    async fn del_neighbor(&self, entry: &NeighborEntry) -> Result<()> {
        let Some(index) = self.link_index(entry.device.as_str()).await? else {
            return Ok(());
        };
        if let Some(msg) = self.find_neighbour(index, entry.ip, false).await? {
            self.handle
                .neighbours()
                .del(msg)
                .execute()
                .await
                .map_err(netlink_err)?;
        }
        Ok(())
    }

    async fn add_ndp_proxy(&self, proxy: &NdpProxy) -> Result<()> {
        let index = self.require_index(proxy.device.as_str()).await?;
        let ip = IpAddr::V6(proxy.ip);
        if self.find_neighbour(index, ip, true).await?.is_some() {
            return Ok(());
        }
        self.handle
            .neighbours()
            .add(index, ip)
            .flags(vec![NeighbourFlag::Proxy])
            .execute()
            .await
            .map_err(netlink_err)?;
        debug!("NDP proxy {} on {}", proxy.ip, proxy.device);
        Ok(())
    }

    async fn del_ndp_proxy(&self, proxy: &NdpProxy) -> Result<()> {
        let Some(index) = self.link_index(proxy.device.as_str()).await? else {
            return Ok(());
        };
        if let Some(msg) = self.find_neighbour(index, IpAddr::V6(proxy.ip), true).await? {
            self.handle
                .neighbours()
                .del(msg)
                .execute()
                .await
                .map_err(netlink_err)?;
        }
        Ok(())
    }

    async fn set_kernel_flag(&self, flag: &KernelFlag, value: bool) -> Result<()> {
        self.sysctl.write(flag, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn message(dst: Option<Ipv4Addr>, len: u8) -> RouteMessage {
        let mut msg = RouteMessage::default();
        msg.header.address_family = AddressFamily::Inet;
        msg.header.destination_prefix_length = len;
        msg.header.protocol = NlProtocol::Boot;
        msg.header.scope = NlScope::Link;
        msg.header.table = 252;
        if let Some(dst) = dst {
            msg.attributes
                .push(RouteAttribute::Destination(RouteAddress::Inet(dst)));
        }
        msg.attributes.push(RouteAttribute::Table(200));
        msg.attributes.push(RouteAttribute::Oif(4));
        msg
    }

    #[test]
    fn converts_dumped_route() {
        let route = kernel_route(&message(Some(Ipv4Addr::new(172, 24, 4, 10)), 32)).unwrap();
        assert_eq!(route.destination.to_string(), "172.24.4.10/32");
        assert_eq!(route.table, 200, "table attribute wins over the header");
        assert_eq!(route.oif, Some(4));
        assert_eq!(route.protocol, RouteProtocol::MANAGED);
        assert_eq!(route.scope, Some(RouteScope::Link));
    }

    #[test]
    fn missing_destination_is_default_route() {
        let route = kernel_route(&message(None, 0)).unwrap();
        assert!(route.is_default());
    }

    #[test]
    fn unknown_family_is_skipped() {
        let mut msg = message(None, 0);
        msg.header.address_family = AddressFamily::Bridge;
        assert!(kernel_route(&msg).is_none());
    }

    fn rule(dst: Option<IpAddr>, len: u8) -> RuleMessage {
        let mut msg = RuleMessage::default();
        msg.header.family = AddressFamily::Inet;
        msg.header.dst_len = len;
        msg.header.table = 252;
        if let Some(dst) = dst {
            msg.attributes.push(RuleAttribute::Destination(dst));
        }
        msg.attributes.push(RuleAttribute::Table(200));
        msg
    }

    #[test]
    fn converts_dumped_rule() {
        let parsed = ip_rule(&rule(Some("172.24.4.10".parse().unwrap()), 32)).unwrap();
        assert_eq!(parsed, IpRule::parse("172.24.4.10", 200).unwrap());

        let subnet = ip_rule(&rule(Some("10.0.0.0".parse().unwrap()), 24)).unwrap();
        assert_eq!(subnet.key(), "10.0.0.0/24");
    }

    #[test]
    fn rule_without_destination_is_skipped() {
        assert!(ip_rule(&rule(None, 0)).is_none());
    }

    #[test]
    fn rule_table_header_used_without_attribute() {
        let mut msg = rule(Some("10.0.0.1".parse().unwrap()), 32);
        msg.attributes.retain(|attr| !matches!(attr, RuleAttribute::Table(_)));
        msg.header.table = 254;
        assert_eq!(ip_rule(&msg).unwrap().table, 254);
    }

    #[test]
    fn neighbour_destination_by_family() {
        let mut msg = NeighbourMessage::default();
        msg.header.ifindex = 4;
        let v6: Ipv6Addr = "2001:db8::10".parse().unwrap();
        msg.attributes
            .push(NeighbourAttribute::Destination(NeighbourAddress::Inet6(v6)));
        assert_eq!(neighbour_destination(&msg), Some(IpAddr::V6(v6)));

        assert_eq!(neighbour_destination(&NeighbourMessage::default()), None);
    }

    #[test]
    fn connect_outside_runtime_fails() {
        let err = RtnetlinkKernel::connect().err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }
}
