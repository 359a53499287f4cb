//! Row events: one predicate and one action per kind of change
//!
//! Predicates are pure functions of the notification and an [`AgentView`];
//! a missing or malformed column is a non-match. Each action calls exactly
//! one [`ExposureActions`] operation (or a sync).

use crate::error::Result;
use crate::net::IpPrefix;
use crate::ovn::{port_type, Notification, NotificationKind, PortBinding, Table, REDIRECT_OPTION};
use crate::traits::{AgentView, ExposureActions, Lifecycle};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// A registered `(filter, match, run)` triple
#[async_trait]
pub trait RowEvent: Send + Sync {
    /// Name used in logs and monitoring events
    fn name(&self) -> &'static str;

    /// Table whose notifications this event looks at
    fn table(&self) -> Table;

    /// Notification kinds this event looks at
    fn kinds(&self) -> &'static [NotificationKind];

    /// Whether the notification requires action; never fails
    fn matches(&self, notification: &Notification, view: &AgentView) -> bool;

    /// Perform the action for a matched notification
    async fn run(&self, notification: &Notification, agent: &dyn ExposureActions) -> Result<()>;

    fn accepts(&self, notification: &Notification) -> bool {
        self.table() == notification.table() && self.kinds().contains(&notification.kind)
    }
}

const CREATE: &[NotificationKind] = &[NotificationKind::Create];
const UPDATE: &[NotificationKind] = &[NotificationKind::Update];
const DELETE: &[NotificationKind] = &[NotificationKind::Delete];
const CREATE_UPDATE: &[NotificationKind] = &[NotificationKind::Create, NotificationKind::Update];
const UPDATE_DELETE: &[NotificationKind] = &[NotificationKind::Update, NotificationKind::Delete];
const CREATE_DELETE: &[NotificationKind] = &[NotificationKind::Create, NotificationKind::Delete];

/// Port types exposed when they bind to this chassis
fn is_exposable(row: &PortBinding) -> bool {
    row.kind()
        .is_some_and(|k| port_type::is_vif(k) || k == port_type::CHASSIS_REDIRECT)
}

fn is_patch(row: &PortBinding) -> bool {
    row.kind() == Some(port_type::PATCH)
}

/// Router port not yet pinned anywhere, with addresses
fn is_unbound_router_port(row: &PortBinding) -> bool {
    row.is_unbound()
        && row.is_router_port()
        && !row.has_option(REDIRECT_OPTION)
        && row.mac_ips().is_some()
}

/// Tenant addresses of a port; the CIDR attribute stands in for an
/// "unknown" MAC column
fn tenant_ips(row: &PortBinding) -> Option<Vec<IpPrefix>> {
    if row.mac_is_unknown() {
        row.cidr_ips()
    } else {
        row.mac_ips()
    }
}

/// Port bound to this chassis
#[derive(Debug, Default)]
pub struct PortBindingChassisCreated;

#[async_trait]
impl RowEvent for PortBindingChassisCreated {
    fn name(&self) -> &'static str {
        "port_binding_chassis_created"
    }

    fn table(&self) -> Table {
        Table::PortBinding
    }

    fn kinds(&self) -> &'static [NotificationKind] {
        CREATE_UPDATE
    }

    fn matches(&self, notification: &Notification, view: &AgentView) -> bool {
        let Some((row, old)) = notification.port_bindings() else {
            return false;
        };
        if row.mac_ips().is_none() || !row.is_bound_to(&view.chassis) {
            return false;
        }
        match notification.kind {
            NotificationKind::Create => true,
            NotificationKind::Update => old
                .and_then(|o| o.chassis.as_ref())
                .is_some_and(|c| c.first() != Some(&view.chassis)),
            NotificationKind::Delete => false,
        }
    }

    async fn run(&self, notification: &Notification, agent: &dyn ExposureActions) -> Result<()> {
        let Some((row, _)) = notification.port_bindings() else {
            return Ok(());
        };
        if !is_exposable(row) {
            return Ok(());
        }
        let Some(ips) = row.mac_ips() else {
            return Ok(());
        };
        agent.expose_ip(&ips, row, None).await
    }
}

/// Port unbound from (or deleted while bound to) this chassis
#[derive(Debug, Default)]
pub struct PortBindingChassisDeleted;

#[async_trait]
impl RowEvent for PortBindingChassisDeleted {
    fn name(&self) -> &'static str {
        "port_binding_chassis_deleted"
    }

    fn table(&self) -> Table {
        Table::PortBinding
    }

    fn kinds(&self) -> &'static [NotificationKind] {
        UPDATE_DELETE
    }

    fn matches(&self, notification: &Notification, view: &AgentView) -> bool {
        let Some((row, old)) = notification.port_bindings() else {
            return false;
        };
        if row.mac_ips().is_none() {
            return false;
        }
        match notification.kind {
            NotificationKind::Update => {
                old.is_some_and(|o| o.is_bound_to(&view.chassis))
                    && row.chassis.is_some()
                    && !row.is_bound_to(&view.chassis)
            }
            NotificationKind::Delete => row.is_bound_to(&view.chassis),
            NotificationKind::Create => false,
        }
    }

    async fn run(&self, notification: &Notification, agent: &dyn ExposureActions) -> Result<()> {
        let Some((row, _)) = notification.port_bindings() else {
            return Ok(());
        };
        if !is_exposable(row) {
            return Ok(());
        }
        let Some(ips) = row.mac_ips() else {
            return Ok(());
        };
        agent.withdraw_ip(&ips, row, None).await
    }
}

/// Predicate shared by the NAT set and unset events
fn nat_changed(notification: &Notification) -> bool {
    let Some((row, Some(old))) = notification.port_bindings() else {
        return false;
    };
    match (&row.nat_addresses, &old.nat_addresses) {
        (Some(new), Some(previous)) => {
            new != previous && row.is_unbound() && !row.is_router_port()
        }
        _ => false,
    }
}

/// Floating IPs added to a patch port's NAT addresses
#[derive(Debug, Default)]
pub struct FipSet;

#[async_trait]
impl RowEvent for FipSet {
    fn name(&self) -> &'static str {
        "fip_set"
    }

    fn table(&self) -> Table {
        Table::PortBinding
    }

    fn kinds(&self) -> &'static [NotificationKind] {
        UPDATE
    }

    fn matches(&self, notification: &Notification, _view: &AgentView) -> bool {
        nat_changed(notification)
    }

    async fn run(&self, notification: &Notification, agent: &dyn ExposureActions) -> Result<()> {
        let Some((row, old)) = notification.port_bindings() else {
            return Ok(());
        };
        if !is_patch(row) {
            return Ok(());
        }
        let Some(current) = row.nat_entries().and_then(|e| e.into_iter().next()) else {
            return Ok(());
        };
        let previous = old
            .and_then(PortBinding::nat_entries)
            .and_then(|e| e.into_iter().next());

        let ips: Vec<IpPrefix> = match previous {
            Some(previous) if previous.port == current.port => current
                .ips
                .iter()
                .filter(|ip| !previous.ips.contains(ip))
                .copied()
                .collect(),
            _ => current.ips.clone(),
        };
        if ips.is_empty() {
            debug!("No new NAT addresses on {}", row.name());
            return Ok(());
        }
        agent.expose_ip(&ips, row, current.port.as_deref()).await
    }
}

/// Floating IPs removed from a patch port's NAT addresses
#[derive(Debug, Default)]
pub struct FipUnset;

#[async_trait]
impl RowEvent for FipUnset {
    fn name(&self) -> &'static str {
        "fip_unset"
    }

    fn table(&self) -> Table {
        Table::PortBinding
    }

    fn kinds(&self) -> &'static [NotificationKind] {
        UPDATE
    }

    fn matches(&self, notification: &Notification, _view: &AgentView) -> bool {
        nat_changed(notification)
    }

    async fn run(&self, notification: &Notification, agent: &dyn ExposureActions) -> Result<()> {
        let Some((row, old)) = notification.port_bindings() else {
            return Ok(());
        };
        if !is_patch(row) {
            return Ok(());
        }
        let Some(previous) = old
            .and_then(PortBinding::nat_entries)
            .and_then(|e| e.into_iter().next())
        else {
            return Ok(());
        };
        let current = row.nat_entries().and_then(|e| e.into_iter().next());

        let ips: Vec<IpPrefix> = match current {
            Some(current) if current.port == previous.port => previous
                .ips
                .iter()
                .filter(|ip| !current.ips.contains(ip))
                .copied()
                .collect(),
            _ => previous.ips.clone(),
        };
        if ips.is_empty() {
            debug!("No NAT addresses removed from {}", row.name());
            return Ok(());
        }
        agent.withdraw_ip(&ips, row, previous.port.as_deref()).await
    }
}

/// Router port attached to a subnet
#[derive(Debug, Default)]
pub struct SubnetRouterAttached;

#[async_trait]
impl RowEvent for SubnetRouterAttached {
    fn name(&self) -> &'static str {
        "subnet_router_attached"
    }

    fn table(&self) -> Table {
        Table::PortBinding
    }

    fn kinds(&self) -> &'static [NotificationKind] {
        CREATE
    }

    fn matches(&self, notification: &Notification, _view: &AgentView) -> bool {
        notification
            .port_bindings()
            .is_some_and(|(row, _)| is_unbound_router_port(row))
    }

    async fn run(&self, notification: &Notification, agent: &dyn ExposureActions) -> Result<()> {
        let Some((row, _)) = notification.port_bindings() else {
            return Ok(());
        };
        if !is_patch(row) {
            return Ok(());
        }
        match row.mac_ips().and_then(|ips| ips.first().copied()) {
            Some(subnet) => agent.expose_subnet(subnet, row).await,
            None => Ok(()),
        }
    }
}

/// Router port addresses changed
#[derive(Debug, Default)]
pub struct SubnetRouterUpdated;

#[async_trait]
impl RowEvent for SubnetRouterUpdated {
    fn name(&self) -> &'static str {
        "subnet_router_updated"
    }

    fn table(&self) -> Table {
        Table::PortBinding
    }

    fn kinds(&self) -> &'static [NotificationKind] {
        UPDATE
    }

    fn matches(&self, notification: &Notification, _view: &AgentView) -> bool {
        let Some((row, Some(old))) = notification.port_bindings() else {
            return false;
        };
        is_unbound_router_port(row) && old.mac.is_some() && old.mac != row.mac
    }

    async fn run(&self, notification: &Notification, agent: &dyn ExposureActions) -> Result<()> {
        let Some((row, Some(old))) = notification.port_bindings() else {
            return Ok(());
        };
        if !is_patch(row) {
            return Ok(());
        }
        agent.update_subnet(old, row).await
    }
}

/// Router port detached from a subnet
#[derive(Debug, Default)]
pub struct SubnetRouterDetached;

#[async_trait]
impl RowEvent for SubnetRouterDetached {
    fn name(&self) -> &'static str {
        "subnet_router_detached"
    }

    fn table(&self) -> Table {
        Table::PortBinding
    }

    fn kinds(&self) -> &'static [NotificationKind] {
        DELETE
    }

    fn matches(&self, notification: &Notification, _view: &AgentView) -> bool {
        notification
            .port_bindings()
            .is_some_and(|(row, _)| is_unbound_router_port(row))
    }

    async fn run(&self, notification: &Notification, agent: &dyn ExposureActions) -> Result<()> {
        let Some((row, _)) = notification.port_bindings() else {
            return Ok(());
        };
        if !is_patch(row) {
            return Ok(());
        }
        match row.mac_ips().and_then(|ips| ips.first().copied()) {
            Some(subnet) => agent.withdraw_subnet(subnet, row).await,
            None => Ok(()),
        }
    }
}

/// Tenant port bound somewhere while a local gateway serves its router
#[derive(Debug, Default)]
pub struct TenantPortCreated;

#[async_trait]
impl RowEvent for TenantPortCreated {
    fn name(&self) -> &'static str {
        "tenant_port_created"
    }

    fn table(&self) -> Table {
        Table::PortBinding
    }

    fn kinds(&self) -> &'static [NotificationKind] {
        UPDATE
    }

    fn matches(&self, notification: &Notification, view: &AgentView) -> bool {
        let Some((row, Some(old))) = notification.port_bindings() else {
            return false;
        };
        view.has_local_lrps
            && tenant_ips(row).is_some()
            && row.first_chassis().is_some()
            && old.is_unbound()
    }

    async fn run(&self, notification: &Notification, agent: &dyn ExposureActions) -> Result<()> {
        let Some((row, _)) = notification.port_bindings() else {
            return Ok(());
        };
        if !row.kind().is_some_and(port_type::is_vif) {
            return Ok(());
        }
        let Some(ips) = tenant_ips(row) else {
            return Ok(());
        };
        agent.expose_remote_ip(&ips, row).await
    }
}

/// Tenant port unbound or deleted while a local gateway serves its router
#[derive(Debug, Default)]
pub struct TenantPortDeleted;

#[async_trait]
impl RowEvent for TenantPortDeleted {
    fn name(&self) -> &'static str {
        "tenant_port_deleted"
    }

    fn table(&self) -> Table {
        Table::PortBinding
    }

    fn kinds(&self) -> &'static [NotificationKind] {
        UPDATE_DELETE
    }

    fn matches(&self, notification: &Notification, view: &AgentView) -> bool {
        let Some((row, old)) = notification.port_bindings() else {
            return false;
        };
        if !view.has_local_lrps || tenant_ips(row).is_none() {
            return false;
        }
        match notification.kind {
            NotificationKind::Update => {
                row.is_unbound() && old.is_some_and(|o| o.first_chassis().is_some())
            }
            NotificationKind::Delete => true,
            NotificationKind::Create => false,
        }
    }

    async fn run(&self, notification: &Notification, agent: &dyn ExposureActions) -> Result<()> {
        let Some((row, old)) = notification.port_bindings() else {
            return Ok(());
        };
        if !row.kind().is_some_and(port_type::is_vif) {
            return Ok(());
        }
        let Some(ips) = tenant_ips(row) else {
            return Ok(());
        };
        let chassis = old
            .and_then(PortBinding::first_chassis)
            .or_else(|| row.first_chassis());
        agent.withdraw_remote_ip(&ips, row, chassis).await
    }
}

/// Load balancer VIP port on a tenant network
#[derive(Debug, Default)]
pub struct OvnLbTenantPort;

#[async_trait]
impl RowEvent for OvnLbTenantPort {
    fn name(&self) -> &'static str {
        "ovn_lb_tenant_port"
    }

    fn table(&self) -> Table {
        Table::PortBinding
    }

    fn kinds(&self) -> &'static [NotificationKind] {
        CREATE_DELETE
    }

    fn matches(&self, notification: &Notification, view: &AgentView) -> bool {
        let Some((row, _)) = notification.port_bindings() else {
            return false;
        };
        view.has_local_lrps
            && row.is_unbound()
            && row.mac.as_ref().is_some_and(Vec::is_empty)
            && row.is_up() == Some(false)
    }

    async fn run(&self, notification: &Notification, agent: &dyn ExposureActions) -> Result<()> {
        let Some((row, _)) = notification.port_bindings() else {
            return Ok(());
        };
        if row.kind() != Some(port_type::VM) {
            return Ok(());
        }
        let Some(ips) = row.cidr_ips() else {
            return Ok(());
        };
        match notification.kind {
            NotificationKind::Create => agent.expose_remote_ip(&ips, row).await,
            NotificationKind::Delete => agent.withdraw_remote_ip(&ips, row, None).await,
            NotificationKind::Update => Ok(()),
        }
    }
}

/// Load balancer attached datapaths changed
///
/// A load balancer is reachable through a local gateway port when its
/// datapaths include the port's provider datapath and at least one subnet
/// datapath behind it. The action exposes the VIPs when it becomes
/// reachable and withdraws them when it stops being reachable.
#[derive(Debug, Default)]
pub struct OvnLbMemberUpdated;

fn reachable(datapaths: &BTreeSet<String>, provider: &str, subnets: &BTreeSet<String>) -> bool {
    datapaths.contains(provider) && datapaths.iter().any(|dp| subnets.contains(dp))
}

#[async_trait]
impl RowEvent for OvnLbMemberUpdated {
    fn name(&self) -> &'static str {
        "ovn_lb_member_updated"
    }

    fn table(&self) -> Table {
        Table::LoadBalancer
    }

    fn kinds(&self) -> &'static [NotificationKind] {
        UPDATE_DELETE
    }

    fn matches(&self, notification: &Notification, view: &AgentView) -> bool {
        if notification.kind == NotificationKind::Delete {
            return true;
        }
        let Some((row, Some(old))) = notification.load_balancers() else {
            return false;
        };
        if view.cr_lrps.is_empty() {
            return false;
        }
        match (row.attached_datapaths(), old.attached_datapaths()) {
            (Some(current), Some(previous)) => {
                current.symmetric_difference(&previous).next().is_some()
            }
            _ => false,
        }
    }

    async fn run(&self, notification: &Notification, agent: &dyn ExposureActions) -> Result<()> {
        let Some((row, old)) = notification.load_balancers() else {
            return Ok(());
        };
        let view = agent.view().await;

        if notification.kind == NotificationKind::Delete {
            for cr_lrp in view.cr_lrps.iter().filter(|c| c.ovn_lbs.contains(row.name())) {
                agent
                    .withdraw_ovn_lb_on_provider(row.name(), &cr_lrp.name)
                    .await?;
            }
            return Ok(());
        }

        let current = row.attached_datapaths().unwrap_or_default();
        let previous = old
            .and_then(|o| o.attached_datapaths())
            .unwrap_or_else(|| current.clone());

        for cr_lrp in &view.cr_lrps {
            let now = reachable(&current, &cr_lrp.provider_datapath, &cr_lrp.subnet_datapaths);
            let before = reachable(&previous, &cr_lrp.provider_datapath, &cr_lrp.subnet_datapaths);
            if now && !before {
                for vip in row.vip_addresses() {
                    agent
                        .expose_ovn_lb_on_provider(row.name(), vip, &cr_lrp.name)
                        .await?;
                }
            } else if before && !now {
                agent
                    .withdraw_ovn_lb_on_provider(row.name(), &cr_lrp.name)
                    .await?;
            }
        }
        Ok(())
    }
}

/// This chassis (or its private row) was created
///
/// The first create seen after a completed startup sync is only recorded.
/// Later creates resync; any create before the first sync completes syncs.
#[derive(Debug)]
pub struct ChassisCreated {
    table: Table,
    seen: AtomicBool,
}

impl ChassisCreated {
    pub fn chassis() -> Self {
        Self {
            table: Table::Chassis,
            seen: AtomicBool::new(false),
        }
    }

    pub fn chassis_private() -> Self {
        Self {
            table: Table::ChassisPrivate,
            seen: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl RowEvent for ChassisCreated {
    fn name(&self) -> &'static str {
        match self.table {
            Table::ChassisPrivate => "chassis_private_created",
            _ => "chassis_created",
        }
    }

    fn table(&self) -> Table {
        self.table
    }

    fn kinds(&self) -> &'static [NotificationKind] {
        CREATE
    }

    fn matches(&self, notification: &Notification, view: &AgentView) -> bool {
        notification
            .row
            .as_chassis()
            .and_then(|c| c.name.as_deref())
            == Some(view.chassis.as_str())
    }

    async fn run(&self, _notification: &Notification, agent: &dyn ExposureActions) -> Result<()> {
        let first = !self.seen.swap(true, Ordering::SeqCst);
        if agent.view().await.lifecycle != Lifecycle::Steady {
            return agent.sync().await;
        }
        if first {
            debug!("{} after startup sync, nothing to do", self.name());
            return Ok(());
        }
        agent.resync().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ovn::{LoadBalancer, Row};
    use crate::traits::CrLrpView;
    use std::net::IpAddr;
    use std::sync::Mutex;

    const CHASSIS: &str = "935f91fa-b8f8-47b9-8b1b-3a7a90ef7c26";

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        ExposeIp(Vec<String>, Option<String>),
        WithdrawIp(Vec<String>, Option<String>),
        ExposeSubnet(String),
        WithdrawSubnet(String),
        UpdateSubnet,
        ExposeRemote(Vec<String>),
        WithdrawRemote(Vec<String>),
        ExposeLb(String, IpAddr, String),
        WithdrawLb(String, String),
        Sync,
        Resync,
    }

    struct Recorder {
        view: AgentView,
        calls: Mutex<Vec<Call>>,
    }

    impl Recorder {
        fn new(view: AgentView) -> Self {
            Self {
                view,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn push(&self, call: Call) -> Result<()> {
            self.calls.lock().unwrap().push(call);
            Ok(())
        }
    }

    fn strings(ips: &[IpPrefix]) -> Vec<String> {
        ips.iter().map(|ip| ip.addr().to_string()).collect()
    }

    #[async_trait]
    impl ExposureActions for Recorder {
        async fn view(&self) -> AgentView {
            self.view.clone()
        }
        async fn sync(&self) -> Result<()> {
            self.push(Call::Sync)
        }
        async fn resync(&self) -> Result<()> {
            self.push(Call::Resync)
        }
        async fn expose_ip(&self, ips: &[IpPrefix], _row: &PortBinding, associated: Option<&str>) -> Result<()> {
            self.push(Call::ExposeIp(strings(ips), associated.map(str::to_string)))
        }
        async fn withdraw_ip(&self, ips: &[IpPrefix], _row: &PortBinding, associated: Option<&str>) -> Result<()> {
            self.push(Call::WithdrawIp(strings(ips), associated.map(str::to_string)))
        }
        async fn expose_subnet(&self, subnet: IpPrefix, _row: &PortBinding) -> Result<()> {
            self.push(Call::ExposeSubnet(subnet.addr().to_string()))
        }
        async fn withdraw_subnet(&self, subnet: IpPrefix, _row: &PortBinding) -> Result<()> {
            self.push(Call::WithdrawSubnet(subnet.addr().to_string()))
        }
        async fn update_subnet(&self, _old: &PortBinding, _row: &PortBinding) -> Result<()> {
            self.push(Call::UpdateSubnet)
        }
        async fn expose_remote_ip(&self, ips: &[IpPrefix], _row: &PortBinding) -> Result<()> {
            self.push(Call::ExposeRemote(strings(ips)))
        }
        async fn withdraw_remote_ip(&self, ips: &[IpPrefix], _row: &PortBinding, _chassis: Option<&str>) -> Result<()> {
            self.push(Call::WithdrawRemote(strings(ips)))
        }
        async fn expose_ovn_lb_on_provider(&self, lb: &str, vip: IpAddr, cr_lrp: &str) -> Result<()> {
            self.push(Call::ExposeLb(lb.into(), vip, cr_lrp.into()))
        }
        async fn withdraw_ovn_lb_on_provider(&self, lb: &str, cr_lrp: &str) -> Result<()> {
            self.push(Call::WithdrawLb(lb.into(), cr_lrp.into()))
        }
    }

    fn view() -> AgentView {
        AgentView::new(CHASSIS)
    }

    fn view_with_lrps() -> AgentView {
        AgentView {
            has_local_lrps: true,
            ..view()
        }
    }

    fn view_with_cr_lrp() -> AgentView {
        AgentView {
            cr_lrps: vec![CrLrpView {
                name: "cr-lrp1".into(),
                provider_datapath: "dp1".into(),
                subnet_datapaths: ["s_dp1".to_string()].into(),
                ovn_lbs: ["ovn-lb1".to_string()].into(),
            }],
            ..view()
        }
    }

    fn pb(row: PortBinding) -> Row {
        Row::PortBinding(row)
    }

    fn chassis_col(names: &[&str]) -> PortBinding {
        PortBinding {
            chassis: Some(names.iter().map(|n| n.to_string()).collect()),
            ..Default::default()
        }
    }

    fn vm(mac: &str) -> PortBinding {
        PortBinding::new("vm1").with_type(port_type::VM).with_mac(mac)
    }

    #[test]
    fn test_chassis_created_on_bind() {
        let event = PortBindingChassisCreated;
        let row = vm("aa:bb:cc:dd:ee:ff 10.10.1.16").with_chassis(CHASSIS);

        let from_none = Notification::update(pb(row.clone()), pb(chassis_col(&[])));
        assert!(event.matches(&from_none, &view()));

        let moved = Notification::update(pb(row.clone()), pb(chassis_col(&["old-chassis"])));
        assert!(event.matches(&moved, &view()));

        let same = Notification::update(pb(row.clone()), pb(chassis_col(&[CHASSIS])));
        assert!(!event.matches(&same, &view()));

        // chassis column unchanged
        let untouched = Notification::update(pb(row.clone()), pb(PortBinding::default()));
        assert!(!event.matches(&untouched, &view()));

        assert!(event.matches(&Notification::create(pb(row)), &view()));
    }

    #[test]
    fn test_mac_without_ips_never_matches() {
        let row = vm("aa:bb:cc:dd:ee:ff").with_chassis(CHASSIS);
        let n = Notification::update(pb(row.clone()), pb(chassis_col(&[])));
        assert!(!PortBindingChassisCreated.matches(&n, &view()));

        let n = Notification::delete(pb(row));
        assert!(!PortBindingChassisDeleted.matches(&n, &view_with_lrps()));
        assert!(!TenantPortDeleted.matches(&n, &view_with_lrps()));
    }

    #[test]
    fn test_chassis_deleted_on_unbind_and_delete() {
        let event = PortBindingChassisDeleted;
        let unbound = vm("aa:bb:cc:dd:ee:ff 10.10.1.16").unbound();
        let n = Notification::update(pb(unbound), pb(chassis_col(&[CHASSIS])));
        assert!(event.matches(&n, &view()));

        let moved = vm("aa:bb:cc:dd:ee:ff 10.10.1.16").with_chassis("new-chassis");
        let n = Notification::update(pb(moved), pb(chassis_col(&[CHASSIS])));
        assert!(event.matches(&n, &view()));

        let bound = vm("aa:bb:cc:dd:ee:ff 10.10.1.16").with_chassis(CHASSIS);
        let n = Notification::update(pb(bound.clone()), pb(chassis_col(&[CHASSIS])));
        assert!(!event.matches(&n, &view()));

        assert!(event.matches(&Notification::delete(pb(bound)), &view()));
    }

    #[tokio::test]
    async fn test_dual_stack_exposed_in_column_order() {
        let row = vm("aa:bb:cc:dd:ee:ff 10.10.1.16 2002::1234:abcd:ffff:c0a8:101").with_chassis(CHASSIS);
        let agent = Recorder::new(view());
        PortBindingChassisCreated
            .run(&Notification::create(pb(row)), &agent)
            .await
            .unwrap();
        assert_eq!(
            agent.calls(),
            vec![Call::ExposeIp(
                vec!["10.10.1.16".into(), "2002::1234:abcd:ffff:c0a8:101".into()],
                None
            )]
        );
    }

    #[tokio::test]
    async fn test_wrong_port_type_is_ignored() {
        let row = PortBinding::new("x")
            .with_type("localnet")
            .with_mac("aa:bb:cc:dd:ee:ff 10.10.1.16")
            .with_chassis(CHASSIS);
        let agent = Recorder::new(view());
        PortBindingChassisCreated
            .run(&Notification::create(pb(row)), &agent)
            .await
            .unwrap();
        assert!(agent.calls().is_empty());
    }

    fn patch_with_nat(name: &str, nat: &[&str]) -> PortBinding {
        PortBinding::new(name)
            .with_type(port_type::PATCH)
            .unbound()
            .with_nat_addresses(nat.iter().copied())
    }

    fn nat_only(nat: &[&str]) -> PortBinding {
        PortBinding {
            nat_addresses: Some(nat.iter().map(|s| s.to_string()).collect()),
            ..Default::default()
        }
    }

    #[test]
    fn test_fip_predicates() {
        let row = patch_with_nat("fake-lp", &["10.10.1.16"]);
        let changed = Notification::update(pb(row.clone()), pb(nat_only(&["10.10.1.17"])));
        assert!(FipSet.matches(&changed, &view()));
        assert!(FipUnset.matches(&changed, &view()));

        let same = Notification::update(pb(row), pb(nat_only(&["10.10.1.16"])));
        assert!(!FipSet.matches(&same, &view()));

        let lrp = patch_with_nat("lrp-fake", &["10.10.1.16"]);
        let n = Notification::update(pb(lrp), pb(nat_only(&["10.10.1.17"])));
        assert!(!FipSet.matches(&n, &view()));

        let bound = patch_with_nat("fake-lp", &["10.10.1.16"]).with_chassis(CHASSIS);
        let n = Notification::update(pb(bound), pb(nat_only(&["10.10.1.17"])));
        assert!(!FipSet.matches(&n, &view()));
    }

    #[tokio::test]
    async fn test_fip_diff_on_same_port() {
        let row = patch_with_nat(
            "patch",
            &[r#"aa:aa:aa:aa:aa:aa 10.0.0.6 10.0.0.7 is_chassis_resident(\"cr-lrp-X\")"#],
        );
        let old = nat_only(&[r#"aa:aa:aa:aa:aa:aa 10.0.0.5 10.0.0.6 is_chassis_resident(\"cr-lrp-X\")"#]);
        let n = Notification::update(pb(row), pb(old));

        let agent = Recorder::new(view());
        FipSet.run(&n, &agent).await.unwrap();
        FipUnset.run(&n, &agent).await.unwrap();
        assert_eq!(
            agent.calls(),
            vec![
                Call::ExposeIp(vec!["10.0.0.7".into()], Some("cr-lrp-X".into())),
                Call::WithdrawIp(vec!["10.0.0.5".into()], Some("cr-lrp-X".into())),
            ]
        );
    }

    #[tokio::test]
    async fn test_fip_port_change_moves_all_addresses() {
        let row = patch_with_nat(
            "patch",
            &[r#"aa:aa:aa:aa:aa:aa 10.10.1.16 10.10.1.17 is_chassis_resident("cr-lrp-a")"#],
        );
        let old = nat_only(&[r#"aa:aa:aa:aa:aa:aa 10.10.1.16 10.10.1.18 is_chassis_resident("cr-lrp-b")"#]);
        let n = Notification::update(pb(row), pb(old));

        let agent = Recorder::new(view());
        FipSet.run(&n, &agent).await.unwrap();
        FipUnset.run(&n, &agent).await.unwrap();
        assert_eq!(
            agent.calls(),
            vec![
                Call::ExposeIp(vec!["10.10.1.16".into(), "10.10.1.17".into()], Some("cr-lrp-a".into())),
                Call::WithdrawIp(vec!["10.10.1.16".into(), "10.10.1.18".into()], Some("cr-lrp-b".into())),
            ]
        );
    }

    fn lrp(mac: &str) -> PortBinding {
        PortBinding::new("lrp-fake")
            .with_type(port_type::PATCH)
            .unbound()
            .with_mac(mac)
    }

    #[tokio::test]
    async fn test_subnet_router_events() {
        let attached = Notification::create(pb(lrp("aa:bb:cc:dd:ee:ff 10.10.1.16")));
        assert!(SubnetRouterAttached.matches(&attached, &view()));

        let redirect = lrp("aa:bb:cc:dd:ee:ff 10.10.1.16").with_option(REDIRECT_OPTION, "true");
        assert!(!SubnetRouterAttached.matches(&Notification::create(pb(redirect)), &view()));

        let not_lrp = PortBinding::new("fake-lp").unbound().with_mac("aa:bb:cc:dd:ee:ff 10.10.1.16");
        assert!(!SubnetRouterDetached.matches(&Notification::delete(pb(not_lrp)), &view()));

        let unchanged = Notification::update(
            pb(lrp("aa:bb:cc:dd:ee:ff 10.10.1.16")),
            pb(PortBinding::default()),
        );
        assert!(!SubnetRouterUpdated.matches(&unchanged, &view()));

        let mut old = PortBinding::default();
        old.mac = Some(vec!["aa:bb:cc:dd:ee:ff 10.10.1.16 10.10.1.17".into()]);
        let changed = Notification::update(pb(lrp("aa:bb:cc:dd:ee:ff 10.10.1.16")), pb(old));
        assert!(SubnetRouterUpdated.matches(&changed, &view()));

        let agent = Recorder::new(view());
        SubnetRouterAttached.run(&attached, &agent).await.unwrap();
        SubnetRouterUpdated.run(&changed, &agent).await.unwrap();
        assert_eq!(
            agent.calls(),
            vec![Call::ExposeSubnet("10.10.1.16".into()), Call::UpdateSubnet]
        );
    }

    #[test]
    fn test_tenant_port_needs_local_router_ports() {
        let row = vm("aa:bb:cc:dd:ee:ff 10.10.1.16").with_chassis("other");
        let n = Notification::update(pb(row), pb(chassis_col(&[])));
        assert!(TenantPortCreated.matches(&n, &view_with_lrps()));
        assert!(!TenantPortCreated.matches(&n, &view()));
    }

    #[tokio::test]
    async fn test_tenant_port_unknown_mac_uses_cidrs() {
        let row = PortBinding::new("vm1")
            .with_type(port_type::VM)
            .with_mac("unknown")
            .with_external_id("neutron:cidrs", "10.10.1.16/24")
            .with_chassis("other");
        let n = Notification::update(pb(row), pb(chassis_col(&[])));
        assert!(TenantPortCreated.matches(&n, &view_with_lrps()));

        let agent = Recorder::new(view_with_lrps());
        TenantPortCreated.run(&n, &agent).await.unwrap();
        assert_eq!(agent.calls(), vec![Call::ExposeRemote(vec!["10.10.1.16".into()])]);
    }

    #[tokio::test]
    async fn test_lb_tenant_port() {
        let mut row = PortBinding::new("vip-port")
            .with_type(port_type::VM)
            .unbound()
            .with_up(false)
            .with_external_id("neutron:cidrs", "10.10.1.16/24");
        row.mac = Some(Vec::new());

        let create = Notification::create(pb(row.clone()));
        assert!(OvnLbTenantPort.matches(&create, &view_with_lrps()));
        assert!(!OvnLbTenantPort.matches(&create, &view()));

        let agent = Recorder::new(view_with_lrps());
        OvnLbTenantPort.run(&create, &agent).await.unwrap();
        OvnLbTenantPort
            .run(&Notification::delete(pb(row)), &agent)
            .await
            .unwrap();
        assert_eq!(
            agent.calls(),
            vec![
                Call::ExposeRemote(vec!["10.10.1.16".into()]),
                Call::WithdrawRemote(vec!["10.10.1.16".into()]),
            ]
        );
    }

    fn lb(datapaths: &[&str]) -> LoadBalancer {
        LoadBalancer::new("ovn-lb1")
            .with_datapath_group("dpg", datapaths.iter().copied())
            .with_vip("172.24.100.66:80", "10.0.0.5:8080")
    }

    fn lb_update(new: &[&str], old: &[&str]) -> Notification {
        Notification::update(
            Row::LoadBalancer(lb(new)),
            Row::LoadBalancer(LoadBalancer::default().with_datapath_group("dpg", old.iter().copied())),
        )
    }

    #[test]
    fn test_lb_member_predicate() {
        assert!(OvnLbMemberUpdated.matches(&lb_update(&["dp1", "dp2"], &["dp1"]), &view_with_cr_lrp()));
        assert!(!OvnLbMemberUpdated.matches(&lb_update(&["dp1"], &["dp1"]), &view_with_cr_lrp()));
        assert!(!OvnLbMemberUpdated.matches(&lb_update(&["dp1"], &["dp1", "dp2"]), &view()));

        let delete = Notification::delete(Row::LoadBalancer(LoadBalancer::new("ovn-lb1")));
        assert!(OvnLbMemberUpdated.matches(&delete, &view()));
    }

    #[tokio::test]
    async fn test_lb_member_run() {
        let agent = Recorder::new(view_with_cr_lrp());
        OvnLbMemberUpdated
            .run(&lb_update(&["dp1", "s_dp1"], &["dp1"]), &agent)
            .await
            .unwrap();
        assert_eq!(
            agent.calls(),
            vec![Call::ExposeLb("ovn-lb1".into(), "172.24.100.66".parse().unwrap(), "cr-lrp1".into())]
        );

        let agent = Recorder::new(view_with_cr_lrp());
        OvnLbMemberUpdated
            .run(&lb_update(&[], &["dp1", "s_dp1"]), &agent)
            .await
            .unwrap();
        assert_eq!(agent.calls(), vec![Call::WithdrawLb("ovn-lb1".into(), "cr-lrp1".into())]);

        // a member remains on a known subnet
        let agent = Recorder::new(view_with_cr_lrp());
        OvnLbMemberUpdated
            .run(&lb_update(&["dp1", "s_dp1"], &["dp1", "s_dp1", "s_dp2"]), &agent)
            .await
            .unwrap();
        assert!(agent.calls().is_empty());

        let agent = Recorder::new(view_with_cr_lrp());
        OvnLbMemberUpdated
            .run(&lb_update(&["dp1", "s_dp2"], &["dp1"]), &agent)
            .await
            .unwrap();
        assert!(agent.calls().is_empty());
    }

    fn steady() -> AgentView {
        AgentView {
            lifecycle: Lifecycle::Steady,
            ..view()
        }
    }

    #[tokio::test]
    async fn test_chassis_created_syncs_before_first_sync() {
        let event = ChassisCreated::chassis();
        let n = Notification::create(Row::Chassis(crate::ovn::ChassisRow::new(CHASSIS)));
        assert!(event.matches(&n, &view()));

        let other = Notification::create(Row::Chassis(crate::ovn::ChassisRow::new("other")));
        assert!(!event.matches(&other, &view()));

        let fresh = Recorder::new(view());
        event.run(&n, &fresh).await.unwrap();
        assert_eq!(fresh.calls(), vec![Call::Sync]);

        let agent = Recorder::new(steady());
        event.run(&n, &agent).await.unwrap();
        assert_eq!(agent.calls(), vec![Call::Resync]);
    }

    #[tokio::test]
    async fn test_first_chassis_create_after_startup_sync_is_skipped() {
        let event = ChassisCreated::chassis_private();
        let n = Notification::create(Row::ChassisPrivate(crate::ovn::ChassisRow::new(CHASSIS)));
        let agent = Recorder::new(steady());

        event.run(&n, &agent).await.unwrap();
        assert!(agent.calls().is_empty());

        event.run(&n, &agent).await.unwrap();
        event.run(&n, &agent).await.unwrap();
        assert_eq!(agent.calls(), vec![Call::Resync, Call::Resync]);
    }
}
