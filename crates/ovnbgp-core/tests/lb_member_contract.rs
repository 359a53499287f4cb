//! Architectural Contract Test: Load Balancer Membership
//!
//! This test verifies that load balancer VIPs follow the reachability of
//! the balancer through each local gateway port.
//!
//! Constraints verified:
//! - Becoming reachable exposes every VIP once
//! - Losing reachability withdraws once
//! - Changes that keep reachability unchanged do nothing
//! - Deleting a balancer withdraws it from the gateways exposing it
//!
//! If this test fails, someone has changed:
//! - The reachability rule (provider plus at least one subnet datapath)
//! - The diff between old and new datapath sets

mod common;

use common::*;
use ovnbgp_core::config::EngineConfig;
use ovnbgp_core::memory::MemorySouthbound;
use ovnbgp_core::ovn::LoadBalancer;
use ovnbgp_core::traits::{AgentView, CrLrpView, Lifecycle};
use ovnbgp_core::watcher::{Dispatcher, EventRegistry};
use std::collections::BTreeSet;
use std::sync::Arc;

fn gateway_view(ovn_lbs: &[&str]) -> AgentView {
    let mut view = AgentView::new(CHASSIS);
    view.lifecycle = Lifecycle::Steady;
    view.has_local_lrps = true;
    view.cr_lrps.push(CrLrpView {
        name: "cr-lrp-gw".into(),
        provider_datapath: "dp-public".into(),
        subnet_datapaths: BTreeSet::from(["dp-tenant".to_string()]),
        ovn_lbs: ovn_lbs.iter().map(|s| s.to_string()).collect(),
    });
    view
}

fn lb(datapaths: &[&str]) -> LoadBalancer {
    LoadBalancer::new("lb1")
        .with_datapaths(datapaths.iter().copied())
        .with_vip("172.24.4.66:80", "10.0.0.10:80")
        .with_vip("172.24.4.67:443", "10.0.0.11:443")
}

fn dispatcher(actions: &RecordingActions) -> Dispatcher {
    let config = EngineConfig {
        event_channel_capacity: 100,
        reconcile_interval_secs: 0,
        sync_on_start: false,
    };
    let (dispatcher, _events) = Dispatcher::new(
        Arc::new(IdleSource),
        Arc::new(actions.clone()),
        EventRegistry::with_default_events(false),
        &config,
    )
    .unwrap();
    dispatcher
}

#[tokio::test]
async fn becoming_reachable_exposes_each_vip() {
    let sb = MemorySouthbound::new().with_load_balancer(lb(&["dp-public"]));
    let actions = RecordingActions::new();
    actions.set_view(gateway_view(&[]));
    let dispatcher = dispatcher(&actions);

    let n = sb.upsert_load_balancer(lb(&["dp-public", "dp-tenant"])).await;
    assert_eq!(dispatcher.dispatch(&n).await, 1);

    assert_eq!(
        actions.calls(),
        vec![
            "expose_lb lb1 172.24.4.66 cr-lrp-gw",
            "expose_lb lb1 172.24.4.67 cr-lrp-gw",
        ]
    );
}

#[tokio::test]
async fn losing_reachability_withdraws_once() {
    let sb = MemorySouthbound::new().with_load_balancer(lb(&["dp-public", "dp-tenant"]));
    let actions = RecordingActions::new();
    actions.set_view(gateway_view(&["lb1"]));
    let dispatcher = dispatcher(&actions);

    let n = sb.upsert_load_balancer(lb(&[])).await;
    dispatcher.dispatch(&n).await;

    assert_eq!(actions.calls(), vec!["withdraw_lb lb1 cr-lrp-gw"]);
}

#[tokio::test]
async fn unrelated_datapath_change_is_noop() {
    let sb = MemorySouthbound::new().with_load_balancer(lb(&["dp-public", "dp-tenant"]));
    let actions = RecordingActions::new();
    actions.set_view(gateway_view(&["lb1"]));
    let dispatcher = dispatcher(&actions);

    let n = sb
        .upsert_load_balancer(lb(&["dp-public", "dp-tenant", "dp-other"]))
        .await;
    dispatcher.dispatch(&n).await;

    assert!(actions.calls().is_empty());
}

#[tokio::test]
async fn no_local_gateway_no_match() {
    let sb = MemorySouthbound::new().with_load_balancer(lb(&["dp-public"]));
    let actions = RecordingActions::new();
    let dispatcher = dispatcher(&actions);

    let n = sb.upsert_load_balancer(lb(&["dp-public", "dp-tenant"])).await;
    assert_eq!(dispatcher.dispatch(&n).await, 0);
    assert!(actions.calls().is_empty());
}

#[tokio::test]
async fn deleted_balancer_withdrawn_where_exposed() {
    let sb = MemorySouthbound::new().with_load_balancer(lb(&["dp-public", "dp-tenant"]));
    let actions = RecordingActions::new();
    actions.set_view(gateway_view(&["lb1"]));
    let dispatcher = dispatcher(&actions);

    let n = sb.remove_load_balancer("lb1").await.unwrap();
    dispatcher.dispatch(&n).await;

    assert_eq!(actions.calls(), vec!["withdraw_lb lb1 cr-lrp-gw"]);
}
