//! Test doubles and common utilities for architecture contract tests
//!
//! This module provides minimal test doubles that verify architectural
//! constraints without touching a real kernel or database.

#![allow(dead_code)]

use ovnbgp_core::config::AgentConfig;
use ovnbgp_core::error::{Error, Result};
use ovnbgp_core::memory::MemorySouthbound;
use ovnbgp_core::net::IpPrefix;
use ovnbgp_core::ovn::{port_type, Notification, PortBinding};
use ovnbgp_core::traits::{
    AgentView, ExposureActions, Lifecycle, NorthboundDb, NotificationSource, StaticRouteOp,
};
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::Stream;

pub const CHASSIS: &str = "chassis-a";

/// A notification source the test feeds by hand
pub struct ControlledSource {
    engine_rx: Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
    watch_call_count: Arc<AtomicUsize>,
}

impl ControlledSource {
    pub fn new() -> (Self, mpsc::UnboundedSender<Notification>) {
        let (test_tx, engine_rx) = mpsc::unbounded_channel();
        let source = Self {
            engine_rx: Mutex::new(Some(engine_rx)),
            watch_call_count: Arc::new(AtomicUsize::new(0)),
        };
        (source, test_tx)
    }

    pub fn watch_call_count(&self) -> usize {
        self.watch_call_count.load(Ordering::SeqCst)
    }
}

impl NotificationSource for ControlledSource {
    fn watch(&self) -> Pin<Box<dyn Stream<Item = Notification> + Send + 'static>> {
        self.watch_call_count.fetch_add(1, Ordering::SeqCst);

        // Take the receiver (only called once)
        let rx = self
            .engine_rx
            .lock()
            .unwrap()
            .take()
            .expect("watch() can only be called once");

        Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx))
    }
}

/// A source that never emits anything (for idle testing)
pub struct IdleSource;

impl NotificationSource for IdleSource {
    fn watch(&self) -> Pin<Box<dyn Stream<Item = Notification> + Send + 'static>> {
        Box::pin(tokio_stream::pending())
    }
}

/// Exposure actions that only record what they were asked to do
///
/// Clones share the recorded calls and counters.
#[derive(Clone)]
pub struct RecordingActions {
    calls: Arc<Mutex<Vec<String>>>,
    sync_call_count: Arc<AtomicUsize>,
    resync_call_count: Arc<AtomicUsize>,
    view: Arc<Mutex<AgentView>>,
    fail_sync: bool,
    action_delay: Option<Duration>,
}

impl RecordingActions {
    pub fn new() -> Self {
        let mut view = AgentView::new(CHASSIS);
        view.lifecycle = Lifecycle::Steady;
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            sync_call_count: Arc::new(AtomicUsize::new(0)),
            resync_call_count: Arc::new(AtomicUsize::new(0)),
            view: Arc::new(Mutex::new(view)),
            fail_sync: false,
            action_delay: None,
        }
    }

    /// Every sync returns an error
    pub fn failing_sync(mut self) -> Self {
        self.fail_sync = true;
        self
    }

    /// Each expose or withdraw sleeps before returning
    pub fn with_action_delay(mut self, delay: Duration) -> Self {
        self.action_delay = Some(delay);
        self
    }

    pub fn set_view(&self, view: AgentView) {
        *self.view.lock().unwrap() = view;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn sync_call_count(&self) -> usize {
        self.sync_call_count.load(Ordering::SeqCst)
    }

    pub fn resync_call_count(&self) -> usize {
        self.resync_call_count.load(Ordering::SeqCst)
    }

    async fn record(&self, call: String) {
        if let Some(delay) = self.action_delay {
            self.calls.lock().unwrap().push(format!("begin {}", call));
            tokio::time::sleep(delay).await;
        }
        self.calls.lock().unwrap().push(call);
    }
}

fn joined(ips: &[IpPrefix]) -> String {
    ips.iter()
        .map(|ip| ip.addr().to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait::async_trait]
impl ExposureActions for RecordingActions {
    async fn view(&self) -> AgentView {
        self.view.lock().unwrap().clone()
    }

    async fn sync(&self) -> Result<()> {
        self.sync_call_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_sync {
            return Err(Error::sync("kernel unavailable"));
        }
        Ok(())
    }

    async fn resync(&self) -> Result<()> {
        self.resync_call_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn expose_ip(
        &self,
        ips: &[IpPrefix],
        row: &PortBinding,
        associated_port: Option<&str>,
    ) -> Result<()> {
        let suffix = associated_port.map(|p| format!(" via {}", p)).unwrap_or_default();
        self.record(format!("expose_ip {} {}{}", row.name(), joined(ips), suffix))
            .await;
        Ok(())
    }

    async fn withdraw_ip(
        &self,
        ips: &[IpPrefix],
        row: &PortBinding,
        associated_port: Option<&str>,
    ) -> Result<()> {
        let suffix = associated_port.map(|p| format!(" via {}", p)).unwrap_or_default();
        self.record(format!("withdraw_ip {} {}{}", row.name(), joined(ips), suffix))
            .await;
        Ok(())
    }

    async fn expose_subnet(&self, subnet: IpPrefix, row: &PortBinding) -> Result<()> {
        self.record(format!("expose_subnet {} {}", row.name(), subnet))
            .await;
        Ok(())
    }

    async fn withdraw_subnet(&self, subnet: IpPrefix, row: &PortBinding) -> Result<()> {
        self.record(format!("withdraw_subnet {} {}", row.name(), subnet))
            .await;
        Ok(())
    }

    async fn update_subnet(&self, _old: &PortBinding, row: &PortBinding) -> Result<()> {
        self.record(format!("update_subnet {}", row.name())).await;
        Ok(())
    }

    async fn expose_remote_ip(&self, ips: &[IpPrefix], row: &PortBinding) -> Result<()> {
        self.record(format!("expose_remote_ip {} {}", row.name(), joined(ips)))
            .await;
        Ok(())
    }

    async fn withdraw_remote_ip(
        &self,
        ips: &[IpPrefix],
        row: &PortBinding,
        _chassis: Option<&str>,
    ) -> Result<()> {
        self.record(format!("withdraw_remote_ip {} {}", row.name(), joined(ips)))
            .await;
        Ok(())
    }

    async fn expose_ovn_lb_on_provider(&self, lb: &str, vip: IpAddr, cr_lrp: &str) -> Result<()> {
        self.record(format!("expose_lb {} {} {}", lb, vip, cr_lrp)).await;
        Ok(())
    }

    async fn withdraw_ovn_lb_on_provider(&self, lb: &str, cr_lrp: &str) -> Result<()> {
        self.record(format!("withdraw_lb {} {}", lb, cr_lrp)).await;
        Ok(())
    }
}

/// A northbound database that rejects every transaction
#[derive(Clone, Default)]
pub struct FailingNorthbound {
    transact_call_count: Arc<AtomicUsize>,
}

impl FailingNorthbound {
    pub fn transact_call_count(&self) -> usize {
        self.transact_call_count.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl NorthboundDb for FailingNorthbound {
    async fn transact(&self, _ops: Vec<StaticRouteOp>) -> Result<()> {
        self.transact_call_count.fetch_add(1, Ordering::SeqCst);
        Err(Error::northbound("connection refused"))
    }
}

/// Agent configuration with one provider bridge
pub fn agent_config() -> AgentConfig {
    AgentConfig::new(CHASSIS).with_bridge_mapping("public", "br-ex", 200)
}

/// Southbound seeded with the provider network's localnet port
pub fn provider_sb() -> MemorySouthbound {
    MemorySouthbound::new().with_port(
        PortBinding::new("provnet-public")
            .with_type(port_type::LOCALNET)
            .with_datapath("dp-public")
            .with_option("network_name", "public"),
    )
}

/// VM port on the provider network bound to this chassis
pub fn provider_vm(name: &str, mac: &str) -> PortBinding {
    PortBinding::new(name)
        .with_type(port_type::VM)
        .with_mac(mac)
        .with_datapath("dp-public")
        .with_chassis(CHASSIS)
}

/// Wait until `check` holds, polling every few milliseconds
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
