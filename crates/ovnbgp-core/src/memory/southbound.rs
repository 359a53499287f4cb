// # Memory Southbound
//
// In-memory southbound database that also acts as its own change feed.
//
// Every mutation publishes a notification the way the database would: an
// update carries in `old` only the columns whose value changed.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::warn;

use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::ovn::{ChassisRow, LoadBalancer, Notification, PortBinding, Row};
use crate::traits::{
    NotificationSource, NotificationSourceFactory, SouthboundDb, SouthboundDbFactory,
};

const FEED_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct SouthboundState {
    ports: BTreeMap<String, PortBinding>,
    load_balancers: BTreeMap<String, LoadBalancer>,
}

/// In-memory southbound database
///
/// Cloning shares both the tables and the change feed.
#[derive(Debug, Clone)]
pub struct MemorySouthbound {
    inner: Arc<RwLock<SouthboundState>>,
    feed: broadcast::Sender<Notification>,
}

impl Default for MemorySouthbound {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySouthbound {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            inner: Arc::new(RwLock::new(SouthboundState::default())),
            feed,
        }
    }

    /// Seed a port without publishing a notification
    pub fn with_port(self, row: PortBinding) -> Self {
        if let Ok(mut state) = self.inner.try_write() {
            state.ports.insert(row.name().to_string(), row);
        }
        self
    }

    /// Seed a load balancer without publishing a notification
    pub fn with_load_balancer(self, lb: LoadBalancer) -> Self {
        if let Ok(mut state) = self.inner.try_write() {
            state.load_balancers.insert(lb.name().to_string(), lb);
        }
        self
    }

    /// Insert or replace a port and publish the change
    pub async fn upsert_port(&self, row: PortBinding) -> Notification {
        let previous = self
            .inner
            .write()
            .await
            .ports
            .insert(row.name().to_string(), row.clone());
        let notification = match previous {
            Some(old) => {
                let old = changed_port_columns(&old, &row);
                Notification::update(Row::PortBinding(row), Row::PortBinding(old))
            }
            None => Notification::create(Row::PortBinding(row)),
        };
        self.publish(notification.clone());
        notification
    }

    /// Remove a port and publish the deletion
    pub async fn remove_port(&self, name: &str) -> Option<Notification> {
        let row = self.inner.write().await.ports.remove(name)?;
        let notification = Notification::delete(Row::PortBinding(row));
        self.publish(notification.clone());
        Some(notification)
    }

    pub async fn upsert_load_balancer(&self, lb: LoadBalancer) -> Notification {
        let previous = self
            .inner
            .write()
            .await
            .load_balancers
            .insert(lb.name().to_string(), lb.clone());
        let notification = match previous {
            Some(old) => {
                let old = changed_lb_columns(&old, &lb);
                Notification::update(Row::LoadBalancer(lb), Row::LoadBalancer(old))
            }
            None => Notification::create(Row::LoadBalancer(lb)),
        };
        self.publish(notification.clone());
        notification
    }

    pub async fn remove_load_balancer(&self, name: &str) -> Option<Notification> {
        let lb = self.inner.write().await.load_balancers.remove(name)?;
        let notification = Notification::delete(Row::LoadBalancer(lb));
        self.publish(notification.clone());
        Some(notification)
    }

    /// Announce this chassis, as the database does when the agent registers
    pub fn register_chassis(&self, name: &str) -> Notification {
        let notification = Notification::create(Row::Chassis(ChassisRow::new(name)));
        self.publish(notification.clone());
        notification
    }

    fn publish(&self, notification: Notification) {
        // no subscribers is fine
        let _ = self.feed.send(notification);
    }
}

/// Columns of `old` whose value differs in `new`
///
/// The logical port name is always kept so the row stays identifiable.
pub fn changed_port_columns(old: &PortBinding, new: &PortBinding) -> PortBinding {
    fn diff<T: Clone + PartialEq>(old: &Option<T>, new: &Option<T>) -> Option<T> {
        if old != new { old.clone() } else { None }
    }

    PortBinding {
        logical_port: old.logical_port.clone(),
        port_type: diff(&old.port_type, &new.port_type),
        mac: diff(&old.mac, &new.mac),
        chassis: match (&old.chassis, &new.chassis) {
            (o, n) if o == n => None,
            // an absent column was empty
            (None, _) => Some(Vec::new()),
            (o, _) => o.clone(),
        },
        datapath: diff(&old.datapath, &new.datapath),
        nat_addresses: match (&old.nat_addresses, &new.nat_addresses) {
            (o, n) if o == n => None,
            (None, _) => Some(Vec::new()),
            (o, _) => o.clone(),
        },
        options: diff(&old.options, &new.options),
        external_ids: diff(&old.external_ids, &new.external_ids),
        up: diff(&old.up, &new.up),
        tag: diff(&old.tag, &new.tag),
    }
}

fn changed_lb_columns(old: &LoadBalancer, new: &LoadBalancer) -> LoadBalancer {
    LoadBalancer {
        name: old.name.clone(),
        datapaths: if old.datapaths != new.datapaths {
            old.datapaths.clone()
        } else {
            None
        },
        datapath_group: if old.datapath_group != new.datapath_group {
            old.datapath_group.clone()
        } else {
            None
        },
        vips: if old.vips != new.vips {
            old.vips.clone()
        } else {
            None
        },
    }
}

#[async_trait]
impl SouthboundDb for MemorySouthbound {
    async fn port_by_name(&self, name: &str) -> Result<Option<PortBinding>> {
        Ok(self.inner.read().await.ports.get(name).cloned())
    }

    async fn ports_on_datapath(
        &self,
        datapath: &str,
        port_type: Option<&str>,
    ) -> Result<Vec<PortBinding>> {
        Ok(self
            .inner
            .read()
            .await
            .ports
            .values()
            .filter(|p| p.datapath.as_deref() == Some(datapath))
            .filter(|p| port_type.is_none_or(|t| p.kind().unwrap_or_default() == t))
            .cloned()
            .collect())
    }

    async fn ports_by_type(&self, port_type: &str) -> Result<Vec<PortBinding>> {
        Ok(self
            .inner
            .read()
            .await
            .ports
            .values()
            .filter(|p| p.kind().unwrap_or_default() == port_type)
            .cloned()
            .collect())
    }

    async fn all_ports(&self) -> Result<Vec<PortBinding>> {
        Ok(self.inner.read().await.ports.values().cloned().collect())
    }

    async fn load_balancers(&self) -> Result<Vec<LoadBalancer>> {
        Ok(self
            .inner
            .read()
            .await
            .load_balancers
            .values()
            .cloned()
            .collect())
    }
}

impl NotificationSource for MemorySouthbound {
    fn watch(&self) -> Pin<Box<dyn Stream<Item = Notification> + Send + 'static>> {
        let stream = BroadcastStream::new(self.feed.subscribe()).filter_map(|item| match item {
            Ok(notification) => Some(notification),
            Err(e) => {
                warn!("southbound feed lagged: {}", e);
                None
            }
        });
        Box::pin(stream)
    }
}

/// Factory for the in-memory southbound database and its change feed
///
/// Both roles are served by the same instance so that rows written through
/// one show up in the other.
#[derive(Clone, Default)]
pub struct MemorySouthboundFactory {
    shared: MemorySouthbound,
}

impl MemorySouthboundFactory {
    pub fn new(shared: MemorySouthbound) -> Self {
        Self { shared }
    }
}

fn memory_only(config: &BackendConfig) -> Result<()> {
    match config {
        BackendConfig::Memory => Ok(()),
        other => Err(Error::config(format!(
            "memory southbound factory cannot build a {} backend",
            other.type_name()
        ))),
    }
}

impl SouthboundDbFactory for MemorySouthboundFactory {
    fn create(&self, config: &BackendConfig) -> Result<Arc<dyn SouthboundDb>> {
        memory_only(config)?;
        Ok(Arc::new(self.shared.clone()))
    }
}

impl NotificationSourceFactory for MemorySouthboundFactory {
    fn create(&self, config: &BackendConfig) -> Result<Arc<dyn NotificationSource>> {
        memory_only(config)?;
        Ok(Arc::new(self.shared.clone()))
    }
}
