//! Registered row events
//!
//! Registration order is evaluation order: for one notification, every
//! matching event runs in the order it was registered.

use super::events::{
    ChassisCreated, FipSet, FipUnset, OvnLbMemberUpdated, OvnLbTenantPort,
    PortBindingChassisCreated, PortBindingChassisDeleted, RowEvent, SubnetRouterAttached,
    SubnetRouterDetached, SubnetRouterUpdated, TenantPortCreated, TenantPortDeleted,
};
use crate::ovn::Notification;
use std::sync::Arc;
use tracing::debug;

/// Ordered set of row events
#[derive(Clone, Default)]
pub struct EventRegistry {
    events: Vec<Arc<dyn RowEvent>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard event set
    ///
    /// Subnet and tenant events are only registered when tenant exposure
    /// (full or IPv6 GUA only) is enabled.
    pub fn with_default_events(tenant_enabled: bool) -> Self {
        let mut registry = Self::new();
        registry.register(PortBindingChassisCreated);
        registry.register(PortBindingChassisDeleted);
        registry.register(FipSet);
        registry.register(FipUnset);
        registry.register(OvnLbMemberUpdated);
        registry.register(ChassisCreated::chassis());
        registry.register(ChassisCreated::chassis_private());

        if tenant_enabled {
            registry.register(SubnetRouterAttached);
            registry.register(SubnetRouterUpdated);
            registry.register(SubnetRouterDetached);
            registry.register(TenantPortCreated);
            registry.register(TenantPortDeleted);
            registry.register(OvnLbTenantPort);
        }

        debug!("Registered {} row events", registry.len());
        registry
    }

    pub fn register<E: RowEvent + 'static>(&mut self, event: E) {
        self.events.push(Arc::new(event));
    }

    /// Events whose table and kind filter accept the notification
    pub fn candidates<'a>(
        &'a self,
        notification: &'a Notification,
    ) -> impl Iterator<Item = &'a Arc<dyn RowEvent>> + 'a {
        self.events.iter().filter(move |e| e.accepts(notification))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events.iter().map(|e| e.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRegistry")
            .field("events", &self.names())
            .finish()
    }
}
