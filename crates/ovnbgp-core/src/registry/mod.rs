//! Plugin-based backend registry
//!
//! The registry lets collaborator backends be registered at runtime instead
//! of being picked by hardcoded if-else chains. The daemon registers the
//! in-memory backends and, on Linux, the netlink kernel.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ovnbgp_core::registry::BackendRegistry;
//! use ovnbgp_core::config::BackendConfig;
//!
//! let registry = BackendRegistry::with_memory_backends();
//! let kernel = registry.create_kernel(&BackendConfig::Memory)?;
//! ```
//!
//! ## Registration
//!
//! Backend crates register themselves during initialization:
//!
//! ```rust,ignore
//! // In ovnbgp-netlink
//! pub fn register(registry: &BackendRegistry) {
//!     registry.register_kernel("netlink", Box::new(RtnetlinkKernelFactory));
//! }
//! ```

use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::memory::{
    MemoryKernelFactory, MemoryNorthbound, MemoryNorthboundFactory, MemorySouthbound,
    MemorySouthboundFactory,
};
use crate::traits::{
    KernelNetwork, KernelNetworkFactory, NorthboundDb, NorthboundDbFactory, NotificationSource,
    NotificationSourceFactory, SouthboundDb, SouthboundDbFactory,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

type Factories<T> = RwLock<HashMap<String, Arc<T>>>;

fn read<T: ?Sized>(map: &Factories<T>) -> RwLockReadGuard<'_, HashMap<String, Arc<T>>> {
    map.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T: ?Sized>(map: &Factories<T>) -> RwLockWriteGuard<'_, HashMap<String, Arc<T>>> {
    map.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lookup<T: ?Sized>(map: &Factories<T>, role: &str, config: &BackendConfig) -> Result<Arc<T>> {
    let name = config.type_name();
    read(map)
        .get(name)
        .cloned()
        .ok_or_else(|| Error::config(format!("Unknown {} backend: {}", role, name)))
}

fn names<T: ?Sized>(map: &Factories<T>) -> Vec<String> {
    let mut names: Vec<String> = read(map).keys().cloned().collect();
    names.sort();
    names
}

/// Registry of collaborator backend factories
///
/// ## Thread Safety
///
/// The registry uses interior mutability with RwLock, allowing concurrent
/// reads and exclusive writes.
#[derive(Default)]
pub struct BackendRegistry {
    kernels: Factories<dyn KernelNetworkFactory>,

    southbound: Factories<dyn SouthboundDbFactory>,

    notifications: Factories<dyn NotificationSourceFactory>,

    northbound: Factories<dyn NorthboundDbFactory>,
}

impl BackendRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the "memory" backend for every role
    ///
    /// The southbound database and its notification feed share one store.
    pub fn with_memory_backends() -> Self {
        Self::with_memory(MemorySouthbound::new(), MemoryNorthbound::new())
    }

    /// Like [`with_memory_backends`](Self::with_memory_backends) over
    /// caller-owned stores
    pub fn with_memory(southbound: MemorySouthbound, northbound: MemoryNorthbound) -> Self {
        let registry = Self::new();
        let sb = MemorySouthboundFactory::new(southbound);
        registry.register_kernel("memory", Box::new(MemoryKernelFactory));
        registry.register_southbound("memory", Box::new(sb.clone()));
        registry.register_notification_source("memory", Box::new(sb));
        registry.register_northbound("memory", Box::new(MemoryNorthboundFactory::new(northbound)));
        registry
    }

    pub fn register_kernel(&self, name: impl Into<String>, factory: Box<dyn KernelNetworkFactory>) {
        write(&self.kernels).insert(name.into(), Arc::from(factory));
    }

    pub fn register_southbound(&self, name: impl Into<String>, factory: Box<dyn SouthboundDbFactory>) {
        write(&self.southbound).insert(name.into(), Arc::from(factory));
    }

    pub fn register_notification_source(
        &self,
        name: impl Into<String>,
        factory: Box<dyn NotificationSourceFactory>,
    ) {
        write(&self.notifications).insert(name.into(), Arc::from(factory));
    }

    pub fn register_northbound(&self, name: impl Into<String>, factory: Box<dyn NorthboundDbFactory>) {
        write(&self.northbound).insert(name.into(), Arc::from(factory));
    }

    /// Create a kernel backend from configuration
    ///
    /// # Returns
    ///
    /// - `Ok(Arc<dyn KernelNetwork>)`: Created backend
    /// - `Err(Error)`: If the backend type is not registered or creation fails
    pub fn create_kernel(&self, config: &BackendConfig) -> Result<Arc<dyn KernelNetwork>> {
        lookup(&self.kernels, "kernel", config)?.create(config)
    }

    pub fn create_southbound(&self, config: &BackendConfig) -> Result<Arc<dyn SouthboundDb>> {
        lookup(&self.southbound, "southbound", config)?.create(config)
    }

    /// Notification feed for the southbound backend named by `config`
    pub fn create_notification_source(
        &self,
        config: &BackendConfig,
    ) -> Result<Arc<dyn NotificationSource>> {
        lookup(&self.notifications, "notification", config)?.create(config)
    }

    pub fn create_northbound(&self, config: &BackendConfig) -> Result<Arc<dyn NorthboundDb>> {
        lookup(&self.northbound, "northbound", config)?.create(config)
    }

    pub fn list_kernels(&self) -> Vec<String> {
        names(&self.kernels)
    }

    pub fn list_southbound(&self) -> Vec<String> {
        names(&self.southbound)
    }

    pub fn list_northbound(&self) -> Vec<String> {
        names(&self.northbound)
    }

    pub fn has_kernel(&self, name: &str) -> bool {
        read(&self.kernels).contains_key(name)
    }

    pub fn has_southbound(&self, name: &str) -> bool {
        read(&self.southbound).contains_key(name)
    }

    pub fn has_northbound(&self, name: &str) -> bool {
        read(&self.northbound).contains_key(name)
    }
}
