// # Netlink Kernel Backend
//
// This crate provides the Linux implementation of `KernelNetwork` used by
// the daemon in production.
//
// ## Layout
//
// - `kernel`: `RtnetlinkKernel`, the backend itself (Linux only)
// - `command`: iproute2 invocations for typed link creation
// - `sysctl`: per-device proxy_arp / proxy_ndp writes under /proc/sys
//
// ## Platform Support
//
// The backend only exists on Linux. On other targets the factory still
// registers, but creating a backend returns a configuration error.

pub mod command;
pub mod sysctl;

#[cfg(target_os = "linux")]
pub mod kernel;

#[cfg(target_os = "linux")]
pub use kernel::RtnetlinkKernel;

pub use command::IpCommand;
pub use sysctl::Sysctl;

use ovnbgp_core::config::BackendConfig;
use ovnbgp_core::registry::BackendRegistry;
use ovnbgp_core::traits::{KernelNetwork, KernelNetworkFactory};
use ovnbgp_core::{Error, Result};
use std::sync::Arc;

/// Factory for creating rtnetlink kernel backends
pub struct RtnetlinkKernelFactory;

#[cfg(target_os = "linux")]
impl KernelNetworkFactory for RtnetlinkKernelFactory {
    fn create(&self, config: &BackendConfig) -> Result<Arc<dyn KernelNetwork>> {
        match config {
            BackendConfig::Netlink => Ok(Arc::new(RtnetlinkKernel::connect()?)),
            _ => Err(Error::config("Invalid config for netlink kernel backend")),
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl KernelNetworkFactory for RtnetlinkKernelFactory {
    fn create(&self, _config: &BackendConfig) -> Result<Arc<dyn KernelNetwork>> {
        Err(Error::config(
            "Netlink kernel backend is only supported on Linux",
        ))
    }
}

/// Register the netlink kernel backend with a registry
pub fn register(registry: &BackendRegistry) {
    registry.register_kernel("netlink", Box::new(RtnetlinkKernelFactory));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_under_netlink() {
        let registry = BackendRegistry::with_memory_backends();
        register(&registry);
        assert!(registry.has_kernel("netlink"));
        assert!(registry.has_kernel("memory"));
    }

    #[test]
    fn rejects_foreign_config() {
        let result = RtnetlinkKernelFactory.create(&BackendConfig::Memory);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    #[cfg(not(target_os = "linux"))]
    fn test_factory_unsupported() {
        let result = RtnetlinkKernelFactory.create(&BackendConfig::Netlink);
        assert!(result.is_err());
    }
}
