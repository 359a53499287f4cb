// # ovnbgp-core
//
// Core library for the OVN BGP route exposure daemon.
//
// ## Architecture Overview
//
// This library keeps three views in step: the OVN southbound database, the
// local kernel's routing state, and the BGP speaker that advertises it.
// - **Dispatcher**: evaluates row events against southbound notifications
// - **ExposureController**: decides what to advertise or withdraw on this node
// - **LinuxNet**: turns exposure decisions into idempotent kernel operations
// - **RouteBridge / FpmServer**: replays the BGP speaker's routes into the
//   northbound database
// - **BackendRegistry**: plugin-based construction of collaborator backends
//
// ## Design Principles
//
// 1. **Sequential dispatch**: notifications are handled one at a time, in order
// 2. **Pure predicates**: row events never mutate state when matching
// 3. **Idempotent reconciliation**: applying the same exposure twice is a no-op
// 4. **Narrow seams**: kernel and database access go through traits in `traits`

pub mod agent;
pub mod config;
pub mod error;
pub mod fpm;
pub mod memory;
pub mod net;
pub mod ovn;
pub mod reconciler;
pub mod registry;
pub mod traits;
pub mod watcher;

// Re-export core types for convenience
pub use agent::ExposureController;
pub use config::{AgentConfig, BackendConfig, EngineConfig, FpmConfig, FpmFormat};
pub use error::{Error, Result};
pub use fpm::{BridgeEvent, FpmServer, RouteBridge};
pub use memory::{MemoryKernel, MemoryNorthbound, MemorySouthbound};
pub use reconciler::LinuxNet;
pub use registry::BackendRegistry;
pub use traits::{
    AgentView, ExposureActions, KernelNetwork, Lifecycle, NorthboundDb, NotificationSource,
    SouthboundDb,
};
pub use watcher::{DispatchEvent, Dispatcher, EventRegistry};
