// # In-Memory Collaborators
//
// Unprivileged implementations of every collaborator seam.
//
// - `MemoryKernel`: devices, addresses, rules, routes and neighbours in a map
// - `MemorySouthbound`: port and load balancer tables plus their change feed
// - `MemoryNorthbound`: static routes with transactional writes
//
// The daemon uses them for dry runs; the test suites use them everywhere.

pub mod kernel;
pub mod northbound;
pub mod southbound;

pub use kernel::{KernelSnapshot, MemoryKernel, MemoryKernelFactory};
pub use northbound::{MemoryNorthbound, MemoryNorthboundFactory};
pub use southbound::{MemorySouthbound, MemorySouthboundFactory, changed_port_columns};
