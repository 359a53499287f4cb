//! Routing table bookkeeping
//!
//! Keeps the bridge to table assignment and the routes this process believes
//! it installed, per device. The tracked set is what stale route cleanup
//! compares observed routes against.

use crate::net::RouteEntry;
use std::collections::BTreeMap;

/// Bridge tables and the routes tracked on each device
#[derive(Debug, Clone, Default)]
pub struct RoutingTables {
    tables: BTreeMap<String, u32>,
    routes: BTreeMap<String, Vec<RouteEntry>>,
}

impl RoutingTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign `table` to `bridge`
    pub fn register(&mut self, bridge: impl Into<String>, table: u32) {
        self.tables.insert(bridge.into(), table);
    }

    pub fn table_for(&self, bridge: &str) -> Option<u32> {
        self.tables.get(bridge).copied()
    }

    /// All registered table IDs
    pub fn table_ids(&self) -> Vec<u32> {
        self.tables.values().copied().collect()
    }

    pub fn bridges(&self) -> impl Iterator<Item = (&str, u32)> {
        self.tables.iter().map(|(b, t)| (b.as_str(), *t))
    }

    /// Record a route on its device; tracking the same route twice is a no-op
    pub fn track(&mut self, route: RouteEntry) {
        let entries = self.routes.entry(route.device.to_string()).or_default();
        if !entries.contains(&route) {
            entries.push(route);
        }
    }

    /// Forget a route; returns whether it was tracked
    pub fn untrack(&mut self, route: &RouteEntry) -> bool {
        let Some(entries) = self.routes.get_mut(route.device.as_str()) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|r| r != route);
        before != entries.len()
    }

    /// Drop every route tracked on a device (the device is gone)
    pub fn forget_device(&mut self, device: &str) -> Vec<RouteEntry> {
        self.routes.remove(device).unwrap_or_default()
    }

    pub fn tracked(&self, device: &str) -> &[RouteEntry] {
        self.routes.get(device).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn is_tracked(&self, route: &RouteEntry) -> bool {
        self.tracked(route.device.as_str()).contains(route)
    }

    /// Total number of tracked routes
    pub fn len(&self) -> usize {
        self.routes.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reset tracked routes and table assignments
    pub fn clear(&mut self) {
        self.tables.clear();
        self.routes.clear();
    }
}
