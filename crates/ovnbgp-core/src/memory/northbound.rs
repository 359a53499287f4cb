// # Memory Northbound
//
// In-memory static route table with all-or-nothing transactions.
//
// ## Transaction Semantics
//
// - Operations are validated against a working copy first
// - Nothing is committed if any operation fails
// - A delete without `if_exists` of a missing route fails the transaction

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::traits::{NorthboundDb, NorthboundDbFactory, StaticRoute, StaticRouteOp};

/// In-memory northbound database
#[derive(Debug, Clone, Default)]
pub struct MemoryNorthbound {
    inner: Arc<RwLock<BTreeSet<StaticRoute>>>,
}

impl MemoryNorthbound {
    pub fn new() -> Self {
        Self::default()
    }

    /// All static routes of a router
    pub async fn routes(&self, router: &str) -> Vec<StaticRoute> {
        self.inner
            .read()
            .await
            .iter()
            .filter(|r| r.router == router)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

fn apply(routes: &mut BTreeSet<StaticRoute>, op: &StaticRouteOp) -> Result<()> {
    match op {
        StaticRouteOp::Add {
            router,
            prefix,
            nexthop,
            ..
        } => {
            // replaces an existing route with the same key
            routes.retain(|r| !(r.router == *router && r.prefix == *prefix && r.nexthop == *nexthop));
            routes.insert(StaticRoute {
                router: router.clone(),
                prefix: *prefix,
                nexthop: *nexthop,
                external_ids: op.external_ids(),
            });
            Ok(())
        }
        StaticRouteOp::Delete {
            router,
            prefix,
            nexthop,
            if_exists,
        } => {
            let before = routes.len();
            routes.retain(|r| {
                !(r.router == *router
                    && r.prefix == *prefix
                    && nexthop.is_none_or(|nh| r.nexthop == nh))
            });
            if routes.len() == before && !if_exists {
                return Err(Error::northbound(format!("no such route: {}", op)));
            }
            Ok(())
        }
    }
}

#[async_trait]
impl NorthboundDb for MemoryNorthbound {
    async fn transact(&self, ops: Vec<StaticRouteOp>) -> Result<()> {
        let mut committed = self.inner.write().await;
        let mut working = committed.clone();
        for op in &ops {
            apply(&mut working, op)?;
        }
        *committed = working;
        debug!("northbound: committed {} operation(s)", ops.len());
        Ok(())
    }
}

/// Factory for the in-memory northbound database
#[derive(Clone, Default)]
pub struct MemoryNorthboundFactory {
    shared: MemoryNorthbound,
}

impl MemoryNorthboundFactory {
    pub fn new(shared: MemoryNorthbound) -> Self {
        Self { shared }
    }
}

impl NorthboundDbFactory for MemoryNorthboundFactory {
    fn create(&self, config: &BackendConfig) -> Result<Arc<dyn NorthboundDb>> {
        match config {
            BackendConfig::Memory => Ok(Arc::new(self.shared.clone())),
            other => Err(Error::config(format!(
                "memory northbound factory cannot build a {} backend",
                other.type_name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{ROUTING_PROTO_KEY, RoutingProto};

    fn add(prefix: &str, nexthop: &str) -> StaticRouteOp {
        StaticRouteOp::Add {
            router: "rtr".to_string(),
            prefix: prefix.parse().unwrap(),
            nexthop: nexthop.parse().unwrap(),
            routing_proto: RoutingProto::Bgp,
        }
    }

    fn delete(prefix: &str, if_exists: bool) -> StaticRouteOp {
        StaticRouteOp::Delete {
            router: "rtr".to_string(),
            prefix: prefix.parse().unwrap(),
            nexthop: None,
            if_exists,
        }
    }

    #[tokio::test]
    async fn test_add_tags_routing_proto() {
        let nb = MemoryNorthbound::new();
        nb.transact(vec![add("10.0.0.0/24", "172.24.4.1")])
            .await
            .unwrap();

        let routes = nb.routes("rtr").await;
        assert_eq!(routes.len(), 1);
        assert_eq!(
            routes[0].external_ids.get(ROUTING_PROTO_KEY).map(String::as_str),
            Some("bgp")
        );
    }

    #[tokio::test]
    async fn test_failed_transaction_commits_nothing() {
        let nb = MemoryNorthbound::new();
        let result = nb
            .transact(vec![add("10.0.0.0/24", "172.24.4.1"), delete("10.9.0.0/24", false)])
            .await;

        assert!(matches!(result, Err(Error::Northbound(_))));
        assert!(nb.is_empty().await);
    }

    #[tokio::test]
    async fn test_delete_if_exists_tolerates_missing() {
        let nb = MemoryNorthbound::new();
        nb.transact(vec![delete("10.9.0.0/24", true)]).await.unwrap();

        nb.transact(vec![add("10.0.0.0/24", "172.24.4.1")])
            .await
            .unwrap();
        nb.transact(vec![delete("10.0.0.0/24", true)]).await.unwrap();
        assert!(nb.is_empty().await);
    }
}
