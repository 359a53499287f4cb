//! Southbound database queries
//!
//! Only a handful of lookups are required from an implementation; the rest
//! are derived from them as provided methods.

use crate::config::BackendConfig;
use crate::error::Result;
use crate::net::IpPrefix;
use crate::ovn::{port_type, LoadBalancer, PortBinding, CR_LRP_PREFIX};
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;

/// Read access to the southbound database
#[async_trait]
pub trait SouthboundDb: Send + Sync {
    /// Port_Binding by logical port name
    async fn port_by_name(&self, name: &str) -> Result<Option<PortBinding>>;

    /// Ports on a datapath, optionally of one type
    async fn ports_on_datapath(
        &self,
        datapath: &str,
        port_type: Option<&str>,
    ) -> Result<Vec<PortBinding>>;

    /// Ports of one type
    async fn ports_by_type(&self, port_type: &str) -> Result<Vec<PortBinding>>;

    async fn all_ports(&self) -> Result<Vec<PortBinding>>;

    async fn load_balancers(&self) -> Result<Vec<LoadBalancer>>;

    /// A datapath is a provider network if it has a localnet port
    async fn is_provider_network(&self, datapath: &str) -> Result<bool> {
        Ok(!self
            .ports_on_datapath(datapath, Some(port_type::LOCALNET))
            .await?
            .is_empty())
    }

    /// Floating IP and its datapath for a logical port
    async fn get_fip_associated(&self, port: &str) -> Result<Option<(IpAddr, String)>> {
        for row in self.ports_by_type(port_type::PATCH).await? {
            let Some(nat) = &row.nat_addresses else {
                continue;
            };
            for entry in nat {
                if !entry.contains(port) {
                    continue;
                }
                let fip = entry
                    .split_whitespace()
                    .nth(1)
                    .and_then(|t| t.parse::<IpAddr>().ok());
                if let (Some(fip), Some(dp)) = (fip, row.datapath.clone()) {
                    return Ok(Some((fip, dp)));
                }
            }
        }
        Ok(None)
    }

    async fn is_port_on_chassis(&self, port: &str, chassis: &str) -> Result<bool> {
        Ok(self
            .port_by_name(port)
            .await?
            .map(|p| p.is_bound_to(chassis))
            .unwrap_or(false))
    }

    async fn is_port_deleted(&self, port: &str) -> Result<bool> {
        Ok(self.port_by_name(port).await?.is_none())
    }

    async fn ports_on_chassis(&self, chassis: &str) -> Result<Vec<PortBinding>> {
        Ok(self
            .all_ports()
            .await?
            .into_iter()
            .filter(|p| p.is_bound_to(chassis))
            .collect())
    }

    /// Names of chassis-redirect ports bound here
    async fn cr_lrp_ports_on_chassis(&self, chassis: &str) -> Result<Vec<String>> {
        Ok(self
            .ports_by_type(port_type::CHASSIS_REDIRECT)
            .await?
            .into_iter()
            .filter(|p| p.is_bound_to(chassis))
            .filter_map(|p| p.logical_port)
            .collect())
    }

    /// NAT addresses resident on this chassis for the patch port behind a
    /// chassis-redirect port
    async fn cr_lrp_nat_addresses_info(
        &self,
        cr_lrp: &str,
        chassis: &str,
    ) -> Result<(Vec<IpPrefix>, Option<PortBinding>)> {
        let Some(patch_name) = cr_lrp.strip_prefix(CR_LRP_PREFIX) else {
            return Ok((Vec::new(), None));
        };
        let Some(patch_row) = self.port_by_name(patch_name).await? else {
            return Ok((Vec::new(), None));
        };

        let mut ips = Vec::new();
        for entry in patch_row.nat_entries().unwrap_or_default() {
            if let Some(port) = &entry.port {
                if self.is_port_on_chassis(port, chassis).await? {
                    ips.extend(entry.ips);
                }
            }
        }
        Ok((ips, Some(patch_row)))
    }

    async fn provider_datapath_from_cr_lrp(&self, cr_lrp: &str) -> Result<Option<String>> {
        let Some(provider_port) = cr_lrp.strip_prefix(CR_LRP_PREFIX) else {
            return Ok(None);
        };
        Ok(self
            .port_by_name(provider_port)
            .await?
            .and_then(|p| p.datapath))
    }

    /// Provider network name and VLAN tag of a datapath, among `networks`
    async fn network_name_and_tag(
        &self,
        datapath: &str,
        networks: &[String],
    ) -> Result<Option<(String, Option<u16>)>> {
        for row in self
            .ports_on_datapath(datapath, Some(port_type::LOCALNET))
            .await?
        {
            if let Some(name) = row.option("network_name") {
                if networks.iter().any(|n| n == name) {
                    return Ok(Some((name.to_string(), row.vlan_tag())));
                }
            }
        }
        Ok(None)
    }

    async fn network_vlan_tag_by_network_name(&self, network: &str) -> Result<Option<u16>> {
        for row in self.ports_by_type(port_type::LOCALNET).await? {
            if row.option("network_name") == Some(network) {
                return Ok(row.vlan_tag());
            }
        }
        Ok(None)
    }

    /// Chassis-redirect port of a router, if bound to `chassis`
    async fn router_gateway_on_chassis(
        &self,
        datapath: &str,
        chassis: &str,
    ) -> Result<Option<String>> {
        let ports = self
            .ports_on_datapath(datapath, Some(port_type::CHASSIS_REDIRECT))
            .await?;
        Ok(ports
            .into_iter()
            .next()
            .filter(|p| p.is_bound_to(chassis))
            .and_then(|p| p.logical_port))
    }

    /// Router port peered with a switch datapath
    async fn lrp_port_for_datapath(&self, datapath: &str) -> Result<Option<String>> {
        for row in self
            .ports_on_datapath(datapath, Some(port_type::PATCH))
            .await?
        {
            if let Some(peer) = row.option("peer") {
                return Ok(Some(peer.to_string()));
            }
        }
        Ok(None)
    }

    async fn lrp_ports_for_router(&self, datapath: &str) -> Result<Vec<PortBinding>> {
        self.ports_on_datapath(datapath, Some(port_type::PATCH))
            .await
    }

    async fn port_datapath(&self, port: &str) -> Result<Option<String>> {
        Ok(self.port_by_name(port).await?.and_then(|p| p.datapath))
    }

    /// Load balancers spanning a provider datapath and at least one other
    async fn ovn_lbs_on_provider_datapath(&self, datapath: &str) -> Result<Vec<LoadBalancer>> {
        Ok(self
            .load_balancers()
            .await?
            .into_iter()
            .filter(|lb| {
                lb.attached_datapaths()
                    .map(|dps| dps.len() > 1 && dps.contains(datapath))
                    .unwrap_or(false)
            })
            .collect())
    }
}

/// Helper trait for constructing southbound clients from configuration
pub trait SouthboundDbFactory: Send + Sync {
    fn create(&self, config: &BackendConfig) -> Result<Arc<dyn SouthboundDb>>;
}
