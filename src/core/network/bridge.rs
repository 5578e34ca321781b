use std::{future::Future, sync::Arc, time::Duration};

use anyhow::Context;
use futures::future::BoxFuture;
use ipnet::Ipv4Net;
use log::{debug, info, warn};

use super::{
    driver::NetworkDriver,
    endpoint::{Endpoint, VethPair},
    iptables::{Firewall, Iptables, NatRule},
    netlink::Netlink,
    network::Network,
};
use crate::core::{config::NetworkConfig, error::NetError};

pub const BRIDGE: &str = "bridge";

/// Linux bridge per network, veth pair per endpoint, masquerade for egress.
pub struct BridgeDriver {
    firewall: Arc<dyn Firewall>,
    link_retries: usize,
    link_retry_delay: Duration,
}

impl BridgeDriver {
    pub fn new(config: &NetworkConfig) -> Self {
        Self::with_firewall(config, Arc::new(Iptables))
    }

    pub fn with_firewall(config: &NetworkConfig, firewall: Arc<dyn Firewall>) -> Self {
        Self {
            firewall,
            link_retries: config.link_retries.max(1),
            link_retry_delay: config.link_retry_delay,
        }
    }

    async fn create_network(&self, ip_range: Ipv4Net, name: &str) -> anyhow::Result<Network> {
        let network = Network {
            name: name.to_string(),
            ip_range,
            driver: BRIDGE.to_string(),
        };

        let netlink = Netlink::connect()?;
        self.create_bridge(&netlink, name).await?;

        if let Err(e) = self.init_bridge(&netlink, &network).await {
            // Best effort only, a half-configured bridge may stay behind.
            if let Ok(index) = netlink.link_index(name).await {
                if let Err(cleanup) = netlink.delete_link(index).await {
                    warn!("Failed to remove half-configured bridge {}: {}", name, cleanup);
                }
            }
            return Err(e);
        }

        info!("Bridge {} is up with {}", name, ip_range);
        Ok(network)
    }

    async fn create_bridge(&self, netlink: &Netlink, name: &str) -> anyhow::Result<()> {
        if netlink.get_link(name).await?.is_some() {
            return Err(NetError::DeviceExists(name.to_string()).into());
        }

        netlink
            .create_bridge(name)
            .await
            .with_context(|| format!("Failed to create bridge {}", name))
    }

    async fn init_bridge(&self, netlink: &Netlink, network: &Network) -> anyhow::Result<()> {
        let index = self.wait_for_bridge(netlink, &network.name).await?;

        netlink
            .add_address(index, network.gateway(), network.ip_range.prefix_len())
            .await
            .with_context(|| {
                format!(
                    "Failed to assign {} to bridge {}",
                    network.ip_range, network.name
                )
            })?;

        netlink
            .set_up(index)
            .await
            .with_context(|| format!("Failed to set bridge {} up", network.name))?;

        self.firewall
            .append(&masquerade(network))
            .await
            .with_context(|| format!("Failed to set up NAT for {}", network.name))?;

        Ok(())
    }

    async fn wait_for_bridge(&self, netlink: &Netlink, name: &str) -> anyhow::Result<u32> {
        wait_for_link(name, self.link_retries, self.link_retry_delay, move || async move {
            let link = netlink.get_link(name).await?;
            Ok::<_, anyhow::Error>(link.map(|link| link.header.index))
        })
        .await
    }

    async fn delete_network(&self, network: &Network) -> anyhow::Result<()> {
        let netlink = Netlink::connect()?;

        let index = netlink.link_index(&network.name).await?;
        netlink
            .delete_link(index)
            .await
            .with_context(|| format!("Failed to delete bridge {}", network.name))?;

        if let Err(e) = self.firewall.delete(&masquerade(network)).await {
            warn!("Failed to remove NAT rule of {}: {:#}", network.name, e);
        }

        info!("Bridge {} deleted", network.name);
        Ok(())
    }

    async fn connect_endpoint(
        &self,
        network: &Network,
        endpoint: &mut Endpoint,
    ) -> anyhow::Result<()> {
        let device = veth_pair(&endpoint.id, &network.name);
        let netlink = Netlink::connect()?;

        let bridge = netlink.link_index(&network.name).await?;
        plug_veth(&netlink, &device, bridge).await?;

        debug!("Endpoint {} plugged into {} via {}", endpoint.id, network.name, device);
        endpoint.device = Some(device);

        Ok(())
    }

    async fn disconnect_endpoint(&self, network: &Network, endpoint: &Endpoint) -> anyhow::Result<()> {
        let device = veth_pair(&endpoint.id, &network.name);
        let netlink = Netlink::connect()?;

        // Deleting either end removes both. The pair is already gone when the
        // container's namespace was destroyed.
        match netlink.get_link(&device.host).await? {
            Some(link) => netlink
                .delete_link(link.header.index)
                .await
                .with_context(|| format!("Failed to delete {}", device.host))?,
            None => debug!("{} already removed", device.host),
        }

        Ok(())
    }
}

impl NetworkDriver for BridgeDriver {
    fn name(&self) -> &str {
        BRIDGE
    }

    fn create<'a>(&'a self, ip_range: Ipv4Net, name: &'a str) -> BoxFuture<'a, anyhow::Result<Network>> {
        Box::pin(self.create_network(ip_range, name))
    }

    fn delete<'a>(&'a self, network: &'a Network) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(self.delete_network(network))
    }

    fn connect<'a>(
        &'a self,
        network: &'a Network,
        endpoint: &'a mut Endpoint,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(self.connect_endpoint(network, endpoint))
    }

    fn disconnect<'a>(
        &'a self,
        network: &'a Network,
        endpoint: &'a Endpoint,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(self.disconnect_endpoint(network, endpoint))
    }
}

/// A new link is not always visible right after creation. Asks `lookup` up to
/// `retries` times, sleeping `delay` after each miss.
async fn wait_for_link<F, Fut>(
    name: &str,
    retries: usize,
    delay: Duration,
    mut lookup: F,
) -> anyhow::Result<u32>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<Option<u32>>>,
{
    for attempt in 1..=retries {
        if let Some(index) = lookup().await? {
            return Ok(index);
        }

        debug!(
            "Link {} not visible yet, retrying ({}/{})",
            name, attempt, retries
        );
        tokio::time::sleep(delay).await;
    }

    Err(NetError::LinkNotFound(name.to_string()).into())
}

/// Creates `device` and plugs its host end into `bridge`. A pair that cannot
/// be plugged in is removed again.
async fn plug_veth(netlink: &Netlink, device: &VethPair, bridge: u32) -> anyhow::Result<()> {
    netlink
        .create_veth(&device.host, &device.peer)
        .await
        .with_context(|| format!("Failed to create veth pair {}", device))?;

    if let Err(e) = attach_host_end(netlink, device, bridge).await {
        // Deleting the host end takes the peer with it.
        if let Ok(index) = netlink.link_index(&device.host).await {
            if let Err(cleanup) = netlink.delete_link(index).await {
                warn!("Failed to remove veth pair {}: {}", device, cleanup);
            }
        }
        return Err(e);
    }

    Ok(())
}

async fn attach_host_end(netlink: &Netlink, device: &VethPair, bridge: u32) -> anyhow::Result<()> {
    let host = netlink.link_index(&device.host).await?;

    netlink
        .set_controller(host, bridge)
        .await
        .with_context(|| format!("Failed to attach {} to {}", device.host, device.bridge))?;
    netlink
        .set_up(host)
        .await
        .with_context(|| format!("Failed to set {} up", device.host))
}

/// Interface names are capped at 15 bytes, so both ends are derived from the
/// first 5 characters of the endpoint id.
pub fn veth_pair(endpoint_id: &str, bridge: &str) -> VethPair {
    let short: String = endpoint_id.chars().take(5).collect();

    VethPair {
        peer: format!("cif-{}", short),
        host: short,
        bridge: bridge.to_string(),
    }
}

fn masquerade(network: &Network) -> NatRule {
    NatRule::Masquerade {
        subnet: network.subnet(),
        bridge: network.name.clone(),
    }
}
