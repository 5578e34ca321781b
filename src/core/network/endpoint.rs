use std::{fmt, net::Ipv4Addr, path::PathBuf, sync::Arc};

use anyhow::Context;
use ipnet::Ipv4Net;
use log::{error, info, warn};

use super::{
    iptables::{Firewall, Iptables, NatRule},
    netns::{EndpointSetup, NetnsSetup},
    network::{Network, Networks},
};
use crate::core::error::NetError;

/// Both ends of a veth cable and the bridge the host end is plugged into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethPair {
    pub host: String,
    pub peer: String,
    pub bridge: String,
}

impl fmt::Display for VethPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}@{}", self.host, self.peer, self.bridge)
    }
}

/// What the container side hands over when it wants networking.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub pid: i32,
    /// Handle of the container's network namespace.
    pub netns: PathBuf,
    /// `hostPort:containerPort` entries.
    pub port_mappings: Vec<String>,
}

impl ContainerInfo {
    pub fn new(id: &str, pid: i32, port_mappings: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            pid,
            netns: PathBuf::from(format!("/proc/{}/ns/net", pid)),
            port_mappings,
        }
    }
}

/// A container's attachment to one network. Lives as long as the caller
/// keeps it; nothing about it is persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    /// `<container id>-<network name>`
    pub id: String,
    pub ip_address: Ipv4Addr,
    /// Filled in by the driver on connect.
    pub device: Option<VethPair>,
    /// Name of the network this endpoint belongs to.
    pub network: String,
    pub port_mappings: Vec<String>,
}

impl Endpoint {
    pub fn new(
        container_id: &str,
        network: &Network,
        ip_address: Ipv4Addr,
        port_mappings: Vec<String>,
    ) -> Self {
        Self {
            id: format!("{}-{}", container_id, network.name),
            ip_address,
            device: None,
            network: network.name.clone(),
            port_mappings,
        }
    }

    /// The endpoint address with the network's prefix, e.g. `172.20.0.2/24`.
    pub fn ip_net(&self, network: &Network) -> anyhow::Result<Ipv4Net> {
        Ok(Ipv4Net::new(self.ip_address, network.ip_range.prefix_len())?)
    }

    /// DNAT rules for the well-formed port mappings; malformed ones are
    /// logged and left out.
    pub fn port_rules(&self) -> Vec<NatRule> {
        self.port_mappings
            .iter()
            .filter_map(|mapping| match parse_port_mapping(mapping) {
                Ok((host_port, container_port)) => Some(NatRule::PortForward {
                    host_port,
                    address: self.ip_address,
                    container_port,
                }),
                Err(e) => {
                    error!("Port mapping {:?} skipped: {}", mapping, e);
                    None
                }
            })
            .collect()
    }
}

/// Parses `hostPort:containerPort`.
pub fn parse_port_mapping(mapping: &str) -> anyhow::Result<(u16, u16)> {
    let fields: Vec<&str> = mapping.split(':').collect();
    let [host, container] = fields.as_slice() else {
        return Err(anyhow::anyhow!(
            "expected hostPort:containerPort, got {} field(s)",
            fields.len()
        ));
    };

    let host = host
        .parse::<u16>()
        .with_context(|| format!("invalid host port {:?}", host))?;
    let container = container
        .parse::<u16>()
        .with_context(|| format!("invalid container port {:?}", container))?;

    Ok((host, container))
}

/// Joins containers to networks and takes them off again.
pub struct Connector {
    setup: Arc<dyn EndpointSetup>,
    firewall: Arc<dyn Firewall>,
}

impl Default for Connector {
    fn default() -> Self {
        Self::new(Arc::new(NetnsSetup::default()), Arc::new(Iptables))
    }
}

impl Connector {
    pub fn new(setup: Arc<dyn EndpointSetup>, firewall: Arc<dyn Firewall>) -> Self {
        Self { setup, firewall }
    }

    /// Leases an address, builds the veth pair, configures the container end
    /// inside the container and publishes its ports, in that order.
    pub async fn connect(
        &self,
        networks: &Networks,
        network_name: &str,
        container: &ContainerInfo,
    ) -> anyhow::Result<Endpoint> {
        let network = networks
            .get(network_name)
            .ok_or(NetError::NoSuchNetwork(network_name.to_string()))?;
        let driver = networks.drivers().get(&network.driver)?;
        let ipam = networks.ipam();

        let ip = ipam.allocate(&network.subnet())?;
        let mut endpoint = Endpoint::new(
            &container.id,
            network,
            ip,
            container.port_mappings.clone(),
        );

        if let Err(e) = driver.connect(network, &mut endpoint).await {
            release_quietly(networks, network, ip);
            return Err(e.context(format!("Failed to plug {} into {}", endpoint.id, network.name)));
        }

        if let Err(e) = self.setup.setup(network, &endpoint, container).await {
            if let Err(cleanup) = driver.disconnect(network, &endpoint).await {
                warn!("Failed to remove veth of {}: {:#}", endpoint.id, cleanup);
            }
            release_quietly(networks, network, ip);
            return Err(e.context(format!(
                "Failed to configure {} in container {}",
                endpoint.id, container.id
            )));
        }

        self.publish_ports(&endpoint).await;

        info!(
            "Container {} joined {} as {}",
            container.id, network.name, endpoint.ip_address
        );
        Ok(endpoint)
    }

    /// Undoes [`Connector::connect`]: removes the port forwards, the veth pair
    /// and returns the address.
    pub async fn disconnect(&self, networks: &Networks, endpoint: &Endpoint) -> anyhow::Result<()> {
        let network = networks
            .get(&endpoint.network)
            .ok_or(NetError::NoSuchNetwork(endpoint.network.clone()))?;
        let driver = networks.drivers().get(&network.driver)?;

        for rule in endpoint.port_rules() {
            if let Err(e) = self.firewall.delete(&rule).await {
                warn!("Failed to remove `{}`: {:#}", rule, e);
            }
        }

        driver
            .disconnect(network, endpoint)
            .await
            .with_context(|| format!("Failed to unplug {}", endpoint.id))?;
        networks.ipam().release(&network.subnet(), endpoint.ip_address)?;

        info!("Endpoint {} left {}", endpoint.id, network.name);
        Ok(())
    }

    async fn publish_ports(&self, endpoint: &Endpoint) {
        for rule in endpoint.port_rules() {
            if let Err(e) = self.firewall.append(&rule).await {
                error!("Failed to install `{}`: {:#}", rule, e);
            }
        }
    }
}

fn release_quietly(networks: &Networks, network: &Network, ip: Ipv4Addr) {
    if let Err(e) = networks.ipam().release(&network.subnet(), ip) {
        warn!("Failed to release {} back to {}: {:#}", ip, network.name, e);
    }
}
