use std::{
    collections::BTreeMap,
    io::Write,
    net::Ipv4Addr,
    path::Path,
    sync::Arc,
};

use anyhow::Context;
use ipnet::Ipv4Net;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tabwriter::TabWriter;

use super::{
    bridge::BridgeDriver,
    driver::Drivers,
    ipam::{parse_subnet, IPAM},
    lock::{write_atomic, FileLock},
};
use crate::core::{config::NetworkConfig, error::NetError};

/// Longest interface name the kernel accepts (IFNAMSIZ minus the NUL).
const MAX_NAME_LEN: usize = 15;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Network {
    pub name: String,
    /// Gateway address with the subnet prefix, e.g. `172.20.0.1/24`.
    pub ip_range: Ipv4Net,
    pub driver: String,
}

impl Network {
    pub fn gateway(&self) -> Ipv4Addr {
        self.ip_range.addr()
    }

    pub fn subnet(&self) -> Ipv4Net {
        self.ip_range.trunc()
    }

    fn dump(&self, dir: &Path) -> anyhow::Result<()> {
        let contents = serde_json::to_vec(self)?;
        write_atomic(&dir.join(&self.name), &contents)
            .with_context(|| format!("Failed to save network {}", self.name))
    }

    fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read(path)?;
        Ok(serde_json::from_slice(&contents)?)
    }

    fn remove(&self, dir: &Path) -> anyhow::Result<()> {
        match std::fs::remove_file(dir.join(&self.name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove network file {}", self.name)),
        }
    }
}

/// Every network known on this host, backed by one file per network.
///
/// `create` and `delete` hold the registry lock for their whole run and take
/// the allocator's lock inside it, never the other way around.
#[derive(Debug)]
pub struct Networks {
    config: NetworkConfig,
    ipam: IPAM,
    drivers: Drivers,
    networks: BTreeMap<String, Network>,
}

impl Networks {
    /// Registers the built-in drivers and loads the persisted networks.
    pub fn init(config: NetworkConfig) -> anyhow::Result<Self> {
        let mut drivers = Drivers::new();
        drivers.register(Arc::new(BridgeDriver::new(&config)));

        Self::with_drivers(config, drivers)
    }

    pub fn with_drivers(config: NetworkConfig, drivers: Drivers) -> anyhow::Result<Self> {
        let dir = &config.networks_dir;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let mut networks = BTreeMap::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();

            // Lock and temporary files are dot-prefixed.
            if file_name.starts_with('.') || !entry.file_type()?.is_file() {
                continue;
            }

            match Network::load(&entry.path()) {
                Ok(network) if network.name == file_name => {
                    networks.insert(file_name, network);
                }
                Ok(network) => warn!(
                    "Skipping network file {}, it describes {}",
                    file_name, network.name
                ),
                Err(e) => warn!("Skipping malformed network file {}: {:#}", file_name, e),
            }
        }
        info!("Loaded {} network(s) from {}", networks.len(), dir.display());

        Ok(Self {
            ipam: IPAM::new(&config.ipam_path),
            config,
            drivers,
            networks,
        })
    }

    pub fn get(&self, name: &str) -> Option<&Network> {
        self.networks.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Network> {
        self.networks.values()
    }

    pub fn ipam(&self) -> &IPAM {
        &self.ipam
    }

    pub fn drivers(&self) -> &Drivers {
        &self.drivers
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Table of all networks, sorted by name.
    pub fn list(&self) -> anyhow::Result<String> {
        let mut tw = TabWriter::new(vec![]);
        writeln!(tw, "NAME\tIP RANGE\tDRIVER")?;

        for network in self.networks.values() {
            writeln!(
                tw,
                "{}\t{}\t{}",
                network.name, network.ip_range, network.driver
            )?;
        }
        tw.flush()?;

        let table = tw
            .into_inner()
            .map_err(|_| anyhow::anyhow!("Failed to render network table"))?;
        Ok(String::from_utf8(table)?)
    }

    /// Reserves the subnet's gateway address, has `driver` build the network
    /// and records it.
    pub async fn create(&mut self, driver: &str, subnet: &str, name: &str) -> anyhow::Result<Network> {
        check_name(name)?;
        let subnet = parse_subnet(subnet)?.trunc();
        let driver = self.drivers.get(driver)?;

        let _lock = FileLock::exclusive(&self.config.lock_path)?;

        if self.networks.contains_key(name) || self.config.networks_dir.join(name).exists() {
            return Err(NetError::NetworkExists(name.to_string()).into());
        }

        let gateway = self.ipam.allocate(&subnet)?;
        let ip_range = Ipv4Net::new(gateway, subnet.prefix_len())?;

        let network = match driver.create(ip_range, name).await {
            Ok(network) => network,
            Err(e) => {
                if let Err(release) = self.ipam.release(&subnet, gateway) {
                    warn!("Failed to release gateway {}: {:#}", gateway, release);
                }
                return Err(e.context(format!("Failed to create network {}", name)));
            }
        };

        network.dump(&self.config.networks_dir)?;
        self.networks.insert(name.to_string(), network.clone());

        info!("Network {} created on {}", name, network.ip_range);
        Ok(network)
    }

    /// Returns the gateway address, tears the network down and forgets it.
    /// Stops at the first failing step. A network the driver fails to remove
    /// stays registered and keeps its gateway address.
    pub async fn delete(&mut self, name: &str) -> anyhow::Result<()> {
        let network = self
            .networks
            .get(name)
            .cloned()
            .ok_or(NetError::NoSuchNetwork(name.to_string()))?;
        let driver = self.drivers.get(&network.driver)?;

        let _lock = FileLock::exclusive(&self.config.lock_path)?;

        self.ipam
            .release(&network.subnet(), network.gateway())
            .with_context(|| format!("Failed to release gateway of {}", name))?;
        if let Err(e) = driver.delete(&network).await {
            if let Err(reserve) = self.ipam.reserve(&network.subnet(), network.gateway()) {
                warn!("Failed to take back gateway {}: {:#}", network.gateway(), reserve);
            }
            return Err(e.context(format!("Failed to remove network {}", name)));
        }
        network.remove(&self.config.networks_dir)?;

        self.networks.remove(name);

        info!("Network {} deleted", name);
        Ok(())
    }
}

fn check_name(name: &str) -> Result<(), NetError> {
    if name.is_empty() {
        return Err(NetError::invalid_name(name, "empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(NetError::invalid_name(name, "longer than 15 bytes"));
    }
    if name.starts_with('.') {
        return Err(NetError::invalid_name(name, "starts with a dot"));
    }
    if name.contains(|c: char| c == '/' || c == ':' || c.is_whitespace()) {
        return Err(NetError::invalid_name(name, "contains '/', ':' or whitespace"));
    }

    Ok(())
}
