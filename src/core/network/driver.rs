use std::{collections::HashMap, fmt, sync::Arc};

use futures::future::BoxFuture;
use ipnet::Ipv4Net;

use super::{endpoint::Endpoint, network::Network};
use crate::core::error::NetError;

/// What a network backend must do. A new backend implements these four
/// operations and registers itself in [`Drivers`]; neither the registry nor
/// the connector changes.
pub trait NetworkDriver: Send + Sync {
    /// Driver kind, as stored in each network's record.
    fn name(&self) -> &str;

    /// Materializes network `name`. `ip_range` carries the gateway address
    /// and the subnet prefix.
    fn create<'a>(&'a self, ip_range: Ipv4Net, name: &'a str)
        -> BoxFuture<'a, anyhow::Result<Network>>;

    fn delete<'a>(&'a self, network: &'a Network) -> BoxFuture<'a, anyhow::Result<()>>;

    /// Creates the host side of `endpoint` and fills in its device.
    fn connect<'a>(
        &'a self,
        network: &'a Network,
        endpoint: &'a mut Endpoint,
    ) -> BoxFuture<'a, anyhow::Result<()>>;

    fn disconnect<'a>(
        &'a self,
        network: &'a Network,
        endpoint: &'a Endpoint,
    ) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// Driver kind -> driver.
#[derive(Clone, Default)]
pub struct Drivers {
    drivers: HashMap<String, Arc<dyn NetworkDriver>>,
}

impl Drivers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, driver: Arc<dyn NetworkDriver>) {
        self.drivers.insert(driver.name().to_string(), driver);
    }

    pub fn get(&self, kind: &str) -> Result<Arc<dyn NetworkDriver>, NetError> {
        self.drivers
            .get(kind)
            .cloned()
            .ok_or(NetError::NoSuchDriver(kind.to_string()))
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<_> = self.drivers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl fmt::Debug for Drivers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Drivers")
            .field("kinds", &self.kinds())
            .finish()
    }
}
