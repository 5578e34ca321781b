pub mod core;

pub use crate::core::execute;

// Re-export commonly used types for integration tests
pub use crate::core::{
    Connector, ContainerInfo, Drivers, Endpoint, EndpointSetup, Firewall, NatRule, NetError,
    Network, NetworkConfig, NetworkDriver, Networks, CLI, IPAM,
};
