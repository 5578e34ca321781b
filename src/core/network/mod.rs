mod bridge;
mod driver;
mod endpoint;
mod ipam;
mod iptables;
mod lock;
mod netlink;
mod netns;
mod network;

pub use bridge::{veth_pair, BridgeDriver, BRIDGE};
pub use driver::{Drivers, NetworkDriver};
pub use endpoint::{parse_port_mapping, Connector, ContainerInfo, Endpoint, VethPair};
pub use ipam::{parse_subnet, AllocationTable, IPAM, MIN_PREFIX_LEN};
pub use iptables::{Firewall, Iptables, NatRule};
pub use lock::FileLock;
pub use netns::{with_netns, EndpointSetup, HostNamespaces, Namespaces, NetnsGuard, NetnsSetup};
pub use network::{Network, Networks};
