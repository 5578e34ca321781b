use std::{net::Ipv4Addr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

use super::network::BRIDGE;

#[derive(Parser, Debug, Clone)]
#[command(name = "rtain-net")]
#[command(about = "rtain-net manages bridge networks for rtain containers.")]
pub struct CLI {
    /// Directory holding network records and the address table.
    #[arg(long, env = "RTAIN_NET_ROOT", global = true)]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Manage networks.
    #[command(subcommand)]
    Network(NetworkCommands),
    /// Attach a running container to a network.
    Connect(ConnectArgs),
    /// Detach a container from a network.
    Disconnect(DisconnectArgs),
}

#[derive(Subcommand, Debug, Clone)]
pub enum NetworkCommands {
    /// Create a network.
    Create(NetCreateArgs),
    /// List networks.
    #[command(alias = "ls")]
    List,
    /// Remove a network.
    #[command(alias = "rm")]
    Remove(NetRemoveArgs),
}

#[derive(Args, Debug, Clone)]
pub struct NetCreateArgs {
    /// Network driver.
    #[arg(short, long, default_value = BRIDGE)]
    pub driver: String,

    /// Subnet in CIDR notation, e.g. 172.20.0.0/24.
    #[arg(short, long)]
    pub subnet: String,

    /// Name of the network, also used for its bridge.
    pub name: String,
}

#[derive(Args, Debug, Clone)]
pub struct NetRemoveArgs {
    pub name: String,
}

#[derive(Args, Debug, Clone)]
pub struct ConnectArgs {
    /// Network to join.
    #[arg(short, long)]
    pub network: String,

    /// Container id.
    #[arg(long)]
    pub id: String,

    /// Pid of the container's init process.
    #[arg(long)]
    pub pid: i32,

    /// Publish a container port, hostPort:containerPort.
    #[arg(short, long = "publish")]
    pub publish: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct DisconnectArgs {
    #[arg(short, long)]
    pub network: String,

    #[arg(long)]
    pub id: String,

    /// Address the container was given on connect.
    #[arg(long)]
    pub ip: Ipv4Addr,

    /// Port mappings given on connect.
    #[arg(short, long = "publish")]
    pub publish: Vec<String>,
}
