use std::{fmt, net::Ipv4Addr};

use anyhow::Context;
use futures::future::BoxFuture;
use ipnet::Ipv4Net;
use log::debug;

/// A NAT rule this crate manages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NatRule {
    /// Outbound access for a subnet, except for traffic staying on its bridge.
    Masquerade { subnet: Ipv4Net, bridge: String },
    /// Host TCP port forwarded to a container address.
    PortForward {
        host_port: u16,
        address: Ipv4Addr,
        container_port: u16,
    },
}

impl NatRule {
    /// `iptables` arguments for appending (`-A`) or deleting (`-D`) the rule.
    pub fn args(&self, action: &str) -> Vec<String> {
        match self {
            NatRule::Masquerade { subnet, bridge } => {
                let subnet = subnet.to_string();
                owned(&[
                    "-t",
                    "nat",
                    action,
                    "POSTROUTING",
                    "-s",
                    subnet.as_str(),
                    "!",
                    "-o",
                    bridge.as_str(),
                    "-j",
                    "MASQUERADE",
                ])
            }
            NatRule::PortForward {
                host_port,
                address,
                container_port,
            } => {
                let dport = host_port.to_string();
                let destination = format!("{}:{}", address, container_port);
                owned(&[
                    "-t",
                    "nat",
                    action,
                    "PREROUTING",
                    "-p",
                    "tcp",
                    "-m",
                    "tcp",
                    "--dport",
                    dport.as_str(),
                    "-j",
                    "DNAT",
                    "--to-destination",
                    destination.as_str(),
                ])
            }
        }
    }
}

fn owned(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| arg.to_string()).collect()
}

impl fmt::Display for NatRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.args("-A").join(" "))
    }
}

/// Installs and removes NAT rules on the host.
pub trait Firewall: Send + Sync {
    fn append<'a>(&'a self, rule: &'a NatRule) -> BoxFuture<'a, anyhow::Result<()>>;
    fn delete<'a>(&'a self, rule: &'a NatRule) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// Shells out to the `iptables` executable.
#[derive(Debug, Default, Clone, Copy)]
pub struct Iptables;

impl Firewall for Iptables {
    fn append<'a>(&'a self, rule: &'a NatRule) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(exec_iptables(rule.args("-A")))
    }

    fn delete<'a>(&'a self, rule: &'a NatRule) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(exec_iptables(rule.args("-D")))
    }
}

async fn exec_iptables(args: Vec<String>) -> anyhow::Result<()> {
    debug!("Executing: iptables {}", args.join(" "));

    let output = tokio::process::Command::new("iptables")
        .args(&args)
        .output()
        .await
        .context("Failed to execute `iptables`")?;

    if !output.status.success() {
        return Err(anyhow::anyhow!(
            "`iptables {}` exited with {}: {}",
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }

    Ok(())
}
