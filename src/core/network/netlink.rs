use std::{
    net::{IpAddr, Ipv4Addr},
    os::fd::RawFd,
};

use futures::TryStreamExt;
use netlink_packet_route::link::LinkMessage;

use crate::core::error::NetError;

/// A netlink connection bound to the network namespace of the thread that
/// opened it. Open one per namespace you want to talk to.
pub struct Netlink {
    handle: rtnetlink::Handle,
}

impl Netlink {
    /// Must be called from within a tokio runtime.
    pub fn connect() -> anyhow::Result<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);

        Ok(Self { handle })
    }

    pub async fn get_link(&self, name: &str) -> anyhow::Result<Option<LinkMessage>> {
        let result = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute()
            .try_next()
            .await;

        match result {
            Ok(link) => Ok(link),
            // The kernel answers a lookup by name with ENODEV.
            Err(e) if e.to_string().contains("No such device") => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn link_index(&self, name: &str) -> anyhow::Result<u32> {
        self.get_link(name)
            .await?
            .map(|link| link.header.index)
            .ok_or(NetError::LinkNotFound(name.to_string()).into())
    }

    pub async fn create_bridge(&self, name: &str) -> anyhow::Result<()> {
        self.handle
            .link()
            .add()
            .bridge(name.to_string())
            .execute()
            .await?;

        Ok(())
    }

    pub async fn create_veth(&self, host: &str, peer: &str) -> anyhow::Result<()> {
        self.handle
            .link()
            .add()
            .veth(host.to_string(), peer.to_string())
            .execute()
            .await?;

        Ok(())
    }

    pub async fn set_controller(&self, index: u32, controller: u32) -> anyhow::Result<()> {
        self.handle
            .link()
            .set(index)
            .controller(controller)
            .execute()
            .await?;

        Ok(())
    }

    pub async fn set_up(&self, index: u32) -> anyhow::Result<()> {
        self.handle.link().set(index).up().execute().await?;

        Ok(())
    }

    pub async fn add_address(&self, index: u32, ip: Ipv4Addr, prefix_len: u8) -> anyhow::Result<()> {
        self.handle
            .address()
            .add(index, IpAddr::V4(ip), prefix_len)
            .execute()
            .await?;

        Ok(())
    }

    pub async fn add_default_route(&self, index: u32, gateway: Ipv4Addr) -> anyhow::Result<()> {
        self.handle
            .route()
            .add()
            .v4()
            .destination_prefix(Ipv4Addr::UNSPECIFIED, 0)
            .gateway(gateway)
            .output_interface(index)
            .execute()
            .await?;

        Ok(())
    }

    pub async fn set_netns_by_fd(&self, index: u32, netns: RawFd) -> anyhow::Result<()> {
        self.handle
            .link()
            .set(index)
            .setns_by_fd(netns)
            .execute()
            .await?;

        Ok(())
    }

    pub async fn delete_link(&self, index: u32) -> anyhow::Result<()> {
        self.handle.link().del(index).execute().await?;

        Ok(())
    }
}
