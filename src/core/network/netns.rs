//! Running code inside a container's network namespace.
//!
//! Namespace membership belongs to an OS thread, not to the process. The
//! configuration therefore runs on a thread spawned for it, and the switched
//! state is held by a [`NetnsGuard`] that cannot leave that thread and always
//! switches back when dropped, whether the work succeeded, failed or panicked.

use std::{
    fs::File,
    marker::PhantomData,
    net::Ipv4Addr,
    os::fd::AsRawFd,
    sync::Arc,
};

use anyhow::Context;
use futures::future::BoxFuture;
use ipnet::Ipv4Net;
use log::{debug, error};
use nix::sched::{setns, CloneFlags};

use super::{
    endpoint::{ContainerInfo, Endpoint},
    netlink::Netlink,
    network::Network,
};
use crate::core::error::NetError;

#[cfg_attr(test, mockall::automock)]
pub trait Namespaces: Send + Sync {
    /// Network namespace of the calling thread.
    fn current(&self) -> std::io::Result<File>;

    /// Moves the calling thread into `ns`.
    fn enter(&self, ns: &File) -> nix::Result<()>;
}

/// The kernel's namespaces, through `/proc` and `setns(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostNamespaces;

impl Namespaces for HostNamespaces {
    fn current(&self) -> std::io::Result<File> {
        File::open("/proc/thread-self/ns/net")
    }

    fn enter(&self, ns: &File) -> nix::Result<()> {
        setns(ns, CloneFlags::CLONE_NEWNET)
    }
}

/// The calling thread is inside another network namespace until this drops.
pub struct NetnsGuard<'a, N: Namespaces + ?Sized> {
    namespaces: &'a N,
    origin: File,
    // !Send: the switched state stays with the thread that switched.
    _pinned: PhantomData<*const ()>,
}

impl<'a, N: Namespaces + ?Sized> NetnsGuard<'a, N> {
    pub fn enter(namespaces: &'a N, target: &File) -> anyhow::Result<Self> {
        let origin = namespaces.current().map_err(|e| {
            NetError::namespace("failed to open the current network namespace", Some(Box::new(e)))
        })?;

        namespaces.enter(target).map_err(|e| {
            NetError::namespace("failed to enter the container network namespace", Some(Box::new(e)))
        })?;
        debug!("Entered container network namespace");

        Ok(Self {
            namespaces,
            origin,
            _pinned: PhantomData,
        })
    }
}

impl<N: Namespaces + ?Sized> Drop for NetnsGuard<'_, N> {
    fn drop(&mut self) {
        match self.namespaces.enter(&self.origin) {
            Ok(()) => debug!("Restored original network namespace"),
            Err(e) => error!("Failed to restore original network namespace: {}", e),
        }
    }
}

/// Runs `f` inside `target` and switches back before returning, so any error
/// from `f` reaches the caller only once the thread is home again.
pub fn with_netns<N, T>(
    namespaces: &N,
    target: &File,
    f: impl FnOnce() -> anyhow::Result<T>,
) -> anyhow::Result<T>
where
    N: Namespaces + ?Sized,
{
    let _guard = NetnsGuard::enter(namespaces, target)?;
    f()
}

/// Configures the container end of an endpoint.
pub trait EndpointSetup: Send + Sync {
    fn setup<'a>(
        &'a self,
        network: &'a Network,
        endpoint: &'a Endpoint,
        container: &'a ContainerInfo,
    ) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// Moves the veth peer into the container and sets up its address, loopback
/// and default route from inside the container's namespace.
pub struct NetnsSetup<N = HostNamespaces> {
    namespaces: Arc<N>,
}

impl Default for NetnsSetup<HostNamespaces> {
    fn default() -> Self {
        Self::new(Arc::new(HostNamespaces))
    }
}

impl<N: Namespaces + 'static> NetnsSetup<N> {
    pub fn new(namespaces: Arc<N>) -> Self {
        Self { namespaces }
    }

    async fn setup_endpoint(
        &self,
        network: &Network,
        endpoint: &Endpoint,
        container: &ContainerInfo,
    ) -> anyhow::Result<()> {
        let device = endpoint
            .device
            .clone()
            .ok_or(anyhow::anyhow!("endpoint {} has no device", endpoint.id))?;
        let address = endpoint.ip_net(network)?;
        let gateway = network.gateway();

        let netns = File::open(&container.netns).map_err(|e| {
            NetError::namespace(
                &format!("failed to open {}", container.netns.display()),
                Some(Box::new(e)),
            )
        })?;

        let namespaces = self.namespaces.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();

        std::thread::Builder::new()
            .name(format!("netns-{}", container.pid))
            .spawn(move || {
                let result = configure_pinned(namespaces.as_ref(), netns, &device.peer, address, gateway);
                let _ = tx.send(result);
            })
            .context("Failed to spawn namespace thread")?;

        rx.await
            .map_err(|_| NetError::namespace("namespace thread exited without a result", None))?
    }
}

impl<N: Namespaces + 'static> EndpointSetup for NetnsSetup<N> {
    fn setup<'a>(
        &'a self,
        network: &'a Network,
        endpoint: &'a Endpoint,
        container: &'a ContainerInfo,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(self.setup_endpoint(network, endpoint, container))
    }
}

/// Body of the namespace thread. `netns` is closed when this returns.
fn configure_pinned<N: Namespaces + ?Sized>(
    namespaces: &N,
    netns: File,
    peer: &str,
    address: Ipv4Net,
    gateway: Ipv4Addr,
) -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    rt.block_on(async {
        let netlink = Netlink::connect()?;
        let index = netlink.link_index(peer).await?;
        netlink
            .set_netns_by_fd(index, netns.as_raw_fd())
            .await
            .with_context(|| format!("Failed to move {} into the container", peer))
    })?;

    with_netns(namespaces, &netns, || {
        rt.block_on(configure_peer(peer, address, gateway))
    })
}

/// Runs inside the container namespace; the netlink socket opened here
/// belongs to it.
async fn configure_peer(peer: &str, address: Ipv4Net, gateway: Ipv4Addr) -> anyhow::Result<()> {
    let netlink = Netlink::connect()?;
    let index = netlink.link_index(peer).await?;

    netlink
        .add_address(index, address.addr(), address.prefix_len())
        .await
        .with_context(|| format!("Failed to assign {} to {}", address, peer))?;
    netlink
        .set_up(index)
        .await
        .with_context(|| format!("Failed to set {} up", peer))?;

    // Fresh namespaces start with loopback down.
    let lo = netlink.link_index("lo").await?;
    netlink
        .set_up(lo)
        .await
        .context("Failed to set lo up")?;

    netlink
        .add_default_route(index, gateway)
        .await
        .with_context(|| format!("Failed to add default route via {}", gateway))?;

    debug!("Configured {} as {} via {}", peer, address, gateway);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::Sequence;
    use std::{
        os::unix::fs::MetadataExt,
        panic::{self, AssertUnwindSafe},
        path::{Path, PathBuf},
        sync::atomic::{AtomicBool, Ordering},
    };
    use tempfile::TempDir;

    fn ino(file: &File) -> u64 {
        file.metadata().unwrap().ino()
    }

    struct Handles {
        _dir: TempDir,
        origin: PathBuf,
        target: File,
    }

    fn handles() -> Handles {
        let dir = TempDir::new().unwrap();
        let origin = dir.path().join("origin");
        let target = dir.path().join("target");
        std::fs::write(&origin, b"").unwrap();
        std::fs::write(&target, b"").unwrap();

        Handles {
            target: File::open(&target).unwrap(),
            origin,
            _dir: dir,
        }
    }

    /// Expects: capture origin, enter target, then return to origin.
    fn expect_round_trip(origin: &Path, target: &File) -> MockNamespaces {
        let mut ns = MockNamespaces::new();
        let mut seq = Sequence::new();

        let origin_path = origin.to_path_buf();
        let origin_ino = ino(&File::open(origin).unwrap());
        let target_ino = ino(target);

        ns.expect_current()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move || File::open(&origin_path));
        ns.expect_enter()
            .withf(move |ns| ino(ns) == target_ino)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        ns.expect_enter()
            .withf(move |ns| ino(ns) == origin_ino)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        ns
    }

    #[test]
    fn test_restores_origin_after_success() {
        let h = handles();
        let ns = expect_round_trip(&h.origin, &h.target);

        let value = with_netns(&ns, &h.target, || Ok(42)).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_restores_origin_when_body_fails() {
        let h = handles();
        let ns = expect_round_trip(&h.origin, &h.target);

        let err = with_netns(&ns, &h.target, || -> anyhow::Result<()> {
            Err(anyhow::anyhow!("address assignment failed"))
        })
        .unwrap_err();

        assert_eq!(err.to_string(), "address assignment failed");
    }

    #[test]
    fn test_restores_origin_when_body_panics() {
        let h = handles();
        let ns = expect_round_trip(&h.origin, &h.target);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            with_netns(&ns, &h.target, || -> anyhow::Result<()> { panic!("boom") })
        }));

        assert!(outcome.is_err());
    }

    #[test]
    fn test_no_restore_when_enter_fails() {
        let h = handles();
        let mut ns = MockNamespaces::new();
        let origin = h.origin.clone();

        ns.expect_current()
            .times(1)
            .returning(move || File::open(&origin));
        ns.expect_enter()
            .times(1)
            .returning(|_| Err(nix::errno::Errno::EPERM));

        let ran = AtomicBool::new(false);
        let err = with_netns(&ns, &h.target, || {
            ran.store(true, Ordering::SeqCst);
            Ok(())
        })
        .unwrap_err();

        assert!(!ran.load(Ordering::SeqCst));
        assert!(matches!(
            err.downcast_ref::<NetError>(),
            Some(NetError::Namespace { .. })
        ));
    }

    #[test]
    fn test_no_switch_when_origin_unavailable() {
        let h = handles();
        let mut ns = MockNamespaces::new();

        ns.expect_current()
            .times(1)
            .returning(|| Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied)));
        ns.expect_enter().never();

        assert!(with_netns(&ns, &h.target, || Ok(())).is_err());
    }

    fn own_netns() -> PathBuf {
        std::fs::read_link("/proc/thread-self/ns/net").unwrap()
    }

    #[tokio::test]
    async fn test_setup_fails_before_switching_without_netns_handle() {
        let network = Network {
            name: "testnet".to_string(),
            ip_range: "172.20.0.1/24".parse().unwrap(),
            driver: "bridge".to_string(),
        };
        let mut endpoint = Endpoint::new("abc123", &network, Ipv4Addr::new(172, 20, 0, 2), vec![]);
        endpoint.device = Some(crate::core::network::bridge::veth_pair(&endpoint.id, &network.name));

        let mut container = ContainerInfo::new("abc123", 1, vec![]);
        container.netns = PathBuf::from("/nonexistent/ns/net");

        let mut ns = MockNamespaces::new();
        ns.expect_current().never();
        ns.expect_enter().never();
        let setup = NetnsSetup::new(Arc::new(ns));

        let before = own_netns();
        let err = setup.setup(&network, &endpoint, &container).await.unwrap_err();
        assert_eq!(own_netns(), before);

        assert!(matches!(
            err.downcast_ref::<NetError>(),
            Some(NetError::Namespace { .. })
        ));
    }

    #[tokio::test]
    async fn test_setup_requires_device() {
        let network = Network {
            name: "testnet".to_string(),
            ip_range: "172.20.0.1/24".parse().unwrap(),
            driver: "bridge".to_string(),
        };
        let endpoint = Endpoint::new("abc123", &network, Ipv4Addr::new(172, 20, 0, 2), vec![]);
        let container = ContainerInfo::new("abc123", 1, vec![]);

        let setup = NetnsSetup::new(Arc::new(MockNamespaces::new()));
        assert!(setup.setup(&network, &endpoint, &container).await.is_err());
    }
}
