use std::{
    path::{Path, PathBuf},
    time::Duration,
};

pub const ROOT_PATH: &str = "/var/run/rtain/network";

/// Where networking state lives on disk and how patient the drivers are.
#[derive(Clone, Debug)]
pub struct NetworkConfig {
    /// One JSON file per network, named after the network.
    pub networks_dir: PathBuf,
    /// The address allocation table.
    pub ipam_path: PathBuf,
    /// Serializes create/delete across processes.
    pub lock_path: PathBuf,

    /// Attempts to find a freshly created link before giving up.
    pub link_retries: usize,
    pub link_retry_delay: Duration,
}

impl NetworkConfig {
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();

        Self {
            networks_dir: root.join("network"),
            ipam_path: root.join("ipam").join("subnet.json"),
            lock_path: root.join("network.lock"),
            link_retries: 2,
            link_retry_delay: Duration::from_secs(2),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self::with_root(ROOT_PATH)
    }
}
