use std::{
    fs::File,
    path::{Path, PathBuf},
};

use log::debug;
use nix::fcntl::{Flock, FlockArg};

use crate::core::error::NetError;

/// Exclusive `flock(2)` on a lock file, released on drop.
///
/// Locks belong to the open file description, so two handles in the same
/// process exclude each other just like two processes do.
pub struct FileLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl FileLock {
    /// Blocks until the lock is held. Creates the file and its parent
    /// directory when missing.
    pub fn exclusive(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent_dir) = path.parent() {
            std::fs::create_dir_all(parent_dir)?;
        }

        let file = File::options()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let lock = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
            NetError::Lock {
                path: path.clone(),
                source: errno,
            }
        })?;
        debug!("Locked {}", path.display());

        Ok(Self { _lock: lock, path })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        debug!("Unlocked {}", self.path.display());
    }
}

/// Replaces `path` with `contents` through a hidden temporary file in the
/// same directory, so readers never observe a half-written file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .ok_or(anyhow::anyhow!("{} has no parent directory", path.display()))?;
    std::fs::create_dir_all(dir)?;

    let file_name = path
        .file_name()
        .ok_or(anyhow::anyhow!("{} has no file name", path.display()))?;
    let tmp = dir.join(format!(".{}.tmp", file_name.to_string_lossy()));

    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;

    Ok(())
}
