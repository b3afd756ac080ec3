use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use log::{debug, warn};

use crate::error::{Result, UpgradeError};

/// Exclusive advisory lock held for the whole of one upgrade run.
///
/// Acquisition never waits: a second run fails with
/// [`UpgradeError::AlreadyRunning`]. The lock is released on drop.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| UpgradeError::io(format!("creating {}", parent.display()), e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| UpgradeError::io(format!("opening lock {}", path.display()), e))?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(true) => {
                debug!("lock: acquired {}", path.display());
                Ok(Self {
                    file,
                    path: path.to_path_buf(),
                })
            }
            Ok(false) | Err(_) => Err(UpgradeError::AlreadyRunning {
                lock_path: path.to_path_buf(),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!("lock: failed to release {}: {err}", self.path.display());
        } else {
            debug!("lock: released {}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_acquire_is_refused_until_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("locks").join("upgrade.lock");

        let first = RunLock::acquire(&path).unwrap();
        assert!(matches!(
            RunLock::acquire(&path),
            Err(UpgradeError::AlreadyRunning { .. })
        ));
        drop(first);
        assert!(RunLock::acquire(&path).is_ok());
    }
}
