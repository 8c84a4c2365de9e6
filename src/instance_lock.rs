//! Single-instance guard: one agent process per agent id per host.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("another agent already holds {0}")]
    AlreadyHeld(PathBuf),

    #[error("lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Exclusive advisory lock on `<dir>/<agent_id>.lock`, held until dropped
/// or [`release`](InstanceLock::release)d.
#[derive(Debug)]
pub struct InstanceLock {
    file: Option<File>,
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire(dir: &Path, agent_id: &str) -> Result<Self, LockError> {
        let path = dir.join(format!("{}.lock", agent_id));
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(dir).map_err(io_err)?;
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(io_err)?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == io::ErrorKind::WouldBlock
                || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
            {
                return Err(LockError::AlreadyHeld(path.clone()));
            }
            return Err(io_err(e));
        }

        // Record the holder for operators; the lock itself is what matters.
        file.set_len(0).map_err(io_err)?;
        writeln!(file, "{}", std::process::id()).map_err(io_err)?;

        info!(path = %path.display(), "Instance lock acquired");
        Ok(Self {
            file: Some(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unlock now instead of at drop.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = fs2::FileExt::unlock(&file) {
                warn!(path = %self.path.display(), error = %e, "Failed to unlock instance lock");
            }
            debug!(path = %self.path.display(), "Instance lock released");
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        self.release();
    }
}
