//! Cross-process single-instance lock using advisory file locking (fs2 flock).
//!
//! Held by the RPC server for its whole lifetime so two helpers never
//! bind the same socket. A stale socket file is only removed while the
//! lock is held.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct InstanceLock {
    path: PathBuf,
}

/// RAII guard that releases the lock on drop.
#[derive(Debug)]
pub struct InstanceLockGuard {
    file: File,
}

impl Drop for InstanceLockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl InstanceLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Non-blocking try-acquire: `None` if another process holds it.
    /// On success the holder's pid is written into the lock file.
    pub fn try_acquire(&self) -> Result<Option<InstanceLockGuard>> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&self.path)
            .with_context(|| format!("Failed to open lock file {}", self.path.display()))?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
            Err(ref e) if e.raw_os_error() == Some(libc::EWOULDBLOCK) => {
                // EAGAIN(11) / EWOULDBLOCK(35 on macOS): lock contention
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Some(InstanceLockGuard { file }))
    }

    /// Pid recorded by the current or last holder.
    pub fn holder_pid(&self) -> Option<u32> {
        fs::read_to_string(&self.path).ok()?.trim().parse().ok()
    }
}
