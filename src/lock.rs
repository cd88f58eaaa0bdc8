//! Single-writer lock for the catalog
//!
//! Backup and restore hold an exclusive, non-blocking `flock` on
//! `<state_dir>/lock` for their whole run. The lock is released when the
//! guard is dropped, on every exit path including panics. Readers (`list`,
//! `verify` without status updates) do not take it.

use crate::error::{Result, SysbackError};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Name of the lock file inside the state directory
pub const LOCK_FILE: &str = "lock";

/// Guard holding the exclusive catalog lock
#[derive(Debug)]
pub struct CatalogLock {
    path: PathBuf,
    _lock: Flock<File>,
}

impl CatalogLock {
    /// Try to take the lock without waiting
    ///
    /// # Errors
    ///
    /// - [`SysbackError::LockHeld`] if another process (or another guard in
    ///   this process) holds it
    /// - [`SysbackError::PathIo`] if the lock file cannot be opened
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir).map_err(|e| SysbackError::path_io(state_dir, e))?;
        let path = state_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| SysbackError::path_io(&path, e))?;

        let mut lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_, Errno::EWOULDBLOCK)) => return Err(SysbackError::LockHeld(path)),
            Err((_, errno)) => {
                return Err(SysbackError::path_io(&path, std::io::Error::from(errno)));
            }
        };

        // Informational only; the flock is what excludes.
        let _ = lock.set_len(0);
        let _ = writeln!(&mut *lock, "{}", std::process::id());

        debug!("Acquired catalog lock {:?}", path);
        Ok(Self { path, _lock: lock })
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CatalogLock {
    fn drop(&mut self) {
        debug!("Released catalog lock {:?}", self.path);
    }
}
