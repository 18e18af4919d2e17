//! Directory locks for cross-process coordination.
//!
//! The base directory and every container workdir are guarded by exclusive
//! advisory locks taken on the directory itself. This is the only
//! synchronization primitive in the system: checkout and commit serialize on
//! the base directory, a running container holds its workdir lock for its
//! whole lifetime, and gc probes workdir locks to tell live containers from
//! dead ones.
//!
//! The descriptor is opened without `O_CLOEXEC` on purpose: the launcher's
//! `execve` must inherit the workdir lock so the replacement program keeps
//! the directory pinned until it exits.

use std::os::fd::OwnedFd;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::Path;

use nix::errno::Errno;
use nix::fcntl::{OFlag, open};
use nix::sys::stat::Mode;

use crate::error::{Error, Result};

/// An exclusive advisory lock on an open directory.
///
/// Dropping the handle closes the descriptor and releases the lock. A handle
/// that survives into `execve` keeps the lock held by the replacement
/// program.
#[derive(Debug)]
pub struct DirLock {
    fd: OwnedFd,
}

impl DirLock {
    /// Opens `path` as a directory and takes an exclusive `flock` on it.
    ///
    /// In blocking mode this waits for the current holder. In non-blocking
    /// mode contention is not an error: the caller sees `Ok(None)`. Failing
    /// to open the directory is always an error.
    pub fn acquire(path: &Path, blocking: bool) -> Result<Option<DirLock>> {
        let fd = open(path, OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty())
            .map_err(|e| Error::sys(format!("open lock directory {}", path.display()), e))?;
        // SAFETY: `fd` is a freshly opened descriptor we now own exclusively.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut op = libc::LOCK_EX;
        if !blocking {
            op |= libc::LOCK_NB;
        }
        // SAFETY: flock on a descriptor we own; the lock dies with the fd.
        let rc = unsafe { libc::flock(fd.as_raw_fd(), op) };
        if rc != 0 {
            let errno = Errno::last();
            if errno == Errno::EWOULDBLOCK {
                return Ok(None);
            }
            return Err(Error::sys(format!("flock {}", path.display()), errno));
        }

        Ok(Some(DirLock { fd }))
    }

    /// Raw descriptor number, for diagnostics.
    pub fn as_raw_fd(&self) -> i32 {
        self.fd.as_raw_fd()
    }
}
