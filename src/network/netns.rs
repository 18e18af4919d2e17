//! Named network namespace helper.
//!
//! Creates, enters and deletes network namespaces referenced by name under
//! `/var/run/netns`, the convention CNI plugins and iproute2 share. A named
//! namespace is kept alive by bind-mounting the creator's
//! `/proc/thread-self/ns/net` onto a file in that directory.
//!
//! All of these calls act on the *calling thread*; the caller is
//! responsible for staying on one OS thread across create/enter pairs.

use std::fs;
use std::os::fd::OwnedFd;
use std::os::unix::io::FromRawFd;
use std::path::{Path, PathBuf};

use nix::fcntl::{OFlag, open};
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sched::{CloneFlags, setns, unshare};
use nix::sys::stat::Mode;

use crate::constants::NETNS_RUN_DIR;
use crate::error::{Error, Result};

const THREAD_NS_NET: &str = "/proc/thread-self/ns/net";

/// Path of a named network namespace.
pub fn named_path(name: &str) -> PathBuf {
    Path::new(NETNS_RUN_DIR).join(name)
}

/// Opens the caller's current network namespace.
pub fn current() -> Result<OwnedFd> {
    let fd = open(Path::new(THREAD_NS_NET), OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())
        .map_err(|e| Error::sys("open current netns", e))?;
    // SAFETY: `fd` is a freshly opened descriptor we now own exclusively.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Opens a named network namespace.
pub fn open_named(name: &str) -> Result<OwnedFd> {
    let path = named_path(name);
    let fd = open(&path, OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())
        .map_err(|e| Error::sys(format!("open netns {}", path.display()), e))?;
    // SAFETY: `fd` is a freshly opened descriptor we now own exclusively.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Switches the calling thread into the given network namespace.
pub fn enter(ns: &OwnedFd) -> Result<()> {
    setns(ns, CloneFlags::CLONE_NEWNET).map_err(|e| Error::sys("setns network", e))
}

/// Moves the calling thread into a fresh anonymous network namespace.
pub fn new_anonymous() -> Result<()> {
    unshare(CloneFlags::CLONE_NEWNET).map_err(|e| Error::sys("unshare network", e))
}

/// Creates a named network namespace and leaves the calling thread inside
/// it. The bind mount keeps the namespace alive after every process left.
pub fn create_named(name: &str) -> Result<PathBuf> {
    fs::create_dir_all(NETNS_RUN_DIR)
        .map_err(|e| Error::path_io("create netns run directory", NETNS_RUN_DIR, e))?;

    let path = named_path(name);
    match fs::File::create_new(&path) {
        Ok(_) => {}
        Err(e) => return Err(Error::path_io("create netns file", &path, e)),
    }

    if let Err(e) = unshare(CloneFlags::CLONE_NEWNET) {
        let _ = fs::remove_file(&path);
        return Err(Error::sys("unshare network", e));
    }
    if let Err(e) = mount(
        Some(THREAD_NS_NET),
        &path,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    ) {
        let _ = fs::remove_file(&path);
        return Err(Error::sys(format!("bind netns onto {}", path.display()), e));
    }
    Ok(path)
}

/// Unpins and removes a named network namespace.
pub fn delete_named(name: &str) -> Result<()> {
    let path = named_path(name);
    match umount2(&path, MntFlags::MNT_DETACH) {
        Ok(()) => {}
        // Not mounted (already torn down) or already gone.
        Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => {}
        Err(e) => return Err(Error::sys(format!("unmount netns {}", path.display()), e)),
    }
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::path_io("remove netns file", &path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_path_layout() {
        assert_eq!(
            named_path("cni-abc"),
            PathBuf::from("/var/run/netns/cni-abc")
        );
    }

    #[test]
    fn current_namespace_opens() {
        // Works unprivileged: opening one's own ns file needs no capability.
        let fd = current().unwrap();
        drop(fd);
    }
}
