//! Rootfs preparation and pivot.
//!
//! `prepare_rootfs` runs inside the freshly unshared mount namespace and
//! must keep its exact step order: make the host view non-propagating,
//! privatize the rootfs' parent mount if it is shared (pivot_root refuses a
//! shared parent, and the self-bind would leak into the host otherwise),
//! bind the rootfs onto itself so it is a mount point, apply the configured
//! mounts, replicate host devices, then pivot.
//!
//! The pivot keeps two open directory descriptors, one on the old `/` and
//! one on the new root. `pivot_root(".", ".")` is valid: afterwards `/` is
//! the new root and the cwd is the old one, which lets us pivot without a
//! scratch directory inside the rootfs, then slave + lazily detach the old
//! root through the saved descriptor.

use std::fs;
use std::os::fd::OwnedFd;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::Path;

use nix::fcntl::{OFlag, open};
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sys::stat::Mode;
use nix::unistd::{chdir, fchdir, pivot_root};

use crate::devices;
use crate::error::{Error, Result};
use crate::mounts::Mount;

/// Prepares `rootfs` and pivots the calling process into it.
///
/// Requires an already-unshared mount namespace. On return the process
/// runs with `rootfs` as `/` and the previous root detached.
pub fn prepare_rootfs(rootfs: &Path, mounts: &[Mount]) -> Result<()> {
    prepare_root(rootfs)?;
    for m in mounts {
        m.apply(rootfs)?;
    }
    devices::create_devices(rootfs)?;
    pivot(rootfs)?;
    Ok(())
}

fn prepare_root(rootfs: &Path) -> Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_SLAVE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| Error::sys("make / recursively slave", e))?;

    make_parent_mount_private(rootfs)?;

    // pivot_root requires the new root to be a mount point.
    mount(
        Some(rootfs),
        rootfs,
        Some("bind"),
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| Error::sys(format!("bind rootfs {}", rootfs.display()), e))?;

    chdir(rootfs).map_err(|e| Error::sys(format!("chdir {}", rootfs.display()), e))?;
    Ok(())
}

fn pivot(rootfs: &Path) -> Result<()> {
    let oldroot_fd = open(Path::new("/"), OFlag::O_DIRECTORY | OFlag::O_RDONLY, Mode::empty())
        .map_err(|e| Error::sys("open old root", e))?;
    // SAFETY: `oldroot_fd` is a freshly opened descriptor we now own exclusively.
    let oldroot: OwnedFd = unsafe { OwnedFd::from_raw_fd(oldroot_fd) };
    let newroot_fd = open(rootfs, OFlag::O_DIRECTORY | OFlag::O_RDONLY, Mode::empty())
        .map_err(|e| Error::sys("open new root", e))?;
    // SAFETY: `newroot_fd` is a freshly opened descriptor we now own exclusively.
    let newroot: OwnedFd = unsafe { OwnedFd::from_raw_fd(newroot_fd) };

    fchdir(newroot.as_raw_fd()).map_err(|e| Error::sys("fchdir new root", e))?;
    pivot_root(".", ".").map_err(|e| Error::sys("pivot_root", e))?;

    // The kernel leaves the cwd on the old root, but that is not
    // contractual; go there explicitly through the saved descriptor.
    fchdir(oldroot.as_raw_fd()).map_err(|e| Error::sys("fchdir old root", e))?;

    // Slave, not private: a recursive-private old root races host-side
    // mount users that still see our references.
    mount(
        None::<&str>,
        ".",
        None::<&str>,
        MsFlags::MS_SLAVE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| Error::sys("make old root slave", e))?;
    umount2(".", MntFlags::MNT_DETACH).map_err(|e| Error::sys("detach old root", e))?;

    chdir("/").map_err(|e| Error::sys("chdir /", e))?;
    Ok(())
}

/// One row of `/proc/self/mountinfo` that this module cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub mount_point: String,
    /// Optional fields between the separator, e.g. `shared:12`.
    pub optional: String,
}

/// Parses mountinfo content, keeping entries whose mount point is a path
/// prefix of `path`.
pub fn parent_mounts_of(content: &str, path: &Path) -> Vec<MountInfo> {
    let path = path.to_string_lossy();
    let mut out = Vec::new();
    for line in content.lines() {
        let Some((before, _after)) = line.split_once(" - ") else {
            continue;
        };
        let fields: Vec<&str> = before.split(' ').collect();
        if fields.len() < 5 {
            continue;
        }
        let mount_point = unescape_mountinfo(fields[4]);
        if !path.starts_with(mount_point.as_str()) {
            continue;
        }
        out.push(MountInfo {
            mount_point,
            optional: fields[6..].join(" "),
        });
    }
    out
}

/// Octal escapes used by the kernel in mountinfo paths.
fn unescape_mountinfo(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let digits: String = chars.clone().take(3).collect();
        if digits.len() == 3
            && let Ok(code) = u8::from_str_radix(&digits, 8)
        {
            out.push(code as char);
            chars.nth(2);
        } else {
            out.push(c);
        }
    }
    out
}

/// Finds the longest-prefix parent mount of `path`.
pub fn parent_mount(path: &Path) -> Result<MountInfo> {
    let content = fs::read_to_string("/proc/self/mountinfo")
        .map_err(|e| Error::path_io("read", "/proc/self/mountinfo", e))?;
    parent_mounts_of(&content, path)
        .into_iter()
        .max_by_key(|mi| mi.mount_point.len())
        .ok_or_else(|| Error::Store(format!("no parent mount found for {}", path.display())))
}

fn make_parent_mount_private(rootfs: &Path) -> Result<()> {
    let parent = parent_mount(rootfs)?;
    let shared = parent
        .optional
        .split(' ')
        .any(|opt| opt.starts_with("shared:"));
    if shared {
        mount(
            None::<&str>,
            parent.mount_point.as_str(),
            None::<&str>,
            MsFlags::MS_PRIVATE,
            None::<&str>,
        )
        .map_err(|e| Error::sys(format!("make {} private", parent.mount_point), e))?;
    }
    Ok(())
}
