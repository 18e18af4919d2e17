//! Host device replication into a container rootfs.
//!
//! Walks `/dev`, classifies each node, and recreates it under the new
//! rootfs. `mknod` is tried first; when the kernel refuses (user namespaces
//! cannot mknod) the node is bind-mounted from the host instead.

use std::fs;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::mount::{MsFlags, mount};
use nix::sys::stat::{Mode, SFlag, lstat, makedev, mknod};
use nix::unistd::{Gid, Uid, chown};
use tracing::debug;

use crate::error::{Error, Result};

/// Directories under /dev that hold per-container or pseudo state, never
/// replicated. `.lxc`, `.lxd-mounts` and `.udev` carry host manager state.
const SKIPPED_DIRS: &[&str] = &["pts", "shm", "fd", "mqueue", ".lxc", ".lxd-mounts", ".udev"];

/// Files under /dev never replicated.
const SKIPPED_FILES: &[&str] = &["console"];

/// Kind of a device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Block,
    Char,
    Fifo,
}

/// One host device node.
#[derive(Debug, Clone)]
pub struct Device {
    /// Absolute host path, e.g. `/dev/null`.
    pub path: PathBuf,
    pub device_type: DeviceType,
    pub major: u64,
    pub minor: u64,
    /// Permission bits of the host node.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// Stats a path and classifies it as a device node.
///
/// Returns `Ok(None)` for regular files, directories, sockets and symlinks.
pub fn device_from_path(path: &Path) -> Result<Option<Device>> {
    let stat = lstat(path).map_err(|e| Error::sys(format!("lstat {}", path.display()), e))?;

    let device_type = match stat.st_mode & SFlag::S_IFMT.bits() {
        fmt if fmt == SFlag::S_IFBLK.bits() => DeviceType::Block,
        fmt if fmt == SFlag::S_IFCHR.bits() => DeviceType::Char,
        fmt if fmt == SFlag::S_IFIFO.bits() => DeviceType::Fifo,
        _ => return Ok(None),
    };

    Ok(Some(Device {
        path: path.to_path_buf(),
        device_type,
        major: nix::sys::stat::major(stat.st_rdev),
        minor: nix::sys::stat::minor(stat.st_rdev),
        mode: stat.st_mode & 0o7777,
        uid: stat.st_uid,
        gid: stat.st_gid,
    }))
}

/// Recursively collects the device nodes under `path`.
pub fn devices_under(path: &Path) -> Result<Vec<Device>> {
    let mut out = Vec::new();
    let entries = fs::read_dir(path).map_err(|e| Error::path_io("read device directory", path, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::path_io("read device directory", path, e))?;
        let entry_path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();

        let file_type = entry
            .file_type()
            .map_err(|e| Error::path_io("stat device entry", &entry_path, e))?;
        if file_type.is_dir() {
            if SKIPPED_DIRS.contains(&name.as_ref()) {
                continue;
            }
            out.extend(devices_under(&entry_path)?);
            continue;
        }
        if SKIPPED_FILES.contains(&name.as_ref()) {
            continue;
        }
        match device_from_path(&entry_path) {
            Ok(Some(device)) => out.push(device),
            Ok(None) => {}
            // The node can vanish between readdir and lstat.
            Err(Error::Sys { source, .. }) if source == Errno::ENOENT => {}
            Err(e) => return Err(e),
        }
    }
    Ok(out)
}

/// Replicates every host device with a real major number under `rootfs`.
pub fn create_devices(rootfs: &Path) -> Result<()> {
    for device in devices_under(Path::new("/dev"))? {
        if device.major == 0 {
            continue;
        }
        create_device_node(rootfs, &device)?;
    }
    Ok(())
}

fn create_device_node(rootfs: &Path, device: &Device) -> Result<()> {
    let relative = device.path.strip_prefix("/").unwrap_or(&device.path);
    let dest = rootfs.join(relative);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::path_io("create device directory", parent, e))?;
    }

    match mknod_device(&dest, device) {
        Ok(()) => Ok(()),
        Err(Error::Sys { source, .. }) if source == Errno::EEXIST => Ok(()),
        Err(Error::Sys { source, .. }) if source == Errno::EPERM || source == Errno::EACCES => {
            // mknod denied (user namespace): bind-mount the host node onto
            // an empty file instead.
            bind_mount_device(&dest, device)
        }
        Err(e) => Err(e),
    }
}

fn mknod_device(dest: &Path, device: &Device) -> Result<()> {
    let kind = match device.device_type {
        DeviceType::Block => SFlag::S_IFBLK,
        DeviceType::Char => SFlag::S_IFCHR,
        DeviceType::Fifo => SFlag::S_IFIFO,
    };
    mknod(
        dest,
        kind,
        Mode::from_bits_truncate(device.mode),
        makedev(device.major, device.minor),
    )
    .map_err(|e| Error::sys(format!("mknod {}", dest.display()), e))?;
    chown(
        dest,
        Some(Uid::from_raw(device.uid)),
        Some(Gid::from_raw(device.gid)),
    )
    .map_err(|e| Error::sys(format!("chown {}", dest.display()), e))?;
    Ok(())
}

fn bind_mount_device(dest: &Path, device: &Device) -> Result<()> {
    match fs::File::create_new(dest) {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(Error::path_io("create device placeholder", dest, e)),
    }
    debug!("bind-mounting device {} onto {}", device.path.display(), dest.display());
    mount(
        Some(&device.path),
        dest,
        Some("bind"),
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| Error::sys(format!("bind mount device {}", dest.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regular_file_is_not_a_device() {
        let temp = tempfile::TempDir::new().unwrap();
        let file = temp.path().join("plain");
        fs::write(&file, b"x").unwrap();
        assert!(device_from_path(&file).unwrap().is_none());
    }

    #[test]
    fn dev_null_classifies_as_char() {
        let device = device_from_path(Path::new("/dev/null")).unwrap().unwrap();
        assert_eq!(device.device_type, DeviceType::Char);
        assert_eq!(device.major, 1);
        assert_eq!(device.minor, 3);
    }

    #[test]
    fn walk_skips_pseudo_directories() {
        let devices = devices_under(Path::new("/dev")).unwrap();
        assert!(devices.iter().all(|d| {
            !d.path.starts_with("/dev/pts")
                && !d.path.starts_with("/dev/shm")
                && d.path != Path::new("/dev/console")
        }));
    }
}
