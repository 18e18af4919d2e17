//! Mount records and option parsing.
//!
//! A `Mount` describes one filesystem mount inside the container: source,
//! container-relative destination, device type, kernel flags, propagation
//! flags, and fs-specific data. Option strings (`bind`, `ro`, `rshared`,
//! `mode=755`, ...) translate through a fixed table; anything unrecognized
//! becomes comma-joined data handed to the filesystem.

use std::fs;
use std::path::Path;

use nix::mount::{MsFlags, mount};

use crate::error::{Error, Result};

/// One mount to apply under the container rootfs.
#[derive(Debug, Clone)]
pub struct Mount {
    /// Source path or pseudo-fs name.
    pub source: String,
    /// Destination inside the container.
    pub destination: String,
    /// Device / filesystem type.
    pub device: String,
    /// Mount flags.
    pub flags: MsFlags,
    /// Propagation flags applied as follow-up remounts.
    pub propagation_flags: Vec<MsFlags>,
    /// Comma-joined fs-specific options.
    pub data: String,
    /// Relabel hint: "z" shared, "Z" unshared. Unused without SELinux.
    pub relabel: String,
}

impl Default for Mount {
    fn default() -> Self {
        Mount {
            source: String::default(),
            destination: String::default(),
            device: String::default(),
            flags: MsFlags::empty(),
            propagation_flags: Vec::default(),
            data: String::default(),
            relabel: String::default(),
        }
    }
}

struct FlagSpec {
    clear: bool,
    flag: MsFlags,
}

const fn set(flag: MsFlags) -> FlagSpec {
    FlagSpec { clear: false, flag }
}

const fn clear(flag: MsFlags) -> FlagSpec {
    FlagSpec { clear: true, flag }
}

fn flag_for(option: &str) -> Option<FlagSpec> {
    let spec = match option {
        "acl" => set(MsFlags::MS_POSIXACL),
        "async" => clear(MsFlags::MS_SYNCHRONOUS),
        "atime" => clear(MsFlags::MS_NOATIME),
        "bind" => set(MsFlags::MS_BIND),
        "defaults" => set(MsFlags::empty()),
        "dev" => clear(MsFlags::MS_NODEV),
        "diratime" => clear(MsFlags::MS_NODIRATIME),
        "dirsync" => set(MsFlags::MS_DIRSYNC),
        "exec" => clear(MsFlags::MS_NOEXEC),
        "iversion" => set(MsFlags::MS_I_VERSION),
        "loud" => clear(MsFlags::MS_SILENT),
        "mand" => set(MsFlags::MS_MANDLOCK),
        "noacl" => clear(MsFlags::MS_POSIXACL),
        "noatime" => set(MsFlags::MS_NOATIME),
        "nodev" => set(MsFlags::MS_NODEV),
        "nodiratime" => set(MsFlags::MS_NODIRATIME),
        "noexec" => set(MsFlags::MS_NOEXEC),
        "noiversion" => clear(MsFlags::MS_I_VERSION),
        "nomand" => clear(MsFlags::MS_MANDLOCK),
        "norelatime" => clear(MsFlags::MS_RELATIME),
        "nostrictatime" => clear(MsFlags::MS_STRICTATIME),
        "nosuid" => set(MsFlags::MS_NOSUID),
        "rbind" => set(MsFlags::MS_BIND.union(MsFlags::MS_REC)),
        "relatime" => set(MsFlags::MS_RELATIME),
        "remount" => set(MsFlags::MS_REMOUNT),
        "ro" => set(MsFlags::MS_RDONLY),
        "rw" => clear(MsFlags::MS_RDONLY),
        "silent" => set(MsFlags::MS_SILENT),
        "strictatime" => set(MsFlags::MS_STRICTATIME),
        "suid" => clear(MsFlags::MS_NOSUID),
        "sync" => set(MsFlags::MS_SYNCHRONOUS),
        _ => return None,
    };
    Some(spec)
}

fn propagation_for(option: &str) -> Option<MsFlags> {
    let flag = match option {
        "private" => MsFlags::MS_PRIVATE,
        "shared" => MsFlags::MS_SHARED,
        "slave" => MsFlags::MS_SLAVE,
        "unbindable" => MsFlags::MS_UNBINDABLE,
        "rprivate" => MsFlags::MS_PRIVATE.union(MsFlags::MS_REC),
        "rshared" => MsFlags::MS_SHARED.union(MsFlags::MS_REC),
        "rslave" => MsFlags::MS_SLAVE.union(MsFlags::MS_REC),
        "runbindable" => MsFlags::MS_UNBINDABLE.union(MsFlags::MS_REC),
        _ => return None,
    };
    Some(flag)
}

/// Parses an option list into `(flags, propagation flags, data)`.
///
/// Options that map to no flag (and `defaults`, which maps to the empty
/// flag) fall through to the data string.
pub fn parse_mount_options<S: AsRef<str>>(options: &[S]) -> (MsFlags, Vec<MsFlags>, String) {
    let mut flags = MsFlags::empty();
    let mut propagation = Vec::new();
    let mut data = Vec::new();

    for option in options {
        let option = option.as_ref();
        // A table entry with the empty flag ("defaults") carries no bit to
        // set and falls through to the data string like an unknown token.
        if let Some(spec) = flag_for(option).filter(|s| !s.flag.is_empty()) {
            if spec.clear {
                flags &= !spec.flag;
            } else {
                flags |= spec.flag;
            }
        } else if let Some(flag) = propagation_for(option) {
            propagation.push(flag);
        } else {
            data.push(option.to_string());
        }
    }

    (flags, propagation, data.join(","))
}

/// Parses a user volume string `src:dest[:opts]`; defaults `bind,rw,exec`.
pub fn parse_volume(spec: &str) -> Result<Mount> {
    let parts: Vec<&str> = spec.splitn(3, ':').collect();
    if parts.len() < 2 || parts[0].is_empty() || parts[1].is_empty() {
        return Err(Error::InvalidVolume {
            spec: spec.to_string(),
        });
    }

    let mut options = vec!["bind".to_string(), "rw".to_string(), "exec".to_string()];
    if parts.len() == 3 {
        options.extend(parts[2].split(',').map(str::to_string));
    }
    let (flags, propagation_flags, data) = parse_mount_options(&options);

    Ok(Mount {
        source: parts[0].to_string(),
        destination: parts[1].to_string(),
        flags,
        propagation_flags,
        data,
        ..Default::default()
    })
}

/// The mounts every container gets before user volumes.
pub fn default_mounts() -> Vec<Mount> {
    vec![
        Mount {
            destination: "/proc".to_string(),
            device: "proc".to_string(),
            source: "proc".to_string(),
            ..Default::default()
        },
        Mount {
            destination: "/dev".to_string(),
            device: "tmpfs".to_string(),
            source: "tmpfs".to_string(),
            flags: MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME,
            data: "mode=755,size=65536k".to_string(),
            ..Default::default()
        },
        Mount {
            destination: "/dev/pts".to_string(),
            device: "devpts".to_string(),
            source: "devpts".to_string(),
            flags: MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
            data: "newinstance,ptmxmode=0666,mode=0620,gid=5".to_string(),
            ..Default::default()
        },
        Mount {
            destination: "/dev/shm".to_string(),
            device: "tmpfs".to_string(),
            source: "shm".to_string(),
            flags: MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
            data: "mode=1777,size=65536k".to_string(),
            ..Default::default()
        },
        Mount {
            destination: "/dev/mqueue".to_string(),
            device: "mqueue".to_string(),
            source: "mqueue".to_string(),
            flags: MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
            ..Default::default()
        },
        Mount {
            destination: "/sys".to_string(),
            device: "sysfs".to_string(),
            source: "sysfs".to_string(),
            flags: MsFlags::MS_NOSUID
                | MsFlags::MS_NOEXEC
                | MsFlags::MS_NODEV
                | MsFlags::MS_RDONLY,
            ..Default::default()
        },
    ]
}

impl Mount {
    /// Applies the mount under `rootfs`, creating the destination if needed.
    ///
    /// Propagation flags are applied as follow-up remounts on the same
    /// destination. Bind mounts ignore mount options on the first call, so a
    /// final remount pass makes flags like `ro` effective.
    pub fn apply(&self, rootfs: &Path) -> Result<()> {
        let dest = rootfs.join(self.destination.trim_start_matches('/'));
        match fs::symlink_metadata(&dest) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                fs::create_dir_all(&dest)
                    .map_err(|e| Error::path_io("create mount destination", &dest, e))?;
            }
            Err(e) => return Err(Error::path_io("stat mount destination", &dest, e)),
        }

        let source = non_empty(&self.source);
        let device = non_empty(&self.device);
        let data = non_empty(&self.data);
        mount(source, &dest, device, self.flags, data)
            .map_err(|e| Error::sys(format!("mount {} on {}", self.source, dest.display()), e))?;

        for pflag in &self.propagation_flags {
            mount(None::<&str>, &dest, None::<&str>, *pflag, None::<&str>)
                .map_err(|e| Error::sys(format!("remount propagation on {}", dest.display()), e))?;
        }

        if !(self.flags & !(MsFlags::MS_REC | MsFlags::MS_REMOUNT | MsFlags::MS_BIND)).is_empty() {
            mount(
                source,
                &dest,
                device,
                self.flags | MsFlags::MS_REMOUNT,
                None::<&str>,
            )
            .map_err(|e| Error::sys(format!("remount {}", dest.display()), e))?;
        }
        Ok(())
    }
}

fn non_empty(s: &str) -> Option<&str> {
    if s.is_empty() { None } else { Some(s) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_split_into_flags_propagation_and_data() {
        let (flags, pg, data) =
            parse_mount_options(&["bind", "ro", "nosuid", "mode=755", "size=64k"]);
        assert_eq!(
            flags,
            MsFlags::MS_BIND | MsFlags::MS_RDONLY | MsFlags::MS_NOSUID
        );
        assert!(pg.is_empty());
        assert_eq!(data, "mode=755,size=64k");
    }

    #[test]
    fn clear_options_remove_set_flags() {
        let (flags, _, _) = parse_mount_options(&["ro", "rw", "noexec", "exec"]);
        assert_eq!(flags, MsFlags::empty());
    }

    #[test]
    fn propagation_options_collect_separately() {
        let (flags, pg, data) = parse_mount_options(&["rbind", "rshared", "private"]);
        assert_eq!(flags, MsFlags::MS_BIND | MsFlags::MS_REC);
        assert_eq!(
            pg,
            vec![
                MsFlags::MS_SHARED | MsFlags::MS_REC,
                MsFlags::MS_PRIVATE
            ]
        );
        assert!(data.is_empty());
    }

    #[test]
    fn volume_defaults_to_bind_rw_exec() {
        let m = parse_volume("/host/data:/data").unwrap();
        assert_eq!(m.source, "/host/data");
        assert_eq!(m.destination, "/data");
        assert_eq!(m.flags, MsFlags::MS_BIND);
        assert!(m.data.is_empty());
    }

    #[test]
    fn volume_options_append() {
        let m = parse_volume("/a:/b:ro,nosuid").unwrap();
        assert!(m.flags.contains(MsFlags::MS_RDONLY));
        assert!(m.flags.contains(MsFlags::MS_NOSUID));
        assert!(m.flags.contains(MsFlags::MS_BIND));
    }

    #[test]
    fn volume_requires_source_and_destination() {
        assert!(parse_volume("/only-one").is_err());
        assert!(parse_volume(":/dest").is_err());
    }

    #[test]
    fn default_mounts_cover_the_pseudo_filesystems() {
        let destinations: Vec<_> = default_mounts()
            .iter()
            .map(|m| m.destination.clone())
            .collect();
        assert_eq!(
            destinations,
            vec!["/proc", "/dev", "/dev/pts", "/dev/shm", "/dev/mqueue", "/sys"]
        );
    }
}
