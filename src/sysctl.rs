//! Sysctl parsing, policy, and application.
//!
//! Only namespaced sysctls may be set: the `kernel.*` IPC keys, `net.*`,
//! `fs.mqueue.*`, and `kernel.{hostname,domainname}`. A key whose namespace
//! is shared with the host is rejected outright rather than silently
//! skipped. Application happens after the pivot, as raw writes under
//! `/proc/sys`, so the values land in the container's view.

use std::fs;
use std::path::PathBuf;

use tracing::debug;

use crate::constants::{SYSCTL_IPC_KERNEL_KEYS, SYSCTL_UTS_KERNEL_KEYS};
use crate::error::{Error, Result};

/// One `key=value` sysctl request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sysctl {
    pub key: String,
    pub value: String,
}

impl Sysctl {
    fn spec(&self) -> String {
        format!("{}={}", self.key, self.value)
    }
}

/// Namespace sharing relevant to sysctl policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct NamespaceModes {
    pub host_network: bool,
    pub host_ipc: bool,
    pub host_uts: bool,
}

/// Parses `--sysctl` flag values.
pub fn parse(entries: &[String]) -> Result<Vec<Sysctl>> {
    entries
        .iter()
        .map(|entry| {
            let (key, value) = entry.split_once('=').ok_or_else(|| Error::InvalidSysctl {
                sysctl: entry.clone(),
                reason: "expected key=value".to_string(),
            })?;
            if key.is_empty() {
                return Err(Error::InvalidSysctl {
                    sysctl: entry.clone(),
                    reason: "empty key".to_string(),
                });
            }
            Ok(Sysctl {
                key: key.to_string(),
                value: value.to_string(),
            })
        })
        .collect()
}

/// Validates every request against the allowlist and the namespace modes.
pub fn validate(sysctls: &[Sysctl], modes: NamespaceModes) -> Result<()> {
    for sysctl in sysctls {
        let key = sysctl.key.as_str();

        if key.starts_with("net.") {
            if modes.host_network {
                return Err(Error::SysctlRejected {
                    sysctl: sysctl.spec(),
                    namespace: "Network".to_string(),
                });
            }
            continue;
        }
        if key.starts_with("fs.mqueue.") {
            if modes.host_ipc {
                return Err(Error::SysctlRejected {
                    sysctl: sysctl.spec(),
                    namespace: "IPC".to_string(),
                });
            }
            continue;
        }
        if SYSCTL_UTS_KERNEL_KEYS.contains(&key) {
            if modes.host_uts {
                return Err(Error::SysctlRejected {
                    sysctl: sysctl.spec(),
                    namespace: "UTS".to_string(),
                });
            }
            continue;
        }
        if SYSCTL_IPC_KERNEL_KEYS.contains(&key) {
            if modes.host_ipc {
                return Err(Error::SysctlRejected {
                    sysctl: sysctl.spec(),
                    namespace: "IPC".to_string(),
                });
            }
            continue;
        }

        return Err(Error::InvalidSysctl {
            sysctl: sysctl.spec(),
            reason: "not whitelisted for containers".to_string(),
        });
    }
    Ok(())
}

/// Writes each sysctl under `/proc/sys`, dots mapping to path separators.
///
/// Must run after the pivot so the writes hit the container's namespaces.
pub fn apply(sysctls: &[Sysctl]) -> Result<()> {
    for sysctl in sysctls {
        let path: PathBuf = PathBuf::from("/proc/sys").join(sysctl.key.replace('.', "/"));
        debug!("sysctl {} = {}", sysctl.key, sysctl.value);
        fs::write(&path, &sysctl.value).map_err(|e| Error::path_io("write sysctl", &path, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(s: &str) -> Vec<Sysctl> {
        parse(&[s.to_string()]).unwrap()
    }

    #[test]
    fn parse_splits_on_first_equals() {
        let parsed = one("kernel.sem=250 32000 32 128");
        assert_eq!(parsed[0].key, "kernel.sem");
        assert_eq!(parsed[0].value, "250 32000 32 128");
    }

    #[test]
    fn parse_rejects_missing_value() {
        assert!(parse(&["kernel.msgmax".to_string()]).is_err());
        assert!(parse(&["=1".to_string()]).is_err());
    }

    #[test]
    fn ipc_kernel_keys_allowed_in_private_ipc() {
        assert!(validate(&one("kernel.msgmax=65536"), NamespaceModes::default()).is_ok());
    }

    #[test]
    fn net_keys_rejected_with_host_network() {
        let modes = NamespaceModes {
            host_network: true,
            ..Default::default()
        };
        let err = validate(&one("net.ipv4.ip_forward=1"), modes).unwrap_err();
        assert!(err.to_string().contains("Network Namespace set to host"));
    }

    #[test]
    fn hostname_rejected_with_host_uts() {
        let modes = NamespaceModes {
            host_uts: true,
            ..Default::default()
        };
        let err = validate(&one("kernel.hostname=x"), modes).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("ignored"));
        assert!(msg.contains("UTS Namespace set to host"));
    }

    #[test]
    fn mqueue_rejected_with_host_ipc() {
        let modes = NamespaceModes {
            host_ipc: true,
            ..Default::default()
        };
        assert!(validate(&one("fs.mqueue.msg_max=64"), modes).is_err());
    }

    #[test]
    fn unrelated_keys_are_disallowed() {
        let err = validate(&one("vm.swappiness=10"), NamespaceModes::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidSysctl { .. }));
    }
}
