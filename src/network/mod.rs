//! Container network attachment.
//!
//! A [`Network`] record fully describes one container's attachment and is
//! persisted to `network.json` in the workdir before execution, so an
//! out-of-band cleanup can reverse it without the launcher.
//!
//! Three modes:
//! - `host`: no-op; the container shares the host network namespace.
//! - `none`: the caller moves into a fresh anonymous namespace, no CNI.
//! - anything else names a CNI configuration: a *named* namespace is
//!   created, the caller switches **back** to its old namespace to run the
//!   plugin chain (the plugins act on the new namespace by path), then
//!   enters the new namespace for good.

pub mod cni;
pub mod netns;
pub mod ports;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::CNI_IFNAME;
use crate::error::{Error, Result};

use cni::{Cni, RuntimeConf};
use ports::PortMapping;

/// Network mode reserved names.
pub const MODE_HOST: &str = "host";
pub const MODE_NONE: &str = "none";

/// A container's network attachment, as persisted to `network.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub network_name: String,
    pub runtime_config: RuntimeConf,
    pub cni_config_dir: PathBuf,
    pub cni_plugin_dir: Vec<PathBuf>,
    pub network_namespace: String,
}

impl Network {
    /// Builds the attachment record for a container about to launch.
    pub fn new(
        network_name: String,
        cni_config_dir: PathBuf,
        cni_plugin_dir: Vec<PathBuf>,
        container_id: &str,
        hostname: &str,
        port_mappings: &[PortMapping],
    ) -> Network {
        let network_namespace = format!("cni-{}", container_id);
        let args = vec![
            ("IgnoreUnknown".to_string(), "1".to_string()),
            ("K8S_POD_NAME".to_string(), hostname.to_string()),
            ("K8S_POD_NAMESPACE".to_string(), network_namespace.clone()),
            (
                "K8S_POD_INFRA_CONTAINER_ID".to_string(),
                container_id.to_string(),
            ),
        ];

        let mut capability_args = HashMap::new();
        if !port_mappings.is_empty() {
            capability_args.insert(
                "portMappings".to_string(),
                serde_json::to_value(port_mappings).unwrap_or_default(),
            );
        }

        Network {
            network_name,
            runtime_config: RuntimeConf {
                container_id: container_id.to_string(),
                netns: netns::named_path(&network_namespace),
                ifname: CNI_IFNAME.to_string(),
                args,
                capability_args,
            },
            cni_config_dir,
            cni_plugin_dir,
            network_namespace,
        }
    }

    /// Reads a persisted record.
    pub fn load(path: &Path) -> Result<Network> {
        let raw = fs::read(path).map_err(|e| Error::path_io("read network record", path, e))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Persists the record so teardown can work without the launcher.
    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_vec(self)?;
        fs::write(path, raw).map_err(|e| Error::path_io("write network record", path, e))?;
        Ok(())
    }

    fn cni(&self) -> Cni {
        Cni::new(self.cni_config_dir.clone(), self.cni_plugin_dir.clone())
    }

    /// Performs the attachment for the calling thread.
    pub fn execute(&self) -> Result<()> {
        match self.network_name.as_str() {
            MODE_HOST => Ok(()),
            MODE_NONE => netns::new_anonymous(),
            name => {
                let old = netns::current()?;
                netns::create_named(&self.network_namespace)?;
                // The plugin chain runs from the old namespace; it reaches
                // the new one by path.
                netns::enter(&old)?;

                let cni = self.cni();
                let list = cni.load_conflist(name)?;
                cni.add(&list, &self.runtime_config)?;
                debug!("attached {} to network '{}'", self.runtime_config.container_id, name);

                let new = netns::open_named(&self.network_namespace)?;
                netns::enter(&new)
            }
        }
    }

    /// Reverses the attachment: CNI DEL plus namespace removal.
    pub fn remove(&self) -> Result<()> {
        match self.network_name.as_str() {
            MODE_HOST | MODE_NONE => Ok(()),
            name => {
                let cni = self.cni();
                let list = cni.load_conflist(name)?;
                cni.del(&list, &self.runtime_config)?;
                netns::delete_named(&self.network_namespace)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Network {
        let ports = vec![PortMapping {
            host_port: 8080,
            container_port: 80,
            protocol: "tcp".to_string(),
            host_ip: String::new(),
        }];
        Network::new(
            "podnet".to_string(),
            PathBuf::from("/etc/cni/net.d"),
            vec![PathBuf::from("/opt/cni/bin")],
            "0f9d6c3a-1111-2222-3333-444455556666",
            "0f9d6c3a",
            &ports,
        )
    }

    #[test]
    fn record_carries_cni_identity() {
        let net = sample();
        assert_eq!(net.network_namespace, "cni-0f9d6c3a-1111-2222-3333-444455556666");
        assert_eq!(
            net.runtime_config.netns,
            PathBuf::from("/var/run/netns/cni-0f9d6c3a-1111-2222-3333-444455556666")
        );
        assert_eq!(net.runtime_config.ifname, "eth0");

        let args: HashMap<_, _> = net.runtime_config.args.iter().cloned().collect();
        assert_eq!(args.get("IgnoreUnknown").map(String::as_str), Some("1"));
        assert_eq!(args.get("K8S_POD_NAME").map(String::as_str), Some("0f9d6c3a"));
        assert!(args.contains_key("K8S_POD_NAMESPACE"));
        assert!(args.contains_key("K8S_POD_INFRA_CONTAINER_ID"));
    }

    #[test]
    fn port_mappings_become_capability_args() {
        let net = sample();
        assert!(net.runtime_config.capability_args.contains_key("portMappings"));

        let none = Network::new(
            "podnet".to_string(),
            PathBuf::from("/etc/cni/net.d"),
            vec![],
            "cid",
            "host",
            &[],
        );
        assert!(none.runtime_config.capability_args.is_empty());
    }

    #[test]
    fn record_round_trips_through_disk() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("network.json");

        let net = sample();
        net.save(&path).unwrap();
        let loaded = Network::load(&path).unwrap();

        assert_eq!(loaded.network_name, net.network_name);
        assert_eq!(loaded.network_namespace, net.network_namespace);
        assert_eq!(loaded.runtime_config.container_id, net.runtime_config.container_id);
        assert_eq!(loaded.cni_plugin_dir, net.cni_plugin_dir);
    }

    #[test]
    fn host_mode_execute_and_remove_are_noops() {
        let net = Network::new(
            MODE_HOST.to_string(),
            PathBuf::from("/etc/cni/net.d"),
            vec![],
            "cid",
            "h",
            &[],
        );
        net.execute().unwrap();
        net.remove().unwrap();
    }
}
