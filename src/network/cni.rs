//! Exec-based CNI plugin driver.
//!
//! Loads a network configuration list from the config directory and invokes
//! the plugin binaries with the CNI execution contract: the command in
//! `CNI_COMMAND`, runtime identity in `CNI_CONTAINERID` / `CNI_NETNS` /
//! `CNI_IFNAME` / `CNI_ARGS` / `CNI_PATH`, and the per-plugin configuration
//! JSON on stdin. ADD walks the plugin chain forward threading each result
//! into the next plugin's `prevResult`; DEL walks it in reverse.
//!
//! Capability arguments (`portMappings`) are injected as `runtimeConfig`
//! into plugins that declare the capability.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::constants::CNI_VERSION;
use crate::error::{Error, Result};

/// Runtime parameters for one container attachment, mirrored into the
/// environment of every plugin invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConf {
    pub container_id: String,
    pub netns: PathBuf,
    pub ifname: String,
    /// `CNI_ARGS` key/value pairs.
    pub args: Vec<(String, String)>,
    /// Capability arguments injected as `runtimeConfig`.
    #[serde(default)]
    pub capability_args: HashMap<String, Value>,
}

/// A parsed network configuration list (`*.conflist`, or a single `*.conf`
/// promoted to a one-element list).
#[derive(Debug, Clone)]
pub struct ConfList {
    pub name: String,
    pub cni_version: String,
    pub plugins: Vec<Map<String, Value>>,
}

/// Locator for configurations and plugin binaries.
#[derive(Debug, Clone)]
pub struct Cni {
    pub config_dir: PathBuf,
    pub plugin_dirs: Vec<PathBuf>,
}

#[derive(Deserialize)]
struct RawConfList {
    name: String,
    #[serde(rename = "cniVersion", default)]
    cni_version: String,
    #[serde(default)]
    plugins: Vec<Map<String, Value>>,
}

impl Cni {
    pub fn new(config_dir: PathBuf, plugin_dirs: Vec<PathBuf>) -> Cni {
        Cni {
            config_dir,
            plugin_dirs,
        }
    }

    /// Finds the configuration list named `name` in the config directory.
    pub fn load_conflist(&self, name: &str) -> Result<ConfList> {
        let entries = match fs::read_dir(&self.config_dir) {
            Ok(entries) => entries,
            Err(_) => {
                return Err(Error::NetworkNotFound {
                    name: name.to_string(),
                    dir: self.config_dir.clone(),
                });
            }
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("conflist") | Some("conf") | Some("json")
                )
            })
            .collect();
        files.sort();

        for path in files {
            let Ok(raw) = fs::read(&path) else { continue };
            if path.extension().and_then(|e| e.to_str()) == Some("conflist") {
                let Ok(list) = serde_json::from_slice::<RawConfList>(&raw) else {
                    continue;
                };
                if list.name == name {
                    return Ok(ConfList {
                        name: list.name,
                        cni_version: default_version(list.cni_version),
                        plugins: list.plugins,
                    });
                }
            } else {
                // A bare plugin conf promotes to a single-plugin list.
                let Ok(conf) = serde_json::from_slice::<Map<String, Value>>(&raw) else {
                    continue;
                };
                if conf.get("name").and_then(Value::as_str) == Some(name) {
                    let version = conf
                        .get("cniVersion")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string();
                    return Ok(ConfList {
                        name: name.to_string(),
                        cni_version: default_version(version),
                        plugins: vec![conf],
                    });
                }
            }
        }

        Err(Error::NetworkNotFound {
            name: name.to_string(),
            dir: self.config_dir.clone(),
        })
    }

    /// Attaches the container: every plugin in order, `ADD`.
    ///
    /// Each plugin must print a parseable result; the chain fails rather
    /// than continuing with a missing `prevResult`.
    pub fn add(&self, list: &ConfList, rt: &RuntimeConf) -> Result<Option<Value>> {
        let mut prev_result: Option<Value> = None;
        for plugin in &list.plugins {
            let (plugin_type, stdout) = self.invoke(list, plugin, rt, "ADD", prev_result.take())?;
            prev_result = Some(serde_json::from_slice(&stdout).map_err(|e| Error::Cni {
                plugin: plugin_type,
                op: "ADD".to_string(),
                reason: format!("invalid result: {}", e),
            })?);
        }
        Ok(prev_result)
    }

    /// Detaches the container: every plugin in reverse order, `DEL`.
    pub fn del(&self, list: &ConfList, rt: &RuntimeConf) -> Result<()> {
        for plugin in list.plugins.iter().rev() {
            self.invoke(list, plugin, rt, "DEL", None)?;
        }
        Ok(())
    }

    fn find_plugin(&self, plugin_type: &str) -> Result<PathBuf> {
        for dir in &self.plugin_dirs {
            let candidate = dir.join(plugin_type);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Err(Error::PluginNotFound {
            plugin: plugin_type.to_string(),
        })
    }

    fn invoke(
        &self,
        list: &ConfList,
        plugin: &Map<String, Value>,
        rt: &RuntimeConf,
        command: &str,
        prev_result: Option<Value>,
    ) -> Result<(String, Vec<u8>)> {
        let plugin_type = plugin
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Cni {
                plugin: list.name.clone(),
                op: command.to_string(),
                reason: "plugin configuration has no type".to_string(),
            })?
            .to_string();
        let binary = self.find_plugin(&plugin_type)?;

        let stdin_conf = self.plugin_config(list, plugin, rt, prev_result);
        let payload = serde_json::to_vec(&stdin_conf)?;

        let cni_args = rt
            .args
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(";");
        let cni_path = self
            .plugin_dirs
            .iter()
            .map(|d| d.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(":");

        debug!("invoking CNI plugin {} ({})", plugin_type, command);
        let mut child = Command::new(&binary)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", &rt.container_id)
            .env("CNI_NETNS", &rt.netns)
            .env("CNI_IFNAME", &rt.ifname)
            .env("CNI_ARGS", cni_args)
            .env("CNI_PATH", cni_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Cni {
                plugin: plugin_type.clone(),
                op: command.to_string(),
                reason: format!("spawn {}: {}", binary.display(), e),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).map_err(|e| Error::Cni {
                plugin: plugin_type.clone(),
                op: command.to_string(),
                reason: format!("write configuration: {}", e),
            })?;
        }

        let output = child.wait_with_output().map_err(|e| Error::Cni {
            plugin: plugin_type.clone(),
            op: command.to_string(),
            reason: e.to_string(),
        })?;

        if !output.status.success() {
            // Plugins report structured errors on stdout.
            let detail = serde_json::from_slice::<Value>(&output.stdout)
                .ok()
                .and_then(|v| v.get("msg").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| String::from_utf8_lossy(&output.stderr).into_owned());
            return Err(Error::Cni {
                plugin: plugin_type,
                op: command.to_string(),
                reason: detail,
            });
        }
        Ok((plugin_type, output.stdout))
    }

    /// Builds the stdin document for one plugin: its own configuration plus
    /// the list name/version, capability runtimeConfig, and the previous
    /// plugin's result.
    fn plugin_config(
        &self,
        list: &ConfList,
        plugin: &Map<String, Value>,
        rt: &RuntimeConf,
        prev_result: Option<Value>,
    ) -> Value {
        let mut conf = plugin.clone();
        conf.insert("name".to_string(), Value::String(list.name.clone()));
        conf.insert(
            "cniVersion".to_string(),
            Value::String(list.cni_version.clone()),
        );

        if let Some(Value::Object(capabilities)) = plugin.get("capabilities") {
            let mut runtime_config = Map::new();
            for (capability, enabled) in capabilities {
                if enabled.as_bool() == Some(true)
                    && let Some(value) = rt.capability_args.get(capability)
                {
                    runtime_config.insert(capability.clone(), value.clone());
                }
            }
            if !runtime_config.is_empty() {
                conf.insert("runtimeConfig".to_string(), Value::Object(runtime_config));
            }
        }

        if let Some(prev) = prev_result {
            conf.insert("prevResult".to_string(), prev);
        }
        Value::Object(conf)
    }
}

fn default_version(version: String) -> String {
    if version.is_empty() {
        CNI_VERSION.to_string()
    } else {
        version
    }
}
