//! # Container Launcher
//!
//! Turns the calling process into the container. The sequence is order
//! sensitive and must not be rearranged:
//!
//! ```text
//! checkout (locked) → read image config → persist network.json
//!   → unshare(IPC|NS|UTS) → network attach → prepare rootfs + pivot
//!   → sysctls → chdir → resolv.conf → hostname → setuid → execve
//! ```
//!
//! `unshare(NEWNS)` must precede every mount; the pivot must precede the
//! `/proc/sys` writes and the resolv.conf write so both land in the
//! container view; `sethostname` must follow `unshare(NEWUTS)`. The network
//! namespace is *not* part of the launcher's unshare: the network modes own
//! their namespace creation.
//!
//! The workdir lock is deliberately carried into `execve`. On success the
//! replacement program inherits the descriptor and the workdir stays locked
//! (live) until the container exits; on any setup error the lock drops with
//! the stack and the workdir becomes reclaimable by gc.
//!
//! Everything here runs on one OS thread: `unshare` and `setns` act on the
//! calling thread, so the binary drives this from a current-thread runtime.

use std::convert::Infallible;
use std::env;
use std::ffi::CString;
use std::fs;
use std::path::{Path, PathBuf};

use nix::sched::{CloneFlags, unshare};
use nix::unistd::{Uid, User, chdir, execve, sethostname, setuid};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::constants::{DEFAULT_DNS, MANIFEST_FILE, NETWORK_FILE, ROOTFS_DIR};
use crate::error::{Error, Result};
use crate::mounts::{self, Mount};
use crate::network::ports;
use crate::network::{MODE_HOST, Network};
use crate::oci;
use crate::rootfs::prepare_rootfs;
use crate::store::Store;
use crate::sysctl::{self, NamespaceModes};

/// Whether a namespace is created fresh or shared with the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NamespaceMode {
    #[default]
    Private,
    Host,
}

impl NamespaceMode {
    pub fn is_host(self) -> bool {
        self == NamespaceMode::Host
    }
}

/// Parsed `run` invocation.
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    pub image: String,
    /// Positional arguments after the image; override the image cmd.
    pub command: Vec<String>,
    pub dns: Vec<String>,
    pub dns_options: Vec<String>,
    pub dns_search: Vec<String>,
    pub env: Vec<String>,
    pub hostname: Option<String>,
    pub network: String,
    pub publish: Vec<String>,
    pub sysctls: Vec<String>,
    pub systemd_activation: bool,
    pub user: Option<String>,
    pub volumes: Vec<String>,
    pub workdir: Option<String>,
    pub ipc: NamespaceMode,
    pub uts: NamespaceMode,
    pub cni_config_dir: PathBuf,
    pub cni_plugin_dirs: Vec<PathBuf>,
}

/// Launches the container. Returns only on failure: on success the
/// process image is replaced by `execve`.
pub fn run(store: &Store, cfg: &RunConfig) -> Result<Infallible> {
    // Argument parsing and policy checks come first so a bad flag fails
    // before any state is created.
    let port_mappings = ports::parse_port_bindings(&cfg.publish)?;
    let sysctls = sysctl::parse(&cfg.sysctls)?;
    sysctl::validate(
        &sysctls,
        NamespaceModes {
            host_network: cfg.network == MODE_HOST,
            host_ipc: cfg.ipc.is_host(),
            host_uts: cfg.uts.is_host(),
        },
    )?;
    let mounts = assemble_mounts(&cfg.volumes)?;

    let container_id = Uuid::new_v4().to_string();
    // The lock must stay alive through execve; see the module docs.
    let (workdir, _lock) = store.checkout_image(&cfg.image, &container_id)?;

    let image_config = load_image_config(&workdir)?;

    let hostname = cfg
        .hostname
        .clone()
        .unwrap_or_else(|| container_id.split('-').next().unwrap_or("").to_string());

    let network = Network::new(
        cfg.network.clone(),
        cfg.cni_config_dir.clone(),
        cfg.cni_plugin_dirs.clone(),
        &container_id,
        &hostname,
        &port_mappings,
    );
    network.save(&workdir.join(NETWORK_FILE))?;

    let mut clone_flags = CloneFlags::CLONE_NEWNS;
    if !cfg.ipc.is_host() {
        clone_flags |= CloneFlags::CLONE_NEWIPC;
    }
    if !cfg.uts.is_host() {
        clone_flags |= CloneFlags::CLONE_NEWUTS;
    }
    unshare(clone_flags).map_err(|e| Error::sys("unshare namespaces", e))?;

    network.execute()?;

    prepare_rootfs(&workdir.join(ROOTFS_DIR), &mounts)?;

    sysctl::apply(&sysctls)?;

    let cwd = string_default(&[
        cfg.workdir.as_deref().unwrap_or(""),
        &image_config.working_dir,
        "/",
    ]);
    chdir(Path::new(cwd)).map_err(|e| Error::sys(format!("chdir {}", cwd), e))?;

    write_resolv_conf(
        Path::new("/etc/resolv.conf"),
        &dns_servers(&cfg.dns),
        &cfg.dns_search,
        &cfg.dns_options,
    )?;

    if !cfg.uts.is_host() {
        sethostname(&hostname).map_err(|e| Error::sys("sethostname", e))?;
    }

    let raw_user = string_default(&[cfg.user.as_deref().unwrap_or(""), &image_config.user]);
    if !raw_user.is_empty() {
        let uid = resolve_user(raw_user)?;
        // Best effort, as in every runner of this lineage: an unprivileged
        // launcher cannot drop to another uid, and the fallback behavior is
        // deliberately left undefined.
        if let Err(e) = setuid(uid) {
            warn!("setuid {} failed, continuing: {}", uid, e);
        }
    }

    let mut env: Vec<String> = cfg.env.clone();
    env.extend(image_config.env.iter().cloned());
    if cfg.systemd_activation {
        env.extend(systemd_activation_env());
    }

    let mut argv: Vec<String> = image_config.entrypoint.clone();
    argv.extend(string_slice_default(&[&cfg.command, &image_config.cmd]).iter().cloned());
    if argv.is_empty() {
        return Err(Error::EmptyCommand);
    }

    let executable = lookpath(&argv[0], &env)?;
    debug!("exec {} as {:?}", executable, argv);

    let exec = CString::new(executable).map_err(|_| Error::EmptyCommand)?;
    let argv: Vec<CString> = argv
        .into_iter()
        .filter_map(|a| CString::new(a).ok())
        .collect();
    let envp: Vec<CString> = env.into_iter().filter_map(|e| CString::new(e).ok()).collect();
    execve(&exec, &argv, &envp).map_err(|e| Error::sys("exec command", e))
}

/// First non-empty string wins.
fn string_default<'a>(candidates: &[&'a str]) -> &'a str {
    candidates.iter().find(|s| !s.is_empty()).copied().unwrap_or("")
}

/// First non-empty slice wins.
fn string_slice_default<'a>(candidates: &[&'a Vec<String>]) -> &'a [String] {
    candidates
        .iter()
        .find(|s| !s.is_empty())
        .map(|s| s.as_slice())
        .unwrap_or(&[])
}

fn dns_servers(flag: &[String]) -> Vec<String> {
    if flag.is_empty() {
        vec![DEFAULT_DNS.to_string()]
    } else {
        flag.to_vec()
    }
}

fn assemble_mounts(volumes: &[String]) -> Result<Vec<Mount>> {
    let mut mounts = mounts::default_mounts();
    for volume in volumes {
        mounts.push(mounts::parse_volume(volume)?);
    }
    Ok(mounts)
}

/// Reads the image config out of the workdir's `manifest.json`.
pub fn load_image_config(workdir: &Path) -> Result<oci::ImageConfig> {
    let path = workdir.join(MANIFEST_FILE);
    let raw = fs::read(&path).map_err(|e| Error::path_io("read image config", &path, e))?;
    let image: oci::Image = serde_json::from_slice(&raw)?;
    Ok(image.config)
}

/// Renders resolv.conf exactly:
///
/// ```text
/// search <space-joined list>\n     (omitted if empty or ".")
/// nameserver <dns>\n               (one per entry)
/// options <space-joined list>\n    (omitted if empty)
/// ```
pub fn render_resolv_conf(dns: &[String], search: &[String], options: &[String]) -> String {
    let mut content = String::new();
    if !search.is_empty() {
        let joined = search.join(" ");
        if joined.trim() != "." {
            content.push_str("search ");
            content.push_str(&joined);
            content.push('\n');
        }
    }
    for server in dns {
        content.push_str("nameserver ");
        content.push_str(server);
        content.push('\n');
    }
    if !options.is_empty() {
        let joined = options.join(" ");
        if !joined.trim().is_empty() {
            content.push_str("options ");
            content.push_str(&joined);
            content.push('\n');
        }
    }
    content
}

fn write_resolv_conf(
    path: &Path,
    dns: &[String],
    search: &[String],
    options: &[String],
) -> Result<()> {
    fs::write(path, render_resolv_conf(dns, search, options))
        .map_err(|e| Error::path_io("write resolv.conf", path, e))
}

/// Accepts a passwd user name or a numeric uid.
pub fn resolve_user(raw: &str) -> Result<Uid> {
    if let Ok(Some(user)) = User::from_name(raw) {
        return Ok(user.uid);
    }
    raw.parse::<u32>()
        .map(Uid::from_raw)
        .map_err(|_| Error::InvalidUser {
            user: raw.to_string(),
        })
}

/// Copies the systemd socket-activation environment into the container.
fn systemd_activation_env() -> Vec<String> {
    ["LISTEN_PID", "LISTEN_FDS", "LISTEN_FDNAMES"]
        .iter()
        .filter_map(|key| env::var(key).ok().map(|value| format!("{}={}", key, value)))
        .collect()
}

/// Unix PATH lookup against the *container's* environment.
///
/// Names containing `/` are checked directly. Otherwise each entry of the
/// env's `PATH` is tried in order; an empty entry means the current
/// directory.
pub fn lookpath(file: &str, env: &[String]) -> Result<String> {
    if file.contains('/') {
        if is_executable(Path::new(file)) {
            return Ok(file.to_string());
        }
        return Err(Error::ExecutableNotFound {
            name: file.to_string(),
        });
    }

    let mut path_value = "";
    for entry in env {
        if let Some(value) = entry.strip_prefix("PATH=") {
            path_value = value;
        }
    }

    for dir in path_value.split(':') {
        let dir = if dir.is_empty() { "." } else { dir };
        let candidate = Path::new(dir).join(file);
        if is_executable(&candidate) {
            return Ok(candidate.to_string_lossy().into_owned());
        }
    }
    Err(Error::ExecutableNotFound {
        name: file.to_string(),
    })
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match fs::metadata(path) {
        Ok(meta) => !meta.is_dir() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}
