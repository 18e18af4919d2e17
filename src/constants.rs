//! Constants for the container runner.
//!
//! Paths, defaults, and limits are defined here to keep magic values out of
//! the rest of the codebase.

// =============================================================================
// On-Disk Layout
// =============================================================================

/// Default base directory holding the image store and container workdirs.
pub const DEFAULT_BASE_DIR: &str = "/var/cache/bodman";

/// Subdirectory of the base dir containing the image store.
pub const IMAGES_DIR: &str = "images";

/// Subdirectory of the base dir containing container workdirs.
pub const CONTAINERS_DIR: &str = "containers";

/// Name of the checked-out rootfs inside a container workdir.
pub const ROOTFS_DIR: &str = "rootfs";

/// Image config file inside a committed tree / container workdir.
/// The name is historical: the file holds the OCI image *config*, not the
/// manifest.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Persisted network record inside a container workdir.
pub const NETWORK_FILE: &str = "network.json";

// =============================================================================
// Image References
// =============================================================================

/// Registry assumed when a reference names none.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Repository namespace assumed for single-component docker.io references.
pub const DEFAULT_REPOSITORY_NAMESPACE: &str = "library";

/// Tag assumed when a reference names none.
pub const DEFAULT_TAG: &str = "latest";

/// Maximum image reference length (bytes).
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Valid characters for image references.
pub const IMAGE_REF_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_./:@";

// =============================================================================
// Layer Limits
// =============================================================================

/// Maximum size of a single compressed layer (512 MiB).
pub const MAX_LAYER_SIZE: u64 = 512 * 1024 * 1024;

/// Maximum total unpacked rootfs size (4 GiB).
pub const MAX_ROOTFS_SIZE: u64 = 4 * 1024 * 1024 * 1024;

// =============================================================================
// Networking
// =============================================================================

/// Default CNI network configuration directory.
pub const DEFAULT_CNI_CONFIG_DIR: &str = "/etc/cni/net.d/";

/// Default CNI plugin search path.
pub const DEFAULT_CNI_PLUGIN_DIRS: &[&str] = &[
    "/usr/libexec/cni",
    "/usr/lib/cni",
    "/usr/local/lib/cni",
    "/opt/cni/bin",
];

/// CNI spec version written into plugin invocations that declare none.
pub const CNI_VERSION: &str = "0.4.0";

/// Interface name given to the container side of a CNI attachment.
pub const CNI_IFNAME: &str = "eth0";

/// Directory where named network namespaces are bind-mounted.
pub const NETNS_RUN_DIR: &str = "/var/run/netns";

/// Nameserver used when no `--dns` flag is given.
pub const DEFAULT_DNS: &str = "8.8.8.8";

// =============================================================================
// Sysctl Policy
// =============================================================================

/// `kernel.*` sysctls that may be set inside a private IPC namespace.
pub const SYSCTL_IPC_KERNEL_KEYS: &[&str] = &[
    "kernel.msgmax",
    "kernel.msgmnb",
    "kernel.msgmni",
    "kernel.sem",
    "kernel.shmall",
    "kernel.shmmax",
    "kernel.shmmni",
    "kernel.shm_rmid_forced",
];

/// `kernel.*` sysctls that may be set inside a private UTS namespace.
pub const SYSCTL_UTS_KERNEL_KEYS: &[&str] = &["kernel.hostname", "kernel.domainname"];
