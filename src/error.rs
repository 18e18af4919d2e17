//! Error types for the container runner.

use std::path::PathBuf;

/// Result type alias for runner operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while pulling, storing, or launching containers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Invalid Arguments
    // =========================================================================
    /// Failed to parse an image reference.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    /// Failed to parse a `--publish` port specification.
    #[error("invalid port specification '{spec}': {reason}")]
    InvalidPortSpec { spec: String, reason: String },

    /// Failed to parse a `--volume` specification.
    #[error("invalid volume '{spec}': expected src:dest[:opts]")]
    InvalidVolume { spec: String },

    /// A `--sysctl` entry is malformed or disallowed by policy.
    #[error("invalid sysctl '{sysctl}': {reason}")]
    InvalidSysctl { sysctl: String, reason: String },

    /// A `--sysctl` entry conflicts with a host namespace mode.
    #[error("sysctl '{sysctl}' ignored: {namespace} Namespace set to host")]
    SysctlRejected { sysctl: String, namespace: String },

    /// The `--user` value names neither a passwd entry nor a numeric uid.
    #[error("invalid user '{user}'")]
    InvalidUser { user: String },

    // =========================================================================
    // Not Found
    // =========================================================================
    /// No branch in the image store names this image.
    #[error("image not found: {image}")]
    ImageNotFound { image: String },

    /// A blob referenced by the staging layout is missing.
    #[error("blob not found: {digest}")]
    BlobNotFound { digest: String },

    /// The command to execute was not found on PATH.
    #[error("executable not found: {name}")]
    ExecutableNotFound { name: String },

    /// No CNI network configuration matches the requested name.
    #[error("network '{name}' not found in {dir}")]
    NetworkNotFound { name: String, dir: PathBuf },

    /// No CNI plugin binary of this type exists in the plugin directories.
    #[error("CNI plugin '{plugin}' not found in plugin directories")]
    PluginNotFound { plugin: String },

    // =========================================================================
    // Conflicts
    // =========================================================================
    /// The staged index.json must reference exactly one manifest.
    #[error("exactly one manifest is expected in index.json, found {count}")]
    ManifestCount { count: usize },

    // =========================================================================
    // Pull / Layer Errors
    // =========================================================================
    /// Registry transport failure.
    #[error("failed to pull image '{reference}': {reason}")]
    PullFailed { reference: String, reason: String },

    /// Applying a layer tarball to the build rootfs failed.
    #[error("failed to apply layer {digest}: {reason}")]
    LayerApplyFailed { digest: String, reason: String },

    /// A tar entry attempted to escape the extraction root.
    #[error("path traversal detected in layer: {path}")]
    PathTraversal { path: String },

    // =========================================================================
    // Store Errors
    // =========================================================================
    /// Object repository failure.
    #[error("repository at {path}: {reason}")]
    Repo { path: PathBuf, reason: String },

    /// Store orchestration failure (commit, checkout, gc).
    #[error("store: {0}")]
    Store(String),

    // =========================================================================
    // OS / Launch Errors
    // =========================================================================
    /// A syscall failed; `op` names the operation attempted.
    #[error("{op} failed: {source}")]
    Sys {
        op: String,
        #[source]
        source: nix::Error,
    },

    /// A filesystem operation failed on a specific path.
    #[error("{op} {path}: {source}")]
    PathIo {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A CNI plugin invocation failed.
    #[error("CNI {op} via plugin '{plugin}' failed: {reason}")]
    Cni {
        plugin: String,
        op: String,
        reason: String,
    },

    /// Neither the command line, the entrypoint, nor cmd provided arguments.
    #[error("empty exec arguments")]
    EmptyCommand,

    // =========================================================================
    // Plumbing
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    /// Wraps a syscall failure with the name of the operation.
    pub fn sys(op: impl Into<String>, source: nix::Error) -> Self {
        Error::Sys {
            op: op.into(),
            source,
        }
    }

    /// Wraps a filesystem failure with the operation and offending path.
    pub fn path_io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::PathIo {
            op,
            path: path.into(),
            source,
        }
    }
}
