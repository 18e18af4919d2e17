//! # bodman
//!
//! **Minimal rootful OCI container runner**
//!
//! Pulls images from a remote registry into a content-addressed local
//! repository, and launches one-shot containers by checking an image out
//! into a fresh workdir and replacing the launching process via `exec`
//! inside newly created Linux namespaces. There is no daemon and no
//! supervisor: once `exec` succeeds the runner no longer exists.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ pull  ──► transport (registry → OCI layout)                 │
//! │              │                                              │
//! │              ▼                                              │
//! │          puller (layers → build rootfs + manifest.json)     │
//! │              │ commit                                       │
//! │              ▼                                              │
//! │   store / repo  (content-addressed, branch per image ref)   │
//! │              │ checkout (hardlinks, workdir locked)         │
//! │              ▼                                              │
//! │ run  ──► launcher (unshare → network → pivot → … → execve)  │
//! │                                                             │
//! │ gc   ──► reap unlocked workdirs, prune unreferenced objects │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Locking model
//!
//! All cross-process coordination is directory `flock`s ([`lock::DirLock`]):
//! the base directory serializes store mutations, and each container
//! workdir is held exclusively by its running container. The launcher's
//! lock descriptor deliberately survives `execve`, so a workdir stays
//! "live" for exactly as long as the container process exists; `gc`
//! reclaims whatever it can lock.
//!
//! ## Thread affinity
//!
//! `unshare`, `setns`, and `pivot_root` act on the calling *thread*. The
//! CLI drives everything from a current-thread tokio runtime so the async
//! pull transport and the launcher share one OS thread.

pub mod constants;
pub mod devices;
pub mod error;
pub mod launcher;
pub mod lock;
pub mod mounts;
pub mod network;
pub mod oci;
pub mod puller;
pub mod reference;
pub mod repo;
pub mod rootfs;
pub mod store;
pub mod sysctl;
pub mod transport;

pub use error::{Error, Result};
pub use launcher::{NamespaceMode, RunConfig};
pub use lock::DirLock;
pub use network::Network;
pub use store::{GcSummary, Store};
