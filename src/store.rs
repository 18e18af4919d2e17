//! # Image Store Orchestration
//!
//! `Store` owns the base directory and coordinates every cross-process
//! operation: it maps canonical image references onto repository branches,
//! takes the base-directory lock around repository mutations, hands the
//! launcher a locked container workdir, and reclaims dead workdirs during gc.
//!
//! ## Locking discipline
//!
//! - `commit`, `checkout`, `delete` and the opening of `gc` take the base
//!   lock in *blocking* mode for their critical section.
//! - `checkout` locks the fresh workdir (blocking) *before* releasing the
//!   base lock, so a concurrent gc can never observe the new workdir
//!   unlocked.
//! - gc probes each workdir with a *non-blocking* lock: acquired means the
//!   owning launcher is gone and the directory is dead; contention means a
//!   live container, skip it.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::constants::{CONTAINERS_DIR, IMAGES_DIR};
use crate::error::{Error, Result};
use crate::lock::DirLock;
use crate::reference;
use crate::repo::{PruneStats, Repository};

/// Well-known location of the image repository under a base directory.
pub fn images_path(base: &Path) -> PathBuf {
    base.join(IMAGES_DIR)
}

/// Well-known location of the container workdirs under a base directory.
pub fn containers_path(base: &Path) -> PathBuf {
    base.join(CONTAINERS_DIR)
}

/// Outcome of a gc run: what was reclaimed and what failed.
///
/// Per-container failures never abort the run; pruning always happens and
/// the errors are reported together at the end.
#[derive(Debug, Default)]
pub struct GcSummary {
    pub removed: Vec<PathBuf>,
    pub errors: Vec<String>,
    pub prune: PruneStats,
}

/// The image store plus container-workdir lifecycle, rooted at a base
/// directory.
pub struct Store {
    base: PathBuf,
    repo: Repository,
}

impl Store {
    /// Opens (and if necessary initializes) the store at `base`.
    pub fn open(base: impl Into<PathBuf>) -> Result<Store> {
        let base = base.into();
        fs::create_dir_all(images_path(&base))
            .map_err(|e| Error::path_io("create images directory", images_path(&base), e))?;
        fs::create_dir_all(containers_path(&base))
            .map_err(|e| Error::path_io("create containers directory", containers_path(&base), e))?;
        let repo = Repository::open(images_path(&base))?;
        Ok(Store { base, repo })
    }

    /// The base directory this store is rooted at.
    pub fn base(&self) -> &Path {
        &self.base
    }

    fn lock_base(&self) -> Result<DirLock> {
        DirLock::acquire(&self.base, true)?
            .ok_or_else(|| Error::Store("base lock unavailable in blocking mode".to_string()))
    }

    /// Commits a build directory under the image's branch.
    pub fn commit_image(&self, image: &str, dir: &Path) -> Result<()> {
        let branch = reference::encode_branch(image)?;
        let _base = self.lock_base()?;
        self.repo.commit(dir, &branch)?;
        info!("committed image {}", reference::canonical(image)?);
        Ok(())
    }

    /// Checks the image out into a fresh container workdir and locks it.
    ///
    /// The returned lock is the container's liveness token: it must be held
    /// (and inherited across `execve`) until the container exits. Dropping
    /// it marks the workdir dead.
    pub fn checkout_image(&self, image: &str, container_id: &str) -> Result<(PathBuf, DirLock)> {
        let canonical = reference::canonical(image)?;
        let branch = reference::encode_branch(image)?;
        let dst = containers_path(&self.base).join(container_id);

        let _base = self.lock_base()?;
        if self.repo.resolve_branch(&branch)?.is_none() {
            return Err(Error::ImageNotFound { image: canonical });
        }
        self.repo.checkout(&branch, &dst)?;
        let lock = DirLock::acquire(&dst, true)?
            .ok_or_else(|| Error::Store(format!("container lock unavailable: {}", dst.display())))?;
        debug!("checked out {} into {}", canonical, dst.display());
        Ok((dst, lock))
    }

    /// Deletes the image's branch. Objects are reclaimed by the next gc.
    pub fn delete_image(&self, image: &str) -> Result<()> {
        let branch = reference::encode_branch(image)?;
        let _base = self.lock_base()?;
        self.repo.delete_branch(&branch)
    }

    /// Lists the canonical image references present in the store.
    ///
    /// Branch names that do not decode are reported and skipped; they never
    /// abort the listing.
    pub fn list_images(&self) -> Result<Vec<String>> {
        let mut images = Vec::new();
        for branch in self.repo.list_branches()? {
            match reference::decode_branch(&branch) {
                Ok(image) => images.push(image),
                Err(e) => warn!("skipping malformed branch '{}': {}", branch, e),
            }
        }
        Ok(images)
    }

    /// Removes dead container workdirs and prunes unreferenced store objects.
    ///
    /// Runs entirely under the base lock so no checkout can race the prune.
    pub fn gc(&self) -> Result<GcSummary> {
        let _base = self.lock_base()?;
        let mut summary = GcSummary::default();

        let containers = containers_path(&self.base);
        let entries = fs::read_dir(&containers)
            .map_err(|e| Error::path_io("list containers", &containers, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::path_io("list containers", &containers, e))?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            match DirLock::acquire(&path, false) {
                // Lock acquired: the launcher is gone and the workdir is
                // dead. Release before removal so the unlink path is clean.
                Ok(Some(lock)) => {
                    drop(lock);
                    match fs::remove_dir_all(&path) {
                        Ok(()) => {
                            debug!("removed dead container {}", path.display());
                            summary.removed.push(path);
                        }
                        Err(e) => summary
                            .errors
                            .push(format!("remove container {}: {}", path.display(), e)),
                    }
                }
                // Contention: a live container holds the lock. Skip.
                Ok(None) => debug!("skipping live container {}", path.display()),
                Err(e) => summary
                    .errors
                    .push(format!("probe container {}: {}", path.display(), e)),
            }
        }

        summary.prune = self.repo.prune()?;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn build_dir(temp: &TempDir) -> PathBuf {
        let dir = temp.path().join("build");
        fs::create_dir_all(dir.join("rootfs/bin")).unwrap();
        fs::write(dir.join("rootfs/bin/sh"), b"#!/bin/sh\n").unwrap();
        fs::write(dir.join("manifest.json"), br#"{"architecture":"amd64","os":"linux"}"#).unwrap();
        dir
    }

    #[test]
    fn base_layout_has_two_children() {
        let temp = TempDir::new().unwrap();
        Store::open(temp.path()).unwrap();

        let mut children: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        children.sort();
        assert_eq!(children, vec!["containers", "images"]);
    }

    #[test]
    fn commit_then_checkout_then_list() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path().join("base")).unwrap();
        let build = build_dir(&temp);

        store.commit_image("alpine", &build).unwrap();
        assert_eq!(
            store.list_images().unwrap(),
            vec!["docker.io/library/alpine:latest".to_string()]
        );

        let (workdir, lock) = store.checkout_image("alpine", "cid-1234").unwrap();
        assert!(workdir.ends_with("containers/cid-1234"));
        assert!(workdir.join("rootfs/bin/sh").exists());
        assert!(workdir.join("manifest.json").exists());
        drop(lock);
    }

    #[test]
    fn repeated_pull_updates_single_ref() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path().join("base")).unwrap();
        let build = build_dir(&temp);

        store.commit_image("alpine", &build).unwrap();
        fs::write(build.join("manifest.json"), b"{}").unwrap();
        store.commit_image("alpine", &build).unwrap();

        assert_eq!(store.list_images().unwrap().len(), 1);
    }

    #[test]
    fn checkout_of_missing_image_fails() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path().join("base")).unwrap();
        let err = store.checkout_image("ghost", "cid").unwrap_err();
        assert!(matches!(err, Error::ImageNotFound { .. }));
    }

    #[test]
    fn gc_reaps_dead_skips_live() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path().join("base")).unwrap();
        let build = build_dir(&temp);
        store.commit_image("alpine", &build).unwrap();

        let (live_dir, live_lock) = store.checkout_image("alpine", "live").unwrap();
        let (dead_dir, dead_lock) = store.checkout_image("alpine", "dead").unwrap();
        drop(dead_lock);

        let summary = store.gc().unwrap();
        assert!(summary.errors.is_empty());
        assert_eq!(summary.removed, vec![dead_dir.clone()]);
        assert!(live_dir.exists());
        assert!(!dead_dir.exists());

        drop(live_lock);
    }

    #[test]
    fn gc_after_delete_prunes_objects() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path().join("base")).unwrap();
        let build = build_dir(&temp);

        store.commit_image("alpine", &build).unwrap();
        store.delete_image("alpine").unwrap();
        let summary = store.gc().unwrap();
        assert!(summary.prune.objects_removed > 0);
        assert!(store.list_images().unwrap().is_empty());

        // Idempotent: a second gc finds nothing left to do.
        let summary = store.gc().unwrap();
        assert_eq!(summary.prune.objects_removed, 0);
        assert!(summary.removed.is_empty());
    }
}
