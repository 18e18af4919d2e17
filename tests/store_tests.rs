//! End-to-end tests for the image store: commit, checkout, listing,
//! deletion, gc, and the workdir locking protocol.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use bodman::launcher::load_image_config;
use bodman::lock::DirLock;
use bodman::store::{Store, containers_path, images_path};
use tempfile::TempDir;

fn build_tree(dir: &Path) {
    fs::create_dir_all(dir.join("rootfs/bin")).unwrap();
    fs::create_dir_all(dir.join("rootfs/etc")).unwrap();
    fs::write(dir.join("rootfs/bin/sh"), b"#!/bin/sh\nexec \"$@\"\n").unwrap();
    fs::write(dir.join("rootfs/etc/os-release"), b"ID=test\n").unwrap();
    std::os::unix::fs::symlink("bin/sh", dir.join("rootfs/entry")).unwrap();
    fs::write(
        dir.join("manifest.json"),
        br#"{"architecture":"amd64","os":"linux","config":{"Entrypoint":["/bin/sh"],"Cmd":["-c","true"],"Env":["PATH=/bin"]}}"#,
    )
    .unwrap();
}

fn fixture() -> (TempDir, Store, PathBuf) {
    let temp = TempDir::new().unwrap();
    let store = Store::open(temp.path().join("base")).unwrap();
    let build = temp.path().join("build");
    fs::create_dir_all(&build).unwrap();
    build_tree(&build);
    (temp, store, build)
}

// =============================================================================
// Layout Tests
// =============================================================================

#[test]
fn test_base_directory_children() {
    let temp = TempDir::new().unwrap();
    let base = temp.path().join("base");
    Store::open(&base).unwrap();

    assert!(images_path(&base).is_dir());
    assert!(containers_path(&base).is_dir());
    let mut children: Vec<String> = fs::read_dir(&base)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    children.sort();
    assert_eq!(children, ["containers", "images"]);
}

#[test]
fn test_open_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let base = temp.path().join("base");
    Store::open(&base).unwrap();
    Store::open(&base).unwrap();
}

// =============================================================================
// Commit / Checkout Tests
// =============================================================================

#[test]
fn test_checkout_reproduces_committed_tree() {
    let (_temp, store, build) = fixture();
    store.commit_image("testimg", &build).unwrap();

    let (workdir, _lock) = store.checkout_image("testimg", "c1").unwrap();
    assert_eq!(
        fs::read(workdir.join("rootfs/bin/sh")).unwrap(),
        fs::read(build.join("rootfs/bin/sh")).unwrap()
    );
    assert_eq!(
        fs::read_link(workdir.join("rootfs/entry")).unwrap(),
        PathBuf::from("bin/sh")
    );
}

#[test]
fn test_workdir_manifest_is_wellformed_image_config() {
    let (_temp, store, build) = fixture();
    store.commit_image("testimg", &build).unwrap();

    let (workdir, _lock) = store.checkout_image("testimg", "c1").unwrap();
    let config = load_image_config(&workdir).unwrap();
    assert_eq!(config.entrypoint, vec!["/bin/sh"]);
    assert_eq!(config.cmd, vec!["-c", "true"]);
    assert_eq!(config.env, vec!["PATH=/bin"]);
}

#[test]
fn test_parallel_checkouts_share_inodes() {
    let (_temp, store, build) = fixture();
    store.commit_image("testimg", &build).unwrap();

    let (w1, _l1) = store.checkout_image("testimg", "c1").unwrap();
    let (w2, _l2) = store.checkout_image("testimg", "c2").unwrap();

    let ino1 = fs::metadata(w1.join("rootfs/bin/sh")).unwrap().ino();
    let ino2 = fs::metadata(w2.join("rootfs/bin/sh")).unwrap().ino();
    assert_eq!(ino1, ino2, "checkout must hardlink from the store");
}

#[test]
fn test_checkout_locks_the_workdir() {
    let (_temp, store, build) = fixture();
    store.commit_image("testimg", &build).unwrap();

    let (workdir, lock) = store.checkout_image("testimg", "c1").unwrap();
    // The workdir is live: a non-blocking probe must see contention.
    assert!(DirLock::acquire(&workdir, false).unwrap().is_none());
    drop(lock);
    assert!(DirLock::acquire(&workdir, false).unwrap().is_some());
}

#[test]
fn test_missing_image_errors() {
    let (_temp, store, _build) = fixture();
    let err = store.checkout_image("never-pulled", "c1").unwrap_err();
    assert!(err.to_string().contains("image not found"));
}

// =============================================================================
// Listing / Deletion Tests
// =============================================================================

#[test]
fn test_list_returns_canonical_refs() {
    let (_temp, store, build) = fixture();
    store.commit_image("testimg", &build).unwrap();
    store.commit_image("quay.io/org/app:v2", &build).unwrap();

    let mut images = store.list_images().unwrap();
    images.sort();
    assert_eq!(
        images,
        vec![
            "docker.io/library/testimg:latest".to_string(),
            "quay.io/org/app:v2".to_string(),
        ]
    );
}

#[test]
fn test_repull_replaces_instead_of_duplicating() {
    let (_temp, store, build) = fixture();
    store.commit_image("testimg", &build).unwrap();
    fs::write(build.join("rootfs/etc/os-release"), b"ID=updated\n").unwrap();
    store.commit_image("testimg", &build).unwrap();

    assert_eq!(store.list_images().unwrap().len(), 1);
    let (workdir, _lock) = store.checkout_image("testimg", "c1").unwrap();
    assert_eq!(
        fs::read(workdir.join("rootfs/etc/os-release")).unwrap(),
        b"ID=updated\n"
    );
}

#[test]
fn test_delete_hides_image_immediately() {
    let (_temp, store, build) = fixture();
    store.commit_image("testimg", &build).unwrap();
    store.delete_image("testimg").unwrap();

    assert!(store.list_images().unwrap().is_empty());
    assert!(store.checkout_image("testimg", "c1").is_err());
}

// =============================================================================
// GC Tests
// =============================================================================

#[test]
fn test_gc_removes_only_unlocked_workdirs() {
    let (_temp, store, build) = fixture();
    store.commit_image("testimg", &build).unwrap();

    let (live, live_lock) = store.checkout_image("testimg", "live").unwrap();
    let (dead, dead_lock) = store.checkout_image("testimg", "dead").unwrap();
    drop(dead_lock);

    let summary = store.gc().unwrap();
    assert_eq!(summary.removed, vec![dead.clone()]);
    assert!(summary.errors.is_empty());
    assert!(live.is_dir());
    assert!(!dead.exists());

    drop(live_lock);
    let summary = store.gc().unwrap();
    assert_eq!(summary.removed, vec![live.clone()]);
    assert!(!live.exists());
}

#[test]
fn test_gc_prunes_unreferenced_objects_after_delete() {
    let (_temp, store, build) = fixture();
    store.commit_image("testimg", &build).unwrap();
    store.delete_image("testimg").unwrap();

    let summary = store.gc().unwrap();
    assert!(summary.prune.objects_removed > 0);

    // Repeated gc is a no-op after the first success.
    let summary = store.gc().unwrap();
    assert_eq!(summary.prune.objects_removed, 0);
    assert_eq!(summary.prune.commits_removed, 0);
    assert!(summary.removed.is_empty());
}

#[test]
fn test_gc_keeps_objects_of_surviving_images() {
    let (_temp, store, build) = fixture();
    store.commit_image("keep", &build).unwrap();
    store.commit_image("drop", &build).unwrap();
    store.delete_image("drop").unwrap();

    // Both branches pointed at identical trees, so nothing is unreferenced.
    let summary = store.gc().unwrap();
    assert_eq!(summary.prune.objects_removed, 0);

    let (workdir, _lock) = store.checkout_image("keep", "c1").unwrap();
    assert!(workdir.join("rootfs/bin/sh").exists());
}
