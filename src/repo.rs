//! # Content-Addressed Image Repository
//!
//! Stores committed image trees deduplicated at file granularity, with named
//! branches pointing at commits. This is the on-disk format backing the image
//! store:
//!
//! ```text
//! images/
//! ├── config                    # repo marker written by the first init
//! ├── objects/sha256/ab/<id>    # file objects, id = sha256(mode,uid,gid ‖ content)
//! ├── commits/<digest>          # tree manifest JSON, digest = sha256(json)
//! └── refs/<branch>             # file holding the commit digest
//! ```
//!
//! ## Transactional commits
//!
//! Objects and the commit manifest are written first with the temp-file +
//! rename pattern; until the ref file is renamed into place they are
//! unreachable, so a crash mid-commit leaves the repository observably
//! unchanged (the orphans are reclaimed by the next prune). The ref rename is
//! the single atomic commit point.
//!
//! ## Hardlink checkouts
//!
//! Checkout recreates directories and symlinks and *hardlinks* every regular
//! file from the object store, so checkouts cost one directory tree and zero
//! file content. Object ids hash the file mode and ownership along with the
//! content, so two files that differ only in mode do not collapse onto one
//! inode.
//!
//! ## Pruning
//!
//! Prune is refs-only: every commit and object reachable from a branch is
//! kept, everything else is deleted. Callers are responsible for running it
//! only after dead container checkouts have been removed, otherwise their
//! hardlinks would keep object inodes alive without the repo knowing.

use std::collections::HashSet;
use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

const OBJECTS_DIR: &str = "objects";
const COMMITS_DIR: &str = "commits";
const REFS_DIR: &str = "refs";
const CONFIG_FILE: &str = "config";

/// A content-addressed repository rooted at a directory.
pub struct Repository {
    root: PathBuf,
}

/// One entry of a committed tree, in parent-before-child order.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TreeEntry {
    path: String,
    kind: EntryKind,
    #[serde(default)]
    mode: u32,
    #[serde(default)]
    uid: u32,
    #[serde(default)]
    gid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    object: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum EntryKind {
    File,
    Dir,
    Symlink,
}

/// The manifest of one commit: the full tree listing.
#[derive(Debug, Serialize, Deserialize)]
struct Tree {
    entries: Vec<TreeEntry>,
}

/// Statistics from a prune run.
#[derive(Debug, Clone, Default)]
pub struct PruneStats {
    pub commits_removed: u64,
    pub objects_removed: u64,
    pub freed_bytes: u64,
}

impl Repository {
    /// Opens the repository at `root`, initializing it if necessary.
    ///
    /// Init is idempotent: opening an existing repository is a no-op.
    pub fn open(root: impl Into<PathBuf>) -> Result<Repository> {
        let root = root.into();
        for sub in [OBJECTS_DIR, COMMITS_DIR, REFS_DIR] {
            fs::create_dir_all(root.join(sub))
                .map_err(|e| Error::path_io("create repo directory", root.join(sub), e))?;
        }
        let marker = root.join(CONFIG_FILE);
        if !marker.exists() {
            fs::write(&marker, "mode=hardlink\n")
                .map_err(|e| Error::path_io("write repo marker", &marker, e))?;
            info!("initialized repository at {}", root.display());
        }
        Ok(Repository { root })
    }

    /// Repository root directory.
    pub fn path(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, id: &str) -> PathBuf {
        let prefix = &id[..2.min(id.len())];
        self.root.join(OBJECTS_DIR).join("sha256").join(prefix).join(id)
    }

    fn commit_path(&self, digest: &str) -> PathBuf {
        self.root.join(COMMITS_DIR).join(digest)
    }

    fn ref_path(&self, branch: &str) -> PathBuf {
        self.root.join(REFS_DIR).join(branch)
    }

    /// Resolves a branch to its commit digest, or `None` if unknown.
    pub fn resolve_branch(&self, branch: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.ref_path(branch)) {
            Ok(digest) => Ok(Some(digest.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::path_io("read branch", self.ref_path(branch), e)),
        }
    }

    /// Commits the tree rooted at `dir` under `branch`, returning the commit
    /// digest. Replaces any previous commit the branch pointed at.
    pub fn commit(&self, dir: &Path, branch: &str) -> Result<String> {
        let mut entries = Vec::new();
        self.commit_tree(dir, Path::new(""), &mut entries)?;

        let tree = Tree { entries };
        let manifest = serde_json::to_vec(&tree)?;
        let digest = hex::encode(Sha256::digest(&manifest));

        let commit_path = self.commit_path(&digest);
        if !commit_path.exists() {
            write_atomic(&commit_path, &manifest)?;
        }
        // The ref rename is the commit point: before it, nothing references
        // the new objects; after it, the branch names the complete tree.
        write_atomic(self.ref_path(branch).as_path(), digest.as_bytes())?;

        debug!(
            "committed {} entries from {} as {}",
            tree.entries.len(),
            dir.display(),
            &digest[..12]
        );
        Ok(digest)
    }

    fn commit_tree(&self, dir: &Path, rel: &Path, entries: &mut Vec<TreeEntry>) -> Result<()> {
        let mut names: Vec<_> = fs::read_dir(dir)
            .map_err(|e| Error::path_io("read commit directory", dir, e))?
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(|e| Error::path_io("read commit directory", dir, e))?;
        names.sort_by_key(|e| e.file_name());

        for entry in names {
            let path = entry.path();
            let rel_path = rel.join(entry.file_name());
            let meta = fs::symlink_metadata(&path)
                .map_err(|e| Error::path_io("stat", &path, e))?;
            let file_type = meta.file_type();

            if file_type.is_dir() {
                entries.push(TreeEntry {
                    path: rel_path.to_string_lossy().into_owned(),
                    kind: EntryKind::Dir,
                    mode: meta.mode() & 0o7777,
                    uid: meta.uid(),
                    gid: meta.gid(),
                    object: None,
                    target: None,
                });
                self.commit_tree(&path, &rel_path, entries)?;
            } else if file_type.is_symlink() {
                let target = fs::read_link(&path)
                    .map_err(|e| Error::path_io("readlink", &path, e))?;
                entries.push(TreeEntry {
                    path: rel_path.to_string_lossy().into_owned(),
                    kind: EntryKind::Symlink,
                    mode: 0,
                    uid: meta.uid(),
                    gid: meta.gid(),
                    object: None,
                    target: Some(target.to_string_lossy().into_owned()),
                });
            } else if file_type.is_file() {
                let id = self.store_object(&path, &meta)?;
                entries.push(TreeEntry {
                    path: rel_path.to_string_lossy().into_owned(),
                    kind: EntryKind::File,
                    mode: meta.mode() & 0o7777,
                    uid: meta.uid(),
                    gid: meta.gid(),
                    object: Some(id),
                    target: None,
                });
            } else {
                // Sockets, fifos and device nodes do not belong in an image
                // tree; the device helper recreates /dev at launch time.
                debug!("skipping special file {}", path.display());
            }
        }
        Ok(())
    }

    /// Hashes a regular file into the object store, returning its object id.
    /// Already-present objects are left untouched (dedup point).
    fn store_object(&self, path: &Path, meta: &fs::Metadata) -> Result<String> {
        let mode = meta.mode() & 0o7777;
        let mut hasher = Sha256::new();
        hasher.update(format!("{:o} {} {}\0", mode, meta.uid(), meta.gid()));

        let mut file = fs::File::open(path).map_err(|e| Error::path_io("open", path, e))?;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).map_err(|e| Error::path_io("read", path, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let id = hex::encode(hasher.finalize());

        let object = self.object_path(&id);
        if object.exists() {
            return Ok(id);
        }
        if let Some(parent) = object.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::path_io("create object directory", parent, e))?;
        }

        let tmp = object.with_extension(format!("tmp{}", Uuid::new_v4().simple()));
        fs::copy(path, &tmp).map_err(|e| Error::path_io("copy object", &tmp, e))?;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(mode))
            .map_err(|e| Error::path_io("chmod object", &tmp, e))?;
        if let Err(e) = nix::unistd::chown(
            &tmp,
            Some(nix::unistd::Uid::from_raw(meta.uid())),
            Some(nix::unistd::Gid::from_raw(meta.gid())),
        ) {
            // Unprivileged commits cannot chown; the object id still records
            // the intended ownership.
            debug!("chown object {}: {}", tmp.display(), e);
        }
        fs::rename(&tmp, &object).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            Error::path_io("rename object", &object, e)
        })?;
        Ok(id)
    }

    /// Checks out `branch` into `dst`, hardlinking every regular file.
    pub fn checkout(&self, branch: &str, dst: &Path) -> Result<()> {
        let digest = self.resolve_branch(branch)?.ok_or_else(|| Error::Repo {
            path: self.root.clone(),
            reason: format!("branch '{}' not found", branch),
        })?;
        let manifest = fs::read(self.commit_path(&digest))
            .map_err(|e| Error::path_io("read commit", self.commit_path(&digest), e))?;
        let tree: Tree = serde_json::from_slice(&manifest)?;

        fs::create_dir_all(dst).map_err(|e| Error::path_io("create checkout", dst, e))?;

        for entry in &tree.entries {
            let path = dst.join(&entry.path);
            match entry.kind {
                EntryKind::Dir => {
                    fs::create_dir_all(&path)
                        .map_err(|e| Error::path_io("create directory", &path, e))?;
                }
                EntryKind::File => {
                    let object = entry.object.as_deref().ok_or_else(|| Error::Repo {
                        path: self.root.clone(),
                        reason: format!("entry '{}' has no object", entry.path),
                    })?;
                    fs::hard_link(self.object_path(object), &path)
                        .map_err(|e| Error::path_io("hardlink", &path, e))?;
                }
                EntryKind::Symlink => {
                    let target = entry.target.as_deref().ok_or_else(|| Error::Repo {
                        path: self.root.clone(),
                        reason: format!("entry '{}' has no symlink target", entry.path),
                    })?;
                    std::os::unix::fs::symlink(target, &path)
                        .map_err(|e| Error::path_io("symlink", &path, e))?;
                }
            }
        }

        // Directory modes go last so read-only directories cannot block the
        // entries created inside them.
        for entry in tree.entries.iter().rev() {
            if entry.kind == EntryKind::Dir {
                let path = dst.join(&entry.path);
                fs::set_permissions(&path, fs::Permissions::from_mode(entry.mode))
                    .map_err(|e| Error::path_io("chmod directory", &path, e))?;
                if let Err(e) = nix::unistd::chown(
                    &path,
                    Some(nix::unistd::Uid::from_raw(entry.uid)),
                    Some(nix::unistd::Gid::from_raw(entry.gid)),
                ) {
                    debug!("chown directory {}: {}", path.display(), e);
                }
            }
        }
        Ok(())
    }

    /// Deletes a branch. The objects it referenced become prunable.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        match fs::remove_file(self.ref_path(branch)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::path_io("delete branch", self.ref_path(branch), e)),
        }
    }

    /// Lists all branch names.
    pub fn list_branches(&self) -> Result<Vec<String>> {
        let refs = self.root.join(REFS_DIR);
        let mut branches = Vec::new();
        for entry in fs::read_dir(&refs).map_err(|e| Error::path_io("list branches", &refs, e))? {
            let entry = entry.map_err(|e| Error::path_io("list branches", &refs, e))?;
            branches.push(entry.file_name().to_string_lossy().into_owned());
        }
        branches.sort();
        Ok(branches)
    }

    /// Deletes every commit and object not reachable from a branch.
    pub fn prune(&self) -> Result<PruneStats> {
        let mut live_commits = HashSet::new();
        let mut live_objects = HashSet::new();
        for branch in self.list_branches()? {
            let Some(digest) = self.resolve_branch(&branch)? else {
                continue;
            };
            let manifest = match fs::read(self.commit_path(&digest)) {
                Ok(m) => m,
                Err(e) => {
                    warn!("branch '{}' points at unreadable commit {}: {}", branch, digest, e);
                    continue;
                }
            };
            let tree: Tree = serde_json::from_slice(&manifest)?;
            for entry in tree.entries {
                if let Some(object) = entry.object {
                    live_objects.insert(object);
                }
            }
            live_commits.insert(digest);
        }

        let mut stats = PruneStats::default();

        let commits = self.root.join(COMMITS_DIR);
        for entry in fs::read_dir(&commits).map_err(|e| Error::path_io("list commits", &commits, e))? {
            let entry = entry.map_err(|e| Error::path_io("list commits", &commits, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !live_commits.contains(&name) {
                fs::remove_file(entry.path())
                    .map_err(|e| Error::path_io("remove commit", entry.path(), e))?;
                stats.commits_removed += 1;
            }
        }

        let objects = self.root.join(OBJECTS_DIR).join("sha256");
        if objects.exists() {
            for shard in fs::read_dir(&objects).map_err(|e| Error::path_io("list objects", &objects, e))? {
                let shard = shard.map_err(|e| Error::path_io("list objects", &objects, e))?;
                if !shard.path().is_dir() {
                    continue;
                }
                for entry in
                    fs::read_dir(shard.path()).map_err(|e| Error::path_io("list objects", shard.path(), e))?
                {
                    let entry = entry.map_err(|e| Error::path_io("list objects", shard.path(), e))?;
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if !live_objects.contains(&name) {
                        if let Ok(meta) = entry.metadata() {
                            stats.freed_bytes += meta.len();
                        }
                        fs::remove_file(entry.path())
                            .map_err(|e| Error::path_io("remove object", entry.path(), e))?;
                        stats.objects_removed += 1;
                    }
                }
            }
        }

        info!(
            "pruned {} commits, {} objects, {} bytes",
            stats.commits_removed, stats.objects_removed, stats.freed_bytes
        );
        Ok(stats)
    }
}

/// Writes `data` to `path` via a unique temp file and an atomic rename.
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension(format!("tmp{}", Uuid::new_v4().simple()));
    let mut file = fs::File::create(&tmp).map_err(|e| Error::path_io("create", &tmp, e))?;
    file.write_all(data).map_err(|e| Error::path_io("write", &tmp, e))?;
    drop(file);
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        Error::path_io("rename", path, e)
    })?;
    Ok(())
}
