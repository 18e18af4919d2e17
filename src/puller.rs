//! # Image Puller
//!
//! Drives one `pull`: fetch the image into a staging OCI layout, apply its
//! layers to a build rootfs, persist the image config as `manifest.json`,
//! and commit the build directory to the store under the canonical
//! reference.
//!
//! ## Staging Model
//!
//! ```text
//! <staging>/                 (unique temp dir, removed unconditionally)
//! ├── image/                 OCI layout written by the transport
//! │   ├── index.json         must reference exactly one manifest
//! │   └── blobs/sha256/...   config, layers, manifest
//! └── build/                 the tree that gets committed
//!     ├── rootfs/            layers applied bottom-to-top
//!     └── manifest.json      the image config blob
//! ```
//!
//! The staging directory is a `TempDir`, so it is removed when the pull
//! returns — success or failure — and a crashed pull leaves no build
//! residue behind (a half-finished commit is already unreachable, see the
//! repository docs).
//!
//! ## Security Model
//!
//! Layer application is the security boundary for untrusted images.
//! Malicious layers can attempt to escape the build rootfs or exhaust the
//! host during extraction.
//!
//! ### Path Traversal Protection
//!
//! Every tar entry is validated before extraction:
//!
//! ```rust,ignore
//! // This is rejected before anything is unpacked:
//! let path = "../../../etc/cron.d/evil";
//! if path.starts_with('/') || path.contains("..") {
//!     return Err(Error::PathTraversal { path });
//! }
//! ```
//!
//! Absolute paths and paths with parent components fail the whole pull.
//!
//! ### Whiteout Handling
//!
//! OCI layers mark deletions with whiteout files instead of content:
//! `.wh.<name>` removes `<name>` from lower layers and `.wh..wh..opq`
//! empties the containing directory. Both act strictly *inside* the build
//! rootfs and are never extracted as files.
//!
//! ### Size Limits
//!
//! Bounded constants prevent resource exhaustion:
//! - `MAX_LAYER_SIZE`: per-layer compressed size
//! - `MAX_ROOTFS_SIZE`: cumulative unpacked size (compression bombs)
//!
//! ## Example
//!
//! ```rust,ignore
//! use bodman::{puller, store::Store};
//!
//! let store = Store::open("/var/cache/bodman")?;
//! let mut stdout = std::io::stdout();
//! puller::pull(&store, "alpine:3.18", Some(&mut stdout)).await?;
//! // `images` now lists docker.io/library/alpine:3.18
//! ```

use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use tar::Archive;
use tracing::{debug, info};

use crate::constants::{MANIFEST_FILE, MAX_LAYER_SIZE, MAX_ROOTFS_SIZE, ROOTFS_DIR};
use crate::error::{Error, Result};
use crate::oci::{self, ImageIndex, ImageManifest};
use crate::store::Store;
use crate::transport::{self, blob_path};
use crate::reference;

/// Pulls `image` and commits it to the store.
pub async fn pull(store: &Store, image: &str, progress: Option<&mut dyn Write>) -> Result<()> {
    let canonical = reference::canonical(image)?;

    // TempDir removal on drop is the "unconditional" staging cleanup.
    let staging = tempfile::Builder::new()
        .prefix("bodman-")
        .tempdir()
        .map_err(Error::Io)?;

    transport::copy_image(&canonical, staging.path(), progress).await?;

    let layout = staging.path().join("image");
    let index_raw = fs::read(layout.join("index.json"))
        .map_err(|e| Error::path_io("read index.json", layout.join("index.json"), e))?;
    let index: ImageIndex = serde_json::from_slice(&index_raw)?;
    if index.manifests.len() != 1 {
        return Err(Error::ManifestCount {
            count: index.manifests.len(),
        });
    }

    let manifest = read_manifest(&layout, &index.manifests[0].digest)?;

    let build = staging.path().join("build");
    let rootfs = build.join(ROOTFS_DIR);
    fs::create_dir_all(&rootfs).map_err(|e| Error::path_io("create build rootfs", &rootfs, e))?;

    let mut total_unpacked = 0u64;
    for layer in &manifest.layers {
        apply_layer(&layout, layer, &rootfs, &mut total_unpacked)?;
    }

    copy_blob_file(
        &blob_path(&layout, &manifest.config.digest),
        &build.join(MANIFEST_FILE),
    )?;

    store.commit_image(&canonical, &build)?;
    info!("pulled {}", canonical);
    Ok(())
}

fn read_manifest(layout: &Path, digest: &str) -> Result<ImageManifest> {
    let path = blob_path(layout, digest);
    let raw = fs::read(&path).map_err(|_| Error::BlobNotFound {
        digest: digest.to_string(),
    })?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Applies one layer tarball onto `rootfs`.
pub fn apply_layer(
    layout: &Path,
    layer: &oci::Descriptor,
    rootfs: &Path,
    total_unpacked: &mut u64,
) -> Result<()> {
    let path = blob_path(layout, &layer.digest);
    let data = fs::read(&path).map_err(|_| Error::BlobNotFound {
        digest: layer.digest.clone(),
    })?;
    if data.len() as u64 > MAX_LAYER_SIZE {
        return Err(Error::LayerApplyFailed {
            digest: layer.digest.clone(),
            reason: format!("compressed layer exceeds {} bytes", MAX_LAYER_SIZE),
        });
    }
    debug!("applying layer {} ({} bytes)", layer.digest, data.len());

    let media = layer.media_type.as_str();
    if media.contains("gzip") {
        apply_tar(&layer.digest, GzDecoder::new(&data[..]), rootfs, total_unpacked)
    } else if media.contains("tar") {
        apply_tar(&layer.digest, &data[..], rootfs, total_unpacked)
    } else {
        Err(Error::LayerApplyFailed {
            digest: layer.digest.clone(),
            reason: format!("unsupported layer media type '{}'", media),
        })
    }
}

fn apply_tar<R: Read>(
    digest: &str,
    reader: R,
    rootfs: &Path,
    total_unpacked: &mut u64,
) -> Result<()> {
    let layer_err = |reason: String| Error::LayerApplyFailed {
        digest: digest.to_string(),
        reason,
    };

    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_unpack_xattrs(false);
    if nix::unistd::geteuid().is_root() {
        archive.set_preserve_ownerships(true);
    }

    for entry in archive.entries().map_err(|e| layer_err(e.to_string()))? {
        let mut entry = entry.map_err(|e| layer_err(e.to_string()))?;
        let path = entry
            .path()
            .map_err(|e| layer_err(e.to_string()))?
            .into_owned();

        let path_str = path.to_string_lossy();
        if path_str.starts_with('/') || path.components().any(|c| c.as_os_str() == "..") {
            return Err(Error::PathTraversal {
                path: path_str.into_owned(),
            });
        }

        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if file_name == ".wh..wh..opq" {
            // Opaque whiteout: lower-layer contents of this directory vanish.
            let dir = rootfs.join(path.parent().unwrap_or(Path::new("")));
            clear_directory(&dir)?;
            continue;
        }
        if let Some(target) = file_name.strip_prefix(".wh.") {
            let target_path = rootfs.join(path.parent().unwrap_or(Path::new(""))).join(target);
            if target_path.symlink_metadata().is_ok() {
                let _ = fs::remove_file(&target_path);
                let _ = fs::remove_dir_all(&target_path);
            }
            continue;
        }

        *total_unpacked += entry.size();
        if *total_unpacked > MAX_ROOTFS_SIZE {
            return Err(Error::LayerApplyFailed {
                digest: digest.to_string(),
                reason: format!("unpacked rootfs exceeds {} bytes", MAX_ROOTFS_SIZE),
            });
        }

        entry
            .unpack_in(rootfs)
            .map_err(|e| layer_err(format!("{}: {}", path.display(), e)))?;
    }
    Ok(())
}

fn clear_directory(dir: &Path) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::path_io("read directory", dir, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| Error::path_io("read directory", dir, e))?;
        let path = entry.path();
        if path.is_dir() && !path.is_symlink() {
            fs::remove_dir_all(&path).map_err(|e| Error::path_io("remove", &path, e))?;
        } else {
            fs::remove_file(&path).map_err(|e| Error::path_io("remove", &path, e))?;
        }
    }
    Ok(())
}

/// Copies a blob to a destination file, preserving the source mode.
fn copy_blob_file(src: &Path, dst: &Path) -> Result<()> {
    fs::copy(src, dst).map_err(|e| Error::path_io("copy", dst, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn tar_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_path(path).unwrap();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, Cursor::new(content.to_vec())).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn apply(data: &[u8], rootfs: &Path) -> Result<()> {
        let mut total = 0;
        apply_tar("sha256:test", data, rootfs, &mut total)
    }

    #[test]
    fn layers_unpack_in_order_with_overwrites() {
        let temp = TempDir::new().unwrap();
        apply(&tar_with(&[("etc/motd", b"first")]), temp.path()).unwrap();
        apply(&tar_with(&[("etc/motd", b"second")]), temp.path()).unwrap();
        assert_eq!(fs::read(temp.path().join("etc/motd")).unwrap(), b"second");
    }

    #[test]
    fn whiteout_removes_lower_layer_file() {
        let temp = TempDir::new().unwrap();
        apply(&tar_with(&[("bin/tool", b"x"), ("bin/keep", b"y")]), temp.path()).unwrap();
        apply(&tar_with(&[("bin/.wh.tool", b"")]), temp.path()).unwrap();
        assert!(!temp.path().join("bin/tool").exists());
        assert!(temp.path().join("bin/keep").exists());
    }

    #[test]
    fn opaque_whiteout_clears_directory() {
        let temp = TempDir::new().unwrap();
        apply(&tar_with(&[("cfg/a", b"a"), ("cfg/b", b"b")]), temp.path()).unwrap();
        apply(
            &tar_with(&[("cfg/.wh..wh..opq", b""), ("cfg/c", b"c")]),
            temp.path(),
        )
        .unwrap();
        assert!(!temp.path().join("cfg/a").exists());
        assert!(!temp.path().join("cfg/b").exists());
        assert!(temp.path().join("cfg/c").exists());
    }

    #[test]
    fn traversal_entries_are_rejected() {
        let temp = TempDir::new().unwrap();

        // Handcraft a header with a parent component; Builder::set_path
        // would refuse to write one.
        let mut header = tar::Header::new_gnu();
        header.set_path("a/b").unwrap();
        header.as_old_mut().name[..8].copy_from_slice(b"../esc\0\0");
        header.set_size(0);
        header.set_cksum();
        let mut builder = tar::Builder::new(Vec::new());
        builder.append(&header, Cursor::new(Vec::new())).unwrap();
        let evil = builder.into_inner().unwrap();

        let err = apply(&evil, temp.path()).unwrap_err();
        assert!(matches!(err, Error::PathTraversal { .. }));
    }

    #[test]
    fn gzip_layers_decode() {
        let temp = TempDir::new().unwrap();
        let tar = tar_with(&[("data", b"compressed")]);
        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        gz.write_all(&tar).unwrap();
        let compressed = gz.finish().unwrap();

        let mut total = 0;
        apply_tar(
            "sha256:test",
            GzDecoder::new(&compressed[..]),
            temp.path(),
            &mut total,
        )
        .unwrap();
        assert_eq!(fs::read(temp.path().join("data")).unwrap(), b"compressed");
    }
}
