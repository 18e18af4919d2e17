//! # Registry Transport
//!
//! Copies `docker://<image>` into a local OCI image layout at
//! `<staging>/image`, the boundary the puller consumes.
//!
//! ## Layout Model
//!
//! ```text
//! <staging>/image/
//! ├── oci-layout
//! ├── index.json             exactly one manifest entry
//! └── blobs/sha256/<hex>     config, layers, manifest
//! ```
//!
//! Multi-arch image indexes are resolved to the host platform *here*, so
//! the staged `index.json` references exactly one manifest and the
//! puller's exactly-one precondition holds by construction for fresh
//! pulls.
//!
//! ## Security Model
//!
//! ### Digest Verification
//!
//! Every pulled blob is hashed and compared against the digest its
//! descriptor declared before it is written into the layout. This
//! prevents:
//!
//! - **Cache poisoning**: a registry serving wrong content for a digest
//! - **Tampering in transit**: middleboxes altering blob bytes
//! - **Store pollution**: nothing unverified ever reaches the commit path
//!
//! ```rust,ignore
//! // Verification happens on every fetch:
//! let data = fetch_blob(&client, &reference, &descriptor, image).await?;
//! // a mismatch fails the pull before anything touches the layout
//! ```
//!
//! Only `sha256` digests are accepted; blobs declaring any other
//! algorithm fail the pull rather than being stored unverified.
//!
//! ### Size Limits
//!
//! Layer descriptors are checked against `MAX_LAYER_SIZE` before download,
//! so a hostile manifest cannot make the transport buffer unbounded data.
//!
//! ## Authentication
//!
//! Anonymous registry access only. Bearer/basic credentials for private
//! registries would slot into the client configuration here.
//!
//! ## Example
//!
//! ```rust,ignore
//! let staging = tempfile::tempdir()?;
//! copy_image("docker.io/library/alpine:latest", staging.path(), None).await?;
//! // staging/image/ is now a complete single-manifest OCI layout
//! ```
//!
//! Progress lines go to the caller-supplied writer; passing `None` keeps
//! the transport silent (`--quiet`).

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{OciDescriptor, OciImageManifest, OciManifest};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::constants::MAX_LAYER_SIZE;
use crate::error::{Error, Result};
use crate::oci;

/// Resolves a digest string to its path inside an OCI layout.
pub fn blob_path(layout: &Path, digest: &str) -> PathBuf {
    let (algorithm, hex) = digest.split_once(':').unwrap_or(("sha256", digest));
    layout.join("blobs").join(algorithm).join(hex)
}

/// Copies the image into `<staging>/image` as an OCI layout.
pub async fn copy_image(
    image: &str,
    staging: &Path,
    mut progress: Option<&mut dyn Write>,
) -> Result<()> {
    let reference: Reference = image.parse().map_err(|e| Error::InvalidReference {
        reference: image.to_string(),
        reason: format!("{}", e),
    })?;

    let client = Client::new(ClientConfig {
        protocol: ClientProtocol::Https,
        ..Default::default()
    });
    let auth = RegistryAuth::Anonymous;

    let (manifest, digest) = client
        .pull_manifest(&reference, &auth)
        .await
        .map_err(|e| Error::PullFailed {
            reference: image.to_string(),
            reason: e.to_string(),
        })?;
    debug!("resolved {} to {}", image, digest);

    let manifest = resolve_platform(&client, &reference, &auth, manifest, image).await?;

    let layout = staging.join("image");
    fs::create_dir_all(layout.join("blobs").join("sha256"))
        .map_err(|e| Error::path_io("create layout", &layout, e))?;

    // Config blob.
    write_progress(&mut progress, &format!("Copying config {}", short(&manifest.config.digest)));
    let config = fetch_blob(&client, &reference, &manifest.config, image).await?;
    write_blob(&layout, &manifest.config.digest, &config)?;

    // Layer blobs, in manifest order.
    for layer in &manifest.layers {
        if layer.size > MAX_LAYER_SIZE as i64 {
            return Err(Error::PullFailed {
                reference: image.to_string(),
                reason: format!("layer {} exceeds {} bytes", layer.digest, MAX_LAYER_SIZE),
            });
        }
        write_progress(&mut progress, &format!("Copying blob {}", short(&layer.digest)));
        let data = fetch_blob(&client, &reference, layer, image).await?;
        write_blob(&layout, &layer.digest, &data)?;
    }

    // The manifest blob and the single-entry index that references it.
    let manifest_bytes = serde_json::to_vec(&manifest)?;
    let manifest_digest = format!("sha256:{}", hex::encode(Sha256::digest(&manifest_bytes)));
    write_blob(&layout, &manifest_digest, &manifest_bytes)?;

    let index = oci::ImageIndex {
        schema_version: 2,
        manifests: vec![oci::Descriptor {
            media_type: oci::media_type::IMAGE_MANIFEST.to_string(),
            digest: manifest_digest,
            size: manifest_bytes.len() as i64,
            platform: None,
        }],
    };
    fs::write(layout.join("index.json"), serde_json::to_vec(&index)?)
        .map_err(|e| Error::path_io("write index.json", layout.join("index.json"), e))?;
    fs::write(layout.join("oci-layout"), br#"{"imageLayoutVersion":"1.0.0"}"#)
        .map_err(|e| Error::path_io("write oci-layout", layout.join("oci-layout"), e))?;

    write_progress(&mut progress, "Writing manifest to image destination");
    Ok(())
}

/// Resolves a multi-arch index to the host-platform image manifest.
async fn resolve_platform(
    client: &Client,
    reference: &Reference,
    auth: &RegistryAuth,
    manifest: OciManifest,
    image: &str,
) -> Result<OciImageManifest> {
    match manifest {
        OciManifest::Image(img) => Ok(img),
        OciManifest::ImageIndex(index) => {
            let target_arch = host_architecture();
            let matching = index.manifests.iter().find(|m| {
                m.platform
                    .as_ref()
                    .is_some_and(|p| p.os == "linux" && p.architecture == target_arch)
            });
            let descriptor = matching.ok_or_else(|| {
                let available: Vec<String> = index
                    .manifests
                    .iter()
                    .filter_map(|m| m.platform.as_ref())
                    .map(|p| format!("{}/{}", p.os, p.architecture))
                    .collect();
                Error::PullFailed {
                    reference: image.to_string(),
                    reason: format!(
                        "no manifest for linux/{}; available: {}",
                        target_arch,
                        available.join(", ")
                    ),
                }
            })?;

            let digest_ref: Reference = format!(
                "{}/{}@{}",
                reference.registry(),
                reference.repository(),
                descriptor.digest
            )
            .parse()
            .map_err(|e| Error::PullFailed {
                reference: image.to_string(),
                reason: format!("failed to build digest reference: {}", e),
            })?;

            let (platform_manifest, _) = client
                .pull_manifest(&digest_ref, auth)
                .await
                .map_err(|e| Error::PullFailed {
                    reference: image.to_string(),
                    reason: format!("failed to pull platform manifest: {}", e),
                })?;
            match platform_manifest {
                OciManifest::Image(img) => Ok(img),
                OciManifest::ImageIndex(_) => Err(Error::PullFailed {
                    reference: image.to_string(),
                    reason: "nested image index not supported".to_string(),
                }),
            }
        }
    }
}

async fn fetch_blob(
    client: &Client,
    reference: &Reference,
    descriptor: &OciDescriptor,
    image: &str,
) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    client
        .pull_blob(reference, descriptor, &mut data)
        .await
        .map_err(|e| Error::PullFailed {
            reference: image.to_string(),
            reason: format!("blob {}: {}", descriptor.digest, e),
        })?;
    verify_digest(&descriptor.digest, &data)?;
    Ok(data)
}

/// Rejects content that does not hash to its declared digest.
fn verify_digest(digest: &str, data: &[u8]) -> Result<()> {
    let (algorithm, expected) = digest.split_once(':').unwrap_or(("sha256", digest));
    if algorithm != "sha256" {
        return Err(Error::PullFailed {
            reference: digest.to_string(),
            reason: format!("unsupported digest algorithm '{}'", algorithm),
        });
    }
    let computed = hex::encode(Sha256::digest(data));
    if computed != expected {
        return Err(Error::PullFailed {
            reference: digest.to_string(),
            reason: format!("digest mismatch: expected {}, computed {}", expected, computed),
        });
    }
    Ok(())
}

fn write_blob(layout: &Path, digest: &str, data: &[u8]) -> Result<()> {
    let path = blob_path(layout, digest);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::path_io("create blob directory", parent, e))?;
    }
    fs::write(&path, data).map_err(|e| Error::path_io("write blob", &path, e))
}

fn write_progress(progress: &mut Option<&mut dyn Write>, line: &str) {
    if let Some(w) = progress {
        let _ = writeln!(w, "{}", line);
    }
}

fn short(digest: &str) -> String {
    digest.chars().take(19).collect()
}

fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "arm",
        other => other,
    }
}
