//! Image reference canonicalization and branch encoding.
//!
//! Refs follow docker naming: a missing registry means `docker.io`, a bare
//! docker.io repository gains the `library/` namespace, and a missing tag
//! defaults to `latest`, so `alpine` canonicalizes to
//! `docker.io/library/alpine:latest`. The canonical string is what the store
//! uses as a branch name, encoded with unpadded URL-safe base64 so it is
//! filesystem-safe. Encoding and decoding round-trip exactly.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use crate::constants::{
    DEFAULT_REGISTRY, DEFAULT_REPOSITORY_NAMESPACE, DEFAULT_TAG, IMAGE_REF_VALID_CHARS,
    MAX_IMAGE_REF_LEN,
};
use crate::error::{Error, Result};

/// Canonicalizes a user-supplied image reference.
///
/// Accepts `name`, `name:tag`, `registry/name[:tag]`, and digest references
/// (`name@sha256:...`). Digest references keep the digest and gain no tag.
pub fn canonical(reference: &str) -> Result<String> {
    validate(reference)?;

    let (name, suffix) = split_suffix(reference)?;

    let (registry, mut repository) = match name.split_once('/') {
        Some((first, rest)) if is_registry(first) => (first.to_string(), rest.to_string()),
        _ => (DEFAULT_REGISTRY.to_string(), name.to_string()),
    };

    if repository.is_empty() {
        return Err(Error::InvalidReference {
            reference: reference.to_string(),
            reason: "empty repository".to_string(),
        });
    }
    if registry == DEFAULT_REGISTRY && !repository.contains('/') {
        repository = format!("{}/{}", DEFAULT_REPOSITORY_NAMESPACE, repository);
    }

    Ok(match suffix {
        Suffix::Digest(d) => format!("{}/{}@{}", registry, repository, d),
        Suffix::Tag(t) => format!("{}/{}:{}", registry, repository, t),
        Suffix::None => format!("{}/{}:{}", registry, repository, DEFAULT_TAG),
    })
}

/// Encodes a canonical reference into a store branch name.
pub fn encode_branch(reference: &str) -> Result<String> {
    let image = canonical(reference)?;
    Ok(URL_SAFE_NO_PAD.encode(image.as_bytes()))
}

/// Decodes a store branch name back into the canonical image string.
pub fn decode_branch(branch: &str) -> Result<String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(branch)
        .map_err(|e| Error::InvalidReference {
            reference: branch.to_string(),
            reason: format!("not a branch name: {}", e),
        })?;
    String::from_utf8(bytes).map_err(|e| Error::InvalidReference {
        reference: branch.to_string(),
        reason: format!("branch decodes to non-UTF-8: {}", e),
    })
}

enum Suffix {
    None,
    Tag(String),
    Digest(String),
}

/// Splits the trailing `@digest` or `:tag` from a reference. A colon inside
/// the first path component is a registry port, not a tag separator.
fn split_suffix(reference: &str) -> Result<(&str, Suffix)> {
    if let Some((name, digest)) = reference.split_once('@') {
        if !digest.starts_with("sha256:") {
            return Err(Error::InvalidReference {
                reference: reference.to_string(),
                reason: "unsupported digest algorithm".to_string(),
            });
        }
        return Ok((name, Suffix::Digest(digest.to_string())));
    }

    match reference.rfind(':') {
        Some(idx) if !reference[idx..].contains('/') => {
            let tag = &reference[idx + 1..];
            if tag.is_empty() {
                return Err(Error::InvalidReference {
                    reference: reference.to_string(),
                    reason: "empty tag".to_string(),
                });
            }
            Ok((&reference[..idx], Suffix::Tag(tag.to_string())))
        }
        _ => Ok((reference, Suffix::None)),
    }
}

/// A first path component is a registry when it looks like a hostname:
/// contains a dot or a port, or is the literal `localhost`.
fn is_registry(component: &str) -> bool {
    component == "localhost" || component.contains('.') || component.contains(':')
}

fn validate(reference: &str) -> Result<()> {
    if reference.is_empty() {
        return Err(Error::InvalidReference {
            reference: reference.to_string(),
            reason: "empty image reference".to_string(),
        });
    }
    if reference.len() > MAX_IMAGE_REF_LEN {
        return Err(Error::InvalidReference {
            reference: reference.chars().take(50).collect::<String>() + "...",
            reason: format!("exceeds {} bytes", MAX_IMAGE_REF_LEN),
        });
    }
    if !reference.chars().all(|c| IMAGE_REF_VALID_CHARS.contains(c)) {
        return Err(Error::InvalidReference {
            reference: reference.to_string(),
            reason: "contains invalid characters".to_string(),
        });
    }
    Ok(())
}
