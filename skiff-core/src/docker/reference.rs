//! Image reference parsing and resolution against the local image set.
//!
//! References are interpreted the way the engine CLI does: a bare hex string
//! may address a local image id directly, anything else is a named reference
//! `repo[:tag][@digest]`.

use super::ImageRecord;
use crate::error::{Result, SkiffError};
use std::collections::HashSet;

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    /// A local image id (`sha256:...`).
    Id(String),
    Named(NamedRef),
}

/// A named reference with optional tag and digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedRef {
    pub repo: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl NamedRef {
    /// The tag used when none is written.
    pub fn tag_or_default(&self) -> &str {
        self.tag.as_deref().unwrap_or("latest")
    }

    /// The reference to hand to the engine for a pull.
    pub fn pull_reference(&self) -> String {
        match &self.digest {
            Some(digest) => format!("{}@{}", self.repo, digest),
            None => format!("{}:{}", self.repo, self.tag_or_default()),
        }
    }

    /// The canonical `repo@digest` form.
    pub fn with_digest(&self, digest: &str) -> String {
        format!("{}@{}", self.repo, digest)
    }
}

/// Parse a reference, using the set of local image ids to disambiguate bare
/// hex strings.
pub fn parse_ref(image: &str, local_ids: &HashSet<String>) -> Result<ImageRef> {
    if image.is_empty() {
        return Err(SkiffError::Image {
            image: image.to_string(),
            reason: "empty image reference".to_string(),
        });
    }

    if let Some(hex) = image.strip_prefix("sha256:") {
        if is_hex(hex) {
            return Ok(ImageRef::Id(image.to_string()));
        }
    }

    // A plain hex string may be an id prefix; it only wins when it matches a
    // local image unambiguously, otherwise it reads as a repository name.
    if is_hex(image) {
        let matches: Vec<&String> = local_ids
            .iter()
            .filter(|id| {
                id.strip_prefix("sha256:")
                    .is_some_and(|h| h.starts_with(image))
            })
            .collect();
        if matches.len() == 1 {
            return Ok(ImageRef::Id(matches[0].clone()));
        }
    }

    parse_named(image).map(ImageRef::Named)
}

fn parse_named(image: &str) -> Result<NamedRef> {
    let invalid = |reason: &str| SkiffError::Image {
        image: image.to_string(),
        reason: reason.to_string(),
    };

    let (rest, digest) = match image.split_once('@') {
        Some((rest, digest)) => {
            let hex = digest.strip_prefix("sha256:").ok_or_else(|| {
                invalid("digest must be of the form sha256:<hex>")
            })?;
            if !is_hex(hex) || hex.len() != 64 {
                return Err(invalid("digest must be of the form sha256:<hex>"));
            }
            (rest, Some(digest.to_string()))
        }
        None => (image, None),
    };

    // only a colon after the last slash separates a tag
    let (repo, tag) = match rest.rfind(':') {
        Some(idx) if idx > rest.rfind('/').map_or(0, |s| s) => {
            (&rest[..idx], Some(rest[idx + 1..].to_string()))
        }
        _ => (rest, None),
    };

    if repo.is_empty() {
        return Err(invalid("empty repository"));
    }
    if let Some(tag) = &tag {
        if tag.is_empty()
            || !tag
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(invalid("invalid tag"));
        }
    }
    if !repo
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-' | '/' | ':'))
    {
        return Err(invalid("invalid repository name"));
    }

    Ok(NamedRef {
        repo: repo.to_string(),
        tag,
        digest,
    })
}

/// Resolve a reference to a local image id, if one matches.
pub fn resolve_local_id(reference: &ImageRef, images: &[ImageRecord]) -> Option<String> {
    match reference {
        ImageRef::Id(id) => images.iter().find(|img| &img.id == id).map(|img| img.id.clone()),
        ImageRef::Named(named) => match &named.digest {
            Some(digest) => {
                let wanted = named.with_digest(digest);
                images
                    .iter()
                    .find(|img| img.repo_digests.iter().any(|d| d == &wanted))
                    .map(|img| img.id.clone())
            }
            None => {
                let wanted = format!("{}:{}", named.repo, named.tag_or_default());
                images
                    .iter()
                    .find(|img| img.repo_tags.iter().any(|t| t == &wanted))
                    .map(|img| img.id.clone())
            }
        },
    }
}

/// After a pull, find the local id behind the freshly pulled `repo@digest`.
pub fn resolve_after_pull(
    named: &NamedRef,
    digest: &str,
    images: &[ImageRecord],
) -> Option<(String, String)> {
    let canonical = named.with_digest(digest);
    images
        .iter()
        .find(|img| img.repo_digests.iter().any(|d| d == &canonical))
        .map(|img| (img.id.clone(), canonical.clone()))
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit())
}
