//! Pinned base image references.

use std::fmt;
use std::str::FromStr;

use oci_client::Reference;

use dockwright_shared::errors::{DockwrightError, DockwrightResult};

/// A base runtime reference that identifies exactly one image.
///
/// Accepted forms are a `@sha256:` digest, or a tag carrying a full
/// `MAJOR.MINOR.PATCH` version (`python:3.11.9-slim`). Floating tags such as
/// `latest` or `3.11-slim` are rejected so that rebuilds resolve the same
/// runtime.
#[derive(Clone, Debug)]
pub struct BaseImageRef {
    raw: String,
    reference: Reference,
}

impl BaseImageRef {
    pub fn parse(raw: &str) -> DockwrightResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DockwrightError::Recipe(
                "base image reference is empty".to_string(),
            ));
        }

        let reference: Reference = trimmed.parse().map_err(|e| {
            DockwrightError::Recipe(format!("invalid base image reference '{trimmed}': {e}"))
        })?;

        if reference.digest().is_none() {
            // Reference fills in `latest` when no tag is given; look at the
            // raw text so the error names what the user wrote.
            let tag = explicit_tag(trimmed);
            match tag {
                None => {
                    return Err(DockwrightError::Recipe(format!(
                        "base image '{trimmed}' has no tag; pin a digest or a full version"
                    )));
                }
                Some(tag) if !is_version_pinned(tag) => {
                    return Err(DockwrightError::Recipe(format!(
                        "base image tag '{tag}' is floating; pin a digest or a MAJOR.MINOR.PATCH version"
                    )));
                }
                Some(_) => {}
            }
        }

        Ok(Self {
            raw: trimmed.to_string(),
            reference,
        })
    }

    /// The reference as written in the recipe.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Fully qualified form (`docker.io/library/python:3.11.9-slim`).
    pub fn canonical(&self) -> String {
        self.reference.whole()
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    pub fn is_digest_pinned(&self) -> bool {
        self.reference.digest().is_some()
    }
}

impl PartialEq for BaseImageRef {
    fn eq(&self, other: &Self) -> bool {
        self.canonical() == other.canonical()
    }
}

impl Eq for BaseImageRef {}

impl fmt::Display for BaseImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for BaseImageRef {
    type Err = DockwrightError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Tag portion of a reference string, ignoring ports in the registry host.
fn explicit_tag(raw: &str) -> Option<&str> {
    let name = raw.split('@').next().unwrap_or(raw);
    let last_segment = name.rsplit('/').next().unwrap_or(name);
    last_segment.split_once(':').map(|(_, tag)| tag)
}

/// True when some `-`/`_` separated piece of the tag is a three-part
/// numeric version, optionally prefixed with `v`.
fn is_version_pinned(tag: &str) -> bool {
    tag.split(['-', '_']).any(|piece| {
        let piece = piece.strip_prefix('v').unwrap_or(piece);
        let parts: Vec<&str> = piece.split('.').collect();
        parts.len() >= 3
            && parts
                .iter()
                .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_base_is_pinned() {
        let base = BaseImageRef::parse("python:3.11.9-slim").unwrap();
        assert_eq!(base.as_str(), "python:3.11.9-slim");
        assert_eq!(base.canonical(), "docker.io/library/python:3.11.9-slim");
        assert!(!base.is_digest_pinned());
    }

    #[test]
    fn test_digest_reference_is_pinned() {
        let raw = format!("python@sha256:{}", "a".repeat(64));
        let base = BaseImageRef::parse(&raw).unwrap();
        assert!(base.is_digest_pinned());
    }

    #[test]
    fn test_floating_tags_rejected() {
        for raw in ["python", "python:latest", "python:3.11-slim", "python:slim", ""] {
            let err = BaseImageRef::parse(raw).unwrap_err();
            assert!(matches!(err, DockwrightError::Recipe(_)), "{raw}: {err}");
        }
    }

    #[test]
    fn test_registry_port_is_not_a_tag() {
        assert!(BaseImageRef::parse("localhost:5000/python").is_err());
        assert!(BaseImageRef::parse("localhost:5000/python:3.12.1").is_ok());
    }

    #[test]
    fn test_v_prefixed_version() {
        assert!(BaseImageRef::parse("ghcr.io/acme/runtime:v1.2.3").is_ok());
    }

    proptest! {
        #[test]
        fn prop_full_versions_accepted(
            major in 0u32..100,
            minor in 0u32..100,
            patch in 0u32..100,
            variant in "(slim|alpine|bookworm)",
        ) {
            let raw = format!("python:{major}.{minor}.{patch}-{variant}");
            prop_assert!(BaseImageRef::parse(&raw).is_ok());
        }

        #[test]
        fn prop_two_part_versions_rejected(major in 0u32..100, minor in 0u32..100) {
            let raw = format!("python:{major}.{minor}-slim");
            prop_assert!(BaseImageRef::parse(&raw).is_err());
        }
    }
}
