//! Container image reference parsing.
//!
//! The controller never inspects image contents; it only checks that a
//! reference is well-formed before handing it to the platform.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:(?P<registry>[a-zA-Z0-9.-]+(?::[0-9]+)?)/)?(?P<repository>[a-z0-9]+(?:[._-][a-z0-9]+)*(?:/[a-z0-9]+(?:[._-][a-z0-9]+)*)*)(?::(?P<tag>[\w][\w.-]{0,127}))?(?:@(?P<digest>sha256:[a-f0-9]{64}))?$",
    )
    .expect("image reference regex")
});

/// A parsed `[registry/]repository[:tag][@digest]` reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub registry: Option<String>,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImageRefError {
    #[error("empty image reference")]
    Empty,
    #[error("invalid image reference: {0}")]
    Invalid(String),
}

impl ImageRef {
    pub fn parse(reference: &str) -> Result<Self, ImageRefError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(ImageRefError::Empty);
        }
        let caps = REFERENCE
            .captures(reference)
            .ok_or_else(|| ImageRefError::Invalid(reference.to_string()))?;

        // "host/repo" vs "org/repo": only treat the first segment as a
        // registry when it looks like a host.
        let mut registry = caps.name("registry").map(|m| m.as_str().to_string());
        let mut repository = caps["repository"].to_string();
        if let Some(host) = registry.take() {
            if host.contains('.') || host.contains(':') || host == "localhost" {
                registry = Some(host);
            } else {
                repository = format!("{host}/{repository}");
            }
        }

        Ok(Self {
            registry,
            repository,
            tag: caps.name("tag").map(|m| m.as_str().to_string()),
            digest: caps.name("digest").map(|m| m.as_str().to_string()),
        })
    }

    /// Whether the reference pins content (digest) rather than a mutable tag.
    pub fn is_pinned(&self) -> bool {
        self.digest.is_some()
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(registry) = &self.registry {
            write!(f, "{registry}/")?;
        }
        write!(f, "{}", self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_registry_repository_tag() {
        let image = ImageRef::parse("registry.example.com/shop/web:v1.4.2").unwrap();
        assert_eq!(image.registry.as_deref(), Some("registry.example.com"));
        assert_eq!(image.repository, "shop/web");
        assert_eq!(image.tag.as_deref(), Some("v1.4.2"));
        assert!(!image.is_pinned());
    }

    #[test]
    fn parse_org_without_registry() {
        let image = ImageRef::parse("shop/web:latest").unwrap();
        assert_eq!(image.registry, None);
        assert_eq!(image.repository, "shop/web");
    }

    #[test]
    fn parse_registry_with_port_and_digest() {
        let digest = format!("sha256:{}", "a".repeat(64));
        let raw = format!("localhost:5000/api@{digest}");
        let image = ImageRef::parse(&raw).unwrap();
        assert_eq!(image.registry.as_deref(), Some("localhost:5000"));
        assert_eq!(image.digest.as_deref(), Some(digest.as_str()));
        assert!(image.is_pinned());
        assert_eq!(image.to_string(), raw);
    }

    #[test]
    fn rejects_malformed() {
        assert_eq!(ImageRef::parse("  "), Err(ImageRefError::Empty));
        assert!(ImageRef::parse("Shop/Web:v1").is_err());
        assert!(ImageRef::parse("web:").is_err());
        assert!(ImageRef::parse("web@sha256:short").is_err());
    }
}
