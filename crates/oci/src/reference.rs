//! Artifact reference parsing.
//!
//! Accepts `registry/repo[:tag]`, `registry/repo@sha256:<digest>` and the
//! `localhost/...` shorthand for a registry running on the local host.

use oci_distribution::Reference;
use sha2::{Digest as _, Sha256};

use crate::{Error, Result};

const LOCALHOST_PREFIX: &str = "localhost/";
const DEFAULT_TAG: &str = "latest";

/// A parsed registry reference.
#[derive(Debug, Clone)]
pub struct ArtifactReference {
    original: String,
    inner: Reference,
}

impl ArtifactReference {
    /// Parse a reference string.
    pub fn parse(reference: &str) -> Result<Self> {
        let trimmed = reference.trim();
        if trimmed.is_empty() {
            return Err(Error::invalid_reference(reference, "reference is empty"));
        }

        let inner = trimmed
            .parse::<Reference>()
            .map_err(|e| Error::invalid_reference(trimmed, e.to_string()))?;

        // `localhost/` must always address the local registry, never a
        // Docker Hub namespace called "localhost".
        let inner = if trimmed.starts_with(LOCALHOST_PREFIX) && inner.registry() != "localhost" {
            rebuild("localhost", &trimmed[LOCALHOST_PREFIX.len()..], &inner)
        } else {
            inner
        };

        Ok(Self {
            original: trimmed.to_string(),
            inner,
        })
    }

    /// The reference string as given by the caller.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.original
    }

    /// Registry host (with port, if any).
    #[must_use]
    pub fn registry(&self) -> &str {
        self.inner.registry()
    }

    /// Repository path within the registry.
    #[must_use]
    pub fn repository(&self) -> &str {
        self.inner.repository()
    }

    /// Explicit tag, if any.
    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        self.inner.tag()
    }

    /// Explicit digest, if any.
    #[must_use]
    pub fn digest(&self) -> Option<&str> {
        self.inner.digest()
    }

    /// The tag or digest this reference resolves through.
    ///
    /// Digest wins over tag; a reference with neither resolves `latest`.
    #[must_use]
    pub fn identifier(&self) -> &str {
        self.digest().or_else(|| self.tag()).unwrap_or(DEFAULT_TAG)
    }

    /// The underlying distribution reference.
    #[must_use]
    pub fn as_oci(&self) -> &Reference {
        &self.inner
    }

    /// A reference to other content in the same repository, by digest.
    #[must_use]
    pub fn with_digest(&self, digest: &str) -> Reference {
        Reference::with_digest(
            self.registry().to_string(),
            self.repository().to_string(),
            digest.to_string(),
        )
    }

    /// A reference to the same repository under another tag.
    #[must_use]
    pub fn with_tag(&self, tag: &str) -> Reference {
        Reference::with_tag(
            self.registry().to_string(),
            self.repository().to_string(),
            tag.to_string(),
        )
    }

    /// The tag a publish targets: explicit tag or `latest`.
    #[must_use]
    pub fn publish_tag(&self) -> &str {
        self.tag().unwrap_or(DEFAULT_TAG)
    }

    /// `registry/repository:tag` for the publish target.
    #[must_use]
    pub fn tagged_string(&self) -> String {
        format!(
            "{}/{}:{}",
            self.registry(),
            self.repository(),
            self.publish_tag()
        )
    }

    /// Placeholder cache id used before the content digest is known.
    ///
    /// The first 16 hex characters of the SHA-256 of the reference string.
    #[must_use]
    pub fn temporary_id(&self) -> String {
        let hash = format!("{:x}", Sha256::digest(self.original.as_bytes()));
        hash[..16].to_string()
    }
}

impl std::fmt::Display for ArtifactReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.original)
    }
}

/// Rebuild a reference under another registry, keeping tag and digest.
fn rebuild(registry: &str, remainder: &str, parsed: &Reference) -> Reference {
    let repository = remainder
        .split(['@', ':'])
        .next()
        .unwrap_or(remainder)
        .to_string();
    let registry = registry.to_string();
    match (parsed.tag(), parsed.digest()) {
        (_, Some(digest)) => Reference::with_digest(registry, repository, digest.to_string()),
        (Some(tag), None) => Reference::with_tag(registry, repository, tag.to_string()),
        (None, None) => Reference::with_tag(registry, repository, DEFAULT_TAG.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_parse_reference() {
        let r = ArtifactReference::parse("ghcr.io/delivery-station/porter:0.2.0").unwrap();
        assert_eq!(r.registry(), "ghcr.io");
        assert_eq!(r.repository(), "delivery-station/porter");
        assert_eq!(r.tag(), Some("0.2.0"));
        assert_eq!(r.identifier(), "0.2.0");
    }

    #[test]
    fn test_parse_reference_with_digest() {
        let r = ArtifactReference::parse(&format!("ghcr.io/org/tool@{DIGEST}")).unwrap();
        assert_eq!(r.digest(), Some(DIGEST));
        assert_eq!(r.identifier(), DIGEST);
    }

    #[test]
    fn test_parse_localhost_shorthand() {
        let r = ArtifactReference::parse("localhost/delivery-station/porter:0.2.0").unwrap();
        assert_eq!(r.registry(), "localhost");
        assert_eq!(r.repository(), "delivery-station/porter");
        assert_eq!(r.tag(), Some("0.2.0"));
    }

    #[test]
    fn test_parse_with_port() {
        let r = ArtifactReference::parse("localhost:5000/tools/jq:v1").unwrap();
        assert_eq!(r.registry(), "localhost:5000");
        assert_eq!(r.repository(), "tools/jq");
    }

    #[test]
    fn test_parse_invalid() {
        assert!(ArtifactReference::parse("").is_err());
        assert!(ArtifactReference::parse("not a valid reference!!!").is_err());
    }

    #[test]
    fn test_temporary_id_is_stable() {
        let a = ArtifactReference::parse("ghcr.io/org/tool:1").unwrap();
        let b = ArtifactReference::parse("ghcr.io/org/tool:1").unwrap();
        let c = ArtifactReference::parse("ghcr.io/org/tool:2").unwrap();
        assert_eq!(a.temporary_id(), b.temporary_id());
        assert_ne!(a.temporary_id(), c.temporary_id());
        assert_eq!(a.temporary_id().len(), 16);
    }

    #[test]
    fn test_publish_tag_and_tagged_string() {
        let r = ArtifactReference::parse("registry.example.com/org/tool:v2").unwrap();
        assert_eq!(r.publish_tag(), "v2");
        assert_eq!(r.tagged_string(), "registry.example.com/org/tool:v2");

        let with_digest = r.with_digest(DIGEST);
        assert_eq!(with_digest.digest(), Some(DIGEST));
        assert_eq!(with_digest.repository(), "org/tool");

        let latest = r.with_tag("latest");
        assert_eq!(latest.tag(), Some("latest"));
    }
}
