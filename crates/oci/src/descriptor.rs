//! OCI content descriptors, manifests and indexes.
//!
//! These mirror the image-spec JSON documents closely enough to round-trip
//! what registries return while keeping unknown fields out of the way.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::collections::BTreeMap;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::platform::Platform;
use crate::{Error, Result};

/// OCI image index media type.
pub const MEDIA_TYPE_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
/// OCI image manifest media type.
pub const MEDIA_TYPE_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// Docker manifest list media type.
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
/// Docker image manifest media type.
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str =
    "application/vnd.docker.distribution.manifest.v2+json";
/// Empty JSON config used by artifact manifests.
pub const MEDIA_TYPE_EMPTY_JSON: &str = "application/vnd.oci.empty.v1+json";

/// Annotation holding a layer's file name.
pub const ANNOTATION_TITLE: &str = "org.opencontainers.image.title";
/// Annotation holding a creation timestamp (RFC 3339).
pub const ANNOTATION_CREATED: &str = "org.opencontainers.image.created";
/// Annotation naming a tag inside an OCI layout `index.json`.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// Manifest media types accepted when pulling.
pub const ACCEPTED_MANIFEST_TYPES: &[&str] = &[
    MEDIA_TYPE_IMAGE_MANIFEST,
    MEDIA_TYPE_IMAGE_INDEX,
    MEDIA_TYPE_DOCKER_MANIFEST,
    MEDIA_TYPE_DOCKER_MANIFEST_LIST,
];

/// String-to-string annotation map, sorted for stable serialization.
pub type Annotations = BTreeMap<String, String>;

/// An OCI content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: String,
    /// Content digest (`sha256:<hex>`).
    pub digest: String,
    /// Content size in bytes.
    pub size: u64,
    /// Optional annotations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
    /// Platform of the referenced manifest, inside an index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    /// Artifact type of the referenced manifest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
}

impl Descriptor {
    /// Describe a byte slice.
    #[must_use]
    pub fn from_bytes(media_type: impl Into<String>, data: &[u8]) -> Self {
        Self {
            media_type: media_type.into(),
            digest: sha256_digest(data),
            size: data.len() as u64,
            annotations: None,
            platform: None,
            artifact_type: None,
        }
    }

    /// The descriptor of the empty JSON config blob (`{}`).
    #[must_use]
    pub fn empty_config() -> Self {
        Self::from_bytes(MEDIA_TYPE_EMPTY_JSON, EMPTY_JSON)
    }

    /// Whether this descriptor points at an index (OCI or Docker list).
    #[must_use]
    pub fn is_index(&self) -> bool {
        is_index_media_type(&self.media_type)
    }

    /// Whether this descriptor points at a manifest or an index.
    #[must_use]
    pub fn is_manifest(&self) -> bool {
        is_index_media_type(&self.media_type) || is_manifest_media_type(&self.media_type)
    }

    /// Annotation value by key.
    #[must_use]
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    /// The hex part of the digest.
    #[must_use]
    pub fn encoded(&self) -> &str {
        split_digest(&self.digest).1
    }
}

/// The bytes of the empty JSON config.
pub const EMPTY_JSON: &[u8] = b"{}";

/// An OCI image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// Always 2.
    pub schema_version: u32,
    /// Manifest media type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Artifact type (image-spec 1.1).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    /// Config blob descriptor.
    pub config: Descriptor,
    /// Layer descriptors.
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    /// Optional subject for referrers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,
    /// Manifest annotations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
}

/// An OCI image index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    /// Always 2.
    pub schema_version: u32,
    /// Index media type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Artifact type (image-spec 1.1).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    /// Referenced manifests.
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
    /// Index annotations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
}

impl Default for ImageIndex {
    fn default() -> Self {
        Self {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_IMAGE_INDEX.to_string()),
            artifact_type: None,
            manifests: Vec::new(),
            annotations: None,
        }
    }
}

/// Fields shared by manifests and indexes, used to sniff document kind.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentHead {
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    manifests: Option<serde_json::Value>,
}

/// Determine the media type of a manifest document.
///
/// Uses the embedded `mediaType`, falling back to the document shape
/// (an index has `manifests`) when the field is absent.
pub fn detect_manifest_media_type(data: &[u8]) -> Result<String> {
    let head: DocumentHead = serde_json::from_slice(data)?;
    if let Some(media_type) = head.media_type.filter(|m| !m.is_empty()) {
        return Ok(media_type);
    }
    Ok(if head.manifests.is_some() {
        MEDIA_TYPE_IMAGE_INDEX.to_string()
    } else {
        MEDIA_TYPE_IMAGE_MANIFEST.to_string()
    })
}

/// Descriptors a manifest document references: index entries, or config
/// plus layers.
pub fn successors(descriptor: &Descriptor, data: &[u8]) -> Result<Vec<Descriptor>> {
    if descriptor.is_index() {
        let index: ImageIndex = serde_json::from_slice(data)?;
        return Ok(index.manifests);
    }
    if is_manifest_media_type(&descriptor.media_type) {
        let manifest: ImageManifest = serde_json::from_slice(data)?;
        let mut out = Vec::with_capacity(manifest.layers.len() + 1);
        out.push(manifest.config);
        out.extend(manifest.layers);
        return Ok(out);
    }
    Ok(Vec::new())
}

/// Whether a media type denotes an index.
#[must_use]
pub fn is_index_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_IMAGE_INDEX || media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST
}

/// Whether a media type denotes an image manifest.
#[must_use]
pub fn is_manifest_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_IMAGE_MANIFEST || media_type == MEDIA_TYPE_DOCKER_MANIFEST
}

/// Whether a media type denotes a gzip-compressed tarball.
#[must_use]
pub fn is_tar_gzip(media_type: &str) -> bool {
    media_type.contains("tar+gzip")
}

/// Compute the OCI digest of a byte slice.
///
/// Returns the digest in OCI format: `sha256:<hex>`.
#[must_use]
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(data))
}

/// Digest and size of a file, hashed by streaming.
pub fn file_digest(path: &Path) -> Result<(String, u64)> {
    let file = std::fs::File::open(path).map_err(|e| Error::io(e, path, "open"))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 8192];
    let mut size = 0u64;

    loop {
        let n = reader
            .read(&mut buffer)
            .map_err(|e| Error::io(e, path, "read"))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        size += n as u64;
    }

    Ok((format!("sha256:{:x}", hasher.finalize()), size))
}

/// Split a digest string into (algorithm, hex).
///
/// Examples:
/// - "sha256:abc123" -> ("sha256", "abc123")
/// - "abc123" -> ("sha256", "abc123")
#[must_use]
pub fn split_digest(digest: &str) -> (&str, &str) {
    digest.split_once(':').unwrap_or(("sha256", digest))
}

/// Validate that a digest has the `sha256:<64 hex>` form.
pub fn validate_digest(digest: &str) -> Result<()> {
    let (algo, hex) = split_digest(digest);
    let valid = algo == "sha256"
        && digest.contains(':')
        && hex.len() == 64
        && hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase());
    if valid {
        Ok(())
    } else {
        Err(Error::invalid_input(format!("invalid digest '{digest}'")))
    }
}

/// Verify that `data` hashes to `expected`.
pub fn verify_digest(expected: &str, data: &[u8]) -> Result<()> {
    let actual = sha256_digest(data);
    if actual == expected {
        Ok(())
    } else {
        Err(Error::digest_mismatch(expected, actual))
    }
}
