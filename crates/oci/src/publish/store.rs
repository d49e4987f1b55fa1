//! Staging store for content about to be pushed.
//!
//! Small documents (configs, manifests) live in memory. Files are recorded
//! by path and hashed by streaming; [`ContentStore::source`] hands out the
//! path so a large binary is only read by the upload that sends it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::descriptor::{ANNOTATION_TITLE, Annotations, Descriptor, file_digest, verify_digest};
use crate::{Error, Result};

/// Where staged content can be read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobSource<'a> {
    /// Bytes held by the store.
    Bytes(&'a [u8]),
    /// A file on disk, read only when uploaded.
    File(&'a Path),
}

#[derive(Debug, Clone)]
enum Content {
    Memory(Vec<u8>),
    Path(PathBuf),
}

/// Descriptor-addressed content, backed by memory or by files on disk.
#[derive(Debug, Default)]
pub struct ContentStore {
    entries: HashMap<String, (Descriptor, Content)>,
}

impl ContentStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a file without copying it.
    ///
    /// The descriptor carries a title annotation with the file name.
    pub fn add_file(&mut self, path: &Path, media_type: &str) -> Result<Descriptor> {
        let title = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                Error::invalid_input(format!("'{}' has no file name", path.display()))
            })?;
        self.add_file_titled(path, media_type, title)
    }

    /// Record a file under an explicit title.
    pub fn add_file_titled(
        &mut self,
        path: &Path,
        media_type: &str,
        title: String,
    ) -> Result<Descriptor> {
        let (digest, size) = file_digest(path)?;
        let descriptor = Descriptor {
            media_type: media_type.to_string(),
            digest,
            size,
            annotations: Some(Annotations::from([(ANNOTATION_TITLE.to_string(), title)])),
            platform: None,
            artifact_type: None,
        };
        self.entries.insert(
            descriptor.digest.clone(),
            (descriptor.clone(), Content::Path(path.to_path_buf())),
        );
        Ok(descriptor)
    }

    /// Store bytes under `descriptor` after checking their digest and size.
    pub fn push(&mut self, descriptor: &Descriptor, data: Vec<u8>) -> Result<()> {
        if data.len() as u64 != descriptor.size {
            return Err(Error::invalid_input(format!(
                "size mismatch for {}: expected {}, got {}",
                descriptor.digest,
                descriptor.size,
                data.len()
            )));
        }
        verify_digest(&descriptor.digest, &data)?;
        self.entries
            .entry(descriptor.digest.clone())
            .or_insert_with(|| (descriptor.clone(), Content::Memory(data)));
        Ok(())
    }

    /// Whether content with `digest` is staged.
    #[must_use]
    pub fn exists(&self, digest: &str) -> bool {
        self.entries.contains_key(digest)
    }

    /// The descriptor staged under `digest`.
    pub fn resolve(&self, digest: &str) -> Result<Descriptor> {
        self.entries
            .get(digest)
            .map(|(descriptor, _)| descriptor.clone())
            .ok_or_else(|| Error::NotFound(digest.to_string()))
    }

    /// Where the content staged under `digest` lives, without reading it.
    pub fn source(&self, digest: &str) -> Result<BlobSource<'_>> {
        let (_, content) = self
            .entries
            .get(digest)
            .ok_or_else(|| Error::NotFound(digest.to_string()))?;
        Ok(match content {
            Content::Memory(data) => BlobSource::Bytes(data),
            Content::Path(path) => BlobSource::File(path),
        })
    }

    /// The bytes staged under `digest`.
    ///
    /// Path-backed content is read in full and re-verified, so a file changed since
    /// it was added fails here instead of producing a mismatched upload.
    pub fn fetch(&self, digest: &str) -> Result<Vec<u8>> {
        let (_, content) = self
            .entries
            .get(digest)
            .ok_or_else(|| Error::NotFound(digest.to_string()))?;
        match content {
            Content::Memory(data) => Ok(data.clone()),
            Content::Path(path) => {
                let data = std::fs::read(path)
                    .map_err(|e| Error::io(e, path, "read staged file"))?;
                verify_digest(digest, &data)?;
                Ok(data)
            }
        }
    }

    /// Number of staged entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::sha256_digest;
    use tempfile::TempDir;

    #[test]
    fn test_add_file_streams_digest() -> Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("deployer");
        std::fs::write(&path, b"#!/bin/sh\necho deploy\n")?;

        let mut store = ContentStore::new();
        let desc = store.add_file(&path, "application/octet-stream")?;

        assert_eq!(desc.digest, sha256_digest(b"#!/bin/sh\necho deploy\n"));
        assert_eq!(desc.size, 22);
        assert_eq!(desc.annotation(ANNOTATION_TITLE), Some("deployer"));
        assert_eq!(store.fetch(&desc.digest)?, b"#!/bin/sh\necho deploy\n");
        Ok(())
    }

    #[test]
    fn test_fetch_detects_changed_file() -> Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("tool");
        std::fs::write(&path, b"v1")?;

        let mut store = ContentStore::new();
        let desc = store.add_file(&path, "application/octet-stream")?;
        std::fs::write(&path, b"v2")?;

        assert!(matches!(
            store.fetch(&desc.digest),
            Err(Error::DigestMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_push_and_resolve_memory_content() -> Result<()> {
        let mut store = ContentStore::new();
        let config = Descriptor::empty_config();
        store.push(&config, b"{}".to_vec())?;

        assert!(store.exists(&config.digest));
        assert_eq!(store.resolve(&config.digest)?, config);
        assert_eq!(store.fetch(&config.digest)?, b"{}");
        assert_eq!(store.len(), 1);
        Ok(())
    }

    #[test]
    fn test_push_rejects_wrong_content() {
        let mut store = ContentStore::new();
        let config = Descriptor::empty_config();

        assert!(store.push(&config, b"[]".to_vec()).is_err());
        assert!(store.push(&config, b"{ }".to_vec()).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn test_source_does_not_read_files() -> Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("tool");
        std::fs::write(&path, b"large binary")?;

        let mut store = ContentStore::new();
        let layer = store.add_file(&path, "application/octet-stream")?;
        let config = Descriptor::empty_config();
        store.push(&config, b"{}".to_vec())?;

        assert_eq!(store.source(&layer.digest)?, BlobSource::File(&path));
        assert_eq!(store.source(&config.digest)?, BlobSource::Bytes(b"{}"));

        std::fs::remove_file(&path)?;
        assert_eq!(store.source(&layer.digest)?, BlobSource::File(&path));
        Ok(())
    }

    #[test]
    fn test_missing_digest_is_not_found() {
        let store = ContentStore::new();
        assert!(matches!(store.resolve("sha256:00"), Err(Error::NotFound(_))));
        assert!(matches!(store.fetch("sha256:00"), Err(Error::NotFound(_))));
        assert!(matches!(store.source("sha256:00"), Err(Error::NotFound(_))));
    }
}
