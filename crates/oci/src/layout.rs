//! On-disk OCI image layout store.
//!
//! Structure:
//! ```text
//! <root>/
//! ├── oci-layout          # {"imageLayoutVersion":"1.0.0"}
//! ├── index.json          # tagged root descriptors
//! └── blobs/
//!     └── sha256/
//!         └── abc123...   # verified content
//! ```

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, trace};

use crate::descriptor::{
    ANNOTATION_REF_NAME, Descriptor, ImageIndex, detect_manifest_media_type, file_digest,
    split_digest, validate_digest, verify_digest,
};
use crate::{Error, Result};

const LAYOUT_FILE: &str = "oci-layout";
const INDEX_FILE: &str = "index.json";
const LAYOUT_VERSION: &str = "1.0.0";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LayoutMarker {
    image_layout_version: String,
}

/// An OCI image layout rooted at a directory.
#[derive(Debug, Clone)]
pub struct LayoutStore {
    root: PathBuf,
}

impl LayoutStore {
    /// Open a layout, creating the directory skeleton if missing.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let store = Self { root: root.into() };
        let blobs = store.root.join("blobs").join("sha256");
        std::fs::create_dir_all(&blobs).map_err(|e| Error::io(e, &blobs, "create"))?;

        let marker = store.root.join(LAYOUT_FILE);
        if !marker.exists() {
            let body = serde_json::to_vec(&LayoutMarker {
                image_layout_version: LAYOUT_VERSION.to_string(),
            })?;
            write_atomic(&marker, &body)?;
        }
        if !store.index_path().exists() {
            store.write_index(&ImageIndex::default())?;
        }
        Ok(store)
    }

    /// Open an existing layout.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let store = Self { root: root.into() };
        if !store.index_path().is_file() {
            return Err(Error::NotFound(format!(
                "OCI layout at {}",
                store.root.display()
            )));
        }
        Ok(store)
    }

    /// Layout root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    /// Path of a blob by digest.
    pub fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        validate_digest(digest)?;
        let (algo, hex) = split_digest(digest);
        Ok(self.root.join("blobs").join(algo).join(hex))
    }

    /// Whether a blob is present.
    #[must_use]
    pub fn exists(&self, digest: &str) -> bool {
        self.blob_path(digest).is_ok_and(|p| p.is_file())
    }

    /// Store a blob after verifying it against `descriptor`.
    ///
    /// The blob is written to a temporary file next to its final path and
    /// renamed into place, so readers never observe partial content.
    pub fn put_blob(&self, descriptor: &Descriptor, data: &[u8]) -> Result<()> {
        if data.len() as u64 != descriptor.size {
            return Err(Error::digest_mismatch(
                format!("{} ({} bytes)", descriptor.digest, descriptor.size),
                format!("{} bytes", data.len()),
            ));
        }
        verify_digest(&descriptor.digest, data)?;

        let path = self.blob_path(&descriptor.digest)?;
        if path.exists() {
            trace!(digest = %descriptor.digest, "Blob already present");
            return Ok(());
        }
        write_atomic(&path, data)?;
        debug!(digest = %descriptor.digest, size = data.len(), "Stored verified blob");
        Ok(())
    }

    /// Create an empty staging file for a blob download.
    ///
    /// It lives next to the final blob path, so committing it is a rename.
    /// Dropping it without [`LayoutStore::commit_staged`] removes it.
    pub fn staging_file(&self, digest: &str) -> Result<NamedTempFile> {
        let path = self.blob_path(digest)?;
        let parent = path
            .parent()
            .ok_or_else(|| Error::invalid_input(format!("{} has no parent", path.display())))?;
        std::fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create"))?;
        tempfile::Builder::new()
            .prefix(".staging-")
            .tempfile_in(parent)
            .map_err(|e| Error::io(e, parent, "create"))
    }

    /// Verify a staged download against `descriptor` and move it into place.
    ///
    /// The file is hashed by streaming. On mismatch the staged file is
    /// removed and nothing is stored.
    pub fn commit_staged(&self, descriptor: &Descriptor, staged: NamedTempFile) -> Result<()> {
        let (digest, size) = file_digest(staged.path())?;
        if digest != descriptor.digest {
            return Err(Error::digest_mismatch(&descriptor.digest, digest));
        }
        if size != descriptor.size {
            return Err(Error::digest_mismatch(
                format!("{} ({} bytes)", descriptor.digest, descriptor.size),
                format!("{size} bytes"),
            ));
        }

        let path = self.blob_path(&descriptor.digest)?;
        if path.exists() {
            trace!(digest = %descriptor.digest, "Blob already present");
            return Ok(());
        }
        staged
            .persist(&path)
            .map_err(|e| Error::io(e.error, &path, "rename"))?;
        debug!(digest = %descriptor.digest, size, "Stored verified blob");
        Ok(())
    }

    /// Read a blob by digest.
    pub fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(digest)?;
        match std::fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("blob {digest}")))
            }
            Err(e) => Err(Error::io(e, &path, "read")),
        }
    }

    /// Read and parse `index.json`.
    pub fn index(&self) -> Result<ImageIndex> {
        let path = self.index_path();
        let data = std::fs::read(&path).map_err(|e| Error::io(e, &path, "read"))?;
        Ok(serde_json::from_slice(&data)?)
    }

    fn write_index(&self, index: &ImageIndex) -> Result<()> {
        let body = serde_json::to_vec(index)?;
        write_atomic(&self.index_path(), &body)
    }

    /// Record `descriptor` in `index.json` under `tag`.
    ///
    /// An existing entry with the same tag is replaced.
    pub fn tag(&self, descriptor: &Descriptor, tag: &str) -> Result<()> {
        if tag.is_empty() {
            return Err(Error::invalid_input("tag cannot be empty"));
        }
        let mut index = self.index()?;
        index
            .manifests
            .retain(|m| m.annotation(ANNOTATION_REF_NAME) != Some(tag));

        let mut entry = descriptor.clone();
        entry
            .annotations
            .get_or_insert_with(Default::default)
            .insert(ANNOTATION_REF_NAME.to_string(), tag.to_string());
        index.manifests.push(entry);

        self.write_index(&index)?;
        debug!(tag, digest = %descriptor.digest, "Tagged root descriptor");
        Ok(())
    }

    /// Resolve a tag or digest to a root descriptor.
    ///
    /// Digests are looked up in `index.json` first; an untagged digest whose
    /// blob is present resolves to a descriptor built from the blob itself.
    pub fn resolve(&self, reference: &str) -> Result<Descriptor> {
        let index = self.index()?;

        if validate_digest(reference).is_ok() {
            if let Some(found) = index.manifests.iter().find(|m| m.digest == reference) {
                return Ok(strip_ref_name(found.clone()));
            }
            let data = self.read_blob(reference)?;
            return Ok(Descriptor {
                media_type: detect_manifest_media_type(&data)?,
                digest: reference.to_string(),
                size: data.len() as u64,
                annotations: None,
                platform: None,
                artifact_type: None,
            });
        }

        index
            .manifests
            .iter()
            .find(|m| m.annotation(ANNOTATION_REF_NAME) == Some(reference))
            .cloned()
            .map(strip_ref_name)
            .ok_or_else(|| Error::NotFound(format!("tag '{reference}' in {}", self.root.display())))
    }
}

fn strip_ref_name(mut descriptor: Descriptor) -> Descriptor {
    if let Some(annotations) = descriptor.annotations.as_mut() {
        annotations.remove(ANNOTATION_REF_NAME);
        if annotations.is_empty() {
            descriptor.annotations = None;
        }
    }
    descriptor
}

/// Write a file via a sibling temp file and rename.
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::invalid_input(format!("{} has no parent", path.display())))?;
    std::fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create"))?;

    let mut temp =
        NamedTempFile::new_in(parent).map_err(|e| Error::io(e, parent, "create"))?;
    temp.write_all(data)
        .map_err(|e| Error::io(e, temp.path(), "write"))?;
    temp.persist(path)
        .map_err(|e| Error::io(e.error, path, "rename"))?;
    Ok(())
}
