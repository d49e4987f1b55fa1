//! Shared fixtures: an in-memory registry and artifact builders.

#![allow(dead_code)]

use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use porter_oci::descriptor::{
    ANNOTATION_TITLE, EMPTY_JSON, MEDIA_TYPE_IMAGE_INDEX, MEDIA_TYPE_IMAGE_MANIFEST,
};
use porter_oci::{
    Annotations, Descriptor, Error, ImageIndex, ImageManifest, Platform, Reference,
    RegistryTransport, Result,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const BINARY_MEDIA_TYPE: &str = "application/vnd.delivery-station.plugin.v1+binary";
pub const ARCHIVE_MEDIA_TYPE: &str = "application/vnd.delivery-station.plugin.v1.tar+gzip";

#[derive(Default)]
struct State {
    /// `(repository, tag or digest)` to `(body, media type)`.
    manifests: HashMap<(String, String), (Vec<u8>, String)>,
    blobs: HashMap<String, Vec<u8>>,
}

/// A registry held in memory.
#[derive(Default)]
pub struct FakeRegistry {
    state: Mutex<State>,
    fail_push_blob: Mutex<Option<Vec<u8>>>,
    fail_pull_blob: Mutex<Option<String>>,
    corrupt_pull_blob: Mutex<Option<String>>,
    /// Files blob downloads were written to, in order.
    pub blob_destinations: Mutex<Vec<PathBuf>>,
    pub manifest_pulls: AtomicUsize,
    pub blob_pulls: AtomicUsize,
    pub manifest_pushes: AtomicUsize,
}

fn repository(reference: &Reference) -> String {
    format!("{}/{}", reference.registry(), reference.repository())
}

fn key(reference: &Reference) -> String {
    reference
        .digest()
        .or_else(|| reference.tag())
        .unwrap_or("latest")
        .to_string()
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail any blob upload with exactly these bytes.
    pub fn fail_push_of(&self, data: &[u8]) {
        *self.fail_push_blob.lock().unwrap() = Some(data.to_vec());
    }

    /// Fail downloads of the blob with this digest.
    pub fn fail_pull_of(&self, digest: &str) {
        *self.fail_pull_blob.lock().unwrap() = Some(digest.to_string());
    }

    /// Serve altered bytes for the blob with this digest.
    pub fn corrupt_pull_of(&self, digest: &str) {
        *self.corrupt_pull_blob.lock().unwrap() = Some(digest.to_string());
    }

    /// Digest the tag currently points at.
    pub fn tag_digest(&self, reference: &str, tag: &str) -> Option<String> {
        let reference: Reference = reference.parse().unwrap();
        let state = self.state.lock().unwrap();
        state
            .manifests
            .get(&(repository(&reference), tag.to_string()))
            .map(|(body, _)| porter_oci::descriptor::sha256_digest(body))
    }

    pub fn blob_count(&self) -> usize {
        self.state.lock().unwrap().blobs.len()
    }

    pub fn put_blob(&self, data: &[u8]) -> String {
        let digest = porter_oci::descriptor::sha256_digest(data);
        self.state
            .lock()
            .unwrap()
            .blobs
            .insert(digest.clone(), data.to_vec());
        digest
    }

    /// Store a document under its digest and, if given, a tag.
    pub fn put_manifest(&self, reference: &str, tag: Option<&str>, body: &[u8], media_type: &str) -> String {
        let reference: Reference = reference.parse().unwrap();
        let digest = porter_oci::descriptor::sha256_digest(body);
        let repo = repository(&reference);
        let mut state = self.state.lock().unwrap();
        let entry = (body.to_vec(), media_type.to_string());
        state.manifests.insert((repo.clone(), digest.clone()), entry.clone());
        if let Some(tag) = tag {
            state.manifests.insert((repo, tag.to_string()), entry);
        }
        digest
    }

    /// Seed a single-layer artifact manifest and return its index entry.
    pub fn seed_platform(
        &self,
        reference: &str,
        platform: Platform,
        media_type: &str,
        title: &str,
        content: &[u8],
    ) -> Descriptor {
        self.put_blob(EMPTY_JSON);
        let mut layer = Descriptor::from_bytes(media_type, content);
        layer.annotations = Some(Annotations::from([(
            ANNOTATION_TITLE.to_string(),
            title.to_string(),
        )]));
        self.put_blob(content);

        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_IMAGE_MANIFEST.to_string()),
            artifact_type: Some(media_type.to_string()),
            config: Descriptor::empty_config(),
            layers: vec![layer],
            subject: None,
            annotations: None,
        };
        let body = serde_json::to_vec(&manifest).unwrap();
        self.put_manifest(reference, None, &body, MEDIA_TYPE_IMAGE_MANIFEST);

        let mut descriptor = Descriptor::from_bytes(MEDIA_TYPE_IMAGE_MANIFEST, &body);
        descriptor.platform = Some(platform);
        descriptor
    }

    /// Seed an index over `manifests` under `tag`; returns its digest.
    pub fn seed_index(
        &self,
        reference: &str,
        tag: &str,
        manifests: Vec<Descriptor>,
        annotations: &[(&str, &str)],
    ) -> String {
        let index = ImageIndex {
            manifests,
            annotations: (!annotations.is_empty()).then(|| {
                annotations
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect()
            }),
            ..Default::default()
        };
        let body = serde_json::to_vec(&index).unwrap();
        self.put_manifest(reference, Some(tag), &body, MEDIA_TYPE_IMAGE_INDEX)
    }

    /// Seed a binary for each `(platform, title, content)` under `tag`.
    pub fn seed_binaries(&self, reference: &str, tag: &str, binaries: &[(Platform, &str, &[u8])]) -> String {
        let manifests = binaries
            .iter()
            .map(|(platform, title, content)| {
                self.seed_platform(reference, platform.clone(), BINARY_MEDIA_TYPE, title, content)
            })
            .collect();
        self.seed_index(reference, tag, manifests, &[])
    }
}

#[async_trait]
impl RegistryTransport for FakeRegistry {
    async fn pull_manifest(&self, reference: &Reference) -> Result<(Vec<u8>, String)> {
        self.manifest_pulls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        state
            .manifests
            .get(&(repository(reference), key(reference)))
            .map(|(body, _)| (body.clone(), porter_oci::descriptor::sha256_digest(body)))
            .ok_or_else(|| Error::registry(reference.whole(), "pull manifest", "manifest unknown", false))
    }

    async fn pull_blob(&self, reference: &Reference, descriptor: &Descriptor, dest: &Path) -> Result<()> {
        self.blob_pulls.fetch_add(1, Ordering::SeqCst);
        if self.fail_pull_blob.lock().unwrap().as_deref() == Some(descriptor.digest.as_str()) {
            return Err(Error::registry(reference.whole(), "pull blob", "connection reset", false));
        }
        let mut data = self
            .state
            .lock()
            .unwrap()
            .blobs
            .get(&descriptor.digest)
            .cloned()
            .ok_or_else(|| Error::registry(reference.whole(), "pull blob", "blob unknown", false))?;
        if self.corrupt_pull_blob.lock().unwrap().as_deref() == Some(descriptor.digest.as_str()) {
            data.reverse();
        }
        self.blob_destinations.lock().unwrap().push(dest.to_path_buf());
        std::fs::write(dest, data)?;
        Ok(())
    }

    async fn push_blob(&self, reference: &Reference, data: &[u8], digest: &str) -> Result<()> {
        if self.fail_push_blob.lock().unwrap().as_deref() == Some(data) {
            return Err(Error::registry(reference.whole(), "push blob", "simulated failure", false));
        }
        self.state
            .lock()
            .unwrap()
            .blobs
            .insert(digest.to_string(), data.to_vec());
        Ok(())
    }

    async fn push_manifest(&self, reference: &Reference, body: Vec<u8>, media_type: &str) -> Result<()> {
        self.manifest_pushes.fetch_add(1, Ordering::SeqCst);
        let digest = porter_oci::descriptor::sha256_digest(&body);
        let repo = repository(reference);
        let mut state = self.state.lock().unwrap();
        let entry = (body, media_type.to_string());
        state.manifests.insert((repo.clone(), digest), entry.clone());
        if let Some(tag) = reference.tag() {
            state.manifests.insert((repo, tag.to_string()), entry);
        }
        Ok(())
    }
}

/// Gzipped tarball with raw entry names, so hostile paths survive.
pub fn tarball(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        let raw = &mut header.as_old_mut().name;
        raw[..name.len()].copy_from_slice(name.as_bytes());
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder.append(&header, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// Every regular file under `root`, relative and sorted.
pub fn files_under(root: &Path) -> Vec<String> {
    let mut files: Vec<String> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            e.path()
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/")
        })
        .collect();
    files.sort();
    files
}
