//! Multi-platform publishing.
//!
//! Each platform file is pushed as a single-layer artifact manifest,
//! addressed by digest. Only after every platform succeeded is an index
//! listing them pushed under the requested tag, so a failed publish never
//! changes what the tag points at.

mod manifest;
mod store;

pub use manifest::{Manifest, ManifestEntry, PreparedEntry, load_push_manifest, prepare_entries};
pub use store::{BlobSource, ContentStore};

use chrono::{SecondsFormat, Utc};
use futures::{StreamExt, TryStreamExt, stream};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::descriptor::{
    ANNOTATION_CREATED, Annotations, Descriptor, EMPTY_JSON, ImageIndex, ImageManifest,
    MEDIA_TYPE_IMAGE_INDEX, MEDIA_TYPE_IMAGE_MANIFEST,
};
use crate::platform::Platform;
use crate::reference::ArtifactReference;
use crate::transport::{RegistryTransport, cancellable};
use crate::{Error, Result};

/// Default layer media type for a single binary.
pub const MEDIA_TYPE_ARTIFACT_BINARY: &str = "application/vnd.delivery-station.plugin.v1+binary";
/// Default layer media type for an archived directory.
pub const MEDIA_TYPE_ARTIFACT_ARCHIVE: &str =
    "application/vnd.delivery-station.plugin.v1.tar+gzip";
/// Default artifact type of a published index.
pub const MEDIA_TYPE_ARTIFACT_INDEX: &str =
    "application/vnd.delivery-station.plugin.index.v1+json";

/// Platform pushes in flight at once.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// File-backed layers buffered for upload at once.
///
/// The registry client uploads from a byte slice, so each file-backed
/// upload holds the whole file in memory while it runs.
pub const DEFAULT_FILE_UPLOADS: usize = 1;

const LATEST_TAG: &str = "latest";

/// The index a publish produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedIndex {
    /// `registry/repository:tag` the index was pushed under.
    pub reference: String,
    /// Descriptor of the index document.
    pub descriptor: Descriptor,
}

/// Pushes platform artifacts and the index tying them together.
pub struct Publisher {
    transport: Arc<dyn RegistryTransport>,
    reference: ArtifactReference,
    tag_latest: bool,
    concurrency: usize,
    file_uploads: Arc<Semaphore>,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("reference", &self.reference.as_str())
            .field("tag_latest", &self.tag_latest)
            .field("concurrency", &self.concurrency)
            .field("file_uploads", &self.file_uploads.available_permits())
            .finish_non_exhaustive()
    }
}

impl Publisher {
    /// Create a publisher for `reference`. `latest` is also tagged by default.
    #[must_use]
    pub fn new(transport: Arc<dyn RegistryTransport>, reference: ArtifactReference) -> Self {
        Self {
            transport,
            reference,
            tag_latest: true,
            concurrency: DEFAULT_CONCURRENCY,
            file_uploads: Arc::new(Semaphore::new(DEFAULT_FILE_UPLOADS)),
        }
    }

    /// Whether to also push the index as `latest`.
    #[must_use]
    pub const fn with_tag_latest(mut self, tag_latest: bool) -> Self {
        self.tag_latest = tag_latest;
        self
    }

    /// Maximum number of concurrent platform pushes.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Maximum number of file-backed layers read for upload at once.
    #[must_use]
    pub fn with_file_uploads(mut self, uploads: usize) -> Self {
        self.file_uploads = Arc::new(Semaphore::new(uploads.max(1)));
        self
    }

    /// The target reference.
    #[must_use]
    pub const fn reference(&self) -> &ArtifactReference {
        &self.reference
    }

    /// Push one platform's file as an artifact manifest.
    ///
    /// Returns the manifest descriptor as it should appear in the index.
    pub async fn push_binary(&self, platform: &Platform, entry: &PreparedEntry) -> Result<Descriptor> {
        let mut store = ContentStore::new();
        let layer = store.add_file_titled(&entry.path, &entry.media_type, entry.title.clone())?;
        let config = Descriptor::empty_config();
        store.push(&config, EMPTY_JSON.to_vec())?;

        let created = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_IMAGE_MANIFEST.to_string()),
            artifact_type: Some(entry.media_type.clone()),
            config: config.clone(),
            layers: vec![layer.clone()],
            subject: None,
            annotations: Some(Annotations::from([(
                ANNOTATION_CREATED.to_string(),
                created.clone(),
            )])),
        };
        let body = serde_json::to_vec(&manifest)?;
        let mut descriptor = Descriptor::from_bytes(MEDIA_TYPE_IMAGE_MANIFEST, &body);
        store.push(&descriptor, body)?;

        for blob in [&config, &layer] {
            self.upload(&store, blob).await?;
        }
        self.transport
            .push_manifest(
                &self.reference.with_digest(&descriptor.digest),
                store.fetch(&descriptor.digest)?,
                MEDIA_TYPE_IMAGE_MANIFEST,
            )
            .await?;

        let mut annotations = Annotations::from([(ANNOTATION_CREATED.to_string(), created)]);
        annotations.insert("os".to_string(), platform.os.clone());
        annotations.insert("architecture".to_string(), platform.arch.clone());
        if !platform.variant.is_empty() {
            annotations.insert("variant".to_string(), platform.variant.clone());
        }
        descriptor.annotations = Some(annotations);
        descriptor.artifact_type = Some(entry.media_type.clone());
        descriptor.platform = (!platform.is_empty()).then(|| platform.clone());

        debug!(
            platform = %platform,
            digest = %descriptor.digest,
            layer = %layer.digest,
            size = layer.size,
            "Pushed platform manifest"
        );
        Ok(descriptor)
    }

    /// Upload one staged blob. File content is read only inside the upload.
    async fn upload(&self, store: &ContentStore, blob: &Descriptor) -> Result<()> {
        let target = self.reference.with_digest(&blob.digest);
        match store.source(&blob.digest)? {
            BlobSource::Bytes(data) => {
                self.transport.push_blob(&target, data, &blob.digest).await
            }
            BlobSource::File(path) => {
                let _permit = self
                    .file_uploads
                    .acquire()
                    .await
                    .map_err(|_| Error::Cancelled)?;
                self.transport
                    .push_blob_file(&target, path, &blob.digest)
                    .await
            }
        }
    }

    /// Push every platform with bounded concurrency.
    ///
    /// The first failure aborts the remaining pushes.
    pub async fn push_all(
        &self,
        entries: &BTreeMap<Platform, PreparedEntry>,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<Platform, Descriptor>> {
        if entries.is_empty() {
            return Err(Error::invalid_input("nothing to publish"));
        }

        let pushes = stream::iter(entries)
            .map(|(platform, entry)| async move {
                let descriptor = self.push_binary(platform, entry).await?;
                Ok::<_, Error>((platform.clone(), descriptor))
            })
            .boxed()
            .buffer_unordered(self.concurrency)
            .try_collect::<BTreeMap<_, _>>();

        cancellable(cancel, pushes).await
    }

    /// Push the index for `descriptors` under the reference's tag.
    ///
    /// With `tag_latest`, the same bytes are also pushed as `latest` unless
    /// that is already the tag.
    pub async fn push_index(
        &self,
        descriptors: &BTreeMap<Platform, Descriptor>,
        manifest: &Manifest,
        cancel: &CancellationToken,
    ) -> Result<PublishedIndex> {
        if descriptors.is_empty() {
            return Err(Error::EmptyIndex);
        }

        let artifact_type = if manifest.artifact_type.trim().is_empty() {
            MEDIA_TYPE_ARTIFACT_INDEX.to_string()
        } else {
            manifest.artifact_type.clone()
        };
        let index = ImageIndex {
            artifact_type: Some(artifact_type),
            manifests: descriptors.values().cloned().collect(),
            annotations: (!manifest.annotations.is_empty()).then(|| manifest.annotations.clone()),
            ..Default::default()
        };
        let body = serde_json::to_vec(&index)?;
        let descriptor = Descriptor::from_bytes(MEDIA_TYPE_IMAGE_INDEX, &body);

        let tag = self.reference.publish_tag().to_string();
        let mut tags = vec![tag.clone()];
        if self.tag_latest && tag != LATEST_TAG {
            tags.push(LATEST_TAG.to_string());
        }

        cancellable(cancel, async {
            for tag in &tags {
                self.transport
                    .push_manifest(&self.reference.with_tag(tag), body.clone(), MEDIA_TYPE_IMAGE_INDEX)
                    .await?;
            }
            Ok::<_, Error>(())
        })
        .await?;

        let reference = self.reference.tagged_string();
        info!(
            reference = %reference,
            digest = %descriptor.digest,
            platforms = descriptors.len(),
            tags = ?tags,
            "Pushed index"
        );
        Ok(PublishedIndex {
            reference,
            descriptor,
        })
    }

    /// Push all platforms, then the index.
    pub async fn publish(
        &self,
        entries: &BTreeMap<Platform, PreparedEntry>,
        manifest: &Manifest,
        cancel: &CancellationToken,
    ) -> Result<PublishedIndex> {
        let descriptors = self.push_all(entries, cancel).await?;
        self.push_index(&descriptors, manifest, cancel).await
    }
}
