//! Content-addressed artifact cache.
//!
//! Each pulled artifact lives in its own OCI layout directory named after
//! the first 16 hex characters of its root digest:
//!
//! ```text
//! <root>/
//! └── 3f9a1c0e5b7d2468/
//!     ├── oci-layout
//!     ├── index.json
//!     ├── blobs/sha256/...
//!     └── metadata.json   # serialized ArtifactResult
//! ```
//!
//! A pull downloads into a directory keyed by a hash of the reference
//! string, then renames it to the digest-keyed name. Renaming is the commit
//! point: a directory under a digest-keyed name is never modified again.
//! Two different references colliding on the 64-bit reference hash is
//! treated as negligible.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::annotations::AnnotationChain;
use crate::descriptor::{Annotations, Descriptor, detect_manifest_media_type, sha256_digest, successors};
use crate::layout::LayoutStore;
use crate::reference::ArtifactReference;
use crate::transport::{RegistryTransport, cancellable};
use crate::{Error, Result};

const METADATA_FILE: &str = "metadata.json";

/// Length of artifact ids, in hex characters.
pub const ARTIFACT_ID_LEN: usize = 16;

/// Metadata key naming the plugin that handles an artifact.
pub const PLUGIN_NAME_KEY: &str = "ds.plugin.name";
/// Metadata key for the plugin version.
pub const PLUGIN_VERSION_KEY: &str = "ds.plugin.version";
/// Prefix of metadata keys carrying plugin parameters.
pub const PLUGIN_PARAM_PREFIX: &str = "ds.plugin.param.";
/// Metadata keys naming a finalizer plugin, in lookup order.
pub const FINALIZER_KEYS: [&str; 2] = ["ds.finalizer", "finalizer"];
/// Metadata key for finalizer arguments (a JSON array of strings).
pub const FINALIZER_ARGS_KEY: &str = "ds.finalizer.args";

/// Plugin execution hints derived from artifact metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Plugin to run on the artifact.
    pub plugin_name: String,
    /// Requested plugin version.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Plugin parameters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

impl PluginInfo {
    /// Extract plugin info from `ds.plugin.*` metadata keys.
    #[must_use]
    pub fn from_metadata(metadata: &Annotations) -> Option<Self> {
        let plugin_name = metadata.get(PLUGIN_NAME_KEY)?.clone();
        let parameters = metadata
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(PLUGIN_PARAM_PREFIX)
                    .map(|name| (name.to_string(), v.clone()))
            })
            .collect();
        Some(Self {
            plugin_name,
            version: metadata.get(PLUGIN_VERSION_KEY).cloned().unwrap_or_default(),
            parameters,
        })
    }
}

/// Outcome of a pull or publish.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactResult {
    /// Cache directory name; digest-derived once committed.
    pub id: String,
    /// Reference the artifact was requested by.
    pub reference: String,
    /// Root digest.
    pub digest: String,
    /// Root manifest or index size in bytes.
    pub size: u64,
    /// Cache directory holding the layout store.
    #[serde(default, skip_serializing_if = "path_is_empty")]
    pub local_path: PathBuf,
    /// Delivery metadata from annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: Annotations,
    /// Plugin execution hints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_info: Option<PluginInfo>,
    /// Whether the artifact is in the local cache.
    pub cached: bool,
    /// When the artifact was cached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_at: Option<DateTime<Utc>>,
    /// Files written by the last export.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exported_files: Vec<PathBuf>,
}

fn path_is_empty(path: &Path) -> bool {
    path.as_os_str().is_empty()
}

impl ArtifactResult {
    /// Name of the finalizer plugin, if the metadata requests one.
    #[must_use]
    pub fn finalizer(&self) -> Option<&str> {
        FINALIZER_KEYS
            .iter()
            .filter_map(|key| self.metadata.get(*key))
            .map(|v| v.trim())
            .find(|v| !v.is_empty())
    }

    /// Record exported files and default finalizer arguments.
    ///
    /// When a finalizer is named and no arguments were given, the absolute
    /// export destination becomes the single argument.
    pub fn record_export(&mut self, files: Vec<PathBuf>, destination: &Path) {
        self.exported_files = files;
        if self.exported_files.is_empty()
            || self.finalizer().is_none()
            || self.metadata.contains_key(FINALIZER_ARGS_KEY)
        {
            return;
        }

        let resolved = std::path::absolute(destination).unwrap_or_else(|e| {
            warn!(path = %destination.display(), error = %e, "Failed to resolve absolute path for finalizer");
            destination.to_path_buf()
        });
        if !resolved.exists() {
            warn!(path = %resolved.display(), "Finalizer path does not exist");
        }

        let resolved = resolved.to_string_lossy().into_owned();
        let args = serde_json::to_string(&[&resolved]).unwrap_or(resolved);
        self.metadata.insert(FINALIZER_ARGS_KEY.to_string(), args);
    }
}

/// Content-addressed cache of pulled artifacts.
#[derive(Debug)]
pub struct ArtifactCache {
    root: PathBuf,
    annotations: AnnotationChain,
}

impl ArtifactCache {
    /// Create a cache rooted at `root`. Nothing is created on disk yet.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            annotations: AnnotationChain::default(),
        }
    }

    /// Use a custom annotation lookup chain.
    #[must_use]
    pub fn with_annotation_chain(mut self, annotations: AnnotationChain) -> Self {
        self.annotations = annotations;
        self
    }

    /// Cache root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of a cached artifact.
    pub fn artifact_path(&self, id: &str) -> Result<PathBuf> {
        validate_artifact_id(id)?;
        Ok(self.root.join(id))
    }

    /// Pull `reference` into the cache.
    ///
    /// The content tree is copied into a temporary layout, then committed
    /// under its digest-derived id. An existing entry with the same id wins
    /// and the fresh copy is discarded.
    pub async fn pull(
        &self,
        transport: &dyn RegistryTransport,
        reference: &ArtifactReference,
        cancel: &CancellationToken,
    ) -> Result<ArtifactResult> {
        std::fs::create_dir_all(&self.root).map_err(|e| Error::io(e, &self.root, "create"))?;

        let temp_id = reference.temporary_id();
        let temp_path = self.root.join(&temp_id);
        let created = !temp_path.exists();
        let store = LayoutStore::create(&temp_path)?;

        info!(reference = %reference, target = reference.identifier(), "Copying artifact to cache");
        let root = match cancellable(cancel, copy_graph(transport, reference, &store)).await {
            Ok(root) => root,
            Err(e) => {
                if created && let Err(remove) = std::fs::remove_dir_all(&temp_path) {
                    warn!(path = %temp_path.display(), error = %remove, "Failed to remove temporary cache path");
                }
                return Err(e);
            }
        };

        let final_id = root
            .encoded()
            .get(..ARTIFACT_ID_LEN)
            .ok_or_else(|| Error::Cache(format!("digest too short: {}", root.digest)))?
            .to_string();
        let (id, local_path) = self.commit(&temp_id, &temp_path, &final_id);

        let store = LayoutStore::open(&local_path)?;
        let metadata = self.annotations.resolve(&store, &root);
        let plugin_info = PluginInfo::from_metadata(&metadata);

        let result = ArtifactResult {
            id,
            reference: reference.as_str().to_string(),
            digest: root.digest.clone(),
            size: root.size,
            local_path,
            metadata,
            plugin_info,
            cached: true,
            cached_at: Some(Utc::now()),
            exported_files: Vec::new(),
        };

        if let Err(e) = self.save(&result) {
            warn!(id = %result.id, error = %e, "Failed to save artifact metadata");
        }

        info!(id = %result.id, digest = %result.digest, size = result.size, "Artifact pulled successfully");
        Ok(result)
    }

    /// Move the temporary directory to its digest-keyed name.
    ///
    /// Returns the id and path the artifact ended up under.
    fn commit(&self, temp_id: &str, temp_path: &Path, final_id: &str) -> (String, PathBuf) {
        let final_path = self.root.join(final_id);
        if final_path == temp_path {
            return (final_id.to_string(), final_path);
        }

        if final_path.exists() {
            debug!(id = final_id, "Artifact already cached, discarding fresh copy");
            discard(temp_path);
            return (final_id.to_string(), final_path);
        }

        match std::fs::rename(temp_path, &final_path) {
            Ok(()) => {
                trace!(from = temp_id, to = final_id, "Committed cache entry");
                (final_id.to_string(), final_path)
            }
            Err(_) if final_path.exists() => {
                debug!(id = final_id, "Lost commit race to concurrent pull");
                discard(temp_path);
                (final_id.to_string(), final_path)
            }
            Err(e) => {
                warn!(
                    temp_id,
                    final_id,
                    error = %e,
                    "Failed to rename cache entry, keeping temporary id"
                );
                (temp_id.to_string(), temp_path.to_path_buf())
            }
        }
    }

    /// Write `metadata.json` for a cached artifact.
    pub fn save(&self, result: &ArtifactResult) -> Result<()> {
        let dir = self.artifact_path(&result.id)?;
        std::fs::create_dir_all(&dir).map_err(|e| Error::io(e, &dir, "create"))?;
        let path = dir.join(METADATA_FILE);
        let body = serde_json::to_vec_pretty(result)?;
        std::fs::write(&path, body).map_err(|e| Error::io(e, &path, "write"))?;
        Ok(())
    }

    /// Load the metadata of a cached artifact by id.
    pub fn load(&self, id: &str) -> Result<ArtifactResult> {
        let path = self.artifact_path(id)?.join(METADATA_FILE);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("artifact {id}")));
            }
            Err(e) => return Err(Error::io(e, &path, "read")),
        };
        Ok(serde_json::from_slice(&data)?)
    }

    /// List cached artifacts, sorted by id.
    ///
    /// Entries with missing or unreadable metadata are skipped.
    pub fn list(&self) -> Result<Vec<ArtifactResult>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(e, &self.root, "read")),
        };

        let mut artifacts = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(e, &self.root, "read"))?;
            if !entry.file_type().is_ok_and(|t| t.is_dir()) {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            match self.load(&id) {
                Ok(artifact) => artifacts.push(artifact),
                Err(e) => warn!(artifact = %id, error = %e, "Failed to load metadata"),
            }
        }
        artifacts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(artifacts)
    }
}

fn discard(path: &Path) {
    if let Err(e) = std::fs::remove_dir_all(path) {
        warn!(path = %path.display(), error = %e, "Failed to remove temporary cache path");
    }
}

/// Reject ids that are not a single plain path component.
fn validate_artifact_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\'])
        && !id.contains('\0');
    if valid {
        Ok(())
    } else {
        Err(Error::invalid_input(format!("invalid artifact id '{id}'")))
    }
}

/// Copy the content tree behind `reference` into `store`.
///
/// Returns the root descriptor, which is tagged in the layout's index.
async fn copy_graph(
    transport: &dyn RegistryTransport,
    reference: &ArtifactReference,
    store: &LayoutStore,
) -> Result<Descriptor> {
    let (data, remote_digest) = transport.pull_manifest(reference.as_oci()).await?;
    let digest = sha256_digest(&data);
    if let Some(expected) = reference.digest()
        && expected != digest
    {
        return Err(Error::digest_mismatch(expected, digest));
    }
    if remote_digest.starts_with("sha256:") && remote_digest != digest {
        return Err(Error::digest_mismatch(remote_digest, digest));
    }

    let root = Descriptor {
        media_type: detect_manifest_media_type(&data)?,
        digest,
        size: data.len() as u64,
        annotations: None,
        platform: None,
        artifact_type: None,
    };
    debug!(digest = %root.digest, media_type = %root.media_type, "Resolved root descriptor");

    copy_node(transport, reference, store, &root, data).await?;
    store.tag(&root, reference.identifier())?;
    Ok(root)
}

/// Store a node after all of its successors are present.
fn copy_node<'a>(
    transport: &'a dyn RegistryTransport,
    reference: &'a ArtifactReference,
    store: &'a LayoutStore,
    node: &'a Descriptor,
    data: Vec<u8>,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        for child in successors(node, &data)? {
            if store.exists(&child.digest) {
                trace!(digest = %child.digest, "Content already present");
                continue;
            }
            if child.is_manifest() {
                let (bytes, _) = transport
                    .pull_manifest(&reference.with_digest(&child.digest))
                    .await?;
                copy_node(transport, reference, store, &child, bytes).await?;
            } else {
                let staged = store.staging_file(&child.digest)?;
                transport
                    .pull_blob(reference.as_oci(), &child, staged.path())
                    .await?;
                store.commit_staged(&child, staged)?;
            }
        }
        store.put_blob(node, &data)
    })
}
