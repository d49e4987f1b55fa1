//! High-level client tying the cache, exporter and publisher together.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::{ARTIFACT_ID_LEN, ArtifactCache, ArtifactResult, PluginInfo};
use crate::config::Config;
use crate::credentials::CredentialResolver;
use crate::descriptor::Annotations;
use crate::export;
use crate::publish::{Publisher, load_push_manifest, prepare_entries};
use crate::reference::ArtifactReference;
use crate::retry::RetryConfig;
use crate::select::ExportOptions;
use crate::transport::{OciTransport, RegistryTransport};
use crate::{Error, Result};

const ARTIFACT_TYPE_KEY: &str = "artifact.type";
const PUSHED_REFERENCE_KEY: &str = "pushed.reference";
const REQUESTED_REFERENCE_KEY: &str = "requested.reference";

/// Options for [`Client::push_artifact`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushOptions {
    /// Talk to the registry over plain HTTP.
    pub insecure: bool,
    /// Also tag the published index as `latest`.
    pub tag_latest: bool,
}

impl Default for PushOptions {
    fn default() -> Self {
        Self {
            insecure: false,
            tag_latest: true,
        }
    }
}

/// A plugin run requested against a cached artifact.
///
/// The client does not execute anything; the caller runs the plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginInvocation {
    /// Artifact id.
    pub artifact_id: String,
    /// Cache directory of the artifact.
    pub artifact_path: PathBuf,
    /// Plugin to run.
    pub plugin: String,
    /// Arguments for the plugin.
    pub args: Vec<String>,
    /// Plugin hints recorded with the artifact.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin_info: Option<PluginInfo>,
}

/// Pulls, exports, lists and publishes artifacts.
pub struct Client {
    credentials: CredentialResolver,
    cache: ArtifactCache,
    retry: RetryConfig,
    transport: Option<Arc<dyn RegistryTransport>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("cache", &self.cache)
            .field("retry", &self.retry)
            .field("custom_transport", &self.transport.is_some())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create a client and its cache directory.
    pub fn new(config: Config) -> Result<Self> {
        let root = config.cache_root();
        std::fs::create_dir_all(&root).map_err(|e| Error::io(e, &root, "create cache directory"))?;
        Ok(Self {
            credentials: CredentialResolver::new(config.registries),
            cache: ArtifactCache::new(root),
            retry: RetryConfig::default(),
            transport: None,
        })
    }

    /// Route all registry traffic through `transport`.
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn RegistryTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Retry policy for registry calls.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// The artifact cache.
    #[must_use]
    pub const fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    fn transport_for(
        &self,
        reference: &ArtifactReference,
        insecure: bool,
        cancel: &CancellationToken,
    ) -> Arc<dyn RegistryTransport> {
        if let Some(transport) = &self.transport {
            return Arc::clone(transport);
        }
        let credentials = self.credentials.resolve(reference.registry());
        Arc::new(
            OciTransport::new(&credentials, insecure)
                .with_retry(self.retry.clone())
                .with_cancellation(cancel.clone()),
        )
    }

    /// Pull an artifact into the cache.
    pub async fn pull_artifact(
        &self,
        reference: &str,
        insecure: bool,
        cancel: &CancellationToken,
    ) -> Result<ArtifactResult> {
        let reference = ArtifactReference::parse(reference)?;
        info!(reference = %reference, insecure, "Pulling artifact");
        let transport = self.transport_for(&reference, insecure, cancel);
        self.cache.pull(transport.as_ref(), &reference, cancel).await
    }

    /// Export a cached artifact and record the written files in its metadata.
    pub fn export_artifact(
        &self,
        artifact: &mut ArtifactResult,
        destination: &Path,
        options: &ExportOptions,
    ) -> Result<Vec<PathBuf>> {
        let files = export::export_artifact(artifact, destination, options)?;
        artifact.record_export(files.clone(), destination);
        if let Err(e) = self.cache.save(artifact) {
            warn!(id = %artifact.id, error = %e, "Failed to update artifact metadata");
        }
        Ok(files)
    }

    /// Publish a file, a directory, or a manifest of per-platform files.
    ///
    /// All inputs are validated before the first registry call.
    pub async fn push_artifact(
        &self,
        path: &Path,
        reference: &str,
        options: PushOptions,
        cancel: &CancellationToken,
    ) -> Result<ArtifactResult> {
        let reference = ArtifactReference::parse(reference)?;
        if path.as_os_str().is_empty() {
            return Err(Error::invalid_input("manifest or artifact path required"));
        }
        let path = std::path::absolute(path).map_err(|e| Error::io(e, path, "resolve"))?;

        let (manifest, base_dir) = load_push_manifest(&path)?;
        let entries = prepare_entries(&manifest, &base_dir)?;

        info!(reference = %reference, platforms = entries.len(), "Pushing artifact");
        let transport = self.transport_for(&reference, options.insecure, cancel);
        let published = Publisher::new(transport, reference.clone())
            .with_tag_latest(options.tag_latest)
            .publish(&entries, &manifest, cancel)
            .await?;
        drop(entries);

        let mut metadata: Annotations = manifest.annotations.clone();
        if !manifest.artifact_type.is_empty() {
            metadata.insert(ARTIFACT_TYPE_KEY.to_string(), manifest.artifact_type.clone());
        }
        metadata.insert(PUSHED_REFERENCE_KEY.to_string(), published.reference.clone());
        if published.reference != reference.as_str() {
            metadata.insert(REQUESTED_REFERENCE_KEY.to_string(), reference.as_str().to_string());
        }

        let id = published
            .descriptor
            .encoded()
            .get(..ARTIFACT_ID_LEN)
            .unwrap_or_else(|| published.descriptor.encoded())
            .to_string();

        info!(reference = %published.reference, digest = %published.descriptor.digest, "Artifact pushed successfully");
        Ok(ArtifactResult {
            id,
            reference: published.reference,
            digest: published.descriptor.digest,
            size: published.descriptor.size,
            plugin_info: PluginInfo::from_metadata(&metadata),
            metadata,
            cached: false,
            ..Default::default()
        })
    }

    /// Every artifact in the cache.
    pub fn list_cached_artifacts(&self) -> Result<Vec<ArtifactResult>> {
        self.cache.list()
    }

    /// Metadata of one cached artifact.
    pub fn load_artifact(&self, id: &str) -> Result<ArtifactResult> {
        self.cache.load(id)
    }

    /// Resolve a plugin run against a cached artifact.
    pub fn execute_plugin(
        &self,
        artifact_id: &str,
        plugin: &str,
        args: Vec<String>,
    ) -> Result<PluginInvocation> {
        if plugin.trim().is_empty() {
            return Err(Error::invalid_input("plugin name required"));
        }
        let artifact = self.cache.load(artifact_id)?;
        info!(
            artifact = artifact_id,
            plugin,
            path = %artifact.local_path.display(),
            args = ?args,
            "Plugin execution requested"
        );
        Ok(PluginInvocation {
            artifact_id: artifact.id,
            artifact_path: artifact.local_path,
            plugin: plugin.to_string(),
            args,
            plugin_info: artifact.plugin_info,
        })
    }
}
