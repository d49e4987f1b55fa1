//! Content-addressed OCI artifact cache and multi-platform publisher.
//!
//! This crate provides functionality to:
//! - Pull artifacts from OCI registries into a local, digest-keyed cache
//! - Export cached artifacts as files or per-platform directory trees
//! - Publish per-platform binaries as a single OCI index
//!
//! # Example
//!
//! ```ignore
//! use porter_oci::{Client, Config, ExportOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! let client = Client::new(Config::default())?;
//! let cancel = CancellationToken::new();
//!
//! let mut artifact = client
//!     .pull_artifact("ghcr.io/acme/deployer:1.4.0", false, &cancel)
//!     .await?;
//! client.export_artifact(&mut artifact, "./out".as_ref(), &ExportOptions::all())?;
//! ```

#![warn(missing_docs)]

mod annotations;
mod cache;
mod client;
mod config;
mod credentials;
pub mod descriptor;
mod error;
mod export;
mod extract;
mod layout;
mod platform;
pub mod publish;
mod reference;
mod retry;
mod select;
mod transport;

pub use annotations::{
    AnnotationChain, AnnotationSource, BlobAnnotations, DescriptorAnnotations, IndexAnnotations,
};
pub use cache::{ARTIFACT_ID_LEN, ArtifactCache, ArtifactResult, PluginInfo};
pub use client::{Client, PluginInvocation, PushOptions};
pub use config::Config;
pub use credentials::{CredentialResolver, Credentials, RegistryConfig, normalize_registry};
pub use descriptor::{Annotations, Descriptor, ImageIndex, ImageManifest};
pub use error::{Error, Result};
pub use export::{ExportMode, artifact_base_name, export_artifact, layer_filename, sanitize_filename};
pub use extract::{archive_directory, extract_tar_gz};
pub use layout::LayoutStore;
pub use platform::{NOARCH, Platform, platform_selected};
pub use publish::{Manifest, ManifestEntry, PublishedIndex, Publisher};
pub use reference::ArtifactReference;
pub use retry::{RetryConfig, with_retry};
pub use select::{ExportOptions, ManifestSelection, select_manifests};
pub use transport::{OciTransport, RegistryTransport, cancellable};

/// Registry reference type used by [`RegistryTransport`].
pub use oci_distribution::Reference;
