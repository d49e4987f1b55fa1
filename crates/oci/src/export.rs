//! Materialize cached artifacts on disk.
//!
//! A destination is written in one of two modes. File mode streams the
//! single layer of a single manifest to the destination path. Directory mode
//! writes every layer of every selected manifest into the destination,
//! optionally under `<os>/<arch>[/<variant>]` subdirectories.

use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::cache::ArtifactResult;
use crate::descriptor::{ANNOTATION_TITLE, Descriptor, ImageManifest, is_tar_gzip};
use crate::extract::extract_tar_gz;
use crate::layout::LayoutStore;
use crate::platform::Platform;
use crate::select::{ExportOptions, ManifestSelection, select_manifests};
use crate::{Error, Result};

const FALLBACK_NAME: &str = "artifact";
const UNKNOWN_PLATFORM_DIR: &str = "unknown";

/// What currently sits at the destination path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Existing {
    Missing,
    Directory,
    File,
}

/// How the destination is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportMode {
    /// Stream one layer to the destination path.
    File,
    /// Write layers into the destination directory.
    Directory,
}

/// Export the selected platforms of a cached artifact to `destination`.
///
/// Returns the paths written.
pub fn export_artifact(
    result: &ArtifactResult,
    destination: &Path,
    options: &ExportOptions,
) -> Result<Vec<PathBuf>> {
    if destination.as_os_str().is_empty() {
        return Err(Error::invalid_input("destination required"));
    }
    if result.digest.is_empty() {
        return Err(Error::invalid_input("artifact digest missing"));
    }

    let store = LayoutStore::open(&result.local_path)?;
    let root = store.resolve(&result.digest)?;
    let manifests = select_manifests(&store, &root, options)?;
    if manifests.is_empty() {
        return Err(Error::Export("no matching platform found for export".to_string()));
    }

    let needs_subdirs = options.use_platform_subdirs || manifests.len() > 1;
    let mode = resolve_mode(
        inspect_destination(destination)?,
        needs_subdirs,
        looks_like_file(destination),
    )?;
    debug!(
        destination = %destination.display(),
        ?mode,
        needs_subdirs,
        manifests = manifests.len(),
        "Resolved export destination"
    );

    match mode {
        ExportMode::File => export_to_file(&store, &manifests[0].descriptor, destination),
        ExportMode::Directory => {
            let base_name = artifact_base_name(&result.reference);
            let mut exported = Vec::new();
            for selection in &manifests {
                let target = if needs_subdirs {
                    platform_dir(destination, selection.platform.as_ref())
                } else {
                    destination.to_path_buf()
                };
                exported.extend(export_layers(&store, selection, &target, &base_name)?);
            }
            Ok(exported)
        }
    }
}

fn inspect_destination(destination: &Path) -> Result<Existing> {
    match std::fs::metadata(destination) {
        Ok(meta) if meta.is_dir() => Ok(Existing::Directory),
        Ok(_) => Ok(Existing::File),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Existing::Missing),
        Err(e) => Err(Error::io(e, destination, "stat")),
    }
}

fn resolve_mode(existing: Existing, needs_subdirs: bool, looks_file: bool) -> Result<ExportMode> {
    match existing {
        Existing::Directory => Ok(ExportMode::Directory),
        Existing::File if needs_subdirs => Err(Error::Export(
            "destination must be a directory when exporting multiple platforms".to_string(),
        )),
        Existing::File => Ok(ExportMode::File),
        Existing::Missing if needs_subdirs => Ok(ExportMode::Directory),
        Existing::Missing if looks_file => Ok(ExportMode::File),
        Existing::Missing => Ok(ExportMode::Directory),
    }
}

/// A path with an extension and no trailing separator names a file.
fn looks_like_file(path: &Path) -> bool {
    let raw = path.as_os_str().to_string_lossy();
    if raw.ends_with(std::path::is_separator) {
        return false;
    }
    path.extension().is_some()
}

fn platform_dir(destination: &Path, platform: Option<&Platform>) -> PathBuf {
    match platform {
        Some(p) if !p.os.is_empty() && !p.arch.is_empty() => {
            let mut dir = destination.join(&p.os).join(&p.arch);
            if !p.variant.is_empty() {
                dir.push(&p.variant);
            }
            dir
        }
        _ => destination.join(UNKNOWN_PLATFORM_DIR),
    }
}

fn read_manifest(store: &LayoutStore, descriptor: &Descriptor) -> Result<ImageManifest> {
    let data = store.read_blob(&descriptor.digest)?;
    Ok(serde_json::from_slice(&data)?)
}

fn export_to_file(
    store: &LayoutStore,
    descriptor: &Descriptor,
    destination: &Path,
) -> Result<Vec<PathBuf>> {
    let manifest = read_manifest(store, descriptor)?;
    let [layer] = manifest.layers.as_slice() else {
        return Err(Error::Export(format!(
            "expected a single layer, found {}",
            manifest.layers.len()
        )));
    };

    if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create"))?;
    }
    copy_blob(store, &layer.digest, destination)?;

    info!(digest = %layer.digest, path = %destination.display(), "Exported layer");
    Ok(vec![destination.to_path_buf()])
}

fn export_layers(
    store: &LayoutStore,
    selection: &ManifestSelection,
    target: &Path,
    base_name: &str,
) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(target).map_err(|e| Error::io(e, target, "create"))?;
    let manifest = read_manifest(store, &selection.descriptor)?;

    let mut exported = Vec::new();
    for layer in &manifest.layers {
        if is_tar_gzip(&layer.media_type) {
            let source = store.blob_path(&layer.digest)?;
            let file = File::open(&source).map_err(|e| Error::io(e, &source, "open"))?;
            exported.extend(extract_tar_gz(file, target)?);
            info!(digest = %layer.digest, dir = %target.display(), "Extracted archive layer");
            continue;
        }

        let path = target.join(layer_filename(layer, base_name, selection.platform.as_ref()));
        copy_blob(store, &layer.digest, &path)?;
        info!(digest = %layer.digest, path = %path.display(), "Exported layer");
        exported.push(path);
    }
    Ok(exported)
}

/// Stream a blob to `destination`. The file gets default permissions.
fn copy_blob(store: &LayoutStore, digest: &str, destination: &Path) -> Result<()> {
    let source = store.blob_path(digest)?;
    let mut reader = File::open(&source).map_err(|e| Error::io(e, &source, "open"))?;
    let mut writer = File::create(destination).map_err(|e| Error::io(e, destination, "create"))?;
    std::io::copy(&mut reader, &mut writer).map_err(|e| Error::io(e, destination, "write"))?;
    Ok(())
}

/// Output filename for a non-archive layer.
///
/// The title annotation wins; otherwise the artifact base name, with `.exe`
/// on windows or `.tar.gz` for archives when it has no extension.
#[must_use]
pub fn layer_filename(layer: &Descriptor, base_name: &str, platform: Option<&Platform>) -> String {
    if let Some(title) = layer.annotation(ANNOTATION_TITLE).map(str::trim)
        && !title.is_empty()
    {
        return sanitize_filename(title);
    }

    let mut name = if base_name.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        base_name.to_string()
    };
    if Path::new(&name).extension().is_none() {
        let ext = default_extension(&layer.media_type, platform);
        if !ext.is_empty() && !name.ends_with(ext) {
            name.push_str(ext);
        }
    }
    sanitize_filename(&name)
}

fn default_extension(media_type: &str, platform: Option<&Platform>) -> &'static str {
    if platform.is_some_and(|p| p.os.eq_ignore_ascii_case("windows")) {
        ".exe"
    } else if is_tar_gzip(media_type) {
        ".tar.gz"
    } else {
        ""
    }
}

/// Last path segment of a reference, without tag or digest.
#[must_use]
pub fn artifact_base_name(reference: &str) -> String {
    let name = reference.rsplit('/').next().unwrap_or(reference);
    let name = name.split(['@', ':']).next().unwrap_or(name);
    sanitize_filename(name)
}

/// Make a single safe path component out of `name`.
///
/// Separators, colons and spaces become `-`; empty, `.` and `..` become
/// `artifact`.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let clean: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '\\' | '/' | ':' | ' ' => '-',
            other => other,
        })
        .collect();
    match clean.as_str() {
        "" | "." | ".." => FALLBACK_NAME.to_string(),
        _ => clean,
    }
}
