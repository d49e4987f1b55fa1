//! Publish inputs: the manifest description file and its prepared entries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

use super::{MEDIA_TYPE_ARTIFACT_ARCHIVE, MEDIA_TYPE_ARTIFACT_BINARY, MEDIA_TYPE_ARTIFACT_INDEX};
use crate::descriptor::Annotations;
use crate::extract::archive_directory;
use crate::platform::Platform;
use crate::{Error, Result};

/// A multi-platform publish description.
///
/// ```yaml
/// artifact-type: application/vnd.delivery-station.plugin.index.v1+json
/// annotations:
///   ds.plugin.name: deployer
/// manifests:
///   - platform: linux/amd64
///     path: dist/deployer-linux-amd64
///   - platform: darwin/arm64
///     mediaType: application/vnd.delivery-station.plugin.v1+binary
///     path: dist/deployer-darwin-arm64
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Artifact type of the published index.
    #[serde(rename = "artifact-type", default, skip_serializing_if = "String::is_empty")]
    pub artifact_type: String,
    /// Top-level index annotations.
    #[serde(default)]
    pub annotations: Annotations,
    /// One entry per platform.
    #[serde(default)]
    pub manifests: Vec<ManifestEntry>,
}

/// One platform of a [`Manifest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// `os[/arch][/variant]`; may be empty.
    #[serde(default)]
    pub platform: String,
    /// Layer media type; a default applies when empty.
    #[serde(rename = "mediaType", default, skip_serializing_if = "String::is_empty")]
    pub media_type: String,
    /// File or directory to publish, relative to the manifest file.
    #[serde(default)]
    pub path: String,
}

impl Manifest {
    /// Parse a manifest from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Load a manifest file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(e, path, "read"))?;
        Self::from_yaml(&text)
    }

    fn single(path: &Path, media_type: &str) -> Self {
        Self {
            artifact_type: MEDIA_TYPE_ARTIFACT_INDEX.to_string(),
            annotations: Annotations::new(),
            manifests: vec![ManifestEntry {
                platform: Platform::current().to_string(),
                media_type: media_type.to_string(),
                path: path.to_string_lossy().into_owned(),
            }],
        }
    }
}

/// Interpret a publish path.
///
/// A directory becomes one archive entry for the host platform. A file that
/// parses as a manifest is used as one. A `.yaml`/`.yml` file that does not
/// parse is an error; any other file becomes one binary entry for the host
/// platform. Returns the manifest and the directory its entry paths are
/// relative to.
pub fn load_push_manifest(path: &Path) -> Result<(Manifest, PathBuf)> {
    let metadata = std::fs::metadata(path).map_err(|e| Error::io(e, path, "access"))?;
    let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();

    if metadata.is_dir() {
        return Ok((Manifest::single(path, MEDIA_TYPE_ARTIFACT_ARCHIVE), base_dir));
    }

    match Manifest::load(path) {
        Ok(manifest) if !manifest.manifests.is_empty() || is_yaml(path) => {
            Ok((manifest, base_dir))
        }
        Err(e) if is_yaml(path) => Err(Error::invalid_input(format!(
            "failed to parse manifest {}: {e}",
            path.display()
        ))),
        _ => Ok((Manifest::single(path, MEDIA_TYPE_ARTIFACT_BINARY), base_dir)),
    }
}

fn is_yaml(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
}

/// A manifest entry resolved to a file on disk.
#[derive(Debug)]
pub struct PreparedEntry {
    /// Layer media type, defaults applied.
    pub media_type: String,
    /// File to upload.
    pub path: PathBuf,
    /// Layer title.
    pub title: String,
    archive: Option<NamedTempFile>,
}

impl PreparedEntry {
    /// An entry for an existing file.
    #[must_use]
    pub fn file(path: impl Into<PathBuf>, media_type: impl Into<String>) -> Self {
        let path = path.into();
        let title = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            media_type: media_type.into(),
            path,
            title,
            archive: None,
        }
    }

    /// Whether the file is a temporary archive owned by this entry.
    #[must_use]
    pub const fn is_archive(&self) -> bool {
        self.archive.is_some()
    }
}

/// Resolve every entry of `manifest` against `base_dir`.
///
/// Directories are packed into temporary archives that live as long as the
/// returned entries. Empty manifests, entries without a path, and duplicate
/// platforms are rejected.
pub fn prepare_entries(
    manifest: &Manifest,
    base_dir: &Path,
) -> Result<BTreeMap<Platform, PreparedEntry>> {
    if manifest.manifests.is_empty() {
        return Err(Error::invalid_input("manifest must contain at least one entry"));
    }

    let mut entries = BTreeMap::new();
    for entry in &manifest.manifests {
        let platform = Platform::parse_lenient(&entry.platform);
        if entries.contains_key(&platform) {
            return Err(Error::invalid_input(format!(
                "duplicate manifest entry for platform '{platform}'"
            )));
        }
        let prepared = prepare_entry(entry, base_dir)?;
        entries.insert(platform, prepared);
    }
    Ok(entries)
}

fn prepare_entry(entry: &ManifestEntry, base_dir: &Path) -> Result<PreparedEntry> {
    let raw = entry.path.trim();
    if raw.is_empty() {
        return Err(Error::invalid_input("manifest entry missing path"));
    }

    let resolved = clean_path(&base_dir.join(raw));
    let metadata = std::fs::metadata(&resolved).map_err(|e| Error::io(e, &resolved, "access"))?;
    let media_type = entry.media_type.trim();

    if metadata.is_dir() {
        let archive = archive_directory(&resolved)?;
        let name = resolved
            .file_name()
            .map_or_else(|| "artifact".to_string(), |n| n.to_string_lossy().into_owned());
        debug!(source = %resolved.display(), "Archived directory entry");
        Ok(PreparedEntry {
            media_type: non_empty_or(media_type, MEDIA_TYPE_ARTIFACT_ARCHIVE),
            path: archive.path().to_path_buf(),
            title: format!("{name}.tar.gz"),
            archive: Some(archive),
        })
    } else {
        Ok(PreparedEntry::file(
            resolved,
            non_empty_or(media_type, MEDIA_TYPE_ARTIFACT_BINARY),
        ))
    }
}

fn non_empty_or(value: &str, default: &str) -> String {
    let chosen = if value.is_empty() { default } else { value };
    chosen.to_string()
}

// Lexical clean: folds `.` and `..` without touching the filesystem.
fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other),
        }
    }
    out
}
