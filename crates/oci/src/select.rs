//! Platform selection over a cached root descriptor.

use tracing::debug;

use crate::descriptor::{Descriptor, ImageIndex};
use crate::layout::LayoutStore;
use crate::platform::{Platform, platform_selected};
use crate::{Error, Result};

/// Which platforms to export and how to lay them out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportOptions {
    /// Export every manifest in the index.
    pub all_platforms: bool,
    /// Platforms to export when `all_platforms` is unset.
    pub platforms: Vec<Platform>,
    /// Place each platform under `<os>/<arch>[/<variant>]`.
    pub use_platform_subdirs: bool,
}

impl ExportOptions {
    /// Options for every platform, laid out in subdirectories.
    #[must_use]
    pub fn all() -> Self {
        Self {
            all_platforms: true,
            platforms: Vec::new(),
            use_platform_subdirs: true,
        }
    }

    /// Options for the host platform only, without subdirectories.
    #[must_use]
    pub fn current() -> Self {
        Self {
            all_platforms: false,
            platforms: vec![Platform::current()],
            use_platform_subdirs: false,
        }
    }

    /// Build options from command-line style flags.
    ///
    /// Blank selections are ignored. `all_arch` together with explicit
    /// platforms is rejected.
    pub fn from_selection<S: AsRef<str>>(all_arch: bool, selections: &[S]) -> Result<Self> {
        let selections: Vec<&str> = selections
            .iter()
            .map(|s| s.as_ref().trim())
            .filter(|s| !s.is_empty())
            .collect();

        if all_arch && !selections.is_empty() {
            return Err(Error::invalid_input(
                "--all-arch cannot be combined with --platform",
            ));
        }
        if all_arch {
            return Ok(Self::all());
        }
        if selections.is_empty() {
            return Ok(Self::current());
        }

        let platforms = selections
            .into_iter()
            .map(Platform::parse_selection)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            all_platforms: false,
            platforms,
            use_platform_subdirs: true,
        })
    }

    fn requested(&self) -> String {
        self.platforms
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// A manifest chosen for export and the platform it was published for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestSelection {
    /// The manifest descriptor.
    pub descriptor: Descriptor,
    /// Platform metadata, when the producer recorded any.
    pub platform: Option<Platform>,
}

/// Select the manifests under `root` that `options` asks for.
pub fn select_manifests(
    store: &LayoutStore,
    root: &Descriptor,
    options: &ExportOptions,
) -> Result<Vec<ManifestSelection>> {
    if !root.is_index() {
        return Ok(vec![ManifestSelection {
            descriptor: root.clone(),
            platform: root.platform.clone(),
        }]);
    }

    let data = store.read_blob(&root.digest)?;
    let index: ImageIndex = serde_json::from_slice(&data)?;

    let selected: Vec<ManifestSelection> = index
        .manifests
        .iter()
        .filter(|m| options.all_platforms || platform_selected(m.platform.as_ref(), &options.platforms))
        .map(|m| ManifestSelection {
            descriptor: m.clone(),
            platform: m.platform.clone(),
        })
        .collect();

    debug!(
        available = index.manifests.len(),
        selected = selected.len(),
        all_platforms = options.all_platforms,
        "Selected manifests from index"
    );

    if !selected.is_empty() {
        return Ok(selected);
    }
    if !options.all_platforms && !options.platforms.is_empty() {
        return Err(Error::PlatformNotAvailable {
            requested: options.requested(),
        });
    }
    match index.manifests.as_slice() {
        [only] => Ok(vec![ManifestSelection {
            descriptor: only.clone(),
            platform: only.platform.clone(),
        }]),
        _ => Err(Error::EmptyIndex),
    }
}
