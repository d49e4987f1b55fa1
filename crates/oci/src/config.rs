//! Client configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::credentials::{RegistryConfig, normalize_registry};
use crate::{Error, Result};

/// Directory name under the platform cache dir.
const CACHE_DIR_NAME: &str = "porter";

/// Registries, cache location and log level.
///
/// Loaded from YAML; JSON documents are accepted as well.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Registries with their credentials.
    pub registries: Vec<RegistryConfig>,
    /// Registry used without credentials when no entry names it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_registry: Option<String>,
    /// Cache root; [`Config::default_cache_dir`] when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
    /// Log level for the CLI (`trace` through `error`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl Config {
    /// Parse configuration text and normalize it.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        Ok(config.normalized())
    }

    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(e, path, "read config"))?;
        let config = Self::from_yaml(&text)?;
        debug!(
            path = %path.display(),
            registries = config.registries.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// `<platform cache dir>/porter`, or `.cache/porter` when the platform
    /// has none.
    #[must_use]
    pub fn default_cache_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from(".cache"))
            .join(CACHE_DIR_NAME)
    }

    /// The effective cache root.
    #[must_use]
    pub fn cache_root(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(Self::default_cache_dir)
    }

    /// Drop registries without a host and later duplicates of a host, then
    /// append the default registry if no entry covers it.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        let mut seen = HashSet::new();
        self.registries.retain(|registry| {
            let host = registry.host();
            !host.is_empty() && seen.insert(host)
        });

        if let Some(default) = self.default_registry.as_deref().map(normalize_registry)
            && !default.is_empty()
            && !seen.contains(&default)
        {
            self.registries.push(RegistryConfig {
                name: default.clone(),
                url: default,
                ..Default::default()
            });
        }
        self
    }
}
