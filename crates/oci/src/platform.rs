//! Platform parsing, matching and host detection.
//!
//! Platforms use OCI naming (`linux/amd64`, `darwin/arm64`, `linux/arm/v7`).
//! Fields are lower-cased by the constructors and on deserialization, so a
//! [`Platform`] can be used directly as a map key with case-insensitive
//! identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Reserved platform for architecture-independent artifacts.
pub const NOARCH: &str = "noarch";

/// An OS/architecture/variant triple.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "RawPlatform")]
pub struct Platform {
    /// Operating system (linux, darwin, windows).
    pub os: String,
    /// Architecture (amd64, arm64, arm).
    #[serde(rename = "architecture")]
    pub arch: String,
    /// Architecture variant (v7, v8); empty when not applicable.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub variant: String,
}

/// Platform as written in a manifest, before normalization.
#[derive(Deserialize)]
struct RawPlatform {
    #[serde(default)]
    os: String,
    #[serde(rename = "architecture", default)]
    arch: String,
    #[serde(default)]
    variant: String,
}

impl From<RawPlatform> for Platform {
    fn from(raw: RawPlatform) -> Self {
        Self::new(raw.os, raw.arch).with_variant(raw.variant)
    }
}

impl Platform {
    /// Create a new platform without a variant.
    #[must_use]
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into().to_lowercase(),
            arch: arch.into().to_lowercase(),
            variant: String::new(),
        }
    }

    /// Set the variant.
    #[must_use]
    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = variant.into().to_lowercase();
        self
    }

    /// The reserved `noarch` platform.
    #[must_use]
    pub fn noarch() -> Self {
        Self::new(NOARCH, "")
    }

    /// Whether this is the reserved `noarch` platform.
    #[must_use]
    pub fn is_noarch(&self) -> bool {
        self.os == NOARCH
    }

    /// Whether the platform carries no information at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.os.is_empty() && self.arch.is_empty() && self.variant.is_empty()
    }

    /// Parse a manifest platform string: `os[/arch][/variant][:os_version]`.
    ///
    /// The `:os_version` suffix is accepted and dropped. Missing components
    /// are left empty.
    #[must_use]
    pub fn parse_lenient(s: &str) -> Self {
        let s = s.trim();
        let s = s.split_once(':').map_or(s, |(head, _)| head);
        let mut parts = s.splitn(3, '/');
        let os = parts.next().unwrap_or_default();
        let arch = parts.next().unwrap_or_default();
        let variant = parts.next().unwrap_or_default();
        Self::new(os, arch).with_variant(variant)
    }

    /// Parse a user platform selection. At least `os/arch` is required.
    pub fn parse_selection(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(Error::invalid_platform(s, "platform cannot be empty"));
        }
        let parts: Vec<&str> = trimmed.split('/').collect();
        if parts.len() < 2 || parts[0].is_empty() || parts[1].is_empty() {
            return Err(Error::invalid_platform(
                s,
                "expected os/arch or os/arch/variant",
            ));
        }
        Ok(Self::new(parts[0], parts[1]).with_variant(parts[2..].join("/")))
    }

    /// The platform the current process runs on, in OCI naming.
    #[must_use]
    pub fn current() -> Self {
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            other => other,
        };
        Self::new(os, oci_arch(std::env::consts::ARCH, cfg!(target_endian = "little")))
    }

    /// Whether `candidate` satisfies this platform used as a filter.
    ///
    /// OS and arch must match; an empty filter variant matches any variant.
    #[must_use]
    pub fn matches(&self, candidate: &Self) -> bool {
        self.os.eq_ignore_ascii_case(&candidate.os)
            && self.arch.eq_ignore_ascii_case(&candidate.arch)
            && (self.variant.is_empty() || self.variant.eq_ignore_ascii_case(&candidate.variant))
    }

    /// Tag suffix form: `os-arch[-variant]`.
    #[must_use]
    pub fn tag_suffix(&self) -> String {
        if self.is_noarch() {
            return NOARCH.to_string();
        }
        let mut suffix = format!("{}-{}", self.os, self.arch);
        if !self.variant.is_empty() {
            suffix.push('-');
            suffix.push_str(&self.variant);
        }
        suffix
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_noarch() {
            return f.write_str(NOARCH);
        }
        write!(f, "{}/{}", self.os, self.arch)?;
        if !self.variant.is_empty() {
            write!(f, "/{}", self.variant)?;
        }
        Ok(())
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_selection(s)
    }
}

/// OCI architecture name for a Rust target architecture.
fn oci_arch(arch: &str, little_endian: bool) -> &str {
    match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" if little_endian => "ppc64le",
        "powerpc64" => "ppc64",
        other => other,
    }
}

/// Whether a candidate platform is selected by a list of filter platforms.
///
/// An empty filter selects everything. A candidate without platform
/// metadata is only selected when exactly one platform was requested.
#[must_use]
pub fn platform_selected(candidate: Option<&Platform>, filters: &[Platform]) -> bool {
    if filters.is_empty() {
        return true;
    }
    match candidate {
        None => filters.len() == 1,
        Some(candidate) => filters.iter().any(|f| f.matches(candidate)),
    }
}
