//! Error types for OCI artifact operations.

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Result type for OCI artifact operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while pulling, exporting or publishing artifacts.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Failed to parse an artifact reference.
    #[error("Invalid reference '{0}': {1}")]
    #[diagnostic(
        code(porter::oci::reference),
        help("Use registry/repository[:tag] or registry/repository@sha256:<digest>")
    )]
    InvalidReference(String, String),

    /// Caller supplied input that cannot be acted on.
    #[error("Invalid input: {0}")]
    #[diagnostic(code(porter::oci::input))]
    InvalidInput(String),

    /// Platform string could not be parsed.
    #[error("Invalid platform '{platform}': {message}")]
    #[diagnostic(
        code(porter::oci::platform),
        help("Expected os/arch or os/arch/variant, e.g. linux/arm64")
    )]
    InvalidPlatform {
        /// The rejected platform string.
        platform: String,
        /// Why it was rejected.
        message: String,
    },

    /// No manifest matched the requested platforms.
    #[error("no manifests found for requested platform(s): {requested}")]
    #[diagnostic(
        code(porter::oci::platform_not_available),
        help("Use --all-arch to export every platform in the index")
    )]
    PlatformNotAvailable {
        /// The requested platforms, comma separated.
        requested: String,
    },

    /// An index without any manifests.
    #[error("no manifests found in index")]
    #[diagnostic(code(porter::oci::empty_index))]
    EmptyIndex,

    /// Registry request failed.
    #[error("Registry operation '{operation}' failed for '{reference}': {message}")]
    #[diagnostic(code(porter::oci::registry))]
    Registry {
        /// The reference being operated on.
        reference: String,
        /// Operation that failed (e.g., "pull manifest", "push blob").
        operation: String,
        /// Error message from the transport.
        message: String,
        /// Whether retrying may succeed (connection failure, 5xx, 429).
        transient: bool,
    },

    /// Failed to extract an archive layer.
    #[error("Failed to extract archive into {}: {message}", dest.display())]
    #[diagnostic(code(porter::oci::extract))]
    ExtractionFailed {
        /// Extraction destination.
        dest: Box<Path>,
        /// Error message.
        message: String,
    },

    /// An archive entry would land outside the extraction root.
    #[error("archive entry {entry} escapes destination")]
    #[diagnostic(
        code(porter::oci::path_traversal),
        help("The artifact contains unsafe paths and was not extracted")
    )]
    PathTraversal {
        /// The offending entry name.
        entry: String,
    },

    /// Content requested from a store is not present.
    #[error("Content not found: {0}")]
    #[diagnostic(code(porter::oci::not_found))]
    NotFound(String),

    /// Export cannot be performed as requested.
    #[error("Export failed: {0}")]
    #[diagnostic(code(porter::oci::export))]
    Export(String),

    /// Cache operation failed.
    #[error("Cache error: {0}")]
    #[diagnostic(code(porter::oci::cache))]
    Cache(String),

    /// I/O error with path context.
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(porter::oci::io),
        help("Check file permissions and ensure the path exists")
    )]
    Io {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available.
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "write", "create").
        operation: String,
    },

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    #[diagnostic(code(porter::oci::json))]
    Json(#[from] serde_json::Error),

    /// YAML parsing error.
    #[error("YAML error: {0}")]
    #[diagnostic(code(porter::oci::yaml))]
    Yaml(#[from] serde_yaml::Error),

    /// Digest mismatch after download.
    #[error("Digest mismatch for blob: expected {expected}, got {actual}")]
    #[diagnostic(
        code(porter::oci::digest_mismatch),
        help("The registry returned corrupt or partial content")
    )]
    DigestMismatch {
        /// The expected digest.
        expected: String,
        /// The computed digest.
        actual: String,
    },

    /// The operation was cancelled by the caller.
    #[error("Operation cancelled")]
    #[diagnostic(code(porter::oci::cancelled))]
    Cancelled,
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            source,
            path: None,
            operation: "operation".to_string(),
        }
    }
}

impl Error {
    /// Create an invalid reference error.
    #[must_use]
    pub fn invalid_reference(reference: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidReference(reference.into(), message.into())
    }

    /// Create an invalid input error.
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create an invalid platform error.
    #[must_use]
    pub fn invalid_platform(platform: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidPlatform {
            platform: platform.into(),
            message: message.into(),
        }
    }

    /// Create a registry error.
    #[must_use]
    pub fn registry(
        reference: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
        transient: bool,
    ) -> Self {
        Self::Registry {
            reference: reference.into(),
            operation: operation.into(),
            message: message.into(),
            transient,
        }
    }

    /// Create an extraction failed error.
    #[must_use]
    pub fn extraction_failed(dest: impl AsRef<Path>, message: impl Into<String>) -> Self {
        Self::ExtractionFailed {
            dest: dest.as_ref().into(),
            message: message.into(),
        }
    }

    /// Create an I/O error with path context.
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create a digest mismatch error.
    #[must_use]
    pub fn digest_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::DigestMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Whether the error is worth retrying.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Registry { transient: true, .. })
    }
}
