//! Delivery metadata lookup.
//!
//! Metadata for a pulled artifact comes from the first source in a fixed
//! chain that yields a non-empty annotation map:
//!
//! 1. the root descriptor's own annotations
//! 2. the annotations inside the manifest or index blob it names
//! 3. the top-level annotations of the layout's `index.json`

use serde::Deserialize;
use tracing::debug;

use crate::descriptor::{ANNOTATION_REF_NAME, Annotations, Descriptor};
use crate::layout::LayoutStore;
use crate::Result;

/// One place annotations may be read from.
pub trait AnnotationSource {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Annotations from this source; empty when it has none.
    fn load(&self, store: &LayoutStore, descriptor: &Descriptor) -> Result<Annotations>;
}

/// Annotations carried on the descriptor itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct DescriptorAnnotations;

impl AnnotationSource for DescriptorAnnotations {
    fn name(&self) -> &'static str {
        "descriptor"
    }

    fn load(&self, _store: &LayoutStore, descriptor: &Descriptor) -> Result<Annotations> {
        let mut annotations = descriptor.annotations.clone().unwrap_or_default();
        annotations.remove(ANNOTATION_REF_NAME);
        Ok(annotations)
    }
}

/// Annotations inside the manifest or index blob the descriptor names.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlobAnnotations;

#[derive(Deserialize)]
struct AnnotatedDocument {
    #[serde(default)]
    annotations: Option<Annotations>,
}

impl AnnotationSource for BlobAnnotations {
    fn name(&self) -> &'static str {
        "blob"
    }

    fn load(&self, store: &LayoutStore, descriptor: &Descriptor) -> Result<Annotations> {
        let data = store.read_blob(&descriptor.digest)?;
        let doc: AnnotatedDocument = serde_json::from_slice(&data)?;
        Ok(doc.annotations.unwrap_or_default())
    }
}

/// Top-level annotations of the layout's `index.json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexAnnotations;

impl AnnotationSource for IndexAnnotations {
    fn name(&self) -> &'static str {
        "index"
    }

    fn load(&self, store: &LayoutStore, _descriptor: &Descriptor) -> Result<Annotations> {
        Ok(store.index()?.annotations.unwrap_or_default())
    }
}

/// An ordered list of annotation sources.
pub struct AnnotationChain {
    sources: Vec<Box<dyn AnnotationSource + Send + Sync>>,
}

impl Default for AnnotationChain {
    fn default() -> Self {
        Self {
            sources: vec![
                Box::new(DescriptorAnnotations),
                Box::new(BlobAnnotations),
                Box::new(IndexAnnotations),
            ],
        }
    }
}

impl std::fmt::Debug for AnnotationChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.sources.iter().map(|s| s.name()).collect();
        f.debug_struct("AnnotationChain").field("sources", &names).finish()
    }
}

impl AnnotationChain {
    /// Build a chain from explicit sources.
    #[must_use]
    pub fn new(sources: Vec<Box<dyn AnnotationSource + Send + Sync>>) -> Self {
        Self { sources }
    }

    /// Annotations from the first source with a non-empty result.
    ///
    /// A failing source is logged and skipped.
    #[must_use]
    pub fn resolve(&self, store: &LayoutStore, descriptor: &Descriptor) -> Annotations {
        for source in &self.sources {
            match source.load(store, descriptor) {
                Ok(annotations) if !annotations.is_empty() => {
                    debug!(source = source.name(), count = annotations.len(), "Loaded annotations");
                    return annotations;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(source = source.name(), error = %e, "Annotation source failed");
                }
            }
        }
        Annotations::new()
    }
}
