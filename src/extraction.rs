//! Content extraction collaborators.
//!
//! [`ContentExtractor`] is the seam the processor talks to. [`FormatExtractor`] is the production
//! implementation: it fetches the item's bytes, then renders pages (PDF and office formats via
//! poppler and LibreOffice), unpacks archives, or pulls a bounded excerpt out of a text format.

/// ZIP unpacking into content-addressed child items.
pub mod archive;
/// Byte fetching for local, remote, and unpacked items.
pub mod fetch;
/// Page rendering through external poppler/LibreOffice tools.
pub mod pdf;
/// Text excerpts for plain, markup, and email formats.
pub mod text;

use crate::model::{FailureKind, ItemKind, RunSettings, WorkItem};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

pub use fetch::{ItemFetcher, SourceFetcher};
pub use pdf::PageRenderer;

/// One rendered page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    /// One-based page number in the source document.
    pub page: u32,
    /// MIME type of `data`.
    pub media_type: String,
    /// Encoded image bytes.
    pub data: Vec<u8>,
}

/// Content handed to the generators.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractedContent {
    /// Page images of a visual document, in page order.
    Pages {
        /// Rendered pages.
        images: Vec<PageImage>,
        /// Page count of the whole document.
        total_pages: u32,
    },
    /// Bounded text excerpt of a structured-text item.
    Excerpt {
        /// Excerpt text.
        text: String,
        /// Whether the source held more text than the excerpt.
        truncated: bool,
    },
    /// Items unpacked from a container, in archive order. Their bytes travel inside
    /// [`crate::model::SourceRef::Archive`].
    Children {
        /// Unpacked items.
        items: Vec<WorkItem>,
    },
}

/// Errors surfaced by content extractors.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// The source is unreadable or truncated.
    #[error("corrupt source: {0}")]
    CorruptSource(String),
    /// The format cannot be extracted.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    /// The bytes could not be fetched from their source.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    /// Local I/O or external tool failure.
    #[error("extraction I/O error: {0}")]
    Io(String),
}

impl ExtractionError {
    /// Failure category recorded for the item.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::CorruptSource(_) => FailureKind::CorruptSource,
            Self::UnsupportedFormat(_) => FailureKind::UnsupportedType,
            Self::SourceUnavailable(_) => FailureKind::SourceUnavailable,
            Self::Io(_) => FailureKind::Io,
        }
    }
}

impl From<std::io::Error> for ExtractionError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

/// Abstraction over content extraction so the processor can be tested without external tools.
#[async_trait]
pub trait ContentExtractor: Send + Sync {
    /// Extract the content the generator for `kind` consumes.
    async fn extract(
        &self,
        item: &WorkItem,
        kind: ItemKind,
        settings: &RunSettings,
    ) -> Result<ExtractedContent, ExtractionError>;
}

/// Production extractor dispatching on item kind.
pub struct FormatExtractor {
    fetcher: Arc<dyn ItemFetcher>,
    renderer: PageRenderer,
    excerpt_chars: usize,
}

impl FormatExtractor {
    /// Build an extractor from its collaborators.
    pub fn new(
        fetcher: Arc<dyn ItemFetcher>,
        renderer: PageRenderer,
        excerpt_chars: usize,
    ) -> Self {
        Self {
            fetcher,
            renderer,
            excerpt_chars,
        }
    }
}

#[async_trait]
impl ContentExtractor for FormatExtractor {
    async fn extract(
        &self,
        item: &WorkItem,
        kind: ItemKind,
        settings: &RunSettings,
    ) -> Result<ExtractedContent, ExtractionError> {
        if kind == ItemKind::Unsupported {
            return Err(ExtractionError::UnsupportedFormat(item.name.clone()));
        }

        let bytes = self.fetcher.fetch(item).await?;
        tracing::debug!(item = %item.id, kind = %kind, bytes = bytes.len(), "Fetched item bytes");

        match kind {
            ItemKind::VisualDocument => {
                self.renderer
                    .render(&item.name, bytes, settings.pages)
                    .await
            }
            ItemKind::Container => {
                let container = item.clone();
                let items = tokio::task::spawn_blocking(move || archive::unpack(&container, &bytes))
                    .await
                    .map_err(|error| ExtractionError::Io(format!("unpack task failed: {error}")))??;
                Ok(ExtractedContent::Children { items })
            }
            ItemKind::StructuredText => {
                let (text, truncated) = text::excerpt(&item.name, &bytes, self.excerpt_chars)?;
                Ok(ExtractedContent::Excerpt { text, truncated })
            }
            ItemKind::Unsupported => Err(ExtractionError::UnsupportedFormat(item.name.clone())),
        }
    }
}
