//! Shared data model for batch runs.
//!
//! Work items are discovered once and never mutated afterwards. The processor turns each of them
//! into a [`ProcessingResult`], and the checkpoint keeps both around so a batch can be resumed or
//! reported on later. Every type here serializes into the checkpoint file, so variants must stay
//! forward-readable: unknown item kinds decode as [`ItemKind::Unsupported`] and unknown failure
//! kinds as [`FailureKind::Unknown`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Where the bytes of a [`WorkItem`] can be fetched from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceRef {
    /// File on the local filesystem.
    Local {
        /// Absolute path of the file.
        path: PathBuf,
    },
    /// File held by the remote storage provider.
    Remote {
        /// Provider file identifier.
        file_id: String,
    },
    /// Entry unpacked from a container.
    Archive {
        /// Identifier of the container the entry came from.
        container_id: String,
        /// Entry path inside the container.
        entry: String,
        /// Raw entry bytes. Only held in memory while the container is being processed.
        #[serde(skip)]
        bytes: Arc<Vec<u8>>,
    },
}

/// A single discoverable unit of input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Opaque identifier, stable across runs of the same batch.
    pub id: String,
    /// Display name, usually the file name.
    pub name: String,
    /// Path relative to the work-set root, when the source has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Declared content type, when the source reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Size in bytes as reported at discovery time.
    #[serde(default)]
    pub size: u64,
    /// Location used to fetch the bytes.
    pub source: SourceRef,
}

impl WorkItem {
    /// Build an item for an entry unpacked from `container`.
    ///
    /// The identifier is derived from the entry's content, so the same bytes reached twice
    /// through nested containers resolve to the same id.
    pub fn archive_entry(container: &WorkItem, entry: &str, bytes: Vec<u8>) -> Self {
        let id = content_id(&bytes);
        let name = entry
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or(entry)
            .to_string();
        let parent = container.display_path();
        Self {
            id,
            name,
            path: Some(format!("{parent}/{entry}")),
            content_type: None,
            size: bytes.len() as u64,
            source: SourceRef::Archive {
                container_id: container.id.clone(),
                entry: entry.to_string(),
                bytes: Arc::new(bytes),
            },
        }
    }

    /// Relative path when known, otherwise the display name.
    pub fn display_path(&self) -> &str {
        self.path.as_deref().unwrap_or(&self.name)
    }
}

/// Derive a content-addressed identifier for unpacked bytes.
pub fn content_id(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("sha256:{}", &hex::encode(digest)[..32])
}

/// Outcome of classifying a [`WorkItem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// Paged document rendered to images for the vision generator.
    VisualDocument,
    /// Archive that unpacks into further items.
    Container,
    /// Text-bearing format summarized from an excerpt.
    StructuredText,
    /// Anything else. Also the decoding target for kinds this build does not know.
    #[serde(other)]
    Unsupported,
}

impl ItemKind {
    /// Stable snake_case label used in logs and manifests.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VisualDocument => "visual_document",
            Self::Container => "container",
            Self::StructuredText => "structured_text",
            Self::Unsupported => "unsupported",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure categories recorded for items that did not produce a description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The source is unreadable or truncated.
    CorruptSource,
    /// The classifier or extractor rejected the format.
    UnsupportedType,
    /// The generator's backing service returned an error or unusable response.
    ModelError,
    /// The generator answered but the output lacked the required fields.
    MalformedOutput,
    /// A collaborator call exceeded its bound.
    Timeout,
    /// The item's bytes could not be fetched from its source.
    SourceUnavailable,
    /// Local I/O or tooling failure while extracting content.
    Io,
    /// The item appeared as its own descendant or nesting exceeded the depth bound.
    CycleDetected,
    /// Kind recorded by a newer build.
    #[serde(other)]
    Unknown,
}

impl FailureKind {
    /// Whether a rerun has a reasonable chance of succeeding without operator intervention.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::ModelError
                | Self::MalformedOutput
                | Self::Timeout
                | Self::SourceUnavailable
                | Self::Io
        )
    }

    /// Stable snake_case label used in logs and manifests.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CorruptSource => "corrupt_source",
            Self::UnsupportedType => "unsupported_type",
            Self::ModelError => "model_error",
            Self::MalformedOutput => "malformed_output",
            Self::Timeout => "timeout",
            Self::SourceUnavailable => "source_unavailable",
            Self::Io => "io",
            Self::CycleDetected => "cycle_detected",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal status of a [`ProcessingResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ResultStatus {
    /// Title and description were generated.
    Ok,
    /// Processing stopped with the given failure.
    Failed {
        /// Failure category.
        kind: FailureKind,
        /// Human-readable error summary.
        message: String,
    },
}

/// Generated metadata for one item, recursively for containers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingResult {
    /// Identifier of the described item.
    pub id: String,
    /// Display name of the described item.
    pub name: String,
    /// Relative path of the described item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Classification used to dispatch the item.
    pub kind: ItemKind,
    /// Generated title; empty for failures.
    #[serde(default)]
    pub title: String,
    /// Generated description; empty for failures.
    #[serde(default)]
    pub description: String,
    /// Child results in container order. Empty for leaf documents.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ProcessingResult>,
    /// Extraction metadata such as page counts and byte sizes.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    /// Success or failure summary.
    pub status: ResultStatus,
}

impl ProcessingResult {
    /// Successful result for `item`.
    pub fn ok(
        item: &WorkItem,
        kind: ItemKind,
        title: String,
        description: String,
        metadata: Map<String, Value>,
    ) -> Self {
        Self {
            id: item.id.clone(),
            name: item.name.clone(),
            path: item.path.clone(),
            kind,
            title,
            description,
            children: Vec::new(),
            metadata,
            status: ResultStatus::Ok,
        }
    }

    /// Failed result for `item` with no generated fields.
    pub fn failed(
        item: &WorkItem,
        kind: ItemKind,
        failure: FailureKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: item.id.clone(),
            name: item.name.clone(),
            path: item.path.clone(),
            kind,
            title: String::new(),
            description: String::new(),
            children: Vec::new(),
            metadata: Map::new(),
            status: ResultStatus::Failed {
                kind: failure,
                message: message.into(),
            },
        }
    }

    /// Attach child results.
    pub fn with_children(mut self, children: Vec<ProcessingResult>) -> Self {
        self.children = children;
        self
    }

    /// Whether the result carries generated fields.
    pub fn is_ok(&self) -> bool {
        matches!(self.status, ResultStatus::Ok)
    }

    /// Failure kind and message, if the result failed.
    pub fn failure(&self) -> Option<(FailureKind, &str)> {
        match &self.status {
            ResultStatus::Ok => None,
            ResultStatus::Failed { kind, message } => Some((*kind, message.as_str())),
        }
    }
}

/// Which pages of a paged document are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PageWindow {
    /// Every page.
    All,
    /// The first `leading` pages plus the last `trailing` pages.
    Window {
        /// Pages taken from the start.
        leading: u32,
        /// Pages taken from the end.
        trailing: u32,
    },
}

impl Default for PageWindow {
    fn default() -> Self {
        Self::Window {
            leading: 2,
            trailing: 2,
        }
    }
}

impl PageWindow {
    /// One-based page numbers to render for a document with `total` pages, ascending and
    /// without duplicates.
    pub fn select(self, total: u32) -> Vec<u32> {
        match self {
            Self::All => (1..=total).collect(),
            Self::Window { leading, trailing } => {
                let head_end = leading.min(total);
                let mut pages: Vec<u32> = (1..=head_end).collect();
                if total > leading && trailing > 0 {
                    let tail_start = (leading + 1).max(total.saturating_sub(trailing) + 1);
                    pages.extend(tail_start..=total);
                }
                pages
            }
        }
    }
}

/// Sampling parameters forwarded to the generators.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sampling {
    /// Completion token budget per call.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Nucleus sampling cutoff.
    pub top_p: f32,
}

impl Default for Sampling {
    fn default() -> Self {
        Self {
            max_tokens: 300,
            temperature: 0.1,
            top_p: 0.9,
        }
    }
}

/// Per-run configuration recorded in the checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSettings {
    /// Language the descriptions are written in.
    pub language: String,
    /// Page selection for visual documents.
    #[serde(default)]
    pub pages: PageWindow,
    /// Sampling parameters.
    #[serde(default)]
    pub sampling: Sampling,
}

impl RunSettings {
    /// Default settings for the given language.
    pub fn for_language(language: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            pages: PageWindow::default(),
            sampling: Sampling::default(),
        }
    }
}

/// Work-set source a batch is run against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchSource {
    /// Local directory walked recursively.
    Local {
        /// Root directory of the work set.
        root: PathBuf,
    },
    /// Remote storage folder listed recursively.
    Drive {
        /// Provider folder identifier.
        folder_id: String,
    },
}

impl BatchSource {
    /// Batch identifier derived from the source.
    ///
    /// Remote folders use their folder id. Local roots hash the path so the id is safe to use
    /// in file names.
    pub fn batch_id(&self) -> String {
        match self {
            Self::Drive { folder_id } => folder_id.clone(),
            Self::Local { root } => {
                let digest = Sha256::digest(root.to_string_lossy().as_bytes());
                format!("local-{}", &hex::encode(digest)[..16])
            }
        }
    }
}

impl fmt::Display for BatchSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local { root } => write!(f, "local:{}", root.display()),
            Self::Drive { folder_id } => write!(f, "drive:{folder_id}"),
        }
    }
}
