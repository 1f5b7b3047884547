//! Per-item processing.
//!
//! [`DocumentProcessor::process`] turns one [`WorkItem`] into one [`ProcessingResult`] and never
//! fails: every collaborator error, timeout, or malformed response becomes a failed result
//! carrying its [`FailureKind`]. Containers recurse into their children on the same task, guarded
//! by the set of ancestor identifiers on the current branch and a depth bound.
//!
//! Structured text and containers use two-stage generation: a description call first, then a
//! title call fed with that description.

use crate::classify::classify_item;
use crate::extraction::{ContentExtractor, ExtractedContent, ExtractionError};
use crate::generation::prompts;
use crate::generation::{
    DescriptionGenerator, GeneratedFields, GenerationError, GenerationRequest, GenerationTask,
};
use crate::metrics::ProcessingMetrics;
use crate::model::{FailureKind, ItemKind, ProcessingResult, RunSettings, WorkItem};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::{Map, Value, json};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tiktoken_rs::cl100k_base;

/// Counts tokens in a piece of text.
pub type TokenCounter = Arc<dyn Fn(&str) -> usize + Send + Sync>;

/// Limits applied while processing one item.
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    /// Bound applied to every extraction and generation call.
    pub call_timeout: Duration,
    /// Maximum container nesting depth below a top-level item.
    pub max_depth: usize,
    /// Token bound for the aggregate text submitted for a container.
    pub aggregate_token_budget: usize,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(180),
            max_depth: 8,
            aggregate_token_budget: 6000,
        }
    }
}

/// Collaborator failure on its way into a failed result.
#[derive(Debug)]
struct ItemFailure {
    kind: FailureKind,
    message: String,
}

impl ItemFailure {
    fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<ExtractionError> for ItemFailure {
    fn from(error: ExtractionError) -> Self {
        Self::new(error.failure_kind(), error.to_string())
    }
}

impl From<GenerationError> for ItemFailure {
    fn from(error: GenerationError) -> Self {
        Self::new(error.failure_kind(), error.to_string())
    }
}

/// Dispatch engine producing one result per item.
pub struct DocumentProcessor {
    extractor: Arc<dyn ContentExtractor>,
    vision: Arc<dyn DescriptionGenerator>,
    text: Arc<dyn DescriptionGenerator>,
    settings: ProcessorSettings,
    metrics: Arc<ProcessingMetrics>,
    token_counter: TokenCounter,
}

impl DocumentProcessor {
    /// Build a processor from its collaborators.
    pub fn new(
        extractor: Arc<dyn ContentExtractor>,
        vision: Arc<dyn DescriptionGenerator>,
        text: Arc<dyn DescriptionGenerator>,
        settings: ProcessorSettings,
        metrics: Arc<ProcessingMetrics>,
    ) -> Self {
        Self {
            extractor,
            vision,
            text,
            settings,
            metrics,
            token_counter: build_token_counter(),
        }
    }

    /// Describe `item`, recursing into containers.
    pub async fn process(&self, item: &WorkItem, run: &RunSettings) -> ProcessingResult {
        self.process_in(item, run, &HashSet::new(), 0).await
    }

    fn process_in<'a>(
        &'a self,
        item: &'a WorkItem,
        run: &'a RunSettings,
        ancestors: &'a HashSet<String>,
        depth: usize,
    ) -> BoxFuture<'a, ProcessingResult> {
        async move {
            let kind = classify_item(item);
            if ancestors.contains(&item.id) {
                tracing::warn!(item = %item.id, name = %item.name, "Container includes itself");
                return ProcessingResult::failed(
                    item,
                    kind,
                    FailureKind::CycleDetected,
                    "item appears as its own descendant",
                );
            }
            if depth > self.settings.max_depth {
                return ProcessingResult::failed(
                    item,
                    kind,
                    FailureKind::CycleDetected,
                    format!("nesting exceeds {} levels", self.settings.max_depth),
                );
            }

            let outcome = match kind {
                ItemKind::VisualDocument => self.describe_visual(item, run).await,
                ItemKind::StructuredText => self.describe_text(item, run).await,
                ItemKind::Container => {
                    return self.describe_container(item, run, ancestors, depth).await;
                }
                ItemKind::Unsupported => Err(ItemFailure::new(
                    FailureKind::UnsupportedType,
                    format!("no handler for {}", item.name),
                )),
            };

            match outcome {
                Ok(result) => result,
                Err(failure) => {
                    tracing::info!(
                        item = %item.id,
                        name = %item.name,
                        kind = %kind,
                        failure = %failure.kind,
                        error = %failure.message,
                        "Item failed"
                    );
                    ProcessingResult::failed(item, kind, failure.kind, failure.message)
                }
            }
        }
        .boxed()
    }

    async fn describe_visual(
        &self,
        item: &WorkItem,
        run: &RunSettings,
    ) -> Result<ProcessingResult, ItemFailure> {
        let (images, total_pages) = match self.extract(item, ItemKind::VisualDocument, run).await? {
            ExtractedContent::Pages {
                images,
                total_pages,
            } => (images, total_pages),
            other => return Err(unexpected_content(&other)),
        };

        let prompt = prompts::document_prompt(&item.name, images.len(), total_pages, &run.language);
        let pages_processed = images.len();
        let fields = self
            .generate(
                self.vision.as_ref(),
                GenerationRequest {
                    task: GenerationTask::Document,
                    prompt,
                    images,
                    sampling: run.sampling,
                },
            )
            .await?;

        let mut metadata = base_metadata(item, run);
        metadata.insert("pages_processed".into(), json!(pages_processed));
        metadata.insert("total_pages".into(), json!(total_pages));
        Ok(ProcessingResult::ok(
            item,
            ItemKind::VisualDocument,
            fields.require_title()?,
            fields.require_description()?,
            metadata,
        ))
    }

    async fn describe_text(
        &self,
        item: &WorkItem,
        run: &RunSettings,
    ) -> Result<ProcessingResult, ItemFailure> {
        let (excerpt, truncated) = match self.extract(item, ItemKind::StructuredText, run).await? {
            ExtractedContent::Excerpt { text, truncated } => (text, truncated),
            other => return Err(unexpected_content(&other)),
        };

        let prompt =
            prompts::excerpt_description_prompt(&item.name, &excerpt, truncated, &run.language);
        let (title, description) = self.two_stage(prompt, false, run).await?;

        let mut metadata = base_metadata(item, run);
        metadata.insert("excerpt_chars".into(), json!(excerpt.chars().count()));
        metadata.insert("truncated".into(), json!(truncated));
        Ok(ProcessingResult::ok(
            item,
            ItemKind::StructuredText,
            title,
            description,
            metadata,
        ))
    }

    async fn describe_container(
        &self,
        item: &WorkItem,
        run: &RunSettings,
        ancestors: &HashSet<String>,
        depth: usize,
    ) -> ProcessingResult {
        let entries = match self.extract(item, ItemKind::Container, run).await {
            Ok(ExtractedContent::Children { items }) => items,
            Ok(other) => return failure_result(item, unexpected_content(&other)),
            Err(failure) => return failure_result(item, failure),
        };

        let mut lineage = ancestors.clone();
        lineage.insert(item.id.clone());

        let mut children = Vec::with_capacity(entries.len());
        for entry in &entries {
            children.push(self.process_in(entry, run, &lineage, depth + 1).await);
        }

        let aggregate = self.aggregate(&children);
        let mut metadata = base_metadata(item, run);
        metadata.insert("child_count".into(), json!(children.len()));
        metadata.insert("children_ok".into(), json!(aggregate.included + aggregate.omitted));
        metadata.insert(
            "children_failed".into(),
            json!(children.len() - aggregate.included - aggregate.omitted),
        );
        if aggregate.omitted > 0 {
            metadata.insert("aggregate_omitted".into(), json!(aggregate.omitted));
        }

        if aggregate.included == 0 {
            tracing::info!(
                item = %item.id,
                children = children.len(),
                "Container has no described children"
            );
            let description = format!(
                "Archive with {} item(s); none of them could be described.",
                children.len()
            );
            return ProcessingResult::ok(
                item,
                ItemKind::Container,
                item.name.clone(),
                description,
                metadata,
            )
            .with_children(children);
        }

        let prompt = prompts::collection_description_prompt(
            &item.name,
            &aggregate.text,
            aggregate.included,
            children.len(),
            &run.language,
        );
        match self.two_stage(prompt, true, run).await {
            Ok((title, description)) => {
                ProcessingResult::ok(item, ItemKind::Container, title, description, metadata)
                    .with_children(children)
            }
            Err(failure) => failure_result(item, failure).with_children(children),
        }
    }

    /// Description call followed by a title call over that description.
    async fn two_stage(
        &self,
        description_prompt: String,
        is_collection: bool,
        run: &RunSettings,
    ) -> Result<(String, String), ItemFailure> {
        let description = self
            .generate(
                self.text.as_ref(),
                GenerationRequest {
                    task: GenerationTask::Description,
                    prompt: description_prompt,
                    images: Vec::new(),
                    sampling: run.sampling,
                },
            )
            .await?
            .require_description()?;

        let title = self
            .generate(
                self.text.as_ref(),
                GenerationRequest {
                    task: GenerationTask::Title,
                    prompt: prompts::title_prompt(&description, is_collection, &run.language),
                    images: Vec::new(),
                    sampling: run.sampling,
                },
            )
            .await?
            .require_title()?;

        Ok((title, description))
    }

    /// Lines `- name: description` for described children, bounded by the token budget.
    fn aggregate(&self, children: &[ProcessingResult]) -> Aggregate {
        let mut aggregate = Aggregate::default();
        let mut used = 0;
        for child in children.iter().filter(|child| child.is_ok()) {
            let line = format!("- {}: {}", child.name, child.description);
            let cost = (self.token_counter)(&line) + 1;
            if used + cost > self.settings.aggregate_token_budget {
                aggregate.omitted += 1;
                continue;
            }
            used += cost;
            if !aggregate.text.is_empty() {
                aggregate.text.push('\n');
            }
            aggregate.text.push_str(&line);
            aggregate.included += 1;
        }
        aggregate
    }

    async fn extract(
        &self,
        item: &WorkItem,
        kind: ItemKind,
        run: &RunSettings,
    ) -> Result<ExtractedContent, ItemFailure> {
        self.metrics.record_extraction();
        let content = self
            .bounded("extraction", self.extractor.extract(item, kind, run))
            .await?;
        Ok(content)
    }

    async fn generate(
        &self,
        generator: &dyn DescriptionGenerator,
        request: GenerationRequest,
    ) -> Result<GeneratedFields, ItemFailure> {
        self.metrics.record_generation();
        let fields = self.bounded("generation", generator.generate(request)).await?;
        Ok(fields)
    }

    async fn bounded<T, E, F>(&self, what: &str, call: F) -> Result<T, ItemFailure>
    where
        F: Future<Output = Result<T, E>>,
        ItemFailure: From<E>,
    {
        match tokio::time::timeout(self.settings.call_timeout, call).await {
            Ok(result) => result.map_err(ItemFailure::from),
            Err(_) => Err(ItemFailure::new(
                FailureKind::Timeout,
                format!("{what} exceeded {:?}", self.settings.call_timeout),
            )),
        }
    }
}

#[derive(Debug, Default)]
struct Aggregate {
    text: String,
    included: usize,
    omitted: usize,
}

fn base_metadata(item: &WorkItem, run: &RunSettings) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("size_bytes".into(), json!(item.size));
    metadata.insert("language".into(), json!(run.language));
    metadata
}

fn failure_result(item: &WorkItem, failure: ItemFailure) -> ProcessingResult {
    tracing::info!(
        item = %item.id,
        name = %item.name,
        failure = %failure.kind,
        error = %failure.message,
        "Container failed"
    );
    ProcessingResult::failed(item, ItemKind::Container, failure.kind, failure.message)
}

fn unexpected_content(content: &ExtractedContent) -> ItemFailure {
    let variant = match content {
        ExtractedContent::Pages { .. } => "page images",
        ExtractedContent::Excerpt { .. } => "a text excerpt",
        ExtractedContent::Children { .. } => "archive entries",
    };
    ItemFailure::new(FailureKind::Io, format!("extractor returned {variant} for this kind"))
}

fn build_token_counter() -> TokenCounter {
    match cl100k_base() {
        Ok(encoder) => {
            let encoder = Arc::new(encoder);
            Arc::new(move |text: &str| encoder.encode_ordinary(text).len())
        }
        Err(error) => {
            tracing::warn!(error = %error, "Falling back to whitespace token counting");
            Arc::new(|text: &str| text.split_whitespace().count())
        }
    }
}
