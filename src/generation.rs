//! Description generators.
//!
//! The processor depends on [`DescriptionGenerator`] only. Two instances are wired in
//! production, both [`ChatCompletionsGenerator`]s speaking the OpenAI-compatible
//! chat-completions protocol: a vision-capable one that accepts page images and a text-only one.

/// OpenAI-compatible chat-completions client.
pub mod client;
/// Parsing and cleaning of raw model output.
pub mod parse;
/// Prompt construction.
pub mod prompts;

use crate::extraction::PageImage;
use crate::model::{FailureKind, Sampling};
use async_trait::async_trait;
use thiserror::Error;

pub use client::ChatCompletionsGenerator;

/// What a single generation call is asked to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationTask {
    /// Title and description in one call, used for page images.
    Document,
    /// Description only; the first stage of two-stage generation.
    Description,
    /// Title only, derived from an existing description; the second stage.
    Title,
}

impl GenerationTask {
    /// Name of the structured-output schema sent with the request.
    pub fn schema_name(self) -> &'static str {
        match self {
            Self::Document => "document_analysis",
            Self::Description => "document_description",
            Self::Title => "document_title",
        }
    }
}

/// One generation call.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Fields the model must return.
    pub task: GenerationTask,
    /// User prompt.
    pub prompt: String,
    /// Page images; empty for text-only requests.
    pub images: Vec<PageImage>,
    /// Sampling parameters and completion budget.
    pub sampling: Sampling,
}

/// Fields returned by a generator. Which ones are present depends on the task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneratedFields {
    /// Generated title.
    pub title: Option<String>,
    /// Generated description.
    pub description: Option<String>,
}

impl GeneratedFields {
    /// Non-empty title, or a malformed-output error.
    pub fn require_title(&self) -> Result<String, GenerationError> {
        non_empty(self.title.as_deref(), "title")
    }

    /// Non-empty description, or a malformed-output error.
    pub fn require_description(&self) -> Result<String, GenerationError> {
        non_empty(self.description.as_deref(), "description")
    }
}

fn non_empty(value: Option<&str>, field: &str) -> Result<String, GenerationError> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| GenerationError::MalformedOutput(format!("response has no {field}")))
}

/// Errors surfaced by description generators.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// The backing service returned an error or an unusable response.
    #[error("model error: {0}")]
    ModelError(String),
    /// The response could not be parsed into the requested fields.
    #[error("malformed model output: {0}")]
    MalformedOutput(String),
    /// The call exceeded its time bound.
    #[error("model call timed out: {0}")]
    Timeout(String),
}

impl GenerationError {
    /// Failure category recorded for the item.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::ModelError(_) => FailureKind::ModelError,
            Self::MalformedOutput(_) => FailureKind::MalformedOutput,
            Self::Timeout(_) => FailureKind::Timeout,
        }
    }
}

/// Interface implemented by description generators.
#[async_trait]
pub trait DescriptionGenerator: Send + Sync {
    /// Run one generation call.
    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GeneratedFields, GenerationError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_fields_must_be_non_blank() {
        let fields = GeneratedFields {
            title: Some("  Lease agreement ".into()),
            description: Some("   ".into()),
        };
        assert_eq!(fields.require_title().unwrap(), "Lease agreement");
        let error = fields.require_description().unwrap_err();
        assert_eq!(error.failure_kind(), FailureKind::MalformedOutput);
    }
}
