use super::parse::parse_fields;
use super::prompts::SYSTEM_PROMPT;
use super::{
    DescriptionGenerator, GeneratedFields, GenerationError, GenerationRequest, GenerationTask,
};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use schemars::{JsonSchema, schema_for};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;

/// Title and description of a document.
#[derive(Deserialize, JsonSchema)]
#[allow(dead_code)]
struct DocumentOutput {
    /// Short, specific title of at most twelve words.
    title: String,
    /// Concise plain-text description of the document.
    description: String,
}

/// Description only.
#[derive(Deserialize, JsonSchema)]
#[allow(dead_code)]
struct DescriptionOutput {
    /// Concise plain-text description.
    description: String,
}

/// Title only.
#[derive(Deserialize, JsonSchema)]
#[allow(dead_code)]
struct TitleOutput {
    /// Short, specific title of at most twelve words.
    title: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Generator speaking the OpenAI-compatible chat-completions protocol (vLLM, Ollama, and others).
pub struct ChatCompletionsGenerator {
    http: Client,
    endpoint: String,
    api_token: Option<String>,
    model: String,
    accepts_images: bool,
}

impl ChatCompletionsGenerator {
    /// Build a generator for `model` at `endpoint`.
    ///
    /// `timeout` bounds each HTTP request; the processor applies its own bound on top.
    pub fn new(
        endpoint: impl Into<String>,
        api_token: Option<String>,
        model: impl Into<String>,
        accepts_images: bool,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .user_agent("rusty-brief/0.1")
            .timeout(timeout)
            .build()?;
        let model = model.into();
        let endpoint = endpoint.into();
        tracing::debug!(
            endpoint = %endpoint,
            model = %model,
            accepts_images,
            has_token = api_token.is_some(),
            "Initialized chat-completions generator"
        );
        Ok(Self {
            http,
            endpoint,
            api_token,
            model,
            accepts_images,
        })
    }

    fn build_payload(&self, request: &GenerationRequest) -> Value {
        let user_content = if request.images.is_empty() {
            json!(request.prompt)
        } else {
            let mut parts = vec![json!({ "type": "text", "text": request.prompt })];
            parts.extend(request.images.iter().map(|image| {
                json!({
                    "type": "image_url",
                    "image_url": {
                        "url": format!(
                            "data:{};base64,{}",
                            image.media_type,
                            STANDARD.encode(&image.data)
                        )
                    }
                })
            }));
            Value::Array(parts)
        };

        json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": user_content },
            ],
            "stream": false,
            "max_tokens": request.sampling.max_tokens,
            "temperature": request.sampling.temperature,
            "top_p": request.sampling.top_p,
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": request.task.schema_name(),
                    "strict": true,
                    "schema": output_schema(request.task),
                }
            }
        })
    }
}

/// JSON schema describing the fields `task` must return.
pub fn output_schema(task: GenerationTask) -> Value {
    let schema = match task {
        GenerationTask::Document => schema_for!(DocumentOutput),
        GenerationTask::Description => schema_for!(DescriptionOutput),
        GenerationTask::Title => schema_for!(TitleOutput),
    };
    let mut value = serde_json::to_value(schema).unwrap_or_else(|_| json!({ "type": "object" }));
    if let Some(object) = value.as_object_mut() {
        object.remove("$schema");
        object.insert("additionalProperties".into(), Value::Bool(false));
    }
    value
}

#[async_trait]
impl DescriptionGenerator for ChatCompletionsGenerator {
    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GeneratedFields, GenerationError> {
        if !request.images.is_empty() && !self.accepts_images {
            return Err(GenerationError::ModelError(format!(
                "model {} is configured as text-only",
                self.model
            )));
        }

        let payload = self.build_payload(&request);
        let mut builder = self.http.post(&self.endpoint).json(&payload);
        if let Some(token) = self.api_token.as_deref() {
            builder = builder.bearer_auth(token);
        }

        tracing::debug!(
            model = %self.model,
            task = request.task.schema_name(),
            images = request.images.len(),
            "Sending generation request"
        );
        let response = builder.send().await.map_err(|error| {
            if error.is_timeout() {
                GenerationError::Timeout(format!("{} did not answer in time", self.endpoint))
            } else {
                GenerationError::ModelError(format!("failed to reach {}: {error}", self.endpoint))
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let error =
                GenerationError::ModelError(format!("model endpoint returned {status}: {body}"));
            tracing::warn!(error = %error, model = %self.model, "Generation request rejected");
            return Err(error);
        }

        let body: ChatResponse = response.json().await.map_err(|error| {
            GenerationError::ModelError(format!("failed to decode chat response: {error}"))
        })?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| GenerationError::ModelError("model returned no content".into()))?;

        parse_fields(request.task, &content)
    }
}
