use crate::schema::Schema;
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs, ResponseFormat,
        ResponseFormatJsonSchema,
    },
};
use async_trait::async_trait;
use serde_json::Value;
use std::{fmt, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, warn};

/// A text-level repair the model runtime may apply to raw output before
/// parsing it. Returns `None` when it has nothing to change.
pub type TextRepairHook = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Why a model call did not produce a usable object.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model API error: {0}")]
    Api(String),
    #[error("model call timed out after {0:?}")]
    Timeout(Duration),
    #[error("model returned text that is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("model returned an empty response")]
    EmptyResponse,
    #[error("model output failed schema validation with {0} issue(s)")]
    SchemaMismatch(usize),
}

/// A failed structured generation, keeping the raw text when there was one.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct ModelFailure {
    pub raw_text: Option<String>,
    #[source]
    pub error: ModelError,
}

impl ModelFailure {
    pub fn without_text(error: ModelError) -> Self {
        Self {
            raw_text: None,
            error,
        }
    }
}

/// A request for a schema-constrained object.
#[derive(Clone)]
pub struct ObjectRequest {
    pub prompt: String,
    pub schema: Arc<Schema>,
    pub repair_hook: Option<TextRepairHook>,
}

impl fmt::Debug for ObjectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRequest")
            .field("prompt", &self.prompt)
            .field("schema", &self.schema.name())
            .field("repair_hook", &self.repair_hook.is_some())
            .finish()
    }
}

/// The model runtime as seen by the repair pipeline.
///
/// Implementations own provider selection, prompting conventions and
/// transport; the pipeline only hands over a prompt and a schema.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Identifier of the model used for structured generation.
    fn model_id(&self) -> String;

    /// Generates an object constrained by `request.schema`.
    async fn generate_object(&self, request: ObjectRequest) -> Result<Value, ModelFailure>;

    /// Generates free text with a specific model.
    async fn generate_text(&self, model: &str, prompt: &str) -> Result<String, ModelError>;
}

/// Supplies a cheaper model for repacking, when one is configured.
pub trait CheapModelSelector: Send + Sync {
    fn cheap_model(&self) -> Option<String>;
}

/// A selector with a fixed answer, typically taken from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticModelSelector(Option<String>);

impl StaticModelSelector {
    pub fn new(model: Option<String>) -> Self {
        Self(model.filter(|m| !m.trim().is_empty()))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

impl CheapModelSelector for StaticModelSelector {
    fn cheap_model(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Default repair hook: pulls a JSON document out of a markdown code fence
/// or out of surrounding prose.
pub fn strip_code_fences(text: &str) -> Option<String> {
    let trimmed = text.trim();

    if let Some(start) = trimmed.find("```") {
        let after_fence = &trimmed[start + 3..];
        // Skip an info string such as `json`.
        let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after_fence[body_start..];
        let body = match body.find("```") {
            Some(end) => &body[..end],
            None => body,
        };
        let body = body.trim();
        return (!body.is_empty()).then(|| body.to_string());
    }

    let open = trimmed.find(['{', '['])?;
    let close_char = if trimmed[open..].starts_with('{') { '}' } else { ']' };
    let close = trimmed.rfind(close_char)?;
    if close <= open {
        return None;
    }
    let candidate = &trimmed[open..=close];
    (candidate.len() != trimmed.len()).then(|| candidate.to_string())
}

/// Wraps `strip_code_fences` as a hook.
pub fn default_repair_hook() -> TextRepairHook {
    Arc::new(strip_code_fences)
}

/// A `ModelClient` for any OpenAI-compatible chat completions API.
pub struct OpenAICompatibleModel {
    client: Client<OpenAIConfig>,
    model: String,
    timeout: Duration,
}

impl OpenAICompatibleModel {
    /// Creates a new client for an OpenAI-compatible service.
    ///
    /// # Arguments
    ///
    /// * `config` - The configuration for the OpenAI client, including API key and base URL.
    /// * `model` - The model used for structured generation (e.g., "gpt-4o").
    /// * `timeout` - Upper bound on a single call; expiry is an ordinary failure.
    pub fn new(config: OpenAIConfig, model: String, timeout: Duration) -> Self {
        Self {
            client: Client::with_config(config),
            model,
            timeout,
        }
    }

    async fn complete(
        &self,
        model: &str,
        messages: Vec<ChatCompletionRequestMessage>,
        response_format: Option<ResponseFormat>,
    ) -> Result<String, ModelError> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(model).messages(messages);
        if let Some(format) = response_format {
            args.response_format(format);
        }
        let request = args.build().map_err(api_error)?;

        let response = tokio::time::timeout(self.timeout, self.client.chat().create(request))
            .await
            .map_err(|_| ModelError::Timeout(self.timeout))?
            .map_err(api_error)?;

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .filter(|content| !content.trim().is_empty())
            .ok_or(ModelError::EmptyResponse)
    }
}

fn api_error(err: impl Into<anyhow::Error>) -> ModelError {
    ModelError::Api(format!("{:#}", err.into()))
}

/// JSON Schema response format names allow only `[a-zA-Z0-9_-]`.
fn response_format_name(schema: &Schema) -> String {
    let name: String = schema
        .name()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    if name.is_empty() { "output".to_string() } else { name }
}

#[async_trait]
impl ModelClient for OpenAICompatibleModel {
    fn model_id(&self) -> String {
        self.model.clone()
    }

    async fn generate_object(&self, request: ObjectRequest) -> Result<Value, ModelFailure> {
        let messages = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content("Respond with a single JSON document that conforms to the response schema.")
                .build()
                .map_err(|e| ModelFailure::without_text(api_error(e)))?
                .into(),
            ChatCompletionRequestUserMessageArgs::default()
                .content(request.prompt.clone())
                .build()
                .map_err(|e| ModelFailure::without_text(api_error(e)))?
                .into(),
        ];
        let format = ResponseFormat::JsonSchema {
            json_schema: ResponseFormatJsonSchema {
                description: request.schema.description().map(str::to_string),
                name: response_format_name(&request.schema),
                schema: Some(request.schema.to_json_schema()),
                strict: Some(false),
            },
        };

        let text = self
            .complete(&self.model, messages, Some(format))
            .await
            .map_err(ModelFailure::without_text)?;

        let parse_error = match serde_json::from_str::<Value>(&text) {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if let Some(repaired) = request.repair_hook.as_ref().and_then(|hook| hook(&text)) {
            if let Ok(value) = serde_json::from_str::<Value>(&repaired) {
                debug!(model = %self.model, "Repair hook recovered JSON from model output");
                return Ok(value);
            }
        }

        warn!(model = %self.model, error = %parse_error, "Model output is not valid JSON");
        Err(ModelFailure {
            raw_text: Some(text),
            error: ModelError::InvalidJson(parse_error.to_string()),
        })
    }

    async fn generate_text(&self, model: &str, prompt: &str) -> Result<String, ModelError> {
        let messages = vec![
            ChatCompletionRequestUserMessageArgs::default()
                .content(prompt)
                .build()
                .map_err(api_error)?
                .into(),
        ];
        self.complete(model, messages, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_code_fences_with_info_string() {
        let text = "Here you go:\n```json\n{\"a\": 1}\n```\nThanks";
        assert_eq!(strip_code_fences(text).as_deref(), Some("{\"a\": 1}"));
    }

    #[test]
    fn test_strip_surrounding_prose() {
        let text = "Sure! {\"a\": [1, 2]} Hope that helps.";
        assert_eq!(strip_code_fences(text).as_deref(), Some("{\"a\": [1, 2]}"));
        assert_eq!(strip_code_fences("Result: [1, 2]").as_deref(), Some("[1, 2]"));
    }

    #[test]
    fn test_nothing_to_repair() {
        assert_eq!(strip_code_fences("{\"a\": 1}"), None);
        assert_eq!(strip_code_fences("no json here"), None);
        assert_eq!(strip_code_fences("```\n```"), None);
    }

    #[test]
    fn test_static_selector() {
        assert_eq!(
            StaticModelSelector::new(Some("gpt-4o-mini".to_string())).cheap_model(),
            Some("gpt-4o-mini".to_string())
        );
        assert_eq!(StaticModelSelector::new(Some("  ".to_string())).cheap_model(), None);
        assert_eq!(StaticModelSelector::none().cheap_model(), None);
    }

    #[test]
    fn test_response_format_name_is_sanitised() {
        assert_eq!(
            response_format_name(&Schema::new("lesson content.v1")),
            "lesson_content_v1"
        );
        assert_eq!(response_format_name(&Schema::new("")), "output");
    }
}
