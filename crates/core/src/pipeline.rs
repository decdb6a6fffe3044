//! Generation Repair Pipeline
//!
//! Runs one generation request through up to three recovery layers and stops
//! at the first that yields a schema-valid object:
//!
//! 0. direct: the model's structured output validates as-is;
//! 1. coerce: the model's raw text parses as JSON and `SchemaCoercer` repairs it;
//! 2. repack: a distinct, cheaper model reformats the raw text, which is then
//!    parsed and coerced like layer 1.
//!
//! Layers run strictly one after another. Every layer that runs is recorded in
//! the request's `GenerationAttemptLog`, which is finalized once whatever the
//! outcome.

use crate::attempt_log::{AttemptSink, GenerationAttempt, GenerationAttemptLog, Layer};
use crate::coercion::{SchemaCoercer, WrapperKind};
use crate::model::{
    CheapModelSelector, ModelClient, ModelError, ObjectRequest, StaticModelSelector,
    TextRepairHook, default_repair_hook,
};
use crate::schema::{Schema, ValidationIssue};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub request_id: Uuid,
    pub prompt: String,
    pub schema: Arc<Schema>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, schema: Arc<Schema>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            prompt: prompt.into(),
            schema,
        }
    }
}

/// A schema-valid object and the layer that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutput {
    pub request_id: Uuid,
    pub value: Value,
    pub layer: Layer,
}

#[derive(Debug, Error)]
pub enum GenerationError {
    /// Every layer failed; carries the original layer-0 error.
    #[error("generation failed, please retry")]
    Exhausted {
        request_id: Uuid,
        #[source]
        source: ModelError,
    },
}

impl GenerationError {
    pub fn request_id(&self) -> Uuid {
        match self {
            GenerationError::Exhausted { request_id, .. } => *request_id,
        }
    }
}

/// What a parse-and-coerce layer found.
enum Repacked {
    Valid(Value, WrapperKind),
    Invalid {
        wrapper: Option<WrapperKind>,
        issues: Vec<ValidationIssue>,
        error: ModelError,
    },
}

pub struct GenerationRepairPipeline {
    model: Arc<dyn ModelClient>,
    cheap_models: Arc<dyn CheapModelSelector>,
    sink: Arc<dyn AttemptSink>,
    repair_hook: Option<TextRepairHook>,
    coercer: SchemaCoercer,
}

impl GenerationRepairPipeline {
    /// A pipeline with layer 2 disabled and `strip_code_fences` as repair hook.
    pub fn new(model: Arc<dyn ModelClient>, sink: Arc<dyn AttemptSink>) -> Self {
        Self {
            model,
            cheap_models: Arc::new(StaticModelSelector::none()),
            sink,
            repair_hook: Some(default_repair_hook()),
            coercer: SchemaCoercer::new(),
        }
    }

    pub fn with_cheap_models(mut self, selector: Arc<dyn CheapModelSelector>) -> Self {
        self.cheap_models = selector;
        self
    }

    pub fn with_repair_hook(mut self, hook: Option<TextRepairHook>) -> Self {
        self.repair_hook = hook;
        self
    }

    pub async fn run(&self, request: GenerationRequest) -> Result<GenerationOutput, GenerationError> {
        let mut log = GenerationAttemptLog::new(request.request_id, Arc::clone(&self.sink));
        let result = self.run_layers(&request, &mut log).await;
        log.finalize().await;
        result
    }

    async fn run_layers(
        &self,
        request: &GenerationRequest,
        log: &mut GenerationAttemptLog,
    ) -> Result<GenerationOutput, GenerationError> {
        let request_id = request.request_id;
        let schema = request.schema.as_ref();
        let primary = self.model.model_id();
        info!(request_id = %request_id, schema = schema.name(), model = %primary, "Starting generation");

        // Layer 0
        let started = Instant::now();
        let direct = self
            .model
            .generate_object(ObjectRequest {
                prompt: request.prompt.clone(),
                schema: Arc::clone(&request.schema),
                repair_hook: self.repair_hook.clone(),
            })
            .await;
        let (raw_text, direct_error) = match direct {
            Ok(value) => {
                let issues = schema.validate(&value);
                if issues.is_empty() {
                    log.record(
                        GenerationAttempt::new(Layer::Direct, true, started.elapsed())
                            .with_model(primary.as_str()),
                    );
                    return Ok(GenerationOutput {
                        request_id,
                        value,
                        layer: Layer::Direct,
                    });
                }
                let error = ModelError::SchemaMismatch(issues.len());
                let raw_text = serde_json::to_string(&value).ok();
                log.record(
                    GenerationAttempt::new(Layer::Direct, false, started.elapsed())
                        .with_model(primary.as_str())
                        .with_raw_text(raw_text.clone())
                        .with_issues(issues)
                        .with_error(&error),
                );
                (raw_text, error)
            }
            Err(failure) => {
                log.record(
                    GenerationAttempt::new(Layer::Direct, false, started.elapsed())
                        .with_model(primary.as_str())
                        .with_raw_text(failure.raw_text.clone())
                        .with_error(&failure.error),
                );
                (failure.raw_text, failure.error)
            }
        };
        warn!(request_id = %request_id, error = %direct_error, "Direct generation failed validation");

        let exhausted = |source| GenerationError::Exhausted { request_id, source };
        let Some(raw_text) = raw_text else {
            warn!(request_id = %request_id, "No raw text to repair; giving up");
            return Err(exhausted(direct_error));
        };

        // Layer 1
        let started = Instant::now();
        match self.parse_and_coerce(request_id, &raw_text, schema) {
            Repacked::Valid(value, wrapper) => {
                log.record(
                    GenerationAttempt::new(Layer::Coerce, true, started.elapsed())
                        .with_model(primary.as_str())
                        .with_raw_text(Some(raw_text))
                        .with_wrapper(wrapper),
                );
                return Ok(GenerationOutput {
                    request_id,
                    value,
                    layer: Layer::Coerce,
                });
            }
            Repacked::Invalid {
                wrapper,
                issues,
                error,
            } => {
                let mut attempt = GenerationAttempt::new(Layer::Coerce, false, started.elapsed())
                    .with_model(primary.as_str())
                    .with_raw_text(Some(raw_text.clone()))
                    .with_issues(issues)
                    .with_error(error);
                attempt.wrapper_detected = wrapper;
                log.record(attempt);
            }
        }

        // Layer 2
        let cheap_model = match self.cheap_models.cheap_model() {
            Some(model) if model != primary => model,
            Some(_) => {
                debug!(request_id = %request_id, "Cheap model is the primary model; skipping repack");
                return Err(exhausted(direct_error));
            }
            None => {
                debug!(request_id = %request_id, "No cheap model configured; skipping repack");
                return Err(exhausted(direct_error));
            }
        };

        let started = Instant::now();
        info!(request_id = %request_id, model = %cheap_model, "Repacking output with cheap model");
        let repacked = match self
            .model
            .generate_text(&cheap_model, &repack_prompt(schema, &raw_text))
            .await
        {
            Ok(text) => text,
            Err(e) => {
                warn!(request_id = %request_id, model = %cheap_model, error = %e, "Repack call failed");
                log.record(
                    GenerationAttempt::new(Layer::Repack, false, started.elapsed())
                        .with_model(cheap_model)
                        .with_error(e),
                );
                return Err(exhausted(direct_error));
            }
        };

        match self.parse_and_coerce(request_id, &repacked, schema) {
            Repacked::Valid(value, wrapper) => {
                log.record(
                    GenerationAttempt::new(Layer::Repack, true, started.elapsed())
                        .with_model(cheap_model)
                        .with_raw_text(Some(repacked))
                        .with_wrapper(wrapper),
                );
                Ok(GenerationOutput {
                    request_id,
                    value,
                    layer: Layer::Repack,
                })
            }
            Repacked::Invalid {
                wrapper,
                issues,
                error,
            } => {
                let mut attempt = GenerationAttempt::new(Layer::Repack, false, started.elapsed())
                    .with_model(cheap_model)
                    .with_raw_text(Some(repacked))
                    .with_issues(issues)
                    .with_error(error);
                attempt.wrapper_detected = wrapper;
                log.record(attempt);
                warn!(request_id = %request_id, "All generation layers failed");
                Err(exhausted(direct_error))
            }
        }
    }

    /// Strict parse followed by coercion. Text that is not JSON fails here
    /// without any coercion being attempted.
    fn parse_and_coerce(&self, request_id: Uuid, text: &str, schema: &Schema) -> Repacked {
        let parsed = match serde_json::from_str::<Value>(text.trim()) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(request_id = %request_id, error = %e, "Raw text is not valid JSON");
                return Repacked::Invalid {
                    wrapper: None,
                    issues: Vec::new(),
                    error: ModelError::InvalidJson(e.to_string()),
                };
            }
        };

        let mut issues = Vec::new();
        let outcome = self.coercer.coerce(parsed, schema, &mut issues);
        for repair in &outcome.repairs {
            debug!(request_id = %request_id, repair = %repair, "Coerced field");
        }
        match outcome.value {
            Some(value) => Repacked::Valid(value, outcome.wrapper),
            None => Repacked::Invalid {
                wrapper: Some(outcome.wrapper),
                error: ModelError::SchemaMismatch(issues.len()),
                issues,
            },
        }
    }
}

fn repack_prompt(schema: &Schema, raw_text: &str) -> String {
    let schema_json = serde_json::to_string_pretty(&schema.to_json_schema())
        .unwrap_or_else(|_| schema.name().to_string());
    format!(
        "Reformat the following content so that it is a single JSON document \
         conforming to this JSON Schema. Keep the content itself unchanged. \
         Respond with the JSON only, without markdown fences or commentary.\n\n\
         JSON Schema:\n{schema_json}\n\nContent:\n{raw_text}"
    )
}
