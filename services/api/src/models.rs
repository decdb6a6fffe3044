//! API Models
//!
//! Request and response bodies of the REST API, documented with `utoipa`.
//! Content sections keep the wire shape the renderer consumes and are
//! described as free-form objects in the OpenAPI document.

use chrono::{DateTime, Utc};
use lessonforge_core::{
    attempt_log::GenerationAttempt,
    content::ContentSection,
    lesson::{LessonContent, RegeneratedVisualization},
    schema::{ValidationIssue, format_path},
    visualization::ValidatedContent,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Deserialize, ToSchema)]
pub struct GenerateLessonPayload {
    /// Identifies what is being generated; one generation per target at a time.
    #[schema(example = "course-12/lesson-3")]
    pub target_id: String,
    #[schema(example = "The derivative as a rate of change")]
    pub topic: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct RegenerateVisualizationPayload {
    #[schema(example = "course-12/lesson-3/section-4")]
    pub target_id: String,
    #[schema(example = "A plot of sin(x) and its derivative")]
    pub description: String,
    #[serde(default)]
    pub topic: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct ValidateSectionsPayload {
    #[schema(value_type = Vec<Object>)]
    pub sections: Vec<Value>,
}

#[derive(Serialize, ToSchema, Debug)]
pub struct LessonResponse {
    #[schema(value_type = String, format = Uuid)]
    pub request_id: Uuid,
    pub title: String,
    #[schema(value_type = Vec<Object>)]
    pub sections: Vec<ContentSection>,
    pub warnings: Vec<String>,
    /// Repair layer that produced the content (0 direct, 1 coerced, 2 repacked).
    pub layer: u8,
}

impl From<LessonContent> for LessonResponse {
    fn from(content: LessonContent) -> Self {
        Self {
            request_id: content.request_id,
            title: content.title,
            sections: content.sections,
            warnings: content.warnings,
            layer: content.layer.into(),
        }
    }
}

#[derive(Serialize, ToSchema, Debug)]
pub struct VisualizationResponse {
    #[schema(value_type = String, format = Uuid)]
    pub request_id: Uuid,
    #[schema(value_type = Object)]
    pub section: ContentSection,
    pub warnings: Vec<String>,
    pub layer: u8,
}

impl VisualizationResponse {
    /// `None` when the regenerated section was rejected.
    pub fn from_regenerated(regenerated: RegeneratedVisualization) -> Option<Self> {
        Some(Self {
            request_id: regenerated.request_id,
            section: regenerated.section?,
            warnings: regenerated.warnings,
            layer: regenerated.layer.into(),
        })
    }
}

#[derive(Serialize, ToSchema, Debug)]
pub struct ValidateSectionsResponse {
    #[schema(value_type = Vec<Object>)]
    pub sections: Vec<ContentSection>,
    pub warnings: Vec<String>,
}

impl From<ValidatedContent> for ValidateSectionsResponse {
    fn from(validated: ValidatedContent) -> Self {
        Self {
            sections: validated.sections,
            warnings: validated.warnings,
        }
    }
}

#[derive(Serialize, ToSchema, Debug, PartialEq)]
pub struct IssueResponse {
    #[schema(example = "$.sections[1].type")]
    pub path: String,
    pub message: String,
    pub observed_kind: Option<String>,
    pub expected_kind: String,
}

impl From<ValidationIssue> for IssueResponse {
    fn from(issue: ValidationIssue) -> Self {
        Self {
            path: format_path(&issue.path),
            message: issue.message,
            observed_kind: issue.observed_kind.map(|k| k.to_string()),
            expected_kind: issue.expected_kind,
        }
    }
}

#[derive(Serialize, ToSchema, Debug)]
pub struct AttemptResponse {
    pub layer: u8,
    pub succeeded: bool,
    pub raw_text: Option<String>,
    #[schema(example = "parameter")]
    pub wrapper_detected: Option<String>,
    pub issues: Vec<IssueResponse>,
    pub elapsed_ms: u64,
    pub model: Option<String>,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl From<GenerationAttempt> for AttemptResponse {
    fn from(attempt: GenerationAttempt) -> Self {
        Self {
            layer: attempt.layer.into(),
            succeeded: attempt.succeeded,
            raw_text: attempt.raw_text,
            wrapper_detected: attempt.wrapper_detected.map(|w| w.to_string()),
            issues: attempt.issues.into_iter().map(IssueResponse::from).collect(),
            elapsed_ms: attempt.elapsed_ms,
            model: attempt.model,
            error: attempt.error,
            recorded_at: attempt.recorded_at,
        }
    }
}

#[derive(Serialize, ToSchema, Debug)]
pub struct AttemptLogResponse {
    #[schema(value_type = String, format = Uuid)]
    pub request_id: Uuid,
    pub attempts: Vec<AttemptResponse>,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}
