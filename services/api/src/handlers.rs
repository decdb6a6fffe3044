//! Axum Handlers for the REST API
//!
//! This module contains the logic for handling HTTP requests for lesson and
//! visualization generation. It uses `utoipa` doc comments to generate
//! OpenAPI documentation.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use lessonforge_core::{
    in_flight::AlreadyGenerating, lesson::parse_sections, pipeline::GenerationError,
};
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::{
    models::{
        AttemptLogResponse, AttemptResponse, ErrorResponse, GenerateLessonPayload, LessonResponse,
        RegenerateVisualizationPayload, ValidateSectionsPayload, ValidateSectionsResponse,
        VisualizationResponse,
    },
    prompts::{LESSON_PROMPT, VISUALIZATION_PROMPT},
    state::AppState,
};

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unprocessable(String),
    GenerationFailed(GenerationError),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
            ApiError::Conflict(message) => {
                (StatusCode::CONFLICT, Json(ErrorResponse { message })).into_response()
            }
            ApiError::Unprocessable(message) => {
                (StatusCode::UNPROCESSABLE_ENTITY, Json(ErrorResponse { message })).into_response()
            }
            ApiError::GenerationFailed(err) => {
                let request_id = err.request_id();
                let GenerationError::Exhausted { source, .. } = &err;
                warn!(request_id = %request_id, cause = %source, "Generation exhausted all layers");
                let message = err.to_string();
                (StatusCode::BAD_GATEWAY, Json(ErrorResponse { message })).into_response()
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

impl ApiError {
    fn generation(err: GenerationError) -> Self {
        Self::GenerationFailed(err)
    }

    fn already_generating(err: AlreadyGenerating) -> Self {
        Self::Conflict(err.to_string())
    }
}

fn require_non_blank(field: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::BadRequest(format!("{field} must not be empty")));
    }
    Ok(())
}

/// Generate the content of a lesson.
#[utoipa::path(
    post,
    path = "/lessons/generate",
    request_body = GenerateLessonPayload,
    responses(
        (status = 200, description = "Validated lesson content", body = LessonResponse),
        (status = 400, description = "Bad request", body = ErrorResponse),
        (status = 409, description = "A generation for this target is already running", body = ErrorResponse),
        (status = 502, description = "Generation failed, please retry", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn generate_lesson(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<GenerateLessonPayload>,
) -> Result<Json<LessonResponse>, ApiError> {
    require_non_blank("target_id", &payload.target_id)?;
    require_non_blank("topic", &payload.topic)?;

    let _claim = state
        .locks
        .try_claim(&format!("lesson:{}", payload.target_id))
        .map_err(ApiError::already_generating)?;

    let prompt = state.prompts.render(
        LESSON_PROMPT,
        &[
            ("topic", payload.topic.as_str()),
            ("description", payload.description.as_deref().unwrap_or("")),
        ],
    )?;
    let content = state
        .generator
        .generate_lesson(&prompt)
        .await
        .map_err(ApiError::generation)?;

    Ok(Json(LessonResponse::from(content)))
}

/// Regenerate a single visualization section.
#[utoipa::path(
    post,
    path = "/visualizations/regenerate",
    request_body = RegenerateVisualizationPayload,
    responses(
        (status = 200, description = "A validated visualization section", body = VisualizationResponse),
        (status = 400, description = "Bad request", body = ErrorResponse),
        (status = 409, description = "A generation for this target is already running", body = ErrorResponse),
        (status = 422, description = "The regenerated visualization was rejected", body = ErrorResponse),
        (status = 502, description = "Generation failed, please retry", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn regenerate_visualization(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RegenerateVisualizationPayload>,
) -> Result<Json<VisualizationResponse>, ApiError> {
    require_non_blank("target_id", &payload.target_id)?;
    require_non_blank("description", &payload.description)?;

    let _claim = state
        .locks
        .try_claim(&format!("visualization:{}", payload.target_id))
        .map_err(ApiError::already_generating)?;

    let prompt = state.prompts.render(
        VISUALIZATION_PROMPT,
        &[
            ("description", payload.description.as_str()),
            ("topic", payload.topic.as_deref().unwrap_or("")),
        ],
    )?;
    let regenerated = state
        .generator
        .regenerate_visualization(&prompt)
        .await
        .map_err(ApiError::generation)?;

    let warnings = regenerated.warnings.join("; ");
    VisualizationResponse::from_regenerated(regenerated)
        .map(Json)
        .ok_or(ApiError::Unprocessable(warnings))
}

/// Validate content sections without generating anything.
#[utoipa::path(
    post,
    path = "/sections/validate",
    request_body = ValidateSectionsPayload,
    responses(
        (status = 200, description = "Sections safe to render, with warnings", body = ValidateSectionsResponse)
    )
)]
pub async fn validate_sections(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ValidateSectionsPayload>,
) -> Json<ValidateSectionsResponse> {
    let (sections, mut warnings) = parse_sections(payload.sections);
    let mut validated = state.generator.validator().validate(sections);
    warnings.append(&mut validated.warnings);
    validated.warnings = warnings;
    Json(ValidateSectionsResponse::from(validated))
}

/// Get the attempt log of a finished generation request.
#[utoipa::path(
    get,
    path = "/generations/{request_id}/attempts",
    responses(
        (status = 200, description = "Attempt log", body = AttemptLogResponse),
        (status = 404, description = "No log for this request", body = ErrorResponse)
    ),
    params(
        ("request_id" = Uuid, Path, description = "Generation request ID")
    )
)]
pub async fn get_attempts(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<Uuid>,
) -> Result<Json<AttemptLogResponse>, ApiError> {
    let attempts = state.attempts.get(request_id).await.ok_or_else(|| {
        ApiError::NotFound(format!("No attempt log for request '{}'", request_id))
    })?;

    Ok(Json(AttemptLogResponse {
        request_id,
        attempts: attempts.into_iter().map(AttemptResponse::from).collect(),
    }))
}
