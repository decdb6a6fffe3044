//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the REST API and OpenAPI documentation.

use crate::{
    handlers,
    models::{
        AttemptLogResponse, AttemptResponse, ErrorResponse, GenerateLessonPayload, IssueResponse,
        LessonResponse, RegenerateVisualizationPayload, ValidateSectionsPayload,
        ValidateSectionsResponse, VisualizationResponse,
    },
    state::AppState,
};

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::generate_lesson,
        handlers::regenerate_visualization,
        handlers::validate_sections,
        handlers::get_attempts,
    ),
    components(
        schemas(
            GenerateLessonPayload, RegenerateVisualizationPayload, ValidateSectionsPayload,
            LessonResponse, VisualizationResponse, ValidateSectionsResponse,
            AttemptLogResponse, AttemptResponse, IssueResponse, ErrorResponse
        )
    ),
    tags(
        (name = "LessonForge API", description = "Validated lesson content generation")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .route("/lessons/generate", post(handlers::generate_lesson))
        .route(
            "/visualizations/regenerate",
            post(handlers::regenerate_visualization),
        )
        .route("/sections/validate", post(handlers::validate_sections))
        .route(
            "/generations/{request_id}/attempts",
            get(handlers::get_attempts),
        )
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompts::{LESSON_PROMPT, Prompts, VISUALIZATION_PROMPT};
    use async_trait::async_trait;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use lessonforge_core::model::{ModelClient, ModelError, ModelFailure, ObjectRequest};
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::time::Duration;
    use tower::ServiceExt;

    /// Answers every structured request with the same object, after an
    /// optional delay.
    struct FixedModel {
        answer: Result<Value, String>,
        delay: Duration,
    }

    #[async_trait]
    impl ModelClient for FixedModel {
        fn model_id(&self) -> String {
            "test-model".to_string()
        }

        async fn generate_object(&self, _request: ObjectRequest) -> Result<Value, ModelFailure> {
            tokio::time::sleep(self.delay).await;
            self.answer.clone().map_err(|raw| ModelFailure {
                raw_text: Some(raw.clone()),
                error: ModelError::InvalidJson(raw),
            })
        }

        async fn generate_text(&self, _model: &str, _prompt: &str) -> Result<String, ModelError> {
            Err(ModelError::EmptyResponse)
        }
    }

    fn app(answer: Result<Value, String>, delay: Duration) -> (Router, Arc<AppState>) {
        let prompts = Prompts::from_templates(HashMap::from([
            (LESSON_PROMPT.to_string(), "Teach {topic}. {description}".to_string()),
            (VISUALIZATION_PROMPT.to_string(), "Draw {description}".to_string()),
        ]));
        let state = Arc::new(AppState::new(
            Arc::new(FixedModel { answer, delay }),
            None,
            prompts,
            Duration::from_secs(600),
        ));
        (create_router(state.clone()), state)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_generate_lesson_and_fetch_attempts() {
        let (app, _) = app(
            Ok(json!({
                "title": "Parabolas",
                "sections": [
                    { "type": "text", "content": "A parabola is a curve." },
                    { "type": "visualization", "vizType": "function_plot",
                      "spec": { "functions": [{ "expression": "x+y" }] } }
                ]
            })),
            Duration::ZERO,
        );

        let response = app
            .clone()
            .oneshot(post_json(
                "/lessons/generate",
                json!({ "target_id": "lesson-1", "topic": "Parabolas" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let lesson = body_json(response).await;
        assert_eq!(lesson["layer"], json!(0));
        assert_eq!(lesson["sections"].as_array().unwrap().len(), 1);
        assert_eq!(lesson["warnings"].as_array().unwrap().len(), 1);

        let request_id = lesson["request_id"].as_str().unwrap();
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/generations/{request_id}/attempts"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let log = body_json(response).await;
        assert_eq!(log["attempts"][0]["succeeded"], json!(true));
    }

    #[tokio::test]
    async fn test_terminal_failure_is_bad_gateway() {
        let (app, _) = app(Err("not json at all".to_string()), Duration::ZERO);
        let response = app
            .oneshot(post_json(
                "/lessons/generate",
                json!({ "target_id": "lesson-1", "topic": "Limits" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            body_json(response).await,
            json!({ "message": "generation failed, please retry" })
        );
    }

    #[tokio::test]
    async fn test_concurrent_generation_for_same_target_conflicts() {
        let (app, state) = app(
            Ok(json!({ "title": "Slow", "sections": [] })),
            Duration::from_millis(200),
        );
        let payload = json!({ "target_id": "lesson-1", "topic": "Limits" });

        let first = tokio::spawn(app.clone().oneshot(post_json("/lessons/generate", payload.clone())));
        for _ in 0..100 {
            if state.locks.is_claimed("lesson:lesson-1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let second = app
            .oneshot(post_json("/lessons/generate", payload))
            .await
            .unwrap();

        assert_eq!(second.status(), StatusCode::CONFLICT);
        assert_eq!(first.await.unwrap().unwrap().status(), StatusCode::OK);
        assert!(!state.locks.is_claimed("lesson:lesson-1"));
    }

    #[tokio::test]
    async fn test_rejected_visualization_is_unprocessable() {
        let (app, _) = app(
            Ok(json!({ "vizType": "function_plot", "spec": { "functions": ["process.exit()"] } })),
            Duration::ZERO,
        );
        let response = app
            .oneshot(post_json(
                "/visualizations/regenerate",
                json!({ "target_id": "viz-1", "description": "a plot" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response).await;
        assert!(body["message"].as_str().unwrap().contains("function_plot"));
    }

    #[tokio::test]
    async fn test_unknown_regenerated_kind_is_unprocessable() {
        let (app, _) = app(
            Ok(json!({ "vizType": "pie_chart", "spec": {} })),
            Duration::ZERO,
        );
        let response = app
            .oneshot(post_json(
                "/visualizations/regenerate",
                json!({ "target_id": "viz-1", "description": "budget shares" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response).await;
        assert!(body["message"].as_str().unwrap().contains("pie_chart"));
    }

    #[tokio::test]
    async fn test_validate_sections() {
        let (app, _) = app(Err(String::new()), Duration::ZERO);
        let response = app
            .oneshot(post_json(
                "/sections/validate",
                json!({ "sections": [
                    { "type": "visualization", "vizType": "vector_field",
                      "spec": { "vectors": [{ "origin": [0, 0], "direction": [1, 1] }] } },
                    { "type": "visualization", "vizType": "vector_field",
                      "spec": { "vectors": [{ "origin": [0], "direction": [1, 1] }] } },
                    { "type": "poem", "content": "Roses are red" }
                ]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["sections"].as_array().unwrap().len(), 2);
        assert_eq!(body["warnings"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_blank_topic_is_bad_request() {
        let (app, _) = app(Err(String::new()), Duration::ZERO);
        let response = app
            .oneshot(post_json(
                "/lessons/generate",
                json!({ "target_id": "lesson-1", "topic": "  " }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_attempt_log_is_not_found() {
        let (app, _) = app(Err(String::new()), Duration::ZERO);
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/generations/{}/attempts", uuid::Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
