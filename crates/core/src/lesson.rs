//! Lesson Generation
//!
//! Schemas for lesson content and single visualizations, and the glue that
//! runs a generated object through the content validator before anything
//! reaches a renderer.

use crate::attempt_log::Layer;
use crate::content::{ContentSection, TextSection, VisualizationSection, VizKind};
use crate::pipeline::{GenerationError, GenerationRepairPipeline, GenerationRequest};
use crate::schema::{FieldKind, Schema};
use crate::visualization::VisualizationValidator;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const SECTION_TYPES: [&str; 6] = [
    "text",
    "math",
    "definition",
    "theorem",
    "code_block",
    "visualization",
];

/// Section and visualization kinds are tags rather than enums: an unknown
/// kind must reach `parse_sections` and the validator, which drop or
/// downgrade that one section instead of failing the whole generation.
fn viz_kind_field() -> FieldKind {
    FieldKind::tag(VizKind::ALL.iter().map(|kind| kind.as_str()))
}

/// One content section as the model is asked to produce it.
pub fn section_schema() -> Schema {
    let text = || FieldKind::String;
    Schema::new("content_section")
        .required("type", FieldKind::tag(SECTION_TYPES))
        .optional("title", text())
        .optional("content", text())
        .optional("latex", text())
        .optional("explanation", text())
        .optional("term", text())
        .optional("statement", text())
        .optional("proof", text())
        .optional("language", text())
        .optional("code", text())
        .optional("vizType", viz_kind_field())
        .optional("description", text())
        .optional("spec", FieldKind::Any)
}

pub fn lesson_schema() -> Schema {
    Schema::new("lesson_content")
        .with_description("A lesson: a title and an ordered list of content sections.")
        .required("title", FieldKind::String)
        .required(
            "sections",
            FieldKind::array_of(FieldKind::Object(section_schema())),
        )
}

pub fn visualization_schema() -> Schema {
    Schema::new("visualization")
        .with_description("A single interactive visualization section.")
        .required("vizType", viz_kind_field())
        .optional("title", FieldKind::String)
        .optional("description", FieldKind::String)
        .required("spec", FieldKind::Any)
}

/// Reads raw section objects one by one, so one unreadable section does not
/// cost the whole lesson. Unknown section types become text when they carry
/// a `content` string.
pub fn parse_sections(raw: Vec<Value>) -> (Vec<ContentSection>, Vec<String>) {
    let mut sections = Vec::with_capacity(raw.len());
    let mut warnings = Vec::new();

    for (index, value) in raw.into_iter().enumerate() {
        let section_type = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let content = value
            .get("content")
            .and_then(Value::as_str)
            .filter(|c| !c.trim().is_empty())
            .map(str::to_string);
        let title = value.get("title").and_then(Value::as_str).map(str::to_string);

        match serde_json::from_value::<ContentSection>(value) {
            Ok(section) => sections.push(section),
            Err(e) => match content {
                Some(content) => {
                    warn!(index, section_type = %section_type, error = %e, "Reading section as text");
                    warnings.push(format!(
                        "Converted section of unknown type '{section_type}' to text"
                    ));
                    sections.push(ContentSection::Text(TextSection { title, content }));
                }
                None => {
                    warn!(index, section_type = %section_type, error = %e, "Dropping unreadable section");
                    warnings.push(format!(
                        "Removed unreadable section of type '{section_type}'"
                    ));
                }
            },
        }
    }

    (sections, warnings)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonContent {
    pub request_id: Uuid,
    pub title: String,
    pub sections: Vec<ContentSection>,
    pub warnings: Vec<String>,
    pub layer: Layer,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegeneratedVisualization {
    pub request_id: Uuid,
    /// `None` when the regenerated section did not survive validation.
    pub section: Option<ContentSection>,
    pub warnings: Vec<String>,
    pub layer: Layer,
}

pub struct LessonGenerator {
    pipeline: Arc<GenerationRepairPipeline>,
    validator: VisualizationValidator,
    lesson_schema: Arc<Schema>,
    visualization_schema: Arc<Schema>,
}

impl LessonGenerator {
    pub fn new(pipeline: Arc<GenerationRepairPipeline>) -> Self {
        Self {
            pipeline,
            validator: VisualizationValidator::new(),
            lesson_schema: Arc::new(lesson_schema()),
            visualization_schema: Arc::new(visualization_schema()),
        }
    }

    pub fn validator(&self) -> &VisualizationValidator {
        &self.validator
    }

    pub async fn generate_lesson(&self, prompt: &str) -> Result<LessonContent, GenerationError> {
        let request = GenerationRequest::new(prompt, Arc::clone(&self.lesson_schema));
        let output = self.pipeline.run(request).await?;

        let mut object = match output.value {
            Value::Object(map) => map,
            _ => Default::default(),
        };
        let title = object
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let raw_sections = match object.remove("sections") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        };

        let (sections, mut warnings) = parse_sections(raw_sections);
        let validated = self.validator.validate(sections);
        warnings.extend(validated.warnings);
        info!(
            request_id = %output.request_id,
            sections = validated.sections.len(),
            warnings = warnings.len(),
            "Lesson content generated"
        );

        Ok(LessonContent {
            request_id: output.request_id,
            title,
            sections: validated.sections,
            warnings,
            layer: output.layer,
        })
    }

    /// Regenerates one visualization and validates it on its own.
    pub async fn regenerate_visualization(
        &self,
        prompt: &str,
    ) -> Result<RegeneratedVisualization, GenerationError> {
        let request = GenerationRequest::new(prompt, Arc::clone(&self.visualization_schema));
        let output = self.pipeline.run(request).await?;

        let (section, warnings) =
            match serde_json::from_value::<VisualizationSection>(output.value) {
                Ok(section) => {
                    let mut validated = self
                        .validator
                        .validate(vec![ContentSection::Visualization(section)]);
                    (validated.sections.pop(), validated.warnings)
                }
                Err(e) => (None, vec![format!("Removed unreadable visualization: {e}")]),
            };

        Ok(RegeneratedVisualization {
            request_id: output.request_id,
            section,
            warnings,
            layer: output.layer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempt_log::MemoryAttemptSink;
    use crate::model::{MockModelClient, ModelError, ModelFailure};
    use serde_json::json;

    fn generator(object: Value) -> LessonGenerator {
        let mut model = MockModelClient::new();
        model.expect_model_id().return_const("gpt-4o".to_string());
        model
            .expect_generate_object()
            .times(1)
            .returning(move |_| Ok(object.clone()));
        let pipeline = GenerationRepairPipeline::new(
            Arc::new(model),
            Arc::new(MemoryAttemptSink::new(8)),
        );
        LessonGenerator::new(Arc::new(pipeline))
    }

    #[test]
    fn test_parse_sections_is_lenient() {
        let (sections, warnings) = parse_sections(vec![
            json!({ "type": "text", "content": "Hello" }),
            json!({ "type": "quiz", "title": "Check", "content": "What is 1+1?" }),
            json!({ "type": "quiz" }),
            json!("not a section"),
        ]);

        assert_eq!(sections.len(), 2);
        assert_eq!(
            sections[1],
            ContentSection::Text(TextSection {
                title: Some("Check".to_string()),
                content: "What is 1+1?".to_string(),
            })
        );
        assert_eq!(
            warnings,
            vec![
                "Converted section of unknown type 'quiz' to text",
                "Removed unreadable section of type 'quiz'",
                "Removed unreadable section of type ''",
            ]
        );
    }

    #[test]
    fn test_lesson_schema_leaves_kinds_to_the_validator() {
        let lesson = json!({
            "title": "Derivatives",
            "sections": [
                { "type": "text", "content": "Rates of change." },
                { "type": "visualization", "vizType": "function_plot",
                  "spec": { "functions": ["x^2"] } },
                { "type": "visualization", "vizType": "pie_chart" },
                { "type": "quiz", "content": "Why?" }
            ]
        });
        assert!(lesson_schema().validate(&lesson).is_empty());
    }

    #[tokio::test]
    async fn test_generate_lesson_validates_sections() {
        let generator = generator(json!({
            "title": "Derivatives",
            "sections": [
                { "type": "text", "content": "Rates of change." },
                { "type": "visualization", "vizType": "function_plot",
                  "spec": { "functions": [{ "expression": "x+y" }] } }
            ]
        }));

        let lesson = generator.generate_lesson("Teach derivatives").await.unwrap();
        assert_eq!(lesson.title, "Derivatives");
        assert_eq!(lesson.layer, Layer::Direct);
        assert_eq!(lesson.sections.len(), 1);
        assert_eq!(lesson.warnings.len(), 1);
        assert!(lesson.warnings[0].contains("function_plot"));
    }

    #[tokio::test]
    async fn test_unknown_viz_kind_costs_only_that_section() {
        let generator = generator(json!({
            "title": "Statistics",
            "sections": [
                { "type": "text", "content": "Shares of a whole." },
                { "type": "visualization", "vizType": "pie_chart", "spec": {} }
            ]
        }));

        let lesson = generator.generate_lesson("Teach proportions").await.unwrap();
        assert_eq!(lesson.layer, Layer::Direct);
        assert_eq!(lesson.sections.len(), 1);
        assert_eq!(lesson.sections[0].kind(), "text");
        assert_eq!(lesson.warnings.len(), 1);
        assert!(lesson.warnings[0].contains("pie_chart"));
    }

    #[tokio::test]
    async fn test_unknown_section_type_is_read_as_text() {
        let generator = generator(json!({
            "title": "Arithmetic",
            "sections": [
                { "type": "text", "content": "Adding numbers." },
                { "type": "quiz", "content": "What is 1+1?" }
            ]
        }));

        let lesson = generator.generate_lesson("Teach addition").await.unwrap();
        assert_eq!(lesson.sections.len(), 2);
        assert_eq!(
            lesson.sections[1],
            ContentSection::Text(TextSection {
                title: None,
                content: "What is 1+1?".to_string(),
            })
        );
        assert_eq!(
            lesson.warnings,
            vec!["Converted section of unknown type 'quiz' to text"]
        );
    }

    #[tokio::test]
    async fn test_regenerated_unknown_kind_has_no_section() {
        let generator = generator(json!({ "vizType": "pie_chart", "spec": {} }));
        let regenerated = generator
            .regenerate_visualization("Shares of a budget")
            .await
            .unwrap();
        assert!(regenerated.section.is_none());
        assert_eq!(regenerated.warnings.len(), 1);
        assert!(regenerated.warnings[0].contains("pie_chart"));
    }

    #[tokio::test]
    async fn test_regenerate_visualization() {
        let generator = generator(json!({
            "vizType": "vector_field",
            "title": "Rotation",
            "spec": { "fieldFunction": "[-y, x]" }
        }));
        let regenerated = generator
            .regenerate_visualization("A rotational field")
            .await
            .unwrap();
        assert!(regenerated.warnings.is_empty());
        assert_eq!(regenerated.section.map(|s| s.kind()), Some("visualization"));
    }

    #[tokio::test]
    async fn test_rejected_regeneration_has_no_section() {
        let generator = generator(json!({
            "vizType": "function_plot",
            "spec": { "functions": ["window.alert(1)"] }
        }));
        let regenerated = generator
            .regenerate_visualization("Plot something")
            .await
            .unwrap();
        assert!(regenerated.section.is_none());
        assert_eq!(regenerated.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_failure_propagates() {
        let mut model = MockModelClient::new();
        model.expect_model_id().return_const("gpt-4o".to_string());
        model.expect_generate_object().times(1).returning(|_| {
            Err(ModelFailure::without_text(ModelError::EmptyResponse))
        });
        let pipeline = GenerationRepairPipeline::new(
            Arc::new(model),
            Arc::new(MemoryAttemptSink::new(8)),
        );
        let err = LessonGenerator::new(Arc::new(pipeline))
            .generate_lesson("Teach limits")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "generation failed, please retry");
    }
}
