//! Visualization Validator
//!
//! Walks generated content sections and guarantees that whatever it returns
//! can be handed to the renderer: every section satisfies its tag's required
//! fields and every visualization expression compiles and evaluates. Sections
//! that fail are downgraded to text when they carry salvageable prose, or
//! dropped; each removal produces one user-facing warning.

use crate::content::{
    ContentSection, FieldVector, FunctionPlotSpec, SurfaceSpec, TextSection, VectorFieldSpec,
    VisualizationSection, VizKind,
};
use crate::expression::{CompileError, compile};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

/// Sections safe to render, plus the notices produced while cleaning them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidatedContent {
    pub sections: Vec<ContentSection>,
    pub warnings: Vec<String>,
}

/// Why a visualization section cannot be rendered.
#[derive(Debug, Error)]
pub enum VisualizationRejection {
    #[error("unrecognized visualization type '{0}'")]
    UnknownKind(String),
    #[error("spec is malformed: {0}")]
    MalformedSpec(String),
    #[error("expression '{expression}' is invalid: {source}")]
    Expression {
        expression: String,
        #[source]
        source: CompileError,
    },
    #[error("field function '{0}' is not of the form [dx, dy]")]
    FieldFunctionShape(String),
    #[error("vector {index} is malformed: {reason}")]
    MalformedVector { index: usize, reason: String },
}

/// Stateless; safe to share between any number of concurrent requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct VisualizationValidator;

impl VisualizationValidator {
    pub fn new() -> Self {
        Self
    }

    /// Cleans `sections`, preserving the order of everything kept.
    pub fn validate(&self, sections: Vec<ContentSection>) -> ValidatedContent {
        let mut cleaned = ValidatedContent {
            sections: Vec::with_capacity(sections.len()),
            warnings: Vec::new(),
        };

        for section in sections {
            if let ContentSection::Visualization(viz) = &section {
                match self.check_visualization(viz) {
                    Ok(()) => cleaned.sections.push(section),
                    Err(rejection) => {
                        let warning = rejection_warning(viz, &rejection);
                        warn!(viz_type = %viz.viz_type, reason = %rejection, "Dropping visualization section");
                        cleaned.warnings.push(warning);
                    }
                }
                continue;
            }

            let Some(missing) = missing_required_field(&section) else {
                cleaned.sections.push(section);
                continue;
            };
            let kind = section.kind();
            match section.salvage_text() {
                Some(content) => {
                    warn!(section = kind, missing, "Downgrading section to text");
                    cleaned.warnings.push(format!(
                        "Converted incomplete {kind} section to text: missing {missing}"
                    ));
                    cleaned.sections.push(ContentSection::Text(TextSection {
                        title: section.title().map(str::to_string),
                        content,
                    }));
                }
                None => {
                    warn!(section = kind, missing, "Dropping section");
                    cleaned
                        .warnings
                        .push(format!("Removed incomplete {kind} section: missing {missing}"));
                }
            }
        }

        cleaned
    }

    /// Checks one visualization. A spec is accepted whole or not at all.
    pub fn check_visualization(
        &self,
        section: &VisualizationSection,
    ) -> Result<(), VisualizationRejection> {
        let kind = VizKind::from_tag(&section.viz_type)
            .ok_or_else(|| VisualizationRejection::UnknownKind(section.viz_type.clone()))?;
        let spec = match &section.spec {
            None | Some(Value::Null) => return Ok(()),
            Some(spec) => spec,
        };

        match kind {
            VizKind::FunctionPlot => check_function_plot(spec),
            VizKind::VectorField => check_vector_field(spec),
            VizKind::Surface3d | VizKind::ParametricPlot => check_surface(spec),
            VizKind::Geometry | VizKind::Manifold => Ok(()),
        }
    }
}

fn rejection_warning(section: &VisualizationSection, rejection: &VisualizationRejection) -> String {
    let title = section
        .title
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| format!(" \"{t}\""))
        .unwrap_or_default();
    match rejection {
        VisualizationRejection::UnknownKind(_) => format!("Removed visualization{title}: {rejection}"),
        _ => format!(
            "Removed malformed {} visualization{title}: {rejection}",
            section.viz_type.trim()
        ),
    }
}

fn missing_required_field(section: &ContentSection) -> Option<&'static str> {
    let blank = |s: &str| s.trim().is_empty();
    match section {
        ContentSection::Text(s) if blank(&s.content) => Some("content"),
        ContentSection::Math(s) if blank(&s.latex) => Some("latex"),
        ContentSection::Definition(s) if blank(&s.term) => Some("term"),
        ContentSection::Definition(s) if blank(&s.content) => Some("content"),
        ContentSection::Theorem(s) if blank(&s.statement) => Some("statement"),
        ContentSection::CodeBlock(s) if blank(&s.code) => Some("code"),
        _ => None,
    }
}

fn parse_spec<T: DeserializeOwned>(spec: &Value) -> Result<T, VisualizationRejection> {
    T::deserialize(spec).map_err(|e| VisualizationRejection::MalformedSpec(e.to_string()))
}

/// Compiles `expression` against `variables` and test-evaluates it at the
/// origin. Only compile errors reject; a non-finite sample is the renderer's
/// concern.
fn check_expression(expression: &str, variables: &[&str]) -> Result<(), VisualizationRejection> {
    let compiled = compile(expression, variables).map_err(|source| {
        VisualizationRejection::Expression {
            expression: expression.to_string(),
            source,
        }
    })?;
    let sample = compiled.evaluate_at(&vec![0.0; variables.len()]);
    if !sample.is_finite() {
        debug!(expression, sample, "Expression is not finite at the origin");
    }
    Ok(())
}

fn check_function_plot(spec: &Value) -> Result<(), VisualizationRejection> {
    let spec: FunctionPlotSpec = parse_spec(spec)?;
    spec.functions
        .iter()
        .try_for_each(|function| check_expression(function.expression(), &["x"]))
}

fn check_vector_field(spec: &Value) -> Result<(), VisualizationRejection> {
    let spec: VectorFieldSpec = parse_spec(spec)?;

    let field_function = spec.field_function.as_deref().filter(|f| !f.trim().is_empty());
    if let Some(field_function) = field_function {
        let components = split_field_function(field_function)
            .ok_or_else(|| VisualizationRejection::FieldFunctionShape(field_function.to_string()))?;
        for component in components {
            check_expression(component, &["x", "y"])?;
        }
    }

    for (index, raw) in spec.vectors.iter().flatten().enumerate() {
        let vector = FieldVector::deserialize(raw).map_err(|e| {
            VisualizationRejection::MalformedVector {
                index,
                reason: e.to_string(),
            }
        })?;
        for (name, components) in [("origin", &vector.origin), ("direction", &vector.direction)] {
            if components.len() != 2 {
                return Err(VisualizationRejection::MalformedVector {
                    index,
                    reason: format!("{name} has {} components, expected 2", components.len()),
                });
            }
            if components.iter().any(|c| !c.is_finite()) {
                return Err(VisualizationRejection::MalformedVector {
                    index,
                    reason: format!("{name} is not finite"),
                });
            }
        }
    }
    Ok(())
}

/// Splits `[dx, dy]` into its two component expressions. Commas inside
/// parentheses (as in `atan2(y, x)`) do not split.
fn split_field_function(text: &str) -> Option<[&str; 2]> {
    let inner = text.trim().strip_prefix('[')?.strip_suffix(']')?;

    let mut depth = 0usize;
    let mut split_at = None;
    for (pos, ch) in inner.char_indices() {
        match ch {
            '(' | '[' => depth += 1,
            ')' | ']' => depth = depth.checked_sub(1)?,
            ',' if depth == 0 => {
                if split_at.is_some() {
                    return None;
                }
                split_at = Some(pos);
            }
            _ => {}
        }
    }

    let pos = split_at?;
    let (dx, dy) = (inner[..pos].trim(), inner[pos + 1..].trim());
    (!dx.is_empty() && !dy.is_empty()).then_some([dx, dy])
}

fn check_surface(spec: &Value) -> Result<(), VisualizationRejection> {
    let spec: SurfaceSpec = parse_spec(spec)?;
    let Some(components) = spec.parametric_surface.as_ref().and_then(|s| s.complete()) else {
        return Ok(());
    };
    components
        .into_iter()
        .try_for_each(|expression| check_expression(expression, &["u", "v"]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::MathSection;
    use serde_json::json;

    fn sections(raw: Value) -> Vec<ContentSection> {
        serde_json::from_value(raw).unwrap()
    }

    fn viz(viz_type: &str, spec: Value) -> ContentSection {
        ContentSection::Visualization(VisualizationSection {
            viz_type: viz_type.to_string(),
            title: Some("Demo".to_string()),
            description: None,
            spec: Some(spec),
        })
    }

    #[test]
    fn test_disallowed_variable_drops_function_plot() {
        let input = sections(json!([
            { "type": "text", "content": "Intro" },
            { "type": "visualization", "vizType": "function_plot",
              "spec": { "functions": [{ "expression": "x+y" }] } }
        ]));
        let result = VisualizationValidator::new().validate(input);

        assert_eq!(result.sections.len(), 1);
        assert_eq!(result.sections[0].kind(), "text");
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("function_plot"));
    }

    #[test]
    fn test_valid_function_plot_is_kept() {
        let input = vec![viz(
            "function_plot",
            json!({ "functions": ["Math.sin(x)", { "expression": "1/x" }] }),
        )];
        let result = VisualizationValidator::new().validate(input.clone());
        assert_eq!(result.sections, input);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_function_plot_without_functions_is_accepted() {
        let validator = VisualizationValidator::new();
        let result = validator.validate(vec![viz("function_plot", json!({}))]);
        assert_eq!(result.sections.len(), 1);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_vectors() {
        let validator = VisualizationValidator::new();
        let good = vec![viz(
            "vector_field",
            json!({ "vectors": [{ "origin": [0, 0], "direction": [1, 1] }] }),
        )];
        let result = validator.validate(good.clone());
        assert_eq!(result.sections, good);
        assert!(result.warnings.is_empty());

        let bad = vec![viz(
            "vector_field",
            json!({ "vectors": [{ "origin": [0], "direction": [1, 1] }] }),
        )];
        let result = validator.validate(bad);
        assert!(result.sections.is_empty());
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("vector_field"));
    }

    #[test]
    fn test_non_numeric_vector_is_rejected() {
        let section = VisualizationSection {
            viz_type: "vector_field".to_string(),
            spec: Some(json!({ "vectors": [{ "origin": ["a", 0], "direction": [1, 1] }] })),
            ..Default::default()
        };
        let err = VisualizationValidator::new()
            .check_visualization(&section)
            .unwrap_err();
        assert!(matches!(err, VisualizationRejection::MalformedVector { index: 0, .. }));
    }

    #[test]
    fn test_field_function_shape() {
        assert_eq!(split_field_function("[-y, x]"), Some(["-y", "x"]));
        assert_eq!(
            split_field_function(" [atan2(y, x), 1] "),
            Some(["atan2(y, x)", "1"])
        );
        assert_eq!(split_field_function("-y, x"), None);
        assert_eq!(split_field_function("[x, y, 1]"), None);
        assert_eq!(split_field_function("[x, ]"), None);
        assert_eq!(split_field_function("[x)(, y]"), None);
    }

    #[test]
    fn test_field_function_checks() {
        let validator = VisualizationValidator::new();
        let ok = viz("vector_field", json!({ "fieldFunction": "[-y, x]" }));
        let wrong_shape = viz("vector_field", json!({ "fieldFunction": "-y, x" }));
        let wrong_variable = viz("vector_field", json!({ "fieldFunction": "[-y, z]" }));

        let result = validator.validate(vec![ok, wrong_shape, wrong_variable]);
        assert_eq!(result.sections.len(), 1);
        assert_eq!(result.warnings.len(), 2);
        assert!(result.warnings[0].contains("[dx, dy]"));
    }

    #[test]
    fn test_parametric_surface() {
        let validator = VisualizationValidator::new();
        let complete = viz(
            "3d_surface",
            json!({ "parametricSurface": { "x": "cos(u)*sin(v)", "y": "sin(u)*sin(v)", "z": "cos(v)" } }),
        );
        let incomplete = viz(
            "parametric_plot",
            json!({ "parametricSurface": { "x": "cos(t)", "y": "" } }),
        );
        let invalid = viz(
            "3d_surface",
            json!({ "parametricSurface": { "x": "u", "y": "v", "z": "x*y" } }),
        );

        let result = validator.validate(vec![complete, incomplete, invalid]);
        assert_eq!(result.sections.len(), 2);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].starts_with("Removed malformed 3d_surface visualization \"Demo\""));
    }

    #[test]
    fn test_kinds_without_expressions_and_absent_specs() {
        let validator = VisualizationValidator::new();
        let geometry = viz("geometry", json!({ "shapes": [{ "kind": "eval('x')" }] }));
        let manifold = viz("manifold", json!("anything"));
        let no_spec = ContentSection::Visualization(VisualizationSection {
            viz_type: "function_plot".to_string(),
            ..Default::default()
        });

        let result = validator.validate(vec![geometry, manifold, no_spec]);
        assert_eq!(result.sections.len(), 3);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_unknown_kind_is_dropped() {
        let result = VisualizationValidator::new().validate(vec![viz("pie_chart", json!({}))]);
        assert!(result.sections.is_empty());
        assert_eq!(
            result.warnings,
            vec!["Removed visualization \"Demo\": unrecognized visualization type 'pie_chart'"]
        );
    }

    #[test]
    fn test_incomplete_sections_are_downgraded_or_dropped() {
        let input = vec![
            ContentSection::Math(MathSection {
                title: Some("Area".to_string()),
                latex: " ".to_string(),
                explanation: Some("The area under the curve.".to_string()),
            }),
            ContentSection::Math(MathSection::default()),
        ];
        let result = VisualizationValidator::new().validate(input);

        assert_eq!(
            result.sections,
            vec![ContentSection::Text(TextSection {
                title: Some("Area".to_string()),
                content: "The area under the curve.".to_string(),
            })]
        );
        assert_eq!(
            result.warnings,
            vec![
                "Converted incomplete math section to text: missing latex",
                "Removed incomplete math section: missing latex",
            ]
        );
    }

    #[test]
    fn test_revalidation_is_idempotent() {
        let input = sections(json!([
            { "type": "definition", "term": "", "content": "A set with an operation." },
            { "type": "theorem", "statement": "a^2 + b^2 = c^2" },
            { "type": "visualization", "vizType": "function_plot",
              "spec": { "functions": ["x^2", "x + y"] } },
            { "type": "visualization", "vizType": "vector_field",
              "spec": { "fieldFunction": "[y, -x]" } },
            { "type": "code_block", "code": "" }
        ]));
        let validator = VisualizationValidator::new();
        let first = validator.validate(input);
        assert_eq!(first.sections.len(), 3);
        assert_eq!(first.warnings.len(), 3);

        let second = validator.validate(first.sections.clone());
        assert_eq!(second.sections, first.sections);
        assert!(second.warnings.is_empty());
    }
}
