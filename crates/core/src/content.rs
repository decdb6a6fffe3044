//! Lesson Content Model
//!
//! Typed content sections as they travel from generation to the renderer.
//! Section fields are deliberately lenient on the way in (missing strings
//! default to empty) so that the validator, not deserialization, decides
//! whether a section is renderable.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One block of lesson content, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentSection {
    Text(TextSection),
    Math(MathSection),
    Definition(DefinitionSection),
    Theorem(TheoremSection),
    CodeBlock(CodeBlockSection),
    Visualization(VisualizationSection),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MathSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub latex: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefinitionSection {
    #[serde(default)]
    pub term: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TheoremSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub statement: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeBlockSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

/// A section whose rendering evaluates model- or author-supplied expressions.
///
/// `spec` stays raw JSON: it is only ever interpreted by the validator, which
/// reads it through the typed per-kind views below and either accepts it
/// whole or rejects the section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisualizationSection {
    #[serde(default)]
    pub viz_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<Value>,
}

fn non_blank(text: Option<&str>) -> Option<&str> {
    text.map(str::trim).filter(|t| !t.is_empty())
}

impl ContentSection {
    /// The wire tag of this section.
    pub fn kind(&self) -> &'static str {
        match self {
            ContentSection::Text(_) => "text",
            ContentSection::Math(_) => "math",
            ContentSection::Definition(_) => "definition",
            ContentSection::Theorem(_) => "theorem",
            ContentSection::CodeBlock(_) => "code_block",
            ContentSection::Visualization(_) => "visualization",
        }
    }

    /// Free-form prose that can stand in for this section as plain text.
    pub fn salvage_text(&self) -> Option<String> {
        match self {
            ContentSection::Text(s) => non_blank(Some(s.content.as_str())).map(str::to_string),
            ContentSection::Math(s) => non_blank(s.explanation.as_deref()).map(str::to_string),
            ContentSection::Definition(s) => {
                let content = non_blank(Some(s.content.as_str()))?;
                Some(match non_blank(Some(s.term.as_str())) {
                    Some(term) => format!("{term}: {content}"),
                    None => content.to_string(),
                })
            }
            ContentSection::Theorem(s) => non_blank(s.proof.as_deref()).map(str::to_string),
            ContentSection::CodeBlock(s) => non_blank(s.explanation.as_deref()).map(str::to_string),
            ContentSection::Visualization(s) => {
                non_blank(s.description.as_deref()).map(str::to_string)
            }
        }
    }

    /// The section's title, if it carries one.
    pub fn title(&self) -> Option<&str> {
        match self {
            ContentSection::Text(s) => s.title.as_deref(),
            ContentSection::Math(s) => s.title.as_deref(),
            ContentSection::Definition(s) => non_blank(Some(s.term.as_str())),
            ContentSection::Theorem(s) => s.title.as_deref(),
            ContentSection::CodeBlock(_) => None,
            ContentSection::Visualization(s) => s.title.as_deref(),
        }
    }
}

/// Visualization kinds the renderer knows how to draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VizKind {
    FunctionPlot,
    ParametricPlot,
    VectorField,
    Geometry,
    Surface3d,
    Manifold,
}

impl VizKind {
    pub const ALL: [VizKind; 6] = [
        VizKind::FunctionPlot,
        VizKind::ParametricPlot,
        VizKind::VectorField,
        VizKind::Geometry,
        VizKind::Surface3d,
        VizKind::Manifold,
    ];

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == tag.trim())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VizKind::FunctionPlot => "function_plot",
            VizKind::ParametricPlot => "parametric_plot",
            VizKind::VectorField => "vector_field",
            VizKind::Geometry => "geometry",
            VizKind::Surface3d => "3d_surface",
            VizKind::Manifold => "manifold",
        }
    }
}

// --- Typed views over `VisualizationSection::spec` ---

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionPlotSpec {
    #[serde(default)]
    pub functions: Vec<PlotFunction>,
}

/// A plotted function, either a bare expression or an object with styling.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PlotFunction {
    Bare(String),
    Styled {
        expression: String,
        #[serde(default)]
        label: Option<String>,
        #[serde(default)]
        color: Option<String>,
    },
}

impl PlotFunction {
    pub fn expression(&self) -> &str {
        match self {
            PlotFunction::Bare(expression) => expression,
            PlotFunction::Styled { expression, .. } => expression,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorFieldSpec {
    #[serde(default)]
    pub field_function: Option<String>,
    #[serde(default)]
    pub vectors: Option<Vec<Value>>,
}

/// One explicit arrow of a vector field.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldVector {
    pub origin: Vec<f64>,
    pub direction: Vec<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurfaceSpec {
    #[serde(default)]
    pub parametric_surface: Option<ParametricSurface>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParametricSurface {
    #[serde(default)]
    pub x: Option<String>,
    #[serde(default)]
    pub y: Option<String>,
    #[serde(default)]
    pub z: Option<String>,
}

impl ParametricSurface {
    /// All three coordinate expressions, when every one is present and non-blank.
    pub fn complete(&self) -> Option<[&str; 3]> {
        Some([
            non_blank(self.x.as_deref())?,
            non_blank(self.y.as_deref())?,
            non_blank(self.z.as_deref())?,
        ])
    }
}
