//! Declarative Output Schemas
//!
//! A `Schema` describes the object shape a generation request expects. The
//! same instance (shared behind an `Arc`) is attached to the model call,
//! used for direct validation, and drives coercion and repacking. Schemas
//! have no mutating methods once built, so they are immutable in use.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;

/// The shape of a JSON value as observed in model output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonKind {
    Null,
    Boolean,
    Number,
    String,
    Array,
    Object,
}

impl JsonKind {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => JsonKind::Null,
            Value::Bool(_) => JsonKind::Boolean,
            Value::Number(_) => JsonKind::Number,
            Value::String(_) => JsonKind::String,
            Value::Array(_) => JsonKind::Array,
            Value::Object(_) => JsonKind::Object,
        }
    }
}

impl fmt::Display for JsonKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JsonKind::Null => "null",
            JsonKind::Boolean => "boolean",
            JsonKind::Number => "number",
            JsonKind::String => "string",
            JsonKind::Array => "array",
            JsonKind::Object => "object",
        };
        f.write_str(name)
    }
}

/// The expected kind of a schema field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    String,
    Number,
    Integer,
    Boolean,
    /// A string restricted to the listed values.
    Enum(Vec<String>),
    /// A string naming a variant. The listed values are the known ones and
    /// are advertised to the model, but any string validates; whoever reads
    /// the value decides what to do with an unknown one.
    Tag(Vec<String>),
    Array(Box<FieldKind>),
    Object(Schema),
    /// Anything, including null. Used for free-form payloads checked elsewhere.
    Any,
}

impl FieldKind {
    pub fn array_of(item: FieldKind) -> Self {
        FieldKind::Array(Box::new(item))
    }

    pub fn one_of<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FieldKind::Enum(values.into_iter().map(Into::into).collect())
    }

    pub fn tag<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FieldKind::Tag(values.into_iter().map(Into::into).collect())
    }

    /// A short human-readable description, e.g. `array<number>`.
    pub fn describe(&self) -> String {
        match self {
            FieldKind::String => "string".to_string(),
            FieldKind::Number => "number".to_string(),
            FieldKind::Integer => "integer".to_string(),
            FieldKind::Boolean => "boolean".to_string(),
            FieldKind::Enum(values) => format!("enum[{}]", values.join("|")),
            FieldKind::Tag(values) => format!("tag[{}]", values.join("|")),
            FieldKind::Array(item) => format!("array<{}>", item.describe()),
            FieldKind::Object(schema) => format!("object<{}>", schema.name()),
            FieldKind::Any => "any".to_string(),
        }
    }

    fn to_json_schema(&self) -> Value {
        match self {
            FieldKind::String => json!({ "type": "string" }),
            FieldKind::Number => json!({ "type": "number" }),
            FieldKind::Integer => json!({ "type": "integer" }),
            FieldKind::Boolean => json!({ "type": "boolean" }),
            FieldKind::Enum(values) => json!({ "type": "string", "enum": values }),
            FieldKind::Tag(values) => json!({
                "type": "string",
                "description": format!("One of: {}", values.join(", ")),
            }),
            FieldKind::Array(item) => json!({ "type": "array", "items": item.to_json_schema() }),
            FieldKind::Object(schema) => schema.to_json_schema(),
            FieldKind::Any => json!({}),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchemaField {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
}

/// An expected object shape: named fields with kinds and requiredness.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    name: String,
    description: Option<String>,
    fields: Vec<SchemaField>,
}

impl Schema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            fields: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn required(self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.field(name, kind, true)
    }

    pub fn optional(self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.field(name, kind, false)
    }

    fn field(mut self, name: impl Into<String>, kind: FieldKind, required: bool) -> Self {
        self.fields.push(SchemaField {
            name: name.into(),
            kind,
            required,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn fields(&self) -> &[SchemaField] {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&SchemaField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// The name of the only required field, if there is exactly one and it
    /// is an array. Used to re-envelope a bare array answer.
    pub fn sole_required_array(&self) -> Option<&str> {
        let mut required = self.fields.iter().filter(|f| f.required);
        match (required.next(), required.next()) {
            (Some(field), None) if matches!(field.kind, FieldKind::Array(_)) => {
                Some(&field.name)
            }
            _ => None,
        }
    }

    /// True when `map` carries at least one of this schema's field names.
    pub fn overlaps(&self, map: &Map<String, Value>) -> bool {
        self.fields.iter().any(|f| map.contains_key(&f.name))
    }

    /// Checks `value` against the schema and returns every deviation found.
    pub fn validate(&self, value: &Value) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        let mut path = Vec::new();
        self.validate_object(value, &mut path, &mut issues);
        issues
    }

    fn validate_object(
        &self,
        value: &Value,
        path: &mut Vec<PathSegment>,
        issues: &mut Vec<ValidationIssue>,
    ) {
        let Value::Object(map) = value else {
            issues.push(ValidationIssue {
                path: path.clone(),
                message: format!("expected an object matching '{}'", self.name),
                observed_kind: Some(JsonKind::of(value)),
                expected_kind: format!("object<{}>", self.name),
            });
            return;
        };

        for field in &self.fields {
            path.push(PathSegment::Field(field.name.clone()));
            match map.get(&field.name) {
                None | Some(Value::Null) if field.required => issues.push(ValidationIssue {
                    path: path.clone(),
                    message: "missing required field".to_string(),
                    observed_kind: map.get(&field.name).map(JsonKind::of),
                    expected_kind: field.kind.describe(),
                }),
                None | Some(Value::Null) => {}
                Some(observed) => validate_kind(&field.kind, observed, path, issues),
            }
            path.pop();
        }
    }

    /// Renders the schema as JSON Schema, for use as a structured-output
    /// constraint on the model call.
    pub fn to_json_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .fields
            .iter()
            .map(|f| (f.name.clone(), f.kind.to_json_schema()))
            .collect();
        let required: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name.as_str())
            .collect();

        let mut schema = json!({
            "title": self.name,
            "type": "object",
            "properties": properties,
            "required": required,
        });
        if let Some(description) = &self.description {
            schema["description"] = json!(description);
        }
        schema
    }
}

fn validate_kind(
    kind: &FieldKind,
    value: &Value,
    path: &mut Vec<PathSegment>,
    issues: &mut Vec<ValidationIssue>,
) {
    let mismatch = |message: String, path: &Vec<PathSegment>| ValidationIssue {
        path: path.clone(),
        message,
        observed_kind: Some(JsonKind::of(value)),
        expected_kind: kind.describe(),
    };

    match (kind, value) {
        (FieldKind::Any, _)
        | (FieldKind::String, Value::String(_))
        | (FieldKind::Tag(_), Value::String(_))
        | (FieldKind::Number, Value::Number(_))
        | (FieldKind::Boolean, Value::Bool(_)) => {}
        (FieldKind::Integer, Value::Number(n)) => {
            if !(n.is_i64() || n.is_u64()) {
                issues.push(mismatch(format!("expected an integer, found {n}"), path));
            }
        }
        (FieldKind::Enum(values), Value::String(s)) => {
            if !values.iter().any(|v| v == s) {
                issues.push(mismatch(
                    format!("'{s}' is not one of {}", values.join(", ")),
                    path,
                ));
            }
        }
        (FieldKind::Array(item), Value::Array(items)) => {
            for (index, element) in items.iter().enumerate() {
                path.push(PathSegment::Index(index));
                validate_kind(item, element, path, issues);
                path.pop();
            }
        }
        (FieldKind::Object(schema), Value::Object(_)) => {
            schema.validate_object(value, path, issues)
        }
        _ => issues.push(mismatch(
            format!("expected {}, found {}", kind.describe(), JsonKind::of(value)),
            path,
        )),
    }
}

/// One step of a path into a JSON document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

/// Renders a path as `$.sections[2].type`.
pub fn format_path(path: &[PathSegment]) -> String {
    let mut rendered = String::from("$");
    for segment in path {
        match segment {
            PathSegment::Field(name) => {
                rendered.push('.');
                rendered.push_str(name);
            }
            PathSegment::Index(index) => rendered.push_str(&format!("[{index}]")),
        }
    }
    rendered
}

/// A single field-level deviation from a schema. Issues are collected into
/// lists; they are never raised as errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub path: Vec<PathSegment>,
    pub message: String,
    /// `None` when the field was absent altogether.
    pub observed_kind: Option<JsonKind>,
    pub expected_kind: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let observed = self
            .observed_kind
            .map(|k| k.to_string())
            .unwrap_or_else(|| "nothing".to_string());
        write!(
            f,
            "{}: {} (expected {}, found {})",
            format_path(&self.path),
            self.message,
            self.expected_kind,
            observed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiz_schema() -> Schema {
        let question = Schema::new("question")
            .required("prompt", FieldKind::String)
            .required("answer", FieldKind::Integer)
            .optional("difficulty", FieldKind::one_of(["easy", "hard"]));
        Schema::new("quiz")
            .with_description("A short quiz")
            .required("title", FieldKind::String)
            .required("questions", FieldKind::array_of(FieldKind::Object(question)))
            .optional("passing_score", FieldKind::Number)
    }

    #[test]
    fn test_valid_object_has_no_issues() {
        let value = json!({
            "title": "Limits",
            "questions": [{ "prompt": "lim x->0 of x?", "answer": 0, "difficulty": "easy" }]
        });
        assert!(quiz_schema().validate(&value).is_empty());
    }

    #[test]
    fn test_optional_fields_may_be_null_or_absent() {
        let value = json!({ "title": "Limits", "questions": [], "passing_score": null });
        assert!(quiz_schema().validate(&value).is_empty());
    }

    #[test]
    fn test_collects_every_issue_with_paths() {
        let value = json!({
            "questions": [
                { "prompt": "ok", "answer": 1.5 },
                { "prompt": 3, "answer": 2, "difficulty": "medium" }
            ]
        });
        let issues = quiz_schema().validate(&value);
        let rendered: Vec<String> = issues.iter().map(|i| format_path(&i.path)).collect();
        assert_eq!(
            rendered,
            vec![
                "$.title",
                "$.questions[0].answer",
                "$.questions[1].prompt",
                "$.questions[1].difficulty",
            ]
        );
        assert_eq!(issues[0].observed_kind, None);
        assert_eq!(issues[2].observed_kind, Some(JsonKind::Number));
        assert_eq!(issues[2].expected_kind, "string");
    }

    #[test]
    fn test_non_object_root() {
        let issues = quiz_schema().validate(&json!([1, 2]));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].observed_kind, Some(JsonKind::Array));
        assert!(issues[0].to_string().starts_with("$: expected an object"));
    }

    #[test]
    fn test_sole_required_array() {
        let schema = Schema::new("lesson").required(
            "sections",
            FieldKind::array_of(FieldKind::Any),
        );
        assert_eq!(schema.sole_required_array(), Some("sections"));
        assert_eq!(quiz_schema().sole_required_array(), None);
    }

    #[test]
    fn test_json_schema_export() {
        let exported = quiz_schema().to_json_schema();
        assert_eq!(exported["type"], "object");
        assert_eq!(exported["description"], "A short quiz");
        assert_eq!(exported["required"], json!(["title", "questions"]));
        assert_eq!(
            exported["properties"]["questions"]["items"]["properties"]["difficulty"]["enum"],
            json!(["easy", "hard"])
        );
    }

    #[test]
    fn test_tag_accepts_unknown_strings() {
        let schema = Schema::new("section").required("type", FieldKind::tag(["text", "math"]));
        assert!(schema.validate(&json!({ "type": "text" })).is_empty());
        assert!(schema.validate(&json!({ "type": "quiz" })).is_empty());

        let issues = schema.validate(&json!({ "type": 3 }));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].expected_kind, "tag[text|math]");

        let exported = schema.to_json_schema();
        assert_eq!(exported["properties"]["type"]["type"], "string");
        assert!(exported["properties"]["type"].get("enum").is_none());
    }
}
