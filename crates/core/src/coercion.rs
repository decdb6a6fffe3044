//! Schema Coercion
//!
//! Reshapes parsed-but-non-conforming model output toward a `Schema`: first
//! by peeling off envelope objects some models wrap their answer in, then by
//! converting field values whose kind differs from the expected one but can
//! be converted without ambiguity. Whatever cannot be repaired is reported
//! as `ValidationIssue`s; nothing here fails with an error.

use crate::schema::{FieldKind, PathSegment, Schema, ValidationIssue, format_path};
use fuzzy_matcher::FuzzyMatcher;
use fuzzy_matcher::skim::SkimMatcherV2;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::fmt;
use tracing::{debug, info};

/// The envelope shape detected around the real payload, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key", rename_all = "snake_case")]
pub enum WrapperKind {
    None,
    /// `{"parameter": {...}}`, the most commonly observed envelope.
    Parameter,
    /// Any other single-key envelope, carrying the key name.
    Envelope(String),
    /// `[{...}]` around a single object.
    SingletonArray,
    /// The whole document serialized inside a JSON string.
    StringifiedJson,
    /// A bare array answering a schema whose only required field is that
    /// array; carries the field name it was placed under.
    BareArray(String),
}

impl fmt::Display for WrapperKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WrapperKind::None => write!(f, "none"),
            WrapperKind::Parameter => write!(f, "parameter"),
            WrapperKind::Envelope(key) => write!(f, "envelope:{key}"),
            WrapperKind::SingletonArray => write!(f, "singleton_array"),
            WrapperKind::StringifiedJson => write!(f, "stringified_json"),
            WrapperKind::BareArray(field) => write!(f, "bare_array:{field}"),
        }
    }
}

/// Result of a coercion pass.
#[derive(Debug, Clone)]
pub struct CoercionOutcome {
    /// The coerced value, present only if it now validates against the schema.
    pub value: Option<Value>,
    pub wrapper: WrapperKind,
    /// Human-readable notes for every conversion applied.
    pub repairs: Vec<String>,
}

/// Stateless coercer; one instance can serve any number of schemas.
#[derive(Default)]
pub struct SchemaCoercer {
    matcher: SkimMatcherV2,
}

impl SchemaCoercer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Coerces `value` toward `schema`, appending unrepaired deviations to `issues`.
    ///
    /// The input must already be parsed JSON; deciding what to do with text
    /// that is not JSON at all belongs to the caller.
    pub fn coerce(
        &self,
        value: Value,
        schema: &Schema,
        issues: &mut Vec<ValidationIssue>,
    ) -> CoercionOutcome {
        let (unwrapped, wrapper) = self.unwrap(value, schema);
        if wrapper != WrapperKind::None {
            info!(schema = schema.name(), wrapper = %wrapper, "Unwrapped envelope around model output");
        }

        let mut repairs = Vec::new();
        let mut path = Vec::new();
        let coerced = self.coerce_object(unwrapped, schema, &mut path, &mut repairs);

        let remaining = schema.validate(&coerced);
        let value = remaining.is_empty().then_some(coerced);
        issues.extend(remaining);

        CoercionOutcome {
            value,
            wrapper,
            repairs,
        }
    }

    /// Detects a known envelope structurally and returns the payload inside it.
    pub fn unwrap(&self, value: Value, schema: &Schema) -> (Value, WrapperKind) {
        match value {
            Value::String(text) => match serde_json::from_str::<Value>(text.trim()) {
                Ok(inner @ (Value::Object(_) | Value::Array(_))) => {
                    let (payload, _) = self.unwrap_structural(inner, schema);
                    (payload, WrapperKind::StringifiedJson)
                }
                _ => (Value::String(text), WrapperKind::None),
            },
            other => self.unwrap_structural(other, schema),
        }
    }

    fn unwrap_structural(&self, value: Value, schema: &Schema) -> (Value, WrapperKind) {
        match value {
            Value::Array(mut items) => {
                let singleton = items.len() == 1
                    && matches!(&items[0], Value::Object(map) if schema.overlaps(map));
                if singleton {
                    return (items.remove(0), WrapperKind::SingletonArray);
                }
                match schema.sole_required_array() {
                    Some(field) => (
                        envelope(field, Value::Array(items)),
                        WrapperKind::BareArray(field.to_string()),
                    ),
                    None => (Value::Array(items), WrapperKind::None),
                }
            }
            Value::Object(map) if !schema.overlaps(&map) => {
                match self.envelope_payload(&map, schema) {
                    Some((key, payload)) => {
                        let kind = if key == "parameter" {
                            WrapperKind::Parameter
                        } else {
                            WrapperKind::Envelope(key)
                        };
                        (payload, kind)
                    }
                    None => (Value::Object(map), WrapperKind::None),
                }
            }
            other => (other, WrapperKind::None),
        }
    }

    /// Finds the payload of a single-key envelope. Keys starting with `$`
    /// (`$schema` and the like) do not count as relevant.
    fn envelope_payload(&self, map: &Map<String, Value>, schema: &Schema) -> Option<(String, Value)> {
        let mut relevant = map.iter().filter(|(key, _)| !key.starts_with('$'));
        let (key, inner) = relevant.next()?;
        if relevant.next().is_some() {
            return None;
        }

        let inner = match inner {
            Value::String(text) => serde_json::from_str::<Value>(text.trim()).ok()?,
            other => other.clone(),
        };
        let payload = match inner {
            Value::Object(fields) if schema.overlaps(&fields) => Value::Object(fields),
            Value::Array(items) => envelope(schema.sole_required_array()?, Value::Array(items)),
            _ => return None,
        };
        Some((key.clone(), payload))
    }

    fn coerce_object(
        &self,
        value: Value,
        schema: &Schema,
        path: &mut Vec<PathSegment>,
        repairs: &mut Vec<String>,
    ) -> Value {
        let mut map = match value {
            Value::Object(map) => map,
            other => return other,
        };
        for field in schema.fields() {
            if let Some(slot) = map.get_mut(&field.name) {
                path.push(PathSegment::Field(field.name.clone()));
                let observed = slot.take();
                *slot = self.coerce_kind(observed, &field.kind, path, repairs);
                path.pop();
            }
        }
        Value::Object(map)
    }

    fn coerce_kind(
        &self,
        value: Value,
        kind: &FieldKind,
        path: &mut Vec<PathSegment>,
        repairs: &mut Vec<String>,
    ) -> Value {
        let mut note = |what: String| {
            let repair = format!("{}: {what}", format_path(path));
            debug!(repair = %repair, "Coerced field");
            repairs.push(repair);
        };

        match (kind, value) {
            (_, Value::Null) => Value::Null,
            (FieldKind::String, Value::Number(n)) => {
                note(format!("number {n} -> string"));
                Value::String(n.to_string())
            }
            (FieldKind::String, Value::Bool(b)) => {
                note(format!("boolean {b} -> string"));
                Value::String(b.to_string())
            }
            (FieldKind::Number, Value::String(s)) => match parse_number(&s) {
                Some(n) => {
                    note(format!("string '{s}' -> number"));
                    Value::Number(n)
                }
                None => Value::String(s),
            },
            (FieldKind::Integer, Value::String(s)) => match parse_integer(&s) {
                Some(n) => {
                    note(format!("string '{s}' -> integer"));
                    Value::Number(n)
                }
                None => Value::String(s),
            },
            (FieldKind::Integer, Value::Number(n)) if !(n.is_i64() || n.is_u64()) => {
                match integral(&n) {
                    Some(i) => {
                        note(format!("number {n} -> integer"));
                        Value::Number(i)
                    }
                    None => Value::Number(n),
                }
            }
            (FieldKind::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => {
                    note("string 'true' -> boolean".to_string());
                    Value::Bool(true)
                }
                "false" => {
                    note("string 'false' -> boolean".to_string());
                    Value::Bool(false)
                }
                _ => Value::String(s),
            },
            (FieldKind::Enum(values), Value::String(s)) => {
                if values.contains(&s) {
                    return Value::String(s);
                }
                match self.match_enum(&s, values) {
                    Some(canonical) => {
                        note(format!("enum '{s}' -> '{canonical}'"));
                        Value::String(canonical.to_string())
                    }
                    None => Value::String(s),
                }
            }
            (FieldKind::Tag(values), Value::String(s)) => {
                if values.contains(&s) {
                    return Value::String(s);
                }
                match match_normalized(&normalize(&s), values) {
                    Some(canonical) => {
                        note(format!("tag '{s}' -> '{canonical}'"));
                        Value::String(canonical.to_string())
                    }
                    None => Value::String(s),
                }
            }
            (FieldKind::Array(item), Value::Array(items)) => {
                let coerced = items
                    .into_iter()
                    .enumerate()
                    .map(|(index, element)| {
                        path.push(PathSegment::Index(index));
                        let element = self.coerce_kind(element, item, path, repairs);
                        path.pop();
                        element
                    })
                    .collect();
                Value::Array(coerced)
            }
            (FieldKind::Array(_), Value::String(s)) if parses_as_array(&s) => {
                note("stringified array -> array".to_string());
                let parsed = serde_json::from_str(s.trim()).unwrap_or(Value::String(s));
                self.coerce_kind(parsed, kind, path, repairs)
            }
            (FieldKind::Array(_), single) => {
                note("single value -> one-element array".to_string());
                self.coerce_kind(Value::Array(vec![single]), kind, path, repairs)
            }
            (FieldKind::Object(schema), Value::Object(map)) => {
                self.coerce_object(Value::Object(map), schema, path, repairs)
            }
            (FieldKind::Object(schema), Value::String(s)) => {
                match serde_json::from_str::<Value>(s.trim()) {
                    Ok(parsed @ Value::Object(_)) => {
                        note("stringified object -> object".to_string());
                        self.coerce_object(parsed, schema, path, repairs)
                    }
                    _ => Value::String(s),
                }
            }
            (_, other) => other,
        }
    }

    /// Matches an enum value ignoring case, `_`, `-` and spaces, then falls
    /// back to a fuzzy match that must single out exactly one candidate.
    /// Fuzzy matching needs at least `MIN_FUZZY_LEN` characters and the same
    /// leading character, so short fragments are never guessed at.
    fn match_enum<'a>(&self, observed: &str, values: &'a [String]) -> Option<&'a str> {
        let wanted = normalize(observed);
        if wanted.is_empty() {
            return None;
        }
        if let Some(exact) = match_normalized(&wanted, values) {
            return Some(exact);
        }
        if wanted.chars().count() < MIN_FUZZY_LEN {
            return None;
        }

        let mut candidates = values.iter().filter(|v| {
            let candidate = normalize(v);
            candidate.chars().next() == wanted.chars().next()
                && self.matcher.fuzzy_match(&candidate, &wanted).is_some()
        });
        match (candidates.next(), candidates.next()) {
            (Some(only), None) => Some(only.as_str()),
            _ => None,
        }
    }
}

/// Shortest normalized enum value that may be matched fuzzily.
const MIN_FUZZY_LEN: usize = 4;

fn match_normalized<'a>(wanted: &str, values: &'a [String]) -> Option<&'a str> {
    values
        .iter()
        .find(|v| normalize(v) == wanted)
        .map(String::as_str)
}

fn envelope(field: &str, payload: Value) -> Value {
    let mut map = Map::new();
    map.insert(field.to_string(), payload);
    Value::Object(map)
}

fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| !matches!(c, '_' | '-' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

fn parse_number(text: &str) -> Option<Number> {
    let parsed = text.trim().parse::<f64>().ok().filter(|n| n.is_finite())?;
    integral_f64(parsed).or_else(|| Number::from_f64(parsed))
}

fn parse_integer(text: &str) -> Option<Number> {
    let trimmed = text.trim();
    match trimmed.parse::<i64>() {
        Ok(i) => Some(Number::from(i)),
        Err(_) => integral_f64(trimmed.parse::<f64>().ok()?),
    }
}

fn integral(n: &Number) -> Option<Number> {
    integral_f64(n.as_f64()?)
}

fn integral_f64(value: f64) -> Option<Number> {
    let in_range = value.is_finite() && value.fract() == 0.0 && value.abs() < i64::MAX as f64;
    in_range.then(|| Number::from(value as i64))
}

fn parses_as_array(text: &str) -> bool {
    matches!(serde_json::from_str::<Value>(text.trim()), Ok(Value::Array(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn section_schema() -> Schema {
        let section = Schema::new("section")
            .required("type", FieldKind::one_of(["text", "math", "code_block"]))
            .optional("content", FieldKind::String);
        Schema::new("lesson")
            .required("title", FieldKind::String)
            .required("sections", FieldKind::array_of(FieldKind::Object(section)))
            .optional("minutes", FieldKind::Integer)
            .optional("published", FieldKind::Boolean)
            .optional("difficulty", FieldKind::Number)
    }

    fn valid_lesson() -> Value {
        json!({
            "title": "Derivatives",
            "sections": [{ "type": "text", "content": "Rates of change." }]
        })
    }

    fn coerce(value: Value) -> (CoercionOutcome, Vec<ValidationIssue>) {
        let mut issues = Vec::new();
        let outcome = SchemaCoercer::new().coerce(value, &section_schema(), &mut issues);
        (outcome, issues)
    }

    #[test]
    fn test_valid_input_passes_untouched() {
        let (outcome, issues) = coerce(valid_lesson());
        assert!(issues.is_empty());
        assert_eq!(outcome.wrapper, WrapperKind::None);
        assert!(outcome.repairs.is_empty());
        assert_eq!(outcome.value, Some(valid_lesson()));
    }

    #[test]
    fn test_parameter_wrapper_matches_direct_input() {
        let (direct, direct_issues) = coerce(valid_lesson());
        let (wrapped, wrapped_issues) = coerce(json!({ "parameter": valid_lesson() }));
        assert_eq!(wrapped.wrapper, WrapperKind::Parameter);
        assert_eq!(wrapped.value, direct.value);
        assert_eq!(wrapped_issues, direct_issues);
    }

    #[test]
    fn test_other_envelopes() {
        let (outcome, _) = coerce(json!({ "data": valid_lesson(), "$schema": "x" }));
        assert_eq!(outcome.wrapper, WrapperKind::Envelope("data".to_string()));
        assert!(outcome.value.is_some());

        let (outcome, _) = coerce(json!([valid_lesson()]));
        assert_eq!(outcome.wrapper, WrapperKind::SingletonArray);
        assert!(outcome.value.is_some());

        let stringified = serde_json::to_string(&valid_lesson()).unwrap();
        let (outcome, _) = coerce(json!({ "parameter": stringified }));
        assert_eq!(outcome.wrapper, WrapperKind::Parameter);
        assert!(outcome.value.is_some());

        let (outcome, _) = coerce(Value::String(stringified));
        assert_eq!(outcome.wrapper, WrapperKind::StringifiedJson);
        assert!(outcome.value.is_some());
    }

    #[test]
    fn test_unknown_envelope_shape_falls_through_to_issues() {
        let (outcome, issues) = coerce(json!({ "a": valid_lesson(), "b": 1 }));
        assert_eq!(outcome.wrapper, WrapperKind::None);
        assert!(outcome.value.is_none());
        assert_eq!(issues.len(), 2);
    }

    #[test]
    fn test_bare_array_is_re_enveloped() {
        let schema = Schema::new("sections_only").required(
            "sections",
            FieldKind::array_of(FieldKind::String),
        );
        let mut issues = Vec::new();
        let outcome = SchemaCoercer::new().coerce(json!(["a", "b"]), &schema, &mut issues);
        assert_eq!(outcome.wrapper, WrapperKind::BareArray("sections".to_string()));
        assert_eq!(outcome.value, Some(json!({ "sections": ["a", "b"] })));
    }

    #[test]
    fn test_scalar_coercions() {
        let (outcome, issues) = coerce(json!({
            "title": 42,
            "sections": [{ "type": "Text" }],
            "minutes": "15",
            "published": "TRUE",
            "difficulty": " 0.5 "
        }));
        assert!(issues.is_empty(), "unexpected issues: {issues:?}");
        let value = outcome.value.unwrap();
        assert_eq!(value["title"], "42");
        assert_eq!(value["sections"][0]["type"], "text");
        assert_eq!(value["minutes"], 15);
        assert_eq!(value["published"], true);
        assert_eq!(value["difficulty"], 0.5);
        assert_eq!(outcome.repairs.len(), 5);
    }

    #[test]
    fn test_single_object_becomes_array() {
        let (outcome, issues) = coerce(json!({
            "title": "Derivatives",
            "sections": { "type": "math" }
        }));
        assert!(issues.is_empty());
        assert_eq!(outcome.value.unwrap()["sections"], json!([{ "type": "math" }]));
    }

    #[test]
    fn test_stringified_array_is_parsed() {
        let (outcome, issues) = coerce(json!({
            "title": "Derivatives",
            "sections": "[{\"type\": \"text\"}]"
        }));
        assert!(issues.is_empty());
        assert_eq!(outcome.value.unwrap()["sections"][0]["type"], "text");
    }

    #[test]
    fn test_enum_normalisation_and_fuzzy_match() {
        let values = vec!["function_plot".to_string(), "vector_field".to_string()];
        let coercer = SchemaCoercer::new();
        assert_eq!(coercer.match_enum("Function Plot", &values), Some("function_plot"));
        assert_eq!(coercer.match_enum("func_plot", &values), Some("function_plot"));
        assert_eq!(coercer.match_enum("pie", &values), None);
        assert_eq!(coercer.match_enum("", &values), None);
    }

    #[test]
    fn test_short_fragments_are_not_fuzzy_matched() {
        let values: Vec<String> = ["text", "math", "code_block", "visualization"]
            .iter()
            .map(|v| v.to_string())
            .collect();
        let coercer = SchemaCoercer::new();
        assert_eq!(coercer.match_enum("x", &values), None);
        assert_eq!(coercer.match_enum("lz", &values), None);
        assert_eq!(coercer.match_enum("code", &values), Some("code_block"));
        assert_eq!(coercer.match_enum("isualization", &values), None);

        let (outcome, issues) = coerce(json!({
            "title": "Derivatives",
            "sections": [{ "type": "x" }]
        }));
        assert!(outcome.value.is_none());
        assert!(outcome.repairs.is_empty());
        assert_eq!(issues.len(), 1);
        assert_eq!(format_path(&issues[0].path), "$.sections[0].type");
    }

    #[test]
    fn test_tags_are_normalised_but_never_rejected() {
        let schema = Schema::new("viz").required(
            "vizType",
            FieldKind::tag(["function_plot", "vector_field"]),
        );
        let coercer = SchemaCoercer::new();

        let mut issues = Vec::new();
        let outcome = coercer.coerce(json!({ "vizType": "Function Plot" }), &schema, &mut issues);
        assert!(issues.is_empty());
        assert_eq!(outcome.value, Some(json!({ "vizType": "function_plot" })));

        let outcome = coercer.coerce(json!({ "vizType": "pie_chart" }), &schema, &mut issues);
        assert!(issues.is_empty());
        assert!(outcome.repairs.is_empty());
        assert_eq!(outcome.value, Some(json!({ "vizType": "pie_chart" })));
    }

    #[test]
    fn test_unconvertible_fields_are_reported() {
        let (outcome, issues) = coerce(json!({
            "title": "Derivatives",
            "sections": [{ "type": "poem" }],
            "minutes": "a while",
            "published": "maybe"
        }));
        assert!(outcome.value.is_none());
        let paths: Vec<String> = issues.iter().map(|i| format_path(&i.path)).collect();
        assert_eq!(paths, vec!["$.sections[0].type", "$.minutes", "$.published"]);
    }

    #[test]
    fn test_fractional_integer_is_not_truncated() {
        let (outcome, issues) = coerce(json!({
            "title": "Derivatives",
            "sections": [],
            "minutes": 2.5
        }));
        assert!(outcome.value.is_none());
        assert_eq!(issues.len(), 1);

        let (outcome, _) = coerce(json!({ "title": "D", "sections": [], "minutes": 3.0 }));
        assert_eq!(outcome.value.unwrap()["minutes"], 3);
    }
}
