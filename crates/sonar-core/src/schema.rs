//! Structured input-schema descriptions for tools.
//!
//! Every tool declares its input shape as an explicit [`ObjectShape`]
//! rather than an opaque schema blob, so the registry can reject invalid
//! declarations up front and the dispatcher can validate parameters
//! without introspecting a third-party schema library.
//!
//! Shapes are wrapped in a [`SchemaShape`] tag: `Simple` for flat shapes,
//! `Complex` for shapes carrying array-valued fields. The transport layer
//! branches on the tag so array semantics survive in `tools/list` output.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// The type of a single field in a tool's input shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldSpec {
    /// A string, optionally constrained.
    String {
        /// Minimum length.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<usize>,
        /// Maximum length.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<usize>,
        /// Allowed values.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        allowed: Option<Vec<String>>,
        /// Format hint (`uri`, `hostname`, ...) surfaced in the JSON schema.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        format: Option<String>,
    },
    /// A number, optionally constrained.
    Number {
        /// Minimum value (inclusive).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        /// Maximum value (inclusive).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
        /// Require an integer.
        #[serde(default)]
        integer: bool,
    },
    /// A boolean.
    Boolean,
    /// A homogeneous array.
    Array(Box<FieldSpec>),
    /// A nested object.
    Object(ObjectShape),
    /// An optional field: absence is not an error.
    Optional(Box<FieldSpec>),
    /// An optional field with a default injected when absent.
    Default(Box<FieldSpec>, Value),
    /// A field that must equal a literal value.
    Literal(Value),
    /// Anything goes.
    Any,
}

impl FieldSpec {
    /// Unconstrained string.
    #[must_use]
    pub fn string() -> Self {
        Self::String {
            min: None,
            max: None,
            allowed: None,
            format: None,
        }
    }

    /// String restricted to a fixed set of values.
    #[must_use]
    pub fn string_enum(values: &[&str]) -> Self {
        Self::String {
            min: None,
            max: None,
            allowed: Some(values.iter().map(ToString::to_string).collect()),
            format: None,
        }
    }

    /// Unconstrained number.
    #[must_use]
    pub fn number() -> Self {
        Self::Number {
            min: None,
            max: None,
            integer: false,
        }
    }

    /// Integer-valued number.
    #[must_use]
    pub fn integer() -> Self {
        Self::Number {
            min: None,
            max: None,
            integer: true,
        }
    }

    /// Array of the given element type.
    #[must_use]
    pub fn array(element: FieldSpec) -> Self {
        Self::Array(Box::new(element))
    }

    /// Mark a field optional.
    #[must_use]
    pub fn optional(spec: FieldSpec) -> Self {
        Self::Optional(Box::new(spec))
    }

    /// Mark a field optional with a default.
    #[must_use]
    pub fn with_default(spec: FieldSpec, value: Value) -> Self {
        Self::Default(Box::new(spec), value)
    }

    /// Whether this field (or anything nested in it) is array-valued.
    #[must_use]
    pub fn contains_array(&self) -> bool {
        match self {
            Self::Array(_) => true,
            Self::Optional(inner) | Self::Default(inner, _) => inner.contains_array(),
            Self::Object(shape) => shape.fields.values().any(FieldSpec::contains_array),
            _ => false,
        }
    }

    /// Whether absence of this field is acceptable.
    #[must_use]
    fn is_optional(&self) -> bool {
        matches!(self, Self::Optional(_) | Self::Default(_, _))
    }

    /// Render as a JSON-Schema fragment.
    #[must_use]
    pub fn to_json_schema(&self) -> Value {
        match self {
            Self::String {
                min,
                max,
                allowed,
                format,
            } => {
                let mut schema = Map::new();
                schema.insert("type".into(), json!("string"));
                if let Some(min) = min {
                    schema.insert("minLength".into(), json!(min));
                }
                if let Some(max) = max {
                    schema.insert("maxLength".into(), json!(max));
                }
                if let Some(allowed) = allowed {
                    schema.insert("enum".into(), json!(allowed));
                }
                if let Some(format) = format {
                    schema.insert("format".into(), json!(format));
                }
                Value::Object(schema)
            },
            Self::Number { min, max, integer } => {
                let mut schema = Map::new();
                schema.insert(
                    "type".into(),
                    json!(if *integer { "integer" } else { "number" }),
                );
                if let Some(min) = min {
                    schema.insert("minimum".into(), json!(min));
                }
                if let Some(max) = max {
                    schema.insert("maximum".into(), json!(max));
                }
                Value::Object(schema)
            },
            Self::Boolean => json!({"type": "boolean"}),
            Self::Array(element) => json!({"type": "array", "items": element.to_json_schema()}),
            Self::Object(shape) => shape.to_json_schema(),
            Self::Optional(inner) => inner.to_json_schema(),
            Self::Default(inner, value) => {
                let mut schema = inner.to_json_schema();
                if let Value::Object(map) = &mut schema {
                    map.insert("default".into(), value.clone());
                }
                schema
            },
            Self::Literal(value) => json!({"const": value}),
            Self::Any => json!({}),
        }
    }

    /// Validate one value against this spec, appending violations.
    fn validate_value(&self, value: &Value, path: &str, violations: &mut Vec<String>) {
        match self {
            Self::String {
                min,
                max,
                allowed,
                ..
            } => match value.as_str() {
                Some(s) => {
                    if min.is_some_and(|min| s.chars().count() < min) {
                        violations.push(format!("{path}: shorter than minimum length"));
                    }
                    if max.is_some_and(|max| s.chars().count() > max) {
                        violations.push(format!("{path}: longer than maximum length"));
                    }
                    if let Some(allowed) = allowed
                        && !allowed.iter().any(|a| a == s)
                    {
                        violations.push(format!("{path}: not one of the allowed values"));
                    }
                },
                None => violations.push(format!("{path}: expected string")),
            },
            Self::Number { min, max, integer } => match value.as_f64() {
                Some(n) => {
                    if *integer && value.as_i64().is_none() && value.as_u64().is_none() {
                        violations.push(format!("{path}: expected integer"));
                    }
                    if min.is_some_and(|min| n < min) {
                        violations.push(format!("{path}: below minimum"));
                    }
                    if max.is_some_and(|max| n > max) {
                        violations.push(format!("{path}: above maximum"));
                    }
                },
                None => violations.push(format!("{path}: expected number")),
            },
            Self::Boolean => {
                if !value.is_boolean() {
                    violations.push(format!("{path}: expected boolean"));
                }
            },
            Self::Array(element) => match value.as_array() {
                Some(items) => {
                    for (i, item) in items.iter().enumerate() {
                        element.validate_value(item, &format!("{path}[{i}]"), violations);
                    }
                },
                None => violations.push(format!("{path}: expected array")),
            },
            Self::Object(shape) => shape.validate_at(value, path, violations),
            Self::Optional(inner) | Self::Default(inner, _) => {
                inner.validate_value(value, path, violations);
            },
            Self::Literal(expected) => {
                if value != expected {
                    violations.push(format!("{path}: expected literal {expected}"));
                }
            },
            Self::Any => {},
        }
    }
}

/// An object-shaped input description: named fields, a required set, and
/// an additional-properties policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectShape {
    /// Field name → type.
    pub fields: BTreeMap<String, FieldSpec>,
    /// Names that must be present.
    pub required: BTreeSet<String>,
    /// Whether unknown properties are allowed.
    pub additional: bool,
}

impl ObjectShape {
    /// Empty shape allowing no fields.
    #[must_use]
    pub fn new() -> Self {
        Self {
            fields: BTreeMap::new(),
            required: BTreeSet::new(),
            additional: false,
        }
    }

    /// Add a field. `Optional` and `Default` fields are not required;
    /// everything else is.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        let name = name.into();
        if !spec.is_optional() {
            self.required.insert(name.clone());
        }
        self.fields.insert(name, spec);
        self
    }

    /// Allow properties beyond the declared fields.
    #[must_use]
    pub fn allow_additional(mut self) -> Self {
        self.additional = true;
        self
    }

    /// Render as a JSON-Schema object.
    #[must_use]
    pub fn to_json_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .fields
            .iter()
            .map(|(name, spec)| (name.clone(), spec.to_json_schema()))
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": self.required.iter().collect::<Vec<_>>(),
            "additionalProperties": self.additional,
        })
    }

    /// Validate a parameter object against this shape.
    ///
    /// # Errors
    ///
    /// Returns every violation found, with dotted paths.
    pub fn validate(&self, params: &Value) -> Result<(), Vec<String>> {
        let mut violations = Vec::new();
        self.validate_at(params, "params", &mut violations);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    fn validate_at(&self, value: &Value, path: &str, violations: &mut Vec<String>) {
        let Some(object) = value.as_object() else {
            violations.push(format!("{path}: expected object"));
            return;
        };

        for name in &self.required {
            if !object.contains_key(name) {
                violations.push(format!("{path}.{name}: missing required field"));
            }
        }

        for (name, field_value) in object {
            match self.fields.get(name) {
                Some(spec) => {
                    spec.validate_value(field_value, &format!("{path}.{name}"), violations);
                },
                None if self.additional => {},
                None => violations.push(format!("{path}.{name}: unknown field")),
            }
        }
    }

    /// Validate and fill `Default` fields that are absent.
    ///
    /// # Errors
    ///
    /// Returns the collected violations when validation fails; defaults
    /// are only injected into valid parameter objects.
    pub fn normalize(&self, params: Value) -> Result<Value, Vec<String>> {
        self.validate(&params)?;
        let mut params = params;
        if let Value::Object(object) = &mut params {
            for (name, spec) in &self.fields {
                if let FieldSpec::Default(_, default) = spec
                    && !object.contains_key(name)
                {
                    object.insert(name.clone(), default.clone());
                }
            }
        }
        Ok(params)
    }
}

impl Default for ObjectShape {
    fn default() -> Self {
        Self::new()
    }
}

/// A tool's schema, tagged by parameter complexity.
///
/// `Complex` shapes carry array-valued fields and take the registration
/// path that preserves array semantics in `tools/list`; `Simple` shapes
/// take the plain path. The tag is derived, never hand-picked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SchemaShape {
    /// Flat shape with no array-valued fields.
    Simple(ObjectShape),
    /// Shape carrying at least one array-valued field.
    Complex(ObjectShape),
}

impl SchemaShape {
    /// Wrap a shape, selecting the variant from its contents.
    #[must_use]
    pub fn of(shape: ObjectShape) -> Self {
        if shape.fields.values().any(FieldSpec::contains_array) {
            Self::Complex(shape)
        } else {
            Self::Simple(shape)
        }
    }

    /// The underlying object shape.
    #[must_use]
    pub fn shape(&self) -> &ObjectShape {
        match self {
            Self::Simple(shape) | Self::Complex(shape) => shape,
        }
    }

    /// Whether this is the array-bearing variant.
    #[must_use]
    pub fn is_complex(&self) -> bool {
        matches!(self, Self::Complex(_))
    }

    /// Render as a JSON-Schema object for `tools/list`.
    #[must_use]
    pub fn to_json_schema(&self) -> Value {
        self.shape().to_json_schema()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_shape() -> ObjectShape {
        ObjectShape::new()
            .field("target", FieldSpec::string())
            .field(
                "ports",
                FieldSpec::optional(FieldSpec::array(FieldSpec::integer())),
            )
            .field(
                "timing",
                FieldSpec::with_default(FieldSpec::string_enum(&["T1", "T3", "T5"]), serde_json::json!("T3")),
            )
    }

    #[test]
    fn array_fields_select_complex() {
        assert!(SchemaShape::of(scan_shape()).is_complex());
        let flat = ObjectShape::new().field("host", FieldSpec::string());
        assert!(!SchemaShape::of(flat).is_complex());
    }

    #[test]
    fn nested_array_still_selects_complex() {
        let shape = ObjectShape::new().field(
            "filter",
            FieldSpec::Object(
                ObjectShape::new().field("tags", FieldSpec::array(FieldSpec::string())),
            ),
        );
        assert!(SchemaShape::of(shape).is_complex());
    }

    #[test]
    fn missing_required_field_is_a_violation() {
        let err = scan_shape()
            .validate(&serde_json::json!({}))
            .unwrap_err();
        assert!(err.iter().any(|v| v.contains("target")));
    }

    #[test]
    fn unknown_field_rejected_unless_additional() {
        let shape = ObjectShape::new().field("host", FieldSpec::string());
        let params = serde_json::json!({"host": "h1", "extra": 1});
        assert!(shape.validate(&params).is_err());
        assert!(shape.allow_additional().validate(&params).is_ok());
    }

    #[test]
    fn enum_and_bounds_checked() {
        let params = serde_json::json!({"target": "10.0.0.0/24", "timing": "T9"});
        let err = scan_shape().validate(&params).unwrap_err();
        assert!(err.iter().any(|v| v.contains("timing")));

        let params = serde_json::json!({"target": "10.0.0.0/24", "ports": [22, "ssh"]});
        let err = scan_shape().validate(&params).unwrap_err();
        assert!(err.iter().any(|v| v.contains("ports[1]")));
    }

    #[test]
    fn normalize_fills_defaults() {
        let params = serde_json::json!({"target": "10.0.0.1"});
        let normalized = scan_shape().normalize(params).unwrap();
        assert_eq!(normalized["timing"], serde_json::json!("T3"));
    }

    #[test]
    fn json_schema_output_is_object_shaped() {
        let schema = SchemaShape::of(scan_shape()).to_json_schema();
        assert_eq!(schema["type"], serde_json::json!("object"));
        assert_eq!(schema["properties"]["ports"]["type"], serde_json::json!("array"));
        assert_eq!(
            schema["required"],
            serde_json::json!(["target"])
        );
    }

    #[test]
    fn shape_round_trips_through_serde() {
        let shape = SchemaShape::of(scan_shape());
        let json = serde_json::to_string(&shape).unwrap();
        let back: SchemaShape = serde_json::from_str(&json).unwrap();
        assert_eq!(back, shape);
    }
}
