//! Declarative tool parameter schemas.
//!
//! Tool descriptors carry a typed schema instead of free-form keyword
//! arguments: a flat object with named fields, each a scalar, array, or
//! object kind, optionally restricted to an enumerated value set. The
//! dispatcher validates every `tools/call` against the schema centrally and
//! rejects mismatches with a field-level message; handlers only ever see
//! arguments that passed.
//!
//! Schemas render to JSON Schema for `tools/list`.

use crate::error::{ToolError, ToolResult};
use serde_json::{json, Map, Value};

/// The type of a single parameter field.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Array(Box<ParamKind>),
    Object,
    /// Unconstrained; used for heterogeneous array items.
    Any,
}

impl ParamKind {
    fn json_type(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array(_) => "array",
            Self::Object => "object",
            Self::Any => "",
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array(item) => value
                .as_array()
                .is_some_and(|items| items.iter().all(|v| item.matches(v))),
            Self::Object => value.is_object(),
            Self::Any => true,
        }
    }
}

/// One named field in a parameter schema.
#[derive(Debug, Clone)]
pub struct ParamField {
    pub name: &'static str,
    pub kind: ParamKind,
    pub description: &'static str,
    pub required: bool,
    pub allowed: Option<Vec<&'static str>>,
    pub default: Option<Value>,
}

impl ParamField {
    pub fn required(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            description,
            required: true,
            allowed: None,
            default: None,
        }
    }

    pub fn optional(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            description,
            required: false,
            allowed: None,
            default: None,
        }
    }

    /// Restrict a string field to an enumerated value set.
    pub fn one_of(mut self, values: &[&'static str]) -> Self {
        self.allowed = Some(values.to_vec());
        self
    }

    /// Value substituted when the caller omits the field.
    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// A flat object schema: the only parameter shape tools accept.
#[derive(Debug, Clone, Default)]
pub struct ParamSchema {
    fields: Vec<ParamField>,
}

impl ParamSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, field: ParamField) -> Self {
        self.fields.push(field);
        self
    }

    pub fn fields(&self) -> &[ParamField] {
        &self.fields
    }

    /// Validate arguments, returning the argument map with defaults applied.
    ///
    /// Fails with a message naming the offending field. Unknown fields are
    /// rejected rather than silently dropped.
    pub fn validate(&self, args: &Value) -> ToolResult<Map<String, Value>> {
        let mut map = match args {
            Value::Null => Map::new(),
            Value::Object(map) => map.clone(),
            other => {
                return Err(ToolError::InvalidArguments(format!(
                    "arguments must be an object, got {}",
                    json_type_name(other)
                )))
            }
        };

        for key in map.keys() {
            if !self.fields.iter().any(|f| f.name == key) {
                return Err(ToolError::InvalidArguments(format!(
                    "unknown field `{}`",
                    key
                )));
            }
        }

        for field in &self.fields {
            match map.get(field.name) {
                None | Some(Value::Null) => {
                    if let Some(default) = &field.default {
                        map.insert(field.name.to_string(), default.clone());
                    } else if field.required {
                        return Err(ToolError::InvalidArguments(format!(
                            "missing required field `{}`",
                            field.name
                        )));
                    } else {
                        map.remove(field.name);
                    }
                }
                Some(value) => {
                    if !field.kind.matches(value) {
                        return Err(ToolError::InvalidArguments(format!(
                            "field `{}` must be {}, got {}",
                            field.name,
                            field.kind.json_type(),
                            json_type_name(value)
                        )));
                    }
                    if let Some(allowed) = &field.allowed {
                        let ok = value
                            .as_str()
                            .is_some_and(|s| allowed.iter().any(|a| *a == s));
                        if !ok {
                            return Err(ToolError::InvalidArguments(format!(
                                "field `{}` must be one of [{}]",
                                field.name,
                                allowed.join(", ")
                            )));
                        }
                    }
                }
            }
        }

        Ok(map)
    }

    /// Render as JSON Schema for the `tools/list` wire format.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();

        for field in &self.fields {
            let mut prop = Map::new();
            if !matches!(field.kind, ParamKind::Any) {
                prop.insert("type".into(), json!(field.kind.json_type()));
            }
            if !field.description.is_empty() {
                prop.insert("description".into(), json!(field.description));
            }
            if let ParamKind::Array(item) = &field.kind {
                let items = if matches!(**item, ParamKind::Any) {
                    json!({})
                } else {
                    json!({ "type": item.json_type() })
                };
                prop.insert("items".into(), items);
            }
            if let Some(allowed) = &field.allowed {
                prop.insert("enum".into(), json!(allowed));
            }
            if let Some(default) = &field.default {
                prop.insert("default".into(), default.clone());
            }
            properties.insert(field.name.to_string(), Value::Object(prop));

            if field.required {
                required.push(field.name);
            }
        }

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// Typed accessors for validated argument maps. Tools call these after the
// dispatcher has validated, so a miss is a contract bug, not user input.

pub fn str_arg<'a>(args: &'a Map<String, Value>, name: &str) -> ToolResult<&'a str> {
    args.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::Internal(format!("validated field `{}` missing", name)))
}

pub fn opt_str_arg<'a>(args: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    args.get(name).and_then(Value::as_str)
}

pub fn opt_u64_arg(args: &Map<String, Value>, name: &str) -> ToolResult<Option<u64>> {
    match args.get(name) {
        None => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| ToolError::InvalidArguments(format!("field `{}` must be >= 0", name))),
    }
}

pub fn bool_arg(args: &Map<String, Value>, name: &str, default: bool) -> bool {
    args.get(name).and_then(Value::as_bool).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ParamSchema {
        ParamSchema::new()
            .field(ParamField::required(
                "path",
                ParamKind::String,
                "File to read",
            ))
            .field(
                ParamField::optional("limit", ParamKind::Integer, "Max entries")
                    .with_default(json!(100)),
            )
            .field(
                ParamField::optional("mode", ParamKind::String, "Render mode")
                    .one_of(&["plain", "numbered"]),
            )
    }

    #[test]
    fn accepts_valid_arguments_and_applies_defaults() {
        let args = sample().validate(&json!({ "path": "/tmp/a" })).unwrap();
        assert_eq!(args["path"], "/tmp/a");
        assert_eq!(args["limit"], 100);
        assert!(!args.contains_key("mode"));
    }

    #[test]
    fn rejects_missing_required_field() {
        let err = sample().validate(&json!({})).unwrap_err();
        assert!(err.to_string().contains("`path`"));
    }

    #[test]
    fn rejects_wrong_type_with_field_name() {
        let err = sample()
            .validate(&json!({ "path": "/tmp/a", "limit": "ten" }))
            .unwrap_err();
        assert!(err.to_string().contains("`limit`"));
        assert!(err.to_string().contains("integer"));
    }

    #[test]
    fn rejects_unknown_field() {
        let err = sample()
            .validate(&json!({ "path": "/tmp/a", "bogus": 1 }))
            .unwrap_err();
        assert!(err.to_string().contains("`bogus`"));
    }

    #[test]
    fn rejects_value_outside_enumeration() {
        let err = sample()
            .validate(&json!({ "path": "/tmp/a", "mode": "fancy" }))
            .unwrap_err();
        assert!(err.to_string().contains("one of"));
    }

    #[test]
    fn null_arguments_mean_empty_object() {
        let schema = ParamSchema::new().field(ParamField::optional(
            "limit",
            ParamKind::Integer,
            "Max entries",
        ));
        assert!(schema.validate(&Value::Null).is_ok());
    }

    #[test]
    fn array_kind_checks_item_types() {
        let schema = ParamSchema::new().field(ParamField::required(
            "names",
            ParamKind::Array(Box::new(ParamKind::String)),
            "Names",
        ));
        assert!(schema.validate(&json!({ "names": ["a", "b"] })).is_ok());
        assert!(schema.validate(&json!({ "names": ["a", 3] })).is_err());
    }

    #[test]
    fn renders_json_schema() {
        let rendered = sample().to_json_schema();
        assert_eq!(rendered["type"], "object");
        assert_eq!(rendered["properties"]["path"]["type"], "string");
        assert_eq!(rendered["properties"]["mode"]["enum"][0], "plain");
        assert_eq!(rendered["required"][0], "path");
    }
}
