//! Argument validation against a tool's declared input schema.
//!
//! Schemas are compiled with the `jsonschema` crate. One rule is added on
//! top of standard JSON Schema: at the top level, keys that are neither
//! declared in `properties` nor listed in `required` are rejected unless
//! the schema sets `additionalProperties: true`. Nested objects are closed
//! the same way when they declare `properties`. The rule is applied by
//! rewriting the schema before compilation, so every failure is reported
//! by the validator itself.

use std::fmt;
use std::sync::Arc;

use jsonschema::error::ValidationErrorKind;
use jsonschema::JSONSchema;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

/// Why a set of arguments was refused before dispatch.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("arguments must be a JSON object, got {found}")]
    NotAnObject { found: &'static str },

    #[error("missing required field '{path}'")]
    MissingRequired { path: String },

    #[error("unknown field '{path}'")]
    UnknownField { path: String },

    #[error("field '{path}' expected {expected}, got {found}")]
    TypeMismatch {
        path: String,
        expected: String,
        found: &'static str,
    },

    #[error("field '{path}' must be one of {allowed}")]
    NotInEnum { path: String, allowed: String },

    /// Any other schema keyword (`minimum`, `pattern`, ...).
    #[error("field '{path}' is invalid: {message}")]
    Constraint { path: String, message: String },
}

impl ValidationError {
    /// The offending field path, if the error concerns a single field.
    pub fn path(&self) -> Option<&str> {
        match self {
            ValidationError::NotAnObject { .. } => None,
            ValidationError::MissingRequired { path }
            | ValidationError::UnknownField { path }
            | ValidationError::TypeMismatch { path, .. }
            | ValidationError::NotInEnum { path, .. }
            | ValidationError::Constraint { path, .. } => Some(path),
        }
    }

    // Missing fields are reported before anything else, then by path.
    fn rank(&self) -> u8 {
        match self {
            ValidationError::NotAnObject { .. } => 0,
            ValidationError::MissingRequired { .. } => 1,
            _ => 2,
        }
    }
}

/// A tool's input schema, compiled once.
#[derive(Clone)]
pub struct ArgumentValidator {
    schema: Arc<Value>,
    compiled: Option<Arc<JSONSchema>>,
}

impl fmt::Debug for ArgumentValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArgumentValidator")
            .field("schema", &self.schema)
            .field("compiled", &self.compiled.is_some())
            .finish()
    }
}

impl PartialEq for ArgumentValidator {
    fn eq(&self, other: &Self) -> bool {
        self.schema == other.schema
    }
}

impl ArgumentValidator {
    /// Compile `schema`. A schema the validator cannot compile is logged
    /// and only the object check is applied.
    pub fn new(schema: &Value) -> Self {
        let mut effective = schema.clone();
        close_objects(&mut effective, true);

        let compiled = match JSONSchema::compile(&effective) {
            Ok(compiled) => Some(Arc::new(compiled)),
            Err(e) => {
                warn!("Input schema does not compile, skipping validation: {}", e);
                None
            }
        };

        Self {
            schema: Arc::new(effective),
            compiled,
        }
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.is_some()
    }

    /// Validate tool-call `arguments`.
    ///
    /// `null` is accepted as an empty argument object. On success the
    /// arguments are returned as the object map that goes on the wire.
    pub fn validate(&self, arguments: &Value) -> Result<Map<String, Value>, ValidationError> {
        let empty = Value::Object(Map::new());
        let instance = match arguments {
            Value::Null => &empty,
            Value::Object(_) => arguments,
            other => {
                return Err(ValidationError::NotAnObject {
                    found: json_type_name(other),
                })
            }
        };

        if let Some(compiled) = &self.compiled {
            if let Err(errors) = compiled.validate(instance) {
                let first = errors.map(|error| self.convert(&error)).min_by(|a, b| {
                    a.rank()
                        .cmp(&b.rank())
                        .then_with(|| a.path().cmp(&b.path()))
                });
                if let Some(error) = first {
                    return Err(error);
                }
            }
        }

        Ok(instance.as_object().cloned().unwrap_or_default())
    }

    fn convert(&self, error: &jsonschema::ValidationError<'_>) -> ValidationError {
        let path = pointer_to_path(&error.instance_path.to_string());
        let keyword = self.schema.pointer(&error.schema_path.to_string());

        match &error.kind {
            ValidationErrorKind::Required { property } => ValidationError::MissingRequired {
                path: join_path(&path, &value_as_key(property)),
            },
            ValidationErrorKind::AdditionalProperties { unexpected } => {
                let key = unexpected.iter().min().map(String::as_str).unwrap_or_default();
                ValidationError::UnknownField {
                    path: join_path(&path, key),
                }
            }
            ValidationErrorKind::Type { .. } => ValidationError::TypeMismatch {
                path,
                expected: keyword
                    .map(describe_types)
                    .unwrap_or_else(|| "another type".to_string()),
                found: json_type_name(&error.instance),
            },
            ValidationErrorKind::Enum { .. } => ValidationError::NotInEnum {
                path,
                allowed: keyword
                    .and_then(Value::as_array)
                    .map(|options| {
                        let options: Vec<String> = options.iter().map(Value::to_string).collect();
                        format!("[{}]", options.join(", "))
                    })
                    .unwrap_or_else(|| "the declared values".to_string()),
            },
            _ => ValidationError::Constraint {
                path,
                message: error.to_string(),
            },
        }
    }
}

/// Validate tool-call `arguments` against `schema`, compiling it first.
pub fn validate_arguments(
    schema: &Value,
    arguments: &Value,
) -> Result<Map<String, Value>, ValidationError> {
    ArgumentValidator::new(schema).validate(arguments)
}

// Sets `additionalProperties: false` on every object schema that should be
// closed, keeping `required`-only keys as accepted properties.
fn close_objects(schema: &mut Value, top_level: bool) {
    let Some(obj) = schema.as_object_mut() else {
        return;
    };

    let closed = match obj.get("additionalProperties") {
        Some(Value::Bool(false)) => true,
        Some(Value::Bool(true)) | Some(Value::Object(_)) => false,
        _ => top_level || obj.contains_key("properties"),
    };

    if let Some(Value::Object(properties)) = obj.get_mut("properties") {
        for property in properties.values_mut() {
            close_objects(property, false);
        }
    }
    match obj.get_mut("items") {
        Some(Value::Array(items)) => items.iter_mut().for_each(|item| close_objects(item, false)),
        Some(item) => close_objects(item, false),
        None => {}
    }
    if let Some(extra) = obj.get_mut("additionalProperties") {
        close_objects(extra, false);
    }

    if !closed {
        return;
    }

    let required: Vec<String> = obj
        .get("required")
        .and_then(Value::as_array)
        .map(|fields| fields.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();

    if let Value::Object(properties) = obj
        .entry("properties")
        .or_insert_with(|| Value::Object(Map::new()))
    {
        for field in required {
            properties
                .entry(field)
                .or_insert_with(|| Value::Object(Map::new()));
        }
    }
    obj.insert("additionalProperties".to_string(), Value::Bool(false));
}

fn describe_types(expected: &Value) -> String {
    match expected {
        Value::String(name) => name.clone(),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" or "),
        other => other.to_string(),
    }
}

fn value_as_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `/origin/lat` becomes `origin.lat`; `/waypoints/1` becomes `waypoints[1]`.
fn pointer_to_path(pointer: &str) -> String {
    let mut path = String::new();
    for segment in pointer.split('/').skip(1) {
        let segment = segment.replace("~1", "/").replace("~0", "~");
        if !path.is_empty() && segment.parse::<usize>().is_ok() {
            path.push_str(&format!("[{}]", segment));
        } else {
            path = join_path(&path, &segment);
        }
    }
    path
}

fn join_path(parent: &str, field: &str) -> String {
    if parent.is_empty() {
        field.to_string()
    } else {
        format!("{}.{}", parent, field)
    }
}

/// JSON type name used in error messages.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
