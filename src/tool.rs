//! Tool descriptors, catalogs, and invocation outcomes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{ErrorKind, SessionError};
use crate::schema::ArgumentValidator;
use crate::types::{Tool, ToolAnnotations};

/// A tool as the session knows it after a listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: Option<String>,
    /// JSON Schema for the tool's arguments.
    pub input_schema: Value,
    pub annotations: Option<ToolAnnotations>,
    #[serde(skip)]
    validator: Option<ArgumentValidator>,
}

impl From<Tool> for ToolDescriptor {
    fn from(tool: Tool) -> Self {
        let validator = ArgumentValidator::new(&tool.input_schema);
        Self {
            name: tool.name,
            description: tool.description,
            input_schema: tool.input_schema,
            annotations: tool.annotations,
            validator: Some(validator),
        }
    }
}

impl ToolDescriptor {
    /// Check `arguments` against the input schema, returning the argument
    /// object ready to dispatch.
    ///
    /// Descriptors built from a listing carry the schema compiled; a
    /// deserialized descriptor compiles it on each call.
    pub fn validate(&self, arguments: &Value) -> Result<Map<String, Value>, SessionError> {
        let result = match &self.validator {
            Some(validator) => validator.validate(arguments),
            None => ArgumentValidator::new(&self.input_schema).validate(arguments),
        };
        result.map_err(|reason| {
            SessionError::ArgumentValidation {
                tool: self.name.clone(),
                reason,
            }
        })
    }

    /// Names listed under the schema's `required` key.
    pub fn required_fields(&self) -> Vec<&str> {
        self.input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    pub fn is_read_only(&self) -> bool {
        self.annotations
            .as_ref()
            .and_then(|a| a.read_only_hint)
            .unwrap_or(false)
    }
}

/// The tools returned by one listing, keyed by name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCatalog {
    tools: BTreeMap<String, ToolDescriptor>,
    fetched_at: DateTime<Utc>,
}

impl ToolCatalog {
    /// Build a catalog from listed tools, compiling each input schema. A
    /// repeated name replaces the earlier entry.
    pub fn from_tools(tools: impl IntoIterator<Item = Tool>) -> Self {
        let mut map = BTreeMap::new();
        for tool in tools {
            let descriptor = ToolDescriptor::from(tool);
            if let Some(previous) = map.insert(descriptor.name.clone(), descriptor) {
                warn!(
                    "Duplicate tool '{}' in listing; keeping the later entry",
                    previous.name
                );
            }
        }
        Self {
            tools: map,
            fetched_at: Utc::now(),
        }
    }

    /// An empty catalog, as held before the first listing.
    pub fn empty() -> Self {
        Self::from_tools(Vec::new())
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Tool names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.values()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// When the listing was fetched.
    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }
}

/// One caller request to run a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub tool_name: String,
    /// Argument object; `null` is treated as `{}`.
    #[serde(default)]
    pub arguments: Value,
}

impl InvocationRequest {
    pub fn new(tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            arguments,
        }
    }
}

/// Outcome of one invocation: the raw tool result, or the failure.
pub type InvocationResult = Result<Value, SessionError>;

/// Serializable form of an [`InvocationResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvocationReport {
    Success { payload: Value },
    Failure { kind: ErrorKind, message: String },
}

impl InvocationReport {
    pub fn is_success(&self) -> bool {
        matches!(self, InvocationReport::Success { .. })
    }
}

impl From<&InvocationResult> for InvocationReport {
    fn from(result: &InvocationResult) -> Self {
        match result {
            Ok(payload) => InvocationReport::Success {
                payload: payload.clone(),
            },
            Err(err) => InvocationReport::Failure {
                kind: err.kind(),
                message: err.to_string(),
            },
        }
    }
}

impl From<InvocationResult> for InvocationReport {
    fn from(result: InvocationResult) -> Self {
        match result {
            Ok(payload) => InvocationReport::Success { payload },
            Err(err) => InvocationReport::Failure {
                kind: err.kind(),
                message: err.to_string(),
            },
        }
    }
}
