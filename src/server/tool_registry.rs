//! Tool registry — declares callable tools and validates/dispatches calls
//! made by the agent loop.
//!
//! Mirrors the dispatch shape of a provider-facing tool registry: a tool has
//! a name, a description, a JSON Schema describing its arguments, and an
//! async handler. Schemas are represented with `schemars` (the same crate
//! used for schema representation elsewhere in the agent-framework
//! ecosystem); validating an incoming call's `arguments` against that schema
//! is a small hand-rolled structural check rather than a dependency on a
//! full JSON Schema validator, since this workspace's toolchain has none.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde_json::Value;

use crate::error::{A2AError, A2AResult};

/// Build a tool's `parameters` schema from a typed argument struct.
///
/// Tool authors define their arguments as an ordinary `#[derive(JsonSchema)]`
/// struct and call this instead of hand-writing the `serde_json::json!`
/// schema literal — the common case for any tool with more than one or two
/// parameters.
pub fn schema_for<T: JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or(Value::Null)
}

/// Ceiling on any single string or byte-array argument value, in bytes.
///
/// Guards against a misbehaving or adversarial caller handing the agent loop
/// an oversized tool argument that would otherwise be forwarded verbatim
/// into an LLM prompt or a downstream handler.
pub const MAX_ARGUMENT_VALUE_BYTES: usize = 1024 * 1024;

/// A tool a registered [`ToolHandler`] can be invoked to perform.
///
/// `parameters` is a JSON Schema object (typically produced via
/// `schemars::schema_for!` on a handler's argument struct, or hand-written
/// for simple tools) describing the shape of `arguments` passed to
/// [`ToolRegistry::invoke`].
pub struct Tool {
    /// Unique name, as referenced by `Part::ToolCall::name`.
    pub name: String,
    /// Human/LLM-facing description of what the tool does.
    pub description: String,
    /// JSON Schema (subset) describing accepted arguments.
    pub parameters: Value,
    /// The handler invoked with validated arguments.
    pub handler: Arc<dyn ToolHandler>,
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

/// Behavior of a registered tool.
///
/// Implementations should be stateless, or internally synchronize their own
/// state — the agent loop may invoke multiple tool calls from the same
/// iteration concurrently (see the agent loop's tool dispatch).
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Execute the tool with already-validated arguments.
    ///
    /// Returning `Err` produces a `Part::ToolResult { is_error: true, .. }`
    /// rather than failing the enclosing task — a tool error is recoverable
    /// within the agent loop (the LLM sees the failure and can retry or
    /// change course).
    async fn call(&self, arguments: Value) -> A2AResult<Value>;
}

/// Registry of tools available to the agent loop.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Tool>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool.
    ///
    /// Fails with `Err(A2AError::DuplicateId)` if a tool with the same name
    /// is already registered — unlike a task store, there's no legitimate
    /// reason for a second registration to silently win.
    pub fn register(&mut self, tool: Tool) -> A2AResult<()> {
        if self.tools.contains_key(&tool.name) {
            return Err(A2AError::duplicate_id(format!(
                "tool '{}' is already registered",
                tool.name
            )));
        }
        self.tools.insert(tool.name.clone(), tool);
        Ok(())
    }

    /// List every registered tool's name/description/schema — what gets
    /// advertised to the LLM provider as available functions.
    pub fn list(&self) -> Vec<(&str, &str, &Value)> {
        self.tools
            .values()
            .map(|t| (t.name.as_str(), t.description.as_str(), &t.parameters))
            .collect()
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name)
    }

    /// Validate `arguments` against the named tool's schema, then invoke it.
    ///
    /// Returns `Err(A2AError::ValidationError)` if arguments don't satisfy
    /// the schema, `Err(A2AError::ToolError)` if the tool itself isn't
    /// registered or its handler returns an error.
    pub async fn invoke(&self, name: &str, arguments: Value) -> A2AResult<Value> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| A2AError::tool_error(format!("unknown tool: {}", name)))?;

        validate_arguments(&tool.parameters, &arguments)?;

        tool.handler.call(arguments).await
    }
}

/// Structural validation of `arguments` against a JSON Schema object subset:
/// required properties are present, and declared `type`s match. Not a full
/// JSON Schema implementation — no `$ref`, `oneOf`, `pattern`, etc. — just
/// enough to catch the common shape mistakes an LLM-generated tool call
/// makes.
pub fn validate_arguments(schema: &Value, arguments: &Value) -> A2AResult<()> {
    let Some(schema_obj) = schema.as_object() else {
        return Ok(());
    };

    let Some(args_obj) = arguments.as_object() else {
        return Err(A2AError::validation_error(
            "tool arguments must be a JSON object",
        ));
    };

    if let Some(required) = schema_obj.get("required").and_then(|v| v.as_array()) {
        for req in required {
            if let Some(key) = req.as_str() {
                if !args_obj.contains_key(key) {
                    return Err(A2AError::validation_error(format!(
                        "missing required argument: {}",
                        key
                    )));
                }
            }
        }
    }

    if let Some(properties) = schema_obj.get("properties").and_then(|v| v.as_object()) {
        for (key, value) in args_obj {
            let Some(prop_schema) = properties.get(key).and_then(|v| v.as_object()) else {
                continue;
            };
            if let Some(expected_type) = prop_schema.get("type").and_then(|v| v.as_str()) {
                if !json_type_matches(expected_type, value) {
                    return Err(A2AError::validation_error(format!(
                        "argument '{}' expected type {}, got {}",
                        key,
                        expected_type,
                        json_type_name(value)
                    )));
                }
            }
            check_size_ceiling(key, value)?;
        }
    }

    Ok(())
}

fn json_type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::String(_) => "string",
        Value::Number(_) => "number",
        Value::Bool(_) => "boolean",
        Value::Object(_) => "object",
        Value::Array(_) => "array",
        Value::Null => "null",
    }
}

fn check_size_ceiling(key: &str, value: &Value) -> A2AResult<()> {
    let size = match value {
        Value::String(s) => s.len(),
        other => other.to_string().len(),
    };
    if size > MAX_ARGUMENT_VALUE_BYTES {
        return Err(A2AError::validation_error(format!(
            "argument '{}' exceeds the {} byte size ceiling",
            key, MAX_ARGUMENT_VALUE_BYTES
        )));
    }
    Ok(())
}

/// Ceiling on a tool's returned result, in bytes. Applies the same limit as
/// [`MAX_ARGUMENT_VALUE_BYTES`] to the value a handler hands back, not just
/// to what the LLM passed in — a tool can return an arbitrarily large blob
/// even when its arguments were tiny.
pub fn check_result_size_ceiling(content: &Value) -> A2AResult<()> {
    let size = match content {
        Value::String(s) => s.len(),
        other => other.to_string().len(),
    };
    if size > MAX_ARGUMENT_VALUE_BYTES {
        return Err(A2AError::validation_error(format!(
            "tool result exceeds the {} byte size ceiling",
            MAX_ARGUMENT_VALUE_BYTES
        )));
    }
    Ok(())
}

/// Built-in tool the agent loop always has available: an explicit request
/// that the task transition to `input-required`. Lets an agent that only
/// knows how to call tools ask for clarification without the agent loop
/// needing special-case logic.
pub fn input_required_tool() -> Tool {
    struct InputRequiredHandler;

    #[async_trait]
    impl ToolHandler for InputRequiredHandler {
        async fn call(&self, arguments: Value) -> A2AResult<Value> {
            Ok(arguments)
        }
    }

    Tool {
        name: INPUT_REQUIRED_TOOL_NAME.to_string(),
        description: "Ask the user for additional input before continuing.".to_string(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "prompt": { "type": "string" }
            },
            "required": ["prompt"]
        }),
        handler: Arc::new(InputRequiredHandler),
    }
}

/// Name of the built-in tool the agent loop recognizes as a request to
/// suspend the task into `input-required` rather than an ordinary tool call.
pub const INPUT_REQUIRED_TOOL_NAME: &str = "input_required";
