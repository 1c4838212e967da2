//! Tool trait and registry: the abstraction over agent capabilities.
//!
//! Tools are what give the agent the ability to act in the world: execute
//! shell commands, read/write files, send messages, spawn subagents.
//!
//! The contract facing the model is deliberately forgiving: `ToolRegistry::
//! execute` never fails. Unknown names, invalid arguments, and execution
//! errors all come back as `"Error: ..."` strings appended as tool results,
//! so the model can observe the failure and self-correct. Internally tools
//! return `Result<String, ToolError>`; the conversion to a plain string
//! happens only at the registry boundary, keeping structured errors for
//! logging.

use crate::error::ToolError;
use crate::provider::ToolDefinition;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// The core Tool trait.
///
/// Context sensitivity is an explicit capability flag, not a runtime
/// downcast: tools that care about the current conversation override
/// `supports_context` and `set_context`, holding the per-turn identity
/// behind interior mutability.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g. "exec", "file_read").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> Value;

    /// Execute the tool with the given arguments.
    async fn execute(&self, arguments: Value) -> std::result::Result<String, ToolError>;

    /// Whether this tool observes the per-turn conversation context.
    fn supports_context(&self) -> bool {
        false
    }

    /// Receive the current conversation identity. Called once per turn,
    /// before any execution, for tools that return true from
    /// `supports_context`.
    fn set_context(&self, _channel: &str, _chat_id: &str) {}

    /// Convert this tool into a definition for the LLM request.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// A registry of available tools.
///
/// The turn engine uses this to:
/// 1. Get tool definitions to send to the LLM (registration order, so
///    prompts are reproducible)
/// 2. Look up, validate, and execute tools when the LLM requests them
///
/// One registry instance exists per concurrently-active conversation.
/// Registries are never shared across conversations; that is what makes
/// `set_context` safe without cross-turn leakage.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    /// Registration order, for deterministic definitions.
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Register a tool. Fails if a tool with the same name is present.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> std::result::Result<(), ToolError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(ToolError::DuplicateName(name));
        }
        self.order.push(name.clone());
        self.tools.insert(name, tool);
        Ok(())
    }

    /// Remove a tool by name.
    pub fn unregister(&mut self, name: &str) {
        if self.tools.remove(name).is_some() {
            self.order.retain(|n| n != name);
        }
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> std::result::Result<&Arc<dyn Tool>, ToolError> {
        self.tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))
    }

    /// All tool definitions in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|t| t.to_definition())
            .collect()
    }

    /// Registered tool names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.order.iter().map(|s| s.as_str()).collect()
    }

    /// Broadcast the current conversation identity to every context-aware
    /// tool. Must complete before any tool executes in the same turn.
    pub fn set_context(&self, channel: &str, chat_id: &str) {
        for name in &self.order {
            if let Some(tool) = self.tools.get(name)
                && tool.supports_context()
            {
                tool.set_context(channel, chat_id);
            }
        }
    }

    /// Execute a tool call. Never fails: every outcome is a string result
    /// for the model, with failures encoded as an `"Error: ..."` prefix.
    pub async fn execute(&self, name: &str, arguments: Value) -> String {
        let Some(tool) = self.tools.get(name) else {
            warn!(tool = name, "Unknown tool requested");
            return format!("Error: unknown tool '{name}'");
        };

        // Invalid arguments short-circuit before execute is reached.
        if let Err(e) = validate_arguments(&tool.parameters_schema(), &arguments) {
            warn!(tool = name, error = %e, "Tool arguments rejected");
            return format!("Error: {e}");
        }

        debug!(tool = name, "Executing tool");
        match tool.execute(arguments).await {
            Ok(output) => output,
            Err(e) => {
                warn!(tool = name, error = %e, "Tool execution failed");
                format!("Error: {e}")
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate arguments against the subset of JSON Schema tools declare:
/// the top-level `required` list and declared property types.
fn validate_arguments(schema: &Value, arguments: &Value) -> std::result::Result<(), ToolError> {
    let Some(obj) = arguments.as_object() else {
        return Err(ToolError::InvalidArguments(
            "arguments must be a JSON object".into(),
        ));
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if !obj.contains_key(field) {
                return Err(ToolError::InvalidArguments(format!(
                    "missing required argument '{field}'"
                )));
            }
        }
    }

    if let Some(props) = schema.get("properties").and_then(Value::as_object) {
        for (key, value) in obj {
            let Some(expected) = props.get(key).and_then(|p| p.get("type")) else {
                continue;
            };
            let Some(expected) = expected.as_str() else {
                continue;
            };
            let ok = match expected {
                "string" => value.is_string(),
                "integer" => value.is_i64() || value.is_u64(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !ok {
                return Err(ToolError::InvalidArguments(format!(
                    "argument '{key}' must be of type {expected}"
                )));
            }
        }
    }

    Ok(())
}
