//! Tool abstraction between the chat core and tool providers.
//!
//! Tools reach agents through the [`ToolDispatcher`] trait: the plugin
//! runtime implements it over out-of-process plugins, and tests dial in
//! in-process dispatchers. [`ToolMetadata`] describes a tool's identity
//! and JSON-Schema parameters; [`validate_args`] performs the host-side
//! pre-dispatch check.
//!
//! Validation is deliberately shallow: required-key presence and enum
//! membership only. Anything deeper is the tool's own business — plugins
//! may legitimately accept fields the schema does not mention.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agenthub::client_wrapper::ToolDefinition;

/// Metadata about a tool: identity, description, and the JSON-Schema
/// shaped parameter declaration supplied by its provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
    /// JSON-Schema object: `{"type":"object","properties":{...},"required":[...]}`.
    pub parameters_schema: Value,
    /// Additional metadata specific to the providing protocol.
    #[serde(default)]
    pub protocol_metadata: HashMap<String, Value>,
}

impl ToolMetadata {
    pub fn new(name: impl Into<String>, description: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters_schema: schema,
            protocol_metadata: HashMap::new(),
        }
    }

    /// Convert into the [`ToolDefinition`] shape shipped to LLM providers.
    pub fn to_tool_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters_schema: self.parameters_schema.clone(),
        }
    }
}

/// Error types for tool operations.
#[derive(Debug, Clone)]
pub enum ToolError {
    /// Requested tool is not available to the agent.
    NotFound(String),
    /// The provided JSON parameters failed validation.
    InvalidParameters(String),
    /// Tool execution completed with an application level failure.
    ExecutionFailed(String),
    /// The call exceeded its per-call timeout.
    Timeout(String),
    /// The tool process died mid-call.
    Crashed(String),
    /// A lower level protocol/transport error occurred.
    ProtocolError(String),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::NotFound(name) => write!(f, "Tool not found: {}", name),
            ToolError::InvalidParameters(msg) => write!(f, "Invalid parameters: {}", msg),
            ToolError::ExecutionFailed(msg) => write!(f, "Tool execution failed: {}", msg),
            ToolError::Timeout(msg) => write!(f, "Tool call timed out: {}", msg),
            ToolError::Crashed(msg) => write!(f, "Tool process crashed: {}", msg),
            ToolError::ProtocolError(msg) => write!(f, "Protocol error: {}", msg),
        }
    }
}

impl Error for ToolError {}

/// Validate `args` against a JSON-Schema shaped parameter declaration.
///
/// Checks exactly two things:
/// 1. every name in the schema's `required` array is present;
/// 2. any supplied value whose property declares an `enum` is a member.
///
/// Extra fields pass untouched.
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), ToolError> {
    let required: Vec<&str> = schema
        .get("required")
        .and_then(|r| r.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();

    let args_obj = match args.as_object() {
        Some(obj) => obj,
        None => {
            if required.is_empty() {
                return Ok(());
            }
            return Err(ToolError::InvalidParameters(format!(
                "arguments must be an object with required keys: {}",
                required.join(", ")
            )));
        }
    };

    for key in &required {
        if !args_obj.contains_key(*key) {
            return Err(ToolError::InvalidParameters(format!(
                "missing required parameter: {}",
                key
            )));
        }
    }

    if let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) {
        for (key, prop) in properties {
            let (value, allowed) = match (args_obj.get(key), prop.get("enum").and_then(|e| e.as_array())) {
                (Some(v), Some(a)) => (v, a),
                _ => continue,
            };
            if !allowed.contains(value) {
                return Err(ToolError::InvalidParameters(format!(
                    "parameter {} must be one of {}",
                    key,
                    serde_json::to_string(allowed).unwrap_or_else(|_| "[]".to_string())
                )));
            }
        }
    }

    Ok(())
}

/// The seam through which the chat core reaches tools on behalf of an
/// agent. The plugin runtime is the production implementation.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    /// Metadata for every tool currently available to `agent`.
    async fn list_tools(&self, agent: &str) -> Vec<ToolMetadata>;

    /// Execute `tool_name` with pre-validated arguments. The result is
    /// an opaque string; structured payloads stay embedded.
    async fn call_tool(
        &self,
        agent: &str,
        tool_name: &str,
        args: Value,
    ) -> Result<String, ToolError>;
}
