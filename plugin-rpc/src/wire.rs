//! Frame and payload types for the newline-delimited JSON RPC stream.
//!
//! Every frame is a single line of JSON. Requests flow host → plugin,
//! responses flow plugin → host and echo the request `id`. Payload
//! structs here are the canonical schema for both sides; the host never
//! interprets a tool's `result` string beyond passing it upward.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// RPC method names a plugin may be asked to service.
///
/// `DEFINITION`, `CALL`, and `SHUTDOWN` are mandatory; the rest are
/// optional capabilities a plugin opts into by answering them.
pub mod method {
    pub const DEFINITION: &str = "definition";
    pub const CALL: &str = "call";
    pub const SHUTDOWN: &str = "shutdown";

    pub const VERSION: &str = "version";
    pub const METADATA: &str = "metadata";
    pub const COMPATIBILITY: &str = "compatibility";
    pub const REQUIRED_CONFIG: &str = "required_config";
    pub const VALIDATE_CONFIG: &str = "validate_config";
    pub const INITIALIZE_WITH_CONFIG: &str = "initialize_with_config";
    pub const SET_AGENT_CONTEXT: &str = "set_agent_context";
    pub const WEB_PAGE_LIST: &str = "web_page_list";
    pub const SERVE_WEB_PAGE: &str = "serve_web_page";
    pub const HEALTH_CHECK: &str = "health_check";
}

/// Error codes carried in [`RpcError`].
pub mod code {
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL: i32 = -32603;
    /// The tool ran and reported an application-level failure.
    pub const CALL_FAILED: i32 = 1000;
}

/// A single request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }
}

/// Structured error attached to a failed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

/// A single response frame. Exactly one of `result` / `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, code: i32, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// The tool schema a plugin declares in answer to `definition`.
///
/// `parameters_schema` is a JSON-Schema-shaped object; the host
/// validates required keys and enum membership against it before
/// dispatching a call and otherwise passes arguments through untouched.
/// A plugin whose calls legitimately run long can raise the host's
/// default per-call timeout via `timeout_secs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Context pushed alongside each `call`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallContext {
    /// Name of the agent on whose behalf the call runs, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

/// Parameters of a `call` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallParams {
    /// Raw JSON arguments, serialized. Conforms to the declared
    /// `parameters_schema` as far as the host validates it.
    pub args_json: String,
    #[serde(default)]
    pub context: CallContext,
}

/// Result of a `call`. Plugins may embed structured payloads (table,
/// modal, json, ...) inside `result`; the host treats it as opaque text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallResult {
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Answer to `version`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
}

/// Answer to `metadata`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginMetadata {
    #[serde(default)]
    pub license: String,
    #[serde(default)]
    pub maintainers: Vec<String>,
    #[serde(default)]
    pub repository: String,
}

/// Answer to `compatibility`: the host-version bounds a plugin accepts.
///
/// Versions are dotted strings compared segment-wise. A host older than
/// `min_host_version` or newer than `max_host_version` must not enable
/// the plugin; a host older than `recommended_host_version` gets a
/// warning through the health subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Compatibility {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_host_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_host_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_host_version: Option<String>,
    #[serde(default)]
    pub api_version: u32,
}

/// One configuration variable declared by `required_config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigVar {
    pub key: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// Parameters of `validate_config` / `initialize_with_config`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigParams {
    #[serde(default)]
    pub config: HashMap<String, String>,
}

/// Answer to `validate_config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Parameters of `set_agent_context`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentContext {
    pub agent_name: String,
    /// Directory the host reserves for this agent's plugin state; the
    /// plugin must not write outside it.
    pub config_dir: String,
}

/// One entry in the `web_page_list` answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebPage {
    pub path: String,
    pub title: String,
}

/// Parameters of `serve_web_page`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebPageParams {
    pub path: String,
    #[serde(default)]
    pub query: HashMap<String, String>,
}

/// Answer to `serve_web_page`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebPageContent {
    pub body: String,
    pub content_type: String,
}

/// Answer to `health_check`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
