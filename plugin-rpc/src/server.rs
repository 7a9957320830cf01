//! Plugin-side runtime: implement [`PluginHandler`], hand it to
//! [`serve`], and the loop below owns handshake emission, frame
//! decoding, dispatch, and the `shutdown` exit path.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::handshake::handshake_line;
use crate::wire::{
    code, method, AgentContext, CallContext, CallParams, CallResult, Compatibility, ConfigParams,
    ConfigVar, HealthStatus, PluginMetadata, RpcRequest, RpcResponse, ToolDefinition,
    ValidationOutcome, VersionInfo, WebPage, WebPageContent, WebPageParams,
};

/// The surface a plugin executable implements.
///
/// `definition` and `call` are mandatory. Every other method has a
/// default that reports the capability as absent, so a minimal plugin
/// implements exactly two items.
#[async_trait]
pub trait PluginHandler: Send + Sync {
    /// The tool this plugin contributes.
    fn definition(&self) -> ToolDefinition;

    /// Execute the tool. `args` has already been parsed from the host's
    /// `args_json`. Return `Err` for application-level failures; the
    /// message travels back to the model as an error tool-result.
    async fn call(&self, args: Value, context: CallContext) -> Result<String, String>;

    fn version(&self) -> Option<VersionInfo> {
        None
    }

    fn metadata(&self) -> Option<PluginMetadata> {
        None
    }

    fn compatibility(&self) -> Option<Compatibility> {
        None
    }

    fn required_config(&self) -> Vec<ConfigVar> {
        Vec::new()
    }

    async fn validate_config(&self, _config: &HashMap<String, String>) -> Result<(), String> {
        Ok(())
    }

    async fn initialize_with_config(
        &self,
        _config: HashMap<String, String>,
    ) -> Result<(), String> {
        Ok(())
    }

    async fn set_agent_context(&self, _context: AgentContext) {}

    fn web_pages(&self) -> Vec<WebPage> {
        Vec::new()
    }

    async fn serve_web_page(
        &self,
        _path: &str,
        _query: &HashMap<String, String>,
    ) -> Result<WebPageContent, String> {
        Err("plugin serves no web pages".to_string())
    }

    async fn health_check(&self) -> HealthStatus {
        HealthStatus {
            healthy: true,
            message: None,
        }
    }
}

/// Dispatch one request to the handler. Separated from [`serve`] so the
/// routing logic is testable without real stdio.
pub async fn handle_request<H: PluginHandler>(handler: &H, req: RpcRequest) -> RpcResponse {
    let id = req.id;
    match req.method.as_str() {
        method::DEFINITION => match serde_json::to_value(handler.definition()) {
            Ok(v) => RpcResponse::ok(id, v),
            Err(e) => RpcResponse::err(id, code::INTERNAL, e.to_string()),
        },
        method::CALL => {
            let params: CallParams = match serde_json::from_value(req.params) {
                Ok(p) => p,
                Err(e) => return RpcResponse::err(id, code::INVALID_PARAMS, e.to_string()),
            };
            let args: Value = match serde_json::from_str(&params.args_json) {
                Ok(v) => v,
                Err(e) => {
                    return RpcResponse::err(
                        id,
                        code::INVALID_PARAMS,
                        format!("args_json is not valid JSON: {}", e),
                    )
                }
            };
            match handler.call(args, params.context).await {
                Ok(result) => RpcResponse::ok(
                    id,
                    serde_json::to_value(CallResult {
                        result,
                        error: None,
                    })
                    .unwrap_or(Value::Null),
                ),
                Err(message) => RpcResponse::err(id, code::CALL_FAILED, message),
            }
        }
        method::VERSION => optional(id, handler.version()),
        method::METADATA => optional(id, handler.metadata()),
        method::COMPATIBILITY => optional(id, handler.compatibility()),
        method::REQUIRED_CONFIG => match serde_json::to_value(handler.required_config()) {
            Ok(v) => RpcResponse::ok(id, v),
            Err(e) => RpcResponse::err(id, code::INTERNAL, e.to_string()),
        },
        method::VALIDATE_CONFIG => {
            let params: ConfigParams = match serde_json::from_value(req.params) {
                Ok(p) => p,
                Err(e) => return RpcResponse::err(id, code::INVALID_PARAMS, e.to_string()),
            };
            let outcome = match handler.validate_config(&params.config).await {
                Ok(()) => ValidationOutcome {
                    ok: true,
                    message: None,
                },
                Err(message) => ValidationOutcome {
                    ok: false,
                    message: Some(message),
                },
            };
            RpcResponse::ok(id, serde_json::to_value(outcome).unwrap_or(Value::Null))
        }
        method::INITIALIZE_WITH_CONFIG => {
            let params: ConfigParams = match serde_json::from_value(req.params) {
                Ok(p) => p,
                Err(e) => return RpcResponse::err(id, code::INVALID_PARAMS, e.to_string()),
            };
            match handler.initialize_with_config(params.config).await {
                Ok(()) => RpcResponse::ok(id, Value::Null),
                Err(message) => RpcResponse::err(id, code::CALL_FAILED, message),
            }
        }
        method::SET_AGENT_CONTEXT => {
            let context: AgentContext = match serde_json::from_value(req.params) {
                Ok(c) => c,
                Err(e) => return RpcResponse::err(id, code::INVALID_PARAMS, e.to_string()),
            };
            handler.set_agent_context(context).await;
            RpcResponse::ok(id, Value::Null)
        }
        method::WEB_PAGE_LIST => match serde_json::to_value(handler.web_pages()) {
            Ok(v) => RpcResponse::ok(id, v),
            Err(e) => RpcResponse::err(id, code::INTERNAL, e.to_string()),
        },
        method::SERVE_WEB_PAGE => {
            let params: WebPageParams = match serde_json::from_value(req.params) {
                Ok(p) => p,
                Err(e) => return RpcResponse::err(id, code::INVALID_PARAMS, e.to_string()),
            };
            match handler.serve_web_page(&params.path, &params.query).await {
                Ok(content) => {
                    RpcResponse::ok(id, serde_json::to_value(content).unwrap_or(Value::Null))
                }
                Err(message) => RpcResponse::err(id, code::CALL_FAILED, message),
            }
        }
        method::HEALTH_CHECK => {
            let status = handler.health_check().await;
            RpcResponse::ok(id, serde_json::to_value(status).unwrap_or(Value::Null))
        }
        method::SHUTDOWN => RpcResponse::ok(id, Value::Null),
        other => RpcResponse::err(
            id,
            code::METHOD_NOT_FOUND,
            format!("unknown method: {}", other),
        ),
    }
}

fn optional<T: serde::Serialize>(id: u64, value: Option<T>) -> RpcResponse {
    match value {
        Some(v) => match serde_json::to_value(v) {
            Ok(v) => RpcResponse::ok(id, v),
            Err(e) => RpcResponse::err(id, code::INTERNAL, e.to_string()),
        },
        None => RpcResponse::ok(id, Value::Null),
    }
}

/// Run the plugin main loop over real stdin/stdout until the host sends
/// `shutdown` or closes the pipe.
pub async fn serve<H: PluginHandler>(handler: H) -> std::io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(format!("{}\n", handshake_line()).as_bytes())
        .await?;
    stdout.flush().await?;

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let req: RpcRequest = match serde_json::from_str(&line) {
            Ok(r) => r,
            // Unparseable frame: no id to answer with, drop it.
            Err(_) => continue,
        };
        let is_shutdown = req.method == method::SHUTDOWN;
        let resp = handle_request(&handler, req).await;
        let mut out = serde_json::to_string(&resp).map_err(std::io::Error::other)?;
        out.push('\n');
        stdout.write_all(out.as_bytes()).await?;
        stdout.flush().await?;
        if is_shutdown {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Adder;

    #[async_trait]
    impl PluginHandler for Adder {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "adder".to_string(),
                description: "Adds a and b.".to_string(),
                parameters_schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "a": {"type": "number"},
                        "b": {"type": "number"}
                    },
                    "required": ["a", "b"]
                }),
                timeout_secs: None,
            }
        }

        async fn call(&self, args: Value, _context: CallContext) -> Result<String, String> {
            let a = args["a"].as_f64().ok_or("a missing")?;
            let b = args["b"].as_f64().ok_or("b missing")?;
            Ok(format!("{}", a + b))
        }
    }

    #[tokio::test]
    async fn definition_is_served() {
        let resp = handle_request(
            &Adder,
            RpcRequest::new(1, method::DEFINITION, Value::Null),
        )
        .await;
        let def: ToolDefinition = serde_json::from_value(resp.result.unwrap()).unwrap();
        assert_eq!(def.name, "adder");
    }

    #[tokio::test]
    async fn call_dispatches_and_returns_result() {
        let params = serde_json::json!({"args_json": "{\"a\": 5, \"b\": 3}"});
        let resp = handle_request(&Adder, RpcRequest::new(2, method::CALL, params)).await;
        let result: CallResult = serde_json::from_value(resp.result.unwrap()).unwrap();
        assert_eq!(result.result, "8");
    }

    #[tokio::test]
    async fn invalid_args_json_is_an_invalid_params_error() {
        let params = serde_json::json!({"args_json": "{not json"});
        let resp = handle_request(&Adder, RpcRequest::new(3, method::CALL, params)).await;
        assert_eq!(resp.error.unwrap().code, code::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn application_failure_maps_to_call_failed() {
        let params = serde_json::json!({"args_json": "{\"a\": 1}"});
        let resp = handle_request(&Adder, RpcRequest::new(4, method::CALL, params)).await;
        let err = resp.error.unwrap();
        assert_eq!(err.code, code::CALL_FAILED);
        assert!(err.message.contains("b missing"));
    }

    #[tokio::test]
    async fn unknown_method_is_reported() {
        let resp = handle_request(&Adder, RpcRequest::new(5, "tea", Value::Null)).await;
        assert_eq!(resp.error.unwrap().code, code::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn optional_methods_default_to_null() {
        let resp = handle_request(&Adder, RpcRequest::new(6, method::VERSION, Value::Null)).await;
        assert_eq!(resp.result.unwrap(), Value::Null);
        let resp =
            handle_request(&Adder, RpcRequest::new(7, method::HEALTH_CHECK, Value::Null)).await;
        let health: HealthStatus = serde_json::from_value(resp.result.unwrap()).unwrap();
        assert!(health.healthy);
    }
}
