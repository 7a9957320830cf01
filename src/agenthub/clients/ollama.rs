//! Ollama client for locally hosted models.
//!
//! Talks plain HTTP to a local daemon (default `http://localhost:11434`)
//! with no authentication. Tool calling is model-dependent: the adapter
//! keeps a small allowlist of model families known to emit tool calls
//! and only forwards the catalog for those, surfacing the capability
//! through [`ClientWrapper::capabilities`]. Local generation can be
//! slow, so requests get a generous timeout of their own instead of the
//! shared client's default.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::agenthub::client_wrapper::{
    ChatOptions, ClientWrapper, LlmError, Message, NativeToolCall, ProviderCapabilities, Role,
    TokenUsage, ToolDefinition,
};
use crate::agenthub::clients::common::{map_http_error, openai_wire_tools};

pub const DEFAULT_ENDPOINT: &str = "http://localhost:11434";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Model families that reliably support native tool calling.
const TOOL_CAPABLE_FAMILIES: &[&str] = &[
    "llama3.1",
    "llama3.2",
    "llama3.3",
    "qwen2.5",
    "qwen3",
    "mistral-nemo",
    "firefunction",
    "command-r",
];

/// Client wrapper for a local Ollama daemon.
pub struct OllamaClient {
    endpoint: String,
    model: String,
    http: reqwest::Client,
    usage: Mutex<Option<TokenUsage>>,
}

impl OllamaClient {
    pub fn new_with_model_str(model_name: &str) -> Self {
        Self::new_with_endpoint(model_name, DEFAULT_ENDPOINT)
    }

    pub fn new_with_endpoint(model_name: &str, endpoint: &str) -> Self {
        OllamaClient {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model_name.to_string(),
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("Failed to build HTTP client"),
            usage: Mutex::new(None),
        }
    }

    /// Whether the configured model is known to support tool calling.
    pub fn model_supports_tools(&self) -> bool {
        let lowered = self.model.to_ascii_lowercase();
        TOOL_CAPABLE_FAMILIES.iter().any(|f| lowered.starts_with(f))
    }
}

fn wire_message(msg: &Message) -> serde_json::Value {
    match &msg.role {
        Role::System => serde_json::json!({"role": "system", "content": msg.content.as_ref()}),
        Role::User => serde_json::json!({"role": "user", "content": msg.content.as_ref()}),
        Role::Assistant => {
            if msg.tool_calls.is_empty() {
                serde_json::json!({"role": "assistant", "content": msg.content.as_ref()})
            } else {
                let calls: Vec<serde_json::Value> = msg
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        serde_json::json!({
                            "function": {"name": tc.name, "arguments": tc.arguments}
                        })
                    })
                    .collect();
                serde_json::json!({
                    "role": "assistant",
                    "content": msg.content.as_ref(),
                    "tool_calls": calls
                })
            }
        }
        // Ollama correlates tool results by position, not id.
        Role::Tool { .. } => serde_json::json!({"role": "tool", "content": msg.content.as_ref()}),
    }
}

fn parse_response(parsed: &serde_json::Value) -> Result<(Message, Option<TokenUsage>), LlmError> {
    let message = parsed
        .get("message")
        .ok_or_else(|| LlmError::Transport("response missing message".to_string()))?;

    let content: std::sync::Arc<str> = message
        .get("content")
        .and_then(|c| c.as_str())
        .map(std::sync::Arc::from)
        .unwrap_or_else(|| std::sync::Arc::from(""));

    // The daemon does not assign call ids; synthesize stable ones so the
    // tool loop can correlate results the same way as cloud providers.
    let tool_calls: Vec<NativeToolCall> = message
        .get("tool_calls")
        .and_then(|tc| tc.as_array())
        .map(|arr| {
            arr.iter()
                .enumerate()
                .filter_map(|(i, tc)| {
                    let func = tc.get("function")?;
                    let name = func.get("name")?.as_str()?.to_string();
                    let arguments = func
                        .get("arguments")
                        .cloned()
                        .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));
                    Some(NativeToolCall {
                        id: format!("ollama_call_{}", i),
                        name,
                        arguments,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let finish_reason = parsed
        .get("done_reason")
        .and_then(|s| s.as_str())
        .map(|s| s.to_string());

    let input = parsed
        .get("prompt_eval_count")
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as usize;
    let output = parsed.get("eval_count").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
    let usage = if input + output > 0 {
        Some(TokenUsage {
            input_tokens: input,
            output_tokens: output,
            total_tokens: input + output,
        })
    } else {
        None
    };

    Ok((
        Message {
            role: Role::Assistant,
            content,
            tool_calls,
            finish_reason,
        },
        usage,
    ))
}

#[async_trait]
impl ClientWrapper for OllamaClient {
    async fn send_message(
        &self,
        messages: &[Message],
        tools: Option<Vec<ToolDefinition>>,
        options: &ChatOptions,
    ) -> Result<Message, LlmError> {
        let mut wire_messages: Vec<serde_json::Value> = Vec::with_capacity(messages.len() + 1);
        if let Some(system) = options.system_prompt.as_deref() {
            if !system.is_empty() {
                wire_messages.push(serde_json::json!({"role": "system", "content": system}));
            }
        }
        wire_messages.extend(messages.iter().map(wire_message));

        let mut model_options = serde_json::json!({"temperature": options.temperature});
        if let Some(max_tokens) = options.max_tokens {
            model_options["num_predict"] = serde_json::json!(max_tokens);
        }
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": wire_messages,
            "stream": false,
            "options": model_options,
        });
        let tools = tools.unwrap_or_default();
        if !tools.is_empty() && self.model_supports_tools() {
            body["tools"] = serde_json::Value::Array(openai_wire_tools(&tools));
        }

        let url = format!("{}/api/chat", self.endpoint);
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    LlmError::ProviderUnavailable(format!("ollama not reachable at {}", url))
                } else {
                    LlmError::Transport(e.to_string())
                }
            })?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        if !status.is_success() {
            let err = map_http_error(status, &text);
            log::error!("ollama: HTTP {} from {}: {}", status, url, err);
            return Err(err);
        }

        let parsed: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| LlmError::Transport(format!("invalid response JSON: {}", e)))?;
        let (message, usage) = parse_response(&parsed)?;
        if usage.is_some() {
            *self.usage.lock().await = usage;
        }
        Ok(message)
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supports_tools: self.model_supports_tools(),
            supports_streaming: false,
            supports_system_prompt: true,
            supports_custom_endpoint: true,
            requires_api_key: false,
            max_context_window: 32_000,
        }
    }

    fn validate_config(&self) -> Result<(), LlmError> {
        if !self.endpoint.starts_with("http") {
            return Err(LlmError::InvalidConfig(format!(
                "invalid ollama endpoint: {}",
                self.endpoint
            )));
        }
        Ok(())
    }

    fn default_models(&self) -> Vec<&'static str> {
        vec!["llama3.2", "qwen2.5", "mistral-nemo"]
    }

    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        Some(&self.usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_support_follows_model_family() {
        assert!(OllamaClient::new_with_model_str("llama3.2:3b").model_supports_tools());
        assert!(OllamaClient::new_with_model_str("qwen2.5-coder").model_supports_tools());
        assert!(!OllamaClient::new_with_model_str("gemma2").model_supports_tools());
    }

    #[test]
    fn response_parsing_synthesizes_call_ids() {
        let parsed = serde_json::json!({
            "message": {
                "role": "assistant",
                "content": "",
                "tool_calls": [
                    {"function": {"name": "math", "arguments": {"a": 5, "b": 3}}}
                ]
            },
            "done_reason": "stop",
            "prompt_eval_count": 20,
            "eval_count": 9
        });
        let (message, usage) = parse_response(&parsed).unwrap();
        assert_eq!(message.tool_calls.len(), 1);
        assert_eq!(message.tool_calls[0].id, "ollama_call_0");
        assert_eq!(usage.unwrap().total_tokens, 29);
    }

    #[test]
    fn no_auth_required() {
        let client = OllamaClient::new_with_model_str("llama3.2");
        assert!(!client.capabilities().requires_api_key);
        assert!(client.validate_config().is_ok());
    }
}
