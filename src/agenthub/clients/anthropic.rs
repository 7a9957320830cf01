//! Anthropic Claude client speaking the native Messages API.
//!
//! Unlike the OpenAI-compatible path, Anthropic takes the system prompt
//! as a dedicated `system` field, requires `max_tokens`, and exchanges
//! tool traffic as content blocks: assistant tool calls arrive as
//! `tool_use` blocks and tool results are sent back inside a user
//! message as `tool_result` blocks keyed by the originating
//! `tool_use_id`.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::agenthub::client_wrapper::{
    ChatOptions, ClientWrapper, LlmError, Message, NativeToolCall, ProviderCapabilities, Role,
    TokenUsage, ToolDefinition,
};
use crate::agenthub::clients::common::{get_shared_http_client, map_http_error};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

/// `max_tokens` is mandatory on this API; used when the caller sets none.
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Client wrapper for Anthropic's Messages API.
pub struct AnthropicClient {
    api_key: String,
    model: String,
    base_url: String,
    usage: Mutex<Option<TokenUsage>>,
}

impl AnthropicClient {
    pub fn new_with_model_str(api_key: &str, model_name: &str) -> Self {
        Self::new_with_base_url(api_key, model_name, DEFAULT_BASE_URL)
    }

    pub fn new_with_base_url(api_key: &str, model_name: &str, base_url: &str) -> Self {
        AnthropicClient {
            api_key: api_key.to_string(),
            model: model_name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            usage: Mutex::new(None),
        }
    }
}

/// Build the `messages` array plus the folded `system` text.
///
/// System messages found in the history are folded into the system field
/// together with `options.system_prompt`. Consecutive tool-result
/// messages are merged into a single user turn because the API expects
/// all `tool_result` blocks answering one assistant turn in the next
/// user message.
fn build_wire_messages(
    messages: &[Message],
    options: &ChatOptions,
) -> (Vec<serde_json::Value>, Option<String>) {
    let mut system_parts: Vec<String> = Vec::new();
    if let Some(system) = options.system_prompt.as_deref() {
        if !system.is_empty() {
            system_parts.push(system.to_string());
        }
    }

    let mut wire: Vec<serde_json::Value> = Vec::with_capacity(messages.len());
    let mut pending_tool_results: Vec<serde_json::Value> = Vec::new();

    let flush_tool_results =
        |wire: &mut Vec<serde_json::Value>, pending: &mut Vec<serde_json::Value>| {
            if !pending.is_empty() {
                wire.push(serde_json::json!({
                    "role": "user",
                    "content": std::mem::take(pending)
                }));
            }
        };

    for msg in messages {
        match &msg.role {
            Role::System => {
                system_parts.push(msg.content.as_ref().to_string());
            }
            Role::User => {
                flush_tool_results(&mut wire, &mut pending_tool_results);
                wire.push(serde_json::json!({
                    "role": "user",
                    "content": msg.content.as_ref()
                }));
            }
            Role::Assistant => {
                flush_tool_results(&mut wire, &mut pending_tool_results);
                let mut blocks: Vec<serde_json::Value> = Vec::new();
                if !msg.content.is_empty() {
                    blocks.push(serde_json::json!({
                        "type": "text",
                        "text": msg.content.as_ref()
                    }));
                }
                for tc in &msg.tool_calls {
                    blocks.push(serde_json::json!({
                        "type": "tool_use",
                        "id": tc.id,
                        "name": tc.name,
                        "input": tc.arguments
                    }));
                }
                wire.push(serde_json::json!({
                    "role": "assistant",
                    "content": blocks
                }));
            }
            Role::Tool { call_id } => {
                pending_tool_results.push(serde_json::json!({
                    "type": "tool_result",
                    "tool_use_id": call_id,
                    "content": msg.content.as_ref()
                }));
            }
        }
    }
    flush_tool_results(&mut wire, &mut pending_tool_results);

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (wire, system)
}

fn build_request_body(
    model: &str,
    messages: &[Message],
    tools: &[ToolDefinition],
    options: &ChatOptions,
) -> serde_json::Value {
    let (wire_messages, system) = build_wire_messages(messages, options);
    let mut body = serde_json::json!({
        "model": model,
        "max_tokens": options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "temperature": options.temperature,
        "messages": wire_messages,
    });
    if let Some(system) = system {
        body["system"] = serde_json::json!(system);
    }
    if !tools.is_empty() {
        let wire_tools: Vec<serde_json::Value> = tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters_schema
                })
            })
            .collect();
        body["tools"] = serde_json::Value::Array(wire_tools);
    }
    body
}

fn parse_response(parsed: &serde_json::Value) -> Result<(Message, Option<TokenUsage>), LlmError> {
    if let Some(error) = parsed.get("error") {
        let kind = error.get("type").and_then(|t| t.as_str()).unwrap_or("");
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown error");
        return Err(match kind {
            "overloaded_error" => LlmError::ProviderUnavailable(message.to_string()),
            "rate_limit_error" => LlmError::RateLimited(message.to_string()),
            _ => LlmError::Transport(message.to_string()),
        });
    }

    let mut text = String::new();
    let mut tool_calls: Vec<NativeToolCall> = Vec::new();
    if let Some(blocks) = parsed.get("content").and_then(|c| c.as_array()) {
        for block in blocks {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                        text.push_str(t);
                    }
                }
                Some("tool_use") => {
                    let id = block
                        .get("id")
                        .and_then(|i| i.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let name = block
                        .get("name")
                        .and_then(|n| n.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let arguments = block
                        .get("input")
                        .cloned()
                        .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));
                    tool_calls.push(NativeToolCall {
                        id,
                        name,
                        arguments,
                    });
                }
                _ => {}
            }
        }
    }

    let finish_reason = parsed
        .get("stop_reason")
        .and_then(|s| s.as_str())
        .map(|s| s.to_string());

    let usage = parsed.get("usage").map(|u| {
        let input = u
            .get("input_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;
        let output = u
            .get("output_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;
        TokenUsage {
            input_tokens: input,
            output_tokens: output,
            total_tokens: input + output,
        }
    });

    Ok((
        Message {
            role: Role::Assistant,
            content: std::sync::Arc::from(text.as_str()),
            tool_calls,
            finish_reason,
        },
        usage,
    ))
}

#[async_trait]
impl ClientWrapper for AnthropicClient {
    async fn send_message(
        &self,
        messages: &[Message],
        tools: Option<Vec<ToolDefinition>>,
        options: &ChatOptions,
    ) -> Result<Message, LlmError> {
        let tools = tools.unwrap_or_default();
        let body = build_request_body(&self.model, messages, &tools, options);
        let url = format!("{}/v1/messages", self.base_url);

        let resp = get_shared_http_client()
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        if !status.is_success() {
            // Prefer the structured error body when one is present.
            if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&text) {
                if parsed.get("error").is_some() {
                    if let Err(e) = parse_response(&parsed) {
                        log::error!("anthropic: HTTP {} from {}: {}", status, url, e);
                        return Err(e);
                    }
                }
            }
            let err = map_http_error(status, &text);
            log::error!("anthropic: HTTP {} from {}: {}", status, url, err);
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
            supports_tools: true,
            supports_streaming: false,
            supports_system_prompt: true,
            supports_custom_endpoint: true,
            requires_api_key: true,
            max_context_window: 200_000,
        }
    }

    fn validate_config(&self) -> Result<(), LlmError> {
        if self.api_key.trim().is_empty() {
            return Err(LlmError::InvalidConfig(
                "Anthropic API key is empty".to_string(),
            ));
        }
        Ok(())
    }

    fn default_models(&self) -> Vec<&'static str> {
        vec![
            "claude-sonnet-4-0",
            "claude-opus-4-1",
            "claude-haiku-3-5-haiku-latest",
        ]
    }

    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        Some(&self.usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_becomes_a_dedicated_field() {
        let options = ChatOptions {
            system_prompt: Some("Be terse.".to_string()),
            ..Default::default()
        };
        let body = build_request_body("claude-sonnet-4-0", &[Message::user("hi")], &[], &options);
        assert_eq!(body["system"], "Be terse.");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn max_tokens_is_always_present() {
        let body = build_request_body(
            "claude-sonnet-4-0",
            &[Message::user("hi")],
            &[],
            &ChatOptions::default(),
        );
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn tool_results_fold_into_one_user_turn() {
        let assistant = Message {
            role: Role::Assistant,
            content: std::sync::Arc::from(""),
            tool_calls: vec![
                NativeToolCall {
                    id: "tu_1".to_string(),
                    name: "math".to_string(),
                    arguments: serde_json::json!({"a": 1}),
                },
                NativeToolCall {
                    id: "tu_2".to_string(),
                    name: "math".to_string(),
                    arguments: serde_json::json!({"a": 2}),
                },
            ],
            finish_reason: None,
        };
        let messages = vec![
            Message::user("compute"),
            assistant,
            Message::tool_result("tu_1", "8"),
            Message::tool_result("tu_2", "16"),
        ];
        let (wire, _) = build_wire_messages(&messages, &ChatOptions::default());
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[1]["content"][0]["type"], "tool_use");
        assert_eq!(wire[2]["role"], "user");
        let results = wire[2]["content"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["tool_use_id"], "tu_1");
        assert_eq!(results[1]["tool_use_id"], "tu_2");
    }

    #[test]
    fn response_parsing_extracts_text_and_tool_use() {
        let parsed = serde_json::json!({
            "content": [
                {"type": "text", "text": "Let me compute that."},
                {"type": "tool_use", "id": "tu_9", "name": "math",
                 "input": {"operation": "add", "a": 5, "b": 3}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 12, "output_tokens": 7}
        });
        let (message, usage) = parse_response(&parsed).unwrap();
        assert_eq!(message.content.as_ref(), "Let me compute that.");
        assert_eq!(message.tool_calls.len(), 1);
        assert_eq!(message.tool_calls[0].id, "tu_9");
        assert_eq!(message.finish_reason.as_deref(), Some("tool_use"));
        assert_eq!(usage.unwrap().total_tokens, 19);
    }

    #[test]
    fn overloaded_error_maps_to_provider_unavailable() {
        let parsed = serde_json::json!({
            "error": {"type": "overloaded_error", "message": "try later"}
        });
        assert!(matches!(
            parse_response(&parsed),
            Err(LlmError::ProviderUnavailable(_))
        ));
    }
}
