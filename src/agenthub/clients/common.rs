//! Shared utilities used across provider client implementations.
//!
//! The helpers in this module provide a tuned [`reqwest`] client shared
//! by every adapter, the OpenAI-compatible Chat Completions send path
//! (used verbatim by the OpenAI adapter and by any OpenAI-compatible
//! endpoint), and HTTP-status → [`LlmError`] mapping that all adapters
//! reuse so retriability is classified uniformly.

use lazy_static::lazy_static;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::agenthub::client_wrapper::{
    ChatOptions, LlmError, Message, NativeToolCall, Role, TokenUsage, ToolDefinition,
};

lazy_static! {
    /// Shared HTTP client with persistent connection pooling.
    ///
    /// The single client instance keeps TLS sessions and DNS lookups warm
    /// which significantly reduces latency when many concurrent requests
    /// are issued to upstream providers.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build shared HTTP client")
    };
}

/// Borrow the lazily initialised shared [`reqwest::Client`].
pub fn get_shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// Classify a non-success HTTP response into an [`LlmError`].
///
/// 429 and 5xx map to the retriable/unavailable family; 400 is inspected
/// for context-window markers; 401/403 indicate bad credentials.
pub fn map_http_error(status: reqwest::StatusCode, body: &str) -> LlmError {
    match status.as_u16() {
        401 | 403 => LlmError::InvalidConfig(format!("HTTP {}: {}", status, truncate(body, 300))),
        429 => LlmError::RateLimited(truncate(body, 300)),
        400 | 413 => {
            let lowered = body.to_ascii_lowercase();
            if lowered.contains("context")
                || lowered.contains("too long")
                || lowered.contains("maximum")
            {
                LlmError::ContextOverflow(truncate(body, 300))
            } else {
                LlmError::InvalidConfig(format!("HTTP {}: {}", status, truncate(body, 300)))
            }
        }
        500..=599 => LlmError::ProviderUnavailable(format!(
            "HTTP {}: {}",
            status,
            truncate(body, 300)
        )),
        _ => LlmError::Transport(format!("HTTP {}: {}", status, truncate(body, 300))),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let end = s
            .char_indices()
            .take_while(|(i, _)| *i < max)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!("{}…", &s[..end])
    }
}

/// Serialize a unified message into the OpenAI wire shape.
///
/// | [`Role`] variant | Wire representation |
/// |---|---|
/// | `System` | `{"role":"system","content":"..."}` |
/// | `User` | `{"role":"user","content":"..."}` |
/// | `Assistant` with tool_calls | `{"role":"assistant","content":null,"tool_calls":[...]}` |
/// | `Assistant` without tool_calls | `{"role":"assistant","content":"..."}` |
/// | `Tool { call_id }` | `{"role":"tool","tool_call_id":"<id>","content":"..."}` |
pub fn openai_wire_message(msg: &Message) -> serde_json::Value {
    match &msg.role {
        Role::System => serde_json::json!({
            "role": "system",
            "content": msg.content.as_ref()
        }),
        Role::User => serde_json::json!({
            "role": "user",
            "content": msg.content.as_ref()
        }),
        Role::Assistant => {
            if msg.tool_calls.is_empty() {
                serde_json::json!({
                    "role": "assistant",
                    "content": msg.content.as_ref()
                })
            } else {
                let tool_calls: Vec<serde_json::Value> = msg
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        serde_json::json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {
                                "name": tc.name,
                                "arguments": serde_json::to_string(&tc.arguments)
                                    .unwrap_or_else(|_| "{}".to_string())
                            }
                        })
                    })
                    .collect();
                serde_json::json!({
                    "role": "assistant",
                    "content": serde_json::Value::Null,
                    "tool_calls": tool_calls
                })
            }
        }
        Role::Tool { call_id } => serde_json::json!({
            "role": "tool",
            "tool_call_id": call_id,
            "content": msg.content.as_ref()
        }),
    }
}

/// Serialize the tool catalog into the OpenAI `tools` array shape.
pub fn openai_wire_tools(tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
    tools
        .iter()
        .map(|t| {
            serde_json::json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters_schema
                }
            })
        })
        .collect()
}

/// Call an OpenAI-compatible Chat Completions endpoint.
///
/// Posts to `{base_url}/chat/completions` with an optional
/// `Authorization: Bearer {api_key}` header. The system prompt from
/// `options` is prepended as a system-role message. The response is
/// parsed into an assistant [`Message`] with any native tool calls, and
/// token usage is persisted in `usage_slot` so callers can retrieve it
/// via [`ClientWrapper::get_last_usage`](crate::agenthub::client_wrapper::ClientWrapper::get_last_usage).
#[allow(clippy::too_many_arguments)]
pub async fn send_openai_chat(
    base_url: &str,
    api_key: Option<&str>,
    model: &str,
    messages: &[Message],
    tools: &[ToolDefinition],
    options: &ChatOptions,
    http_client: &reqwest::Client,
    usage_slot: &Mutex<Option<TokenUsage>>,
) -> Result<Message, LlmError> {
    let mut wire_messages: Vec<serde_json::Value> = Vec::with_capacity(messages.len() + 1);
    if let Some(system) = options.system_prompt.as_deref() {
        if !system.is_empty() {
            wire_messages.push(serde_json::json!({"role": "system", "content": system}));
        }
    }
    wire_messages.extend(messages.iter().map(openai_wire_message));

    let mut body = serde_json::json!({
        "model": model,
        "messages": wire_messages,
        "temperature": options.temperature,
    });
    if let Some(max_tokens) = options.max_tokens {
        body["max_tokens"] = serde_json::json!(max_tokens);
    }
    if !tools.is_empty() {
        body["tools"] = serde_json::Value::Array(openai_wire_tools(tools));
    }

    let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
    let mut request = http_client
        .post(&url)
        .header("Content-Type", "application/json");
    if let Some(key) = api_key {
        request = request.header("Authorization", format!("Bearer {}", key));
    }

    let resp = request
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
        let err = map_http_error(status, &text);
        log::error!("send_openai_chat: HTTP {} from {}: {}", status, url, err);
        return Err(err);
    }

    let parsed: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| LlmError::Transport(format!("invalid response JSON: {}", e)))?;

    if let Some(usage_obj) = parsed.get("usage") {
        let input = usage_obj
            .get("prompt_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;
        let output = usage_obj
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;
        *usage_slot.lock().await = Some(TokenUsage {
            input_tokens: input,
            output_tokens: output,
            total_tokens: input + output,
        });
    }

    let choice = parsed
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| LlmError::Transport("no choices in response".to_string()))?;
    let choice_msg = choice
        .get("message")
        .ok_or_else(|| LlmError::Transport("choice missing message".to_string()))?;

    let finish_reason = choice
        .get("finish_reason")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let content: std::sync::Arc<str> = choice_msg
        .get("content")
        .and_then(|c| c.as_str())
        .map(std::sync::Arc::from)
        .unwrap_or_else(|| std::sync::Arc::from(""));

    let tool_calls: Vec<NativeToolCall> = choice_msg
        .get("tool_calls")
        .and_then(|tc| tc.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|tc| {
                    let id = tc.get("id")?.as_str()?.to_string();
                    let func = tc.get("function")?;
                    let name = func.get("name")?.as_str()?.to_string();
                    let args_str = func.get("arguments").and_then(|a| a.as_str()).unwrap_or("{}");
                    let arguments: serde_json::Value = serde_json::from_str(args_str)
                        .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));
                    Some(NativeToolCall {
                        id,
                        name,
                        arguments,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(Message {
        role: Role::Assistant,
        content,
        tool_calls,
        finish_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(
            map_http_error(reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down"),
            LlmError::RateLimited(_)
        ));
        assert!(matches!(
            map_http_error(reqwest::StatusCode::UNAUTHORIZED, "bad key"),
            LlmError::InvalidConfig(_)
        ));
        assert!(matches!(
            map_http_error(
                reqwest::StatusCode::BAD_REQUEST,
                "This model's maximum context length is 8192 tokens"
            ),
            LlmError::ContextOverflow(_)
        ));
        assert!(matches!(
            map_http_error(reqwest::StatusCode::SERVICE_UNAVAILABLE, "overloaded"),
            LlmError::ProviderUnavailable(_)
        ));
    }

    #[test]
    fn assistant_tool_calls_serialize_with_null_content() {
        let msg = Message {
            role: Role::Assistant,
            content: std::sync::Arc::from(""),
            tool_calls: vec![NativeToolCall {
                id: "call_1".to_string(),
                name: "math".to_string(),
                arguments: serde_json::json!({"a": 1}),
            }],
            finish_reason: None,
        };
        let wire = openai_wire_message(&msg);
        assert!(wire["content"].is_null());
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "math");
        // Arguments travel as a JSON-encoded string per the wire format.
        assert!(wire["tool_calls"][0]["function"]["arguments"].is_string());
    }

    #[test]
    fn tool_result_serializes_with_call_id() {
        let wire = openai_wire_message(&Message::tool_result("call_9", "8"));
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "call_9");
        assert_eq!(wire["content"], "8");
    }
}
