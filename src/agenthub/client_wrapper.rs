//! Shared primitives for provider-agnostic LLM clients.
//!
//! Every concrete provider (OpenAI-style, Anthropic-style, Ollama-style)
//! hides behind the [`ClientWrapper`] trait and the lightweight data
//! types defined here: [`Message`] with its optional native
//! [`NativeToolCall`]s, the [`ToolDefinition`] catalog entries passed
//! along with a request, per-request [`ChatOptions`], and
//! [`TokenUsage`] accounting.
//!
//! The trait deliberately excludes conversation bookkeeping; the agent
//! store owns histories and the chat core owns the tool loop. Within a
//! single call the assistant reply is atomic — callers never observe a
//! partial tool-call list.

use async_trait::async_trait;
use futures_util::stream::Stream;
use std::error::Error;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A single tool call returned by the LLM in a native function-calling
/// response.
///
/// Providers assign an opaque [`id`](NativeToolCall::id) to each call so
/// that the tool result can be correlated back in a follow-up
/// `Role::Tool` message.
#[derive(Debug, Clone)]
pub struct NativeToolCall {
    /// Provider-assigned call ID, e.g. `"call_abc123"`.
    pub id: String,
    /// Tool name matching one of the [`ToolDefinition`]s sent in the request.
    pub name: String,
    /// Parsed JSON arguments supplied by the LLM for this call.
    pub arguments: serde_json::Value,
}

/// Provider-agnostic tool schema passed to the LLM along with a chat
/// request. Serialized into the provider's concrete tool-catalog shape
/// by each adapter.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    /// Tool name as it will appear in the provider's tool array.
    pub name: String,
    /// Human-readable description surfaced to the LLM to aid tool selection.
    pub description: String,
    /// JSON Schema object describing the accepted parameters.
    pub parameters_schema: serde_json::Value,
}

/// Represents the possible roles for a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// A system authored message that primes or constrains assistant behaviour.
    System,
    /// A user authored message.
    User,
    /// An assistant authored message (model responses).
    Assistant,
    /// A tool-result message correlating with a prior assistant
    /// [`NativeToolCall`] via `call_id`.
    Tool { call_id: String },
}

/// How many tokens were spent on prompt vs. completion?
#[derive(Clone, Debug, Default)]
pub struct TokenUsage {
    /// Number of prompt/input tokens billed by the provider.
    pub input_tokens: usize,
    /// Number of generated/output tokens billed by the provider.
    pub output_tokens: usize,
    /// Convenience total equal to `input_tokens + output_tokens`.
    pub total_tokens: usize,
}

impl TokenUsage {
    /// Fold another usage report into this one.
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Represents a generic message exchanged with an LLM.
///
/// `tool_calls` is populated on assistant messages when the provider
/// returns native function-calling results; `finish_reason` mirrors the
/// provider's completion status on assistant messages and is `None`
/// elsewhere.
#[derive(Clone, Debug)]
pub struct Message {
    /// The role associated with the message.
    pub role: Role,
    /// The message body. Stored as `Arc<str>` so that histories can be
    /// cheaply cloned by downstream components.
    pub content: Arc<str>,
    /// Native tool calls requested by the assistant.
    pub tool_calls: Vec<NativeToolCall>,
    /// Provider finish reason (`"stop"`, `"tool_calls"`, ...) on
    /// assistant replies.
    pub finish_reason: Option<String>,
}

impl Message {
    pub fn system(content: impl AsRef<str>) -> Self {
        Self {
            role: Role::System,
            content: Arc::from(content.as_ref()),
            tool_calls: Vec::new(),
            finish_reason: None,
        }
    }

    pub fn user(content: impl AsRef<str>) -> Self {
        Self {
            role: Role::User,
            content: Arc::from(content.as_ref()),
            tool_calls: Vec::new(),
            finish_reason: None,
        }
    }

    pub fn assistant(content: impl AsRef<str>) -> Self {
        Self {
            role: Role::Assistant,
            content: Arc::from(content.as_ref()),
            tool_calls: Vec::new(),
            finish_reason: None,
        }
    }

    /// A tool-result message answering the assistant tool call `call_id`.
    pub fn tool_result(call_id: impl Into<String>, content: impl AsRef<str>) -> Self {
        Self {
            role: Role::Tool {
                call_id: call_id.into(),
            },
            content: Arc::from(content.as_ref()),
            tool_calls: Vec::new(),
            finish_reason: None,
        }
    }

    /// True when this assistant message proposes at least one tool call.
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Per-request knobs that ride alongside the message list.
#[derive(Debug, Clone)]
pub struct ChatOptions {
    /// Sampling temperature, clamped by callers to `[0, 2]`.
    pub temperature: f32,
    /// Optional completion budget. Providers that require it (Anthropic)
    /// substitute their own default when unset.
    pub max_tokens: Option<u32>,
    /// Optional system prompt. Adapters place it wherever their wire
    /// format expects (leading system message or dedicated field).
    pub system_prompt: Option<String>,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            max_tokens: None,
            system_prompt: None,
        }
    }
}

/// Static description of what a provider adapter can do.
#[derive(Debug, Clone)]
pub struct ProviderCapabilities {
    pub supports_tools: bool,
    pub supports_streaming: bool,
    pub supports_system_prompt: bool,
    pub supports_custom_endpoint: bool,
    pub requires_api_key: bool,
    /// Largest context window among the adapter's default models, in tokens.
    pub max_context_window: usize,
}

/// Errors surfaced by provider adapters.
///
/// Only [`Transport`](LlmError::Transport) and
/// [`RateLimited`](LlmError::RateLimited) are retriable; everything else
/// is surfaced to the caller as-is.
#[derive(Debug, Clone)]
pub enum LlmError {
    /// No adapter registered for the requested provider, or the provider
    /// reported itself unavailable (overloaded, down).
    ProviderUnavailable(String),
    /// Credentials or endpoint configuration rejected.
    InvalidConfig(String),
    /// The request exceeded the model's context window.
    ContextOverflow(String),
    /// The provider throttled the request.
    RateLimited(String),
    /// The model declined to produce a completion.
    ModelRefused(String),
    /// Network or IO failure talking to the provider.
    Transport(String),
}

impl LlmError {
    /// Whether higher layers may retry the request with backoff.
    pub fn is_retriable(&self) -> bool {
        matches!(self, LlmError::Transport(_) | LlmError::RateLimited(_))
    }
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::ProviderUnavailable(msg) => write!(f, "provider unavailable: {}", msg),
            LlmError::InvalidConfig(msg) => write!(f, "invalid provider config: {}", msg),
            LlmError::ContextOverflow(msg) => write!(f, "context window exceeded: {}", msg),
            LlmError::RateLimited(msg) => write!(f, "rate limited: {}", msg),
            LlmError::ModelRefused(msg) => write!(f, "model refused: {}", msg),
            LlmError::Transport(msg) => write!(f, "transport error: {}", msg),
        }
    }
}

impl Error for LlmError {}

/// Represents a chunk of content in a streaming response.
#[derive(Clone, Debug)]
pub struct MessageChunk {
    /// The incremental content delta in this chunk. May be empty for
    /// chunks that only carry a finish reason.
    pub content: String,
    /// Optional finish reason mirroring the provider specific completion
    /// status (e.g. `"stop"`).
    pub finish_reason: Option<String>,
}

/// Type alias for a stream of message chunks compatible with `Send` executors.
pub type MessageChunkStream =
    Pin<Box<dyn Stream<Item = Result<MessageChunk, Box<dyn Error>>> + Send>>;

/// Type alias for the future returned by [`ClientWrapper::send_message_stream`].
pub type MessageStreamFuture<'a> =
    Pin<Box<dyn std::future::Future<Output = Result<Option<MessageChunkStream>, LlmError>> + 'a>>;

/// Trait defining the interface to interact with various LLM services.
///
/// All implementations must be thread-safe (`Send + Sync`) so they can
/// be shared between async tasks. Where a provider exposes token
/// accounting, wrappers should capture it and make it visible via
/// [`ClientWrapper::get_last_usage`].
#[async_trait]
pub trait ClientWrapper: Send + Sync {
    /// Send a full request/response style chat completion.
    ///
    /// The `messages` slice carries the conversation in unified form;
    /// the adapter translates it to the provider's wire shape, including
    /// placing `options.system_prompt` wherever the provider expects it.
    /// When `tools` is `Some` and non-empty the catalog is forwarded to
    /// the provider's function-calling surface, and the returned message
    /// may contain non-empty [`Message::tool_calls`].
    async fn send_message(
        &self,
        messages: &[Message],
        tools: Option<Vec<ToolDefinition>>,
        options: &ChatOptions,
    ) -> Result<Message, LlmError>;

    /// Request a streaming response from the provider.
    ///
    /// Providers without streaming support inherit this default, which
    /// resolves to `Ok(None)`. Returning a boxed future avoids imposing
    /// `Send` bounds on the internal async machinery.
    fn send_message_stream<'a>(
        &'a self,
        _messages: &'a [Message],
        _tools: Option<Vec<ToolDefinition>>,
        _options: &'a ChatOptions,
    ) -> MessageStreamFuture<'a> {
        Box::pin(async { Ok(None) })
    }

    /// Return the identifier used to select the upstream model.
    fn model_name(&self) -> &str;

    /// Static capabilities of this adapter.
    fn capabilities(&self) -> ProviderCapabilities;

    /// Check credentials/endpoint plausibility without a network call.
    ///
    /// The provider registry refuses to register adapters that fail this.
    fn validate_config(&self) -> Result<(), LlmError> {
        Ok(())
    }

    /// Model identifiers this adapter suggests when none is configured.
    fn default_models(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Hook to retrieve usage from the most recent
    /// [`ClientWrapper::send_message`] call.
    async fn get_last_usage(&self) -> Option<TokenUsage> {
        if let Some(slot) = self.usage_slot() {
            slot.lock().await.clone()
        } else {
            None
        }
    }

    /// Expose a shared mutable slot where the implementation can persist
    /// token usage. By default wrappers report no usage data.
    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriability_covers_exactly_transport_and_rate_limit() {
        assert!(LlmError::Transport("io".into()).is_retriable());
        assert!(LlmError::RateLimited("429".into()).is_retriable());
        assert!(!LlmError::ProviderUnavailable("down".into()).is_retriable());
        assert!(!LlmError::InvalidConfig("key".into()).is_retriable());
        assert!(!LlmError::ContextOverflow("ctx".into()).is_retriable());
        assert!(!LlmError::ModelRefused("no".into()).is_retriable());
    }

    #[test]
    fn message_constructors_set_roles() {
        assert_eq!(Message::user("hi").role, Role::User);
        assert_eq!(Message::assistant("ok").role, Role::Assistant);
        assert_eq!(Message::system("be nice").role, Role::System);
        let tool = Message::tool_result("call_1", "8");
        assert_eq!(
            tool.role,
            Role::Tool {
                call_id: "call_1".to_string()
            }
        );
        assert!(!tool.has_tool_calls());
    }

    #[test]
    fn token_usage_accumulates() {
        let mut total = TokenUsage::default();
        total.add(&TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
            total_tokens: 15,
        });
        total.add(&TokenUsage {
            input_tokens: 1,
            output_tokens: 2,
            total_tokens: 3,
        });
        assert_eq!(total.total_tokens, 18);
        assert_eq!(total.input_tokens, 11);
    }
}
