//! OpenAI Chat Completions client that captures token usage statistics.
//!
//! Speaks the OpenAI wire format directly over the shared HTTP client;
//! the same adapter serves any OpenAI-compatible endpoint via
//! [`OpenAIClient::new_with_base_url`].

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::agenthub::client_wrapper::{
    ChatOptions, ClientWrapper, LlmError, Message, ProviderCapabilities, TokenUsage,
    ToolDefinition,
};
use crate::agenthub::clients::common::{get_shared_http_client, send_openai_chat};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Client wrapper for OpenAI and OpenAI-compatible Chat Completions APIs.
pub struct OpenAIClient {
    api_key: String,
    model: String,
    base_url: String,
    usage: Mutex<Option<TokenUsage>>,
}

impl OpenAIClient {
    /// Create a client against the official OpenAI endpoint.
    pub fn new_with_model_str(api_key: &str, model_name: &str) -> Self {
        Self::new_with_base_url(api_key, model_name, DEFAULT_BASE_URL)
    }

    /// Create a client pointing at a custom OpenAI-compatible base URL.
    pub fn new_with_base_url(api_key: &str, model_name: &str, base_url: &str) -> Self {
        OpenAIClient {
            api_key: api_key.to_string(),
            model: model_name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            usage: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ClientWrapper for OpenAIClient {
    async fn send_message(
        &self,
        messages: &[Message],
        tools: Option<Vec<ToolDefinition>>,
        options: &ChatOptions,
    ) -> Result<Message, LlmError> {
        let tools = tools.unwrap_or_default();
        send_openai_chat(
            &self.base_url,
            Some(&self.api_key),
            &self.model,
            messages,
            &tools,
            options,
            get_shared_http_client(),
            &self.usage,
        )
        .await
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
            max_context_window: 128_000,
        }
    }

    fn validate_config(&self) -> Result<(), LlmError> {
        if self.api_key.trim().is_empty() {
            return Err(LlmError::InvalidConfig(
                "OpenAI API key is empty".to_string(),
            ));
        }
        if !self.base_url.starts_with("http") {
            return Err(LlmError::InvalidConfig(format!(
                "invalid base URL: {}",
                self.base_url
            )));
        }
        Ok(())
    }

    fn default_models(&self) -> Vec<&'static str> {
        vec!["gpt-4o", "gpt-4o-mini", "gpt-4.1", "gpt-4.1-mini"]
    }

    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        Some(&self.usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_key_fails_validation() {
        let client = OpenAIClient::new_with_model_str("", "gpt-4o-mini");
        assert!(matches!(
            client.validate_config(),
            Err(LlmError::InvalidConfig(_))
        ));
    }

    #[test]
    fn base_url_is_normalized() {
        let client = OpenAIClient::new_with_base_url("k", "m", "https://example.com/v1/");
        assert!(client.validate_config().is_ok());
        assert_eq!(client.model_name(), "m");
    }
}
