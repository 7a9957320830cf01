//! Process-wide provider registry.
//!
//! Maps provider ids to adapter constructors derived from
//! [`GlobalSettings`] at startup. An adapter family is registered only
//! when a probe instance passes `validate_config()`; concrete clients
//! are then built per `(provider, model)` pair on demand and cached, so
//! two agents on the same provider/model share one client (and its
//! connection pool slot).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::agenthub::client_wrapper::{ClientWrapper, LlmError};
use crate::agenthub::clients::anthropic::AnthropicClient;
use crate::agenthub::clients::ollama::{OllamaClient, DEFAULT_ENDPOINT};
use crate::agenthub::clients::openai::OpenAIClient;
use crate::agenthub::settings::{GlobalSettings, ProviderSettings};

pub const PROVIDER_OPENAI: &str = "openai";
pub const PROVIDER_ANTHROPIC: &str = "anthropic";
pub const PROVIDER_OLLAMA: &str = "ollama";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProviderKind {
    OpenAI,
    Anthropic,
    Ollama,
}

struct RegisteredProvider {
    kind: ProviderKind,
    settings: ProviderSettings,
    default_model: &'static str,
}

impl RegisteredProvider {
    fn build(&self, model: &str) -> Arc<dyn ClientWrapper> {
        let key = self.settings.api_key.as_deref().unwrap_or_default();
        match self.kind {
            ProviderKind::OpenAI => match self.settings.endpoint.as_deref() {
                Some(endpoint) => Arc::new(OpenAIClient::new_with_base_url(key, model, endpoint)),
                None => Arc::new(OpenAIClient::new_with_model_str(key, model)),
            },
            ProviderKind::Anthropic => match self.settings.endpoint.as_deref() {
                Some(endpoint) => {
                    Arc::new(AnthropicClient::new_with_base_url(key, model, endpoint))
                }
                None => Arc::new(AnthropicClient::new_with_model_str(key, model)),
            },
            ProviderKind::Ollama => {
                let endpoint = self.settings.endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT);
                Arc::new(OllamaClient::new_with_endpoint(model, endpoint))
            }
        }
    }

    fn model_or_default<'a>(&'a self, model: &'a str) -> &'a str {
        if !model.is_empty() {
            model
        } else if let Some(configured) = self.settings.default_model.as_deref() {
            configured
        } else {
            self.default_model
        }
    }
}

/// Registry of validated providers plus a `(provider, model)` client cache.
pub struct ProviderRegistry {
    providers: HashMap<String, RegisteredProvider>,
    cache: RwLock<HashMap<(String, String), Arc<dyn ClientWrapper>>>,
}

impl ProviderRegistry {
    /// Build the registry from global settings.
    ///
    /// Each known provider id present (or, for ollama, present-or-absent
    /// since it needs no credentials) is probed with a throwaway client;
    /// failing validation logs a warning and skips registration.
    pub fn from_settings(settings: &GlobalSettings) -> Self {
        let mut providers = HashMap::new();

        let candidates: [(&str, ProviderKind, &'static str); 3] = [
            (PROVIDER_OPENAI, ProviderKind::OpenAI, "gpt-4o-mini"),
            (
                PROVIDER_ANTHROPIC,
                ProviderKind::Anthropic,
                "claude-sonnet-4-0",
            ),
            (PROVIDER_OLLAMA, ProviderKind::Ollama, "llama3.2"),
        ];

        for (id, kind, default_model) in candidates {
            let provider_settings = match settings.provider(id) {
                Some(s) if s.enabled => s.clone(),
                Some(_) => continue,
                // Ollama works with zero configuration.
                None if kind == ProviderKind::Ollama => ProviderSettings::default(),
                None => continue,
            };

            let registered = RegisteredProvider {
                kind,
                settings: provider_settings,
                default_model,
            };
            let probe = registered.build(registered.model_or_default(""));
            match probe.validate_config() {
                Ok(()) => {
                    providers.insert(id.to_string(), registered);
                }
                Err(e) => {
                    log::warn!("provider {} not registered: {}", id, e);
                }
            }
        }

        Self {
            providers,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Registered provider ids.
    pub fn providers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_registered(&self, provider: &str) -> bool {
        self.providers.contains_key(provider)
    }

    /// Fetch (or build and cache) a client for `provider` and `model`.
    /// An empty `model` selects the provider's configured default.
    pub async fn client(
        &self,
        provider: &str,
        model: &str,
    ) -> Result<Arc<dyn ClientWrapper>, LlmError> {
        // Exact-key hit first; this also serves clients installed via
        // `register_client` for providers with no adapter family.
        {
            let cache = self.cache.read().await;
            if let Some(client) = cache.get(&(provider.to_string(), model.to_string())) {
                return Ok(client.clone());
            }
        }

        let registered = self.providers.get(provider).ok_or_else(|| {
            LlmError::ProviderUnavailable(format!("no adapter registered for {:?}", provider))
        })?;
        let model = registered.model_or_default(model).to_string();

        let cache_key = (provider.to_string(), model.clone());
        {
            let cache = self.cache.read().await;
            if let Some(client) = cache.get(&cache_key) {
                return Ok(client.clone());
            }
        }

        let client = registered.build(&model);
        self.cache.write().await.insert(cache_key, client.clone());
        Ok(client)
    }

    /// Install a pre-built client under `(provider, model)`, bypassing
    /// the adapter families. Used by embedders and tests that bring
    /// their own [`ClientWrapper`].
    pub async fn register_client(
        &self,
        provider: &str,
        model: &str,
        client: Arc<dyn ClientWrapper>,
    ) {
        self.cache
            .write()
            .await
            .insert((provider.to_string(), model.to_string()), client);
    }
}
