//! Named agents: settings, enabled plugins, conversation history, and
//! the process-wide notion of a single "current" agent.
//!
//! The store is guarded by one coarse lock; read operations return
//! cloned snapshots. Each agent owns a directory on disk:
//!
//! ```text
//! agents/<name>/config.json            settings + enabled plugins
//! agents/<name>/messages.json          history log (best-effort, windowed)
//! agents/<name>/plugins/<id>/settings.json
//! ```
//!
//! `config.json` writes are atomic and synchronous with the mutation;
//! history persistence is best-effort and truncated to a configurable
//! window.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::agenthub::client_wrapper::{Message, NativeToolCall, Role};
use crate::agenthub::persist::{read_json, write_json_atomic};

/// Collaboration role an agent plays inside workspaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Orchestrator,
    Researcher,
    Analyzer,
    Synthesizer,
    Validator,
    #[default]
    Specialist,
}

/// Per-agent LLM settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    pub provider: String,
    pub model: String,
    pub temperature: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub system_prompt: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: String::new(),
            temperature: 1.0,
            max_tokens: None,
            system_prompt: String::new(),
        }
    }
}

/// One enabled plugin with its per-plugin configuration map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnabledPlugin {
    pub plugin_id: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
}

/// The persisted `config.json` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    #[serde(default)]
    pub settings: AgentSettings,
    #[serde(default)]
    pub enabled_plugins: Vec<EnabledPlugin>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub role: AgentRole,
}

/// Serialized message roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoredRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// One history entry. `tool_call_id` is set on tool-result messages and
/// cites a call id from the most recent assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: StoredRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<StoredToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StoredMessage {
    pub fn from_message(msg: &Message) -> Self {
        let (role, tool_call_id) = match &msg.role {
            Role::System => (StoredRole::System, None),
            Role::User => (StoredRole::User, None),
            Role::Assistant => (StoredRole::Assistant, None),
            Role::Tool { call_id } => (StoredRole::Tool, Some(call_id.clone())),
        };
        Self {
            role,
            content: msg.content.as_ref().to_string(),
            tool_calls: msg
                .tool_calls
                .iter()
                .map(|tc| StoredToolCall {
                    id: tc.id.clone(),
                    name: tc.name.clone(),
                    arguments: tc.arguments.clone(),
                })
                .collect(),
            tool_call_id,
            timestamp: Utc::now(),
        }
    }

    pub fn to_message(&self) -> Message {
        let role = match self.role {
            StoredRole::System => Role::System,
            StoredRole::User => Role::User,
            StoredRole::Assistant => Role::Assistant,
            StoredRole::Tool => Role::Tool {
                call_id: self.tool_call_id.clone().unwrap_or_default(),
            },
        };
        Message {
            role,
            content: Arc::from(self.content.as_str()),
            tool_calls: self
                .tool_calls
                .iter()
                .map(|tc| NativeToolCall {
                    id: tc.id.clone(),
                    name: tc.name.clone(),
                    arguments: tc.arguments.clone(),
                })
                .collect(),
            finish_reason: None,
        }
    }
}

/// Errors surfaced by the agent store.
#[derive(Debug, Clone)]
pub enum AgentStoreError {
    NotFound(String),
    AlreadyExists(String),
    InvalidSettings(String),
    Io(String),
}

impl fmt::Display for AgentStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStoreError::NotFound(name) => write!(f, "agent not found: {}", name),
            AgentStoreError::AlreadyExists(name) => write!(f, "agent already exists: {}", name),
            AgentStoreError::InvalidSettings(msg) => write!(f, "invalid settings: {}", msg),
            AgentStoreError::Io(msg) => write!(f, "agent store io error: {}", msg),
        }
    }
}

impl Error for AgentStoreError {}

impl From<std::io::Error> for AgentStoreError {
    fn from(e: std::io::Error) -> Self {
        AgentStoreError::Io(e.to_string())
    }
}

struct AgentState {
    config: AgentConfig,
    messages: Vec<StoredMessage>,
}

struct Inner {
    agents: HashMap<String, AgentState>,
    current: Option<String>,
}

/// Default number of history entries kept on disk and in memory.
pub const DEFAULT_HISTORY_WINDOW: usize = 200;

/// The store. One coarse async lock guards the whole collection.
pub struct AgentStore {
    dir: PathBuf,
    history_window: usize,
    inner: RwLock<Inner>,
}

impl AgentStore {
    /// Rehydrate the store from `dir` (typically `<data>/agents`).
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self, AgentStoreError> {
        Self::load_with_window(dir, DEFAULT_HISTORY_WINDOW)
    }

    pub fn load_with_window(
        dir: impl Into<PathBuf>,
        history_window: usize,
    ) -> Result<Self, AgentStoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut agents = HashMap::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let config_path = entry.path().join("config.json");
            if !config_path.exists() {
                continue;
            }
            let config: AgentConfig = match read_json(&config_path) {
                Ok(c) => c,
                Err(e) => {
                    log::warn!("skipping unreadable agent config {:?}: {}", config_path, e);
                    continue;
                }
            };
            let messages_path = entry.path().join("messages.json");
            let messages: Vec<StoredMessage> = if messages_path.exists() {
                read_json(&messages_path).unwrap_or_else(|e| {
                    log::warn!("discarding unreadable history {:?}: {}", messages_path, e);
                    Vec::new()
                })
            } else {
                Vec::new()
            };
            agents.insert(config.name.clone(), AgentState { config, messages });
        }

        let current = agents.keys().min().cloned();
        Ok(Self {
            dir,
            history_window,
            inner: RwLock::new(Inner { agents, current }),
        })
    }

    pub fn agent_dir(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Directory reserved for a plugin's own state under this agent.
    pub fn plugin_dir(&self, agent: &str, plugin_id: &str) -> PathBuf {
        self.agent_dir(agent).join("plugins").join(plugin_id)
    }

    pub async fn list(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut names: Vec<String> = inner.agents.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn exists(&self, name: &str) -> bool {
        self.inner.read().await.agents.contains_key(name)
    }

    /// Create an agent with default settings. The first agent created
    /// becomes the current one.
    pub async fn create(&self, name: &str) -> Result<AgentConfig, AgentStoreError> {
        if name.trim().is_empty() || name.contains(['/', '\\']) {
            return Err(AgentStoreError::InvalidSettings(format!(
                "invalid agent name: {:?}",
                name
            )));
        }
        let mut inner = self.inner.write().await;
        if inner.agents.contains_key(name) {
            return Err(AgentStoreError::AlreadyExists(name.to_string()));
        }
        let config = AgentConfig {
            name: name.to_string(),
            settings: AgentSettings::default(),
            enabled_plugins: Vec::new(),
            capabilities: Vec::new(),
            role: AgentRole::default(),
        };
        write_json_atomic(&self.agent_dir(name).join("config.json"), &config)?;
        inner.agents.insert(
            name.to_string(),
            AgentState {
                config: config.clone(),
                messages: Vec::new(),
            },
        );
        if inner.current.is_none() {
            inner.current = Some(name.to_string());
        }
        Ok(config)
    }

    /// Delete an agent and its state directory.
    ///
    /// Returns the deleted agent's name if it was current, so callers can
    /// tear down its plugin subprocesses.
    pub async fn delete(&self, name: &str) -> Result<(), AgentStoreError> {
        let mut inner = self.inner.write().await;
        if inner.agents.remove(name).is_none() {
            return Err(AgentStoreError::NotFound(name.to_string()));
        }
        if inner.current.as_deref() == Some(name) {
            inner.current = inner.agents.keys().min().cloned();
        }
        let dir = self.agent_dir(name);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    pub async fn current(&self) -> Option<String> {
        self.inner.read().await.current.clone()
    }

    /// Make `name` the current agent, returning the previous current.
    pub async fn switch_current(&self, name: &str) -> Result<Option<String>, AgentStoreError> {
        let mut inner = self.inner.write().await;
        if !inner.agents.contains_key(name) {
            return Err(AgentStoreError::NotFound(name.to_string()));
        }
        let previous = inner.current.replace(name.to_string());
        Ok(previous)
    }

    pub async fn get_config(&self, name: &str) -> Result<AgentConfig, AgentStoreError> {
        let inner = self.inner.read().await;
        inner
            .agents
            .get(name)
            .map(|s| s.config.clone())
            .ok_or_else(|| AgentStoreError::NotFound(name.to_string()))
    }

    pub async fn get_settings(&self, name: &str) -> Result<AgentSettings, AgentStoreError> {
        Ok(self.get_config(name).await?.settings)
    }

    pub async fn update_settings(
        &self,
        name: &str,
        settings: AgentSettings,
    ) -> Result<(), AgentStoreError> {
        if !(0.0..=2.0).contains(&settings.temperature) {
            return Err(AgentStoreError::InvalidSettings(format!(
                "temperature {} outside [0, 2]",
                settings.temperature
            )));
        }
        self.mutate_config(name, |config| {
            config.settings = settings;
            Ok(())
        })
        .await
    }

    pub async fn set_role(&self, name: &str, role: AgentRole) -> Result<(), AgentStoreError> {
        self.mutate_config(name, |config| {
            config.role = role;
            Ok(())
        })
        .await
    }

    pub async fn enabled_plugins(&self, name: &str) -> Result<Vec<EnabledPlugin>, AgentStoreError> {
        Ok(self.get_config(name).await?.enabled_plugins)
    }

    /// Enable a plugin for the agent, recording its config map. Also
    /// writes the plugin's own settings document.
    pub async fn enable_plugin(
        &self,
        name: &str,
        plugin_id: &str,
        config: HashMap<String, String>,
    ) -> Result<(), AgentStoreError> {
        let settings_path = self.plugin_dir(name, plugin_id).join("settings.json");
        self.mutate_config(name, |agent_config| {
            agent_config
                .enabled_plugins
                .retain(|p| p.plugin_id != plugin_id);
            agent_config.enabled_plugins.push(EnabledPlugin {
                plugin_id: plugin_id.to_string(),
                config: config.clone(),
            });
            Ok(())
        })
        .await?;
        write_json_atomic(&settings_path, &config)?;
        Ok(())
    }

    pub async fn disable_plugin(&self, name: &str, plugin_id: &str) -> Result<(), AgentStoreError> {
        self.mutate_config(name, |config| {
            let before = config.enabled_plugins.len();
            config.enabled_plugins.retain(|p| p.plugin_id != plugin_id);
            if config.enabled_plugins.len() == before {
                return Err(AgentStoreError::NotFound(format!(
                    "plugin {} not enabled for {}",
                    plugin_id, name
                )));
            }
            Ok(())
        })
        .await
    }

    pub async fn update_plugin_config(
        &self,
        name: &str,
        plugin_id: &str,
        config: HashMap<String, String>,
    ) -> Result<(), AgentStoreError> {
        let settings_path = self.plugin_dir(name, plugin_id).join("settings.json");
        self.mutate_config(name, |agent_config| {
            let entry = agent_config
                .enabled_plugins
                .iter_mut()
                .find(|p| p.plugin_id == plugin_id)
                .ok_or_else(|| {
                    AgentStoreError::NotFound(format!(
                        "plugin {} not enabled for {}",
                        plugin_id, name
                    ))
                })?;
            entry.config = config.clone();
            Ok(())
        })
        .await?;
        write_json_atomic(&settings_path, &config)?;
        Ok(())
    }

    pub async fn history(&self, name: &str) -> Result<Vec<StoredMessage>, AgentStoreError> {
        let inner = self.inner.read().await;
        inner
            .agents
            .get(name)
            .map(|s| s.messages.clone())
            .ok_or_else(|| AgentStoreError::NotFound(name.to_string()))
    }

    /// Append a message, trimming to the history window. History writes
    /// are best-effort: an IO failure logs and keeps the in-memory state.
    pub async fn append_message(&self, name: &str, msg: &Message) -> Result<(), AgentStoreError> {
        let mut inner = self.inner.write().await;
        let window = self.history_window;
        let state = inner
            .agents
            .get_mut(name)
            .ok_or_else(|| AgentStoreError::NotFound(name.to_string()))?;
        state.messages.push(StoredMessage::from_message(msg));
        if state.messages.len() > window {
            let excess = state.messages.len() - window;
            state.messages.drain(..excess);
        }
        let path = self.agent_dir(name).join("messages.json");
        if let Err(e) = write_json_atomic(&path, &state.messages) {
            log::warn!("history persistence failed for {}: {}", name, e);
        }
        Ok(())
    }

    pub async fn clear_history(&self, name: &str) -> Result<(), AgentStoreError> {
        let mut inner = self.inner.write().await;
        let state = inner
            .agents
            .get_mut(name)
            .ok_or_else(|| AgentStoreError::NotFound(name.to_string()))?;
        state.messages.clear();
        let path = self.agent_dir(name).join("messages.json");
        if let Err(e) = write_json_atomic(&path, &state.messages) {
            log::warn!("history persistence failed for {}: {}", name, e);
        }
        Ok(())
    }

    async fn mutate_config<F>(&self, name: &str, mutate: F) -> Result<(), AgentStoreError>
    where
        F: FnOnce(&mut AgentConfig) -> Result<(), AgentStoreError>,
    {
        let mut inner = self.inner.write().await;
        let state = inner
            .agents
            .get_mut(name)
            .ok_or_else(|| AgentStoreError::NotFound(name.to_string()))?;
        let mut updated = state.config.clone();
        mutate(&mut updated)?;
        write_json_atomic(&self.agent_dir(name).join("config.json"), &updated)?;
        state.config = updated;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, AgentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = AgentStore::load(dir.path().join("agents")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn create_list_delete() {
        let (_dir, store) = store().await;
        store.create("alpha").await.unwrap();
        store.create("beta").await.unwrap();
        assert_eq!(store.list().await, vec!["alpha", "beta"]);
        assert!(matches!(
            store.create("alpha").await,
            Err(AgentStoreError::AlreadyExists(_))
        ));
        store.delete("alpha").await.unwrap();
        assert_eq!(store.list().await, vec!["beta"]);
        assert!(!store.agent_dir("alpha").exists());
    }

    #[tokio::test]
    async fn first_agent_becomes_current_and_delete_reassigns() {
        let (_dir, store) = store().await;
        store.create("alpha").await.unwrap();
        store.create("beta").await.unwrap();
        assert_eq!(store.current().await.as_deref(), Some("alpha"));
        let previous = store.switch_current("beta").await.unwrap();
        assert_eq!(previous.as_deref(), Some("alpha"));
        store.delete("beta").await.unwrap();
        assert_eq!(store.current().await.as_deref(), Some("alpha"));
    }

    #[tokio::test]
    async fn settings_temperature_is_bounded() {
        let (_dir, store) = store().await;
        store.create("alpha").await.unwrap();
        let mut settings = store.get_settings("alpha").await.unwrap();
        settings.temperature = 2.5;
        assert!(matches!(
            store.update_settings("alpha", settings.clone()).await,
            Err(AgentStoreError::InvalidSettings(_))
        ));
        settings.temperature = 0.3;
        store.update_settings("alpha", settings).await.unwrap();
        assert_eq!(
            store.get_settings("alpha").await.unwrap().temperature,
            0.3
        );
    }

    #[tokio::test]
    async fn plugin_enable_roundtrip_is_idempotent() {
        let (_dir, store) = store().await;
        store.create("alpha").await.unwrap();
        let mut config = HashMap::new();
        config.insert("precision".to_string(), "high".to_string());

        store
            .enable_plugin("alpha", "math", config.clone())
            .await
            .unwrap();
        store.disable_plugin("alpha", "math").await.unwrap();
        store
            .enable_plugin("alpha", "math", config.clone())
            .await
            .unwrap();

        let plugins = store.enabled_plugins("alpha").await.unwrap();
        assert_eq!(plugins.len(), 1);
        assert_eq!(plugins[0].plugin_id, "math");
        assert_eq!(plugins[0].config, config);
    }

    #[tokio::test]
    async fn history_is_windowed_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = AgentStore::load_with_window(dir.path().join("agents"), 3).unwrap();
        store.create("alpha").await.unwrap();
        for i in 0..5 {
            store
                .append_message("alpha", &Message::user(format!("m{}", i)))
                .await
                .unwrap();
        }
        let history = store.history("alpha").await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].content, "m2");

        // Reload from disk and confirm the window survived.
        drop(store);
        let store = AgentStore::load_with_window(dir.path().join("agents"), 3).unwrap();
        let history = store.history("alpha").await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].content, "m4");
    }

    #[tokio::test]
    async fn reload_preserves_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agents");
        {
            let store = AgentStore::load(&path).unwrap();
            store.create("alpha").await.unwrap();
            store.set_role("alpha", AgentRole::Researcher).await.unwrap();
            store
                .enable_plugin("alpha", "math", HashMap::new())
                .await
                .unwrap();
        }
        let store = AgentStore::load(&path).unwrap();
        let config = store.get_config("alpha").await.unwrap();
        assert_eq!(config.role, AgentRole::Researcher);
        assert_eq!(config.enabled_plugins.len(), 1);
    }

    #[test]
    fn stored_message_round_trip() {
        let msg = Message {
            role: Role::Assistant,
            content: Arc::from("calling"),
            tool_calls: vec![NativeToolCall {
                id: "call_1".to_string(),
                name: "math".to_string(),
                arguments: serde_json::json!({"a": 1}),
            }],
            finish_reason: Some("tool_calls".to_string()),
        };
        let stored = StoredMessage::from_message(&msg);
        let back = stored.to_message();
        assert_eq!(back.role, Role::Assistant);
        assert_eq!(back.tool_calls.len(), 1);
        assert_eq!(back.tool_calls[0].id, "call_1");

        let tool = Message::tool_result("call_1", "8");
        let stored = StoredMessage::from_message(&tool);
        assert_eq!(stored.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(
            stored.to_message().role,
            Role::Tool {
                call_id: "call_1".to_string()
            }
        );
    }
}
