//! The live-handle cache and [`ToolDispatcher`] implementation.
//!
//! One subprocess lives per `(agent, plugin id)`. A per-key mutex
//! serializes spawn, teardown, and calls (per-plugin concurrency is 1),
//! while the outer map lock is held only long enough to fetch the slot.
//! Before the first call on a handle the runtime validates and pushes
//! the agent's per-plugin configuration, then the agent context.
//!
//! Crash policy: a call that finds the process dead restarts it once for
//! that call; two crashes within [`CRASH_WINDOW`](super::health::CRASH_WINDOW)
//! disable the handle and emit `system.plugin_unloaded`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use plugin_rpc::wire::{AgentContext, CallContext};

use super::discovery::{evaluate_compatibility, CompatLevel, PluginIndex, PluginRecord, HOST_VERSION};
use super::health::HandleHealth;
use super::process::PluginProcess;
use super::PluginError;
use crate::agenthub::agent_store::AgentStore;
use crate::agenthub::event_bus::{event_type, EventBus};
use crate::agenthub::tool_protocol::{validate_args, ToolDispatcher, ToolError, ToolMetadata};

type HandleKey = (String, String);
type HandleSlot = Arc<Mutex<Option<PluginProcess>>>;

/// Tunables for the plugin runtime.
#[derive(Debug, Clone)]
pub struct PluginRuntimeConfig {
    /// Per-call timeout (default 30 s).
    pub call_timeout: Duration,
    /// Grace period for `shutdown` before the process is killed.
    pub shutdown_grace: Duration,
}

impl Default for PluginRuntimeConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Host-side plugin runtime: discovery index + handle cache + health.
pub struct PluginRuntime {
    agents: Arc<AgentStore>,
    index: RwLock<PluginIndex>,
    handles: Mutex<HashMap<HandleKey, HandleSlot>>,
    health: StdMutex<HashMap<HandleKey, HandleHealth>>,
    disabled: StdMutex<HashSet<HandleKey>>,
    bus: Option<Arc<EventBus>>,
    config: PluginRuntimeConfig,
}

impl PluginRuntime {
    pub fn new(
        agents: Arc<AgentStore>,
        bus: Option<Arc<EventBus>>,
        config: PluginRuntimeConfig,
    ) -> Self {
        Self {
            agents,
            index: RwLock::new(PluginIndex::new()),
            handles: Mutex::new(HashMap::new()),
            health: StdMutex::new(HashMap::new()),
            disabled: StdMutex::new(HashSet::new()),
            bus,
            config,
        }
    }

    /// Replace the discovery index (startup and on-demand rescans).
    pub async fn set_index(&self, index: PluginIndex) {
        *self.index.write().await = index;
    }

    pub async fn record(&self, plugin_id: &str) -> Option<PluginRecord> {
        self.index.read().await.get(plugin_id).cloned()
    }

    pub async fn discovered_ids(&self) -> Vec<String> {
        self.index.read().await.ids()
    }

    /// Health snapshot for a handle, if it has been used.
    pub fn handle_health(&self, agent: &str, plugin_id: &str) -> Option<HandleHealth> {
        self.health
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(agent.to_string(), plugin_id.to_string()))
            .cloned()
    }

    pub fn is_disabled(&self, agent: &str, plugin_id: &str) -> bool {
        self.disabled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&(agent.to_string(), plugin_id.to_string()))
    }

    /// Plugin ids currently callable by `agent` (enabled + discovered).
    pub async fn available_tool_ids(&self, agent: &str) -> Vec<String> {
        self.list_tools(agent)
            .await
            .into_iter()
            .map(|t| t.name)
            .collect()
    }

    fn emit(&self, event: &str, agent: &str, plugin_id: &str) {
        if let Some(bus) = &self.bus {
            bus.publish(
                event,
                None,
                serde_json::json!({"agent": agent, "plugin": plugin_id}),
            );
        }
    }

    async fn slot(&self, key: &HandleKey) -> HandleSlot {
        let mut handles = self.handles.lock().await;
        handles
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Spawn and initialize a process for `key` if the slot is empty or
    /// the previous process died.
    async fn ensure_process(
        &self,
        slot: &mut Option<PluginProcess>,
        key: &HandleKey,
        record: &PluginRecord,
        plugin_config: &HashMap<String, String>,
    ) -> Result<(), PluginError> {
        if let Some(process) = slot.as_mut() {
            if process.is_alive() {
                return Ok(());
            }
            *slot = None;
        }

        let mut process = PluginProcess::spawn(&record.path).await?;

        if record.capabilities.init_config_provider {
            process.validate_config(plugin_config).await?;
            process
                .initialize_with_config(plugin_config.clone())
                .await?;
        }
        let config_dir = self.agents.plugin_dir(&key.0, &key.1);
        process
            .set_agent_context(AgentContext {
                agent_name: key.0.clone(),
                config_dir: config_dir.to_string_lossy().into_owned(),
            })
            .await?;

        *slot = Some(process);
        self.emit(event_type::PLUGIN_LOADED, &key.0, &key.1);
        Ok(())
    }

    async fn call_once(
        &self,
        slot: &mut Option<PluginProcess>,
        key: &HandleKey,
        record: &PluginRecord,
        plugin_config: &HashMap<String, String>,
        args_json: String,
        context: CallContext,
    ) -> Result<String, PluginError> {
        self.ensure_process(slot, key, record, plugin_config).await?;
        let timeout = record
            .call_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.call_timeout);
        match slot.as_mut() {
            Some(process) => process.call(args_json, context, timeout).await,
            None => Err(PluginError::Spawn("plugin process unavailable".to_string())),
        }
    }

    fn disable_handle(&self, key: &HandleKey) {
        self.disabled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone());
        self.emit(event_type::PLUGIN_UNLOADED, &key.0, &key.1);
        log::warn!(
            "plugin {} disabled for agent {} after repeated crashes",
            key.1,
            key.0
        );
    }

    /// Tear down every live subprocess belonging to `agent`.
    ///
    /// Outstanding calls drain first because teardown takes each per-key
    /// lock; the shutdown grace bounds how long a stuck plugin can hold
    /// the switch up.
    pub async fn teardown_agent(&self, agent: &str) {
        let keys: Vec<HandleKey> = {
            let handles = self.handles.lock().await;
            handles
                .keys()
                .filter(|(a, _)| a == agent)
                .cloned()
                .collect()
        };
        for key in keys {
            self.teardown_key(&key).await;
        }
    }

    /// Tear down everything (process shutdown path).
    pub async fn shutdown_all(&self) {
        let keys: Vec<HandleKey> = self.handles.lock().await.keys().cloned().collect();
        for key in keys {
            self.teardown_key(&key).await;
        }
    }

    async fn teardown_key(&self, key: &HandleKey) {
        let slot = {
            let mut handles = self.handles.lock().await;
            handles.remove(key)
        };
        if let Some(slot) = slot {
            let mut guard = slot.lock().await;
            if let Some(process) = guard.take() {
                process.shutdown(self.config.shutdown_grace).await;
                self.emit(event_type::PLUGIN_UNLOADED, &key.0, &key.1);
            }
        }
    }

    fn map_error(err: PluginError) -> ToolError {
        match err {
            PluginError::CallTimeout(msg) => ToolError::Timeout(msg),
            PluginError::CallCrash(msg) => ToolError::Crashed(msg),
            PluginError::CallFailed(msg) => ToolError::ExecutionFailed(msg),
            PluginError::SchemaValidation(msg) => ToolError::InvalidParameters(msg),
            PluginError::ConfigRejected(msg) => {
                ToolError::ExecutionFailed(format!("plugin rejected configuration: {}", msg))
            }
            other => ToolError::ProtocolError(other.to_string()),
        }
    }
}

#[async_trait]
impl ToolDispatcher for PluginRuntime {
    async fn list_tools(&self, agent: &str) -> Vec<ToolMetadata> {
        let enabled = match self.agents.enabled_plugins(agent).await {
            Ok(enabled) => enabled,
            Err(_) => return Vec::new(),
        };
        let index = self.index.read().await;
        let mut tools: Vec<ToolMetadata> = enabled
            .iter()
            .filter(|p| !self.is_disabled(agent, &p.plugin_id))
            .filter_map(|p| index.get(&p.plugin_id))
            .filter(|r| {
                !matches!(
                    evaluate_compatibility(HOST_VERSION, r.compatibility.as_ref()),
                    CompatLevel::Error(_)
                )
            })
            .map(|r| r.tool_metadata())
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    async fn call_tool(
        &self,
        agent: &str,
        tool_name: &str,
        args: Value,
    ) -> Result<String, ToolError> {
        let enabled = self
            .agents
            .enabled_plugins(agent)
            .await
            .map_err(|e| ToolError::ProtocolError(e.to_string()))?;
        let plugin = enabled
            .into_iter()
            .find(|p| p.plugin_id == tool_name)
            .ok_or_else(|| ToolError::NotFound(tool_name.to_string()))?;

        let key: HandleKey = (agent.to_string(), tool_name.to_string());
        if self.is_disabled(agent, tool_name) {
            return Err(ToolError::ExecutionFailed(format!(
                "plugin {} is disabled",
                tool_name
            )));
        }

        let record = self
            .record(tool_name)
            .await
            .ok_or_else(|| ToolError::NotFound(tool_name.to_string()))?;

        match evaluate_compatibility(HOST_VERSION, record.compatibility.as_ref()) {
            CompatLevel::Error(reason) => {
                let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
                health.entry(key.clone()).or_default().mark_incompatible();
                return Err(ToolError::ExecutionFailed(format!(
                    "plugin {} incompatible: {}",
                    tool_name, reason
                )));
            }
            CompatLevel::Warning(reason) => {
                let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
                health.entry(key.clone()).or_default().set_warning(reason);
            }
            CompatLevel::Compatible => {}
        }

        validate_args(&record.parameters_schema, &args)?;
        let args_json =
            serde_json::to_string(&args).map_err(|e| ToolError::InvalidParameters(e.to_string()))?;
        let context = CallContext {
            agent: Some(agent.to_string()),
        };

        let slot = self.slot(&key).await;
        let mut guard = slot.lock().await;

        let started = Instant::now();
        let mut result = self
            .call_once(
                &mut guard,
                &key,
                &record,
                &plugin.config,
                args_json.clone(),
                context.clone(),
            )
            .await;

        // One restart attempt per call when the process died mid-call.
        if matches!(result, Err(PluginError::CallCrash(_))) {
            log::warn!("plugin {} crashed mid-call, restarting once", tool_name);
            *guard = None;
            result = self
                .call_once(&mut guard, &key, &record, &plugin.config, args_json, context)
                .await;
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let mut should_disable = false;
        {
            let mut health_map = self.health.lock().unwrap_or_else(|e| e.into_inner());
            let health = health_map.entry(key.clone()).or_default();
            match &result {
                Ok(_) => health.record_success(elapsed_ms),
                Err(PluginError::CallCrash(_)) => {
                    *guard = None;
                    should_disable = health.record_crash(chrono::Utc::now());
                }
                Err(_) => {
                    health.record_failure();
                    should_disable =
                        health.consecutive_failures >= super::health::UNHEALTHY_STREAK;
                }
            }
        }
        if should_disable {
            self.disable_handle(&key);
        }

        result.map_err(Self::map_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agenthub::plugin::discovery::PluginRecord;
    use plugin_rpc::wire::Compatibility;
    use std::path::PathBuf;

    async fn runtime_with_agent() -> (tempfile::TempDir, Arc<AgentStore>, PluginRuntime) {
        let dir = tempfile::tempdir().unwrap();
        let agents = Arc::new(AgentStore::load(dir.path().join("agents")).unwrap());
        agents.create("alpha").await.unwrap();
        let runtime = PluginRuntime::new(agents.clone(), None, PluginRuntimeConfig::default());
        (dir, agents, runtime)
    }

    fn record(id: &str) -> PluginRecord {
        PluginRecord {
            id: id.to_string(),
            path: PathBuf::from("/nonexistent/plugin"),
            sha256: String::new(),
            description: "a tool".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "required": ["x"]
            }),
            call_timeout_secs: None,
            version: None,
            metadata: None,
            compatibility: None,
            required_config: Vec::new(),
            web_pages: Vec::new(),
            capabilities: Default::default(),
            discovered_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn tools_require_both_enablement_and_discovery() {
        let (_dir, agents, runtime) = runtime_with_agent().await;

        // Enabled but never discovered: invisible.
        agents
            .enable_plugin("alpha", "ghost", HashMap::new())
            .await
            .unwrap();
        assert!(runtime.list_tools("alpha").await.is_empty());

        // Discovered but not enabled: invisible and not callable.
        let mut index = PluginIndex::new();
        index.insert(record("math"));
        runtime.set_index(index).await;
        assert!(runtime.list_tools("alpha").await.is_empty());
        assert!(matches!(
            runtime
                .call_tool("alpha", "math", serde_json::json!({"x": 1}))
                .await,
            Err(ToolError::NotFound(_))
        ));

        // Both: visible.
        agents
            .enable_plugin("alpha", "math", HashMap::new())
            .await
            .unwrap();
        let tools = runtime.list_tools("alpha").await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "math");
    }

    #[tokio::test]
    async fn argument_validation_happens_before_any_spawn() {
        let (_dir, agents, runtime) = runtime_with_agent().await;
        let mut index = PluginIndex::new();
        index.insert(record("math"));
        runtime.set_index(index).await;
        agents
            .enable_plugin("alpha", "math", HashMap::new())
            .await
            .unwrap();

        // Missing required key: rejected host-side (the executable path
        // does not even exist, so reaching spawn would error differently).
        let err = runtime
            .call_tool("alpha", "math", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));
    }

    #[tokio::test]
    async fn incompatible_plugins_are_not_listed_or_callable() {
        let (_dir, agents, runtime) = runtime_with_agent().await;
        let mut incompatible = record("math");
        incompatible.compatibility = Some(Compatibility {
            min_host_version: Some("999.0".to_string()),
            ..Default::default()
        });
        let mut index = PluginIndex::new();
        index.insert(incompatible);
        runtime.set_index(index).await;
        agents
            .enable_plugin("alpha", "math", HashMap::new())
            .await
            .unwrap();

        assert!(runtime.list_tools("alpha").await.is_empty());
        let err = runtime
            .call_tool("alpha", "math", serde_json::json!({"x": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed(_)));
        assert_eq!(
            runtime.handle_health("alpha", "math").unwrap().status(),
            crate::agenthub::plugin::health::HandleStatus::Incompatible
        );
    }

    #[tokio::test]
    async fn disabled_handles_refuse_calls() {
        let (_dir, agents, runtime) = runtime_with_agent().await;
        let mut index = PluginIndex::new();
        index.insert(record("math"));
        runtime.set_index(index).await;
        agents
            .enable_plugin("alpha", "math", HashMap::new())
            .await
            .unwrap();

        runtime.disable_handle(&("alpha".to_string(), "math".to_string()));
        let err = runtime
            .call_tool("alpha", "math", serde_json::json!({"x": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed(_)));
        assert!(runtime.is_disabled("alpha", "math"));
    }

    #[tokio::test]
    async fn spawn_failure_surfaces_as_protocol_error() {
        let (_dir, agents, runtime) = runtime_with_agent().await;
        let mut index = PluginIndex::new();
        index.insert(record("math"));
        runtime.set_index(index).await;
        agents
            .enable_plugin("alpha", "math", HashMap::new())
            .await
            .unwrap();

        let err = runtime
            .call_tool("alpha", "math", serde_json::json!({"x": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ProtocolError(_)));
    }
}
