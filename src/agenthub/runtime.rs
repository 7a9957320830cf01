//! Process-wide wiring: construct the services in dependency order,
//! start the pollers, and tear everything down on shutdown.
//!
//! Initialization order: global settings → agent store → plugin
//! registry (discovery scan) → LLM provider registry → workspace store
//! → event-bus consumers → scheduler/task/step executors. Shutdown
//! reverses it: stop pollers, give in-flight tasks their grace period,
//! then tear down plugin subprocesses.

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::agenthub::agent_store::AgentStore;
use crate::agenthub::chat::{ChatCore, ChatCoreConfig};
use crate::agenthub::clients::registry::ProviderRegistry;
use crate::agenthub::event_bus::{EventBus, DEFAULT_CHANNEL_CAPACITY, DEFAULT_HISTORY_CAPACITY};
use crate::agenthub::executor::{
    Scheduler, SchedulerConfig, StepExecutor, StepExecutorConfig, TaskExecutor,
    TaskExecutorConfig,
};
use crate::agenthub::notification::NotificationService;
use crate::agenthub::plugin::discovery::{scan_roots, PluginRegistryDoc};
use crate::agenthub::plugin::{PluginRuntime, PluginRuntimeConfig};
use crate::agenthub::settings::{GlobalSettings, ProcessState};
use crate::agenthub::tool_protocol::ToolDispatcher;
use crate::agenthub::workspace_store::WorkspaceStore;

/// Everything tunable about a runtime instance.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Root of all persisted state.
    pub data_dir: PathBuf,
    pub chat: ChatCoreConfig,
    pub plugin: PluginRuntimeConfig,
    pub task_executor: TaskExecutorConfig,
    pub step_executor: StepExecutorConfig,
    pub scheduler: SchedulerConfig,
    pub history_window: usize,
    pub event_history_capacity: usize,
    pub event_channel_capacity: usize,
}

impl RuntimeConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            chat: ChatCoreConfig::default(),
            plugin: PluginRuntimeConfig::default(),
            task_executor: TaskExecutorConfig::default(),
            step_executor: StepExecutorConfig::default(),
            scheduler: SchedulerConfig::default(),
            history_window: crate::agenthub::agent_store::DEFAULT_HISTORY_WINDOW,
            event_history_capacity: DEFAULT_HISTORY_CAPACITY,
            event_channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// The assembled runtime.
pub struct Runtime {
    pub settings: GlobalSettings,
    pub process_state: ProcessState,
    pub bus: Arc<EventBus>,
    pub providers: Arc<ProviderRegistry>,
    pub agents: Arc<AgentStore>,
    pub plugins: Arc<PluginRuntime>,
    pub workspaces: Arc<WorkspaceStore>,
    pub notifications: Arc<NotificationService>,
    pub chat: Arc<ChatCore>,
    pub task_executor: Arc<TaskExecutor>,
    pub step_executor: Arc<StepExecutor>,
    pub scheduler: Arc<Scheduler>,
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    notification_worker: JoinHandle<()>,
    cancel_grace: Duration,
}

impl Runtime {
    /// Build every service and start the pollers.
    pub async fn start(config: RuntimeConfig) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let data_dir = &config.data_dir;
        std::fs::create_dir_all(data_dir)?;

        let settings = GlobalSettings::load(&data_dir.join("settings.json"))?;
        let process_state = ProcessState::load(&data_dir.join("process_state.json"))?;

        let agents = Arc::new(AgentStore::load_with_window(
            data_dir.join("agents"),
            config.history_window,
        )?);

        let bus = Arc::new(EventBus::new(
            config.event_history_capacity,
            config.event_channel_capacity,
        ));

        let plugins = Arc::new(PluginRuntime::new(
            agents.clone(),
            Some(bus.clone()),
            config.plugin.clone(),
        ));
        let mut plugin_roots = settings.plugin_dirs.clone();
        plugin_roots.push(data_dir.join("plugins"));
        let mut index = scan_roots(&plugin_roots).await;
        if let Err(e) =
            PluginRegistryDoc::from_index(&index).save(&data_dir.join("plugin_registry.json"))
        {
            log::warn!("plugin registry not persisted: {}", e);
        }
        // Locally discovered plugins take precedence over the cached
        // remote registry.
        match PluginRegistryDoc::load(&data_dir.join("plugin_registry_remote.json")) {
            Ok(remote) => {
                for record in remote.plugins.into_values() {
                    index.insert(record);
                }
            }
            Err(e) => log::warn!("cached remote plugin registry unreadable: {}", e),
        }
        plugins.set_index(index).await;

        let providers = Arc::new(ProviderRegistry::from_settings(&settings));

        let workspaces = Arc::new(WorkspaceStore::load(
            data_dir.join("workspaces"),
            bus.clone(),
        )?);

        let notifications = Arc::new(NotificationService::new());

        let dispatcher: Arc<dyn ToolDispatcher> = plugins.clone();
        let chat = Arc::new(ChatCore::new(
            providers.clone(),
            agents.clone(),
            dispatcher,
            workspaces.clone(),
            config.chat.clone(),
        ));

        let task_executor = TaskExecutor::new(
            workspaces.clone(),
            chat.clone(),
            config.task_executor.clone(),
        );
        let step_executor = StepExecutor::new(workspaces.clone(), config.step_executor.clone());
        let scheduler = Scheduler::new(workspaces.clone(), config.scheduler.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let notification_worker = notifications.attach(&bus);
        let workers = vec![
            scheduler.spawn(shutdown_rx.clone()),
            task_executor.spawn(shutdown_rx.clone()),
            step_executor.spawn(shutdown_rx),
        ];

        Ok(Self {
            settings,
            process_state,
            bus,
            providers,
            agents,
            plugins,
            workspaces,
            notifications,
            chat,
            task_executor,
            step_executor,
            scheduler,
            shutdown_tx,
            workers,
            notification_worker,
            cancel_grace: config.task_executor.cancel_grace,
        })
    }

    /// Switch the current agent, tearing down the previous agent's
    /// plugin subprocesses after its outstanding calls drain.
    pub async fn switch_agent(
        &self,
        name: &str,
    ) -> Result<(), crate::agenthub::agent_store::AgentStoreError> {
        let previous = self.agents.switch_current(name).await?;
        if let Some(previous) = previous {
            if previous != name {
                self.plugins.teardown_agent(&previous).await;
            }
        }
        Ok(())
    }

    /// Stop pollers, wait out the cancellation grace for in-flight
    /// tasks, then tear down plugin subprocesses.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }

        let deadline = tokio::time::Instant::now() + self.cancel_grace + Duration::from_secs(1);
        while self.task_executor.in_flight_count().await > 0 {
            if tokio::time::Instant::now() >= deadline {
                log::warn!("shutdown grace elapsed with tasks still in flight");
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        self.plugins.shutdown_all().await;
        // The bridge blocks on its bus channel; nothing more will come.
        self.notification_worker.abort();
    }
}
