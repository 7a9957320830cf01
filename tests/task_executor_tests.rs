//! Task-executor integration tests: concurrency cap, per-agent
//! serialization, timeout handling, and result recording.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use agenthub::agent_store::AgentStore;
use agenthub::chat::{ChatCore, ChatCoreConfig};
use agenthub::client_wrapper::{
    ChatOptions, ClientWrapper, LlmError, Message, ProviderCapabilities, ToolDefinition,
};
use agenthub::clients::registry::ProviderRegistry;
use agenthub::event_bus::EventBus;
use agenthub::executor::{TaskExecutor, TaskExecutorConfig};
use agenthub::settings::GlobalSettings;
use agenthub::tool_protocol::{ToolDispatcher, ToolError, ToolMetadata};
use agenthub::workspace::{Task, TaskStatus};
use agenthub::workspace_store::WorkspaceStore;

/// Replies after a fixed delay, tracking how many calls run at once.
struct SlowClient {
    delay: Duration,
    current: AtomicUsize,
    max_observed: AtomicUsize,
}

impl SlowClient {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            current: AtomicUsize::new(0),
            max_observed: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ClientWrapper for SlowClient {
    async fn send_message(
        &self,
        _messages: &[Message],
        _tools: Option<Vec<ToolDefinition>>,
        _options: &ChatOptions,
    ) -> Result<Message, LlmError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_observed.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(Message::assistant("task handled"))
    }

    fn model_name(&self) -> &str {
        "slow"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supports_tools: false,
            supports_streaming: false,
            supports_system_prompt: true,
            supports_custom_endpoint: false,
            requires_api_key: false,
            max_context_window: 8192,
        }
    }
}

struct NoTools;

#[async_trait]
impl ToolDispatcher for NoTools {
    async fn list_tools(&self, _agent: &str) -> Vec<ToolMetadata> {
        Vec::new()
    }

    async fn call_tool(
        &self,
        _agent: &str,
        tool_name: &str,
        _args: serde_json::Value,
    ) -> Result<String, ToolError> {
        Err(ToolError::NotFound(tool_name.to_string()))
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    workspaces: Arc<WorkspaceStore>,
    executor: Arc<TaskExecutor>,
    client: Arc<SlowClient>,
    shutdown: watch::Receiver<bool>,
    _shutdown_tx: watch::Sender<bool>,
}

async fn harness(
    agent_names: &[&str],
    delay: Duration,
    config: TaskExecutorConfig,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let agents = Arc::new(AgentStore::load(dir.path().join("agents")).unwrap());
    for &name in agent_names {
        agents.create(name).await.unwrap();
        let mut settings = agents.get_settings(name).await.unwrap();
        settings.provider = "mock".to_string();
        settings.model = "slow".to_string();
        agents.update_settings(name, settings).await.unwrap();
    }

    let bus = Arc::new(EventBus::default());
    let workspaces =
        Arc::new(WorkspaceStore::load(dir.path().join("workspaces"), bus).unwrap());
    let providers = Arc::new(ProviderRegistry::from_settings(&GlobalSettings::default()));
    let client = Arc::new(SlowClient::new(delay));
    providers.register_client("mock", "slow", client.clone()).await;

    let chat = Arc::new(ChatCore::new(
        providers,
        agents,
        Arc::new(NoTools),
        workspaces.clone(),
        ChatCoreConfig::default(),
    ));
    let executor = TaskExecutor::new(workspaces.clone(), chat, config);
    let (tx, rx) = watch::channel(false);

    Harness {
        _dir: dir,
        workspaces,
        executor,
        client,
        shutdown: rx,
        _shutdown_tx: tx,
    }
}

async fn wait_until<F, Fut>(mut condition: F, timeout: Duration)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {:?}",
            timeout
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn concurrency_cap_bounds_in_progress_tasks() {
    let names: Vec<String> = (1..=8).map(|i| format!("worker{}", i)).collect();
    let name_refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
    let h = harness(
        &name_refs,
        Duration::from_millis(500),
        TaskExecutorConfig {
            poll_interval: Duration::from_millis(50),
            max_concurrent: 5,
            cancel_grace: Duration::from_secs(1),
        },
    )
    .await;

    let ws = h
        .workspaces
        .create_workspace("load", names.clone())
        .await
        .unwrap();
    for name in &names {
        h.workspaces
            .create_task(Task::new(ws, "worker1", name, format!("task for {}", name)))
            .await
            .unwrap();
    }

    h.executor.tick(h.shutdown.clone()).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Exactly the cap is running; the rest are still pending.
    let snapshot = h.workspaces.snapshot(ws).await.unwrap();
    let in_progress = snapshot
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::InProgress)
        .count();
    let pending = snapshot
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .count();
    assert_eq!(in_progress, 5);
    assert_eq!(pending, 3);

    // Keep ticking until the backlog drains.
    let workspaces = h.workspaces.clone();
    for _ in 0..20 {
        h.executor.tick(h.shutdown.clone()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let done = workspaces
            .snapshot(ws)
            .await
            .unwrap()
            .tasks
            .iter()
            .all(|t| t.status == TaskStatus::Completed);
        if done {
            break;
        }
    }

    let snapshot = h.workspaces.snapshot(ws).await.unwrap();
    assert!(snapshot
        .tasks
        .iter()
        .all(|t| t.status == TaskStatus::Completed));
    assert_eq!(h.client.max_observed.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn tasks_to_the_same_agent_never_interleave() {
    let h = harness(
        &["solo", "other"],
        Duration::from_millis(150),
        TaskExecutorConfig {
            poll_interval: Duration::from_millis(50),
            max_concurrent: 5,
            cancel_grace: Duration::from_secs(1),
        },
    )
    .await;

    let ws = h
        .workspaces
        .create_workspace("serial", vec!["solo".to_string(), "other".to_string()])
        .await
        .unwrap();
    for i in 0..3 {
        h.workspaces
            .create_task(Task::new(ws, "other", "solo", format!("step {}", i)))
            .await
            .unwrap();
    }

    h.executor.tick(h.shutdown.clone()).await;
    let workspaces = h.workspaces.clone();
    wait_until(
        || {
            let workspaces = workspaces.clone();
            async move {
                workspaces
                    .snapshot(ws)
                    .await
                    .unwrap()
                    .tasks
                    .iter()
                    .all(|t| t.status == TaskStatus::Completed)
            }
        },
        Duration::from_secs(5),
    )
    .await;

    // All three ran, but one at a time.
    assert_eq!(h.client.max_observed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn task_timeout_fails_the_task() {
    let h = harness(
        &["slowpoke"],
        Duration::from_secs(10),
        TaskExecutorConfig {
            poll_interval: Duration::from_millis(50),
            max_concurrent: 2,
            cancel_grace: Duration::from_millis(200),
        },
    )
    .await;

    let ws = h
        .workspaces
        .create_workspace("timeouts", vec!["slowpoke".to_string()])
        .await
        .unwrap();
    h.workspaces
        .create_task(
            Task::new(ws, "slowpoke", "slowpoke", "never finishes").with_timeout_secs(1),
        )
        .await
        .unwrap();

    h.executor.tick(h.shutdown.clone()).await;
    let workspaces = h.workspaces.clone();
    wait_until(
        || {
            let workspaces = workspaces.clone();
            async move {
                workspaces
                    .snapshot(ws)
                    .await
                    .unwrap()
                    .tasks
                    .iter()
                    .all(|t| t.status == TaskStatus::Failed)
            }
        },
        Duration::from_secs(5),
    )
    .await;

    let snapshot = h.workspaces.snapshot(ws).await.unwrap();
    let task = &snapshot.tasks[0];
    assert!(task.error.as_deref().unwrap().contains("timed out"));
    assert!(task.completed_at.is_some());
}

#[tokio::test]
async fn completed_tasks_record_the_reply() {
    let h = harness(
        &["worker"],
        Duration::from_millis(20),
        TaskExecutorConfig {
            poll_interval: Duration::from_millis(50),
            max_concurrent: 2,
            cancel_grace: Duration::from_secs(1),
        },
    )
    .await;

    let ws = h
        .workspaces
        .create_workspace("simple", vec!["worker".to_string()])
        .await
        .unwrap();
    let mut context = serde_json::Map::new();
    context.insert("topic".to_string(), serde_json::json!("rust"));
    h.workspaces
        .create_task(Task::new(ws, "worker", "worker", "summarize").with_context(context))
        .await
        .unwrap();

    h.executor.tick(h.shutdown.clone()).await;
    let workspaces = h.workspaces.clone();
    wait_until(
        || {
            let workspaces = workspaces.clone();
            async move {
                workspaces
                    .snapshot(ws)
                    .await
                    .unwrap()
                    .tasks
                    .iter()
                    .all(|t| t.status == TaskStatus::Completed)
            }
        },
        Duration::from_secs(5),
    )
    .await;

    let snapshot = h.workspaces.snapshot(ws).await.unwrap();
    let task = &snapshot.tasks[0];
    assert_eq!(task.result.as_deref(), Some("task handled"));
    assert!(task.created_at <= task.started_at.unwrap());
    assert!(task.started_at.unwrap() <= task.completed_at.unwrap());
}
