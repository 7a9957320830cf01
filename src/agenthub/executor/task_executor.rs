//! Task executor: drives pending tasks to completion through the chat
//! core.
//!
//! One poller takes a snapshot of pending tasks across all active
//! workspaces each tick, ordered `(priority desc, created_at asc)`, and
//! dispatches them to worker subtasks under a global semaphore cap.
//! Tasks addressed to the same agent are additionally serialized by a
//! per-agent lock so a conversation never interleaves two task turns.
//!
//! On shutdown the poller stops first; in-flight turns get a grace
//! period to finish, after which their tasks are marked `cancelled`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::agenthub::chat::ChatCore;
use crate::agenthub::workspace::Task;
use crate::agenthub::workspace_store::WorkspaceStore;

#[derive(Debug, Clone)]
pub struct TaskExecutorConfig {
    pub poll_interval: Duration,
    /// Global cap on concurrently executing tasks.
    pub max_concurrent: usize,
    /// How long in-flight turns may run on after shutdown.
    pub cancel_grace: Duration,
}

impl Default for TaskExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            max_concurrent: 5,
            cancel_grace: Duration::from_secs(10),
        }
    }
}

pub struct TaskExecutor {
    workspaces: Arc<WorkspaceStore>,
    chat: Arc<ChatCore>,
    config: TaskExecutorConfig,
    semaphore: Arc<Semaphore>,
    agent_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    in_flight: Mutex<HashSet<Uuid>>,
}

impl TaskExecutor {
    pub fn new(
        workspaces: Arc<WorkspaceStore>,
        chat: Arc<ChatCore>,
        config: TaskExecutorConfig,
    ) -> Arc<Self> {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Arc::new(Self {
            workspaces,
            chat,
            config,
            semaphore,
            agent_locks: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    /// Number of tasks currently executing.
    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Start the poll loop.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let executor = Arc::clone(self);
        let mut shutdown_rx = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(executor.config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        executor.tick(shutdown.clone()).await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            log::info!("task executor stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// One poll iteration: dispatch as many pending tasks as the cap
    /// allows. Public so tests can drive the executor deterministically.
    pub async fn tick(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        let pending = self.workspaces.pending_tasks().await;
        for task in pending {
            {
                let in_flight = self.in_flight.lock().await;
                if in_flight.contains(&task.id) {
                    continue;
                }
            }
            let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => permit,
                // At the cap; later tasks wait for a future tick.
                Err(_) => break,
            };
            self.in_flight.lock().await.insert(task.id);

            let executor = Arc::clone(self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                executor.execute_task(task, shutdown).await;
                drop(permit);
            });
        }
    }

    async fn agent_lock(&self, agent: &str) -> Arc<Mutex<()>> {
        let mut locks = self.agent_locks.lock().await;
        locks
            .entry(agent.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Build the synthetic user utterance for a task: the description
    /// plus a machine-readable context block.
    fn task_utterance(task: &Task) -> String {
        if task.context.is_empty() {
            return task.description.clone();
        }
        let context = serde_json::to_string(&Value::Object(task.context.clone()))
            .unwrap_or_else(|_| "{}".to_string());
        format!("{}\n\n[task-context] {}", task.description, context)
    }

    async fn execute_task(self: Arc<Self>, task: Task, mut shutdown: watch::Receiver<bool>) {
        let workspace_id = task.workspace_id;
        let task_id = task.id;

        // Per-agent exclusion: two tasks addressed to the same agent
        // never run simultaneously.
        let lock = self.agent_lock(&task.to).await;
        let _agent_guard = lock.lock().await;

        let started = match self.workspaces.start_task(workspace_id, task_id).await {
            Ok(task) => task,
            Err(e) => {
                // Raced with a cancel or a concurrent dispatch.
                log::debug!("task {} not started: {}", task_id, e);
                self.in_flight.lock().await.remove(&task_id);
                return;
            }
        };

        let utterance = Self::task_utterance(&started);
        let timeout = Duration::from_secs(started.timeout_secs);

        let turn = self.chat.run_turn(&started.to, &utterance);
        tokio::pin!(turn);

        let already_stopping = *shutdown.borrow();
        let outcome = if already_stopping {
            match tokio::time::timeout(self.config.cancel_grace, &mut turn).await {
                Ok(reply) => Some(Ok(reply)),
                Err(_) => None,
            }
        } else {
            tokio::select! {
                result = tokio::time::timeout(timeout, &mut turn) => Some(result),
                _ = shutdown.changed() => {
                    // Give the in-flight turn a grace period, then cancel.
                    match tokio::time::timeout(self.config.cancel_grace, &mut turn).await {
                        Ok(reply) => Some(Ok(reply)),
                        Err(_) => None,
                    }
                }
            }
        };

        let result = match outcome {
            Some(Ok(reply)) => {
                self.workspaces
                    .complete_task(workspace_id, task_id, reply.content)
                    .await
            }
            Some(Err(_elapsed)) => {
                self.workspaces
                    .fail_task(
                        workspace_id,
                        task_id,
                        format!("timed out after {}s", started.timeout_secs),
                    )
                    .await
            }
            None => {
                self.workspaces
                    .cancel_task(workspace_id, task_id, "shutdown".to_string())
                    .await
            }
        };
        if let Err(e) = result {
            log::error!("task {} status update failed: {}", task_id, e);
        }

        self.in_flight.lock().await.remove(&task_id);
    }
}
