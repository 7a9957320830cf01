//! Durable collection of workspaces.
//!
//! One JSON file per workspace (uuid-named) under the workspaces
//! directory. Every mutation goes through [`WorkspaceStore::mutate`]:
//! take the per-workspace lock, apply the closure, persist atomically,
//! and only then return — a failed persist rolls the in-memory state
//! back, so no partial mutation is ever observable. Malformed files
//! found at startup are quarantined (renamed), never deleted.
//!
//! Lock discipline: the outer map lock is only held to fetch a
//! workspace handle; operations hold at most one workspace lock at a
//! time.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::agenthub::event_bus::{event_type, EventBus};
use crate::agenthub::persist::{read_json, write_json_atomic};
use crate::agenthub::schedule::ScheduledTask;
use crate::agenthub::workspace::{
    AgentMessage, StepStatus, Task, TaskStatus, Workflow, WorkflowStep, Workspace,
    WorkspaceError, WorkspaceStatus,
};

type WorkspaceHandle = Arc<Mutex<Workspace>>;

/// The store: per-workspace locks under one collection lock.
pub struct WorkspaceStore {
    dir: PathBuf,
    bus: Arc<EventBus>,
    workspaces: RwLock<HashMap<Uuid, WorkspaceHandle>>,
}

impl WorkspaceStore {
    /// Rehydrate every workspace file under `dir`. Files that fail to
    /// parse are renamed `<name>.quarantine` and skipped.
    pub fn load(dir: impl Into<PathBuf>, bus: Arc<EventBus>) -> Result<Self, WorkspaceError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| WorkspaceError::Persistence(e.to_string()))?;

        let mut workspaces = HashMap::new();
        let entries =
            fs::read_dir(&dir).map_err(|e| WorkspaceError::Persistence(e.to_string()))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<Workspace>(&path) {
                Ok(workspace) => {
                    workspaces.insert(workspace.id, Arc::new(Mutex::new(workspace)));
                }
                Err(e) => {
                    let quarantine = path.with_extension("json.quarantine");
                    log::error!(
                        "quarantining malformed workspace file {}: {}",
                        path.display(),
                        e
                    );
                    if let Err(rename_err) = fs::rename(&path, &quarantine) {
                        log::error!("quarantine rename failed: {}", rename_err);
                    }
                }
            }
        }

        Ok(Self {
            dir,
            bus,
            workspaces: RwLock::new(workspaces),
        })
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    async fn handle(&self, id: Uuid) -> Result<WorkspaceHandle, WorkspaceError> {
        self.workspaces
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(WorkspaceError::NotFound(id))
    }

    /// Run a read-only closure against a workspace.
    pub async fn with_workspace<R>(
        &self,
        id: Uuid,
        f: impl FnOnce(&Workspace) -> R,
    ) -> Result<R, WorkspaceError> {
        let handle = self.handle(id).await?;
        let workspace = handle.lock().await;
        Ok(f(&workspace))
    }

    /// Apply a mutation durably: lock, mutate, persist, publish nothing.
    ///
    /// On persist failure the in-memory workspace is rolled back and the
    /// error surfaced, so the mutation either fully happened or did not.
    pub async fn mutate<R>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut Workspace) -> Result<R, WorkspaceError>,
    ) -> Result<R, WorkspaceError> {
        let handle = self.handle(id).await?;
        let mut workspace = handle.lock().await;
        let snapshot = workspace.clone();
        let result = match f(&mut workspace) {
            Ok(result) => result,
            Err(e) => {
                *workspace = snapshot;
                return Err(e);
            }
        };
        workspace.touch();
        if let Err(e) = write_json_atomic(&self.path_for(id), &*workspace) {
            *workspace = snapshot;
            return Err(WorkspaceError::Persistence(e.to_string()));
        }
        Ok(result)
    }

    // ---- creation and listing ----

    pub async fn create_workspace(
        &self,
        name: impl Into<String>,
        participating_agents: Vec<String>,
    ) -> Result<Uuid, WorkspaceError> {
        let workspace = Workspace::new(name, participating_agents);
        let id = workspace.id;
        write_json_atomic(&self.path_for(id), &workspace)
            .map_err(|e| WorkspaceError::Persistence(e.to_string()))?;
        let name = workspace.name.clone();
        self.workspaces
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(workspace)));
        self.bus.publish(
            event_type::WORKSPACE_CREATED,
            Some(id),
            json!({"workspace_id": id, "name": name}),
        );
        Ok(id)
    }

    pub async fn ids(&self) -> Vec<Uuid> {
        self.workspaces.read().await.keys().copied().collect()
    }

    pub async fn snapshot(&self, id: Uuid) -> Result<Workspace, WorkspaceError> {
        self.with_workspace(id, |w| w.clone()).await
    }

    /// Snapshots of every workspace with the given status.
    pub async fn list_by_status(&self, status: WorkspaceStatus) -> Vec<Workspace> {
        let handles: Vec<WorkspaceHandle> =
            self.workspaces.read().await.values().cloned().collect();
        let mut out = Vec::new();
        for handle in handles {
            let workspace = handle.lock().await;
            if workspace.status == status {
                out.push(workspace.clone());
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    /// Workspaces `agent` participates in, active ones first.
    pub async fn workspaces_for_agent(&self, agent: &str) -> Vec<Workspace> {
        let handles: Vec<WorkspaceHandle> =
            self.workspaces.read().await.values().cloned().collect();
        let mut out = Vec::new();
        for handle in handles {
            let workspace = handle.lock().await;
            if workspace.is_participant(agent) {
                out.push(workspace.clone());
            }
        }
        out.sort_by(|a, b| {
            let rank = |w: &Workspace| (w.status != WorkspaceStatus::Active, w.created_at);
            rank(a).cmp(&rank(b))
        });
        out
    }

    pub async fn set_status(
        &self,
        id: Uuid,
        status: WorkspaceStatus,
    ) -> Result<(), WorkspaceError> {
        self.mutate(id, |w| {
            w.status = status;
            Ok(())
        })
        .await?;
        self.bus.publish(
            event_type::WORKSPACE_UPDATED,
            Some(id),
            json!({"workspace_id": id, "status": status}),
        );
        Ok(())
    }

    // ---- participants ----

    pub async fn add_agent(&self, id: Uuid, agent: &str) -> Result<(), WorkspaceError> {
        self.mutate(id, |w| {
            if !w.is_participant(agent) {
                w.participating_agents.push(agent.to_string());
            }
            Ok(())
        })
        .await?;
        self.bus.publish(
            event_type::WORKSPACE_UPDATED,
            Some(id),
            json!({"workspace_id": id, "agent_added": agent}),
        );
        Ok(())
    }

    pub async fn remove_agent(&self, id: Uuid, agent: &str) -> Result<(), WorkspaceError> {
        self.mutate(id, |w| {
            w.participating_agents.retain(|a| a != agent);
            Ok(())
        })
        .await?;
        self.bus.publish(
            event_type::WORKSPACE_UPDATED,
            Some(id),
            json!({"workspace_id": id, "agent_removed": agent}),
        );
        Ok(())
    }

    // ---- messages ----

    pub async fn add_message(
        &self,
        id: Uuid,
        message: AgentMessage,
    ) -> Result<(), WorkspaceError> {
        let payload = json!({
            "workspace_id": id,
            "from": message.from,
            "to": message.to,
            "content": message.content,
        });
        self.mutate(id, move |w| w.add_message(message)).await?;
        self.bus
            .publish(event_type::AGENT_MESSAGE, Some(id), payload);
        Ok(())
    }

    // ---- tasks ----

    pub async fn create_task(&self, task: Task) -> Result<Uuid, WorkspaceError> {
        let workspace_id = task.workspace_id;
        let payload = json!({
            "workspace_id": workspace_id,
            "task_id": task.id,
            "from": task.from,
            "to": task.to,
            "description": task.description,
            "priority": task.priority,
        });
        let task_id = self.mutate(workspace_id, move |w| w.add_task(task)).await?;
        self.bus
            .publish(event_type::TASK_CREATED, Some(workspace_id), payload);
        Ok(task_id)
    }

    fn task_payload(task: &Task) -> serde_json::Value {
        json!({
            "workspace_id": task.workspace_id,
            "task_id": task.id,
            "from": task.from,
            "to": task.to,
            "status": task.status,
        })
    }

    pub async fn start_task(&self, workspace_id: Uuid, task_id: Uuid) -> Result<Task, WorkspaceError> {
        let task = self
            .mutate(workspace_id, |w| {
                let task = w
                    .task_mut(task_id)
                    .ok_or(WorkspaceError::UnknownTask(task_id))?;
                task.start()?;
                Ok(task.clone())
            })
            .await?;
        self.bus.publish(
            event_type::TASK_STARTED,
            Some(workspace_id),
            Self::task_payload(&task),
        );
        Ok(task)
    }

    pub async fn complete_task(
        &self,
        workspace_id: Uuid,
        task_id: Uuid,
        result: String,
    ) -> Result<Task, WorkspaceError> {
        let task = self
            .mutate(workspace_id, |w| {
                let task = w
                    .task_mut(task_id)
                    .ok_or(WorkspaceError::UnknownTask(task_id))?;
                task.complete(result)?;
                Ok(task.clone())
            })
            .await?;
        self.bus.publish(
            event_type::TASK_COMPLETED,
            Some(workspace_id),
            Self::task_payload(&task),
        );
        Ok(task)
    }

    pub async fn fail_task(
        &self,
        workspace_id: Uuid,
        task_id: Uuid,
        error: String,
    ) -> Result<Task, WorkspaceError> {
        let task = self
            .mutate(workspace_id, |w| {
                let task = w
                    .task_mut(task_id)
                    .ok_or(WorkspaceError::UnknownTask(task_id))?;
                task.fail(error)?;
                Ok(task.clone())
            })
            .await?;
        self.bus.publish(
            event_type::TASK_FAILED,
            Some(workspace_id),
            Self::task_payload(&task),
        );
        Ok(task)
    }

    pub async fn cancel_task(
        &self,
        workspace_id: Uuid,
        task_id: Uuid,
        reason: String,
    ) -> Result<Task, WorkspaceError> {
        let task = self
            .mutate(workspace_id, |w| {
                let task = w
                    .task_mut(task_id)
                    .ok_or(WorkspaceError::UnknownTask(task_id))?;
                task.cancel(reason)?;
                Ok(task.clone())
            })
            .await?;
        // Cancellation is not an error; subscribers see a plain update.
        self.bus.publish(
            event_type::WORKSPACE_UPDATED,
            Some(workspace_id),
            Self::task_payload(&task),
        );
        Ok(task)
    }

    /// Pending tasks across all active workspaces, sorted by
    /// `(priority desc, created_at asc)`.
    pub async fn pending_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = Vec::new();
        for workspace in self.list_by_status(WorkspaceStatus::Active).await {
            tasks.extend(workspace.pending_tasks().into_iter().cloned());
        }
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        tasks
    }

    /// Tasks addressed to `agent` across every workspace it belongs to.
    pub async fn tasks_for_agent(&self, agent: &str, open_only: bool) -> Vec<Task> {
        let mut tasks = Vec::new();
        for workspace in self.workspaces_for_agent(agent).await {
            tasks.extend(
                workspace
                    .tasks_for_agent(agent, open_only)
                    .into_iter()
                    .cloned(),
            );
        }
        tasks
    }

    /// Find a task addressed to `agent` by full id or id prefix.
    pub async fn task_for_agent_by_prefix(&self, agent: &str, prefix: &str) -> Option<Task> {
        self.tasks_for_agent(agent, false)
            .await
            .into_iter()
            .find(|t| t.id.to_string().starts_with(prefix))
    }

    // ---- workflows ----

    pub async fn create_workflow(
        &self,
        workspace_id: Uuid,
        name: impl Into<String>,
        steps: Vec<WorkflowStep>,
    ) -> Result<Uuid, WorkspaceError> {
        let workflow = Workflow::new(workspace_id, name, steps);
        let workflow_id = workflow.id;
        self.mutate(workspace_id, move |w| w.add_workflow(workflow))
            .await?;
        self.bus.publish(
            event_type::WORKSPACE_UPDATED,
            Some(workspace_id),
            json!({"workspace_id": workspace_id, "workflow_id": workflow_id}),
        );
        Ok(workflow_id)
    }

    /// `(workflow id, step id)` pairs currently in the ready state.
    pub async fn ready_workflow_steps(
        &self,
        id: Uuid,
    ) -> Result<Vec<(Uuid, String)>, WorkspaceError> {
        self.with_workspace(id, |w| {
            w.workflows
                .iter()
                .flat_map(|wf| {
                    wf.steps
                        .iter()
                        .filter(|s| s.status == StepStatus::Ready)
                        .map(move |s| (wf.id, s.id.clone()))
                })
                .collect()
        })
        .await
    }

    // ---- scheduled tasks ----

    pub async fn create_scheduled_task(
        &self,
        template: ScheduledTask,
    ) -> Result<Uuid, WorkspaceError> {
        let workspace_id = template.workspace_id;
        let template_id = template.id;
        self.mutate(workspace_id, move |w| {
            if !w.is_participant(&template.to) {
                return Err(WorkspaceError::UnknownAgent(template.to.clone()));
            }
            w.scheduled_tasks.push(template);
            Ok(())
        })
        .await?;
        self.bus.publish(
            event_type::WORKSPACE_UPDATED,
            Some(workspace_id),
            json!({"workspace_id": workspace_id, "scheduled_task_id": template_id}),
        );
        Ok(template_id)
    }

    pub async fn set_scheduled_task_enabled(
        &self,
        workspace_id: Uuid,
        template_id: Uuid,
        enabled: bool,
    ) -> Result<(), WorkspaceError> {
        self.mutate(workspace_id, |w| {
            let template = w
                .scheduled_task_mut(template_id)
                .ok_or(WorkspaceError::UnknownScheduledTask(template_id))?;
            template.enabled = enabled;
            Ok(())
        })
        .await
    }

    /// Recent event history for a workspace (ring-buffer replay).
    pub fn event_history(&self, workspace_id: Uuid, limit: usize) -> Vec<crate::agenthub::event_bus::Event> {
        let filter = crate::agenthub::event_bus::EventFilter {
            workspace_id: Some(workspace_id),
            ..Default::default()
        };
        self.bus.recent(&filter, limit)
    }

    /// Directory the store persists into (used by tests).
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, WorkspaceStore) {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::default());
        let store = WorkspaceStore::load(dir.path().join("workspaces"), bus).unwrap();
        (dir, store)
    }

    fn agents() -> Vec<String> {
        vec!["researcher".to_string(), "analyzer".to_string()]
    }

    #[tokio::test]
    async fn persist_then_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workspaces");
        let bus = Arc::new(EventBus::default());

        let id = {
            let store = WorkspaceStore::load(&path, bus.clone()).unwrap();
            let id = store.create_workspace("research", agents()).await.unwrap();
            let task = Task::new(id, "researcher", "analyzer", "analyze").with_priority(3);
            store.create_task(task).await.unwrap();
            id
        };

        let store = WorkspaceStore::load(&path, bus).unwrap();
        let workspace = store.snapshot(id).await.unwrap();
        assert_eq!(workspace.name, "research");
        assert_eq!(workspace.tasks.len(), 1);
        assert_eq!(workspace.tasks[0].priority, 3);
    }

    #[tokio::test]
    async fn malformed_files_are_quarantined_not_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workspaces");
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("broken.json"), b"{ not json").unwrap();

        let store = WorkspaceStore::load(&path, Arc::new(EventBus::default())).unwrap();
        assert!(store.ids().await.is_empty());
        assert!(path.join("broken.json.quarantine").exists());
        assert!(!path.join("broken.json").exists());
    }

    #[tokio::test]
    async fn task_lifecycle_publishes_events_in_order() {
        let (_dir, store) = store().await;
        let bus = store.bus().clone();
        let mut sub = bus.subscribe(crate::agenthub::event_bus::EventFilter::for_type("task."));

        let id = store.create_workspace("ws", agents()).await.unwrap();
        let task = Task::new(id, "researcher", "analyzer", "go");
        let task_id = store.create_task(task).await.unwrap();
        store.start_task(id, task_id).await.unwrap();
        store
            .complete_task(id, task_id, "done".to_string())
            .await
            .unwrap();

        let types: Vec<String> = vec![
            sub.receiver.recv().await.unwrap().event_type,
            sub.receiver.recv().await.unwrap().event_type,
            sub.receiver.recv().await.unwrap().event_type,
        ];
        assert_eq!(
            types,
            vec!["task.created", "task.started", "task.completed"]
        );
    }

    #[tokio::test]
    async fn invalid_transition_rolls_back() {
        let (_dir, store) = store().await;
        let id = store.create_workspace("ws", agents()).await.unwrap();
        let task = Task::new(id, "researcher", "analyzer", "go");
        let task_id = store.create_task(task).await.unwrap();
        // Completing a pending task is invalid.
        let err = store
            .complete_task(id, task_id, "oops".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::InvalidTransition(_)));
        let snapshot = store.snapshot(id).await.unwrap();
        assert_eq!(snapshot.task(task_id).unwrap().status, TaskStatus::Pending);
        assert!(snapshot.task(task_id).unwrap().result.is_none());
    }

    #[tokio::test]
    async fn task_to_unknown_agent_is_rejected() {
        let (_dir, store) = store().await;
        let id = store.create_workspace("ws", agents()).await.unwrap();
        let task = Task::new(id, "researcher", "stranger", "go");
        assert!(matches!(
            store.create_task(task).await,
            Err(WorkspaceError::UnknownAgent(_))
        ));
    }

    #[tokio::test]
    async fn pending_tasks_span_workspaces_sorted() {
        let (_dir, store) = store().await;
        let a = store.create_workspace("a", agents()).await.unwrap();
        let b = store.create_workspace("b", agents()).await.unwrap();
        store
            .create_task(Task::new(a, "researcher", "analyzer", "low").with_priority(1))
            .await
            .unwrap();
        store
            .create_task(Task::new(b, "researcher", "analyzer", "high").with_priority(5))
            .await
            .unwrap();

        let pending = store.pending_tasks().await;
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].description, "high");
    }

    #[tokio::test]
    async fn workspaces_for_agent_active_first() {
        let (_dir, store) = store().await;
        let a = store.create_workspace("first", agents()).await.unwrap();
        let b = store.create_workspace("second", agents()).await.unwrap();
        store
            .set_status(a, WorkspaceStatus::Completed)
            .await
            .unwrap();

        let list = store.workspaces_for_agent("researcher").await;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, b);
        assert_eq!(list[1].id, a);
        assert!(store.workspaces_for_agent("stranger").await.is_empty());
    }
}
