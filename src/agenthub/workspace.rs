//! Workspace entities: the persisted object graph for multi-agent
//! collaboration.
//!
//! A workspace owns its tasks, workflows, messages, and scheduled
//! tasks as contiguous arrays; entities refer to each other by stable
//! ids rather than pointers, which keeps JSON persistence trivial and
//! precludes reference cycles. Status transitions are validated here;
//! durability and locking live in
//! [`workspace_store`](crate::agenthub::workspace_store).

use std::error::Error;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::agenthub::schedule::ScheduledTask;

/// Current on-disk schema version. Unknown fields from newer versions
/// are preserved on rewrite via the `extra` flatten below.
pub const WORKSPACE_SCHEMA_VERSION: u32 = 1;

/// Default task timeout when a task or template does not set one.
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    #[default]
    Active,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// The allowed transition graph:
    /// pending → in_progress → {completed, failed, cancelled}, and
    /// pending → cancelled for tasks torn down before they start.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Pending, TaskStatus::InProgress) => true,
            (TaskStatus::Pending, TaskStatus::Cancelled) => true,
            (TaskStatus::InProgress, TaskStatus::Completed) => true,
            (TaskStatus::InProgress, TaskStatus::Failed) => true,
            (TaskStatus::InProgress, TaskStatus::Cancelled) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Waiting,
    Ready,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Task,
    Aggregate,
    Condition,
    Parallel,
    Sequential,
}

/// How an `aggregate` step combines its dependencies' results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Aggregator {
    /// Join results in dependency order, blank-line separated.
    #[default]
    Concat,
    /// Label each result with its producing step id, then join.
    MapReduce,
    /// The first dependency result that is non-empty.
    FirstNonEmpty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskRequest,
    Result,
    Question,
    Status,
    Notification,
}

/// A message between agents inside a workspace. Empty `to` = broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub from: String,
    #[serde(default)]
    pub to: String,
    pub message_type: MessageType,
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

/// A unit of work addressed from one agent to another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub from: String,
    pub to: String,
    pub description: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default = "default_task_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Reason recorded on cancellation (shutdown, agent removal, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

fn default_task_timeout() -> u64 {
    DEFAULT_TASK_TIMEOUT_SECS
}

impl Task {
    pub fn new(
        workspace_id: Uuid,
        from: impl Into<String>,
        to: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            from: from.into(),
            to: to.into(),
            description: description.into(),
            priority: 0,
            context: Map::new(),
            timeout_secs: DEFAULT_TASK_TIMEOUT_SECS,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            cancel_reason: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    fn transition(&mut self, next: TaskStatus) -> Result<(), WorkspaceError> {
        if !self.status.can_transition_to(next) {
            return Err(WorkspaceError::InvalidTransition(format!(
                "task {}: {:?} -> {:?}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), WorkspaceError> {
        self.transition(TaskStatus::InProgress)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn complete(&mut self, result: impl Into<String>) -> Result<(), WorkspaceError> {
        self.transition(TaskStatus::Completed)?;
        self.result = Some(result.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), WorkspaceError> {
        self.transition(TaskStatus::Failed)?;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<(), WorkspaceError> {
        self.transition(TaskStatus::Cancelled)?;
        self.cancel_reason = Some(reason.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }
}

/// One step inside a workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Unique within the owning workflow.
    pub id: String,
    pub step_type: StepType,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Guard expression for `condition` steps (evalexpr syntax).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_agent: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub aggregator: Aggregator,
    /// Child step ids for `parallel`/`sequential` composites.
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Task materialized for this step, once dispatched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, step_type: StepType) -> Self {
        Self {
            id: id.into(),
            step_type,
            dependencies: Vec::new(),
            condition: None,
            assigned_agent: None,
            description: String::new(),
            context: Map::new(),
            aggregator: Aggregator::default(),
            children: Vec::new(),
            status: StepStatus::Pending,
            result: None,
            task_id: None,
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.assigned_agent = Some(agent.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_aggregator(mut self, aggregator: Aggregator) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn with_children(mut self, children: Vec<String>) -> Self {
        self.children = children;
        self
    }
}

/// A DAG of steps executed inside a workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub status: WorkflowStatus,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(workspace_id: Uuid, name: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            name: name.into(),
            status: WorkflowStatus::Pending,
            steps,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut WorkflowStep> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// Ids of composite parents, keyed by child id.
    pub fn parent_of(&self, child_id: &str) -> Option<&WorkflowStep> {
        self.steps
            .iter()
            .find(|s| s.children.iter().any(|c| c == child_id))
    }

    /// Validate the step graph: unique ids, known dependency and child
    /// references, no child in two composites, and an acyclic
    /// dependency relation.
    pub fn validate(&self) -> Result<(), WorkspaceError> {
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(WorkspaceError::InvalidWorkflow(format!(
                    "duplicate step id {:?}",
                    step.id
                )));
            }
        }
        let known: std::collections::HashSet<&str> =
            self.steps.iter().map(|s| s.id.as_str()).collect();
        let mut child_owner: std::collections::HashMap<&str, &str> =
            std::collections::HashMap::new();
        for step in &self.steps {
            for dep in &step.dependencies {
                if !known.contains(dep.as_str()) {
                    return Err(WorkspaceError::InvalidWorkflow(format!(
                        "step {:?} depends on unknown step {:?}",
                        step.id, dep
                    )));
                }
            }
            for child in &step.children {
                if !known.contains(child.as_str()) {
                    return Err(WorkspaceError::InvalidWorkflow(format!(
                        "composite {:?} references unknown child {:?}",
                        step.id, child
                    )));
                }
                if let Some(previous) = child_owner.insert(child.as_str(), step.id.as_str()) {
                    return Err(WorkspaceError::InvalidWorkflow(format!(
                        "step {:?} is a child of both {:?} and {:?}",
                        child, previous, step.id
                    )));
                }
            }
        }

        // Cycle detection over the dependency relation (composite
        // membership adds an implicit child → parent dependency).
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            White,
            Grey,
            Black,
        }
        let ids: Vec<&str> = self.steps.iter().map(|s| s.id.as_str()).collect();
        let mut marks: std::collections::HashMap<&str, Mark> =
            ids.iter().map(|id| (*id, Mark::White)).collect();

        fn edges<'a>(workflow: &'a Workflow, id: &str) -> Vec<&'a str> {
            let mut out: Vec<&str> = Vec::new();
            if let Some(step) = workflow.step(id) {
                out.extend(step.dependencies.iter().map(|d| d.as_str()));
            }
            if let Some(parent) = workflow.parent_of(id) {
                out.push(parent.id.as_str());
            }
            out
        }

        fn visit<'a>(
            workflow: &'a Workflow,
            id: &'a str,
            marks: &mut std::collections::HashMap<&'a str, Mark>,
        ) -> Result<(), WorkspaceError> {
            match marks.get(id) {
                Some(Mark::Black) => return Ok(()),
                Some(Mark::Grey) => {
                    return Err(WorkspaceError::InvalidWorkflow(format!(
                        "dependency cycle through step {:?}",
                        id
                    )))
                }
                _ => {}
            }
            marks.insert(id, Mark::Grey);
            for next in edges(workflow, id) {
                visit(workflow, next, marks)?;
            }
            marks.insert(id, Mark::Black);
            Ok(())
        }

        for id in &ids {
            visit(self, *id, &mut marks)?;
        }
        Ok(())
    }

    /// All steps terminal?
    pub fn all_steps_terminal(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_terminal())
    }

    pub fn any_step_failed(&self) -> bool {
        self.steps.iter().any(|s| s.status == StepStatus::Failed)
    }
}

/// Errors raised by workspace model operations and the store.
#[derive(Debug, Clone)]
pub enum WorkspaceError {
    NotFound(Uuid),
    UnknownAgent(String),
    UnknownTask(Uuid),
    UnknownWorkflow(Uuid),
    UnknownScheduledTask(Uuid),
    InvalidTransition(String),
    InvalidWorkflow(String),
    Persistence(String),
}

impl fmt::Display for WorkspaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkspaceError::NotFound(id) => write!(f, "workspace not found: {}", id),
            WorkspaceError::UnknownAgent(name) => {
                write!(f, "agent {:?} is not a participant", name)
            }
            WorkspaceError::UnknownTask(id) => write!(f, "task not found: {}", id),
            WorkspaceError::UnknownWorkflow(id) => write!(f, "workflow not found: {}", id),
            WorkspaceError::UnknownScheduledTask(id) => {
                write!(f, "scheduled task not found: {}", id)
            }
            WorkspaceError::InvalidTransition(msg) => {
                write!(f, "invalid status transition: {}", msg)
            }
            WorkspaceError::InvalidWorkflow(msg) => write!(f, "invalid workflow: {}", msg),
            WorkspaceError::Persistence(msg) => write!(f, "workspace persistence failed: {}", msg),
        }
    }
}

impl Error for WorkspaceError {}

/// A persistent collaboration context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    #[serde(default = "default_schema_version")]
    pub version: u32,
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub participating_agents: Vec<String>,
    #[serde(default)]
    pub shared_data: Map<String, Value>,
    #[serde(default)]
    pub messages: Vec<AgentMessage>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub workflows: Vec<Workflow>,
    #[serde(default)]
    pub scheduled_tasks: Vec<ScheduledTask>,
    #[serde(default)]
    pub status: WorkspaceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Fields from newer schema versions ride through rewrites intact.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_schema_version() -> u32 {
    WORKSPACE_SCHEMA_VERSION
}

impl Workspace {
    pub fn new(name: impl Into<String>, participating_agents: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            version: WORKSPACE_SCHEMA_VERSION,
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            participating_agents,
            shared_data: Map::new(),
            messages: Vec::new(),
            tasks: Vec::new(),
            workflows: Vec::new(),
            scheduled_tasks: Vec::new(),
            status: WorkspaceStatus::Active,
            created_at: now,
            updated_at: now,
            extra: Map::new(),
        }
    }

    pub fn is_participant(&self, agent: &str) -> bool {
        self.participating_agents.iter().any(|a| a == agent)
    }

    /// Check that an addressing field is empty (broadcast) or names a
    /// participant.
    fn check_address(&self, agent: &str) -> Result<(), WorkspaceError> {
        if agent.is_empty() || self.is_participant(agent) {
            Ok(())
        } else {
            Err(WorkspaceError::UnknownAgent(agent.to_string()))
        }
    }

    pub fn add_message(&mut self, message: AgentMessage) -> Result<(), WorkspaceError> {
        self.check_address(&message.from)?;
        self.check_address(&message.to)?;
        self.messages.push(message);
        Ok(())
    }

    pub fn add_task(&mut self, task: Task) -> Result<Uuid, WorkspaceError> {
        if !self.is_participant(&task.to) {
            return Err(WorkspaceError::UnknownAgent(task.to.clone()));
        }
        let id = task.id;
        self.tasks.push(task);
        Ok(id)
    }

    pub fn add_workflow(&mut self, workflow: Workflow) -> Result<Uuid, WorkspaceError> {
        workflow.validate()?;
        for step in &workflow.steps {
            if let Some(agent) = &step.assigned_agent {
                if !self.is_participant(agent) {
                    return Err(WorkspaceError::UnknownAgent(agent.clone()));
                }
            }
        }
        let id = workflow.id;
        self.workflows.push(workflow);
        Ok(id)
    }

    pub fn task(&self, id: Uuid) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: Uuid) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    pub fn workflow(&self, id: Uuid) -> Option<&Workflow> {
        self.workflows.iter().find(|w| w.id == id)
    }

    pub fn workflow_mut(&mut self, id: Uuid) -> Option<&mut Workflow> {
        self.workflows.iter_mut().find(|w| w.id == id)
    }

    pub fn scheduled_task(&self, id: Uuid) -> Option<&ScheduledTask> {
        self.scheduled_tasks.iter().find(|s| s.id == id)
    }

    pub fn scheduled_task_mut(&mut self, id: Uuid) -> Option<&mut ScheduledTask> {
        self.scheduled_tasks.iter_mut().find(|s| s.id == id)
    }

    /// Pending tasks sorted by `(priority desc, created_at asc)`.
    pub fn pending_tasks(&self) -> Vec<&Task> {
        let mut pending: Vec<&Task> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        pending
    }

    /// Tasks addressed to `agent`, optionally restricted to open ones.
    pub fn tasks_for_agent(&self, agent: &str, open_only: bool) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|t| t.to == agent)
            .filter(|t| {
                !open_only
                    || matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress)
            })
            .collect()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> Workspace {
        Workspace::new(
            "research",
            vec!["researcher".to_string(), "analyzer".to_string()],
        )
    }

    #[test]
    fn task_status_graph() {
        let mut task = Task::new(Uuid::new_v4(), "a", "b", "do");
        assert!(task.complete("early").is_err());
        task.start().unwrap();
        assert!(task.start().is_err());
        task.complete("done").unwrap();
        assert!(task.fail("late").is_err());
        assert!(task.completed_at.is_some());
        assert!(task.created_at <= task.started_at.unwrap());
        assert!(task.started_at.unwrap() <= task.completed_at.unwrap());
    }

    #[test]
    fn pending_task_can_be_cancelled() {
        let mut task = Task::new(Uuid::new_v4(), "a", "b", "do");
        task.cancel("shutdown").unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.cancel_reason.as_deref(), Some("shutdown"));
    }

    #[test]
    fn task_addressing_is_validated() {
        let mut ws = workspace();
        let ok = Task::new(ws.id, "researcher", "analyzer", "analyze");
        ws.add_task(ok).unwrap();
        let bad = Task::new(ws.id, "researcher", "stranger", "analyze");
        assert!(matches!(
            ws.add_task(bad),
            Err(WorkspaceError::UnknownAgent(_))
        ));
    }

    #[test]
    fn broadcast_messages_are_allowed() {
        let mut ws = workspace();
        ws.add_message(AgentMessage {
            from: "researcher".to_string(),
            to: String::new(),
            message_type: MessageType::Status,
            content: "done".to_string(),
            metadata: Map::new(),
            timestamp: Utc::now(),
        })
        .unwrap();
        let bad = AgentMessage {
            from: "ghost".to_string(),
            to: String::new(),
            message_type: MessageType::Status,
            content: "boo".to_string(),
            metadata: Map::new(),
            timestamp: Utc::now(),
        };
        assert!(ws.add_message(bad).is_err());
    }

    #[test]
    fn workflow_cycles_are_rejected() {
        let ws_id = Uuid::new_v4();
        let a = WorkflowStep::new("a", StepType::Task)
            .with_dependencies(vec!["b".to_string()]);
        let b = WorkflowStep::new("b", StepType::Task)
            .with_dependencies(vec!["a".to_string()]);
        let workflow = Workflow::new(ws_id, "cyclic", vec![a, b]);
        assert!(matches!(
            workflow.validate(),
            Err(WorkspaceError::InvalidWorkflow(_))
        ));
    }

    #[test]
    fn workflow_unknown_dependency_is_rejected() {
        let workflow = Workflow::new(
            Uuid::new_v4(),
            "broken",
            vec![WorkflowStep::new("a", StepType::Task)
                .with_dependencies(vec!["missing".to_string()])],
        );
        assert!(workflow.validate().is_err());
    }

    #[test]
    fn child_cannot_belong_to_two_composites() {
        let steps = vec![
            WorkflowStep::new("p1", StepType::Parallel).with_children(vec!["c".to_string()]),
            WorkflowStep::new("p2", StepType::Sequential).with_children(vec!["c".to_string()]),
            WorkflowStep::new("c", StepType::Task),
        ];
        let workflow = Workflow::new(Uuid::new_v4(), "shared-child", steps);
        assert!(workflow.validate().is_err());
    }

    #[test]
    fn pending_tasks_order_by_priority_then_age() {
        let mut ws = workspace();
        let low = Task::new(ws.id, "researcher", "analyzer", "low").with_priority(1);
        let high = Task::new(ws.id, "researcher", "analyzer", "high").with_priority(9);
        let low_id = low.id;
        let high_id = high.id;
        ws.add_task(low).unwrap();
        ws.add_task(high).unwrap();
        let pending = ws.pending_tasks();
        assert_eq!(pending[0].id, high_id);
        assert_eq!(pending[1].id, low_id);
    }

    #[test]
    fn unknown_fields_survive_a_round_trip() {
        let ws = workspace();
        let mut value = serde_json::to_value(&ws).unwrap();
        value["future_field"] = serde_json::json!({"k": 1});
        let parsed: Workspace = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.extra["future_field"]["k"], 1);
        let rewritten = serde_json::to_value(&parsed).unwrap();
        assert_eq!(rewritten["future_field"]["k"], 1);
    }
}
