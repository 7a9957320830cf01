//! Step executor: evaluates workflow DAGs and materializes tasks for
//! ready steps.
//!
//! Each tick evaluates every non-terminal workflow to a fixpoint inside
//! one durable workspace mutation: dependency propagation, composite
//! gating, condition guards, and aggregation all settle within the
//! tick; only `task` steps span ticks, completing when their
//! materialized task reaches a terminal status.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::agenthub::event_bus::event_type;
use crate::agenthub::workspace::{
    Aggregator, StepStatus, StepType, Task, TaskStatus, Workflow, WorkflowStatus, Workspace,
    WorkspaceStatus,
};
use crate::agenthub::workspace_store::WorkspaceStore;

#[derive(Debug, Clone)]
pub struct StepExecutorConfig {
    pub poll_interval: Duration,
}

impl Default for StepExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
        }
    }
}

pub struct StepExecutor {
    workspaces: Arc<WorkspaceStore>,
    config: StepExecutorConfig,
}

type PendingEvent = (&'static str, Value);

impl StepExecutor {
    pub fn new(workspaces: Arc<WorkspaceStore>, config: StepExecutorConfig) -> Arc<Self> {
        Arc::new(Self { workspaces, config })
    }

    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(executor.config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        executor.tick().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            log::info!("step executor stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// One poll iteration over all active workspaces.
    pub async fn tick(&self) {
        for workspace_id in self.workspaces.ids().await {
            let needs_evaluation = self
                .workspaces
                .with_workspace(workspace_id, |w| {
                    w.status == WorkspaceStatus::Active
                        && w.workflows.iter().any(|wf| !wf.status.is_terminal())
                })
                .await
                .unwrap_or(false);
            if !needs_evaluation {
                continue;
            }

            match self
                .workspaces
                .mutate(workspace_id, |w| Ok(evaluate_workspace(w)))
                .await
            {
                Ok(events) => {
                    for (event_type, payload) in events {
                        self.workspaces
                            .bus()
                            .publish(event_type, Some(workspace_id), payload);
                    }
                }
                Err(e) => {
                    log::error!(
                        "workflow evaluation failed for workspace {}: {}",
                        workspace_id,
                        e
                    );
                }
            }
        }
    }
}

/// Evaluate every live workflow in the workspace; returns the events to
/// publish once the mutation has persisted.
fn evaluate_workspace(workspace: &mut Workspace) -> Vec<PendingEvent> {
    let mut events: Vec<PendingEvent> = Vec::new();

    let task_states: HashMap<Uuid, (TaskStatus, Option<String>, Option<String>)> = workspace
        .tasks
        .iter()
        .map(|t| (t.id, (t.status, t.result.clone(), t.error.clone())))
        .collect();
    let participants: Vec<String> = workspace.participating_agents.clone();
    let workspace_id = workspace.id;

    let mut new_tasks: Vec<Task> = Vec::new();
    for workflow in &mut workspace.workflows {
        if workflow.status.is_terminal() {
            continue;
        }
        if workflow.status == WorkflowStatus::Pending {
            workflow.status = WorkflowStatus::Running;
            events.push((
                event_type::WORKFLOW_STARTED,
                json!({"workflow_id": workflow.id, "name": workflow.name}),
            ));
        }

        evaluate_workflow(
            workflow,
            &task_states,
            &participants,
            workspace_id,
            &mut new_tasks,
            &mut events,
        );

        if workflow.all_steps_terminal() {
            if workflow.any_step_failed() {
                workflow.status = WorkflowStatus::Failed;
                events.push((
                    event_type::WORKFLOW_FAILED,
                    json!({"workflow_id": workflow.id, "name": workflow.name}),
                ));
            } else {
                workflow.status = WorkflowStatus::Completed;
                events.push((
                    event_type::WORKFLOW_COMPLETED,
                    json!({"workflow_id": workflow.id, "name": workflow.name}),
                ));
            }
            workflow.updated_at = chrono::Utc::now();
        }
    }

    for task in new_tasks {
        events.push((
            event_type::TASK_CREATED,
            json!({
                "workspace_id": workspace_id,
                "task_id": task.id,
                "from": task.from,
                "to": task.to,
                "description": task.description,
                "priority": task.priority,
            }),
        ));
        workspace.tasks.push(task);
    }

    events
}

struct ParentInfo {
    parent_type: StepType,
    parent_status: StepStatus,
    earlier_siblings: Vec<String>,
}

fn evaluate_workflow(
    workflow: &mut Workflow,
    task_states: &HashMap<Uuid, (TaskStatus, Option<String>, Option<String>)>,
    participants: &[String],
    workspace_id: Uuid,
    new_tasks: &mut Vec<Task>,
    events: &mut Vec<PendingEvent>,
) {
    // Fixpoint: pure steps (aggregate, condition, composites) cascade
    // within one tick; each pass works from a snapshot of statuses.
    for _pass in 0..=workflow.steps.len() {
        let status_of: HashMap<String, StepStatus> = workflow
            .steps
            .iter()
            .map(|s| (s.id.clone(), s.status))
            .collect();
        let result_of: HashMap<String, Option<String>> = workflow
            .steps
            .iter()
            .map(|s| (s.id.clone(), s.result.clone()))
            .collect();
        let parent_of: HashMap<String, ParentInfo> = workflow
            .steps
            .iter()
            .flat_map(|parent| {
                parent.children.iter().enumerate().map(|(i, child)| {
                    (
                        child.clone(),
                        ParentInfo {
                            parent_type: parent.step_type,
                            parent_status: parent.status,
                            earlier_siblings: parent.children[..i].to_vec(),
                        },
                    )
                })
            })
            .collect();

        let mut changed = false;
        let workflow_id = workflow.id;
        for step in &mut workflow.steps {
            match step.status {
                StepStatus::Pending | StepStatus::Waiting => {
                    // Composite gate first.
                    if let Some(parent) = parent_of.get(&step.id) {
                        if parent.parent_status != StepStatus::InProgress {
                            if step.status == StepStatus::Pending {
                                step.status = StepStatus::Waiting;
                                changed = true;
                            }
                            continue;
                        }
                        if parent.parent_type == StepType::Sequential
                            && parent.earlier_siblings.iter().any(|sibling| {
                                !status_of
                                    .get(sibling)
                                    .copied()
                                    .unwrap_or(StepStatus::Pending)
                                    .is_terminal()
                            })
                        {
                            if step.status == StepStatus::Pending {
                                step.status = StepStatus::Waiting;
                                changed = true;
                            }
                            continue;
                        }
                    }

                    let dep_statuses: Vec<StepStatus> = step
                        .dependencies
                        .iter()
                        .map(|dep| status_of.get(dep).copied().unwrap_or(StepStatus::Pending))
                        .collect();
                    if dep_statuses
                        .iter()
                        .any(|s| matches!(s, StepStatus::Failed | StepStatus::Skipped))
                    {
                        // Failure (and pruned branches) propagate as skips.
                        step.status = StepStatus::Skipped;
                        changed = true;
                        continue;
                    }
                    if dep_statuses.iter().all(|s| *s == StepStatus::Completed) {
                        step.status = StepStatus::Ready;
                        changed = true;
                        events.push((
                            event_type::WORKFLOW_STEP_READY,
                            json!({"workflow_id": workflow_id, "step_id": step.id}),
                        ));
                    }
                }
                StepStatus::Ready => {
                    match step.step_type {
                        StepType::Task => {
                            let agent = match step.assigned_agent.as_deref() {
                                Some(agent) if participants.iter().any(|p| p == agent) => agent,
                                Some(agent) => {
                                    step.status = StepStatus::Failed;
                                    step.result = Some(format!(
                                        "assigned agent {:?} is not a participant",
                                        agent
                                    ));
                                    changed = true;
                                    continue;
                                }
                                None => {
                                    step.status = StepStatus::Failed;
                                    step.result =
                                        Some("task step has no assigned agent".to_string());
                                    changed = true;
                                    continue;
                                }
                            };
                            let mut context = step.context.clone();
                            context.insert(
                                "workflow_id".to_string(),
                                Value::String(workflow_id.to_string()),
                            );
                            context
                                .insert("step_id".to_string(), Value::String(step.id.clone()));
                            let task =
                                Task::new(workspace_id, "workflow", agent, &step.description)
                                    .with_context(context);
                            step.task_id = Some(task.id);
                            step.status = StepStatus::InProgress;
                            new_tasks.push(task);
                        }
                        StepType::Aggregate => {
                            let inputs: Vec<(String, String)> = step
                                .dependencies
                                .iter()
                                .map(|dep| {
                                    (
                                        dep.clone(),
                                        result_of
                                            .get(dep)
                                            .and_then(|r| r.clone())
                                            .unwrap_or_default(),
                                    )
                                })
                                .collect();
                            step.result = Some(aggregate(step.aggregator, &inputs));
                            step.status = StepStatus::Completed;
                        }
                        StepType::Condition => {
                            let expression = step.condition.clone().unwrap_or_default();
                            match eval_condition(&expression, &step.context) {
                                Ok(value) => {
                                    if matches!(value, evalexpr::Value::Boolean(false)) {
                                        step.status = StepStatus::Skipped;
                                    } else {
                                        step.result = Some(value.to_string());
                                        step.status = StepStatus::Completed;
                                    }
                                }
                                Err(e) => {
                                    step.status = StepStatus::Failed;
                                    step.result =
                                        Some(format!("condition evaluation failed: {}", e));
                                }
                            }
                        }
                        StepType::Parallel | StepType::Sequential => {
                            step.status = StepStatus::InProgress;
                        }
                    }
                    changed = true;
                }
                StepStatus::InProgress => match step.step_type {
                    StepType::Task => {
                        if let Some(task_id) = step.task_id {
                            if let Some((status, result, error)) = task_states.get(&task_id) {
                                match status {
                                    TaskStatus::Completed => {
                                        step.result = result.clone();
                                        step.status = StepStatus::Completed;
                                        changed = true;
                                    }
                                    TaskStatus::Failed => {
                                        step.result = error.clone();
                                        step.status = StepStatus::Failed;
                                        changed = true;
                                    }
                                    TaskStatus::Cancelled => {
                                        step.result = Some("task cancelled".to_string());
                                        step.status = StepStatus::Failed;
                                        changed = true;
                                    }
                                    _ => {}
                                }
                            }
                        }
                    }
                    StepType::Parallel | StepType::Sequential => {
                        let child_statuses: Vec<StepStatus> = step
                            .children
                            .iter()
                            .map(|c| status_of.get(c).copied().unwrap_or(StepStatus::Pending))
                            .collect();
                        if !child_statuses.is_empty()
                            && child_statuses.iter().all(|s| s.is_terminal())
                        {
                            step.status = if child_statuses
                                .iter()
                                .any(|s| *s == StepStatus::Failed)
                            {
                                StepStatus::Failed
                            } else {
                                StepStatus::Completed
                            };
                            changed = true;
                        }
                    }
                    _ => {}
                },
                _ => {}
            }
        }

        if !changed {
            break;
        }
    }
}

fn aggregate(aggregator: Aggregator, inputs: &[(String, String)]) -> String {
    match aggregator {
        Aggregator::Concat => inputs
            .iter()
            .map(|(_, result)| result.as_str())
            .filter(|r| !r.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n"),
        Aggregator::MapReduce => inputs
            .iter()
            .map(|(id, result)| format!("{}: {}", id, result))
            .collect::<Vec<_>>()
            .join("\n"),
        Aggregator::FirstNonEmpty => inputs
            .iter()
            .map(|(_, result)| result.as_str())
            .find(|r| !r.is_empty())
            .unwrap_or_default()
            .to_string(),
    }
}

/// Evaluate a condition guard over the step's context values.
fn eval_condition(
    expression: &str,
    context: &Map<String, Value>,
) -> Result<evalexpr::Value, String> {
    use evalexpr::ContextWithMutableVariables;

    if expression.trim().is_empty() {
        return Err("empty condition expression".to_string());
    }
    let mut ctx: evalexpr::HashMapContext = evalexpr::HashMapContext::new();
    for (key, value) in context {
        let ev = match value {
            Value::Bool(b) => evalexpr::Value::Boolean(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    evalexpr::Value::Int(i)
                } else {
                    evalexpr::Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            Value::String(s) => evalexpr::Value::String(s.clone()),
            _ => continue,
        };
        let _ = ctx.set_value(key.clone(), ev);
    }
    evalexpr::eval_with_context(expression, &ctx).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agenthub::workspace::WorkflowStep;

    fn ws(agents: &[&str]) -> Workspace {
        Workspace::new("test", agents.iter().map(|s| s.to_string()).collect())
    }

    fn run(workspace: &mut Workspace) -> Vec<PendingEvent> {
        evaluate_workspace(workspace)
    }

    #[test]
    fn pending_workflow_starts_and_materializes_first_task() {
        let mut workspace = ws(&["researcher", "analyzer"]);
        let steps = vec![
            WorkflowStep::new("research", StepType::Task)
                .with_agent("researcher")
                .with_description("research the topic"),
            WorkflowStep::new("analyze", StepType::Task)
                .with_agent("analyzer")
                .with_description("analyze the findings")
                .with_dependencies(vec!["research".to_string()]),
        ];
        let workflow = Workflow::new(workspace.id, "pipeline", steps);
        workspace.add_workflow(workflow).unwrap();

        let events = run(&mut workspace);
        let types: Vec<&str> = events.iter().map(|(t, _)| *t).collect();
        assert!(types.contains(&event_type::WORKFLOW_STARTED));
        assert!(types.contains(&event_type::WORKFLOW_STEP_READY));
        assert!(types.contains(&event_type::TASK_CREATED));

        // One task for the first step only; the second still waits.
        assert_eq!(workspace.tasks.len(), 1);
        assert_eq!(workspace.tasks[0].to, "researcher");
        let wf = &workspace.workflows[0];
        assert_eq!(wf.step("research").unwrap().status, StepStatus::InProgress);
        assert_eq!(wf.step("analyze").unwrap().status, StepStatus::Pending);
    }

    #[test]
    fn task_completion_unblocks_dependents() {
        let mut workspace = ws(&["researcher", "analyzer"]);
        let steps = vec![
            WorkflowStep::new("research", StepType::Task)
                .with_agent("researcher")
                .with_description("go"),
            WorkflowStep::new("analyze", StepType::Task)
                .with_agent("analyzer")
                .with_description("next")
                .with_dependencies(vec!["research".to_string()]),
        ];
        workspace
            .add_workflow(Workflow::new(workspace.id, "pipeline", steps))
            .unwrap();

        run(&mut workspace);
        let task_id = workspace.tasks[0].id;
        {
            let task = workspace.task_mut(task_id).unwrap();
            task.start().unwrap();
            task.complete("findings").unwrap();
        }

        run(&mut workspace);
        let wf = &workspace.workflows[0];
        assert_eq!(wf.step("research").unwrap().status, StepStatus::Completed);
        assert_eq!(wf.step("research").unwrap().result.as_deref(), Some("findings"));
        assert_eq!(wf.step("analyze").unwrap().status, StepStatus::InProgress);
        assert_eq!(workspace.tasks.len(), 2);
    }

    #[test]
    fn failure_propagates_as_skips_and_fails_the_workflow() {
        let mut workspace = ws(&["researcher", "analyzer"]);
        let steps = vec![
            WorkflowStep::new("research", StepType::Task)
                .with_agent("researcher")
                .with_description("go"),
            WorkflowStep::new("analyze", StepType::Task)
                .with_agent("analyzer")
                .with_description("next")
                .with_dependencies(vec!["research".to_string()]),
        ];
        workspace
            .add_workflow(Workflow::new(workspace.id, "pipeline", steps))
            .unwrap();

        run(&mut workspace);
        let task_id = workspace.tasks[0].id;
        {
            let task = workspace.task_mut(task_id).unwrap();
            task.start().unwrap();
            task.fail("no sources").unwrap();
        }

        let events = run(&mut workspace);
        let wf = &workspace.workflows[0];
        assert_eq!(wf.step("research").unwrap().status, StepStatus::Failed);
        assert_eq!(wf.step("analyze").unwrap().status, StepStatus::Skipped);
        assert_eq!(wf.status, WorkflowStatus::Failed);
        assert!(events
            .iter()
            .any(|(t, _)| *t == event_type::WORKFLOW_FAILED));
    }

    #[test]
    fn aggregate_combines_dependency_results() {
        let mut workspace = ws(&["researcher"]);
        let mut a = WorkflowStep::new("a", StepType::Condition).with_condition("true");
        a.status = StepStatus::Completed;
        a.result = Some("alpha".to_string());
        let mut b = WorkflowStep::new("b", StepType::Condition).with_condition("true");
        b.status = StepStatus::Completed;
        b.result = Some("beta".to_string());
        let agg = WorkflowStep::new("agg", StepType::Aggregate)
            .with_dependencies(vec!["a".to_string(), "b".to_string()])
            .with_aggregator(Aggregator::MapReduce);
        workspace
            .add_workflow(Workflow::new(workspace.id, "agg", vec![a, b, agg]))
            .unwrap();

        run(&mut workspace);
        let wf = &workspace.workflows[0];
        assert_eq!(wf.step("agg").unwrap().status, StepStatus::Completed);
        assert_eq!(
            wf.step("agg").unwrap().result.as_deref(),
            Some("a: alpha\nb: beta")
        );
        assert_eq!(wf.status, WorkflowStatus::Completed);
    }

    #[test]
    fn false_condition_prunes_its_branch() {
        let mut workspace = ws(&["researcher"]);
        let mut context = Map::new();
        context.insert("score".to_string(), serde_json::json!(3));
        let mut guard = WorkflowStep::new("guard", StepType::Condition)
            .with_condition("score > 5");
        guard.context = context;
        let downstream = WorkflowStep::new("publish", StepType::Task)
            .with_agent("researcher")
            .with_description("publish")
            .with_dependencies(vec!["guard".to_string()]);
        workspace
            .add_workflow(Workflow::new(workspace.id, "guarded", vec![guard, downstream]))
            .unwrap();

        run(&mut workspace);
        let wf = &workspace.workflows[0];
        assert_eq!(wf.step("guard").unwrap().status, StepStatus::Skipped);
        assert_eq!(wf.step("publish").unwrap().status, StepStatus::Skipped);
        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert!(workspace.tasks.is_empty());
    }

    #[test]
    fn true_condition_carries_its_payload() {
        let mut workspace = ws(&["researcher"]);
        let mut context = Map::new();
        context.insert("score".to_string(), serde_json::json!(9));
        let mut guard =
            WorkflowStep::new("guard", StepType::Condition).with_condition("score > 5");
        guard.context = context;
        workspace
            .add_workflow(Workflow::new(workspace.id, "guarded", vec![guard]))
            .unwrap();

        run(&mut workspace);
        let wf = &workspace.workflows[0];
        assert_eq!(wf.step("guard").unwrap().status, StepStatus::Completed);
        assert_eq!(wf.step("guard").unwrap().result.as_deref(), Some("true"));
    }

    #[test]
    fn sequential_children_run_one_at_a_time() {
        let mut workspace = ws(&["researcher"]);
        let steps = vec![
            WorkflowStep::new("seq", StepType::Sequential)
                .with_children(vec!["one".to_string(), "two".to_string()]),
            WorkflowStep::new("one", StepType::Task)
                .with_agent("researcher")
                .with_description("first"),
            WorkflowStep::new("two", StepType::Task)
                .with_agent("researcher")
                .with_description("second"),
        ];
        workspace
            .add_workflow(Workflow::new(workspace.id, "seq", steps))
            .unwrap();

        run(&mut workspace);
        let wf = &workspace.workflows[0];
        assert_eq!(wf.step("one").unwrap().status, StepStatus::InProgress);
        assert_eq!(wf.step("two").unwrap().status, StepStatus::Waiting);
        assert_eq!(workspace.tasks.len(), 1);

        // Finish the first child; the second becomes dispatchable.
        let task_id = workspace.tasks[0].id;
        {
            let task = workspace.task_mut(task_id).unwrap();
            task.start().unwrap();
            task.complete("ok").unwrap();
        }
        run(&mut workspace);
        let wf = &workspace.workflows[0];
        assert_eq!(wf.step("one").unwrap().status, StepStatus::Completed);
        assert_eq!(wf.step("two").unwrap().status, StepStatus::InProgress);
        assert_eq!(workspace.tasks.len(), 2);
    }

    #[test]
    fn parallel_children_dispatch_together() {
        let mut workspace = ws(&["researcher"]);
        let steps = vec![
            WorkflowStep::new("par", StepType::Parallel)
                .with_children(vec!["one".to_string(), "two".to_string()]),
            WorkflowStep::new("one", StepType::Task)
                .with_agent("researcher")
                .with_description("first"),
            WorkflowStep::new("two", StepType::Task)
                .with_agent("researcher")
                .with_description("second"),
        ];
        workspace
            .add_workflow(Workflow::new(workspace.id, "par", steps))
            .unwrap();

        run(&mut workspace);
        assert_eq!(workspace.tasks.len(), 2);
        let wf = &workspace.workflows[0];
        assert_eq!(wf.step("par").unwrap().status, StepStatus::InProgress);
        assert_eq!(wf.step("one").unwrap().status, StepStatus::InProgress);
        assert_eq!(wf.step("two").unwrap().status, StepStatus::InProgress);
    }
}
