//! Scheduler: materializes scheduled-task templates into concrete
//! tasks at their `next_run` instants.
//!
//! Materialization precision is poll-period-bounded (default 60 s).
//! Each due template fires at most once per epoch: the advance happens
//! inside the same durable workspace mutation as the task insert, so an
//! overlapping poll can never observe the stale `next_run`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::agenthub::event_bus::event_type;
use crate::agenthub::schedule::DEFAULT_FAILURE_DISABLE_THRESHOLD;
use crate::agenthub::workspace::{Task, WorkspaceStatus};
use crate::agenthub::workspace_store::WorkspaceStore;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    /// Consecutive materialization failures before a template disables.
    pub failure_disable_threshold: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            failure_disable_threshold: DEFAULT_FAILURE_DISABLE_THRESHOLD,
        }
    }
}

pub struct Scheduler {
    workspaces: Arc<WorkspaceStore>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(workspaces: Arc<WorkspaceStore>, config: SchedulerConfig) -> Arc<Self> {
        Arc::new(Self { workspaces, config })
    }

    /// Startup reconciliation: apply each template's missed-execution
    /// policy to stale `next_run`s before the first tick.
    pub async fn reconcile_missed(&self, now: DateTime<Utc>) {
        for workspace_id in self.workspaces.ids().await {
            let result = self
                .workspaces
                .mutate(workspace_id, |w| {
                    for template in &mut w.scheduled_tasks {
                        template.apply_missed_policy(now);
                    }
                    Ok(())
                })
                .await;
            if let Err(e) = result {
                log::error!(
                    "missed-policy reconciliation failed for {}: {}",
                    workspace_id,
                    e
                );
            }
        }
    }

    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.reconcile_missed(Utc::now()).await;
            let mut ticker = tokio::time::interval(scheduler.config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        scheduler.tick_at(Utc::now()).await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            log::info!("scheduler stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    pub async fn tick(&self) {
        self.tick_at(Utc::now()).await;
    }

    /// One poll iteration at a given instant (tests inject the clock).
    pub async fn tick_at(&self, now: DateTime<Utc>) {
        let threshold = self.config.failure_disable_threshold;
        for workspace in self.workspaces.list_by_status(WorkspaceStatus::Active).await {
            if !workspace.scheduled_tasks.iter().any(|t| t.is_due(now)) {
                continue;
            }
            let workspace_id = workspace.id;
            let events = self
                .workspaces
                .mutate(workspace_id, |w| {
                    let mut events: Vec<(&'static str, Value)> = Vec::new();
                    let participants = w.participating_agents.clone();
                    let mut new_tasks: Vec<Task> = Vec::new();

                    for template in &mut w.scheduled_tasks {
                        if !template.is_due(now) {
                            continue;
                        }
                        if !participants.iter().any(|p| *p == template.to) {
                            let error =
                                format!("recipient {:?} is not a participant", template.to);
                            if let Err(e) = template.mark_failed(error.as_str(), now, threshold) {
                                log::error!("schedule advance failed: {}", e);
                            }
                            events.push((
                                event_type::SCHEDULE_ERROR,
                                json!({
                                    "scheduled_task_id": template.id,
                                    "name": template.name,
                                    "error": error,
                                }),
                            ));
                            continue;
                        }

                        let mut context = template.context.clone();
                        context.insert(
                            "scheduled_task_id".to_string(),
                            Value::String(template.id.to_string()),
                        );
                        context.insert(
                            "execution_count".to_string(),
                            json!(template.execution_count + 1),
                        );
                        let mut task = Task::new(
                            template.workspace_id,
                            &template.from,
                            &template.to,
                            &template.prompt,
                        )
                        .with_priority(template.priority)
                        .with_context(context);
                        if let Some(timeout) = template.timeout_secs {
                            task = task.with_timeout_secs(timeout);
                        }

                        if let Err(e) = template.mark_materialized(now) {
                            log::error!("schedule advance failed for {}: {}", template.name, e);
                            continue;
                        }
                        events.push((
                            event_type::TASK_CREATED,
                            json!({
                                "workspace_id": workspace_id,
                                "task_id": task.id,
                                "from": task.from,
                                "to": task.to,
                                "description": task.description,
                                "priority": task.priority,
                                "scheduled_task_id": template.id,
                            }),
                        ));
                        new_tasks.push(task);
                    }

                    w.tasks.extend(new_tasks);
                    Ok(events)
                })
                .await;

            match events {
                Ok(events) => {
                    for (event_type, payload) in events {
                        self.workspaces
                            .bus()
                            .publish(event_type, Some(workspace_id), payload);
                    }
                }
                Err(e) => {
                    log::error!("scheduler mutation failed for {}: {}", workspace_id, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agenthub::event_bus::EventBus;
    use crate::agenthub::schedule::{MissedPolicy, ScheduleKind, ScheduledTask};
    use crate::agenthub::workspace::TaskStatus;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    async fn setup() -> (tempfile::TempDir, Arc<WorkspaceStore>, Arc<Scheduler>, uuid::Uuid) {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::default());
        let store = Arc::new(
            WorkspaceStore::load(dir.path().join("workspaces"), bus).unwrap(),
        );
        let scheduler = Scheduler::new(store.clone(), SchedulerConfig::default());
        let ws = store
            .create_workspace(
                "ops",
                vec!["orchestrator".to_string(), "researcher".to_string()],
            )
            .await
            .unwrap();
        (dir, store, scheduler, ws)
    }

    fn daily_template(ws: uuid::Uuid) -> ScheduledTask {
        ScheduledTask::new(
            ws,
            "morning-report",
            "orchestrator",
            "researcher",
            "write the morning report",
            ScheduleKind::Daily {
                time_of_day: "09:00".to_string(),
                timezone: Some("UTC".to_string()),
            }
            .into(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn daily_materialization_advances_a_day() {
        let (_dir, store, scheduler, ws) = setup().await;
        let mut template = daily_template(ws);
        template.next_run = Some(utc("2025-11-01T09:00:00Z"));
        let template_id = store.create_scheduled_task(template).await.unwrap();

        scheduler.tick_at(utc("2025-11-01T09:00:10Z")).await;

        let snapshot = store.snapshot(ws).await.unwrap();
        assert_eq!(snapshot.tasks.len(), 1);
        let task = &snapshot.tasks[0];
        assert_eq!(task.from, "orchestrator");
        assert_eq!(task.to, "researcher");
        assert_eq!(task.description, "write the morning report");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(
            task.context["scheduled_task_id"],
            serde_json::json!(template_id.to_string())
        );
        assert_eq!(task.context["execution_count"], serde_json::json!(1));

        let template = snapshot.scheduled_task(template_id).unwrap();
        assert_eq!(template.execution_count, 1);
        assert!(template.enabled);
        assert_eq!(template.next_run, Some(utc("2025-11-02T09:00:00Z")));
    }

    #[tokio::test]
    async fn not_due_templates_do_not_fire() {
        let (_dir, store, scheduler, ws) = setup().await;
        let mut template = daily_template(ws);
        template.next_run = Some(utc("2025-11-01T09:00:00Z"));
        store.create_scheduled_task(template).await.unwrap();

        scheduler.tick_at(utc("2025-11-01T08:59:30Z")).await;
        assert!(store.snapshot(ws).await.unwrap().tasks.is_empty());
    }

    #[tokio::test]
    async fn one_shot_fires_exactly_once_under_repeated_polls() {
        let (_dir, store, scheduler, ws) = setup().await;
        let at = utc("2025-11-01T12:00:00Z");
        let template = ScheduledTask::new(
            ws,
            "ping",
            "orchestrator",
            "researcher",
            "ping once",
            ScheduleKind::Once { execute_at: at }.into(),
        )
        .unwrap();
        let template_id = store.create_scheduled_task(template).await.unwrap();

        for i in 0..4i64 {
            scheduler
                .tick_at(at + chrono::Duration::seconds(10 * (i + 1)))
                .await;
        }

        let snapshot = store.snapshot(ws).await.unwrap();
        assert_eq!(snapshot.tasks.len(), 1);
        let template = snapshot.scheduled_task(template_id).unwrap();
        assert!(!template.enabled);
        assert!(template.next_run.is_none());
        assert_eq!(template.execution_count, 1);
    }

    #[tokio::test]
    async fn stale_interval_with_skip_policy_fires_once_and_lands_on_grid() {
        let (_dir, store, scheduler, ws) = setup().await;
        let mut template = ScheduledTask::new(
            ws,
            "hourly",
            "orchestrator",
            "researcher",
            "hourly check",
            ScheduleKind::Interval {
                interval_secs: 3600,
            }
            .into(),
        )
        .unwrap();
        template.last_run = Some(utc("2025-11-01T00:00:00Z"));
        template.next_run = Some(utc("2025-11-01T01:00:00Z"));
        assert_eq!(template.missed_policy, MissedPolicy::Skip);
        let template_id = store.create_scheduled_task(template).await.unwrap();

        let now = utc("2025-11-01T05:30:00Z");
        scheduler.reconcile_missed(now).await;
        scheduler.tick_at(now).await;

        let snapshot = store.snapshot(ws).await.unwrap();
        assert_eq!(snapshot.tasks.len(), 1);
        let template = snapshot.scheduled_task(template_id).unwrap();
        assert_eq!(template.next_run, Some(utc("2025-11-01T06:00:00Z")));
        assert_eq!(template.execution_count, 1);
    }

    #[tokio::test]
    async fn missed_one_shot_with_skip_policy_never_fires() {
        let (_dir, store, scheduler, ws) = setup().await;
        let mut template = ScheduledTask::new(
            ws,
            "stale-ping",
            "orchestrator",
            "researcher",
            "too late",
            ScheduleKind::Once {
                execute_at: utc("2025-11-01T00:00:00Z"),
            }
            .into(),
        )
        .unwrap();
        template.missed_policy = MissedPolicy::Skip;
        let template_id = store.create_scheduled_task(template).await.unwrap();

        let now = utc("2025-11-02T00:00:00Z");
        scheduler.reconcile_missed(now).await;
        scheduler.tick_at(now).await;

        let snapshot = store.snapshot(ws).await.unwrap();
        assert!(snapshot.tasks.is_empty());
        assert!(!snapshot.scheduled_task(template_id).unwrap().enabled);
    }

    #[tokio::test]
    async fn disabled_templates_do_not_materialize() {
        let (_dir, store, scheduler, ws) = setup().await;
        let mut template = daily_template(ws);
        template.next_run = Some(utc("2025-11-01T09:00:00Z"));
        template.enabled = false;
        store.create_scheduled_task(template).await.unwrap();

        scheduler.tick_at(utc("2025-11-01T10:00:00Z")).await;
        assert!(store.snapshot(ws).await.unwrap().tasks.is_empty());
    }

    #[tokio::test]
    async fn unknown_recipient_counts_failures_and_disables() {
        let (_dir, store, scheduler, ws) = setup().await;
        let mut template = ScheduledTask::new(
            ws,
            "misaddressed",
            "orchestrator",
            "researcher",
            "go",
            ScheduleKind::Interval { interval_secs: 60 }.into(),
        )
        .unwrap();
        template.to = "ghost".to_string();
        template.next_run = Some(utc("2025-11-01T00:00:00Z"));
        // Bypass create_scheduled_task's own participant check to model
        // an agent removed after the template was created.
        store
            .mutate(ws, move |w| {
                w.scheduled_tasks.push(template);
                Ok(())
            })
            .await
            .unwrap();

        let mut now = utc("2025-11-01T00:00:30Z");
        for _ in 0..DEFAULT_FAILURE_DISABLE_THRESHOLD {
            scheduler.tick_at(now).await;
            now += chrono::Duration::seconds(90);
        }

        let snapshot = store.snapshot(ws).await.unwrap();
        assert!(snapshot.tasks.is_empty());
        let template = &snapshot.scheduled_tasks[0];
        assert!(!template.enabled);
        assert_eq!(
            template.failure_count,
            DEFAULT_FAILURE_DISABLE_THRESHOLD
        );
        assert!(template.last_error.is_some());
    }
}
