//! Agent-addressed notifications layered over the event bus.
//!
//! A background bridge consumes selected bus events and turns them into
//! [`Notification`]s stored per agent (in memory, best-effort) and
//! pushed to live per-agent channels. Task completions and failures
//! notify the requesting agent; direct agent messages notify the
//! recipient.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::agenthub::event_bus::{event_type, Event, EventBus, EventFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub agent: String,
    pub level: NotificationLevel,
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub read: bool,
}

/// Per-subscriber channel capacity. Lagging listeners lose deliveries
/// (the stored list is authoritative).
const CHANNEL_CAPACITY: usize = 64;

/// In-memory notification store + live channels.
#[derive(Default)]
pub struct NotificationService {
    stored: StdMutex<HashMap<String, Vec<Notification>>>,
    listeners: StdMutex<HashMap<String, Vec<mpsc::Sender<Notification>>>>,
}

impl NotificationService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address a notification to `agent`.
    pub fn notify(
        &self,
        agent: impl Into<String>,
        level: NotificationLevel,
        title: impl Into<String>,
        body: impl Into<String>,
        task_id: Option<Uuid>,
        workspace_id: Option<Uuid>,
    ) -> Notification {
        let notification = Notification {
            id: Uuid::new_v4(),
            agent: agent.into(),
            level,
            title: title.into(),
            body: body.into(),
            task_id,
            workspace_id,
            created_at: Utc::now(),
            read: false,
        };

        self.stored
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(notification.agent.clone())
            .or_default()
            .push(notification.clone());

        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(senders) = listeners.get_mut(&notification.agent) {
            senders.retain(|s| s.try_send(notification.clone()).is_ok());
        }
        notification
    }

    /// Notifications for `agent`, optionally unread only.
    pub fn list(&self, agent: &str, unread_only: bool) -> Vec<Notification> {
        self.stored
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(agent)
            .map(|list| {
                list.iter()
                    .filter(|n| !unread_only || !n.read)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Mark one notification read. Returns false if unknown.
    pub fn mark_read(&self, agent: &str, id: Uuid) -> bool {
        let mut stored = self.stored.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = stored.get_mut(agent) {
            for notification in list.iter_mut() {
                if notification.id == id {
                    notification.read = true;
                    return true;
                }
            }
        }
        false
    }

    /// Live channel of notifications addressed to `agent`.
    pub fn subscribe(&self, agent: &str) -> mpsc::Receiver<Notification> {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(agent.to_string())
            .or_default()
            .push(sender);
        receiver
    }

    fn on_event(&self, event: &Event) {
        let payload = &event.payload;
        let get = |key: &str| payload.get(key).and_then(|v| v.as_str()).map(String::from);
        let task_id = payload
            .get("task_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok());

        match event.event_type.as_str() {
            event_type::TASK_COMPLETED => {
                if let Some(requester) = get("from") {
                    self.notify(
                        requester,
                        NotificationLevel::Info,
                        "Task completed",
                        format!(
                            "Task assigned to {} finished.",
                            get("to").unwrap_or_default()
                        ),
                        task_id,
                        event.workspace_id,
                    );
                }
            }
            event_type::TASK_FAILED => {
                if let Some(requester) = get("from") {
                    self.notify(
                        requester,
                        NotificationLevel::Error,
                        "Task failed",
                        format!(
                            "Task assigned to {} did not complete.",
                            get("to").unwrap_or_default()
                        ),
                        task_id,
                        event.workspace_id,
                    );
                }
            }
            event_type::AGENT_MESSAGE => {
                if let Some(to) = get("to") {
                    if !to.is_empty() {
                        self.notify(
                            to,
                            NotificationLevel::Info,
                            format!("Message from {}", get("from").unwrap_or_default()),
                            get("content").unwrap_or_default(),
                            None,
                            event.workspace_id,
                        );
                    }
                }
            }
            _ => {}
        }
    }

    /// Spawn the bridge consuming bus events into notifications. Runs
    /// until the bus drops the subscription or the service is dropped.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> tokio::task::JoinHandle<()> {
        let mut subscription = bus.subscribe(EventFilter::all());
        let service = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = subscription.receiver.recv().await {
                service.on_event(&event);
            }
        })
    }
}
