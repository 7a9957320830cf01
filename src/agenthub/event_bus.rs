//! In-process event bus with filtered subscriptions and bounded history.
//!
//! Publishers hand the bus `(type, workspace_id?, payload)`; the bus
//! timestamps the event, appends it to a bounded ring buffer, and fans
//! it out to every matching subscriber over a bounded per-subscriber
//! channel. A subscriber that lets its channel fill up is disconnected
//! and must resubscribe (optionally replaying from the ring buffer).
//!
//! Ordering: per subscriber, events arrive in publication order. Across
//! subscribers there is no global ordering guarantee.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Event type strings published by the core.
pub mod event_type {
    pub const WORKSPACE_CREATED: &str = "workspace.created";
    pub const WORKSPACE_UPDATED: &str = "workspace.updated";
    pub const TASK_CREATED: &str = "task.created";
    pub const TASK_STARTED: &str = "task.started";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_FAILED: &str = "task.failed";
    pub const WORKFLOW_STARTED: &str = "workflow.started";
    pub const WORKFLOW_STEP_READY: &str = "workflow.step_ready";
    pub const WORKFLOW_COMPLETED: &str = "workflow.completed";
    pub const WORKFLOW_FAILED: &str = "workflow.failed";
    pub const AGENT_MESSAGE: &str = "agent.message";
    pub const PLUGIN_LOADED: &str = "system.plugin_loaded";
    pub const PLUGIN_UNLOADED: &str = "system.plugin_unloaded";
    pub const SCHEDULE_ERROR: &str = "system.schedule_error";
}

/// A single bus event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Namespaced type string (`workspace.*`, `task.*`, `workflow.*`,
    /// `agent.*`, `system.*`).
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<Uuid>,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

/// Subscription filter. All set fields must match; unset fields match
/// everything. `type_prefix` matches by prefix so `"task."` selects the
/// whole task family and `""` selects all events.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub type_prefix: String,
    pub workspace_id: Option<Uuid>,
    /// Matches events whose payload carries this agent in `from`/`to`/`agent`.
    pub agent: Option<String>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_type(prefix: impl Into<String>) -> Self {
        Self {
            type_prefix: prefix.into(),
            ..Default::default()
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        if !event.event_type.starts_with(&self.type_prefix) {
            return false;
        }
        if let Some(ws) = self.workspace_id {
            if event.workspace_id != Some(ws) {
                return false;
            }
        }
        if let Some(agent) = &self.agent {
            let hits = ["from", "to", "agent"].iter().any(|key| {
                event
                    .payload
                    .get(*key)
                    .and_then(|v| v.as_str())
                    .is_some_and(|v| v == agent.as_str())
            });
            if !hits {
                return false;
            }
        }
        true
    }
}

/// Receiving end of a subscription.
pub struct Subscription {
    pub id: u64,
    pub receiver: mpsc::Receiver<Event>,
}

struct Subscriber {
    id: u64,
    filter: EventFilter,
    sender: mpsc::Sender<Event>,
}

/// The bus. Subscription management and channel sends share one lock;
/// the history ring buffer has its own.
pub struct EventBus {
    subscribers: StdMutex<Vec<Subscriber>>,
    history: StdMutex<VecDeque<Event>>,
    history_capacity: usize,
    channel_capacity: usize,
    next_id: AtomicU64,
}

pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY, DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus {
    pub fn new(history_capacity: usize, channel_capacity: usize) -> Self {
        Self {
            subscribers: StdMutex::new(Vec::new()),
            history: StdMutex::new(VecDeque::with_capacity(history_capacity)),
            history_capacity,
            channel_capacity,
            next_id: AtomicU64::new(1),
        }
    }

    /// Publish an event. Never blocks: a subscriber whose channel is full
    /// is dropped from the bus.
    pub fn publish(
        &self,
        event_type: impl Into<String>,
        workspace_id: Option<Uuid>,
        payload: Value,
    ) {
        let event = Event {
            event_type: event_type.into(),
            workspace_id,
            payload,
            timestamp: Utc::now(),
        };

        {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            if history.len() == self.history_capacity {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|sub| {
            if !sub.filter.matches(&event) {
                return true;
            }
            match sub.sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!(
                        "event bus: disconnecting slow subscriber {} ({} queued)",
                        sub.id,
                        self.channel_capacity
                    );
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Register a subscriber with the given filter.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.channel_capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Subscriber { id, filter, sender });
        Subscription { id, receiver }
    }

    /// Drop a subscriber explicitly.
    pub fn unsubscribe(&self, id: u64) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|s| s.id != id);
    }

    /// The most recent events matching `filter`, oldest first, capped at
    /// `limit`. Used for replay after a reconnect.
    pub fn recent(&self, filter: &EventFilter, limit: usize) -> Vec<Event> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let matching: Vec<Event> = history
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).collect()
    }

    /// Number of currently connected subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
