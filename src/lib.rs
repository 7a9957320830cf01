// src/lib.rs

// Import the top-level `agenthub` module.
pub mod agenthub;

// Re-export the submodules at the crate root so downstream code writes
// agenthub::chat::ChatCore rather than agenthub::agenthub::chat::ChatCore.
pub use agenthub::{
    agent_store, chat, client_wrapper, clients, event_bus, executor, notification, persist,
    plugin, schedule, settings, tool_protocol, workspace, workspace_store,
};

// Re-exporting key items for easier external access.
pub use agenthub::agent_store::{AgentRole, AgentSettings, AgentStore};
pub use agenthub::chat::{ChatCore, ChatReply};
pub use agenthub::client_wrapper::{ClientWrapper, Message, Role};
pub use agenthub::event_bus::{Event, EventBus, EventFilter};
pub use agenthub::runtime::{Runtime, RuntimeConfig};
pub use agenthub::workspace::{Task, Workflow, WorkflowStep, Workspace};
