// src/agenthub/mod.rs

pub mod agent_store;
pub mod chat;
pub mod client_wrapper;
pub mod clients;
pub mod event_bus;
pub mod executor;
pub mod notification;
pub mod persist;
pub mod plugin;
pub mod runtime;
pub mod schedule;
pub mod settings;
pub mod tool_protocol;
pub mod workspace;
pub mod workspace_store;

// Export the runtime entry points at the module root so callers reach
// them as agenthub::Runtime instead of agenthub::runtime::Runtime.
pub use runtime::{Runtime, RuntimeConfig};
