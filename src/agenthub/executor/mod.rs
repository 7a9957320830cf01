//! The three long-running workers that drive workspaces:
//!
//! - [`task_executor`] routes pending tasks to their recipient agents
//!   through the chat core, under a global concurrency cap;
//! - [`step_executor`] evaluates workflow DAGs and materializes tasks
//!   for ready steps;
//! - [`scheduler`] materializes scheduled-task templates at their
//!   `next_run` instants.
//!
//! Each worker is a spawned task polling on a `tokio::time::interval`
//! and watching a shared `watch` shutdown channel; `tick()` is public on
//! all three so tests can drive them deterministically.

pub mod scheduler;
pub mod step_executor;
pub mod task_executor;

pub use scheduler::{Scheduler, SchedulerConfig};
pub use step_executor::{StepExecutor, StepExecutorConfig};
pub use task_executor::{TaskExecutor, TaskExecutorConfig};
