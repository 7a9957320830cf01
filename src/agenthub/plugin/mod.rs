//! Out-of-process plugin runtime.
//!
//! Every plugin is an independent OS process speaking the
//! [`plugin_rpc`] protocol over stdin/stdout. The host side here:
//!
//! - [`discovery`] scans search roots, introspects candidate
//!   executables, and maintains the registry documents;
//! - [`process`] owns one spawned subprocess: handshake, request/response
//!   correlation, per-call timeouts, teardown;
//! - [`cache`] keeps one live subprocess per `(agent, plugin id)` and
//!   implements [`ToolDispatcher`](crate::agenthub::tool_protocol::ToolDispatcher);
//! - [`health`] tracks per-handle call statistics and the auto-disable
//!   policy.

pub mod cache;
pub mod discovery;
pub mod health;
pub mod process;

pub use cache::{PluginRuntime, PluginRuntimeConfig};
pub use discovery::{
    evaluate_compatibility, scan_roots, CompatLevel, PluginIndex, PluginRecord, HOST_VERSION,
};
pub use health::{HandleHealth, HandleStatus};
pub use process::PluginProcess;

use std::error::Error;
use std::fmt;

/// Errors raised by the plugin runtime.
#[derive(Debug, Clone)]
pub enum PluginError {
    /// The executable could not be spawned.
    Spawn(String),
    /// Handshake line missing, malformed, or wrong cookie/version.
    Handshake(String),
    /// The plugin's declared schema is unusable (bad id, no definition).
    SchemaMismatch(String),
    /// A call exceeded its per-call timeout.
    CallTimeout(String),
    /// The process died mid-call.
    CallCrash(String),
    /// Arguments failed the host-side schema validation.
    SchemaValidation(String),
    /// The tool ran and reported an application-level failure.
    CallFailed(String),
    /// The plugin rejected the supplied configuration.
    ConfigRejected(String),
    /// Host version outside the plugin's min/max bounds.
    Incompatible(String),
    /// Malformed frame or unexpected RPC-level error.
    Protocol(String),
}

impl fmt::Display for PluginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginError::Spawn(msg) => write!(f, "plugin spawn failed: {}", msg),
            PluginError::Handshake(msg) => write!(f, "plugin handshake failed: {}", msg),
            PluginError::SchemaMismatch(msg) => write!(f, "plugin schema mismatch: {}", msg),
            PluginError::CallTimeout(msg) => write!(f, "plugin call timed out: {}", msg),
            PluginError::CallCrash(msg) => write!(f, "plugin crashed: {}", msg),
            PluginError::SchemaValidation(msg) => write!(f, "argument validation failed: {}", msg),
            PluginError::CallFailed(msg) => write!(f, "plugin call failed: {}", msg),
            PluginError::ConfigRejected(msg) => write!(f, "plugin rejected config: {}", msg),
            PluginError::Incompatible(msg) => write!(f, "plugin incompatible: {}", msg),
            PluginError::Protocol(msg) => write!(f, "plugin protocol error: {}", msg),
        }
    }
}

impl Error for PluginError {}
