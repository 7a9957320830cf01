//! Wire protocol shared by the agenthub host and its tool plugins.
//!
//! A plugin is a standalone executable. On startup it writes a single
//! handshake line to stdout (magic cookie + protocol version) and then
//! speaks newline-delimited JSON frames over stdin/stdout: the host sends
//! [`RpcRequest`]s, the plugin answers with [`RpcResponse`]s carrying the
//! same `id`. Plugin authors implement [`PluginHandler`] and hand it to
//! [`serve`], which owns the whole read/dispatch/reply loop:
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use plugin_rpc::{serve, CallContext, PluginHandler, ToolDefinition};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl PluginHandler for Echo {
//!     fn definition(&self) -> ToolDefinition {
//!         ToolDefinition {
//!             name: "echo".to_string(),
//!             description: "Echoes its arguments back.".to_string(),
//!             parameters_schema: serde_json::json!({
//!                 "type": "object",
//!                 "properties": { "text": { "type": "string" } },
//!                 "required": ["text"]
//!             }),
//!             timeout_secs: None,
//!         }
//!     }
//!
//!     async fn call(
//!         &self,
//!         args: serde_json::Value,
//!         _context: CallContext,
//!     ) -> Result<String, String> {
//!         Ok(args["text"].as_str().unwrap_or_default().to_string())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     serve(Echo).await
//! }
//! ```

pub mod handshake;
pub mod server;
pub mod wire;

pub use handshake::{parse_handshake, Handshake, HandshakeError, PROTOCOL_VERSION};
pub use server::{serve, PluginHandler};
pub use wire::{
    AgentContext, CallContext, Compatibility, ConfigVar, HealthStatus, PluginMetadata, RpcError,
    RpcRequest, RpcResponse, ToolDefinition, WebPage, WebPageContent,
};
