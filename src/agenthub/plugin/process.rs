//! One spawned plugin subprocess: handshake, request/response plumbing,
//! and teardown.
//!
//! The transport is newline-delimited JSON over the child's
//! stdin/stdout. Calls are strictly sequential per process (the cache
//! wraps each handle in a mutex), so correlation only needs to skip
//! stale frames. A timed-out call poisons the pipe — the late response
//! would desynchronize the next exchange — so the process is killed and
//! the cache respawns it on the next call.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use plugin_rpc::handshake::{parse_handshake, Handshake};
use plugin_rpc::wire::{
    self, code, method, AgentContext, CallContext, CallParams, Compatibility, ConfigParams,
    ConfigVar, HealthStatus, PluginMetadata, RpcRequest, RpcResponse, ToolDefinition,
    ValidationOutcome, VersionInfo, WebPage,
};

use super::PluginError;

/// How long a freshly spawned plugin has to produce its handshake line.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default per-call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for the short introspection RPCs (`definition`, `version`, ...).
pub const INTROSPECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A live plugin subprocess after a successful handshake.
pub struct PluginProcess {
    child: Child,
    writer: BufWriter<ChildStdin>,
    lines: Lines<BufReader<ChildStdout>>,
    next_id: u64,
    path: PathBuf,
    pub handshake: Handshake,
}

impl PluginProcess {
    /// Spawn the executable at `path` and perform the handshake.
    ///
    /// The child gets a scrubbed environment (`PATH` only) and piped
    /// stdio; stderr is inherited so plugin logs reach the host's.
    pub async fn spawn(path: &Path) -> Result<Self, PluginError> {
        let mut child = Command::new(path)
            .env_clear()
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PluginError::Spawn(format!("{}: {}", path.display(), e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PluginError::Spawn("failed to open plugin stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PluginError::Spawn("failed to open plugin stdout".to_string()))?;

        let mut lines = BufReader::new(stdout).lines();
        let first_line = tokio::time::timeout(HANDSHAKE_TIMEOUT, lines.next_line())
            .await
            .map_err(|_| PluginError::Handshake("timed out waiting for handshake".to_string()))?
            .map_err(|e| PluginError::Handshake(e.to_string()))?
            .ok_or_else(|| PluginError::Handshake("plugin closed stdout".to_string()))?;

        let handshake =
            parse_handshake(&first_line).map_err(|e| PluginError::Handshake(e.to_string()))?;

        Ok(Self {
            child,
            writer: BufWriter::new(stdin),
            lines,
            next_id: 1,
            path: path.to_path_buf(),
            handshake,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True while the child has not exited.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Send one request and wait for the matching response.
    async fn request(
        &mut self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, PluginError> {
        let id = self.next_id;
        self.next_id += 1;
        let req = RpcRequest::new(id, method, params);
        let mut frame =
            serde_json::to_string(&req).map_err(|e| PluginError::Protocol(e.to_string()))?;
        frame.push('\n');

        let exchange = async {
            self.writer
                .write_all(frame.as_bytes())
                .await
                .map_err(|e| PluginError::CallCrash(e.to_string()))?;
            self.writer
                .flush()
                .await
                .map_err(|e| PluginError::CallCrash(e.to_string()))?;

            loop {
                let line = self
                    .lines
                    .next_line()
                    .await
                    .map_err(|e| PluginError::CallCrash(e.to_string()))?
                    .ok_or_else(|| {
                        PluginError::CallCrash("plugin closed stdout mid-call".to_string())
                    })?;
                if line.trim().is_empty() {
                    continue;
                }
                let resp: RpcResponse = match serde_json::from_str(&line) {
                    Ok(r) => r,
                    Err(_) => continue,
                };
                if resp.id != id {
                    // Stale frame from an earlier aborted exchange.
                    continue;
                }
                if let Some(err) = resp.error {
                    return Err(match err.code {
                        code::CALL_FAILED => PluginError::CallFailed(err.message),
                        code::INVALID_PARAMS => PluginError::SchemaValidation(err.message),
                        _ => PluginError::Protocol(format!("[{}] {}", err.code, err.message)),
                    });
                }
                return Ok(resp.result.unwrap_or(serde_json::Value::Null));
            }
        };

        let outcome = tokio::time::timeout(timeout, exchange).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                // The pipe is now desynchronized; kill so the cache respawns.
                let _ = self.child.start_kill();
                Err(PluginError::CallTimeout(format!(
                    "{} after {:?}",
                    method, timeout
                )))
            }
        }
    }

    pub async fn definition(&mut self) -> Result<ToolDefinition, PluginError> {
        let value = self
            .request(method::DEFINITION, serde_json::Value::Null, INTROSPECT_TIMEOUT)
            .await?;
        serde_json::from_value(value)
            .map_err(|e| PluginError::SchemaMismatch(format!("bad definition payload: {}", e)))
    }

    /// Execute the tool with raw JSON arguments.
    pub async fn call(
        &mut self,
        args_json: String,
        context: CallContext,
        timeout: Duration,
    ) -> Result<String, PluginError> {
        let params = serde_json::to_value(CallParams { args_json, context })
            .map_err(|e| PluginError::Protocol(e.to_string()))?;
        let value = self.request(method::CALL, params, timeout).await?;
        let result: wire::CallResult = serde_json::from_value(value)
            .map_err(|e| PluginError::Protocol(format!("bad call payload: {}", e)))?;
        match result.error {
            Some(err) => Err(PluginError::CallFailed(err)),
            None => Ok(result.result),
        }
    }

    async fn optional<T: serde::de::DeserializeOwned>(
        &mut self,
        method: &str,
    ) -> Result<Option<T>, PluginError> {
        let value = self
            .request(method, serde_json::Value::Null, INTROSPECT_TIMEOUT)
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| PluginError::Protocol(format!("bad {} payload: {}", method, e)))
    }

    pub async fn version(&mut self) -> Result<Option<VersionInfo>, PluginError> {
        self.optional(method::VERSION).await
    }

    pub async fn metadata(&mut self) -> Result<Option<PluginMetadata>, PluginError> {
        self.optional(method::METADATA).await
    }

    pub async fn compatibility(&mut self) -> Result<Option<Compatibility>, PluginError> {
        self.optional(method::COMPATIBILITY).await
    }

    pub async fn required_config(&mut self) -> Result<Vec<ConfigVar>, PluginError> {
        Ok(self
            .optional::<Vec<ConfigVar>>(method::REQUIRED_CONFIG)
            .await?
            .unwrap_or_default())
    }

    pub async fn web_page_list(&mut self) -> Result<Vec<WebPage>, PluginError> {
        Ok(self
            .optional::<Vec<WebPage>>(method::WEB_PAGE_LIST)
            .await?
            .unwrap_or_default())
    }

    pub async fn health_check(&mut self) -> Result<Option<HealthStatus>, PluginError> {
        self.optional(method::HEALTH_CHECK).await
    }

    pub async fn validate_config(
        &mut self,
        config: &std::collections::HashMap<String, String>,
    ) -> Result<(), PluginError> {
        let params = serde_json::to_value(ConfigParams {
            config: config.clone(),
        })
        .map_err(|e| PluginError::Protocol(e.to_string()))?;
        let value = self
            .request(method::VALIDATE_CONFIG, params, INTROSPECT_TIMEOUT)
            .await?;
        let outcome: ValidationOutcome = serde_json::from_value(value)
            .map_err(|e| PluginError::Protocol(format!("bad validation payload: {}", e)))?;
        if outcome.ok {
            Ok(())
        } else {
            Err(PluginError::ConfigRejected(
                outcome.message.unwrap_or_else(|| "rejected".to_string()),
            ))
        }
    }

    pub async fn initialize_with_config(
        &mut self,
        config: std::collections::HashMap<String, String>,
    ) -> Result<(), PluginError> {
        let params = serde_json::to_value(ConfigParams { config })
            .map_err(|e| PluginError::Protocol(e.to_string()))?;
        self.request(method::INITIALIZE_WITH_CONFIG, params, INTROSPECT_TIMEOUT)
            .await?;
        Ok(())
    }

    pub async fn set_agent_context(&mut self, context: AgentContext) -> Result<(), PluginError> {
        let params =
            serde_json::to_value(context).map_err(|e| PluginError::Protocol(e.to_string()))?;
        self.request(method::SET_AGENT_CONTEXT, params, INTROSPECT_TIMEOUT)
            .await?;
        Ok(())
    }

    /// Ask the plugin to exit, waiting up to `grace` before killing it.
    pub async fn shutdown(mut self, grace: Duration) {
        let _ = self
            .request(method::SHUTDOWN, serde_json::Value::Null, grace)
            .await;
        let waited = tokio::time::timeout(grace, self.child.wait()).await;
        if waited.is_err() {
            log::warn!("plugin {} ignored shutdown, killing", self.path.display());
            let _ = self.child.start_kill();
        }
    }
}
