//! Chat core: single-turn orchestration with the bounded tool loop.
//!
//! For one agent and one user input, produce an assistant reply,
//! performing any tool calls the model requests. The loop is:
//! model proposes tool calls → runtime executes them in emitted order →
//! results appended as tool messages → model continues, for at most
//! [`ChatCoreConfig::max_tool_iterations`] rounds.
//!
//! The chat core never raises across its boundary: provider failures,
//! tool failures, and malformed input all come back as a [`ChatReply`]
//! with an explanation in `content`. Slash commands (`/help`, `/tools`,
//! `/agent`, `/workspace …`, `/tool …`) are handled here and never
//! touch the LLM.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::agenthub::agent_store::AgentStore;
use crate::agenthub::client_wrapper::{ChatOptions, LlmError, Message, TokenUsage};
use crate::agenthub::clients::registry::ProviderRegistry;
use crate::agenthub::tool_protocol::{ToolDispatcher, ToolError};
use crate::agenthub::workspace_store::WorkspaceStore;

/// Marker embedded in synthetic tool results and error replies so
/// downstream consumers (and the model itself) can recognize failures.
pub const TOOL_ERROR_MARKER: &str = "[tool-error]";

/// Tunables for the chat core.
#[derive(Debug, Clone)]
pub struct ChatCoreConfig {
    /// Tool-loop bound per turn.
    pub max_tool_iterations: usize,
    /// Retries on retriable provider errors (transport, rate limit).
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries.
    pub retry_base_delay: Duration,
}

impl Default for ChatCoreConfig {
    fn default() -> Self {
        Self {
            max_tool_iterations: 5,
            max_retries: 2,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

/// The reply produced by one chat turn.
#[derive(Debug, Clone)]
pub struct ChatReply {
    pub content: String,
    pub tokens_used: Option<TokenUsage>,
    /// Number of tool calls executed during this turn.
    pub tool_calls_made: usize,
    /// Reply annotations (`direct_tool_call`, `tool_name`, ...).
    pub metadata: HashMap<String, Value>,
}

impl ChatReply {
    fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tokens_used: None,
            tool_calls_made: 0,
            metadata: HashMap::new(),
        }
    }
}

enum Command<'a> {
    Help,
    Tools,
    AgentStatus,
    Workspace(&'a str),
    Tool { id: &'a str, args: &'a str },
    Unknown(&'a str),
}

fn parse_command(input: &str) -> Option<Command<'_>> {
    let trimmed = input.trim();
    if !trimmed.starts_with('/') {
        return None;
    }
    let (head, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (trimmed, ""),
    };
    Some(match head {
        "/help" => Command::Help,
        "/tools" => Command::Tools,
        "/agent" => Command::AgentStatus,
        "/workspace" => Command::Workspace(rest),
        "/tool" => match rest.split_once(char::is_whitespace) {
            Some((id, args)) => Command::Tool {
                id,
                args: args.trim(),
            },
            None => Command::Tool {
                id: rest,
                args: "",
            },
        },
        other => Command::Unknown(other),
    })
}

/// Single-turn + tool-loop orchestration for agents.
pub struct ChatCore {
    providers: Arc<ProviderRegistry>,
    agents: Arc<AgentStore>,
    tools: Arc<dyn ToolDispatcher>,
    workspaces: Arc<WorkspaceStore>,
    config: ChatCoreConfig,
    /// Per-agent turn locks: a new turn cannot begin until the previous
    /// turn's tool loop has terminated.
    turn_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ChatCore {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        agents: Arc<AgentStore>,
        tools: Arc<dyn ToolDispatcher>,
        workspaces: Arc<WorkspaceStore>,
        config: ChatCoreConfig,
    ) -> Self {
        Self {
            providers,
            agents,
            tools,
            workspaces,
            config,
            turn_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn agents(&self) -> &Arc<AgentStore> {
        &self.agents
    }

    async fn turn_lock(&self, agent: &str) -> Arc<Mutex<()>> {
        let mut locks = self.turn_locks.lock().await;
        locks
            .entry(agent.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run one turn for `agent`. Slash commands are answered locally;
    /// everything else goes through the LLM with the tool loop.
    pub async fn run_turn(&self, agent: &str, input: &str) -> ChatReply {
        let lock = self.turn_lock(agent).await;
        let _guard = lock.lock().await;

        if let Some(command) = parse_command(input) {
            return self.run_command(agent, command).await;
        }
        self.chat_turn(agent, input).await
    }

    // ---- commands ----

    async fn run_command(&self, agent: &str, command: Command<'_>) -> ChatReply {
        match command {
            Command::Help => ChatReply::text(
                "Available commands:\n\
                 /help — this list\n\
                 /tools — enabled tools and their schemas\n\
                 /agent — current agent status\n\
                 /tool <plugin-id> <json-args> — invoke a tool directly\n\
                 /workspace — workspaces you participate in\n\
                 /workspace tasks — your open tasks\n\
                 /workspace task <id> — one task in detail\n\
                 /workspace all — all your tasks",
            ),
            Command::Tools => {
                let tools = self.tools.list_tools(agent).await;
                if tools.is_empty() {
                    return ChatReply::text("No tools enabled.");
                }
                let mut out = String::new();
                for tool in tools {
                    out.push_str(&format!("{} — {}\n", tool.name, tool.description));
                    if let Ok(schema) = serde_json::to_string_pretty(&tool.parameters_schema) {
                        out.push_str(&schema);
                        out.push('\n');
                    }
                }
                ChatReply::text(out.trim_end())
            }
            Command::AgentStatus => match self.agents.get_config(agent).await {
                Ok(config) => {
                    let history_len = self
                        .agents
                        .history(agent)
                        .await
                        .map(|h| h.len())
                        .unwrap_or(0);
                    ChatReply::text(format!(
                        "agent: {}\nrole: {:?}\nprovider: {}\nmodel: {}\ntemperature: {}\nplugins: {}\nhistory: {} messages",
                        config.name,
                        config.role,
                        config.settings.provider,
                        if config.settings.model.is_empty() {
                            "(provider default)"
                        } else {
                            config.settings.model.as_str()
                        },
                        config.settings.temperature,
                        config
                            .enabled_plugins
                            .iter()
                            .map(|p| p.plugin_id.as_str())
                            .collect::<Vec<_>>()
                            .join(", "),
                        history_len,
                    ))
                }
                Err(e) => ChatReply::text(format!("{} {}", TOOL_ERROR_MARKER, e)),
            },
            Command::Tool { id, args } => self.direct_tool_call(agent, id, args).await,
            Command::Workspace(rest) => self.workspace_command(agent, rest).await,
            Command::Unknown(cmd) => ChatReply::text(format!(
                "Unknown command {:?}. Try /help.",
                cmd
            )),
        }
    }

    /// `/tool <plugin-id> <json-args>` — bypass the LLM entirely.
    async fn direct_tool_call(&self, agent: &str, id: &str, args: &str) -> ChatReply {
        if id.is_empty() {
            return ChatReply::text("Usage: /tool <plugin-id> <json-args>");
        }
        let args_value: Value = if args.is_empty() {
            Value::Object(serde_json::Map::new())
        } else {
            match serde_json::from_str(args) {
                Ok(v) => v,
                Err(e) => {
                    return ChatReply::text(format!(
                        "{} arguments are not valid JSON: {}",
                        TOOL_ERROR_MARKER, e
                    ))
                }
            }
        };

        let utterance = format!("/tool {} {}", id, args);
        let _ = self.agents.append_message(agent, &Message::user(&utterance)).await;

        let result = self.tools.call_tool(agent, id, args_value).await;
        let mut reply = match result {
            Ok(output) => ChatReply::text(output),
            Err(ToolError::NotFound(_)) => {
                let available = self
                    .tools
                    .list_tools(agent)
                    .await
                    .into_iter()
                    .map(|t| t.name)
                    .collect::<Vec<_>>()
                    .join(", ");
                ChatReply::text(format!(
                    "{} unknown tool {:?}. Available tools: {}",
                    TOOL_ERROR_MARKER,
                    id,
                    if available.is_empty() {
                        "(none)".to_string()
                    } else {
                        available
                    }
                ))
            }
            Err(e) => ChatReply::text(format!("{} {}", TOOL_ERROR_MARKER, e)),
        };
        let _ = self
            .agents
            .append_message(agent, &Message::assistant(&reply.content))
            .await;

        reply
            .metadata
            .insert("direct_tool_call".to_string(), Value::Bool(true));
        reply
            .metadata
            .insert("tool_name".to_string(), Value::String(id.to_string()));
        reply
    }

    async fn workspace_command(&self, agent: &str, rest: &str) -> ChatReply {
        let mut parts = rest.split_whitespace();
        match (parts.next(), parts.next()) {
            (None, _) => {
                let workspaces = self.workspaces.workspaces_for_agent(agent).await;
                if workspaces.is_empty() {
                    return ChatReply::text("You are not a participant in any workspace.");
                }
                let mut out = String::new();
                for ws in workspaces {
                    out.push_str(&format!(
                        "{} [{:?}] agents: {} | tasks: {} | workflows: {}\n",
                        ws.name,
                        ws.status,
                        ws.participating_agents.join(", "),
                        ws.tasks.len(),
                        ws.workflows.len(),
                    ));
                }
                ChatReply::text(out.trim_end())
            }
            (Some("tasks"), _) => self.render_tasks(agent, true).await,
            (Some("all"), _) => self.render_tasks(agent, false).await,
            (Some("task"), Some(prefix)) => {
                match self.workspaces.task_for_agent_by_prefix(agent, prefix).await {
                    Some(task) => ChatReply::text(format!(
                        "task {}\nfrom: {}\nstatus: {:?}\npriority: {}\ndescription: {}\nresult: {}\nerror: {}",
                        task.id,
                        task.from,
                        task.status,
                        task.priority,
                        task.description,
                        task.result.as_deref().unwrap_or("-"),
                        task.error.as_deref().unwrap_or("-"),
                    )),
                    None => ChatReply::text(format!("No task matching {:?} addressed to you.", prefix)),
                }
            }
            (Some("task"), None) => ChatReply::text("Usage: /workspace task <id>"),
            (Some(other), _) => ChatReply::text(format!(
                "Unknown workspace subcommand {:?}. Try /workspace, /workspace tasks, /workspace task <id>, /workspace all.",
                other
            )),
        }
    }

    async fn render_tasks(&self, agent: &str, open_only: bool) -> ChatReply {
        let tasks = self.workspaces.tasks_for_agent(agent, open_only).await;
        if tasks.is_empty() {
            return ChatReply::text(if open_only {
                "No open tasks addressed to you."
            } else {
                "No tasks addressed to you."
            });
        }
        let mut out = String::new();
        for task in tasks {
            out.push_str(&format!(
                "{} [{:?}] from {}: {}\n",
                task.id, task.status, task.from, task.description
            ));
        }
        ChatReply::text(out.trim_end())
    }

    // ---- the LLM path ----

    /// Send with bounded retry on retriable provider errors.
    async fn send_with_retry(
        &self,
        client: &Arc<dyn crate::agenthub::client_wrapper::ClientWrapper>,
        messages: &[Message],
        tools: Option<Vec<crate::agenthub::client_wrapper::ToolDefinition>>,
        options: &ChatOptions,
    ) -> Result<Message, LlmError> {
        let mut attempt = 0u32;
        loop {
            match client.send_message(messages, tools.clone(), options).await {
                Ok(message) => return Ok(message),
                Err(e) if e.is_retriable() && attempt < self.config.max_retries => {
                    let delay = self.config.retry_base_delay * 2u32.saturating_pow(attempt);
                    log::warn!("retriable provider error (attempt {}): {}", attempt + 1, e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn chat_turn(&self, agent: &str, input: &str) -> ChatReply {
        let config = match self.agents.get_config(agent).await {
            Ok(config) => config,
            Err(e) => return ChatReply::text(format!("{} {}", TOOL_ERROR_MARKER, e)),
        };

        let client = match self
            .providers
            .client(&config.settings.provider, &config.settings.model)
            .await
        {
            Ok(client) => client,
            Err(e) => return ChatReply::text(format!("{} {}", TOOL_ERROR_MARKER, e)),
        };

        let options = ChatOptions {
            temperature: config.settings.temperature,
            max_tokens: config.settings.max_tokens,
            system_prompt: if config.settings.system_prompt.is_empty() {
                None
            } else {
                Some(config.settings.system_prompt.clone())
            },
        };

        let catalog: Vec<_> = self
            .tools
            .list_tools(agent)
            .await
            .iter()
            .map(|t| t.to_tool_definition())
            .collect();
        let tools = if catalog.is_empty() {
            None
        } else {
            Some(catalog)
        };

        if let Err(e) = self.agents.append_message(agent, &Message::user(input)).await {
            return ChatReply::text(format!("{} {}", TOOL_ERROR_MARKER, e));
        }

        let mut total_usage = TokenUsage::default();
        let mut tool_calls_made = 0usize;

        for iteration in 0..=self.config.max_tool_iterations {
            let history: Vec<Message> = match self.agents.history(agent).await {
                Ok(stored) => stored.iter().map(|m| m.to_message()).collect(),
                Err(e) => return ChatReply::text(format!("{} {}", TOOL_ERROR_MARKER, e)),
            };

            let assistant = match self
                .send_with_retry(&client, &history, tools.clone(), &options)
                .await
            {
                Ok(message) => message,
                Err(e) => {
                    let content = format!(
                        "I could not reach the language model: {}. Please try again.",
                        e
                    );
                    let _ = self
                        .agents
                        .append_message(agent, &Message::assistant(&content))
                        .await;
                    return ChatReply {
                        content,
                        tokens_used: usage_or_none(total_usage),
                        tool_calls_made,
                        metadata: HashMap::new(),
                    };
                }
            };

            if let Some(usage) = client.get_last_usage().await {
                total_usage.add(&usage);
            }

            let _ = self.agents.append_message(agent, &assistant).await;

            if !assistant.has_tool_calls() {
                return ChatReply {
                    content: assistant.content.as_ref().to_string(),
                    tokens_used: usage_or_none(total_usage),
                    tool_calls_made,
                    metadata: HashMap::new(),
                };
            }

            if iteration == self.config.max_tool_iterations {
                // Budget spent and the model still wants tools.
                break;
            }

            // Execute the turn's tool calls in the order the provider
            // emitted them; every failure becomes a synthetic result so
            // the model can recover or report.
            for call in &assistant.tool_calls {
                tool_calls_made += 1;
                let outcome = self
                    .tools
                    .call_tool(agent, &call.name, call.arguments.clone())
                    .await;
                let result_text = match outcome {
                    Ok(output) => output,
                    Err(ToolError::NotFound(name)) => {
                        format!("{} no such tool: {}", TOOL_ERROR_MARKER, name)
                    }
                    Err(e) => format!("{} {}", TOOL_ERROR_MARKER, e),
                };
                let _ = self
                    .agents
                    .append_message(agent, &Message::tool_result(&call.id, &result_text))
                    .await;
            }
        }

        let content = format!(
            "Tool-call budget of {} iterations exhausted before the model produced a final answer.",
            self.config.max_tool_iterations
        );
        let _ = self
            .agents
            .append_message(agent, &Message::assistant(&content))
            .await;
        ChatReply {
            content,
            tokens_used: usage_or_none(total_usage),
            tool_calls_made,
            metadata: HashMap::new(),
        }
    }
}

fn usage_or_none(usage: TokenUsage) -> Option<TokenUsage> {
    if usage.total_tokens > 0 {
        Some(usage)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_parsing() {
        assert!(matches!(parse_command("/help"), Some(Command::Help)));
        assert!(matches!(parse_command("/tools"), Some(Command::Tools)));
        assert!(matches!(
            parse_command("/agent"),
            Some(Command::AgentStatus)
        ));
        assert!(parse_command("hello").is_none());
        assert!(parse_command("  plain text /tool").is_none());

        match parse_command("/tool math {\"a\": 1}") {
            Some(Command::Tool { id, args }) => {
                assert_eq!(id, "math");
                assert_eq!(args, "{\"a\": 1}");
            }
            _ => panic!("expected tool command"),
        }

        match parse_command("/workspace task 1234") {
            Some(Command::Workspace(rest)) => assert_eq!(rest, "task 1234"),
            _ => panic!("expected workspace command"),
        }

        assert!(matches!(
            parse_command("/frobnicate"),
            Some(Command::Unknown(_))
        ));
    }
}
