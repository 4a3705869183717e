//! Chat orchestrator: the conversation loop between a model and the tool
//! servers.
//!
//! One user message runs:
//! 1. **Model turn**: the model sees the full history and every encoded tool
//! 2. **Dispatch**: if it asked for tools, each call runs in order and its
//!    result (success or failure) is appended as a tool turn
//! 3. Back to 1 until the model answers with text only
//!
//! Tool failures never leave the loop; the model sees them and decides what
//! to do. Only a lost server ends the turn early, after the round's results
//! are recorded.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::inference::client::ChatModel;
use crate::inference::types::ToolDefinition;
use crate::mcp_client::{McpClient, McpError, ProviderTool, ToolRegistry};

use super::conversation::Conversation;
use super::errors::AgentError;
use super::tokens::estimate_tool_definitions_tokens;
use super::tool_router::ToolRouter;
use super::types::{AgentEvent, ChatState};

// ─── System Prompt ──────────────────────────────────────────────────────────

/// Identity and intro, the static portion of the system prompt.
///
/// The capabilities section (dynamic, from the tool catalog) is inserted
/// between this intro and the rules below.
const SYSTEM_PROMPT_INTRO: &str = "\
You are an industrial automation assistant. You read from and write to field \
devices (PLCs, RTUs, controllers, brokers) through protocol tool servers.";

const SYSTEM_PROMPT_RULES: &str = "\
IMPORTANT: Always use the fully-qualified tool name with the server prefix \
(e.g., modbus.read_holding_registers, NOT read_holding_registers).\n\n\
Rules:\n\
1. Only report values you actually received from a tool call. Never guess \
register contents, tag values, or device state.\n\
2. For READ operations: call the tool immediately, no need to ask.\n\
3. WRITE operations change physical equipment. Repeat the exact target \
(address, tag, value) in your answer after writing.\n\
4. If a tool returns \"success\": false, explain the error to the user. Retry \
only if the error suggests a different argument would work.\n\
5. Be concise: give the values, units, and addresses the user asked for.";

/// Build the system prompt with the capability summary from the catalog.
pub fn build_system_prompt(registry: &ToolRegistry) -> String {
    let capabilities = registry.capability_summary();
    format!("{SYSTEM_PROMPT_INTRO}\n\n{capabilities}\n\n{SYSTEM_PROMPT_RULES}")
}

/// Model-facing definition of a catalog tool, named by its encoded id.
pub fn tool_definition(tool: &ProviderTool) -> ToolDefinition {
    ToolDefinition::function(
        &tool.encoded_name(),
        &tool.tool.description,
        tool.tool.params_schema.clone(),
    )
}

// ─── ChatOrchestrator ───────────────────────────────────────────────────────

/// Drives one chat session.
pub struct ChatOrchestrator<M: ChatModel> {
    model: M,
    router: ToolRouter,
    conversation: Conversation,
    state: ChatState,
    /// Tool definitions sent with every model turn; `None` until the first
    /// refresh.
    tools: Option<Vec<ToolDefinition>>,
    /// Only list tools from these servers.
    server_filter: Option<Vec<String>>,
    max_tool_rounds: Option<u32>,
    /// Replaces the built-in intro and rules when set.
    custom_prompt: Option<String>,
    events: Option<mpsc::UnboundedSender<AgentEvent>>,
}

impl<M: ChatModel> ChatOrchestrator<M> {
    pub fn new(model: M, client: Arc<McpClient>) -> Self {
        let mut conversation = Conversation::new(build_system_prompt(&ToolRegistry::new()));
        if let Some(window) = model.context_window() {
            conversation.set_context_window(window);
        }
        Self {
            model,
            router: ToolRouter::new(client),
            conversation,
            state: ChatState::AwaitingInput,
            tools: None,
            server_filter: None,
            max_tool_rounds: None,
            custom_prompt: None,
            events: None,
        }
    }

    /// Stop after this many dispatch rounds per user message.
    pub fn with_max_tool_rounds(mut self, rounds: Option<u32>) -> Self {
        self.max_tool_rounds = rounds;
        self
    }

    /// Restrict the tools offered to the model to these servers.
    pub fn with_server_filter(mut self, servers: Option<Vec<String>>) -> Self {
        self.server_filter = servers;
        self
    }

    /// Cap the characters of each tool result shown to the model.
    pub fn with_max_result_chars(mut self, max: Option<usize>) -> Self {
        if let Some(max) = max {
            self.router = self.router.with_max_result_chars(max);
        }
        self
    }

    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.custom_prompt = prompt;
        self
    }

    /// Send progress events to `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<AgentEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn state(&self) -> ChatState {
        self.state
    }

    /// The registry tool calls are routed to.
    pub fn client(&self) -> &Arc<McpClient> {
        self.router.client()
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Number of tools currently offered to the model.
    pub fn tool_count(&self) -> usize {
        self.tools.as_ref().map_or(0, Vec::len)
    }

    // ─── Tools ──────────────────────────────────────────────────────────

    /// Re-list tools from every (filtered) server and rebuild the system
    /// prompt. Returns the servers that failed to list.
    pub async fn refresh_tools(&mut self) -> Vec<(String, McpError)> {
        let listing = self
            .router
            .client()
            .get_all_tools(self.server_filter.as_deref())
            .await;

        for (server, err) in &listing.failures {
            tracing::warn!(server = %server, error = %err, "server unavailable, its tools are hidden");
        }

        let mut by_server: BTreeMap<String, Vec<_>> = BTreeMap::new();
        for tool in &listing.tools {
            by_server
                .entry(tool.server.clone())
                .or_default()
                .push(tool.tool.clone());
        }
        let mut registry = ToolRegistry::new();
        for (server, tools) in by_server {
            registry.register_server_tools(&server, tools);
        }

        let definitions: Vec<ToolDefinition> = listing.tools.iter().map(tool_definition).collect();
        self.conversation
            .set_tool_definitions_budget(estimate_tool_definitions_tokens(&definitions));

        let prompt = match &self.custom_prompt {
            Some(custom) => format!("{custom}\n\n{}", registry.capability_summary()),
            None => build_system_prompt(&registry),
        };
        self.conversation.set_system_prompt(prompt);

        tracing::info!(
            tools = definitions.len(),
            servers = registry.server_names().len(),
            failed = listing.failures.len(),
            "tool catalog refreshed"
        );
        self.tools = Some(definitions);
        listing.failures
    }

    // ─── Chat Loop ──────────────────────────────────────────────────────

    /// Process one user message and return the model's final answer.
    ///
    /// Cancelling the returned future is "stop waiting": call
    /// [`recover_after_cancel`](Self::recover_after_cancel) before the next
    /// message so the history stays well-formed.
    pub async fn send_message(&mut self, input: &str) -> Result<String, AgentError> {
        if self.tools.is_none() {
            self.refresh_tools().await;
        }
        self.conversation.push_user(input);

        let result = self.run_rounds().await;
        self.state = ChatState::AwaitingInput;
        result
    }

    async fn run_rounds(&mut self) -> Result<String, AgentError> {
        let mut round: u32 = 0;

        loop {
            self.state = ChatState::ModelTurn { round };
            self.emit(AgentEvent::ModelTurnStarted { round });

            // A fallback may have switched to a model with another window.
            if let Some(window) = self.model.context_window() {
                self.conversation.set_context_window(window);
            }
            let messages = self.conversation.build_chat_messages();
            let tools = self.tools.as_deref().unwrap_or_default();
            let turn = self.model.complete(&messages, tools).await?;

            if !turn.has_tool_calls() {
                let answer = turn.content.unwrap_or_default();
                self.conversation.push_assistant(Some(answer.clone()), &[]);
                tracing::info!(rounds = round, model = %self.model.model_name(), "final answer");
                self.emit(AgentEvent::FinalAnswer {
                    content: answer.clone(),
                });
                return Ok(answer);
            }

            self.conversation
                .push_assistant(turn.content.clone(), &turn.tool_calls);

            if let Some(limit) = self.max_tool_rounds {
                if round >= limit {
                    tracing::warn!(rounds = limit, "tool round limit reached");
                    self.conversation
                        .close_dangling_tool_calls("tool round limit reached");
                    self.emit(AgentEvent::RoundLimitReached { rounds: limit });
                    return Err(AgentError::RoundLimitReached { rounds: limit });
                }
            }

            self.state = ChatState::Dispatching {
                round,
                calls: turn.tool_calls.len(),
            };
            tracing::info!(
                round,
                calls = turn.tool_calls.len(),
                tools = ?turn.tool_calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                "dispatching tool calls"
            );

            let outcomes = self
                .router
                .dispatch_tool_calls(&turn.tool_calls, self.events.as_ref())
                .await;

            let mut fatal = None;
            for outcome in outcomes {
                self.conversation
                    .push_tool_result(&outcome.call_id, outcome.content);
                if fatal.is_none() {
                    fatal = outcome.fatal;
                }
            }
            if let Some(source) = fatal {
                tracing::error!(error = %source, "tool server lost, ending turn");
                return Err(AgentError::ProviderLost { source });
            }

            round += 1;
        }
    }

    /// Bring the session back to `AwaitingInput` after a cancelled turn.
    ///
    /// Returns the number of unanswered tool calls that were closed off.
    pub fn recover_after_cancel(&mut self) -> usize {
        self.state = ChatState::AwaitingInput;
        self.conversation.repair_dangling_tool_calls()
    }

    /// Forget the conversation, keeping the system prompt and tool list.
    pub fn reset(&mut self) {
        self.conversation.clear();
        self.state = ChatState::AwaitingInput;
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
