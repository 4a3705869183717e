//! Shared types for the agent core.
//!
//! Conversation turns, the chat state machine, pending tool invocations, and
//! the events the orchestrator emits while it works.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::inference::types::{ChatMessage, Role, ToolCall};
use crate::mcp_client::codec;

// ─── Conversation Turns ─────────────────────────────────────────────────────

/// A single turn in conversation history.
#[derive(Debug, Clone, Serialize)]
pub struct Turn {
    pub timestamp: DateTime<Utc>,
    /// Turn role: system, user, assistant, or tool.
    pub role: Role,
    /// Text content. For `tool` turns this is the result text fed back to the
    /// model.
    pub content: Option<String>,
    /// Tool calls requested by an assistant turn.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// For `tool` turns: the ID of the tool call this result answers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Turn {
    fn new(role: Role, content: Option<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, Some(content.into()))
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, Some(content.into()))
    }

    pub fn assistant(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::new(Role::Assistant, content)
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(Role::Tool, Some(content.into()))
        }
    }

    /// The wire form sent to the model.
    pub fn to_chat_message(&self) -> ChatMessage {
        match self.role {
            Role::Assistant => ChatMessage::assistant(self.content.clone(), &self.tool_calls),
            Role::Tool => ChatMessage::tool(
                self.tool_call_id.clone().unwrap_or_default(),
                self.content.clone().unwrap_or_default(),
            ),
            Role::System | Role::User => ChatMessage {
                role: self.role,
                content: self.content.clone(),
                tool_call_id: None,
                tool_calls: None,
            },
        }
    }
}

// ─── Chat State ─────────────────────────────────────────────────────────────

/// Where the chat loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ChatState {
    AwaitingInput,
    /// Waiting on the model. `round` counts completed dispatch rounds for
    /// the current user message.
    ModelTurn { round: u32 },
    /// Running the tool calls of one model turn.
    Dispatching { round: u32, calls: usize },
}

// ─── Pending Invocations ────────────────────────────────────────────────────

/// One outstanding tool call requested by the model.
#[derive(Debug, Clone, Serialize)]
pub struct PendingInvocation {
    /// Correlation id of the model's tool call.
    pub call_id: String,
    /// Encoded name as the model wrote it.
    pub encoded_name: String,
    /// Decoded server, `None` when the name doesn't decode.
    pub server: Option<String>,
    pub tool: String,
    /// Parsed arguments; malformed payloads become `{}`.
    pub arguments: serde_json::Value,
    pub requested_at: DateTime<Utc>,
}

impl PendingInvocation {
    pub fn from_call(call: &ToolCall) -> Self {
        let (server, tool) = match codec::decode(&call.name) {
            Some((server, tool)) => (Some(server.to_string()), tool.to_string()),
            None => (None, call.name.clone()),
        };
        Self {
            call_id: call.id.clone(),
            encoded_name: call.name.clone(),
            server,
            tool,
            arguments: call.parsed_arguments(),
            requested_at: Utc::now(),
        }
    }
}

// ─── Events ─────────────────────────────────────────────────────────────────

/// Progress events emitted by the orchestrator.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    ModelTurnStarted {
        round: u32,
    },
    ToolCallStarted {
        call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        success: bool,
        execution_time_ms: u64,
    },
    FinalAnswer {
        content: String,
    },
    RoundLimitReached {
        rounds: u32,
    },
}

// ─── Tests ──────────────────────────────────────────────────────────────────
