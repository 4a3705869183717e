//! Conversation: in-memory chat history with context window management.
//!
//! Responsibilities:
//! - Hold the ordered turns of one chat session (system prompt first)
//! - Build `Vec<ChatMessage>` for the inference client, dropping the oldest
//!   exchanges when the estimated size exceeds the context budget
//! - Repair history after a cancelled turn so every tool call has a result
//!
//! History lives for the session only; nothing is persisted.

use std::collections::HashSet;

use crate::inference::types::{ChatMessage, Role, ToolCall};

use super::tokens::estimate_message_tokens;
use super::types::Turn;

// ─── Constants ──────────────────────────────────────────────────────────────

/// Default total context window size (tokens).
const DEFAULT_CONTEXT_WINDOW: u32 = 32_768;

/// Tokens reserved for the model's output response.
const OUTPUT_RESERVATION: u32 = 2_000;

/// Error recorded for tool calls that never completed.
const CANCELLED_ERROR: &str = "cancelled before completion";

// ─── Conversation ───────────────────────────────────────────────────────────

/// Ordered conversation turns. Index 0 is always the system prompt.
#[derive(Debug, Clone)]
pub struct Conversation {
    turns: Vec<Turn>,
    context_window: u32,
    /// Tokens consumed by the tool definitions sent with each request.
    tool_definitions_budget: u32,
}

impl Conversation {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            turns: vec![Turn::system(system_prompt)],
            context_window: DEFAULT_CONTEXT_WINDOW,
            tool_definitions_budget: 0,
        }
    }

    /// Override the context window size (e.g., from model config).
    pub fn set_context_window(&mut self, size: u32) {
        self.context_window = size;
    }

    /// Set the measured token cost of the tool definitions.
    pub fn set_tool_definitions_budget(&mut self, tokens: u32) {
        self.tool_definitions_budget = tokens;
    }

    pub fn system_prompt(&self) -> &str {
        self.turns[0].content.as_deref().unwrap_or_default()
    }

    /// Replace the system prompt in place.
    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.turns[0] = Turn::system(prompt);
    }

    // ─── Appending ──────────────────────────────────────────────────────

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.turns.push(Turn::user(content));
    }

    pub fn push_assistant(&mut self, content: Option<String>, tool_calls: &[ToolCall]) {
        self.turns.push(Turn::assistant(content, tool_calls.to_vec()));
    }

    pub fn push_tool_result(&mut self, tool_call_id: &str, content: impl Into<String>) {
        self.turns.push(Turn::tool_result(tool_call_id, content));
    }

    // ─── Reading ────────────────────────────────────────────────────────

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Whether nothing but the system prompt has been recorded.
    pub fn is_empty(&self) -> bool {
        self.turns.len() <= 1
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// Drop everything except the system prompt.
    pub fn clear(&mut self) {
        self.turns.truncate(1);
    }

    /// Token budget available for history (system prompt included).
    fn history_budget(&self) -> u32 {
        self.context_window
            .saturating_sub(OUTPUT_RESERVATION)
            .saturating_sub(self.tool_definitions_budget)
    }

    /// Build the `Vec<ChatMessage>` to send to the inference client.
    ///
    /// Always includes the system prompt and the most recent exchange (a user
    /// turn and everything after it). Older exchanges are dropped whole, oldest
    /// first, until the estimate fits the budget, so an assistant tool call is
    /// never separated from its results.
    pub fn build_chat_messages(&self) -> Vec<ChatMessage> {
        let messages: Vec<ChatMessage> = self.turns.iter().map(Turn::to_chat_message).collect();
        let budget = self.history_budget();
        let mut total: u32 = messages.iter().map(estimate_message_tokens).sum();

        let mut start = 1;
        while total > budget {
            let next_user = self
                .turns
                .iter()
                .enumerate()
                .skip(start + 1)
                .find(|(_, t)| t.role == Role::User)
                .map(|(i, _)| i);
            let Some(next) = next_user else { break };
            total -= messages[start..next]
                .iter()
                .map(estimate_message_tokens)
                .sum::<u32>();
            start = next;
        }

        if start > 1 {
            tracing::debug!(
                dropped_turns = start - 1,
                estimated_tokens = total,
                budget,
                "trimmed conversation history to fit context window"
            );
        }

        let mut out = Vec::with_capacity(messages.len() - start + 1);
        out.push(messages[0].clone());
        out.extend_from_slice(&messages[start..]);
        out
    }

    /// Add a "cancelled" failure result for every tool call of the last
    /// assistant turn that has no result yet.
    ///
    /// Used after a turn is cancelled mid-dispatch; OpenAI-compatible
    /// endpoints reject histories with unanswered tool calls. Returns the
    /// number of results added.
    pub fn repair_dangling_tool_calls(&mut self) -> usize {
        self.close_dangling_tool_calls(CANCELLED_ERROR)
    }

    /// Answer every unanswered call of the last assistant turn with a
    /// `{"success": false, "error": error}` result.
    pub fn close_dangling_tool_calls(&mut self, error: &str) -> usize {
        let Some(idx) = self
            .turns
            .iter()
            .rposition(|t| t.role == Role::Assistant && !t.tool_calls.is_empty())
        else {
            return 0;
        };

        let answered: HashSet<&str> = self.turns[idx + 1..]
            .iter()
            .filter(|t| t.role == Role::Tool)
            .filter_map(|t| t.tool_call_id.as_deref())
            .collect();
        let missing: Vec<String> = self.turns[idx]
            .tool_calls
            .iter()
            .filter(|c| !answered.contains(c.id.as_str()))
            .map(|c| c.id.clone())
            .collect();

        let content = serde_json::json!({"success": false, "error": error}).to_string();
        for id in &missing {
            self.push_tool_result(id, content.clone());
        }
        if !missing.is_empty() {
            tracing::info!(count = missing.len(), reason = error, "closed unanswered tool calls");
        }
        missing.len()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
