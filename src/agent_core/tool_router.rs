//! ToolRouter: dispatches model tool calls to MCP servers.
//!
//! The ToolRouter is the bridge between the model's tool call decisions and
//! the protocol servers. It handles:
//! - Decoding the encoded tool name and parsing the raw arguments
//! - Execution via McpClient (validation happens there, before dispatch)
//! - Turning every outcome, success or failure, into result text for the model
//! - Flagging fatal transport loss so the chat loop can stop after the round
//!
//! Calls are not retried: a failure goes back to the model, which decides
//! whether to try again.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::inference::types::ToolCall;
use crate::mcp_client::client::content_text;
use crate::mcp_client::errors::McpError;
use crate::mcp_client::McpClient;

use super::tokens::truncate_utf8;
use super::types::{AgentEvent, PendingInvocation};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Maximum characters of a single tool result fed back to the model.
///
/// Keeps one large register dump from consuming the context window.
const MAX_TOOL_RESULT_CHARS: usize = 6_000;

// ─── Dispatch Outcome ───────────────────────────────────────────────────────

/// Result of one dispatched tool call.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub call_id: String,
    /// Encoded tool name as the model wrote it.
    pub tool_name: String,
    pub success: bool,
    /// Text recorded as the tool result turn.
    pub content: String,
    pub execution_time_ms: u64,
    /// Set when the server is gone for good (`ConnectionLost`,
    /// `RestartExhausted`).
    pub fatal: Option<McpError>,
}

// ─── ToolRouter ─────────────────────────────────────────────────────────────

/// Dispatches tool calls from the model to MCP servers.
pub struct ToolRouter {
    client: Arc<McpClient>,
    max_result_chars: usize,
}

impl ToolRouter {
    pub fn new(client: Arc<McpClient>) -> Self {
        Self {
            client,
            max_result_chars: MAX_TOOL_RESULT_CHARS,
        }
    }

    /// Override the result size cap.
    pub fn with_max_result_chars(mut self, max: usize) -> Self {
        self.max_result_chars = max;
        self
    }

    pub fn client(&self) -> &Arc<McpClient> {
        &self.client
    }

    // ─── Dispatch ───────────────────────────────────────────────────────

    /// Dispatch a batch of tool calls from the model.
    ///
    /// Processes tool calls sequentially (the model expects ordered results).
    /// Returns one outcome per call, in call order, even when a server is
    /// lost partway through.
    pub async fn dispatch_tool_calls(
        &self,
        tool_calls: &[ToolCall],
        events: Option<&mpsc::UnboundedSender<AgentEvent>>,
    ) -> Vec<DispatchOutcome> {
        let mut results = Vec::with_capacity(tool_calls.len());

        for tc in tool_calls {
            let pending = PendingInvocation::from_call(tc);
            emit(
                events,
                AgentEvent::ToolCallStarted {
                    call_id: pending.call_id.clone(),
                    tool_name: pending.encoded_name.clone(),
                    arguments: pending.arguments.clone(),
                },
            );

            let outcome = self.dispatch_single(tc, pending).await;

            emit(
                events,
                AgentEvent::ToolCallFinished {
                    call_id: outcome.call_id.clone(),
                    tool_name: outcome.tool_name.clone(),
                    success: outcome.success,
                    execution_time_ms: outcome.execution_time_ms,
                },
            );
            results.push(outcome);
        }

        results
    }

    /// Dispatch a single tool call: decode → execute → render result.
    pub async fn dispatch_single(
        &self,
        tool_call: &ToolCall,
        pending: PendingInvocation,
    ) -> DispatchOutcome {
        let start = Instant::now();

        if !tool_call.arguments.trim().is_empty()
            && serde_json::from_str::<serde_json::Value>(&tool_call.arguments).is_err()
        {
            tracing::warn!(
                tool = %tool_call.name,
                raw = %truncate_utf8(&tool_call.arguments, 200),
                "malformed tool arguments, dispatching with {{}}"
            );
        }

        let outcome = self
            .client
            .call_encoded(&pending.encoded_name, pending.arguments)
            .await;
        let elapsed = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) if result.success => DispatchOutcome {
                call_id: pending.call_id,
                tool_name: pending.encoded_name,
                success: true,
                content: self.truncate_result(
                    &extract_mcp_result_text(&result.result),
                    &tool_call.name,
                ),
                execution_time_ms: elapsed,
                fatal: None,
            },
            Ok(result) => {
                let error = result.error.unwrap_or_else(|| "tool reported failure".to_string());
                tracing::info!(tool = %tool_call.name, error = %error, "tool returned failure");
                DispatchOutcome {
                    call_id: pending.call_id,
                    tool_name: pending.encoded_name,
                    success: false,
                    content: failure_text("capability_execution_error", &error),
                    execution_time_ms: elapsed,
                    fatal: None,
                }
            }
            Err(e) => {
                tracing::warn!(tool = %tool_call.name, error = %e, kind = e.kind(), "tool call error");
                DispatchOutcome {
                    call_id: pending.call_id,
                    tool_name: pending.encoded_name,
                    success: false,
                    content: failure_text(e.kind(), &e.to_string()),
                    execution_time_ms: elapsed,
                    fatal: e.is_fatal_transport().then_some(e),
                }
            }
        }
    }

    /// Truncate a tool result if it exceeds the configured cap.
    ///
    /// Preserves the beginning of the result and appends a truncation notice.
    fn truncate_result(&self, result: &str, tool_name: &str) -> String {
        if result.len() <= self.max_result_chars {
            return result.to_string();
        }

        let truncated = truncate_utf8(result, self.max_result_chars);
        tracing::warn!(
            tool = %tool_name,
            original_len = result.len(),
            truncated_to = truncated.len(),
            "tool result truncated"
        );
        format!(
            "{truncated}\n\n[... truncated: showing first {} of {} chars]",
            truncated.len(),
            result.len()
        )
    }
}

// ─── Free Functions ─────────────────────────────────────────────────────────

fn emit(events: Option<&mpsc::UnboundedSender<AgentEvent>>, event: AgentEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

/// Result text for a failed call, in the same envelope shape the protocol
/// servers use.
fn failure_text(kind: &str, error: &str) -> String {
    serde_json::json!({
        "success": false,
        "error": error,
        "kind": kind,
    })
    .to_string()
}

/// Render an MCP `tools/call` result as text for the model.
///
/// MCP results follow `{ "content": [{ "type": "text", "text": "..." }] }`.
/// The text is usually itself a JSON envelope from the server, which is
/// unwrapped by [`unwrap_tool_result_json`].
fn extract_mcp_result_text(result: &Option<serde_json::Value>) -> String {
    let Some(value) = result else {
        return "No result returned.".to_string();
    };

    if let Some(raw) = content_text(value) {
        return unwrap_tool_result_json(&raw);
    }
    if let Some(structured) = value.get("structuredContent") {
        return unwrap_tool_result_json(&structured.to_string());
    }

    match serde_json::to_string_pretty(value) {
        Ok(s) => s,
        Err(_) => format!("{value:?}"),
    }
}

/// If `raw` is a JSON result envelope, extract the useful part.
///
/// - `{"success": true, "data": ...}` yields the pretty-printed `data`
/// - objects with a primary text field (`text`, `content`, `message`,
///   `result`, `output`) yield that text
/// - anything else is returned unchanged
fn unwrap_tool_result_json(raw: &str) -> String {
    let Ok(parsed) = serde_json::from_str::<serde_json::Value>(raw) else {
        return raw.to_string(); // Not JSON, return as-is
    };
    let Some(obj) = parsed.as_object() else {
        return raw.to_string();
    };

    if obj.get("success").and_then(|s| s.as_bool()) == Some(true) {
        if let Some(data) = obj.get("data").filter(|d| !d.is_null()) {
            return match data {
                serde_json::Value::String(s) => s.clone(),
                other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
            };
        }
    }

    for key in ["text", "content", "message", "result", "output"] {
        if let Some(val) = obj.get(key).and_then(|v| v.as_str()) {
            if !val.is_empty() {
                return val.to_string();
            }
        }
    }

    raw.to_string()
}

// ─── Tests ──────────────────────────────────────────────────────────────────
