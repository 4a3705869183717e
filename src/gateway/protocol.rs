//! Gateway wire protocol.
//!
//! One JSON object per WebSocket text frame, tagged by `type`. Field names
//! are camelCase for the browser client.

use serde::{Deserialize, Serialize};

use crate::mcp_client::{McpToolDefinition, ServerConfig};

/// Messages from the browser.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    SpawnServer {
        server_id: String,
        #[serde(default)]
        server_name: Option<String>,
        config: ServerConfig,
    },
    #[serde(rename_all = "camelCase")]
    ListTools { server_id: String },
    #[serde(rename_all = "camelCase")]
    CallTool {
        server_id: String,
        tool_name: String,
        #[serde(default = "empty_arguments")]
        arguments: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    DisconnectServer { server_id: String },
    /// Stop the server, clear its restart budget and start it again.
    #[serde(rename_all = "camelCase")]
    RestartServer { server_id: String },
}

fn empty_arguments() -> serde_json::Value {
    serde_json::json!({})
}

/// Messages to the browser.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    ServerSpawned {
        server_id: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ToolsListed {
        server_id: String,
        tools: Vec<McpToolDefinition>,
    },
    /// Correlated by (serverId, toolName) only; the browser cannot tell two
    /// in-flight calls of the same tool apart.
    #[serde(rename_all = "camelCase")]
    ToolResult {
        server_id: String,
        tool_name: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ServerDisconnected { server_id: String },
    #[serde(rename_all = "camelCase")]
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        server_id: Option<String>,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>, server_id: Option<&str>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            server_id: server_id.map(str::to_string),
        }
    }
}
