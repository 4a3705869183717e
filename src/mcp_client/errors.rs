//! MCP client error types.

use thiserror::Error;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Clone, Error)]
pub enum McpError {
    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The initialization handshake failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed { name: String, reason: String },

    /// I/O failure while writing to or reading from a server.
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// The server's stdio stream closed (process exit or crash) while the
    /// request was outstanding, or before it could be sent.
    #[error("connection to server '{server}' lost: {reason}")]
    ConnectionLost { server: String, reason: String },

    /// A message from the server could not be understood.
    #[error("protocol error from server '{server}': {reason}")]
    Protocol { server: String, reason: String },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// No server registered under this name.
    #[error("unknown server: '{name}'")]
    UnknownProvider { name: String },

    /// The server does not list a tool with this name. `server` is empty
    /// when the name could not be decoded into a server and a tool.
    #[error("unknown tool '{name}'{}{}", format_server(.server), format_suggestions(.suggestions))]
    UnknownTool {
        server: String,
        name: String,
        suggestions: Vec<String>,
    },

    /// Tool call arguments failed schema validation.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// A request did not complete in time.
    #[error("'{method}' on server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// The server is not running and the start policy forbids starting it
    /// on demand.
    #[error("server '{name}' is not started")]
    NotStarted { name: String },

    /// Server names must be non-empty and drawn from `[A-Za-z0-9_-]`.
    #[error("invalid server name '{name}': {reason}")]
    InvalidProviderName { name: String, reason: String },

    /// Configuration error (missing servers, bad config file).
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    /// All restart attempts exhausted for a server.
    #[error("server '{name}' failed after {attempts} restart attempts")]
    RestartExhausted { name: String, attempts: u32 },
}

impl McpError {
    /// Whether this error means the server itself is gone, as opposed to a
    /// single call failing. The chat loop stops on these.
    pub fn is_fatal_transport(&self) -> bool {
        matches!(
            self,
            McpError::ConnectionLost { .. } | McpError::RestartExhausted { .. }
        )
    }

    /// Short machine-readable category, used in structured CLI output and
    /// gateway error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            McpError::SpawnFailed { .. }
            | McpError::InitFailed { .. }
            | McpError::ConnectionLost { .. }
            | McpError::RestartExhausted { .. }
            | McpError::NotStarted { .. } => "connection_error",
            McpError::TransportError { .. } => "transport_error",
            McpError::Protocol { .. } => "protocol_error",
            McpError::ServerError { .. } => "capability_execution_error",
            McpError::UnknownProvider { .. } => "provider_not_found",
            McpError::UnknownTool { .. } => "capability_not_found",
            McpError::InvalidArguments { .. } => "validation_error",
            McpError::Timeout { .. } => "timeout",
            McpError::InvalidProviderName { .. } | McpError::ConfigError { .. } => {
                "config_error"
            }
        }
    }
}

fn format_server(server: &str) -> String {
    if server.is_empty() {
        String::new()
    } else {
        format!(" on server '{server}'")
    }
}

fn format_suggestions(suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        String::new()
    } else {
        format!(" (did you mean: {}?)", suggestions.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_tool_message_lists_suggestions() {
        let err = McpError::UnknownTool {
            server: "modbus".into(),
            name: "read_register".into(),
            suggestions: vec!["read_registers".into(), "read_coils".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("'read_register'"));
        assert!(msg.contains("did you mean: read_registers, read_coils?"));
    }

    #[test]
    fn test_unknown_tool_message_without_suggestions() {
        let err = McpError::UnknownTool {
            server: "modbus".into(),
            name: "zzz".into(),
            suggestions: vec![],
        };
        assert_eq!(err.to_string(), "unknown tool 'zzz' on server 'modbus'");
    }

    #[test]
    fn test_unknown_tool_without_server() {
        let err = McpError::UnknownTool {
            server: String::new(),
            name: "ping".into(),
            suggestions: vec!["modbus.ping".into()],
        };
        assert_eq!(
            err.to_string(),
            "unknown tool 'ping' (did you mean: modbus.ping?)"
        );
        assert_eq!(err.kind(), "capability_not_found");
    }

    #[test]
    fn test_fatal_transport_classification() {
        let lost = McpError::ConnectionLost {
            server: "s7".into(),
            reason: "eof".into(),
        };
        assert!(lost.is_fatal_transport());
        assert_eq!(lost.kind(), "connection_error");

        let timeout = McpError::Timeout {
            server: "s7".into(),
            method: "tools/call".into(),
            timeout_ms: 10,
        };
        assert!(!timeout.is_fatal_transport());
        assert_eq!(timeout.kind(), "timeout");
    }
}
