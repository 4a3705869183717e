//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types, MCP protocol structures and the server
//! configuration file format.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message. A request without an `id` is a
/// notification.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id: Some(id),
        }
    }

    /// Create a notification (no `id`, no response expected).
    pub fn notification(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id: None,
        }
    }
}

/// Any JSON-RPC message read from a server's stdout.
///
/// Parsed leniently: servers emit responses (`id` + `result`/`error`),
/// notifications (`method`, no `id`) and occasionally requests of their own.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcMessage {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcMessage {
    /// The numeric response id, if this message carries one.
    ///
    /// Some servers echo ids back as strings; both forms are accepted.
    pub fn response_id(&self) -> Option<u64> {
        match self.id.as_ref()? {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JsonRpcError {
    #[serde(default = "default_error_code")]
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

fn default_error_code() -> i32 {
    error_codes::INTERNAL_ERROR
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// MCP tool definition as returned by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(
        default = "empty_object_schema",
        rename = "inputSchema",
        alias = "params_schema"
    )]
    pub params_schema: serde_json::Value,
}

fn empty_object_schema() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// A tool tagged with the server that owns it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderTool {
    pub server: String,
    #[serde(flatten)]
    pub tool: McpToolDefinition,
}

impl ProviderTool {
    /// Flat identifier for this tool, as exposed to the model.
    pub fn encoded_name(&self) -> String {
        super::codec::encode(&self.server, &self.tool.name)
    }
}

/// MCP `initialize` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// MCP `tools/list` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<McpToolDefinition>,
}

/// Protocol version sent in the `initialize` request.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

// ─── Configuration ───────────────────────────────────────────────────────────

/// Server configuration from `mcp-servers.json`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Per-server working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Optional Python virtual environment path. When set, `command` is resolved
    /// to `{venv}/bin/{command}` and `VIRTUAL_ENV` + `PATH` are injected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venv: Option<String>,
    /// Disabled servers are kept in the table but never started or listed.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ServerConfig {
    /// Minimal config for a command with arguments.
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: HashMap::new(),
            cwd: None,
            venv: None,
            enabled: true,
        }
    }

    /// Resolve a relative `cwd` against `base_dir`, then the `venv`.
    ///
    /// With a venv, `command` is rewritten to the venv's binary when that
    /// binary exists, and `VIRTUAL_ENV` and `PATH` are injected. Resolving an
    /// already resolved config changes nothing.
    pub fn resolve_paths(&mut self, base_dir: &Path) {
        if let Some(ref cwd) = self.cwd {
            if !Path::new(cwd).is_absolute() {
                self.cwd = Some(base_dir.join(cwd).to_string_lossy().into_owned());
            }
        }

        let Some(ref venv) = self.venv else {
            return;
        };
        let venv_base = self
            .cwd
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| base_dir.to_path_buf());
        let abs_venv = if Path::new(venv).is_absolute() {
            PathBuf::from(venv)
        } else {
            venv_base.join(venv)
        };
        // Windows venvs use Scripts\ instead of bin/
        let venv_bin = if cfg!(target_os = "windows") {
            abs_venv.join("Scripts")
        } else {
            abs_venv.join("bin")
        };
        self.venv = Some(abs_venv.to_string_lossy().into_owned());
        if Path::new(&self.command).starts_with(&venv_bin) {
            return;
        }

        let venv_command = venv_bin.join(&self.command);
        if venv_command.exists() {
            self.command = venv_command.to_string_lossy().into_owned();
            self.env.insert(
                "VIRTUAL_ENV".to_string(),
                abs_venv.to_string_lossy().into_owned(),
            );
            let system_path = std::env::var("PATH").unwrap_or_default();
            let sep = if cfg!(target_os = "windows") { ";" } else { ":" };
            self.env.insert(
                "PATH".to_string(),
                format!("{}{sep}{system_path}", venv_bin.to_string_lossy()),
            );
            tracing::debug!(
                venv = %abs_venv.display(),
                command = %self.command,
                "resolved venv for server"
            );
        } else {
            tracing::warn!(
                venv = %abs_venv.display(),
                command = %self.command,
                "venv binary not found, using command as-is"
            );
        }
    }
}

/// Top-level MCP servers configuration file.
///
/// Accepts both `{"servers": {...}}` and the common `{"mcpServers": {...}}`
/// layout.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct McpServersConfig {
    #[serde(default, alias = "mcpServers")]
    pub servers: HashMap<String, ServerConfig>,
}

// ─── Results and Status ──────────────────────────────────────────────────────

/// Result of a tool call execution.
///
/// Failures reported by the server (JSON-RPC error, `isError`, or a
/// `{"success": false}` result envelope) are represented here rather than
/// as an `Err`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallResult {
    pub server: String,
    pub tool_name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

/// Lifecycle state of one server connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error(_) => "error",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

// ─── Standard MCP Error Codes ────────────────────────────────────────────────

/// Well-known JSON-RPC / MCP error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Tool reported a failure through `isError` or a result envelope.
    pub const TOOL_EXECUTION_ERROR: i32 = -32000;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_json_rpc_request_serialization() {
        let req = JsonRpcRequest::new(1, "initialize", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"method\":\"initialize\""));
        // params should be omitted when None
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_notification_has_no_id() {
        let req = JsonRpcRequest::notification("notifications/initialized", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("\"id\""));
    }

    #[test]
    fn test_json_rpc_request_with_params() {
        let params =
            serde_json::json!({"name": "read_registers", "arguments": {"address": 40001}});
        let req = JsonRpcRequest::new(42, "tools/call", Some(params));
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"id\":42"));
        assert!(json.contains("tools/call"));
        assert!(json.contains("40001"));
    }

    #[test]
    fn test_response_message_ids() {
        let msg: JsonRpcMessage =
            serde_json::from_str(r#"{"jsonrpc": "2.0", "id": 1, "result": {"tools": []}}"#)
                .unwrap();
        assert_eq!(msg.response_id(), Some(1));
        assert!(msg.result.is_some());

        let msg: JsonRpcMessage = serde_json::from_str(r#"{"id": "7", "result": {}}"#).unwrap();
        assert_eq!(msg.response_id(), Some(7));

        let msg: JsonRpcMessage =
            serde_json::from_str(r#"{"jsonrpc": "2.0", "method": "notifications/message"}"#)
                .unwrap();
        assert_eq!(msg.response_id(), None);
    }

    #[test]
    fn test_error_without_code_defaults_to_internal() {
        let msg: JsonRpcMessage =
            serde_json::from_str(r#"{"id": 2, "error": {"message": "boom"}}"#).unwrap();
        let err = msg.error.unwrap();
        assert_eq!(err.code, error_codes::INTERNAL_ERROR);
        assert_eq!(err.message, "boom");
    }

    #[test]
    fn test_tool_definition_defaults() {
        let json = r#"{"name": "read_coils"}"#;
        let tool: McpToolDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(tool.description, "");
        assert_eq!(tool.params_schema["type"], "object");
    }

    #[test]
    fn test_tool_definition_reads_input_schema() {
        let json = r#"{"name": "x", "description": "d", "inputSchema": {"type": "object", "required": ["a"]}}"#;
        let tool: McpToolDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(tool.params_schema["required"][0], "a");
    }

    #[test]
    fn test_servers_config_accepts_mcp_servers_key() {
        let json = r#"{"mcpServers": {"modbus": {"command": "python3", "args": ["-m", "modbus_mcp.cli"]}}}"#;
        let cfg: McpServersConfig = serde_json::from_str(json).unwrap();
        let modbus = &cfg.servers["modbus"];
        assert!(modbus.enabled);
        assert_eq!(modbus.args.len(), 2);
    }

    #[test]
    fn test_provider_tool_flattens_definition() {
        let pt = ProviderTool {
            server: "s7".into(),
            tool: McpToolDefinition {
                name: "read_db".into(),
                description: "Read a data block".into(),
                params_schema: empty_object_schema(),
            },
        };
        let v = serde_json::to_value(&pt).unwrap();
        assert_eq!(v["server"], "s7");
        assert_eq!(v["name"], "read_db");
        assert!(v.get("inputSchema").is_some());
        assert_eq!(pt.encoded_name(), "s7.read_db");
    }

    #[test]
    fn test_resolve_relative_cwd_and_venv() {
        let dir = TempDir::new().unwrap();
        let bin = dir.path().join("modbus-python/.venv/bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("python3"), "").unwrap();

        let mut config = ServerConfig::new("python3", vec!["-m".into(), "modbus_mcp.cli".into()]);
        config.cwd = Some("modbus-python".into());
        config.venv = Some(".venv".into());
        config.resolve_paths(dir.path());

        let project = dir.path().join("modbus-python");
        assert_eq!(config.cwd.as_deref(), Some(project.to_str().unwrap()));
        if !cfg!(target_os = "windows") {
            assert_eq!(config.command, bin.join("python3").to_string_lossy());
            assert!(config.env["PATH"].starts_with(bin.to_str().unwrap()));
            assert!(config.env.contains_key("VIRTUAL_ENV"));

            let once = config.clone();
            config.resolve_paths(dir.path());
            assert_eq!(config, once);
        }
    }

    #[test]
    fn test_missing_venv_binary_keeps_command() {
        let dir = TempDir::new().unwrap();
        let mut config = ServerConfig::new("python3", vec![]);
        config.venv = Some("/nonexistent/venv".into());
        config.resolve_paths(dir.path());
        assert_eq!(config.command, "python3");
        assert!(!config.env.contains_key("VIRTUAL_ENV"));
    }
}
