//! MCP Client: the server registry.
//!
//! Owns every [`ServerConnection`], starts servers on demand, aggregates
//! their tool lists into one catalog and routes tool calls to the owning
//! server. This is the primary API used by the chat orchestrator, the
//! gateway and the CLI.
//!
//! All methods take `&self`; share one instance with `Arc<McpClient>`. No
//! lock is held across a server request, so calls on different servers (and
//! concurrent calls on one server) run in parallel.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::RwLock;

use super::codec;
use super::errors::McpError;
use super::lifecycle::{ServerConnection, DEFAULT_INIT_TIMEOUT};
use super::registry::{rank_similar, validate_arguments, ToolRegistry};
use super::types::{
    ConnectionStatus, McpServersConfig, McpToolDefinition, ProviderTool, ServerConfig,
    ToolCallResult,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default timeout for tool call execution (ms).
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;

/// Default time a server gets to exit after its stdin closes.
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Maximum "did you mean" suggestions for an unknown tool.
const MAX_SUGGESTIONS: usize = 3;

// ─── Types ───────────────────────────────────────────────────────────────────

/// Whether servers are started on first use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartPolicy {
    /// Start (or restart) a server when a listing or call needs it.
    #[default]
    Lazy,
    /// Only servers started through [`McpClient::start_server`] are used;
    /// others fail with `NotStarted`.
    Explicit,
}

/// Aggregated result of [`McpClient::get_all_tools`].
#[derive(Debug, Default)]
pub struct ToolListing {
    /// Tools from every server that answered, sorted by encoded name.
    pub tools: Vec<ProviderTool>,
    /// Servers that could not be listed, with the reason.
    pub failures: Vec<(String, McpError)>,
}

// ─── McpClient ───────────────────────────────────────────────────────────────

/// High-level MCP client that manages multiple servers and routes tool calls.
pub struct McpClient {
    servers: RwLock<HashMap<String, Arc<ServerConnection>>>,
    /// Tools from the most recent listing of each server.
    catalog: RwLock<ToolRegistry>,
    call_timeout: Duration,
    shutdown_grace: Duration,
    start_policy: StartPolicy,
}

impl McpClient {
    /// Create a client from a servers configuration.
    ///
    /// Disabled entries are skipped. Entries whose names cannot be encoded
    /// are logged and skipped.
    pub fn new(config: McpServersConfig) -> Self {
        let mut servers = HashMap::new();
        for (name, server_config) in config.servers {
            if !server_config.enabled {
                tracing::info!(server = %name, "server disabled in config, skipping");
                continue;
            }
            if let Err(e) = codec::validate_provider_name(&name) {
                tracing::warn!(server = %name, error = %e, "skipping server");
                continue;
            }
            let conn = ServerConnection::new(&name, server_config, DEFAULT_INIT_TIMEOUT);
            servers.insert(name, Arc::new(conn));
        }

        Self {
            servers: RwLock::new(servers),
            catalog: RwLock::new(ToolRegistry::new()),
            call_timeout: Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            start_policy: StartPolicy::Lazy,
        }
    }

    /// Set the tool call timeout in milliseconds.
    pub fn set_call_timeout(&mut self, timeout_ms: u64) {
        self.call_timeout = Duration::from_millis(timeout_ms);
    }

    /// Set how long a server may take to exit before it is killed.
    pub fn set_shutdown_grace(&mut self, grace: Duration) {
        self.shutdown_grace = grace;
    }

    pub fn set_start_policy(&mut self, policy: StartPolicy) {
        self.start_policy = policy;
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    // ─── Registration ────────────────────────────────────────────────────

    /// Register a server at runtime.
    ///
    /// A relative `cwd` and the `venv` are resolved against the current
    /// directory. If a server with this name already exists it is returned
    /// unchanged and `config` is ignored.
    pub async fn add_server(
        &self,
        name: &str,
        mut config: ServerConfig,
    ) -> Result<Arc<ServerConnection>, McpError> {
        codec::validate_provider_name(name)?;
        let base_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        config.resolve_paths(&base_dir);

        let mut servers = self.servers.write().await;
        if let Some(existing) = servers.get(name) {
            tracing::debug!(server = name, "server already registered, reusing");
            return Ok(existing.clone());
        }

        let conn = Arc::new(ServerConnection::new(name, config, DEFAULT_INIT_TIMEOUT));
        servers.insert(name.to_string(), conn.clone());
        tracing::info!(server = name, "server registered");
        Ok(conn)
    }

    /// Look up a server connection by name.
    pub async fn connection(&self, name: &str) -> Result<Arc<ServerConnection>, McpError> {
        self.servers
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| McpError::UnknownProvider {
                name: name.to_string(),
            })
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Start a server (if it is not running) and return its tools.
    pub async fn start_server(&self, name: &str) -> Result<Vec<McpToolDefinition>, McpError> {
        let conn = self.connection(name).await?;
        conn.start().await?;
        let tools = conn.cached_tools().await;
        self.catalog
            .write()
            .await
            .register_server_tools(name, tools.clone());
        Ok(tools)
    }

    /// Gracefully stop a server and drop its tools from the catalog.
    pub async fn stop_server(&self, name: &str) -> Result<(), McpError> {
        let conn = self.connection(name).await?;
        conn.shutdown(self.shutdown_grace).await;
        self.catalog.write().await.unregister_server(name);
        Ok(())
    }

    /// Stop, reset the restart budget, and start a server again.
    pub async fn restart_server(&self, name: &str) -> Result<Vec<McpToolDefinition>, McpError> {
        let conn = self.connection(name).await?;
        conn.shutdown(self.shutdown_grace).await;
        self.catalog.write().await.unregister_server(name);
        conn.reset_restarts().await;
        self.start_server(name).await
    }

    /// Shut down every server concurrently.
    ///
    /// Each server gets the grace period to exit after its stdin closes and
    /// is killed after that.
    pub async fn stop_all(&self) {
        let conns: Vec<Arc<ServerConnection>> =
            self.servers.read().await.values().cloned().collect();
        let grace = self.shutdown_grace;
        join_all(conns.iter().map(|c| c.shutdown(grace))).await;
        *self.catalog.write().await = ToolRegistry::new();
        tracing::info!(servers = conns.len(), "all servers stopped");
    }

    // ─── Tool Discovery ──────────────────────────────────────────────────

    /// List tools from every server (or only those named in `filter`),
    /// starting servers as the start policy allows.
    ///
    /// Servers are queried concurrently. A server that fails contributes no
    /// tools; its error is returned in [`ToolListing::failures`] and logged.
    pub async fn get_all_tools(&self, filter: Option<&[String]>) -> ToolListing {
        let mut listing = ToolListing::default();

        let conns: Vec<Arc<ServerConnection>> = {
            let servers = self.servers.read().await;
            match filter {
                Some(names) => {
                    let mut picked = Vec::new();
                    for name in names {
                        match servers.get(name) {
                            Some(conn) => picked.push(conn.clone()),
                            None => listing.failures.push((
                                name.clone(),
                                McpError::UnknownProvider { name: name.clone() },
                            )),
                        }
                    }
                    picked
                }
                None => servers.values().cloned().collect(),
            }
        };

        let allow_start = self.start_policy == StartPolicy::Lazy;
        let timeout = self.call_timeout;
        let results = join_all(
            conns
                .iter()
                .map(|conn| async move { (conn.name(), conn.list_tools(allow_start, timeout).await) }),
        )
        .await;

        let mut catalog = self.catalog.write().await;
        for (name, result) in results {
            match result {
                Ok(tools) => {
                    listing.tools.extend(tools.iter().cloned().map(|tool| ProviderTool {
                        server: name.to_string(),
                        tool,
                    }));
                    catalog.register_server_tools(name, tools);
                }
                Err(McpError::NotStarted { .. }) => {
                    tracing::debug!(server = name, "server not started, skipping listing");
                    catalog.unregister_server(name);
                }
                Err(e) => {
                    tracing::warn!(server = name, error = %e, "failed to list tools");
                    catalog.unregister_server(name);
                    listing.failures.push((name.to_string(), e));
                }
            }
        }

        listing.tools.sort_by_key(|t| t.encoded_name());
        tracing::debug!(
            tools = listing.tools.len(),
            failed = listing.failures.len(),
            "aggregated tool listing"
        );
        listing
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// Execute a tool on a server.
    ///
    /// Steps:
    /// 1. Find the server (`UnknownProvider`) and start it if allowed
    /// 2. Check the tool is listed (`UnknownTool` with suggestions) and
    ///    the arguments match its schema (`InvalidArguments`)
    /// 3. Send `tools/call` with the call timeout
    /// 4. Turn server-reported failures into `success: false` results
    ///
    /// Only transport-level problems (timeout, lost connection) are `Err`
    /// after dispatch.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallResult, McpError> {
        let conn = self.connection(server).await?;
        let transport = conn
            .ensure_started(self.start_policy == StartPolicy::Lazy)
            .await?;

        let definition = self.resolve_definition(&conn, tool).await?;
        validate_arguments(&codec::encode(server, tool), &definition.params_schema, &arguments)?;

        tracing::info!(server, tool, "calling tool");
        let start = Instant::now();
        let params = serde_json::json!({
            "name": tool,
            "arguments": arguments,
        });
        let outcome = transport
            .request("tools/call", Some(params), self.call_timeout)
            .await;
        let elapsed = start.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(payload) => interpret_call_result(server, tool, payload, elapsed),
            Err(McpError::ServerError { code, message, .. }) => ToolCallResult {
                server: server.to_string(),
                tool_name: tool.to_string(),
                success: false,
                result: None,
                error: Some(format!("[{code}] {message}")),
                execution_time_ms: elapsed,
            },
            Err(e) => {
                tracing::warn!(server, tool, error = %e, elapsed_ms = elapsed, "tool call failed");
                return Err(e);
            }
        };

        tracing::info!(
            server,
            tool,
            success = result.success,
            elapsed_ms = elapsed,
            "tool call complete"
        );
        Ok(result)
    }

    /// Execute a tool by its encoded name (`server.tool`).
    pub async fn call_encoded(
        &self,
        identifier: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallResult, McpError> {
        match codec::decode(identifier) {
            Some((server, tool)) => self.call_tool(server, tool, arguments).await,
            None => {
                let catalog = self.catalog.read().await;
                let suffix = format!("{}{identifier}", codec::SEPARATOR);
                let mut suggestions: Vec<String> = catalog
                    .all_tools()
                    .iter()
                    .map(|t| t.encoded_name())
                    .filter(|n| n.ends_with(&suffix))
                    .collect();
                suggestions.truncate(MAX_SUGGESTIONS);
                Err(McpError::UnknownTool {
                    server: String::new(),
                    name: identifier.to_string(),
                    suggestions,
                })
            }
        }
    }

    /// Find a tool definition on a running server, refreshing its tool
    /// list once if the tool is not cached.
    async fn resolve_definition(
        &self,
        conn: &ServerConnection,
        tool: &str,
    ) -> Result<McpToolDefinition, McpError> {
        let cached = conn.cached_tools().await;
        if let Some(def) = cached.iter().find(|t| t.name == tool) {
            return Ok(def.clone());
        }

        let fresh = conn.list_tools(false, self.call_timeout).await?;
        self.catalog
            .write()
            .await
            .register_server_tools(conn.name(), fresh.clone());

        match fresh.iter().find(|t| t.name == tool) {
            Some(def) => Ok(def.clone()),
            None => Err(McpError::UnknownTool {
                server: conn.name().to_string(),
                name: tool.to_string(),
                suggestions: rank_similar(
                    tool,
                    fresh.iter().map(|t| t.name.as_str()),
                    MAX_SUGGESTIONS,
                ),
            }),
        }
    }

    // ─── Status ──────────────────────────────────────────────────────────

    /// Names of all registered servers, sorted.
    pub async fn configured_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of connected servers, sorted.
    pub async fn running_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .servers
            .read()
            .await
            .iter()
            .filter(|(_, c)| c.status().is_connected())
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        names
    }

    /// Get the number of connected servers.
    pub async fn running_server_count(&self) -> usize {
        self.running_servers().await.len()
    }

    /// Lifecycle state of one server.
    pub async fn server_status(&self, name: &str) -> Option<ConnectionStatus> {
        self.servers.read().await.get(name).map(|c| c.status())
    }

    /// Lifecycle state of every server, sorted by name.
    pub async fn statuses(&self) -> Vec<(String, ConnectionStatus)> {
        let mut all: Vec<(String, ConnectionStatus)> = self
            .servers
            .read()
            .await
            .iter()
            .map(|(n, c)| (n.clone(), c.status()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Get the number of tools in the catalog.
    pub async fn tool_count(&self) -> usize {
        self.catalog.read().await.len()
    }
}

// ─── Result Interpretation ───────────────────────────────────────────────────

/// Build a [`ToolCallResult`] from a successful `tools/call` response.
///
/// A call still counts as failed when the result carries `isError: true`,
/// or when its structured content or single text item is a
/// `{"success": false, "error": ...}` envelope.
fn interpret_call_result(
    server: &str,
    tool: &str,
    payload: serde_json::Value,
    elapsed_ms: u64,
) -> ToolCallResult {
    let failure = if payload.get("isError").and_then(|v| v.as_bool()) == Some(true) {
        Some(content_text(&payload).unwrap_or_else(|| "tool reported an error".to_string()))
    } else {
        envelope_failure(&payload)
    };

    ToolCallResult {
        server: server.to_string(),
        tool_name: tool.to_string(),
        success: failure.is_none(),
        result: Some(payload),
        error: failure,
        execution_time_ms: elapsed_ms,
    }
}

/// Joined text of all `content[].text` items, if any.
pub fn content_text(payload: &serde_json::Value) -> Option<String> {
    let parts: Vec<&str> = payload
        .get("content")?
        .as_array()?
        .iter()
        .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

fn envelope_failure(payload: &serde_json::Value) -> Option<String> {
    let envelope = match payload.get("structuredContent") {
        Some(structured) if structured.is_object() => structured.clone(),
        _ => serde_json::from_str::<serde_json::Value>(&content_text(payload)?).ok()?,
    };

    if envelope.get("success").and_then(|s| s.as_bool()) != Some(false) {
        return None;
    }
    Some(match envelope.get("error") {
        Some(serde_json::Value::String(msg)) => msg.clone(),
        Some(serde_json::Value::Null) | None => "tool reported failure".to_string(),
        Some(other) => other.to_string(),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::testing::{attach_mocks, Behavior, MockServer, MockTool};
    use tempfile::TempDir;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn empty_config() -> McpServersConfig {
        McpServersConfig {
            servers: HashMap::new(),
        }
    }

    async fn client_with_mocks(specs: Vec<(&str, Vec<MockTool>)>) -> (McpClient, Vec<MockServer>) {
        let client = McpClient::new(empty_config());
        let mocks = attach_mocks(&client, specs).await;
        (client, mocks)
    }

    #[tokio::test]
    async fn test_new_client_skips_disabled_and_invalid() {
        let mut servers = HashMap::new();
        servers.insert("zeta".to_string(), ServerConfig::new("python3", vec![]));
        servers.insert("alpha".to_string(), ServerConfig::new("python3", vec![]));
        servers.insert("bad.name".to_string(), ServerConfig::new("python3", vec![]));
        let mut off = ServerConfig::new("python3", vec![]);
        off.enabled = false;
        servers.insert("off".to_string(), off);

        let client = McpClient::new(McpServersConfig { servers });
        let names = client.configured_servers().await;
        assert_eq!(names, vec!["alpha", "zeta"]); // sorted
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let client = McpClient::new(empty_config());
        let err = client
            .call_tool("unknown-provider", "x", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::UnknownProvider { ref name } if name == "unknown-provider"));
    }

    #[tokio::test]
    async fn test_get_all_tools_unions_servers() {
        let (client, _mocks) = client_with_mocks(vec![
            ("modbus", vec![MockTool::ping(), MockTool::echo()]),
            ("s7comm", vec![MockTool::ping()]),
        ])
        .await;

        let listing = client.get_all_tools(None).await;
        assert!(listing.failures.is_empty());
        let names: Vec<String> = listing.tools.iter().map(|t| t.encoded_name()).collect();
        assert_eq!(names, vec!["modbus.echo", "modbus.ping", "s7comm.ping"]);
        assert_eq!(client.tool_count().await, 3);
    }

    #[tokio::test]
    async fn test_get_all_tools_filter_and_unknown_filter_entry() {
        let (client, _mocks) = client_with_mocks(vec![
            ("modbus", vec![MockTool::ping()]),
            ("s7comm", vec![MockTool::ping()]),
        ])
        .await;

        let filter = vec!["s7comm".to_string(), "nope".to_string()];
        let listing = client.get_all_tools(Some(&filter)).await;
        assert_eq!(listing.tools.len(), 1);
        assert_eq!(listing.tools[0].server, "s7comm");
        assert_eq!(listing.failures.len(), 1);
        assert_eq!(listing.failures[0].0, "nope");
    }

    #[tokio::test]
    async fn test_failing_server_contributes_no_tools() {
        let (client, _mocks) = client_with_mocks(vec![("modbus", vec![MockTool::ping()])]).await;
        client
            .add_server(
                "ghost",
                ServerConfig::new("/nonexistent/fieldmcp-test-binary", vec![]),
            )
            .await
            .unwrap();

        let listing = client.get_all_tools(None).await;
        assert_eq!(listing.tools.len(), 1);
        assert_eq!(listing.failures.len(), 1);
        assert_eq!(listing.failures[0].0, "ghost");
        assert!(matches!(listing.failures[0].1, McpError::SpawnFailed { .. }));
        assert!(matches!(
            client.server_status("ghost").await,
            Some(ConnectionStatus::Error(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_pings_are_attributed_to_their_server() {
        let (client, mocks) = client_with_mocks(vec![
            ("modbus", vec![MockTool::ping()]),
            ("s7comm", vec![MockTool::ping()]),
        ])
        .await;

        let a = client.call_tool("modbus", "ping", json!({}));
        let b = client.call_tool("s7comm", "ping", json!({}));
        let (a, b) = tokio::join!(a, b);
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(a.success && b.success);
        assert_eq!(a.server, "modbus");
        assert_eq!(b.server, "s7comm");
        assert_eq!(content_text(a.result.as_ref().unwrap()).unwrap(), "pong from modbus");
        assert_eq!(content_text(b.result.as_ref().unwrap()).unwrap(), "pong from s7comm");
        assert_eq!(mocks[0].calls.load(Ordering::SeqCst), 1);
        assert_eq!(mocks[1].calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_calls_on_one_server_resolve_independently() {
        let (client, _mocks) = client_with_mocks(vec![(
            "mqtt",
            vec![
                MockTool::new("slow", Behavior::Slow(Duration::from_millis(100))),
                MockTool::echo(),
            ],
        )])
        .await;

        let slow = client.call_tool("mqtt", "slow", json!({}));
        let fast = client.call_tool("mqtt", "echo", json!({"message": "hi"}));
        let (slow, fast) = tokio::join!(slow, fast);

        assert_eq!(content_text(slow.unwrap().result.as_ref().unwrap()).unwrap(), "pong from mqtt");
        let echoed: serde_json::Value =
            serde_json::from_str(&content_text(fast.unwrap().result.as_ref().unwrap()).unwrap()).unwrap();
        assert_eq!(echoed["message"], "hi");
    }

    #[tokio::test]
    async fn test_unknown_tool_has_suggestions() {
        let (client, mocks) = client_with_mocks(vec![("modbus", vec![MockTool::ping(), MockTool::echo()])]).await;
        let err = client.call_tool("modbus", "pingg", json!({})).await.unwrap_err();
        match err {
            McpError::UnknownTool { server, name, suggestions } => {
                assert_eq!(server, "modbus");
                assert_eq!(name, "pingg");
                assert_eq!(suggestions.first().map(String::as_str), Some("ping"));
            }
            other => panic!("expected UnknownTool, got {other:?}"),
        }
        assert_eq!(mocks[0].calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalid_arguments_are_not_dispatched() {
        let (client, mocks) = client_with_mocks(vec![("modbus", vec![MockTool::echo()])]).await;

        let err = client.call_tool("modbus", "echo", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::InvalidArguments { .. }));
        let err = client.call_tool("modbus", "echo", json!("hi")).await.unwrap_err();
        assert!(matches!(err, McpError::InvalidArguments { .. }));
        assert_eq!(mocks[0].calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_server_reported_failures_are_structured() {
        let (client, _mocks) = client_with_mocks(vec![(
            "ethernetip",
            vec![
                MockTool::new("is_error", Behavior::IsError),
                MockTool::new("envelope", Behavior::EnvelopeFailure),
                MockTool::new("rpc_error", Behavior::RpcError),
            ],
        )])
        .await;

        let r = client.call_tool("ethernetip", "is_error", json!({})).await.unwrap();
        assert!(!r.success);
        assert_eq!(r.error.as_deref(), Some("device unreachable"));

        let r = client.call_tool("ethernetip", "envelope", json!({})).await.unwrap();
        assert!(!r.success);
        assert_eq!(r.error.as_deref(), Some("PLC not connected"));

        let r = client.call_tool("ethernetip", "rpc_error", json!({})).await.unwrap();
        assert!(!r.success);
        assert_eq!(r.error.as_deref(), Some("[-32000] register out of range"));
        assert!(r.result.is_none());
    }

    #[tokio::test]
    async fn test_crash_mid_call_is_connection_lost() {
        let (client, _mocks) =
            client_with_mocks(vec![("profinet", vec![MockTool::new("crash", Behavior::Crash)])]).await;
        let err = client.call_tool("profinet", "crash", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::ConnectionLost { .. }), "got {err:?}");
        assert!(err.is_fatal_transport());
    }

    #[tokio::test]
    async fn test_call_timeout() {
        let mut client = McpClient::new(empty_config());
        client.set_call_timeout(50);
        let _mocks = attach_mocks(
            &client,
            vec![("fins", vec![MockTool::new("slow", Behavior::Slow(Duration::from_secs(5)))])],
        )
        .await;
        let err = client.call_tool("fins", "slow", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::Timeout { timeout_ms: 50, .. }));
    }

    #[tokio::test]
    async fn test_explicit_policy_refuses_to_start() {
        let mut client = McpClient::new(empty_config());
        client.set_start_policy(StartPolicy::Explicit);
        client
            .add_server("modbus", ServerConfig::new("/nonexistent/fieldmcp-test-binary", vec![]))
            .await
            .unwrap();

        let err = client.call_tool("modbus", "ping", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::NotStarted { .. }));

        // Not-started servers are skipped silently when listing.
        let listing = client.get_all_tools(None).await;
        assert!(listing.tools.is_empty());
        assert!(listing.failures.is_empty());
    }

    #[tokio::test]
    async fn test_add_server_validates_and_reuses() {
        let client = McpClient::new(empty_config());
        let err = client
            .add_server("bad.name", ServerConfig::new("x", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::InvalidProviderName { .. }));

        let first = client.add_server("bacnet", ServerConfig::new("a", vec![])).await.unwrap();
        let second = client.add_server("bacnet", ServerConfig::new("b", vec![])).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.config().command, "a");
    }

    #[tokio::test]
    async fn test_call_encoded() {
        let (client, _mocks) = client_with_mocks(vec![("modbus", vec![MockTool::ping()])]).await;
        client.get_all_tools(None).await;

        let r = client.call_encoded("modbus.ping", json!({})).await.unwrap();
        assert!(r.success);

        let err = client.call_encoded("ping", json!({})).await.unwrap_err();
        match err {
            McpError::UnknownTool { suggestions, .. } => assert_eq!(suggestions, vec!["modbus.ping"]),
            other => panic!("expected UnknownTool, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stop_all_disconnects_everything() {
        let (client, _mocks) = client_with_mocks(vec![
            ("modbus", vec![MockTool::ping()]),
            ("s7comm", vec![MockTool::ping()]),
        ])
        .await;
        client.get_all_tools(None).await;
        assert_eq!(client.running_servers().await, vec!["modbus", "s7comm"]);

        client.stop_all().await;
        assert_eq!(client.running_server_count().await, 0);
        assert_eq!(client.tool_count().await, 0);
        for (_, status) in client.statuses().await {
            assert_eq!(status, ConnectionStatus::Disconnected);
        }
    }

    #[test]
    fn test_envelope_in_structured_content() {
        let payload = json!({
            "content": [{"type": "text", "text": "ignored"}],
            "structuredContent": {"success": false, "error": {"code": 2}}
        });
        let r = interpret_call_result("s7comm", "read_db", payload, 3);
        assert!(!r.success);
        assert_eq!(r.error.as_deref(), Some(r#"{"code":2}"#));
    }

    #[test]
    fn test_successful_envelope_is_success() {
        let envelope = json!({"success": true, "data": {"value": 7}, "error": null, "meta": {}});
        let payload = json!({"content": [{"type": "text", "text": envelope.to_string()}]});
        let r = interpret_call_result("modbus", "read", payload, 1);
        assert!(r.success);
        assert!(r.error.is_none());
    }

    #[tokio::test]
    async fn test_add_server_resolves_venv() {
        let dir = TempDir::new().unwrap();
        let bin = dir.path().join(".venv/bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("modbus-mcp"), "").unwrap();

        let mut config = ServerConfig::new("modbus-mcp", vec![]);
        config.venv = Some(dir.path().join(".venv").to_string_lossy().into_owned());
        let client = McpClient::new(empty_config());
        let conn = client.add_server("modbus", config).await.unwrap();

        if !cfg!(target_os = "windows") {
            assert_eq!(conn.config().command, bin.join("modbus-mcp").to_string_lossy());
            assert!(conn.config().env.contains_key("VIRTUAL_ENV"));
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_process_crash_restart_and_stop_all() {
        use crate::mcp_client::testing::{process_alive, script_server};

        let dir = TempDir::new().unwrap();
        let Some(config) = script_server(dir.path(), true) else {
            return;
        };
        let mut client = McpClient::new(empty_config());
        client.set_shutdown_grace(Duration::from_millis(300));
        let conn = client.add_server("script", config).await.unwrap();

        let listing = client.get_all_tools(None).await;
        assert!(listing.failures.is_empty());
        assert_eq!(listing.tools.len(), 3);

        async fn pid(client: &McpClient) -> u32 {
            let result = client.call_tool("script", "pid", json!({})).await.unwrap();
            content_text(result.result.as_ref().unwrap())
                .unwrap()
                .parse()
                .unwrap()
        }
        let first = pid(&client).await;
        assert!(process_alive(first));

        // Crash, then the next call restarts the server after the backoff.
        let err = client.call_tool("script", "crash", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::ConnectionLost { .. }), "got {err:?}");
        let started = Instant::now();
        let second = pid(&client).await;
        assert_ne!(first, second);
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(conn.restart_count().await, 1);

        let tools = client.restart_server("script").await.unwrap();
        assert_eq!(tools.len(), 3);
        assert_eq!(conn.restart_count().await, 0);
        assert!(!process_alive(second));
        let third = pid(&client).await;
        assert_ne!(second, third);

        // The server ignores EOF, so stop_all has to kill it.
        let started = Instant::now();
        client.stop_all().await;
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!process_alive(third));
        assert_eq!(
            client.server_status("script").await,
            Some(ConnectionStatus::Disconnected)
        );
        assert_eq!(client.tool_count().await, 0);
    }
}
