//! Server process lifecycle management.
//!
//! A [`ServerConnection`] owns one MCP server child process, the transport
//! over its stdio and the lifecycle state around it: spawning, the MCP
//! handshake, detecting exit, restarting with backoff and shutting down.
//!
//! State machine: `disconnected → connecting → connected → {error,
//! disconnected}`. `error` and `disconnected` are terminal for the current
//! process; the next start creates a fresh one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{watch, Mutex};
use tokio::time::sleep;

use super::errors::McpError;
use super::transport::StdioTransport;
use super::types::{
    ConnectionStatus, InitializeResult, ListToolsResult, McpToolDefinition, ServerConfig,
    MCP_PROTOCOL_VERSION,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Maximum restart attempts before giving up on a server.
pub const MAX_RESTART_ATTEMPTS: u32 = 3;

/// Base delay between restart attempts (doubles each time).
const RESTART_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default timeout for the initialize handshake.
///
/// Protocol servers import their fieldbus stacks (pymodbus, snap7, pycomm3)
/// at startup, which can take several seconds on small gateways.
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Characters of stderr kept for failure diagnostics.
const STDERR_TAIL_CHARS: usize = 2000;

// ─── ServerConnection ────────────────────────────────────────────────────────

/// Mutable state of a connection, guarded by one async mutex.
///
/// The lock is held while starting or stopping, never across a tool call.
#[derive(Default)]
struct Inner {
    process: Option<Child>,
    transport: Option<Arc<StdioTransport>>,
    stderr_tail: Option<Arc<std::sync::Mutex<StderrTail>>>,
    tools: Vec<McpToolDefinition>,
    /// Successful starts over the connection's lifetime.
    starts: u32,
    /// Restarts since the last explicit (re)start.
    restart_count: u32,
    /// Set by an explicit stop; the next start is not a crash restart.
    stopped: bool,
}

impl Inner {
    fn live_transport(&self) -> Option<Arc<StdioTransport>> {
        self.transport
            .as_ref()
            .filter(|t| !t.is_closed())
            .cloned()
    }
}

/// One MCP server: its config, process, transport and lifecycle state.
pub struct ServerConnection {
    name: String,
    config: ServerConfig,
    init_timeout: Duration,
    status: Arc<watch::Sender<ConnectionStatus>>,
    /// Bumped on every start and stop so exit watchers for an old process
    /// never touch the status of a newer one.
    generation: Arc<AtomicU64>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("name", &self.name)
            .field("command", &self.config.command)
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

impl ServerConnection {
    pub fn new(name: &str, config: ServerConfig, init_timeout: Duration) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            name: name.to_string(),
            config,
            init_timeout,
            status: Arc::new(status),
            generation: Arc::new(AtomicU64::new(0)),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// Watch lifecycle state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// How many times this server has been restarted after a failure.
    pub async fn restart_count(&self) -> u32 {
        self.inner.lock().await.restart_count
    }

    /// Tool definitions from the most recent `tools/list`.
    pub async fn cached_tools(&self) -> Vec<McpToolDefinition> {
        self.inner.lock().await.tools.clone()
    }

    /// Start the server if it is not already running.
    ///
    /// A launch or handshake failure leaves the connection in the `error`
    /// state with the reason; the error is also returned for callers that
    /// want it.
    pub async fn start(&self) -> Result<(), McpError> {
        let mut inner = self.inner.lock().await;
        inner.stopped = false;
        self.start_locked(&mut inner).await
    }

    /// Return a live transport, starting the server when `allow_start` is
    /// set.
    ///
    /// A server that crashed or failed to start is restarted with
    /// exponential backoff (1s, 2s, 4s); after [`MAX_RESTART_ATTEMPTS`] the
    /// connection refuses with `RestartExhausted` until restarted
    /// explicitly.
    pub async fn ensure_started(&self, allow_start: bool) -> Result<Arc<StdioTransport>, McpError> {
        let mut inner = self.inner.lock().await;
        if let Some(transport) = inner.live_transport() {
            return Ok(transport);
        }
        if !allow_start {
            return Err(McpError::NotStarted {
                name: self.name.clone(),
            });
        }

        let crashed = match self.status() {
            ConnectionStatus::Error(_) => true,
            ConnectionStatus::Connected => true,
            ConnectionStatus::Disconnected => inner.starts > 0 && !inner.stopped,
            ConnectionStatus::Connecting => false,
        };

        if crashed {
            if inner.restart_count >= MAX_RESTART_ATTEMPTS {
                return Err(McpError::RestartExhausted {
                    name: self.name.clone(),
                    attempts: MAX_RESTART_ATTEMPTS,
                });
            }
            let delay = RESTART_BASE_DELAY * 2u32.pow(inner.restart_count);
            inner.restart_count += 1;
            let last_stderr = inner
                .stderr_tail
                .as_ref()
                .and_then(|t| t.lock().ok().map(|t| t.as_str().trim().to_string()))
                .unwrap_or_default();
            tracing::warn!(
                server = %self.name,
                attempt = inner.restart_count,
                delay_ms = delay.as_millis() as u64,
                stderr = %last_stderr,
                "restarting server"
            );
            sleep(delay).await;
        }

        inner.stopped = false;
        self.start_locked(&mut inner).await?;
        inner.live_transport().ok_or_else(|| McpError::ConnectionLost {
            server: self.name.clone(),
            reason: "server exited right after starting".into(),
        })
    }

    /// Query `tools/list` and refresh the cached definitions.
    pub async fn list_tools(
        &self,
        allow_start: bool,
        timeout: Duration,
    ) -> Result<Vec<McpToolDefinition>, McpError> {
        let transport = self.ensure_started(allow_start).await?;
        let tools = fetch_tools(&transport, &self.name, timeout).await?;
        self.inner.lock().await.tools = tools.clone();
        Ok(tools)
    }

    /// Gracefully stop the server: close its stdin, wait up to `grace` for
    /// it to exit, then kill it.
    pub async fn shutdown(&self, grace: Duration) {
        let mut inner = self.inner.lock().await;
        inner.stopped = true;
        self.generation.fetch_add(1, Ordering::SeqCst);

        let transport = inner.transport.take();
        let process = inner.process.take();
        inner.stderr_tail = None;

        if let Some(transport) = &transport {
            transport.close_input().await;
        }

        if let Some(mut child) = process {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::info!(server = %self.name, %status, "server exited");
                }
                _ => {
                    tracing::warn!(
                        server = %self.name,
                        grace_ms = grace.as_millis() as u64,
                        "server did not exit in time, killing"
                    );
                    let _ = child.kill().await;
                }
            }
        }

        self.status.send_replace(ConnectionStatus::Disconnected);
    }

    /// Clear the restart budget, e.g. on an explicit restart request.
    pub async fn reset_restarts(&self) {
        self.inner.lock().await.restart_count = 0;
    }

    async fn start_locked(&self, inner: &mut Inner) -> Result<(), McpError> {
        if inner.live_transport().is_some() {
            return Ok(());
        }

        // Any previous process is finished; dropping the handle kills it.
        inner.process = None;
        inner.transport = None;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.status.send_replace(ConnectionStatus::Connecting);
        tracing::info!(server = %self.name, command = %self.config.command, "starting server");

        match self.launch().await {
            Ok(launched) => {
                let tool_count = launched.tools.len();
                self.install(inner, launched, generation);
                tracing::info!(server = %self.name, tools = tool_count, "server connected");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(server = %self.name, error = %e, "server failed to start");
                self.status.send_replace(ConnectionStatus::Error(e.to_string()));
                Err(e)
            }
        }
    }

    fn install(&self, inner: &mut Inner, launched: Launched, generation: u64) {
        let transport = Arc::new(launched.transport);
        self.watch_exit(&transport, generation);

        inner.process = launched.process;
        inner.transport = Some(transport);
        inner.stderr_tail = launched.stderr_tail;
        inner.tools = launched.tools;
        inner.starts += 1;
        self.status.send_replace(ConnectionStatus::Connected);
    }

    /// Flip `connected` to `disconnected` once the transport closes, unless
    /// the connection has moved on to another process since.
    fn watch_exit(&self, transport: &Arc<StdioTransport>, generation: u64) {
        let transport = Arc::downgrade(transport);
        let status = self.status.clone();
        let current = self.generation.clone();
        let name = self.name.clone();

        tokio::spawn(async move {
            let Some(mut closed) = transport.upgrade().map(|t| t.closed_signal()) else {
                return;
            };
            let _ = closed.wait_for(|c| *c).await;
            if current.load(Ordering::SeqCst) != generation {
                return;
            }
            let changed = status.send_if_modified(|s| {
                if s.is_connected() {
                    *s = ConnectionStatus::Disconnected;
                    true
                } else {
                    false
                }
            });
            if changed {
                tracing::warn!(server = %name, "server disconnected unexpectedly");
            }
        });
    }

    async fn launch(&self) -> Result<Launched, McpError> {
        let mut cmd = build_command(&self.config);
        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: self.name.clone(),
            reason: format!("{}: {e}", self.config.command),
        })?;

        let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
            name: self.name.clone(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
            name: self.name.clone(),
            reason: "failed to capture stdout".into(),
        })?;
        let stderr_tail = child
            .stderr
            .take()
            .map(|stderr| drain_stderr(&self.name, stderr));

        let transport = StdioTransport::new(&self.name, stdin, stdout);

        let handshake = handshake(&transport, &self.name, self.init_timeout);
        match tokio::time::timeout(self.init_timeout, handshake).await {
            Ok(Ok(tools)) => Ok(Launched {
                process: Some(child),
                transport,
                stderr_tail,
                tools,
            }),
            Ok(Err(e)) => {
                let _ = child.kill().await;
                let suffix = stderr_suffix(stderr_tail.as_ref()).await;
                Err(McpError::InitFailed {
                    name: self.name.clone(),
                    reason: format!("{e}{suffix}"),
                })
            }
            Err(_) => {
                let _ = child.kill().await;
                let suffix = stderr_suffix(stderr_tail.as_ref()).await;
                Err(McpError::InitFailed {
                    name: self.name.clone(),
                    reason: format!(
                        "initialization timed out after {}s{suffix}",
                        self.init_timeout.as_secs()
                    ),
                })
            }
        }
    }

    /// Attach an already-connected transport (no child process) and run
    /// the handshake over it. Used to drive in-memory mock servers.
    #[cfg(test)]
    pub(crate) async fn attach(&self, transport: StdioTransport) -> Result<(), McpError> {
        let mut inner = self.inner.lock().await;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.status.send_replace(ConnectionStatus::Connecting);
        let tools = handshake(&transport, &self.name, self.init_timeout).await?;
        self.install(
            &mut inner,
            Launched {
                process: None,
                transport,
                stderr_tail: None,
                tools,
            },
            generation,
        );
        Ok(())
    }
}

struct Launched {
    process: Option<Child>,
    transport: StdioTransport,
    stderr_tail: Option<Arc<std::sync::Mutex<StderrTail>>>,
    tools: Vec<McpToolDefinition>,
}

// ─── Spawning ────────────────────────────────────────────────────────────────

/// Build the command for a server config.
///
/// Stdio is piped for JSON-RPC and the child is killed if its handle is
/// dropped, so no server outlives its connection.
pub fn build_command(config: &ServerConfig) -> Command {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);

    for (key, value) in &config.env {
        cmd.env(key, value);
    }
    if let Some(dir) = &config.cwd {
        cmd.current_dir(dir);
    }

    // Windows: prevent console window from appearing for child processes
    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);
    cmd
}

/// Perform the MCP initialization handshake, then list tools.
async fn handshake(
    transport: &StdioTransport,
    server_name: &str,
    timeout: Duration,
) -> Result<Vec<McpToolDefinition>, McpError> {
    let params = serde_json::json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
    });

    let result = transport
        .request("initialize", Some(params), timeout)
        .await?;
    let init: InitializeResult =
        serde_json::from_value(result).map_err(|e| McpError::InitFailed {
            name: server_name.to_string(),
            reason: format!("failed to parse initialize response: {e}"),
        })?;

    if let Some(info) = &init.server_info {
        tracing::debug!(
            server = server_name,
            remote_name = info.name.as_deref().unwrap_or("?"),
            remote_version = info.version.as_deref().unwrap_or("?"),
            protocol = init.protocol_version.as_deref().unwrap_or("?"),
            "initialize complete"
        );
    }

    transport.notify("notifications/initialized", None).await?;
    fetch_tools(transport, server_name, timeout).await
}

async fn fetch_tools(
    transport: &StdioTransport,
    server_name: &str,
    timeout: Duration,
) -> Result<Vec<McpToolDefinition>, McpError> {
    let result = transport
        .request("tools/list", Some(serde_json::json!({})), timeout)
        .await?;
    let listed: ListToolsResult =
        serde_json::from_value(result).map_err(|e| McpError::Protocol {
            server: server_name.to_string(),
            reason: format!("failed to parse tools/list response: {e}"),
        })?;
    Ok(listed.tools)
}

// ─── Stderr ──────────────────────────────────────────────────────────────────

/// The last few thousand characters a server wrote to stderr.
#[derive(Debug, Default)]
pub struct StderrTail {
    buf: String,
}

impl StderrTail {
    pub fn push_line(&mut self, line: &str) {
        self.buf.push_str(line);
        self.buf.push('\n');
        let excess = self.buf.chars().count().saturating_sub(STDERR_TAIL_CHARS);
        if excess > 0 {
            let cut = self
                .buf
                .char_indices()
                .nth(excess)
                .map(|(i, _)| i)
                .unwrap_or(self.buf.len());
            self.buf.drain(..cut);
        }
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }
}

/// Continuously read a server's stderr, logging each line at debug level
/// and keeping a bounded tail for failure messages.
fn drain_stderr(name: &str, stderr: ChildStderr) -> Arc<std::sync::Mutex<StderrTail>> {
    let tail = Arc::new(std::sync::Mutex::new(StderrTail::default()));
    let sink = tail.clone();
    let name = name.to_string();

    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end();
                    tracing::debug!(server = %name, "stderr: {line}");
                    if let Ok(mut tail) = sink.lock() {
                        tail.push_line(line);
                    }
                }
            }
        }
    });

    tail
}

/// Format the captured stderr as a suffix for error messages (empty string
/// if nothing was captured).
async fn stderr_suffix(tail: Option<&Arc<std::sync::Mutex<StderrTail>>>) -> String {
    let Some(tail) = tail else {
        return String::new();
    };
    // Give the drain task a moment to pick up the final lines.
    sleep(Duration::from_millis(100)).await;
    let text = match tail.lock() {
        Ok(tail) => tail.as_str().trim().to_string(),
        Err(_) => String::new(),
    };
    if text.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {text}")
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
