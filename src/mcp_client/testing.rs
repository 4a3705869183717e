//! In-memory MCP servers for tests.
//!
//! A mock server speaks the same newline-delimited JSON-RPC as a real
//! protocol server, over `tokio::io::duplex` pipes instead of a child
//! process. Each `tools/call` is answered from its own task, so slow tools
//! answer out of order exactly like a real concurrent server.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::{Mutex, Notify};

use super::client::McpClient;
use super::transport::StdioTransport;
use super::types::ServerConfig;

/// What a mock tool does when called.
#[derive(Debug, Clone)]
pub(crate) enum Behavior {
    /// Text result `pong from {server}`.
    Ping,
    /// Text result holding the call arguments as JSON.
    Echo,
    /// `isError: true` result.
    IsError,
    /// `{"success": false, ...}` envelope in the text content.
    EnvelopeFailure,
    /// JSON-RPC error response.
    RpcError,
    /// Answer with `Ping` after a delay.
    Slow(Duration),
    /// Close stdout without answering, as if the process died.
    Crash,
}

#[derive(Debug, Clone)]
pub(crate) struct MockTool {
    pub name: String,
    pub schema: Value,
    pub behavior: Behavior,
}

impl MockTool {
    pub fn new(name: &str, behavior: Behavior) -> Self {
        Self {
            name: name.to_string(),
            schema: json!({"type": "object", "properties": {}}),
            behavior,
        }
    }

    pub fn ping() -> Self {
        Self::new("ping", Behavior::Ping)
    }

    pub fn echo() -> Self {
        Self {
            schema: json!({
                "type": "object",
                "properties": {"message": {"type": "string"}},
                "required": ["message"]
            }),
            ..Self::new("echo", Behavior::Echo)
        }
    }
}

/// Test-side handle on a running mock server.
pub(crate) struct MockServer {
    /// Set once `notifications/initialized` arrives.
    pub initialized: Arc<AtomicBool>,
    /// Number of `tools/call` requests received.
    pub calls: Arc<AtomicUsize>,
    /// Notify to make the server "exit" (close its stdout).
    pub kill: Arc<Notify>,
}

type SharedWriter = Arc<Mutex<Option<DuplexStream>>>;

/// Start a mock server; returns the client transport connected to it.
pub(crate) fn mock_server(name: &str, tools: Vec<MockTool>) -> (StdioTransport, MockServer) {
    let (client_out, server_in) = duplex(64 * 1024);
    let (server_out, client_in) = duplex(64 * 1024);
    let transport = StdioTransport::new(name, client_out, client_in);

    let initialized = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicUsize::new(0));
    let kill = Arc::new(Notify::new());

    let state = MockState {
        name: name.to_string(),
        tools: Arc::new(tools),
        writer: Arc::new(Mutex::new(Some(server_out))),
        initialized: initialized.clone(),
        calls: calls.clone(),
    };
    tokio::spawn(state.run(server_in, kill.clone()));

    (
        transport,
        MockServer {
            initialized,
            calls,
            kill,
        },
    )
}

/// Register one in-memory mock server per entry on `client`, already
/// connected.
pub(crate) async fn attach_mocks(
    client: &McpClient,
    specs: Vec<(&str, Vec<MockTool>)>,
) -> Vec<MockServer> {
    let mut handles = Vec::new();
    for (name, tools) in specs {
        let conn = client
            .add_server(name, ServerConfig::new("mock", vec![]))
            .await
            .unwrap();
        let (transport, mock) = mock_server(name, tools);
        conn.attach(transport).await.unwrap();
        handles.push(mock);
    }
    handles
}

struct MockState {
    name: String,
    tools: Arc<Vec<MockTool>>,
    writer: SharedWriter,
    initialized: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
}

impl MockState {
    async fn run(self, input: DuplexStream, kill: Arc<Notify>) {
        let mut lines = BufReader::new(input).lines();
        loop {
            let line = tokio::select! {
                _ = kill.notified() => break,
                line = lines.next_line() => line,
            };
            let Ok(Some(line)) = line else { break };
            let Ok(msg) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            self.handle(msg).await;
        }
        self.writer.lock().await.take();
    }

    async fn handle(&self, msg: Value) {
        let method = msg["method"].as_str().unwrap_or_default().to_string();
        let Some(id) = msg.get("id").cloned() else {
            if method == "notifications/initialized" {
                self.initialized.store(true, Ordering::SeqCst);
            }
            return;
        };

        match method.as_str() {
            "initialize" => {
                let result = json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": self.name, "version": "0.0.0"}
                });
                send(&self.writer, json!({"jsonrpc": "2.0", "id": id, "result": result})).await;
            }
            "tools/list" => {
                let tools: Vec<Value> = self
                    .tools
                    .iter()
                    .map(|t| json!({"name": t.name, "description": format!("mock {}", t.name), "inputSchema": t.schema}))
                    .collect();
                send(&self.writer, json!({"jsonrpc": "2.0", "id": id, "result": {"tools": tools}})).await;
            }
            "tools/call" => {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let tool_name = msg["params"]["name"].as_str().unwrap_or_default().to_string();
                let args = msg["params"]["arguments"].clone();
                let Some(tool) = self.tools.iter().find(|t| t.name == tool_name).cloned() else {
                    let error = json!({"code": -32602, "message": format!("Unknown tool: {tool_name}")});
                    send(&self.writer, json!({"jsonrpc": "2.0", "id": id, "error": error})).await;
                    return;
                };
                let writer = self.writer.clone();
                let server = self.name.clone();
                tokio::spawn(answer_call(writer, server, tool, id, args));
            }
            _ => {
                let error = json!({"code": -32601, "message": "Method not found"});
                send(&self.writer, json!({"jsonrpc": "2.0", "id": id, "error": error})).await;
            }
        }
    }
}

async fn answer_call(writer: SharedWriter, server: String, tool: MockTool, id: Value, args: Value) {
    let text = |t: String| json!({"content": [{"type": "text", "text": t}], "isError": false});
    let response = match tool.behavior {
        Behavior::Ping => json!({"id": id, "result": text(format!("pong from {server}"))}),
        Behavior::Slow(delay) => {
            tokio::time::sleep(delay).await;
            json!({"id": id, "result": text(format!("pong from {server}"))})
        }
        Behavior::Echo => json!({"id": id, "result": text(args.to_string())}),
        Behavior::IsError => json!({
            "id": id,
            "result": {"content": [{"type": "text", "text": "device unreachable"}], "isError": true}
        }),
        Behavior::EnvelopeFailure => {
            let envelope = json!({"success": false, "data": null, "error": "PLC not connected", "meta": {}});
            json!({"id": id, "result": text(envelope.to_string())})
        }
        Behavior::RpcError => json!({"id": id, "error": {"code": -32000, "message": "register out of range"}}),
        Behavior::Crash => {
            writer.lock().await.take();
            return;
        }
    };
    send(&writer, response).await;
}

async fn send(writer: &SharedWriter, msg: Value) {
    let mut guard = writer.lock().await;
    if let Some(w) = guard.as_mut() {
        let mut line = msg.to_string();
        line.push('\n');
        let _ = w.write_all(line.as_bytes()).await;
    }
}

// ─── Child Processes ─────────────────────────────────────────────────────────

/// A minimal stdio MCP server with three tools: `ping`, `pid` (answers
/// with its process id) and `crash` (exits without answering). With
/// `--ignore-eof` it keeps running after its stdin closes.
const SCRIPT_SERVER: &str = r#"
import json, os, sys, time

TOOLS = [
    {"name": n, "description": n, "inputSchema": {"type": "object", "properties": {}}}
    for n in ("ping", "pid", "crash")
]

def send(msg_id, result):
    sys.stdout.write(json.dumps({"jsonrpc": "2.0", "id": msg_id, "result": result}) + "\n")
    sys.stdout.flush()

while True:
    line = sys.stdin.readline()
    if not line:
        break
    msg = json.loads(line)
    if "id" not in msg:
        continue
    method = msg.get("method")
    if method == "initialize":
        send(msg["id"], {
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "script", "version": "0"},
        })
    elif method == "tools/list":
        send(msg["id"], {"tools": TOOLS})
    elif method == "tools/call":
        name = msg["params"]["name"]
        if name == "crash":
            os._exit(1)
        text = str(os.getpid()) if name == "pid" else "pong"
        send(msg["id"], {"content": [{"type": "text", "text": text}], "isError": False})

if "--ignore-eof" in sys.argv:
    while True:
        time.sleep(60)
"#;

/// Write the script server into `dir` and return a config that runs it.
///
/// `None` when no `python3` is on the PATH; callers skip the test.
pub(crate) fn script_server(dir: &std::path::Path, ignore_eof: bool) -> Option<ServerConfig> {
    let available = std::process::Command::new("python3")
        .arg("--version")
        .output()
        .is_ok_and(|out| out.status.success());
    if !available {
        eprintln!("python3 not found, skipping child process test");
        return None;
    }

    let path = dir.join("script_server.py");
    std::fs::write(&path, SCRIPT_SERVER).ok()?;
    let mut args = vec!["-u".to_string(), path.to_string_lossy().into_owned()];
    if ignore_eof {
        args.push("--ignore-eof".into());
    }
    Some(ServerConfig::new("python3", args))
}

/// Whether a process with this id still exists.
#[cfg(unix)]
pub(crate) fn process_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}
