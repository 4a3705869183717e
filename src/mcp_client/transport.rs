//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with one MCP server process:
//! - Writing newline-delimited JSON-RPC requests to its stdin
//! - A background reader task that parses stdout lines and resolves the
//!   matching pending request by id
//! - Failing every outstanding request when the stream closes
//!
//! Requests are multiplexed: any number of callers may have a request in
//! flight on the same transport, and responses may arrive in any order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::types::{JsonRpcMessage, JsonRpcRequest};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type Responder = oneshot::Sender<Result<serde_json::Value, McpError>>;

/// Longest stdout line excerpt included in log records.
const LOG_PREVIEW_CHARS: usize = 200;

// ─── Pending Requests ────────────────────────────────────────────────────────

/// In-flight requests, plus the reason the stream closed (if it has).
///
/// Once `closed` is set no new entry is ever inserted, so the close path
/// drains the map exactly once.
#[derive(Default)]
struct PendingState {
    requests: HashMap<u64, Responder>,
    closed: Option<String>,
}

struct Shared {
    server_name: String,
    pending: Mutex<PendingState>,
}

impl Shared {
    /// Route one stdout line to the request it answers.
    async fn dispatch_line(&self, line: &str) {
        let msg: JsonRpcMessage = match serde_json::from_str(line) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(
                    server = %self.server_name,
                    error = %e,
                    line = %preview(line),
                    "ignoring non-JSON-RPC line on server stdout"
                );
                return;
            }
        };

        if let Some(method) = msg.method.as_deref() {
            // Server-initiated notification or request; nothing waits on it.
            tracing::debug!(server = %self.server_name, method, "server message ignored");
            return;
        }

        let Some(id) = msg.response_id() else {
            tracing::debug!(
                server = %self.server_name,
                line = %preview(line),
                "ignoring message without a usable id"
            );
            return;
        };

        let responder = self.pending.lock().await.requests.remove(&id);
        match responder {
            Some(tx) => {
                // The caller may have stopped waiting; that is fine.
                let _ = tx.send(extract_result(msg));
            }
            None => {
                tracing::warn!(
                    server = %self.server_name,
                    id,
                    "discarding response for unknown or timed-out request"
                );
            }
        }
    }

    /// Mark the transport closed and fail every outstanding request.
    async fn close(&self, reason: &str) {
        let drained: Vec<Responder> = {
            let mut state = self.pending.lock().await;
            if state.closed.is_none() {
                state.closed = Some(reason.to_string());
            }
            state.requests.drain().map(|(_, tx)| tx).collect()
        };

        if !drained.is_empty() {
            tracing::warn!(
                server = %self.server_name,
                pending = drained.len(),
                reason,
                "connection closed with requests in flight"
            );
        }

        for tx in drained {
            let _ = tx.send(Err(McpError::ConnectionLost {
                server: self.server_name.clone(),
                reason: reason.to_string(),
            }));
        }
    }
}

/// Removes a request's pending entry if the caller stops waiting before the
/// response, timeout, or close path has removed it.
struct PendingGuard {
    shared: Arc<Shared>,
    id: u64,
    armed: bool,
}

impl PendingGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let id = self.id;
        if let Ok(mut state) = self.shared.pending.try_lock() {
            state.requests.remove(&id);
            return;
        }
        // Lock is busy; finish the removal on the runtime.
        let shared = self.shared.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                shared.pending.lock().await.requests.remove(&id);
            });
        }
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional, multiplexed JSON-RPC transport over a byte stream pair
/// (normally a child process's stdin/stdout).
pub struct StdioTransport {
    shared: Arc<Shared>,
    writer: Mutex<Option<BoxedWriter>>,
    /// Request ids are scoped to this transport and never reused.
    next_id: AtomicU64,
    closed_rx: watch::Receiver<bool>,
    reader_task: JoinHandle<()>,
}

impl StdioTransport {
    /// Create a transport and start its stdout reader task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new<W, R>(server_name: &str, writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared {
            server_name: server_name.to_string(),
            pending: Mutex::new(PendingState::default()),
        });
        let (closed_tx, closed_rx) = watch::channel(false);
        let reader_task = tokio::spawn(read_loop(shared.clone(), reader, closed_tx));

        Self {
            shared,
            writer: Mutex::new(Some(Box::new(writer))),
            next_id: AtomicU64::new(1),
            closed_rx,
            reader_task,
        }
    }

    /// Name of the server on the other end.
    pub fn server_name(&self) -> &str {
        &self.shared.server_name
    }

    /// Send a JSON-RPC request and wait for the matching response.
    ///
    /// The pending entry is registered before the request is written, so a
    /// fast response can never be missed. On timeout the entry is removed
    /// and a response arriving later is logged and dropped.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut state = self.shared.pending.lock().await;
            if let Some(reason) = &state.closed {
                return Err(McpError::ConnectionLost {
                    server: self.shared.server_name.clone(),
                    reason: reason.clone(),
                });
            }
            state.requests.insert(id, tx);
        }
        let mut guard = PendingGuard {
            shared: self.shared.clone(),
            id,
            armed: true,
        };

        let req = JsonRpcRequest::new(id, method, params);
        if let Err(e) = self.write_message(&req).await {
            self.shared.pending.lock().await.requests.remove(&id);
            guard.disarm();
            return Err(e);
        }

        tracing::trace!(server = %self.shared.server_name, id, method, "request sent");

        let waited = tokio::time::timeout(timeout, rx).await;
        guard.disarm();
        match waited {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(McpError::ConnectionLost {
                server: self.shared.server_name.clone(),
                reason: "transport dropped".into(),
            }),
            Err(_) => {
                self.shared.pending.lock().await.requests.remove(&id);
                tracing::warn!(
                    server = %self.shared.server_name,
                    id,
                    method,
                    timeout_ms = timeout.as_millis() as u64,
                    "request timed out"
                );
                Err(McpError::Timeout {
                    server: self.shared.server_name.clone(),
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        self.write_message(&JsonRpcRequest::notification(method, params))
            .await
    }

    /// Close the write half. Well-behaved servers exit when stdin closes.
    pub async fn close_input(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    /// Whether the read half has closed.
    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Resolve once the read half has closed and all pending requests have
    /// been failed.
    pub async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        // An Err means the reader task is gone, which also means closed.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// A receiver that flips to `true` when the read half closes.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }

    /// Number of requests currently awaiting a response.
    pub async fn pending_count(&self) -> usize {
        self.shared.pending.lock().await.requests.len()
    }

    async fn write_message(&self, msg: &JsonRpcRequest) -> Result<(), McpError> {
        let mut json = serde_json::to_string(msg).map_err(|e| McpError::TransportError {
            server: self.shared.server_name.clone(),
            reason: format!("failed to serialize '{}': {e}", msg.method),
        })?;
        json.push('\n');

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| McpError::ConnectionLost {
            server: self.shared.server_name.clone(),
            reason: "stdin already closed".into(),
        })?;

        writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| McpError::TransportError {
                server: self.shared.server_name.clone(),
                reason: format!("failed to write to stdin: {e}"),
            })?;
        writer
            .flush()
            .await
            .map_err(|e| McpError::TransportError {
                server: self.shared.server_name.clone(),
                reason: format!("failed to flush stdin: {e}"),
            })?;

        Ok(())
    }
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("server_name", &self.shared.server_name)
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn read_loop<R>(shared: Arc<Shared>, reader: R, closed_tx: watch::Sender<bool>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(4096);

    let reason = loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break "server stdout closed (process may have exited)".to_string(),
            Ok(_) => {}
            Err(e) => break format!("failed to read from stdout: {e}"),
        }

        let line = String::from_utf8_lossy(&buf);
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        shared.dispatch_line(trimmed).await;
    };

    tracing::debug!(server = %shared.server_name, reason = %reason, "stdout reader finished");
    shared.close(&reason).await;
    let _ = closed_tx.send(true);
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcMessage) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: super::types::error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

fn preview(line: &str) -> String {
    if line.chars().count() <= LOG_PREVIEW_CHARS {
        line.to_string()
    } else {
        let head: String = line.chars().take(LOG_PREVIEW_CHARS).collect();
        format!("{head}…")
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    const LONG: Duration = Duration::from_secs(5);

    /// Transport wired to an in-memory "server": returns the transport plus
    /// the server's view (lines the client wrote, writer for responses).
    fn harness() -> (
        Arc<StdioTransport>,
        BufReader<DuplexStream>,
        DuplexStream,
    ) {
        let (client_out, server_in) = duplex(64 * 1024);
        let (server_out, client_in) = duplex(64 * 1024);
        let transport = Arc::new(StdioTransport::new("mock", client_out, client_in));
        (transport, BufReader::new(server_in), server_out)
    }

    async fn read_request(reader: &mut BufReader<DuplexStream>) -> serde_json::Value {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn respond(writer: &mut DuplexStream, body: serde_json::Value) {
        let mut line = body.to_string();
        line.push('\n');
        writer.write_all(line.as_bytes()).await.unwrap();
    }

    #[test]
    fn test_extract_result_success() {
        let msg: JsonRpcMessage =
            serde_json::from_value(serde_json::json!({"id": 1, "result": {"text": "hello"}}))
                .unwrap();
        let result = extract_result(msg).unwrap();
        assert_eq!(result["text"], "hello");
    }

    #[test]
    fn test_extract_result_error() {
        let msg: JsonRpcMessage = serde_json::from_value(serde_json::json!({
            "id": 1,
            "error": {"code": -32601, "message": "Method not found"}
        }))
        .unwrap();
        match extract_result(msg).unwrap_err() {
            McpError::ServerError { code, message, .. } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            other => panic!("expected ServerError, got {other:?}"),
        }
    }

    #[test]
    fn test_extract_result_missing_both() {
        let msg: JsonRpcMessage = serde_json::from_value(serde_json::json!({"id": 1})).unwrap();
        assert!(matches!(
            extract_result(msg).unwrap_err(),
            McpError::ServerError { .. }
        ));
    }

    #[tokio::test]
    async fn test_request_writes_framed_json_rpc() {
        let (transport, mut server_rx, mut server_tx) = harness();

        let t = transport.clone();
        let call = tokio::spawn(async move {
            t.request("tools/list", Some(serde_json::json!({})), LONG).await
        });

        let req = read_request(&mut server_rx).await;
        assert_eq!(req["jsonrpc"], "2.0");
        assert_eq!(req["method"], "tools/list");
        assert_eq!(req["id"], 1);

        respond(&mut server_tx, serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": {"tools": []}})).await;
        let result = call.await.unwrap().unwrap();
        assert_eq!(result["tools"], serde_json::json!([]));
        assert_eq!(transport.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_reach_their_callers() {
        let (transport, mut server_rx, mut server_tx) = harness();

        let mut calls = Vec::new();
        for i in 0..5u64 {
            let t = transport.clone();
            calls.push(tokio::spawn(async move {
                t.request("echo", Some(serde_json::json!({"n": i})), LONG).await
            }));
        }

        let mut seen = Vec::new();
        for _ in 0..5 {
            let req = read_request(&mut server_rx).await;
            seen.push((req["id"].as_u64().unwrap(), req["params"]["n"].as_u64().unwrap()));
        }

        // Answer in reverse order, echoing the caller's payload.
        for (id, n) in seen.iter().rev() {
            respond(&mut server_tx, serde_json::json!({"id": id, "result": {"n": n}})).await;
        }

        for (i, call) in calls.into_iter().enumerate() {
            let result = call.await.unwrap().unwrap();
            assert_eq!(result["n"], i as u64);
        }
        assert_eq!(transport.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_malformed_lines_and_notifications_are_ignored() {
        let (transport, mut server_rx, mut server_tx) = harness();

        let t = transport.clone();
        let call = tokio::spawn(async move { t.request("ping", None, LONG).await });
        let req = read_request(&mut server_rx).await;

        server_tx.write_all(b"INFO starting modbus server\n").await.unwrap();
        server_tx.write_all(b"{not json\n").await.unwrap();
        respond(
            &mut server_tx,
            serde_json::json!({"jsonrpc": "2.0", "method": "notifications/message", "params": {}}),
        )
        .await;
        respond(&mut server_tx, serde_json::json!({"id": req["id"], "result": "pong"})).await;

        assert_eq!(call.await.unwrap().unwrap(), "pong");
        assert!(!transport.is_closed());
    }

    #[tokio::test]
    async fn test_close_rejects_all_pending() {
        let (transport, mut server_rx, server_tx) = harness();

        let mut calls = Vec::new();
        for _ in 0..3 {
            let t = transport.clone();
            calls.push(tokio::spawn(async move { t.request("slow", None, LONG).await }));
        }
        for _ in 0..3 {
            read_request(&mut server_rx).await;
        }
        assert_eq!(transport.pending_count().await, 3);

        // Server process "exits".
        drop(server_tx);

        for call in calls {
            let err = call.await.unwrap().unwrap_err();
            assert!(matches!(err, McpError::ConnectionLost { .. }), "got {err:?}");
        }
        transport.closed().await;
        assert!(transport.is_closed());
        assert_eq!(transport.pending_count().await, 0);

        let err = transport.request("after", None, LONG).await.unwrap_err();
        assert!(matches!(err, McpError::ConnectionLost { .. }));
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_entry_and_late_response_is_dropped() {
        let (transport, mut server_rx, mut server_tx) = harness();

        let err = {
            let t = transport.clone();
            let call = tokio::spawn(async move {
                t.request("tools/call", None, Duration::from_millis(50)).await
            });
            let req = read_request(&mut server_rx).await;
            let err = call.await.unwrap().unwrap_err();
            assert_eq!(transport.pending_count().await, 0);
            respond(&mut server_tx, serde_json::json!({"id": req["id"], "result": "late"})).await;
            err
        };
        match err {
            McpError::Timeout { method, timeout_ms, .. } => {
                assert_eq!(method, "tools/call");
                assert_eq!(timeout_ms, 50);
            }
            other => panic!("expected Timeout, got {other:?}"),
        }

        // The transport stays usable after the late response is discarded.
        let t = transport.clone();
        let call = tokio::spawn(async move { t.request("ping", None, LONG).await });
        let req = read_request(&mut server_rx).await;
        respond(&mut server_tx, serde_json::json!({"id": req["id"], "result": "pong"})).await;
        assert_eq!(call.await.unwrap().unwrap(), "pong");
    }

    #[tokio::test]
    async fn test_ids_are_unique_per_transport() {
        let (transport, mut server_rx, mut server_tx) = harness();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let t = transport.clone();
            let call = tokio::spawn(async move { t.request("ping", None, LONG).await });
            let req = read_request(&mut server_rx).await;
            ids.push(req["id"].as_u64().unwrap());
            respond(&mut server_tx, serde_json::json!({"id": req["id"], "result": {}})).await;
            call.await.unwrap().unwrap();
        }
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_abandoned_request_releases_pending_entry() {
        let (transport, mut server_rx, mut server_tx) = harness();

        // The caller stops waiting long before the server answers.
        let waited = tokio::time::timeout(
            Duration::from_millis(50),
            transport.request("tools/call", None, LONG),
        )
        .await;
        assert!(waited.is_err());
        let req = read_request(&mut server_rx).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.pending_count().await, 0);

        // A late answer is discarded and the transport keeps working.
        respond(&mut server_tx, serde_json::json!({"id": req["id"], "result": "late"})).await;
        let t = transport.clone();
        let call = tokio::spawn(async move { t.request("ping", None, LONG).await });
        let req = read_request(&mut server_rx).await;
        respond(&mut server_tx, serde_json::json!({"id": req["id"], "result": "pong"})).await;
        assert_eq!(call.await.unwrap().unwrap(), "pong");
    }

    #[test]
    fn test_debug_names_server() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _enter = rt.enter();
        let (transport, _rx, _tx) = harness();
        let shown = format!("{transport:?}");
        assert!(shown.contains("StdioTransport"));
        assert!(shown.contains("mock"));
    }

    #[tokio::test]
    async fn test_close_input_rejects_further_writes() {
        let (transport, _server_rx, _server_tx) = harness();
        transport.close_input().await;
        let err = transport.notify("notifications/initialized", None).await.unwrap_err();
        assert!(matches!(err, McpError::ConnectionLost { .. }));
    }
}
