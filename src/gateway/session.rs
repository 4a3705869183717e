//! One WebSocket session.
//!
//! Each inbound request runs in its own task so a slow tool never blocks the
//! socket. Tool calls are tracked by a fresh uuid until they finish. All
//! replies funnel through one outbound channel that the socket writer drains.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::mcp_client::{McpClient, McpError};

use super::protocol::{ClientMessage, ServerMessage};

/// A tool call that has been sent to a server and not yet answered.
#[derive(Debug, Clone)]
pub struct PendingCall {
    pub server_id: String,
    pub tool_name: String,
    pub started: Instant,
}

type PendingMap = Arc<Mutex<HashMap<Uuid, PendingCall>>>;

pub struct GatewaySession {
    client: Arc<McpClient>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    pending: PendingMap,
    tasks: JoinSet<()>,
}

impl GatewaySession {
    pub fn new(client: Arc<McpClient>, outbound: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            client,
            outbound,
            pending: Arc::new(Mutex::new(HashMap::new())),
            tasks: JoinSet::new(),
        }
    }

    /// Number of tool calls still in flight.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Handle one inbound text frame.
    pub fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => self.handle(msg),
            Err(e) => {
                tracing::warn!(error = %e, "unparseable gateway message");
                let _ = self
                    .outbound
                    .send(ServerMessage::error(format!("invalid message: {e}"), None));
            }
        }
    }

    pub fn handle(&mut self, msg: ClientMessage) {
        let client = self.client.clone();
        let tx = self.outbound.clone();

        match msg {
            ClientMessage::SpawnServer {
                server_id,
                server_name,
                config,
            } => {
                tracing::info!(
                    server = %server_id,
                    name = server_name.as_deref().unwrap_or(&server_id),
                    command = %config.command,
                    "gateway spawn request"
                );
                self.tasks.spawn(async move {
                    let started = match client.add_server(&server_id, config).await {
                        Ok(_) => client.start_server(&server_id).await.map(|_| ()),
                        Err(e) => Err(e),
                    };
                    let _ = tx.send(spawned_message(server_id, started));
                });
            }

            ClientMessage::RestartServer { server_id } => {
                tracing::info!(server = %server_id, "gateway restart request");
                self.tasks.spawn(async move {
                    let restarted = client.restart_server(&server_id).await.map(|_| ());
                    let _ = tx.send(spawned_message(server_id, restarted));
                });
            }

            ClientMessage::ListTools { server_id } => {
                self.tasks.spawn(async move {
                    let filter = [server_id.clone()];
                    let mut listing = client.get_all_tools(Some(&filter)).await;
                    let reply = match listing.failures.pop() {
                        Some((_, e)) => ServerMessage::error(e.to_string(), Some(&server_id)),
                        None => ServerMessage::ToolsListed {
                            server_id,
                            tools: listing.tools.into_iter().map(|t| t.tool).collect(),
                        },
                    };
                    let _ = tx.send(reply);
                });
            }

            ClientMessage::CallTool {
                server_id,
                tool_name,
                arguments,
            } => {
                let call_id = Uuid::new_v4();
                let pending = self.pending.clone();
                self.tasks.spawn(async move {
                    pending.lock().await.insert(
                        call_id,
                        PendingCall {
                            server_id: server_id.clone(),
                            tool_name: tool_name.clone(),
                            started: Instant::now(),
                        },
                    );

                    let outcome = client.call_tool(&server_id, &tool_name, arguments).await;

                    if let Some(call) = pending.lock().await.remove(&call_id) {
                        tracing::debug!(
                            call_id = %call_id,
                            server = %call.server_id,
                            tool = %call.tool_name,
                            elapsed_ms = call.started.elapsed().as_millis() as u64,
                            "gateway call finished"
                        );
                    }
                    let _ = tx.send(tool_result_message(server_id, tool_name, outcome));
                });
            }

            ClientMessage::DisconnectServer { server_id } => {
                self.tasks.spawn(async move {
                    let reply = match client.stop_server(&server_id).await {
                        Ok(()) => ServerMessage::ServerDisconnected { server_id },
                        Err(e) => ServerMessage::error(e.to_string(), Some(&server_id)),
                    };
                    let _ = tx.send(reply);
                });
            }
        }
    }

    /// Collect finished tasks, logging any that panicked.
    pub fn reap(&mut self) {
        while let Some(joined) = self.tasks.try_join_next() {
            if let Err(e) = joined {
                if e.is_panic() {
                    tracing::error!(error = %e, "gateway task panicked");
                }
            }
        }
    }

    /// Abort every in-flight request. Servers stay registered and running.
    pub async fn close(mut self) {
        let in_flight = self.pending.lock().await.len();
        if in_flight > 0 {
            tracing::info!(in_flight, "socket closed, abandoning pending calls");
        }
        self.tasks.shutdown().await;
    }
}

fn spawned_message(server_id: String, started: Result<(), McpError>) -> ServerMessage {
    match started {
        Ok(()) => ServerMessage::ServerSpawned {
            server_id,
            status: "connected".to_string(),
            error: None,
        },
        Err(e) => ServerMessage::ServerSpawned {
            server_id,
            status: "error".to_string(),
            error: Some(e.to_string()),
        },
    }
}

fn tool_result_message(
    server_id: String,
    tool_name: String,
    outcome: Result<crate::mcp_client::ToolCallResult, McpError>,
) -> ServerMessage {
    match outcome {
        Ok(result) => ServerMessage::ToolResult {
            server_id,
            tool_name,
            success: result.success,
            result: result.result,
            error: result.error,
        },
        Err(e) => ServerMessage::ToolResult {
            server_id,
            tool_name,
            success: false,
            result: None,
            error: Some(e.to_string()),
        },
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
