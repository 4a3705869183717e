//! WebSocket gateway: exposes the server registry to a browser client.
//!
//! Routes:
//! - `GET /ws`: the JSON message protocol in [`protocol`]
//! - `GET /health`: liveness plus per-server status
//!
//! Every socket shares the one [`McpClient`]. Closing a socket abandons its
//! in-flight calls but leaves servers running; servers are stopped when the
//! gateway shuts down.

pub mod protocol;
pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::mcp_client::McpClient;

use protocol::ServerMessage;
use session::GatewaySession;

/// Default listen address.
pub const DEFAULT_BIND: &str = "127.0.0.1:8765";

/// Shared state for the axum handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub client: Arc<McpClient>,
}

/// Build the gateway router.
pub fn router(client: Arc<McpClient>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .with_state(GatewayState { client })
}

/// Serve until Ctrl-C, then stop every server.
pub async fn serve(client: Arc<McpClient>, bind: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind gateway to {bind}"))?;
    tracing::info!(addr = %bind, "gateway listening");

    let served = axum::serve(listener, router(client.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    tracing::info!("gateway shutting down, stopping servers");
    client.stop_all().await;
    served.context("gateway server error")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

async fn health(State(state): State<GatewayState>) -> impl IntoResponse {
    let servers: serde_json::Map<String, serde_json::Value> = state
        .client
        .statuses()
        .await
        .into_iter()
        .map(|(name, status)| {
            let value = serde_json::to_value(&status).unwrap_or(serde_json::Value::Null);
            (name, value)
        })
        .collect();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "servers": servers,
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<GatewayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.client))
}

async fn handle_socket(socket: WebSocket, client: Arc<McpClient>) {
    let socket_id = uuid::Uuid::new_v4();
    tracing::info!(socket = %socket_id, "gateway client connected");

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(error = %e, "failed to serialize gateway message");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut session = GatewaySession::new(client, tx);
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => session.handle_text(&text),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(socket = %socket_id, error = %e, "websocket read error");
                break;
            }
        }
        session.reap();
    }

    session.close().await;
    let _ = writer.await;
    tracing::info!(socket = %socket_id, "gateway client disconnected");
}
