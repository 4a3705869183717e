//! MCP Client: JSON-RPC over stdio transport for protocol server management.
//!
//! This module handles:
//! - Spawning and managing MCP server child processes
//! - JSON-RPC 2.0 communication over process stdio
//! - Tool discovery and aggregation across all servers
//! - Tool call routing, validation, and execution
//! - Server lifecycle (start, restart with backoff, graceful shutdown)
//!
//! The MCP Client is used by the ToolRouter and the gateway to dispatch
//! tool calls to the appropriate protocol server.

pub mod client;
pub mod codec;
pub mod discovery;
pub mod errors;
pub mod lifecycle;
pub mod registry;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use client::{McpClient, StartPolicy, ToolListing};
pub use errors::McpError;
pub use registry::ToolRegistry;
pub use types::{
    ConnectionStatus, McpServersConfig, McpToolDefinition, ProviderTool, ServerConfig,
    ToolCallResult,
};
