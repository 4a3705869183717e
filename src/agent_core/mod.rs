//! Agent Core: the chat loop between a model and the tool servers.
//!
//! Submodules:
//! - `conversation`: In-memory history and context window trimming
//! - `orchestrator`: Model turn / tool dispatch loop
//! - `tool_router`: Dispatches model tool calls to MCP servers
//! - `tokens`: Token estimation for context window budgets
//! - `types`: Turns, chat state, pending invocations, events
//! - `errors`: Agent-level error types

pub mod conversation;
pub mod errors;
pub mod orchestrator;
pub mod tokens;
pub mod tool_router;
pub mod types;

pub use conversation::Conversation;
pub use errors::AgentError;
pub use orchestrator::ChatOrchestrator;
pub use tool_router::{DispatchOutcome, ToolRouter};
pub use types::{AgentEvent, ChatState, PendingInvocation, Turn};
