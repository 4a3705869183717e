//! Inference Client: OpenAI-compatible API client for model inference.
//!
//! This module handles all communication with the model endpoint:
//! - Non-streaming chat completions with native JSON tool calls
//! - Fallback chain management
//! - Model configuration loading from `models.yaml`
//!
//! The client speaks the OpenAI Chat Completions API, making the model
//! interchangeable via config. Switching from a local Ollama model to a
//! hosted one is a config change, not a code change.

pub mod client;
pub mod config;
pub mod errors;
pub mod response;
pub mod types;

// Re-exports for convenience
pub use client::{ChatModel, InferenceClient};
pub use config::{ModelConfig, ModelsConfig};
pub use errors::InferenceError;
pub use types::{ChatMessage, ModelTurn, Role, ToolCall, ToolDefinition};
