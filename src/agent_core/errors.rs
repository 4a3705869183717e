//! Agent Core error types.

use thiserror::Error;

use crate::inference::InferenceError;
use crate::mcp_client::McpError;

/// Errors that end a chat turn.
///
/// Individual tool failures are not errors here: they are written into the
/// conversation as tool results so the model can react to them.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The model endpoint (and every fallback) failed.
    #[error("model request failed: {0}")]
    Inference(#[from] InferenceError),

    /// A tool server died and could not be brought back. Raised after every
    /// result of the current round has been recorded.
    #[error("tool server lost: {source}")]
    ProviderLost { source: McpError },

    /// The configured `max_tool_rounds` ceiling was hit.
    #[error("stopped after {rounds} tool rounds without a final answer")]
    RoundLimitReached { rounds: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_lost_message_names_server() {
        let err = AgentError::ProviderLost {
            source: McpError::ConnectionLost {
                server: "modbus".into(),
                reason: "server process exited".into(),
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("modbus"), "got: {msg}");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_inference_error_converts() {
        let err: AgentError = InferenceError::Timeout { duration_secs: 30 }.into();
        assert!(matches!(err, AgentError::Inference(_)));
    }
}
