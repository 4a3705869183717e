//! Model configuration loading and validation.
//!
//! Reads `models.yaml` and resolves environment variables. Config is the
//! single source of truth for model endpoints, fallback chains, and the
//! chat loop's tunables.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::errors::InferenceError;

/// File name searched for by [`find_config_path`].
pub const MODELS_FILE: &str = "models.yaml";

/// Environment variable pointing at the project root.
pub const PROJECT_ROOT_ENV: &str = "FIELDMCP_PROJECT_ROOT";

/// Fallback chain entry that yields a canned answer instead of a model.
pub const STATIC_RESPONSE: &str = "static_response";

// ─── Public Types ────────────────────────────────────────────────────────────

/// A single model's runtime configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub display_name: String,
    /// Model id sent in the request body; defaults to the table key.
    #[serde(default)]
    pub model_name: Option<String>,
    pub base_url: String,
    /// Bearer token, usually `${OPENAI_API_KEY}`. Empty means no auth header.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Context window in tokens; chat history is trimmed to fit it.
    #[serde(default = "default_context_window")]
    pub context_window: u32,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_temperature() -> f32 {
    0.2
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_context_window() -> u32 {
    32_768
}
fn default_request_timeout_secs() -> u64 {
    120
}

/// Top-level model registry (mirrors `models.yaml`).
#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    pub active_model: String,
    pub models: HashMap<String, ModelConfig>,
    #[serde(default)]
    pub fallback_chain: Vec<String>,
    /// Optional ceiling on consecutive tool-dispatch rounds per user message.
    ///
    /// Default: `None` (the loop runs until the model stops calling tools).
    #[serde(default)]
    pub max_tool_rounds: Option<u32>,
    /// Per tool call timeout in milliseconds.
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,
    /// Optional allowlist of server names to start.
    ///
    /// When set, only servers whose names appear in this list are kept. All
    /// others are dropped before the registry is built.
    ///
    /// Default: `None` (all discovered servers).
    #[serde(default)]
    pub enabled_servers: Option<Vec<String>>,
    /// Replaces the built-in system prompt when set.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Cap on the characters of one tool result shown to the model.
    #[serde(default)]
    pub max_tool_result_chars: Option<usize>,
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Resolve the models file relative to the project root.
///
/// Checks `FIELDMCP_PROJECT_ROOT` first, then searches upward from `start`
/// for `models.yaml`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, InferenceError> {
    // 1. Check env var
    if let Ok(root) = std::env::var(PROJECT_ROOT_ENV) {
        let candidate = PathBuf::from(&root).join(MODELS_FILE);
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    // 2. Walk upward from `start`
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(MODELS_FILE);
        if candidate.exists() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(InferenceError::ConfigError {
        reason: format!("could not find {MODELS_FILE}"),
    })
}

/// Load and parse the models configuration file.
///
/// Performs environment-variable interpolation on string values matching
/// `${VAR_NAME}` or `${VAR_NAME:-default}`.
pub fn load_models_config(path: &Path) -> Result<ModelsConfig, InferenceError> {
    let raw = std::fs::read_to_string(path).map_err(|e| InferenceError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    parse_models_config(&raw)
}

/// Parse models configuration from YAML text.
pub fn parse_models_config(raw: &str) -> Result<ModelsConfig, InferenceError> {
    let interpolated = interpolate_env_vars(raw);

    let config: ModelsConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| InferenceError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?;

    if config.max_tool_rounds == Some(0) {
        return Err(InferenceError::ConfigError {
            reason: "max_tool_rounds must be at least 1".into(),
        });
    }

    Ok(config)
}

/// Resolve the active model configuration, respecting the fallback chain.
///
/// Returns `(model_key, ModelConfig)` for the first model present in the
/// config. Actual connectivity is checked at runtime by the client.
pub fn resolve_active_model(config: &ModelsConfig) -> Result<(String, ModelConfig), InferenceError> {
    if let Some(model) = config.models.get(&config.active_model) {
        return Ok((config.active_model.clone(), model.clone()));
    }

    for key in &config.fallback_chain {
        if key == STATIC_RESPONSE {
            continue; // handled by the client as a special case
        }
        if let Some(model) = config.models.get(key) {
            return Ok((key.clone(), model.clone()));
        }
    }

    Err(InferenceError::ConfigError {
        reason: format!(
            "active model '{}' not found in config and no fallback available",
            config.active_model
        ),
    })
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
pub(crate) fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some((var_name, default)) = expr.split_once(":-") {
        std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
///
/// Uses `dirs::home_dir()` for cross-platform support.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
