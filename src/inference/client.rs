//! OpenAI-compatible inference client.
//!
//! Sends chat completion requests to the model endpoint and returns one
//! complete model turn per call. Handles the fallback chain when the
//! primary model is unavailable.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;

use super::config::{resolve_active_model, ModelConfig, ModelsConfig, STATIC_RESPONSE};
use super::errors::InferenceError;
use super::response::parse_completion_response;
use super::types::{ChatCompletionRequest, ChatMessage, ModelTurn, ToolDefinition};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ─── ChatModel ───────────────────────────────────────────────────────────────

/// Something that produces model turns.
///
/// The chat orchestrator is generic over this so it can be driven by a
/// scripted model in tests.
#[async_trait]
pub trait ChatModel: Send {
    /// Request one model turn for the conversation so far.
    async fn complete(
        &mut self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ModelTurn, InferenceError>;

    /// Display name of the model currently answering.
    fn model_name(&self) -> &str;

    /// Context window of the model currently answering, when known.
    fn context_window(&self) -> Option<u32> {
        None
    }
}

// ─── InferenceClient ─────────────────────────────────────────────────────────

/// Client for an OpenAI-compatible chat completions endpoint.
///
/// Created from `ModelsConfig` and holds the current model configuration.
pub struct InferenceClient {
    http: HttpClient,
    /// The full models configuration (for fallback chain).
    config: ModelsConfig,
    /// The current model key (e.g., "qwen25-7b").
    current_model_key: String,
    /// The current model configuration.
    current_model: ModelConfig,
    /// Models that have already been tried and failed.
    exhausted_models: Vec<String>,
}

impl InferenceClient {
    /// Create a new inference client from the models configuration.
    ///
    /// Resolves the active model from config. Does NOT check connectivity;
    /// that happens on the first request.
    pub fn from_config(config: ModelsConfig) -> Result<Self, InferenceError> {
        let (key, model) = resolve_active_model(&config)?;

        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: model.base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            config,
            current_model_key: key,
            current_model: model,
            exhausted_models: Vec::new(),
        })
    }

    /// The base URL of the current model's endpoint.
    pub fn current_base_url(&self) -> &str {
        &self.current_model.base_url
    }

    /// The name of the currently selected model.
    pub fn current_model_name(&self) -> &str {
        &self.current_model.display_name
    }

    // ─── Chat Completion ─────────────────────────────────────────────────

    /// Send a chat completion request.
    ///
    /// If the current model is unavailable, walks the fallback chain before
    /// returning an error. When the chain ends in `static_response`, a canned
    /// answer is returned instead of the last error.
    pub async fn chat_completion(
        &mut self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ModelTurn, InferenceError> {
        let mut last_error: Option<InferenceError> = None;

        for _attempt in 0..=self.remaining_fallbacks() {
            match self.try_request(messages, tools).await {
                Ok(turn) => return Ok(turn),
                Err(e) if e.is_retriable() => {
                    tracing::warn!(
                        model = %self.current_model_key,
                        error = %e,
                        "model request failed, trying fallback"
                    );
                    last_error = Some(e);
                    if self.try_next_fallback().is_err() {
                        break; // No more fallbacks
                    }
                }
                Err(e) => return Err(e), // Non-retriable error
            }
        }

        if self.config.fallback_chain.iter().any(|k| k == STATIC_RESPONSE) {
            tracing::warn!(
                attempted = ?self.exhausted_models,
                "all models unavailable, using static response"
            );
            return Ok(static_fallback_response());
        }

        Err(last_error.unwrap_or(InferenceError::AllModelsUnavailable {
            attempted: self.exhausted_models.clone(),
        }))
    }

    /// Attempt a single request to the current model.
    async fn try_request(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ModelTurn, InferenceError> {
        let url = format!(
            "{}/chat/completions",
            self.current_model.base_url.trim_end_matches('/')
        );
        let body = self.build_request(messages, tools);

        // Log the request metadata (not the full body, it can be huge)
        tracing::info!(
            url = %url,
            model = %body.model,
            message_count = body.messages.len(),
            tool_count = tools.len(),
            max_tokens = body.max_tokens,
            "model request"
        );

        let timeout_secs = self.current_model.request_timeout_secs;
        let mut request = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(timeout_secs))
            .json(&body);
        if let Some(key) = self.current_model.api_key.as_deref().filter(|k| !k.is_empty()) {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout {
                    duration_secs: timeout_secs,
                }
            } else {
                InferenceError::ConnectionFailed {
                    endpoint: url.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let body_text = response
            .text()
            .await
            .map_err(|e| InferenceError::ResponseError {
                reason: format!("failed to read response body: {e}"),
            })?;

        let turn = parse_completion_response(&body_text)?;
        tracing::debug!(
            model = %self.current_model_key,
            tool_calls = turn.tool_calls.len(),
            finish_reason = ?turn.finish_reason,
            "model response"
        );
        Ok(turn)
    }

    fn build_request(&self, messages: &[ChatMessage], tools: &[ToolDefinition]) -> ChatCompletionRequest {
        let has_tools = !tools.is_empty();
        ChatCompletionRequest {
            model: self
                .current_model
                .model_name
                .clone()
                .unwrap_or_else(|| self.current_model_key.clone()),
            messages: messages.to_vec(),
            tools: has_tools.then(|| tools.to_vec()),
            tool_choice: has_tools.then(|| "auto".to_string()),
            temperature: self.current_model.temperature,
            max_tokens: self.current_model.max_tokens,
            stream: false,
        }
    }

    // ─── Health Check ────────────────────────────────────────────────────

    /// Check if the current model endpoint is reachable.
    ///
    /// Hits `/models`, which does not consume inference tokens.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/models", self.current_model.base_url.trim_end_matches('/'));
        match self.http.get(&url).timeout(CONNECT_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    // ─── Fallback Chain ──────────────────────────────────────────────────

    /// Move to the next model in the fallback chain.
    ///
    /// Returns `Err` if no more fallbacks are available.
    pub fn try_next_fallback(&mut self) -> Result<(), InferenceError> {
        self.exhausted_models.push(self.current_model_key.clone());

        for key in &self.config.fallback_chain {
            if self.exhausted_models.contains(key) || key == STATIC_RESPONSE {
                continue;
            }
            if let Some(model) = self.config.models.get(key) {
                tracing::info!(from = %self.current_model_key, to = %key, "switching model");
                self.current_model_key = key.clone();
                self.current_model = model.clone();
                return Ok(());
            }
        }

        Err(InferenceError::AllModelsUnavailable {
            attempted: self.exhausted_models.clone(),
        })
    }

    /// Number of remaining fallback models.
    fn remaining_fallbacks(&self) -> usize {
        self.config
            .fallback_chain
            .iter()
            .filter(|k| !self.exhausted_models.contains(k) && k.as_str() != STATIC_RESPONSE)
            .count()
    }
}

#[async_trait]
impl ChatModel for InferenceClient {
    async fn complete(
        &mut self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ModelTurn, InferenceError> {
        self.chat_completion(messages, tools).await
    }

    fn model_name(&self) -> &str {
        self.current_model_name()
    }

    fn context_window(&self) -> Option<u32> {
        Some(self.current_model.context_window)
    }
}

// ─── Static Response Fallback ────────────────────────────────────────────────

/// The turn used when all models are unavailable.
pub fn static_fallback_response() -> ModelTurn {
    ModelTurn::text(
        "The model server is not reachable. Check the base_url entries in \
         models.yaml, or start a local runtime with: ollama serve",
    )
}

// ─── Tests ───────────────────────────────────────────────────────────────────
