//! OpenAI-compatible chat completion client with one-shot model fallback.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::llm::error::ReasoningError;
use crate::llm::types::{CompletionBody, ReasoningRequest, ReasoningResponse};

/// Model used when nothing else is configured.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Anything that can answer a reasoning request.
///
/// The voice processor depends on this seam rather than on the HTTP client
/// so turns can be exercised without a backend.
#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    /// Complete a conversation.
    async fn complete(
        &self,
        request: ReasoningRequest,
    ) -> std::result::Result<ReasoningResponse, ReasoningError>;
}

/// HTTP client for an OpenAI-compatible `/v1/chat/completions` endpoint.
pub struct ReasoningClient {
    http: reqwest::Client,
    config: LlmConfig,
    /// Count of fallback activations (for observability).
    fallback_count: AtomicU32,
}

impl ReasoningClient {
    /// Create a client from configuration.
    pub fn new(config: LlmConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            fallback_count: AtomicU32::new(0),
        }
    }

    /// Number of times the fallback model has been tried.
    pub fn fallback_count(&self) -> u32 {
        self.fallback_count.load(Ordering::Relaxed)
    }

    /// Pick the model for a request.
    ///
    /// Explicit request model, then the fallback model when the primary is
    /// switched off, then the configured model, then [`DEFAULT_MODEL`].
    pub fn resolve_model(&self, requested: Option<&str>) -> String {
        if let Some(model) = requested.map(str::trim).filter(|m| !m.is_empty()) {
            return model.to_owned();
        }
        let fallback = self.config.fallback_model.trim();
        if !self.config.primary_model_enabled && !fallback.is_empty() {
            return fallback.to_owned();
        }
        let model = self.config.model.trim();
        if !model.is_empty() {
            return model.to_owned();
        }
        DEFAULT_MODEL.to_owned()
    }

    /// Resolve a token budget: the default when unset, capped by the ceiling.
    pub fn resolve_max_tokens(&self, requested: u32) -> u32 {
        let budget = if requested > 0 {
            requested
        } else {
            self.config.default_max_tokens
        };
        match self.config.max_tokens_ceiling {
            0 => budget,
            ceiling => budget.min(ceiling),
        }
    }

    fn fallback_for(&self, resolved: &str) -> Option<String> {
        let fallback = self.config.fallback_model.trim();
        (!fallback.is_empty() && fallback != resolved).then(|| fallback.to_owned())
    }

    async fn attempt(
        &self,
        model: &str,
        request: &ReasoningRequest,
    ) -> std::result::Result<ReasoningResponse, ReasoningError> {
        let url = format!(
            "{}/v1/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let mut body = json!({
            "model": model,
            "messages": request.messages.iter().map(|m| m.to_wire()).collect::<Vec<_>>(),
            "max_tokens": self.resolve_max_tokens(request.max_tokens),
            "temperature": request.temperature.unwrap_or(self.config.temperature),
        });
        if !request.tools.is_empty() {
            body["tools"] = request.tools.iter().map(|t| t.to_wire()).collect();
        }

        let mut builder = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(self.config.request_timeout_secs.max(1)))
            .json(&body);
        if !self.config.api_key.is_empty() {
            builder = builder.bearer_auth(&self.config.api_key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ReasoningError::from_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ReasoningError::from_status(status.as_u16(), &text));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ReasoningError::from_reqwest(&e))?;
        let parsed: CompletionBody =
            serde_json::from_slice(&bytes).map_err(ReasoningError::decode)?;

        let (content, tool_calls) = match parsed.choices.into_iter().next() {
            Some(choice) => (
                choice.message.content.unwrap_or_default(),
                choice
                    .message
                    .tool_calls
                    .into_iter()
                    .map(Into::into)
                    .collect(),
            ),
            None => (String::new(), Vec::new()),
        };

        Ok(ReasoningResponse {
            id: parsed.id,
            model: if parsed.model.is_empty() {
                model.to_owned()
            } else {
                parsed.model
            },
            content,
            tool_calls,
            used_fallback: false,
        })
    }
}

impl std::fmt::Debug for ReasoningClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReasoningClient")
            .field("base_url", &self.config.base_url)
            .field("model", &self.config.model)
            .field("fallback_model", &self.config.fallback_model)
            .field("fallback_count", &self.fallback_count())
            .finish()
    }
}

#[async_trait]
impl ReasoningBackend for ReasoningClient {
    async fn complete(
        &self,
        request: ReasoningRequest,
    ) -> std::result::Result<ReasoningResponse, ReasoningError> {
        let model = self.resolve_model(request.model.as_deref());
        debug!(%model, messages = request.messages.len(), "sending reasoning request");

        match self.attempt(&model, &request).await {
            Ok(response) => Ok(response),
            Err(e) if e.is_transient() => {
                let Some(fallback) = self.fallback_for(&model) else {
                    return Err(e);
                };
                self.fallback_count.fetch_add(1, Ordering::Relaxed);
                warn!(
                    primary = %model,
                    %fallback,
                    error = %e,
                    "primary model failed with transient error, retrying on fallback"
                );
                tokio::time::sleep(Duration::from_millis(self.config.fallback_backoff_ms)).await;
                let mut response = self.attempt(&fallback, &request).await?;
                response.used_fallback = true;
                Ok(response)
            }
            Err(e) => Err(e),
        }
    }
}
